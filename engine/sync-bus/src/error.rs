//! Error types for the sync bus

use thiserror::Error;

/// Result type alias for sync bus operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that can occur while replicating state between nodes
#[derive(Error, Debug)]
pub enum SyncError {
    /// Transport-level failure talking to Redis
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A payload arrived that could not be interpreted
    #[error("Malformed sync payload on {channel}: {message}")]
    Malformed { channel: String, message: String },
}

impl SyncError {
    /// Create a new malformed-payload error
    pub fn malformed(channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Malformed { channel: channel.into(), message: message.into() }
    }
}
