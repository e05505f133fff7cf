//! Configuration for the sync bus

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Transport selection and connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Redis connection URL
    pub redis_url: String,

    /// Use the in-process transport instead of Redis (single-node runs)
    pub in_memory: bool,

    /// Buffer size of each in-process broadcast channel
    pub channel_capacity: usize,

    /// First delay before resubscribing to a dropped channel, in milliseconds
    pub resubscribe_delay_ms: u64,

    /// Upper bound of the doubling resubscribe delay, in milliseconds
    pub max_resubscribe_delay_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            in_memory: false,
            channel_capacity: 1024,
            resubscribe_delay_ms: 500,
            max_resubscribe_delay_ms: 30_000,
        }
    }
}

impl SyncConfig {
    pub fn resubscribe_delay(&self) -> Duration {
        Duration::from_millis(self.resubscribe_delay_ms)
    }

    pub fn max_resubscribe_delay(&self) -> Duration {
        Duration::from_millis(self.max_resubscribe_delay_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if !self.in_memory && self.redis_url.is_empty() {
            return Err("redis_url must be set unless in_memory is enabled".to_string());
        }
        if self.channel_capacity == 0 {
            return Err("channel_capacity must be greater than 0".to_string());
        }
        if self.resubscribe_delay_ms == 0 {
            return Err("resubscribe_delay_ms must be greater than 0".to_string());
        }
        if self.max_resubscribe_delay_ms < self.resubscribe_delay_ms {
            return Err("max_resubscribe_delay_ms must not be below resubscribe_delay_ms".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(SyncConfig::default().validate().is_ok());
    }

    #[test]
    fn test_empty_redis_url_rejected() {
        let config = SyncConfig { redis_url: String::new(), ..Default::default() };
        assert!(config.validate().is_err());

        let config = SyncConfig { redis_url: String::new(), in_memory: true, ..Default::default() };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_resubscribe_delays_must_be_ordered() {
        let config = SyncConfig { resubscribe_delay_ms: 0, ..Default::default() };
        assert!(config.validate().is_err());

        let config = SyncConfig {
            resubscribe_delay_ms: 1_000,
            max_resubscribe_delay_ms: 500,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert_eq!(SyncConfig::default().max_resubscribe_delay(), Duration::from_secs(30));
    }
}
