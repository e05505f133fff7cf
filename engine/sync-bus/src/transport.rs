//! Transport trait shared by every replication backend

use crate::error::Result;
use futures::stream::BoxStream;
use std::collections::HashMap;

/// Stream of raw payloads received on a subscribed channel
pub type PayloadStream = BoxStream<'static, String>;

/// Abstract pub/sub + hash-store substrate
///
/// Stores are plain key -> blob maps; the transport never interprets values.
/// Delivery is at-most-once and unordered across channels.
#[async_trait::async_trait]
pub trait SyncTransport: Send + Sync {
    /// Publish a payload to every current subscriber of `channel`
    async fn publish(&self, channel: &str, payload: String) -> Result<()>;

    /// Subscribe to `channel`; the stream ends when the transport goes away
    async fn subscribe(&self, channel: &str) -> Result<PayloadStream>;

    /// Read one field of a hash store
    async fn hash_get(&self, store: &str, key: &str) -> Result<Option<String>>;

    /// Write one field of a hash store (last writer wins)
    async fn hash_set(&self, store: &str, key: &str, value: String) -> Result<()>;

    /// Read every field of a hash store
    async fn hash_get_all(&self, store: &str) -> Result<HashMap<String, String>>;

    /// Remove one field of a hash store; removing an absent field is a no-op
    async fn hash_delete(&self, store: &str, key: &str) -> Result<()>;
}
