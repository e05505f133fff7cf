//! In-process transport (for testing and single-node runs)

use crate::error::Result;
use crate::transport::{PayloadStream, SyncTransport};
use dashmap::DashMap;
use std::collections::HashMap;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// Transport that keeps channels and stores in memory
///
/// Several simulated nodes can share one instance behind an `Arc` to exercise
/// the replication protocol without Redis.
pub struct InMemoryTransport {
    channels: DashMap<String, broadcast::Sender<String>>,
    stores: DashMap<String, HashMap<String, String>>,
    capacity: usize,
}

impl InMemoryTransport {
    /// Create a new in-memory transport
    pub fn new(capacity: usize) -> Self {
        Self { channels: DashMap::new(), stores: DashMap::new(), capacity: capacity.max(1) }
    }

    /// Drop `channel`, ending every current subscription to it the way a lost
    /// Redis connection does; later subscribers get a fresh channel
    pub fn close_channel(&self, channel: &str) {
        self.channels.remove(channel);
    }

    /// Number of live subscriptions to `channel`
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels.get(channel).map(|sender| sender.receiver_count()).unwrap_or(0)
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .value()
            .clone()
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait::async_trait]
impl SyncTransport for InMemoryTransport {
    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        // No subscribers is not an error, same as Redis PUBLISH
        let _ = self.sender(channel).send(payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<PayloadStream> {
        let receiver = self.sender(channel).subscribe();
        let channel = channel.to_string();

        let stream = futures::stream::unfold(
            (receiver, channel),
            |(mut receiver, channel)| async move {
                loop {
                    match receiver.recv().await {
                        Ok(payload) => return Some((payload, (receiver, channel))),
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(%channel, skipped, "In-memory subscriber lagged");
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            },
        );

        Ok(Box::pin(stream))
    }

    async fn hash_get(&self, store: &str, key: &str) -> Result<Option<String>> {
        Ok(self.stores.get(store).and_then(|fields| fields.value().get(key).cloned()))
    }

    async fn hash_set(&self, store: &str, key: &str, value: String) -> Result<()> {
        self.stores.entry(store.to_string()).or_default().insert(key.to_string(), value);
        Ok(())
    }

    async fn hash_get_all(&self, store: &str) -> Result<HashMap<String, String>> {
        Ok(self.stores.get(store).map(|fields| fields.value().clone()).unwrap_or_default())
    }

    async fn hash_delete(&self, store: &str, key: &str) -> Result<()> {
        if let Some(mut fields) = self.stores.get_mut(store) {
            fields.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let transport = InMemoryTransport::default();
        let mut first = transport.subscribe("prices").await.unwrap();
        let mut second = transport.subscribe("prices").await.unwrap();

        transport.publish("prices", "hello".to_string()).await.unwrap();

        assert_eq!(first.next().await.as_deref(), Some("hello"));
        assert_eq!(second.next().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let transport = InMemoryTransport::default();
        assert!(transport.publish("nobody", "x".to_string()).await.is_ok());
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let transport = InMemoryTransport::default();
        let mut prices = transport.subscribe("prices").await.unwrap();

        transport.publish("ledgers", "actor".to_string()).await.unwrap();
        transport.publish("prices", "snapshot".to_string()).await.unwrap();

        assert_eq!(prices.next().await.as_deref(), Some("snapshot"));
    }

    #[tokio::test]
    async fn test_closed_channel_ends_streams_and_can_be_resubscribed() {
        let transport = InMemoryTransport::default();
        let mut stale = transport.subscribe("prices").await.unwrap();
        assert_eq!(transport.subscriber_count("prices"), 1);

        transport.close_channel("prices");
        assert_eq!(stale.next().await, None);
        assert_eq!(transport.subscriber_count("prices"), 0);

        let mut fresh = transport.subscribe("prices").await.unwrap();
        transport.publish("prices", "again".to_string()).await.unwrap();
        assert_eq!(fresh.next().await.as_deref(), Some("again"));
    }

    #[tokio::test]
    async fn test_hash_store_roundtrip() {
        let transport = InMemoryTransport::default();

        assert_eq!(transport.hash_get("ledgers", "alice").await.unwrap(), None);

        transport.hash_set("ledgers", "alice", "1".to_string()).await.unwrap();
        transport.hash_set("ledgers", "alice", "2".to_string()).await.unwrap();
        transport.hash_set("ledgers", "bob", "3".to_string()).await.unwrap();

        assert_eq!(transport.hash_get("ledgers", "alice").await.unwrap().as_deref(), Some("2"));

        let all = transport.hash_get_all("ledgers").await.unwrap();
        assert_eq!(all.len(), 2);

        transport.hash_delete("ledgers", "alice").await.unwrap();
        transport.hash_delete("ledgers", "missing").await.unwrap();
        transport.hash_delete("no-such-store", "x").await.unwrap();
        assert_eq!(transport.hash_get_all("ledgers").await.unwrap().len(), 1);
    }
}
