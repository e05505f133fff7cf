//! Origin-tagged publishing and echo-suppressed subscriptions

use crate::channels;
use crate::envelope::{Envelope, NodeId};
use crate::error::{Result, SyncError};
use crate::transport::SyncTransport;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Replication front-end bound to one node identity
///
/// Everything published through the bus is wrapped in an [`Envelope`] carrying
/// this node's id, and every subscription drops envelopes whose origin is this
/// node. A node therefore never re-applies its own dividend push or reloads a
/// ledger it just persisted.
#[derive(Clone)]
pub struct SyncBus {
    node_id: NodeId,
    transport: Arc<dyn SyncTransport>,
}

impl SyncBus {
    pub fn new(node_id: NodeId, transport: Arc<dyn SyncTransport>) -> Self {
        Self { node_id, transport }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn transport(&self) -> &Arc<dyn SyncTransport> {
        &self.transport
    }

    /// Publish `payload` on `channel`, tagged with this node's id
    pub async fn publish<T: Serialize + Sync>(&self, channel: &str, payload: &T) -> Result<()> {
        let envelope = Envelope::new(self.node_id.clone(), payload);
        let json = serde_json::to_string(&envelope)?;
        self.transport.publish(channel, json).await
    }

    /// Pull-notify: announce that `actor_id`'s ledger was written to the store
    pub async fn notify_ledger_changed(&self, actor_id: &str) -> Result<()> {
        self.publish(channels::LEDGER_CHANGED, &actor_id).await
    }

    /// Subscribe to `channel`, yielding only well-formed payloads from other nodes
    ///
    /// Malformed envelopes are logged and dropped; the stream keeps running.
    pub async fn subscribe<T>(&self, channel: &str) -> Result<BoxStream<'static, T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let raw = self.transport.subscribe(channel).await?;
        let node_id = self.node_id.clone();
        let channel = channel.to_string();

        let stream = raw.filter_map(move |payload| {
            let decoded = match decode_envelope::<T>(&channel, &payload) {
                Ok(envelope) if envelope.is_from(&node_id) => {
                    debug!(%channel, "Suppressed echo of own message");
                    None
                }
                Ok(envelope) => Some(envelope.payload),
                Err(e) => {
                    warn!("Dropping replication message: {}", e);
                    None
                }
            };
            futures::future::ready(decoded)
        });

        Ok(stream.boxed())
    }

    /// Serialize `value` into `store[key]`
    pub async fn put<T: Serialize + Sync>(&self, store: &str, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)?;
        self.transport.hash_set(store, key, json).await
    }

    /// Raw read of `store[key]`
    pub async fn get_raw(&self, store: &str, key: &str) -> Result<Option<String>> {
        self.transport.hash_get(store, key).await
    }

    /// Raw read of a whole store; callers decode per record so one bad record
    /// cannot abort a load
    pub async fn get_all_raw(&self, store: &str) -> Result<HashMap<String, String>> {
        self.transport.hash_get_all(store).await
    }

    pub async fn delete(&self, store: &str, key: &str) -> Result<()> {
        self.transport.hash_delete(store, key).await
    }
}

/// Decode an envelope received on `channel`
pub fn decode_envelope<T: DeserializeOwned>(channel: &str, payload: &str) -> Result<Envelope<T>> {
    serde_json::from_str(payload).map_err(|e| SyncError::malformed(channel, e.to_string()))
}
