//! Redis-backed transport

use crate::error::Result;
use crate::transport::{PayloadStream, SyncTransport};
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Production transport: Redis PUBLISH/SUBSCRIBE plus hashes
///
/// Commands share one multiplexed connection manager; every subscription opens
/// its own dedicated connection since a subscribed Redis connection cannot
/// issue regular commands.
pub struct RedisTransport {
    client: Client,
    connection_manager: ConnectionManager,
}

impl RedisTransport {
    /// Connect to Redis
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;
        let connection_manager = ConnectionManager::new(client.clone()).await?;

        tracing::info!("Connected sync transport to {}", redis_url);
        Ok(Self { client, connection_manager })
    }
}

#[async_trait::async_trait]
impl SyncTransport for RedisTransport {
    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        let mut conn = self.connection_manager.clone();
        let receivers: i64 = conn.publish(channel, payload).await?;
        debug!("Published to {} ({} receivers)", channel, receivers);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<PayloadStream> {
        let connection = self.client.get_async_connection().await?;
        let mut pubsub = connection.into_pubsub();
        pubsub.subscribe(channel).await?;

        let channel = channel.to_string();
        let stream = pubsub.into_on_message().filter_map(move |msg| {
            let channel = channel.clone();
            async move {
                match msg.get_payload::<String>() {
                    Ok(payload) => Some(payload),
                    Err(e) => {
                        warn!("Dropping non-text payload on {}: {}", channel, e);
                        None
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }

    async fn hash_get(&self, store: &str, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection_manager.clone();
        let value: Option<String> = conn.hget(store, key).await?;
        Ok(value)
    }

    async fn hash_set(&self, store: &str, key: &str, value: String) -> Result<()> {
        let mut conn = self.connection_manager.clone();
        conn.hset::<_, _, _, ()>(store, key, value).await?;
        Ok(())
    }

    async fn hash_get_all(&self, store: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.connection_manager.clone();
        let fields: HashMap<String, String> = conn.hgetall(store).await?;
        Ok(fields)
    }

    async fn hash_delete(&self, store: &str, key: &str) -> Result<()> {
        let mut conn = self.connection_manager.clone();
        conn.hdel::<_, _, ()>(store, key).await?;
        Ok(())
    }
}
