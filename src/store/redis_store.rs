use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use tracing::{debug, warn};

use super::{DistributedStore, MessageStream, StoreMessage};
use crate::error::StoreError;

/// Redis-backed store.
///
/// Commands go through a shared [`redis::aio::ConnectionManager`], which
/// reconnects on its own. Each subscription opens its own pub/sub connection.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: redis::aio::ConnectionManager,
}

impl RedisStore {
    /// Connect using an existing client
    pub async fn new(client: redis::Client) -> Result<Self, StoreError> {
        let conn = redis::aio::ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, conn })
    }

    /// Connect to the given Redis URL
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Self::new(redis::Client::open(url)?).await
    }
}

#[async_trait]
impl DistributedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.get::<_, Option<String>>(key).await?)
    }

    async fn set(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => {
                conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
                    .await?
            }
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn increment(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let value: i64 = conn.incr(key, 1).await?;
        u64::try_from(value).map_err(|_| StoreError::NotACounter {
            key: key.to_owned(),
            value: value.to_string(),
        })
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<MessageStream, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for channel in channels {
            pubsub.subscribe(channel).await?;
            debug!("RedisStore: subscribed to channel {}", channel);
        }

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(StoreMessage {
                    channel: msg.get_channel_name().to_owned(),
                    payload,
                }),
                Err(e) => {
                    warn!("RedisStore: failed to decode pub/sub payload: {}", e);
                    None
                }
            }
        });

        Ok(stream.boxed())
    }
}
