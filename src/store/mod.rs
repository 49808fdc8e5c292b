//! Shared key-value store reachable by every replica
//!
//! The store provides plain values, atomic counters and pub/sub. Two
//! implementations ship with the crate:
//! - [`RedisStore`]: Redis via a connection manager plus dedicated pub/sub connections
//! - [`MemoryStore`]: in-process, for single-instance deployments and tests

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::StoreError;

mod memory;
mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// A message received from a subscribed channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMessage {
    pub channel: String,
    pub payload: String,
}

/// Stream of messages for a subscription; it ends when the connection is lost
pub type MessageStream = BoxStream<'static, StoreMessage>;

/// Operations the cache needs from the shared store
#[async_trait]
pub trait DistributedStore: Send + Sync + 'static {
    /// Read a value
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a value, optionally expiring after `ttl`
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>)
    -> Result<(), StoreError>;

    /// Remove a value
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Atomically increment a counter and return its new value
    async fn increment(&self, key: &str) -> Result<u64, StoreError>;

    /// Publish a message on a channel
    async fn publish(&self, channel: &str, payload: String) -> Result<(), StoreError>;

    /// Subscribe to a set of channels
    async fn subscribe(&self, channels: &[String]) -> Result<MessageStream, StoreError>;
}
