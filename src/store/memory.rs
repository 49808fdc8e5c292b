use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, warn};

use super::{DistributedStore, MessageStream, StoreMessage};
use crate::error::StoreError;

const BUS_CAPACITY: usize = 1024;

struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

struct MemoryInner {
    values: Mutex<HashMap<String, StoredValue>>,
    bus: broadcast::Sender<StoreMessage>,
    available: AtomicBool,
    drop_publications: AtomicBool,
}

/// In-process store.
///
/// Clones share the same state, so several cache managers built on clones of
/// one `MemoryStore` behave like replicas sharing one Redis. Outages and
/// message loss can be simulated with [`set_available`](Self::set_available)
/// and [`drop_publications`](Self::drop_publications).
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            inner: Arc::new(MemoryInner {
                values: Mutex::new(HashMap::new()),
                bus,
                available: AtomicBool::new(true),
                drop_publications: AtomicBool::new(false),
            }),
        }
    }

    /// Simulate the store going down (`false`) or coming back (`true`)
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// While enabled, publishes succeed but no subscriber receives them
    pub fn drop_publications(&self, drop: bool) {
        self.inner.drop_publications.store(drop, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.inner.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store is offline".to_owned()))
        }
    }

    fn values(&self) -> MutexGuard<'_, HashMap<String, StoredValue>> {
        self.inner
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl DistributedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_available()?;
        let mut values = self.values();
        if values.get(key).is_some_and(StoredValue::is_expired) {
            values.remove(key);
            return Ok(None);
        }
        Ok(values.get(key).map(|v| v.value.clone()))
    }

    async fn set(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.values()
            .insert(key.to_owned(), StoredValue { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check_available()?;
        self.values().remove(key);
        Ok(())
    }

    async fn increment(&self, key: &str) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut values = self.values();
        let current = match values.get(key) {
            Some(stored) if !stored.is_expired() => {
                stored
                    .value
                    .parse::<u64>()
                    .map_err(|_| StoreError::NotACounter {
                        key: key.to_owned(),
                        value: stored.value.clone(),
                    })?
            }
            _ => 0,
        };
        let next = current + 1;
        values.insert(
            key.to_owned(),
            StoredValue {
                value: next.to_string(),
                expires_at: None,
            },
        );
        Ok(next)
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<(), StoreError> {
        self.check_available()?;
        if self.inner.drop_publications.load(Ordering::SeqCst) {
            debug!("MemoryStore: dropping publication on channel {}", channel);
            return Ok(());
        }
        // No receivers is not an error for pub/sub
        let _ = self.inner.bus.send(StoreMessage {
            channel: channel.to_owned(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<MessageStream, StoreError> {
        self.check_available()?;
        let channels: HashSet<String> = channels.iter().cloned().collect();
        let stream = BroadcastStream::new(self.inner.bus.subscribe()).filter_map(move |msg| {
            let msg = match msg {
                Ok(msg) if channels.contains(&msg.channel) => Some(msg),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!("MemoryStore: subscriber lagged, {} messages lost", skipped);
                    None
                }
            };
            futures::future::ready(msg)
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_increment_is_atomic_across_tasks() {
        let store = MemoryStore::new();
        let handles: Vec<_> = (0..50)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.increment("counter").await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(store.get("counter").await.unwrap().as_deref(), Some("50"));
    }

    #[tokio::test]
    async fn test_increment_rejects_non_counter() {
        let store = MemoryStore::new();
        store.set("k", "abc".to_owned(), None).await.unwrap();
        assert!(matches!(
            store.increment("k").await,
            Err(StoreError::NotACounter { .. })
        ));
    }

    #[tokio::test]
    async fn test_values_expire() {
        let store = MemoryStore::new();
        store
            .set("k", "v".to_owned(), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_subscribe_filters_channels() {
        let store = MemoryStore::new();
        let mut stream = store.subscribe(&["a".to_owned()]).await.unwrap();
        store.publish("b", "ignored".to_owned()).await.unwrap();
        store.publish("a", "hello".to_owned()).await.unwrap();
        let msg = stream.next().await.unwrap();
        assert_eq!(msg.channel, "a");
        assert_eq!(msg.payload, "hello");
    }

    #[tokio::test]
    async fn test_dropped_publications_are_not_delivered() {
        let store = MemoryStore::new();
        let mut stream = store.subscribe(&["a".to_owned()]).await.unwrap();
        store.drop_publications(true);
        store.publish("a", "lost".to_owned()).await.unwrap();
        store.drop_publications(false);
        store.publish("a", "kept".to_owned()).await.unwrap();
        assert_eq!(stream.next().await.unwrap().payload, "kept");
    }

    #[tokio::test]
    async fn test_offline_store_fails_every_operation() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(
            store.get("k").await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.increment("k").await.is_err());
        assert!(store.publish("a", "x".to_owned()).await.is_err());
        store.set_available(true);
        assert_eq!(store.increment("k").await.unwrap(), 1);
    }
}
