//! Two-level cache facade for one namespace
//!
//! Reads go through three sources in order:
//! - L1: the replica's local segment, served while the entry's stamp is fresh
//! - L2: the shared store, for values loaded under the same namespace version
//! - the caller's loader (system of record)
//!
//! Writes never update a value in place: callers evict, the namespace version
//! is bumped, and the next read reloads.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, error, warn};

use crate::error::CacheError;
use crate::local_cache::LocalCache;
use crate::namespace::{KeySchema, Namespace};
use crate::registry::{EvictionScope, Segment};
use crate::store::DistributedStore;

/// Trait for types that can be cached
pub trait Cacheable: Serialize + DeserializeOwned + Send + Sync + 'static {}
impl<T> Cacheable for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

type LoadResult<V> = Result<Option<Arc<V>>, String>;

/// Represents an in-flight load that other requests can wait on
type InFlightLoad<V> = tokio::sync::watch::Receiver<Option<LoadResult<V>>>;
type InFlightSender<V> = tokio::sync::watch::Sender<Option<LoadResult<V>>>;
type InFlightMap<V> = Arc<Mutex<HashMap<String, InFlight<V>>>>;

/// A running load and the namespace version it started under
struct InFlight<V> {
    stamp: u64,
    rx: InFlightLoad<V>,
}

/// Guard that ensures in-flight entries are cleaned up even on panic/cancel.
///
/// When dropped, removes the key from the in-flight map and notifies waiters
/// with an error if no result was sent.
struct InFlightGuard<V> {
    key: String,
    stamp: u64,
    in_flight: InFlightMap<V>,
    tx: Option<InFlightSender<V>>,
}

impl<V> InFlightGuard<V> {
    /// Complete the load with a result, consuming the guard.
    fn complete(mut self, result: LoadResult<V>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(result));
        }
    }
}

impl<V> Drop for InFlightGuard<V> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(Err("Load was cancelled or panicked".to_owned())));
        }
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        // A newer load for the same key may have taken the slot
        if in_flight
            .get(&self.key)
            .is_some_and(|load| load.stamp == self.stamp)
        {
            in_flight.remove(&self.key);
        }
    }
}

enum Slot<V> {
    Leader(InFlightGuard<V>),
    Follower(InFlightLoad<V>),
}

struct TwoLevelCacheInner<V> {
    segment: Arc<Segment>,
    local: LocalCache<V>,
    store: Arc<dyn DistributedStore>,
    keys: KeySchema,
    l2_ttl: Option<Duration>,
    reconcile_on_read: bool,
    locales: Arc<[String]>,
    in_flight: InFlightMap<V>,
}

/// Version-stamped two-level cache for one namespace
pub struct TwoLevelCache<V> {
    inner: Arc<TwoLevelCacheInner<V>>,
}

impl<V> Clone for TwoLevelCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

pub(crate) struct TwoLevelCacheParts<V> {
    pub segment: Arc<Segment>,
    pub local: LocalCache<V>,
    pub store: Arc<dyn DistributedStore>,
    pub keys: KeySchema,
    pub l2_ttl: Option<Duration>,
    pub reconcile_on_read: bool,
    pub locales: Arc<[String]>,
}

impl<V: Cacheable> TwoLevelCache<V> {
    pub(crate) fn from_parts(parts: TwoLevelCacheParts<V>) -> Self {
        Self {
            inner: Arc::new(TwoLevelCacheInner {
                segment: parts.segment,
                local: parts.local,
                store: parts.store,
                keys: parts.keys,
                l2_ttl: parts.l2_ttl,
                reconcile_on_read: parts.reconcile_on_read,
                locales: parts.locales,
                in_flight: Arc::new(Mutex::new(HashMap::new())),
            }),
        }
    }

    pub fn namespace(&self) -> &Namespace {
        self.inner.segment.namespace()
    }

    /// Highest namespace version this replica has observed
    pub fn observed_version(&self) -> u64 {
        self.inner.segment.observed_version()
    }

    /// Local-only lookup; never touches the store or a loader
    pub async fn peek(&self, key: &str) -> Option<Arc<V>> {
        self.lookup_local(key).await
    }

    /// Get a value, loading it on a miss.
    ///
    /// `loader` runs only when neither the local segment nor the shared tier
    /// holds a value for the current version. Concurrent misses on the same
    /// key share one loader call. `Ok(None)` from the loader is passed through
    /// and not cached.
    pub async fn get_or_load<F, Fut, E>(
        &self,
        key: &str,
        loader: F,
    ) -> Result<Option<Arc<V>>, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>, E>>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        self.revalidate_if_due().await;

        if let Some(value) = self.lookup_local(key).await {
            debug!("Cache hit L1 for {}:{}", self.namespace(), key);
            return Ok(Some(value));
        }
        debug!("Cache miss L1 for {}:{}", self.namespace(), key);

        let stamp = self.inner.segment.observed_version();
        let guard = match self.claim(key, stamp) {
            Slot::Leader(guard) => guard,
            Slot::Follower(rx) => {
                debug!("Waiting for in-flight load of {}:{}", self.namespace(), key);
                return Self::wait_for(rx).await;
            }
        };

        if let Some(value) = self.read_shared(key, stamp).await {
            debug!("Cache hit L2 for {}:{}", self.namespace(), key);
            let value = Arc::new(value);
            self.store_local(key, Arc::clone(&value), stamp).await;
            guard.complete(Ok(Some(Arc::clone(&value))));
            return Ok(Some(value));
        }

        // The guard ensures cleanup happens even on panic/cancellation
        let result = match loader().await {
            Ok(Some(value)) => {
                debug!("Loaded {}:{} from origin", self.namespace(), key);
                self.write_shared(key, &value, stamp).await?;
                let value = Arc::new(value);
                self.store_local(key, Arc::clone(&value), stamp).await;
                Ok(Some(value))
            }
            Ok(None) => {
                debug!("Value not found for {}:{}", self.namespace(), key);
                Ok(None)
            }
            Err(e) => {
                let e: Box<dyn std::error::Error + Send + Sync> = e.into();
                error!("Loader error for {}:{}: {}", self.namespace(), key, e);
                Err(CacheError::Loader(e))
            }
        };

        guard.complete(match &result {
            Ok(v) => Ok(v.clone()),
            Err(e) => Err(e.to_string()),
        });

        result
    }

    /// Evict one key here and invalidate it on every replica
    pub async fn evict(&self, key: &str) -> Result<u64, CacheError> {
        debug!("Invalidating cache for {}:{}", self.namespace(), key);
        self.inner.segment.evict(EvictionScope::key(key)).await
    }

    /// Evict an entity and all of its locale variants on every replica
    pub async fn evict_entity(&self, entity_id: &str) -> Result<u64, CacheError> {
        self.inner
            .segment
            .evict(EvictionScope::Entity {
                id: entity_id.to_owned(),
                variants: self.inner.locales.to_vec(),
            })
            .await
    }

    /// Drop the whole namespace here and on every replica
    pub async fn evict_namespace(&self) -> Result<u64, CacheError> {
        debug!("Invalidating namespace {}", self.namespace());
        self.inner.segment.evict(EvictionScope::Namespace).await
    }

    /// Re-read the authoritative version now, regardless of the interval
    pub async fn reconcile(&self) -> Result<(), CacheError> {
        self.inner.segment.reconcile().await.map(|_| ())
    }

    async fn revalidate_if_due(&self) {
        if !self.inner.reconcile_on_read || !self.inner.segment.reconcile_due() {
            return;
        }
        if let Err(e) = self.inner.segment.reconcile().await {
            warn!(
                "Version check for namespace {} failed ({}). Serving local entries.",
                self.namespace(),
                e
            );
        }
    }

    async fn lookup_local(&self, key: &str) -> Option<Arc<V>> {
        let entry = self.inner.local.get(key).await?;
        if self.inner.segment.is_fresh(entry.stamp) {
            Some(entry.value)
        } else {
            self.inner.local.remove(key).await;
            None
        }
    }

    async fn store_local(&self, key: &str, value: Arc<V>, stamp: u64) {
        // An invalidation landed while loading; the value may predate it
        if self.inner.segment.observed_version() != stamp {
            return;
        }
        self.inner.local.put(key.to_owned(), value, stamp).await;
        if self.inner.segment.observed_version() != stamp {
            self.inner.local.remove(key).await;
        }
    }

    /// Join a load started under the same version, or become the leader.
    ///
    /// A load started before an invalidation is never joined; the new leader
    /// replaces it in the map.
    fn claim(&self, key: &str, stamp: u64) -> Slot<V> {
        let mut in_flight = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(load) = in_flight.get(key)
            && load.stamp == stamp
        {
            return Slot::Follower(load.rx.clone());
        }
        let (tx, rx) = tokio::sync::watch::channel(None);
        in_flight.insert(key.to_owned(), InFlight { stamp, rx });
        Slot::Leader(InFlightGuard {
            key: key.to_owned(),
            stamp,
            in_flight: Arc::clone(&self.inner.in_flight),
            tx: Some(tx),
        })
    }

    async fn wait_for(mut rx: InFlightLoad<V>) -> Result<Option<Arc<V>>, CacheError> {
        loop {
            let current = rx.borrow().clone();
            if let Some(result) = current {
                return result.map_err(|e| CacheError::Loader(e.into()));
            }
            if rx.changed().await.is_err() {
                // Sender dropped without sending - treat as error
                return Err(CacheError::Loader("In-flight load was cancelled".into()));
            }
        }
    }

    async fn read_shared(&self, key: &str, stamp: u64) -> Option<V> {
        if self.inner.l2_ttl.is_none() {
            return None;
        }
        let shared_key = self.inner.keys.value_key(self.namespace(), stamp, key);
        let json = match self.inner.store.get(&shared_key).await {
            Ok(Some(json)) => json,
            Ok(None) => {
                debug!("Cache miss L2 for {}:{}", self.namespace(), key);
                return None;
            }
            Err(e) => {
                warn!(
                    "L2 GET error for {}:{} ({}). Falling back to loader.",
                    self.namespace(),
                    key,
                    e
                );
                return None;
            }
        };

        match serde_json::from_str::<V>(&json) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(
                    "Failed to deserialize L2 value {}: {}. Deleting corrupt entry.",
                    shared_key, e
                );
                if let Err(del_err) = self.inner.store.delete(&shared_key).await {
                    warn!("Failed to delete corrupt L2 entry {}: {}", shared_key, del_err);
                }
                None
            }
        }
    }

    async fn write_shared(&self, key: &str, value: &V, stamp: u64) -> Result<(), CacheError> {
        let Some(ttl) = self.inner.l2_ttl else {
            return Ok(());
        };
        let json = serde_json::to_string(value)?;
        let shared_key = self.inner.keys.value_key(self.namespace(), stamp, key);
        // Best effort
        if let Err(e) = self.inner.store.set(&shared_key, json, Some(ttl)).await {
            warn!(
                "L2 SET error for {} ({}). Continuing.",
                shared_key, e
            );
        }
        Ok(())
    }
}
