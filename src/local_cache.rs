//! Process-local cache segment for one namespace
//!
//! Entries are stored in a Moka cache (bounded, TTL-aware, TinyLFU admission)
//! together with the namespace version they were loaded under.

use std::sync::Arc;

use async_trait::async_trait;
use moka::future::Cache;
use tracing::{debug, warn};

use crate::config::NamespaceConfig;
use crate::namespace::{Namespace, key_matches_hint};

/// A cached value and the namespace version it was created under
#[derive(Debug)]
pub struct StampedEntry<V> {
    pub value: Arc<V>,
    pub stamp: u64,
}

impl<V> Clone for StampedEntry<V> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            stamp: self.stamp,
        }
    }
}

/// How a hinted eviction was carried out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalEviction {
    /// Only entries covered by the hint were dropped
    Targeted,
    /// The whole namespace segment was dropped
    Cleared,
}

/// Type-erased view of a local segment, used by the invalidation listener
/// and the eviction service which don't know the value type.
#[async_trait]
pub trait LocalSegment: Send + Sync + 'static {
    fn namespace(&self) -> &Namespace;

    /// Whether entries can be dropped by key prefix
    fn supports_pattern_eviction(&self) -> bool;

    /// Drop a single key
    async fn evict(&self, key: &str);

    /// Drop every entry covered by `hint`, or everything if prefix eviction
    /// is unsupported
    fn evict_related(&self, hint: &str) -> LocalEviction;

    /// Drop every entry of the namespace
    fn clear(&self);

    /// Approximate number of entries
    fn entry_count(&self) -> u64;
}

/// Local cache for one namespace
pub struct LocalCache<V> {
    namespace: Namespace,
    entries: Cache<String, StampedEntry<V>>,
    pattern_eviction: bool,
}

impl<V> Clone for LocalCache<V> {
    fn clone(&self) -> Self {
        Self {
            namespace: self.namespace.clone(),
            entries: self.entries.clone(),
            pattern_eviction: self.pattern_eviction,
        }
    }
}

impl<V: Send + Sync + 'static> LocalCache<V> {
    pub fn new(config: &NamespaceConfig) -> Self {
        let mut builder = Cache::builder()
            .max_capacity(config.l1_max_capacity)
            .time_to_live(config.l1_ttl);
        if config.pattern_eviction {
            builder = builder.support_invalidation_closures();
        }
        Self {
            namespace: config.name.clone(),
            entries: builder.build(),
            pattern_eviction: config.pattern_eviction,
        }
    }

    pub async fn get(&self, key: &str) -> Option<StampedEntry<V>> {
        self.entries.get(key).await
    }

    pub async fn put(&self, key: String, value: Arc<V>, stamp: u64) {
        self.entries.insert(key, StampedEntry { value, stamp }).await;
    }

    pub async fn remove(&self, key: &str) {
        self.entries.invalidate(key).await;
    }

    pub fn clear_all(&self) {
        self.entries.invalidate_all();
    }

    /// Flush pending maintenance so `entry_count` is exact
    pub async fn sync(&self) {
        self.entries.run_pending_tasks().await;
    }
}

#[async_trait]
impl<V: Send + Sync + 'static> LocalSegment for LocalCache<V> {
    fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    fn supports_pattern_eviction(&self) -> bool {
        self.pattern_eviction
    }

    async fn evict(&self, key: &str) {
        self.remove(key).await;
    }

    fn evict_related(&self, hint: &str) -> LocalEviction {
        if self.pattern_eviction {
            let hint = hint.to_owned();
            match self
                .entries
                .invalidate_entries_if(move |key, _| key_matches_hint(key, &hint))
            {
                Ok(_) => return LocalEviction::Targeted,
                Err(e) => warn!(
                    "Pattern eviction failed for namespace {}: {}. Clearing namespace.",
                    self.namespace, e
                ),
            }
        } else {
            debug!(
                "Namespace {} does not support pattern eviction; clearing for hint {}",
                self.namespace, hint
            );
        }
        self.clear_all();
        LocalEviction::Cleared
    }

    fn clear(&self) {
        self.clear_all();
    }

    fn entry_count(&self) -> u64 {
        self.entries.entry_count()
    }
}
