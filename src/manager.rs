//! Composition root
//!
//! A `CacheManager` owns the store connection, the version registry and the
//! invalidation listener of one replica. Namespaces are registered before
//! `start`; each registration hands back a typed [`TwoLevelCache`] that
//! callers keep and share by cloning.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{info, warn};

use crate::bus::{InvalidationListener, ListenerHandle, ListenerSettings};
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::eviction::CacheEvictionService;
use crate::local_cache::LocalCache;
use crate::namespace::{KeySchema, Namespace};
use crate::registry::{NamespaceTable, Segment};
use crate::store::{DistributedStore, RedisStore};
use crate::two_level_cache::{Cacheable, TwoLevelCache, TwoLevelCacheParts};
use crate::version::VersionRegistry;

pub struct CacheManager {
    config: CacheConfig,
    store: Arc<dyn DistributedStore>,
    versions: Arc<VersionRegistry>,
    table: Arc<NamespaceTable>,
    locales: Arc<[String]>,
    listener: Mutex<Option<ListenerHandle>>,
}

impl CacheManager {
    /// Create a manager on top of any distributed store
    pub fn new(config: CacheConfig, store: Arc<dyn DistributedStore>) -> Self {
        let versions = Arc::new(VersionRegistry::new(
            Arc::clone(&store),
            KeySchema::new(config.key_prefix.clone()),
            config.retry,
            config.enable_pubsub,
        ));
        let locales: Arc<[String]> = config.locales.clone().into();
        Self {
            config,
            store,
            versions,
            table: Arc::new(NamespaceTable::default()),
            locales,
            listener: Mutex::new(None),
        }
    }

    /// Create a manager backed by Redis
    pub async fn with_redis(
        config: CacheConfig,
        redis_client: redis::Client,
    ) -> Result<Self, CacheError> {
        let store = RedisStore::new(redis_client).await?;
        Ok(Self::new(config, Arc::new(store)))
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn versions(&self) -> &VersionRegistry {
        &self.versions
    }

    /// Registered namespaces, sorted by name
    pub fn namespaces(&self) -> Vec<Namespace> {
        self.table
            .all()
            .iter()
            .map(|segment| segment.namespace().clone())
            .collect()
    }

    /// Register a namespace and get its cache.
    ///
    /// The namespace must be present in the configuration and may be
    /// registered once, before [`start`](Self::start).
    pub fn register<V: Cacheable>(
        &self,
        namespace: &Namespace,
    ) -> Result<TwoLevelCache<V>, CacheError> {
        let ns_config = self
            .config
            .namespace(namespace)
            .ok_or_else(|| CacheError::UnknownNamespace(namespace.to_string()))?;

        let local: LocalCache<V> = LocalCache::new(ns_config);
        let segment = Arc::new(Segment::new(
            Arc::new(local.clone()),
            Arc::clone(&self.versions),
            self.config.reconciliation_interval,
        ));
        self.table.insert(Arc::clone(&segment))?;

        info!(
            namespace = %namespace,
            capacity = ns_config.l1_max_capacity,
            pattern_eviction = ns_config.pattern_eviction,
            "Registered cache namespace"
        );

        Ok(TwoLevelCache::from_parts(TwoLevelCacheParts {
            segment,
            local,
            store: Arc::clone(&self.store),
            keys: self.versions.keys().clone(),
            l2_ttl: ns_config.l2_ttl,
            reconcile_on_read: self.config.reconcile_on_read,
            locales: Arc::clone(&self.locales),
        }))
    }

    /// Freeze the namespace set and start the invalidation listener.
    ///
    /// Waits up to `subscribe_timeout` for the subscription; if the store is
    /// unreachable the listener keeps retrying in the background.
    pub async fn start(&self) -> Result<(), CacheError> {
        if !self.table.mark_started() {
            warn!("Cache manager already started");
            return Ok(());
        }

        let listener = InvalidationListener::new(
            Arc::clone(&self.store),
            &self.table,
            ListenerSettings {
                enable_pubsub: self.config.enable_pubsub,
                reconciliation_interval: self.config.reconciliation_interval,
                max_backoff: self.config.listener_backoff_max,
            },
        );
        let mut handle = listener.spawn();
        if !handle.wait_subscribed(self.config.subscribe_timeout).await {
            warn!(
                "Invalidation listener not subscribed after {:?}; continuing while it retries",
                self.config.subscribe_timeout
            );
        }

        *self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        info!("Cache manager started with {} namespaces", self.namespaces().len());
        Ok(())
    }

    /// Service translating business events into evictions
    pub fn eviction_service(&self) -> CacheEvictionService {
        CacheEvictionService::new(Arc::clone(&self.table), Arc::clone(&self.locales))
    }

    /// Stop the invalidation listener
    pub async fn shutdown(&self) {
        let handle = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.shutdown().await;
            info!("Cache manager stopped");
        }
    }
}
