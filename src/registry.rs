//! Per-namespace runtime state shared by the facade, the listener and the
//! eviction service

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::CacheError;
use crate::local_cache::{LocalEviction, LocalSegment};
use crate::namespace::{Namespace, compose_key};
use crate::version::VersionRegistry;

/// What a replica drops when a namespace is invalidated
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum EvictionScope {
    /// Exactly these keys
    Keys(Vec<String>),
    /// The entity key and all of its `{id}:{variant}` keys
    Entity { id: String, variants: Vec<String> },
    /// Every key of the namespace
    Namespace,
}

impl EvictionScope {
    pub(crate) fn key(key: impl Into<String>) -> Self {
        Self::Keys(vec![key.into()])
    }

    fn local_keys(&self) -> Vec<String> {
        match self {
            Self::Keys(keys) => keys.clone(),
            Self::Entity { id, variants } => std::iter::once(id.clone())
                .chain(variants.iter().map(|variant| compose_key(id, variant)))
                .collect(),
            Self::Namespace => Vec::new(),
        }
    }

    /// Hint published to other replicas; `None` makes them clear everything
    fn hint(&self) -> Option<String> {
        match self {
            Self::Keys(keys) if keys.len() == 1 => keys.first().cloned(),
            Self::Keys(_) | Self::Namespace => None,
            Self::Entity { id, .. } => Some(id.clone()),
        }
    }
}

/// Outcome of applying a version to a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// The version was not newer than what the replica already saw
    Stale,
    /// Only the hinted keys were dropped
    Targeted,
    /// The whole local segment was dropped
    Cleared,
}

#[derive(Debug, Clone, Copy, Default)]
struct VersionState {
    /// Highest version this replica has seen
    observed: u64,
    /// Entries stamped below this are never served
    floor: u64,
}

/// Runtime state of one registered namespace
pub(crate) struct Segment {
    namespace: Namespace,
    local: Arc<dyn LocalSegment>,
    versions: Arc<VersionRegistry>,
    state: Mutex<VersionState>,
    next_reconcile: Mutex<Option<Instant>>,
    reconciliation_interval: Duration,
}

impl Segment {
    pub(crate) fn new(
        local: Arc<dyn LocalSegment>,
        versions: Arc<VersionRegistry>,
        reconciliation_interval: Duration,
    ) -> Self {
        Self {
            namespace: local.namespace().clone(),
            local,
            versions,
            state: Mutex::new(VersionState::default()),
            next_reconcile: Mutex::new(None),
            reconciliation_interval,
        }
    }

    pub(crate) fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub(crate) fn versions(&self) -> &VersionRegistry {
        &self.versions
    }

    fn state(&self) -> MutexGuard<'_, VersionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Highest namespace version observed by this replica
    pub(crate) fn observed_version(&self) -> u64 {
        self.state().observed
    }

    /// Whether an entry stamped with `stamp` may be served
    pub(crate) fn is_fresh(&self, stamp: u64) -> bool {
        stamp >= self.state().floor
    }

    /// Apply a version learned from the bus or from reconciliation.
    ///
    /// The hint is honored only when the version directly follows the last
    /// observed one; any gap means invalidations were missed and the whole
    /// segment is dropped.
    pub(crate) fn apply(&self, version: u64, hint: Option<&str>) -> Advance {
        let mut state = self.state();
        if version <= state.observed {
            return Advance::Stale;
        }
        let contiguous = version == state.observed + 1;
        state.observed = version;

        if let Some(hint) = hint
            && contiguous
            && self.local.supports_pattern_eviction()
            && self.local.evict_related(hint) == LocalEviction::Targeted
        {
            return Advance::Targeted;
        }

        state.floor = version;
        self.local.clear();
        Advance::Cleared
    }

    /// Apply a version produced by this replica's own bump
    fn apply_own(&self, version: u64, clear_all: bool) {
        let mut state = self.state();
        if version <= state.observed && !clear_all {
            // The listener got here first
            return;
        }
        let contiguous = version == state.observed + 1;
        state.observed = state.observed.max(version);
        if clear_all || !contiguous {
            state.floor = state.floor.max(version);
            self.local.clear();
        }
    }

    /// Whether the read path should re-validate now; claims the slot if so
    pub(crate) fn reconcile_due(&self) -> bool {
        let mut next = self
            .next_reconcile
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        match *next {
            Some(at) if now < at => false,
            _ => {
                *next = Some(now + self.reconciliation_interval);
                true
            }
        }
    }

    /// Compare against the authoritative version and catch up if behind
    pub(crate) async fn reconcile(&self) -> Result<Advance, CacheError> {
        let authoritative = self.versions.current_version(&self.namespace).await?;
        {
            let mut next = self
                .next_reconcile
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *next = Some(Instant::now() + self.reconciliation_interval);
        }

        let mut state = self.state();
        if authoritative < state.observed {
            // Counters only go down when the store lost its data
            warn!(
                namespace = %self.namespace,
                authoritative,
                observed = state.observed,
                "Namespace version went backwards; resetting local segment"
            );
            *state = VersionState {
                observed: authoritative,
                floor: authoritative,
            };
            self.local.clear();
            return Ok(Advance::Cleared);
        }
        drop(state);

        let advance = self.apply(authoritative, None);
        if advance == Advance::Cleared {
            info!(
                namespace = %self.namespace,
                version = authoritative,
                "Reconciliation found missed invalidations; local segment cleared"
            );
        }
        Ok(advance)
    }

    async fn drop_keys(&self, hint: Option<&str>, keys: &[String]) {
        if let Some(hint) = hint {
            self.local.evict_related(hint);
        }
        for key in keys {
            self.local.evict(key).await;
        }
    }

    /// Drop local entries for `scope`, then bump the namespace version.
    ///
    /// Scopes without a hint, and any scope on a namespace without pattern
    /// eviction, clear the whole local segment.
    ///
    /// The bump and its follow-up run in their own task so that cancelling
    /// the caller cannot leave the namespace bumped but not re-evicted.
    pub(crate) async fn evict(self: &Arc<Self>, scope: EvictionScope) -> Result<u64, CacheError> {
        let keys = scope.local_keys();
        let hint = scope.hint();
        // Mirror what the other replicas will do with the published hint
        let clear_all = hint.is_none() || !self.local.supports_pattern_eviction();

        if clear_all {
            self.local.clear();
        } else {
            self.drop_keys(hint.as_deref(), &keys).await;
        }

        let segment = Arc::clone(self);
        let task = tokio::spawn(async move {
            let version = segment
                .versions
                .bump(&segment.namespace, hint.as_deref())
                .await?;
            segment.apply_own(version, clear_all);
            // Second pass drops values a concurrent load stored before the bump landed
            if !clear_all {
                segment.drop_keys(hint.as_deref(), &keys).await;
            }
            debug!(
                namespace = %segment.namespace,
                version,
                keys = keys.len(),
                "Local eviction complete"
            );
            Ok::<_, CacheError>(version)
        });

        task.await.map_err(|e| CacheError::Task(e.to_string()))?
    }
}

/// The fixed set of namespaces registered on one replica
#[derive(Default)]
pub(crate) struct NamespaceTable {
    segments: RwLock<HashMap<Namespace, Arc<Segment>>>,
    started: AtomicBool,
}

impl NamespaceTable {
    pub(crate) fn insert(&self, segment: Arc<Segment>) -> Result<(), CacheError> {
        let namespace = segment.namespace().clone();
        if self.is_started() {
            return Err(CacheError::AlreadyStarted(namespace.to_string()));
        }
        let mut segments = self
            .segments
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if segments.contains_key(&namespace) {
            return Err(CacheError::DuplicateNamespace(namespace.to_string()));
        }
        segments.insert(namespace, segment);
        Ok(())
    }

    pub(crate) fn get(&self, namespace: &Namespace) -> Option<Arc<Segment>> {
        self.segments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(namespace)
            .cloned()
    }

    pub(crate) fn all(&self) -> Vec<Arc<Segment>> {
        let mut segments: Vec<_> = self
            .segments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        segments.sort_by(|a, b| a.namespace().cmp(b.namespace()));
        segments
    }

    /// Freeze the table; returns false if it was already started
    pub(crate) fn mark_started(&self) -> bool {
        !self.started.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}
