//! Domain-facing eviction API
//!
//! Write paths report what changed; this service translates the event into
//! namespace evictions. Eviction is a best-effort hint: failures are logged
//! and reported, never returned as errors to the business operation.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::namespace::Namespace;
use crate::registry::{EvictionScope, NamespaceTable};

/// Business events that invalidate cached data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheEvent {
    /// A user's permissions or roles changed (entity: user id)
    UserAccessChanged,
    /// Translation content of one language changed (entity: language code)
    TranslationChanged,
    /// Translations were bulk imported
    TranslationsImported,
    /// The menu structure changed
    MenuChanged,
    /// Reference or aggregate data changed
    ReferenceDataChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Granularity {
    /// The entity key plus every locale variant
    PerEntityAllLocales,
    /// The entity key and anything keyed under it
    PerEntity,
    Whole,
}

impl CacheEvent {
    fn targets(self) -> Vec<(Namespace, Granularity)> {
        match self {
            Self::UserAccessChanged => vec![
                (Namespace::PERMISSIONS, Granularity::PerEntityAllLocales),
                (Namespace::MENU, Granularity::PerEntityAllLocales),
            ],
            Self::TranslationChanged => vec![(Namespace::I18N, Granularity::PerEntity)],
            Self::TranslationsImported => vec![(Namespace::I18N, Granularity::Whole)],
            Self::MenuChanged => vec![(Namespace::MENU, Granularity::Whole)],
            Self::ReferenceDataChanged => vec![
                (Namespace::STATS, Granularity::Whole),
                (Namespace::SEARCH, Granularity::Whole),
                (Namespace::DICTIONARIES, Granularity::Whole),
            ],
        }
    }

    /// Namespaces this event touches
    pub fn namespaces(self) -> Vec<Namespace> {
        self.targets().into_iter().map(|(ns, _)| ns).collect()
    }
}

/// What an eviction call did, per namespace
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Namespaces invalidated, with the version they were bumped to
    pub bumped: Vec<(Namespace, u64)>,
    /// Namespaces not registered on this replica
    pub skipped: Vec<Namespace>,
    /// Namespaces whose version bump failed
    pub failed: Vec<Namespace>,
}

impl EvictionReport {
    /// Whether every targeted namespace was bumped
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty() && self.failed.is_empty()
    }

    pub fn version_of(&self, namespace: &Namespace) -> Option<u64> {
        self.bumped
            .iter()
            .find(|(ns, _)| ns == namespace)
            .map(|(_, version)| *version)
    }
}

/// Maps business events to cache evictions
#[derive(Clone)]
pub struct CacheEvictionService {
    table: Arc<NamespaceTable>,
    locales: Arc<[String]>,
}

impl CacheEvictionService {
    pub(crate) fn new(table: Arc<NamespaceTable>, locales: Arc<[String]>) -> Self {
        Self { table, locales }
    }

    /// Evict everything affected by `event`.
    ///
    /// Without an entity id, per-entity events fall back to whole-namespace
    /// eviction.
    pub async fn evict(&self, event: CacheEvent, entity_id: Option<&str>) -> EvictionReport {
        let entity_id = entity_id.filter(|id| !id.is_empty());
        let mut report = EvictionReport::default();

        for (namespace, granularity) in event.targets() {
            let scope = match (granularity, entity_id) {
                (Granularity::PerEntityAllLocales, Some(id)) => EvictionScope::Entity {
                    id: id.to_owned(),
                    variants: self.locales.to_vec(),
                },
                (Granularity::PerEntity, Some(id)) => EvictionScope::Entity {
                    id: id.to_owned(),
                    variants: Vec::new(),
                },
                _ => EvictionScope::Namespace,
            };
            self.evict_scope(&namespace, scope, &mut report).await;
        }

        debug!(?event, ?entity_id, ?report, "Cache eviction processed");
        report
    }

    /// Evict a whole namespace by name
    pub async fn evict_namespace(&self, namespace: &Namespace) -> EvictionReport {
        let mut report = EvictionReport::default();
        self.evict_scope(namespace, EvictionScope::Namespace, &mut report)
            .await;
        report
    }

    /// Evict specific keys of a namespace by name.
    ///
    /// A single key is evicted on its own everywhere; several keys clear the
    /// namespace on every replica. An empty list does nothing.
    pub async fn evict_keys(&self, namespace: &Namespace, keys: Vec<String>) -> EvictionReport {
        let mut report = EvictionReport::default();
        if keys.is_empty() {
            debug!("No keys given for namespace {}; nothing to evict", namespace);
            return report;
        }
        self.evict_scope(namespace, EvictionScope::Keys(keys), &mut report)
            .await;
        report
    }

    async fn evict_scope(
        &self,
        namespace: &Namespace,
        scope: EvictionScope,
        report: &mut EvictionReport,
    ) {
        let Some(segment) = self.table.get(namespace) else {
            warn!("Namespace {} is not registered; eviction skipped", namespace);
            report.skipped.push(namespace.clone());
            return;
        };

        match segment.evict(scope).await {
            Ok(version) => report.bumped.push((namespace.clone(), version)),
            Err(e) => {
                warn!(
                    "Invalidation of namespace {} failed: {}. Continuing.",
                    namespace, e
                );
                report.failed.push(namespace.clone());
            }
        }
    }
}
