//! Authoritative namespace versions
//!
//! Every namespace owns one counter in the distributed store. A bump is an
//! atomic increment followed by a broadcast of the new version on the
//! namespace's invalidation channel.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::bus::InvalidationMessage;
use crate::config::RetryPolicy;
use crate::error::{CacheError, StoreError};
use crate::namespace::{KeySchema, Namespace};
use crate::store::DistributedStore;

/// Tracks one monotonically increasing version per namespace
pub struct VersionRegistry {
    store: Arc<dyn DistributedStore>,
    keys: KeySchema,
    retry: RetryPolicy,
    publish: bool,
}

impl VersionRegistry {
    pub fn new(
        store: Arc<dyn DistributedStore>,
        keys: KeySchema,
        retry: RetryPolicy,
        publish: bool,
    ) -> Self {
        Self {
            store,
            keys,
            retry,
            publish,
        }
    }

    pub fn keys(&self) -> &KeySchema {
        &self.keys
    }

    /// Read the authoritative version; a namespace never bumped is at 0
    pub async fn current_version(&self, namespace: &Namespace) -> Result<u64, CacheError> {
        let raw = self.store.get(&self.keys.version_key(namespace)).await?;
        match raw {
            None => Ok(0),
            Some(value) => value
                .parse::<u64>()
                .map_err(|_| CacheError::CorruptVersion {
                    namespace: namespace.to_string(),
                    value,
                }),
        }
    }

    /// Increment the namespace version and announce it to all replicas.
    ///
    /// The increment is retried with backoff and its failure is returned.
    /// A failed publish is logged only: replicas that miss it catch up at
    /// their next reconciliation.
    pub async fn bump(
        &self,
        namespace: &Namespace,
        key_hint: Option<&str>,
    ) -> Result<u64, CacheError> {
        let store = &*self.store;
        let version_key = self.keys.version_key(namespace);
        let version_key = version_key.as_str();
        let version = with_retry(self.retry, "version increment", move || {
            store.increment(version_key)
        })
        .await?;

        debug!(
            namespace = %namespace,
            version,
            "Namespace version bumped"
        );

        if self.publish {
            let channel = self.keys.invalidation_channel(namespace);
            let payload = serde_json::to_string(&InvalidationMessage {
                namespace: namespace.clone(),
                version,
                key_hint: key_hint.map(str::to_owned),
            })?;
            let channel = channel.as_str();
            if let Err(e) = with_retry(self.retry, "invalidation publish", move || {
                store.publish(channel, payload.clone())
            })
            .await
            {
                warn!(
                    "PUBLISH error on channel {} for version {}: {}. Continuing.",
                    channel, version, e
                );
            }
        }

        Ok(version)
    }
}

/// Run a store operation, retrying failures with bounded exponential backoff
pub(crate) async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= max_attempts => {
                warn!("{} failed after {} attempts: {}", what, attempt, e);
                return Err(e);
            }
            Err(e) => {
                warn!("{} attempt {} failed: {}", what, attempt, e);
                tokio::time::sleep(policy.backoff(attempt)).await;
            }
        }
    }
}
