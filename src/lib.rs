//! nscache - Two-level namespace cache with cross-instance invalidation
//!
//! This library keeps process-local caches of many stateless replicas
//! consistent without flushing everything on every write:
//! - L1: In-memory Moka cache per namespace (fastest, private to a replica)
//! - L2: Shared store (Redis), scoped by namespace version
//! - Origin: a loader supplied by the caller (system of record)
//!
//! Every namespace has one version counter in the shared store. Cached entries
//! are stamped with the version they were loaded under. An eviction bumps the
//! counter and broadcasts the new version over pub/sub; replicas drop the
//! affected entries when the message arrives, and re-read the counter
//! periodically so that a lost message only delays invalidation.

mod bus;
mod config;
mod error;
mod eviction;
mod local_cache;
mod manager;
mod namespace;
mod registry;
pub mod store;
mod two_level_cache;
mod version;

pub use bus::InvalidationMessage;
pub use config::{CacheConfig, NamespaceConfig, RetryPolicy};
pub use error::{CacheError, StoreError};
pub use eviction::{CacheEvent, CacheEvictionService, EvictionReport};
pub use local_cache::{LocalCache, LocalEviction, LocalSegment, StampedEntry};
pub use manager::CacheManager;
pub use namespace::{KeySchema, Namespace, compose_key, key_matches_hint};
pub use store::{DistributedStore, MemoryStore, RedisStore};
pub use two_level_cache::{Cacheable, TwoLevelCache};
pub use version::VersionRegistry;

// Re-export async_trait for store implementors
pub use async_trait::async_trait;
