//! Cache error types

use redis::RedisError;

/// Errors raised by a [`DistributedStore`](crate::DistributedStore)
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Value at {key} is not a counter: {value}")]
    NotACounter { key: String, value: String },
}

/// Cache-related errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Loader error: {0}")]
    Loader(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("Unknown namespace: {0}")]
    UnknownNamespace(String),

    #[error("Namespace already registered: {0}")]
    DuplicateNamespace(String),

    #[error("Cannot register namespace {0} after the cache manager has started")]
    AlreadyStarted(String),

    #[error("Corrupt version for namespace {namespace}: {value}")]
    CorruptVersion { namespace: String, value: String },

    #[error("Background task failed: {0}")]
    Task(String),
}
