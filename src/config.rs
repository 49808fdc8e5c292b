//! Cache configuration

use std::time::Duration;

use crate::namespace::Namespace;

/// Configuration for a single namespace's local (L1) and shared (L2) tiers
#[derive(Debug, Clone)]
pub struct NamespaceConfig {
    /// Namespace this entry configures
    pub name: Namespace,
    /// Maximum number of entries in the local cache
    pub l1_max_capacity: u64,
    /// Time-to-live for local cache entries
    pub l1_ttl: Duration,
    /// Time-to-live for shared (L2) values; `None` disables the shared tier
    pub l2_ttl: Option<Duration>,
    /// Whether the local cache may evict entries by key prefix.
    ///
    /// When disabled, any remote invalidation clears the whole namespace.
    pub pattern_eviction: bool,
}

impl NamespaceConfig {
    /// Namespace config with the default capacity and TTLs
    pub fn new(name: Namespace) -> Self {
        Self {
            name,
            l1_max_capacity: 1000,
            l1_ttl: Duration::from_secs(300), // 5 minutes
            l2_ttl: Some(Duration::from_secs(900)), // 15 minutes
            pattern_eviction: true,
        }
    }

    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.l1_max_capacity = capacity;
        self
    }

    pub fn with_l1_ttl(mut self, ttl: Duration) -> Self {
        self.l1_ttl = ttl;
        self
    }

    pub fn with_l2_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.l2_ttl = ttl;
        self
    }

    pub fn with_pattern_eviction(mut self, enabled: bool) -> Self {
        self.pattern_eviction = enabled;
        self
    }
}

/// Bounded exponential backoff for store writes
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay to wait after the given (1-based) failed attempt
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(2000),
        }
    }
}

/// Configuration for the namespace cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Prefix for every store key and pub/sub channel
    pub key_prefix: String,
    /// Namespaces known at startup
    pub namespaces: Vec<NamespaceConfig>,
    /// Supported locale codes, in order, used as key variants
    pub locales: Vec<String>,
    /// How often the authoritative namespace versions are re-read
    pub reconciliation_interval: Duration,
    /// Re-validate against the store from the read path once per interval
    pub reconcile_on_read: bool,
    /// Enable pub/sub for cross-instance invalidation
    pub enable_pubsub: bool,
    /// Retry policy for version bumps and publishes
    pub retry: RetryPolicy,
    /// Upper bound for the listener's reconnect backoff
    pub listener_backoff_max: Duration,
    /// How long `start` waits for the first subscription
    pub subscribe_timeout: Duration,
}

impl CacheConfig {
    /// Look up the configuration of a namespace
    pub fn namespace(&self, name: &Namespace) -> Option<&NamespaceConfig> {
        self.namespaces.iter().find(|ns| &ns.name == name)
    }

    /// Replace (or add) the configuration of a namespace
    pub fn with_namespace(mut self, config: NamespaceConfig) -> Self {
        self.namespaces.retain(|ns| ns.name != config.name);
        self.namespaces.push(config);
        self
    }

    /// Set the supported locales; duplicates are dropped, first occurrence wins
    pub fn with_locales<I, S>(mut self, locales: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ordered: Vec<String> = Vec::new();
        for locale in locales {
            let locale = locale.into();
            if !ordered.contains(&locale) {
                ordered.push(locale);
            }
        }
        self.locales = ordered;
        self
    }

    pub fn with_reconciliation_interval(mut self, interval: Duration) -> Self {
        self.reconciliation_interval = interval;
        self
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: "cache".to_owned(),
            namespaces: Namespace::STANDARD
                .iter()
                .cloned()
                .map(NamespaceConfig::new)
                .collect(),
            locales: vec!["en-US".to_owned(), "ru-RU".to_owned()],
            reconciliation_interval: Duration::from_secs(30),
            reconcile_on_read: true,
            enable_pubsub: true,
            retry: RetryPolicy::default(),
            listener_backoff_max: Duration::from_secs(300),
            subscribe_timeout: Duration::from_secs(2),
        }
    }
}
