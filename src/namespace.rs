//! Namespace names, key conventions and store key layout

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A named logical cache region (e.g. `permissions`, `menu`, `i18n`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Namespace(Cow<'static, str>);

impl Namespace {
    pub const MENU: Namespace = Namespace(Cow::Borrowed("menu"));
    pub const I18N: Namespace = Namespace(Cow::Borrowed("i18n"));
    pub const PERMISSIONS: Namespace = Namespace(Cow::Borrowed("permissions"));
    pub const STATS: Namespace = Namespace(Cow::Borrowed("stats"));
    pub const SEARCH: Namespace = Namespace(Cow::Borrowed("search"));
    pub const DICTIONARIES: Namespace = Namespace(Cow::Borrowed("dictionaries"));

    /// Namespaces present in the default configuration
    pub const STANDARD: [Namespace; 6] = [
        Self::MENU,
        Self::I18N,
        Self::PERMISSIONS,
        Self::STATS,
        Self::SEARCH,
        Self::DICTIONARIES,
    ];

    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Namespace {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Build a composite key in the `{entityId}:{variant}` convention
pub fn compose_key(entity_id: &str, variant: &str) -> String {
    format!("{entity_id}:{variant}")
}

/// Whether `key` is covered by an invalidation hint.
///
/// A hint covers the key equal to it and every `{hint}:{variant}` key.
pub fn key_matches_hint(key: &str, hint: &str) -> bool {
    match key.strip_prefix(hint) {
        Some("") => true,
        Some(rest) => rest.starts_with(':'),
        None => false,
    }
}

/// Store key and channel layout, all derived from one prefix
#[derive(Debug, Clone)]
pub struct KeySchema {
    prefix: String,
}

impl KeySchema {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Counter holding the authoritative version of a namespace
    pub fn version_key(&self, namespace: &Namespace) -> String {
        format!("{}:version:{}", self.prefix, namespace)
    }

    /// Pub/sub channel carrying a namespace's invalidations
    pub fn invalidation_channel(&self, namespace: &Namespace) -> String {
        format!("{}:invalidate:{}", self.prefix, namespace)
    }

    /// Shared (L2) value key; scoped by version so a bump orphans old values
    pub fn value_key(&self, namespace: &Namespace, version: u64, key: &str) -> String {
        format!("{}:{}:v{}:{}", self.prefix, namespace, version, key)
    }
}
