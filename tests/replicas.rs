//! Several replicas sharing one store.
//!
//! Each test builds two or more `CacheManager`s on clones of a single
//! `MemoryStore`, which stands in for the shared Redis instance.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nscache::{
    CacheConfig, CacheError, CacheEvent, CacheManager, MemoryStore, Namespace, NamespaceConfig,
    RetryPolicy, TwoLevelCache,
};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("nscache=debug")),
        )
        .with_test_writer()
        .try_init();
}

fn test_config() -> CacheConfig {
    let mut config = CacheConfig::default();
    config.retry = RetryPolicy {
        max_attempts: 2,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(2),
    };
    config.subscribe_timeout = Duration::from_secs(1);
    config
}

struct Replica {
    manager: CacheManager,
    permissions: TwoLevelCache<String>,
    menu: TwoLevelCache<String>,
}

async fn replica(store: &MemoryStore, config: CacheConfig) -> Replica {
    let manager = CacheManager::new(config, Arc::new(store.clone()));
    let permissions = manager.register(&Namespace::PERMISSIONS).unwrap();
    let menu = manager.register(&Namespace::MENU).unwrap();
    manager.start().await.unwrap();
    Replica {
        manager,
        permissions,
        menu,
    }
}

/// Returns the value and whether the loader had to run
async fn load(cache: &TwoLevelCache<String>, key: &str, value: &str) -> (String, bool) {
    let loaded = AtomicBool::new(false);
    let result = cache
        .get_or_load(key, || async {
            loaded.store(true, Ordering::SeqCst);
            Ok::<_, CacheError>(Some(value.to_owned()))
        })
        .await
        .unwrap()
        .expect("loader always returns a value");
    (result.as_ref().clone(), loaded.load(Ordering::SeqCst))
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_eviction_reaches_other_replica() {
    init_tracing();
    let store = MemoryStore::new();
    let a = replica(&store, test_config()).await;
    let b = replica(&store, test_config()).await;

    load(&a.permissions, "user-42", "read").await;
    load(&b.permissions, "user-42", "read").await;
    load(&b.permissions, "user-7", "read").await;

    let version = a.permissions.evict("user-42").await.unwrap();
    wait_until(|| b.permissions.observed_version() >= version).await;

    assert!(b.permissions.peek("user-42").await.is_none());
    // Contiguous version with a hint: only the named key goes
    assert!(b.permissions.peek("user-7").await.is_some());

    let (value, loaded) = load(&b.permissions, "user-42", "read,write").await;
    assert_eq!(value, "read,write");
    assert!(loaded);

    a.manager.shutdown().await;
    b.manager.shutdown().await;
}

#[tokio::test]
async fn test_namespace_without_pattern_eviction_clears_remotely() {
    init_tracing();
    let store = MemoryStore::new();
    let config = || {
        test_config().with_namespace(
            NamespaceConfig::new(Namespace::MENU).with_pattern_eviction(false),
        )
    };
    let a = replica(&store, config()).await;
    let b = replica(&store, config()).await;

    load(&b.menu, "tree:en-US", "menu").await;
    load(&b.menu, "tree:ru-RU", "меню").await;

    let version = a.menu.evict("tree:en-US").await.unwrap();
    wait_until(|| b.menu.observed_version() >= version).await;

    assert!(b.menu.peek("tree:en-US").await.is_none());
    assert!(b.menu.peek("tree:ru-RU").await.is_none());
}

#[tokio::test]
async fn test_namespace_eviction_drops_every_key() {
    init_tracing();
    let store = MemoryStore::new();
    let a = replica(&store, test_config()).await;
    let b = replica(&store, test_config()).await;

    for key in ["tree:en-US", "tree:ru-RU", "user-42:en-US"] {
        load(&a.menu, key, "menu").await;
        load(&b.menu, key, "menu").await;
    }

    let version = a.menu.evict_namespace().await.unwrap();
    wait_until(|| b.menu.observed_version() >= version).await;

    for key in ["tree:en-US", "tree:ru-RU", "user-42:en-US"] {
        assert!(a.menu.peek(key).await.is_none(), "{key} still cached on a");
        assert!(b.menu.peek(key).await.is_none(), "{key} still cached on b");
    }
}

#[tokio::test]
async fn test_lost_publication_heals_by_reconciliation() {
    init_tracing();
    let store = MemoryStore::new();
    let config = || test_config().with_reconciliation_interval(Duration::from_millis(50));
    let a = replica(&store, config()).await;
    let b = replica(&store, config()).await;

    load(&b.permissions, "user-42", "read").await;

    store.drop_publications(true);
    let version = a.permissions.evict("user-42").await.unwrap();
    wait_until(|| b.permissions.observed_version() >= version).await;

    let (value, loaded) = load(&b.permissions, "user-42", "read,write").await;
    assert_eq!(value, "read,write");
    assert!(loaded);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_evictions_each_bump_once() {
    init_tracing();
    let store = MemoryStore::new();
    let a = replica(&store, test_config()).await;
    let b = replica(&store, test_config()).await;
    let initial = a
        .manager
        .versions()
        .current_version(&Namespace::PERMISSIONS)
        .await
        .unwrap();

    let tasks: Vec<_> = (0..100)
        .map(|i| {
            let cache = if i % 2 == 0 {
                a.permissions.clone()
            } else {
                b.permissions.clone()
            };
            tokio::spawn(async move { cache.evict(&format!("user-{i}")).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let current = a
        .manager
        .versions()
        .current_version(&Namespace::PERMISSIONS)
        .await
        .unwrap();
    assert_eq!(current, initial + 100);
    wait_until(|| {
        a.permissions.observed_version() == current && b.permissions.observed_version() == current
    })
    .await;
}

#[tokio::test]
async fn test_eviction_service_covers_locale_variants() {
    init_tracing();
    let store = MemoryStore::new();
    let a = replica(&store, test_config()).await;
    let b = replica(&store, test_config()).await;

    for key in ["user-42", "user-42:en-US", "user-42:ru-RU"] {
        load(&b.permissions, key, "read").await;
        load(&b.menu, key, "menu").await;
    }

    let report = a
        .manager
        .eviction_service()
        .evict(CacheEvent::UserAccessChanged, Some("user-42"))
        .await;
    assert!(report.is_complete());
    let permissions_version = report.version_of(&Namespace::PERMISSIONS).unwrap();
    let menu_version = report.version_of(&Namespace::MENU).unwrap();

    wait_until(|| {
        b.permissions.observed_version() >= permissions_version
            && b.menu.observed_version() >= menu_version
    })
    .await;
    for key in ["user-42", "user-42:en-US", "user-42:ru-RU"] {
        assert!(b.permissions.peek(key).await.is_none(), "{key}");
        assert!(b.menu.peek(key).await.is_none(), "{key}");
    }
}

#[tokio::test]
async fn test_entity_eviction_without_pattern_support_clears_writer_too() {
    init_tracing();
    let store = MemoryStore::new();
    let config = || {
        test_config().with_namespace(
            NamespaceConfig::new(Namespace::I18N).with_pattern_eviction(false),
        )
    };
    let a = CacheManager::new(config(), Arc::new(store.clone()));
    let b = CacheManager::new(config(), Arc::new(store.clone()));
    let a_i18n: TwoLevelCache<String> = a.register(&Namespace::I18N).unwrap();
    let b_i18n: TwoLevelCache<String> = b.register(&Namespace::I18N).unwrap();
    a.start().await.unwrap();
    b.start().await.unwrap();

    load(&a_i18n, "ru-RU:common", "old").await;
    load(&b_i18n, "ru-RU:common", "old").await;

    let report = a
        .eviction_service()
        .evict(CacheEvent::TranslationChanged, Some("ru-RU"))
        .await;
    let version = report.version_of(&Namespace::I18N).unwrap();
    wait_until(|| b_i18n.observed_version() >= version).await;

    assert!(a_i18n.peek("ru-RU:common").await.is_none());
    assert!(b_i18n.peek("ru-RU:common").await.is_none());
    let (value, loaded) = load(&a_i18n, "ru-RU:common", "new").await;
    assert_eq!(value, "new");
    assert!(loaded);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_key_list_eviction_matches_on_every_replica() {
    init_tracing();
    let store = MemoryStore::new();
    let a = replica(&store, test_config()).await;
    let b = replica(&store, test_config()).await;
    let service = a.manager.eviction_service();

    for key in ["user-1", "user-2", "user-3"] {
        load(&a.permissions, key, "read").await;
        load(&b.permissions, key, "read").await;
    }

    let empty = service.evict_keys(&Namespace::PERMISSIONS, Vec::new()).await;
    assert!(empty.bumped.is_empty());
    assert_eq!(a.permissions.observed_version(), 0);
    assert!(a.permissions.peek("user-3").await.is_some());

    let report = service
        .evict_keys(
            &Namespace::PERMISSIONS,
            vec!["user-1".to_owned(), "user-2".to_owned()],
        )
        .await;
    let version = report.version_of(&Namespace::PERMISSIONS).unwrap();
    wait_until(|| b.permissions.observed_version() >= version).await;

    // Without a hint both sides drop the whole namespace
    for key in ["user-1", "user-2", "user-3"] {
        assert!(a.permissions.peek(key).await.is_none(), "{key} still cached on a");
        assert!(b.permissions.peek(key).await.is_none(), "{key} still cached on b");
    }
}

#[tokio::test]
async fn test_eviction_service_skips_unregistered_namespaces() {
    init_tracing();
    let store = MemoryStore::new();
    let manager = CacheManager::new(test_config(), Arc::new(store.clone()));
    let _permissions: TwoLevelCache<String> = manager.register(&Namespace::PERMISSIONS).unwrap();
    manager.start().await.unwrap();

    let report = manager
        .eviction_service()
        .evict(CacheEvent::UserAccessChanged, Some("user-42"))
        .await;
    assert_eq!(report.version_of(&Namespace::PERMISSIONS), Some(1));
    assert_eq!(report.skipped, vec![Namespace::MENU]);
    assert!(report.failed.is_empty());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_store_outage_is_reported_not_raised() {
    init_tracing();
    let store = MemoryStore::new();
    let a = replica(&store, test_config()).await;

    load(&a.menu, "tree:en-US", "menu").await;
    store.set_available(false);

    let report = a
        .manager
        .eviction_service()
        .evict(CacheEvent::MenuChanged, None)
        .await;
    assert_eq!(report.failed, vec![Namespace::MENU]);
    assert!(report.bumped.is_empty());
    // The local copy is dropped even though the bump failed
    assert!(a.menu.peek("tree:en-US").await.is_none());

    // Reads keep working off the loader
    let (value, loaded) = load(&a.menu, "tree:en-US", "menu").await;
    assert_eq!(value, "menu");
    assert!(loaded);

    store.set_available(true);
    let report = a
        .manager
        .eviction_service()
        .evict(CacheEvent::MenuChanged, None)
        .await;
    assert!(report.is_complete());
}

#[tokio::test]
async fn test_listener_subscribes_once_store_comes_back() {
    init_tracing();
    let store = MemoryStore::new();
    let mut config = test_config();
    config.subscribe_timeout = Duration::from_millis(50);

    let b = CacheManager::new(config.clone(), Arc::new(store.clone()));
    let b_permissions: TwoLevelCache<String> = b.register(&Namespace::PERMISSIONS).unwrap();

    store.set_available(false);
    b.start().await.unwrap();
    store.set_available(true);

    load(&b_permissions, "user-42", "read").await;
    let a = replica(&store, config).await;
    let version = a.permissions.evict("user-42").await.unwrap();

    wait_until(|| b_permissions.observed_version() >= version).await;
    assert!(b_permissions.peek("user-42").await.is_none());
    b.shutdown().await;
}

#[tokio::test]
async fn test_registration_rules() {
    let store = MemoryStore::new();
    let manager = CacheManager::new(test_config(), Arc::new(store));

    let unknown = manager.register::<String>(&Namespace::new("reports"));
    assert!(matches!(unknown, Err(CacheError::UnknownNamespace(_))));

    manager.register::<String>(&Namespace::I18N).unwrap();
    let duplicate = manager.register::<String>(&Namespace::I18N);
    assert!(matches!(duplicate, Err(CacheError::DuplicateNamespace(_))));

    manager.start().await.unwrap();
    let late = manager.register::<String>(&Namespace::MENU);
    assert!(matches!(late, Err(CacheError::AlreadyStarted(_))));
    assert_eq!(manager.namespaces(), vec![Namespace::I18N]);

    manager.shutdown().await;
    // Second shutdown is a no-op
    manager.shutdown().await;
}
