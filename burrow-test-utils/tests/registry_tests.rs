//! Cache registry lifecycle: registration, lookup and flushing shutdown.

use std::sync::Arc;
use std::time::Duration;

use burrow_test_utils::assertions::assert_persisted;
use burrow_test_utils::fixtures::{init_tracing, player_store};
use burrow_test_utils::*;
use uuid::Uuid;

const CONFIG: &str = r#"
[lanes]
parallelism = 2
thread_name_prefix = "registry-lane"

[entities.Player]
capacity = 100
ttl_ms = 60000
thread_safe = true

[entities.Account]
capacity = 10
page_size = 4
"#;

fn registry() -> CacheRegistry {
    CacheRegistry::new(BurrowConfig::from_toml_str(CONFIG).unwrap()).unwrap()
}

#[tokio::test]
async fn test_register_applies_per_type_config() {
    init_tracing();
    let registry = registry();
    let players = player_store([]);
    let accounts = Arc::new(MockDocumentStore::<Account>::new());

    let player_cache = registry.register::<Player>(players.clone(), players).unwrap();
    let account_cache = registry.register::<Account>(accounts.clone(), accounts).unwrap();

    assert_eq!(player_cache.config().capacity, 100);
    assert_eq!(player_cache.config().ttl, Duration::from_secs(60));
    assert!(player_cache.config().thread_safe);
    assert_eq!(account_cache.config().page_size, 4);
    assert_eq!(account_cache.mode(), PersistMode::Versioned);
    assert_eq!(registry.type_names(), vec!["Player", "Account"]);
    assert_eq!(registry.lanes().size(), 8);
    registry.shutdown().await;
}

#[tokio::test]
async fn test_get_returns_registered_cache() {
    init_tracing();
    let registry = registry();
    let players = player_store([1]);
    let registered = registry.register::<Player>(players.clone(), players.clone()).unwrap();

    let looked_up = registry.get::<Player>().unwrap();
    let loaded = registered.load(&1).await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&looked_up.get(&1).unwrap(), &loaded));
    assert!(registry.get::<Account>().is_none());

    let again = registry.register::<Player>(players.clone(), players).unwrap();
    assert_eq!(again.size(), 1);
    assert_eq!(registry.type_names().len(), 1);
    registry.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_flushes_every_cache() {
    init_tracing();
    let registry = registry();
    let players = player_store([1, 2]);
    let account_id = Uuid::now_v7();
    let accounts = Arc::new(MockDocumentStore::with_documents([Account::new(account_id, "ada")]));
    let player_cache = registry.register::<Player>(players.clone(), players.clone()).unwrap();
    let account_cache = registry.register::<Account>(accounts.clone(), accounts.clone()).unwrap();

    let mut dirty_players = Vec::new();
    for id in [1, 2] {
        let player = player_cache.load(&id).await.unwrap().unwrap();
        write_entity(&player).level = 10;
        player_cache.update(&player).unwrap();
        dirty_players.push(player);
    }
    let account = account_cache.load(&account_id).await.unwrap().unwrap();
    write_entity(&account).balance = 500;
    account_cache.update(&account).unwrap();

    let report = registry.shutdown().await;

    assert_eq!(report.written, 3);
    assert_eq!(report.failed, 0);
    for player in &dirty_players {
        assert_persisted(&players, player);
    }
    assert_persisted(&accounts, &account);
    assert!(registry.lanes().is_closed());
    assert_eq!(player_cache.dirty_count(), 0);
}

#[tokio::test]
async fn test_shutdown_is_idempotent_and_closes_registration() {
    init_tracing();
    let registry = registry();
    let players = player_store([1]);
    let cache = registry.register::<Player>(players.clone(), players.clone()).unwrap();
    let player = cache.load(&1).await.unwrap().unwrap();
    cache.update(&player).unwrap();

    let first = registry.shutdown().await;
    let second = registry.shutdown().await;

    assert_eq!(first.written, 1);
    assert!(second.is_empty());
    assert!(registry.is_closed());

    let accounts = Arc::new(MockDocumentStore::<Account>::new());
    let late = registry.register::<Account>(accounts.clone(), accounts);
    assert!(matches!(
        late,
        Err(BurrowError::Cache(CacheError::Closed { .. }))
    ));
}

#[tokio::test]
async fn test_failed_flush_is_reported() {
    init_tracing();
    let registry = registry();
    let players = player_store([1]);
    let cache = registry.register::<Player>(players.clone(), players.clone()).unwrap();
    let player = cache.load(&1).await.unwrap().unwrap();
    cache.update(&player).unwrap();
    players.set_fail_writes(true);

    let report = registry.shutdown().await;

    assert_eq!(report.failed, 1);
    assert_eq!(cache.dirty_count(), 1);
}

#[test]
fn test_malformed_config_is_fatal() {
    let result = BurrowConfig::from_toml_str("[entities.Player]\ncapacity = 0\n");
    burrow_test_utils::assertions::assert_config_error(&result);

    let result = BurrowConfig::from_toml_str("[lanes\nparallelism = 2");
    burrow_test_utils::assertions::assert_config_error(&result);
}
