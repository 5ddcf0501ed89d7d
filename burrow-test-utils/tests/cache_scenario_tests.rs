//! End-to-end cache scenarios against the in-memory document store.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use burrow_storage::{BoundedCache, RemovalCause, RemovalListener};
use burrow_test_utils::assertions::{assert_identity_mismatch, assert_persisted, assert_same_instance};
use burrow_test_utils::fixtures::{
    account_cache, init_tracing, player_cache, player_store, test_lanes, wait_until,
};
use burrow_test_utils::*;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

async fn rename(cache: &EntityCache<Player>, id: u64, name: &str) -> EntityRef<Player> {
    let player = cache.load(&id).await.unwrap().unwrap();
    write_entity(&player).name = name.to_string();
    cache.update(&player).unwrap();
    player
}

#[tokio::test]
async fn test_eviction_of_clean_entry_writes_nothing() {
    init_tracing();
    let lanes = test_lanes();
    let store = player_store([1, 2, 3]);
    let cache = player_cache(EntityCacheConfig::new().with_capacity(2), &store, &lanes);

    for id in 1..=3 {
        cache.load(&id).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(cache.get(&1).is_none());
    assert_eq!(store.write_count(), 0);
    lanes.shutdown();
}

#[tokio::test]
async fn test_eviction_of_dirty_entry_writes_once() {
    init_tracing();
    let lanes = test_lanes();
    let store = player_store([1, 2, 3]);
    let cache = player_cache(EntityCacheConfig::new().with_capacity(2), &store, &lanes);

    let first = rename(&cache, 1, "dirty").await;
    cache.load(&2).await.unwrap();
    cache.load(&3).await.unwrap();

    assert!(wait_until(WAIT, || store.bulk_write_count() == 1).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.bulk_write_count(), 1);
    assert_eq!(store.replaced_count(), 1);
    assert_persisted(&store, &first);
    lanes.shutdown();
}

#[tokio::test]
async fn test_explicit_remove_never_persists() {
    init_tracing();
    let lanes = test_lanes();
    let store = player_store([1]);
    let cache = player_cache(EntityCacheConfig::new(), &store, &lanes);

    rename(&cache, 1, "discarded").await;
    cache.invalidate(&1);
    cache.persist_all();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(store.write_count(), 0);
    assert_eq!(store.document(&1).unwrap().name, "stored");
    lanes.shutdown();
}

#[tokio::test]
async fn test_bounded_cache_expiry_notifies_once() {
    init_tracing();
    let lanes = test_lanes();
    let removed = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&removed);
    let listener: RemovalListener<u64, &'static str> = Arc::new(move |batch, cause| {
        let keys: Vec<u64> = batch.into_iter().map(|(k, _)| k).collect();
        sink.lock().unwrap().push((keys, cause));
    });
    let cache = BoundedCache::new(3, Duration::from_millis(1000), listener);
    cache.spawn_sweeper(lanes.scheduler(), Duration::from_millis(100));

    cache.put(1, "v1");
    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert_eq!(
        *removed.lock().unwrap(),
        vec![(vec![1], RemovalCause::Expired)]
    );
    lanes.shutdown();
}

#[tokio::test]
async fn test_dirty_entry_expires_into_one_write() {
    init_tracing();
    let lanes = test_lanes();
    let store = player_store([1]);
    let config = EntityCacheConfig::new()
        .with_capacity(3)
        .with_ttl(Duration::from_millis(1000));
    let cache = player_cache(config, &store, &lanes);

    let player = rename(&cache, 1, "v1").await;
    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert!(wait_until(WAIT, || store.bulk_write_count() == 1).await);
    let stats = cache.stats();
    assert_eq!(stats.cache.expirations, 1);
    assert_eq!(stats.persisted, 1);
    assert_eq!(store.write_count(), 1);
    assert_persisted(&store, &player);
    lanes.shutdown();
}

#[tokio::test]
async fn test_missing_key_loads_once() {
    init_tracing();
    let lanes = test_lanes();
    let store = player_store([]);
    let cache = player_cache(EntityCacheConfig::new(), &store, &lanes);

    assert!(cache.load(&404).await.unwrap().is_none());
    assert!(cache.load(&404).await.unwrap().is_none());

    assert_eq!(store.load_count(), 1);
    lanes.shutdown();
}

#[tokio::test]
async fn test_persist_twice_writes_once() {
    init_tracing();
    let lanes = test_lanes();
    let store = player_store([1]);
    let cache = player_cache(EntityCacheConfig::new(), &store, &lanes);
    rename(&cache, 1, "once").await;

    cache.persist(&1).await;
    cache.persist(&1).await;

    assert_eq!(store.write_count(), 1);
    lanes.shutdown();
}

#[tokio::test]
async fn test_foreign_instance_is_rejected() {
    init_tracing();
    let lanes = test_lanes();
    let store = player_store([1]);
    let cache = player_cache(EntityCacheConfig::new(), &store, &lanes);
    let cached = cache.load(&1).await.unwrap().unwrap();

    let copy = Arc::new(std::sync::RwLock::new(read_entity(&cached).clone()));
    assert_identity_mismatch(&cache.update(&copy));
    assert_identity_mismatch(&cache.update_now(&copy).await);
    assert_same_instance(&cache.get(&1).unwrap(), &cached);
    lanes.shutdown();
}

#[tokio::test]
async fn test_stale_cache_version_is_dropped_and_reloaded() {
    init_tracing();
    let lanes = test_lanes();
    let id = Uuid::now_v7();
    let store = Arc::new(MockDocumentStore::with_documents([
        Account::new(id, "ada").with_version(3),
    ]));
    let cache = account_cache(EntityCacheConfig::new(), &store, &lanes);

    let account = cache.load(&id).await.unwrap().unwrap();
    write_entity(&account).balance = 100;
    cache.update(&account).unwrap();
    store.put_document(Account::new(id, "ada").with_version(5));

    let report = cache.persist(&id).await;

    assert_eq!(report.dropped, 1);
    assert!(cache.get(&id).is_none());
    assert_eq!(store.update_count(), 0);
    assert_eq!(store.document(&id).unwrap().version, 5);

    let reloaded = cache.load(&id).await.unwrap().unwrap();
    assert_eq!(read_entity(&reloaded).version, 5);
    lanes.shutdown();
}

#[tokio::test]
async fn test_lagging_backing_version_is_overwritten() {
    init_tracing();
    let lanes = test_lanes();
    let id = Uuid::now_v7();
    let store = Arc::new(MockDocumentStore::with_documents([
        Account::new(id, "ada").with_version(5),
    ]));
    let cache = account_cache(EntityCacheConfig::new(), &store, &lanes);

    let account = cache.load(&id).await.unwrap().unwrap();
    write_entity(&account).balance = 100;
    cache.update(&account).unwrap();
    store.put_document(Account::new(id, "ada").with_version(3));

    let report = cache.persist(&id).await;

    assert_eq!(report.reconciled, 1);
    assert_eq!(store.update_count(), 1);
    assert_same_instance(&cache.get(&id).unwrap(), &account);
    assert_persisted(&store, &account);
    lanes.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_updates_are_all_flushed() {
    init_tracing();
    let lanes = test_lanes();
    let store = player_store(0..32);
    let cache = player_cache(
        EntityCacheConfig::new().with_thread_safe(true).with_page_size(8),
        &store,
        &lanes,
    );

    let mut tasks = Vec::new();
    for worker in 0..4u64 {
        let cache = cache.clone();
        tasks.push(tokio::spawn(async move {
            for id in (worker * 8)..(worker * 8 + 8) {
                let player = cache.load(&id).await.unwrap().unwrap();
                write_entity(&player).gold = id as i64 * 10;
                cache.update(&player).unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let report = cache.persist_all_block().await;

    assert_eq!(report.written, 32);
    assert_eq!(store.bulk_write_count(), 4);
    for id in 0..32 {
        assert_eq!(store.document(&id).unwrap().gold, id as i64 * 10);
    }
    lanes.shutdown();
}
