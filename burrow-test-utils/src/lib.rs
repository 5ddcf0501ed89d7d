//! BURROW Test Utilities
//!
//! Centralized test infrastructure for the BURROW workspace:
//! - Sample entity types, one plain and one versioned
//! - Proptest generators for entities and configuration
//! - Fixtures for building caches on a fresh lane pool
//! - Custom assertions for BURROW-specific validation

// Re-export mock storage from its source crate
pub use burrow_storage::MockDocumentStore;

// Re-export core types for convenience
pub use burrow_core::{
    BurrowConfig, BurrowError, BurrowResult, CacheError, ConfigError, EntityCacheConfig,
    LaneError, LanePoolConfig, PersisterStrategy, StorageError,
};
pub use burrow_lanes::LanePool;
pub use burrow_storage::{
    read_entity, write_entity, CacheRegistry, Entity, EntityCache, EntityRef, PersistMode,
    PersistReport,
};

use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// SAMPLE ENTITIES
// ============================================================================

pub mod entities {
    //! Entity types used across the test suites.

    use super::*;
    use uuid::Uuid;

    /// Unversioned entity keyed by integer.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Player {
        pub id: u64,
        pub name: String,
        pub level: u32,
        pub gold: i64,
    }

    impl Player {
        pub fn new(id: u64, name: impl Into<String>) -> Self {
            Self {
                id,
                name: name.into(),
                level: 1,
                gold: 0,
            }
        }
    }

    impl Entity for Player {
        type Id = u64;

        fn id(&self) -> u64 {
            self.id
        }

        fn new_with_id(id: u64) -> Self {
            Self::new(id, "")
        }
    }

    /// Versioned entity keyed by UUID.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Account {
        pub id: Uuid,
        pub owner: String,
        pub balance: i64,
        pub version: i64,
    }

    impl Account {
        pub fn new(id: Uuid, owner: impl Into<String>) -> Self {
            Self {
                id,
                owner: owner.into(),
                balance: 0,
                version: 0,
            }
        }

        pub fn with_version(mut self, version: i64) -> Self {
            self.version = version;
            self
        }
    }

    impl Entity for Account {
        type Id = Uuid;

        const VERSIONED: bool = true;

        fn id(&self) -> Uuid {
            self.id
        }

        fn new_with_id(id: Uuid) -> Self {
            Self::new(id, "")
        }

        fn version(&self) -> i64 {
            self.version
        }

        fn set_version(&mut self, version: i64) {
            self.version = version;
        }
    }
}

pub use entities::{Account, Player};

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for BURROW types.

    use super::*;
    use proptest::prelude::*;
    use uuid::Uuid;

    /// Generate a player id from a small key space, so collisions happen.
    pub fn arb_player_id() -> impl Strategy<Value = u64> {
        0u64..64
    }

    pub fn arb_uuid() -> impl Strategy<Value = Uuid> {
        any::<u128>().prop_map(Uuid::from_u128)
    }

    pub fn arb_player() -> impl Strategy<Value = Player> {
        (arb_player_id(), "[a-z]{1,12}", 1u32..100, -1_000i64..1_000).prop_map(
            |(id, name, level, gold)| Player {
                id,
                name,
                level,
                gold,
            },
        )
    }

    pub fn arb_account() -> impl Strategy<Value = Account> {
        (arb_uuid(), "[a-z]{1,12}", any::<i32>(), 0i64..1_000).prop_map(
            |(id, owner, balance, version)| Account {
                id,
                owner,
                balance: balance as i64,
                version,
            },
        )
    }

    /// Generate a valid entity cache configuration with small bounds.
    pub fn arb_entity_cache_config() -> impl Strategy<Value = EntityCacheConfig> {
        (1usize..64, 1usize..16, any::<bool>()).prop_map(|(capacity, page_size, thread_safe)| {
            EntityCacheConfig::new()
                .with_capacity(capacity)
                .with_page_size(page_size)
                .with_thread_safe(thread_safe)
        })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for common testing scenarios.

    use super::*;
    use tracing_subscriber::EnvFilter;

    /// Install a test-friendly subscriber honoring `RUST_LOG`. Safe to call
    /// from every test.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    }

    /// A small lane pool for one test.
    pub fn test_lanes() -> Arc<LanePool> {
        Arc::new(
            LanePool::new(
                LanePoolConfig::default()
                    .with_parallelism(2)
                    .with_thread_name_prefix("test-lane"),
            )
            .expect("lane pool"),
        )
    }

    /// A store holding one player per id, each named "stored".
    pub fn player_store(ids: impl IntoIterator<Item = u64>) -> Arc<MockDocumentStore<Player>> {
        Arc::new(MockDocumentStore::with_documents(
            ids.into_iter().map(|id| Player::new(id, "stored")),
        ))
    }

    pub fn player_cache(
        config: EntityCacheConfig,
        store: &Arc<MockDocumentStore<Player>>,
        lanes: &Arc<LanePool>,
    ) -> EntityCache<Player> {
        EntityCache::new(config, store.clone(), store.clone(), Arc::clone(lanes))
            .expect("player cache")
    }

    pub fn account_cache(
        config: EntityCacheConfig,
        store: &Arc<MockDocumentStore<Account>>,
        lanes: &Arc<LanePool>,
    ) -> EntityCache<Account> {
        EntityCache::new(config, store.clone(), store.clone(), Arc::clone(lanes))
            .expect("account cache")
    }

    /// Poll `condition` every 10ms until it holds or `timeout` passes.
    pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition()
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Custom assertion functions for BURROW-specific validation.

    use super::*;

    /// Assert that two handles are the same cached instance.
    #[track_caller]
    pub fn assert_same_instance<E>(a: &EntityRef<E>, b: &EntityRef<E>) {
        assert!(Arc::ptr_eq(a, b), "Expected the same cached instance");
    }

    /// Assert that a BurrowResult is an identity mismatch.
    #[track_caller]
    pub fn assert_identity_mismatch<T: std::fmt::Debug>(result: &BurrowResult<T>) {
        match result {
            Err(BurrowError::Cache(CacheError::IdentityMismatch { .. })) => {}
            other => panic!("Expected IdentityMismatch error, got: {:?}", other),
        }
    }

    /// Assert that a BurrowResult is a Config error.
    #[track_caller]
    pub fn assert_config_error<T: std::fmt::Debug>(result: &BurrowResult<T>) {
        match result {
            Err(BurrowError::Config(_)) => {}
            other => panic!("Expected Config error, got: {:?}", other),
        }
    }

    /// Assert that the stored document matches the cached entity.
    #[track_caller]
    pub fn assert_persisted<E>(store: &MockDocumentStore<E>, cached: &EntityRef<E>)
    where
        E: Entity + PartialEq + std::fmt::Debug,
    {
        let cached = read_entity(cached).clone();
        assert_eq!(store.document(&cached.id()).as_ref(), Some(&cached));
    }
}
