//! Background persistence strategies.

use std::ops::ControlFlow;
use std::sync::Arc;

use burrow_core::PersisterStrategy;
use tracing::debug;

use super::entity_cache::Shared;
use crate::traits::Entity;

/// Start the configured strategy for a freshly built cache.
///
/// The timer holds only a weak reference; it stops on the first tick after
/// the cache is dropped.
pub(super) fn start<E: Entity>(shared: &Arc<Shared<E>>) {
    match shared.config.persister {
        PersisterStrategy::Manual => {
            debug!(entity_type = shared.type_name, "Manual persistence");
        }
        PersisterStrategy::Interval { period } => {
            debug!(
                entity_type = shared.type_name,
                period_ms = period.as_millis() as u64,
                "Interval persistence"
            );
            let weak = Arc::downgrade(shared);
            shared
                .lanes
                .scheduler()
                .schedule_repeating(period, move || match weak.upgrade() {
                    Some(shared) => {
                        shared.persist_all();
                        ControlFlow::Continue(())
                    }
                    None => ControlFlow::Break(()),
                });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EntityCache;
    use crate::mock::MockDocumentStore;
    use crate::test_entities::Player;
    use crate::traits::write_entity;
    use burrow_core::{EntityCacheConfig, LanePoolConfig};
    use burrow_lanes::LanePool;
    use std::time::Duration;

    #[tokio::test]
    async fn test_interval_timer_does_not_outlive_cache() {
        let lanes = Arc::new(
            LanePool::new(LanePoolConfig::default().with_parallelism(2)).unwrap(),
        );
        let store = Arc::new(MockDocumentStore::with_documents([Player::new(1, "stored")]));
        let config = EntityCacheConfig::default().with_persister(PersisterStrategy::Interval {
            period: Duration::from_millis(20),
        });
        let cache =
            EntityCache::new(config, store.clone(), store.clone(), Arc::clone(&lanes)).unwrap();

        let player = cache.load(&1).await.unwrap().unwrap();
        write_entity(&player).name = "dropped".to_string();
        cache.update(&player).unwrap();
        drop(cache);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(store.write_count(), 0);
        assert_eq!(store.document(&1).unwrap().name, "stored");
        lanes.shutdown();
    }

    #[tokio::test]
    async fn test_manual_strategy_leaves_dirty_entries_alone() {
        let lanes = Arc::new(
            LanePool::new(LanePoolConfig::default().with_parallelism(2)).unwrap(),
        );
        let store = Arc::new(MockDocumentStore::with_documents([Player::new(1, "stored")]));
        let cache = EntityCache::new(
            EntityCacheConfig::default(),
            store.clone(),
            store.clone(),
            Arc::clone(&lanes),
        )
        .unwrap();

        let player = cache.load(&1).await.unwrap().unwrap();
        write_entity(&player).level = 7;
        cache.update(&player).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cache.dirty_count(), 1);
        assert_eq!(store.write_count(), 0);
        lanes.shutdown();
    }
}
