//! Startup registry of entity caches.
//!
//! Caches are registered once, up front, and looked up by entity type.
//! Shutdown flushes every cache before stopping the lanes.

use std::any::{Any, TypeId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use burrow_core::{BurrowConfig, BurrowResult, CacheError};
use burrow_lanes::LanePool;
use tracing::{info, warn};

use crate::cache::{EntityCache, PersistReport};
use crate::traits::{Accessor, Collection, Entity};

/// Type-erased view of an [`EntityCache`].
#[async_trait]
pub trait ManagedCache: Send + Sync {
    fn type_name(&self) -> &'static str;

    fn size(&self) -> usize;

    fn persist_all(&self);

    async fn persist_all_block(&self) -> PersistReport;

    fn as_any(&self) -> &dyn Any;
}

#[async_trait]
impl<E: Entity> ManagedCache for EntityCache<E> {
    fn type_name(&self) -> &'static str {
        EntityCache::type_name(self)
    }

    fn size(&self) -> usize {
        EntityCache::size(self)
    }

    fn persist_all(&self) {
        EntityCache::persist_all(self)
    }

    async fn persist_all_block(&self) -> PersistReport {
        EntityCache::persist_all_block(self).await
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Every entity cache in the process, sharing one lane pool.
pub struct CacheRegistry {
    config: BurrowConfig,
    lanes: Arc<LanePool>,
    caches: RwLock<Vec<(TypeId, Arc<dyn ManagedCache>)>>,
    closed: AtomicBool,
}

impl CacheRegistry {
    /// Create the registry and its lane pool from `config`.
    pub fn new(config: BurrowConfig) -> BurrowResult<Self> {
        config.validate()?;
        let lanes = Arc::new(LanePool::new(config.lanes.clone())?);
        Ok(Self::with_lanes(config, lanes))
    }

    /// Create the registry on an existing lane pool.
    pub fn with_lanes(config: BurrowConfig, lanes: Arc<LanePool>) -> Self {
        Self {
            config,
            lanes,
            caches: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn lanes(&self) -> &Arc<LanePool> {
        &self.lanes
    }

    /// Build and register the cache for `E`, configured from the
    /// `[entities.<TypeName>]` section. Registering a type twice returns the
    /// existing cache.
    pub fn register<E: Entity>(
        &self,
        accessor: Arc<dyn Accessor<E>>,
        collection: Arc<dyn Collection<E>>,
    ) -> BurrowResult<EntityCache<E>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::Closed {
                entity_type: burrow_core::short_type_name(std::any::type_name::<E>()).to_string(),
            }
            .into());
        }

        let mut caches = self.caches.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = find::<E>(&caches) {
            warn!(entity_type = existing.type_name(), "Entity cache already registered");
            return Ok(existing);
        }

        let name = burrow_core::short_type_name(std::any::type_name::<E>());
        let cache = EntityCache::new(
            self.config.entity(name),
            accessor,
            collection,
            Arc::clone(&self.lanes),
        )?;
        caches.push((TypeId::of::<E>(), Arc::new(cache.clone())));
        Ok(cache)
    }

    /// The registered cache for `E`.
    pub fn get<E: Entity>(&self) -> Option<EntityCache<E>> {
        let caches = self.caches.read().unwrap_or_else(|e| e.into_inner());
        find::<E>(&caches)
    }

    /// Short type names of every registered cache, in registration order.
    pub fn type_names(&self) -> Vec<&'static str> {
        self.snapshot().iter().map(|c| c.type_name()).collect()
    }

    /// Queue a flush of every cache.
    pub fn persist_all(&self) {
        for cache in self.snapshot() {
            cache.persist_all();
        }
    }

    /// Flush every cache and wait for the writes.
    pub async fn persist_all_block(&self) -> PersistReport {
        let mut report = PersistReport::default();
        for cache in self.snapshot() {
            report += cache.persist_all_block().await;
        }
        report
    }

    /// Flush every cache, then stop the lanes and the scheduler.
    ///
    /// Only the first call does anything. Call it from outside the lane
    /// pool; joining the lanes blocks the calling thread.
    pub async fn shutdown(&self) -> PersistReport {
        if self.closed.swap(true, Ordering::AcqRel) {
            return PersistReport::default();
        }
        let caches = self.snapshot();
        info!(caches = caches.len(), "Flushing entity caches before shutdown");

        let mut report = PersistReport::default();
        for cache in &caches {
            let flushed = cache.persist_all_block().await;
            if flushed.failed > 0 {
                warn!(
                    entity_type = cache.type_name(),
                    failed = flushed.failed,
                    "Entities still dirty at shutdown"
                );
            }
            report += flushed;
        }
        self.lanes.shutdown();
        info!(
            written = report.written,
            reconciled = report.reconciled,
            dropped = report.dropped,
            failed = report.failed,
            "Entity caches shut down"
        );
        report
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn snapshot(&self) -> Vec<Arc<dyn ManagedCache>> {
        self.caches
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cache)| Arc::clone(cache))
            .collect()
    }
}

fn find<E: Entity>(caches: &[(TypeId, Arc<dyn ManagedCache>)]) -> Option<EntityCache<E>> {
    caches
        .iter()
        .find(|(id, _)| *id == TypeId::of::<E>())
        .and_then(|(_, cache)| cache.as_any().downcast_ref::<EntityCache<E>>().cloned())
}

impl std::fmt::Debug for CacheRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheRegistry")
            .field("caches", &self.type_names())
            .field("closed", &self.is_closed())
            .finish()
    }
}
