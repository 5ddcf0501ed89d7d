//! Write-back entity cache.
//!
//! Loads go through the cache, mutations only mark entries dirty, and dirty
//! entries reach the backing store in batches: on eviction, on
//! `persist_all`, or on an explicit `persist`. Background batches run on
//! lanes and blocking flushes run on the caller. Every batch for one entity
//! type holds the type's persist lock while it writes, so two batches for
//! the same type never race each other, and evicted batches are written
//! before whatever batch takes the lock next.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock, Weak};
use std::thread::ThreadId;

use burrow_core::{
    short_type_name, type_hash, BurrowResult, CacheError, EntityCacheConfig,
};
use burrow_lanes::LanePool;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::bounded::{BoundedCache, CacheStats, RemovalCause, RemovalListener};
use super::entry::CacheEntry;
use super::persist::{PersistMode, PersistReport};
use super::persister;
use crate::traits::{read_entity, Accessor, Collection, Entity, EntityRef};

/// A key and its entry, queued for persistence.
pub(super) type Pending<E> = (<E as Entity>::Id, Arc<CacheEntry<E>>);

/// Persistence counters for one entity type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityCacheStats {
    pub cache: CacheStats,
    /// Entities confirmed written by a batch or reconciliation.
    pub persisted: u64,
    /// Entities left dirty after a failed write.
    pub write_failures: u64,
    /// Entities written directly after a version mismatch.
    pub reconciled: u64,
    /// Entities dropped because the backing store was ahead or empty.
    pub dropped: u64,
    /// Checked updates from a thread other than the entry's first writer.
    pub concurrent_writes: u64,
}

#[derive(Debug, Default)]
pub(super) struct PersistCounters {
    persisted: AtomicU64,
    write_failures: AtomicU64,
    reconciled: AtomicU64,
    dropped: AtomicU64,
    concurrent_writes: AtomicU64,
}

impl PersistCounters {
    pub(super) fn record(&self, report: &PersistReport) {
        self.persisted
            .fetch_add((report.written + report.reconciled) as u64, Ordering::Relaxed);
        self.write_failures
            .fetch_add(report.failed as u64, Ordering::Relaxed);
        self.reconciled
            .fetch_add(report.reconciled as u64, Ordering::Relaxed);
        self.dropped.fetch_add(report.dropped as u64, Ordering::Relaxed);
    }
}

pub(super) struct Shared<E: Entity> {
    pub(super) type_name: &'static str,
    pub(super) type_hash: i64,
    pub(super) config: EntityCacheConfig,
    pub(super) mode: PersistMode,
    pub(super) cache: BoundedCache<E::Id, Arc<CacheEntry<E>>>,
    pub(super) accessor: Arc<dyn Accessor<E>>,
    pub(super) collection: Arc<dyn Collection<E>>,
    pub(super) lanes: Arc<LanePool>,
    pub(super) counters: PersistCounters,
    /// Held across every `do_persist` for this type.
    pub(super) persist_lock: Mutex<()>,
    /// Evicted dirty batches not yet written, oldest first.
    pub(super) evicted: StdMutex<VecDeque<Vec<Pending<E>>>>,
}

/// Write-back cache for one entity type. Clones share the same cache.
pub struct EntityCache<E: Entity> {
    shared: Arc<Shared<E>>,
}

impl<E: Entity> Clone for EntityCache<E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<E: Entity> EntityCache<E> {
    /// Build the cache, start its TTL sweeper and, if configured, its
    /// periodic persister.
    pub fn new(
        config: EntityCacheConfig,
        accessor: Arc<dyn Accessor<E>>,
        collection: Arc<dyn Collection<E>>,
        lanes: Arc<LanePool>,
    ) -> BurrowResult<Self> {
        config.validate()?;
        let full_name = std::any::type_name::<E>();

        let shared = Arc::new_cyclic(|weak: &Weak<Shared<E>>| {
            let weak = weak.clone();
            let listener: RemovalListener<E::Id, Arc<CacheEntry<E>>> =
                Arc::new(move |removed, cause| {
                    if let Some(shared) = weak.upgrade() {
                        shared.on_removal(removed, cause);
                    }
                });
            Shared {
                type_name: short_type_name(full_name),
                type_hash: type_hash(full_name),
                cache: BoundedCache::new(config.capacity, config.ttl, listener),
                mode: PersistMode::of::<E>(),
                config,
                accessor,
                collection,
                lanes,
                counters: PersistCounters::default(),
                persist_lock: Mutex::new(()),
                evicted: StdMutex::new(VecDeque::new()),
            }
        });

        shared
            .cache
            .spawn_sweeper(shared.lanes.scheduler(), shared.config.effective_sweep_interval());
        persister::start(&shared);

        info!(
            entity_type = shared.type_name,
            capacity = shared.config.capacity,
            ttl_ms = shared.config.ttl.as_millis() as u64,
            thread_safe = shared.config.thread_safe,
            mode = ?shared.mode,
            lane = shared.lanes.lane_of(shared.type_hash),
            "Entity cache started"
        );
        Ok(Self { shared })
    }

    /// Short name of the entity type, as used in logs and configuration.
    pub fn type_name(&self) -> &'static str {
        self.shared.type_name
    }

    pub fn config(&self) -> &EntityCacheConfig {
        &self.shared.config
    }

    pub fn mode(&self) -> PersistMode {
        self.shared.mode
    }

    pub fn lanes(&self) -> &Arc<LanePool> {
        &self.shared.lanes
    }

    /// Cached entity for `id`, loading it on a miss.
    ///
    /// A key the backing store does not have is cached as absent, so later
    /// loads return `None` without another round-trip.
    pub async fn load(&self, id: &E::Id) -> BurrowResult<Option<EntityRef<E>>> {
        let shared = &self.shared;
        if let Some(entry) = shared.cache.get(id) {
            return Ok(entry.entity().cloned());
        }

        let loaded = shared.accessor.load(id).await?;
        if loaded.is_none() {
            warn!(
                entity_type = shared.type_name,
                id = ?id,
                "No document for key, caching absence"
            );
        }
        let entry = Arc::new(CacheEntry::new(loaded.map(|e| Arc::new(RwLock::new(e)))));
        let entry = shared.cache.put_if_absent(id.clone(), entry);
        Ok(entry.entity().cloned())
    }

    /// Like [`load`](Self::load), but inserts `E::new_with_id(id)` into the
    /// backing store and caches it when no document exists.
    pub async fn load_or_create(&self, id: &E::Id) -> BurrowResult<EntityRef<E>> {
        let shared = &self.shared;
        if let Some(entity) = shared.cache.get(id).and_then(|e| e.entity().cloned()) {
            return Ok(entity);
        }

        let entity = match shared.accessor.load(id).await? {
            Some(existing) => existing,
            None => {
                let created = E::new_with_id(id.clone());
                shared.accessor.insert(&created).await?;
                debug!(entity_type = shared.type_name, id = ?id, "Inserted default document");
                created
            }
        };
        let fresh = Arc::new(CacheEntry::new(Some(Arc::new(RwLock::new(entity)))));
        let entry = shared
            .cache
            .put_unless(id.clone(), fresh, |resident| !resident.is_absent());
        match entry.entity() {
            Some(entity) => Ok(Arc::clone(entity)),
            None => Err(CacheError::IdentityMismatch {
                entity_type: shared.type_name.to_string(),
                id: format!("{id:?}"),
            }
            .into()),
        }
    }

    /// Cached entity for `id` without touching the backing store.
    pub fn get(&self, id: &E::Id) -> Option<EntityRef<E>> {
        self.shared.cache.get(id).and_then(|e| e.entity().cloned())
    }

    /// Mark `entity` dirty.
    ///
    /// `entity` must be the instance the cache holds for its id; if the key
    /// is not resident, `entity` becomes the cached instance. A checked
    /// update from a thread other than the entry's first writer is logged
    /// unless the type is configured thread-safe.
    pub fn update(&self, entity: &EntityRef<E>) -> BurrowResult<()> {
        let (id, entry) = self.shared.entry_for(entity)?;
        self.shared.check_affinity(&id, &entry);
        entry.mark_modified();
        Ok(())
    }

    /// [`update`](Self::update) without thread-affinity bookkeeping.
    pub fn update_unsafe(&self, entity: &EntityRef<E>) -> BurrowResult<()> {
        let (_, entry) = self.shared.entry_for(entity)?;
        entry.mark_modified();
        Ok(())
    }

    /// Write `entity` to the backing store now, bypassing batching.
    pub async fn update_now(&self, entity: &EntityRef<E>) -> BurrowResult<()> {
        let (id, entry) = self.shared.entry_for(entity)?;
        self.shared.check_affinity(&id, &entry);
        self.shared.write_through(&entry, entity).await
    }

    /// [`update_now`](Self::update_now) without thread-affinity bookkeeping.
    pub async fn update_unsafe_now(&self, entity: &EntityRef<E>) -> BurrowResult<()> {
        let (_, entry) = self.shared.entry_for(entity)?;
        self.shared.write_through(&entry, entity).await
    }

    /// Drop `id` from the cache without persisting it.
    pub fn invalidate(&self, id: &E::Id) {
        if self.shared.cache.remove(id).is_some() {
            debug!(entity_type = self.shared.type_name, id = ?id, "Invalidated");
        }
    }

    /// Flush `id` if it is dirty, waiting for the write to finish.
    pub async fn persist(&self, id: &E::Id) -> PersistReport {
        let Some(entry) = self.shared.cache.peek(id) else {
            return PersistReport::default();
        };
        if !entry.is_dirty() {
            return PersistReport::default();
        }
        self.shared.do_persist(vec![(id.clone(), entry)]).await
    }

    /// Queue every dirty entry for persistence and return immediately.
    ///
    /// For types that are not thread-safe, entries are grouped by the
    /// thread that first modified them. Groups owned by a lane are flushed
    /// on that lane, one stagger interval apart; the rest go to the type's
    /// own lane.
    pub fn persist_all(&self) {
        self.shared.persist_all();
    }

    /// Flush every dirty entry, waiting for the writes to finish.
    pub async fn persist_all_block(&self) -> PersistReport {
        self.shared.persist_dirty_snapshot().await
    }

    /// Visit a snapshot of every resident key. Keys cached as absent are
    /// passed with `None`.
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&E::Id, Option<&EntityRef<E>>),
    {
        self.shared
            .cache
            .for_each(|id, entry| visitor(id, entry.entity()));
    }

    /// Number of resident keys, absent markers included.
    pub fn size(&self) -> usize {
        self.shared.cache.len()
    }

    /// Number of resident entries waiting to be written.
    pub fn dirty_count(&self) -> usize {
        let mut dirty = 0;
        self.shared.cache.for_each(|_, entry| {
            if entry.is_dirty() {
                dirty += 1;
            }
        });
        dirty
    }

    /// Run the TTL sweep now instead of waiting for the sweeper.
    pub fn sweep_expired(&self) -> usize {
        self.shared.cache.sweep_expired()
    }

    pub fn stats(&self) -> EntityCacheStats {
        let c = &self.shared.counters;
        EntityCacheStats {
            cache: self.shared.cache.stats(),
            persisted: c.persisted.load(Ordering::Relaxed),
            write_failures: c.write_failures.load(Ordering::Relaxed),
            reconciled: c.reconciled.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            concurrent_writes: c.concurrent_writes.load(Ordering::Relaxed),
        }
    }
}

impl<E: Entity> std::fmt::Debug for EntityCache<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityCache")
            .field("type_name", &self.shared.type_name)
            .field("mode", &self.shared.mode)
            .field("cache", &self.shared.cache)
            .finish()
    }
}

impl<E: Entity> Shared<E> {
    /// Resolve the cached entry for `entity`, installing it on a miss.
    fn entry_for(&self, entity: &EntityRef<E>) -> BurrowResult<Pending<E>> {
        let id = read_entity(entity).id();
        let entry = match self.cache.peek(&id) {
            Some(entry) => entry,
            None => self.cache.put_if_absent(
                id.clone(),
                Arc::new(CacheEntry::new(Some(Arc::clone(entity)))),
            ),
        };
        match entry.entity() {
            Some(cached) if Arc::ptr_eq(cached, entity) => Ok((id, entry)),
            _ => Err(CacheError::IdentityMismatch {
                entity_type: self.type_name.to_string(),
                id: format!("{id:?}"),
            }
            .into()),
        }
    }

    fn check_affinity(&self, id: &E::Id, entry: &CacheEntry<E>) {
        let Err(owner) = entry.claim_owner() else {
            return;
        };
        if self.config.thread_safe {
            return;
        }
        self.counters
            .concurrent_writes
            .fetch_add(1, Ordering::Relaxed);
        let current = std::thread::current();
        warn!(
            entity_type = self.type_name,
            id = ?id,
            first_writer = ?owner.id,
            first_writer_name = owner.name.as_deref().unwrap_or("<unnamed>"),
            writer = ?current.id(),
            writer_name = current.name().unwrap_or("<unnamed>"),
            "Entity modified from a second thread"
        );
    }

    async fn write_through(&self, entry: &CacheEntry<E>, entity: &EntityRef<E>) -> BurrowResult<()> {
        let observed = entry.modified_time();
        let snapshot = read_entity(entity).clone();
        self.accessor.update(&snapshot).await?;
        entry.mark_persisted(observed);
        Ok(())
    }

    fn on_removal(self: Arc<Self>, removed: Vec<Pending<E>>, cause: RemovalCause) {
        if !cause.was_evicted() {
            return;
        }
        let dirty: Vec<Pending<E>> = removed.into_iter().filter(|(_, e)| e.is_dirty()).collect();
        if dirty.is_empty() {
            return;
        }
        debug!(
            entity_type = self.type_name,
            count = dirty.len(),
            ?cause,
            "Persisting evicted entries"
        );
        self.evicted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(dirty);
        let job = Arc::clone(&self);
        self.submit_to_type_lane(async move {
            job.do_persist(Vec::new()).await;
        });
    }

    pub(super) fn persist_all(self: &Arc<Self>) {
        if self.config.thread_safe {
            let job = Arc::clone(self);
            self.submit_to_type_lane(async move {
                job.persist_dirty_snapshot().await;
            });
            return;
        }

        let mut groups: HashMap<Option<ThreadId>, Vec<Pending<E>>> = HashMap::new();
        self.cache.for_each(|id, entry| {
            if entry.is_dirty() {
                groups
                    .entry(entry.owner().map(|o| o.id))
                    .or_default()
                    .push((id.clone(), Arc::clone(entry)));
            }
        });

        let mut staggered = 0u32;
        for (owner, batch) in groups {
            let Some(lane) = owner.and_then(|t| self.lanes.lane_of_thread(t)) else {
                let job = Arc::clone(self);
                self.submit_to_type_lane(async move {
                    job.do_persist(batch).await;
                });
                continue;
            };

            let delay = self.config.stagger.saturating_mul(staggered);
            staggered = staggered.saturating_add(1);
            let job = Arc::clone(self);
            self.lanes.scheduler().schedule(delay, move || {
                let lanes = Arc::clone(&job.lanes);
                let type_name = job.type_name;
                let queued = lanes.submit_to_lane(lane, async move {
                    job.do_persist(batch).await;
                });
                if let Err(e) = queued {
                    error!(entity_type = type_name, lane, error = %e, "Failed to queue persistence batch");
                }
            });
        }
    }

    fn submit_to_type_lane<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Err(e) = self.lanes.submit(self.type_hash, job) {
            error!(entity_type = self.type_name, error = %e, "Failed to queue persistence batch");
        }
    }
}
