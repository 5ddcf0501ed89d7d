//! Batched write-back of dirty entries.
//!
//! Dirty entries are written in pages of `page_size` with one unordered
//! bulk replace per page. Versioned types replace with a key-and-version
//! filter and fall back to per-entity reconciliation when fewer documents
//! matched than were sent.

use std::collections::HashMap;
use std::ops::AddAssign;
use std::sync::Arc;

use burrow_core::Millis;
use tracing::{debug, error, warn};

use super::entity_cache::{Pending, Shared};
use super::entry::CacheEntry;
use crate::traits::{
    read_entity, write_entity, BulkWriteOptions, Entity, EntityRef, ReplaceFilter, ReplaceOne,
};

/// How a type's batches are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistMode {
    /// Replace by key.
    Plain,
    /// Replace by key and version, bumping the version on every write.
    Versioned,
}

impl PersistMode {
    pub fn of<E: Entity>() -> Self {
        if E::VERSIONED {
            PersistMode::Versioned
        } else {
            PersistMode::Plain
        }
    }
}

/// What a persistence pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistReport {
    /// Entities confirmed written by a bulk replace.
    pub written: usize,
    /// Entities written directly after a version mismatch.
    pub reconciled: usize,
    /// Entities removed from the cache because the backing store was ahead
    /// or no longer had the document.
    pub dropped: usize,
    /// Entities left dirty after a write error.
    pub failed: usize,
}

impl PersistReport {
    pub fn total(&self) -> usize {
        self.written + self.reconciled + self.dropped + self.failed
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

impl AddAssign for PersistReport {
    fn add_assign(&mut self, rhs: Self) {
        self.written += rhs.written;
        self.reconciled += rhs.reconciled;
        self.dropped += rhs.dropped;
        self.failed += rhs.failed;
    }
}

/// An entity staged in a versioned page.
struct Staged<'a, E: Entity> {
    id: &'a E::Id,
    entry: &'a Arc<CacheEntry<E>>,
    entity: &'a EntityRef<E>,
    observed: Millis,
    /// Version the filter expected; the replacement carries `previous + 1`.
    previous: i64,
}

impl<E: Entity> Shared<E> {
    pub(super) async fn persist_dirty_snapshot(&self) -> PersistReport {
        let mut dirty = Vec::new();
        self.cache.for_each(|id, entry| {
            if entry.is_dirty() {
                dirty.push((id.clone(), Arc::clone(entry)));
            }
        });
        self.do_persist(dirty).await
    }

    /// Write every entry of `batch` that is still dirty.
    ///
    /// Waits for any other batch of this type to finish first, so the
    /// dirty filter and version bumps always see the previous batch's
    /// outcome. Evicted batches still queued are written before `batch`.
    pub(super) async fn do_persist(&self, batch: Vec<Pending<E>>) -> PersistReport {
        let _serial = self.persist_lock.lock().await;
        let mut report = PersistReport::default();
        while let Some(evicted) = self.next_evicted() {
            report += self.write_batch(evicted).await;
        }
        report += self.write_batch(batch).await;
        report
    }

    fn next_evicted(&self) -> Option<Vec<Pending<E>>> {
        self.evicted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    async fn write_batch(&self, batch: Vec<Pending<E>>) -> PersistReport {
        let dirty: Vec<Pending<E>> = batch.into_iter().filter(|(_, e)| e.is_dirty()).collect();
        let mut report = PersistReport::default();
        if dirty.is_empty() {
            return report;
        }

        for page in dirty.chunks(self.config.page_size.max(1)) {
            report += match self.mode {
                PersistMode::Plain => self.write_plain(page).await,
                PersistMode::Versioned => self.write_versioned(page).await,
            };
        }
        self.counters.record(&report);
        debug!(
            entity_type = self.type_name,
            written = report.written,
            reconciled = report.reconciled,
            dropped = report.dropped,
            failed = report.failed,
            "Persisted batch"
        );
        report
    }

    async fn write_plain(&self, page: &[Pending<E>]) -> PersistReport {
        let mut observed = Vec::with_capacity(page.len());
        let mut models = Vec::with_capacity(page.len());
        for (id, entry) in page {
            let Some(entity) = entry.entity() else {
                continue;
            };
            observed.push((entry, entry.modified_time()));
            let replacement = read_entity(entity).clone();
            models.push(ReplaceOne {
                filter: ReplaceFilter::ById(id.clone()),
                replacement,
            });
        }

        let count = models.len();
        match self
            .collection
            .bulk_replace(models, BulkWriteOptions::unordered())
            .await
        {
            Ok(result) => {
                for (entry, at) in observed {
                    entry.mark_persisted(at);
                }
                if result.matched_count != count {
                    warn!(
                        entity_type = self.type_name,
                        expected = count,
                        matched = result.matched_count,
                        "Bulk replace matched fewer documents than were written"
                    );
                }
                PersistReport {
                    written: count,
                    ..Default::default()
                }
            }
            Err(e) => {
                error!(
                    entity_type = self.type_name,
                    count,
                    error = %e,
                    "Bulk replace failed, entries stay dirty"
                );
                PersistReport {
                    failed: count,
                    ..Default::default()
                }
            }
        }
    }

    async fn write_versioned(&self, page: &[Pending<E>]) -> PersistReport {
        let mut staged = Vec::with_capacity(page.len());
        let mut models = Vec::with_capacity(page.len());
        for (id, entry) in page {
            let Some(entity) = entry.entity() else {
                continue;
            };
            let observed = entry.modified_time();
            let (previous, replacement) = {
                let mut guard = write_entity(entity);
                let previous = guard.version();
                guard.set_version(previous + 1);
                (previous, guard.clone())
            };
            models.push(ReplaceOne {
                filter: ReplaceFilter::ByIdAndVersion {
                    id: id.clone(),
                    version: previous,
                },
                replacement,
            });
            staged.push(Staged {
                id,
                entry,
                entity,
                observed,
                previous,
            });
        }

        let count = models.len();
        match self
            .collection
            .bulk_replace(models, BulkWriteOptions::unordered())
            .await
        {
            Ok(result) if result.matched_count == count => {
                for s in &staged {
                    s.entry.mark_persisted(s.observed);
                }
                PersistReport {
                    written: count,
                    ..Default::default()
                }
            }
            Ok(result) => {
                warn!(
                    entity_type = self.type_name,
                    expected = count,
                    matched = result.matched_count,
                    "Version-checked replace partially matched, reconciling"
                );
                self.reconcile(&staged).await
            }
            Err(e) => {
                error!(
                    entity_type = self.type_name,
                    count,
                    error = %e,
                    "Version-checked bulk replace failed, entries stay dirty"
                );
                PersistReport {
                    failed: count,
                    ..Default::default()
                }
            }
        }
    }

    /// Settle each staged entity against what the backing store holds.
    ///
    /// - missing document: drop the cached entry
    /// - backing at the filter version or the written one: consistent
    /// - backing past the written version: drop the cached entry, no write
    /// - backing behind the filter version: write the entity directly
    async fn reconcile(&self, staged: &[Staged<'_, E>]) -> PersistReport {
        let mut report = PersistReport::default();
        let ids: Vec<E::Id> = staged.iter().map(|s| s.id.clone()).collect();
        let backing: HashMap<E::Id, i64> = match self.collection.find_by_ids(&ids).await {
            Ok(documents) => documents.into_iter().map(|d| (d.id(), d.version())).collect(),
            Err(e) => {
                error!(
                    entity_type = self.type_name,
                    count = staged.len(),
                    error = %e,
                    "Failed to read back documents for reconciliation, entries stay dirty"
                );
                report.failed = staged.len();
                return report;
            }
        };

        for s in staged {
            let written = s.previous + 1;
            match backing.get(s.id).copied() {
                None => {
                    warn!(
                        entity_type = self.type_name,
                        id = ?s.id,
                        "Document missing from backing store, dropping cached entry"
                    );
                    self.drop_entry(s);
                    report.dropped += 1;
                }
                Some(version) if version == s.previous || version == written => {
                    s.entry.mark_persisted(s.observed);
                    report.written += 1;
                }
                Some(version) if version > written => {
                    warn!(
                        entity_type = self.type_name,
                        id = ?s.id,
                        backing_version = version,
                        cache_version = s.previous,
                        "Backing store is ahead of cache, dropping cached entry"
                    );
                    self.drop_entry(s);
                    report.dropped += 1;
                }
                Some(version) => {
                    debug!(
                        entity_type = self.type_name,
                        id = ?s.id,
                        backing_version = version,
                        cache_version = s.previous,
                        "Backing store is behind cache, writing directly"
                    );
                    let snapshot = read_entity(s.entity).clone();
                    match self.accessor.update(&snapshot).await {
                        Ok(()) => {
                            s.entry.mark_persisted(s.observed);
                            report.reconciled += 1;
                        }
                        Err(e) => {
                            error!(
                                entity_type = self.type_name,
                                id = ?s.id,
                                error = %e,
                                "Direct update during reconciliation failed"
                            );
                            report.failed += 1;
                        }
                    }
                }
            }
        }
        report
    }

    /// Remove the staged entry, unless the key has since been re-cached.
    fn drop_entry(&self, s: &Staged<'_, E>) {
        self.cache
            .remove_if(s.id, |resident| Arc::ptr_eq(resident, s.entry));
    }
}
