//! In-memory document store for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use burrow_core::{short_type_name, BurrowResult, StorageError};

use crate::traits::{
    Accessor, BulkWriteOptions, BulkWriteResult, Collection, Entity, ReplaceFilter, ReplaceOne,
};

/// In-memory mock backing store for one entity type.
///
/// Implements both [`Accessor`] and [`Collection`], counts every call, and
/// can be told to fail writes. `update` upserts.
#[derive(Debug)]
pub struct MockDocumentStore<E: Entity> {
    documents: RwLock<HashMap<E::Id, E>>,
    loads: AtomicUsize,
    inserts: AtomicUsize,
    updates: AtomicUsize,
    bulk_writes: AtomicUsize,
    replaced: AtomicUsize,
    finds: AtomicUsize,
    fail_writes: AtomicBool,
}

impl<E: Entity> Default for MockDocumentStore<E> {
    fn default() -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            loads: AtomicUsize::new(0),
            inserts: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
            bulk_writes: AtomicUsize::new(0),
            replaced: AtomicUsize::new(0),
            finds: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
        }
    }
}

impl<E: Entity> MockDocumentStore<E> {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with `documents`.
    pub fn with_documents(documents: impl IntoIterator<Item = E>) -> Self {
        let store = Self::new();
        for doc in documents {
            store.put_document(doc);
        }
        store
    }

    /// Write a document directly, as another process would.
    pub fn put_document(&self, doc: E) {
        self.write_docs().insert(doc.id(), doc);
    }

    /// Delete a document directly, as another process would.
    pub fn remove_document(&self, id: &E::Id) -> Option<E> {
        self.write_docs().remove(id)
    }

    /// Current stored copy of `id`.
    pub fn document(&self, id: &E::Id) -> Option<E> {
        self.read_docs().get(id).cloned()
    }

    /// Get count of stored documents.
    pub fn document_count(&self) -> usize {
        self.read_docs().len()
    }

    /// Make every subsequent insert, update and bulk write fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn insert_count(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    /// Number of single-document updates.
    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    /// Number of bulk replace calls, failed ones included.
    pub fn bulk_write_count(&self) -> usize {
        self.bulk_writes.load(Ordering::SeqCst)
    }

    /// Number of documents replaced across all bulk writes.
    pub fn replaced_count(&self) -> usize {
        self.replaced.load(Ordering::SeqCst)
    }

    pub fn find_count(&self) -> usize {
        self.finds.load(Ordering::SeqCst)
    }

    /// Total backing writes of any kind.
    pub fn write_count(&self) -> usize {
        self.insert_count() + self.update_count() + self.bulk_write_count()
    }

    fn read_docs(&self) -> RwLockReadGuard<'_, HashMap<E::Id, E>> {
        self.documents.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_docs(&self) -> RwLockWriteGuard<'_, HashMap<E::Id, E>> {
        self.documents.write().unwrap_or_else(|e| e.into_inner())
    }

    fn check_writable(&self, id: &E::Id, failure: fn(String, String, String) -> StorageError) -> BurrowResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(failure(
                short_type_name(std::any::type_name::<E>()).to_string(),
                format!("{id:?}"),
                "injected failure".to_string(),
            )
            .into());
        }
        Ok(())
    }
}

fn insert_failed(entity_type: String, id: String, reason: String) -> StorageError {
    StorageError::InsertFailed {
        entity_type,
        id,
        reason,
    }
}

fn update_failed(entity_type: String, id: String, reason: String) -> StorageError {
    StorageError::UpdateFailed {
        entity_type,
        id,
        reason,
    }
}

#[async_trait]
impl<E: Entity> Accessor<E> for MockDocumentStore<E> {
    async fn load(&self, id: &E::Id) -> BurrowResult<Option<E>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let docs = self.documents.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(docs.get(id).cloned())
    }

    async fn insert(&self, entity: &E) -> BurrowResult<()> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        let id = entity.id();
        self.check_writable(&id, insert_failed)?;
        let mut docs = self.documents.write().map_err(|_| StorageError::LockPoisoned)?;
        if docs.contains_key(&id) {
            return Err(insert_failed(
                short_type_name(std::any::type_name::<E>()).to_string(),
                format!("{id:?}"),
                "already exists".to_string(),
            )
            .into());
        }
        docs.insert(id, entity.clone());
        Ok(())
    }

    async fn update(&self, entity: &E) -> BurrowResult<()> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        let id = entity.id();
        self.check_writable(&id, update_failed)?;
        let mut docs = self.documents.write().map_err(|_| StorageError::LockPoisoned)?;
        docs.insert(id, entity.clone());
        Ok(())
    }
}

#[async_trait]
impl<E: Entity> Collection<E> for MockDocumentStore<E> {
    async fn bulk_replace(
        &self,
        models: Vec<ReplaceOne<E>>,
        _options: BulkWriteOptions,
    ) -> BurrowResult<BulkWriteResult> {
        self.bulk_writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::BulkWriteFailed {
                entity_type: short_type_name(std::any::type_name::<E>()).to_string(),
                count: models.len(),
                reason: "injected failure".to_string(),
            }
            .into());
        }

        let mut docs = self.documents.write().map_err(|_| StorageError::LockPoisoned)?;
        let mut matched = 0;
        for model in models {
            let hit = match (&model.filter, docs.get(model.filter.id())) {
                (_, None) => false,
                (ReplaceFilter::ById(_), Some(_)) => true,
                (ReplaceFilter::ByIdAndVersion { version, .. }, Some(current)) => {
                    current.version() == *version
                }
            };
            if hit {
                docs.insert(model.filter.id().clone(), model.replacement);
                matched += 1;
            }
        }
        self.replaced.fetch_add(matched, Ordering::SeqCst);
        Ok(BulkWriteResult {
            matched_count: matched,
        })
    }

    async fn find_by_ids(&self, ids: &[E::Id]) -> BurrowResult<Vec<E>> {
        self.finds.fetch_add(1, Ordering::SeqCst);
        let docs = self.documents.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(ids.iter().filter_map(|id| docs.get(id).cloned()).collect())
    }
}
