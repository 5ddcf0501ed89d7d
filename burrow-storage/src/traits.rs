//! Entity and backing-store contracts.
//!
//! The cache never talks to a database driver directly. It is handed an
//! [`Accessor`] for single-document CRUD and a [`Collection`] for batched
//! replaces, both scoped to one entity type.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use burrow_core::{BurrowResult, EntityKey};

/// Shared handle to a cached entity.
///
/// The cache hands out clones of the same handle for a key; identity checks
/// on update compare handles with [`Arc::ptr_eq`].
pub type EntityRef<E> = Arc<RwLock<E>>;

/// A persistent entity type.
///
/// # Implementation Requirements
///
/// - `id()` must be stable for the lifetime of the instance
/// - `new_with_id()` builds the default document `load_or_create` inserts
/// - Versioned types set `VERSIONED = true` and expose the counter through
///   `version()` / `set_version()`; the cache increments it on every
///   batched write
pub trait Entity: Clone + Send + Sync + 'static {
    /// Primary key type.
    type Id: EntityKey;

    /// Whether the type carries an optimistic version field.
    const VERSIONED: bool = false;

    /// Primary key of this instance.
    fn id(&self) -> Self::Id;

    /// Default instance for a key that does not exist yet.
    fn new_with_id(id: Self::Id) -> Self;

    /// Current optimistic version. Ignored unless `VERSIONED`.
    fn version(&self) -> i64 {
        0
    }

    /// Overwrite the optimistic version. Ignored unless `VERSIONED`.
    fn set_version(&mut self, _version: i64) {}
}

/// Single-document CRUD against the backing store.
#[async_trait]
pub trait Accessor<E: Entity>: Send + Sync {
    /// Fetch a document, `None` if it does not exist.
    async fn load(&self, id: &E::Id) -> BurrowResult<Option<E>>;

    /// Insert a new document.
    async fn insert(&self, entity: &E) -> BurrowResult<()>;

    /// Replace a document by key, without any version check.
    async fn update(&self, entity: &E) -> BurrowResult<()>;
}

/// Selects the document a replace applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplaceFilter<K> {
    /// Match on key alone.
    ById(K),
    /// Match on key and the version the cache last saw.
    ByIdAndVersion { id: K, version: i64 },
}

impl<K> ReplaceFilter<K> {
    pub fn id(&self) -> &K {
        match self {
            ReplaceFilter::ById(id) => id,
            ReplaceFilter::ByIdAndVersion { id, .. } => id,
        }
    }
}

/// One replace in a bulk write.
#[derive(Debug, Clone)]
pub struct ReplaceOne<E: Entity> {
    pub filter: ReplaceFilter<E::Id>,
    pub replacement: E,
}

/// Bulk write options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BulkWriteOptions {
    /// Stop at the first failing model when set.
    pub ordered: bool,
}

impl BulkWriteOptions {
    /// Every model is attempted regardless of the others.
    pub fn unordered() -> Self {
        Self { ordered: false }
    }
}

/// Outcome of a bulk write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BulkWriteResult {
    /// Number of models whose filter matched a document.
    pub matched_count: usize,
}

/// Batched operations on one entity type's collection.
#[async_trait]
pub trait Collection<E: Entity>: Send + Sync {
    /// Apply every replace in `models`.
    async fn bulk_replace(
        &self,
        models: Vec<ReplaceOne<E>>,
        options: BulkWriteOptions,
    ) -> BurrowResult<BulkWriteResult>;

    /// Fetch the documents that exist among `ids`.
    async fn find_by_ids(&self, ids: &[E::Id]) -> BurrowResult<Vec<E>>;
}

/// Read-lock an entity handle, ignoring poisoning.
pub fn read_entity<E>(entity: &EntityRef<E>) -> RwLockReadGuard<'_, E> {
    entity.read().unwrap_or_else(|e| e.into_inner())
}

/// Write-lock an entity handle, ignoring poisoning.
pub fn write_entity<E>(entity: &EntityRef<E>) -> RwLockWriteGuard<'_, E> {
    entity.write().unwrap_or_else(|e| e.into_inner())
}
