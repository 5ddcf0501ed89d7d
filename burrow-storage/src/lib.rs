//! BURROW Storage - Write-Back Entity Cache
//!
//! An in-memory cache in front of a document store. Reads are served from
//! memory, mutations only mark entries dirty, and dirty entries reach the
//! store in batches on eviction, on demand, or on a timer.
//!
//! # Key Types
//!
//! - `Entity`, `Accessor`, `Collection`: what a cached type and its
//!   backing store must provide
//! - `BoundedCache`: capacity and TTL bounded map with batched removal
//!   notifications
//! - `EntityCache`: write-back persistence for one entity type
//! - `CacheRegistry`: every entity cache in the process, with ordered
//!   shutdown
//! - `MockDocumentStore`: in-memory backing store for tests

pub mod cache;
pub mod mock;
pub mod registry;
pub mod traits;

pub use cache::{
    BoundedCache, CacheEntry, CacheStats, EntityCache, EntityCacheStats, PersistMode,
    PersistReport, RemovalCause, RemovalListener, WriterIdentity,
};
pub use mock::MockDocumentStore;
pub use registry::{CacheRegistry, ManagedCache};
pub use traits::{
    read_entity, write_entity, Accessor, BulkWriteOptions, BulkWriteResult, Collection, Entity,
    EntityRef, ReplaceFilter, ReplaceOne,
};
