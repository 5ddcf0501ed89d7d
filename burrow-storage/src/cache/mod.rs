//! Caching layers.
//!
//! [`BoundedCache`] is the generic capacity/TTL store with batched removal
//! notifications. [`EntityCache`] builds write-back persistence for one
//! entity type on top of it.

mod bounded;
mod entity_cache;
mod entry;
mod persist;
mod persister;

pub use bounded::{BoundedCache, CacheStats, RemovalCause, RemovalListener};
pub use entity_cache::{EntityCache, EntityCacheStats};
pub use entry::{CacheEntry, WriterIdentity};
pub use persist::{PersistMode, PersistReport};
