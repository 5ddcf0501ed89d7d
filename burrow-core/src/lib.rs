//! BURROW Core - Shared Types
//!
//! Identity and time helpers, the error taxonomy and per-entity-type
//! configuration. All other crates depend on this one; it carries no
//! concurrency machinery of its own.

mod config;
mod error;

pub use config::{
    BurrowConfig, EntityCacheConfig, LanePoolConfig, PersisterStrategy, DEFAULT_CAPACITY,
    DEFAULT_PAGE_SIZE, DEFAULT_STAGGER, DEFAULT_TTL, MIN_SWEEP_INTERVAL,
};
pub use error::{BurrowError, BurrowResult, CacheError, ConfigError, LaneError, StorageError};

use chrono::Utc;
use std::fmt::Debug;
use std::hash::{DefaultHasher, Hash, Hasher};

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Logical timestamp in milliseconds since the Unix epoch.
pub type Millis = i64;

/// Offset added to the wall clock when an entry is marked dirty.
///
/// A load followed immediately by a modify can observe the same clock tick;
/// the offset keeps the modified time strictly ahead of the write time.
pub const DIRTY_OFFSET_MS: Millis = 128;

/// Bound for anything usable as a cache key.
pub trait EntityKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> EntityKey for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

/// Current wall-clock time in milliseconds.
pub fn now_millis() -> Millis {
    Utc::now().timestamp_millis()
}

/// Stable hash of a type name, used to pin all persistence of one entity
/// type onto a single lane.
pub fn type_hash(type_name: &str) -> i64 {
    let mut hasher = DefaultHasher::new();
    type_name.hash(&mut hasher);
    hasher.finish() as i64
}

/// Short, human-readable form of a type name (`crate::mod::Player` -> `Player`).
pub fn short_type_name(type_name: &'static str) -> &'static str {
    let base = type_name.split('<').next().unwrap_or(type_name);
    match base.rfind("::") {
        Some(idx) => &type_name[idx + 2..],
        None => type_name,
    }
}

// ============================================================================
// TESTS
// ============================================================================
