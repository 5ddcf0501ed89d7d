//! Error types for BURROW operations

use thiserror::Error;

/// Backing store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Load failed for {entity_type}: {reason}")]
    LoadFailed { entity_type: String, reason: String },

    #[error("Insert failed for {entity_type} with id {id}: {reason}")]
    InsertFailed {
        entity_type: String,
        id: String,
        reason: String,
    },

    #[error("Update failed for {entity_type} with id {id}: {reason}")]
    UpdateFailed {
        entity_type: String,
        id: String,
        reason: String,
    },

    #[error("Bulk write of {count} {entity_type} documents failed: {reason}")]
    BulkWriteFailed {
        entity_type: String,
        count: usize,
        reason: String,
    },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Entity cache usage errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    /// The caller tried to update an instance that is not the one cached
    /// under its id. This is a programming error.
    #[error("Identity mismatch for {entity_type} with id {id}: update target is not the cached instance")]
    IdentityMismatch { entity_type: String, id: String },

    #[error("Entity cache for {entity_type} is closed")]
    Closed { entity_type: String },
}

/// Lane pool errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LaneError {
    #[error("Failed to spawn lane worker {name}: {reason}")]
    SpawnFailed { name: String, reason: String },

    #[error("Lane pool is shut down")]
    PoolClosed,

    #[error("Lane index {index} out of range for pool of {size}")]
    NoSuchLane { index: usize, size: usize },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

/// Master error type for all BURROW errors.
#[derive(Debug, Clone, Error)]
pub enum BurrowError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Lane error: {0}")]
    Lane(#[from] LaneError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for BURROW operations.
pub type BurrowResult<T> = Result<T, BurrowError>;

// =============================================================================
// TESTS
// =============================================================================
