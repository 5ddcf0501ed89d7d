//! Configuration types

use crate::{BurrowError, BurrowResult, ConfigError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Default number of entries held per entity type.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Default time-to-live for a cached entry.
pub const DEFAULT_TTL: Duration = Duration::from_secs(600);

/// Default number of entities per bulk write.
pub const DEFAULT_PAGE_SIZE: usize = 512;

/// Default delay between thread-affinity persistence groups.
pub const DEFAULT_STAGGER: Duration = Duration::from_millis(128);

/// Floor for the background expiry sweep interval.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(50);

/// Durations are written as integer milliseconds in config files.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
        }
    }
}

/// How dirty entries of an entity type get flushed besides eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PersisterStrategy {
    /// Only explicit `persist*` calls and evictions write back.
    #[default]
    Manual,
    /// `persist_all` runs on the scheduler every `period`.
    Interval {
        #[serde(rename = "period_ms", with = "duration_ms")]
        period: Duration,
    },
}

/// Configuration for one entity type's cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityCacheConfig {
    /// Maximum number of resident entries.
    pub capacity: usize,
    /// Time-to-live, reset on every put.
    #[serde(rename = "ttl_ms", with = "duration_ms")]
    pub ttl: Duration,
    /// Explicit sweep interval; derived from `ttl` when absent.
    #[serde(
        rename = "sweep_interval_ms",
        with = "duration_ms::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub sweep_interval: Option<Duration>,
    /// Whether the entity is internally safe for concurrent mutation.
    pub thread_safe: bool,
    /// Number of entities per bulk write.
    pub page_size: usize,
    /// Delay between successive thread-affinity groups in `persist_all`.
    #[serde(rename = "stagger_ms", with = "duration_ms")]
    pub stagger: Duration,
    pub persister: PersisterStrategy,
}

impl Default for EntityCacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            ttl: DEFAULT_TTL,
            sweep_interval: None,
            thread_safe: false,
            page_size: DEFAULT_PAGE_SIZE,
            stagger: DEFAULT_STAGGER,
            persister: PersisterStrategy::Manual,
        }
    }
}

impl EntityCacheConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the capacity bound.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the entry TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Override the derived sweep interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    /// Declare the entity type internally thread-safe.
    pub fn with_thread_safe(mut self, thread_safe: bool) -> Self {
        self.thread_safe = thread_safe;
        self
    }

    /// Set the bulk write page size.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Set the delay between thread-affinity groups.
    pub fn with_stagger(mut self, stagger: Duration) -> Self {
        self.stagger = stagger;
        self
    }

    /// Set the persister strategy.
    pub fn with_persister(mut self, persister: PersisterStrategy) -> Self {
        self.persister = persister;
        self
    }

    /// Interval between background expiry sweeps.
    ///
    /// Sweeps run at least every `ttl / 10`, but never more often than
    /// [`MIN_SWEEP_INTERVAL`].
    pub fn effective_sweep_interval(&self) -> Duration {
        self.sweep_interval
            .unwrap_or_else(|| (self.ttl / 10).max(MIN_SWEEP_INTERVAL))
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - capacity > 0
    /// - ttl > 0
    /// - page_size > 0
    /// - sweep_interval, if set, > 0
    /// - interval persister period > 0
    pub fn validate(&self) -> BurrowResult<()> {
        if self.capacity == 0 {
            return Err(invalid("capacity", self.capacity, "capacity must be greater than 0"));
        }

        if self.ttl.is_zero() {
            return Err(invalid("ttl", format!("{:?}", self.ttl), "ttl must be positive"));
        }

        if self.page_size == 0 {
            return Err(invalid(
                "page_size",
                self.page_size,
                "page_size must be greater than 0",
            ));
        }

        if let Some(interval) = self.sweep_interval {
            if interval.is_zero() {
                return Err(invalid(
                    "sweep_interval",
                    format!("{:?}", interval),
                    "sweep_interval must be positive",
                ));
            }
        }

        if let PersisterStrategy::Interval { period } = self.persister {
            if period.is_zero() {
                return Err(invalid(
                    "persister.period",
                    format!("{:?}", period),
                    "persister period must be positive",
                ));
            }
        }

        Ok(())
    }
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> BurrowError {
    BurrowError::Config(ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    })
}

/// Lane pool sizing and naming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LanePoolConfig {
    /// Host parallelism the pool is sized from; detected when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<usize>,
    /// Prefix for lane worker thread names.
    pub thread_name_prefix: String,
}

impl Default for LanePoolConfig {
    fn default() -> Self {
        Self {
            parallelism: None,
            thread_name_prefix: "lane".to_string(),
        }
    }
}

impl LanePoolConfig {
    /// Set the parallelism explicitly.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = Some(parallelism);
        self
    }

    /// Set the worker thread name prefix.
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Configured parallelism, falling back to what the host reports.
    pub fn resolved_parallelism(&self) -> usize {
        self.parallelism.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}

/// Master configuration: lane pool plus one section per entity type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BurrowConfig {
    pub lanes: LanePoolConfig,
    pub entities: BTreeMap<String, EntityCacheConfig>,
}

impl BurrowConfig {
    /// Parse and validate a TOML document.
    ///
    /// A malformed document is a startup fault; callers are expected to
    /// abort rather than run with partial configuration.
    pub fn from_toml_str(input: &str) -> BurrowResult<Self> {
        let config: BurrowConfig = toml::from_str(input).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every entity section.
    pub fn validate(&self) -> BurrowResult<()> {
        if self.lanes.parallelism == Some(0) {
            return Err(invalid("lanes.parallelism", 0, "parallelism must be greater than 0"));
        }
        if self.lanes.thread_name_prefix.is_empty() {
            return Err(BurrowError::Config(ConfigError::MissingRequired {
                field: "lanes.thread_name_prefix".to_string(),
            }));
        }
        for (name, entity) in &self.entities {
            entity.validate().map_err(|e| match e {
                BurrowError::Config(ConfigError::InvalidValue {
                    field,
                    value,
                    reason,
                }) => invalid(&format!("entities.{name}.{field}"), value, &reason),
                other => other,
            })?;
        }
        Ok(())
    }

    /// Config for the named entity type, or the defaults.
    pub fn entity(&self, name: &str) -> EntityCacheConfig {
        self.entities.get(name).cloned().unwrap_or_default()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_cache_config_builder() {
        let config = EntityCacheConfig::new()
            .with_capacity(3)
            .with_ttl(Duration::from_secs(1))
            .with_thread_safe(true)
            .with_page_size(64)
            .with_stagger(Duration::from_millis(10))
            .with_persister(PersisterStrategy::Interval {
                period: Duration::from_secs(5),
            });

        assert_eq!(config.capacity, 3);
        assert_eq!(config.ttl, Duration::from_secs(1));
        assert!(config.thread_safe);
        assert_eq!(config.page_size, 64);
        assert_eq!(config.stagger, Duration::from_millis(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sweep_interval_derivation() {
        let config = EntityCacheConfig::new().with_ttl(Duration::from_secs(1));
        assert_eq!(config.effective_sweep_interval(), Duration::from_millis(100));

        let tiny = EntityCacheConfig::new().with_ttl(Duration::from_millis(100));
        assert_eq!(tiny.effective_sweep_interval(), MIN_SWEEP_INTERVAL);

        let explicit = tiny.with_sweep_interval(Duration::from_millis(7));
        assert_eq!(explicit.effective_sweep_interval(), Duration::from_millis(7));
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = EntityCacheConfig::new().with_capacity(0);
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            BurrowError::Config(ConfigError::InvalidValue { ref field, .. }) if field == "capacity"
        ));
    }

    #[test]
    fn test_validate_rejects_zero_interval_persister() {
        let config = EntityCacheConfig::new().with_persister(PersisterStrategy::Interval {
            period: Duration::ZERO,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml_str() {
        let input = r#"
            [lanes]
            parallelism = 4

            [entities.Player]
            capacity = 5000
            ttl_ms = 60000
            thread_safe = true

            [entities.Player.persister]
            kind = "interval"
            period_ms = 30000
        "#;

        let config = BurrowConfig::from_toml_str(input).unwrap();
        assert_eq!(config.lanes.resolved_parallelism(), 4);
        let player = config.entity("Player");
        assert_eq!(player.capacity, 5000);
        assert_eq!(player.ttl, Duration::from_secs(60));
        assert!(player.thread_safe);
        assert_eq!(player.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(
            player.persister,
            PersisterStrategy::Interval {
                period: Duration::from_secs(30)
            }
        );

        // Unknown entity types fall back to defaults
        assert_eq!(config.entity("Guild"), EntityCacheConfig::default());
    }

    #[test]
    fn test_from_toml_str_malformed() {
        let err = BurrowConfig::from_toml_str("[entities.Player\ncapacity = ").unwrap_err();
        assert!(matches!(err, BurrowError::Config(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_from_toml_str_invalid_section_names_field() {
        let input = r#"
            [entities.Player]
            capacity = 0
        "#;
        let err = BurrowConfig::from_toml_str(input).unwrap_err();
        match err {
            BurrowError::Config(ConfigError::InvalidValue { field, .. }) => {
                assert_eq!(field, "entities.Player.capacity");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_toml_roundtrip_keeps_milliseconds() {
        let mut config = BurrowConfig::default();
        config.entities.insert(
            "Account".to_string(),
            EntityCacheConfig::new().with_ttl(Duration::from_millis(1500)),
        );
        let text = toml::to_string(&config).unwrap();
        assert!(text.contains("ttl_ms = 1500"));
        let parsed = BurrowConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// The derived sweep interval never undercuts the floor and never
        /// exceeds a tenth of the TTL once the TTL is large enough.
        #[test]
        fn prop_sweep_interval_bounds(ttl_ms in 1u64..10_000_000) {
            let config = EntityCacheConfig::new().with_ttl(Duration::from_millis(ttl_ms));
            let interval = config.effective_sweep_interval();
            prop_assert!(interval >= MIN_SWEEP_INTERVAL);
            if Duration::from_millis(ttl_ms) / 10 >= MIN_SWEEP_INTERVAL {
                prop_assert_eq!(interval, Duration::from_millis(ttl_ms) / 10);
            }
        }

        /// Any positive capacity, ttl and page size validates.
        #[test]
        fn prop_positive_values_validate(
            capacity in 1usize..1_000_000,
            ttl_ms in 1u64..10_000_000,
            page_size in 1usize..4096,
        ) {
            let config = EntityCacheConfig::new()
                .with_capacity(capacity)
                .with_ttl(Duration::from_millis(ttl_ms))
                .with_page_size(page_size);
            prop_assert!(config.validate().is_ok());
        }
    }
}
