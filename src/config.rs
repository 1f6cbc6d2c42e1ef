//! Runtime configuration
//!
//! Plain structs with defaults matching production values. The binary
//! fills them from CLI flags and environment variables; library users may
//! also load them from JSON, where durations are given in milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::lock::AcquirePolicy;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub lock: LockConfig,
    pub pipeline: PipelineConfig,
}

impl Config {
    /// Parse and validate a JSON document. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache.rebuild_workers == 0 {
            return Err(Error::Config("cache.rebuild_workers must be > 0".to_string()));
        }
        if self.cache.rebuild_backlog == 0 {
            return Err(Error::Config("cache.rebuild_backlog must be > 0".to_string()));
        }
        if self.pipeline.queue_capacity == 0 {
            return Err(Error::Config("pipeline.queue_capacity must be > 0".to_string()));
        }
        if self.pipeline.order_lock_ttl.is_zero() || self.lock.ttl.is_zero() {
            return Err(Error::Config("lock TTLs must be non-zero".to_string()));
        }
        if self.pipeline.order_sequence.is_empty() {
            return Err(Error::Config("pipeline.order_sequence must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Read-through cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL for entities written by callers that do not pass one
    #[serde(with = "duration_ms")]
    pub default_ttl: Duration,

    /// TTL of the empty marker cached for absent entities
    #[serde(with = "duration_ms")]
    pub null_ttl: Duration,

    /// TTL of the `<key>:rebuild` lock taken by logical-expiry reads
    #[serde(with = "duration_ms")]
    pub rebuild_lock_ttl: Duration,

    /// Background rebuild workers
    pub rebuild_workers: usize,

    /// Queued rebuilds before new triggers are skipped
    pub rebuild_backlog: usize,

    /// TTL of the `<key>:mutex` lock taken by mutex reads
    #[serde(with = "duration_ms")]
    pub mutex_lock_ttl: Duration,

    /// What a mutex read does when another caller is rebuilding
    pub mutex_policy: AcquirePolicy,

    /// Turn substrate read faults into cache misses instead of errors
    pub degrade_reads: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(30 * 60),
            null_ttl: Duration::from_secs(2 * 60),
            rebuild_lock_ttl: Duration::from_secs(10),
            rebuild_workers: 10,
            rebuild_backlog: 256,
            mutex_lock_ttl: Duration::from_secs(10),
            mutex_policy: AcquirePolicy::Retry {
                attempts: 20,
                backoff: Duration::from_millis(50),
            },
            degrade_reads: false,
        }
    }
}

/// Defaults for locks taken by callers of the library.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    #[serde(with = "duration_ms")]
    pub ttl: Duration,
    pub policy: AcquirePolicy,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10),
            policy: AcquirePolicy::FailFast,
        }
    }
}

/// Order ingest settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Bounded queue capacity
    pub queue_capacity: usize,

    /// TTL of the per-user `order:<userId>` lock held while persisting
    #[serde(with = "duration_ms")]
    pub order_lock_ttl: Duration,

    /// Sequence name used to mint order ids
    pub order_sequence: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024 * 1024,
            order_lock_ttl: Duration::from_secs(10),
            order_sequence: "order".to_string(),
        }
    }
}

/// Serde helper: `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.cache.null_ttl, Duration::from_secs(120));
        assert_eq!(config.cache.rebuild_workers, 10);
        assert_eq!(config.pipeline.order_sequence, "order");
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = Config::from_json(
            r#"{"cache": {"null_ttl": 500}, "pipeline": {"queue_capacity": 8}}"#,
        )
        .unwrap();
        assert_eq!(config.cache.null_ttl, Duration::from_millis(500));
        assert_eq!(config.cache.rebuild_workers, 10);
        assert_eq!(config.pipeline.queue_capacity, 8);
        assert_eq!(config.lock.policy, AcquirePolicy::FailFast);
    }

    #[test]
    fn test_policy_from_json() {
        let config = Config::from_json(
            r#"{"cache": {"mutex_policy": {"retry": {"attempts": 3, "backoff": 10}}}}"#,
        )
        .unwrap();
        assert_eq!(
            config.cache.mutex_policy,
            AcquirePolicy::Retry {
                attempts: 3,
                backoff: Duration::from_millis(10)
            }
        );
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = Config::from_json(r#"{"pipeline": {"queue_capacity": 0}}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
