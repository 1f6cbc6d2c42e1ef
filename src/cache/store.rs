//! Read-Through Cache Store
//!
//! Strategies over the shared substrate:
//!
//! | Strategy                     | Penetration | Breakdown                  | Reader blocks on rebuild |
//! |------------------------------|-------------|----------------------------|--------------------------|
//! | [`get_with_pass_through`]    | null marker | every miss hits the loader | yes                      |
//! | [`get_with_mutex`]           | null marker | one loader per key (lock)  | yes, contenders wait     |
//! | [`get_with_logical_expiry`]  | pre-warmed  | one async rebuild          | never                    |
//!
//! [`get_with_pass_through`]: CacheStore::get_with_pass_through
//! [`get_with_mutex`]: CacheStore::get_with_mutex
//! [`get_with_logical_expiry`]: CacheStore::get_with_logical_expiry

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use super::entry::{CachedValue, LogicalEnvelope, NULL_MARKER};
use super::rebuild::{Dispatch, RebuildPool};
use crate::config::CacheConfig;
use crate::domain::ports::{Clock, KeyValueStore, SystemClock};
use crate::error::{Error, Result};
use crate::lock::{DistributedLock, Lock};
use crate::metrics::Metrics;

const PASS_THROUGH: &str = "pass_through";
const MUTEX: &str = "mutex";
const LOGICAL: &str = "logical_expire";

/// Result of reading a key with fault degradation applied.
enum Lookup {
    Found(String),
    Missing,
    /// Substrate fault turned into a miss by `degrade_reads`
    Degraded,
}

/// Generic read-through cache over a [`KeyValueStore`].
pub struct CacheStore {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    rebuild: RebuildPool,
    config: CacheConfig,
    metrics: Metrics,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("config", &self.config)
            .field("rebuild", &self.rebuild)
            .finish()
    }
}

impl CacheStore {
    /// Create a cache store. Must be called inside a Tokio runtime, which
    /// hosts the rebuild workers.
    pub fn new(store: Arc<dyn KeyValueStore>, config: CacheConfig, metrics: Metrics) -> Self {
        Self::with_clock(store, Arc::new(SystemClock), config, metrics)
    }

    pub fn with_clock(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        config: CacheConfig,
        metrics: Metrics,
    ) -> Self {
        let rebuild = RebuildPool::new(config.rebuild_workers, config.rebuild_backlog);
        Self {
            store,
            clock,
            rebuild,
            config,
            metrics,
        }
    }

    pub fn rebuild_pool(&self) -> &RebuildPool {
        &self.rebuild
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Serialize `value` and write it with a physical TTL.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        let json = serde_json::to_string(value)?;
        self.store.set(key, &json, Some(ttl)).await
    }

    /// Write `value` in a logical-expiry envelope with no physical TTL.
    pub async fn set_with_logical_expiry<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<()> {
        let payload = encode_logical(self.clock.as_ref(), value, ttl)?;
        self.store.set(key, &payload, None).await
    }

    /// Drop a cached entity after its source of truth changed.
    pub async fn invalidate(&self, key: &str) -> Result<bool> {
        self.store.delete(key).await
    }

    /// Warm a logically-expiring entry from the source of truth.
    ///
    /// Returns whether the entity existed.
    #[instrument(skip(self, id, loader), fields(key = %format!("{}{}", key_prefix, id)))]
    pub async fn preload<T, I, F, Fut>(
        &self,
        key_prefix: &str,
        id: I,
        loader: F,
        ttl: Duration,
    ) -> Result<bool>
    where
        T: Serialize,
        I: Display,
        F: FnOnce(I) -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        let key = format!("{}{}", key_prefix, id);
        match loader(id).await? {
            Some(value) => {
                self.set_with_logical_expiry(&key, &value, ttl).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // =========================================================================
    // Pass-through (penetration defense)
    // =========================================================================

    /// Read-through with null caching.
    ///
    /// A cached null marker answers "not found" without calling `loader`.
    #[instrument(skip(self, id, loader), fields(key = %format!("{}{}", key_prefix, id)))]
    pub async fn get_with_pass_through<T, I, F, Fut>(
        &self,
        key_prefix: &str,
        id: I,
        loader: F,
        ttl: Duration,
    ) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        I: Display,
        F: FnOnce(I) -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        let key = format!("{}{}", key_prefix, id);
        match self.lookup(&key, PASS_THROUGH).await? {
            Lookup::Found(raw) => Ok(self.decode_cached(&raw, PASS_THROUGH)?),
            Lookup::Degraded => Ok(None),
            Lookup::Missing => {
                self.metrics.record_cache_lookup(PASS_THROUGH, "miss");
                self.load_through(&key, id, loader, ttl, PASS_THROUGH).await
            }
        }
    }

    // =========================================================================
    // Mutex (breakdown defense, blocking)
    // =========================================================================

    /// Pass-through read whose miss path is serialized by a `<key>:mutex`
    /// lock, so a cold hot key reaches the loader once.
    ///
    /// Contenders follow `mutex_policy`: sleep, re-read the cache, and try
    /// the lock again. Exhausting the attempts is a
    /// [`Error::LockContention`].
    #[instrument(skip(self, id, loader), fields(key = %format!("{}{}", key_prefix, id)))]
    pub async fn get_with_mutex<T, I, F, Fut>(
        &self,
        key_prefix: &str,
        id: I,
        loader: F,
        ttl: Duration,
    ) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        I: Display,
        F: FnOnce(I) -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        let key = format!("{}{}", key_prefix, id);
        let lock_name = format!("{}:mutex", key);
        let policy = self.config.mutex_policy;
        let attempts = policy.attempts();

        for attempt in 1..=attempts {
            match self.lookup(&key, MUTEX).await? {
                Lookup::Found(raw) => return self.decode_cached(&raw, MUTEX),
                Lookup::Degraded => return Ok(None),
                Lookup::Missing => {}
            }

            let lock = DistributedLock::new(self.store.clone(), lock_name.clone());
            if lock.try_acquire(self.config.mutex_lock_ttl).await? {
                // Another holder may have filled the key before we got the lock
                let result = match self.lookup(&key, MUTEX).await {
                    Ok(Lookup::Found(raw)) => self.decode_cached(&raw, MUTEX),
                    Ok(Lookup::Degraded) => Ok(None),
                    Ok(Lookup::Missing) => {
                        self.metrics.record_cache_lookup(MUTEX, "miss");
                        self.load_through(&key, id, loader, ttl, MUTEX).await
                    }
                    Err(e) => Err(e),
                };
                if let Err(e) = lock.release().await {
                    warn!(lock = %lock.key(), error = %e, "Failed to release cache mutex");
                }
                return result;
            }

            if attempt < attempts {
                debug!(attempt, "Cache mutex contended, retrying");
                tokio::time::sleep(policy.backoff()).await;
            }
        }

        self.metrics.record_cache_lookup(MUTEX, "contended");
        Err(Error::LockContention { resource: lock_name })
    }

    // =========================================================================
    // Logical expiry (breakdown defense, non-blocking)
    // =========================================================================

    /// Read a logically-expiring entry.
    ///
    /// A missing key is "not found": hot keys are expected to be warmed with
    /// [`preload`](Self::preload). A stale entry is returned as-is while one
    /// rebuild is handed to the background pool; the caller never waits for
    /// the loader.
    #[instrument(skip(self, id, loader), fields(key = %format!("{}{}", key_prefix, id)))]
    pub async fn get_with_logical_expiry<T, I, F, Fut>(
        &self,
        key_prefix: &str,
        id: I,
        loader: F,
        ttl: Duration,
    ) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        I: Display + Send + 'static,
        F: FnOnce(I) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<T>>> + Send + 'static,
    {
        let key = format!("{}{}", key_prefix, id);
        let raw = match self.lookup(&key, LOGICAL).await? {
            Lookup::Found(raw) if raw != NULL_MARKER => raw,
            Lookup::Found(_) | Lookup::Missing => {
                self.metrics.record_cache_lookup(LOGICAL, "miss");
                return Ok(None);
            }
            Lookup::Degraded => return Ok(None),
        };

        let envelope: LogicalEnvelope<T> = LogicalEnvelope::decode(&raw)?;
        if envelope.is_fresh(self.clock.now()) {
            self.metrics.record_cache_lookup(LOGICAL, "hit");
            return Ok(Some(envelope.data));
        }
        self.metrics.record_cache_lookup(LOGICAL, "stale");

        let lock = DistributedLock::new(self.store.clone(), format!("{}:rebuild", key));
        let acquired = match lock.try_acquire(self.config.rebuild_lock_ttl).await {
            Ok(acquired) => acquired,
            Err(e) => {
                warn!(error = %e, "Rebuild lock unavailable, serving stale value");
                false
            }
        };
        if !acquired {
            return Ok(Some(envelope.data));
        }

        let fresh = self.rebuild_if_still_stale::<T, I, F, Fut>(&key, id, loader, ttl).await;
        if let Err(e) = lock.release().await {
            warn!(lock = %lock.key(), error = %e, "Failed to release rebuild lock");
        }
        Ok(Some(fresh.unwrap_or(envelope.data)))
    }

    /// Under the rebuild lock: re-read, and dispatch a rebuild only if the
    /// entry is still stale. Returns the fresh value if another rebuild
    /// already landed.
    async fn rebuild_if_still_stale<T, I, F, Fut>(
        &self,
        key: &str,
        id: I,
        loader: F,
        ttl: Duration,
    ) -> Option<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        I: Display + Send + 'static,
        F: FnOnce(I) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<T>>> + Send + 'static,
    {
        match self.store.get(key).await {
            Ok(Some(raw)) if raw != NULL_MARKER => match LogicalEnvelope::<T>::decode(&raw) {
                Ok(envelope) if envelope.is_fresh(self.clock.now()) => {
                    debug!("Entry refreshed by another rebuild");
                    return Some(envelope.data);
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Re-read of stale entry failed to decode"),
            },
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Re-read under rebuild lock failed, serving stale value");
                return None;
            }
        }

        let store = self.store.clone();
        let clock = self.clock.clone();
        let metrics = self.metrics.clone();
        let job_key = key.to_string();
        let job = async move {
            match loader(id).await {
                Ok(Some(value)) => {
                    // Only the owned payload may live across the write
                    let encoded = encode_logical(clock.as_ref(), &value, ttl);
                    drop(value);
                    let written = match encoded {
                        Ok(payload) => store.set(&job_key, &payload, None).await,
                        Err(e) => Err(e),
                    };
                    match written {
                        Ok(()) => {
                            metrics.record_rebuild("completed");
                            debug!(key = %job_key, "Cache entry rebuilt");
                        }
                        Err(e) => {
                            metrics.record_rebuild("failed");
                            error!(key = %job_key, error = %e, "Failed to write rebuilt entry");
                        }
                    }
                }
                Ok(None) => {
                    metrics.record_rebuild("vanished");
                    info!(key = %job_key, "Entity no longer exists, dropping cache entry");
                    if let Err(e) = store.delete(&job_key).await {
                        error!(key = %job_key, error = %e, "Failed to drop vanished entry");
                    }
                }
                Err(e) => {
                    metrics.record_rebuild("failed");
                    error!(key = %job_key, error = %e, "Cache rebuild loader failed");
                }
            }
        };

        match self.rebuild.try_dispatch(key, job) {
            Dispatch::Queued => self.metrics.record_rebuild("dispatched"),
            Dispatch::InFlight => self.metrics.record_rebuild("in_flight"),
            Dispatch::Saturated => {
                self.metrics.record_rebuild("saturated");
                warn!("Rebuild backlog full, skipping rebuild");
            }
            Dispatch::Closed => {
                self.metrics.record_rebuild("closed");
                warn!("Rebuild pool closed, skipping rebuild");
            }
        }
        None
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn lookup(&self, key: &str, strategy: &str) -> Result<Lookup> {
        match self.store.get(key).await {
            Ok(Some(raw)) => Ok(Lookup::Found(raw)),
            Ok(None) => Ok(Lookup::Missing),
            Err(e) if self.config.degrade_reads => {
                warn!(key, error = %e, "Cache read failed, degrading to not found");
                self.metrics.record_cache_lookup(strategy, "degraded");
                Ok(Lookup::Degraded)
            }
            Err(e) => Err(e),
        }
    }

    fn decode_cached<T: DeserializeOwned>(&self, raw: &str, strategy: &str) -> Result<Option<T>> {
        match CachedValue::decode(raw)? {
            CachedValue::Present(value) => {
                self.metrics.record_cache_lookup(strategy, "hit");
                Ok(Some(value))
            }
            CachedValue::Absent => {
                self.metrics.record_cache_lookup(strategy, "null_hit");
                Ok(None)
            }
        }
    }

    /// Call the loader and cache its answer, including absence.
    async fn load_through<T, I, F, Fut>(
        &self,
        key: &str,
        id: I,
        loader: F,
        ttl: Duration,
        strategy: &str,
    ) -> Result<Option<T>>
    where
        T: Serialize,
        F: FnOnce(I) -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        match loader(id).await? {
            Some(value) => {
                self.set(key, &value, ttl).await?;
                self.metrics.record_cache_lookup(strategy, "loaded");
                Ok(Some(value))
            }
            None => {
                self.store
                    .set(key, NULL_MARKER, Some(self.config.null_ttl))
                    .await?;
                self.metrics.record_cache_lookup(strategy, "absent");
                Ok(None)
            }
        }
    }
}

/// Serialize `value` into a logical-expiry envelope expiring `ttl` from now.
fn encode_logical<T: Serialize + ?Sized>(clock: &dyn Clock, value: &T, ttl: Duration) -> Result<String> {
    LogicalEnvelope::new(value, clock.now(), ttl).encode()
}
