//! Distributed Locks
//!
//! Named mutual exclusion over the key-value substrate.
//!
//! ```text
//! try_acquire:  SET lock:<name> <owner-token> NX PX <ttl>
//! release:      EVAL unlock.lua lock:<name> <owner-token>   (delete iff token matches)
//! ```
//!
//! Acquisition never blocks: contention is reported as `Ok(false)`.
//! Whether to retry is the caller's decision, expressed as an
//! [`AcquirePolicy`]. A critical section that outlives the TTL loses the
//! lock; TTLs must be set well above the expected section duration.

mod distributed;
mod multi;

pub use distributed::DistributedLock;
pub use multi::MultiLock;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::LockConfig;
use crate::error::Result;

/// Key prefix shared by every lock.
pub const LOCK_KEY_PREFIX: &str = "lock:";

/// How a caller reacts to a contended lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquirePolicy {
    /// One attempt; contention means someone else is doing the work
    FailFast,
    /// Up to `attempts` tries, sleeping `backoff` between them
    Retry {
        attempts: u32,
        #[serde(with = "crate::config::duration_ms")]
        backoff: Duration,
    },
}

impl AcquirePolicy {
    pub fn attempts(&self) -> u32 {
        match self {
            AcquirePolicy::FailFast => 1,
            AcquirePolicy::Retry { attempts, .. } => (*attempts).max(1),
        }
    }

    pub fn backoff(&self) -> Duration {
        match self {
            AcquirePolicy::FailFast => Duration::ZERO,
            AcquirePolicy::Retry { backoff, .. } => *backoff,
        }
    }
}

impl Default for AcquirePolicy {
    fn default() -> Self {
        AcquirePolicy::FailFast
    }
}

/// A named, TTL-bounded mutual exclusion primitive.
#[async_trait]
pub trait Lock: Send + Sync {
    /// Resource name, without the `lock:` prefix.
    fn name(&self) -> &str;

    /// One non-blocking acquisition attempt.
    async fn try_acquire(&self, ttl: Duration) -> Result<bool>;

    /// Release if still held by this handle. Returns whether anything was
    /// deleted; a lock that expired and was taken by another owner is left
    /// untouched.
    async fn release(&self) -> Result<bool>;

    /// Acquire following `policy`.
    async fn acquire(&self, ttl: Duration, policy: &AcquirePolicy) -> Result<bool> {
        let attempts = policy.attempts();
        for attempt in 1..=attempts {
            if self.try_acquire(ttl).await? {
                return Ok(true);
            }
            if attempt < attempts {
                debug!(lock = %self.name(), attempt, "Lock contended, backing off");
                tokio::time::sleep(policy.backoff()).await;
            }
        }
        Ok(false)
    }

    /// Acquire with the configured TTL and policy.
    async fn acquire_with(&self, config: &LockConfig) -> Result<bool> {
        self.acquire(config.ttl, &config.policy).await
    }
}
