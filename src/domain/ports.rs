//! Domain Ports (DDD Port/Adapter Pattern)
//!
//! This module defines the core abstractions (ports) that the cache, lock,
//! id and order layers depend on. Infrastructure adapters implement these
//! traits to provide concrete implementations.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Domain Layer                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │     KeyValueStore │ OrderStore │ Clock               │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │  InMemoryKeyValueStore │ RedisStore │ InMemoryOrders │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::Result;

// =============================================================================
// Value Objects
// =============================================================================

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            pub fn new(id: u64) -> Self {
                Self(id)
            }

            pub fn get(&self) -> u64 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }
    };
}

numeric_id!(
    /// Flash-sale voucher identifier.
    VoucherId
);
numeric_id!(
    /// Purchasing user identifier.
    UserId
);
numeric_id!(
    /// Order identifier minted by the [`IdAllocator`](crate::id::IdAllocator).
    OrderId
);

/// An admitted order waiting to be persisted.
///
/// Owned by the ingest pipeline from enqueue until the durable store has
/// committed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOrder {
    pub order_id: OrderId,
    pub voucher_id: VoucherId,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
}

impl PendingOrder {
    pub fn new(
        order_id: OrderId,
        voucher_id: VoucherId,
        user_id: UserId,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            order_id,
            voucher_id,
            user_id,
            created_at,
        }
    }
}

/// Outcome of committing an order to the durable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    /// Stock decremented and order row inserted
    Persisted,
    /// The user already holds an order for this voucher
    Duplicate,
    /// Durable stock was already zero
    OutOfStock,
}

// =============================================================================
// Key-Value Substrate Port
// =============================================================================

/// Short scripts the substrate runs atomically.
///
/// Adapters that speak Redis send [`ServerScript::source`] via `EVAL`;
/// adapters without a scripting engine must execute the equivalent logic
/// as one indivisible step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerScript {
    /// `KEYS[1]` lock key, `ARGV[1]` owner token. Deletes only on token match.
    ReleaseLock,
    /// `KEYS` stock, purchased set, window hash; `ARGV` user id, now secs.
    AdmitOrder,
}

impl ServerScript {
    /// Lua source of the script.
    pub fn source(&self) -> &'static str {
        match self {
            ServerScript::ReleaseLock => include_str!("scripts/unlock.lua"),
            ServerScript::AdmitOrder => include_str!("scripts/seckill.lua"),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerScript::ReleaseLock => "unlock",
            ServerScript::AdmitOrder => "seckill",
        }
    }
}

impl std::fmt::Display for ServerScript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Port for the shared low-latency key-value store.
///
/// Every method is a single round trip. Implementations must be safe to
/// share across tasks.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a string value.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a string value, optionally with a physical TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Write only if the key is absent. Returns whether the write happened.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Delete a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Atomically increment an integer value, creating it at 0 first.
    async fn incr(&self, key: &str) -> Result<i64>;

    /// Write all fields of a hash.
    async fn hset_all(&self, key: &str, fields: &[(String, String)]) -> Result<()>;

    /// Read all fields of a hash (empty if the key is absent).
    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Add a member to a set. Returns whether it was newly added.
    async fn sadd(&self, key: &str, member: &str) -> Result<bool>;

    /// Check set membership.
    async fn sismember(&self, key: &str, member: &str) -> Result<bool>;

    /// Run a server-side script atomically and return its integer result.
    async fn eval(&self, script: ServerScript, keys: &[String], args: &[String]) -> Result<i64>;
}

// =============================================================================
// Durable Store Port
// =============================================================================

/// Port for the durable (relational) order and stock records.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Whether `user` already has a persisted order for `voucher`.
    async fn has_order(&self, user: UserId, voucher: VoucherId) -> Result<bool>;

    /// `stock = stock - 1 where stock >= 1`. Returns whether a row changed.
    async fn decrement_stock(&self, voucher: VoucherId) -> Result<bool>;

    /// Insert the order row.
    async fn insert_order(&self, order: &PendingOrder) -> Result<()>;

    /// Duplicate check, conditional decrement and insert as one transaction.
    ///
    /// Either all effects are applied ([`PersistOutcome::Persisted`]) or none.
    async fn commit_order(&self, order: &PendingOrder) -> Result<PersistOutcome>;
}

// =============================================================================
// Clock Port
// =============================================================================

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.write() = now;
    }

    pub fn advance(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
        *self.now.write() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}

// =============================================================================
// Tests
// =============================================================================
