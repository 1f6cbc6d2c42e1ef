//! Flashgate - Cache Consistency and Flash-Sale Admission
//!
//! A coordination layer over a shared low-latency key-value store that keeps
//! a read-through entity cache correct under contention and admits flash-sale
//! purchases without overselling.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                          Application                              │
//! ├────────────────┬──────────────────┬───────────────────────────────┤
//! │  CacheStore    │ DistributedLock  │ VoucherOrderService           │
//! │  (read-through │ MultiLock        │  AdmissionGate → IdAllocator  │
//! │   + rebuilds)  │                  │  → OrderIngestPipeline        │
//! ├────────────────┴──────────────────┴───────────────────────────────┤
//! │            KeyValueStore port          │   OrderStore port        │
//! │  InMemoryKeyValueStore │ RedisStore    │   InMemoryOrderStore     │
//! └────────────────────────────────────────┴──────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - A hot key that expires logically is rebuilt once per process while
//!   readers keep getting the stale value.
//! - Admission is a single atomic script: no oversell, one admission per
//!   user per voucher.
//! - A lock is only ever released by the owner that took it.
//!
//! # Modules
//!
//! - [`adapters`] - Substrate and durable store implementations
//! - [`cache`] - Read-through cache strategies and the rebuild pool
//! - [`config`] - Runtime configuration
//! - [`domain`] - Ports and value objects
//! - [`error`] - Error types
//! - [`id`] - Time-ordered id allocation
//! - [`lock`] - Owner-token locks
//! - [`metrics`] - Prometheus metrics
//! - [`order`] - Admission, order ingest and the order façade

pub mod adapters;
pub mod cache;
pub mod config;
pub mod domain;
pub mod error;
pub mod id;
pub mod lock;
pub mod metrics;
pub mod order;

// Re-export commonly used types
pub use cache::{cache_prefix, CacheStore};
pub use config::Config;
pub use error::{Error, Result};
pub use id::IdAllocator;
pub use lock::{AcquirePolicy, DistributedLock, Lock, MultiLock};
pub use metrics::Metrics;
pub use order::{AdmissionDecision, AdmissionGate, OrderIngestPipeline, PlaceOrderOutcome, VoucherOrderService};
