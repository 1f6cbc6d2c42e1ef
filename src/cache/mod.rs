//! Read-Through Cache
//!
//! Entity cache in front of a slower source of truth, keyed
//! `cache:<entity>:<id>`.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          CacheStore                              │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  pass-through        │ mutex                │ logical expiry     │
//! │  null marker on miss │ lock <key>:mutex     │ lock <key>:rebuild │
//! │                      │ then load            │ then dispatch      │
//! └──────────────────────┴──────────────────────┴─────────┬──────────┘
//!                                                         │
//!                                               ┌─────────▼────────┐
//!                                               │   RebuildPool    │
//!                                               │ (fixed workers,  │
//!                                               │  bounded queue)  │
//!                                               └──────────────────┘
//! ```

mod entry;
mod rebuild;
mod store;

pub use entry::{CachedValue, LogicalEnvelope, NULL_MARKER};
pub use rebuild::{Dispatch, RebuildPool};
pub use store::CacheStore;

/// Key prefix for cached entities of one kind: `cache:<entity>:`.
pub fn cache_prefix(entity: &str) -> String {
    format!("cache:{}:", entity)
}
