//! Infrastructure Adapters
//!
//! This module contains adapter implementations for the domain ports,
//! following the Port/Adapter (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │          KeyValueStore │ OrderStore │ Clock                 │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ InMemoryKeyValueStore │ RedisStore │ InMemoryOrderStore    │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use flashgate::adapters::{RedisConfig, RedisStore};
//! use flashgate::domain::ports::KeyValueStore;
//!
//! let store = RedisStore::connect(RedisConfig::default()).await?;
//! let stock = store.get("seckill:stock:1").await?;
//! ```

mod memory;
pub mod redis;

pub use memory::{InMemoryKeyValueStore, InMemoryOrderStore};
pub use redis::{RedisConfig, RedisStore};
