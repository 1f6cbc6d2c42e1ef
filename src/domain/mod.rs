//! Domain Layer
//!
//! Ports and value objects shared by the cache, lock, id and order layers.
//!
//! # Usage
//!
//! ```ignore
//! use flashgate::domain::ports::{KeyValueStore, OrderStore};
//!
//! // Use traits for dependency injection
//! async fn stock_left<S: KeyValueStore>(store: &S, voucher: VoucherId) -> Result<Option<String>> {
//!     store.get(&format!("seckill:stock:{}", voucher)).await
//! }
//! ```

pub mod ports;

// Re-export commonly used types
pub use ports::{
    Clock, KeyValueStore, ManualClock, OrderId, OrderStore, PendingOrder, PersistOutcome,
    ServerScript, SystemClock, UserId, VoucherId,
};
