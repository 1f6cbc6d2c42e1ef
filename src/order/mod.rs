//! Flash-Sale Orders
//!
//! # Flow
//!
//! ```text
//! place_order(voucher, user)
//!   │
//!   ├─▶ AdmissionGate::admit         one atomic script on the substrate
//!   │     rejected ─▶ Ok(Rejected(decision))
//!   │
//!   ├─▶ IdAllocator::next_id("order")
//!   │
//!   └─▶ OrderIngestPipeline::enqueue  bounded, never blocks
//!         full ─▶ Err(QueueFull)
//!         ok   ─▶ Ok(Accepted(order_id))
//!                   │
//!                   ▼ (worker)
//!               lock:order:<userId> ─▶ OrderStore::commit_order ─▶ release
//! ```

mod gate;
mod pipeline;
mod service;

pub use gate::{
    order_key, stock_key, window_key, AdmissionDecision, AdmissionGate, SaleWindow,
    ORDER_KEY_PREFIX, STOCK_KEY_PREFIX, WINDOW_KEY_PREFIX,
};
pub use pipeline::OrderIngestPipeline;
pub use service::{PlaceOrderOutcome, VoucherOrderService};
