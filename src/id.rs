//! Unique ID Allocation
//!
//! Time-ordered 64-bit ids backed by a per-day counter in the substrate.
//!
//! ```text
//!  63                              32 31                               0
//! ┌──────────────────────────────────┬──────────────────────────────────┐
//! │ seconds since BASELINE_EPOCH     │ INCR icr:<sequence>:<yyyy:MM:dd> │
//! └──────────────────────────────────┴──────────────────────────────────┘
//! ```
//!
//! No coordination across sequence names is needed: each name has its own
//! counter namespace, and the counter resets implicitly with the date.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{instrument, trace};

use crate::domain::ports::{Clock, KeyValueStore, SystemClock};
use crate::error::{Error, Result};

/// Baseline subtracted from the Unix time (2003-09-19T01:02:03Z).
pub const BASELINE_EPOCH: i64 = 1_063_933_323;

/// Bits reserved for the daily counter.
pub const COUNTER_BITS: u32 = 32;

/// Key prefix for sequence counters.
pub const COUNTER_KEY_PREFIX: &str = "icr:";

/// Compose an id from its two parts.
pub fn compose(timestamp: u64, counter: u64) -> u64 {
    (timestamp << COUNTER_BITS) | counter
}

/// Split an id into `(seconds since baseline, counter)`.
pub fn decompose(id: u64) -> (u64, u64) {
    (id >> COUNTER_BITS, id & ((1u64 << COUNTER_BITS) - 1))
}

/// Counter key for `sequence` on the date of `now`.
pub fn counter_key(sequence: &str, now: DateTime<Utc>) -> String {
    format!(
        "{}{}:{}",
        COUNTER_KEY_PREFIX,
        sequence,
        now.format("%Y:%m:%d")
    )
}

/// Allocates ids for any number of sequence names.
#[derive(Clone)]
pub struct IdAllocator {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for IdAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdAllocator").finish_non_exhaustive()
    }
}

impl IdAllocator {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Next id for `sequence`.
    ///
    /// Strictly increasing for one sequence while the clock does not move
    /// backwards; unique while fewer than 2^32 ids are drawn per day.
    #[instrument(skip(self))]
    pub async fn next_id(&self, sequence: &str) -> Result<u64> {
        let now = self.clock.now();
        let timestamp = now.timestamp() - BASELINE_EPOCH;
        if timestamp < 0 {
            return Err(Error::ClockBeforeBaseline(now.timestamp()));
        }

        let counter = self.store.incr(&counter_key(sequence, now)).await?;
        if counter < 0 || counter > u32::MAX as i64 {
            return Err(Error::SequenceExhausted {
                sequence: sequence.to_string(),
                counter,
            });
        }

        let id = compose(timestamp as u64, counter as u64);
        trace!(id, counter, "Allocated id");
        Ok(id)
    }
}
