//! Admission gate: one atomic script decides whether a purchase may proceed.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::domain::ports::{Clock, KeyValueStore, ServerScript, SystemClock, UserId, VoucherId};
use crate::error::{Error, Result};
use crate::metrics::Metrics;

pub const STOCK_KEY_PREFIX: &str = "seckill:stock:";
pub const ORDER_KEY_PREFIX: &str = "seckill:order:";
pub const WINDOW_KEY_PREFIX: &str = "seckill:window:";

/// Result of an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionDecision {
    Admitted,
    OutOfStock,
    AlreadyPurchased,
    /// Sale window has not opened
    NotStarted,
    /// Sale window has closed
    Ended,
}

impl AdmissionDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdmissionDecision::Admitted => "admitted",
            AdmissionDecision::OutOfStock => "out_of_stock",
            AdmissionDecision::AlreadyPurchased => "already_purchased",
            AdmissionDecision::NotStarted => "not_started",
            AdmissionDecision::Ended => "ended",
        }
    }

    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmissionDecision::Admitted)
    }
}

impl std::fmt::Display for AdmissionDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive sale window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleWindow {
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl SaleWindow {
    pub fn new(begin: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { begin, end }
    }
}

/// Fast-path admission over the shared substrate.
///
/// Stock check, duplicate check, decrement and purchaser registration run
/// as one script invocation, so concurrent callers can never oversell and a
/// user is admitted at most once per voucher.
#[derive(Clone)]
pub struct AdmissionGate {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
}

impl std::fmt::Debug for AdmissionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionGate").finish_non_exhaustive()
    }
}

impl AdmissionGate {
    pub fn new(store: Arc<dyn KeyValueStore>, metrics: Metrics) -> Self {
        Self::with_clock(store, Arc::new(SystemClock), metrics)
    }

    pub fn with_clock(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, metrics: Metrics) -> Self {
        Self {
            store,
            clock,
            metrics,
        }
    }

    /// Seed the cached stock and, optionally, the sale window of a voucher.
    ///
    /// Registration starts a fresh sale: previous purchasers are forgotten
    /// and a window from an earlier registration does not survive.
    #[instrument(skip(self))]
    pub async fn register_voucher(
        &self,
        voucher: VoucherId,
        stock: u32,
        window: Option<SaleWindow>,
    ) -> Result<()> {
        self.store
            .set(&stock_key(voucher), &stock.to_string(), None)
            .await?;
        self.store.delete(&order_key(voucher)).await?;
        self.store.delete(&window_key(voucher)).await?;
        if let Some(window) = window {
            let fields = vec![
                ("beginTime".to_string(), window.begin.timestamp().to_string()),
                ("endTime".to_string(), window.end.timestamp().to_string()),
            ];
            self.store.hset_all(&window_key(voucher), &fields).await?;
        }
        debug!(stock, "Voucher registered");
        Ok(())
    }

    /// Remaining cached stock, `None` for an unregistered voucher.
    pub async fn stock(&self, voucher: VoucherId) -> Result<Option<i64>> {
        match self.store.get(&stock_key(voucher)).await? {
            None => Ok(None),
            Some(raw) => raw.parse::<i64>().map(Some).map_err(|_| Error::UnexpectedReply {
                command: "GET".to_string(),
                reply: raw,
            }),
        }
    }

    /// Decide admission for `user` on `voucher` in one atomic step.
    #[instrument(skip(self))]
    pub async fn admit(&self, voucher: VoucherId, user: UserId) -> Result<AdmissionDecision> {
        let keys = [stock_key(voucher), order_key(voucher), window_key(voucher)];
        let args = [user.to_string(), self.clock.now().timestamp().to_string()];

        let code = self
            .store
            .eval(ServerScript::AdmitOrder, &keys, &args)
            .await?;
        let decision = match code {
            0 => AdmissionDecision::Admitted,
            1 => AdmissionDecision::OutOfStock,
            2 => AdmissionDecision::AlreadyPurchased,
            3 => AdmissionDecision::NotStarted,
            4 => AdmissionDecision::Ended,
            5 => return Err(Error::VoucherNotFound(voucher.get())),
            other => {
                return Err(Error::UnexpectedReply {
                    command: format!("EVAL {}", ServerScript::AdmitOrder),
                    reply: other.to_string(),
                })
            }
        };

        self.metrics.record_admission(decision.as_str());
        debug!(%decision, "Admission decided");
        Ok(decision)
    }
}

pub fn stock_key(voucher: VoucherId) -> String {
    format!("{}{}", STOCK_KEY_PREFIX, voucher)
}

pub fn order_key(voucher: VoucherId) -> String {
    format!("{}{}", ORDER_KEY_PREFIX, voucher)
}

pub fn window_key(voucher: VoucherId) -> String {
    format!("{}{}", WINDOW_KEY_PREFIX, voucher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryKeyValueStore;
    use crate::domain::ports::ManualClock;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::time::Duration;

    fn fixture() -> (Arc<InMemoryKeyValueStore>, Arc<ManualClock>, AdmissionGate) {
        let kv = Arc::new(InMemoryKeyValueStore::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 11, 11, 12, 0, 0).unwrap(),
        ));
        let gate = AdmissionGate::with_clock(kv.clone(), clock.clone(), Metrics::new().unwrap());
        (kv, clock, gate)
    }

    #[tokio::test]
    async fn test_admit_decrements_and_records_purchaser() {
        let (kv, _, gate) = fixture();
        let voucher = VoucherId::new(10);
        gate.register_voucher(voucher, 2, None).await.unwrap();

        assert_eq!(gate.admit(voucher, UserId::new(1)).await.unwrap(), AdmissionDecision::Admitted);
        assert_eq!(gate.stock(voucher).await.unwrap(), Some(1));
        assert!(kv.sismember("seckill:order:10", "1").await.unwrap());
    }

    #[tokio::test]
    async fn test_repeat_purchase_rejected_without_decrement() {
        let (_, _, gate) = fixture();
        let voucher = VoucherId::new(10);
        gate.register_voucher(voucher, 5, None).await.unwrap();

        gate.admit(voucher, UserId::new(1)).await.unwrap();
        assert_eq!(
            gate.admit(voucher, UserId::new(1)).await.unwrap(),
            AdmissionDecision::AlreadyPurchased
        );
        assert_eq!(gate.stock(voucher).await.unwrap(), Some(4));
    }

    #[tokio::test]
    async fn test_out_of_stock_checked_before_duplicate() {
        let (_, _, gate) = fixture();
        let voucher = VoucherId::new(10);
        gate.register_voucher(voucher, 1, None).await.unwrap();

        gate.admit(voucher, UserId::new(1)).await.unwrap();
        assert_eq!(
            gate.admit(voucher, UserId::new(2)).await.unwrap(),
            AdmissionDecision::OutOfStock
        );
        assert_eq!(
            gate.admit(voucher, UserId::new(1)).await.unwrap(),
            AdmissionDecision::OutOfStock
        );
        assert_eq!(gate.stock(voucher).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_sale_window() {
        let (_, clock, gate) = fixture();
        let voucher = VoucherId::new(11);
        let now = clock.now();
        let window = SaleWindow::new(now + ChronoDuration::hours(1), now + ChronoDuration::hours(2));
        gate.register_voucher(voucher, 3, Some(window)).await.unwrap();

        assert_eq!(
            gate.admit(voucher, UserId::new(1)).await.unwrap(),
            AdmissionDecision::NotStarted
        );
        clock.advance(Duration::from_secs(90 * 60));
        assert_eq!(
            gate.admit(voucher, UserId::new(1)).await.unwrap(),
            AdmissionDecision::Admitted
        );
        clock.advance(Duration::from_secs(60 * 60));
        assert_eq!(
            gate.admit(voucher, UserId::new(2)).await.unwrap(),
            AdmissionDecision::Ended
        );
        assert_eq!(gate.stock(voucher).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_reregistration_drops_previous_window() {
        let (_, clock, gate) = fixture();
        let voucher = VoucherId::new(13);
        let now = clock.now();
        let closed = SaleWindow::new(now - ChronoDuration::hours(2), now - ChronoDuration::hours(1));
        gate.register_voucher(voucher, 3, Some(closed)).await.unwrap();
        assert_eq!(
            gate.admit(voucher, UserId::new(1)).await.unwrap(),
            AdmissionDecision::Ended
        );

        gate.register_voucher(voucher, 3, None).await.unwrap();
        assert_eq!(
            gate.admit(voucher, UserId::new(1)).await.unwrap(),
            AdmissionDecision::Admitted
        );
    }

    #[tokio::test]
    async fn test_reregistration_forgets_purchasers() {
        let (kv, _, gate) = fixture();
        let voucher = VoucherId::new(14);
        gate.register_voucher(voucher, 2, None).await.unwrap();
        assert!(gate.admit(voucher, UserId::new(1)).await.unwrap().is_admitted());

        gate.register_voucher(voucher, 2, None).await.unwrap();
        assert!(!kv.sismember("seckill:order:14", "1").await.unwrap());
        assert_eq!(
            gate.admit(voucher, UserId::new(1)).await.unwrap(),
            AdmissionDecision::Admitted
        );
        assert_eq!(gate.stock(voucher).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_unregistered_voucher() {
        let (_, _, gate) = fixture();
        assert!(matches!(
            gate.admit(VoucherId::new(404), UserId::new(1)).await,
            Err(Error::VoucherNotFound(404))
        ));
        assert_eq!(gate.stock(VoucherId::new(404)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_concurrent_admission_never_oversells() {
        let (_, _, gate) = fixture();
        let voucher = VoucherId::new(12);
        gate.register_voucher(voucher, 100, None).await.unwrap();

        let mut handles = Vec::new();
        for user in 0..300u64 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                gate.admit(voucher, UserId::new(user)).await.unwrap()
            }));
        }
        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap().is_admitted() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 100);
        assert_eq!(gate.stock(voucher).await.unwrap(), Some(0));
    }

    #[test]
    fn test_decision_labels() {
        assert_eq!(AdmissionDecision::OutOfStock.to_string(), "out_of_stock");
        assert!(!AdmissionDecision::Ended.is_admitted());
    }
}
