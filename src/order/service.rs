//! Purchase entry point: admit, mint an order id, hand off for persistence.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use super::gate::{AdmissionDecision, AdmissionGate};
use super::pipeline::OrderIngestPipeline;
use crate::domain::ports::{Clock, OrderId, PendingOrder, SystemClock, UserId, VoucherId};
use crate::error::Result;
use crate::id::IdAllocator;

/// What a purchaser is told.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceOrderOutcome {
    /// Admitted and queued; persistence happens asynchronously
    Accepted(OrderId),
    /// Refused by the admission gate
    Rejected(AdmissionDecision),
}

impl PlaceOrderOutcome {
    pub fn order_id(&self) -> Option<OrderId> {
        match self {
            PlaceOrderOutcome::Accepted(id) => Some(*id),
            PlaceOrderOutcome::Rejected(_) => None,
        }
    }
}

/// Flash-sale order façade.
pub struct VoucherOrderService {
    gate: AdmissionGate,
    ids: IdAllocator,
    pipeline: Arc<OrderIngestPipeline>,
    clock: Arc<dyn Clock>,
    sequence: String,
}

impl std::fmt::Debug for VoucherOrderService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoucherOrderService")
            .field("sequence", &self.sequence)
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

impl VoucherOrderService {
    pub fn new(
        gate: AdmissionGate,
        ids: IdAllocator,
        pipeline: Arc<OrderIngestPipeline>,
        sequence: impl Into<String>,
    ) -> Self {
        Self {
            gate,
            ids,
            pipeline,
            clock: Arc::new(SystemClock),
            sequence: sequence.into(),
        }
    }

    /// Use `clock` for order timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    pub fn pipeline(&self) -> &Arc<OrderIngestPipeline> {
        &self.pipeline
    }

    /// Try to buy one unit of `voucher` for `user`.
    ///
    /// Returns as soon as the order is queued. An `Err` means the request
    /// failed; a refusal by the gate is `Ok(Rejected(..))`.
    #[instrument(skip(self))]
    pub async fn place_order(&self, voucher: VoucherId, user: UserId) -> Result<PlaceOrderOutcome> {
        let decision = self.gate.admit(voucher, user).await?;
        if !decision.is_admitted() {
            return Ok(PlaceOrderOutcome::Rejected(decision));
        }

        let order_id = OrderId::new(self.ids.next_id(&self.sequence).await?);
        let order = PendingOrder::new(order_id, voucher, user, self.clock.now());
        if let Err(e) = self.pipeline.enqueue(order) {
            // Substrate already counts this user as a purchaser
            warn!(%order_id, error = %e, "Admitted order not queued");
            return Err(e);
        }

        info!(%order_id, "Order accepted");
        Ok(PlaceOrderOutcome::Accepted(order_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryKeyValueStore, InMemoryOrderStore};
    use crate::config::PipelineConfig;
    use crate::error::Error;
    use crate::metrics::Metrics;

    fn service(
        stock: u32,
        capacity: usize,
    ) -> (Arc<InMemoryOrderStore>, VoucherOrderService, impl std::future::Future<Output = ()>) {
        let kv = Arc::new(InMemoryKeyValueStore::new());
        let orders = Arc::new(InMemoryOrderStore::new().with_voucher(VoucherId::new(1), stock as i64));
        let metrics = Metrics::new().unwrap();
        let config = PipelineConfig {
            queue_capacity: capacity,
            ..Default::default()
        };
        let pipeline = Arc::new(OrderIngestPipeline::start(
            kv.clone(),
            orders.clone(),
            &config,
            metrics.clone(),
        ));
        let gate = AdmissionGate::new(kv.clone(), metrics);
        let svc = VoucherOrderService::new(gate.clone(), IdAllocator::new(kv), pipeline, "order");
        let seed = async move {
            gate.register_voucher(VoucherId::new(1), stock, None)
                .await
                .unwrap();
        };
        (orders, svc, seed)
    }

    #[tokio::test]
    async fn test_accepted_order_becomes_durable() {
        let (orders, svc, seed) = service(5, 16);
        seed.await;

        let outcome = svc.place_order(VoucherId::new(1), UserId::new(42)).await.unwrap();
        let order_id = outcome.order_id().unwrap();
        svc.pipeline().shutdown().await;

        let persisted = orders.orders();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].order_id, order_id);
        assert_eq!(persisted[0].user_id, UserId::new(42));
    }

    #[tokio::test]
    async fn test_rejections_do_not_queue() {
        let (orders, svc, seed) = service(2, 16);
        seed.await;

        let first = svc.place_order(VoucherId::new(1), UserId::new(1)).await.unwrap();
        assert!(first.order_id().is_some());
        assert_eq!(
            svc.place_order(VoucherId::new(1), UserId::new(1)).await.unwrap(),
            PlaceOrderOutcome::Rejected(AdmissionDecision::AlreadyPurchased)
        );
        let second = svc.place_order(VoucherId::new(1), UserId::new(2)).await.unwrap();
        assert!(second.order_id().is_some());
        assert_eq!(
            svc.place_order(VoucherId::new(1), UserId::new(3)).await.unwrap(),
            PlaceOrderOutcome::Rejected(AdmissionDecision::OutOfStock)
        );
        svc.pipeline().shutdown().await;
        assert_eq!(orders.order_count(), 2);
    }

    #[tokio::test]
    async fn test_sold_out_repeat_buyer_sees_out_of_stock() {
        // Stock is checked before the purchaser set
        let (orders, svc, seed) = service(1, 16);
        seed.await;

        svc.place_order(VoucherId::new(1), UserId::new(1)).await.unwrap();
        assert_eq!(
            svc.place_order(VoucherId::new(1), UserId::new(1)).await.unwrap(),
            PlaceOrderOutcome::Rejected(AdmissionDecision::OutOfStock)
        );
        svc.pipeline().shutdown().await;
        assert_eq!(orders.order_count(), 1);
    }

    #[tokio::test]
    async fn test_queue_full_distinct_from_rejection() {
        let (_, svc, seed) = service(10, 1);
        seed.await;

        let mut outcomes = Vec::new();
        for user in 0..3 {
            outcomes.push(svc.place_order(VoucherId::new(1), UserId::new(user)).await);
        }
        assert!(outcomes
            .iter()
            .any(|o| matches!(o, Err(Error::QueueFull { .. }))));
        assert!(outcomes
            .iter()
            .all(|o| !matches!(o, Ok(PlaceOrderOutcome::Rejected(_)))));
        svc.pipeline().shutdown().await;
    }
}
