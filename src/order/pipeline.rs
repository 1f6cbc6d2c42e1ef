//! Order Ingest Pipeline
//!
//! Admitted orders are persisted asynchronously:
//!
//! ```text
//! enqueue ──try_send──▶ [bounded queue] ──recv──▶ worker
//!                                                  │ lock:order:<userId>
//!                                                  │ OrderStore::commit_order
//!                                                  └ release
//! ```
//!
//! A full queue is reported to the caller, never waited on. On shutdown the
//! queue stops accepting orders and the worker drains what it already holds.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::PipelineConfig;
use crate::domain::ports::{KeyValueStore, OrderStore, PendingOrder, PersistOutcome};
use crate::error::{Error, Result};
use crate::lock::{DistributedLock, Lock};
use crate::metrics::Metrics;

/// Bounded queue plus a single persistence worker.
pub struct OrderIngestPipeline {
    tx: mpsc::Sender<PendingOrder>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    metrics: Metrics,
}

impl std::fmt::Debug for OrderIngestPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderIngestPipeline")
            .field("queued", &self.queued())
            .field("closed", &self.cancel.is_cancelled())
            .finish()
    }
}

impl OrderIngestPipeline {
    /// Spawn the worker on the current Tokio runtime.
    pub fn start(
        store: Arc<dyn KeyValueStore>,
        orders: Arc<dyn OrderStore>,
        config: &PipelineConfig,
        metrics: Metrics,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let cancel = CancellationToken::new();
        let worker = PersistWorker {
            store,
            orders,
            lock_ttl: config.order_lock_ttl,
            metrics: metrics.clone(),
        };
        let handle = tokio::spawn(worker.run(rx, cancel.clone()));

        Self {
            tx,
            cancel,
            worker: Mutex::new(Some(handle)),
            metrics,
        }
    }

    /// Queue an admitted order without waiting.
    pub fn enqueue(&self, order: PendingOrder) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::PipelineClosed);
        }
        let order_id = order.order_id.get();
        // Count before sending: the worker may dequeue before try_send returns
        self.metrics.queue_depth().inc();
        match self.tx.try_send(order) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.metrics.queue_depth().dec();
                self.metrics.record_order("queue_full");
                Err(Error::QueueFull { order_id })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.metrics.queue_depth().dec();
                Err(Error::PipelineClosed)
            }
        }
    }

    /// Orders accepted but not yet taken by the worker.
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop accepting orders and wait until every accepted order has been
    /// processed.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Order worker terminated abnormally");
            }
        }
    }
}

struct PersistWorker {
    store: Arc<dyn KeyValueStore>,
    orders: Arc<dyn OrderStore>,
    lock_ttl: Duration,
    metrics: Metrics,
}

impl PersistWorker {
    async fn run(self, mut rx: mpsc::Receiver<PendingOrder>, cancel: CancellationToken) {
        info!("Order worker started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    rx.close();
                    let mut drained = 0usize;
                    while let Some(order) = rx.recv().await {
                        self.persist(order).await;
                        drained += 1;
                    }
                    info!(drained, "Order worker drained queue, shutting down");
                    break;
                }
                next = rx.recv() => match next {
                    Some(order) => self.persist(order).await,
                    None => break,
                },
            }
        }
    }

    #[instrument(skip(self, order), fields(order_id = %order.order_id, user_id = %order.user_id))]
    async fn persist(&self, order: PendingOrder) {
        self.metrics.queue_depth().dec();

        let lock = DistributedLock::new(self.store.clone(), format!("order:{}", order.user_id));
        match lock.try_acquire(self.lock_ttl).await {
            Ok(true) => {}
            Ok(false) => {
                // Admission guarantees one order per user, so nobody else should hold this
                error!(lock = %lock.key(), "Per-user order lock already held, dropping order");
                self.metrics.record_order("lock_contended");
                return;
            }
            Err(e) => {
                error!(error = %e, "Failed to take per-user order lock, dropping order");
                self.metrics.record_order("failed");
                return;
            }
        }

        match self.orders.commit_order(&order).await {
            Ok(PersistOutcome::Persisted) => {
                debug!(voucher_id = %order.voucher_id, "Order persisted");
                self.metrics.record_order("persisted");
            }
            Ok(PersistOutcome::Duplicate) => {
                let violation = Error::InvariantViolation(format!(
                    "user {} already holds an order for voucher {}",
                    order.user_id, order.voucher_id
                ));
                error!(error = %violation, "Admitted order rejected as duplicate");
                self.metrics.record_order("duplicate");
            }
            Ok(PersistOutcome::OutOfStock) => {
                let violation = Error::InvariantViolation(format!(
                    "durable stock for voucher {} exhausted after admission",
                    order.voucher_id
                ));
                error!(error = %violation, "Admitted order rejected by durable stock");
                self.metrics.record_order("out_of_stock");
            }
            Err(e) => {
                error!(error = %e, "Failed to persist order");
                self.metrics.record_order("failed");
            }
        }

        if let Err(e) = lock.release().await {
            warn!(lock = %lock.key(), error = %e, "Failed to release per-user order lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryKeyValueStore, InMemoryOrderStore};
    use crate::domain::ports::{OrderId, UserId, VoucherId};
    use chrono::Utc;

    fn order(id: u64, voucher: u64, user: u64) -> PendingOrder {
        PendingOrder::new(OrderId::new(id), VoucherId::new(voucher), UserId::new(user), Utc::now())
    }

    fn start(
        kv: &Arc<InMemoryKeyValueStore>,
        orders: &Arc<InMemoryOrderStore>,
        capacity: usize,
    ) -> (OrderIngestPipeline, Metrics) {
        let metrics = Metrics::new().unwrap();
        let config = PipelineConfig {
            queue_capacity: capacity,
            ..Default::default()
        };
        let pipeline = OrderIngestPipeline::start(kv.clone(), orders.clone(), &config, metrics.clone());
        (pipeline, metrics)
    }

    #[tokio::test]
    async fn test_orders_persisted_and_locks_released() {
        let kv = Arc::new(InMemoryKeyValueStore::new());
        let orders = Arc::new(InMemoryOrderStore::new().with_voucher(VoucherId::new(1), 10));
        let (pipeline, metrics) = start(&kv, &orders, 16);

        for user in 1..=3 {
            pipeline.enqueue(order(user, 1, user)).unwrap();
        }
        pipeline.shutdown().await;

        assert_eq!(orders.order_count(), 3);
        assert_eq!(orders.stock(VoucherId::new(1)), Some(7));
        assert_eq!(metrics.orders("persisted"), 3);
        assert_eq!(metrics.queue_depth().get(), 0);
        for user in 1..=3 {
            assert!(!kv.contains(&format!("lock:order:{}", user)));
        }
    }

    #[tokio::test]
    async fn test_queue_full_is_an_error() {
        let kv = Arc::new(InMemoryKeyValueStore::new());
        let orders = Arc::new(InMemoryOrderStore::new().with_voucher(VoucherId::new(1), 10));
        // enqueue never yields, so the worker cannot drain between sends
        let (pipeline, metrics) = start(&kv, &orders, 1);

        let mut full = None;
        for id in 0..64 {
            if let Err(e) = pipeline.enqueue(order(id, 1, id)) {
                full = Some(e);
                break;
            }
        }
        assert!(matches!(full, Some(Error::QueueFull { .. })));
        assert!(metrics.orders("queue_full") >= 1);
        pipeline.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_queue_depth_tracks_queued_orders() {
        let kv = Arc::new(InMemoryKeyValueStore::new());
        let orders = Arc::new(InMemoryOrderStore::new().with_voucher(VoucherId::new(1), 1000));
        let (pipeline, metrics) = start(&kv, &orders, 1);

        let mut rejected = 0;
        for id in 0..500 {
            if pipeline.enqueue(order(id, 1, id)).is_err() {
                rejected += 1;
            }
            let depth = metrics.queue_depth().get();
            assert!((0..=2).contains(&depth), "queue depth {}", depth);
        }
        pipeline.shutdown().await;

        assert_eq!(metrics.queue_depth().get(), 0);
        assert_eq!(orders.order_count() + rejected, 500);
    }

    #[tokio::test]
    async fn test_queue_full_leaves_depth_at_queued() {
        let kv = Arc::new(InMemoryKeyValueStore::new());
        let orders = Arc::new(InMemoryOrderStore::new().with_voucher(VoucherId::new(1), 10));
        let (pipeline, metrics) = start(&kv, &orders, 1);

        pipeline.enqueue(order(1, 1, 1)).unwrap();
        assert!(matches!(pipeline.enqueue(order(2, 1, 2)), Err(Error::QueueFull { .. })));
        assert_eq!(metrics.queue_depth().get(), pipeline.queued() as i64);
        assert_eq!(metrics.queue_depth().get(), 1);

        pipeline.shutdown().await;
        assert_eq!(metrics.queue_depth().get(), 0);
        assert!(matches!(pipeline.enqueue(order(3, 1, 3)), Err(Error::PipelineClosed)));
        assert_eq!(metrics.queue_depth().get(), 0);
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_rejected() {
        let kv = Arc::new(InMemoryKeyValueStore::new());
        let orders = Arc::new(InMemoryOrderStore::new());
        let (pipeline, _) = start(&kv, &orders, 4);
        pipeline.shutdown().await;

        assert!(pipeline.is_closed());
        assert!(matches!(pipeline.enqueue(order(1, 1, 1)), Err(Error::PipelineClosed)));
    }

    #[tokio::test]
    async fn test_held_user_lock_drops_order() {
        let kv = Arc::new(InMemoryKeyValueStore::new());
        let orders = Arc::new(InMemoryOrderStore::new().with_voucher(VoucherId::new(1), 10));
        let holder = DistributedLock::new(kv.clone(), "order:7");
        assert!(holder.try_acquire(Duration::from_secs(30)).await.unwrap());

        let (pipeline, metrics) = start(&kv, &orders, 4);
        pipeline.enqueue(order(1, 1, 7)).unwrap();
        pipeline.shutdown().await;

        assert_eq!(orders.order_count(), 0);
        assert_eq!(metrics.orders("lock_contended"), 1);
        assert!(holder.is_held().await.unwrap());
    }

    #[tokio::test]
    async fn test_durable_rejections_counted() {
        let kv = Arc::new(InMemoryKeyValueStore::new());
        let orders = Arc::new(InMemoryOrderStore::new().with_voucher(VoucherId::new(1), 1));
        let (pipeline, metrics) = start(&kv, &orders, 8);

        pipeline.enqueue(order(1, 1, 1)).unwrap();
        pipeline.enqueue(order(2, 1, 1)).unwrap();
        pipeline.enqueue(order(3, 1, 2)).unwrap();
        pipeline.shutdown().await;

        assert_eq!(orders.order_count(), 1);
        assert_eq!(metrics.orders("persisted"), 1);
        assert_eq!(metrics.orders("duplicate"), 1);
        assert_eq!(metrics.orders("out_of_stock"), 1);
    }

    #[tokio::test]
    async fn test_store_failure_releases_lock() {
        let kv = Arc::new(InMemoryKeyValueStore::new());
        let orders = Arc::new(InMemoryOrderStore::new().with_voucher(VoucherId::new(1), 1));
        orders.set_unavailable(true);
        let (pipeline, metrics) = start(&kv, &orders, 4);

        pipeline.enqueue(order(1, 1, 5)).unwrap();
        pipeline.shutdown().await;

        assert_eq!(metrics.orders("failed"), 1);
        assert!(!kv.contains("lock:order:5"));
    }
}
