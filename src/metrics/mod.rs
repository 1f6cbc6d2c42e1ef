//! Metrics module
//!
//! Prometheus counters for cache lookups, rebuilds, admissions and order
//! persistence. Each [`Metrics`] owns its own registry so independent
//! instances (tests, multiple gates in one process) do not collide.

use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::error::Result;

/// Metric handles for one Flashgate instance.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    cache_lookups: IntCounterVec,
    rebuilds: IntCounterVec,
    admissions: IntCounterVec,
    orders: IntCounterVec,
    queue_depth: IntGauge,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    /// Create and register all metrics on a fresh registry.
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("flashgate".to_string()), None)?;

        let cache_lookups = IntCounterVec::new(
            Opts::new("cache_lookups_total", "Cache lookups by strategy and outcome"),
            &["strategy", "outcome"],
        )?;
        let rebuilds = IntCounterVec::new(
            Opts::new("cache_rebuilds_total", "Logical-expiry rebuilds by result"),
            &["result"],
        )?;
        let admissions = IntCounterVec::new(
            Opts::new("admissions_total", "Admission decisions"),
            &["decision"],
        )?;
        let orders = IntCounterVec::new(
            Opts::new("orders_total", "Order persistence outcomes"),
            &["outcome"],
        )?;
        let queue_depth = IntGauge::new("order_queue_depth", "Orders waiting to be persisted")?;

        registry.register(Box::new(cache_lookups.clone()))?;
        registry.register(Box::new(rebuilds.clone()))?;
        registry.register(Box::new(admissions.clone()))?;
        registry.register(Box::new(orders.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;

        Ok(Self {
            registry,
            cache_lookups,
            rebuilds,
            admissions,
            orders,
            queue_depth,
        })
    }

    /// Text exposition format of every registered metric.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    pub fn record_cache_lookup(&self, strategy: &str, outcome: &str) {
        self.cache_lookups
            .with_label_values(&[strategy, outcome])
            .inc();
    }

    pub fn cache_lookups(&self, strategy: &str, outcome: &str) -> u64 {
        self.cache_lookups
            .with_label_values(&[strategy, outcome])
            .get()
    }

    pub fn record_rebuild(&self, result: &str) {
        self.rebuilds.with_label_values(&[result]).inc();
    }

    pub fn rebuilds(&self, result: &str) -> u64 {
        self.rebuilds.with_label_values(&[result]).get()
    }

    pub fn record_admission(&self, decision: &str) {
        self.admissions.with_label_values(&[decision]).inc();
    }

    pub fn admissions(&self, decision: &str) -> u64 {
        self.admissions.with_label_values(&[decision]).get()
    }

    pub fn record_order(&self, outcome: &str) {
        self.orders.with_label_values(&[outcome]).inc();
    }

    pub fn orders(&self, outcome: &str) -> u64 {
        self.orders.with_label_values(&[outcome]).get()
    }

    pub fn queue_depth(&self) -> &IntGauge {
        &self.queue_depth
    }
}
