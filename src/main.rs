//! Flashgate Flash-Sale Simulator
//!
//! Drives a flash sale end to end against either the in-memory substrate or
//! a Redis server.
//!
//! # Flow
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  seed voucher ─▶ warm voucher cache ─▶ N concurrent purchasers   │
//! │                                          │ cache read            │
//! │                                          │ place_order           │
//! │                                          ▼                       │
//! │                              drain pipeline ─▶ summary           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use flashgate::adapters::{InMemoryKeyValueStore, InMemoryOrderStore, RedisConfig, RedisStore};
use flashgate::domain::ports::{KeyValueStore, UserId, VoucherId};
use flashgate::error::{Error, Result};
use flashgate::metrics::Metrics;
use flashgate::{
    cache_prefix, AdmissionGate, CacheStore, Config, DistributedLock, IdAllocator, Lock,
    OrderIngestPipeline, PlaceOrderOutcome, VoucherOrderService,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Flashgate - flash-sale admission simulator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Redis address (host:port). Uses the in-memory substrate when unset
    #[arg(long, env = "REDIS_ADDR")]
    redis_addr: Option<String>,

    /// Redis password
    #[arg(long, env = "REDIS_PASSWORD")]
    redis_password: Option<String>,

    /// JSON configuration file
    #[arg(long, env = "FLASHGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Voucher on sale
    #[arg(long, default_value = "1")]
    voucher: u64,

    /// Units on sale
    #[arg(long, default_value = "100")]
    stock: u32,

    /// Distinct purchasers
    #[arg(long, default_value = "1000")]
    users: u64,

    /// Purchase attempts per user
    #[arg(long, default_value = "2")]
    attempts: u32,

    /// Concurrent purchase requests in flight
    #[arg(long, default_value = "64")]
    concurrency: usize,

    /// Order queue capacity (overrides config)
    #[arg(long, env = "QUEUE_CAPACITY")]
    queue_capacity: Option<usize>,

    /// Cache rebuild workers (overrides config)
    #[arg(long, env = "REBUILD_WORKERS")]
    rebuild_workers: Option<usize>,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

/// Voucher details served from the cache during the sale.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct VoucherInfo {
    id: u64,
    title: String,
    stock: u32,
}

#[derive(Debug, Default)]
struct Tally {
    accepted: u64,
    rejected: u64,
    queue_full: u64,
    failed: u64,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = load_config(&args)?;
    info!("Starting Flashgate simulation");
    info!("  Voucher: {} ({} units)", args.voucher, args.stock);
    info!("  Users: {} x {} attempts", args.users, args.attempts);
    info!("  Queue capacity: {}", config.pipeline.queue_capacity);
    info!("  Rebuild workers: {}", config.cache.rebuild_workers);

    let store: Arc<dyn KeyValueStore> = match &args.redis_addr {
        Some(addr) => {
            let redis = RedisStore::connect(RedisConfig {
                addr: addr.clone(),
                password: args.redis_password.clone(),
                ..Default::default()
            })
            .await
            .map_err(|e| {
                error!("Failed to connect to Redis: {}", e);
                e
            })?;
            Arc::new(redis)
        }
        None => {
            info!("Using in-memory substrate");
            Arc::new(InMemoryKeyValueStore::new())
        }
    };

    let metrics = Metrics::new()?;
    if let Some(addr) = args.metrics_addr.clone() {
        let registry = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(&addr, registry).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    let voucher = VoucherId::new(args.voucher);
    let orders = Arc::new(InMemoryOrderStore::new().with_voucher(voucher, args.stock as i64));

    // Seed the sale; simulators sharing a substrate seed one at a time
    let gate = AdmissionGate::new(store.clone(), metrics.clone());
    let seed_lock = DistributedLock::new(store.clone(), format!("sale:{}:seed", voucher));
    if !seed_lock.acquire_with(&config.lock).await? {
        return Err(Error::LockContention {
            resource: seed_lock.name().to_string(),
        });
    }
    let seeded = gate.register_voucher(voucher, args.stock, None).await;
    if let Err(e) = seed_lock.release().await {
        warn!(lock = %seed_lock.key(), error = %e, "Failed to release seed lock");
    }
    seeded?;

    let cache = Arc::new(CacheStore::new(store.clone(), config.cache.clone(), metrics.clone()));
    let prefix = cache_prefix("voucher");
    let info_ttl = config.cache.default_ttl;
    let stock = args.stock;
    cache
        .preload(&prefix, voucher.get(), move |id| async move { Ok(Some(voucher_info(id, stock))) }, info_ttl)
        .await?;

    let pipeline = Arc::new(OrderIngestPipeline::start(
        store.clone(),
        orders.clone(),
        &config.pipeline,
        metrics.clone(),
    ));
    let service = Arc::new(VoucherOrderService::new(
        gate,
        IdAllocator::new(store.clone()),
        pipeline.clone(),
        config.pipeline.order_sequence.clone(),
    ));

    // Run purchasers
    let attempts = (1..=args.users).flat_map(|user| (0..args.attempts).map(move |_| user));
    let results: Vec<Result<PlaceOrderOutcome>> = stream::iter(attempts)
        .map(|user| {
            purchase(
                service.clone(),
                cache.clone(),
                prefix.clone(),
                voucher,
                UserId::new(user),
                stock,
                info_ttl,
            )
        })
        .buffer_unordered(args.concurrency.max(1))
        .collect()
        .await;

    let mut tally = Tally::default();
    for result in &results {
        match result {
            Ok(PlaceOrderOutcome::Accepted(_)) => tally.accepted += 1,
            Ok(PlaceOrderOutcome::Rejected(_)) => tally.rejected += 1,
            Err(Error::QueueFull { .. }) => tally.queue_full += 1,
            Err(e) => {
                warn!("Purchase failed: {}", e);
                tally.failed += 1;
            }
        }
    }

    info!("Draining order pipeline");
    pipeline.shutdown().await;
    cache.rebuild_pool().wait_idle().await;

    let persisted = orders.order_count();
    info!("Simulation complete");
    info!("  Accepted: {}", tally.accepted);
    info!("  Rejected: {}", tally.rejected);
    info!("  Queue full: {}", tally.queue_full);
    info!("  Failed: {}", tally.failed);
    info!("  Durable orders: {}", persisted);
    info!("  Durable stock left: {:?}", orders.stock(voucher));
    info!("  Cached stock left: {:?}", service.gate().stock(voucher).await?);

    if persisted as u64 > args.stock as u64 {
        return Err(Error::InvariantViolation(format!(
            "{} orders persisted for {} units",
            persisted, args.stock
        )));
    }

    Ok(())
}

/// One purchaser: read the voucher details, then try to buy.
async fn purchase(
    service: Arc<VoucherOrderService>,
    cache: Arc<CacheStore>,
    prefix: String,
    voucher: VoucherId,
    user: UserId,
    stock: u32,
    ttl: Duration,
) -> Result<PlaceOrderOutcome> {
    let info: Option<VoucherInfo> = cache
        .get_with_logical_expiry(
            &prefix,
            voucher.get(),
            move |id| async move { Ok(Some(voucher_info(id, stock))) },
            ttl,
        )
        .await?;
    if info.is_none() {
        return Err(Error::VoucherNotFound(voucher.get()));
    }
    service.place_order(voucher, user).await
}

fn voucher_info(id: u64, stock: u32) -> VoucherInfo {
    VoucherInfo {
        id,
        title: format!("Flash voucher #{}", id),
        stock,
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(capacity) = args.queue_capacity {
        config.pipeline.queue_capacity = capacity;
    }
    if let Some(workers) = args.rebuild_workers {
        config.cache.rebuild_workers = workers;
    }
    config.validate()?;
    Ok(config)
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "hyper_util=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, metrics: Metrics) -> Result<()> {
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::Request;
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Config(format!("Invalid metrics server address: {}", e)))?;

    let listener = TcpListener::bind(addr).await?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let response = route(&metrics, req.uri().path());
                async move { Ok::<_, std::convert::Infallible>(response) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Metrics server connection error: {}", e);
            }
        });
    }
}

/// Answer one metrics-server request path.
fn route(
    metrics: &Metrics,
    path: &str,
) -> hyper::Response<http_body_util::Full<hyper::body::Bytes>> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::StatusCode;

    match path {
        "/metrics" => match metrics.render() {
            Ok(text) => {
                let mut response = respond(StatusCode::OK, text);
                response.headers_mut().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static(prometheus::TEXT_FORMAT),
                );
                response
            }
            Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        },
        "/healthz" => respond(StatusCode::OK, "ok"),
        _ => respond(StatusCode::NOT_FOUND, "not found"),
    }
}

fn respond(
    status: hyper::StatusCode,
    body: impl Into<hyper::body::Bytes>,
) -> hyper::Response<http_body_util::Full<hyper::body::Bytes>> {
    let mut response = hyper::Response::new(http_body_util::Full::new(body.into()));
    *response.status_mut() = status;
    response
}
