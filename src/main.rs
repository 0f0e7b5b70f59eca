//! Cachefront Soak Node
//!
//! Runs several cache nodes in one process against a shared in-memory store
//! and event bus, drives them with concurrent readers, and exposes their
//! metrics over HTTP.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Soak Harness                              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │   Workers    │───▶│ CacheManager │───▶│  Simulated   │       │
//! │  │ (get/invali- │    │  × nodes     │    │   Source     │       │
//! │  │  date mix)   │    │              │    │  (latency)   │       │
//! │  └──────────────┘    └──────┬───────┘    └──────────────┘       │
//! │                             │                                    │
//! │              InMemorySharedStore + InMemoryEventBus              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::Parser;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cachefront::adapters::{InMemoryEventBus, InMemorySharedStore, LoggingEventBus};
use cachefront::cache::render_prometheus;
use cachefront::domain::ports::SharedStore;
use cachefront::error::{BoxError, Error, Result};
use cachefront::{CacheConfig, CacheManager, EvictionPolicy, MetricsSnapshot};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Cachefront - cache-aside soak harness
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file (defaults apply when omitted)
    #[arg(long, env = "CACHEFRONT_CONFIG")]
    config: Option<String>,

    /// Override the L1 eviction policy (lru, lfu, fifo, random)
    #[arg(long, env = "EVICTION_POLICY", value_parser = parse_policy)]
    eviction_policy: Option<EvictionPolicy>,

    /// Number of cache nodes sharing the store
    #[arg(long, env = "NODES", default_value = "3")]
    nodes: usize,

    /// Concurrent reader tasks
    #[arg(long, env = "WORKERS", default_value = "32")]
    workers: usize,

    /// Size of the key space
    #[arg(long, env = "KEYS", default_value = "500")]
    keys: u64,

    /// Share of operations that invalidate instead of read (0.0 - 1.0)
    #[arg(long, env = "INVALIDATE_RATIO", default_value = "0.01")]
    invalidate_ratio: f64,

    /// Simulated source latency in milliseconds
    #[arg(long, env = "SOURCE_LATENCY_MS", default_value = "20")]
    source_latency_ms: u64,

    /// Run time in seconds (0 = until Ctrl-C)
    #[arg(long, env = "DURATION_SECS", default_value = "30")]
    duration_secs: u64,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

/// Record served by the simulated source
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Product {
    id: u64,
    name: String,
    price_cents: u64,
    loaded_at: DateTime<Utc>,
}

type Node = (String, Arc<CacheManager<Product>>);

fn parse_policy(s: &str) -> std::result::Result<EvictionPolicy, String> {
    s.parse::<EvictionPolicy>().map_err(|e| e.to_string())
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let mut config = match &args.config {
        Some(path) => CacheConfig::from_file(path)?,
        None => CacheConfig::default(),
    };
    if let Some(policy) = args.eviction_policy {
        config.eviction_policy = policy;
    }
    config.validate()?;

    info!("Starting Cachefront soak harness");
    info!("  Nodes: {}", args.nodes);
    info!("  Workers: {}", args.workers);
    info!("  Key space: {}", args.keys);
    info!("  Eviction policy: {}", config.eviction_policy);
    info!("  L1 capacity: {} entries / {} bytes", config.max_entries, config.max_bytes);

    let store = Arc::new(InMemorySharedStore::new());
    let bus = Arc::new(LoggingEventBus::new(InMemoryEventBus::new()));

    let mut nodes: Vec<Node> = Vec::with_capacity(args.nodes.max(1));
    for index in 0..args.nodes.max(1) {
        let manager = CacheManager::new(config.clone(), store.clone(), bus.clone()).await?;
        nodes.push((format!("node-{}", index), Arc::new(manager)));
    }
    let nodes = Arc::new(nodes);
    let source_calls = Arc::new(AtomicU64::new(0));

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let server_nodes = Arc::clone(&nodes);
    let server_store = store.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, server_nodes, server_store).await {
            error!("Metrics server error: {}", e);
        }
    });

    let cancel = CancellationToken::new();
    let mut workers = Vec::with_capacity(args.workers);
    for _ in 0..args.workers {
        workers.push(tokio::spawn(run_worker(
            Arc::clone(&nodes),
            Arc::clone(&source_calls),
            WorkerSettings {
                keys: args.keys.max(1),
                invalidate_ratio: args.invalidate_ratio.clamp(0.0, 1.0),
                source_latency: Duration::from_millis(args.source_latency_ms),
            },
            cancel.child_token(),
        )));
    }

    let run_for = (args.duration_secs > 0).then(|| Duration::from_secs(args.duration_secs));
    tokio::select! {
        _ = async {
            match run_for {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        } => info!("Soak duration elapsed"),
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Interrupted");
        }
    }

    cancel.cancel();
    for result in futures::future::join_all(workers).await {
        if let Err(e) = result {
            warn!("Worker task failed: {}", e);
        }
    }

    print_summary(&nodes, source_calls.load(Ordering::Relaxed))?;

    info!("Soak harness shutdown complete");
    Ok(())
}

// =============================================================================
// Workload
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct WorkerSettings {
    keys: u64,
    invalidate_ratio: f64,
    source_latency: Duration,
}

async fn run_worker(
    nodes: Arc<Vec<Node>>,
    source_calls: Arc<AtomicU64>,
    settings: WorkerSettings,
    cancel: CancellationToken,
) {
    while !cancel.is_cancelled() {
        let (node_index, id, invalidate) = {
            let mut rng = rand::thread_rng();
            (
                rng.gen_range(0..nodes.len()),
                rng.gen_range(0..settings.keys),
                rng.gen_bool(settings.invalidate_ratio),
            )
        };
        let (node_name, manager) = &nodes[node_index];
        let key = format!("product:{}", id);

        if invalidate {
            let outcome = manager.invalidate(&key).await;
            if !outcome.is_complete() {
                warn!(node = %node_name, key = %key, ?outcome, "Partial invalidation");
            }
            continue;
        }

        let calls = Arc::clone(&source_calls);
        let latency = settings.source_latency;
        let fetch = move || async move {
            calls.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(latency).await;
            Ok::<_, BoxError>(Product {
                id,
                name: format!("Product {}", id),
                price_cents: 100 + id * 7,
                loaded_at: Utc::now(),
            })
        };

        match manager.get_with_cancel(&key, fetch, &cancel).await {
            Ok(_) | Err(Error::Cancelled { .. }) => {}
            Err(e) => warn!(node = %node_name, key = %key, error = %e, "Read failed"),
        }
    }
}

fn print_summary(nodes: &[Node], source_calls: u64) -> Result<()> {
    let snapshots: Vec<(String, MetricsSnapshot)> = nodes
        .iter()
        .map(|(name, manager)| (name.clone(), manager.metrics()))
        .collect();

    for (name, snapshot) in &snapshots {
        info!(
            node = %name,
            hit_ratio = format!("{:.3}", snapshot.hit_ratio),
            l1_entries = snapshot.l1_entries,
            l1_evictions = snapshot.l1_evictions,
            source_fetches = snapshot.source_fetches,
            wait_timeouts = snapshot.wait_timeouts,
            stale_served = snapshot.stale_served,
            "Node summary"
        );
    }
    info!(source_calls, "Total source calls");

    let report: serde_json::Map<String, serde_json::Value> = snapshots
        .into_iter()
        .map(|(name, snapshot)| Ok((name, serde_json::to_value(snapshot)?)))
        .collect::<Result<_>>()?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
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

async fn run_metrics_server(
    addr: &str,
    nodes: Arc<Vec<Node>>,
    store: Arc<InMemorySharedStore>,
) -> Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;

    fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(body.into()));
        *response.status_mut() = status;
        response
    }

    async fn handle(
        req: Request<hyper::body::Incoming>,
        nodes: Arc<Vec<Node>>,
        store: Arc<InMemorySharedStore>,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let response = match req.uri().path() {
            "/metrics" => {
                let snapshots: Vec<(String, MetricsSnapshot)> = nodes
                    .iter()
                    .map(|(name, manager)| (name.clone(), manager.metrics()))
                    .collect();
                match render_prometheus(&snapshots) {
                    Ok(text) => {
                        let mut response = respond(StatusCode::OK, text);
                        response.headers_mut().insert(
                            CONTENT_TYPE,
                            HeaderValue::from_static("text/plain; version=0.0.4"),
                        );
                        response
                    }
                    Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                }
            }
            "/healthz" | "/livez" => respond(StatusCode::OK, "ok"),
            "/readyz" => match store.health_check().await {
                Ok(true) => respond(StatusCode::OK, "ok"),
                _ => respond(StatusCode::SERVICE_UNAVAILABLE, "shared store unavailable"),
            },
            _ => respond(StatusCode::NOT_FOUND, "not found"),
        };
        Ok(response)
    }

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid metrics server address: {}", e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind metrics server: {}", e)))?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| Error::Internal(format!("Metrics server accept error: {}", e)))?;

        let io = TokioIo::new(stream);
        let nodes = Arc::clone(&nodes);
        let store = Arc::clone(&store);

        tokio::spawn(async move {
            let service = service_fn(move |req| handle(req, Arc::clone(&nodes), Arc::clone(&store)));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Metrics server connection error: {}", e);
            }
        });
    }
}
