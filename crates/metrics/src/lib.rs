//! Metrics and tracing setup for ringstore.
//!
//! Provides a global [`NodeMetrics`] singleton backed by the `prometheus`
//! crate, plus an optional lightweight HTTP server for Prometheus scraping.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::OnceLock;

// ────────────────────────── Tracing ──────────────────────────

/// Initialize the tracing subscriber with env-filter.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

// ────────────────────────── Prometheus metrics ──────────────────────────

/// Global metrics instance.
static METRICS: OnceLock<NodeMetrics> = OnceLock::new();

/// Retrieve (or lazily create) the global metrics singleton.
pub fn metrics() -> &'static NodeMetrics {
    METRICS.get_or_init(NodeMetrics::new)
}

/// Storage phases timed by [`start_storage_timer`].
pub mod phase {
    pub const INDEX_READ: &str = "index_read";
    pub const DATA_READ: &str = "data_read";
    pub const DATA_WRITE: &str = "data_write";
    pub const INDEX_WRITE: &str = "index_write";
}

/// All Prometheus metrics for a ringstore node.
pub struct NodeMetrics {
    pub registry: Registry,

    // ── Peer RPCs ──
    pub rpcs_sent: IntCounter,
    pub rpcs_sent_by_type: IntCounterVec,
    pub rpc_latency_secs: HistogramVec,

    // ── Store operations ──
    pub store_puts: IntCounter,
    pub store_gets: IntCounter,
    pub store_deletes: IntCounter,
    pub storage_phase_secs: HistogramVec,
    pub offset_cache_hits: IntCounter,
    pub offset_cache_misses: IntCounter,

    // ── Replication ──
    pub replicas_forwarded: IntCounter,
    pub objects_migrated: IntCounter,
    pub replication_failures: IntCounter,
    pub topology_events: IntCounterVec,
}

// Manual Debug impl because prometheus types don't derive Debug.
impl std::fmt::Debug for NodeMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeMetrics").finish_non_exhaustive()
    }
}

/// Default histogram buckets (seconds) for RPC latency.
const LATENCY_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0];

/// Finer buckets for local disk phases.
const STORAGE_BUCKETS: &[f64] = &[0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5];

fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::with_opts(Opts::new(name, help)).expect("valid counter opts")
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    IntCounterVec::new(Opts::new(name, help), labels).expect("valid counter vec opts")
}

fn histogram_vec(name: &str, help: &str, buckets: &[f64], labels: &[&str]) -> HistogramVec {
    HistogramVec::new(
        HistogramOpts::new(name, help).buckets(buckets.to_vec()),
        labels,
    )
    .expect("valid histogram opts")
}

impl NodeMetrics {
    fn new() -> Self {
        let registry = Registry::new();

        let rpcs_sent = counter("ringstore_rpcs_sent_total", "Total outbound peer RPCs sent");
        let rpcs_sent_by_type = counter_vec(
            "ringstore_rpcs_sent_by_type_total",
            "Outbound peer RPCs sent, by type",
            &["rpc_type"],
        );
        let rpc_latency_secs = histogram_vec(
            "ringstore_rpc_latency_seconds",
            "Peer RPC latency in seconds",
            LATENCY_BUCKETS,
            &["rpc_type", "direction"],
        );

        let store_puts = counter("ringstore_store_puts_total", "Values appended to the local store");
        let store_gets = counter("ringstore_store_gets_total", "Reads served by the local store");
        let store_deletes = counter(
            "ringstore_store_deletes_total",
            "Tombstones appended to the local store",
        );
        let storage_phase_secs = histogram_vec(
            "ringstore_storage_phase_seconds",
            "Time spent in each storage phase",
            STORAGE_BUCKETS,
            &["phase"],
        );
        let offset_cache_hits = counter(
            "ringstore_offset_cache_hits_total",
            "Latest-offset cache hits",
        );
        let offset_cache_misses = counter(
            "ringstore_offset_cache_misses_total",
            "Latest-offset cache misses",
        );

        let replicas_forwarded = counter(
            "ringstore_replicas_forwarded_total",
            "Entries forwarded down the replica chain",
        );
        let objects_migrated = counter(
            "ringstore_objects_migrated_total",
            "Entries handed to a new predecessor",
        );
        let replication_failures = counter(
            "ringstore_replication_failures_total",
            "Replication or migration batches that failed",
        );
        let topology_events = counter_vec(
            "ringstore_topology_events_total",
            "Ring topology events handled, by kind",
            &["kind"],
        );

        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(rpcs_sent.clone()),
            Box::new(rpcs_sent_by_type.clone()),
            Box::new(rpc_latency_secs.clone()),
            Box::new(store_puts.clone()),
            Box::new(store_gets.clone()),
            Box::new(store_deletes.clone()),
            Box::new(storage_phase_secs.clone()),
            Box::new(offset_cache_hits.clone()),
            Box::new(offset_cache_misses.clone()),
            Box::new(replicas_forwarded.clone()),
            Box::new(objects_migrated.clone()),
            Box::new(replication_failures.clone()),
            Box::new(topology_events.clone()),
        ];
        for collector in collectors {
            registry.register(collector).expect("metric registered once");
        }

        Self {
            registry,
            rpcs_sent,
            rpcs_sent_by_type,
            rpc_latency_secs,
            store_puts,
            store_gets,
            store_deletes,
            storage_phase_secs,
            offset_cache_hits,
            offset_cache_misses,
            replicas_forwarded,
            objects_migrated,
            replication_failures,
            topology_events,
        }
    }
}

/// Encode all registered metrics in Prometheus text exposition format.
pub fn encode_metrics() -> String {
    let m = metrics();
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&m.registry.gather(), &mut buf) {
        tracing::warn!("prometheus encoding failed: {}", e);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Count an outbound RPC and start its latency timer. The returned guard
/// records elapsed time on drop.
pub fn start_rpc_timer(rpc_type: &str) -> prometheus::HistogramTimer {
    let m = metrics();
    m.rpcs_sent.inc();
    m.rpcs_sent_by_type.with_label_values(&[rpc_type]).inc();
    m.rpc_latency_secs
        .with_label_values(&[rpc_type, "outbound"])
        .start_timer()
}

/// Start a storage phase timer (see [`phase`]).
pub fn start_storage_timer(phase: &str) -> prometheus::HistogramTimer {
    metrics()
        .storage_phase_secs
        .with_label_values(&[phase])
        .start_timer()
}

// ────────────────────────── Metrics HTTP server ──────────────────────────

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

async fn metrics_handler(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::http::Error> {
    if req.uri().path() != "/metrics" {
        return Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from_static(b"not found\n")));
    }
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
        .body(Full::new(Bytes::from(encode_metrics())))
}

/// Serve Prometheus metrics on the given address (`GET /metrics`).
///
/// Runs until the listener fails. Call from a `tokio::spawn`.
pub async fn serve_metrics(
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    serve_metrics_on(listener).await
}

/// Serve Prometheus metrics on an already-bound listener.
pub async fn serve_metrics_on(
    listener: TcpListener,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing::info!(
        "metrics server listening on http://{}/metrics",
        listener.local_addr()?
    );

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_handler))
                .await
            {
                tracing::debug!("metrics connection error: {}", e);
            }
        });
    }
}

// ────────────────────────── Tests ──────────────────────────
