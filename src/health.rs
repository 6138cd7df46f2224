use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "spanflow";

/// Prometheus metrics for the collector.
///
/// All metrics use the "spanflow" namespace. Drop counters carry a `reason`
/// label taken from [`crate::error::StreamError::reason`] or `late`.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Records handed to a graph entry, by graph.
    pub records_submitted: CounterVec,
    /// Records accepted by a stage worker, by stage.
    pub records_processed: CounterVec,
    /// Records dropped, by graph, stage and reason.
    pub records_dropped: CounterVec,
    /// Current depth of each stage's inbound queue.
    pub stage_queue_length: GaugeVec,

    /// Inter-node messages by outcome (sent/received/failed).
    pub remote_messages: CounterVec,

    /// Segments received by the ingestion endpoint.
    pub segments_received: Counter,
    /// Name exchange outcomes (deferred/retried/discarded).
    pub exchange_outcomes: CounterVec,

    /// Flush tick duration per graph.
    pub flush_duration: HistogramVec,
    /// Rows written per graph.
    pub rows_flushed: CounterVec,
    /// Failed flush ticks per graph.
    pub flush_errors: CounterVec,

    /// Rows deleted by the TTL sweeper, by entity type.
    pub ttl_rows_deleted: CounterVec,
    /// Number of nodes in the current cluster directory.
    pub cluster_nodes: Gauge,
    /// Alarms raised, by kind.
    pub alarms_raised: CounterVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let records_submitted = CounterVec::new(
            Opts::new(
                "records_submitted_total",
                "Records submitted to a graph entry stage.",
            )
            .namespace(NAMESPACE),
            &["graph"],
        )?;
        let records_processed = CounterVec::new(
            Opts::new(
                "records_processed_total",
                "Records accepted by a stage worker.",
            )
            .namespace(NAMESPACE),
            &["graph", "stage"],
        )?;
        let records_dropped = CounterVec::new(
            Opts::new("records_dropped_total", "Records dropped by reason.").namespace(NAMESPACE),
            &["graph", "stage", "reason"],
        )?;
        let stage_queue_length = GaugeVec::new(
            Opts::new(
                "stage_queue_length",
                "Records waiting in a stage inbound queue.",
            )
            .namespace(NAMESPACE),
            &["graph", "stage"],
        )?;

        let remote_messages = CounterVec::new(
            Opts::new(
                "remote_messages_total",
                "Inter-node messages by outcome.",
            )
            .namespace(NAMESPACE),
            &["outcome"],
        )?;

        let segments_received = Counter::with_opts(
            Opts::new(
                "segments_received_total",
                "Trace segments received for ingestion.",
            )
            .namespace(NAMESPACE),
        )?;
        let exchange_outcomes = CounterVec::new(
            Opts::new(
                "exchange_outcomes_total",
                "Segments deferred, retried or discarded by name exchange.",
            )
            .namespace(NAMESPACE),
            &["outcome"],
        )?;

        let flush_duration = HistogramVec::new(
            HistogramOpts::new("flush_duration_seconds", "Duration of a flush tick per graph.")
                .namespace(NAMESPACE)
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["graph"],
        )?;
        let rows_flushed = CounterVec::new(
            Opts::new("rows_flushed_total", "Rows written to storage per graph.")
                .namespace(NAMESPACE),
            &["graph"],
        )?;
        let flush_errors = CounterVec::new(
            Opts::new("flush_errors_total", "Failed flush ticks per graph.").namespace(NAMESPACE),
            &["graph"],
        )?;

        let ttl_rows_deleted = CounterVec::new(
            Opts::new(
                "ttl_rows_deleted_total",
                "Rows deleted after their retention expired.",
            )
            .namespace(NAMESPACE),
            &["entity_type"],
        )?;
        let cluster_nodes = Gauge::with_opts(
            Opts::new("cluster_nodes", "Nodes in the cluster directory.").namespace(NAMESPACE),
        )?;
        let alarms_raised = CounterVec::new(
            Opts::new("alarms_raised_total", "Alarms raised by kind.").namespace(NAMESPACE),
            &["kind"],
        )?;

        registry.register(Box::new(records_submitted.clone()))?;
        registry.register(Box::new(records_processed.clone()))?;
        registry.register(Box::new(records_dropped.clone()))?;
        registry.register(Box::new(stage_queue_length.clone()))?;
        registry.register(Box::new(remote_messages.clone()))?;
        registry.register(Box::new(segments_received.clone()))?;
        registry.register(Box::new(exchange_outcomes.clone()))?;
        registry.register(Box::new(flush_duration.clone()))?;
        registry.register(Box::new(rows_flushed.clone()))?;
        registry.register(Box::new(flush_errors.clone()))?;
        registry.register(Box::new(ttl_rows_deleted.clone()))?;
        registry.register(Box::new(cluster_nodes.clone()))?;
        registry.register(Box::new(alarms_raised.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            records_submitted,
            records_processed,
            records_dropped,
            stage_queue_length,
            remote_messages,
            segments_received,
            exchange_outcomes,
            flush_duration,
            rows_flushed,
            flush_errors,
            ttl_rows_deleted,
            cluster_nodes,
            alarms_raised,
        })
    }

    /// Renders every registered metric in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        render_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let bind_addr = bind_address(&self.addr, ":9090");

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}

/// Expands the `:port` shorthand to an all-interfaces bind address.
pub(crate) fn bind_address(addr: &str, fallback: &str) -> String {
    let addr = if addr.is_empty() { fallback } else { addr };

    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

fn render_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;

    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match render_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "rendering metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
