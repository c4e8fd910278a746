use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "pfstatsd";

/// Prometheus metrics describing the daemon itself.
///
/// All metrics use the "pfstatsd" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Scheduler ===
    /// Scheduler ticks fired.
    pub ticks: Counter,
    /// Ticks skipped for a path whose previous run was still in flight.
    pub missed_ticks: CounterVec,

    // === Queue counters ===
    /// Counter dump runs that failed (spawn, exit status, unrecognized output).
    pub collect_failures: Counter,
    /// Queue blocks skipped as malformed.
    pub parse_errors: Counter,
    /// Queues emitted by the last successful collection.
    pub queues_collected: Gauge,
    /// Counter dump wall time.
    pub collect_duration: Histogram,

    // === Interface counters ===
    /// Interface counter reads that failed.
    pub interface_read_failures: Counter,
    /// Interfaces emitted by the last successful read.
    pub interfaces_collected: Gauge,

    // === ICMP probes ===
    /// Probe results by target and outcome.
    pub probe_outcomes: CounterVec,
    /// Successful probe round-trip time by target.
    pub probe_rtt: HistogramVec,

    // === Delivery sink ===
    /// Points handed to the sink.
    pub points_emitted: Counter,
    /// Whether the backend connection is up (1=yes, 0=no).
    pub sink_connected: Gauge,
    /// Points waiting in the outbound buffer.
    pub sink_buffer_length: Gauge,
    /// Points dropped because the outbound buffer was full.
    pub sink_points_dropped: Counter,
    /// Points written to the backend.
    pub sink_points_sent: Counter,
    /// Connect attempts by result.
    pub sink_connect_attempts: CounterVec,
    /// Failed or timed out writes.
    pub sink_write_errors: Counter,
    /// Points per successful write.
    pub sink_batch_size: Histogram,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let ticks = Counter::with_opts(
            Opts::new("ticks_total", "Scheduler ticks fired.").namespace(NAMESPACE),
        )?;
        let missed_ticks = CounterVec::new(
            Opts::new(
                "missed_ticks_total",
                "Ticks skipped because the path's previous run was still in flight.",
            )
            .namespace(NAMESPACE),
            &["path"],
        )?;

        let collect_failures = Counter::with_opts(
            Opts::new("collect_failures_total", "Failed counter dump runs.")
                .namespace(NAMESPACE),
        )?;
        let parse_errors = Counter::with_opts(
            Opts::new("parse_errors_total", "Malformed queue blocks skipped.")
                .namespace(NAMESPACE),
        )?;
        let queues_collected = Gauge::with_opts(
            Opts::new(
                "queues_collected",
                "Queues emitted by the last successful collection.",
            )
            .namespace(NAMESPACE),
        )?;
        let collect_duration = Histogram::with_opts(
            HistogramOpts::new("collect_duration_seconds", "Counter dump wall time.")
                .namespace(NAMESPACE)
                .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        )?;

        let interface_read_failures = Counter::with_opts(
            Opts::new(
                "interface_read_failures_total",
                "Failed interface counter reads.",
            )
            .namespace(NAMESPACE),
        )?;
        let interfaces_collected = Gauge::with_opts(
            Opts::new(
                "interfaces_collected",
                "Interfaces emitted by the last successful read.",
            )
            .namespace(NAMESPACE),
        )?;

        let probe_outcomes = CounterVec::new(
            Opts::new("probe_outcomes_total", "Probe results by target and outcome.")
                .namespace(NAMESPACE),
            &["target", "outcome"],
        )?;
        let probe_rtt = HistogramVec::new(
            HistogramOpts::new("probe_rtt_seconds", "Successful probe round-trip time.")
                .namespace(NAMESPACE)
                .buckets(vec![
                    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
                ]),
            &["target"],
        )?;

        let points_emitted = Counter::with_opts(
            Opts::new("points_emitted_total", "Points handed to the sink.").namespace(NAMESPACE),
        )?;
        let sink_connected = Gauge::with_opts(
            Opts::new(
                "sink_connected",
                "Whether the backend connection is up (1=yes, 0=no).",
            )
            .namespace(NAMESPACE),
        )?;
        let sink_buffer_length = Gauge::with_opts(
            Opts::new("sink_buffer_length", "Points waiting in the outbound buffer.")
                .namespace(NAMESPACE),
        )?;
        let sink_points_dropped = Counter::with_opts(
            Opts::new(
                "sink_points_dropped_total",
                "Points dropped because the outbound buffer was full.",
            )
            .namespace(NAMESPACE),
        )?;
        let sink_points_sent = Counter::with_opts(
            Opts::new("sink_points_sent_total", "Points written to the backend.")
                .namespace(NAMESPACE),
        )?;
        let sink_connect_attempts = CounterVec::new(
            Opts::new("sink_connect_attempts_total", "Backend connect attempts by result.")
                .namespace(NAMESPACE),
            &["result"],
        )?;
        let sink_write_errors = Counter::with_opts(
            Opts::new("sink_write_errors_total", "Failed or timed out writes.")
                .namespace(NAMESPACE),
        )?;
        let sink_batch_size = Histogram::with_opts(
            HistogramOpts::new("sink_batch_size", "Points per successful write.")
                .namespace(NAMESPACE)
                .buckets(vec![1.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0]),
        )?;

        registry.register(Box::new(ticks.clone()))?;
        registry.register(Box::new(missed_ticks.clone()))?;
        registry.register(Box::new(collect_failures.clone()))?;
        registry.register(Box::new(parse_errors.clone()))?;
        registry.register(Box::new(queues_collected.clone()))?;
        registry.register(Box::new(collect_duration.clone()))?;
        registry.register(Box::new(interface_read_failures.clone()))?;
        registry.register(Box::new(interfaces_collected.clone()))?;
        registry.register(Box::new(probe_outcomes.clone()))?;
        registry.register(Box::new(probe_rtt.clone()))?;
        registry.register(Box::new(points_emitted.clone()))?;
        registry.register(Box::new(sink_connected.clone()))?;
        registry.register(Box::new(sink_buffer_length.clone()))?;
        registry.register(Box::new(sink_points_dropped.clone()))?;
        registry.register(Box::new(sink_points_sent.clone()))?;
        registry.register(Box::new(sink_connect_attempts.clone()))?;
        registry.register(Box::new(sink_write_errors.clone()))?;
        registry.register(Box::new(sink_batch_size.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            ticks,
            missed_ticks,
            collect_failures,
            parse_errors,
            queues_collected,
            collect_duration,
            interface_read_failures,
            interfaces_collected,
            probe_outcomes,
            probe_rtt,
            points_emitted,
            sink_connected,
            sink_buffer_length,
            sink_points_dropped,
            sink_points_sent,
            sink_connect_attempts,
            sink_write_errors,
            sink_batch_size,
        })
    }

    /// Whether an HTTP listen address is configured.
    pub fn serves_http(&self) -> bool {
        !self.addr.trim().is_empty()
    }

    /// Whether the HTTP server has been started and not yet stopped.
    pub fn is_serving(&self) -> bool {
        self.shutdown.lock().is_some()
    }

    /// Renders all metrics in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    ///
    /// Returns the bound address, or `None` when no address is configured.
    pub async fn start(&self) -> Result<Option<SocketAddr>> {
        if !self.serves_http() {
            return Ok(None);
        }

        // Parse address, handling ":port" shorthand.
        let addr = self.addr.trim();
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

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

        Ok(Some(local_addr))
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
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
