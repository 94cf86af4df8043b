use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, Encoder, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Operational counters for the derivation pipeline, exported in
/// Prometheus text format when `misc.produce_metrics` is enabled.
///
/// All metrics use the "hurricane" namespace with the instance name as a
/// constant label, so multiple instances on one host stay distinguishable.
pub struct PipelineMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Raw input messages processed across all workers.
    pub input_messages: Counter,
    /// Derived metrics confirmed by the producer.
    pub output_messages: Counter,
    /// Consumer offsets released by the tracking protocol.
    pub commits: Counter,
}

impl PipelineMetrics {
    /// Creates the registry with all pipeline counters registered.
    pub fn new(instance: &str, addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let labels: HashMap<String, String> =
            HashMap::from([("instance".to_string(), instance.to_string())]);

        let input_messages = Counter::with_opts(
            Opts::new("input_messages_total", "Raw input messages processed.")
                .namespace("hurricane")
                .const_labels(labels.clone()),
        )?;
        let output_messages = Counter::with_opts(
            Opts::new(
                "output_messages_total",
                "Derived metrics confirmed by the producer.",
            )
            .namespace("hurricane")
            .const_labels(labels.clone()),
        )?;
        let commits = Counter::with_opts(
            Opts::new("commits_total", "Consumer offsets released.")
                .namespace("hurricane")
                .const_labels(labels),
        )?;

        registry.register(Box::new(input_messages.clone()))?;
        registry.register(Box::new(output_messages.clone()))?;
        registry.register(Box::new(commits.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            input_messages,
            output_messages,
            commits,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let registry = self.registry.clone();
        let state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(state);

        let listener = TcpListener::bind(&self.addr)
            .await
            .with_context(|| format!("listening on {}", self.addr))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "metrics endpoint started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "metrics endpoint error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the metrics endpoint.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - liveness probe.
async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
