//! Logging, metrics and health endpoints.
//!
//! Structured logs through `tracing` (console or JSON), Prometheus metrics
//! through the `metrics` facade with an HTTP exporter, and the Kubernetes
//! style health endpoints: `/healthz` answers while the process lives,
//! `/readyz` answers 503 while the broker is disconnected.

use crate::config::ObservabilityConfig;
use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Initialise the tracing subscriber.
pub fn init_tracing(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    if config.log_format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Install the Prometheus exporter. A port of 0 disables it.
///
/// # Errors
///
/// Returns error if the exporter cannot bind.
pub fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    if config.metrics_port == 0 {
        return Ok(());
    }
    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install Prometheus exporter")?;
    tracing::info!(port = config.metrics_port, "Metrics exporter listening");
    Ok(())
}

/// Shared readiness state for the health endpoints.
pub struct HealthState {
    connected: AtomicBool,
}

impl HealthState {
    /// Create the state (disconnected).
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(false),
        })
    }

    /// Record the broker connection state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        gauge!("aas_uplink_mqtt_connected").set(if connected { 1.0 } else { 0.0 });
    }

    /// True while the broker connection is up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Run the health HTTP server until the process exits. A port of 0 returns
/// immediately.
///
/// # Errors
///
/// Returns error if the listener cannot bind.
pub async fn run_health_server(state: Arc<HealthState>, port: u16) -> Result<()> {
    if port == 0 {
        return Ok(());
    }
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .context("failed to bind health listener")?;
    tracing::info!(port, "Health server listening");
    axum::serve(listener, app).await.context("health server failed")
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn readyz(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_connected() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Count an error by category (`errors_total{type=…}`).
pub fn record_error(error_type: &str) {
    counter!("aas_uplink_errors_total", "type" => error_type.to_string()).increment(1);
}

/// Count flattened leaf records.
pub fn record_flattened(count: usize) {
    counter!("aas_uplink_records_flattened_total").increment(count as u64);
}

/// Count retained-plane publishes.
pub fn record_retained_publish() {
    counter!("aas_uplink_retained_published_total").increment(1);
}

/// Count lifecycle-plane messages by type.
pub fn record_sparkplug_message(message_type: &str) {
    counter!("aas_uplink_sparkplug_messages_total", "type" => message_type.to_string())
        .increment(1);
}

/// Count state-table evictions by store.
pub fn record_evictions(store: &str, total: u64) {
    gauge!("aas_uplink_state_evictions", "store" => store.to_string()).set(total as f64);
}

/// Record asset lifecycle gauges.
pub fn record_asset_states(online: usize, stale: usize, offline: usize) {
    gauge!("aas_uplink_assets", "state" => "online").set(online as f64);
    gauge!("aas_uplink_assets", "state" => "stale").set(stale as f64);
    gauge!("aas_uplink_assets", "state" => "offline").set(offline as f64);
}

/// Count command-path outcomes.
pub fn record_command(result: &str) {
    counter!("aas_uplink_commands_total", "result" => result.to_string()).increment(1);
}
