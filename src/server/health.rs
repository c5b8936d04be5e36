use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use axum::{Router, routing::get, extract::State, http::StatusCode};
use std::{net::{IpAddr, SocketAddr}, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::server::ServerState;
use crate::utils::error::RelayError;

/// Struct for managing relay health metrics.
#[derive(Clone)]
pub struct HealthMetrics {
    /// Number of connections currently in the registry.
    pub connections: IntGauge,
    /// Counts the total number of messages received from clients.
    pub messages_received: IntCounter,
    /// Counts the total number of messages delivered to clients.
    pub messages_sent: IntCounter,
    /// Counts accepted state broadcasts.
    pub broadcasts: IntCounter,
    /// Counts connections evicted after a failed send or liveness probe.
    pub evictions: IntCounter,
    /// Prometheus registry used to store and manage the metrics.
    registry: Registry,
}

impl HealthMetrics {
    /// Creates a new instance of `HealthMetrics` and registers the metrics with Prometheus.
    ///
    /// # Errors
    /// Returns `RelayError::MetricsError` if a metric cannot be registered.
    pub fn new() -> Result<Self, RelayError> {
        let registry = Registry::new();
        let connections = IntGauge::new("connections", "Active connections")?;
        let messages_received = IntCounter::new("messages_received", "Total messages received")?;
        let messages_sent = IntCounter::new("messages_sent", "Total messages sent")?;
        let broadcasts = IntCounter::new("broadcasts_total", "State broadcasts performed")?;
        let evictions = IntCounter::new("evictions_total", "Connections evicted as unreachable")?;

        registry.register(Box::new(connections.clone()))?;
        registry.register(Box::new(messages_received.clone()))?;
        registry.register(Box::new(messages_sent.clone()))?;
        registry.register(Box::new(broadcasts.clone()))?;
        registry.register(Box::new(evictions.clone()))?;

        Ok(Self {
            connections,
            messages_received,
            messages_sent,
            broadcasts,
            evictions,
            registry,
        })
    }

    /// Exposes the current state of all registered metrics in Prometheus-compatible format.
    pub fn expose_metrics(&self) -> Result<String, RelayError> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| RelayError::SerializationError(e.to_string()))
    }
}

/// Serves `GET /metrics` on `host:metrics_port` until `shutdown` is cancelled.
///
/// # Errors
/// Returns an error if the host is not an IP address or the port cannot be bound.
pub async fn serve_metrics_http(
    state: Arc<ServerState>,
    shutdown: CancellationToken,
) -> Result<(), RelayError> {
    let ip: IpAddr = state.config.host.parse().map_err(|e| {
        RelayError::ConfigurationError(format!("Metrics host {:?}: {}", state.config.host, e))
    })?;
    let addr = SocketAddr::new(ip, state.config.metrics_port);

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(state);

    let server = axum::Server::try_bind(&addr)
        .map_err(|e| RelayError::ConnectionError(format!("Metrics bind {}: {}", addr, e)))?;
    info!(%addr, "metrics endpoint listening");

    server
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| RelayError::ConnectionError(e.to_string()))
}

/// Handles the `/metrics` HTTP request and returns the current metrics data.
async fn metrics_handler(
    State(state): State<Arc<ServerState>>,
) -> Result<String, (StatusCode, String)> {
    state
        .metrics
        .expose_metrics()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}
