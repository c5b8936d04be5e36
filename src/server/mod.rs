// src/server/mod.rs
pub mod broadcast;
pub mod client;
pub mod handler;
pub mod health;
pub mod last_state;
pub mod listener;
pub mod liveness;
pub mod message;
pub mod registry;

// Re-export public components
pub use client::{Client, ClientError};
pub use handler::handle_connection;
pub use health::HealthMetrics;
pub use last_state::LastState;
pub use listener::serve;
pub use liveness::LivenessMonitor;
pub use message::{ClientMessage, ErrorCode, ServerMessage};
pub use registry::{ClientRegistry, Role};

// Import internal dependencies
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use crate::config::RelayConfig;
use crate::utils::error::RelayError;

/// Everything the connection tasks and the liveness monitor share.
///
/// Built once at startup and handed around behind an `Arc`.
pub struct ServerState {
    pub config: Arc<RelayConfig>,
    pub clients: ClientRegistry,
    pub last_state: LastState,
    pub metrics: HealthMetrics,
    pub tls_acceptor: Option<Arc<TlsAcceptor>>,
}

impl ServerState {
    /// Builds the shared state, loading TLS material if the config asks for it.
    ///
    /// # Errors
    /// Returns an error if the TLS acceptor or the metrics registry cannot be created.
    pub fn new(config: RelayConfig) -> Result<Self, RelayError> {
        let tls_acceptor = config.create_tls_acceptor()?;
        let metrics = HealthMetrics::new()?;
        Ok(Self {
            config: Arc::new(config),
            clients: ClientRegistry::new(metrics.clone()),
            last_state: LastState::new(),
            metrics,
            tls_acceptor,
        })
    }

    /// A liveness monitor over this state's registry, using the configured
    /// interval and timeout.
    pub fn liveness_monitor(&self) -> LivenessMonitor {
        LivenessMonitor::new(
            self.clients.clone(),
            self.config.ping_interval(),
            self.config.ping_timeout(),
        )
    }
}
