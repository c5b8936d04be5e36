//! # state-relay
//!
//! Relays application state from one admin publisher to any number of
//! viewers over WebSocket, optionally secured with TLS.
//!
//! ## Features
//! - Role-gated protocol: `hello`, `state`, `ping`
//! - Late joiners are sent the most recent state on hello
//! - Liveness sweeps evict connections that stop answering pings
//! - Prometheus metrics endpoint
//! - Graceful shutdown on SIGINT/SIGTERM
//!
//! Configuration comes from `relay.{toml,yaml,json}` and `RELAY_*`
//! environment variables; see [`state_relay::config::RelayConfig`].

use anyhow::Context;
use state_relay::server::ServerState;
use state_relay::{config, server};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};

/// Entry point for the relay.
///
/// Loads and validates configuration, initializes logging, binds the
/// listener and serves until a shutdown signal arrives.
///
/// # Errors
/// Returns an error (and a non-zero exit status) if configuration or TLS
/// material is invalid or the listener cannot bind.
#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let _ = dotenv::dotenv();

    let config = config::RelayConfig::load()?;
    config.validate()?;

    tracing_subscriber::fmt()
        .with_max_level(if config.debug { Level::DEBUG } else { Level::INFO })
        .init();

    let state = Arc::new(ServerState::new(config)?);

    let listener = TcpListener::bind((state.config.host.as_str(), state.config.port))
        .await
        .with_context(|| format!("binding {}:{}", state.config.host, state.config.port))?;
    let scheme = if state.tls_acceptor.is_some() { "wss" } else { "ws" };
    info!("Relay listening on {}://{}", scheme, listener.local_addr()?);

    let shutdown = CancellationToken::new();

    if state.config.metrics_port != 0 {
        let (state, shutdown) = (state.clone(), shutdown.clone());
        tokio::spawn(async move {
            if let Err(e) = server::health::serve_metrics_http(state, shutdown).await {
                error!("Metrics endpoint failed: {}", e);
            }
        });
    }

    let mut relay = tokio::spawn(server::serve(listener, state.clone(), shutdown.clone()));

    tokio::select! {
        finished = &mut relay => {
            finished??;
            return Ok(());
        }
        _ = shutdown_signal() => {
            info!("Shutting down gracefully");
            shutdown.cancel();
        }
    }

    relay.await??;
    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
