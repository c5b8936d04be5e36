use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{error, info, warn};

use crate::server::{handler, ServerState};
use crate::utils::error::RelayError;

/// Accepts connections until `shutdown` is cancelled.
///
/// Each connection gets its own task, upgraded to TLS first when the state
/// carries an acceptor. The liveness monitor runs alongside for the lifetime
/// of the listener. After cancellation, open sessions are given the
/// configured grace period to close before the remaining ones are dropped.
///
/// # Errors
/// Currently infallible once the listener is bound; accept errors are logged
/// and the loop carries on.
pub async fn serve(
    listener: TcpListener,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
) -> Result<(), RelayError> {
    let tracker = TaskTracker::new();
    tracker.spawn(state.liveness_monitor().run(shutdown.clone()));

    loop {
        let (stream, addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Accept error: {}", e);
                    continue;
                }
            },
        };

        let state = state.clone();
        let shutdown = shutdown.clone();
        tracker.spawn(async move {
            let result = match state.tls_acceptor.clone() {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        handler::handle_connection(tls_stream, addr, state, shutdown).await
                    }
                    Err(e) => {
                        warn!(%addr, "TLS handshake failed: {}", e);
                        return;
                    }
                },
                None => handler::handle_connection(stream, addr, state, shutdown).await,
            };
            if let Err(e) = result {
                warn!(%addr, "Connection error: {}", e);
            }
        });
    }

    info!("listener stopped, waiting for {} open sessions", state.clients.len());
    tracker.close();
    if tokio::time::timeout(state.config.shutdown_grace(), tracker.wait()).await.is_err() {
        warn!("grace period elapsed, dropping remaining sessions");
        state.clients.clear();
    }
    Ok(())
}
