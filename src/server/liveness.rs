use std::time::Duration;
use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::server::registry::ClientRegistry;

/// Periodically pings every registered connection and evicts the ones that
/// do not answer in time.
#[derive(Clone)]
pub struct LivenessMonitor {
    clients: ClientRegistry,
    interval: Duration,
    timeout: Duration,
}

impl LivenessMonitor {
    /// # Arguments
    ///
    /// * `interval` - Pause between the end of one sweep and the start of the next.
    /// * `timeout` - How long each connection has to answer its ping.
    pub fn new(clients: ClientRegistry, interval: Duration, timeout: Duration) -> Self {
        Self { clients, interval, timeout }
    }

    /// Runs sweeps until `shutdown` is cancelled. A sweep in progress when
    /// the token fires is abandoned.
    pub async fn run(self, shutdown: CancellationToken) {
        debug!(interval = ?self.interval, timeout = ?self.timeout, "liveness monitor started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = async {
                    tokio::time::sleep(self.interval).await;
                    self.sweep().await;
                } => {}
            }
        }
        debug!("liveness monitor stopped");
    }

    /// Probes every registered connection concurrently, then evicts and
    /// closes the ones that failed. Returns the evicted ids.
    pub async fn sweep(&self) -> Vec<Uuid> {
        let targets = self.clients.snapshot(None);
        let results = join_all(targets.iter().map(|client| client.probe(self.timeout))).await;

        let mut evicted = Vec::new();
        for (client, result) in targets.iter().zip(results) {
            if let Err(e) = result {
                info!(addr = %client.addr, id = %client.id, reason = %e, "client unresponsive, closing");
                if self.clients.remove(&client.id) {
                    self.clients.metrics.evictions.inc();
                }
                client.close(None);
                evicted.push(client.id);
            }
        }
        evicted
    }
}
