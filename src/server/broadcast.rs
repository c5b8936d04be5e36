use futures_util::future::join_all;
use tracing::{debug, instrument, warn};
use tungstenite::Message;
use uuid::Uuid;

use crate::server::{message::ServerMessage, registry::ClientRegistry};
use crate::utils::error::RelayError;

impl ClientRegistry {
    /// Sends `payload` to every registered connection except `exclude`.
    ///
    /// The payload is serialized once and the same frame goes to every
    /// recipient. Sends run concurrently; once all of them have settled, each
    /// connection whose send failed is removed from the registry and closed.
    ///
    /// Returns the number of recipients a send was attempted to, whether or
    /// not it succeeded.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::SerializationError` if the payload cannot be
    /// serialized; nothing is sent in that case.
    #[instrument(skip(self, payload))]
    pub async fn broadcast(
        &self,
        payload: &ServerMessage,
        exclude: Option<&Uuid>,
    ) -> Result<usize, RelayError> {
        let frame = Message::try_from(payload)?;
        let targets = self.snapshot(exclude);
        if targets.is_empty() {
            return Ok(0);
        }

        let results = join_all(targets.iter().map(|client| client.send(frame.clone()))).await;

        for (client, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => self.metrics.messages_sent.inc(),
                Err(e) => {
                    warn!(addr = %client.addr, id = %client.id, error = %e, "broadcast send failed, evicting");
                    if self.remove(&client.id) {
                        self.metrics.evictions.inc();
                    }
                    client.close(None);
                }
            }
        }

        self.metrics.broadcasts.inc();
        debug!(recipients = targets.len(), "broadcast complete");
        Ok(targets.len())
    }
}
