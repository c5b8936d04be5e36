use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use futures_util::{Sink, SinkExt};
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    oneshot, watch,
};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, instrument};
use tungstenite::{protocol::CloseFrame, Message};
use uuid::Uuid;

use crate::server::message::ServerMessage;

/// Upper bound on writing a close frame to a peer that may have stopped reading.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Frames that may wait for the writer task. A peer that lets the queue
/// fill up is treated as a failed send.
pub const OUTBOUND_QUEUE: usize = 64;

/// A frame queued for the writer task, with an optional completion signal.
struct Outbound {
    message: Message,
    ack: Option<oneshot::Sender<Result<(), ClientError>>>,
}

/// Handle to one accepted connection.
///
/// Cloning is cheap; every clone talks to the same writer task. The writer
/// task owns the sink half of the socket and exits after a close frame, a
/// failed write, or once every handle has been dropped.
#[derive(Clone, Debug)]
pub struct Client {
    /// Unique identifier for the connection.
    pub id: Uuid,
    /// Socket address of the peer.
    pub addr: SocketAddr,
    sender: mpsc::Sender<Outbound>,
    /// Highest liveness-probe sequence number the peer has answered.
    pongs: Arc<watch::Sender<u64>>,
    probes: Arc<AtomicU64>,
    /// Cancelled when the connection is being torn down.
    shutdown: CancellationToken,
}

impl Client {
    /// Creates a new `Client` around the write half of a connection.
    ///
    /// Spawns the writer task, so this must be called from within a Tokio
    /// runtime.
    ///
    /// # Arguments
    ///
    /// * `addr` - The socket address of the peer.
    /// * `writer` - The sink frames are written to.
    /// * `shutdown` - Token cancelled when this connection should end.
    #[instrument(skip(writer, shutdown))]
    pub fn new<W>(addr: SocketAddr, writer: W, shutdown: CancellationToken) -> Self
    where
        W: Sink<Message, Error = tungstenite::Error> + Unpin + Send + 'static,
    {
        let (sender, mut receiver) = mpsc::channel::<Outbound>(OUTBOUND_QUEUE);
        let (pongs, _) = watch::channel(0);

        tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                let mut writer = writer;
                while let Some(Outbound { message, ack }) = receiver.recv().await {
                    let closing = matches!(message, Message::Close(_));
                    let result = if closing {
                        match tokio::time::timeout(CLOSE_TIMEOUT, writer.send(message)).await {
                            Ok(sent) => sent.map_err(|e| ClientError::SendFailed(e.to_string())),
                            Err(_) => Err(ClientError::SendFailed("close frame timed out".into())),
                        }
                    } else {
                        // Once the connection is cancelled, queued frames are dropped and a
                        // write stuck on a peer that stopped reading is abandoned.
                        tokio::select! {
                            biased;
                            _ = shutdown.cancelled() => Err(ClientError::Closed),
                            sent = writer.send(message) => {
                                sent.map_err(|e| ClientError::SendFailed(e.to_string()))
                            }
                        }
                    };
                    let failed = result.is_err();
                    if let Err(e) = &result {
                        debug!(%addr, error = %e, "write failed");
                    }
                    if let Some(ack) = ack {
                        let _ = ack.send(result);
                    }
                    if failed || closing {
                        break;
                    }
                }
                // Nothing more can be written; end the session reading this socket.
                shutdown.cancel();
            }
        });

        Client {
            id: Uuid::new_v4(),
            addr,
            sender,
            pongs: Arc::new(pongs),
            probes: Arc::new(AtomicU64::new(0)),
            shutdown,
        }
    }

    /// Sends a frame and waits until it has been written to the socket.
    ///
    /// Never waits for queue space: a full queue fails immediately.
    ///
    /// # Errors
    ///
    /// * `ClientError::Closed` if the writer task has already stopped.
    /// * `ClientError::QueueFull` if the peer is not keeping up.
    /// * `ClientError::SendFailed` if the write itself failed.
    pub async fn send(&self, message: Message) -> Result<(), ClientError> {
        let (ack, done) = oneshot::channel();
        self.sender
            .try_send(Outbound { message, ack: Some(ack) })
            .map_err(|e| match e {
                TrySendError::Full(_) => ClientError::QueueFull,
                TrySendError::Closed(_) => ClientError::Closed,
            })?;
        done.await.map_err(|_| ClientError::Closed)?
    }

    /// Serializes and sends a single protocol message.
    pub async fn send_message(&self, message: &ServerMessage) -> Result<(), ClientError> {
        let frame = Message::try_from(message)
            .map_err(|e| ClientError::SendFailed(e.to_string()))?;
        self.send(frame).await
    }

    /// Pings the peer and waits up to `timeout` for the matching pong.
    ///
    /// # Errors
    ///
    /// * `ClientError::ProbeTimeout` if no pong arrived in time.
    /// * `ClientError::Closed` / `ClientError::SendFailed` if the ping could
    ///   not be written.
    pub async fn probe(&self, timeout: Duration) -> Result<(), ClientError> {
        let seq = self.probes.fetch_add(1, Ordering::Relaxed) + 1;
        let mut pongs = self.pongs.subscribe();

        tokio::time::timeout(timeout, async {
            self.send(Message::Ping(seq.to_be_bytes().to_vec())).await?;
            pongs
                .wait_for(|answered| *answered >= seq)
                .await
                .map_err(|_| ClientError::Closed)?;
            Ok::<(), ClientError>(())
        })
        .await
        .map_err(|_| ClientError::ProbeTimeout)?
    }

    /// Records a pong received from the peer.
    ///
    /// Pongs whose payload is not one of our probe sequence numbers are
    /// ignored.
    pub fn record_pong(&self, payload: &[u8]) {
        let Ok(bytes) = <[u8; 8]>::try_from(payload) else {
            return;
        };
        let seq = u64::from_be_bytes(bytes);
        self.pongs.send_if_modified(|answered| {
            if seq > *answered {
                *answered = seq;
                true
            } else {
                false
            }
        });
    }

    /// Best-effort close: queues a close frame and ends the session.
    ///
    /// Never fails; a connection whose writer is already gone is simply
    /// cancelled.
    pub fn close(&self, frame: Option<CloseFrame<'static>>) {
        let _ = self.sender.try_send(Outbound {
            message: Message::Close(frame),
            ack: None,
        });
        self.shutdown.cancel();
    }

    /// Resolves once the connection has been closed or evicted.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.shutdown.cancelled()
    }

    /// Checks if the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.sender.is_closed()
    }
}

/// Represents errors that may occur while talking to one client.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("Connection closed")]
    Closed,
    #[error("Failed to send message: {0}")]
    SendFailed(String),
    #[error("Outbound queue full")]
    QueueFull,
    #[error("Liveness probe timed out")]
    ProbeTimeout,
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use tungstenite::protocol::frame::coding::CloseCode;

    #[tokio::test]
    async fn send_reaches_the_writer() {
        let (client, mut frames) = channel_client();
        client.send(Message::Text("hi".into())).await.unwrap();
        assert_eq!(frames.recv().await, Some(Message::Text("hi".into())));
    }

    #[tokio::test]
    async fn failed_write_is_reported_and_closes() {
        let client = broken_client();
        let err = client.send(Message::Text("hi".into())).await.unwrap_err();
        assert!(matches!(err, ClientError::SendFailed(_)));

        client.closed().await;
        assert!(client.is_closed());
        assert_eq!(client.send(Message::Text("again".into())).await, Err(ClientError::Closed));
    }

    #[tokio::test]
    async fn close_sends_frame_then_rejects_sends() {
        let (client, mut frames) = channel_client();
        client.close(Some(CloseFrame {
            code: CloseCode::from(4001),
            reason: "unauthorized".into(),
        }));

        match frames.recv().await {
            Some(Message::Close(Some(frame))) => assert_eq!(u16::from(frame.code), 4001),
            other => panic!("expected close frame, got {:?}", other),
        }
        assert!(client.is_closed());
        assert!(client.send(Message::Text("late".into())).await.is_err());
    }

    #[tokio::test]
    async fn full_queue_fails_fast() {
        let client = stalled_client();
        // One frame sits in the stuck write, the rest fill the queue.
        let pending: Vec<_> = (0..=OUTBOUND_QUEUE)
            .map(|i| {
                let client = client.clone();
                tokio::spawn(async move { client.send(Message::Text(i.to_string())).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let overflow = tokio::time::timeout(
            Duration::from_millis(100),
            client.send(Message::Text("one too many".into())),
        )
        .await
        .expect("send waited for queue space");
        assert_eq!(overflow, Err(ClientError::QueueFull));

        // Cancelling abandons the stuck write and everything queued behind it.
        client.close(None);
        for send in pending {
            assert!(send.await.unwrap().is_err());
        }
    }

    #[tokio::test]
    async fn probe_succeeds_when_pong_arrives() {
        let client = responsive_client();
        client.probe(Duration::from_millis(500)).await.unwrap();
        client.probe(Duration::from_millis(500)).await.unwrap();
    }

    #[tokio::test]
    async fn probe_times_out_without_pong() {
        let client = silent_client();
        let err = client.probe(Duration::from_millis(50)).await.unwrap_err();
        assert_eq!(err, ClientError::ProbeTimeout);
    }

    #[tokio::test]
    async fn stale_pongs_are_ignored() {
        let client = silent_client();
        client.record_pong(b"junk");
        client.record_pong(&0u64.to_be_bytes());
        assert_eq!(
            client.probe(Duration::from_millis(50)).await,
            Err(ClientError::ProbeTimeout)
        );
    }
}
