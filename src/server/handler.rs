use std::{net::SocketAddr, sync::Arc};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use tungstenite::protocol::{frame::coding::CloseCode, CloseFrame, WebSocketConfig};
use tungstenite::Message;

use crate::{
    server::{
        message::{ClientMessage, ErrorCode, ServerMessage},
        Client, Role, ServerState,
    },
    utils::error::RelayError,
};

/// Close code sent when an admin hello carries the wrong token.
pub const UNAUTHORIZED_CLOSE_CODE: u16 = 4001;

/// Frames read from the peer and waiting to be handled. When full, reading
/// pauses and TCP pushes back on the peer.
const INBOUND_QUEUE: usize = 32;

/// Whether the session loop should keep reading after a frame.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Runs one WebSocket session from handshake to teardown.
///
/// The connection is registered as a viewer as soon as the handshake
/// completes and is removed from the registry when the session ends, however
/// it ends. Protocol errors are answered with `error` messages and never end
/// the session.
///
/// Reading and handling run side by side: pongs are recorded as soon as they
/// are read, even while a message is still being handled, so a broadcast
/// held up by another peer cannot make this one look unresponsive.
///
/// # Arguments
/// * `stream` - The accepted transport, plain or TLS.
/// * `addr` - Peer address, for diagnostics.
/// * `state` - Shared relay state.
/// * `shutdown` - Server-wide shutdown token; cancelling it closes the session with 1001.
///
/// # Errors
/// Returns `RelayError::ConnectionError` if the handshake or a read fails.
#[instrument(skip(stream, state, shutdown))]
pub async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
) -> Result<(), RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ws_config = WebSocketConfig {
        max_message_size: Some(state.config.max_message_size),
        ..WebSocketConfig::default()
    };
    let ws_stream = tokio_tungstenite::accept_async_with_config(stream, Some(ws_config))
        .await
        .map_err(|e| {
            error!("WebSocket handshake failed: {}", e);
            RelayError::ConnectionError(e.to_string())
        })?;

    let (writer, mut reader) = ws_stream.split();
    let client = Client::new(addr, writer, shutdown.child_token());

    state.clients.add(client.clone());
    info!(%addr, id = %client.id, "connection opened");

    let (inbound, mut queue) = mpsc::channel::<Message>(INBOUND_QUEUE);

    let read_loop = {
        let client = &client;
        async move {
            loop {
                let frame = tokio::select! {
                    _ = client.closed() => break,
                    _ = inbound.closed() => break,
                    frame = reader.next() => frame,
                };
                let Some(frame) = frame else { break };
                let msg = frame.map_err(|e| {
                    debug!("Read error: {}", e);
                    RelayError::ConnectionError(e.to_string())
                })?;

                if let Message::Pong(payload) = &msg {
                    client.record_pong(payload);
                    continue;
                }
                tokio::select! {
                    _ = client.closed() => break,
                    queued = inbound.send(msg) => {
                        if queued.is_err() {
                            break;
                        }
                    }
                }
            }
            Ok::<(), RelayError>(())
        }
    };

    let process_loop = {
        let (client, state) = (&client, &state);
        async move {
            loop {
                let msg = tokio::select! {
                    biased;
                    _ = client.closed() => break,
                    msg = queue.recv() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                };
                if process_message(msg, client, state).await? == Flow::Stop {
                    break;
                }
            }
            Ok::<(), RelayError>(())
        }
    };

    let (read_result, process_result) = tokio::join!(read_loop, process_loop);

    state.clients.remove(&client.id);
    if shutdown.is_cancelled() {
        client.close(Some(CloseFrame {
            code: CloseCode::Away,
            reason: "server shutting down".into(),
        }));
    } else {
        client.close(None);
    }
    info!(%addr, id = %client.id, "connection closed");

    process_result.and(read_result)
}

/// Dispatches one WebSocket frame.
///
/// Binary frames are treated as UTF-8 JSON text. Pings are answered by the
/// WebSocket layer itself; pongs never reach here.
#[instrument(skip(msg, client, state), fields(id = %client.id))]
async fn process_message(
    msg: Message,
    client: &Client,
    state: &ServerState,
) -> Result<Flow, RelayError> {
    match msg {
        Message::Text(text) => handle_text(&text, client, state).await,
        Message::Binary(data) => match String::from_utf8(data) {
            Ok(text) => handle_text(&text, client, state).await,
            Err(_) => {
                state.metrics.messages_received.inc();
                reply(client, state, &ServerMessage::error(ErrorCode::InvalidJson)).await?;
                Ok(Flow::Continue)
            }
        },
        Message::Close(_) => Ok(Flow::Stop),
        _ => Ok(Flow::Continue),
    }
}

/// Parses and handles one protocol message.
async fn handle_text(text: &str, client: &Client, state: &ServerState) -> Result<Flow, RelayError> {
    state.metrics.messages_received.inc();

    let msg = match ClientMessage::parse(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(addr = %client.addr, error = %e, "rejected message: {}", preview(text));
            reply(client, state, &ServerMessage::error(e.code())).await?;
            return Ok(Flow::Continue);
        }
    };

    match msg {
        ClientMessage::Hello { role, token } => {
            handle_hello(role.as_deref(), token.as_deref(), client, state).await
        }
        ClientMessage::State { state: payload } => {
            handle_state(payload, client, state).await?;
            Ok(Flow::Continue)
        }
        ClientMessage::Ping => {
            reply(client, state, &ServerMessage::Pong).await?;
            Ok(Flow::Continue)
        }
        ClientMessage::Unknown => {
            reply(client, state, &ServerMessage::error(ErrorCode::UnknownType)).await?;
            Ok(Flow::Continue)
        }
    }
}

/// Applies a hello: checks the admin token, records the role and replays
/// the last state to this connection only.
async fn handle_hello(
    role: Option<&str>,
    token: Option<&str>,
    client: &Client,
    state: &ServerState,
) -> Result<Flow, RelayError> {
    let role = Role::from_hello(role);
    let admin_token = state.config.admin_token.as_str();

    if role == Role::Admin && !admin_token.is_empty() && token != Some(admin_token) {
        warn!(addr = %client.addr, "admin rejected: bad token");
        // The peer may already be gone; the close below still applies.
        let _ = reply(client, state, &ServerMessage::error(ErrorCode::Unauthorized)).await;
        client.close(Some(CloseFrame {
            code: CloseCode::from(UNAUTHORIZED_CLOSE_CODE),
            reason: "unauthorized".into(),
        }));
        state.clients.remove(&client.id);
        return Ok(Flow::Stop);
    }

    state.clients.set_role(&client.id, role);
    info!(addr = %client.addr, %role, "hello");

    if let Some(last) = state.last_state.get().await {
        reply(client, state, &ServerMessage::State { state: last }).await?;
    }
    Ok(Flow::Continue)
}

/// Accepts a state snapshot from the admin and fans it out to everyone,
/// the publisher included.
async fn handle_state(
    payload: Option<Value>,
    client: &Client,
    state: &ServerState,
) -> Result<(), RelayError> {
    if state.clients.role_of(&client.id) != Some(Role::Admin) {
        warn!(addr = %client.addr, "state ignored: sender is not admin");
        return reply(client, state, &ServerMessage::error(ErrorCode::Forbidden)).await;
    }

    let Some(Value::Object(snapshot)) = payload else {
        return reply(client, state, &ServerMessage::error(ErrorCode::InvalidState)).await;
    };

    state.last_state.set(snapshot.clone()).await;
    let recipients = state
        .clients
        .broadcast(&ServerMessage::State { state: snapshot }, None)
        .await?;
    debug!(recipients, "state broadcast");
    Ok(())
}

/// Sends a message to the originating connection only.
async fn reply(client: &Client, state: &ServerState, msg: &ServerMessage) -> Result<(), RelayError> {
    client.send_message(msg).await?;
    state.metrics.messages_sent.inc();
    Ok(())
}

/// First 200 characters of a rejected message, for logs.
fn preview(text: &str) -> &str {
    match text.char_indices().nth(200) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::server::client::test_support::channel_client;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn relay(admin_token: &str) -> ServerState {
        ServerState::new(RelayConfig {
            admin_token: admin_token.into(),
            ..RelayConfig::default()
        })
        .unwrap()
    }

    fn joined(state: &ServerState) -> (Client, UnboundedReceiver<Message>) {
        let (client, rx) = channel_client();
        state.clients.add(client.clone());
        (client, rx)
    }

    async fn send(text: &str, client: &Client, state: &ServerState) -> Flow {
        process_message(Message::Text(text.into()), client, state).await.unwrap()
    }

    async fn next_json(rx: &mut UnboundedReceiver<Message>) -> Value {
        match rx.recv().await {
            Some(Message::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn ping_gets_pong() {
        let state = relay("");
        let (client, mut rx) = joined(&state);
        assert_eq!(send(r#"{"type":"ping"}"#, &client, &state).await, Flow::Continue);
        assert_eq!(next_json(&mut rx).await, serde_json::json!({"type": "pong"}));
    }

    #[tokio::test]
    async fn malformed_input_keeps_role_and_session() {
        let state = relay("");
        let (client, mut rx) = joined(&state);
        state.clients.set_role(&client.id, Role::Admin);

        assert_eq!(send("{not json", &client, &state).await, Flow::Continue);
        assert_eq!(next_json(&mut rx).await["error"], "invalid_json");
        assert_eq!(state.clients.role_of(&client.id), Some(Role::Admin));

        let flow = process_message(Message::Binary(vec![0xff, 0xfe]), &client, &state).await.unwrap();
        assert_eq!(flow, Flow::Continue);
        assert_eq!(next_json(&mut rx).await["error"], "invalid_json");
    }

    #[tokio::test]
    async fn unknown_type_is_reported() {
        let state = relay("");
        let (client, mut rx) = joined(&state);
        send(r#"{"type":"subscribe"}"#, &client, &state).await;
        assert_eq!(next_json(&mut rx).await["error"], "unknown_type");
    }

    #[tokio::test]
    async fn viewer_state_is_forbidden() {
        let state = relay("");
        let (viewer, mut viewer_rx) = joined(&state);
        let (_other, mut other_rx) = joined(&state);

        send(r#"{"type":"state","state":{"x":1}}"#, &viewer, &state).await;
        assert_eq!(next_json(&mut viewer_rx).await["error"], "forbidden");
        assert!(state.last_state.get().await.is_none());
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn admin_state_is_stored_and_broadcast_to_everyone() {
        let state = relay("");
        let (admin, mut admin_rx) = joined(&state);
        let (_viewer, mut viewer_rx) = joined(&state);

        send(r#"{"type":"hello","role":"admin"}"#, &admin, &state).await;
        assert_eq!(state.clients.role_of(&admin.id), Some(Role::Admin));

        send(r#"{"type":"state","state":{"x":1}}"#, &admin, &state).await;
        let expected = serde_json::json!({"type": "state", "state": {"x": 1}});
        assert_eq!(next_json(&mut admin_rx).await, expected);
        assert_eq!(next_json(&mut viewer_rx).await, expected);
        assert_eq!(
            state.last_state.get().await.map(Value::Object),
            Some(serde_json::json!({"x": 1}))
        );
    }

    #[tokio::test]
    async fn non_object_state_is_invalid() {
        let state = relay("");
        let (admin, mut rx) = joined(&state);
        send(r#"{"type":"hello","role":"admin"}"#, &admin, &state).await;

        send(r#"{"type":"state","state":[1,2]}"#, &admin, &state).await;
        assert_eq!(next_json(&mut rx).await["error"], "invalid_state");
        send(r#"{"type":"state"}"#, &admin, &state).await;
        assert_eq!(next_json(&mut rx).await["error"], "invalid_state");
        assert!(state.last_state.get().await.is_none());
    }

    #[tokio::test]
    async fn bad_admin_token_closes_with_4001() {
        let state = relay("s3cret");
        let (client, mut rx) = joined(&state);

        let flow = send(r#"{"type":"hello","role":"admin","token":"nope"}"#, &client, &state).await;
        assert_eq!(flow, Flow::Stop);
        assert_eq!(next_json(&mut rx).await["error"], "unauthorized");
        match rx.recv().await {
            Some(Message::Close(Some(frame))) => {
                assert_eq!(u16::from(frame.code), UNAUTHORIZED_CLOSE_CODE);
                assert_eq!(frame.reason, "unauthorized");
            }
            other => panic!("expected close frame, got {:?}", other),
        }
        assert_eq!(state.clients.role_of(&client.id), None);
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn correct_admin_token_is_accepted() {
        let state = relay("s3cret");
        let (client, _rx) = joined(&state);
        let flow = send(r#"{"type":"hello","role":"admin","token":"s3cret"}"#, &client, &state).await;
        assert_eq!(flow, Flow::Continue);
        assert_eq!(state.clients.role_of(&client.id), Some(Role::Admin));
    }

    #[tokio::test]
    async fn hello_replays_last_state_only_to_joiner() {
        let state = relay("");
        let (viewer, mut viewer_rx) = joined(&state);
        send(r#"{"type":"hello","role":"viewer"}"#, &viewer, &state).await;
        assert!(viewer_rx.try_recv().is_err());

        let mut snapshot = serde_json::Map::new();
        snapshot.insert("round".into(), serde_json::json!(3));
        state.last_state.set(snapshot).await;

        let (bystander, mut bystander_rx) = joined(&state);
        let (joiner, mut joiner_rx) = joined(&state);
        send(r#"{"type":"hello","role":"viewer"}"#, &joiner, &state).await;

        assert_eq!(
            next_json(&mut joiner_rx).await,
            serde_json::json!({"type": "state", "state": {"round": 3}})
        );
        assert!(bystander_rx.try_recv().is_err());
        assert!(state.clients.role_of(&bystander.id).is_some());
    }

    #[test]
    fn preview_truncates_on_char_boundary() {
        let long = "é".repeat(300);
        assert_eq!(preview(&long).chars().count(), 200);
        assert_eq!(preview("short"), "short");
    }
}
