use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tungstenite::Message;
use crate::utils::error::RelayError;

/// Reasons an inbound frame could not be turned into a [`ClientMessage`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// The frame is not a JSON object, or a known message has mistyped fields.
    #[error("Invalid JSON message")]
    InvalidJson,

    /// The `type` discriminator is missing or names no known message.
    #[error("Unknown message type")]
    UnknownType,
}

impl ProtocolError {
    /// The wire error code reported back to the sender.
    pub fn code(self) -> ErrorCode {
        match self {
            ProtocolError::InvalidJson => ErrorCode::InvalidJson,
            ProtocolError::UnknownType => ErrorCode::UnknownType,
        }
    }
}

/// Represents the messages a client can send to the relay.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Announces the role the connection wants, with the admin token if any.
    Hello {
        #[serde(default)]
        role: Option<String>,
        #[serde(default)]
        token: Option<String>,
    },

    /// A state snapshot published by the admin. The shape is checked by the
    /// handler after the role check, so any JSON value is accepted here.
    State {
        #[serde(default)]
        state: Option<Value>,
    },

    /// Application-level ping, answered with a pong.
    Ping,

    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    /// Parses one inbound text frame.
    ///
    /// # Errors
    /// * `ProtocolError::InvalidJson` if the text is not a JSON object or a
    ///   known message carries fields of the wrong type.
    /// * `ProtocolError::UnknownType` if `type` is absent, not a string, or
    ///   not one of `hello`, `state`, `ping`.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text).map_err(|_| ProtocolError::InvalidJson)?;
        let kind_is_string = match &value {
            Value::Object(fields) => fields.get("type").map_or(false, Value::is_string),
            _ => return Err(ProtocolError::InvalidJson),
        };
        if !kind_is_string {
            return Err(ProtocolError::UnknownType);
        }

        match serde_json::from_value(value).map_err(|_| ProtocolError::InvalidJson)? {
            ClientMessage::Unknown => Err(ProtocolError::UnknownType),
            msg => Ok(msg),
        }
    }
}

/// Error codes carried by `{"type":"error"}` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidJson,
    Unauthorized,
    Forbidden,
    InvalidState,
    UnknownType,
}

/// Represents messages that the relay sends to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// The current application state.
    State { state: Map<String, Value> },

    /// Reply to a client ping.
    Pong,

    /// A rejected message.
    Error { error: ErrorCode },
}

impl ServerMessage {
    pub fn error(code: ErrorCode) -> Self {
        ServerMessage::Error { error: code }
    }
}

/// Serializes a `ServerMessage` into a compact JSON text frame.
impl TryFrom<&ServerMessage> for Message {
    type Error = RelayError;

    fn try_from(msg: &ServerMessage) -> Result<Self, Self::Error> {
        let json = serde_json::to_string(msg)?;
        Ok(Message::Text(json))
    }
}
