use thiserror::Error;

/// Represents the errors that can surface from the relay outside of the
/// per-message protocol replies.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Represents a general connection error.
    ///
    /// Raised when the WebSocket handshake or a read on an accepted
    /// connection fails.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Represents an error reaching a single connected client.
    #[error("Client error: {0}")]
    ClientError(#[from] crate::server::client::ClientError),

    /// Indicates a failure in serializing or deserializing data.
    ///
    /// This can happen when converting outbound messages to JSON.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Represents an error in the server configuration.
    ///
    /// This occurs when settings cannot be loaded, are inconsistent, or when
    /// the TLS material they point at cannot be used.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Indicates that the metrics registry rejected a metric.
    #[error("Metrics error: {0}")]
    MetricsError(#[from] prometheus::Error),
}

/// Implements conversion from `serde_json::Error` to `RelayError`.
///
/// This allows serialization errors to be automatically converted into
/// `RelayError::SerializationError`.
impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::SerializationError(err.to_string())
    }
}

impl From<config::ConfigError> for RelayError {
    fn from(err: config::ConfigError) -> Self {
        RelayError::ConfigurationError(err.to_string())
    }
}
