use std::{fs, path::PathBuf, sync::Arc, time::Duration};
use serde::Deserialize;
use config::Config;
use rustls::{Certificate, PrivateKey, ServerConfig as RustlsServerConfig};
use tokio_rustls::TlsAcceptor;
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use crate::utils::error::RelayError;

/// Configuration settings for the relay.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RelayConfig {
    /// Interface the listener binds to.
    pub host: String,
    /// The port on which the relay will listen.
    pub port: u16,
    /// Shared secret an admin must present in its hello. Empty disables the check.
    pub admin_token: String,
    /// Path to the PEM certificate chain. TLS is enabled when both paths are set.
    pub tls_cert_path: Option<PathBuf>,
    /// Path to the PEM private key.
    pub tls_key_path: Option<PathBuf>,
    /// Enables debug-level logging.
    pub debug: bool,
    /// Milliseconds between liveness sweeps.
    pub ping_interval_ms: u64,
    /// Milliseconds a connection has to answer a liveness ping.
    pub ping_timeout_ms: u64,
    /// Largest inbound WebSocket message accepted, in bytes.
    pub max_message_size: usize,
    /// Seconds open sessions are given to finish after a shutdown signal.
    pub shutdown_grace_secs: u64,
    /// Port for the Prometheus `/metrics` endpoint. Zero disables it.
    pub metrics_port: u16,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8787,
            admin_token: String::new(),
            tls_cert_path: None,
            tls_key_path: None,
            debug: false,
            ping_interval_ms: 20_000,
            ping_timeout_ms: 10_000,
            max_message_size: 1 << 20,
            shutdown_grace_secs: 5,
            metrics_port: 0,
        }
    }
}

impl RelayConfig {
    /// Loads the relay configuration.
    ///
    /// Defaults are overridden by an optional `relay.{toml,yaml,json}` file in
    /// the working directory, then by environment variables prefixed with
    /// `RELAY_` (for example `RELAY_ADMIN_TOKEN`).
    ///
    /// # Errors
    /// Returns a `RelayError::ConfigurationError` if the configuration cannot be loaded.
    pub fn load() -> Result<Self, RelayError> {
        Config::builder()
            .add_source(config::File::with_name("relay").required(false))
            .add_source(config::Environment::with_prefix("RELAY").try_parsing(true))
            .build()?
            .try_deserialize()
            .map_err(RelayError::from)
    }

    /// Validates the configuration settings.
    ///
    /// TLS must be configured with both a certificate and a key, and both
    /// files must exist. Intervals, timeouts and the message size limit must
    /// be non-zero.
    ///
    /// # Errors
    /// Returns a `RelayError::ConfigurationError` if validation fails.
    pub fn validate(&self) -> Result<(), RelayError> {
        match (self.cert_path(), self.key_path()) {
            (Some(cert), Some(key)) => {
                if !cert.exists() {
                    return Err(RelayError::ConfigurationError(format!(
                        "Certificate file not found: {:?}",
                        cert
                    )));
                }
                if !key.exists() {
                    return Err(RelayError::ConfigurationError(format!(
                        "Key file not found: {:?}",
                        key
                    )));
                }
            }
            (None, None) => {}
            _ => {
                return Err(RelayError::ConfigurationError(
                    "tls_cert_path and tls_key_path must be set together".into()
                ));
            }
        }

        if self.ping_interval_ms == 0 || self.ping_timeout_ms == 0 {
            return Err(RelayError::ConfigurationError(
                "ping_interval_ms and ping_timeout_ms must be greater than 0".into()
            ));
        }

        if self.max_message_size == 0 {
            return Err(RelayError::ConfigurationError(
                "max_message_size must be greater than 0".into()
            ));
        }

        Ok(())
    }

    /// Whether connections are served over TLS.
    pub fn tls_enabled(&self) -> bool {
        self.cert_path().is_some() && self.key_path().is_some()
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    // Empty strings coming from the environment mean "unset".
    fn cert_path(&self) -> Option<&PathBuf> {
        self.tls_cert_path.as_ref().filter(|p| !p.as_os_str().is_empty())
    }

    fn key_path(&self) -> Option<&PathBuf> {
        self.tls_key_path.as_ref().filter(|p| !p.as_os_str().is_empty())
    }

    /// Creates a TLS acceptor for secure WebSocket connections.
    ///
    /// If TLS is disabled, returns `None`. Otherwise, loads the certificate
    /// chain and the first PKCS#8 (or, failing that, RSA) private key, and
    /// initializes a Rustls TLS acceptor.
    ///
    /// # Errors
    /// Returns a `RelayError::ConfigurationError` if any part of the TLS setup fails.
    pub fn create_tls_acceptor(&self) -> Result<Option<Arc<TlsAcceptor>>, RelayError> {
        let (cert_path, key_path) = match (self.cert_path(), self.key_path()) {
            (Some(cert), Some(key)) => (cert, key),
            _ => return Ok(None),
        };

        let cert_chain = fs::read(cert_path)
            .map_err(|e| RelayError::ConfigurationError(format!(
                "Certificate error: {} (path: {:?})",
                e, cert_path
            )))?;

        let key_pem = fs::read(key_path)
            .map_err(|e| RelayError::ConfigurationError(format!(
                "Key error: {} (path: {:?})",
                e, key_path
            )))?;

        let certs = certs(&mut cert_chain.as_slice())
            .map_err(|e| RelayError::ConfigurationError(format!(
                "Cert parse error: {}", e
            )))?;
        if certs.is_empty() {
            return Err(RelayError::ConfigurationError(format!(
                "No certificates found in {:?}", cert_path
            )));
        }

        let mut keys = pkcs8_private_keys(&mut key_pem.as_slice())
            .map_err(|e| RelayError::ConfigurationError(format!(
                "Key parse error: {}", e
            )))?;
        if keys.is_empty() {
            keys = rsa_private_keys(&mut key_pem.as_slice())
                .map_err(|e| RelayError::ConfigurationError(format!(
                    "Key parse error: {}", e
                )))?;
        }
        let key = keys.into_iter().next().ok_or_else(|| {
            RelayError::ConfigurationError(format!("No private key found in {:?}", key_path))
        })?;

        let config = RustlsServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(
                certs.into_iter().map(Certificate).collect(),
                PrivateKey(key),
            )
            .map_err(|e| RelayError::ConfigurationError(format!(
                "TLS config error: {}", e
            )))?;

        Ok(Some(Arc::new(TlsAcceptor::from(Arc::new(config)))))
    }
}
