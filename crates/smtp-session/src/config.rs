use crate::error::SessionError;
use crate::tls::TlsOptions;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tokio_rustls::TlsConnector;

/// Configuration for one session. Durations deserialize from either
/// integer seconds or humantime strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpSessionConfig {
    /// Remote endpoint as "host:port".
    pub remote_address: String,

    /// Local address to bind before connecting.
    #[serde(default)]
    pub local_address: Option<SocketAddr>,

    /// How long the connection may sit idle before a higher layer
    /// should probe it with a NOOP. The engine only carries and
    /// validates the value; it never issues keepalives itself.
    #[serde(default, with = "crate::duration_serde::opt")]
    pub keep_alive_timeout: Option<Duration>,

    /// How long to wait for the server to finish responding to a
    /// submission.
    #[serde(
        default = "SmtpSessionConfig::default_read_timeout",
        with = "crate::duration_serde"
    )]
    pub read_timeout: Duration,

    /// Identifies this connection in log and error messages.
    #[serde(default = "SmtpSessionConfig::default_connection_id")]
    pub connection_id: String,

    #[serde(skip)]
    pub tls: TlsOptions,
}

impl SmtpSessionConfig {
    pub fn for_remote_address(host: &str, port: u16) -> Self {
        Self {
            remote_address: format!("{host}:{port}"),
            local_address: None,
            keep_alive_timeout: None,
            read_timeout: Self::default_read_timeout(),
            connection_id: Self::default_connection_id(),
            tls: TlsOptions::default(),
        }
    }

    fn default_read_timeout() -> Duration {
        Duration::from_secs(120)
    }

    fn default_connection_id() -> String {
        "unidentified-connection".to_string()
    }

    /// Validate cross-field constraints. Run by the session
    /// constructors before any I/O happens.
    pub fn check(&self) -> Result<(), SessionError> {
        if self.keep_alive_timeout == Some(Duration::ZERO) {
            return Err(SessionError::ZeroKeepAliveTimeout);
        }
        Ok(())
    }

    /// Build the client-mode TLS connector used to secure the
    /// connection to the server, either for implicit TLS before the
    /// session is constructed or by a higher layer performing a
    /// STARTTLS handshake.
    pub fn build_tls_connector(&self) -> TlsConnector {
        self.tls.build_tls_connector()
    }
}
