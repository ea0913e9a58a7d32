use std::io;
use thiserror::Error;

/// Unified error type for the relay.
///
/// Per-connection errors (`ConnectionClosed`, `ProtocolViolation`,
/// `Cancelled`) terminate the owning relay, never the process. Bootstrap
/// errors (`Resolution`, `TransportUpgrade`, `Config`) surface to the
/// caller before any relay starts.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Peer disconnected or the socket failed mid-session
    #[error("connection closed")]
    ConnectionClosed,

    /// Malformed frame or unexpected handshake byte; fatal for the channel
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The remote endpoint could not be determined
    #[error("endpoint resolution failed: {0}")]
    Resolution(String),

    /// SOCKS5 / TLS / WebSocket handshake failed during bootstrap
    #[error("transport upgrade failed: {0}")]
    TransportUpgrade(String),

    /// Cooperative abort; unwinds in-flight operations but is not a fault
    #[error("operation cancelled")]
    Cancelled,

    /// IO error outside an established channel (bind, accept, connect)
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl RelayError {
    /// Whether this error is a routine end-of-session rather than a fault.
    pub fn is_benign(&self) -> bool {
        matches!(self, RelayError::ConnectionClosed | RelayError::Cancelled)
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, RelayError>;

impl From<toml::de::Error> for RelayError {
    fn from(err: toml::de::Error) -> Self {
        RelayError::Config(format!("TOML parse error: {}", err))
    }
}
