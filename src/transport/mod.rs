//! Transport layer abstraction
//!
//! Unifies the two transports the game protocol travels over:
//! - plain TCP
//! - secured WebSocket (TLS + WebSocket framing)
//!
//! Upgrades complete here, before a stream is wrapped into a channel.

mod socks;
mod tls;
mod ws;

pub use socks::{connect_via_socks5, Socks5Settings};
pub use tls::{load_client_config, load_server_config};
pub use ws::{upgrade_websocket_client, upgrade_websocket_server, WebSocketByteStream};

use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};

/// Unified stream bound: anything a channel can own.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Boxed transport stream handed to a channel.
pub type TransportStream = Pin<Box<dyn AsyncStream>>;

/// Transport type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// Plain TCP
    Tcp,
    /// TLS + WebSocket framing
    SecureWebSocket,
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportType::Tcp => write!(f, "tcp"),
            TransportType::SecureWebSocket => write!(f, "wss"),
        }
    }
}
