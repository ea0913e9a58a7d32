//! Man-in-the-middle relay for a stateful game client/server protocol.
//!
//! Architecture:
//! - `core/`: packet codecs, channels, cipher, relay pump, hooks
//! - `transport/`: TCP, TLS + WebSocket, SOCKS5 client
//! - `bootstrap`: per-session state machine producing a wired relay
//! - `resolver`: ticket / address-shout endpoint resolution
//! - `supervisor`: process-level accept-and-relay loop

pub mod bootstrap;
pub mod config;
pub mod core;
pub mod error;
pub mod logger;
pub mod resolver;
pub mod supervisor;
pub mod transport;

pub use error::{RelayError, Result};
