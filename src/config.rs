//! Configuration
//!
//! CLI argument parsing with environment variable support, the optional
//! TOML config file carrying the hotel directory, and the per-session
//! connection context derived from both.

use bitflags::bitflags;
use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{RelayError, Result};
use crate::transport::Socks5Settings;

/// Parse duration string (e.g., "10s", "2m") or plain seconds
fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }
    s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
        format!(
            "Invalid duration '{}'. Use formats like '10s', '2m' or plain seconds",
            s
        )
    })
}

/// Game client platform being intercepted. Drives per-platform defaults:
/// how many decoy preflight connections the client opens before the real
/// one, and whether it expects a cross-domain policy exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Platform {
    #[default]
    Flash,
    Shockwave,
    Unity,
}

impl Platform {
    /// Decoy connections the client opens before the session socket
    pub fn default_connection_attempts(&self) -> u32 {
        match self {
            Platform::Flash => 3,
            Platform::Shockwave => 3,
            Platform::Unity => 1,
        }
    }

    /// Whether this platform's client preflights a policy request
    pub fn expects_policy_request(&self) -> bool {
        matches!(self, Platform::Flash | Platform::Shockwave)
    }
}

bitflags! {
    /// Client patches applied before launch. The relay consults
    /// `ADDRESS_SHOUTER`; the rest travel with the session for logging.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PatchFlags: u32 {
        /// Client announces the real server address as its first packet
        const ADDRESS_SHOUTER = 1 << 0;
        /// Client sends its cipher key over the key-exchange control packet
        const KEY_SHOUTER = 1 << 1;
        /// Client-side host validation was neutralized
        const DISABLE_HOST_CHECKS = 1 << 2;
    }
}

/// Immutable per-session metadata.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub platform: Platform,
    pub minimum_connection_attempts: u32,
    pub fake_policy_request: bool,
    pub secure_websocket: bool,
    pub patches: PatchFlags,
}

impl Default for ConnectionContext {
    fn default() -> Self {
        let platform = Platform::default();
        Self {
            platform,
            minimum_connection_attempts: platform.default_connection_attempts(),
            fake_policy_request: false,
            secure_websocket: false,
            patches: PatchFlags::empty(),
        }
    }
}

/// CLI arguments
///
/// Every flag can also come from the environment with a `GATESHIM_` prefix.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Man-in-the-middle relay for game sessions")]
pub struct CliArgs {
    /// Port the patched client connects to
    #[arg(long, env = "GATESHIM_LISTEN_PORT", default_value_t = 38101)]
    pub listen_port: u16,

    /// Session ticket used to resolve the real server
    #[arg(long, env = "GATESHIM_TICKET")]
    pub ticket: String,

    /// Optional TOML config file with the hotel directory
    #[arg(short = 'c', long, env = "GATESHIM_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Target client platform
    #[arg(long, env = "GATESHIM_PLATFORM", value_enum, default_value = "flash")]
    pub platform: Platform,

    /// Override the platform's default decoy connection count
    #[arg(long, env = "GATESHIM_MIN_CONNECTION_ATTEMPTS")]
    pub min_connection_attempts: Option<u32>,

    /// Emulate the cross-domain policy handshake on the local side
    #[arg(long, env = "GATESHIM_FAKE_POLICY")]
    pub fake_policy: bool,

    /// Upgrade both sides to a secured WebSocket transport
    #[arg(long, env = "GATESHIM_SECURE_WEBSOCKET")]
    pub secure_websocket: bool,

    /// TLS certificate presented to the local client (PEM)
    #[arg(long, env = "GATESHIM_CERT_FILE")]
    pub cert: Option<PathBuf>,

    /// Private key for the local certificate (PEM)
    #[arg(long, env = "GATESHIM_KEY_FILE")]
    pub key: Option<PathBuf>,

    /// Extra CA bundle trusted for the remote connection (PEM)
    #[arg(long, env = "GATESHIM_CA_FILE")]
    pub extra_ca: Option<PathBuf>,

    /// Route the remote connection through this SOCKS5 proxy
    #[arg(long, env = "GATESHIM_SOCKS5")]
    pub socks5: Option<SocketAddr>,

    /// SOCKS5 username
    #[arg(long, env = "GATESHIM_SOCKS5_USER")]
    pub socks5_username: Option<String>,

    /// SOCKS5 password
    #[arg(long, env = "GATESHIM_SOCKS5_PASS")]
    pub socks5_password: Option<String>,

    /// The client was patched to shout the real server address
    #[arg(long, env = "GATESHIM_ADDRESS_SHOUTER")]
    pub address_shouter: bool,

    /// Remote connect timeout
    #[arg(long, env = "GATESHIM_CONNECT_TIMEOUT", value_parser = parse_duration, default_value = "10s")]
    pub connect_timeout: Duration,

    /// Transport upgrade (TLS/WebSocket/SOCKS5) timeout
    #[arg(long, env = "GATESHIM_HANDSHAKE_TIMEOUT", value_parser = parse_duration, default_value = "10s")]
    pub handshake_timeout: Duration,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "GATESHIM_LOG_LEVEL")]
    pub log_level: Option<String>,
}

impl CliArgs {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn validate(&self) -> Result<()> {
        if self.ticket.trim().is_empty() {
            return Err(RelayError::Config("ticket must not be empty".to_string()));
        }
        if self.secure_websocket && (self.cert.is_none() || self.key.is_none()) {
            return Err(RelayError::Config(
                "--secure-websocket requires --cert and --key".to_string(),
            ));
        }
        if self.socks5_username.is_some() != self.socks5_password.is_some() {
            return Err(RelayError::Config(
                "SOCKS5 username and password must be provided together".to_string(),
            ));
        }
        if self.socks5.is_none() && self.socks5_username.is_some() {
            return Err(RelayError::Config(
                "SOCKS5 credentials given without --socks5".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the per-session context from the CLI view of the world.
    pub fn connection_context(&self) -> ConnectionContext {
        let mut patches = PatchFlags::KEY_SHOUTER;
        if self.address_shouter {
            patches |= PatchFlags::ADDRESS_SHOUTER;
        }
        ConnectionContext {
            platform: self.platform,
            minimum_connection_attempts: self
                .min_connection_attempts
                .unwrap_or_else(|| self.platform.default_connection_attempts())
                .max(1),
            fake_policy_request: self.fake_policy && self.platform.expects_policy_request(),
            secure_websocket: self.secure_websocket,
            patches,
        }
    }

    pub fn socks5_settings(&self) -> Option<Socks5Settings> {
        self.socks5.map(|proxy| Socks5Settings {
            proxy,
            username: self.socks5_username.clone(),
            password: self.socks5_password.clone(),
        })
    }
}

/// One directory entry mapping a hotel prefix to its game server.
#[derive(Debug, Clone, Deserialize)]
pub struct HotelEntry {
    pub host: String,
    pub port: u16,
}

/// TOML config file contents.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub hotels: HashMap<String, HotelEntry>,
}

impl ConfigFile {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}
