//! Remote endpoint resolution.
//!
//! A session knows the real game server either out-of-band (the ticket
//! names a hotel in the operator's directory) or in-band (the patched
//! client shouts the address as its very first packet). Both paths produce
//! a `GameEndpoint` before the outbound leg is dialed.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigFile, ConnectionContext};
use crate::core::channel::Channel;
use crate::core::protocol::{PacketReader, ADDRESS_SHOUT_ID};
use crate::error::{RelayError, Result};
use crate::logger::log;

/// Target address, also used verbatim by the SOCKS5 CONNECT encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    IPv4([u8; 4], u16),
    IPv6([u8; 16], u16),
    Domain(String, u16),
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::IPv4(ip, port) => write!(f, "{}:{}", Ipv4Addr::from(*ip), port),
            Address::IPv6(ip, port) => write!(f, "[{}]:{}", Ipv6Addr::from(*ip), port),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl Address {
    /// Parse a `host:port` string (IPv6 hosts in brackets).
    pub fn parse(s: &str) -> Result<Self> {
        if let Ok(socket) = s.parse::<SocketAddr>() {
            return Ok(match socket.ip() {
                IpAddr::V4(ip) => Address::IPv4(ip.octets(), socket.port()),
                IpAddr::V6(ip) => Address::IPv6(ip.octets(), socket.port()),
            });
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| RelayError::Resolution(format!("'{}' is not host:port", s)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| RelayError::Resolution(format!("bad port in '{}'", s)))?;
        if host.is_empty() || host.contains([':', '/', ' ']) {
            return Err(RelayError::Resolution(format!("bad host in '{}'", s)));
        }
        Ok(Address::Domain(host.to_string(), port))
    }

    pub fn from_host_port(host: &str, port: u16) -> Self {
        match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => Address::IPv4(ip.octets(), port),
            Ok(IpAddr::V6(ip)) => Address::IPv6(ip.octets(), port),
            Err(_) => Address::Domain(host.to_string(), port),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Address::IPv4(_, port) | Address::IPv6(_, port) => *port,
            Address::Domain(_, port) => *port,
        }
    }

    pub fn host(&self) -> String {
        match self {
            Address::IPv4(ip, _) => Ipv4Addr::from(*ip).to_string(),
            Address::IPv6(ip, _) => Ipv6Addr::from(*ip).to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    /// Resolve to a socket address (DNS for domains).
    pub async fn to_socket_addr(&self) -> Result<SocketAddr> {
        match self {
            Address::IPv4(ip, port) => {
                Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(*ip)), *port))
            }
            Address::IPv6(ip, port) => {
                Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(*ip)), *port))
            }
            Address::Domain(domain, port) => {
                let mut addrs = tokio::net::lookup_host((domain.as_str(), *port))
                    .await
                    .map_err(|e| {
                        RelayError::Resolution(format!("DNS lookup for {} failed: {}", domain, e))
                    })?;
                addrs.next().ok_or_else(|| {
                    RelayError::Resolution(format!("no addresses found for {}", domain))
                })
            }
        }
    }
}

/// Resolved game server plus the hotel identity that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameEndpoint {
    pub address: Address,
    pub identity: Option<String>,
}

impl std::fmt::Display for GameEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.identity {
            Some(identity) => write!(f, "{} ({})", self.address, identity),
            None => write!(f, "{}", self.address),
        }
    }
}

/// Maps a session to the real game server.
#[async_trait]
pub trait EndpointResolver: Send + Sync {
    /// Out-of-band resolution from the session ticket alone.
    async fn resolve_by_ticket(
        &self,
        ticket: &str,
        cancel: &CancellationToken,
    ) -> Result<GameEndpoint>;

    /// In-band resolution: the patched client announces the server address
    /// as its first packet. Peeked, not consumed — once the relay attaches
    /// it still sees the frame.
    async fn resolve_by_shout(
        &self,
        local: &Channel,
        context: &ConnectionContext,
        cancel: &CancellationToken,
    ) -> Result<GameEndpoint> {
        resolve_from_shout(local, context, cancel).await
    }
}

/// Parse the shouted address out of the first packet on `local`.
pub async fn resolve_from_shout(
    local: &Channel,
    context: &ConnectionContext,
    cancel: &CancellationToken,
) -> Result<GameEndpoint> {
    let frame = local.peek_packet(cancel).await?;
    let mut reader = PacketReader::new(local.format(), &frame)?;

    if reader.id() != ADDRESS_SHOUT_ID {
        return Err(RelayError::Resolution(format!(
            "expected address shout ({}), client sent packet {}",
            ADDRESS_SHOUT_ID,
            reader.id()
        )));
    }

    let shouted = reader.read_utf8().map_err(|e| {
        RelayError::Resolution(format!("unreadable address shout: {}", e))
    })?;
    let address = Address::parse(&shouted)?;

    log::debug!(platform = ?context.platform, address = %address, "Address shout resolved");
    Ok(GameEndpoint {
        address,
        identity: None,
    })
}

/// Directory-backed resolver: tickets look like `<hotel>.<token>`; the
/// hotel prefix indexes the configured directory, and a ticket that is
/// itself `host:port` resolves directly.
pub struct DirectoryResolver {
    directory: HashMap<String, Address>,
}

impl DirectoryResolver {
    pub fn new(config: &ConfigFile) -> Self {
        let directory = config
            .hotels
            .iter()
            .map(|(hotel, entry)| {
                (
                    hotel.clone(),
                    Address::from_host_port(&entry.host, entry.port),
                )
            })
            .collect();
        Self { directory }
    }

    pub fn is_empty(&self) -> bool {
        self.directory.is_empty()
    }
}

#[async_trait]
impl EndpointResolver for DirectoryResolver {
    async fn resolve_by_ticket(
        &self,
        ticket: &str,
        _cancel: &CancellationToken,
    ) -> Result<GameEndpoint> {
        // A literal address needs no directory
        if let Ok(address) = Address::parse(ticket) {
            return Ok(GameEndpoint {
                address,
                identity: None,
            });
        }

        let hotel = ticket.split('.').next().unwrap_or_default();
        match self.directory.get(hotel) {
            Some(address) => Ok(GameEndpoint {
                address: address.clone(),
                identity: Some(hotel.to_string()),
            }),
            None => Err(RelayError::Resolution(format!(
                "ticket prefix '{}' not in the hotel directory",
                hotel
            ))),
        }
    }
}
