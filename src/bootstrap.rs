//! Session bootstrap.
//!
//! Walks one session from nothing to a wired relay:
//! accept the local client (skipping its decoy preflight connections and,
//! when configured, emulating the cross-domain policy exchange), resolve
//! the real server, dial it (directly or through SOCKS5), upgrade
//! transports, and hand back a `Relay` ready to attach. Failure anywhere
//! disposes everything already opened; no partial session escapes.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::config::{CliArgs, ConnectionContext, PatchFlags};
use crate::core::channel::Channel;
use crate::core::hooks::HookChain;
use crate::core::protocol::PacketFormat;
use crate::core::relay::Relay;
use crate::error::{RelayError, Result};
use crate::logger::log;
use crate::resolver::{EndpointResolver, GameEndpoint};
use crate::transport::{
    connect_via_socks5, load_client_config, load_server_config, upgrade_websocket_client,
    upgrade_websocket_server, Socks5Settings, TransportStream,
};

/// Policy request the plugin client sends on its preflight socket
pub const POLICY_REQUEST: &[u8] = b"<policy-file-request/>\0";

/// Grant we answer with before closing the policy socket
pub const POLICY_RESPONSE: &[u8] =
    b"<cross-domain-policy><allow-access-from domain=\"*\" to-ports=\"*\"/></cross-domain-policy>\0";

/// TCP keepalive interval on the remote leg; dead servers are detected in
/// ~45s (3 probes)
const TCP_KEEPALIVE_SECS: u64 = 15;

/// Everything the bootstrap needs besides the per-session context.
#[derive(Debug, Clone)]
pub struct BootstrapSettings {
    pub listen_port: u16,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub socks5: Option<Socks5Settings>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub extra_ca: Option<PathBuf>,
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        Self {
            listen_port: 38101,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            socks5: None,
            cert: None,
            key: None,
            extra_ca: None,
        }
    }
}

impl BootstrapSettings {
    pub fn from_cli(cli: &CliArgs) -> Self {
        Self {
            listen_port: cli.listen_port,
            connect_timeout: cli.connect_timeout,
            handshake_timeout: cli.handshake_timeout,
            socks5: cli.socks5_settings(),
            cert: cli.cert.clone(),
            key: cli.key.clone(),
            extra_ca: cli.extra_ca.clone(),
        }
    }
}

/// Transient listener used for exactly one accept cycle's worth of
/// decoy + policy + session connections, then dropped.
pub struct LocalAcceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl LocalAcceptor {
    pub async fn bind(port: u16) -> Result<Self> {
        let addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, port).into();
        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        // Immediate rebind between sessions; decoy sockets die without
        // lingering in TIME_WAIT
        socket.set_reuse_address(true)?;
        socket.set_linger(Some(Duration::ZERO))?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(1)?;

        let listener = TcpListener::from_std(socket.into())?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn accept(&self, cancel: &CancellationToken) -> Result<(TcpStream, SocketAddr)> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RelayError::Cancelled),
            accepted = self.listener.accept() => Ok(accepted?),
        }
    }

    /// Accept the session socket: discard `minimum_connection_attempts - 1`
    /// decoys, serve the policy preflight when configured, then keep the
    /// next connection and upgrade its transport.
    pub async fn accept_session(
        &self,
        settings: &BootstrapSettings,
        context: &ConnectionContext,
        cancel: &CancellationToken,
    ) -> Result<Arc<Channel>> {
        let mut decoys = context.minimum_connection_attempts.saturating_sub(1);
        while decoys > 0 {
            let (decoy, peer) = self.accept(cancel).await?;
            log::debug!(peer = %peer, remaining = decoys - 1, "Decoy connection discarded");
            drop(decoy);
            decoys -= 1;
        }

        if context.fake_policy_request {
            let (policy_socket, peer) = self.accept(cancel).await?;
            tokio::time::timeout(
                settings.handshake_timeout,
                serve_policy_request(policy_socket),
            )
            .await
            .map_err(|_| {
                RelayError::ProtocolViolation("policy handshake timed out".to_string())
            })??;
            log::debug!(peer = %peer, "Policy request granted");
        }

        let (session, peer) = self.accept(cancel).await?;
        let _ = session.set_nodelay(true);
        log::connection(&peer.to_string(), "accepted");

        let stream: TransportStream = if context.secure_websocket {
            let acceptor = local_tls_acceptor(settings)?;
            let upgrade = async {
                let tls_stream = acceptor.accept(session).await.map_err(|e| {
                    RelayError::TransportUpgrade(format!("local TLS accept failed: {}", e))
                })?;
                let ws = upgrade_websocket_server(tls_stream).await?;
                Ok::<TransportStream, RelayError>(Box::pin(ws))
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RelayError::Cancelled),
                upgraded = tokio::time::timeout(settings.handshake_timeout, upgrade) => {
                    upgraded.map_err(|_| {
                        RelayError::TransportUpgrade("local transport upgrade timed out".to_string())
                    })??
                }
            }
        } else {
            Box::pin(session)
        };

        Ok(Channel::new(stream, PacketFormat::Outbound, peer.to_string()))
    }
}

/// Verify the policy request literal, answer with the grant, close.
async fn serve_policy_request(mut socket: TcpStream) -> Result<()> {
    let mut buffer = [0u8; 512];
    let received = socket.read(&mut buffer).await?;
    if &buffer[..received] != POLICY_REQUEST {
        return Err(RelayError::ProtocolViolation(
            "expected cross-domain policy request".to_string(),
        ));
    }
    socket.write_all(POLICY_RESPONSE).await?;
    socket.flush().await?;
    Ok(())
}

fn local_tls_acceptor(settings: &BootstrapSettings) -> Result<TlsAcceptor> {
    let (cert, key) = match (&settings.cert, &settings.key) {
        (Some(cert), Some(key)) => (cert, key),
        _ => {
            return Err(RelayError::Config(
                "secure WebSocket requires certificate and key paths".to_string(),
            ));
        }
    };
    Ok(TlsAcceptor::from(load_server_config(cert, key)?))
}

/// Dial the resolved server and upgrade its transport.
pub async fn establish_remote(
    settings: &BootstrapSettings,
    context: &ConnectionContext,
    endpoint: &GameEndpoint,
    cancel: &CancellationToken,
) -> Result<Arc<Channel>> {
    let connect = async {
        match &settings.socks5 {
            Some(socks) => connect_via_socks5(socks, &endpoint.address).await,
            None => {
                let addr = endpoint.address.to_socket_addr().await?;
                TcpStream::connect(addr)
                    .await
                    .map_err(|e| RelayError::TransportUpgrade(format!("connect failed: {}", e)))
            }
        }
    };
    let stream = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(RelayError::Cancelled),
        connected = tokio::time::timeout(settings.connect_timeout, connect) => {
            connected.map_err(|_| {
                RelayError::TransportUpgrade(format!("connect to {} timed out", endpoint))
            })??
        }
    };

    let _ = stream.set_nodelay(true);
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(TCP_KEEPALIVE_SECS))
        .with_interval(Duration::from_secs(TCP_KEEPALIVE_SECS));
    let _ = socket2::SockRef::from(&stream).set_tcp_keepalive(&keepalive);

    let stream: TransportStream = if context.secure_websocket {
        let host = endpoint.address.host();
        let config = load_client_config(settings.extra_ca.as_deref())?;
        let connector = tokio_rustls::TlsConnector::from(config);
        let server_name = rustls::pki_types::ServerName::try_from(host.clone())
            .map_err(|_| RelayError::TransportUpgrade(format!("invalid server name: {}", host)))?;

        let upgrade = async {
            let tls_stream = connector.connect(server_name, stream).await.map_err(|e| {
                RelayError::TransportUpgrade(format!("remote TLS handshake failed: {}", e))
            })?;
            let ws = upgrade_websocket_client(tls_stream, &host).await?;
            Ok::<TransportStream, RelayError>(Box::pin(ws))
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RelayError::Cancelled),
            upgraded = tokio::time::timeout(settings.handshake_timeout, upgrade) => {
                upgraded.map_err(|_| {
                    RelayError::TransportUpgrade("remote transport upgrade timed out".to_string())
                })??
            }
        }
    } else {
        Box::pin(stream)
    };

    Ok(Channel::new(
        stream,
        PacketFormat::Inbound,
        endpoint.to_string(),
    ))
}

/// Produces fully wired relays, one per session.
pub struct Bootstrap {
    settings: BootstrapSettings,
    resolver: Arc<dyn EndpointResolver>,
    hooks: HookChain,
}

impl Bootstrap {
    pub fn builder() -> BootstrapBuilder {
        BootstrapBuilder::default()
    }

    pub fn settings(&self) -> &BootstrapSettings {
        &self.settings
    }

    /// Run the whole bootstrap state machine for one session.
    pub async fn launch(
        &self,
        ticket: &str,
        context: ConnectionContext,
        cancel: &CancellationToken,
    ) -> Result<Arc<Relay>> {
        let acceptor = LocalAcceptor::bind(self.settings.listen_port).await?;
        log::info!(
            address = %acceptor.local_addr(),
            attempts = context.minimum_connection_attempts,
            policy = context.fake_policy_request,
            wss = context.secure_websocket,
            "Awaiting client connection"
        );

        let local = acceptor
            .accept_session(&self.settings, &context, cancel)
            .await?;
        // One accept cycle per listener; a fresh session binds a fresh one
        drop(acceptor);

        // Until the relay owns both channels, any failure tears the local
        // side down
        let local_guard = scopeguard::guard(Arc::clone(&local), |channel| channel.dispose());

        let endpoint = if context.patches.contains(PatchFlags::ADDRESS_SHOUTER) {
            self.resolver.resolve_by_shout(&local, &context, cancel).await?
        } else {
            self.resolver.resolve_by_ticket(ticket, cancel).await?
        };
        log::info!(endpoint = %endpoint, "Remote endpoint resolved");

        let remote = establish_remote(&self.settings, &context, &endpoint, cancel).await?;
        log::connection(remote.peer(), "established");

        scopeguard::ScopeGuard::into_inner(local_guard);
        Ok(Relay::new(local, remote, self.hooks.clone(), context))
    }
}

/// Builder wiring resolver, hooks, and settings into a `Bootstrap`.
#[derive(Default)]
pub struct BootstrapBuilder {
    settings: Option<BootstrapSettings>,
    resolver: Option<Arc<dyn EndpointResolver>>,
    hooks: HookChain,
}

impl BootstrapBuilder {
    pub fn settings(mut self, settings: BootstrapSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn EndpointResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn hook(mut self, hook: Arc<dyn crate::core::hooks::PacketHook>) -> Self {
        self.hooks = self.hooks.with(hook);
        self
    }

    /// Panics if no resolver was provided
    pub fn build(self) -> Bootstrap {
        Bootstrap {
            settings: self.settings.unwrap_or_default(),
            resolver: self.resolver.expect("resolver is required"),
            hooks: self.hooks,
        }
    }
}
