//! SOCKS5 client handshake for the remote leg.
//!
//! Greeting, optional username/password sub-negotiation (RFC 1929), then a
//! CONNECT request carrying the resolved game server address. Any refusal
//! is a transport-upgrade failure: the session aborts before relaying.

use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{RelayError, Result};
use crate::resolver::Address;

const SOCKS_VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;
const METHOD_NONE: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const METHOD_UNACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Proxy endpoint plus optional credentials.
#[derive(Debug, Clone)]
pub struct Socks5Settings {
    pub proxy: SocketAddr,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Socks5Settings {
    fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user, pass)),
            _ => None,
        }
    }
}

/// Open a TCP connection to `target` through the configured SOCKS5 proxy.
///
/// The returned stream is ready for game traffic: every handshake byte,
/// including the proxy's bound-address reply, has been consumed.
pub async fn connect_via_socks5(
    settings: &Socks5Settings,
    target: &Address,
) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(settings.proxy).await.map_err(|e| {
        RelayError::TransportUpgrade(format!("SOCKS5 proxy unreachable: {}", e))
    })?;

    // Greeting: offer user/pass only when credentials are configured
    let greeting: &[u8] = if settings.credentials().is_some() {
        &[SOCKS_VERSION, 2, METHOD_NONE, METHOD_USERPASS]
    } else {
        &[SOCKS_VERSION, 1, METHOD_NONE]
    };
    stream.write_all(greeting).await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.map_err(|e| {
        RelayError::TransportUpgrade(format!("SOCKS5 greeting reply failed: {}", e))
    })?;
    if reply[0] != SOCKS_VERSION || reply[1] == METHOD_UNACCEPTABLE {
        return Err(RelayError::TransportUpgrade(format!(
            "SOCKS5 proxy rejected offered methods: {:#04x}",
            reply[1]
        )));
    }

    if reply[1] == METHOD_USERPASS {
        let (user, pass) = settings.credentials().ok_or_else(|| {
            RelayError::TransportUpgrade(
                "SOCKS5 proxy requires credentials, none configured".to_string(),
            )
        })?;
        if user.len() > 255 || pass.len() > 255 {
            return Err(RelayError::TransportUpgrade(
                "SOCKS5 credentials exceed 255 bytes".to_string(),
            ));
        }

        let mut frame = Vec::with_capacity(3 + user.len() + pass.len());
        frame.push(AUTH_VERSION);
        frame.push(user.len() as u8);
        frame.extend_from_slice(user.as_bytes());
        frame.push(pass.len() as u8);
        frame.extend_from_slice(pass.as_bytes());
        stream.write_all(&frame).await?;

        let mut auth_reply = [0u8; 2];
        stream.read_exact(&mut auth_reply).await.map_err(|e| {
            RelayError::TransportUpgrade(format!("SOCKS5 auth reply failed: {}", e))
        })?;
        if auth_reply[1] != 0x00 {
            return Err(RelayError::TransportUpgrade(format!(
                "SOCKS5 authentication refused: {:#04x}",
                auth_reply[1]
            )));
        }
    } else if reply[1] != METHOD_NONE {
        return Err(RelayError::TransportUpgrade(format!(
            "SOCKS5 proxy chose unsupported method: {:#04x}",
            reply[1]
        )));
    }

    // CONNECT request with the target address
    let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
    match target {
        Address::IPv4(ip, port) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(ip);
            request.extend_from_slice(&port.to_be_bytes());
        }
        Address::IPv6(ip, port) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(ip);
            request.extend_from_slice(&port.to_be_bytes());
        }
        Address::Domain(domain, port) => {
            if domain.len() > 255 {
                return Err(RelayError::TransportUpgrade(
                    "SOCKS5 domain exceeds 255 bytes".to_string(),
                ));
            }
            request.push(ATYP_DOMAIN);
            request.push(domain.len() as u8);
            request.extend_from_slice(domain.as_bytes());
            request.extend_from_slice(&port.to_be_bytes());
        }
    }
    stream.write_all(&request).await?;

    // Reply: VER STATUS RSV ATYP, then the bound address we must drain so
    // no proxy bytes leak into the relay stream
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await.map_err(|e| {
        RelayError::TransportUpgrade(format!("SOCKS5 connect reply failed: {}", e))
    })?;
    if head[1] != 0x00 {
        return Err(RelayError::TransportUpgrade(format!(
            "SOCKS5 connect refused: {:#04x}",
            head[1]
        )));
    }
    let bound_len = match head[3] {
        ATYP_IPV4 => 4 + 2,
        ATYP_IPV6 => 16 + 2,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize + 2
        }
        other => {
            return Err(RelayError::TransportUpgrade(format!(
                "SOCKS5 reply carries unknown address type: {:#04x}",
                other
            )));
        }
    };
    let mut bound = vec![0u8; bound_len];
    stream.read_exact(&mut bound).await?;

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn spawn_mock_proxy<F, Fut>(behavior: F) -> SocketAddr
    where
        F: FnOnce(TcpStream) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            behavior(stream).await;
        });
        addr
    }

    fn settings(proxy: SocketAddr) -> Socks5Settings {
        Socks5Settings {
            proxy,
            username: None,
            password: None,
        }
    }

    #[tokio::test]
    async fn test_no_auth_connect_succeeds() {
        let proxy = spawn_mock_proxy(|mut stream| async move {
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            stream.write_all(&[0x05, 0x00]).await.unwrap();

            // CONNECT for 10.0.0.1:30000
            let mut request = [0u8; 10];
            stream.read_exact(&mut request).await.unwrap();
            assert_eq!(&request[..4], &[0x05, 0x01, 0x00, 0x01]);
            assert_eq!(&request[4..8], &[10, 0, 0, 1]);
            assert_eq!(u16::from_be_bytes([request[8], request[9]]), 30000);

            stream
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();

            // Prove the stream is usable afterwards
            let mut follow_up = [0u8; 4];
            stream.read_exact(&mut follow_up).await.unwrap();
            stream.write_all(&follow_up).await.unwrap();
        })
        .await;

        let target = Address::IPv4([10, 0, 0, 1], 30000);
        let mut stream = connect_via_socks5(&settings(proxy), &target).await.unwrap();

        stream.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");
    }

    #[tokio::test]
    async fn test_userpass_subnegotiation() {
        let proxy = spawn_mock_proxy(|mut stream| async move {
            let mut greeting = [0u8; 4];
            stream.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x02, 0x00, 0x02]);
            stream.write_all(&[0x05, 0x02]).await.unwrap();

            // {0x01, len(user), user, len(pass), pass}
            let mut head = [0u8; 2];
            stream.read_exact(&mut head).await.unwrap();
            assert_eq!(head[0], 0x01);
            let mut user = vec![0u8; head[1] as usize];
            stream.read_exact(&mut user).await.unwrap();
            assert_eq!(user, b"operator");
            let mut pass_len = [0u8; 1];
            stream.read_exact(&mut pass_len).await.unwrap();
            let mut pass = vec![0u8; pass_len[0] as usize];
            stream.read_exact(&mut pass).await.unwrap();
            assert_eq!(pass, b"hunter2");
            stream.write_all(&[0x01, 0x00]).await.unwrap();

            let mut request = [0u8; 10];
            stream.read_exact(&mut request).await.unwrap();
            stream
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        })
        .await;

        let target = Address::IPv4([192, 168, 1, 5], 1234);
        let result = connect_via_socks5(
            &Socks5Settings {
                proxy,
                username: Some("operator".to_string()),
                password: Some("hunter2".to_string()),
            },
            &target,
        )
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_method_rejection_is_upgrade_failure() {
        let proxy = spawn_mock_proxy(|mut stream| async move {
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            stream.write_all(&[0x05, 0xFF]).await.unwrap();
        })
        .await;

        let target = Address::IPv4([10, 0, 0, 1], 80);
        let err = connect_via_socks5(&settings(proxy), &target)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::TransportUpgrade(_)));
    }

    #[tokio::test]
    async fn test_connect_refusal_is_upgrade_failure() {
        let proxy = spawn_mock_proxy(|mut stream| async move {
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            stream.write_all(&[0x05, 0x00]).await.unwrap();
            let mut request = [0u8; 10];
            stream.read_exact(&mut request).await.unwrap();
            // 0x05 = connection refused
            stream
                .write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        })
        .await;

        let target = Address::IPv4([10, 0, 0, 1], 80);
        let err = connect_via_socks5(&settings(proxy), &target)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::TransportUpgrade(_)));
    }

    #[tokio::test]
    async fn test_domain_target_encoding() {
        let proxy = spawn_mock_proxy(|mut stream| async move {
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            stream.write_all(&[0x05, 0x00]).await.unwrap();

            let mut head = [0u8; 5];
            stream.read_exact(&mut head).await.unwrap();
            assert_eq!(&head[..4], &[0x05, 0x01, 0x00, 0x03]);
            let mut domain = vec![0u8; head[4] as usize];
            stream.read_exact(&mut domain).await.unwrap();
            assert_eq!(domain, b"game.example.net");
            let mut port = [0u8; 2];
            stream.read_exact(&mut port).await.unwrap();
            assert_eq!(u16::from_be_bytes(port), 30001);

            stream
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        })
        .await;

        let target = Address::Domain("game.example.net".to_string(), 30001);
        assert!(connect_via_socks5(&settings(proxy), &target).await.is_ok());
    }
}
