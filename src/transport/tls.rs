//! TLS configuration for the secured WebSocket transport.
//!
//! The local (server) side terminates TLS for the game client with an
//! operator-provided certificate; the remote (client) side trusts the
//! platform roots plus an optional extra CA for private game servers.

use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use crate::error::{RelayError, Result};

/// Build the server-side TLS config from certificate and key files.
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>> {
    let cert_file = File::open(cert_path)?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
        .filter_map(|r| r.ok())
        .collect();

    if certs.is_empty() {
        return Err(RelayError::TransportUpgrade(format!(
            "no certificates found in {}",
            cert_path.display()
        )));
    }

    let key_file = File::open(key_path)?;
    let mut key_reader = BufReader::new(key_file);
    let key = rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| {
            RelayError::TransportUpgrade(format!("no private key found in {}", key_path.display()))
        })?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| RelayError::TransportUpgrade(format!("invalid certificate/key: {}", e)))?;

    // Session tickets let a reconnecting client skip the full handshake
    if let Ok(ticketer) = rustls::crypto::ring::Ticketer::new() {
        config.ticketer = ticketer;
    }

    Ok(Arc::new(config))
}

/// Build the client-side TLS config: platform roots plus an optional
/// additional CA bundle.
pub fn load_client_config(extra_ca: Option<&Path>) -> Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();

    for cert in rustls_native_certs::load_native_certs().certs {
        let _ = roots.add(cert);
    }

    if let Some(ca_path) = extra_ca {
        let ca_file = File::open(ca_path)?;
        let mut ca_reader = BufReader::new(ca_file);
        let mut added = 0;
        for cert in rustls_pemfile::certs(&mut ca_reader).filter_map(|r| r.ok()) {
            if roots.add(cert).is_ok() {
                added += 1;
            }
        }
        if added == 0 {
            return Err(RelayError::TransportUpgrade(format!(
                "no usable CA certificates in {}",
                ca_path.display()
            )));
        }
    }

    if roots.is_empty() {
        return Err(RelayError::TransportUpgrade(
            "no trusted root certificates available".to_string(),
        ));
    }

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(Arc::new(config))
}
