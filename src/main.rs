//! Relay entry point: parse configuration, wire the bootstrap, and hand
//! control to the session supervisor until a shutdown signal arrives.

use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use gateshim::bootstrap::{Bootstrap, BootstrapSettings};
use gateshim::config::{self, ConfigFile};
use gateshim::core::{KeyInstaller, PacketLogger};
use gateshim::logger::{self, log, LogLevel};
use gateshim::resolver::DirectoryResolver;
use gateshim::supervisor;

// Use mimalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    // Install ring as the default crypto provider for rustls.
    // This must be done before any TLS operations
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let cli = config::CliArgs::parse_args();
    cli.validate()?;

    logger::init_logger(cli.log_level.as_deref().and_then(LogLevel::from_str));

    let config_file = match &cli.config_file {
        Some(path) => ConfigFile::load(path)?,
        None => ConfigFile::default(),
    };

    let context = cli.connection_context();
    let resolver = Arc::new(DirectoryResolver::new(&config_file));
    if resolver.is_empty() && !cli.address_shouter {
        log::warn!("Hotel directory is empty; only literal host:port tickets will resolve");
    }

    let bootstrap = Bootstrap::builder()
        .settings(BootstrapSettings::from_cli(&cli))
        .resolver(resolver)
        .hook(Arc::new(KeyInstaller))
        .hook(Arc::new(PacketLogger))
        .build();

    log::info!(
        port = cli.listen_port,
        platform = ?cli.platform,
        ticket = %cli.ticket,
        socks5 = cli.socks5.is_some(),
        "Starting relay"
    );

    // Create cancellation token for graceful shutdown
    let cancel_token = CancellationToken::new();
    let cancel_token_clone = cancel_token.clone();

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigint = signal(SignalKind::interrupt()).expect("Failed to setup SIGINT");
            let mut sigterm = signal(SignalKind::terminate()).expect("Failed to setup SIGTERM");

            tokio::select! {
                _ = sigint.recv() => {
                    log::info!("SIGINT received, shutting down...");
                }
                _ = sigterm.recv() => {
                    log::info!("SIGTERM received, shutting down...");
                }
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await.ok();
            log::info!("Shutdown signal received...");
        }

        cancel_token_clone.cancel();
    });

    supervisor::run(bootstrap, cli.ticket.clone(), context, cancel_token).await;

    log::info!("Relay stopped");
    Ok(())
}
