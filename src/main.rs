//! Command-line entry point for the input fabric.
//!
//! The network fabric (§4) is a library; this binary is thin ambient
//! tooling that wires a role's config into the connection handlers and
//! keeps the process alive. Input capture/injection backends are out of
//! scope (spec.md §6) — `serve`/`connect` exercise the fabric itself, not
//! a real keyboard/mouse/clipboard integration.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use inputfabric::config::FabricConfig;
use inputfabric::connection::{ClientConnectionHandler, ServerConnectionHandler};
use inputfabric::event_bus::EventBus;
use inputfabric::metrics::MetricsCollector;
use inputfabric::protocol::StreamKind;
use inputfabric::stream::{ClientStreamHandler, ServerMulticastHandler, ServerUnicastHandler};

#[derive(Parser)]
#[command(name = "inputfabric", version, about = "Cross-host input-sharing network fabric")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server role: bind the primary port and accept clients from
    /// the authorized-clients allowlist.
    Serve,
    /// Run the client role: dial a configured server and stay connected.
    Connect,
    /// Run the certificate-sharing responder standalone, printing the OTP
    /// for out-of-band delivery to a new client.
    ShareCert {
        /// Seconds the OTP stays valid before the listener shuts down.
        #[arg(long, default_value_t = 30)]
        otp_timeout: u64,
    },
    /// Fetch the server's CA certificate using an OTP obtained out of band.
    Pair {
        #[arg(long)]
        otp: String,
        #[arg(long)]
        host: String,
        #[arg(long)]
        port: Option<u16>,
    },
}

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();
}

/// Loads (or mints and persists) the stable UID this client presents at
/// handshake, since the server's allowlist keys reconnects by it.
fn client_uid() -> Result<String> {
    let path = FabricConfig::config_dir()?.join("client_uid");
    if let Ok(existing) = std::fs::read_to_string(&path) {
        let uid = existing.trim().to_string();
        if !uid.is_empty() {
            return Ok(uid);
        }
    }
    let uid = uuid::Uuid::new_v4().to_string();
    inputfabric::config::atomic_write(&path, uid.as_bytes())?;
    Ok(uid)
}

async fn run_serve() -> Result<()> {
    let config = FabricConfig::load("server")?;
    if config.authorized_clients.is_empty() {
        log::warn!("no authorized clients configured; no client will complete a handshake");
    }

    let event_bus = Arc::new(EventBus::new());
    let mut metrics = MetricsCollector::new();
    metrics.start_periodic_logging(inputfabric::constants::METRICS_LOG_INTERVAL);
    let metrics = Arc::new(metrics);

    let server = Arc::new(
        ServerConnectionHandler::bind(config.clone(), Arc::clone(&event_bus), Arc::clone(&metrics))
            .await
            .context("failed to bind server")?,
    );
    log::info!("listening on {}", server.local_addr()?);

    let clients = server.clients();
    let mut handlers: Vec<Arc<ServerUnicastHandler>> = Vec::new();
    let mut multicast_handlers: Vec<Arc<ServerMulticastHandler>> = Vec::new();
    for stream in &config.streams_enabled {
        match stream {
            StreamKind::Clipboard => {
                multicast_handlers
                    .push(ServerMulticastHandler::new(*stream, Arc::clone(&clients), Arc::clone(&event_bus), 1000).await);
            }
            StreamKind::Mouse => {
                handlers.push(ServerUnicastHandler::new(*stream, Arc::clone(&clients), Arc::clone(&event_bus), false, 10_000).await);
            }
            StreamKind::Keyboard => {
                handlers.push(ServerUnicastHandler::new(*stream, Arc::clone(&clients), Arc::clone(&event_bus), false, 1000).await);
            }
            _ => {
                handlers.push(ServerUnicastHandler::new(*stream, Arc::clone(&clients), Arc::clone(&event_bus), true, 1000).await);
            }
        }
    }

    let accept_server = Arc::clone(&server);
    tokio::spawn(async move {
        if let Err(e) = accept_server.run_accept_loop().await {
            log::error!("accept loop exited: {e}");
        }
    });

    let heartbeat_server = Arc::clone(&server);
    tokio::spawn(async move { heartbeat_server.run_heartbeat_loop().await });

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    log::info!("shutting down");
    for handler in handlers {
        handler.stop().await;
    }
    for handler in multicast_handlers {
        handler.stop().await;
    }
    Ok(())
}

async fn run_connect() -> Result<()> {
    let config = FabricConfig::load("client")?;
    let uid = client_uid()?;
    let event_bus = Arc::new(EventBus::new());
    let mut metrics = MetricsCollector::new();
    metrics.start_periodic_logging(inputfabric::constants::METRICS_LOG_INTERVAL);
    let metrics = Arc::new(metrics);

    let streams_enabled = config.streams_enabled.clone();
    let client = ClientConnectionHandler::new(config, uid, streams_enabled.clone(), Arc::clone(&event_bus), metrics);
    client.start().await;

    let mut handlers: Vec<Arc<ClientStreamHandler>> = Vec::new();
    for stream in &streams_enabled {
        let active_only = !matches!(stream, StreamKind::Command | StreamKind::Clipboard);
        handlers.push(ClientStreamHandler::new(*stream, Arc::clone(&client), Arc::clone(&event_bus), active_only, 1000).await);
    }

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    log::info!("shutting down");
    for handler in handlers {
        handler.stop().await;
    }
    client.stop().await;
    Ok(())
}

async fn run_share_cert(otp_timeout: u64) -> Result<()> {
    let config = FabricConfig::load("server")?;
    let cert_path = FabricConfig::config_dir()?.join("ca.pem");
    let cert_pem = std::fs::read(&cert_path)
        .with_context(|| format!("no CA certificate found at {}; generate one before sharing", cert_path.display()))?;

    let server = Arc::new(inputfabric::cert_share::CertificateSharingServer::new(cert_pem, config.host.clone(), config.cert_share_port));
    let otp = server.start_sharing().await?;
    println!("OTP: {otp}");
    println!("Share this code with the connecting client within {otp_timeout}s.");

    tokio::time::sleep(std::time::Duration::from_secs(otp_timeout)).await;
    server.stop_sharing().await;
    Ok(())
}

async fn run_pair(otp: String, host: String, port: Option<u16>) -> Result<()> {
    let port = port.unwrap_or(inputfabric::constants::DEFAULT_CERT_SHARE_PORT);
    let cert_pem = inputfabric::cert_share::receive_certificate(&host, port, &otp).await?;

    let path = FabricConfig::config_dir()?.join(format!("{host}.pem"));
    inputfabric::config::atomic_write(&path, &cert_pem)?;
    println!("Saved certificate for {host} to {}", path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => run_serve().await,
        Commands::Connect => run_connect().await,
        Commands::ShareCert { otp_timeout } => run_share_cert(otp_timeout).await,
        Commands::Pair { otp, host, port } => run_pair(otp, host, port).await,
    }
}
