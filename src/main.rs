#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # edgetun
//!
//! Persistent WebSocket reverse-tunnel client for edge devices behind CGNAT
//! or firewalls. The device dials *out* to the backend, so no inbound
//! reachability is needed; the backend then sends framed requests over the
//! socket and edgetun forwards them to a local HTTP relay, streaming the
//! responses back on the same connection.
//!
//! ## Subcommands
//!
//! - `edgetun serve` (default) — probe the backend, then keep a tunnel
//!   session alive until SIGINT/SIGTERM
//! - `edgetun test` — run the bootstrap probe once and exit
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, tracing, shutdown
//! config.rs        — TOML + env-var configuration
//! error.rs         — typed failure taxonomy
//! state.rs         — connection stats and lifecycle event ring
//! tunnel/
//!   client.rs      — bootstrap probe, dial loop, retry ceiling/floor
//!   session.rs     — request pump, response pump, pinger
//!   relay.rs       — cached TCP connection to the local relay
//!   dialer.rs      — TCP/TLS/WS handshake, proxy, source-IP binding
//!   frame.rs       — 4-hex-digit id framing
//! ```

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use url::Url;

use edgetun::config::Config;
use edgetun::error::TunnelError;
use edgetun::tunnel::TunnelClient;

/// Persistent WebSocket reverse tunnel client for edge devices.
#[derive(Parser)]
#[command(name = "edgetun", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tunnel client (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Probe the backend once and report whether a tunnel could be opened.
    Test {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Test { config }) => run_test(config.as_deref()).await,
        Some(Commands::Serve { config }) => run_serve(config.as_deref()).await,
        None => run_serve(None).await,
    }
}

async fn run_serve(config_path: Option<&str>) {
    let config = Config::load(config_path);
    init_tracing(&config);

    info!("edgetun v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Tunnel server: {}", config.tunnel.server);
    info!("Local relay: {}", config.tunnel.local_relay);

    let client = match bootstrap(&config).await {
        Ok(client) => client,
        Err(e) => {
            error!("Connection test failed: {e}");
            std::process::exit(1);
        }
    };

    let session = client.start().expect("session loop requires a tested connection");

    // Graceful shutdown
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }

    client.stop();
    session.abort();
    info!("Goodbye");
}

async fn run_test(config_path: Option<&str>) {
    let config = Config::load(config_path);
    init_tracing(&config);

    match bootstrap(&config).await {
        Ok(client) => {
            info!(
                "Connection test succeeded, tunnel endpoint: {}",
                client.dest_url().unwrap_or_default()
            );
        }
        Err(e) => {
            error!("Connection test failed: {e}");
            std::process::exit(1);
        }
    }
}

fn init_tracing(config: &Config) {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
}

/// Build the client from config and run the bootstrap probe.
async fn bootstrap(config: &Config) -> Result<TunnelClient, TunnelError> {
    let proxy = config
        .tunnel
        .proxy
        .as_ref()
        .map(|p| {
            Url::parse(p).map_err(|e| TunnelError::InvalidUrl {
                url: p.clone(),
                source: e,
            })
        })
        .transpose()?;
    let local_source_ip = config
        .tunnel
        .local_source_ip
        .as_ref()
        .map(|ip| {
            ip.parse::<IpAddr>()
                .map_err(|_| TunnelError::BadSourceIp(ip.clone()))
        })
        .transpose()?;

    let mut client = TunnelClient::new(&config.tunnel.server, &config.tunnel.local_relay)
        .with_ping_timeout(Duration::from_secs(config.tunnel.ping_timeout_secs));
    client
        .test_connection(Some(default_tls_config()), proxy, local_source_ip)
        .await?;
    Ok(client)
}

/// Default TLS client configuration: webpki roots, no client auth.
///
/// The tunnel core treats this as an opaque input; swap in a different
/// `rustls::ClientConfig` here for custom roots or client certificates.
fn default_tls_config() -> Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder_with_provider(
        rustls::crypto::ring::default_provider().into(),
    )
    .with_safe_default_protocol_versions()
    .expect("TLS protocol versions")
    .with_root_certificates(roots)
    .with_no_client_auth();
    Arc::new(config)
}
