//! Tunnel CLI - reverse SOCKS5 proxy over a single multiplexed transport.
//!
//! `server` waits for one relay connection and proxies SOCKS5 clients
//! through it; `relay` dials a server and answers every channel it opens
//! with a SOCKS5 CONNECT negotiation against the relay's own network.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tunnel_core::{ReconnectConfig, ReconnectManager};
use tunnel_relay::{RelayConfig, RelayTlsConfig};
use tunnel_server::ServerConfig;

#[derive(Parser, Debug)]
#[command(name = "tunnel-proxy")]
#[command(about = "Reverse SOCKS5 proxy over a single multiplexed transport")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Wait for a relay connection, then proxy SOCKS5 clients through it
    Server {
        /// Address to listen on for the relay connection
        #[arg(long, env = "TUNNEL_SERVER_TUNNEL_ADDR")]
        tunnel_addr: SocketAddr,

        /// Address to listen on for SOCKS5 clients
        #[arg(long, env = "TUNNEL_SERVER_SOCKS_ADDR")]
        socks_addr: SocketAddr,

        /// PEM certificate for the tunnel connection (requires --key)
        #[arg(long, env = "TUNNEL_SERVER_CERT", requires = "key")]
        cert: Option<PathBuf>,

        /// PEM private key for the tunnel connection (requires --cert)
        #[arg(long, env = "TUNNEL_SERVER_KEY", requires = "cert")]
        key: Option<PathBuf>,
    },

    /// Dial a server and answer its channels with SOCKS5 CONNECT
    Relay {
        /// Server address to dial (host:port)
        #[arg(long, env = "TUNNEL_RELAY_CONNECT")]
        connect: String,

        /// Skip certificate verification (insecure, for local testing)
        #[arg(long)]
        insecure: bool,

        /// Disable TLS entirely and dial in plaintext
        #[arg(long)]
        no_tls: bool,

        /// Maximum reconnection attempts (0 = infinite)
        #[arg(long, default_value = "0")]
        max_reconnect_attempts: usize,

        /// Initial reconnection delay in seconds
        #[arg(long, default_value = "1")]
        reconnect_delay: u64,

        /// Maximum reconnection delay in seconds
        #[arg(long, default_value = "60")]
        max_reconnect_delay: u64,
    },
}

fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

async fn run_server(
    tunnel_addr: SocketAddr,
    socks_addr: SocketAddr,
    cert: Option<PathBuf>,
    key: Option<PathBuf>,
) -> Result<()> {
    let tls = match (cert, key) {
        (Some(cert), Some(key)) => Some(
            tunnel_tls::load_server_config(&cert, &key).context("failed to load server TLS certificate/key")?,
        ),
        _ => {
            warn!("no certificate/key given, proceeding without TLS");
            None
        }
    };

    tunnel_server::run(ServerConfig {
        tunnel_addr,
        socks_addr,
        tls,
    })
    .await
    .context("server exited with an error")
}

/// Dials the server with exponential backoff between failed attempts,
/// matching the reconnect loop the teacher's CLI runs for its agent.
async fn run_relay_with_reconnect(
    connect: String,
    insecure: bool,
    no_tls: bool,
    max_attempts: usize,
    initial_delay: Duration,
    max_delay: Duration,
) -> Result<()> {
    let reconnect_config = ReconnectConfig {
        initial_backoff: initial_delay,
        max_backoff: max_delay,
        multiplier: 2.0,
        max_attempts: if max_attempts == 0 { None } else { Some(max_attempts) },
    };
    let mut reconnect = ReconnectManager::new(reconnect_config);

    loop {
        let tls = if no_tls {
            None
        } else {
            let server_name = connect
                .rsplit_once(':')
                .map(|(host, _)| host.to_string())
                .unwrap_or_else(|| connect.clone());
            Some(RelayTlsConfig {
                client_config: tunnel_tls::build_client_config(insecure),
                server_name,
            })
        };

        let config = RelayConfig {
            connect_addr: connect.clone(),
            tls,
        };

        match tunnel_relay::run_once(config).await {
            Ok(()) => {
                info!("relay connection ended normally");
                return Ok(());
            }
            Err(err) => {
                error!(error = %err, "relay connection failed");
                if reconnect.wait().await.is_err() {
                    anyhow::bail!("giving up after exhausting reconnection attempts: {err}");
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Server {
            tunnel_addr,
            socks_addr,
            cert,
            key,
        } => {
            info!(tunnel_addr = %tunnel_addr, socks_addr = %socks_addr, "starting server");
            let server_task = tokio::spawn(run_server(tunnel_addr, socks_addr, cert, key));

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("received Ctrl+C, shutting down");
                    Ok(())
                }
                result = server_task => result.context("server task panicked")?,
            }
        }
        Commands::Relay {
            connect,
            insecure,
            no_tls,
            max_reconnect_attempts,
            reconnect_delay,
            max_reconnect_delay,
        } => {
            info!(connect = %connect, "starting relay");
            if insecure {
                warn!("certificate verification disabled (insecure mode)");
            }

            let relay_task = tokio::spawn(run_relay_with_reconnect(
                connect,
                insecure,
                no_tls,
                max_reconnect_attempts,
                Duration::from_secs(reconnect_delay),
                Duration::from_secs(max_reconnect_delay),
            ));

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("received Ctrl+C, shutting down");
                    Ok(())
                }
                result = relay_task => result.context("relay task panicked")?,
            }
        }
    }
}
