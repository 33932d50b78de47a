//! The Server role: accepts exactly one Relay connection, accepts N
//! SOCKS5 clients, and streams each client's raw bytes through a
//! channel to the Relay. The Server never speaks SOCKS5 itself.

mod error;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use rustls::ServerConfig as RustlsServerConfig;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use tunnel_core::{proxy_channel, BoxedTransport, Tunnel};

pub use error::ServerError;

/// Where the Server listens, and the TLS config to terminate on the
/// tunnel connection, if any.
pub struct ServerConfig {
    pub tunnel_addr: SocketAddr,
    pub socks_addr: SocketAddr,
    pub tls: Option<RustlsServerConfig>,
}

/// Waits for the Relay, then proxies SOCKS5 clients over the tunnel
/// until the tunnel tears down. Returns once the tunnel is gone.
pub async fn run(config: ServerConfig) -> Result<(), ServerError> {
    let tunnel_listener =
        TcpListener::bind(config.tunnel_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.tunnel_addr,
                source,
            })?;
    info!(addr = %config.tunnel_addr, "waiting for relay connection");

    let (tunnel_stream, relay_addr) = tunnel_listener.accept().await?;
    info!(relay = %relay_addr, "relay connected");

    let transport: BoxedTransport = match config.tls {
        Some(tls_config) => {
            let acceptor = TlsAcceptor::from(Arc::new(tls_config));
            let tls_stream = acceptor
                .accept(tunnel_stream)
                .await
                .map_err(ServerError::TlsHandshake)?;
            Box::new(tls_stream)
        }
        None => {
            warn!("no TLS configured for the tunnel connection, proceeding in plaintext");
            Box::new(tunnel_stream)
        }
    };

    let tunnel = Tunnel::new(transport, None, None);

    let socks_listener =
        TcpListener::bind(config.socks_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.socks_addr,
                source,
            })?;
    info!(addr = %config.socks_addr, "SOCKS5 proxy listening");

    let next_id = Arc::new(AtomicU16::new(0));
    accept_loop(tunnel, socks_listener, next_id).await;
    Ok(())
}

/// Accepts SOCKS5 clients and spawns a worker per connection until the
/// tunnel tears down. Split out of `run` so it can be driven against a
/// stub tunnel in tests without a real relay connection.
async fn accept_loop(tunnel: Tunnel, socks_listener: TcpListener, next_id: Arc<AtomicU16>) {
    // `Tunnel::wait()` takes the monitor's JoinHandle out of its Mutex on
    // first poll, so reconstructing it fresh every iteration is not
    // cancel-safe: a `select!` round that drops it after the take but
    // before the join leaves every later `wait()` call seeing `None` and
    // returning immediately, firing this branch spuriously on the very
    // next iteration. Pin one instance and reuse it across iterations,
    // same as the CLI pins its signal futures outside their loops.
    let tunnel_closed = tunnel.wait();
    tokio::pin!(tunnel_closed);

    loop {
        tokio::select! {
            accepted = socks_listener.accept() => {
                match accepted {
                    Ok((socket, client_addr)) => {
                        let id = next_id.fetch_add(1, Ordering::SeqCst);
                        debug!(client = %client_addr, channel = id, "accepted SOCKS5 client");
                        spawn_client(tunnel.clone(), id, socket);
                    }
                    Err(err) => {
                        error!(error = %err, "failed to accept SOCKS5 client");
                    }
                }
            }
            _ = &mut tunnel_closed => {
                info!("tunnel closed, stopping SOCKS5 accept loop");
                break;
            }
        }
    }
}

fn spawn_client(tunnel: Tunnel, id: u16, socket: tokio::net::TcpStream) {
    tokio::spawn(async move {
        match tunnel.open_channel(id, true, true).await {
            Ok(channel) => proxy_channel(tunnel, id, channel, socket).await,
            Err(err) => warn!(channel = id, error = %err, "failed to open channel for SOCKS5 client"),
        }
    });
}
