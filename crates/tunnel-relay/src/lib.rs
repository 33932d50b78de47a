//! The Relay role: dials the Server, optionally TLS-wraps the
//! transport, and for every channel the Server opens, runs a SOCKS5
//! negotiation on the channel's application endpoint followed by a
//! proxy worker to the dialed target. These two steps are merged into
//! one per-channel worker spawned from the tunnel's open-channel
//! callback.

mod error;

use std::sync::{Arc, OnceLock};

use rustls::pki_types::ServerName;
use rustls::ClientConfig as RustlsClientConfig;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{info, warn};

use tunnel_core::{proxy_channel, BoxedTransport, Channel, ChannelId, OpenChannelCallback, Tunnel};

pub use error::RelayError;

/// TLS parameters for the relay's outbound connection to the server.
pub struct RelayTlsConfig {
    pub client_config: RustlsClientConfig,
    pub server_name: String,
}

/// Where to dial, and how to protect the connection once dialed.
pub struct RelayConfig {
    pub connect_addr: String,
    pub tls: Option<RelayTlsConfig>,
}

/// Dials the server once, runs the tunnel to completion, and returns.
/// The caller is responsible for reconnecting on error: this function
/// makes exactly one connection attempt per call.
pub async fn run_once(config: RelayConfig) -> Result<(), RelayError> {
    let tcp_stream =
        TcpStream::connect(&config.connect_addr)
            .await
            .map_err(|source| RelayError::Connect {
                addr: config.connect_addr.clone(),
                source,
            })?;
    info!(addr = %config.connect_addr, "connected to server");

    let transport: BoxedTransport = match config.tls {
        Some(tls) => {
            let server_name = ServerName::try_from(tls.server_name.clone())
                .map_err(|err| RelayError::TlsHandshake {
                    addr: config.connect_addr.clone(),
                    source: std::io::Error::new(std::io::ErrorKind::InvalidInput, err),
                })?;
            let connector = TlsConnector::from(Arc::new(tls.client_config));
            let tls_stream = connector
                .connect(server_name, tcp_stream)
                .await
                .map_err(|source| RelayError::TlsHandshake {
                    addr: config.connect_addr.clone(),
                    source,
                })?;
            Box::new(tls_stream)
        }
        None => {
            warn!("no TLS configured for the server connection, proceeding in plaintext");
            Box::new(tcp_stream)
        }
    };

    let tunnel_cell: Arc<OnceLock<Tunnel>> = Arc::new(OnceLock::new());
    let callback = make_open_channel_callback(tunnel_cell.clone());

    let tunnel = Tunnel::new(transport, Some(callback), None);
    tunnel_cell
        .set(tunnel.clone())
        .unwrap_or_else(|_| unreachable!("tunnel cell set exactly once, before any channel can open"));

    tunnel.wait().await;
    info!("tunnel to server closed");
    Ok(())
}

/// Builds the callback the tunnel invokes every time the server opens a
/// channel. The callback itself must return immediately, so it just
/// spawns the per-channel worker.
fn make_open_channel_callback(tunnel_cell: Arc<OnceLock<Tunnel>>) -> OpenChannelCallback {
    Arc::new(move |channel: Channel| {
        let tunnel_cell = tunnel_cell.clone();
        tokio::spawn(async move {
            let tunnel = tunnel_cell
                .get()
                .expect("tunnel initialized before any channel opens")
                .clone();
            handle_channel(tunnel, channel).await;
        });
    })
}

/// Negotiates a SOCKS5 CONNECT on `channel`'s application endpoint,
/// then proxies to the dialed target until either side closes.
async fn handle_channel(tunnel: Tunnel, channel: Channel) {
    let id: ChannelId = channel.id();
    match tunnel_socks5::negotiate(&channel).await {
        Ok(target) => proxy_channel(tunnel, id, channel, target).await,
        Err(err) => {
            warn!(channel = id, error = %err, "SOCKS5 negotiation failed, closing channel");
            let _ = tunnel.close_channel(id, true, false).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn stub_tunnel() -> Tunnel {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let tunnel = Tunnel::new(Box::new(a), None, None);
        let _peer = Tunnel::new(Box::new(b), None, None);
        tunnel
    }

    #[tokio::test]
    async fn successful_negotiation_proxies_bytes_to_the_dialed_target() {
        let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target_listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut target_socket, _) = target_listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            target_socket.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
        });

        let (channel, mut endpoint) = Channel::new_pair(1);
        let tunnel = stub_tunnel();

        let worker = tokio::spawn(handle_channel(tunnel, channel));

        // SOCKS5 greeting + CONNECT request for target_addr, driven from
        // the far side of the channel as the server would relay it.
        endpoint.writer.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut greeting_reply = [0u8; 2];
        endpoint.reader.read_exact(&mut greeting_reply).await.unwrap();
        assert_eq!(greeting_reply, [0x05, 0x00]);

        let target_ip = match target_addr.ip() {
            std::net::IpAddr::V4(v4) => v4,
            std::net::IpAddr::V6(_) => unreachable!("bound to 127.0.0.1"),
        };
        let mut request = vec![0x05, 0x01, 0x00, 0x01];
        request.extend_from_slice(&target_ip.octets());
        request.extend_from_slice(&target_addr.port().to_be_bytes());
        endpoint.writer.write_all(&request).await.unwrap();

        let mut connect_reply = [0u8; 10];
        endpoint.reader.read_exact(&mut connect_reply).await.unwrap();
        assert_eq!(connect_reply[0..2], [0x05, 0x00]);

        endpoint.writer.write_all(b"hello").await.unwrap();
        worker.abort();
    }

    #[tokio::test]
    async fn failed_negotiation_drops_the_channel() {
        let (channel, mut endpoint) = Channel::new_pair(7);
        let tunnel = stub_tunnel();

        let worker = tokio::spawn(handle_channel(tunnel, channel));

        // greeting is accepted unconditionally, then a malformed CONNECT
        // request (bad version byte) fails negotiation.
        endpoint.writer.write_all(b"x").await.unwrap();
        let mut greeting_reply = [0u8; 2];
        endpoint.reader.read_exact(&mut greeting_reply).await.unwrap();

        endpoint
            .writer
            .write_all(&[0x04, 0x01, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
        let mut request_reply = [0u8; 4];
        endpoint.reader.read_exact(&mut request_reply).await.unwrap();
        assert_eq!(request_reply, [0x05, 0x01, 0x00, 0x00]);

        worker.await.unwrap();

        // the worker's `Channel` handle was its only owner; once the
        // worker returns, the app-side pipe drops and the far end sees EOF.
        let mut buf = Vec::new();
        let _ = endpoint.reader.read_to_end(&mut buf).await;
    }
}
