use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use tunnel_proto::ChannelId;

use crate::channel::Channel;
use crate::tunnel::Tunnel;

const SOCKET_READ_CHUNK: usize = 4096;
const CHANNEL_READ_CHUNK: usize = 4096;

/// Two-way copy between a real socket and a channel's application
/// endpoint: every C6 role (Server's SOCKS client ↔ channel, Relay's
/// dialed target ↔ channel) is one call to this function. An error or
/// EOF on either side closes both the channel (remotely) and the
/// socket; a remote-initiated close surfaces here as `channel.recv`
/// returning EOF, so there is no separate liveness poll against the
/// tunnel's open set.
pub async fn proxy_channel<S>(tunnel: Tunnel, id: ChannelId, channel: Channel, socket: S)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut socket_reader, mut socket_writer) = split(socket);
    let mut socket_buf = [0u8; SOCKET_READ_CHUNK];

    loop {
        tokio::select! {
            result = socket_reader.read(&mut socket_buf) => {
                match result {
                    Ok(0) | Err(_) => {
                        trace!(channel = id, "proxy: socket closed, closing channel");
                        let _ = tunnel.close_channel(id, true, false).await;
                        break;
                    }
                    Ok(n) => {
                        if channel.send(&socket_buf[..n]).await.is_err() {
                            debug!(channel = id, "proxy: channel broken, closing socket");
                            break;
                        }
                    }
                }
            }
            result = channel.recv(CHANNEL_READ_CHUNK) => {
                match result {
                    Ok(data) if data.is_empty() => {
                        trace!(channel = id, "proxy: channel closed, closing socket");
                        break;
                    }
                    Ok(data) => {
                        if socket_writer.write_all(&data).await.is_err() {
                            debug!(channel = id, "proxy: socket broken, closing channel");
                            let _ = tunnel.close_channel(id, true, false).await;
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        }
    }
}
