use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use tunnel_proto::{ChannelId, Frame, FrameType};

use crate::channel::Channel;
use crate::error::TunnelError;
use crate::registry::{ClosedEntry, OpenEntry, Registry, TunnelStats};

/// Largest chunk the per-channel pump reads from a channel's tunnel
/// endpoint before wrapping it in a `Data` frame (spec: "Maximum Data
/// body written by the monitor is 4096 bytes").
const MAX_DATA_CHUNK: usize = 4096;

/// Whether `handle` is the task currently executing this code. `abort()`
/// only takes effect at the target task's next suspend point, so a task
/// can never reliably abort itself mid-function; callers use this to
/// fall back to letting the task return on its own instead.
fn is_current_task(handle: &JoinHandle<()>) -> bool {
    tokio::task::try_id().is_some_and(|id| id == handle.id())
}

/// A boxed, transport-agnostic duplex stream: a plain `TcpStream` or a
/// `tokio_rustls::TlsStream<TcpStream>` behind one trait object, so
/// `Tunnel` never needs to know which one it was handed.
pub trait TransportStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> TransportStream for T {}

pub type BoxedTransport = Box<dyn TransportStream>;

/// Invoked with the newly-opened channel whenever `open_channel` creates
/// one, including remotely-initiated opens observed by the monitor loop.
/// Implemented as a plain function value rather than a trait object the
/// Tunnel owns a handle back to, so a Relay's worker can call back into
/// the Tunnel (e.g. `close_channel` on failure) without a reference
/// cycle between the two.
pub type OpenChannelCallback = Arc<dyn Fn(Channel) + Send + Sync>;

/// Invoked with a channel just after it closes.
pub type CloseChannelCallback = Arc<dyn Fn(Channel) + Send + Sync>;

struct TunnelInner {
    writer: Mutex<WriteHalf<BoxedTransport>>,
    registry: Mutex<Registry>,
    open_channel_callback: Option<OpenChannelCallback>,
    close_channel_callback: Option<CloseChannelCallback>,
    monitor_handle: Mutex<Option<JoinHandle<()>>>,
}

/// Owns the transport and multiplexes every open channel over it. See
/// the module documentation for the monitor loop / pump task split.
#[derive(Clone)]
pub struct Tunnel(Arc<TunnelInner>);

impl Tunnel {
    /// Takes ownership of `transport`, splits it, and immediately spawns
    /// the monitor loop. The returned handle is live from this call
    /// onward; there is no separate "start" step.
    pub fn new(
        transport: BoxedTransport,
        open_channel_callback: Option<OpenChannelCallback>,
        close_channel_callback: Option<CloseChannelCallback>,
    ) -> Tunnel {
        let (reader, writer) = tokio::io::split(transport);
        let inner = Arc::new(TunnelInner {
            writer: Mutex::new(writer),
            registry: Mutex::new(Registry::default()),
            open_channel_callback,
            close_channel_callback,
            monitor_handle: Mutex::new(None),
        });
        let tunnel = Tunnel(inner);

        let monitor_tunnel = tunnel.clone();
        let handle = tokio::spawn(async move { monitor_tunnel.run_monitor(reader).await });
        *tunnel
            .0
            .monitor_handle
            .try_lock()
            .expect("monitor_handle uncontended at construction") = Some(handle);

        tunnel
    }

    /// Registers a new channel, or returns the existing one for `id`
    /// when it is already open and `strict` is false.
    pub async fn open_channel(
        &self,
        id: ChannelId,
        open_remote: bool,
        strict: bool,
    ) -> Result<Channel, TunnelError> {
        let mut registry = self.0.registry.lock().await;
        if let Some(entry) = registry.get_open(id) {
            if strict {
                return Err(TunnelError::DuplicateChannel(id));
            }
            debug!(channel = id, "open_channel: id already open, returning existing channel");
            return Ok(entry.channel.clone());
        }

        let (channel, endpoint) = Channel::new_pair(id);
        let tunnel_writer = Arc::new(Mutex::new(endpoint.writer));
        let pump_handle = self.spawn_pump(id, endpoint.reader);
        registry.insert_open(
            id,
            OpenEntry {
                channel: channel.clone(),
                tunnel_writer,
                pump_handle,
            },
        );
        drop(registry);

        if open_remote {
            self.write_frame(Frame::open_channel(id)).await?;
        }
        if let Some(callback) = &self.0.open_channel_callback {
            callback(channel.clone());
        }
        debug!(channel = id, "channel opened");
        Ok(channel)
    }

    /// Idempotent with respect to ids that are already closed. See spec
    /// §4.3: a duplicate close optionally re-emits a remote notification
    /// but never fails once the id has been filed as closed.
    pub async fn close_channel(
        &self,
        id: ChannelId,
        close_remote: bool,
        strict: bool,
    ) -> Result<(), TunnelError> {
        let mut registry = self.0.registry.lock().await;
        let already_closed = registry.is_closed(id);
        let entry = registry.remove_open(id);

        let entry = match entry {
            Some(entry) => entry,
            None => {
                drop(registry);
                if already_closed {
                    if close_remote {
                        self.write_frame(Frame::close_channel(id)).await?;
                    }
                    return Ok(());
                }
                if strict {
                    return Err(TunnelError::UnknownChannel(id));
                }
                debug!(channel = id, "close_channel: unknown id, ignoring");
                return Ok(());
            }
        };

        let tx_bytes = entry.channel.tx_bytes();
        let rx_bytes = entry.channel.rx_bytes();
        registry.file_closed(id, ClosedEntry { tx_bytes, rx_bytes });
        drop(registry);

        // The pump task calls close_channel on its own id (EOF/read error)
        // and close_tunnel calls close_channel on every id including the
        // caller's own when it's itself a pump reacting to a fatal write
        // failure. Aborting a handle only takes effect at that task's next
        // suspend point, so self-aborting here would race the rest of this
        // very function and could skip the remote notification below.
        // Let the pump task return on its own `break` instead.
        if is_current_task(&entry.pump_handle) {
            trace!(channel = id, "close_channel: called from its own pump task, not aborting");
        } else {
            entry.pump_handle.abort();
        }
        {
            let mut tunnel_writer = entry.tunnel_writer.lock().await;
            let _ = tunnel_writer.shutdown().await;
        }
        entry.channel.close().await;

        if close_remote {
            self.write_frame(Frame::close_channel(id)).await?;
        }
        if let Some(callback) = &self.0.close_channel_callback {
            callback(entry.channel.clone());
        }
        debug!(channel = id, tx_bytes, rx_bytes, "channel closed");
        Ok(())
    }

    /// Closes every open channel (notifying the remote) and then the
    /// transport itself. Never attempts to reconnect; that policy lives
    /// one layer up, in the Relay's reconnection loop.
    pub async fn close_tunnel(&self) {
        let ids = self.0.registry.lock().await.open_ids();
        for id in ids {
            if let Err(err) = self.close_channel(id, true, false).await {
                warn!(channel = id, error = %err, "error closing channel during tunnel teardown");
            }
        }
        let mut writer = self.0.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    /// Blocks until the monitor loop exits (transport closed or fatal
    /// error). Only the first caller observes the join; later callers
    /// return immediately.
    pub async fn wait(&self) {
        let handle = self.0.monitor_handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub async fn stats(&self) -> TunnelStats {
        self.0.registry.lock().await.stats()
    }

    async fn write_frame(&self, frame: Frame) -> Result<(), TunnelError> {
        let encoded = frame.encode();
        let mut writer = self.0.writer.lock().await;
        writer.write_all(&encoded).await?;
        Ok(())
    }

    fn spawn_pump(
        &self,
        id: ChannelId,
        mut reader: ReadHalf<tokio::io::DuplexStream>,
    ) -> JoinHandle<()> {
        let tunnel = self.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATA_CHUNK];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => {
                        trace!(channel = id, "pump: application side closed, closing channel");
                        let _ = tunnel.close_channel(id, true, false).await;
                        break;
                    }
                    Ok(n) => {
                        let frame = Frame::data(id, Bytes::copy_from_slice(&buf[..n]));
                        if let Err(err) = tunnel.write_frame(frame).await {
                            error!(channel = id, error = %err, "fatal: failed writing to transport");
                            tunnel.close_tunnel().await;
                            break;
                        }
                    }
                    Err(err) => {
                        debug!(channel = id, error = %err, "pump: read error, closing channel");
                        let _ = tunnel.close_channel(id, true, false).await;
                        break;
                    }
                }
            }
        })
    }

    async fn run_monitor(self, mut reader: ReadHalf<BoxedTransport>) {
        if let Err(err) = self.monitor_loop(&mut reader).await {
            error!(error = %err, "fatal: tunnel transport failed, tearing down");
        }
        self.close_tunnel().await;
        debug!("tunnel monitor exiting");
    }

    async fn monitor_loop(&self, reader: &mut ReadHalf<BoxedTransport>) -> Result<(), TunnelError> {
        loop {
            let mut header = [0u8; Frame::HEADER_SIZE];
            match reader.read_exact(&mut header).await {
                Ok(_) => {}
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    debug!("transport closed");
                    return Ok(());
                }
                Err(err) => return Err(TunnelError::Io(err)),
            }

            let (frame_type, channel_id, length) = Frame::decode_header(&header)?;

            let mut body = BytesMut::zeroed(length as usize);
            if reader.read_exact(&mut body).await.is_err() {
                return Err(TunnelError::TruncatedTransport);
            }
            let frame = Frame::new(frame_type, channel_id, body.freeze());
            self.dispatch(frame).await?;
        }
    }

    async fn dispatch(&self, frame: Frame) -> Result<(), TunnelError> {
        match frame.frame_type {
            FrameType::Control => {
                warn!(channel = frame.channel_id, "received reserved Control frame");
            }
            FrameType::OpenChannel => {
                if let Err(err) = self.open_channel(frame.channel_id, false, false).await {
                    warn!(channel = frame.channel_id, error = %err, "failed to open remotely-requested channel");
                }
            }
            FrameType::CloseChannel => {
                if let Err(err) = self.close_channel(frame.channel_id, false, false).await {
                    warn!(channel = frame.channel_id, error = %err, "failed to close remotely-requested channel");
                }
            }
            FrameType::Data => {
                let tunnel_writer = {
                    let registry = self.0.registry.lock().await;
                    registry.get_open(frame.channel_id).map(|e| e.tunnel_writer.clone())
                };
                match tunnel_writer {
                    None => {
                        debug!(channel = frame.channel_id, "data for unknown channel, notifying remote close");
                        self.write_frame(Frame::close_channel(frame.channel_id)).await?;
                    }
                    Some(tunnel_writer) => {
                        let write_result = {
                            let mut writer = tunnel_writer.lock().await;
                            writer.write_all(&frame.body).await
                        };
                        if write_result.is_err() {
                            debug!(channel = frame.channel_id, "application side gone, closing channel");
                            self.close_channel(frame.channel_id, true, false).await?;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
