use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{split, AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use tunnel_proto::ChannelId;

use crate::error::TunnelError;

/// Size of the in-process pipe backing each channel. Large enough to
/// absorb a handful of 4096-byte frame bodies without blocking the
/// monitor loop on slow application-side consumers.
const PIPE_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Default)]
struct Counters {
    tx_bytes: AtomicU64,
    rx_bytes: AtomicU64,
}

/// The tunnel-facing half of a channel's byte pipe. Owned exclusively by
/// the monitor loop (the writer, for inbound `Data` frames) and the
/// per-channel pump task (the reader, for outbound `Data` frames) inside
/// `Tunnel`; exposed publicly so test harnesses (and anything driving a
/// channel's "other side" by hand) can build a `Channel` pair without a
/// running `Tunnel`.
pub struct TunnelEndpoint {
    pub reader: ReadHalf<DuplexStream>,
    pub writer: WriteHalf<DuplexStream>,
}

struct ChannelInner {
    id: ChannelId,
    reader: Mutex<ReadHalf<DuplexStream>>,
    writer: Mutex<WriteHalf<DuplexStream>>,
    counters: Counters,
}

/// The application-facing half of a channel: a cheaply-cloneable handle
/// used by a SOCKS5 negotiator or a proxy worker. `send`/`recv` may be
/// driven from separate tasks concurrently without contending on each
/// other, since the read and write halves carry independent locks.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    pub fn new_pair(id: ChannelId) -> (Channel, TunnelEndpoint) {
        let (app_half, tunnel_half) = tokio::io::duplex(PIPE_BUFFER_SIZE);
        let (app_reader, app_writer) = split(app_half);
        let (tunnel_reader, tunnel_writer) = split(tunnel_half);

        let channel = Channel {
            inner: Arc::new(ChannelInner {
                id,
                reader: Mutex::new(app_reader),
                writer: Mutex::new(app_writer),
                counters: Counters::default(),
            }),
        };
        let endpoint = TunnelEndpoint {
            reader: tunnel_reader,
            writer: tunnel_writer,
        };
        (channel, endpoint)
    }

    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    /// Writes `data` to the application endpoint. Fails with
    /// `BrokenStream` if the tunnel side has gone away.
    pub async fn send(&self, data: &[u8]) -> Result<(), TunnelError> {
        let mut writer = self.inner.writer.lock().await;
        writer
            .write_all(data)
            .await
            .map_err(|_| TunnelError::BrokenStream(self.inner.id))?;
        self.inner
            .counters
            .tx_bytes
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Reads up to `max_len` bytes. A clean close of the tunnel side is
    /// reported as `Ok(Bytes::new())`, not an error.
    pub async fn recv(&self, max_len: usize) -> Result<Bytes, TunnelError> {
        let mut buf = BytesMut::zeroed(max_len);
        let n = {
            let mut reader = self.inner.reader.lock().await;
            reader
                .read(&mut buf)
                .await
                .map_err(|_| TunnelError::BrokenStream(self.inner.id))?
        };
        buf.truncate(n);
        self.inner
            .counters
            .rx_bytes
            .fetch_add(n as u64, Ordering::Relaxed);
        Ok(buf.freeze())
    }

    /// Shuts down the application-side write half, surfacing EOF to
    /// whatever is reading the tunnel side.
    pub async fn close(&self) {
        let mut writer = self.inner.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    pub fn tx_bytes(&self) -> u64 {
        self.inner.counters.tx_bytes.load(Ordering::Relaxed)
    }

    pub fn rx_bytes(&self) -> u64 {
        self.inner.counters.rx_bytes.load(Ordering::Relaxed)
    }
}
