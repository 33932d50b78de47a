use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{DuplexStream, WriteHalf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use tunnel_proto::ChannelId;

use crate::channel::Channel;

/// One currently-open channel's bookkeeping. `tunnel_writer` is wrapped
/// separately so the monitor loop can clone it out and release the
/// registry lock before awaiting a (possibly backpressured) write.
pub(crate) struct OpenEntry {
    pub channel: Channel,
    pub tunnel_writer: Arc<Mutex<WriteHalf<DuplexStream>>>,
    pub pump_handle: JoinHandle<()>,
}

/// Accounting kept for a channel after it closes, so `TunnelStats` still
/// reflects its final byte counts.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ClosedEntry {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
}

/// Open-channel and closed-channel ids are combined under a single map
/// pair so that the open→closed transition (`close_channel`) happens
/// under one lock acquisition and the two sets can never be observed as
/// overlapping.
#[derive(Default)]
pub(crate) struct Registry {
    open: HashMap<ChannelId, OpenEntry>,
    closed: HashMap<ChannelId, ClosedEntry>,
}

/// Snapshot of tunnel-wide channel accounting, mirroring the original
/// implementation's `Tunnel.__repr__`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TunnelStats {
    pub open_channels: usize,
    pub closed_channels: usize,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
}

impl Registry {
    pub fn is_open(&self, id: ChannelId) -> bool {
        self.open.contains_key(&id)
    }

    pub fn is_closed(&self, id: ChannelId) -> bool {
        self.closed.contains_key(&id)
    }

    pub fn get_open(&self, id: ChannelId) -> Option<&OpenEntry> {
        self.open.get(&id)
    }

    pub fn insert_open(&mut self, id: ChannelId, entry: OpenEntry) {
        self.open.insert(id, entry);
    }

    pub fn remove_open(&mut self, id: ChannelId) -> Option<OpenEntry> {
        self.open.remove(&id)
    }

    pub fn file_closed(&mut self, id: ChannelId, record: ClosedEntry) {
        self.closed.insert(id, record);
    }

    pub fn open_ids(&self) -> Vec<ChannelId> {
        self.open.keys().copied().collect()
    }

    pub fn stats(&self) -> TunnelStats {
        let mut stats = TunnelStats {
            open_channels: self.open.len(),
            closed_channels: self.closed.len(),
            ..Default::default()
        };
        for entry in self.open.values() {
            stats.tx_bytes += entry.channel.tx_bytes();
            stats.rx_bytes += entry.channel.rx_bytes();
        }
        for record in self.closed.values() {
            stats.tx_bytes += record.tx_bytes;
            stats.rx_bytes += record.rx_bytes;
        }
        stats
    }
}
