use thiserror::Error;
use tunnel_proto::{ChannelId, FrameError};

/// Errors surfaced by the channel registry and the tunnel monitor loop.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("channel {0} is already open")]
    DuplicateChannel(ChannelId),

    #[error("channel {0} is not open")]
    UnknownChannel(ChannelId),

    #[error("channel {0}'s stream is broken")]
    BrokenStream(ChannelId),

    /// A frame header announced a body longer than what the transport
    /// actually delivered before closing.
    #[error("transport delivered a truncated frame")]
    TruncatedTransport,

    #[error(transparent)]
    MalformedFrame(#[from] FrameError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
