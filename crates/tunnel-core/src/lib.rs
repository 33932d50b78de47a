//! The multiplexing core: a channel is an in-process byte pipe with two
//! independently-driven ends; a tunnel owns a transport, a channel
//! registry, and the single monitor loop that fans frames between them.
//!
//! The monitor loop owns the transport's read half exclusively and
//! processes frames strictly in wire order. Each open channel gets its
//! own "pump" task that owns that channel's tunnel-side read half and
//! forwards bytes into `Data` frames; writes to the transport are
//! serialized by one mutex shared between the monitor loop and every
//! pump task. This is the "per-goroutine blocking read" readiness model
//! rather than a single `select()` over every channel plus the
//! transport — both are valid substitutes for the original's
//! `select.select()` loop.

mod channel;
mod error;
mod proxy;
mod registry;
mod reconnect;
mod tunnel;

pub use channel::{Channel, TunnelEndpoint};
pub use error::TunnelError;
pub use proxy::proxy_channel;
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectManager};
pub use registry::TunnelStats;
pub use tunnel::{BoxedTransport, CloseChannelCallback, OpenChannelCallback, Tunnel, TransportStream};

pub use tunnel_proto::ChannelId;
