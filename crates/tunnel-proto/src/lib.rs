//! Wire framing for the reverse SOCKS5 tunnel.
//!
//! A single transport carries many logical channels. Every unit on the
//! wire is a [`Frame`]: a fixed 7-byte header (type, channel id, body
//! length) followed by exactly `length` body bytes. Frames are never
//! interleaved — callers must serialize writes to the transport
//! themselves (see `tunnel-core`).

mod frame;

pub use frame::{ChannelId, Frame, FrameError, FrameType};
