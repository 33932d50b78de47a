use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Channel identifier, unique among currently-open channels on a tunnel.
pub type ChannelId = u16;

/// Frame type tag (spec §3/§6). `Control` is reserved: receiving one is
/// valid on the wire but not yet meaningful, so dispatch just warns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Control = 0,
    Data = 1,
    OpenChannel = 2,
    CloseChannel = 3,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Control),
            1 => Ok(FrameType::Data),
            2 => Ok(FrameType::OpenChannel),
            3 => Ok(FrameType::CloseChannel),
            other => Err(FrameError::UnknownType(other)),
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: unknown type byte 0x{0:02x}")]
    UnknownType(u8),

    #[error("malformed frame: incomplete header ({0} of {} bytes)", Frame::HEADER_SIZE)]
    ShortHeader(usize),

    #[error("malformed frame: length prefix {length} disagrees with body length {body_len}")]
    LengthMismatch { length: u32, body_len: usize },
}

/// One unit on the tunnel transport: a 7-byte header plus `length` body
/// bytes. `OpenChannel`/`CloseChannel` always carry an empty body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub channel_id: ChannelId,
    pub body: Bytes,
}

impl Frame {
    /// type (1) + channel_id (2) + length (4).
    pub const HEADER_SIZE: usize = 7;

    pub fn new(frame_type: FrameType, channel_id: ChannelId, body: Bytes) -> Self {
        Self {
            frame_type,
            channel_id,
            body,
        }
    }

    pub fn data(channel_id: ChannelId, body: Bytes) -> Self {
        Self::new(FrameType::Data, channel_id, body)
    }

    pub fn open_channel(channel_id: ChannelId) -> Self {
        Self::new(FrameType::OpenChannel, channel_id, Bytes::new())
    }

    pub fn close_channel(channel_id: ChannelId) -> Self {
        Self::new(FrameType::CloseChannel, channel_id, Bytes::new())
    }

    /// Serialize header + body. Never fails: the wire length field is a
    /// u32 and callers are expected to keep individual frame bodies well
    /// under 4GiB (the monitor loop only ever emits up to 4096-byte
    /// bodies in practice).
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + self.body.len());
        buf.put_u8(self.frame_type as u8);
        buf.put_u16(self.channel_id);
        buf.put_u32(self.body.len() as u32);
        buf.put_slice(&self.body);
        buf.freeze()
    }

    /// Parse just the header, returning `(type, channel_id, length)`.
    pub fn decode_header(header: &[u8]) -> Result<(FrameType, ChannelId, u32), FrameError> {
        if header.len() < Self::HEADER_SIZE {
            return Err(FrameError::ShortHeader(header.len()));
        }
        let mut cursor = header;
        let frame_type = FrameType::try_from(cursor.get_u8())?;
        let channel_id = cursor.get_u16();
        let length = cursor.get_u32();
        Ok((frame_type, channel_id, length))
    }

    /// Parse a complete frame (header followed by its body) out of an
    /// in-memory buffer. Used by tests and by callers that already have
    /// the whole frame assembled; the monitor loop instead reads the
    /// header and body off the transport directly (see `tunnel-core`).
    pub fn decode(buf: impl Into<Bytes>) -> Result<Self, FrameError> {
        let mut buf = buf.into();
        if buf.len() < Self::HEADER_SIZE {
            return Err(FrameError::ShortHeader(buf.len()));
        }
        let (frame_type, channel_id, length) = Self::decode_header(&buf[..Self::HEADER_SIZE])?;
        buf.advance(Self::HEADER_SIZE);
        if buf.len() != length as usize {
            return Err(FrameError::LengthMismatch {
                length,
                body_len: buf.len(),
            });
        }
        Ok(Self {
            frame_type,
            channel_id,
            body: buf,
        })
    }
}
