pub mod codec;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::FrameError;

/// Magic bytes opening every channel frame.
pub const MAGIC: u16 = 0xA71C;

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 13;

/// Maximum payload size: 128 KiB. Large enough for a hello carrying
/// maximum-size evidence.
pub const MAX_PAYLOAD_SIZE: u32 = 128 * 1024;

/// Frame message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Hello = 0x01,
    Data = 0x02,
    Error = 0x03,
    Shutdown = 0x04,
}

impl FrameType {
    pub fn from_u8(v: u8) -> std::result::Result<Self, FrameError> {
        match v {
            0x01 => Ok(Self::Hello),
            0x02 => Ok(Self::Data),
            0x03 => Ok(Self::Error),
            0x04 => Ok(Self::Shutdown),
            other => Err(FrameError::UnknownMessageType(other)),
        }
    }
}

/// Frame flags (bit field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flags(u8);

impl Flags {
    pub const ENCRYPTED: u8 = 0x01;

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_raw(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn raw(self) -> u8 {
        self.0
    }

    pub const fn is_encrypted(self) -> bool {
        self.0 & Self::ENCRYPTED != 0
    }
}

/// A parsed frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub msg_type: FrameType,
    pub flags: Flags,
    pub sequence: u32,
    pub payload_len: u32,
}

impl FrameHeader {
    fn new(msg_type: FrameType, flags: Flags, sequence: u32, payload_len: usize) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            msg_type,
            flags,
            sequence,
            payload_len: payload_len as u32,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(MAGIC);
        buf.put_u8(self.version);
        buf.put_u8(self.msg_type as u8);
        buf.put_u8(self.flags.0);
        buf.put_u32(self.sequence);
        buf.put_u32(self.payload_len);
    }

    /// Decode a header from a buffer. Returns `None` if not enough bytes.
    pub fn decode(buf: &mut BytesMut) -> std::result::Result<Option<Self>, FrameError> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let magic = u16::from_be_bytes([buf[0], buf[1]]);
        if magic != MAGIC {
            return Err(FrameError::InvalidMagic {
                expected: MAGIC,
                actual: magic,
            });
        }

        let version = buf[2];
        if version != PROTOCOL_VERSION {
            return Err(FrameError::UnsupportedVersion(version));
        }

        let msg_type = FrameType::from_u8(buf[3])?;
        let flags = Flags(buf[4]);
        let sequence = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]);
        let payload_len = u32::from_be_bytes([buf[9], buf[10], buf[11], buf[12]]);

        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        buf.advance(HEADER_SIZE);

        Ok(Some(Self {
            version,
            msg_type,
            flags,
            sequence,
            payload_len,
        }))
    }
}

/// A complete frame: header + payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    /// A record carrying sealed application bytes.
    pub fn data(sequence: u32, ciphertext: Bytes) -> Self {
        Self {
            header: FrameHeader::new(
                FrameType::Data,
                Flags(Flags::ENCRYPTED),
                sequence,
                ciphertext.len(),
            ),
            payload: ciphertext,
        }
    }

    /// A handshake message.
    pub fn hello(sequence: u32, payload: Bytes) -> Self {
        Self {
            header: FrameHeader::new(FrameType::Hello, Flags::empty(), sequence, payload.len()),
            payload,
        }
    }

    pub fn shutdown(sequence: u32) -> Self {
        Self {
            header: FrameHeader::new(FrameType::Shutdown, Flags::empty(), sequence, 0),
            payload: Bytes::new(),
        }
    }

    /// An abort notice; the reason travels in clear.
    pub fn error(sequence: u32, reason: &str) -> Self {
        let payload = Bytes::copy_from_slice(reason.as_bytes());
        Self {
            header: FrameHeader::new(FrameType::Error, Flags::empty(), sequence, payload.len()),
            payload,
        }
    }
}
