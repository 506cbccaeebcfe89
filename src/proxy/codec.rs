use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{ProxyCall, ProxyReply, Syscall, MAX_IO_CHUNK};
use crate::error::FrameError;

/// Magic bytes opening every bridge packet.
pub const BRIDGE_MAGIC: u16 = 0x5078;

/// Bridge protocol version.
pub const BRIDGE_VERSION: u8 = 1;

/// magic(2) + version(1) + kind(1) + syscall(1) + seq(4) + payload_len(4).
pub const BRIDGE_HEADER_SIZE: usize = 13;

/// fd(8) + three args(12) + data_len(4).
const CALL_FIXED: usize = 24;

/// ret(8) + errno(4) + data_len(4).
const REPLY_FIXED: usize = 16;

/// Largest payload accepted on decode.
pub const MAX_BRIDGE_PAYLOAD: u32 = (CALL_FIXED + MAX_IO_CHUNK) as u32;

const KIND_CALL: u8 = 1;
const KIND_REPLY: u8 = 2;

/// One unit on the boundary stream.
///
/// `seq` pairs a reply with the call that caused it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Call { seq: u32, call: ProxyCall },
    Reply { seq: u32, reply: ProxyReply },
}

impl Packet {
    pub fn seq(&self) -> u32 {
        match self {
            Self::Call { seq, .. } | Self::Reply { seq, .. } => *seq,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Header {
    kind: u8,
    syscall: Syscall,
    seq: u32,
    payload_len: u32,
}

impl Header {
    fn decode(buf: &mut BytesMut) -> Result<Option<Self>, FrameError> {
        if buf.len() < BRIDGE_HEADER_SIZE {
            return Ok(None);
        }

        let magic = u16::from_be_bytes([buf[0], buf[1]]);
        if magic != BRIDGE_MAGIC {
            return Err(FrameError::InvalidMagic {
                expected: BRIDGE_MAGIC,
                actual: magic,
            });
        }
        if buf[2] != BRIDGE_VERSION {
            return Err(FrameError::UnsupportedVersion(buf[2]));
        }
        let kind = buf[3];
        if kind != KIND_CALL && kind != KIND_REPLY {
            return Err(FrameError::UnknownMessageType(kind));
        }
        let syscall = Syscall::from_u8(buf[4])?;
        let seq = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]);
        let payload_len = u32::from_be_bytes([buf[9], buf[10], buf[11], buf[12]]);
        if payload_len > MAX_BRIDGE_PAYLOAD {
            return Err(FrameError::PayloadTooLarge {
                size: payload_len,
                max: MAX_BRIDGE_PAYLOAD,
            });
        }

        buf.advance(BRIDGE_HEADER_SIZE);
        Ok(Some(Self {
            kind,
            syscall,
            seq,
            payload_len,
        }))
    }
}

/// Length-prefixed byte range at the tail of a payload.
fn take_data(payload: &mut Bytes) -> Result<Bytes, FrameError> {
    let len = payload.get_u32() as usize;
    if payload.remaining() != len {
        return Err(FrameError::Malformed("data length disagrees with payload"));
    }
    Ok(payload.split_to(len))
}

/// Codec for the boundary stream between isolated code and the host.
#[derive(Debug, Default)]
pub struct BridgeCodec {
    current_header: Option<Header>,
}

impl BridgeCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for BridgeCodec {
    type Item = Packet;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.current_header.take() {
            Some(h) => h,
            None => match Header::decode(src)? {
                Some(h) => h,
                None => return Ok(None),
            },
        };

        let payload_len = header.payload_len as usize;
        if src.len() < payload_len {
            src.reserve(payload_len - src.len());
            self.current_header = Some(header);
            return Ok(None);
        }
        let mut payload = src.split_to(payload_len).freeze();

        let packet = if header.kind == KIND_CALL {
            if payload.len() < CALL_FIXED {
                return Err(FrameError::Malformed("short call payload"));
            }
            let fd = payload.get_i64();
            let args = [payload.get_i32(), payload.get_i32(), payload.get_i32()];
            let data = take_data(&mut payload)?;
            Packet::Call {
                seq: header.seq,
                call: ProxyCall {
                    syscall: header.syscall,
                    fd,
                    args,
                    data,
                },
            }
        } else {
            if payload.len() < REPLY_FIXED {
                return Err(FrameError::Malformed("short reply payload"));
            }
            let ret = payload.get_i64();
            let errno = payload.get_i32();
            let data = take_data(&mut payload)?;
            Packet::Reply {
                seq: header.seq,
                reply: ProxyReply {
                    syscall: header.syscall,
                    ret,
                    errno,
                    data,
                },
            }
        };
        Ok(Some(packet))
    }
}

impl Encoder<Packet> for BridgeCodec {
    type Error = FrameError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (kind, syscall, fixed, data) = match &packet {
            Packet::Call { call, .. } => (KIND_CALL, call.syscall, CALL_FIXED, &call.data),
            Packet::Reply { reply, .. } => (KIND_REPLY, reply.syscall, REPLY_FIXED, &reply.data),
        };
        if data.len() > MAX_IO_CHUNK {
            return Err(FrameError::PayloadTooLarge {
                size: data.len() as u32,
                max: MAX_IO_CHUNK as u32,
            });
        }
        let payload_len = fixed + data.len();

        dst.reserve(BRIDGE_HEADER_SIZE + payload_len);
        dst.put_u16(BRIDGE_MAGIC);
        dst.put_u8(BRIDGE_VERSION);
        dst.put_u8(kind);
        dst.put_u8(syscall as u8);
        dst.put_u32(packet.seq());
        dst.put_u32(payload_len as u32);

        match &packet {
            Packet::Call { call, .. } => {
                dst.put_i64(call.fd);
                for arg in call.args {
                    dst.put_i32(arg);
                }
            }
            Packet::Reply { reply, .. } => {
                dst.put_i64(reply.ret);
                dst.put_i32(reply.errno);
            }
        }
        dst.put_u32(data.len() as u32);
        dst.extend_from_slice(data);
        Ok(())
    }
}
