//! Socket syscall proxy between isolated code and the untrusted host.
//!
//! The isolated side ([`enclave::ProxiedTransport`]) turns each syscall into a
//! [`ProxyCall`], ships it across the boundary and blocks for the matching
//! [`ProxyReply`]. The host side ([`host`]) executes the call on a real
//! transport and answers. Arguments are fixed-size integers plus at most one
//! flat, length-tagged buffer.

pub mod codec;
pub mod enclave;
pub mod host;

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::Bytes;

use crate::error::FrameError;
use crate::transport::{Descriptor, Domain};

/// Syscalls the bridge carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Syscall {
    Socket = 0x01,
    SetSockOpt = 0x02,
    Bind = 0x03,
    Listen = 0x04,
    Accept = 0x05,
    Connect = 0x06,
    Close = 0x07,
    Send = 0x08,
    Recv = 0x09,
    GetSockName = 0x0A,
}

impl Syscall {
    pub fn from_u8(v: u8) -> Result<Self, FrameError> {
        match v {
            0x01 => Ok(Self::Socket),
            0x02 => Ok(Self::SetSockOpt),
            0x03 => Ok(Self::Bind),
            0x04 => Ok(Self::Listen),
            0x05 => Ok(Self::Accept),
            0x06 => Ok(Self::Connect),
            0x07 => Ok(Self::Close),
            0x08 => Ok(Self::Send),
            0x09 => Ok(Self::Recv),
            0x0A => Ok(Self::GetSockName),
            other => Err(FrameError::UnknownSyscall(other)),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Socket => "socket",
            Self::SetSockOpt => "setsockopt",
            Self::Bind => "bind",
            Self::Listen => "listen",
            Self::Accept => "accept",
            Self::Connect => "connect",
            Self::Close => "close",
            Self::Send => "send",
            Self::Recv => "recv",
            Self::GetSockName => "getsockname",
        }
    }
}

impl fmt::Display for Syscall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Largest flat buffer a single call or reply may carry (64 KiB).
pub const MAX_IO_CHUNK: usize = 64 * 1024;

/// Size of a flattened `sockaddr_in`.
pub const SOCKADDR_IN_LEN: usize = 16;

/// Flatten an IPv4 address into a `sockaddr_in` image.
///
/// Layout: family (LE u16, proxy-local value), port (BE u16), address
/// octets, 8 zero bytes.
pub fn encode_sockaddr(addr: SocketAddrV4) -> [u8; SOCKADDR_IN_LEN] {
    let mut out = [0u8; SOCKADDR_IN_LEN];
    out[0..2].copy_from_slice(&(Domain::Inet as u16).to_le_bytes());
    out[2..4].copy_from_slice(&addr.port().to_be_bytes());
    out[4..8].copy_from_slice(&addr.ip().octets());
    out
}

/// Parse a `sockaddr_in` image; `None` if the length or family is wrong.
pub fn decode_sockaddr(raw: &[u8]) -> Option<SocketAddrV4> {
    if raw.len() != SOCKADDR_IN_LEN {
        return None;
    }
    let family = u16::from_le_bytes([raw[0], raw[1]]);
    if family != Domain::Inet as u16 {
        return None;
    }
    let port = u16::from_be_bytes([raw[2], raw[3]]);
    let ip = Ipv4Addr::new(raw[4], raw[5], raw[6], raw[7]);
    Some(SocketAddrV4::new(ip, port))
}

/// A syscall request travelling from the isolated side to the host.
///
/// `args` hold the call's integer arguments in native order (for example
/// `socket` uses domain, type, protocol; `setsockopt` uses level, name).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyCall {
    pub syscall: Syscall,
    pub fd: i64,
    pub args: [i32; 3],
    pub data: Bytes,
}

impl ProxyCall {
    fn new(syscall: Syscall, fd: i64, args: [i32; 3], data: Bytes) -> Self {
        Self {
            syscall,
            fd,
            args,
            data,
        }
    }

    pub fn socket(domain: i32, ty: i32, protocol: i32) -> Self {
        Self::new(Syscall::Socket, -1, [domain, ty, protocol], Bytes::new())
    }

    pub fn setsockopt(fd: Descriptor, level: i32, name: i32, value: &[u8]) -> Self {
        Self::new(
            Syscall::SetSockOpt,
            fd.raw(),
            [level, name, 0],
            Bytes::copy_from_slice(value),
        )
    }

    pub fn bind(fd: Descriptor, addr: SocketAddrV4) -> Self {
        let raw = Bytes::copy_from_slice(&encode_sockaddr(addr));
        Self::new(Syscall::Bind, fd.raw(), [0; 3], raw)
    }

    pub fn listen(fd: Descriptor, backlog: i32) -> Self {
        Self::new(Syscall::Listen, fd.raw(), [backlog, 0, 0], Bytes::new())
    }

    /// `args[0]` is the capacity offered for the peer address.
    pub fn accept(fd: Descriptor) -> Self {
        Self::new(
            Syscall::Accept,
            fd.raw(),
            [SOCKADDR_IN_LEN as i32, 0, 0],
            Bytes::new(),
        )
    }

    pub fn connect(fd: Descriptor, addr: SocketAddrV4) -> Self {
        let raw = Bytes::copy_from_slice(&encode_sockaddr(addr));
        Self::new(Syscall::Connect, fd.raw(), [0; 3], raw)
    }

    pub fn close(fd: Descriptor) -> Self {
        Self::new(Syscall::Close, fd.raw(), [0; 3], Bytes::new())
    }

    pub fn send(fd: Descriptor, buf: &[u8]) -> Self {
        let len = buf.len().min(MAX_IO_CHUNK);
        Self::new(
            Syscall::Send,
            fd.raw(),
            [0; 3],
            Bytes::copy_from_slice(&buf[..len]),
        )
    }

    /// `args[0]` is the receive capacity.
    pub fn recv(fd: Descriptor, capacity: usize) -> Self {
        let capacity = capacity.min(MAX_IO_CHUNK) as i32;
        Self::new(Syscall::Recv, fd.raw(), [capacity, 0, 0], Bytes::new())
    }

    pub fn getsockname(fd: Descriptor) -> Self {
        Self::new(
            Syscall::GetSockName,
            fd.raw(),
            [SOCKADDR_IN_LEN as i32, 0, 0],
            Bytes::new(),
        )
    }
}

/// The host's answer to a [`ProxyCall`].
///
/// `ret` is the native return value (negative on failure, with `errno`
/// set). `data` carries output buffers such as a peer address or received
/// bytes; its content is unspecified when `ret` is negative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyReply {
    pub syscall: Syscall,
    pub ret: i64,
    pub errno: i32,
    pub data: Bytes,
}

impl ProxyReply {
    pub fn ok(syscall: Syscall, ret: i64, data: Bytes) -> Self {
        Self {
            syscall,
            ret,
            errno: 0,
            data,
        }
    }

    pub fn failed(syscall: Syscall, errno: i32) -> Self {
        Self {
            syscall,
            ret: -1,
            errno,
            data: Bytes::new(),
        }
    }
}
