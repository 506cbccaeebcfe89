//! Socket capability consumed by the session lifecycle.
//!
//! [`TransportProvider`] is implemented twice: [`native::NativeTransport`]
//! makes the OS calls directly, and [`ProxiedTransport`](crate::proxy::enclave::ProxiedTransport)
//! marshals every call to an untrusted host. The lifecycle never knows which
//! one it holds.

pub mod native;

use std::fmt;
use std::net::SocketAddrV4;
use std::time::Duration;

use crate::error::ProxyError;

/// Socket handle issued by a transport provider. Meaningless outside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Descriptor(i64);

impl Descriptor {
    pub const fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> i64 {
        self.0
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd#{}", self.0)
    }
}

/// Address family. Values are proxy-local, not OS constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Domain {
    Inet = 1,
}

impl Domain {
    pub fn from_raw(v: i32) -> Option<Self> {
        match v {
            1 => Some(Self::Inet),
            _ => None,
        }
    }
}

/// Socket type. Values are proxy-local.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum SockType {
    Stream = 1,
}

impl SockType {
    pub fn from_raw(v: i32) -> Option<Self> {
        match v {
            1 => Some(Self::Stream),
            _ => None,
        }
    }
}

/// Protocol number meaning "default for the socket type".
pub const DEFAULT_PROTOCOL: i32 = 0;

/// `setsockopt` level. Values are proxy-local.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Level {
    Socket = 1,
    Tcp = 2,
}

impl Level {
    pub fn from_raw(v: i32) -> Option<Self> {
        match v {
            1 => Some(Self::Socket),
            2 => Some(Self::Tcp),
            _ => None,
        }
    }
}

/// `setsockopt` option name. Values are proxy-local.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum OptName {
    ReuseAddr = 1,
    KeepAlive = 2,
    KeepIdle = 3,
    KeepInterval = 4,
    KeepCount = 5,
}

impl OptName {
    pub fn from_raw(v: i32) -> Option<Self> {
        match v {
            1 => Some(Self::ReuseAddr),
            2 => Some(Self::KeepAlive),
            3 => Some(Self::KeepIdle),
            4 => Some(Self::KeepInterval),
            5 => Some(Self::KeepCount),
            _ => None,
        }
    }
}

/// Flat encoding of an integer option value.
pub fn int_value(v: i32) -> [u8; 4] {
    v.to_le_bytes()
}

/// Decode a flat integer option value; `None` unless exactly four bytes.
pub fn parse_int_value(value: &[u8]) -> Option<i32> {
    let bytes: [u8; 4] = value.try_into().ok()?;
    Some(i32::from_le_bytes(bytes))
}

/// Socket syscalls the lifecycle and the attested channel need.
///
/// Each call blocks until the OS (or the host, when proxied) answers. Buffers
/// are flat byte ranges; no pointer survives the call.
pub trait TransportProvider: Send + Sync {
    fn socket(&self, domain: Domain, ty: SockType, protocol: i32)
        -> Result<Descriptor, ProxyError>;

    fn setsockopt(
        &self,
        fd: Descriptor,
        level: Level,
        name: OptName,
        value: &[u8],
    ) -> Result<(), ProxyError>;

    fn bind(&self, fd: Descriptor, addr: SocketAddrV4) -> Result<(), ProxyError>;

    fn listen(&self, fd: Descriptor, backlog: i32) -> Result<(), ProxyError>;

    /// Accept one connection. The peer address is `None` when the host
    /// returned an address of unexpected shape.
    fn accept(&self, fd: Descriptor) -> Result<(Descriptor, Option<SocketAddrV4>), ProxyError>;

    fn connect(&self, fd: Descriptor, addr: SocketAddrV4) -> Result<(), ProxyError>;

    fn close(&self, fd: Descriptor) -> Result<(), ProxyError>;

    /// Send some bytes; returns how many were taken.
    fn send(&self, fd: Descriptor, buf: &[u8]) -> Result<usize, ProxyError>;

    /// Receive up to `buf.len()` bytes; `Ok(0)` means the peer closed.
    fn recv(&self, fd: Descriptor, buf: &mut [u8]) -> Result<usize, ProxyError>;

    fn getsockname(&self, fd: Descriptor) -> Result<SocketAddrV4, ProxyError>;
}

/// TCP keep-alive parameters applied to listening sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAlive {
    pub idle: Duration,
    pub interval: Duration,
    pub probes: u32,
}

impl Default for KeepAlive {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(30),
            interval: Duration::from_secs(10),
            probes: 5,
        }
    }
}

impl KeepAlive {
    /// Enable keep-alive, then set idle time, interval and probe count, in
    /// that order. The first failure stops the sequence.
    pub fn apply(&self, io: &dyn TransportProvider, fd: Descriptor) -> Result<(), ProxyError> {
        let idle = i32::try_from(self.idle.as_secs()).unwrap_or(i32::MAX);
        let interval = i32::try_from(self.interval.as_secs()).unwrap_or(i32::MAX);
        let probes = i32::try_from(self.probes).unwrap_or(i32::MAX);

        io.setsockopt(fd, Level::Socket, OptName::KeepAlive, &int_value(1))?;
        io.setsockopt(fd, Level::Tcp, OptName::KeepIdle, &int_value(idle))?;
        io.setsockopt(fd, Level::Tcp, OptName::KeepInterval, &int_value(interval))?;
        io.setsockopt(fd, Level::Tcp, OptName::KeepCount, &int_value(probes))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::proxy::Syscall;

    /// Records setsockopt calls and fails the n-th one.
    struct FailingOpts {
        fail_at: usize,
        seen: Mutex<Vec<(Level, OptName, i32)>>,
    }

    impl TransportProvider for FailingOpts {
        fn socket(&self, _: Domain, _: SockType, _: i32) -> Result<Descriptor, ProxyError> {
            Ok(Descriptor::from_raw(3))
        }

        fn setsockopt(
            &self,
            _fd: Descriptor,
            level: Level,
            name: OptName,
            value: &[u8],
        ) -> Result<(), ProxyError> {
            let mut seen = self.seen.lock().unwrap();
            seen.push((level, name, parse_int_value(value).unwrap()));
            if seen.len() == self.fail_at {
                return Err(ProxyError::errno(Syscall::SetSockOpt, libc::EINVAL));
            }
            Ok(())
        }

        fn bind(&self, _: Descriptor, _: SocketAddrV4) -> Result<(), ProxyError> {
            unreachable!()
        }

        fn listen(&self, _: Descriptor, _: i32) -> Result<(), ProxyError> {
            unreachable!()
        }

        fn accept(&self, _: Descriptor) -> Result<(Descriptor, Option<SocketAddrV4>), ProxyError> {
            unreachable!()
        }

        fn connect(&self, _: Descriptor, _: SocketAddrV4) -> Result<(), ProxyError> {
            unreachable!()
        }

        fn close(&self, _: Descriptor) -> Result<(), ProxyError> {
            Ok(())
        }

        fn send(&self, _: Descriptor, _: &[u8]) -> Result<usize, ProxyError> {
            unreachable!()
        }

        fn recv(&self, _: Descriptor, _: &mut [u8]) -> Result<usize, ProxyError> {
            unreachable!()
        }

        fn getsockname(&self, _: Descriptor) -> Result<SocketAddrV4, ProxyError> {
            unreachable!()
        }
    }

    #[test]
    fn keepalive_applied_in_order() {
        let io = FailingOpts {
            fail_at: usize::MAX,
            seen: Mutex::new(Vec::new()),
        };
        KeepAlive::default()
            .apply(&io, Descriptor::from_raw(3))
            .unwrap();
        assert_eq!(
            *io.seen.lock().unwrap(),
            vec![
                (Level::Socket, OptName::KeepAlive, 1),
                (Level::Tcp, OptName::KeepIdle, 30),
                (Level::Tcp, OptName::KeepInterval, 10),
                (Level::Tcp, OptName::KeepCount, 5),
            ]
        );
    }

    #[test]
    fn keepalive_stops_at_first_failure() {
        let io = FailingOpts {
            fail_at: 2,
            seen: Mutex::new(Vec::new()),
        };
        let err = KeepAlive::default()
            .apply(&io, Descriptor::from_raw(3))
            .unwrap_err();
        assert_eq!(err.native_errno(), Some(libc::EINVAL));

        // Idle time failed; interval and probe count were never attempted.
        let seen = io.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].1, OptName::KeepIdle);
    }

    #[test]
    fn int_values_are_four_bytes() {
        assert_eq!(parse_int_value(&int_value(-7)), Some(-7));
        assert_eq!(parse_int_value(&[1, 0]), None);
    }

    #[test]
    fn symbolic_constants_roundtrip() {
        assert_eq!(Domain::from_raw(Domain::Inet as i32), Some(Domain::Inet));
        assert_eq!(Level::from_raw(9), None);
        assert_eq!(OptName::from_raw(OptName::KeepCount as i32), Some(OptName::KeepCount));
    }
}
