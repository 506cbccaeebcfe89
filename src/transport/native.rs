use std::collections::HashMap;
use std::io::{self, Read};
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use socket2::{Protocol, SockAddr, Socket, Type};

use super::{parse_int_value, Descriptor, Domain, Level, OptName, SockType, TransportProvider};
use crate::error::ProxyError;
use crate::proxy::Syscall;

/// First descriptor handed out. Keeps clear of stdio-looking numbers.
const FIRST_DESCRIPTOR: i64 = 3;

/// Transport that performs each syscall directly against the OS.
///
/// Sockets live in a table keyed by locally allocated descriptors that are
/// never reused, so a stale descriptor fails with `EBADF` instead of
/// reaching an unrelated socket.
pub struct NativeTransport {
    sockets: Mutex<HashMap<i64, Arc<Socket>>>,
    next: AtomicI64,
}

impl Default for NativeTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeTransport {
    pub fn new() -> Self {
        Self {
            sockets: Mutex::new(HashMap::new()),
            next: AtomicI64::new(FIRST_DESCRIPTOR),
        }
    }

    /// Number of open sockets.
    pub fn open_count(&self) -> usize {
        self.sockets.lock().map(|s| s.len()).unwrap_or(0)
    }

    fn insert(&self, stage: Syscall, socket: Socket) -> Result<Descriptor, ProxyError> {
        let raw = self.next.fetch_add(1, Ordering::Relaxed);
        let mut sockets = self
            .sockets
            .lock()
            .map_err(|_| ProxyError::errno(stage, libc::EIO))?;
        sockets.insert(raw, Arc::new(socket));
        Ok(Descriptor::from_raw(raw))
    }

    /// Clone the socket out of the table so blocking calls run unlocked.
    fn lookup(&self, stage: Syscall, fd: Descriptor) -> Result<Arc<Socket>, ProxyError> {
        let sockets = self
            .sockets
            .lock()
            .map_err(|_| ProxyError::errno(stage, libc::EIO))?;
        sockets
            .get(&fd.raw())
            .cloned()
            .ok_or_else(|| ProxyError::errno(stage, libc::EBADF))
    }
}

fn os_error(stage: Syscall, err: io::Error) -> ProxyError {
    ProxyError::errno(stage, err.raw_os_error().unwrap_or(libc::EIO))
}

/// Set an integer `IPPROTO_TCP` option with exactly one `setsockopt(2)`.
/// socket2's keep-alive helpers also force `SO_KEEPALIVE` on.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn set_tcp_int(socket: &Socket, name: libc::c_int, value: i32) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    // SAFETY: the descriptor is owned by `socket` for the whole call and the
    // option buffer is a live `c_int` whose exact size is passed.
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_TCP,
            name,
            (&value as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl TransportProvider for NativeTransport {
    fn socket(
        &self,
        domain: Domain,
        ty: SockType,
        protocol: i32,
    ) -> Result<Descriptor, ProxyError> {
        let stage = Syscall::Socket;
        let domain = match domain {
            Domain::Inet => socket2::Domain::IPV4,
        };
        let ty = match ty {
            SockType::Stream => Type::STREAM,
        };
        let protocol = match protocol {
            0 => None,
            6 => Some(Protocol::TCP),
            _ => return Err(ProxyError::errno(stage, libc::EPROTONOSUPPORT)),
        };
        let socket = Socket::new(domain, ty, protocol).map_err(|e| os_error(stage, e))?;
        self.insert(stage, socket)
    }

    fn setsockopt(
        &self,
        fd: Descriptor,
        level: Level,
        name: OptName,
        value: &[u8],
    ) -> Result<(), ProxyError> {
        let stage = Syscall::SetSockOpt;
        let socket = self.lookup(stage, fd)?;
        let v = parse_int_value(value).ok_or_else(|| ProxyError::errno(stage, libc::EINVAL))?;

        let result = match (level, name) {
            (Level::Socket, OptName::ReuseAddr) => socket.set_reuse_address(v != 0),
            (Level::Socket, OptName::KeepAlive) => socket.set_keepalive(v != 0),
            #[cfg(any(target_os = "linux", target_os = "android"))]
            (Level::Tcp, OptName::KeepIdle) => set_tcp_int(&socket, libc::TCP_KEEPIDLE, v),
            #[cfg(any(target_os = "linux", target_os = "android"))]
            (Level::Tcp, OptName::KeepInterval) => set_tcp_int(&socket, libc::TCP_KEEPINTVL, v),
            #[cfg(any(target_os = "linux", target_os = "android"))]
            (Level::Tcp, OptName::KeepCount) => set_tcp_int(&socket, libc::TCP_KEEPCNT, v),
            _ => return Err(ProxyError::errno(stage, libc::ENOPROTOOPT)),
        };
        result.map_err(|e| os_error(stage, e))
    }

    fn bind(&self, fd: Descriptor, addr: SocketAddrV4) -> Result<(), ProxyError> {
        let stage = Syscall::Bind;
        let socket = self.lookup(stage, fd)?;
        socket
            .bind(&SockAddr::from(SocketAddr::V4(addr)))
            .map_err(|e| os_error(stage, e))
    }

    fn listen(&self, fd: Descriptor, backlog: i32) -> Result<(), ProxyError> {
        let stage = Syscall::Listen;
        let socket = self.lookup(stage, fd)?;
        socket.listen(backlog).map_err(|e| os_error(stage, e))
    }

    fn accept(&self, fd: Descriptor) -> Result<(Descriptor, Option<SocketAddrV4>), ProxyError> {
        let stage = Syscall::Accept;
        let listener = self.lookup(stage, fd)?;
        let (conn, peer) = listener.accept().map_err(|e| os_error(stage, e))?;
        let conn = self.insert(stage, conn)?;
        Ok((conn, peer.as_socket_ipv4()))
    }

    fn connect(&self, fd: Descriptor, addr: SocketAddrV4) -> Result<(), ProxyError> {
        let stage = Syscall::Connect;
        let socket = self.lookup(stage, fd)?;
        socket
            .connect(&SockAddr::from(SocketAddr::V4(addr)))
            .map_err(|e| os_error(stage, e))
    }

    fn close(&self, fd: Descriptor) -> Result<(), ProxyError> {
        let stage = Syscall::Close;
        let mut sockets = self
            .sockets
            .lock()
            .map_err(|_| ProxyError::errno(stage, libc::EIO))?;
        // The OS socket closes once any in-flight call drops its clone.
        sockets
            .remove(&fd.raw())
            .map(drop)
            .ok_or_else(|| ProxyError::errno(stage, libc::EBADF))
    }

    fn send(&self, fd: Descriptor, buf: &[u8]) -> Result<usize, ProxyError> {
        let stage = Syscall::Send;
        let socket = self.lookup(stage, fd)?;
        socket.send(buf).map_err(|e| os_error(stage, e))
    }

    fn recv(&self, fd: Descriptor, buf: &mut [u8]) -> Result<usize, ProxyError> {
        let stage = Syscall::Recv;
        let socket = self.lookup(stage, fd)?;
        let mut reader: &Socket = &socket;
        reader.read(buf).map_err(|e| os_error(stage, e))
    }

    fn getsockname(&self, fd: Descriptor) -> Result<SocketAddrV4, ProxyError> {
        let stage = Syscall::GetSockName;
        let socket = self.lookup(stage, fd)?;
        let addr = socket.local_addr().map_err(|e| os_error(stage, e))?;
        addr.as_socket_ipv4()
            .ok_or_else(|| ProxyError::errno(stage, libc::EAFNOSUPPORT))
    }
}
