use std::io::{Read, Write};
use std::net::SocketAddrV4;
use std::sync::Mutex;

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use super::codec::{BridgeCodec, Packet};
use super::{decode_sockaddr, ProxyCall, ProxyReply, Syscall};
use crate::error::ProxyError;
use crate::transport::{Descriptor, Domain, Level, OptName, SockType, TransportProvider};

const READ_CHUNK: usize = 4096;

struct Link<B> {
    stream: B,
    codec: BridgeCodec,
    read_buf: BytesMut,
    write_buf: BytesMut,
    next_seq: u32,
    broken: bool,
}

impl<B: Read + Write> Link<B> {
    fn exchange(&mut self, call: ProxyCall) -> Result<ProxyReply, ProxyError> {
        let stage = call.syscall;
        if self.broken {
            return Err(ProxyError::boundary(stage, "bridge is unusable after an earlier fault"));
        }
        let result = self.round_trip(call);
        if matches!(&result, Err(e) if e.native_errno().is_none()) {
            self.broken = true;
        }
        result
    }

    fn round_trip(&mut self, call: ProxyCall) -> Result<ProxyReply, ProxyError> {
        let stage = call.syscall;
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);

        self.write_buf.clear();
        self.codec
            .encode(Packet::Call { seq, call }, &mut self.write_buf)
            .map_err(|e| ProxyError::boundary(stage, e.to_string()))?;
        self.stream
            .write_all(&self.write_buf)
            .and_then(|()| self.stream.flush())
            .map_err(|e| ProxyError::boundary(stage, format!("send to host: {e}")))?;

        let mut chunk = [0u8; READ_CHUNK];
        let packet = loop {
            if let Some(packet) = self
                .codec
                .decode(&mut self.read_buf)
                .map_err(|e| ProxyError::boundary(stage, e.to_string()))?
            {
                break packet;
            }
            let n = self
                .stream
                .read(&mut chunk)
                .map_err(|e| ProxyError::boundary(stage, format!("receive from host: {e}")))?;
            if n == 0 {
                return Err(ProxyError::boundary(stage, "host closed the bridge"));
            }
            self.read_buf.extend_from_slice(&chunk[..n]);
        };

        match packet {
            Packet::Reply { seq: got, reply } if got == seq && reply.syscall == stage => {
                if reply.ret < 0 {
                    return Err(ProxyError::errno(stage, reply.errno));
                }
                Ok(reply)
            }
            Packet::Reply { seq: got, .. } => Err(ProxyError::boundary(
                stage,
                format!("reply {got} does not answer call {seq}"),
            )),
            Packet::Call { .. } => Err(ProxyError::boundary(stage, "host sent a call")),
        }
    }
}

/// [`TransportProvider`] for code that cannot make syscalls itself.
///
/// Every call is marshalled over `B` to the host dispatcher and blocks until
/// the paired reply arrives. A reply with a negative return value becomes
/// [`Fault::Errno`](crate::error::Fault::Errno) carrying the host's errno
/// unchanged. Anything wrong with the exchange itself becomes
/// [`Fault::Boundary`](crate::error::Fault::Boundary), after which the bridge
/// refuses further calls, since the stream may be out of step.
pub struct ProxiedTransport<B> {
    link: Mutex<Link<B>>,
}

impl<B: Read + Write + Send> ProxiedTransport<B> {
    pub fn new(stream: B) -> Self {
        Self {
            link: Mutex::new(Link {
                stream,
                codec: BridgeCodec::new(),
                read_buf: BytesMut::with_capacity(READ_CHUNK),
                write_buf: BytesMut::with_capacity(READ_CHUNK),
                next_seq: 0,
                broken: false,
            }),
        }
    }

    fn call(&self, call: ProxyCall) -> Result<ProxyReply, ProxyError> {
        let stage = call.syscall;
        let mut link = self
            .link
            .lock()
            .map_err(|_| ProxyError::boundary(stage, "bridge lock poisoned"))?;
        tracing::trace!(syscall = %stage, fd = call.fd, "proxy call");
        link.exchange(call)
    }
}

fn descriptor(stage: Syscall, ret: i64) -> Result<Descriptor, ProxyError> {
    if ret < 0 {
        return Err(ProxyError::boundary(stage, "host returned a negative descriptor"));
    }
    Ok(Descriptor::from_raw(ret))
}

impl<B: Read + Write + Send> TransportProvider for ProxiedTransport<B> {
    fn socket(&self, domain: Domain, ty: SockType, protocol: i32) -> Result<Descriptor, ProxyError> {
        let reply = self.call(ProxyCall::socket(domain as i32, ty as i32, protocol))?;
        descriptor(Syscall::Socket, reply.ret)
    }

    fn setsockopt(
        &self,
        fd: Descriptor,
        level: Level,
        name: OptName,
        value: &[u8],
    ) -> Result<(), ProxyError> {
        self.call(ProxyCall::setsockopt(fd, level as i32, name as i32, value))
            .map(drop)
    }

    fn bind(&self, fd: Descriptor, addr: SocketAddrV4) -> Result<(), ProxyError> {
        self.call(ProxyCall::bind(fd, addr)).map(drop)
    }

    fn listen(&self, fd: Descriptor, backlog: i32) -> Result<(), ProxyError> {
        self.call(ProxyCall::listen(fd, backlog)).map(drop)
    }

    fn accept(&self, fd: Descriptor) -> Result<(Descriptor, Option<SocketAddrV4>), ProxyError> {
        let reply = self.call(ProxyCall::accept(fd))?;
        let conn = descriptor(Syscall::Accept, reply.ret)?;
        // An address of unexpected shape is reported, not fatal.
        let peer = decode_sockaddr(&reply.data);
        if peer.is_none() {
            tracing::debug!(len = reply.data.len(), "host returned an unusable peer address");
        }
        Ok((conn, peer))
    }

    fn connect(&self, fd: Descriptor, addr: SocketAddrV4) -> Result<(), ProxyError> {
        self.call(ProxyCall::connect(fd, addr)).map(drop)
    }

    fn close(&self, fd: Descriptor) -> Result<(), ProxyError> {
        self.call(ProxyCall::close(fd)).map(drop)
    }

    fn send(&self, fd: Descriptor, buf: &[u8]) -> Result<usize, ProxyError> {
        let call = ProxyCall::send(fd, buf);
        let offered = call.data.len();
        let reply = self.call(call)?;
        match usize::try_from(reply.ret) {
            Ok(n) if n <= offered => Ok(n),
            _ => Err(ProxyError::boundary(
                Syscall::Send,
                "host reported more bytes sent than offered",
            )),
        }
    }

    fn recv(&self, fd: Descriptor, buf: &mut [u8]) -> Result<usize, ProxyError> {
        let reply = self.call(ProxyCall::recv(fd, buf.len()))?;
        let n = reply.data.len();
        if n > buf.len() || usize::try_from(reply.ret).ok() != Some(n) {
            return Err(ProxyError::boundary(
                Syscall::Recv,
                "host returned an inconsistent byte count",
            ));
        }
        buf[..n].copy_from_slice(&reply.data);
        Ok(n)
    }

    fn getsockname(&self, fd: Descriptor) -> Result<SocketAddrV4, ProxyError> {
        let reply = self.call(ProxyCall::getsockname(fd))?;
        decode_sockaddr(&reply.data)
            .ok_or_else(|| ProxyError::boundary(Syscall::GetSockName, "malformed local address"))
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::os::unix::net::UnixStream;
    use std::thread;

    use bytes::Bytes;

    use super::*;
    use crate::proxy::encode_sockaddr;
    use crate::transport::DEFAULT_PROTOCOL;

    /// Minimal host that answers each call with `answer` until the stream closes.
    fn scripted_host<F>(mut stream: UnixStream, mut answer: F) -> thread::JoinHandle<()>
    where
        F: FnMut(u32, ProxyCall) -> Option<Packet> + Send + 'static,
    {
        thread::spawn(move || {
            let mut codec = BridgeCodec::new();
            let mut buf = BytesMut::new();
            let mut chunk = [0u8; 512];
            loop {
                while let Some(packet) = codec.decode(&mut buf).unwrap() {
                    let Packet::Call { seq, call } = packet else {
                        panic!("host received a reply");
                    };
                    let Some(reply) = answer(seq, call) else {
                        return;
                    };
                    let mut out = BytesMut::new();
                    codec.encode(reply, &mut out).unwrap();
                    stream.write_all(&out).unwrap();
                }
                let n = stream.read(&mut chunk).unwrap();
                if n == 0 {
                    return;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
        })
    }

    #[test]
    fn host_errno_is_relayed_unchanged() {
        let (enclave, host) = UnixStream::pair().unwrap();
        let host = scripted_host(host, |seq, call| {
            let reply = match call.syscall {
                Syscall::Socket => ProxyReply::ok(Syscall::Socket, 7, Bytes::new()),
                other => ProxyReply::failed(other, libc::ENOPROTOOPT),
            };
            Some(Packet::Reply { seq, reply })
        });

        let io = ProxiedTransport::new(enclave);
        let fd = io.socket(Domain::Inet, SockType::Stream, DEFAULT_PROTOCOL).unwrap();
        assert_eq!(fd, Descriptor::from_raw(7));

        let err = io
            .setsockopt(fd, Level::Tcp, OptName::KeepIdle, &[30, 0, 0, 0])
            .unwrap_err();
        assert_eq!(err.stage, Syscall::SetSockOpt);
        assert_eq!(err.native_errno(), Some(libc::ENOPROTOOPT));

        // An errno failure leaves the bridge usable.
        let err = io.listen(fd, 5).unwrap_err();
        assert_eq!(err.native_errno(), Some(libc::ENOPROTOOPT));

        drop(io);
        host.join().unwrap();
    }

    #[test]
    fn accept_with_garbage_address_still_yields_connection() {
        let (enclave, host) = UnixStream::pair().unwrap();
        let peer = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 40000);
        let mut first = true;
        let host = scripted_host(host, move |seq, call| {
            let data = if first {
                Bytes::from_static(&[0xFF; 5])
            } else {
                Bytes::copy_from_slice(&encode_sockaddr(peer))
            };
            first = false;
            Some(Packet::Reply {
                seq,
                reply: ProxyReply::ok(call.syscall, 9, data),
            })
        });

        let io = ProxiedTransport::new(enclave);
        let listener = Descriptor::from_raw(3);
        assert_eq!(io.accept(listener).unwrap(), (Descriptor::from_raw(9), None));
        assert_eq!(
            io.accept(listener).unwrap(),
            (Descriptor::from_raw(9), Some(peer))
        );

        drop(io);
        host.join().unwrap();
    }

    #[test]
    fn mismatched_sequence_poisons_bridge() {
        let (enclave, host) = UnixStream::pair().unwrap();
        let host = scripted_host(host, |seq, call| {
            Some(Packet::Reply {
                seq: seq + 100,
                reply: ProxyReply::ok(call.syscall, 0, Bytes::new()),
            })
        });

        let io = ProxiedTransport::new(enclave);
        let err = io.close(Descriptor::from_raw(3)).unwrap_err();
        assert_eq!(err.native_errno(), None);

        let err = io.close(Descriptor::from_raw(3)).unwrap_err();
        assert_eq!(err.native_errno(), None);
        assert!(err.to_string().contains("unusable"));

        drop(io);
        host.join().unwrap();
    }

    #[test]
    fn host_hangup_is_boundary_fault() {
        let (enclave, host) = UnixStream::pair().unwrap();
        let host = scripted_host(host, |_, _| None);

        let io = ProxiedTransport::new(enclave);
        let err = io.connect(
            Descriptor::from_raw(3),
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1234),
        );
        host.join().unwrap();
        let err = err.unwrap_err();
        assert_eq!(err.stage, Syscall::Connect);
        assert!(err.native_errno().is_none());
    }

    #[test]
    fn recv_copies_reply_bytes() {
        let (enclave, host) = UnixStream::pair().unwrap();
        let host = scripted_host(host, |seq, call| {
            assert_eq!(call.args[0], 8);
            Some(Packet::Reply {
                seq,
                reply: ProxyReply::ok(Syscall::Recv, 5, Bytes::from_static(b"hello")),
            })
        });

        let io = ProxiedTransport::new(enclave);
        let mut buf = [0u8; 8];
        assert_eq!(io.recv(Descriptor::from_raw(4), &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");

        drop(io);
        host.join().unwrap();
    }
}
