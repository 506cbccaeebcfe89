use std::io;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::runtime::Runtime;
use tokio_util::codec::{Decoder, Encoder};

use super::codec::{BridgeCodec, Packet};
use super::enclave::ProxiedTransport;
use super::{decode_sockaddr, encode_sockaddr, ProxyCall, ProxyReply, Syscall, MAX_IO_CHUNK, SOCKADDR_IN_LEN};
use crate::error::{FrameError, ProxyError};
use crate::transport::{Descriptor, Domain, Level, OptName, SockType, TransportProvider};

type Outcome = Result<(i64, Bytes), ProxyError>;

fn done(_: ()) -> (i64, Bytes) {
    (0, Bytes::new())
}

fn reject(syscall: Syscall, errno: i32) -> ProxyReply {
    ProxyReply::failed(syscall, errno)
}

/// Execute one call against `provider` and build the reply.
///
/// Never panics on hostile input: unknown symbolic constants and malformed
/// buffers are answered with an errno like the kernel would.
pub fn dispatch(provider: &dyn TransportProvider, call: &ProxyCall) -> ProxyReply {
    let syscall = call.syscall;
    let fd = Descriptor::from_raw(call.fd);
    let [a0, a1, a2] = call.args;

    let outcome: Outcome = match syscall {
        Syscall::Socket => {
            let Some(domain) = Domain::from_raw(a0) else {
                return reject(syscall, libc::EAFNOSUPPORT);
            };
            let Some(ty) = SockType::from_raw(a1) else {
                return reject(syscall, libc::EINVAL);
            };
            provider
                .socket(domain, ty, a2)
                .map(|fd| (fd.raw(), Bytes::new()))
        }
        Syscall::SetSockOpt => {
            let (Some(level), Some(name)) = (Level::from_raw(a0), OptName::from_raw(a1)) else {
                return reject(syscall, libc::ENOPROTOOPT);
            };
            provider.setsockopt(fd, level, name, &call.data).map(done)
        }
        Syscall::Bind => {
            let Some(addr) = decode_sockaddr(&call.data) else {
                return reject(syscall, libc::EINVAL);
            };
            provider.bind(fd, addr).map(done)
        }
        Syscall::Listen => provider.listen(fd, a0).map(done),
        Syscall::Accept => provider.accept(fd).map(|(conn, peer)| {
            // Only hand back an address if the caller offered room for one.
            let data = match peer {
                Some(peer) if a0 >= SOCKADDR_IN_LEN as i32 => {
                    Bytes::copy_from_slice(&encode_sockaddr(peer))
                }
                _ => Bytes::new(),
            };
            (conn.raw(), data)
        }),
        Syscall::Connect => {
            let Some(addr) = decode_sockaddr(&call.data) else {
                return reject(syscall, libc::EINVAL);
            };
            provider.connect(fd, addr).map(done)
        }
        Syscall::Close => provider.close(fd).map(done),
        Syscall::Send => provider
            .send(fd, &call.data)
            .map(|n| (n as i64, Bytes::new())),
        Syscall::Recv => {
            let Ok(capacity) = usize::try_from(a0) else {
                return reject(syscall, libc::EINVAL);
            };
            let mut buf = vec![0u8; capacity.min(MAX_IO_CHUNK)];
            provider.recv(fd, &mut buf).map(|n| {
                buf.truncate(n);
                (n as i64, Bytes::from(buf))
            })
        }
        Syscall::GetSockName => provider
            .getsockname(fd)
            .map(|addr| (0, Bytes::copy_from_slice(&encode_sockaddr(addr)))),
    };

    match outcome {
        Ok((ret, data)) => ProxyReply::ok(syscall, ret, data),
        Err(err) => {
            tracing::debug!(%syscall, fd = call.fd, error = %err, "host syscall failed");
            ProxyReply::failed(syscall, err.native_errno().unwrap_or(libc::EIO))
        }
    }
}

/// Serve proxy calls arriving on `stream` until the isolated side hangs up.
///
/// Calls are handled strictly one at a time; each runs on the blocking pool
/// because the provider's syscalls block.
pub async fn serve<S>(mut stream: S, provider: Arc<dyn TransportProvider>) -> Result<(), FrameError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut codec = BridgeCodec::new();
    let mut read_buf = BytesMut::with_capacity(4096);
    let mut write_buf = BytesMut::with_capacity(4096);

    loop {
        let packet = loop {
            if let Some(packet) = codec.decode(&mut read_buf)? {
                break packet;
            }
            if stream.read_buf(&mut read_buf).await? == 0 {
                if read_buf.is_empty() {
                    tracing::debug!("isolated side closed the bridge");
                    return Ok(());
                }
                return Err(FrameError::Malformed("bridge closed mid-packet"));
            }
        };

        let Packet::Call { seq, call } = packet else {
            return Err(FrameError::Malformed("reply received on the host side"));
        };
        let syscall = call.syscall;
        let worker = Arc::clone(&provider);
        let reply = tokio::task::spawn_blocking(move || dispatch(worker.as_ref(), &call))
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(%syscall, error = %e, "dispatch task failed");
                ProxyReply::failed(syscall, libc::EIO)
            });
        tracing::trace!(%syscall, seq, ret = reply.ret, errno = reply.errno, "proxy reply");

        write_buf.clear();
        codec.encode(Packet::Reply { seq, reply }, &mut write_buf)?;
        stream.write_all(&write_buf).await?;
        stream.flush().await?;
    }
}

/// An untrusted host serving one isolated peer on a private runtime.
///
/// Dropping the host stops the serve loop; the isolated side then sees
/// boundary faults on every further call.
pub struct Host {
    runtime: Option<Runtime>,
    task: tokio::task::JoinHandle<Result<(), FrameError>>,
}

impl Host {
    /// Start a host over `provider` and return the isolated side's transport.
    pub fn launch(
        provider: Arc<dyn TransportProvider>,
    ) -> io::Result<(Self, ProxiedTransport<StdUnixStream>)> {
        let (isolated, host_side) = StdUnixStream::pair()?;
        host_side.set_nonblocking(true)?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("bridge-host")
            .enable_io()
            .build()?;
        let stream = {
            let _guard = runtime.enter();
            tokio::net::UnixStream::from_std(host_side)?
        };
        let task = runtime.spawn(async move {
            let result = serve(stream, provider).await;
            if let Err(e) = &result {
                tracing::warn!(error = %e, "bridge host stopped");
            }
            result
        });
        tracing::debug!("bridge host launched");

        Ok((
            Self {
                runtime: Some(runtime),
                task,
            },
            ProxiedTransport::new(isolated),
        ))
    }

    /// True once the serve loop has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            // A blocked accept or recv on the pool must not hold up the caller.
            runtime.shutdown_background();
        }
    }
}
