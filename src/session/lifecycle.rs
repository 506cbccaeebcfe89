use std::fmt;
use std::net::SocketAddrV4;
use std::sync::Arc;

use crate::attestation::claims::VerifyCallback;
use crate::error::{ChannelError, Error, Result, SessionError};
use crate::library::{AttestedChannel, ChannelLibrary};
use crate::transport::{
    int_value, Descriptor, Domain, Level, OptName, SockType, TransportProvider, DEFAULT_PROTOCOL,
};

pub use crate::transport::KeepAlive;

use super::{Role, SessionConfig};

/// Backlog used by the sample server.
pub const DEFAULT_BACKLOG: i32 = 5;

/// Lifecycle state of a [`Session`].
///
/// There is no "unconfigured" value: a `Session` only exists once
/// [`Session::init`] has succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Initialized,
    Listening,
    ReadyToConnect,
    Negotiating,
    Established,
    Closed,
    Failed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initialized => "initialized",
            Self::Listening => "listening",
            Self::ReadyToConnect => "ready-to-connect",
            Self::Negotiating => "negotiating",
            Self::Established => "established",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One attested session: an attested-channel handle plus the sockets it runs
/// over.
///
/// Operations are blocking and must not overlap. The library handle is
/// cleaned up exactly once: by [`cleanup`](Self::cleanup),
/// [`fail_with`](Self::fail_with), [`scoped`](Self::scoped), or, failing
/// all of those, on drop.
pub struct Session {
    state: State,
    config: SessionConfig,
    transport: Arc<dyn TransportProvider>,
    channel: Option<Box<dyn AttestedChannel>>,
    listener: Option<Descriptor>,
    conn: Option<Descriptor>,
    keepalive: KeepAlive,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("role", &self.config.role())
            .field("listener", &self.listener)
            .field("conn", &self.conn)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Allocate the library handle for `config`.
    pub fn init(
        config: SessionConfig,
        library: &dyn ChannelLibrary,
        transport: Arc<dyn TransportProvider>,
    ) -> Result<Self> {
        let channel = library.init(&config).map_err(ChannelError::Init)?;
        tracing::info!(
            role = %config.role(),
            attester = config.attester_type(),
            verifier = config.verifier_type(),
            mutual = config.mutual(),
            "session initialized"
        );
        Ok(Self {
            state: State::Initialized,
            config,
            transport,
            channel: Some(channel),
            listener: None,
            conn: None,
            keepalive: KeepAlive::default(),
        })
    }

    /// Run `body` on a fresh session and always clean it up afterwards.
    ///
    /// An error from `body` is returned in preference to a cleanup error.
    pub fn scoped<T, F>(
        config: SessionConfig,
        library: &dyn ChannelLibrary,
        transport: Arc<dyn TransportProvider>,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce(&mut Session) -> Result<T>,
    {
        let mut session = Self::init(config, library, transport)?;
        let outcome = body(&mut session);
        let closed = if session.state == State::Closed {
            Ok(())
        } else {
            session.cleanup()
        };
        match (outcome, closed) {
            (Ok(v), Ok(())) => Ok(v),
            (Err(e), Ok(())) | (Ok(_), Err(e)) => Err(e),
            (Err(e), Err(cleanup)) => {
                tracing::warn!(error = %cleanup, "cleanup failed after earlier error");
                Err(e)
            }
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Override the keep-alive settings applied by
    /// [`bind_and_listen`](Self::bind_and_listen).
    pub fn with_keepalive(mut self, keepalive: KeepAlive) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// Address the listening socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddrV4> {
        let listener = self.listener.ok_or(SessionError::InvalidState {
            op: "local_addr",
            state: self.state,
        })?;
        Ok(self.transport.getsockname(listener)?)
    }

    /// Install or clear the callback consulted with the peer's claims during
    /// [`negotiate`](Self::negotiate).
    pub fn set_verification_callback(&mut self, callback: Option<VerifyCallback>) -> Result<()> {
        self.require_any(
            "set_verification_callback",
            &[
                State::Initialized,
                State::Listening,
                State::ReadyToConnect,
                State::Negotiating,
                State::Established,
            ],
        )?;
        let state = self.state;
        let result = self
            .channel_mut("set_verification_callback")
            .and_then(|ch| {
                ch.set_verification_callback(callback)
                    .map_err(|e| ChannelError::Callback(e).into())
            });
        self.settle(result, state)
    }

    /// Open the listening socket: create, set address reuse and keep-alive,
    /// bind, listen. Server sessions only.
    pub fn bind_and_listen(&mut self, addr: SocketAddrV4, backlog: i32) -> Result<()> {
        self.require_role("bind_and_listen", Role::Server)?;
        self.require_any("bind_and_listen", &[State::Initialized])?;
        let result = self.open_listener(addr, backlog);
        self.settle(result, State::Listening)?;
        tracing::info!(%addr, backlog, "listening");
        Ok(())
    }

    fn open_listener(&mut self, addr: SocketAddrV4, backlog: i32) -> Result<()> {
        let io = Arc::clone(&self.transport);
        let fd = io.socket(Domain::Inet, SockType::Stream, DEFAULT_PROTOCOL)?;
        // Owned from here on so cleanup closes it even if a later step fails.
        self.listener = Some(fd);
        io.setsockopt(fd, Level::Socket, OptName::ReuseAddr, &int_value(1))?;
        self.keepalive.apply(io.as_ref(), fd)?;
        io.bind(fd, addr)?;
        io.listen(fd, backlog)?;
        Ok(())
    }

    /// Block until a client connects. Returns the peer address when the
    /// transport could report one.
    pub fn accept_one(&mut self) -> Result<Option<SocketAddrV4>> {
        self.require_role("accept_one", Role::Server)?;
        self.require_any("accept_one", &[State::Listening])?;
        let listener = self.listener.ok_or(SessionError::InvalidState {
            op: "accept_one",
            state: self.state,
        })?;

        let result = self.transport.accept(listener).map_err(Error::from);
        let (fd, peer) = self.settle(result, State::Negotiating)?;
        self.conn = Some(fd);
        match peer {
            Some(peer) => tracing::info!(%peer, %fd, "accepted connection"),
            None => tracing::info!(%fd, "accepted connection from unknown address"),
        }
        Ok(peer)
    }

    /// Connect to `addr`. Client sessions only.
    pub fn connect(&mut self, addr: SocketAddrV4) -> Result<()> {
        self.require_role("connect", Role::Client)?;
        self.require_any("connect", &[State::Initialized])?;

        let result = self
            .transport
            .socket(Domain::Inet, SockType::Stream, DEFAULT_PROTOCOL)
            .map_err(Error::from);
        let fd = self.settle(result, State::ReadyToConnect)?;
        self.conn = Some(fd);

        let result = self.transport.connect(fd, addr).map_err(Error::from);
        self.settle(result, State::Negotiating)?;
        tracing::info!(%addr, %fd, "connected");
        Ok(())
    }

    /// Run the attested handshake on the current connection.
    pub fn negotiate(&mut self) -> Result<()> {
        self.require_any("negotiate", &[State::Negotiating])?;
        let fd = self.conn.ok_or(SessionError::InvalidState {
            op: "negotiate",
            state: self.state,
        })?;
        let io = Arc::clone(&self.transport);
        let result = self.channel_mut("negotiate").and_then(|ch| {
            ch.negotiate(io, fd)
                .map_err(|e| ChannelError::Negotiate(e).into())
        });
        self.settle(result, State::Established)
    }

    /// Send up to `buf.len()` bytes; returns the count actually sent.
    pub fn transmit(&mut self, buf: &[u8]) -> Result<usize> {
        self.require_established()?;
        let result = self.channel_mut("transmit").and_then(|ch| {
            ch.transmit(buf)
                .map_err(|e| ChannelError::Transmit(e).into())
        });
        self.settle(result, State::Established)
    }

    /// Receive up to `buf.len()` bytes; returns the count received. The
    /// bytes are not terminated in any way.
    pub fn receive(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.require_established()?;
        let result = self.channel_mut("receive").and_then(|ch| {
            ch.receive(buf)
                .map_err(|e| ChannelError::Receive(e).into())
        });
        self.settle(result, State::Established)
    }

    /// Close the current connection and return to listening.
    pub fn end_connection(&mut self) -> Result<()> {
        self.require_role("end_connection", Role::Server)?;
        self.require_any("end_connection", &[State::Established])?;
        let result = match self.conn.take() {
            Some(fd) => self.transport.close(fd).map_err(Error::from),
            None => Ok(()),
        };
        self.settle(result, State::Listening)
    }

    /// Release the library handle, then close any sockets.
    ///
    /// Valid once, from any state but `Closed`. The library's error is
    /// returned; socket close errors are only logged.
    pub fn cleanup(&mut self) -> Result<()> {
        if self.state == State::Closed {
            return Err(SessionError::InvalidState {
                op: "cleanup",
                state: self.state,
            }
            .into());
        }

        let released = match self.channel.take() {
            Some(mut channel) => channel.cleanup().map_err(ChannelError::Cleanup),
            None => Ok(()),
        };
        for fd in [self.conn.take(), self.listener.take()].into_iter().flatten() {
            if let Err(e) = self.transport.close(fd) {
                tracing::warn!(%fd, error = %e, "close failed during cleanup");
            }
        }

        let from = self.state;
        self.state = State::Closed;
        tracing::debug!(%from, "session closed");
        released.map_err(Error::from)
    }

    /// Clean up after a failure and hand back the failure.
    ///
    /// A cleanup error is logged and dropped so it cannot mask `err`.
    pub fn fail_with(&mut self, err: Error) -> Error {
        if self.state != State::Closed {
            if let Err(cleanup) = self.cleanup() {
                tracing::warn!(error = %cleanup, original = %err, "cleanup failed while handling error");
            }
        }
        err
    }

    fn channel_mut(&mut self, op: &'static str) -> Result<&mut Box<dyn AttestedChannel>> {
        let state = self.state;
        self.channel
            .as_mut()
            .ok_or_else(|| SessionError::InvalidState { op, state }.into())
    }

    fn require_role(&self, op: &'static str, role: Role) -> Result<()> {
        if self.config.role() != role {
            return Err(SessionError::WrongRole {
                op,
                role: self.config.role(),
            }
            .into());
        }
        Ok(())
    }

    fn require_any(&self, op: &'static str, allowed: &[State]) -> Result<()> {
        if !allowed.contains(&self.state) {
            return Err(SessionError::InvalidState {
                op,
                state: self.state,
            }
            .into());
        }
        Ok(())
    }

    fn require_established(&self) -> Result<()> {
        if self.state != State::Established {
            return Err(SessionError::NotEstablished.into());
        }
        Ok(())
    }

    /// Move to `next` on success, to `Failed` on error.
    fn settle<T>(&mut self, result: Result<T>, next: State) -> Result<T> {
        match result {
            Ok(v) => {
                if self.state != next {
                    tracing::debug!(from = %self.state, to = %next, "session state");
                    self.state = next;
                }
                Ok(v)
            }
            Err(e) => {
                tracing::warn!(state = %self.state, error = %e, "session failed");
                self.state = State::Failed;
                Err(e)
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state != State::Closed {
            tracing::debug!(state = %self.state, "session dropped without cleanup");
            if let Err(e) = self.cleanup() {
                tracing::warn!(error = %e, "cleanup on drop failed");
            }
        }
    }
}
