use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Instant;

use super::{clamp_received, Backends, Identity, DEMO_CLAIMS, ECHO_BUFFER, GREETING};
use crate::error::Result;
use crate::library::ChannelLibrary;
use crate::session::lifecycle::{Session, DEFAULT_BACKLOG};
use crate::session::Role;
use crate::transport::TransportProvider;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub addr: SocketAddrV4,
    pub backends: Backends,
    /// Stop after this many connections. `None` serves until a failure.
    pub max_connections: Option<usize>,
    /// Answer every client with the attester's identity followed by the
    /// greeting instead of echoing.
    pub report_identity: bool,
}

/// Echo server: one connection at a time, each negotiated, echoed once and
/// closed. With `report_identity` the reply is `measurement || signer ||
/// greeting`.
///
/// The first failing connection ends the server.
#[derive(Debug)]
pub struct Server {
    session: Session,
    max_connections: Option<usize>,
    identity: Option<Identity>,
}

impl Server {
    /// Initialize the session and start listening.
    pub fn bind(
        options: &ServerOptions,
        library: &dyn ChannelLibrary,
        transport: Arc<dyn TransportProvider>,
    ) -> Result<Self> {
        let config = DEMO_CLAIMS
            .iter()
            .fold(options.backends.builder(Role::Server), |b, (name, value)| {
                b.claim(name, value)
            })
            .build()?;

        let identity = options
            .report_identity
            .then(|| Identity::for_attester(config.attester_type()));

        let started = Instant::now();
        let mut session = Session::init(config, library, transport)?;
        tracing::debug!(elapsed = ?started.elapsed(), "init done");
        if let Err(e) = session.bind_and_listen(options.addr, DEFAULT_BACKLOG) {
            return Err(session.fail_with(e));
        }
        if let Some(identity) = &identity {
            tracing::info!(?identity, "reporting identity");
        }
        Ok(Self {
            session,
            max_connections: options.max_connections,
            identity,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddrV4> {
        self.session.local_addr()
    }

    /// Serve connections; returns how many completed.
    pub fn serve(mut self) -> Result<usize> {
        let mut served = 0;
        while self.max_connections.map_or(true, |max| served < max) {
            if let Err(e) = self.handle_connection() {
                tracing::error!(error = %e, served, "connection failed; shutting down");
                return Err(self.session.fail_with(e));
            }
            served += 1;
        }
        self.session.cleanup()?;
        tracing::info!(served, "server finished");
        Ok(served)
    }

    fn handle_connection(&mut self) -> Result<()> {
        let accepting = Instant::now();
        self.session.accept_one()?;
        tracing::debug!(elapsed = ?accepting.elapsed(), "accept done");

        let negotiating = Instant::now();
        self.session.negotiate()?;
        tracing::debug!(elapsed = ?negotiating.elapsed(), "negotiate done");

        let receiving = Instant::now();
        let mut buf = [0u8; ECHO_BUFFER];
        let n = clamp_received(self.session.receive(&mut buf)?);
        tracing::debug!(elapsed = ?receiving.elapsed(), len = n, "receive done");
        tracing::info!(
            len = n,
            message = %String::from_utf8_lossy(&buf[..n]),
            "client message"
        );

        let prefixed;
        let reply = match &self.identity {
            Some(identity) => {
                prefixed = identity.prefix(GREETING.as_bytes());
                &prefixed[..]
            }
            None => &buf[..n],
        };

        let transmitting = Instant::now();
        let sent = self.session.transmit(reply)?;
        tracing::debug!(elapsed = ?transmitting.elapsed(), len = sent, "transmit done");
        if sent != reply.len() {
            tracing::warn!(requested = reply.len(), sent, "reply truncated");
        }
        self.session.end_connection()
    }
}
