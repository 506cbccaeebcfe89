use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Instant;

use super::{clamp_received, Backends, Identity, ECHO_BUFFER, GREETING, VERDICTD_REQUEST};
use crate::attestation::claims::logging_callback;
use crate::error::{Result, SessionError};
use crate::library::ChannelLibrary;
use crate::session::lifecycle::Session;
use crate::session::Role;
use crate::transport::TransportProvider;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub addr: SocketAddrV4,
    pub backends: Backends,
    /// Send a verdictd echo command instead of the bare greeting.
    pub verdictd: bool,
}

/// What the server sent back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Present when the reply was long enough to carry an identity prefix.
    pub identity: Option<Identity>,
    pub message: Vec<u8>,
}

/// Connect, negotiate, send the greeting and require it echoed back.
///
/// A reply of at least [`IDENTITY_LEN`](super::IDENTITY_LEN) bytes is taken to
/// start with the server's identity, which is logged and stripped before the
/// echo is checked.
pub fn run(
    options: &ClientOptions,
    library: &dyn ChannelLibrary,
    transport: Arc<dyn TransportProvider>,
) -> Result<Reply> {
    let config = options.backends.builder(Role::Client).build()?;
    let request = if options.verdictd {
        VERDICTD_REQUEST
    } else {
        GREETING
    };

    let started = Instant::now();
    Session::scoped(config, library, transport, |session| {
        tracing::debug!(elapsed = ?started.elapsed(), "init done");
        session.set_verification_callback(Some(logging_callback()))?;
        session.connect(options.addr)?;

        let negotiating = Instant::now();
        session.negotiate()?;
        tracing::debug!(elapsed = ?negotiating.elapsed(), "negotiate done");

        let round_trip = Instant::now();
        let sent = session.transmit(request.as_bytes())?;
        if sent != request.len() {
            return Err(SessionError::ShortTransmit {
                requested: request.len(),
                sent,
            }
            .into());
        }

        let mut buf = [0u8; ECHO_BUFFER];
        let n = clamp_received(session.receive(&mut buf)?);
        tracing::debug!(elapsed = ?round_trip.elapsed(), len = n, "round trip done");

        let (identity, message) = match Identity::split(&buf[..n]) {
            Some((identity, message)) => {
                tracing::info!(
                    measurement = %hex::encode(identity.measurement),
                    signer = %hex::encode(identity.signer),
                    "server identity"
                );
                (Some(identity), message)
            }
            None => (None, &buf[..n]),
        };
        tracing::info!(message = %String::from_utf8_lossy(message), "server reply");

        let expected = if options.verdictd { GREETING } else { request };
        if message != expected.as_bytes() {
            return Err(SessionError::ResponseMismatch {
                sent: expected.len(),
                received: message.len(),
            }
            .into());
        }
        Ok(Reply {
            identity,
            message: message.to_vec(),
        })
    })
}
