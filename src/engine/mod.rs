//! In-tree attested-channel library.
//!
//! Implements [`ChannelLibrary`] with the backends named in
//! [`SessionConfig`]: evidence from [`crate::attestation`], X25519 key
//! agreement and ChaCha20-Poly1305 records from [`crate::crypto`], framing
//! from [`crate::frame`]. All socket I/O goes through the
//! [`TransportProvider`] handed to `negotiate`, so the same engine runs
//! natively or behind the syscall bridge.

/// Emit a tracing event only if the handle's own level allows it.
macro_rules! gated {
    ($filter:expr, $level:ident, $($arg:tt)+) => {
        if tracing::Level::$level <= $filter {
            tracing::event!(tracing::Level::$level, $($arg)+);
        }
    };
}

mod handshake;
mod wire;

use std::sync::Arc;

use bytes::{Buf, Bytes};
use tracing::level_filters::LevelFilter;

use crate::attestation::claims::{Claim, VerifyCallback};
use crate::attestation::{attester_by_name, verifier_by_name, Attester, Verifier};
use crate::crypto::seal::{Opener, Sealer};
use crate::crypto::{KeyAgreement, RecordCipher};
use crate::error::{code, LibError};
use crate::frame::{Flags, Frame, FrameType};
use crate::library::{AttestedChannel, ChannelLibrary};
use crate::session::{Role, SessionConfig};
use crate::transport::{Descriptor, TransportProvider};
use handshake::{Local, Negotiated};
use wire::Wire;

/// Largest plaintext carried by one record (16 KiB).
pub const MAX_RECORD_SIZE: usize = 16 * 1024;

/// The in-tree [`ChannelLibrary`].
#[derive(Debug, Default, Clone, Copy)]
pub struct Engine;

impl Engine {
    pub fn new() -> Self {
        Self
    }
}

fn unknown(kind: &str, name: &str) -> LibError {
    LibError::new(code::UNKNOWN_BACKEND, format!("unknown {kind} backend {name:?}"))
}

impl ChannelLibrary for Engine {
    fn init(&self, config: &SessionConfig) -> Result<Box<dyn AttestedChannel>, LibError> {
        KeyAgreement::from_name(config.tls_type()).ok_or_else(|| unknown("tls", config.tls_type()))?;
        RecordCipher::from_name(config.crypto_type())
            .ok_or_else(|| unknown("crypto", config.crypto_type()))?;
        let attester = attester_by_name(config.attester_type())
            .ok_or_else(|| unknown("attester", config.attester_type()))?;
        let verifier = verifier_by_name(config.verifier_type())
            .ok_or_else(|| unknown("verifier", config.verifier_type()))?;

        let role = config.role();
        let mutual = config.mutual();
        let filter = config.log_level().filter();

        gated!(
            filter,
            DEBUG,
            %role,
            attester = attester.name(),
            verifier = verifier.name(),
            mutual,
            endorsements = config.provide_endorsements(),
            cert_algo = ?config.cert_algo(),
            "attested channel initialized"
        );

        Ok(Box::new(EngineChannel {
            role,
            attester: (role == Role::Server || mutual).then_some(attester),
            verifier: (role == Role::Client || mutual).then_some(verifier),
            claims: config.custom_claims().to_vec(),
            endorsements: config.provide_endorsements(),
            mutual,
            filter,
            callback: None,
            conn: None,
            cleaned_up: false,
        }))
    }
}

/// Per-connection record state.
struct Connection {
    wire: Wire,
    sealer: Sealer,
    opener: Opener,
    /// Plaintext received but not yet handed out.
    pending: Bytes,
    peer_closed: bool,
}

/// A handle produced by [`Engine::init`].
pub struct EngineChannel {
    role: Role,
    attester: Option<Box<dyn Attester>>,
    verifier: Option<Box<dyn Verifier>>,
    claims: Vec<Claim>,
    endorsements: bool,
    mutual: bool,
    filter: LevelFilter,
    callback: Option<VerifyCallback>,
    conn: Option<Connection>,
    cleaned_up: bool,
}

impl EngineChannel {
    fn ensure_live(&self) -> Result<(), LibError> {
        if self.cleaned_up {
            return Err(LibError::new(code::INVALID_STATE, "handle already cleaned up"));
        }
        Ok(())
    }

    fn connection(&mut self) -> Result<&mut Connection, LibError> {
        self.ensure_live()?;
        self.conn
            .as_mut()
            .ok_or_else(|| LibError::new(code::INVALID_STATE, "channel not negotiated"))
    }
}

impl AttestedChannel for EngineChannel {
    fn set_verification_callback(
        &mut self,
        callback: Option<VerifyCallback>,
    ) -> Result<(), LibError> {
        self.ensure_live()?;
        self.callback = callback;
        Ok(())
    }

    fn negotiate(&mut self, io: Arc<dyn TransportProvider>, fd: Descriptor) -> Result<(), LibError> {
        self.ensure_live()?;
        // A new negotiation replaces whatever connection came before.
        self.conn = None;

        let mut wire = Wire::new(io, fd);
        let local = Local {
            attester: self.attester.as_deref(),
            verifier: self.verifier.as_deref(),
            claims: &self.claims,
            endorsements: self.endorsements,
            mutual: self.mutual,
            filter: self.filter,
        };
        let result = match self.role {
            Role::Client => handshake::initiate(&mut wire, &local, &mut self.callback),
            Role::Server => handshake::respond(&mut wire, &local, &mut self.callback),
        };
        let Negotiated { keys, peer } = match result {
            Ok(n) => n,
            Err(e) => {
                gated!(self.filter, WARN, fd = %wire.fd(), error = %e, "negotiation failed");
                return Err(e);
            }
        };

        gated!(
            self.filter,
            INFO,
            fd = %wire.fd(),
            peer_attester = peer.as_ref().map_or("", |p| p.attester.as_str()),
            session_id = hex::encode(&keys.session_id[..8]),
            "attested channel established"
        );

        self.conn = Some(Connection {
            sealer: Sealer::new(&keys.send, keys.session_id),
            opener: Opener::new(&keys.recv, keys.session_id),
            wire,
            pending: Bytes::new(),
            peer_closed: false,
        });
        Ok(())
    }

    fn transmit(&mut self, buf: &[u8]) -> Result<usize, LibError> {
        let conn = self.connection()?;
        if buf.is_empty() {
            return Ok(0);
        }
        let n = buf.len().min(MAX_RECORD_SIZE);
        let (ciphertext, seq) =
            conn.sealer
                .seal(&buf[..n], FrameType::Data as u8, Flags::ENCRYPTED)?;
        conn.wire.send_frame(Frame::data(seq, Bytes::from(ciphertext)))?;
        Ok(n)
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, LibError> {
        let filter = self.filter;
        let conn = self.connection()?;
        if buf.is_empty() {
            return Ok(0);
        }

        while conn.pending.is_empty() {
            if conn.peer_closed {
                return Ok(0);
            }
            let frame = conn.wire.recv_frame()?;
            match frame.header.msg_type {
                FrameType::Data => {
                    if !frame.header.flags.is_encrypted() {
                        return Err(LibError::new(code::PROTOCOL, "unencrypted data record"));
                    }
                    let plaintext = conn.opener.open(
                        &frame.payload,
                        frame.header.sequence,
                        FrameType::Data as u8,
                        frame.header.flags.raw(),
                    )?;
                    conn.pending = Bytes::from(plaintext);
                }
                FrameType::Shutdown => {
                    gated!(filter, DEBUG, "peer sent shutdown");
                    conn.peer_closed = true;
                }
                FrameType::Error => {
                    return Err(LibError::new(
                        code::PEER_ABORTED,
                        format!("peer aborted: {}", String::from_utf8_lossy(&frame.payload)),
                    ));
                }
                FrameType::Hello => {
                    return Err(LibError::new(
                        code::PROTOCOL,
                        "handshake message after negotiation",
                    ));
                }
            }
        }

        let n = buf.len().min(conn.pending.len());
        buf[..n].copy_from_slice(&conn.pending[..n]);
        conn.pending.advance(n);
        Ok(n)
    }

    fn cleanup(&mut self) -> Result<(), LibError> {
        self.ensure_live()?;
        self.cleaned_up = true;
        self.callback = None;

        if let Some(mut conn) = self.conn.take() {
            if !conn.peer_closed {
                if let Err(e) = conn.wire.send_frame(Frame::shutdown(0)) {
                    gated!(self.filter, DEBUG, error = %e, "shutdown notice not delivered");
                }
            }
        }
        gated!(self.filter, DEBUG, role = %self.role, "attested channel cleaned up");
        Ok(())
    }
}
