//! Sample echo server and client driving [`Session`](crate::Session).

pub mod client;
pub mod server;

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use sha2::{Digest, Sha256};

use crate::attestation::attester_by_name;
use crate::session::{LogLevel, Role, SessionConfigBuilder};

pub const DEFAULT_IP: Ipv4Addr = Ipv4Addr::LOCALHOST;
pub const DEFAULT_PORT: u16 = 1234;

/// Receive buffer size on both ends. One byte is kept in reserve, so at most
/// `ECHO_BUFFER - 1` bytes are echoed.
pub const ECHO_BUFFER: usize = 256;

/// Message the client sends and expects back.
pub const GREETING: &str = "\x1b[94mHello and welcome to attested-link!\x1b[0m\n";

/// Echo command understood by a verdictd-style peer. The reply is the
/// bare [`GREETING`].
pub const VERDICTD_REQUEST: &str =
    "{ \"command\": \"echo\", \"data\": \"Hello and welcome to attested-link!\\n\" }";

/// Claims the sample server attaches to its evidence.
pub const DEMO_CLAIMS: [(&str, &[u8]); 2] = [("key_0", b"value_0"), ("key_1", b"value_1")];

/// Backend selection shared by both sample programs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Backends {
    pub attester: String,
    pub verifier: String,
    pub tls: String,
    pub crypto: String,
    pub mutual: bool,
    pub endorsements: bool,
    pub log_level: LogLevel,
}

impl Backends {
    /// A config builder pre-filled with these backends.
    pub fn builder(&self, role: Role) -> SessionConfigBuilder {
        crate::SessionConfig::builder(role)
            .attester_type(&self.attester)
            .verifier_type(&self.verifier)
            .tls_type(&self.tls)
            .crypto_type(&self.crypto)
            .mutual(self.mutual)
            .provide_endorsements(self.endorsements)
            .log_level(self.log_level)
    }
}

/// Bytes of identity prefixed to an identity-reporting reply.
pub const IDENTITY_LEN: usize = 64;

/// Platform identity a server can put in front of its reply: an enclave
/// measurement and the identity of its signer, 32 bytes each.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub measurement: [u8; 32],
    pub signer: [u8; 32],
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("measurement", &hex::encode(self.measurement))
            .field("signer", &hex::encode(self.signer))
            .finish()
    }
}

impl Identity {
    /// Identity of the named attester backend. Backends here have no
    /// hardware report, so both values are digests of the resolved name.
    pub fn for_attester(name: &str) -> Self {
        let resolved = attester_by_name(name).map_or(name, |a| a.name());
        let digest = |label: &[u8]| -> [u8; 32] {
            let mut hasher = Sha256::new();
            hasher.update(label);
            hasher.update(resolved.as_bytes());
            hasher.finalize().into()
        };
        Self {
            measurement: digest(b"attested-link measurement"),
            signer: digest(b"attested-link signer"),
        }
    }

    /// `measurement || signer || message`.
    pub fn prefix(&self, message: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(IDENTITY_LEN + message.len());
        out.extend_from_slice(&self.measurement);
        out.extend_from_slice(&self.signer);
        out.extend_from_slice(message);
        out
    }

    /// Split a reply of at least [`IDENTITY_LEN`] bytes into identity and
    /// message. Shorter replies carry no identity.
    pub fn split(reply: &[u8]) -> Option<(Self, &[u8])> {
        if reply.len() < IDENTITY_LEN {
            return None;
        }
        let (measurement, rest) = reply.split_at(32);
        let (signer, message) = rest.split_at(32);
        Some((
            Self {
                measurement: measurement.try_into().ok()?,
                signer: signer.try_into().ok()?,
            },
            message,
        ))
    }
}

pub fn default_addr() -> SocketAddrV4 {
    SocketAddrV4::new(DEFAULT_IP, DEFAULT_PORT)
}

/// Clamp a received count so one byte of the buffer stays free.
pub(crate) fn clamp_received(n: usize) -> usize {
    n.min(ECHO_BUFFER - 1)
}
