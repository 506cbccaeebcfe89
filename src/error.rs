use std::io;

use crate::proxy::Syscall;
use crate::session::lifecycle::State;
use crate::session::Role;

/// Errors from building a [`SessionConfig`](crate::SessionConfig).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} is {len} bytes long (max {max})")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("unknown log level: {0:?}")]
    UnknownLogLevel(String),
}

/// What went wrong with a socket syscall.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Fault {
    /// The request/response exchange across the trust boundary itself failed.
    #[error("bridge fault: {0}")]
    Boundary(String),

    /// The host executed the syscall and it returned an error.
    #[error("errno {0}")]
    Errno(i32),
}

/// A failed socket syscall, native or proxied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{stage} failed: {fault}")]
pub struct ProxyError {
    pub stage: Syscall,
    pub fault: Fault,
}

impl ProxyError {
    pub fn errno(stage: Syscall, errno: i32) -> Self {
        Self {
            stage,
            fault: Fault::Errno(errno),
        }
    }

    pub fn boundary(stage: Syscall, reason: impl Into<String>) -> Self {
        Self {
            stage,
            fault: Fault::Boundary(reason.into()),
        }
    }

    /// The host's errno, if the syscall itself failed.
    pub fn native_errno(&self) -> Option<i32> {
        match self.fault {
            Fault::Errno(errno) => Some(errno),
            Fault::Boundary(_) => None,
        }
    }
}

/// Error codes reported by the attested channel library.
pub mod code {
    pub const INVALID_ARGUMENT: u32 = 0x0001;
    pub const UNKNOWN_BACKEND: u32 = 0x0002;
    pub const INVALID_STATE: u32 = 0x0003;
    pub const HANDSHAKE: u32 = 0x0100;
    pub const VERIFY_REJECTED: u32 = 0x0101;
    pub const EVIDENCE: u32 = 0x0102;
    pub const PEER_ABORTED: u32 = 0x0103;
    pub const TRANSPORT: u32 = 0x0200;
    pub const PEER_CLOSED: u32 = 0x0201;
    pub const CRYPTO: u32 = 0x0300;
    pub const PROTOCOL: u32 = 0x0400;
}

/// Opaque error from the attested channel library, surfaced unchanged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason} (code {code:#06x})")]
pub struct LibError {
    pub code: u32,
    pub reason: String,
}

impl LibError {
    pub fn new(code: u32, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// A library call failed; the variant names the call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("attested channel init failed: {0}")]
    Init(LibError),

    #[error("failed to set verification callback: {0}")]
    Callback(LibError),

    #[error("negotiate failed: {0}")]
    Negotiate(LibError),

    #[error("transmit failed: {0}")]
    Transmit(LibError),

    #[error("receive failed: {0}")]
    Receive(LibError),

    #[error("cleanup failed: {0}")]
    Cleanup(LibError),
}

impl ChannelError {
    pub fn code(&self) -> u32 {
        match self {
            Self::Init(e)
            | Self::Callback(e)
            | Self::Negotiate(e)
            | Self::Transmit(e)
            | Self::Receive(e)
            | Self::Cleanup(e) => e.code,
        }
    }
}

/// Errors from frame parsing and encoding (record layer and proxy bridge).
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid magic bytes: expected 0x{expected:04X}, got 0x{actual:04X}")]
    InvalidMagic { expected: u16, actual: u16 },

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    #[error("unknown syscall id: {0}")]
    UnknownSyscall(u8),

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: u32, max: u32 },

    #[error("malformed payload: {0}")]
    Malformed(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors from cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("HKDF expand failed: invalid length")]
    HkdfExpandFailed,

    #[error("AEAD encryption failed")]
    SealFailed,

    #[error("AEAD decryption failed: ciphertext is invalid or tampered")]
    OpenFailed,

    #[error("nonce overflow: maximum sequence number reached")]
    NonceOverflow,

    #[error("sequence number replay: received {received}, expected > {expected}")]
    SequenceReplay { received: u64, expected: u64 },

    #[error("non-contributory key exchange: peer sent small-subgroup or identity point")]
    NonContributoryKey,
}

/// Errors from producing or checking evidence.
#[derive(Debug, thiserror::Error)]
pub enum AttestError {
    #[error("evidence generation failed: {0}")]
    GenerationFailed(String),

    #[error("evidence verification failed: {0}")]
    VerificationFailed(String),

    #[error("evidence public key mismatch")]
    PublicKeyMismatch,

    #[error("malformed evidence: {0}")]
    Malformed(&'static str),
}

impl From<ProxyError> for LibError {
    fn from(err: ProxyError) -> Self {
        LibError::new(code::TRANSPORT, err.to_string())
    }
}

impl From<FrameError> for LibError {
    fn from(err: FrameError) -> Self {
        LibError::new(code::PROTOCOL, err.to_string())
    }
}

impl From<CryptoError> for LibError {
    fn from(err: CryptoError) -> Self {
        LibError::new(code::CRYPTO, err.to_string())
    }
}

impl From<AttestError> for LibError {
    fn from(err: AttestError) -> Self {
        LibError::new(code::EVIDENCE, err.to_string())
    }
}

/// Errors from driving a [`Session`](crate::Session).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("session not established")]
    NotEstablished,

    #[error("{op} is not valid in state {state}")]
    InvalidState { op: &'static str, state: State },

    #[error("{op} is not valid for a {role} session")]
    WrongRole { op: &'static str, role: Role },

    #[error("short transmit: {sent} of {requested} bytes")]
    ShortTransmit { requested: usize, sent: usize },

    #[error("response does not match request: sent {sent} bytes, got {received}")]
    ResponseMismatch { sent: usize, received: usize },
}

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_errno_only_for_syscall_faults() {
        let err = ProxyError::errno(Syscall::SetSockOpt, libc::ENOPROTOOPT);
        assert_eq!(err.native_errno(), Some(libc::ENOPROTOOPT));

        let err = ProxyError::boundary(Syscall::Accept, "host hung up");
        assert_eq!(err.native_errno(), None);
        assert!(err.to_string().contains("accept"));
    }

    #[test]
    fn channel_error_keeps_library_code() {
        let err = ChannelError::Negotiate(LibError::new(code::VERIFY_REJECTED, "rejected"));
        assert_eq!(err.code(), code::VERIFY_REJECTED);
        assert!(err.to_string().contains("0x0101"));
    }
}
