//! Boundary to the attested-channel library.
//!
//! The lifecycle drives the library only through these two traits. It never
//! looks at evidence or key material; it hands over configuration and a
//! connected descriptor and gets back success, failure, or bytes.

use std::sync::Arc;

use crate::attestation::claims::VerifyCallback;
use crate::error::LibError;
use crate::session::SessionConfig;
use crate::transport::{Descriptor, TransportProvider};

/// Factory for attested-channel handles.
pub trait ChannelLibrary: Send + Sync {
    /// Create a handle from `config`. Backend selection happens here, so an
    /// unknown backend name fails now rather than at negotiate.
    fn init(&self, config: &SessionConfig) -> Result<Box<dyn AttestedChannel>, LibError>;
}

/// One attested-channel handle.
///
/// Not reentrant. `cleanup` must be called exactly once; the library reports
/// a second call as an invalid-state error.
pub trait AttestedChannel: Send {
    /// Install or clear the callback consulted with the peer's evidence.
    fn set_verification_callback(&mut self, callback: Option<VerifyCallback>)
        -> Result<(), LibError>;

    /// Run the attested handshake over the connected descriptor `fd`.
    ///
    /// May be called again with a new descriptor after a previous connection
    /// ends; the previous connection state is discarded.
    fn negotiate(&mut self, io: Arc<dyn TransportProvider>, fd: Descriptor)
        -> Result<(), LibError>;

    /// Send up to `buf.len()` bytes; returns how many were sent.
    fn transmit(&mut self, buf: &[u8]) -> Result<usize, LibError>;

    /// Receive up to `buf.len()` bytes; `Ok(0)` means the peer shut down.
    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, LibError>;

    /// Release the handle's resources.
    fn cleanup(&mut self) -> Result<(), LibError>;
}
