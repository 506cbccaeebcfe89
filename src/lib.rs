pub mod attestation;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod frame;
pub mod library;
pub mod logging;
pub mod proxy;
pub mod sample;
pub mod session;
pub mod transport;

// Re-export key types at crate root for convenience.
pub use attestation::claims::{Claim, ClaimSet, PeerEvidence, Verdict, VerifyCallback};
pub use engine::Engine;
pub use error::{Error, Result};
pub use library::{AttestedChannel, ChannelLibrary};
pub use proxy::enclave::ProxiedTransport;
pub use session::lifecycle::{KeepAlive, Session, State};
pub use session::{LogLevel, Role, SessionConfig, SessionConfigBuilder};
pub use transport::native::NativeTransport;
pub use transport::{Descriptor, TransportProvider};
