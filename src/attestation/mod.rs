pub mod claims;
pub mod null;
pub mod types;

#[cfg(feature = "mock")]
pub mod mock;

use crate::error::AttestError;
use types::{Evidence, EvidenceRequest, VerifiedEvidence};

/// Produces evidence about the local platform.
pub trait Attester: Send + Sync {
    /// Backend name, as reported to the peer.
    fn name(&self) -> &'static str;

    /// Produce evidence binding the request's nonce, key and claims.
    fn attest(&self, request: &EvidenceRequest<'_>) -> Result<Evidence, AttestError>;
}

/// Checks evidence presented by the peer.
pub trait Verifier: Send + Sync {
    fn name(&self) -> &'static str;

    /// Verify `evidence` and check it binds `nonce` and `public_key`.
    fn verify(
        &self,
        evidence: &Evidence,
        nonce: &[u8; 32],
        public_key: &[u8; 32],
    ) -> Result<VerifiedEvidence, AttestError>;
}

/// Resolve an attester backend by name. The empty name picks the default:
/// the mock backend when compiled in, otherwise the null attester.
pub fn attester_by_name(name: &str) -> Option<Box<dyn Attester>> {
    match name {
        #[cfg(feature = "mock")]
        "" | mock::MOCK => Some(Box::new(mock::MockAttester)),
        #[cfg(not(feature = "mock"))]
        "" => Some(Box::new(null::NullAttester)),
        null::NULL_ATTESTER => Some(Box::new(null::NullAttester)),
        _ => None,
    }
}

/// Resolve a verifier backend by name, with the same default rule.
pub fn verifier_by_name(name: &str) -> Option<Box<dyn Verifier>> {
    match name {
        #[cfg(feature = "mock")]
        "" | mock::MOCK => Some(Box::new(mock::MockVerifier)),
        #[cfg(not(feature = "mock"))]
        "" => Some(Box::new(null::NullVerifier)),
        null::NULL_VERIFIER => Some(Box::new(null::NullVerifier)),
        _ => None,
    }
}
