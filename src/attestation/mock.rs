use bytes::Bytes;
use sha2::{Digest, Sha256};

use super::types::{Evidence, EvidenceDocument, EvidenceRequest, VerifiedEvidence};
use super::{Attester, Verifier};
use crate::error::AttestError;

/// Backend name of the mock pair.
pub const MOCK: &str = "mock";

/// Mock attester for testing. Binds nonce, key and claims into a plain
/// evidence document with no platform signature.
///
/// # Security Warning
///
/// This attester proves nothing about the platform and must never be used in
/// production. It is compiled only with `features = ["mock"]`.
#[derive(Debug, Default)]
pub struct MockAttester;

fn mock_endorsements(public_key: &[u8; 32]) -> Bytes {
    let mut hasher = Sha256::new();
    hasher.update(b"mock endorsement");
    hasher.update(public_key);
    Bytes::copy_from_slice(&hasher.finalize())
}

impl Attester for MockAttester {
    fn name(&self) -> &'static str {
        MOCK
    }

    fn attest(&self, request: &EvidenceRequest<'_>) -> Result<Evidence, AttestError> {
        let mut doc = EvidenceDocument::from_request(MOCK, request);
        if request.endorsements {
            doc.endorsements = Some(mock_endorsements(request.public_key));
        }
        doc.encode()
    }
}

/// Mock verifier. Accepts evidence from [`MockAttester`] that binds the
/// expected nonce and public key.
#[derive(Debug, Default)]
pub struct MockVerifier;

impl Verifier for MockVerifier {
    fn name(&self) -> &'static str {
        MOCK
    }

    fn verify(
        &self,
        evidence: &Evidence,
        nonce: &[u8; 32],
        public_key: &[u8; 32],
    ) -> Result<VerifiedEvidence, AttestError> {
        let doc = EvidenceDocument::decode(evidence)?;
        if doc.attester != MOCK {
            return Err(AttestError::VerificationFailed(format!(
                "evidence from {:?} is not mock evidence",
                doc.attester
            )));
        }
        if &doc.nonce != nonce {
            return Err(AttestError::VerificationFailed("nonce mismatch".into()));
        }
        if &doc.public_key != public_key {
            return Err(AttestError::PublicKeyMismatch);
        }
        if let Some(endorsements) = &doc.endorsements {
            if endorsements[..] != mock_endorsements(public_key)[..] {
                return Err(AttestError::VerificationFailed(
                    "endorsements do not match key".into(),
                ));
            }
        }

        Ok(VerifiedEvidence {
            attester: doc.attester,
            digest: evidence.digest(),
            public_key: Some(doc.public_key),
            nonce: Some(doc.nonce),
            endorsements: doc.endorsements,
            claims: doc.claims,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::claims::Claim;

    fn request<'a>(claims: &'a [Claim], endorsements: bool) -> EvidenceRequest<'a> {
        EvidenceRequest {
            nonce: &[1; 32],
            public_key: &[2; 32],
            claims,
            endorsements,
        }
    }

    #[test]
    fn mock_roundtrip_with_endorsements() {
        let claims = vec![Claim::new("key_0", Bytes::from_static(b"value_0"))];
        let evidence = MockAttester.attest(&request(&claims, true)).unwrap();

        let verified = MockVerifier.verify(&evidence, &[1; 32], &[2; 32]).unwrap();
        assert_eq!(verified.attester, MOCK);
        assert_eq!(verified.claims, claims);
        assert!(verified.endorsements.is_some());
        assert_eq!(verified.digest, evidence.digest());
    }

    #[test]
    fn endorsements_absent_unless_requested() {
        let evidence = MockAttester.attest(&request(&[], false)).unwrap();
        let verified = MockVerifier.verify(&evidence, &[1; 32], &[2; 32]).unwrap();
        assert!(verified.endorsements.is_none());
        assert!(verified.view().endorsements.is_none());
    }

    #[test]
    fn stale_nonce_rejected() {
        let evidence = MockAttester.attest(&request(&[], false)).unwrap();
        let err = MockVerifier.verify(&evidence, &[9; 32], &[2; 32]).unwrap_err();
        assert!(matches!(err, AttestError::VerificationFailed(_)));
    }

    #[test]
    fn wrong_key_rejected() {
        let evidence = MockAttester.attest(&request(&[], false)).unwrap();
        let err = MockVerifier.verify(&evidence, &[1; 32], &[3; 32]).unwrap_err();
        assert!(matches!(err, AttestError::PublicKeyMismatch));
    }

    #[test]
    fn garbage_rejected() {
        let err = MockVerifier
            .verify(&Evidence::new(&b"INVALID"[..]), &[1; 32], &[2; 32])
            .unwrap_err();
        assert!(matches!(err, AttestError::Malformed(_)));
    }
}
