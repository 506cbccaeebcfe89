use super::types::{Evidence, EvidenceDocument, EvidenceRequest, VerifiedEvidence};
use super::{Attester, Verifier};
use crate::error::AttestError;

pub const NULL_ATTESTER: &str = "nullattester";
pub const NULL_VERIFIER: &str = "nullverifier";

/// Attester for platforms without a trusted execution environment.
///
/// The evidence still carries nonce, key and claims so the peer's callback
/// sees them, but nothing vouches for them. Endorsements are never produced.
#[derive(Debug, Default)]
pub struct NullAttester;

impl Attester for NullAttester {
    fn name(&self) -> &'static str {
        NULL_ATTESTER
    }

    fn attest(&self, request: &EvidenceRequest<'_>) -> Result<Evidence, AttestError> {
        EvidenceDocument::from_request(NULL_ATTESTER, request).encode()
    }
}

/// Verifier that accepts any evidence.
///
/// Claims are surfaced when the evidence parses; otherwise the peer is
/// reported with no claims.
#[derive(Debug, Default)]
pub struct NullVerifier;

impl Verifier for NullVerifier {
    fn name(&self) -> &'static str {
        NULL_VERIFIER
    }

    fn verify(
        &self,
        evidence: &Evidence,
        _nonce: &[u8; 32],
        _public_key: &[u8; 32],
    ) -> Result<VerifiedEvidence, AttestError> {
        let digest = evidence.digest();
        let verified = match EvidenceDocument::decode(evidence) {
            Ok(doc) => VerifiedEvidence {
                attester: doc.attester,
                digest,
                public_key: Some(doc.public_key),
                nonce: Some(doc.nonce),
                endorsements: doc.endorsements,
                claims: doc.claims,
            },
            Err(_) => VerifiedEvidence {
                    attester: String::new(),
                    digest,
                    public_key: None,
                    nonce: None,
                    endorsements: None,
                claims: Vec::new(),
            },
        };
        Ok(verified)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::attestation::claims::Claim;

    #[test]
    fn null_pair_delivers_claims_without_endorsements() {
        let claims = vec![Claim::new("key_0", Bytes::from_static(b"value_0"))];
        let evidence = NullAttester
            .attest(&EvidenceRequest {
                nonce: &[0; 32],
                public_key: &[5; 32],
                claims: &claims,
                endorsements: true,
            })
            .unwrap();

        let verified = NullVerifier.verify(&evidence, &[1; 32], &[1; 32]).unwrap();
        assert_eq!(verified.attester, NULL_ATTESTER);
        assert_eq!(verified.claims, claims);
        assert!(verified.endorsements.is_none());
    }

    #[test]
    fn anything_is_accepted() {
        let verified = NullVerifier
            .verify(&Evidence::new(&b"opaque"[..]), &[0; 32], &[0; 32])
            .unwrap();
        assert!(verified.claims.is_empty());
        assert!(verified.public_key.is_none());
    }
}
