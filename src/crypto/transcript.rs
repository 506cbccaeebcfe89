use sha2::{Digest, Sha256};

use super::{PublicKey, SymmetricKey};
use crate::frame::PROTOCOL_VERSION;

/// Digest standing in for evidence a side did not present.
pub const NO_EVIDENCE: [u8; 32] = [0u8; 32];

/// Hash binding the session to both sides' evidence and key shares.
///
/// `SHA256(client_ev || server_ev || sorted(pk_a, pk_b) || client_nonce ^ server_nonce || version)`
pub fn compute_transcript(
    client_evidence: &[u8; 32],
    server_evidence: &[u8; 32],
    pk_a: &PublicKey,
    pk_b: &PublicKey,
    client_nonce: &[u8; 32],
    server_nonce: &[u8; 32],
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(client_evidence);
    hasher.update(server_evidence);

    let (lo, hi) = if pk_a <= pk_b { (pk_a, pk_b) } else { (pk_b, pk_a) };
    hasher.update(lo);
    hasher.update(hi);

    let mut combined = [0u8; 32];
    for (out, (c, s)) in combined.iter_mut().zip(client_nonce.iter().zip(server_nonce)) {
        *out = c ^ s;
    }
    hasher.update(combined);
    hasher.update([PROTOCOL_VERSION]);
    hasher.finalize().into()
}

/// Key confirmation sent by the client in the last handshake message.
///
/// Binds both directional keys, so a mismatch in either is caught.
pub fn confirmation(
    session_id: &[u8; 32],
    client_to_server: &SymmetricKey,
    server_to_client: &SymmetricKey,
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"attested-link confirm");
    hasher.update(session_id);
    hasher.update(client_to_server);
    hasher.update(server_to_client);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_order_does_not_matter() {
        let t1 = compute_transcript(&[0xAA; 32], &[0xBB; 32], &[1; 32], &[2; 32], &[3; 32], &[4; 32]);
        let t2 = compute_transcript(&[0xAA; 32], &[0xBB; 32], &[2; 32], &[1; 32], &[3; 32], &[4; 32]);
        assert_eq!(t1, t2);
    }

    #[test]
    fn evidence_sides_are_distinguished() {
        let t1 = compute_transcript(&[0xAA; 32], &NO_EVIDENCE, &[1; 32], &[2; 32], &[3; 32], &[4; 32]);
        let t2 = compute_transcript(&NO_EVIDENCE, &[0xAA; 32], &[1; 32], &[2; 32], &[3; 32], &[4; 32]);
        assert_ne!(t1, t2);
    }

    #[test]
    fn confirmation_binds_both_keys() {
        let sid = [9u8; 32];
        let base = confirmation(&sid, &[1; 32], &[2; 32]);
        assert_ne!(base, confirmation(&sid, &[1; 32], &[3; 32]));
        assert_ne!(base, confirmation(&sid, &[2; 32], &[1; 32]));
    }
}
