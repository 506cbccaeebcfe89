use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use zeroize::Zeroizing;

use super::SymmetricKey;
use crate::error::CryptoError;
use crate::frame::PROTOCOL_VERSION;

/// `version || msg_type || flags || session_id || sequence`.
fn build_aad(msg_type: u8, flags: u8, session_id: &[u8; 32], sequence: u32) -> [u8; 39] {
    let mut aad = [0u8; 39];
    aad[0] = PROTOCOL_VERSION;
    aad[1] = msg_type;
    aad[2] = flags;
    aad[3..35].copy_from_slice(session_id);
    aad[35..].copy_from_slice(&sequence.to_be_bytes());
    aad
}

/// 12-byte nonce: four zero bytes then the 64-bit counter, big endian.
fn build_nonce(sequence: u32) -> Nonce {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&u64::from(sequence).to_be_bytes());
    Nonce::from(nonce)
}

fn cipher(key: &SymmetricKey) -> ChaCha20Poly1305 {
    ChaCha20Poly1305::new(Key::from_slice(key))
}

/// Seals outgoing records under one direction's key.
pub struct Sealer {
    key: Zeroizing<SymmetricKey>,
    session_id: [u8; 32],
    next: Option<u32>,
}

impl Sealer {
    pub fn new(key: &SymmetricKey, session_id: [u8; 32]) -> Self {
        Self {
            key: Zeroizing::new(*key),
            session_id,
            next: Some(0),
        }
    }

    /// Encrypt `plaintext`, returning the ciphertext and the sequence number
    /// to put in the frame header.
    pub fn seal(
        &mut self,
        plaintext: &[u8],
        msg_type: u8,
        flags: u8,
    ) -> Result<(Vec<u8>, u32), CryptoError> {
        let seq = self.next.ok_or(CryptoError::NonceOverflow)?;
        self.next = seq.checked_add(1);

        let aad = build_aad(msg_type, flags, &self.session_id, seq);
        let ciphertext = cipher(&self.key)
            .encrypt(
                &build_nonce(seq),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::SealFailed)?;
        Ok((ciphertext, seq))
    }
}

/// Opens incoming records and enforces strictly increasing sequence numbers.
pub struct Opener {
    key: Zeroizing<SymmetricKey>,
    session_id: [u8; 32],
    last: Option<u32>,
}

impl Opener {
    pub fn new(key: &SymmetricKey, session_id: [u8; 32]) -> Self {
        Self {
            key: Zeroizing::new(*key),
            session_id,
            last: None,
        }
    }

    pub fn open(
        &mut self,
        ciphertext: &[u8],
        sequence: u32,
        msg_type: u8,
        flags: u8,
    ) -> Result<Vec<u8>, CryptoError> {
        if let Some(last) = self.last {
            if sequence <= last {
                return Err(CryptoError::SequenceReplay {
                    received: sequence.into(),
                    expected: last.into(),
                });
            }
        }

        let aad = build_aad(msg_type, flags, &self.session_id, sequence);
        let plaintext = cipher(&self.key)
            .decrypt(
                &build_nonce(sequence),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::OpenFailed)?;

        self.last = Some(sequence);
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DATA: u8 = 0x02;
    const ENCRYPTED: u8 = 0x01;

    fn pair() -> (Sealer, Opener) {
        let key = [0x42; 32];
        let sid = [0xAA; 32];
        (Sealer::new(&key, sid), Opener::new(&key, sid))
    }

    #[test]
    fn sealed_record_opens() {
        let (mut sealer, mut opener) = pair();
        let (ct, seq) = sealer.seal(b"attested hello", DATA, ENCRYPTED).unwrap();
        assert_eq!(seq, 0);
        assert_eq!(ct.len(), b"attested hello".len() + crate::crypto::TAG_LEN);
        assert_eq!(opener.open(&ct, seq, DATA, ENCRYPTED).unwrap(), b"attested hello");
    }

    #[test]
    fn flipped_header_fields_fail() {
        let (mut sealer, mut opener) = pair();
        let (ct, seq) = sealer.seal(b"secret", DATA, ENCRYPTED).unwrap();
        assert!(matches!(
            opener.open(&ct, seq, 0x03, ENCRYPTED),
            Err(CryptoError::OpenFailed)
        ));
        assert!(matches!(
            opener.open(&ct, seq, DATA, 0x00),
            Err(CryptoError::OpenFailed)
        ));
    }

    #[test]
    fn replay_and_reorder_rejected() {
        let (mut sealer, mut opener) = pair();
        let (ct0, s0) = sealer.seal(b"first", DATA, ENCRYPTED).unwrap();
        let (ct1, s1) = sealer.seal(b"second", DATA, ENCRYPTED).unwrap();

        opener.open(&ct1, s1, DATA, ENCRYPTED).unwrap();
        assert!(matches!(
            opener.open(&ct0, s0, DATA, ENCRYPTED),
            Err(CryptoError::SequenceReplay {
                received: 0,
                expected: 1
            })
        ));
    }

    #[test]
    fn counter_exhaustion_is_an_error() {
        let (mut sealer, _) = pair();
        sealer.next = Some(u32::MAX);
        sealer.seal(b"last", DATA, ENCRYPTED).unwrap();
        assert!(matches!(
            sealer.seal(b"one more", DATA, ENCRYPTED),
            Err(CryptoError::NonceOverflow)
        ));
    }
}
