use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::SymmetricKey;
use crate::error::CryptoError;

const CLIENT_TO_SERVER: &[u8] = b"attested-link c2s";
const SERVER_TO_CLIENT: &[u8] = b"attested-link s2c";
const SESSION_ID: &[u8] = b"attested-link session id";

/// An ephemeral X25519 key pair, one per negotiation.
pub struct Ephemeral {
    secret: StaticSecret,
    public: PublicKey,
}

impl Ephemeral {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }
}

/// Directional record keys plus the session identifier bound into every
/// record's associated data.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct RecordKeys {
    pub send: SymmetricKey,
    pub recv: SymmetricKey,
    pub session_id: [u8; 32],
}

/// Agree on a shared secret with `their_public` and expand it under the
/// handshake transcript.
///
/// The client's send key is the server's receive key and vice versa.
pub fn derive_record_keys(
    ours: &Ephemeral,
    their_public: &[u8; 32],
    transcript_hash: &[u8; 32],
    is_client: bool,
) -> Result<RecordKeys, CryptoError> {
    let shared = ours.secret.diffie_hellman(&PublicKey::from(*their_public));
    if !shared.was_contributory() {
        return Err(CryptoError::NonContributoryKey);
    }

    let hkdf = Hkdf::<Sha256>::new(Some(transcript_hash), shared.as_bytes());
    let mut c2s = [0u8; 32];
    let mut s2c = [0u8; 32];
    let mut session_id = [0u8; 32];
    hkdf.expand(CLIENT_TO_SERVER, &mut c2s)
        .map_err(|_| CryptoError::HkdfExpandFailed)?;
    hkdf.expand(SERVER_TO_CLIENT, &mut s2c)
        .map_err(|_| CryptoError::HkdfExpandFailed)?;
    hkdf.expand(SESSION_ID, &mut session_id)
        .map_err(|_| CryptoError::HkdfExpandFailed)?;

    let keys = if is_client {
        RecordKeys {
            send: c2s,
            recv: s2c,
            session_id,
        }
    } else {
        RecordKeys {
            send: s2c,
            recv: c2s,
            session_id,
        }
    };
    c2s.zeroize();
    s2c.zeroize();
    Ok(keys)
}
