pub mod kex;
pub mod seal;
pub mod transcript;

/// 32-byte symmetric key.
pub type SymmetricKey = [u8; 32];

/// 32-byte X25519 public key.
pub type PublicKey = [u8; 32];

/// AEAD tag length in bytes.
pub const TAG_LEN: usize = 16;

/// Key agreement selected by the `tls_type` backend name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAgreement {
    X25519,
}

impl KeyAgreement {
    /// Resolve a backend name; the empty name picks the default.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "" | "x25519" => Some(Self::X25519),
            _ => None,
        }
    }
}

/// Record protection selected by the `crypto_type` backend name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordCipher {
    ChaCha20Poly1305,
}

impl RecordCipher {
    /// Resolve a backend name; the empty name picks the default.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "" | "chacha20poly1305" => Some(Self::ChaCha20Poly1305),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_name_selects_default() {
        assert_eq!(KeyAgreement::from_name(""), Some(KeyAgreement::X25519));
        assert_eq!(
            RecordCipher::from_name(""),
            Some(RecordCipher::ChaCha20Poly1305)
        );
        assert_eq!(KeyAgreement::from_name("openssl"), None);
        assert_eq!(RecordCipher::from_name("aes-gcm"), None);
    }
}
