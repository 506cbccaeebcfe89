use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};

use super::claims::{Claim, ClaimSet, PeerEvidence};
use crate::error::AttestError;

/// Maximum evidence size accepted during negotiate (64 KiB).
pub const MAX_EVIDENCE_SIZE: usize = 64 * 1024;

const MARKER: &[u8; 8] = b"ALEVDOC1";

/// Opaque evidence bytes as they travel in the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evidence {
    pub raw: Bytes,
}

impl Evidence {
    pub fn new(raw: impl Into<Bytes>) -> Self {
        Self { raw: raw.into() }
    }

    pub fn digest(&self) -> [u8; 32] {
        Sha256::digest(&self.raw).into()
    }
}

/// What an attester is asked to bind into its evidence.
#[derive(Debug, Clone, Copy)]
pub struct EvidenceRequest<'a> {
    pub nonce: &'a [u8; 32],
    pub public_key: &'a [u8; 32],
    pub claims: &'a [Claim],
    pub endorsements: bool,
}

/// Structured evidence body shared by the in-tree backends.
///
/// Layout: marker, attester name (u8 length), nonce, public key, optional
/// endorsements (u8 presence, u32 length), then the claims in order
/// (u16 count; each u16 name length, name, u32 value length, value).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceDocument {
    pub attester: String,
    pub nonce: [u8; 32],
    pub public_key: [u8; 32],
    pub endorsements: Option<Bytes>,
    pub claims: Vec<Claim>,
}

impl EvidenceDocument {
    pub fn from_request(attester: &str, request: &EvidenceRequest<'_>) -> Self {
        Self {
            attester: attester.to_owned(),
            nonce: *request.nonce,
            public_key: *request.public_key,
            endorsements: None,
            claims: request.claims.to_vec(),
        }
    }

    pub fn encode(&self) -> Result<Evidence, AttestError> {
        let name_len = u8::try_from(self.attester.len())
            .map_err(|_| AttestError::GenerationFailed("attester name too long".into()))?;
        let count = u16::try_from(self.claims.len())
            .map_err(|_| AttestError::GenerationFailed("too many claims".into()))?;

        let mut buf = BytesMut::with_capacity(256);
        buf.put_slice(MARKER);
        buf.put_u8(name_len);
        buf.put_slice(self.attester.as_bytes());
        buf.put_slice(&self.nonce);
        buf.put_slice(&self.public_key);
        match &self.endorsements {
            Some(e) => {
                buf.put_u8(1);
                buf.put_u32(e.len() as u32);
                buf.put_slice(e);
            }
            None => buf.put_u8(0),
        }
        buf.put_u16(count);
        for claim in &self.claims {
            let name_len = u16::try_from(claim.name.len())
                .map_err(|_| AttestError::GenerationFailed(format!("claim {} name too long", claim.name)))?;
            let value_len = u32::try_from(claim.value.len())
                .map_err(|_| AttestError::GenerationFailed(format!("claim {} value too long", claim.name)))?;
            buf.put_u16(name_len);
            buf.put_slice(claim.name.as_bytes());
            buf.put_u32(value_len);
            buf.put_slice(&claim.value);
        }

        if buf.len() > MAX_EVIDENCE_SIZE {
            return Err(AttestError::GenerationFailed(format!(
                "evidence is {} bytes (max {MAX_EVIDENCE_SIZE})",
                buf.len()
            )));
        }
        Ok(Evidence::new(buf.freeze()))
    }

    pub fn decode(evidence: &Evidence) -> Result<Self, AttestError> {
        let mut cur = evidence.raw.clone();
        if cur.len() < MARKER.len() || &cur[..MARKER.len()] != MARKER {
            return Err(AttestError::Malformed("missing evidence marker"));
        }
        cur.advance(MARKER.len());

        let name_len = take_u8(&mut cur)? as usize;
        let attester = take_string(&mut cur, name_len)?;
        let nonce = take_array(&mut cur)?;
        let public_key = take_array(&mut cur)?;
        let endorsements = match take_u8(&mut cur)? {
            0 => None,
            1 => {
                let len = take_u32(&mut cur)? as usize;
                Some(take_bytes(&mut cur, len)?)
            }
            _ => return Err(AttestError::Malformed("bad endorsements flag")),
        };

        let count = take_u16(&mut cur)?;
        let mut claims = Vec::with_capacity(usize::from(count).min(64));
        for _ in 0..count {
            let name_len = take_u16(&mut cur)? as usize;
            let name = take_string(&mut cur, name_len)?;
            let value_len = take_u32(&mut cur)? as usize;
            let value = take_bytes(&mut cur, value_len)?;
            claims.push(Claim { name, value });
        }
        if cur.has_remaining() {
            return Err(AttestError::Malformed("trailing bytes after claims"));
        }

        Ok(Self {
            attester,
            nonce,
            public_key,
            endorsements,
            claims,
        })
    }
}

fn need(cur: &Bytes, n: usize) -> Result<(), AttestError> {
    if cur.remaining() < n {
        return Err(AttestError::Malformed("truncated evidence"));
    }
    Ok(())
}

fn take_u8(cur: &mut Bytes) -> Result<u8, AttestError> {
    need(cur, 1)?;
    Ok(cur.get_u8())
}

fn take_u16(cur: &mut Bytes) -> Result<u16, AttestError> {
    need(cur, 2)?;
    Ok(cur.get_u16())
}

fn take_u32(cur: &mut Bytes) -> Result<u32, AttestError> {
    need(cur, 4)?;
    Ok(cur.get_u32())
}

fn take_bytes(cur: &mut Bytes, n: usize) -> Result<Bytes, AttestError> {
    need(cur, n)?;
    Ok(cur.split_to(n))
}

fn take_array(cur: &mut Bytes) -> Result<[u8; 32], AttestError> {
    need(cur, 32)?;
    let mut out = [0u8; 32];
    cur.copy_to_slice(&mut out);
    Ok(out)
}

fn take_string(cur: &mut Bytes, n: usize) -> Result<String, AttestError> {
    let raw = take_bytes(cur, n)?;
    String::from_utf8(raw.to_vec()).map_err(|_| AttestError::Malformed("name is not UTF-8"))
}

/// Evidence that passed a verifier.
#[derive(Debug, Clone)]
pub struct VerifiedEvidence {
    pub attester: String,
    /// Digest of the raw evidence, bound into the session transcript.
    pub digest: [u8; 32],
    pub public_key: Option<[u8; 32]>,
    pub nonce: Option<[u8; 32]>,
    pub endorsements: Option<Bytes>,
    pub claims: Vec<Claim>,
}

impl VerifiedEvidence {
    /// Borrowed view handed to a verification callback.
    pub fn view(&self) -> PeerEvidence<'_> {
        PeerEvidence {
            attester: &self.attester,
            claims: ClaimSet::new(&self.claims),
            endorsements: self.endorsements.as_deref(),
        }
    }
}
