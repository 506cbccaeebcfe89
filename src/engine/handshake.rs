//! Three-message attested key agreement.
//!
//! ```text
//! client                                   server
//!   Hello#0 [1 | pk_c | nonce_c]       -->
//!                                      <--  Hello#0 [2 | pk_s | nonce_s | flags | ev_s]
//!   Hello#1 [3 | confirm | ev_c]       -->
//! ```
//!
//! `ev_s` binds `pk_s` and `nonce_c`. `ev_c` is present only when the server
//! sets the mutual bit in `flags`, and binds `pk_c` and `nonce_s`. Either side
//! aborts by sending an `Error` frame with a reason.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::RngCore;
use tracing::level_filters::LevelFilter;

use super::wire::Wire;
use crate::attestation::claims::{Claim, Verdict, VerifyCallback};
use crate::attestation::types::{Evidence, EvidenceRequest, VerifiedEvidence, MAX_EVIDENCE_SIZE};
use crate::attestation::{Attester, Verifier};
use crate::crypto::kex::{derive_record_keys, Ephemeral, RecordKeys};
use crate::crypto::transcript::{compute_transcript, confirmation, NO_EVIDENCE};
use crate::error::{code, LibError};
use crate::frame::{Frame, FrameType};

const CLIENT_HELLO: u8 = 1;
const SERVER_HELLO: u8 = 2;
const CLIENT_FINISH: u8 = 3;

/// Server hello flag: the server wants the client's evidence.
const MUTUAL_REQUESTED: u8 = 0x01;

/// This side's attestation setup for one negotiation.
pub(crate) struct Local<'a> {
    pub attester: Option<&'a dyn Attester>,
    pub verifier: Option<&'a dyn Verifier>,
    pub claims: &'a [Claim],
    pub endorsements: bool,
    pub mutual: bool,
    /// Events below this level are suppressed.
    pub filter: LevelFilter,
}

/// A completed negotiation.
pub(crate) struct Negotiated {
    pub keys: RecordKeys,
    pub peer: Option<VerifiedEvidence>,
}

fn random_nonce() -> [u8; 32] {
    let mut nonce = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

fn malformed(what: &str) -> LibError {
    LibError::new(code::HANDSHAKE, format!("malformed {what}"))
}

fn take_array(cur: &mut &[u8], what: &str) -> Result<[u8; 32], LibError> {
    if cur.len() < 32 {
        return Err(malformed(what));
    }
    let mut out = [0u8; 32];
    cur.copy_to_slice(&mut out);
    Ok(out)
}

/// Length-prefixed evidence running to the end of the message.
fn take_evidence(cur: &mut &[u8], what: &str) -> Result<Option<Evidence>, LibError> {
    if cur.len() < 4 {
        return Err(malformed(what));
    }
    let len = cur.get_u32() as usize;
    if len > MAX_EVIDENCE_SIZE {
        return Err(LibError::new(
            code::EVIDENCE,
            format!("evidence too large: {len} bytes (max {MAX_EVIDENCE_SIZE})"),
        ));
    }
    if cur.len() != len {
        return Err(malformed(what));
    }
    if len == 0 {
        return Ok(None);
    }
    Ok(Some(Evidence::new(Bytes::copy_from_slice(cur))))
}

fn put_evidence(buf: &mut BytesMut, evidence: Option<&Evidence>) {
    match evidence {
        Some(ev) => {
            buf.put_u32(ev.raw.len() as u32);
            buf.put_slice(&ev.raw);
        }
        None => buf.put_u32(0),
    }
}

/// Receive the next handshake message, turning a peer abort into an error.
fn expect_hello(wire: &mut Wire, sequence: u32, tag: u8) -> Result<Bytes, LibError> {
    let frame = wire.recv_frame()?;
    match frame.header.msg_type {
        FrameType::Hello => {}
        FrameType::Error => {
            return Err(LibError::new(
                code::PEER_ABORTED,
                format!("peer aborted: {}", String::from_utf8_lossy(&frame.payload)),
            ))
        }
        other => {
            return Err(LibError::new(
                code::HANDSHAKE,
                format!("expected handshake message, got {other:?}"),
            ))
        }
    }
    if frame.header.sequence != sequence {
        return Err(LibError::new(
            code::HANDSHAKE,
            format!(
                "unexpected handshake sequence: expected {sequence}, got {}",
                frame.header.sequence
            ),
        ));
    }
    if frame.payload.first() != Some(&tag) {
        return Err(LibError::new(
            code::HANDSHAKE,
            format!("expected handshake message {tag}"),
        ));
    }
    Ok(frame.payload)
}

/// Tell the peer why we are giving up, then return `err`.
fn abort(wire: &mut Wire, filter: LevelFilter, err: LibError) -> LibError {
    if let Err(e) = wire.send_frame(Frame::error(0, &err.reason)) {
        gated!(filter, DEBUG, error = %e, "could not deliver abort notice");
    }
    err
}

/// Verify peer evidence and consult the callback.
fn check_peer(
    wire: &mut Wire,
    filter: LevelFilter,
    verifier: &dyn Verifier,
    callback: &mut Option<VerifyCallback>,
    evidence: &Evidence,
    nonce: &[u8; 32],
    public_key: &[u8; 32],
) -> Result<VerifiedEvidence, LibError> {
    let verified = match verifier.verify(evidence, nonce, public_key) {
        Ok(v) => v,
        Err(e) => {
            gated!(
                filter,
                WARN,
                verifier = verifier.name(),
                error = %e,
                "evidence verification failed"
            );
            return Err(abort(
                wire,
                filter,
                LibError::new(code::EVIDENCE, e.to_string()),
            ));
        }
    };
    gated!(
        filter,
        DEBUG,
        attester = %verified.attester,
        digest = hex::encode(verified.digest),
        claims = verified.claims.len(),
        "peer evidence verified"
    );

    if let Some(cb) = callback.as_mut() {
        if cb(&verified.view()) == Verdict::Reject {
            return Err(abort(
                wire,
                filter,
                LibError::new(code::VERIFY_REJECTED, "verification callback rejected peer"),
            ));
        }
    }
    Ok(verified)
}

fn attest(
    attester: &dyn Attester,
    local: &Local<'_>,
    nonce: &[u8; 32],
    public_key: &[u8; 32],
) -> Result<Evidence, LibError> {
    attester
        .attest(&EvidenceRequest {
            nonce,
            public_key,
            claims: local.claims,
            endorsements: local.endorsements,
        })
        .map_err(|e| {
            gated!(
                local.filter,
                WARN,
                attester = attester.name(),
                error = %e,
                "evidence generation failed"
            );
            LibError::from(e)
        })
}

/// Run the client side.
pub(crate) fn initiate(
    wire: &mut Wire,
    local: &Local<'_>,
    callback: &mut Option<VerifyCallback>,
) -> Result<Negotiated, LibError> {
    let verifier = local
        .verifier
        .ok_or_else(|| LibError::new(code::INVALID_STATE, "client has no verifier"))?;

    let eph = Ephemeral::generate();
    let pk = eph.public_bytes();
    let nonce = random_nonce();

    let mut hello = BytesMut::with_capacity(65);
    hello.put_u8(CLIENT_HELLO);
    hello.put_slice(&pk);
    hello.put_slice(&nonce);
    wire.send_frame(Frame::hello(0, hello.freeze()))?;

    let payload = expect_hello(wire, 0, SERVER_HELLO)?;
    let mut cur = &payload[1..];
    let server_pk = take_array(&mut cur, "server hello")?;
    let server_nonce = take_array(&mut cur, "server hello")?;
    if cur.is_empty() {
        return Err(malformed("server hello"));
    }
    let flags = cur.get_u8();
    let server_evidence = take_evidence(&mut cur, "server hello")?
        .ok_or_else(|| {
            abort(
                wire,
                local.filter,
                LibError::new(code::EVIDENCE, "server presented no evidence"),
            )
        })?;

    let peer = check_peer(
        wire,
        local.filter,
        verifier,
        callback,
        &server_evidence,
        &nonce,
        &server_pk,
    )?;

    let own_evidence = if flags & MUTUAL_REQUESTED != 0 {
        let attester = match (local.mutual, local.attester) {
            (true, Some(a)) => a,
            _ => {
                return Err(abort(
                    wire,
                    local.filter,
                    LibError::new(code::HANDSHAKE, "server requires mutual attestation"),
                ))
            }
        };
        match attest(attester, local, &server_nonce, &pk) {
            Ok(ev) => Some(ev),
            Err(e) => return Err(abort(wire, local.filter, e)),
        }
    } else {
        None
    };

    let client_digest = own_evidence.as_ref().map_or(NO_EVIDENCE, Evidence::digest);
    let transcript = compute_transcript(
        &client_digest,
        &peer.digest,
        &pk,
        &server_pk,
        &nonce,
        &server_nonce,
    );
    let keys = derive_record_keys(&eph, &server_pk, &transcript, true)?;
    let confirm = confirmation(&keys.session_id, &keys.send, &keys.recv);

    let mut finish = BytesMut::with_capacity(37 + own_evidence.as_ref().map_or(0, |e| e.raw.len()));
    finish.put_u8(CLIENT_FINISH);
    finish.put_slice(&confirm);
    put_evidence(&mut finish, own_evidence.as_ref());
    wire.send_frame(Frame::hello(1, finish.freeze()))?;

    Ok(Negotiated {
        keys,
        peer: Some(peer),
    })
}

/// Run the server side.
pub(crate) fn respond(
    wire: &mut Wire,
    local: &Local<'_>,
    callback: &mut Option<VerifyCallback>,
) -> Result<Negotiated, LibError> {
    let attester = local
        .attester
        .ok_or_else(|| LibError::new(code::INVALID_STATE, "server has no attester"))?;

    let payload = expect_hello(wire, 0, CLIENT_HELLO)?;
    let mut cur = &payload[1..];
    let client_pk = take_array(&mut cur, "client hello")?;
    let client_nonce = take_array(&mut cur, "client hello")?;
    if !cur.is_empty() {
        return Err(malformed("client hello"));
    }

    let eph = Ephemeral::generate();
    let pk = eph.public_bytes();
    let nonce = random_nonce();
    let evidence = match attest(attester, local, &client_nonce, &pk) {
        Ok(ev) => ev,
        Err(e) => return Err(abort(wire, local.filter, e)),
    };
    gated!(local.filter, DEBUG, len = evidence.raw.len(), "evidence generated");

    let mut hello = BytesMut::with_capacity(70 + evidence.raw.len());
    hello.put_u8(SERVER_HELLO);
    hello.put_slice(&pk);
    hello.put_slice(&nonce);
    hello.put_u8(if local.mutual { MUTUAL_REQUESTED } else { 0 });
    put_evidence(&mut hello, Some(&evidence));
    wire.send_frame(Frame::hello(0, hello.freeze()))?;

    let payload = expect_hello(wire, 1, CLIENT_FINISH)?;
    let mut cur = &payload[1..];
    let received_confirm = take_array(&mut cur, "client finish")?;
    let client_evidence = take_evidence(&mut cur, "client finish")?;

    let (peer, client_digest) = if local.mutual {
        let verifier = local
            .verifier
            .ok_or_else(|| LibError::new(code::INVALID_STATE, "mutual server has no verifier"))?;
        let Some(client_evidence) = client_evidence else {
            return Err(abort(
                wire,
                local.filter,
                LibError::new(code::EVIDENCE, "client presented no evidence"),
            ));
        };
        let peer = check_peer(
            wire,
            local.filter,
            verifier,
            callback,
            &client_evidence,
            &nonce,
            &client_pk,
        )?;
        let digest = peer.digest;
        (Some(peer), digest)
    } else {
        (None, NO_EVIDENCE)
    };

    let transcript = compute_transcript(
        &client_digest,
        &evidence.digest(),
        &client_pk,
        &pk,
        &client_nonce,
        &nonce,
    );
    let keys = derive_record_keys(&eph, &client_pk, &transcript, false)?;
    // The client's send key is our receive key.
    let expected = confirmation(&keys.session_id, &keys.recv, &keys.send);
    if received_confirm != expected {
        return Err(abort(
            wire,
            local.filter,
            LibError::new(code::HANDSHAKE, "confirmation mismatch: peer derived different keys"),
        ));
    }

    Ok(Negotiated { keys, peer })
}
