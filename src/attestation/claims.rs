use bytes::Bytes;

/// An application-defined claim embedded in outbound evidence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub name: String,
    pub value: Bytes,
}

impl Claim {
    pub fn new(name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Read-only view of the claims a peer presented during negotiation.
///
/// Borrowed from the negotiation in progress, so it cannot outlive the
/// verification callback it is handed to.
#[derive(Debug, Clone, Copy)]
pub struct ClaimSet<'a> {
    claims: &'a [Claim],
}

impl<'a> ClaimSet<'a> {
    pub fn new(claims: &'a [Claim]) -> Self {
        Self { claims }
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    /// Claims in the order the peer sent them.
    pub fn iter(&self) -> std::slice::Iter<'a, Claim> {
        self.claims.iter()
    }

    /// Value of the first claim named `name`. Duplicate names are not
    /// rejected anywhere; use [`iter`](Self::iter) to see all of them.
    pub fn get(&self, name: &str) -> Option<&'a [u8]> {
        self.claims
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.value.as_ref())
    }
}

/// What the verification callback sees about the peer.
#[derive(Debug, Clone, Copy)]
pub struct PeerEvidence<'a> {
    /// Name of the attester backend that produced the evidence.
    pub attester: &'a str,
    pub claims: ClaimSet<'a>,
    /// Endorsements, present when the peer was configured to provide them.
    pub endorsements: Option<&'a [u8]>,
}

/// Decision returned by a verification callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject,
}

/// Callback consulted with the peer's evidence during negotiate.
///
/// Runs synchronously inside negotiate, once per verified handshake.
/// Returning [`Verdict::Reject`] fails the negotiation.
pub type VerifyCallback = Box<dyn FnMut(&PeerEvidence<'_>) -> Verdict + Send>;

/// A callback that logs every peer claim and accepts.
pub fn logging_callback() -> VerifyCallback {
    Box::new(|evidence: &PeerEvidence<'_>| {
        tracing::info!(
            attester = evidence.attester,
            claim_count = evidence.claims.len(),
            endorsements = evidence.endorsements.is_some(),
            "verification callback invoked"
        );
        for (i, claim) in evidence.claims.iter().enumerate() {
            tracing::info!(
                index = i,
                name = %claim.name,
                value_size = claim.value.len(),
                value = %String::from_utf8_lossy(&claim.value),
                "peer claim"
            );
        }
        Verdict::Accept
    })
}
