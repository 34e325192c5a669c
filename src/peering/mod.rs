//! Peering and Claim Matching
//!
//! Two objects bind to each other without a coordinator. Each side declares a
//! reference to the other; each side fills only its own UID into the peer's
//! back-reference and otherwise writes only its own status. A binding is
//! confirmed once both references carry the UID of the object they point at.
//!
//! ```text
//!   A.ref(B) ──────────────▶ B        B.ref(A) ──────────────▶ A
//!   uid filled in by B                uid filled in by A
//! ```
//!
//! Claims of shared resources are the one-sided variant: the claimant writes
//! its name and UID into the target if the target is unclaimed.

use crate::crd::{ClaimRef, Network, PeerRef};

// =============================================================================
// Identities and References
// =============================================================================

/// Namespace, name and UID of an object taking part in a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity<'a> {
    pub namespace: &'a str,
    pub name: &'a str,
    pub uid: Option<&'a str>,
}

/// A resolved reference from one object to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reference<'a> {
    pub namespace: &'a str,
    pub name: &'a str,
    pub uid: Option<&'a str>,
}

impl Reference<'_> {
    fn points_at(&self, identity: &Identity<'_>) -> bool {
        self.namespace == identity.namespace && self.name == identity.name
    }
}

/// An object that can take part in a mutual binding.
pub trait Peer {
    fn identity(&self) -> Identity<'_>;

    /// Declared references, in spec order.
    fn references(&self) -> Vec<Reference<'_>>;

    /// Payload published to bound peers.
    fn handle(&self) -> Option<String>;
}

impl Peer for Network {
    fn identity(&self) -> Identity<'_> {
        Identity {
            namespace: self.metadata.namespace.as_deref().unwrap_or("default"),
            name: self.metadata.name.as_deref().unwrap_or_default(),
            uid: self.metadata.uid.as_deref(),
        }
    }

    fn references(&self) -> Vec<Reference<'_>> {
        self.spec
            .peerings
            .iter()
            .map(|p| self.resolve(&p.network_ref))
            .collect()
    }

    fn handle(&self) -> Option<String> {
        self.spec.provider_id.clone()
    }
}

impl Network {
    /// Resolve a peering reference relative to this network's namespace.
    pub fn resolve<'a>(&'a self, reference: &'a PeerRef) -> Reference<'a> {
        Reference {
            namespace: self.peer_namespace(reference),
            name: &reference.name,
            uid: reference.uid.as_deref(),
        }
    }
}

// =============================================================================
// Matching
// =============================================================================

/// Why a binding is not established yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingReason {
    /// The referenced object does not exist.
    PeerNotFound,
    /// Our reference pins a UID the peer does not have.
    UidMismatch { expected: String, actual: String },
    /// The peer does not reference us.
    NoBackReference,
    /// The peer's back-reference pins a UID that is not ours.
    StaleBackReference { uid: String },
    /// Our own UID is not known yet.
    OwnUidUnknown,
    /// The peer has not filled its UID into our reference yet.
    AwaitingPeer,
}

impl std::fmt::Display for PendingReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PendingReason::PeerNotFound => write!(f, "peer not found"),
            PendingReason::UidMismatch { expected, actual } => {
                write!(f, "peer uid is {}, reference expects {}", actual, expected)
            }
            PendingReason::NoBackReference => write!(f, "peer does not reference this object"),
            PendingReason::StaleBackReference { uid } => {
                write!(f, "peer references a different object with uid {}", uid)
            }
            PendingReason::OwnUidUnknown => write!(f, "own uid not assigned yet"),
            PendingReason::AwaitingPeer => write!(f, "waiting for peer to confirm"),
        }
    }
}

/// Next step for one side of a binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    Pending(PendingReason),
    /// Fill `uid` into the peer's reference at `index`. Only ever targets an
    /// empty UID.
    AssignUid { index: usize, uid: String },
    /// Both sides confirmed.
    Bound { handle: Option<String> },
}

/// Evaluate `own`'s `reference` against the current state of `peer`.
pub fn match_reference<P: Peer>(
    own: Identity<'_>,
    reference: &Reference<'_>,
    peer: Option<&P>,
) -> MatchOutcome {
    let Some(peer) = peer else {
        return MatchOutcome::Pending(PendingReason::PeerNotFound);
    };
    let peer_identity = peer.identity();

    if let (Some(expected), Some(actual)) = (reference.uid, peer_identity.uid) {
        if expected != actual {
            return MatchOutcome::Pending(PendingReason::UidMismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
    }

    let Some((index, back)) = peer
        .references()
        .into_iter()
        .enumerate()
        .find(|(_, r)| r.points_at(&own))
    else {
        return MatchOutcome::Pending(PendingReason::NoBackReference);
    };

    let Some(own_uid) = own.uid else {
        return MatchOutcome::Pending(PendingReason::OwnUidUnknown);
    };

    match back.uid {
        None => MatchOutcome::AssignUid {
            index,
            uid: own_uid.to_string(),
        },
        Some(uid) if uid != own_uid => {
            MatchOutcome::Pending(PendingReason::StaleBackReference {
                uid: uid.to_string(),
            })
        }
        Some(_) if reference.uid.is_none() => MatchOutcome::Pending(PendingReason::AwaitingPeer),
        Some(_) => MatchOutcome::Bound {
            handle: peer.handle(),
        },
    }
}

// =============================================================================
// Claims
// =============================================================================

/// Next step for a claimant of a shared resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Unclaimed: write the claimant into the target.
    Claim,
    /// Already claimed by this claimant.
    Bound,
    /// Claimed by someone else.
    Taken,
}

/// Evaluate a claim by `claimant_uid` against the target's `current` claim.
pub fn evaluate_claim(claimant_uid: &str, current: Option<&ClaimRef>) -> ClaimOutcome {
    match current {
        None => ClaimOutcome::Claim,
        Some(claim) if claim.uid == claimant_uid => ClaimOutcome::Bound,
        Some(_) => ClaimOutcome::Taken,
    }
}
