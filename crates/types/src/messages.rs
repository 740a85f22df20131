//! Wire messages for the replication protocol.
//!
//! Every replica-to-replica message carries its sender, the fields the
//! protocol acts on, and an [`Authenticator`]. Signing digests are domain
//! separated so a tag computed for one message kind can never verify as
//! another.

use crate::crypto::Authenticator;
use crate::digest::Digest;
use crate::request::{Reply, Request};
use crate::{ReplicaId, Seqno, View};
use serde::{Deserialize, Serialize};

pub const DOMAIN_PRE_PREPARE: &[u8] = b"pre-prepare:";
pub const DOMAIN_PREPARE: &[u8] = b"prepare:";
pub const DOMAIN_COMMIT: &[u8] = b"commit:";
pub const DOMAIN_CHECKPOINT: &[u8] = b"checkpoint:";
pub const DOMAIN_VIEW_CHANGE: &[u8] = b"view-change:";
pub const DOMAIN_NEW_VIEW: &[u8] = b"new-view:";
pub const DOMAIN_STATUS: &[u8] = b"status:";
pub const DOMAIN_FETCH: &[u8] = b"fetch:";
pub const DOMAIN_REPLY: &[u8] = b"reply:";

/// A pre-prepare's payload: the ordered requests, their digests, and the
/// primary's non-determinism choice for the batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Batch {
    /// Request digests, in execution order.
    pub digests: Vec<Digest>,
    /// Full request bodies, aligned with `digests`.
    pub requests: Vec<Request>,
    /// Opaque non-determinism bytes chosen by the primary's kernel.
    pub non_det: Vec<u8>,
}

impl Batch {
    /// The digest the prepare/commit sub-protocol agrees on. Covers request
    /// digests and the non-determinism choice; request bodies are bound
    /// through their digests.
    pub fn digest(&self) -> Digest {
        let mut parts: Vec<&[u8]> = Vec::with_capacity(self.digests.len() + 2);
        parts.push(b"batch:");
        for d in &self.digests {
            parts.push(d.as_bytes());
        }
        parts.push(&self.non_det);
        Digest::of_parts(&parts)
    }

    /// A null batch orders no requests; issued for gap slots in a new view.
    pub fn null() -> Self {
        Batch::default()
    }

    pub fn is_null(&self) -> bool {
        self.digests.is_empty() && self.non_det.is_empty()
    }

    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }
}

/// Ordering proposal from the primary of `view` for slot `seqno`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrePrepare {
    pub view: View,
    pub seqno: Seqno,
    pub batch: Batch,
    pub sender: ReplicaId,
    pub auth: Authenticator,
}

impl PrePrepare {
    pub fn batch_digest(&self) -> Digest {
        self.batch.digest()
    }

    pub fn signing_digest(&self) -> Digest {
        Digest::of_parts(&[
            DOMAIN_PRE_PREPARE,
            &self.view.to_le_bytes(),
            &self.seqno.to_le_bytes(),
            self.batch.digest().as_bytes(),
            &self.sender.0.to_le_bytes(),
        ])
    }
}

/// A replica's promise to accept `(view, seqno, batch_digest)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prepare {
    pub view: View,
    pub seqno: Seqno,
    pub batch_digest: Digest,
    pub sender: ReplicaId,
    pub auth: Authenticator,
}

impl Prepare {
    pub fn signing_digest(&self) -> Digest {
        Digest::of_parts(&[
            DOMAIN_PREPARE,
            &self.view.to_le_bytes(),
            &self.seqno.to_le_bytes(),
            self.batch_digest.as_bytes(),
            &self.sender.0.to_le_bytes(),
        ])
    }
}

/// A replica's attestation that `(view, seqno, batch_digest)` is prepared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub view: View,
    pub seqno: Seqno,
    pub batch_digest: Digest,
    pub sender: ReplicaId,
    pub auth: Authenticator,
}

impl Commit {
    pub fn signing_digest(&self) -> Digest {
        Digest::of_parts(&[
            DOMAIN_COMMIT,
            &self.view.to_le_bytes(),
            &self.seqno.to_le_bytes(),
            self.batch_digest.as_bytes(),
            &self.sender.0.to_le_bytes(),
        ])
    }
}

/// Periodic attestation of application state at `seqno`. Always signed so a
/// quorum of checkpoints is a transferable stability proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub seqno: Seqno,
    pub state_digest: Digest,
    pub sender: ReplicaId,
    pub auth: Authenticator,
}

impl Checkpoint {
    pub fn signing_digest(&self) -> Digest {
        Digest::of_parts(&[
            DOMAIN_CHECKPOINT,
            &self.seqno.to_le_bytes(),
            self.state_digest.as_bytes(),
            &self.sender.0.to_le_bytes(),
        ])
    }
}

/// Evidence inside a view change that a slot prepared in some earlier view.
///
/// Carries the prepared batch itself so the new primary can re-issue the
/// slot even when its own log never held the pre-prepare.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedEvidence {
    pub seqno: Seqno,
    /// The view in which the slot prepared.
    pub view: View,
    pub batch: Batch,
    /// The `2f+1` distinct replicas whose prepares formed the certificate
    /// (including the sender where it prepared locally).
    pub prepare_senders: Vec<ReplicaId>,
}

impl PreparedEvidence {
    pub fn batch_digest(&self) -> Digest {
        self.batch.digest()
    }
}

/// Signed declaration that the sender has abandoned views below `view`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewChange {
    /// The view the sender wants to move to.
    pub view: View,
    pub last_stable: Seqno,
    /// `2f+1` signed checkpoints proving `last_stable` is stable. Empty at
    /// genesis where nothing has been checkpointed yet.
    pub stable_proof: Vec<Checkpoint>,
    /// Per-slot prepared evidence for the window above `last_stable`.
    pub prepared: Vec<PreparedEvidence>,
    pub sender: ReplicaId,
    pub auth: Authenticator,
}

impl ViewChange {
    pub fn signing_digest(&self) -> Digest {
        let mut parts: Vec<Vec<u8>> = vec![
            DOMAIN_VIEW_CHANGE.to_vec(),
            self.view.to_le_bytes().to_vec(),
            self.last_stable.to_le_bytes().to_vec(),
            self.sender.0.to_le_bytes().to_vec(),
        ];
        for cp in &self.stable_proof {
            parts.push(cp.signing_digest().0.to_vec());
        }
        for ev in &self.prepared {
            parts.push(ev.seqno.to_le_bytes().to_vec());
            parts.push(ev.view.to_le_bytes().to_vec());
            parts.push(ev.batch.digest().0.to_vec());
            for s in &ev.prepare_senders {
                parts.push(s.0.to_le_bytes().to_vec());
            }
        }
        let refs: Vec<&[u8]> = parts.iter().map(|p| p.as_slice()).collect();
        Digest::of_parts(&refs)
    }
}

/// The new primary's signed installation message for `view`: the `2f+1`
/// view changes it collected and the pre-prepares it re-issues from them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewView {
    pub view: View,
    pub view_changes: Vec<ViewChange>,
    /// Re-issued pre-prepares for the new-view window, null batches for
    /// slots without prepared evidence.
    pub pre_prepares: Vec<PrePrepare>,
    pub sender: ReplicaId,
    pub auth: Authenticator,
}

impl NewView {
    pub fn signing_digest(&self) -> Digest {
        let mut parts: Vec<Vec<u8>> = vec![
            DOMAIN_NEW_VIEW.to_vec(),
            self.view.to_le_bytes().to_vec(),
            self.sender.0.to_le_bytes().to_vec(),
        ];
        for vc in &self.view_changes {
            parts.push(vc.signing_digest().0.to_vec());
        }
        for pp in &self.pre_prepares {
            parts.push(pp.signing_digest().0.to_vec());
        }
        let refs: Vec<&[u8]> = parts.iter().map(|p| p.as_slice()).collect();
        Digest::of_parts(&refs)
    }
}

/// Anti-entropy summary of the sender's progress; prompts retransmission
/// and state transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub view: View,
    pub last_exec: Seqno,
    pub last_committed: Seqno,
    pub last_stable: Seqno,
    /// In-window slots the sender has no pre-prepare for.
    pub missing: Vec<Seqno>,
    pub sender: ReplicaId,
    pub auth: Authenticator,
}

impl Status {
    pub fn signing_digest(&self) -> Digest {
        let mut parts: Vec<Vec<u8>> = vec![
            DOMAIN_STATUS.to_vec(),
            self.view.to_le_bytes().to_vec(),
            self.last_exec.to_le_bytes().to_vec(),
            self.last_committed.to_le_bytes().to_vec(),
            self.last_stable.to_le_bytes().to_vec(),
            self.sender.0.to_le_bytes().to_vec(),
        ];
        for s in &self.missing {
            parts.push(s.to_le_bytes().to_vec());
        }
        let refs: Vec<&[u8]> = parts.iter().map(|p| p.as_slice()).collect();
        Digest::of_parts(&refs)
    }
}

/// Probe for peers' stability state, used by a recovering replica to seed
/// its stable estimator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryStable {
    /// Correlates replies with the query round.
    pub nonce: u64,
    pub sender: ReplicaId,
    pub auth: Authenticator,
}

impl QueryStable {
    pub fn signing_digest(&self) -> Digest {
        Digest::of_parts(&[
            b"query-stable:",
            &self.nonce.to_le_bytes(),
            &self.sender.0.to_le_bytes(),
        ])
    }
}

/// A peer's answer to [`QueryStable`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyStable {
    pub nonce: u64,
    /// Highest checkpoint the sender has taken.
    pub last_checkpoint: Seqno,
    /// Highest seqno the sender has prepared.
    pub last_prepared: Seqno,
    pub sender: ReplicaId,
    pub auth: Authenticator,
}

impl ReplyStable {
    pub fn signing_digest(&self) -> Digest {
        Digest::of_parts(&[
            b"reply-stable:",
            &self.nonce.to_le_bytes(),
            &self.last_checkpoint.to_le_bytes(),
            &self.last_prepared.to_le_bytes(),
            &self.sender.0.to_le_bytes(),
        ])
    }
}

/// Request for missing ordered entries or a stable snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fetch {
    /// First seqno wanted (exclusive of what the sender already executed).
    pub from: Seqno,
    /// Last seqno wanted, inclusive.
    pub to: Seqno,
    /// Known target the reply must be consistent with, when the fetcher has
    /// a stability estimate: `(seqno, state_digest)`.
    pub target: Option<(Seqno, Digest)>,
    pub sender: ReplicaId,
    pub auth: Authenticator,
}

impl Fetch {
    pub fn signing_digest(&self) -> Digest {
        let (ts, td) = match &self.target {
            Some((s, d)) => (*s, *d),
            None => (0, Digest::ZERO),
        };
        Digest::of_parts(&[
            DOMAIN_FETCH,
            &self.from.to_le_bytes(),
            &self.to.to_le_bytes(),
            &ts.to_le_bytes(),
            td.as_bytes(),
            &self.sender.0.to_le_bytes(),
        ])
    }
}

/// One unit of state transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchChunk {
    /// A stable application snapshot plus the checkpoint quorum proving it.
    Snapshot {
        seqno: Seqno,
        state_digest: Digest,
        chunks: Vec<Vec<u8>>,
        /// `2f+1` signed checkpoints for `(seqno, state_digest)`.
        proof: Vec<Checkpoint>,
    },
    /// Committed pre-prepares for re-execution, in seqno order.
    Batches { entries: Vec<PrePrepare> },
}

/// Reply to a [`Fetch`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchReply {
    pub chunk: FetchChunk,
    pub sender: ReplicaId,
    pub auth: Authenticator,
}

impl FetchReply {
    pub fn signing_digest(&self) -> Digest {
        let chunk_digest = match &self.chunk {
            FetchChunk::Snapshot {
                seqno,
                state_digest,
                chunks,
                ..
            } => {
                let mut parts: Vec<&[u8]> = vec![b"chunk-snapshot:", state_digest.as_bytes()];
                let seq = seqno.to_le_bytes();
                parts.push(&seq);
                for c in chunks {
                    parts.push(c.as_slice());
                }
                Digest::of_parts(&parts)
            }
            FetchChunk::Batches { entries } => {
                let pp_digests: Vec<Digest> =
                    entries.iter().map(|pp| pp.signing_digest()).collect();
                let mut parts: Vec<&[u8]> = vec![b"chunk-batches:"];
                for d in &pp_digests {
                    parts.push(d.as_bytes());
                }
                Digest::of_parts(&parts)
            }
        };
        Digest::of_parts(&[
            b"fetch-reply:",
            chunk_digest.as_bytes(),
            &self.sender.0.to_le_bytes(),
        ])
    }
}

/// Every message that can appear on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolMessage {
    Request(Request),
    PrePrepare(PrePrepare),
    Prepare(Prepare),
    Commit(Commit),
    Checkpoint(Checkpoint),
    ViewChange(ViewChange),
    NewView(Box<NewView>),
    Status(Status),
    QueryStable(QueryStable),
    ReplyStable(ReplyStable),
    Fetch(Fetch),
    FetchReply(Box<FetchReply>),
    Reply(Reply),
}

impl ProtocolMessage {
    /// Message kind name for logs and telemetry.
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolMessage::Request(_) => "Request",
            ProtocolMessage::PrePrepare(_) => "PrePrepare",
            ProtocolMessage::Prepare(_) => "Prepare",
            ProtocolMessage::Commit(_) => "Commit",
            ProtocolMessage::Checkpoint(_) => "Checkpoint",
            ProtocolMessage::ViewChange(_) => "ViewChange",
            ProtocolMessage::NewView(_) => "NewView",
            ProtocolMessage::Status(_) => "Status",
            ProtocolMessage::QueryStable(_) => "QueryStable",
            ProtocolMessage::ReplyStable(_) => "ReplyStable",
            ProtocolMessage::Fetch(_) => "Fetch",
            ProtocolMessage::FetchReply(_) => "FetchReply",
            ProtocolMessage::Reply(_) => "Reply",
        }
    }

    /// The replica that produced this message; `None` for client requests.
    pub fn replica_sender(&self) -> Option<ReplicaId> {
        match self {
            ProtocolMessage::Request(_) => None,
            ProtocolMessage::PrePrepare(m) => Some(m.sender),
            ProtocolMessage::Prepare(m) => Some(m.sender),
            ProtocolMessage::Commit(m) => Some(m.sender),
            ProtocolMessage::Checkpoint(m) => Some(m.sender),
            ProtocolMessage::ViewChange(m) => Some(m.sender),
            ProtocolMessage::NewView(m) => Some(m.sender),
            ProtocolMessage::Status(m) => Some(m.sender),
            ProtocolMessage::QueryStable(m) => Some(m.sender),
            ProtocolMessage::ReplyStable(m) => Some(m.sender),
            ProtocolMessage::Fetch(m) => Some(m.sender),
            ProtocolMessage::FetchReply(m) => Some(m.sender),
            ProtocolMessage::Reply(m) => Some(m.replica),
        }
    }
}
