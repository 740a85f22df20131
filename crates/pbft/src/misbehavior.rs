//! Immutable record of observed replica misbehavior.
//!
//! Evidence is recorded and surfaced on the operator channel; the protocol
//! never retaliates and never halts over it.

use palisade_types::{Digest, ReplicaId, Seqno, View};

/// What a replica was observed doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MisbehaviorKind {
    /// Two pre-prepares for the same `(view, seqno)` with different digests.
    EquivocatingPrePrepare {
        view: View,
        seqno: Seqno,
        first: Digest,
        second: Digest,
    },
    /// Two votes (prepare/commit) from one sender for different values.
    ConflictingVote { view: View, seqno: Seqno },
    /// Two checkpoints for one seqno with different state digests.
    ConflictingCheckpoint {
        seqno: Seqno,
        first: Digest,
        second: Digest,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MisbehaviorRecord {
    pub offender: ReplicaId,
    pub kind: MisbehaviorKind,
}

impl MisbehaviorRecord {
    /// One-line operator-channel rendering.
    pub fn describe(&self) -> String {
        match &self.kind {
            MisbehaviorKind::EquivocatingPrePrepare {
                view,
                seqno,
                first,
                second,
            } => format!(
                "{} equivocated pre-prepare at v={} s={}: {:?} vs {:?}",
                self.offender, view, seqno, first, second
            ),
            MisbehaviorKind::ConflictingVote { view, seqno } => format!(
                "{} sent conflicting votes at v={} s={}",
                self.offender, view, seqno
            ),
            MisbehaviorKind::ConflictingCheckpoint {
                seqno,
                first,
                second,
            } => format!(
                "{} sent conflicting checkpoints at s={}: {:?} vs {:?}",
                self.offender, seqno, first, second
            ),
        }
    }
}

/// Append-only misbehavior log.
#[derive(Debug, Default)]
pub struct MisbehaviorLog {
    records: Vec<MisbehaviorRecord>,
}

impl MisbehaviorLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, offender: ReplicaId, kind: MisbehaviorKind) -> &MisbehaviorRecord {
        let idx = self.records.len();
        self.records.push(MisbehaviorRecord { offender, kind });
        &self.records[idx]
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MisbehaviorRecord> {
        self.records.iter()
    }
}
