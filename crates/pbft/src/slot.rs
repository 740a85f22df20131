//! Per-seqno ordering state.
//!
//! A slot carries at most one pre-prepare per view, the prepare and commit
//! certificates for it, and the one-shot `prepared`/`committed`/`executed`
//! flags derived from them.

use crate::certificate::{Certificate, Vote};
use crate::log::LogEntry;
use palisade_types::{Commit, Digest, PrePrepare, Prepare, ReplicaId, View};

/// Prepare vote: agrees on `(view, batch_digest)` for the slot's seqno.
#[derive(Debug, Clone)]
pub struct PrepareVote(pub Prepare);

impl Vote for PrepareVote {
    type Value = (View, Digest);
    fn sender(&self) -> ReplicaId {
        self.0.sender
    }
    fn value(&self) -> (View, Digest) {
        (self.0.view, self.0.batch_digest)
    }
}

/// Commit vote: agrees on `(view, batch_digest)` for the slot's seqno.
#[derive(Debug, Clone)]
pub struct CommitVote(pub Commit);

impl Vote for CommitVote {
    type Value = (View, Digest);
    fn sender(&self) -> ReplicaId {
        self.0.sender
    }
    fn value(&self) -> (View, Digest) {
        (self.0.view, self.0.batch_digest)
    }
}

/// Ordering state for one sequence number.
#[derive(Debug)]
pub struct Slot {
    pub pre_prepare: Option<PrePrepare>,
    pub prepares: Certificate<PrepareVote>,
    pub commits: Certificate<CommitVote>,
    /// One-shot transition flags.
    pub prepared: bool,
    pub committed: bool,
    pub executed: bool,
}

impl Slot {
    pub fn new(quorum: usize) -> Self {
        Slot {
            pre_prepare: None,
            prepares: Certificate::new(quorum),
            commits: Certificate::new(quorum),
            prepared: false,
            committed: false,
            executed: false,
        }
    }

    /// The accepted pre-prepare's `(view, batch_digest)`, if any.
    pub fn accepted_value(&self) -> Option<(View, Digest)> {
        self.pre_prepare
            .as_ref()
            .map(|pp| (pp.view, pp.batch_digest()))
    }

    /// The digest this replica promised with its own prepare, if it sent one.
    pub fn own_prepare_value(&self) -> Option<(View, Digest)> {
        self.prepares.mine().map(|p| p.value())
    }
}

impl LogEntry for Slot {
    fn reset(&mut self) {
        self.pre_prepare = None;
        self.prepares.reset();
        self.commits.reset();
        self.prepared = false;
        self.committed = false;
        self.executed = false;
    }

    fn is_empty(&self) -> bool {
        self.pre_prepare.is_none() && self.prepares.is_empty() && self.commits.is_empty()
    }
}
