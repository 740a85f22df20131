//! Checkpoint aggregation, stability, and the stable estimator.
//!
//! Every `CHECKPOINT_INTERVAL` executions a replica attests its state
//! digest. A checkpoint seqno becomes stable at `2f+1` matching signed
//! attestations; stability anchors log truncation. The estimator lets a
//! replica that lost track of the network's progress bootstrap its
//! stability low-water mark from peers' `ReplyStable` answers.

use crate::certificate::{Certificate, CertificateError, Vote};
use palisade_types::{Checkpoint, Digest, ReplicaId, Seqno};
use std::collections::BTreeMap;
use tracing::debug;

/// Checkpoint vote: agrees on the state digest for one seqno.
#[derive(Debug, Clone)]
pub struct CheckpointVote(pub Checkpoint);

impl Vote for CheckpointVote {
    type Value = Digest;
    fn sender(&self) -> ReplicaId {
        self.0.sender
    }
    fn value(&self) -> Digest {
        self.0.state_digest
    }
}

/// Outcome of feeding one checkpoint into the collector.
#[derive(Debug, PartialEq, Eq)]
pub enum CheckpointOutcome {
    /// Absorbed; nothing newly stable.
    Accepted,
    /// This checkpoint made its seqno stable locally.
    Stable(Seqno, Digest),
    /// A quorum formed for a seqno this replica has not executed yet: the
    /// network is ahead; stability installs once we catch up.
    StableAhead(Seqno, Digest),
    /// Below the stable low-water mark; dropped.
    Stale,
    /// Second digest from the same sender for one seqno.
    Equivocation { first: Digest, second: Digest },
    /// Duplicate retransmission; dropped.
    Duplicate,
}

/// Aggregates checkpoint attestations and tracks the stable prefix.
#[derive(Debug)]
pub struct CheckpointCollector {
    quorum: usize,
    certs: BTreeMap<Seqno, Certificate<CheckpointVote>>,
    last_stable: Seqno,
    stable_digest: Digest,
    /// The quorum of signed checkpoints proving `last_stable`.
    stable_proof: Vec<Checkpoint>,
    /// Highest checkpoint this replica itself has taken.
    own_last: Seqno,
}

impl CheckpointCollector {
    pub fn new(quorum: usize) -> Self {
        CheckpointCollector {
            quorum,
            certs: BTreeMap::new(),
            last_stable: 0,
            stable_digest: Digest::ZERO,
            stable_proof: Vec::new(),
            own_last: 0,
        }
    }

    pub fn last_stable(&self) -> Seqno {
        self.last_stable
    }

    pub fn stable_digest(&self) -> Digest {
        self.stable_digest
    }

    pub fn stable_proof(&self) -> &[Checkpoint] {
        &self.stable_proof
    }

    pub fn own_last_checkpoint(&self) -> Seqno {
        self.own_last
    }

    /// Highest seqno with any checkpoint evidence from `weak` distinct
    /// senders; lag detection for state transfer.
    pub fn evidence_above(&self, weak: usize) -> Option<Seqno> {
        self.certs
            .iter()
            .rev()
            .find(|(_, cert)| cert.len() >= weak)
            .map(|(s, _)| *s)
    }

    /// Feed one verified checkpoint. `mine` marks our own attestation;
    /// `executed_up_to` gates stability so the low-water mark never passes
    /// local execution.
    pub fn add(&mut self, cp: Checkpoint, mine: bool, executed_up_to: Seqno) -> CheckpointOutcome {
        if cp.seqno <= self.last_stable {
            return CheckpointOutcome::Stale;
        }
        if mine {
            self.own_last = self.own_last.max(cp.seqno);
        }
        let seqno = cp.seqno;
        let digest = cp.state_digest;
        let quorum = self.quorum;
        let cert = self
            .certs
            .entry(seqno)
            .or_insert_with(|| Certificate::new(quorum));

        if cert.is_complete() {
            // A quorum formed while we lagged; install once execution
            // catches up and our own checkpoint confirms the digest.
            if cert.value() == Some(&digest) && executed_up_to >= seqno {
                self.mark_stable(seqno, digest);
                return CheckpointOutcome::Stable(seqno, digest);
            }
            return CheckpointOutcome::Duplicate;
        }

        match cert.add(CheckpointVote(cp), mine) {
            Ok(true) => {
                if executed_up_to >= seqno {
                    self.mark_stable(seqno, digest);
                    CheckpointOutcome::Stable(seqno, digest)
                } else {
                    CheckpointOutcome::StableAhead(seqno, digest)
                }
            }
            Ok(false) => CheckpointOutcome::Accepted,
            Err(CertificateError::Conflicting(sender)) => {
                let first = cert
                    .vote_of(sender)
                    .map(|v| v.0.state_digest)
                    .unwrap_or(Digest::ZERO);
                debug!(%sender, seqno, "conflicting checkpoint digest");
                CheckpointOutcome::Equivocation {
                    first,
                    second: digest,
                }
            }
            Err(CertificateError::Duplicate(_)) | Err(CertificateError::Complete) => {
                CheckpointOutcome::Duplicate
            }
        }
    }

    /// The completed quorum for `seqno`, if one exists.
    pub fn completed_proof(&self, seqno: Seqno) -> Option<(Digest, Vec<Checkpoint>)> {
        let cert = self.certs.get(&seqno)?;
        let digest = *cert.value()?;
        let proof = cert
            .votes_for(&digest)
            .into_iter()
            .map(|v| v.0.clone())
            .collect();
        Some((digest, proof))
    }

    fn mark_stable(&mut self, seqno: Seqno, digest: Digest) {
        let proof = self
            .certs
            .get(&seqno)
            .map(|cert| cert.votes_for(&digest).into_iter().map(|v| v.0.clone()).collect())
            .unwrap_or_default();
        self.last_stable = seqno;
        self.stable_digest = digest;
        self.stable_proof = proof;
        // Certificates at or below the stable mark are garbage.
        self.certs = self.certs.split_off(&(seqno + 1));
    }

    /// Install stability learned from a verified external proof (new-view
    /// stable proof or a transferred snapshot).
    pub fn install_stable(&mut self, seqno: Seqno, digest: Digest, proof: Vec<Checkpoint>) {
        if seqno <= self.last_stable {
            return;
        }
        self.last_stable = seqno;
        self.stable_digest = digest;
        self.stable_proof = proof;
        self.certs = self.certs.split_off(&(seqno + 1));
    }
}

/// Peer-reported stability table.
///
/// For each sender the table keeps `(last_checkpoint, last_prepared)`. The
/// estimate is computed over the whole table after every update: the
/// greatest reported checkpoint seqno that `f+1` senders have checkpointed
/// at-or-above and `2f+1` senders have prepared at-or-above, so at least
/// one correct replica vouches for the state and a prepare quorum exists
/// above it.
#[derive(Debug, Default)]
pub struct StableEstimator {
    table: BTreeMap<ReplicaId, (Seqno, Seqno)>,
}

impl StableEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a peer's `(last_checkpoint, last_prepared)`. Later reports
    /// replace earlier ones from the same sender.
    pub fn add(&mut self, sender: ReplicaId, last_checkpoint: Seqno, last_prepared: Seqno) {
        self.table.insert(sender, (last_checkpoint, last_prepared));
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn clear(&mut self) {
        self.table.clear();
    }

    /// The current low-water-mark estimate, if any candidate satisfies both
    /// thresholds.
    pub fn estimate(&self, weak_quorum: usize, quorum: usize) -> Option<Seqno> {
        let mut candidates: Vec<Seqno> = self.table.values().map(|(lc, _)| *lc).collect();
        candidates.sort_unstable();
        candidates.dedup();
        for s in candidates.into_iter().rev() {
            let checkpointed = self.table.values().filter(|(lc, _)| *lc >= s).count();
            let prepared = self.table.values().filter(|(_, lp)| *lp >= s).count();
            if checkpointed >= weak_quorum && prepared >= quorum {
                return Some(s);
            }
        }
        None
    }
}
