//! View change: retiring a suspected-faulty primary with safety
//! preservation.
//!
//! Replicas that give up on a view broadcast a signed `ViewChange` carrying
//! their stable checkpoint proof and per-slot prepared evidence. The new
//! primary collects `2f+1` of them, deterministically recomputes the
//! re-proposal for the window, and broadcasts a signed `NewView` embedding
//! the view changes it used. Acceptors recompute the same plan from the
//! embedded view changes and reject any new-view that disagrees, so a
//! faulty primary cannot drop or alter a prepared slot.
//!
//! # Exponential back-off
//!
//! The no-progress timeout doubles with each consecutive failed view
//! change, up to a capped exponent, so repeated changes during partitions
//! do not thrash.

use palisade_types::{
    Authenticator, Batch, Checkpoint, Digest, KeyPair, NewView, PrePrepare, PreparedEvidence,
    ReplicaId, Seqno, Verifier, View, ViewChange,
};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Maximum multiplier for exponential back-off (2^5 = 32x base timeout).
const MAX_BACKOFF_EXPONENT: u32 = 5;

/// Back-off state for the no-progress timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct ViewChangeBackoff {
    exponent: u32,
}

impl ViewChangeBackoff {
    /// The timeout to arm next, given the configured base.
    pub fn current_timeout(&self, base: Duration) -> Duration {
        base * 2u32.pow(self.exponent.min(MAX_BACKOFF_EXPONENT))
    }

    /// A view change failed to restore progress; double the timeout.
    pub fn bump(&mut self) {
        self.exponent = (self.exponent + 1).min(MAX_BACKOFF_EXPONENT);
    }

    /// Progress was made; return to the base timeout.
    pub fn reset(&mut self) {
        self.exponent = 0;
    }
}

/// Collects verified view changes, one per sender per target view.
#[derive(Debug, Default)]
pub struct ViewChangeCollector {
    per_view: BTreeMap<View, BTreeMap<ReplicaId, ViewChange>>,
}

impl ViewChangeCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a verified view change. Returns `false` for duplicates from the
    /// same sender (retransmissions are coalesced, not counted twice).
    pub fn add(&mut self, vc: ViewChange) -> bool {
        let senders = self.per_view.entry(vc.view).or_default();
        if senders.contains_key(&vc.sender) {
            return false;
        }
        senders.insert(vc.sender, vc);
        true
    }

    pub fn count(&self, view: View) -> usize {
        self.per_view.get(&view).map(|m| m.len()).unwrap_or(0)
    }

    /// The first `quorum` view changes for `view` in sender order, once
    /// enough have arrived.
    pub fn quorum(&self, view: View, quorum: usize) -> Option<Vec<ViewChange>> {
        let senders = self.per_view.get(&view)?;
        if senders.len() < quorum {
            return None;
        }
        Some(senders.values().take(quorum).cloned().collect())
    }

    /// Drop state for views at or below `view` (installed or abandoned).
    pub fn prune_through(&mut self, view: View) {
        self.per_view = self.per_view.split_off(&(view + 1));
    }
}

/// The deterministic re-proposal computed from a set of view changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReissuePlan {
    /// Highest proven stable checkpoint among the view changes.
    pub last_stable: Seqno,
    pub stable_digest: Digest,
    pub stable_proof: Vec<Checkpoint>,
    /// `(seqno, batch)` for each slot from `last_stable + 1` through the
    /// highest slot with prepared evidence; null batches fill gaps.
    pub reissue: Vec<(Seqno, Batch)>,
}

/// Compute the re-proposal for `view_changes`, all for the same target view.
///
/// Choice rule per slot: the prepared evidence from the highest view wins.
/// Conflicting digests for one `(slot, view)` cannot both carry real prepare
/// quorums, so ties are broken arbitrarily but deterministically by taking
/// the first in sender order.
pub fn plan_reissue(view_changes: &[ViewChange]) -> ReissuePlan {
    let mut last_stable = 0;
    let mut stable_digest = Digest::ZERO;
    let mut stable_proof: Vec<Checkpoint> = Vec::new();
    for vc in view_changes {
        if vc.last_stable > last_stable {
            last_stable = vc.last_stable;
            stable_proof = vc.stable_proof.clone();
            stable_digest = stable_proof
                .first()
                .map(|cp| cp.state_digest)
                .unwrap_or(Digest::ZERO);
        }
    }

    // Highest-view evidence per slot above the stable mark.
    let mut best: BTreeMap<Seqno, &PreparedEvidence> = BTreeMap::new();
    for vc in view_changes {
        for ev in &vc.prepared {
            if ev.seqno <= last_stable {
                continue;
            }
            match best.get(&ev.seqno) {
                Some(existing) if existing.view >= ev.view => {}
                _ => {
                    best.insert(ev.seqno, ev);
                }
            }
        }
    }

    let max_seqno = best.keys().next_back().copied().unwrap_or(last_stable);
    let reissue = (last_stable + 1..=max_seqno)
        .map(|s| {
            let batch = best
                .get(&s)
                .map(|ev| ev.batch.clone())
                .unwrap_or_else(Batch::null);
            (s, batch)
        })
        .collect();

    ReissuePlan {
        last_stable,
        stable_digest,
        stable_proof,
        reissue,
    }
}

/// Build the signed `NewView` for `view` from a quorum of view changes.
pub fn build_new_view(
    view: View,
    sender: ReplicaId,
    key: &KeyPair,
    view_changes: Vec<ViewChange>,
) -> (NewView, ReissuePlan) {
    let plan = plan_reissue(&view_changes);
    let pre_prepares = plan
        .reissue
        .iter()
        .map(|(seqno, batch)| {
            let mut pp = PrePrepare {
                view,
                seqno: *seqno,
                batch: batch.clone(),
                sender,
                auth: Authenticator::Signed(palisade_types::Signature::zero()),
            };
            pp.auth = Authenticator::signed(key, &pp.signing_digest());
            pp
        })
        .collect();

    let mut nv = NewView {
        view,
        view_changes,
        pre_prepares,
        sender,
        auth: Authenticator::Signed(palisade_types::Signature::zero()),
    };
    nv.auth = Authenticator::signed(key, &nv.signing_digest());
    (nv, plan)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NewViewError {
    #[error("new-view not signed by the primary of its view")]
    WrongSender,
    #[error("bad authenticator on new-view")]
    BadAuth,
    #[error("embedded view change invalid")]
    BadViewChange,
    #[error("view-change quorum not met: {0} senders")]
    NoQuorum(usize),
    #[error("re-issued pre-prepares disagree with the view changes")]
    InconsistentReissue,
}

/// Verify a `NewView` and return the install plan.
///
/// Checks: primary identity, signature, `2f+1` verified view changes from
/// distinct senders all targeting this view (each with a valid stable
/// proof), and that the embedded pre-prepares equal the deterministic
/// recomputation from those view changes.
pub fn verify_new_view(nv: &NewView, verifier: &Verifier) -> Result<ReissuePlan, NewViewError> {
    let principals = verifier.principals();
    if principals.primary(nv.view) != nv.sender {
        return Err(NewViewError::WrongSender);
    }
    if verifier
        .verify(&palisade_types::ProtocolMessage::NewView(Box::new(nv.clone())))
        .is_err()
    {
        return Err(NewViewError::BadAuth);
    }

    let mut senders = std::collections::BTreeSet::new();
    for vc in &nv.view_changes {
        if vc.view != nv.view {
            return Err(NewViewError::BadViewChange);
        }
        if verify_view_change(vc, verifier).is_err() {
            return Err(NewViewError::BadViewChange);
        }
        senders.insert(vc.sender);
    }
    if senders.len() < principals.quorum() {
        return Err(NewViewError::NoQuorum(senders.len()));
    }

    let plan = plan_reissue(&nv.view_changes);
    if nv.pre_prepares.len() != plan.reissue.len() {
        warn!(
            view = nv.view,
            got = nv.pre_prepares.len(),
            want = plan.reissue.len(),
            "new-view re-issue length mismatch"
        );
        return Err(NewViewError::InconsistentReissue);
    }
    for (pp, (seqno, batch)) in nv.pre_prepares.iter().zip(&plan.reissue) {
        if pp.view != nv.view
            || pp.seqno != *seqno
            || pp.sender != nv.sender
            || pp.batch.digest() != batch.digest()
        {
            return Err(NewViewError::InconsistentReissue);
        }
    }
    debug!(view = nv.view, slots = plan.reissue.len(), "new-view verified");
    Ok(plan)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ViewChangeError {
    #[error("bad authenticator on view change")]
    BadAuth,
    #[error("invalid stable checkpoint proof")]
    BadStableProof,
}

/// Verify a single view change: signature plus its stable proof. A zero
/// `last_stable` needs no proof; anything higher needs a checkpoint quorum.
pub fn verify_view_change(vc: &ViewChange, verifier: &Verifier) -> Result<(), ViewChangeError> {
    if verifier
        .verify(&palisade_types::ProtocolMessage::ViewChange(vc.clone()))
        .is_err()
    {
        return Err(ViewChangeError::BadAuth);
    }
    if vc.last_stable == 0 {
        return Ok(());
    }
    let digest = vc
        .stable_proof
        .first()
        .map(|cp| cp.state_digest)
        .unwrap_or(Digest::ZERO);
    if verifier.verify_checkpoint_proof(vc.last_stable, &digest, &vc.stable_proof) {
        Ok(())
    } else {
        Err(ViewChangeError::BadStableProof)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_types::{
        ClientDirectory, Principal, PrincipalSet, ProtocolMessage, Request, Signature,
    };

    fn setup() -> (PrincipalSet, Vec<KeyPair>, Verifier) {
        let keys: Vec<KeyPair> = (0..4).map(|i| KeyPair::from_seed(&[i as u8 + 1; 32])).collect();
        let principals = keys
            .iter()
            .enumerate()
            .map(|(i, k)| Principal {
                id: ReplicaId(i as u32),
                verifying_key: k.public_bytes(),
                mac_seed: *k.mac_seed(),
            })
            .collect();
        let set = PrincipalSet::new(principals, 1).unwrap();
        let verifier = Verifier::for_replica(set.clone(), ClientDirectory::new(), ReplicaId(3));
        (set, keys, verifier)
    }

    fn batch(tag: &[u8]) -> Batch {
        let req = Request {
            client: palisade_types::ClientId(1),
            request_id: 1,
            payload: tag.to_vec(),
            read_only: false,
            signature: Signature::zero(),
        };
        Batch {
            digests: vec![req.digest()],
            requests: vec![req],
            non_det: vec![],
        }
    }

    fn view_change(
        key: &KeyPair,
        sender: u32,
        view: View,
        prepared: Vec<PreparedEvidence>,
    ) -> ViewChange {
        let mut vc = ViewChange {
            view,
            last_stable: 0,
            stable_proof: vec![],
            prepared,
            sender: ReplicaId(sender),
            auth: Authenticator::Signed(Signature::zero()),
        };
        vc.auth = Authenticator::signed(key, &vc.signing_digest());
        vc
    }

    fn evidence(seqno: Seqno, view: View, b: Batch) -> PreparedEvidence {
        PreparedEvidence {
            seqno,
            view,
            batch: b,
            prepare_senders: vec![ReplicaId(0), ReplicaId(1), ReplicaId(2)],
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut b = ViewChangeBackoff::default();
        let base = Duration::from_secs(1);
        assert_eq!(b.current_timeout(base), base);
        b.bump();
        assert_eq!(b.current_timeout(base), base * 2);
        for _ in 0..10 {
            b.bump();
        }
        assert_eq!(b.current_timeout(base), base * 32);
        b.reset();
        assert_eq!(b.current_timeout(base), base);
    }

    #[test]
    fn collector_coalesces_duplicates() {
        let (_, keys, _) = setup();
        let mut col = ViewChangeCollector::new();
        let vc = view_change(&keys[0], 0, 1, vec![]);
        assert!(col.add(vc.clone()));
        assert!(!col.add(vc));
        assert_eq!(col.count(1), 1);
        assert!(col.quorum(1, 3).is_none());
    }

    #[test]
    fn reissue_prefers_highest_view_evidence() {
        let (_, keys, _) = setup();
        let b_old = batch(b"old");
        let b_new = batch(b"new");
        let vcs = vec![
            view_change(&keys[0], 0, 2, vec![evidence(1, 0, b_old.clone())]),
            view_change(&keys[1], 1, 2, vec![evidence(1, 1, b_new.clone())]),
            view_change(&keys[2], 2, 2, vec![]),
        ];
        let plan = plan_reissue(&vcs);
        assert_eq!(plan.last_stable, 0);
        assert_eq!(plan.reissue.len(), 1);
        assert_eq!(plan.reissue[0].1.digest(), b_new.digest());
    }

    #[test]
    fn reissue_fills_gaps_with_null_batches() {
        let (_, keys, _) = setup();
        let b = batch(b"prepared@3");
        let vcs = vec![
            view_change(&keys[0], 0, 1, vec![evidence(3, 0, b.clone())]),
            view_change(&keys[1], 1, 1, vec![]),
            view_change(&keys[2], 2, 1, vec![]),
        ];
        let plan = plan_reissue(&vcs);
        assert_eq!(plan.reissue.len(), 3);
        assert!(plan.reissue[0].1.is_null());
        assert!(plan.reissue[1].1.is_null());
        assert_eq!(plan.reissue[2].1.digest(), b.digest());
    }

    #[test]
    fn new_view_round_trip_verifies() {
        let (_, keys, verifier) = setup();
        let b = batch(b"keep");
        let vcs = vec![
            view_change(&keys[0], 0, 1, vec![evidence(1, 0, b.clone())]),
            view_change(&keys[2], 2, 1, vec![]),
            view_change(&keys[3], 3, 1, vec![]),
        ];
        // Primary of view 1 is replica 1.
        let (nv, plan) = build_new_view(1, ReplicaId(1), &keys[1], vcs);
        assert_eq!(plan.reissue.len(), 1);
        let verified = verify_new_view(&nv, &verifier).unwrap();
        assert_eq!(verified, plan);
    }

    #[test]
    fn new_view_from_wrong_primary_rejected() {
        let (_, keys, verifier) = setup();
        let vcs = vec![
            view_change(&keys[0], 0, 1, vec![]),
            view_change(&keys[2], 2, 1, vec![]),
            view_change(&keys[3], 3, 1, vec![]),
        ];
        let (nv, _) = build_new_view(1, ReplicaId(2), &keys[2], vcs);
        assert_eq!(verify_new_view(&nv, &verifier), Err(NewViewError::WrongSender));
    }

    #[test]
    fn new_view_dropping_prepared_slot_rejected() {
        let (_, keys, verifier) = setup();
        let b = batch(b"must-survive");
        let vcs = vec![
            view_change(&keys[0], 0, 1, vec![evidence(1, 0, b)]),
            view_change(&keys[2], 2, 1, vec![]),
            view_change(&keys[3], 3, 1, vec![]),
        ];
        let (mut nv, _) = build_new_view(1, ReplicaId(1), &keys[1], vcs);
        // A faulty primary rewrites the slot as null.
        nv.pre_prepares[0].batch = Batch::null();
        nv.pre_prepares[0].auth =
            Authenticator::signed(&keys[1], &nv.pre_prepares[0].signing_digest());
        nv.auth = Authenticator::signed(&keys[1], &nv.signing_digest());
        assert_eq!(
            verify_new_view(&nv, &verifier),
            Err(NewViewError::InconsistentReissue)
        );
    }
}
