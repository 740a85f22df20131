//! The replica state machine.
//!
//! Implements the normal-case ordering protocol (pre-prepare / prepare /
//! commit), in-order execution dispatch into the application kernel,
//! checkpointing and log truncation, view changes, and state transfer, as a
//! synchronous event-driven machine.
//!
//! # State Machine Flow
//!
//! 1. **Request** → admit to the client table; primary batches and
//!    pre-prepares, backups arm the no-progress timer
//! 2. **PrePrepare** → validate, accept, broadcast prepare
//! 3. **Prepare / Commit** → collect certificates; `prepared` at `2f+1`
//!    prepares, `committed` at `2f+1` commits
//! 4. **Execution** → a single cursor advances through committed slots,
//!    invoking the kernel exactly once per request and emitting one ledger
//!    append per executed batch
//! 5. **Checkpoint** → every interval, attest state; a `2f+1` quorum
//!    truncates the log
//! 6. **ViewChangeTimer** → no progress while requests pend; retire the
//!    primary
//! 7. **Fetch / FetchReply** → lagging replicas install a stable snapshot
//!    and re-execute the batches above it

use palisade_core::{Action, ApplicationKernel, Event, StateMachine, TimerId};
use palisade_types::{
    encode, Authenticator, Batch, Checkpoint, ClientDirectory, ClientId, Commit, Digest, Fetch,
    FetchChunk, FetchReply, KeyPair, NewView, PrePrepare, Prepare, PreparedEvidence, PrincipalSet,
    ProtocolMessage, QueryStable, Reply, ReplyStable, Request, RequestId, Seqno, Status, Verifier,
    View, ViewChange,
};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::certificate::CertificateError;
use crate::checkpoint::{CheckpointCollector, CheckpointOutcome};
use crate::client_table::{Admit, ClientTable};
use crate::config::{ConfigError, ReplicaConfig};
use crate::log::{LogEntry, SeqLog};
use crate::misbehavior::{MisbehaviorKind, MisbehaviorLog};
use crate::slot::{CommitVote, PrepareVote, Slot};
use crate::state_transfer::{FetchPhase, StateTransferState};
use crate::view_change::{
    build_new_view, verify_new_view, verify_view_change, ViewChangeBackoff, ViewChangeCollector,
};

/// The replica role: protocol state plus the owned application kernel.
pub struct ReplicaState<K> {
    config: ReplicaConfig,
    principals: PrincipalSet,
    verifier: Verifier,
    key: KeyPair,
    kernel: K,

    // ─── Ordering state ───
    view: View,
    log: SeqLog<Slot>,
    /// Next seqno this replica will assign when primary.
    next_pp_seq: Seqno,
    last_exec: Seqno,
    last_committed: Seqno,
    /// Highest locally prepared seqno; reported in `ReplyStable`.
    last_prepared: Seqno,

    // ─── Collaborating components ───
    checkpoints: CheckpointCollector,
    client_table: ClientTable,
    view_changes: ViewChangeCollector,
    backoff: ViewChangeBackoff,
    transfer: StateTransferState,
    misbehavior: MisbehaviorLog,

    /// Snapshots captured at our own checkpoints, served to lagging peers.
    checkpoint_snapshots: BTreeMap<Seqno, Vec<Vec<u8>>>,

    // ─── Mode flags ───
    /// In view-change mode: ordering messages for the old view are refused.
    view_changing: bool,
    /// The view we are trying to install while view-changing.
    pending_view: Option<View>,
    /// Kernel failure is terminal; the replica stops participating.
    halted: bool,

    /// Highest committed seqno observed anywhere, for fetch targets.
    committed_hint: Seqno,

    now: Duration,
}

impl<K> std::fmt::Debug for ReplicaState<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaState")
            .field("id", &self.config.id)
            .field("view", &self.view)
            .field("last_exec", &self.last_exec)
            .field("last_committed", &self.last_committed)
            .field("last_stable", &self.checkpoints.last_stable())
            .field("view_changing", &self.view_changing)
            .field("halted", &self.halted)
            .finish()
    }
}

impl<K: ApplicationKernel> ReplicaState<K> {
    pub fn new(
        config: ReplicaConfig,
        principals: PrincipalSet,
        clients: ClientDirectory,
        key: KeyPair,
        kernel: K,
    ) -> Result<Self, ConfigError> {
        config.validate(principals.n())?;
        let quorum = principals.quorum();
        let log = SeqLog::new(config.max_out, 1, || Slot::new(quorum));
        let verifier = Verifier::for_replica(principals.clone(), clients, config.id);
        let transfer = StateTransferState::new(config.fetch_retry_budget);
        Ok(ReplicaState {
            verifier,
            key,
            kernel,
            view: 0,
            log,
            next_pp_seq: 1,
            last_exec: 0,
            last_committed: 0,
            last_prepared: 0,
            checkpoints: CheckpointCollector::new(quorum),
            client_table: ClientTable::new(),
            view_changes: ViewChangeCollector::new(),
            backoff: ViewChangeBackoff::default(),
            transfer,
            misbehavior: MisbehaviorLog::new(),
            checkpoint_snapshots: BTreeMap::new(),
            view_changing: false,
            pending_view: None,
            halted: false,
            committed_hint: 0,
            now: Duration::ZERO,
            config,
            principals,
        })
    }

    /// Arm the periodic timers. Call once at startup.
    pub fn init(&mut self) -> Vec<Action> {
        info!(id = %self.config.id, n = self.principals.n(), f = self.principals.f(), "replica starting");
        vec![Action::SetTimer {
            id: TimerId::Status,
            duration: self.config.status_interval,
        }]
    }

    // ─── Accessors (used by tests and the hosting runner) ───

    pub fn id(&self) -> palisade_types::ReplicaId {
        self.config.id
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn last_exec(&self) -> Seqno {
        self.last_exec
    }

    pub fn last_committed(&self) -> Seqno {
        self.last_committed
    }

    pub fn last_stable(&self) -> Seqno {
        self.checkpoints.last_stable()
    }

    pub fn log_head(&self) -> Seqno {
        self.log.head()
    }

    pub fn is_primary(&self) -> bool {
        self.principals.is_primary(self.view, self.config.id)
    }

    pub fn is_view_changing(&self) -> bool {
        self.view_changing
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn misbehavior(&self) -> &MisbehaviorLog {
        &self.misbehavior
    }

    /// Debugging view of the ordering window.
    pub fn dump_state(&self) -> String {
        format!(
            "view: {} last_exec: {} last_committed: {} last_stable: {}\n{}",
            self.view,
            self.last_exec,
            self.last_committed,
            self.checkpoints.last_stable(),
            self.log.dump_state()
        )
    }

    // ─── Small helpers ───

    fn hot_auth(&self, digest: &Digest) -> Authenticator {
        Authenticator::for_mode(self.config.sig_mode, &self.key, self.principals.n(), digest)
    }

    /// Primary assignment bound: `s` must stay strictly below
    /// `last_stable + MAX_OUT`.
    fn in_ordering_window(&self, s: Seqno) -> bool {
        let stable = self.checkpoints.last_stable();
        s > stable && s < stable + self.config.max_out
    }

    fn make_prepare(&self, seqno: Seqno, batch_digest: Digest) -> Prepare {
        let mut p = Prepare {
            view: self.view,
            seqno,
            batch_digest,
            sender: self.config.id,
            auth: Authenticator::Signed(palisade_types::Signature::zero()),
        };
        p.auth = self.hot_auth(&p.signing_digest());
        p
    }

    fn make_commit(&self, seqno: Seqno, batch_digest: Digest) -> Commit {
        let mut c = Commit {
            view: self.view,
            seqno,
            batch_digest,
            sender: self.config.id,
            auth: Authenticator::Signed(palisade_types::Signature::zero()),
        };
        c.auth = self.hot_auth(&c.signing_digest());
        c
    }

    fn make_checkpoint(&self, seqno: Seqno, state_digest: Digest) -> Checkpoint {
        let mut cp = Checkpoint {
            seqno,
            state_digest,
            sender: self.config.id,
            auth: Authenticator::Signed(palisade_types::Signature::zero()),
        };
        cp.auth = Authenticator::signed(&self.key, &cp.signing_digest());
        cp
    }

    fn make_reply(
        &self,
        client: ClientId,
        request_id: RequestId,
        result: Vec<u8>,
        state_digest: Digest,
    ) -> Reply {
        let digest = Reply::digest_fields(
            self.view,
            client,
            request_id,
            self.config.id,
            &result,
            &state_digest,
        );
        Reply {
            view: self.view,
            client,
            request_id,
            replica: self.config.id,
            result,
            state_digest,
            signature: self.key.sign(&digest),
        }
    }

    fn make_status(&self) -> Status {
        let stable = self.checkpoints.last_stable();
        let missing: Vec<Seqno> = (self.last_exec.max(stable) + 1..stable + self.config.max_out)
            .filter(|s| {
                self.log
                    .get(*s)
                    .map(|slot| slot.pre_prepare.is_none())
                    .unwrap_or(false)
            })
            .collect();
        let mut st = Status {
            view: self.view,
            last_exec: self.last_exec,
            last_committed: self.last_committed,
            last_stable: stable,
            missing,
            sender: self.config.id,
            auth: Authenticator::Signed(palisade_types::Signature::zero()),
        };
        st.auth = self.hot_auth(&st.signing_digest());
        st
    }

    fn alert(&self, detail: impl Into<String>) -> Action {
        Action::OperatorAlert {
            detail: detail.into(),
        }
    }

    // ─── Requests and batching ───

    fn on_request(&mut self, req: Request) -> Vec<Action> {
        if self
            .verifier
            .verify(&ProtocolMessage::Request(req.clone()))
            .is_err()
        {
            trace!(client = %req.client, "dropping request with bad authenticator");
            return vec![];
        }

        // Read-only requests bypass ordering entirely: execute speculatively
        // and reply; the client needs f+1 matching answers.
        if req.read_only {
            return match self.kernel.execute_read_only(req.client, &req.payload) {
                Ok(result) => {
                    let reply = self.make_reply(
                        req.client,
                        req.request_id,
                        result,
                        self.kernel.state_digest(),
                    );
                    vec![Action::SendReply {
                        client: req.client,
                        reply,
                    }]
                }
                Err(err) => {
                    warn!(%err, client = %req.client, "read-only execution failed");
                    vec![]
                }
            };
        }

        let client = req.client;
        let request_id = req.request_id;
        match self.client_table.admit(req) {
            Admit::Executed => match self.client_table.cached_reply(client, request_id) {
                Some(reply) => vec![Action::SendReply {
                    client,
                    reply: reply.clone(),
                }],
                None => vec![],
            },
            Admit::Pending | Admit::Stale => vec![],
            Admit::Fresh => {
                let mut actions = Vec::new();
                if self.is_primary() && !self.view_changing {
                    actions.extend(self.try_send_pre_prepare());
                    // Accumulate further arrivals behind a short deadline.
                    if self.client_table.has_pending() {
                        actions.push(Action::SetTimer {
                            id: TimerId::Batch,
                            duration: self.config.batch_delay,
                        });
                    }
                } else {
                    // A pending unordered request arms the no-progress timer.
                    actions.push(Action::SetTimer {
                        id: TimerId::ViewChange,
                        duration: self.backoff.current_timeout(self.config.view_change_timeout),
                    });
                }
                actions
            }
        }
    }

    /// Primary path: assign seqnos to queued requests while the window has
    /// room.
    fn try_send_pre_prepare(&mut self) -> Vec<Action> {
        if !self.is_primary() || self.view_changing || self.halted {
            return vec![];
        }
        let mut actions = Vec::new();
        loop {
            let s = self.next_pp_seq;
            if !self.in_ordering_window(s) {
                // Window full: backpressure on the client queue; protocol
                // traffic continues.
                trace!(s, "ordering window full, holding batch");
                break;
            }
            let requests = self
                .client_table
                .next_batch(self.config.max_reqs_per_batch, self.config.max_batch_bytes);
            if requests.is_empty() {
                break;
            }
            let mut non_det = self.kernel.non_det_choice(s, self.config.max_nd_len);
            non_det.truncate(self.config.max_nd_len);
            let batch = Batch {
                digests: requests.iter().map(|r| r.digest()).collect(),
                requests,
                non_det,
            };
            let mut pp = PrePrepare {
                view: self.view,
                seqno: s,
                batch,
                sender: self.config.id,
                auth: Authenticator::Signed(palisade_types::Signature::zero()),
            };
            pp.auth = self.hot_auth(&pp.signing_digest());
            let d = pp.batch_digest();
            self.next_pp_seq += 1;

            debug!(s, view = self.view, reqs = pp.batch.len(), "sending pre-prepare");
            if let Some(slot) = self.log.get_mut(s) {
                slot.pre_prepare = Some(pp.clone());
            }
            actions.push(Action::Broadcast {
                msg: ProtocolMessage::PrePrepare(pp),
            });
            // The primary enters the prepare state as if it had received
            // its own matching prepare; it does not broadcast one.
            let own = self.make_prepare(s, d);
            actions.extend(self.add_prepare_vote(own, true, false));
        }
        actions
    }

    // ─── Pre-prepare acceptance ───

    fn on_pre_prepare(&mut self, pp: PrePrepare) -> Vec<Action> {
        if self.view_changing {
            return vec![];
        }
        if pp.view != self.view {
            trace!(got = pp.view, current = self.view, "pre-prepare for wrong view");
            return vec![];
        }
        if pp.sender != self.principals.primary(pp.view) {
            trace!(sender = %pp.sender, "pre-prepare not from primary");
            return vec![];
        }
        if !self.in_ordering_window(pp.seqno) {
            // Prompt the sender with our status so a lagging primary can
            // trigger state transfer on its side.
            let st = self.make_status();
            return vec![Action::Send {
                to: pp.sender,
                msg: ProtocolMessage::Status(st),
            }];
        }

        let s = pp.seqno;
        let d = pp.batch_digest();
        let sender = pp.sender;

        // One pre-prepare per (view, seqno); a different digest from the
        // same primary is equivocation.
        if let Some(existing) = self.log.get(s).and_then(|slot| slot.pre_prepare.as_ref()) {
            if existing.batch_digest() == d {
                return vec![];
            }
            let first = existing.batch_digest();
            let record = self.misbehavior.record(
                sender,
                MisbehaviorKind::EquivocatingPrePrepare {
                    view: pp.view,
                    seqno: s,
                    first,
                    second: d,
                },
            );
            warn!(s, %sender, "equivocating pre-prepare");
            return vec![Action::OperatorAlert {
                detail: record.describe(),
            }];
        }

        let own_promise = self.log.get(s).and_then(|slot| slot.own_prepare_value());
        let msg = ProtocolMessage::PrePrepare(pp.clone());
        let accepted = match own_promise {
            // We already promised a digest: only the matching pre-prepare is
            // acceptable, and the prepare quorum stands in for the request
            // authenticators.
            Some((v, promised)) => {
                v == pp.view && promised == d && self.verifier.verify_weaker(&msg).is_ok()
            }
            None => {
                if self.verifier.verify(&msg).is_ok() {
                    true
                } else {
                    // Weak path: accept when f+1 strictly-verified prepares
                    // already vouch for this digest, so at least one correct
                    // replica checked the requests.
                    let vouched = self
                        .log
                        .get(s)
                        .map(|slot| slot.prepares.count_for(&(pp.view, d)))
                        .unwrap_or(0)
                        >= self.principals.weak_quorum();
                    vouched && self.verifier.verify_weaker(&msg).is_ok()
                }
            }
        };
        if !accepted {
            trace!(s, "dropping unacceptable pre-prepare");
            return vec![];
        }

        debug!(s, view = pp.view, reqs = pp.batch.len(), "accepted pre-prepare");
        let view = pp.view;
        let primary_vote = Prepare {
            view,
            seqno: s,
            batch_digest: d,
            sender: pp.sender,
            auth: pp.auth.clone(),
        };
        if let Some(slot) = self.log.get_mut(s) {
            slot.pre_prepare = Some(pp);
        }
        // The pre-prepare stands in for the primary's prepare vote.
        let mut actions = self.add_prepare_vote(primary_vote, false, false);
        let own = self.make_prepare(s, d);
        actions.extend(self.add_prepare_vote(own, true, true));
        actions
    }

    /// Record a prepare vote; `broadcast` sends our own vote to peers.
    fn add_prepare_vote(&mut self, prepare: Prepare, mine: bool, broadcast: bool) -> Vec<Action> {
        let s = prepare.seqno;
        let mut actions = Vec::new();
        if broadcast {
            actions.push(Action::Broadcast {
                msg: ProtocolMessage::Prepare(prepare.clone()),
            });
        }
        let outcome = match self.log.get_mut(s) {
            Some(slot) => slot.prepares.add(PrepareVote(prepare), mine),
            None => return actions,
        };
        match outcome {
            Ok(_) => actions.extend(self.check_prepared(s)),
            Err(CertificateError::Conflicting(offender)) => {
                let record = self
                    .misbehavior
                    .record(offender, MisbehaviorKind::ConflictingVote { view: self.view, seqno: s });
                actions.push(Action::OperatorAlert {
                    detail: record.describe(),
                });
            }
            Err(_) => {}
        }
        actions
    }

    fn on_prepare(&mut self, prepare: Prepare) -> Vec<Action> {
        if self.view_changing || prepare.view != self.view {
            return vec![];
        }
        if !self.in_ordering_window(prepare.seqno) {
            return vec![];
        }
        if self
            .verifier
            .verify(&ProtocolMessage::Prepare(prepare.clone()))
            .is_err()
        {
            return vec![];
        }
        self.add_prepare_vote(prepare, false, false)
    }

    /// One-shot prepared transition: matching pre-prepare plus a `2f+1`
    /// prepare certificate.
    fn check_prepared(&mut self, s: Seqno) -> Vec<Action> {
        let Some(slot) = self.log.get(s) else {
            return vec![];
        };
        if slot.prepared {
            return vec![];
        }
        let Some((v, d)) = slot.accepted_value() else {
            return vec![];
        };
        if v != self.view || slot.prepares.count_for(&(v, d)) < self.principals.quorum() {
            return vec![];
        }

        if let Some(slot) = self.log.get_mut(s) {
            slot.prepared = true;
        }
        self.last_prepared = self.last_prepared.max(s);
        debug!(s, view = v, "prepared");

        let commit = self.make_commit(s, d);
        let mut actions = vec![Action::Broadcast {
            msg: ProtocolMessage::Commit(commit.clone()),
        }];
        actions.extend(self.add_commit_vote(commit, true));
        actions
    }

    fn add_commit_vote(&mut self, commit: Commit, mine: bool) -> Vec<Action> {
        let s = commit.seqno;
        let outcome = match self.log.get_mut(s) {
            Some(slot) => slot.commits.add(CommitVote(commit), mine),
            None => return vec![],
        };
        match outcome {
            Ok(_) => self.check_committed(s),
            Err(CertificateError::Conflicting(offender)) => {
                let record = self
                    .misbehavior
                    .record(offender, MisbehaviorKind::ConflictingVote { view: self.view, seqno: s });
                vec![Action::OperatorAlert {
                    detail: record.describe(),
                }]
            }
            Err(_) => vec![],
        }
    }

    fn on_commit(&mut self, commit: Commit) -> Vec<Action> {
        if self.view_changing || commit.view != self.view {
            return vec![];
        }
        if !self.in_ordering_window(commit.seqno) {
            return vec![];
        }
        if self
            .verifier
            .verify(&ProtocolMessage::Commit(commit.clone()))
            .is_err()
        {
            return vec![];
        }
        // Commits for not-yet-prepared slots are stored; the predicate is
        // re-evaluated as prepares arrive.
        self.add_commit_vote(commit, false)
    }

    /// One-shot committed transition: prepared plus a `2f+1` commit
    /// certificate for the same value.
    fn check_committed(&mut self, s: Seqno) -> Vec<Action> {
        let Some(slot) = self.log.get(s) else {
            return vec![];
        };
        if slot.committed || !slot.prepared {
            return vec![];
        }
        let Some((v, d)) = slot.accepted_value() else {
            return vec![];
        };
        if slot.commits.count_for(&(v, d)) < self.principals.quorum() {
            return vec![];
        }

        if let Some(slot) = self.log.get_mut(s) {
            slot.committed = true;
        }
        self.last_committed = self.last_committed.max(s);
        self.committed_hint = self.committed_hint.max(s);
        debug!(s, view = v, "committed");
        self.try_execute()
    }

    // ─── Execution dispatch ───

    /// Advance the execution cursor through consecutive committed slots.
    fn try_execute(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        let mut progressed = false;
        loop {
            let next = self.last_exec + 1;
            let batch = match self.log.get(next) {
                Some(slot) if slot.committed && !slot.executed => slot
                    .pre_prepare
                    .as_ref()
                    .map(|pp| pp.batch.clone()),
                _ => None,
            };
            let Some(batch) = batch else { break };

            match self.execute_batch(next, &batch, &mut actions) {
                Ok(()) => {}
                Err(detail) => {
                    self.halted = true;
                    actions.push(self.alert(detail));
                    return actions;
                }
            }
            if let Some(slot) = self.log.get_mut(next) {
                slot.executed = true;
            }
            self.last_exec = next;
            progressed = true;
            actions.extend(self.maybe_checkpoint());
        }

        if progressed {
            // Progress: the no-progress timer restarts from the base
            // timeout, or stops when nothing is pending.
            self.backoff.reset();
            if self.client_table.has_pending() {
                actions.push(Action::SetTimer {
                    id: TimerId::ViewChange,
                    duration: self.backoff.current_timeout(self.config.view_change_timeout),
                });
            } else {
                actions.push(Action::CancelTimer {
                    id: TimerId::ViewChange,
                });
            }
        }
        actions
    }

    /// Execute one committed batch: kernel calls, replies, ledger append.
    fn execute_batch(
        &mut self,
        seqno: Seqno,
        batch: &Batch,
        actions: &mut Vec<Action>,
    ) -> Result<(), String> {
        for req in &batch.requests {
            if self.client_table.has_executed(req.client, req.request_id) {
                // Exactly-once: the reply cache already answered this one.
                continue;
            }
            let result = self
                .kernel
                .execute(seqno, &batch.non_det, req.client, req.request_id, &req.payload)
                .map_err(|e| format!("kernel failure at s={}: {}", seqno, e))?;
            let reply = self.make_reply(req.client, req.request_id, result, Digest::ZERO);
            self.client_table
                .executed(req.client, req.request_id, reply.clone());
            actions.push(Action::SendReply {
                client: req.client,
                reply,
            });
        }
        if !batch.is_null() {
            let bytes = encode(batch).map_err(|e| format!("ledger encode failed: {}", e))?;
            actions.push(Action::LedgerAppend { bytes });
        }
        trace!(seqno, reqs = batch.len(), "executed batch");
        Ok(())
    }

    /// Take a checkpoint when the cursor crosses an interval boundary.
    fn maybe_checkpoint(&mut self) -> Vec<Action> {
        if self.last_exec == 0 || self.last_exec % self.config.checkpoint_interval != 0 {
            return vec![];
        }
        let s = self.last_exec;
        let digest = self.kernel.state_digest();
        self.checkpoint_snapshots.insert(s, self.kernel.snapshot());
        let cp = self.make_checkpoint(s, digest);
        debug!(s, "taking checkpoint");
        let mut actions = vec![Action::Broadcast {
            msg: ProtocolMessage::Checkpoint(cp.clone()),
        }];
        actions.extend(self.absorb_checkpoint(cp, true));
        actions
    }

    fn on_checkpoint(&mut self, cp: Checkpoint) -> Vec<Action> {
        if self
            .verifier
            .verify(&ProtocolMessage::Checkpoint(cp.clone()))
            .is_err()
        {
            return vec![];
        }
        self.absorb_checkpoint(cp, false)
    }

    fn absorb_checkpoint(&mut self, cp: Checkpoint, mine: bool) -> Vec<Action> {
        let sender = cp.sender;
        let seqno = cp.seqno;
        match self.checkpoints.add(cp, mine, self.last_exec) {
            CheckpointOutcome::Stable(s, _) => {
                self.advance_stable(s);
                vec![]
            }
            CheckpointOutcome::StableAhead(s, d) => {
                // The network checkpointed past us; fetch the snapshot.
                info!(s, last_exec = self.last_exec, "stable checkpoint ahead of execution");
                self.committed_hint = self.committed_hint.max(s);
                if !self.transfer.is_active() && s > self.last_exec + self.config.checkpoint_interval
                {
                    self.start_snapshot_fetch(s, Some(d))
                } else {
                    vec![]
                }
            }
            CheckpointOutcome::Equivocation { first, second } => {
                let record = self.misbehavior.record(
                    sender,
                    MisbehaviorKind::ConflictingCheckpoint {
                        seqno,
                        first,
                        second,
                    },
                );
                vec![Action::OperatorAlert {
                    detail: record.describe(),
                }]
            }
            _ => vec![],
        }
    }

    /// Stability: truncate the log and garbage-collect.
    fn advance_stable(&mut self, s: Seqno) {
        info!(s, "stable checkpoint");
        self.log.truncate(s + 1);
        self.next_pp_seq = self.next_pp_seq.max(s + 1);
        // Keep only snapshots that can still serve fetches.
        self.checkpoint_snapshots.retain(|k, _| *k >= s);
    }

    // ─── Status / anti-entropy ───

    fn on_status_timer(&mut self) -> Vec<Action> {
        let st = self.make_status();
        vec![
            Action::Broadcast {
                msg: ProtocolMessage::Status(st),
            },
            Action::SetTimer {
                id: TimerId::Status,
                duration: self.config.status_interval,
            },
        ]
    }

    fn on_status(&mut self, st: Status) -> Vec<Action> {
        if self
            .verifier
            .verify(&ProtocolMessage::Status(st.clone()))
            .is_err()
        {
            return vec![];
        }
        let mut actions = Vec::new();
        self.committed_hint = self.committed_hint.max(st.last_committed);

        // The peer is missing pre-prepares we hold: retransmit.
        for s in &st.missing {
            if let Some(pp) = self.log.get(*s).and_then(|slot| slot.pre_prepare.clone()) {
                actions.push(Action::Send {
                    to: st.sender,
                    msg: ProtocolMessage::PrePrepare(pp),
                });
            }
        }
        // The peer trails our commit point: resend our own votes so its
        // certificates can complete.
        let from = st.last_committed.max(self.checkpoints.last_stable()) + 1;
        for s in from..=self.last_committed.min(st.last_stable + self.config.max_out - 1) {
            if let Some(slot) = self.log.get(s) {
                if let Some(p) = slot.prepares.mine() {
                    actions.push(Action::Send {
                        to: st.sender,
                        msg: ProtocolMessage::Prepare(p.0.clone()),
                    });
                }
                if let Some(c) = slot.commits.mine() {
                    actions.push(Action::Send {
                        to: st.sender,
                        msg: ProtocolMessage::Commit(c.0.clone()),
                    });
                }
            }
        }

        // We trail the network's stable mark: estimate and fetch.
        if st.last_stable > self.checkpoints.last_stable() + self.config.checkpoint_interval
            && !self.transfer.is_active()
        {
            actions.extend(self.start_estimation());
        }
        actions
    }

    // ─── View change ───

    fn on_view_change_timer(&mut self) -> Vec<Action> {
        if !self.client_table.has_pending() && !self.view_changing {
            return vec![];
        }
        let target = match self.pending_view {
            // The previous attempt failed; escalate with doubled timeout.
            Some(v) => {
                self.backoff.bump();
                v + 1
            }
            None => self.view + 1,
        };
        warn!(target, "no progress; starting view change");
        self.start_view_change(target)
    }

    fn start_view_change(&mut self, target: View) -> Vec<Action> {
        if self.view_changing && self.pending_view.map(|v| v >= target).unwrap_or(false) {
            // Already changing to this view (or higher): coalesce.
            return vec![];
        }
        self.view_changing = true;
        self.pending_view = Some(target);

        let last_stable = self.checkpoints.last_stable();
        let prepared: Vec<PreparedEvidence> = self
            .log
            .iter()
            .filter(|(s, slot)| slot.prepared && *s > last_stable)
            .filter_map(|(s, slot)| {
                let (v, d) = slot.accepted_value()?;
                let pp = slot.pre_prepare.as_ref()?;
                Some(PreparedEvidence {
                    seqno: s,
                    view: v,
                    batch: pp.batch.clone(),
                    prepare_senders: slot.prepares.senders_for(&(v, d)),
                })
            })
            .collect();

        let mut vc = ViewChange {
            view: target,
            last_stable,
            stable_proof: self.checkpoints.stable_proof().to_vec(),
            prepared,
            sender: self.config.id,
            auth: Authenticator::Signed(palisade_types::Signature::zero()),
        };
        vc.auth = Authenticator::signed(&self.key, &vc.signing_digest());

        info!(target, last_stable, slots = vc.prepared.len(), "broadcasting view change");
        let mut actions = vec![
            Action::Broadcast {
                msg: ProtocolMessage::ViewChange(vc.clone()),
            },
            Action::CancelTimer { id: TimerId::Batch },
            Action::SetTimer {
                id: TimerId::ViewChange,
                duration: self.backoff.current_timeout(self.config.view_change_timeout),
            },
        ];
        self.view_changes.add(vc);
        actions.extend(self.try_assemble_new_view(target));
        actions
    }

    fn on_view_change(&mut self, vc: ViewChange) -> Vec<Action> {
        if vc.view <= self.view {
            return vec![];
        }
        if verify_view_change(&vc, &self.verifier).is_err() {
            trace!(view = vc.view, sender = %vc.sender, "dropping invalid view change");
            return vec![];
        }
        let target = vc.view;
        if !self.view_changes.add(vc) {
            return vec![];
        }
        let mut actions = Vec::new();
        // f+1 replicas already gave up on a view at or above ours: join
        // them even without a local timeout.
        let already_past = self.view_changing && self.pending_view.map(|v| v >= target).unwrap_or(false);
        if self.view_changes.count(target) >= self.principals.weak_quorum() && !already_past {
            info!(target, "joining view change on weak quorum");
            actions.extend(self.start_view_change(target));
        }
        actions.extend(self.try_assemble_new_view(target));
        actions
    }

    /// The would-be primary of `target` assembles a new-view from a quorum
    /// of view changes.
    fn try_assemble_new_view(&mut self, target: View) -> Vec<Action> {
        if self.principals.primary(target) != self.config.id {
            return vec![];
        }
        let Some(vcs) = self.view_changes.quorum(target, self.principals.quorum()) else {
            return vec![];
        };
        if !self.view_changing || self.pending_view != Some(target) {
            return vec![];
        }
        info!(target, vcs = vcs.len(), "assembling new view");
        let (nv, plan) = build_new_view(target, self.config.id, &self.key, vcs);
        let pre_prepares = nv.pre_prepares.clone();
        let mut actions = vec![Action::Broadcast {
            msg: ProtocolMessage::NewView(Box::new(nv)),
        }];
        actions.extend(self.install_new_view(target, plan.last_stable, plan.stable_digest, plan.stable_proof, &pre_prepares));
        actions
    }

    fn on_new_view(&mut self, nv: NewView) -> Vec<Action> {
        if nv.view < self.view || (nv.view == self.view && !self.view_changing) {
            return vec![];
        }
        let plan = match verify_new_view(&nv, &self.verifier) {
            Ok(plan) => plan,
            Err(err) => {
                warn!(view = nv.view, %err, "rejecting new-view");
                return vec![];
            }
        };
        self.install_new_view(
            nv.view,
            plan.last_stable,
            plan.stable_digest,
            plan.stable_proof,
            &nv.pre_prepares,
        )
    }

    /// Install `view`: adopt the stable mark, replay re-issued
    /// pre-prepares, and resume ordering.
    fn install_new_view(
        &mut self,
        view: View,
        plan_stable: Seqno,
        plan_digest: Digest,
        plan_proof: Vec<Checkpoint>,
        pre_prepares: &[PrePrepare],
    ) -> Vec<Action> {
        info!(view, plan_stable, replay = pre_prepares.len(), "installing new view");
        self.view = view;
        self.view_changing = false;
        self.pending_view = None;
        self.view_changes.prune_through(view);

        let mut actions = Vec::new();
        if plan_stable > self.checkpoints.last_stable() {
            self.checkpoints
                .install_stable(plan_stable, plan_digest, plan_proof);
        }
        self.log.truncate(plan_stable + 1);

        if self.last_exec < plan_stable && !self.transfer.is_active() {
            // The new view starts beyond our execution point; recover the
            // state below it via transfer.
            actions.extend(self.start_snapshot_fetch(plan_stable, Some(plan_digest)));
        }

        let mut top = plan_stable;
        for pp in pre_prepares {
            let s = pp.seqno;
            top = top.max(s);
            if s <= self.last_exec {
                continue;
            }
            let d = pp.batch_digest();
            if let Some(slot) = self.log.get_mut(s) {
                slot.reset();
                slot.pre_prepare = Some(pp.clone());
            } else {
                continue;
            }
            if !self.is_primary() {
                // The re-issued pre-prepare is the new primary's vote.
                let primary_vote = Prepare {
                    view,
                    seqno: s,
                    batch_digest: d,
                    sender: pp.sender,
                    auth: pp.auth.clone(),
                };
                actions.extend(self.add_prepare_vote(primary_vote, false, false));
            }
            let own = self.make_prepare(s, d);
            let broadcast = !self.is_primary();
            actions.extend(self.add_prepare_vote(own, true, broadcast));
        }
        self.next_pp_seq = top + 1;

        if self.is_primary() {
            self.client_table.requeue_pending();
            actions.extend(self.try_send_pre_prepare());
        }
        if self.client_table.has_pending() {
            actions.push(Action::SetTimer {
                id: TimerId::ViewChange,
                duration: self.backoff.current_timeout(self.config.view_change_timeout),
            });
        } else {
            actions.push(Action::CancelTimer {
                id: TimerId::ViewChange,
            });
        }
        actions
    }

    // ─── State transfer ───

    fn start_estimation(&mut self) -> Vec<Action> {
        let nonce = self.transfer.begin_estimation();
        debug!(nonce, "querying peers for stability estimate");
        let mut q = QueryStable {
            nonce,
            sender: self.config.id,
            auth: Authenticator::Signed(palisade_types::Signature::zero()),
        };
        q.auth = self.hot_auth(&q.signing_digest());
        vec![
            Action::Broadcast {
                msg: ProtocolMessage::QueryStable(q),
            },
            Action::SetTimer {
                id: TimerId::Fetch,
                duration: self.config.fetch_timeout,
            },
        ]
    }

    fn start_snapshot_fetch(&mut self, target: Seqno, target_digest: Option<Digest>) -> Vec<Action> {
        self.transfer.begin_snapshot(target, target_digest);
        self.send_current_fetch()
    }

    /// (Re-)issue the fetch for the current transfer phase to the next peer.
    fn send_current_fetch(&mut self) -> Vec<Action> {
        let (from, to, target) = match self.transfer.phase() {
            FetchPhase::Snapshot {
                target,
                target_digest,
            } => (target, target, target_digest.map(|d| (target, d))),
            FetchPhase::Batches { next, to } => (next, to, None),
            _ => return vec![],
        };
        let peer = self
            .transfer
            .next_peer(self.principals.n(), self.config.id);
        let mut f = Fetch {
            from,
            to,
            target,
            sender: self.config.id,
            auth: Authenticator::Signed(palisade_types::Signature::zero()),
        };
        f.auth = self.hot_auth(&f.signing_digest());
        debug!(from, to, %peer, "fetching");
        vec![
            Action::Send {
                to: peer,
                msg: ProtocolMessage::Fetch(f),
            },
            Action::SetTimer {
                id: TimerId::Fetch,
                duration: self.config.fetch_timeout,
            },
        ]
    }

    fn on_fetch_timer(&mut self) -> Vec<Action> {
        if !self.transfer.is_active() {
            return vec![];
        }
        if !self.transfer.note_attempt() {
            self.transfer.finish();
            warn!("state transfer retry budget exhausted");
            return vec![self.alert("state transfer failed: retry budget exhausted, recovery required")];
        }
        match self.transfer.phase() {
            // Ask the whole set again; stragglers may answer this round.
            FetchPhase::Estimating { .. } => self.start_estimation(),
            _ => self.send_current_fetch(),
        }
    }

    fn on_query_stable(&mut self, q: QueryStable) -> Vec<Action> {
        if self
            .verifier
            .verify(&ProtocolMessage::QueryStable(q.clone()))
            .is_err()
        {
            return vec![];
        }
        let mut r = ReplyStable {
            nonce: q.nonce,
            last_checkpoint: self.checkpoints.own_last_checkpoint(),
            last_prepared: self.last_prepared,
            sender: self.config.id,
            auth: Authenticator::Signed(palisade_types::Signature::zero()),
        };
        r.auth = self.hot_auth(&r.signing_digest());
        vec![Action::Send {
            to: q.sender,
            msg: ProtocolMessage::ReplyStable(r),
        }]
    }

    fn on_reply_stable(&mut self, r: ReplyStable) -> Vec<Action> {
        let FetchPhase::Estimating { nonce } = self.transfer.phase() else {
            return vec![];
        };
        if r.nonce != nonce
            || self
                .verifier
                .verify(&ProtocolMessage::ReplyStable(r.clone()))
                .is_err()
        {
            return vec![];
        }
        self.transfer
            .estimator
            .add(r.sender, r.last_checkpoint, r.last_prepared);
        let estimate = self
            .transfer
            .estimator
            .estimate(self.principals.weak_quorum(), self.principals.quorum());
        match estimate {
            Some(est) if est > self.last_exec => {
                info!(est, "stability estimate acquired");
                let digest = self.checkpoints.completed_proof(est).map(|(d, _)| d);
                self.start_snapshot_fetch(est, digest)
            }
            Some(_) if self.committed_hint > self.last_exec => {
                // We hold the state at the estimate already; only the
                // batches above us are missing.
                self.transfer
                    .begin_batches(self.last_exec + 1, self.committed_hint);
                self.send_current_fetch()
            }
            Some(_) => {
                // The network's stable mark is not ahead after all.
                self.transfer.finish();
                vec![Action::CancelTimer { id: TimerId::Fetch }]
            }
            None => vec![],
        }
    }

    fn on_fetch(&mut self, f: Fetch) -> Vec<Action> {
        if self
            .verifier
            .verify(&ProtocolMessage::Fetch(f.clone()))
            .is_err()
        {
            return vec![];
        }
        let stable = self.checkpoints.last_stable();
        let chunk = if f.from <= stable && stable > 0 {
            match self.checkpoint_snapshots.get(&stable) {
                Some(chunks) => FetchChunk::Snapshot {
                    seqno: stable,
                    state_digest: self.checkpoints.stable_digest(),
                    chunks: chunks.clone(),
                    proof: self.checkpoints.stable_proof().to_vec(),
                },
                None => return vec![],
            }
        } else {
            let to = f.to.min(self.last_exec);
            let entries: Vec<PrePrepare> = (f.from..=to)
                .filter_map(|s| {
                    self.log
                        .get(s)
                        .filter(|slot| slot.committed)
                        .and_then(|slot| slot.pre_prepare.clone())
                })
                .collect();
            if entries.is_empty() {
                return vec![];
            }
            FetchChunk::Batches { entries }
        };
        let mut reply = FetchReply {
            chunk,
            sender: self.config.id,
            auth: Authenticator::Signed(palisade_types::Signature::zero()),
        };
        reply.auth = self.hot_auth(&reply.signing_digest());
        vec![Action::Send {
            to: f.sender,
            msg: ProtocolMessage::FetchReply(Box::new(reply)),
        }]
    }

    fn on_fetch_reply(&mut self, fr: FetchReply) -> Vec<Action> {
        if self
            .verifier
            .verify(&ProtocolMessage::FetchReply(Box::new(fr.clone())))
            .is_err()
        {
            return vec![];
        }
        match (self.transfer.phase(), fr.chunk) {
            (
                FetchPhase::Snapshot {
                    target,
                    target_digest,
                },
                FetchChunk::Snapshot {
                    seqno,
                    state_digest,
                    chunks,
                    proof,
                },
            ) => self.install_snapshot(target, target_digest, seqno, state_digest, chunks, proof),
            (FetchPhase::Batches { next, to }, FetchChunk::Batches { entries }) => {
                self.apply_fetched_batches(next, to, entries)
            }
            _ => vec![],
        }
    }

    fn install_snapshot(
        &mut self,
        target: Seqno,
        target_digest: Option<Digest>,
        seqno: Seqno,
        state_digest: Digest,
        chunks: Vec<Vec<u8>>,
        proof: Vec<Checkpoint>,
    ) -> Vec<Action> {
        // The chunk must cover the target, match any digest we already
        // know, and carry a checkpoint quorum.
        if seqno < target {
            return vec![];
        }
        if let Some(expected) = target_digest {
            if seqno == target && state_digest != expected {
                warn!(seqno, "snapshot digest mismatch; retrying elsewhere");
                return self.retry_fetch();
            }
        }
        if !self
            .verifier
            .verify_checkpoint_proof(seqno, &state_digest, &proof)
        {
            warn!(seqno, "snapshot proof invalid; retrying elsewhere");
            return self.retry_fetch();
        }
        match self.kernel.install_snapshot(seqno, &chunks) {
            Ok(()) => {}
            Err(err) => {
                warn!(%err, "snapshot rejected by kernel; retrying elsewhere");
                return self.retry_fetch();
            }
        }
        if self.kernel.state_digest() != state_digest {
            warn!(seqno, "kernel digest mismatch after install; retrying elsewhere");
            return self.retry_fetch();
        }

        info!(seqno, "installed stable snapshot");
        self.last_exec = seqno;
        self.last_committed = self.last_committed.max(seqno);
        self.last_prepared = self.last_prepared.max(seqno);
        self.checkpoints.install_stable(seqno, state_digest, proof);
        self.checkpoint_snapshots.insert(seqno, chunks);
        self.log.clear(seqno + 1);
        self.next_pp_seq = self.next_pp_seq.max(seqno + 1);

        if self.committed_hint > seqno {
            self.transfer.begin_batches(seqno + 1, self.committed_hint);
            self.send_current_fetch()
        } else {
            self.transfer.finish();
            vec![Action::CancelTimer { id: TimerId::Fetch }]
        }
    }

    fn apply_fetched_batches(
        &mut self,
        next: Seqno,
        to: Seqno,
        entries: Vec<PrePrepare>,
    ) -> Vec<Action> {
        let mut actions = Vec::new();
        let mut cursor = next;
        for pp in entries {
            if pp.seqno != cursor || cursor != self.last_exec + 1 {
                continue;
            }
            // The chunk's pre-prepares re-execute under the weak check: the
            // batch is vouched for by the committed history it came from,
            // but digests must still line up.
            if self
                .verifier
                .verify_weaker(&ProtocolMessage::PrePrepare(pp.clone()))
                .is_err()
            {
                warn!(s = pp.seqno, "fetched batch fails weak verification; retrying");
                self.transfer.advance_batches(cursor);
                return self.retry_fetch();
            }
            let aligned = pp.batch.requests.len() == pp.batch.digests.len()
                && pp
                    .batch
                    .requests
                    .iter()
                    .zip(&pp.batch.digests)
                    .all(|(r, d)| r.digest() == *d);
            if !aligned {
                warn!(s = pp.seqno, "fetched batch digests misaligned; retrying");
                self.transfer.advance_batches(cursor);
                return self.retry_fetch();
            }
            match self.execute_batch(pp.seqno, &pp.batch, &mut actions) {
                Ok(()) => {}
                Err(detail) => {
                    self.halted = true;
                    actions.push(self.alert(detail));
                    return actions;
                }
            }
            self.last_exec = pp.seqno;
            self.last_committed = self.last_committed.max(pp.seqno);
            cursor += 1;
            actions.extend(self.maybe_checkpoint());
        }
        if cursor == next {
            // The peer sent nothing usable; charge an attempt and rotate.
            actions.extend(self.retry_fetch());
            return actions;
        }
        self.transfer.advance_batches(cursor);
        if self.transfer.is_active() && cursor <= to {
            actions.extend(self.send_current_fetch());
        } else {
            info!(last_exec = self.last_exec, "state transfer complete");
            self.transfer.finish();
            actions.push(Action::CancelTimer { id: TimerId::Fetch });
        }
        actions
    }

    /// An unverifiable chunk or peer failure: try the next peer within the
    /// budget.
    fn retry_fetch(&mut self) -> Vec<Action> {
        if !self.transfer.note_attempt() {
            self.transfer.finish();
            return vec![self.alert("state transfer failed: retry budget exhausted, recovery required")];
        }
        self.send_current_fetch()
    }
}

impl<K: ApplicationKernel> StateMachine for ReplicaState<K> {
    fn set_time(&mut self, now: Duration) {
        self.now = now;
    }

    fn handle(&mut self, event: Event) -> Vec<Action> {
        if self.halted {
            return vec![];
        }
        match event {
            Event::BatchTimer => self.try_send_pre_prepare(),
            Event::ViewChangeTimer => self.on_view_change_timer(),
            Event::StatusTimer => self.on_status_timer(),
            Event::FetchTimer => self.on_fetch_timer(),
            Event::ClientRetransmitTimer => vec![],
            Event::MessageReceived { msg } => match msg {
                ProtocolMessage::Request(req) => self.on_request(req),
                ProtocolMessage::PrePrepare(pp) => self.on_pre_prepare(pp),
                ProtocolMessage::Prepare(p) => self.on_prepare(p),
                ProtocolMessage::Commit(c) => self.on_commit(c),
                ProtocolMessage::Checkpoint(cp) => self.on_checkpoint(cp),
                ProtocolMessage::ViewChange(vc) => self.on_view_change(vc),
                ProtocolMessage::NewView(nv) => self.on_new_view(*nv),
                ProtocolMessage::Status(st) => self.on_status(st),
                ProtocolMessage::QueryStable(q) => self.on_query_stable(q),
                ProtocolMessage::ReplyStable(r) => self.on_reply_stable(r),
                ProtocolMessage::Fetch(f) => self.on_fetch(f),
                ProtocolMessage::FetchReply(fr) => self.on_fetch_reply(*fr),
                // Replies are client-bound; a replica ignores them.
                ProtocolMessage::Reply(_) => vec![],
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_core::KernelError;
    use palisade_types::{Principal, ReplicaId, SigMode, Signature};

    /// Kernel that appends executed payloads; digest covers the op list.
    #[derive(Default)]
    struct TestKernel {
        ops: Vec<(Seqno, Vec<u8>)>,
        calls: usize,
    }

    impl ApplicationKernel for TestKernel {
        fn execute(
            &mut self,
            seqno: Seqno,
            _non_det: &[u8],
            _client: ClientId,
            _request_id: RequestId,
            payload: &[u8],
        ) -> Result<Vec<u8>, KernelError> {
            self.calls += 1;
            self.ops.push((seqno, payload.to_vec()));
            let mut out = b"OK:".to_vec();
            out.extend_from_slice(payload);
            Ok(out)
        }

        fn execute_read_only(&self, _client: ClientId, payload: &[u8]) -> Result<Vec<u8>, KernelError> {
            let mut out = b"RO:".to_vec();
            out.extend_from_slice(payload);
            Ok(out)
        }

        fn non_det_choice(&mut self, seqno: Seqno, _max_len: usize) -> Vec<u8> {
            seqno.to_le_bytes().to_vec()
        }

        fn state_digest(&self) -> Digest {
            let bytes = bincode::serialize(&self.ops).unwrap_or_default();
            Digest::of(&bytes)
        }

        fn snapshot(&self) -> Vec<Vec<u8>> {
            vec![bincode::serialize(&self.ops).unwrap_or_default()]
        }

        fn install_snapshot(&mut self, _seqno: Seqno, chunks: &[Vec<u8>]) -> Result<(), KernelError> {
            let first = chunks.first().ok_or_else(|| KernelError::Snapshot("empty".into()))?;
            self.ops = bincode::deserialize(first)
                .map_err(|e| KernelError::Snapshot(e.to_string()))?;
            Ok(())
        }
    }

    struct Fixture {
        keys: Vec<KeyPair>,
        principals: PrincipalSet,
        client_key: KeyPair,
    }

    impl Fixture {
        fn new() -> Self {
            let keys: Vec<KeyPair> =
                (0..4).map(|i| KeyPair::from_seed(&[i as u8 + 1; 32])).collect();
            let principals = PrincipalSet::new(
                keys.iter()
                    .enumerate()
                    .map(|(i, k)| Principal {
                        id: ReplicaId(i as u32),
                        verifying_key: k.public_bytes(),
                        mac_seed: *k.mac_seed(),
                    })
                    .collect(),
                1,
            )
            .unwrap();
            Fixture {
                keys,
                principals,
                client_key: KeyPair::from_seed(&[0xC1; 32]),
            }
        }

        fn replica(&self, id: u32) -> ReplicaState<TestKernel> {
            let mut clients = ClientDirectory::new();
            clients.insert(ClientId(7), self.client_key.public_bytes());
            let mut config = ReplicaConfig::new(ReplicaId(id));
            config.max_out = 8;
            config.checkpoint_interval = 4;
            ReplicaState::new(
                config,
                self.principals.clone(),
                clients,
                self.keys[id as usize].clone(),
                TestKernel::default(),
            )
            .unwrap()
        }

        fn request(&self, request_id: RequestId, payload: &[u8], read_only: bool) -> Request {
            let digest = Request::signing_digest(ClientId(7), request_id, payload, read_only);
            Request {
                client: ClientId(7),
                request_id,
                payload: payload.to_vec(),
                read_only,
                signature: self.client_key.sign(&digest),
            }
        }

        fn pre_prepare(&self, view: View, seqno: Seqno, requests: Vec<Request>) -> PrePrepare {
            let primary = self.principals.primary(view);
            let batch = Batch {
                digests: requests.iter().map(|r| r.digest()).collect(),
                requests,
                non_det: seqno.to_le_bytes().to_vec(),
            };
            let mut pp = PrePrepare {
                view,
                seqno,
                batch,
                sender: primary,
                auth: Authenticator::Signed(Signature::zero()),
            };
            pp.auth = Authenticator::for_mode(
                SigMode::MacVector,
                &self.keys[primary.0 as usize],
                4,
                &pp.signing_digest(),
            );
            pp
        }

        fn prepare(&self, sender: u32, view: View, seqno: Seqno, d: Digest) -> Prepare {
            let mut p = Prepare {
                view,
                seqno,
                batch_digest: d,
                sender: ReplicaId(sender),
                auth: Authenticator::Signed(Signature::zero()),
            };
            p.auth = Authenticator::for_mode(
                SigMode::MacVector,
                &self.keys[sender as usize],
                4,
                &p.signing_digest(),
            );
            p
        }

        fn commit(&self, sender: u32, view: View, seqno: Seqno, d: Digest) -> Commit {
            let mut c = Commit {
                view,
                seqno,
                batch_digest: d,
                sender: ReplicaId(sender),
                auth: Authenticator::Signed(Signature::zero()),
            };
            c.auth = Authenticator::for_mode(
                SigMode::MacVector,
                &self.keys[sender as usize],
                4,
                &c.signing_digest(),
            );
            c
        }
    }

    fn deliver<K: ApplicationKernel>(r: &mut ReplicaState<K>, msg: ProtocolMessage) -> Vec<Action> {
        r.handle(Event::MessageReceived { msg })
    }

    fn broadcasts(actions: &[Action]) -> Vec<&ProtocolMessage> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Broadcast { msg } => Some(msg),
                _ => None,
            })
            .collect()
    }

    fn replies(actions: &[Action]) -> Vec<&Reply> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::SendReply { reply, .. } => Some(reply),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn primary_orders_request_through_commit_and_execute() {
        let fx = Fixture::new();
        let mut primary = fx.replica(0);
        let req = fx.request(1, b"A", false);

        let actions = deliver(&mut primary, ProtocolMessage::Request(req.clone()));
        let pp = match broadcasts(&actions).first() {
            Some(ProtocolMessage::PrePrepare(pp)) => (*pp).clone(),
            other => panic!("expected pre-prepare broadcast, got {:?}", other),
        };
        assert_eq!(pp.seqno, 1);
        let d = pp.batch_digest();

        // The primary's own prepare counts; two more reach 2f+1 = 3.
        let actions = deliver(&mut primary, ProtocolMessage::Prepare(fx.prepare(1, 0, 1, d)));
        assert!(broadcasts(&actions).is_empty(), "2f prepares must not fire");
        let actions = deliver(&mut primary, ProtocolMessage::Prepare(fx.prepare(2, 0, 1, d)));
        let commit = match broadcasts(&actions).first() {
            Some(ProtocolMessage::Commit(c)) => (*c).clone(),
            other => panic!("expected commit broadcast, got {:?}", other),
        };
        assert_eq!(commit.seqno, 1);

        // A third matching prepare must not re-fire the transition.
        let actions = deliver(&mut primary, ProtocolMessage::Prepare(fx.prepare(3, 0, 1, d)));
        assert!(broadcasts(&actions).is_empty());

        // Own commit plus two more commits the slot and executes.
        deliver(&mut primary, ProtocolMessage::Commit(fx.commit(1, 0, 1, d)));
        let actions = deliver(&mut primary, ProtocolMessage::Commit(fx.commit(2, 0, 1, d)));
        let replies = replies(&actions);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].result, b"OK:A");
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::LedgerAppend { .. })));
        assert_eq!(primary.last_exec(), 1);
        assert_eq!(primary.kernel().calls, 1);
    }

    #[test]
    fn backup_accepts_pre_prepare_and_prepares() {
        let fx = Fixture::new();
        let mut backup = fx.replica(1);
        let pp = fx.pre_prepare(0, 1, vec![fx.request(1, b"A", false)]);
        let d = pp.batch_digest();

        let actions = deliver(&mut backup, ProtocolMessage::PrePrepare(pp.clone()));
        match broadcasts(&actions).first() {
            Some(ProtocolMessage::Prepare(p)) => {
                assert_eq!(p.seqno, 1);
                assert_eq!(p.batch_digest, d);
            }
            other => panic!("expected prepare broadcast, got {:?}", other),
        }

        // A duplicate pre-prepare is absorbed silently.
        let actions = deliver(&mut backup, ProtocolMessage::PrePrepare(pp));
        assert!(actions.is_empty());
    }

    #[test]
    fn window_boundary_rejects_at_max_out() {
        let fx = Fixture::new();
        let mut backup = fx.replica(1);

        // max_out = 8, last_stable = 0: s = 8 is out, s = 7 is in.
        let out = fx.pre_prepare(0, 8, vec![fx.request(1, b"A", false)]);
        let actions = deliver(&mut backup, ProtocolMessage::PrePrepare(out));
        assert!(broadcasts(&actions).is_empty());
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Send { msg: ProtocolMessage::Status(_), .. })));

        let edge = fx.pre_prepare(0, 7, vec![fx.request(1, b"A", false)]);
        let actions = deliver(&mut backup, ProtocolMessage::PrePrepare(edge));
        assert!(matches!(
            broadcasts(&actions).first(),
            Some(ProtocolMessage::Prepare(_))
        ));
    }

    #[test]
    fn equivocating_pre_prepare_is_recorded() {
        let fx = Fixture::new();
        let mut backup = fx.replica(1);

        let first = fx.pre_prepare(0, 1, vec![fx.request(1, b"X", false)]);
        deliver(&mut backup, ProtocolMessage::PrePrepare(first));
        let second = fx.pre_prepare(0, 1, vec![fx.request(1, b"Y", false)]);
        let actions = deliver(&mut backup, ProtocolMessage::PrePrepare(second));

        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::OperatorAlert { .. })));
        assert_eq!(backup.misbehavior().len(), 1);
        // The protocol does not halt.
        assert!(!backup.is_halted());
    }

    #[test]
    fn executed_request_resends_cached_reply_without_kernel_call() {
        let fx = Fixture::new();
        let mut primary = fx.replica(0);
        let req = fx.request(1, b"A", false);

        let actions = deliver(&mut primary, ProtocolMessage::Request(req.clone()));
        let pp = match broadcasts(&actions).first() {
            Some(ProtocolMessage::PrePrepare(pp)) => (*pp).clone(),
            other => panic!("expected pre-prepare, got {:?}", other),
        };
        let d = pp.batch_digest();
        deliver(&mut primary, ProtocolMessage::Prepare(fx.prepare(1, 0, 1, d)));
        deliver(&mut primary, ProtocolMessage::Prepare(fx.prepare(2, 0, 1, d)));
        deliver(&mut primary, ProtocolMessage::Commit(fx.commit(1, 0, 1, d)));
        deliver(&mut primary, ProtocolMessage::Commit(fx.commit(2, 0, 1, d)));
        assert_eq!(primary.kernel().calls, 1);

        // Retransmission after execution: cached reply, no second call.
        let actions = deliver(&mut primary, ProtocolMessage::Request(req));
        let rs = replies(&actions);
        assert_eq!(rs.len(), 1);
        assert_eq!(rs[0].result, b"OK:A");
        assert_eq!(primary.kernel().calls, 1);
    }

    #[test]
    fn read_only_request_bypasses_ordering() {
        let fx = Fixture::new();
        let mut backup = fx.replica(2);
        let req = fx.request(3, b"R", true);

        let actions = deliver(&mut backup, ProtocolMessage::Request(req));
        let rs = replies(&actions);
        assert_eq!(rs.len(), 1);
        assert_eq!(rs[0].result, b"RO:R");
        assert!(broadcasts(&actions).is_empty());
        assert_eq!(backup.last_exec(), 0);
    }

    #[test]
    fn bad_request_signature_is_dropped_silently() {
        let fx = Fixture::new();
        let mut primary = fx.replica(0);
        let mut req = fx.request(1, b"A", false);
        req.signature = Signature([9u8; 64]);
        let actions = deliver(&mut primary, ProtocolMessage::Request(req));
        assert!(actions.is_empty());
    }

    #[test]
    fn view_change_timer_broadcasts_signed_view_change() {
        let fx = Fixture::new();
        let mut backup = fx.replica(1);
        deliver(&mut backup, ProtocolMessage::Request(fx.request(2, b"B", false)));

        let actions = backup.handle(Event::ViewChangeTimer);
        let vc = match broadcasts(&actions).first() {
            Some(ProtocolMessage::ViewChange(vc)) => (*vc).clone(),
            other => panic!("expected view change, got {:?}", other),
        };
        assert_eq!(vc.view, 1);
        assert!(backup.is_view_changing());

        // Re-entering the same target view is coalesced.
        let again = backup.handle(Event::ViewChangeTimer);
        let vcs: Vec<_> = broadcasts(&again)
            .into_iter()
            .filter(|m| matches!(m, ProtocolMessage::ViewChange(_)))
            .collect();
        // The timer escalates to view 2, not a duplicate of view 1.
        match vcs.first() {
            Some(ProtocolMessage::ViewChange(vc2)) => assert_eq!(vc2.view, 2),
            other => panic!("expected escalated view change, got {:?}", other),
        }
    }

    #[test]
    fn checkpoint_quorum_truncates_log() {
        let fx = Fixture::new();
        let mut primary = fx.replica(0);

        // Order and commit 4 batches to cross the checkpoint interval.
        for rid in 1..=4u64 {
            let req = fx.request(rid, format!("p{}", rid).as_bytes(), false);
            let actions = deliver(&mut primary, ProtocolMessage::Request(req));
            let pp = match broadcasts(&actions).first() {
                Some(ProtocolMessage::PrePrepare(pp)) => (*pp).clone(),
                other => panic!("expected pre-prepare, got {:?}", other),
            };
            let (s, d) = (pp.seqno, pp.batch_digest());
            deliver(&mut primary, ProtocolMessage::Prepare(fx.prepare(1, 0, s, d)));
            deliver(&mut primary, ProtocolMessage::Prepare(fx.prepare(2, 0, s, d)));
            deliver(&mut primary, ProtocolMessage::Commit(fx.commit(1, 0, s, d)));
            deliver(&mut primary, ProtocolMessage::Commit(fx.commit(2, 0, s, d)));
        }
        assert_eq!(primary.last_exec(), 4);
        assert_eq!(primary.last_stable(), 0);

        // Matching checkpoints from two peers complete the quorum with ours.
        let digest = primary.kernel().state_digest();
        for sender in [1u32, 2u32] {
            let mut cp = Checkpoint {
                seqno: 4,
                state_digest: digest,
                sender: ReplicaId(sender),
                auth: Authenticator::Signed(Signature::zero()),
            };
            cp.auth =
                Authenticator::signed(&fx.keys[sender as usize], &cp.signing_digest());
            deliver(&mut primary, ProtocolMessage::Checkpoint(cp));
        }
        assert_eq!(primary.last_stable(), 4);
        assert_eq!(primary.log_head(), 5);
    }
}
