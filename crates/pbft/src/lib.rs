//! PBFT-family replicated state machine.
//!
//! This crate implements the replica role of the replication protocol as a
//! synchronous, event-driven state machine:
//!
//! - [`ReplicaState`]: the owning value for all protocol state; composes
//!   the log, certificates, checkpoints, view change, and state transfer
//! - [`SeqLog`]: bounded ring of per-seqno slots
//! - [`Certificate`]: threshold vote aggregation
//! - [`CheckpointCollector`] / [`StableEstimator`]: stability tracking
//! - [`ViewChangeCollector`] and the new-view construction rules
//! - [`StateTransferState`]: snapshot and batch fetch progress
//!
//! # Protocol Summary
//!
//! Signed client requests reach the primary of the current view, which
//! orders them into batches. A batch commits once `2f+1` replicas prepare
//! it and `2f+1` confirm the prepare, after which every replica executes it
//! through its application kernel in strict seqno order and appends it to
//! the ledger sink. Periodic checkpoints bound the log; a quorum of
//! matching checkpoints allows truncation. When the primary stalls, the
//! replicas elect its successor via signed view changes that carry enough
//! evidence to re-propose anything that may have committed. Lagging
//! replicas catch up by installing a proven stable snapshot and replaying
//! the committed batches above it.

mod certificate;
mod checkpoint;
mod client_table;
mod config;
mod log;
mod misbehavior;
mod slot;
mod state;
mod state_transfer;
mod view_change;

pub use certificate::{Certificate, CertificateError, Vote};
pub use checkpoint::{CheckpointCollector, CheckpointOutcome, CheckpointVote, StableEstimator};
pub use client_table::{Admit, ClientTable};
pub use config::{ConfigError, ReplicaConfig};
pub use log::{LogEntry, SeqLog};
pub use misbehavior::{MisbehaviorKind, MisbehaviorLog, MisbehaviorRecord};
pub use slot::{CommitVote, PrepareVote, Slot};
pub use state::ReplicaState;
pub use state_transfer::{FetchPhase, StateTransferState};
pub use view_change::{
    build_new_view, plan_reissue, verify_new_view, verify_view_change, NewViewError, ReissuePlan,
    ViewChangeBackoff, ViewChangeCollector, ViewChangeError,
};
