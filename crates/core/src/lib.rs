//! Core model for the Palisade replication protocol.
//!
//! This crate provides the event-driven skeleton shared by every role:
//!
//! - [`Event`]: all possible inputs to a state machine
//! - [`Action`]: all possible outputs from a state machine
//! - [`StateMachine`]: the trait replicas and clients implement
//! - [`ApplicationKernel`]: the deterministic executor interface
//! - [`LedgerEvent`]: the write-only ledger sink protocol
//!
//! # Architecture
//!
//! ```text
//! Events → StateMachine::handle() → Actions
//! ```
//!
//! State machines are synchronous, deterministic, and perform no I/O.
//! The runner delivers events, executes the returned actions (network
//! sends, timers, ledger writes), and converts results back into events.
//! Correctness arguments assume serial processing of messages at each
//! replica, so there is exactly one event in flight per state machine.

mod action;
mod event;
mod kernel;
mod ledger;
mod traits;

pub use action::Action;
pub use event::{Event, EventPriority};
pub use kernel::{ApplicationKernel, KernelError};
pub use ledger::{LedgerEvent, LedgerSink, FRAME_SIZE};
pub use traits::StateMachine;

/// Timer identifiers. Timers are cancelable and idempotent; setting an
/// already-armed timer re-arms it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Primary-side batch assembly deadline.
    Batch,
    /// No-progress timeout that triggers a view change.
    ViewChange,
    /// Periodic anti-entropy status exchange.
    Status,
    /// State-transfer progress deadline.
    Fetch,
    /// Client-side reply timeout.
    ClientRetransmit,
}
