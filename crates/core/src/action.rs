//! Action types for the deterministic state machines.

use crate::TimerId;
use palisade_types::{ClientId, ProtocolMessage, Reply, ReplicaId};
use std::time::Duration;

/// Actions a state machine wants performed.
///
/// Actions are commands; the runner executes them. Nothing here blocks the
/// state machine, and nothing is acknowledged back except where a later
/// event naturally results (e.g. a peer's response).
#[derive(Debug, Clone)]
pub enum Action {
    /// Send a message to one replica.
    Send { to: ReplicaId, msg: ProtocolMessage },

    /// Send a message to every other replica.
    Broadcast { msg: ProtocolMessage },

    /// Send a reply to a client.
    SendReply { client: ClientId, reply: Reply },

    /// Arm (or re-arm) a timer.
    SetTimer { id: TimerId, duration: Duration },

    /// Cancel a timer. Cancelling an unarmed timer is a no-op.
    CancelTimer { id: TimerId },

    /// Append one executed batch's canonical bytes to the ledger sink.
    LedgerAppend { bytes: Vec<u8> },

    /// Truncate the ledger at `index`, on behalf of a higher layer.
    LedgerTruncate { index: u64 },

    /// Surface a diagnostic on the operator channel. Used for misbehavior
    /// evidence and terminal failures; never sent to peers.
    OperatorAlert { detail: String },
}

impl Action {
    /// Action type name for logs and telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::Send { .. } => "Send",
            Action::Broadcast { .. } => "Broadcast",
            Action::SendReply { .. } => "SendReply",
            Action::SetTimer { .. } => "SetTimer",
            Action::CancelTimer { .. } => "CancelTimer",
            Action::LedgerAppend { .. } => "LedgerAppend",
            Action::LedgerTruncate { .. } => "LedgerTruncate",
            Action::OperatorAlert { .. } => "OperatorAlert",
        }
    }

    /// Whether this action leaves the node (network or client-visible).
    pub fn is_outbound(&self) -> bool {
        matches!(
            self,
            Action::Send { .. } | Action::Broadcast { .. } | Action::SendReply { .. }
        )
    }
}
