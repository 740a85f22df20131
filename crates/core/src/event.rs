//! Event types for the deterministic state machines.

use palisade_types::ProtocolMessage;

/// Priority levels for event ordering within the same timestamp.
///
/// Events at the same simulated time are processed in priority order,
/// lower value first, so consequences of prior processing land before new
/// external input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EventPriority {
    /// Timer events scheduled by the node itself.
    Timer = 0,
    /// Protocol messages from peers.
    Network = 1,
    /// Client requests.
    Client = 2,
}

/// All possible inputs to a replica or client state machine.
///
/// Events are passive data; the state machine processes them and returns
/// actions. Network messages arrive already decoded; the runner applies
/// the codec and drops anything malformed before it gets here.
#[derive(Debug, Clone)]
pub enum Event {
    /// Primary-side batch deadline expired.
    BatchTimer,

    /// No-progress timeout expired; consider a view change.
    ViewChangeTimer,

    /// Periodic status exchange tick.
    StatusTimer,

    /// State-transfer progress deadline expired.
    FetchTimer,

    /// Client-side reply timeout expired.
    ClientRetransmitTimer,

    /// A protocol message arrived from the network. Sender identity is
    /// authenticated by the message's own authenticator; per-sender FIFO
    /// delivery is guaranteed by the transport.
    MessageReceived { msg: ProtocolMessage },
}

impl Event {
    pub fn priority(&self) -> EventPriority {
        match self {
            Event::BatchTimer
            | Event::ViewChangeTimer
            | Event::StatusTimer
            | Event::FetchTimer
            | Event::ClientRetransmitTimer => EventPriority::Timer,
            Event::MessageReceived { msg } => match msg {
                ProtocolMessage::Request(_) => EventPriority::Client,
                _ => EventPriority::Network,
            },
        }
    }

    /// Event type name for logs and telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::BatchTimer => "BatchTimer",
            Event::ViewChangeTimer => "ViewChangeTimer",
            Event::StatusTimer => "StatusTimer",
            Event::FetchTimer => "FetchTimer",
            Event::ClientRetransmitTimer => "ClientRetransmitTimer",
            Event::MessageReceived { msg } => msg.kind(),
        }
    }
}
