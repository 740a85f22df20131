//! The client role: request submission, retransmission, and reply
//! collection.
//!
//! A client sends each request to the replica it believes is the primary
//! and waits for `f+1` matching signed replies from distinct replicas (one
//! of which must be correct). If no quorum arrives within an adaptive
//! timeout the request is resent, and after a few failed rounds it is
//! broadcast to all replicas, which implicates a faulty primary and feeds
//! the view-change timers on the backups.

use palisade_core::{Action, Event, StateMachine, TimerId};
use palisade_types::{
    ClientId, KeyPair, PrincipalSet, ProtocolMessage, Reply, ReplicaId, Request, RequestId,
    Verifier, View,
};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Client-side tunables.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Initial reply timeout; doubles on each retransmission.
    pub retransmit_timeout: Duration,
    /// Retransmissions to the primary before escalating to broadcast.
    pub broadcast_after: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            retransmit_timeout: Duration::from_millis(500),
            broadcast_after: 2,
        }
    }
}

#[derive(Debug)]
struct InFlight {
    request: Request,
    /// Verified replies keyed by replica.
    replies: BTreeMap<ReplicaId, Reply>,
    retransmits: u32,
    /// Matching quorum needed: `f+1` for both ordered and read-only paths.
    needed: usize,
}

/// One logical client. Single outstanding request at a time; request ids
/// are monotonic.
pub struct ClientState {
    id: ClientId,
    key: KeyPair,
    principals: PrincipalSet,
    verifier: Verifier,
    config: ClientConfig,
    next_request_id: RequestId,
    /// The view we last saw in a reply; primary guess is derived from it.
    view_hint: View,
    in_flight: Option<InFlight>,
    /// Completed result waiting for the application to take it.
    completed: Option<(RequestId, Vec<u8>)>,
    now: Duration,
}

impl std::fmt::Debug for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientState")
            .field("id", &self.id)
            .field("next_request_id", &self.next_request_id)
            .field("in_flight", &self.in_flight.is_some())
            .finish()
    }
}

impl ClientState {
    pub fn new(id: ClientId, key: KeyPair, principals: PrincipalSet, config: ClientConfig) -> Self {
        let verifier = Verifier::for_client(principals.clone());
        ClientState {
            id,
            key,
            principals,
            verifier,
            config,
            next_request_id: 1,
            view_hint: 0,
            in_flight: None,
            completed: None,
            now: Duration::ZERO,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// The result of the last completed request, consumed once.
    pub fn take_result(&mut self) -> Option<(RequestId, Vec<u8>)> {
        self.completed.take()
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none()
    }

    fn primary_guess(&self) -> ReplicaId {
        self.principals.primary(self.view_hint)
    }

    fn current_timeout(&self) -> Duration {
        let retransmits = self
            .in_flight
            .as_ref()
            .map(|f| f.retransmits)
            .unwrap_or(0)
            .min(6);
        self.config.retransmit_timeout * 2u32.pow(retransmits)
    }

    /// Issue a new request. Returns the send and timer actions; the reply
    /// arrives later through [`StateMachine::handle`].
    pub fn invoke(&mut self, payload: Vec<u8>, read_only: bool) -> Vec<Action> {
        if self.in_flight.is_some() {
            warn!(client = %self.id, "invoke with a request still in flight");
            return vec![];
        }
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let digest = Request::signing_digest(self.id, request_id, &payload, read_only);
        let request = Request {
            client: self.id,
            request_id,
            payload,
            read_only,
            signature: self.key.sign(&digest),
        };
        self.in_flight = Some(InFlight {
            request: request.clone(),
            replies: BTreeMap::new(),
            retransmits: 0,
            needed: self.principals.weak_quorum(),
        });

        debug!(client = %self.id, request_id, read_only, "sending request");
        let msg = ProtocolMessage::Request(request);
        let send = if read_only {
            // Read-only requests go everywhere; each replica answers from
            // its current state.
            Action::Broadcast { msg }
        } else {
            Action::Send {
                to: self.primary_guess(),
                msg,
            }
        };
        vec![
            send,
            Action::SetTimer {
                id: TimerId::ClientRetransmit,
                duration: self.current_timeout(),
            },
        ]
    }

    fn on_retransmit_timer(&mut self) -> Vec<Action> {
        let Some(flight) = self.in_flight.as_mut() else {
            return vec![];
        };
        flight.retransmits += 1;
        let msg = ProtocolMessage::Request(flight.request.clone());
        let escalate = flight.retransmits >= self.config.broadcast_after;
        let retransmits = flight.retransmits;

        debug!(client = %self.id, retransmits, escalate, "retransmitting request");
        let send = if escalate || flight.request.read_only {
            // Repeated silence implicates the primary: go wide.
            Action::Broadcast { msg }
        } else {
            Action::Send {
                to: self.primary_guess(),
                msg,
            }
        };
        vec![
            send,
            Action::SetTimer {
                id: TimerId::ClientRetransmit,
                duration: self.current_timeout(),
            },
        ]
    }

    fn on_reply(&mut self, reply: Reply) -> Vec<Action> {
        if self
            .verifier
            .verify(&ProtocolMessage::Reply(reply.clone()))
            .is_err()
        {
            trace!(client = %self.id, "dropping reply with bad signature");
            return vec![];
        }
        self.view_hint = self.view_hint.max(reply.view);

        let Some(flight) = self.in_flight.as_mut() else {
            return vec![];
        };
        if reply.client != self.id || reply.request_id != flight.request.request_id {
            return vec![];
        }
        flight.replies.insert(reply.replica, reply.clone());

        // Quorum: f+1 matching replies from distinct replicas.
        let matching = flight
            .replies
            .values()
            .filter(|r| r.matches(&reply))
            .count();
        if matching < flight.needed {
            return vec![];
        }

        debug!(client = %self.id, request_id = reply.request_id, "request complete");
        self.completed = Some((reply.request_id, reply.result.clone()));
        self.in_flight = None;
        vec![Action::CancelTimer {
            id: TimerId::ClientRetransmit,
        }]
    }
}

impl StateMachine for ClientState {
    fn set_time(&mut self, now: Duration) {
        self.now = now;
    }

    fn handle(&mut self, event: Event) -> Vec<Action> {
        match event {
            Event::ClientRetransmitTimer => self.on_retransmit_timer(),
            Event::MessageReceived {
                msg: ProtocolMessage::Reply(reply),
            } => self.on_reply(reply),
            _ => vec![],
        }
    }
}
