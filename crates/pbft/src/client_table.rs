//! Per-client request tracking: the pending queue, the reply cache, and the
//! exactly-once execution guarantee.
//!
//! One request may be outstanding per client at a time; request ids are
//! monotonic per client. The reply cache holds the last executed reply so a
//! retransmitted or re-proposed request never reaches the kernel twice.

use palisade_types::{ClientId, Reply, Request, RequestId};
use std::collections::{BTreeMap, VecDeque};

/// Outcome of admitting an incoming request.
#[derive(Debug, PartialEq, Eq)]
pub enum Admit {
    /// New request, queued for ordering.
    Fresh,
    /// Already executed; the cached reply should be resent.
    Executed,
    /// The same request is already pending; drop (ordering in progress).
    Pending,
    /// Older than the last executed request; drop.
    Stale,
}

#[derive(Debug, Default)]
struct ClientEntry {
    /// Highest executed request id; 0 means none.
    last_executed: RequestId,
    /// Reply for `last_executed`.
    cached_reply: Option<Reply>,
    /// The one in-flight request, if any.
    pending: Option<Request>,
}

/// Tracks request state for every known client.
#[derive(Debug, Default)]
pub struct ClientTable {
    entries: BTreeMap<ClientId, ClientEntry>,
    /// Admission order of pending requests, consumed by primary batching.
    queue: VecDeque<(ClientId, RequestId)>,
}

impl ClientTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit an authenticated request.
    pub fn admit(&mut self, req: Request) -> Admit {
        let entry = self.entries.entry(req.client).or_default();
        if req.request_id <= entry.last_executed {
            return if req.request_id == entry.last_executed && entry.cached_reply.is_some() {
                Admit::Executed
            } else {
                Admit::Stale
            };
        }
        if let Some(pending) = &entry.pending {
            if pending.request_id >= req.request_id {
                return Admit::Pending;
            }
        }
        self.queue.push_back((req.client, req.request_id));
        entry.pending = Some(req);
        Admit::Fresh
    }

    /// Whether `(client, request_id)` has already been executed.
    pub fn has_executed(&self, client: ClientId, request_id: RequestId) -> bool {
        self.entries
            .get(&client)
            .map(|e| e.last_executed >= request_id)
            .unwrap_or(false)
    }

    pub fn cached_reply(&self, client: ClientId, request_id: RequestId) -> Option<&Reply> {
        let entry = self.entries.get(&client)?;
        (entry.last_executed == request_id)
            .then_some(entry.cached_reply.as_ref())
            .flatten()
    }

    /// Record an execution and cache its reply, evicting the pending slot.
    pub fn executed(&mut self, client: ClientId, request_id: RequestId, reply: Reply) {
        let entry = self.entries.entry(client).or_default();
        if request_id <= entry.last_executed {
            return;
        }
        entry.last_executed = request_id;
        entry.cached_reply = Some(reply);
        if entry
            .pending
            .as_ref()
            .map(|p| p.request_id <= request_id)
            .unwrap_or(false)
        {
            entry.pending = None;
        }
    }

    /// Whether any admitted request is still unordered. Drives the
    /// view-change timer.
    pub fn has_pending(&self) -> bool {
        self.entries.values().any(|e| e.pending.is_some())
    }

    /// Pull up to `max_reqs` pending requests within `max_bytes`, in
    /// admission order. Requests stay pending (for timers and re-proposal)
    /// until executed; callers must not re-pull before the previous batch
    /// resolves, which `drain_queue` guarantees by consuming the queue.
    pub fn next_batch(&mut self, max_reqs: usize, max_bytes: usize) -> Vec<Request> {
        let mut picked = Vec::new();
        let mut bytes = 0usize;
        while picked.len() < max_reqs {
            let Some((client, rid)) = self.queue.front().copied() else {
                break;
            };
            let Some(req) = self
                .entries
                .get(&client)
                .and_then(|e| e.pending.as_ref())
                .filter(|p| p.request_id == rid)
            else {
                // Superseded or executed while queued; discard the key.
                self.queue.pop_front();
                continue;
            };
            if !picked.is_empty() && bytes + req.payload.len() > max_bytes {
                break;
            }
            bytes += req.payload.len();
            picked.push(req.clone());
            self.queue.pop_front();
        }
        picked
    }

    /// Re-queue a pending request for batching (after a failed view, when
    /// its batch never committed).
    pub fn requeue_pending(&mut self) {
        self.queue.clear();
        for (client, entry) in &self.entries {
            if let Some(req) = &entry.pending {
                self.queue.push_back((*client, req.request_id));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_types::{Digest, ReplicaId, Signature};

    fn request(client: u64, rid: RequestId, payload: &[u8]) -> Request {
        Request {
            client: ClientId(client),
            request_id: rid,
            payload: payload.to_vec(),
            read_only: false,
            signature: Signature::zero(),
        }
    }

    fn reply(client: u64, rid: RequestId) -> Reply {
        Reply {
            view: 0,
            client: ClientId(client),
            request_id: rid,
            replica: ReplicaId(0),
            result: b"OK".to_vec(),
            state_digest: Digest::ZERO,
            signature: Signature::zero(),
        }
    }

    #[test]
    fn admit_then_execute_then_duplicate() {
        let mut table = ClientTable::new();
        assert_eq!(table.admit(request(7, 1, b"A")), Admit::Fresh);
        assert_eq!(table.admit(request(7, 1, b"A")), Admit::Pending);

        table.executed(ClientId(7), 1, reply(7, 1));
        assert!(table.has_executed(ClientId(7), 1));
        assert_eq!(table.admit(request(7, 1, b"A")), Admit::Executed);
        assert!(table.cached_reply(ClientId(7), 1).is_some());
        assert_eq!(table.admit(request(7, 0, b"old")), Admit::Stale);
    }

    #[test]
    fn batching_respects_count_and_bytes() {
        let mut table = ClientTable::new();
        for c in 0..5u64 {
            table.admit(request(c, 1, b"xxxx"));
        }
        let batch = table.next_batch(3, usize::MAX);
        assert_eq!(batch.len(), 3);

        // Byte bound: always at least one request per batch.
        let batch = table.next_batch(10, 5);
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn requeue_restores_unexecuted_pending() {
        let mut table = ClientTable::new();
        table.admit(request(1, 1, b"a"));
        table.admit(request(2, 1, b"b"));
        let drained = table.next_batch(10, usize::MAX);
        assert_eq!(drained.len(), 2);
        assert!(table.next_batch(10, usize::MAX).is_empty());

        table.executed(ClientId(1), 1, reply(1, 1));
        table.requeue_pending();
        let again = table.next_batch(10, usize::MAX);
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].client, ClientId(2));
    }

    #[test]
    fn pending_drives_view_change_arming() {
        let mut table = ClientTable::new();
        assert!(!table.has_pending());
        table.admit(request(3, 1, b"p"));
        assert!(table.has_pending());
        table.executed(ClientId(3), 1, reply(3, 1));
        assert!(!table.has_pending());
    }
}
