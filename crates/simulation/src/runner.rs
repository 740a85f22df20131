//! Deterministic simulation runner.
//!
//! Drives a full deployment (replicas plus clients) as synchronous state
//! machines over a single ordered event queue. Given the same seed, every
//! run produces identical results. All the core's actions are executed
//! here: network sends pass through the real codec (encode then decode) so
//! the wire path is exercised end to end, timers become queued events, and
//! ledger writes land in per-replica in-memory sinks.

use crate::kernel::{EchoKernel, MemoryLedger};
use crate::network::{SimConfig, SimulatedNetwork};
use palisade_client::{ClientConfig, ClientState};
use palisade_core::{Action, Event, EventPriority, LedgerSink, StateMachine, TimerId};
use palisade_pbft::{ReplicaConfig, ReplicaState};
use palisade_types::{
    decode, encode, ClientDirectory, ClientId, KeyPair, Principal, PrincipalSet, ProtocolMessage,
    ReplicaId,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tracing::{info, trace};

/// A simulated endpoint: a replica or a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Endpoint {
    Replica(ReplicaId),
    Client(ClientId),
}

/// Deterministic ordering key for queued events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct EventKey {
    time: Duration,
    priority: EventPriority,
    seq: u64,
}

/// Statistics collected during simulation.
#[derive(Debug, Default, Clone)]
pub struct SimulationStats {
    pub events_processed: u64,
    pub messages_sent: u64,
    pub messages_dropped_partition: u64,
    pub messages_dropped_loss: u64,
    pub messages_dropped_mute: u64,
    pub timers_set: u64,
    pub timers_cancelled: u64,
}

/// Deterministic simulation of `3f + 1` replicas and a set of clients.
pub struct SimulationRunner {
    replicas: Vec<ReplicaState<EchoKernel>>,
    clients: Vec<ClientState>,
    ledgers: Vec<MemoryLedger>,
    alerts: Vec<Vec<String>>,
    replica_keys: Vec<KeyPair>,
    client_keys: Vec<KeyPair>,
    principals: PrincipalSet,

    queue: BTreeMap<EventKey, (Endpoint, Event)>,
    timers: HashMap<(Endpoint, TimerId), EventKey>,
    /// Per-link monotone delivery clock: per-sender FIFO.
    link_clock: HashMap<(Endpoint, Endpoint), Duration>,
    /// Replicas whose outgoing traffic is dropped (fault injection).
    muted: HashSet<ReplicaId>,

    network: SimulatedNetwork,
    rng: ChaCha8Rng,
    now: Duration,
    seq: u64,
    stats: SimulationStats,
}

impl SimulationRunner {
    pub fn new(config: SimConfig, seed: u64) -> Self {
        let n = config.n();
        let replica_keys: Vec<KeyPair> = (0..n)
            .map(|i| {
                let mut seed_bytes = [0u8; 32];
                let key_seed = seed
                    .wrapping_add(i as u64)
                    .wrapping_mul(0x517c_c1b7_2722_0a95);
                seed_bytes[..8].copy_from_slice(&key_seed.to_le_bytes());
                seed_bytes[8..16].copy_from_slice(&(i as u64).to_le_bytes());
                KeyPair::from_seed(&seed_bytes)
            })
            .collect();
        let principals = PrincipalSet::new(
            replica_keys
                .iter()
                .enumerate()
                .map(|(i, k)| Principal {
                    id: ReplicaId(i as u32),
                    verifying_key: k.public_bytes(),
                    mac_seed: *k.mac_seed(),
                })
                .collect(),
            config.f,
        )
        .expect("replica key count is 3f+1 by construction");

        let client_keys: Vec<KeyPair> = (0..config.clients)
            .map(|i| {
                let mut seed_bytes = [0xC0u8; 32];
                seed_bytes[..8].copy_from_slice(&(seed ^ (i as u64 + 1)).to_le_bytes());
                KeyPair::from_seed(&seed_bytes)
            })
            .collect();
        let mut directory = ClientDirectory::new();
        for (i, k) in client_keys.iter().enumerate() {
            directory.insert(ClientId(i as u64 + 1), k.public_bytes());
        }

        let replicas: Vec<ReplicaState<EchoKernel>> = (0..n)
            .map(|i| {
                let mut rc = ReplicaConfig::new(ReplicaId(i as u32));
                rc.max_out = config.max_out;
                rc.checkpoint_interval = config.checkpoint_interval;
                rc.view_change_timeout = Duration::from_millis(400);
                rc.batch_delay = Duration::from_millis(5);
                rc.status_interval = Duration::from_millis(150);
                rc.fetch_timeout = Duration::from_millis(300);
                ReplicaState::new(
                    rc,
                    principals.clone(),
                    directory.clone(),
                    replica_keys[i].clone(),
                    EchoKernel::new(),
                )
                .expect("simulation replica config is valid")
            })
            .collect();

        let clients: Vec<ClientState> = (0..config.clients)
            .map(|i| {
                ClientState::new(
                    ClientId(i as u64 + 1),
                    client_keys[i].clone(),
                    principals.clone(),
                    ClientConfig {
                        retransmit_timeout: Duration::from_millis(300),
                        broadcast_after: 2,
                    },
                )
            })
            .collect();

        info!(n, f = config.f, clients = config.clients, seed, "created simulation");
        SimulationRunner {
            ledgers: (0..n).map(|_| MemoryLedger::new()).collect(),
            alerts: vec![Vec::new(); n],
            replicas,
            clients,
            replica_keys,
            client_keys,
            principals,
            queue: BTreeMap::new(),
            timers: HashMap::new(),
            link_clock: HashMap::new(),
            muted: HashSet::new(),
            network: SimulatedNetwork::new(config),
            rng: ChaCha8Rng::seed_from_u64(seed),
            now: Duration::ZERO,
            seq: 0,
            stats: SimulationStats::default(),
        }
    }

    /// Arm every replica's startup timers.
    pub fn init(&mut self) {
        for i in 0..self.replicas.len() {
            let actions = self.replicas[i].init();
            self.dispatch(Endpoint::Replica(ReplicaId(i as u32)), actions);
        }
    }

    // ─── Accessors ───

    pub fn replica(&self, i: u32) -> &ReplicaState<EchoKernel> {
        &self.replicas[i as usize]
    }

    pub fn client(&self, i: usize) -> &ClientState {
        &self.clients[i]
    }

    pub fn client_mut(&mut self, i: usize) -> &mut ClientState {
        &mut self.clients[i]
    }

    pub fn ledger(&self, i: u32) -> &MemoryLedger {
        &self.ledgers[i as usize]
    }

    pub fn alerts(&self, i: u32) -> &[String] {
        &self.alerts[i as usize]
    }

    pub fn replica_key(&self, i: u32) -> &KeyPair {
        &self.replica_keys[i as usize]
    }

    pub fn client_key(&self, i: usize) -> &KeyPair {
        &self.client_keys[i]
    }

    pub fn principals(&self) -> &PrincipalSet {
        &self.principals
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    // ─── Fault injection ───

    /// Drop all outgoing traffic from `node` (a "silent" fault).
    pub fn mute(&mut self, node: ReplicaId) {
        self.muted.insert(node);
    }

    pub fn unmute(&mut self, node: ReplicaId) {
        self.muted.remove(&node);
    }

    /// Cut `node` off from all peers, both directions.
    pub fn isolate(&mut self, node: ReplicaId) {
        self.network.isolate(node);
    }

    pub fn heal(&mut self, node: ReplicaId) {
        self.network.heal(node);
    }

    /// Inject a crafted message for delivery at `at` (fault scenarios).
    pub fn schedule_message(&mut self, to: Endpoint, at: Duration, msg: ProtocolMessage) {
        let event = Event::MessageReceived { msg };
        self.enqueue(to, at.max(self.now), event);
    }

    // ─── Driving ───

    /// Issue a request from client `i` at the current time.
    pub fn client_invoke(&mut self, i: usize, payload: &[u8], read_only: bool) {
        let actions = self.clients[i].invoke(payload.to_vec(), read_only);
        let id = self.clients[i].id();
        self.dispatch(Endpoint::Client(id), actions);
    }

    /// Process events until simulated time reaches `until`.
    pub fn run_until(&mut self, until: Duration) {
        loop {
            let key = match self.queue.keys().next().copied() {
                Some(k) => k,
                None => break,
            };
            if key.time > until {
                break;
            }
            let (endpoint, event) = match self.queue.remove(&key) {
                Some(entry) => entry,
                None => continue,
            };
            self.now = key.time;
            // A fired timer releases its registration.
            if let Event::BatchTimer
            | Event::ViewChangeTimer
            | Event::StatusTimer
            | Event::FetchTimer
            | Event::ClientRetransmitTimer = event
            {
                let id = timer_id(&event);
                if self.timers.get(&(endpoint, id)) == Some(&key) {
                    self.timers.remove(&(endpoint, id));
                }
            }
            self.stats.events_processed += 1;
            let actions = match endpoint {
                Endpoint::Replica(id) => {
                    let r = &mut self.replicas[id.0 as usize];
                    r.set_time(self.now);
                    r.handle(event)
                }
                Endpoint::Client(id) => {
                    let c = &mut self.clients[(id.0 - 1) as usize];
                    c.set_time(self.now);
                    c.handle(event)
                }
            };
            self.dispatch(endpoint, actions);
        }
        self.now = until.max(self.now);
    }

    /// Advance by `d` from the current time.
    pub fn run_for(&mut self, d: Duration) {
        self.run_until(self.now + d);
    }

    /// Run until client `i` has a completed result or `deadline` passes.
    pub fn run_until_client_idle(&mut self, i: usize, deadline: Duration) -> bool {
        let step = Duration::from_millis(20);
        while self.now < deadline {
            if self.clients[i].is_idle() {
                return true;
            }
            self.run_for(step);
        }
        self.clients[i].is_idle()
    }

    // ─── Action execution ───

    fn dispatch(&mut self, from: Endpoint, actions: Vec<Action>) {
        for action in actions {
            trace!(?from, kind = action.type_name(), "action");
            match action {
                Action::Send { to, msg } => self.route(from, Endpoint::Replica(to), msg),
                Action::Broadcast { msg } => {
                    for i in 0..self.replicas.len() as u32 {
                        let to = Endpoint::Replica(ReplicaId(i));
                        if from != to {
                            self.route(from, to, msg.clone());
                        }
                    }
                }
                Action::SendReply { client, reply } => {
                    self.route(from, Endpoint::Client(client), ProtocolMessage::Reply(reply));
                }
                Action::SetTimer { id, duration } => {
                    self.stats.timers_set += 1;
                    // Re-arming replaces any queued firing.
                    if let Some(old) = self.timers.remove(&(from, id)) {
                        self.queue.remove(&old);
                    }
                    let key = self.enqueue(from, self.now + duration, timer_event(id));
                    self.timers.insert((from, id), key);
                }
                Action::CancelTimer { id } => {
                    self.stats.timers_cancelled += 1;
                    if let Some(old) = self.timers.remove(&(from, id)) {
                        self.queue.remove(&old);
                    }
                }
                Action::LedgerAppend { bytes } => {
                    if let Endpoint::Replica(id) = from {
                        self.ledgers[id.0 as usize].append(&bytes);
                    }
                }
                Action::LedgerTruncate { index } => {
                    if let Endpoint::Replica(id) = from {
                        self.ledgers[id.0 as usize].truncate(index);
                    }
                }
                Action::OperatorAlert { detail } => {
                    if let Endpoint::Replica(id) = from {
                        self.alerts[id.0 as usize].push(detail);
                    }
                }
            }
        }
    }

    fn route(&mut self, from: Endpoint, to: Endpoint, msg: ProtocolMessage) {
        if let Endpoint::Replica(id) = from {
            if self.muted.contains(&id) {
                self.stats.messages_dropped_mute += 1;
                return;
            }
        }
        let latency = match (from, to) {
            (Endpoint::Replica(a), Endpoint::Replica(b)) => {
                match self.network.replica_link(a, b, &mut self.rng) {
                    Some(l) => l,
                    None => {
                        if self.network.is_partitioned(a, b) {
                            self.stats.messages_dropped_partition += 1;
                        } else {
                            self.stats.messages_dropped_loss += 1;
                        }
                        return;
                    }
                }
            }
            _ => match self.network.client_link(&mut self.rng) {
                Some(l) => l,
                None => {
                    self.stats.messages_dropped_loss += 1;
                    return;
                }
            },
        };

        // The wire path: encode, then decode at the receiver. Anything the
        // codec rejects dies here, exactly as on a real link.
        let bytes = match encode(&msg) {
            Ok(b) => b,
            Err(_) => return,
        };
        let decoded = match decode(&bytes) {
            Ok(m) => m,
            Err(_) => return,
        };

        // Per-sender FIFO: delivery times on one link never reorder.
        let clock = self.link_clock.entry((from, to)).or_insert(Duration::ZERO);
        let at = (self.now + latency).max(*clock);
        *clock = at;

        self.stats.messages_sent += 1;
        self.enqueue(to, at, Event::MessageReceived { msg: decoded });
    }

    fn enqueue(&mut self, to: Endpoint, at: Duration, event: Event) -> EventKey {
        let key = EventKey {
            time: at,
            priority: event.priority(),
            seq: self.seq,
        };
        self.seq += 1;
        self.queue.insert(key, (to, event));
        key
    }
}

fn timer_event(id: TimerId) -> Event {
    match id {
        TimerId::Batch => Event::BatchTimer,
        TimerId::ViewChange => Event::ViewChangeTimer,
        TimerId::Status => Event::StatusTimer,
        TimerId::Fetch => Event::FetchTimer,
        TimerId::ClientRetransmit => Event::ClientRetransmitTimer,
    }
}

fn timer_id(event: &Event) -> TimerId {
    match event {
        Event::BatchTimer => TimerId::Batch,
        Event::ViewChangeTimer => TimerId::ViewChange,
        Event::StatusTimer => TimerId::Status,
        Event::FetchTimer => TimerId::Fetch,
        Event::ClientRetransmitTimer => TimerId::ClientRetransmit,
        Event::MessageReceived { .. } => unreachable!("not a timer event"),
    }
}
