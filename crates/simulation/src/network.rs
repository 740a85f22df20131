//! Simulated network with deterministic latency, packet loss, and
//! partitions.

use palisade_types::ReplicaId;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::HashSet;
use std::time::Duration;

/// Configuration for the simulated network and deployment.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Tolerated faulty replicas; the deployment has `3f + 1` replicas.
    pub f: usize,
    /// Number of simulated clients.
    pub clients: usize,
    /// Base one-way message latency.
    pub latency: Duration,
    /// Jitter as a fraction of base latency (0.0 - 1.0).
    pub jitter_fraction: f64,
    /// Messages are dropped with this probability.
    pub packet_loss_rate: f64,
    /// In-flight window size for every replica.
    pub max_out: u64,
    /// Checkpoint interval for every replica; must divide `max_out`.
    pub checkpoint_interval: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            f: 1,
            clients: 1,
            latency: Duration::from_millis(10),
            jitter_fraction: 0.1,
            packet_loss_rate: 0.0,
            max_out: 32,
            checkpoint_interval: 8,
        }
    }
}

impl SimConfig {
    pub fn n(&self) -> usize {
        3 * self.f + 1
    }
}

/// Deterministic message delivery decisions: partitions first, then
/// probabilistic loss, then latency sampling. Partitions are directional;
/// only replica links partition (clients model retransmission instead).
#[derive(Debug)]
pub struct SimulatedNetwork {
    config: SimConfig,
    partitions: HashSet<(ReplicaId, ReplicaId)>,
}

impl SimulatedNetwork {
    pub fn new(config: SimConfig) -> Self {
        SimulatedNetwork {
            config,
            partitions: HashSet::new(),
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    // ─── Partition management ───

    pub fn is_partitioned(&self, from: ReplicaId, to: ReplicaId) -> bool {
        self.partitions.contains(&(from, to))
    }

    pub fn partition_bidirectional(&mut self, a: ReplicaId, b: ReplicaId) {
        self.partitions.insert((a, b));
        self.partitions.insert((b, a));
    }

    /// Cut a replica off from every peer, both directions.
    pub fn isolate(&mut self, node: ReplicaId) {
        for i in 0..self.config.n() as u32 {
            let other = ReplicaId(i);
            if other != node {
                self.partitions.insert((node, other));
                self.partitions.insert((other, node));
            }
        }
    }

    pub fn heal(&mut self, node: ReplicaId) {
        self.partitions.retain(|(a, b)| *a != node && *b != node);
    }

    pub fn heal_all(&mut self) {
        self.partitions.clear();
    }

    // ─── Delivery decisions ───

    /// `None` when the message is dropped; otherwise the sampled latency.
    pub fn replica_link(
        &self,
        from: ReplicaId,
        to: ReplicaId,
        rng: &mut ChaCha8Rng,
    ) -> Option<Duration> {
        if self.is_partitioned(from, to) {
            return None;
        }
        self.client_link(rng)
    }

    /// Client links never partition, only lose packets.
    pub fn client_link(&self, rng: &mut ChaCha8Rng) -> Option<Duration> {
        if self.config.packet_loss_rate > 0.0 && rng.gen::<f64>() < self.config.packet_loss_rate {
            return None;
        }
        Some(self.sample_latency(rng))
    }

    fn sample_latency(&self, rng: &mut ChaCha8Rng) -> Duration {
        let base = self.config.latency.as_secs_f64();
        let jitter_range = base * self.config.jitter_fraction;
        let jitter = if jitter_range > 0.0 {
            rng.gen_range(-jitter_range..jitter_range)
        } else {
            0.0
        };
        Duration::from_secs_f64((base + jitter).max(0.0005))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn isolation_cuts_both_directions() {
        let mut net = SimulatedNetwork::new(SimConfig::default());
        net.isolate(ReplicaId(3));
        assert!(net.is_partitioned(ReplicaId(3), ReplicaId(0)));
        assert!(net.is_partitioned(ReplicaId(0), ReplicaId(3)));
        assert!(!net.is_partitioned(ReplicaId(0), ReplicaId(1)));
        net.heal(ReplicaId(3));
        assert!(!net.is_partitioned(ReplicaId(3), ReplicaId(0)));
    }

    #[test]
    fn latency_is_deterministic_per_seed() {
        let net = SimulatedNetwork::new(SimConfig::default());
        let mut a = ChaCha8Rng::seed_from_u64(7);
        let mut b = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..32 {
            assert_eq!(
                net.replica_link(ReplicaId(0), ReplicaId(1), &mut a),
                net.replica_link(ReplicaId(0), ReplicaId(1), &mut b)
            );
        }
    }

    #[test]
    fn full_loss_drops_everything() {
        let net = SimulatedNetwork::new(SimConfig {
            packet_loss_rate: 1.0,
            ..Default::default()
        });
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        for _ in 0..10 {
            assert!(net.client_link(&mut rng).is_none());
        }
    }
}
