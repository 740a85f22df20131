//! Replica configuration.

use palisade_types::{ReplicaId, SigMode};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_out must be a power of two, got {0}")]
    MaxOutNotPowerOfTwo(u64),
    #[error("checkpoint_interval {interval} must divide max_out {max_out}")]
    IntervalDoesNotDivide { interval: u64, max_out: u64 },
    #[error("replica id {id} out of range for n={n}")]
    IdOutOfRange { id: u32, n: usize },
    #[error("max_reqs_per_batch must be nonzero")]
    EmptyBatchBound,
}

/// Static configuration for one replica. No environment variables or CLI
/// here; the hosting frontend owns those.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// This replica's identity in `[0, n)`.
    pub id: ReplicaId,
    /// In-flight window size; a power of two.
    pub max_out: u64,
    /// Executed seqnos between checkpoints; must divide `max_out`.
    pub checkpoint_interval: u64,
    /// Batching bounds.
    pub max_reqs_per_batch: usize,
    pub max_batch_bytes: usize,
    /// Upper bound on the kernel's non-determinism payload.
    pub max_nd_len: usize,
    /// Base no-progress timeout; doubles per failed view change.
    pub view_change_timeout: Duration,
    /// Primary batch-assembly deadline.
    pub batch_delay: Duration,
    /// Periodic status exchange interval.
    pub status_interval: Duration,
    /// State-transfer progress deadline per attempt.
    pub fetch_timeout: Duration,
    /// Fetch attempts before surfacing a recovery-required alert.
    pub fetch_retry_budget: u32,
    /// Default authenticator for hot-path ordering messages.
    pub sig_mode: SigMode,
}

impl ReplicaConfig {
    pub fn new(id: ReplicaId) -> Self {
        ReplicaConfig {
            id,
            max_out: 32,
            checkpoint_interval: 8,
            max_reqs_per_batch: 64,
            max_batch_bytes: 256 * 1024,
            max_nd_len: 64,
            view_change_timeout: Duration::from_secs(2),
            batch_delay: Duration::from_millis(20),
            status_interval: Duration::from_millis(500),
            fetch_timeout: Duration::from_secs(1),
            fetch_retry_budget: 8,
            sig_mode: SigMode::MacVector,
        }
    }

    /// Check internal consistency against the principal set size `n`.
    pub fn validate(&self, n: usize) -> Result<(), ConfigError> {
        if !self.max_out.is_power_of_two() {
            return Err(ConfigError::MaxOutNotPowerOfTwo(self.max_out));
        }
        if self.checkpoint_interval == 0 || self.max_out % self.checkpoint_interval != 0 {
            return Err(ConfigError::IntervalDoesNotDivide {
                interval: self.checkpoint_interval,
                max_out: self.max_out,
            });
        }
        if self.id.0 as usize >= n {
            return Err(ConfigError::IdOutOfRange { id: self.id.0, n });
        }
        if self.max_reqs_per_batch == 0 {
            return Err(ConfigError::EmptyBatchBound);
        }
        Ok(())
    }
}
