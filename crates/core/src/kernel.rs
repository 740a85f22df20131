//! The deterministic application kernel interface.
//!
//! The kernel is the service being replicated. It consumes ordered
//! requests, produces reply bytes, and exposes the state digest and
//! snapshot hooks that checkpointing and state transfer need. Calls are
//! synchronous and bounded; the kernel must not block on external I/O.

use palisade_types::{ClientId, Digest, RequestId, Seqno};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KernelError {
    /// Execution failed. Fatal for the replica: it stops participating.
    #[error("kernel execution failed: {0}")]
    Execution(String),
    /// A snapshot could not be installed (corrupt or inconsistent chunks).
    #[error("snapshot rejected: {0}")]
    Snapshot(String),
}

/// Deterministic executor consuming the ordered request sequence.
///
/// Determinism contract: given the same sequence of `execute` calls (same
/// seqnos, non-determinism bytes, and payloads), every correct replica
/// produces the same reply bytes and the same `state_digest` values.
pub trait ApplicationKernel {
    /// Execute one ordered request. Called exactly once per unique
    /// `(client, request_id)` per replica; the engine's reply cache absorbs
    /// duplicates.
    fn execute(
        &mut self,
        seqno: Seqno,
        non_det: &[u8],
        client: ClientId,
        request_id: RequestId,
        payload: &[u8],
    ) -> Result<Vec<u8>, KernelError>;

    /// Execute a read-only request speculatively against current state.
    /// Must not mutate state.
    fn execute_read_only(&self, client: ClientId, payload: &[u8]) -> Result<Vec<u8>, KernelError>;

    /// Primary-side non-determinism choice for the batch at `seqno`
    /// (timestamps and the like). At most `max_len` bytes.
    fn non_det_choice(&mut self, seqno: Seqno, max_len: usize) -> Vec<u8>;

    /// Digest of all state produced by execution so far. Called at
    /// checkpoint intervals; must not reflect partially applied batches.
    fn state_digest(&self) -> Digest;

    /// Serialize current state for transfer to a lagging peer.
    fn snapshot(&self) -> Vec<Vec<u8>>;

    /// Replace state wholesale with a transferred snapshot taken at `seqno`.
    fn install_snapshot(&mut self, seqno: Seqno, chunks: &[Vec<u8>]) -> Result<(), KernelError>;
}
