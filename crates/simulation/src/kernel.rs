//! In-memory application kernel and ledger sink for simulation.

use palisade_core::{ApplicationKernel, KernelError, LedgerEvent, LedgerSink};
use palisade_types::{ClientId, Digest, RequestId, Seqno};
use serde::{Deserialize, Serialize};

/// Deterministic kernel that records every executed payload.
///
/// The reply to an ordered request is `"OK"`; read-only requests answer
/// with the current entry count. The state digest covers the full ordered
/// history, so two replicas agree on the digest iff they executed the same
/// sequence.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct EchoKernel {
    entries: Vec<(Seqno, u64, Vec<u8>)>,
}

impl EchoKernel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[(Seqno, u64, Vec<u8>)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ApplicationKernel for EchoKernel {
    fn execute(
        &mut self,
        seqno: Seqno,
        _non_det: &[u8],
        client: ClientId,
        _request_id: RequestId,
        payload: &[u8],
    ) -> Result<Vec<u8>, KernelError> {
        self.entries.push((seqno, client.0, payload.to_vec()));
        Ok(b"OK".to_vec())
    }

    fn execute_read_only(&self, _client: ClientId, _payload: &[u8]) -> Result<Vec<u8>, KernelError> {
        Ok(format!("LEN:{}", self.entries.len()).into_bytes())
    }

    fn non_det_choice(&mut self, seqno: Seqno, max_len: usize) -> Vec<u8> {
        let mut nd = seqno.to_le_bytes().to_vec();
        nd.truncate(max_len);
        nd
    }

    fn state_digest(&self) -> Digest {
        match bincode::serialize(&self.entries) {
            Ok(bytes) => Digest::of(&bytes),
            Err(_) => Digest::ZERO,
        }
    }

    fn snapshot(&self) -> Vec<Vec<u8>> {
        match bincode::serialize(&self.entries) {
            Ok(bytes) => vec![bytes],
            Err(_) => vec![],
        }
    }

    fn install_snapshot(&mut self, _seqno: Seqno, chunks: &[Vec<u8>]) -> Result<(), KernelError> {
        let first = chunks
            .first()
            .ok_or_else(|| KernelError::Snapshot("empty snapshot".into()))?;
        self.entries =
            bincode::deserialize(first).map_err(|e| KernelError::Snapshot(e.to_string()))?;
        Ok(())
    }
}

/// Ledger sink recording every frame it was handed, in order.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    frames: Vec<Vec<u8>>,
    appends: usize,
    truncates: Vec<u64>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> &[Vec<u8>] {
        &self.frames
    }

    pub fn appends(&self) -> usize {
        self.appends
    }

    pub fn truncates(&self) -> &[u64] {
        &self.truncates
    }
}

impl LedgerSink for MemoryLedger {
    fn append(&mut self, bytes: &[u8]) {
        self.appends += 1;
        self.frames
            .push(LedgerEvent::Append(bytes.to_vec()).to_frame());
    }

    fn truncate(&mut self, index: u64) {
        self.truncates.push(index);
        self.frames.push(LedgerEvent::Truncate(index).to_frame());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_tracks_history() {
        let mut a = EchoKernel::new();
        let mut b = EchoKernel::new();
        assert_eq!(a.state_digest(), b.state_digest());
        a.execute(1, &[], ClientId(7), 1, b"A").unwrap();
        assert_ne!(a.state_digest(), b.state_digest());
        b.execute(1, &[], ClientId(7), 1, b"A").unwrap();
        assert_eq!(a.state_digest(), b.state_digest());
    }

    #[test]
    fn snapshot_round_trip() {
        let mut a = EchoKernel::new();
        a.execute(1, &[], ClientId(7), 1, b"A").unwrap();
        a.execute(2, &[], ClientId(7), 2, b"B").unwrap();
        let mut b = EchoKernel::new();
        b.install_snapshot(2, &a.snapshot()).unwrap();
        assert_eq!(a.state_digest(), b.state_digest());
        assert_eq!(b.len(), 2);
    }

    #[test]
    fn ledger_frames_are_ordered() {
        let mut ledger = MemoryLedger::new();
        ledger.append(b"one");
        ledger.truncate(3);
        assert_eq!(ledger.appends(), 1);
        assert_eq!(ledger.truncates(), &[3]);
        assert_eq!(ledger.frames().len(), 2);
        assert_eq!(&ledger.frames()[0][..4], &3u32.to_le_bytes());
    }
}
