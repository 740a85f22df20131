//! The write-only ledger sink protocol.
//!
//! The core emits one `Append` per executed batch, strictly in execution
//! order, and `Truncate` only when requested by a higher layer. The
//! transport to the durable ledger host is out of scope; this module fixes
//! the event vocabulary and the frame layout.

/// Length-prefix size for `Append` frames.
pub const FRAME_SIZE: usize = 4;

/// Events carried on the ledger channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEvent {
    /// Canonical serialization of one executed batch.
    Append(Vec<u8>),
    /// Truncate the ledger from `index`.
    Truncate(u64),
}

impl LedgerEvent {
    /// Wire framing: `Append` is a 4-byte little-endian length followed by
    /// the payload; `Truncate` is an 8-byte little-endian index.
    pub fn to_frame(&self) -> Vec<u8> {
        match self {
            LedgerEvent::Append(bytes) => {
                let mut frame = Vec::with_capacity(FRAME_SIZE + bytes.len());
                frame.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                frame.extend_from_slice(bytes);
                frame
            }
            LedgerEvent::Truncate(index) => index.to_le_bytes().to_vec(),
        }
    }
}

/// Destination for ledger events. Implementations are free to buffer; the
/// core assumes writes are accepted in call order.
pub trait LedgerSink {
    fn append(&mut self, bytes: &[u8]);
    fn truncate(&mut self, index: u64);
}
