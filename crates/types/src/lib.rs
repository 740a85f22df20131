//! Core types for the Palisade replication protocol.
//!
//! This crate provides the foundational types used throughout the
//! implementation:
//!
//! - **Primitives**: digests, keys, signatures, MAC vectors
//! - **Identifiers**: `ReplicaId`, `ClientId`, sequence numbers, views
//! - **Protocol types**: requests, batches, wire messages
//! - **Principal set**: replica membership and quorum math
//! - **Codec**: wire encoding and authenticator verification
//!
//! # Design Philosophy
//!
//! This crate is self-contained and does not depend on any other workspace
//! crates, making it the foundation layer. Everything here is passive data
//! plus pure functions; protocol state lives in `palisade-pbft`.

mod codec;
mod crypto;
mod digest;
mod messages;
mod principal;
mod request;

pub use codec::{decode, encode, AuthError, CodecError, DecodeError, Verifier};
pub use crypto::{Authenticator, KeyPair, MacKey, MacTag, SigMode, Signature};
pub use digest::Digest;
pub use messages::{
    Batch, Checkpoint, Commit, Fetch, FetchChunk, FetchReply, NewView, PrePrepare, Prepare,
    PreparedEvidence, ProtocolMessage, QueryStable, ReplyStable, Status, ViewChange,
    DOMAIN_CHECKPOINT, DOMAIN_COMMIT, DOMAIN_FETCH, DOMAIN_NEW_VIEW, DOMAIN_PREPARE,
    DOMAIN_PRE_PREPARE, DOMAIN_REPLY, DOMAIN_STATUS, DOMAIN_VIEW_CHANGE,
};
pub use principal::{ClientDirectory, Principal, PrincipalSet, PrincipalSetError};
pub use request::{Reply, Request};

use serde::{Deserialize, Serialize};

/// Sequence number assigned to a batch by the primary. Monotonic, starts at 1.
pub type Seqno = u64;

/// View number. The primary of view `v` is `v mod n`.
pub type View = u64;

/// Client-chosen request identifier, monotonic per client.
pub type RequestId = u64;

/// Replica identity, an index into the principal set, in `[0, n)`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct ReplicaId(pub u32);

impl std::fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Client identity, resolved through the client directory.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct ClientId(pub u64);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "c{}", self.0)
    }
}
