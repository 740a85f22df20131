//! Replica membership and quorum math.
//!
//! `n = 3f + 1` replicas tolerate `f` arbitrary faults. The primary of view
//! `v` is `v mod n`. Thresholds: a weak quorum (`f + 1`) guarantees at least
//! one correct member; a strong quorum (`2f + 1`) guarantees any two quorums
//! intersect in a correct member.

use crate::crypto::{self, MacKey, MacTag, Signature};
use crate::digest::Digest;
use crate::{ClientId, ReplicaId, View};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Public identity of one replica, distributed at configuration time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub id: ReplicaId,
    /// ed25519 verifying key bytes.
    pub verifying_key: [u8; 32],
    /// Seed from which this principal derives its outgoing MAC keys.
    pub mac_seed: [u8; 32],
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PrincipalSetError {
    #[error("principal count {count} does not match 3f+1 for f={f}")]
    WrongCount { count: usize, f: usize },
    #[error("principal ids must be 0..n in order, found {0} at position {1}")]
    BadId(ReplicaId, usize),
}

/// The configured replica set for one deployment.
#[derive(Debug, Clone)]
pub struct PrincipalSet {
    principals: Vec<Principal>,
    f: usize,
}

impl PrincipalSet {
    /// Build a principal set; `principals.len()` must equal `3f + 1` and ids
    /// must be dense in `[0, n)`.
    pub fn new(principals: Vec<Principal>, f: usize) -> Result<Self, PrincipalSetError> {
        let n = 3 * f + 1;
        if principals.len() != n {
            return Err(PrincipalSetError::WrongCount {
                count: principals.len(),
                f,
            });
        }
        for (i, p) in principals.iter().enumerate() {
            if p.id.0 as usize != i {
                return Err(PrincipalSetError::BadId(p.id, i));
            }
        }
        Ok(PrincipalSet { principals, f })
    }

    /// Total replica count, `3f + 1`.
    pub fn n(&self) -> usize {
        self.principals.len()
    }

    /// Maximum tolerated faulty replicas.
    pub fn f(&self) -> usize {
        self.f
    }

    /// Strong quorum threshold, `2f + 1`.
    pub fn quorum(&self) -> usize {
        2 * self.f + 1
    }

    /// Weak quorum threshold, `f + 1`. At least one member is correct.
    pub fn weak_quorum(&self) -> usize {
        self.f + 1
    }

    /// The primary responsible for proposing in `view`.
    pub fn primary(&self, view: View) -> ReplicaId {
        ReplicaId((view % self.n() as u64) as u32)
    }

    pub fn is_primary(&self, view: View, id: ReplicaId) -> bool {
        self.primary(view) == id
    }

    pub fn contains(&self, id: ReplicaId) -> bool {
        (id.0 as usize) < self.principals.len()
    }

    pub fn principal(&self, id: ReplicaId) -> Option<&Principal> {
        self.principals.get(id.0 as usize)
    }

    /// All replica ids, in order.
    pub fn ids(&self) -> impl Iterator<Item = ReplicaId> + '_ {
        (0..self.principals.len() as u32).map(ReplicaId)
    }

    /// Verify `sig` by `signer` over `digest`.
    pub fn verify_signature(&self, signer: ReplicaId, digest: &Digest, sig: &Signature) -> bool {
        match self.principal(signer) {
            Some(p) => crypto::verify_signature(&p.verifying_key, digest, sig),
            None => false,
        }
    }

    /// The key `sender` uses toward `receiver`; receivers use this to check
    /// their own MAC-vector entry.
    pub fn mac_key(&self, sender: ReplicaId, receiver: ReplicaId) -> Option<MacKey> {
        self.principal(sender)
            .map(|p| MacKey::derive(&p.mac_seed, receiver))
    }

    /// Verify the MAC-vector entry addressed to `receiver`.
    pub fn verify_mac(
        &self,
        sender: ReplicaId,
        receiver: ReplicaId,
        digest: &Digest,
        tags: &[MacTag],
    ) -> bool {
        let Some(tag) = tags.get(receiver.0 as usize) else {
            return false;
        };
        match self.mac_key(sender, receiver) {
            Some(key) => key.verify(digest, tag),
            None => false,
        }
    }
}

/// Known client verifying keys.
///
/// Clients are principals too, but carry no MAC seeds and take no part in
/// quorum math, so they live in a separate directory.
#[derive(Debug, Clone, Default)]
pub struct ClientDirectory {
    keys: BTreeMap<ClientId, [u8; 32]>,
}

impl ClientDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, client: ClientId, verifying_key: [u8; 32]) {
        self.keys.insert(client, verifying_key);
    }

    pub fn contains(&self, client: ClientId) -> bool {
        self.keys.contains_key(&client)
    }

    pub fn verify(&self, client: ClientId, digest: &Digest, sig: &Signature) -> bool {
        match self.keys.get(&client) {
            Some(key) => crypto::verify_signature(key, digest, sig),
            None => false,
        }
    }
}
