//! Wire codec and authenticator verification.
//!
//! Encoding is bincode over [`ProtocolMessage`]. Verification is split in
//! two strengths:
//!
//! - [`Verifier::verify`] checks the sender authenticator fully and, for
//!   pre-prepares, every embedded client request signature.
//! - [`Verifier::verify_weaker`] checks the sender authenticator but skips
//!   the embedded request signatures. Callers may use it only when a quorum
//!   of already-verified prepares vouches for the batch digest.
//!
//! Failures are silent at the protocol level: the caller drops the message
//! and never acknowledges it.

use crate::crypto::Authenticator;
use crate::digest::Digest;
use crate::messages::{Checkpoint, PrePrepare, ProtocolMessage};
use crate::principal::{ClientDirectory, PrincipalSet};
use crate::{ReplicaId, Seqno};
use serde::Serialize;
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(#[from] bincode::Error),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed message")]
    Malformed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("unknown sender")]
    UnknownSender,
    #[error("bad authenticator")]
    BadAuth,
    #[error("message kind requires a signature")]
    SignatureRequired,
}

/// Encode a message for the wire.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, CodecError> {
    Ok(bincode::serialize(msg)?)
}

/// Decode a wire payload. Anything bincode rejects is `Malformed`.
pub fn decode(bytes: &[u8]) -> Result<ProtocolMessage, DecodeError> {
    bincode::deserialize(bytes).map_err(|_| DecodeError::Malformed)
}

/// Authenticator verification bound to one principal set.
#[derive(Debug, Clone)]
pub struct Verifier {
    principals: PrincipalSet,
    clients: ClientDirectory,
    /// The local replica, when verifying MAC vectors addressed to us.
    /// `None` for client-side verifiers, which only handle signatures.
    me: Option<ReplicaId>,
}

impl Verifier {
    pub fn for_replica(principals: PrincipalSet, clients: ClientDirectory, me: ReplicaId) -> Self {
        Verifier {
            principals,
            clients,
            me: Some(me),
        }
    }

    pub fn for_client(principals: PrincipalSet) -> Self {
        Verifier {
            principals,
            clients: ClientDirectory::new(),
            me: None,
        }
    }

    pub fn principals(&self) -> &PrincipalSet {
        &self.principals
    }

    pub fn clients(&self) -> &ClientDirectory {
        &self.clients
    }

    /// Full verification.
    pub fn verify(&self, msg: &ProtocolMessage) -> Result<(), AuthError> {
        self.verify_inner(msg, true)
    }

    /// Weak verification: sender authenticator only. For pre-prepares this
    /// skips the embedded client request signatures; identical to `verify`
    /// for every other message kind.
    pub fn verify_weaker(&self, msg: &ProtocolMessage) -> Result<(), AuthError> {
        self.verify_inner(msg, false)
    }

    fn verify_inner(&self, msg: &ProtocolMessage, check_requests: bool) -> Result<(), AuthError> {
        match msg {
            ProtocolMessage::Request(req) => self.verify_request(req),
            ProtocolMessage::PrePrepare(pp) => {
                self.verify_replica_auth(pp.sender, &pp.signing_digest(), &pp.auth, false)?;
                if check_requests {
                    self.verify_batch_requests(pp)?;
                }
                Ok(())
            }
            ProtocolMessage::Prepare(m) => {
                self.verify_replica_auth(m.sender, &m.signing_digest(), &m.auth, false)
            }
            ProtocolMessage::Commit(m) => {
                self.verify_replica_auth(m.sender, &m.signing_digest(), &m.auth, false)
            }
            ProtocolMessage::Checkpoint(m) => {
                self.verify_replica_auth(m.sender, &m.signing_digest(), &m.auth, true)
            }
            ProtocolMessage::ViewChange(m) => {
                self.verify_replica_auth(m.sender, &m.signing_digest(), &m.auth, true)
            }
            ProtocolMessage::NewView(m) => {
                self.verify_replica_auth(m.sender, &m.signing_digest(), &m.auth, true)
            }
            ProtocolMessage::Status(m) => {
                self.verify_replica_auth(m.sender, &m.signing_digest(), &m.auth, false)
            }
            ProtocolMessage::QueryStable(m) => {
                self.verify_replica_auth(m.sender, &m.signing_digest(), &m.auth, false)
            }
            ProtocolMessage::ReplyStable(m) => {
                self.verify_replica_auth(m.sender, &m.signing_digest(), &m.auth, false)
            }
            ProtocolMessage::Fetch(m) => {
                self.verify_replica_auth(m.sender, &m.signing_digest(), &m.auth, false)
            }
            ProtocolMessage::FetchReply(m) => {
                self.verify_replica_auth(m.sender, &m.signing_digest(), &m.auth, false)
            }
            ProtocolMessage::Reply(m) => {
                // Replies carry a bare signature field, not an authenticator.
                if self
                    .principals
                    .verify_signature(m.replica, &m.signing_digest(), &m.signature)
                {
                    Ok(())
                } else if !self.principals.contains(m.replica) {
                    Err(AuthError::UnknownSender)
                } else {
                    Err(AuthError::BadAuth)
                }
            }
        }
    }

    fn verify_request(&self, req: &crate::Request) -> Result<(), AuthError> {
        if !self.clients.contains(req.client) {
            return Err(AuthError::UnknownSender);
        }
        if self.clients.verify(req.client, &req.digest(), &req.signature) {
            Ok(())
        } else {
            Err(AuthError::BadAuth)
        }
    }

    fn verify_batch_requests(&self, pp: &PrePrepare) -> Result<(), AuthError> {
        if pp.batch.requests.len() != pp.batch.digests.len() {
            return Err(AuthError::BadAuth);
        }
        for (req, digest) in pp.batch.requests.iter().zip(&pp.batch.digests) {
            if req.digest() != *digest {
                return Err(AuthError::BadAuth);
            }
            self.verify_request(req)?;
        }
        Ok(())
    }

    fn verify_replica_auth(
        &self,
        sender: ReplicaId,
        digest: &Digest,
        auth: &Authenticator,
        require_signature: bool,
    ) -> Result<(), AuthError> {
        if !self.principals.contains(sender) {
            return Err(AuthError::UnknownSender);
        }
        match auth {
            Authenticator::Signed(sig) => {
                if self.principals.verify_signature(sender, digest, sig) {
                    Ok(())
                } else {
                    Err(AuthError::BadAuth)
                }
            }
            Authenticator::MacVector(tags) => {
                if require_signature {
                    return Err(AuthError::SignatureRequired);
                }
                let Some(me) = self.me else {
                    return Err(AuthError::BadAuth);
                };
                if self.principals.verify_mac(sender, me, digest, tags) {
                    Ok(())
                } else {
                    Err(AuthError::BadAuth)
                }
            }
        }
    }

    /// Verify a stable-checkpoint proof: `2f+1` correctly signed checkpoints
    /// from distinct senders, all for `(seqno, state_digest)`.
    pub fn verify_checkpoint_proof(
        &self,
        seqno: Seqno,
        state_digest: &Digest,
        proof: &[Checkpoint],
    ) -> bool {
        let mut senders = BTreeSet::new();
        for cp in proof {
            if cp.seqno != seqno || cp.state_digest != *state_digest {
                return false;
            }
            if self
                .verify(&ProtocolMessage::Checkpoint(cp.clone()))
                .is_err()
            {
                return false;
            }
            senders.insert(cp.sender);
        }
        senders.len() >= self.principals.quorum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{KeyPair, SigMode, Signature};
    use crate::messages::{Batch, Prepare};
    use crate::principal::Principal;
    use crate::{ClientId, Request};

    fn setup(f: usize) -> (PrincipalSet, Vec<KeyPair>, ClientDirectory, KeyPair) {
        let n = 3 * f + 1;
        let keys: Vec<KeyPair> = (0..n)
            .map(|i| KeyPair::from_seed(&[i as u8 + 1; 32]))
            .collect();
        let principals = keys
            .iter()
            .enumerate()
            .map(|(i, k)| Principal {
                id: ReplicaId(i as u32),
                verifying_key: k.public_bytes(),
                mac_seed: *k.mac_seed(),
            })
            .collect();
        let set = PrincipalSet::new(principals, f).unwrap();

        let client_key = KeyPair::from_seed(&[0xC1; 32]);
        let mut clients = ClientDirectory::new();
        clients.insert(ClientId(7), client_key.public_bytes());

        (set, keys, clients, client_key)
    }

    fn signed_request(client_key: &KeyPair, payload: &[u8]) -> Request {
        let digest = Request::signing_digest(ClientId(7), 1, payload, false);
        Request {
            client: ClientId(7),
            request_id: 1,
            payload: payload.to_vec(),
            read_only: false,
            signature: client_key.sign(&digest),
        }
    }

    #[test]
    fn decode_encode_round_trip() {
        let (set, keys, clients, _) = setup(1);
        let verifier = Verifier::for_replica(set.clone(), clients, ReplicaId(1));
        let mut prepare = Prepare {
            view: 0,
            seqno: 1,
            batch_digest: Digest::of(b"b"),
            sender: ReplicaId(0),
            auth: Authenticator::Signed(Signature::zero()),
        };
        prepare.auth = Authenticator::for_mode(
            SigMode::MacVector,
            &keys[0],
            set.n(),
            &prepare.signing_digest(),
        );
        let msg = ProtocolMessage::Prepare(prepare);
        let bytes = encode(&msg).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(msg, decoded);
        assert!(verifier.verify(&decoded).is_ok());
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(decode(b"\xff\xff\xff"), Err(DecodeError::Malformed)));
    }

    #[test]
    fn mac_vector_rejected_where_signature_required() {
        let (set, keys, clients, _) = setup(1);
        let verifier = Verifier::for_replica(set.clone(), clients, ReplicaId(1));
        let mut cp = Checkpoint {
            seqno: 10,
            state_digest: Digest::of(b"state"),
            sender: ReplicaId(0),
            auth: Authenticator::Signed(Signature::zero()),
        };
        cp.auth = Authenticator::mac_vector(&keys[0], set.n(), &cp.signing_digest());
        assert_eq!(
            verifier.verify(&ProtocolMessage::Checkpoint(cp.clone())),
            Err(AuthError::SignatureRequired)
        );
        cp.auth = Authenticator::signed(&keys[0], &cp.signing_digest());
        assert!(verifier.verify(&ProtocolMessage::Checkpoint(cp)).is_ok());
    }

    #[test]
    fn unknown_sender_is_rejected() {
        let (set, keys, clients, _) = setup(1);
        let verifier = Verifier::for_replica(set.clone(), clients, ReplicaId(1));
        let mut prepare = Prepare {
            view: 0,
            seqno: 1,
            batch_digest: Digest::of(b"b"),
            sender: ReplicaId(9),
            auth: Authenticator::Signed(Signature::zero()),
        };
        prepare.auth = Authenticator::signed(&keys[0], &prepare.signing_digest());
        assert_eq!(
            verifier.verify(&ProtocolMessage::Prepare(prepare)),
            Err(AuthError::UnknownSender)
        );
    }

    #[test]
    fn weaker_skips_embedded_request_signatures() {
        let (set, keys, clients, client_key) = setup(1);
        let verifier = Verifier::for_replica(set.clone(), clients, ReplicaId(1));

        let mut req = signed_request(&client_key, b"A");
        let good_digest = req.digest();
        // Corrupt the client signature but keep the request digest intact.
        req.signature = Signature([3u8; 64]);

        let batch = Batch {
            digests: vec![good_digest],
            requests: vec![req],
            non_det: vec![],
        };
        let mut pp = PrePrepare {
            view: 0,
            seqno: 1,
            batch,
            sender: ReplicaId(0),
            auth: Authenticator::Signed(Signature::zero()),
        };
        pp.auth = Authenticator::mac_vector(&keys[0], set.n(), &pp.signing_digest());
        let msg = ProtocolMessage::PrePrepare(pp);

        assert_eq!(verifier.verify(&msg), Err(AuthError::BadAuth));
        assert!(verifier.verify_weaker(&msg).is_ok());
    }

    #[test]
    fn checkpoint_proof_requires_quorum_of_distinct_senders() {
        let (set, keys, clients, _) = setup(1);
        let verifier = Verifier::for_replica(set.clone(), clients, ReplicaId(3));
        let digest = Digest::of(b"state@10");
        let cp = |i: usize| {
            let mut cp = Checkpoint {
                seqno: 10,
                state_digest: digest,
                sender: ReplicaId(i as u32),
                auth: Authenticator::Signed(Signature::zero()),
            };
            cp.auth = Authenticator::signed(&keys[i], &cp.signing_digest());
            cp
        };
        // Two distinct senders plus a duplicate: not a quorum.
        assert!(!verifier.verify_checkpoint_proof(10, &digest, &[cp(0), cp(1), cp(1)]));
        assert!(verifier.verify_checkpoint_proof(10, &digest, &[cp(0), cp(1), cp(2)]));
    }
}
