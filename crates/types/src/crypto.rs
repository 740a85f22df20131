//! Signing keys, signatures, and MAC-vector authenticators.
//!
//! Two authentication modes exist on the wire:
//!
//! - **MAC vectors**: one HMAC-SHA256 tag per receiving replica, computed
//!   over the message's signing digest with the pairwise key for that
//!   (sender, receiver) edge. Cheap; the hot-path default for ordering
//!   traffic.
//! - **Signatures**: ed25519 over the signing digest. Mandatory for
//!   messages that must be transferable proof (checkpoints, view changes,
//!   new-views, replies).

use crate::digest::Digest;
use crate::ReplicaId;
use ed25519_dalek::{Signer, SigningKey, Verifier as _, VerifyingKey};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Truncated HMAC output carried in MAC vectors.
pub const MAC_TAG_LEN: usize = 16;

/// A single MAC-vector entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacTag(pub [u8; MAC_TAG_LEN]);

/// Pairwise symmetric key for one directed (sender, receiver) edge.
#[derive(Clone)]
pub struct MacKey([u8; 32]);

impl MacKey {
    /// Derive the key a sender uses toward one receiver from the sender's
    /// configured MAC seed. Key distribution itself is out of scope; the
    /// principal set carries the seeds.
    pub fn derive(sender_seed: &[u8; 32], receiver: ReplicaId) -> Self {
        let mut mac = HmacSha256::new_from_slice(sender_seed).expect("hmac accepts any key length");
        mac.update(b"palisade-mac-key");
        mac.update(&receiver.0.to_le_bytes());
        let out = mac.finalize().into_bytes();
        let mut key = [0u8; 32];
        key.copy_from_slice(&out);
        MacKey(key)
    }

    /// Tag a signing digest with this key.
    pub fn tag(&self, digest: &Digest) -> MacTag {
        let mut mac = HmacSha256::new_from_slice(&self.0).expect("hmac accepts any key length");
        mac.update(digest.as_bytes());
        let out = mac.finalize().into_bytes();
        let mut tag = [0u8; MAC_TAG_LEN];
        tag.copy_from_slice(&out[..MAC_TAG_LEN]);
        MacTag(tag)
    }

    /// Constant-time-enough verification for a tag; HMAC verification on the
    /// full output would be equivalent here since tags are not secret.
    pub fn verify(&self, digest: &Digest, tag: &MacTag) -> bool {
        self.tag(digest) == *tag
    }
}

impl std::fmt::Debug for MacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MacKey(..)")
    }
}

/// An ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; 64]);

impl Signature {
    /// All-zero placeholder, replaced before a message is authenticated.
    pub fn zero() -> Self {
        Signature([0u8; 64])
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({}..)", hex::encode(&self.0[..4]))
    }
}

// [u8; 64] has no serde impls; serialize as a byte sequence.
impl Serialize for Signature {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SigVisitor;
        impl serde::de::Visitor<'_> for SigVisitor {
            type Value = Signature;
            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("64 signature bytes")
            }
            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Signature, E> {
                let bytes: [u8; 64] = v
                    .try_into()
                    .map_err(|_| E::invalid_length(v.len(), &self))?;
                Ok(Signature(bytes))
            }
        }
        deserializer.deserialize_bytes(SigVisitor)
    }
}

/// Signing identity for one principal: an ed25519 key pair plus the seed for
/// deriving outgoing MAC keys.
#[derive(Clone)]
pub struct KeyPair {
    signing: SigningKey,
    mac_seed: [u8; 32],
}

impl KeyPair {
    /// Deterministically derive a key pair from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(seed);
        // The MAC seed is independent of the signing key material.
        let mac_seed = Digest::of_parts(&[b"palisade-mac-seed", seed]).0;
        KeyPair { signing, mac_seed }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    pub fn mac_seed(&self) -> &[u8; 32] {
        &self.mac_seed
    }

    /// Sign a digest.
    pub fn sign(&self, digest: &Digest) -> Signature {
        Signature(self.signing.sign(digest.as_bytes()).to_bytes())
    }

    /// Key this principal uses to MAC messages toward `receiver`.
    pub fn mac_key_for(&self, receiver: ReplicaId) -> MacKey {
        MacKey::derive(&self.mac_seed, receiver)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyPair({}..)", hex::encode(&self.public_bytes()[..4]))
    }
}

/// Verify an ed25519 signature against raw public key bytes.
pub fn verify_signature(public: &[u8; 32], digest: &Digest, sig: &Signature) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(public) else {
        return false;
    };
    let sig = ed25519_dalek::Signature::from_bytes(&sig.0);
    key.verify(digest.as_bytes(), &sig).is_ok()
}

/// Default authenticator mode for hot-path ordering messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SigMode {
    /// One MAC per recipient (cheap; default).
    MacVector,
    /// Full signature on every message.
    Signed,
}

/// Wire authenticator attached to every protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Authenticator {
    /// One tag per replica, indexed by `ReplicaId`.
    MacVector(Vec<MacTag>),
    /// A single transferable signature.
    Signed(Signature),
}

impl Authenticator {
    /// Build a MAC vector over `digest` for all `n` replicas.
    pub fn mac_vector(key: &KeyPair, n: usize, digest: &Digest) -> Self {
        let tags = (0..n as u32)
            .map(|id| key.mac_key_for(ReplicaId(id)).tag(digest))
            .collect();
        Authenticator::MacVector(tags)
    }

    /// Build a signature authenticator over `digest`.
    pub fn signed(key: &KeyPair, digest: &Digest) -> Self {
        Authenticator::Signed(key.sign(digest))
    }

    /// Build the authenticator selected by `mode`.
    pub fn for_mode(mode: SigMode, key: &KeyPair, n: usize, digest: &Digest) -> Self {
        match mode {
            SigMode::MacVector => Self::mac_vector(key, n, digest),
            SigMode::Signed => Self::signed(key, digest),
        }
    }

    pub fn is_signed(&self) -> bool {
        matches!(self, Authenticator::Signed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair(seed: u8) -> KeyPair {
        KeyPair::from_seed(&[seed; 32])
    }

    #[test]
    fn sign_and_verify() {
        let kp = keypair(1);
        let d = Digest::of(b"message");
        let sig = kp.sign(&d);
        assert!(verify_signature(&kp.public_bytes(), &d, &sig));
        assert!(!verify_signature(&kp.public_bytes(), &Digest::of(b"other"), &sig));
        assert!(!verify_signature(&keypair(2).public_bytes(), &d, &sig));
    }

    #[test]
    fn mac_vector_entry_verifies_only_for_receiver() {
        let kp = keypair(3);
        let d = Digest::of(b"payload");
        let auth = Authenticator::mac_vector(&kp, 4, &d);
        let Authenticator::MacVector(tags) = &auth else {
            panic!("expected mac vector");
        };
        assert_eq!(tags.len(), 4);

        // Receiver 2 recomputes its entry from the sender's seed.
        let key = MacKey::derive(kp.mac_seed(), ReplicaId(2));
        assert!(key.verify(&d, &tags[2]));
        assert!(!key.verify(&d, &tags[1]));
        assert!(!key.verify(&Digest::of(b"tampered"), &tags[2]));
    }

    #[test]
    fn signature_serde_round_trip() {
        let kp = keypair(4);
        let sig = kp.sign(&Digest::of(b"m"));
        let bytes = bincode::serialize(&sig).unwrap();
        let back: Signature = bincode::deserialize(&bytes).unwrap();
        assert_eq!(sig, back);
    }
}
