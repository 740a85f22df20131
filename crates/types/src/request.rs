//! Client requests and replies.

use crate::crypto::Signature;
use crate::digest::Digest;
use crate::{ClientId, ReplicaId, RequestId, View};
use serde::{Deserialize, Serialize};

const DOMAIN_REQUEST: &[u8] = b"request:";

/// A signed client request. Identity is `(client, request_id)`; read-only
/// requests bypass ordering and execute speculatively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub client: ClientId,
    pub request_id: RequestId,
    pub payload: Vec<u8>,
    pub read_only: bool,
    pub signature: Signature,
}

impl Request {
    /// Digest over the request identity and contents, excluding the
    /// signature. This is what appears in batches and what the client signs.
    pub fn digest(&self) -> Digest {
        Self::signing_digest(self.client, self.request_id, &self.payload, self.read_only)
    }

    pub fn signing_digest(
        client: ClientId,
        request_id: RequestId,
        payload: &[u8],
        read_only: bool,
    ) -> Digest {
        Digest::of_parts(&[
            DOMAIN_REQUEST,
            &client.0.to_le_bytes(),
            &request_id.to_le_bytes(),
            payload,
            &[read_only as u8],
        ])
    }
}

/// A replica's reply to one request. Always signed so clients can count
/// matching replies from distinct replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub view: View,
    pub client: ClientId,
    pub request_id: RequestId,
    pub replica: ReplicaId,
    /// Result bytes produced by the application kernel.
    pub result: Vec<u8>,
    /// Kernel state digest at reply time; lets read-only replies attest the
    /// state they were evaluated against.
    pub state_digest: Digest,
    pub signature: Signature,
}

impl Reply {
    pub fn signing_digest(&self) -> Digest {
        Self::digest_fields(
            self.view,
            self.client,
            self.request_id,
            self.replica,
            &self.result,
            &self.state_digest,
        )
    }

    pub fn digest_fields(
        view: View,
        client: ClientId,
        request_id: RequestId,
        replica: ReplicaId,
        result: &[u8],
        state_digest: &Digest,
    ) -> Digest {
        Digest::of_parts(&[
            crate::messages::DOMAIN_REPLY,
            &view.to_le_bytes(),
            &client.0.to_le_bytes(),
            &request_id.to_le_bytes(),
            &replica.0.to_le_bytes(),
            result,
            state_digest.as_bytes(),
        ])
    }

    /// Two replies match when they agree on the request and the result,
    /// regardless of which replica sent them.
    pub fn matches(&self, other: &Reply) -> bool {
        self.client == other.client
            && self.request_id == other.request_id
            && self.result == other.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_digest_covers_identity_and_payload() {
        let base = Request {
            client: ClientId(7),
            request_id: 1,
            payload: b"A".to_vec(),
            read_only: false,
            signature: Signature::zero(),
        };
        let mut other = base.clone();
        other.request_id = 2;
        assert_ne!(base.digest(), other.digest());

        let mut ro = base.clone();
        ro.read_only = true;
        assert_ne!(base.digest(), ro.digest());

        // The signature is not part of the digest.
        let mut signed = base.clone();
        signed.signature = Signature([1u8; 64]);
        assert_eq!(base.digest(), signed.digest());
    }

    #[test]
    fn replies_match_on_result_not_replica() {
        let reply = |replica: u32, result: &[u8]| Reply {
            view: 0,
            client: ClientId(7),
            request_id: 3,
            replica: ReplicaId(replica),
            result: result.to_vec(),
            state_digest: Digest::ZERO,
            signature: Signature::zero(),
        };
        assert!(reply(0, b"OK").matches(&reply(1, b"OK")));
        assert!(!reply(0, b"OK").matches(&reply(1, b"NO")));
    }
}
