//! Generic vote certificate.
//!
//! Collects authenticated votes for a single logical question until some
//! value reaches the configured threshold of distinct senders. Once a value
//! completes, the certificate is frozen; late votes are rejected so the
//! completion transition fires at most once.

use palisade_types::ReplicaId;
use std::collections::BTreeMap;
use thiserror::Error;

/// A vote that can be aggregated: a sender plus the value it vouches for.
pub trait Vote: Clone {
    type Value: Clone + Eq + Ord + std::fmt::Debug;

    fn sender(&self) -> ReplicaId;
    fn value(&self) -> Self::Value;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CertificateError {
    /// Same sender, same value: harmless retransmission.
    #[error("duplicate vote from {0}")]
    Duplicate(ReplicaId),
    /// Same sender, different value: equivocation. The caller records it.
    #[error("conflicting vote from {0}")]
    Conflicting(ReplicaId),
    /// The certificate already completed and is immutable.
    #[error("certificate is complete")]
    Complete,
}

/// Aggregates votes until `threshold` distinct senders agree on one value.
#[derive(Debug, Clone)]
pub struct Certificate<V: Vote> {
    threshold: usize,
    votes: BTreeMap<ReplicaId, V>,
    counts: BTreeMap<V::Value, usize>,
    /// The local replica's own vote, tagged for reuse by higher layers.
    mine: Option<ReplicaId>,
    completed: Option<V::Value>,
}

impl<V: Vote> Certificate<V> {
    pub fn new(threshold: usize) -> Self {
        Certificate {
            threshold,
            votes: BTreeMap::new(),
            counts: BTreeMap::new(),
            mine: None,
            completed: None,
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Add an already-authenticated vote. Returns `true` when this vote
    /// completed the certificate.
    pub fn add(&mut self, vote: V, mine: bool) -> Result<bool, CertificateError> {
        if self.completed.is_some() {
            return Err(CertificateError::Complete);
        }
        let sender = vote.sender();
        if let Some(existing) = self.votes.get(&sender) {
            return if existing.value() == vote.value() {
                Err(CertificateError::Duplicate(sender))
            } else {
                Err(CertificateError::Conflicting(sender))
            };
        }

        let value = vote.value();
        self.votes.insert(sender, vote);
        if mine {
            self.mine = Some(sender);
        }
        let count = self.counts.entry(value.clone()).or_insert(0);
        *count += 1;
        if *count >= self.threshold {
            self.completed = Some(value);
            return Ok(true);
        }
        Ok(false)
    }

    pub fn is_complete(&self) -> bool {
        self.completed.is_some()
    }

    /// The value that reached the threshold, once complete.
    pub fn value(&self) -> Option<&V::Value> {
        self.completed.as_ref()
    }

    pub fn count_for(&self, value: &V::Value) -> usize {
        self.counts.get(value).copied().unwrap_or(0)
    }

    pub fn has_voted(&self, sender: ReplicaId) -> bool {
        self.votes.contains_key(&sender)
    }

    pub fn vote_of(&self, sender: ReplicaId) -> Option<&V> {
        self.votes.get(&sender)
    }

    /// The local replica's own vote, if tagged.
    pub fn mine(&self) -> Option<&V> {
        self.mine.and_then(|id| self.votes.get(&id))
    }

    pub fn senders_for(&self, value: &V::Value) -> Vec<ReplicaId> {
        self.votes
            .iter()
            .filter(|(_, v)| v.value() == *value)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn votes_for(&self, value: &V::Value) -> Vec<&V> {
        self.votes.values().filter(|v| v.value() == *value).collect()
    }

    /// Iterate distinct values with their vote counts.
    pub fn values(&self) -> impl Iterator<Item = (&V::Value, usize)> {
        self.counts.iter().map(|(v, c)| (v, *c))
    }

    pub fn len(&self) -> usize {
        self.votes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }

    /// Drop all votes, keeping the threshold.
    pub fn reset(&mut self) {
        self.votes.clear();
        self.counts.clear();
        self.mine = None;
        self.completed = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestVote {
        sender: ReplicaId,
        value: u64,
    }

    impl Vote for TestVote {
        type Value = u64;
        fn sender(&self) -> ReplicaId {
            self.sender
        }
        fn value(&self) -> u64 {
            self.value
        }
    }

    fn vote(sender: u32, value: u64) -> TestVote {
        TestVote {
            sender: ReplicaId(sender),
            value,
        }
    }

    #[test]
    fn completes_exactly_at_threshold() {
        let mut cert = Certificate::new(3);
        assert!(!cert.add(vote(0, 7), false).unwrap());
        assert!(!cert.add(vote(1, 7), false).unwrap());
        assert!(!cert.is_complete());
        // The third matching vote completes, exactly once.
        assert!(cert.add(vote(2, 7), false).unwrap());
        assert!(cert.is_complete());
        assert_eq!(cert.value(), Some(&7));
        // Frozen afterwards.
        assert_eq!(cert.add(vote(3, 7), false), Err(CertificateError::Complete));
    }

    #[test]
    fn one_vote_per_sender() {
        let mut cert = Certificate::new(3);
        cert.add(vote(0, 7), false).unwrap();
        assert_eq!(
            cert.add(vote(0, 7), false),
            Err(CertificateError::Duplicate(ReplicaId(0)))
        );
        assert_eq!(
            cert.add(vote(0, 8), false),
            Err(CertificateError::Conflicting(ReplicaId(0)))
        );
        assert_eq!(cert.len(), 1);
    }

    #[test]
    fn split_votes_count_per_value() {
        let mut cert = Certificate::new(3);
        cert.add(vote(0, 1), false).unwrap();
        cert.add(vote(1, 2), false).unwrap();
        cert.add(vote(2, 1), false).unwrap();
        assert!(!cert.is_complete());
        assert_eq!(cert.count_for(&1), 2);
        assert_eq!(cert.count_for(&2), 1);
        assert!(cert.add(vote(3, 1), false).unwrap());
        assert_eq!(cert.senders_for(&1), vec![ReplicaId(0), ReplicaId(2), ReplicaId(3)]);
    }

    #[test]
    fn mine_is_tagged_and_survives_lookup() {
        let mut cert = Certificate::new(3);
        cert.add(vote(1, 5), false).unwrap();
        cert.add(vote(2, 5), true).unwrap();
        assert_eq!(cert.mine(), Some(&vote(2, 5)));
        cert.reset();
        assert!(cert.mine().is_none());
        assert_eq!(cert.threshold(), 3);
    }
}
