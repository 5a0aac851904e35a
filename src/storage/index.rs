//! In-memory indices over the segments.
//!
//! Rebuilt from the segments on open; never persisted.

use crate::cursor::VectorClock;
use crate::types::{Envelope, NodeId, SequenceId, Topic};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;

/// Where an envelope lives on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub partition_start: SequenceId,
    pub offset: u64,
}

/// (originator, sequence) and topic lookups.
#[derive(Default)]
pub struct EnvelopeIndex {
    by_originator: RwLock<HashMap<NodeId, BTreeMap<SequenceId, IndexEntry>>>,
    by_topic: RwLock<HashMap<Topic, BTreeMap<NodeId, BTreeSet<SequenceId>>>>,
}

impl EnvelopeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, envelope: &Envelope, entry: IndexEntry) {
        self.by_originator
            .write()
            .entry(envelope.originator_id)
            .or_default()
            .insert(envelope.sequence_id, entry);
        self.by_topic
            .write()
            .entry(envelope.topic.clone())
            .or_default()
            .entry(envelope.originator_id)
            .or_default()
            .insert(envelope.sequence_id);
    }

    pub fn contains(&self, originator: NodeId, sequence: SequenceId) -> bool {
        self.get(originator, sequence).is_some()
    }

    pub fn get(&self, originator: NodeId, sequence: SequenceId) -> Option<IndexEntry> {
        self.by_originator
            .read()
            .get(&originator)
            .and_then(|seqs| seqs.get(&sequence).copied())
    }

    /// Highest stored sequence per originator.
    pub fn vector_clock(&self) -> VectorClock {
        self.by_originator
            .read()
            .iter()
            .filter_map(|(&o, seqs)| seqs.keys().next_back().map(|&s| (o, s)))
            .collect()
    }

    /// Up to `limit` entries of `originator` strictly after `after`, ascending.
    pub fn originator_after(
        &self,
        originator: NodeId,
        after: SequenceId,
        limit: usize,
    ) -> Vec<(SequenceId, IndexEntry)> {
        let by_originator = self.by_originator.read();
        let Some(seqs) = by_originator.get(&originator) else {
            return Vec::new();
        };
        seqs.range((Bound::Excluded(after), Bound::Unbounded))
            .take(limit)
            .map(|(&s, &e)| (s, e))
            .collect()
    }

    /// Up to `limit` keys past `cursor` across all originators, ordered by
    /// (originator, sequence). Originators missing from the cursor start at 0.
    pub fn unfiltered_after(&self, cursor: &VectorClock, limit: usize) -> Vec<(NodeId, SequenceId)> {
        self.filtered_after(cursor, limit, |_| true)
    }

    /// Like [`EnvelopeIndex::unfiltered_after`] restricted to `originators`.
    pub fn originators_after(
        &self,
        originators: &[NodeId],
        cursor: &VectorClock,
        limit: usize,
    ) -> Vec<(NodeId, SequenceId)> {
        self.filtered_after(cursor, limit, |o| originators.contains(&o))
    }

    fn filtered_after(
        &self,
        cursor: &VectorClock,
        limit: usize,
        include: impl Fn(NodeId) -> bool,
    ) -> Vec<(NodeId, SequenceId)> {
        let by_originator = self.by_originator.read();
        let mut originators: Vec<_> = by_originator.keys().copied().filter(|&o| include(o)).collect();
        originators.sort_unstable();

        let mut keys = Vec::new();
        for originator in originators {
            if keys.len() >= limit {
                break;
            }
            let seqs = &by_originator[&originator];
            let after = cursor.get(originator);
            keys.extend(
                seqs.range((Bound::Excluded(after), Bound::Unbounded))
                    .take(limit - keys.len())
                    .map(|(&s, _)| (originator, s)),
            );
        }
        keys
    }

    /// Up to `limit` keys on `topic` past `cursor`, ordered by (originator, sequence).
    pub fn topic_after(
        &self,
        topic: &Topic,
        cursor: &VectorClock,
        limit: usize,
    ) -> Vec<(NodeId, SequenceId)> {
        let by_topic = self.by_topic.read();
        let Some(originators) = by_topic.get(topic) else {
            return Vec::new();
        };

        let mut keys = Vec::new();
        for (&originator, seqs) in originators {
            if keys.len() >= limit {
                break;
            }
            let after = cursor.get(originator);
            keys.extend(
                seqs.range((Bound::Excluded(after), Bound::Unbounded))
                    .take(limit - keys.len())
                    .map(|&s| (originator, s)),
            );
        }
        keys
    }

    /// Total number of indexed envelopes.
    pub fn len(&self) -> usize {
        self.by_originator.read().values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn topic_count(&self) -> usize {
        self.by_topic.read().len()
    }
}
