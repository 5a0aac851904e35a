//! Per-originator progress markers.

use crate::types::{NodeId, SequenceId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Highest sequence ID consumed per originator.
///
/// A missing originator is the same as an explicit `0`, and equality and
/// ordering follow that rule: `{}` equals `{100: 0}`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VectorClock(BTreeMap<NodeId, SequenceId>);

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last consumed sequence for `originator`, `0` if never seen.
    pub fn get(&self, originator: NodeId) -> SequenceId {
        self.0.get(&originator).copied().unwrap_or(0)
    }

    pub fn contains(&self, originator: NodeId) -> bool {
        self.0.contains_key(&originator)
    }

    /// Record `sequence` for `originator` if it moves the clock forward.
    ///
    /// Returns whether the clock changed. Lower values are ignored.
    pub fn advance(&mut self, originator: NodeId, sequence: SequenceId) -> bool {
        let slot = self.0.entry(originator).or_insert(0);
        if sequence > *slot {
            *slot = sequence;
            true
        } else {
            false
        }
    }

    /// Whether an envelope at `sequence` has already been consumed.
    pub fn covers(&self, originator: NodeId, sequence: SequenceId) -> bool {
        sequence <= self.get(originator)
    }

    /// Insert an explicit `0` for every originator the clock doesn't know.
    pub fn fill_missing(&mut self, originators: impl IntoIterator<Item = NodeId>) {
        for originator in originators {
            self.0.entry(originator).or_insert(0);
        }
    }

    /// Pointwise maximum.
    pub fn merge(&mut self, other: &VectorClock) {
        for (&originator, &sequence) in &other.0 {
            self.advance(originator, sequence);
        }
    }

    /// Whether every entry of `self` is at least the matching entry of `other`.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        other.0.iter().all(|(&o, &s)| self.get(o) >= s)
    }

    pub fn originators(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.0.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, SequenceId)> + '_ {
        self.0.iter().map(|(&o, &s)| (o, s))
    }

    /// Number of explicit entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> BTreeMap<NodeId, SequenceId> {
        self.0
    }
}

impl From<BTreeMap<NodeId, SequenceId>> for VectorClock {
    fn from(map: BTreeMap<NodeId, SequenceId>) -> Self {
        VectorClock(map)
    }
}

impl FromIterator<(NodeId, SequenceId)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (NodeId, SequenceId)>>(iter: I) -> Self {
        VectorClock(iter.into_iter().collect())
    }
}

impl PartialEq for VectorClock {
    fn eq(&self, other: &Self) -> bool {
        self.dominates(other) && other.dominates(self)
    }
}

impl Eq for VectorClock {}

impl PartialOrd for VectorClock {
    /// Causal order; concurrent clocks are incomparable.
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self.dominates(other), other.dominates(self)) {
            (true, true) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Greater),
            (false, true) => Some(Ordering::Less),
            (false, false) => None,
        }
    }
}
