//! Independent progress per topic.

use super::VectorClock;
use crate::types::{Envelope, NodeId, Topic};
use std::collections::HashMap;
use std::sync::Arc;

/// One [`VectorClock`] per subscribed topic.
///
/// A topic that is far behind on some originator never holds back another
/// topic from the same originator.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TopicCursors(HashMap<Topic, VectorClock>);

impl TopicCursors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `topic`. An existing cursor for the topic is kept.
    ///
    /// Returns `false` if the topic was already tracked.
    pub fn track(&mut self, topic: Topic, cursor: VectorClock) -> bool {
        if self.0.contains_key(&topic) {
            return false;
        }
        self.0.insert(topic, cursor);
        true
    }

    pub fn get(&self, topic: &Topic) -> Option<&VectorClock> {
        self.0.get(topic)
    }

    pub fn contains(&self, topic: &Topic) -> bool {
        self.0.contains_key(topic)
    }

    pub fn topics(&self) -> impl Iterator<Item = &Topic> + '_ {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Topic, &VectorClock)> + '_ {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Fill every listed topic's clock with zeros for unknown originators.
    pub fn fill_missing(&mut self, topics: &[Topic], originators: &[NodeId]) {
        for topic in topics {
            if let Some(vc) = self.0.get_mut(topic) {
                vc.fill_missing(originators.iter().copied());
            }
        }
    }

    /// Copy of the cursors for `topics` only.
    pub fn subset(&self, topics: &[Topic]) -> TopicCursors {
        TopicCursors(
            topics
                .iter()
                .filter_map(|t| self.0.get(t).map(|vc| (t.clone(), vc.clone())))
                .collect(),
        )
    }

    /// Keep the envelopes not yet seen on their topic and move the cursors past them.
    ///
    /// Envelopes on untracked topics are dropped.
    pub fn advance(&mut self, envelopes: &[Arc<Envelope>]) -> Vec<Arc<Envelope>> {
        let mut fresh = Vec::with_capacity(envelopes.len());
        for env in envelopes {
            let Some(vc) = self.0.get_mut(&env.topic) else {
                continue;
            };
            if vc.covers(env.originator_id, env.sequence_id) {
                continue;
            }
            vc.advance(env.originator_id, env.sequence_id);
            fresh.push(Arc::clone(env));
        }
        fresh
    }
}

impl FromIterator<(Topic, VectorClock)> for TopicCursors {
    fn from_iter<I: IntoIterator<Item = (Topic, VectorClock)>>(iter: I) -> Self {
        TopicCursors(iter.into_iter().collect())
    }
}
