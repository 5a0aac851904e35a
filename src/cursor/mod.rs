//! Cursor model: where a reader is in the log.
//!
//! - [`VectorClock`]: one position per originator.
//! - [`TopicCursors`]: one vector clock per topic.
//! - [`EnvelopesQuery`]: filter plus resume point for pull queries and
//!   envelope subscriptions.

mod topic;
mod vector_clock;

pub use topic::TopicCursors;
pub use vector_clock::VectorClock;

use crate::types::{NodeId, Topic};

/// Filter for envelope queries. Topics and originators are mutually
/// exclusive; with neither, the query is global.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnvelopesQuery {
    pub topics: Vec<Topic>,
    pub originators: Vec<NodeId>,
    /// Resume point. `None` means "from the beginning" for pull queries and
    /// "live only" for subscriptions.
    pub last_seen: Option<VectorClock>,
}

impl EnvelopesQuery {
    pub fn global() -> Self {
        Self::default()
    }

    pub fn topics(topics: Vec<Topic>) -> Self {
        Self {
            topics,
            ..Self::default()
        }
    }

    pub fn originators(originators: Vec<NodeId>) -> Self {
        Self {
            originators,
            ..Self::default()
        }
    }

    pub fn after(mut self, last_seen: VectorClock) -> Self {
        self.last_seen = Some(last_seen);
        self
    }

    pub fn is_global(&self) -> bool {
        self.topics.is_empty() && self.originators.is_empty()
    }
}

/// Row budget for each topic when `entries` topics share one page.
pub fn rows_per_entry(entries: usize, page_limit: usize) -> usize {
    if entries == 0 {
        return page_limit.max(1);
    }
    (page_limit / entries).max(1)
}
