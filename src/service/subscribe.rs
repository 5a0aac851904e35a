//! Streaming subscriptions: catch up from the store, then follow live
//! deliveries, without gaps or duplicates at the boundary.

use super::backoff::Backoff;
use super::message::MessageService;
use crate::context::Context;
use crate::cursor::{rows_per_entry, EnvelopesQuery, TopicCursors, VectorClock};
use crate::error::{Error, Result};
use crate::subscriptions::{Delivery, ListenerFilter};
use crate::types::{Envelope, Topic};
use crossbeam_channel::{after, select, Receiver, Sender};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, trace};

/// One topic of a [`SubscribeTopicsRequest`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicFilter {
    pub topic: Topic,
    /// Resume point; `None` subscribes to live envelopes only.
    pub last_seen: Option<VectorClock>,
}

impl TopicFilter {
    pub fn live(topic: Topic) -> Self {
        Self {
            topic,
            last_seen: None,
        }
    }

    pub fn from_cursor(topic: Topic, last_seen: VectorClock) -> Self {
        Self {
            topic,
            last_seen: Some(last_seen),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubscribeTopicsRequest {
    pub filters: Vec<TopicFilter>,
}

impl SubscribeTopicsRequest {
    pub fn new(filters: Vec<TopicFilter>) -> Self {
        Self { filters }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamStatus {
    Started,
    Catchup,
    CatchupComplete,
    /// Keepalive while nothing new has arrived.
    Waiting,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubscribeResponse {
    Status(StreamStatus),
    Envelopes(Vec<Arc<Envelope>>),
}

impl SubscribeResponse {
    pub fn status(&self) -> Option<StreamStatus> {
        match self {
            SubscribeResponse::Status(status) => Some(*status),
            SubscribeResponse::Envelopes(_) => None,
        }
    }

    pub fn envelopes(&self) -> &[Arc<Envelope>] {
        match self {
            SubscribeResponse::Envelopes(envelopes) => envelopes,
            SubscribeResponse::Status(_) => &[],
        }
    }
}

/// Where a stream writes its responses. An error ends the stream.
pub trait ResponseSink {
    fn send(&self, response: SubscribeResponse) -> Result<()>;
}

impl ResponseSink for Sender<SubscribeResponse> {
    fn send(&self, response: SubscribeResponse) -> Result<()> {
        Sender::send(self, response).map_err(|_| Error::StreamClosed)
    }
}

enum Live {
    Done,
    Closed,
    Keepalive,
    Batch(Delivery),
}

impl MessageService {
    /// Stream envelopes of the requested topics.
    ///
    /// Invalid requests fail before anything is sent. Returns `Ok` when the
    /// stream ends cleanly: `ctx` cancelled, node shut down, or the listener
    /// evicted as a slow consumer.
    pub fn subscribe_topics(
        &self,
        ctx: &Context,
        request: &SubscribeTopicsRequest,
        sink: &dyn ResponseSink,
    ) -> Result<()> {
        self.validate_topic_filters(request)?;
        sink.send(SubscribeResponse::Status(StreamStatus::Started))?;

        let mut cursors = TopicCursors::new();
        let mut catch_up = Vec::new();
        for filter in &request.filters {
            let cursor = filter.last_seen.clone().unwrap_or_default();
            if cursors.track(filter.topic.clone(), cursor) && filter.last_seen.is_some() {
                catch_up.push(filter.topic.clone());
            }
        }
        info!(
            topics = cursors.len(),
            catch_up = catch_up.len(),
            "topic subscription started"
        );

        // Register before catching up so nothing committed meanwhile is missed.
        let live = self.subscriber.listen(
            ctx,
            ListenerFilter::topics(cursors.topics().cloned()),
            self.subscribe.listener_buffer,
        );

        match self.catch_up_topics(ctx, sink, &mut cursors, &catch_up) {
            Err(Error::Cancelled) => return Ok(()),
            result => result?,
        }
        sink.send(SubscribeResponse::Status(StreamStatus::CatchupComplete))?;

        self.follow(ctx, sink, &live, |batch| cursors.advance(batch))
    }

    /// Stream envelopes matching `query`, resuming after `query.last_seen`.
    pub fn subscribe_envelopes(
        &self,
        ctx: &Context,
        query: &EnvelopesQuery,
        sink: &dyn ResponseSink,
    ) -> Result<()> {
        self.validate_query(query)?;
        sink.send(SubscribeResponse::Status(StreamStatus::Started))?;

        let live = self.subscriber.listen(
            ctx,
            ListenerFilter::from_query(query),
            self.subscribe.listener_buffer,
        );

        let mut cursor = query.last_seen.clone().unwrap_or_default();
        if query.last_seen.is_some() {
            match self.catch_up_envelopes(ctx, sink, query, &mut cursor) {
                Err(Error::Cancelled) => return Ok(()),
                result => result?,
            }
        }
        sink.send(SubscribeResponse::Status(StreamStatus::CatchupComplete))?;

        self.follow(ctx, sink, &live, |batch| advance_clock(&mut cursor, batch))
    }

    fn validate_topic_filters(&self, request: &SubscribeTopicsRequest) -> Result<()> {
        let limits = &self.subscribe;
        if request.filters.is_empty() {
            return Err(Error::InvalidArgument("missing topic filters".into()));
        }
        if request.filters.len() > limits.max_topic_filters {
            return Err(Error::InvalidArgument(format!(
                "too many topic filters: {} (max {})",
                request.filters.len(),
                limits.max_topic_filters
            )));
        }

        let known: HashSet<_> = self.registry.originator_ids()?.into_iter().collect();
        for filter in &request.filters {
            self.validate_topic(&filter.topic)?;
            let Some(cursor) = &filter.last_seen else {
                continue;
            };
            if cursor.len() > limits.max_vector_clock_length {
                return Err(Error::InvalidArgument(format!(
                    "vector clock length exceeds maximum of {}",
                    limits.max_vector_clock_length
                )));
            }
            if let Some(unknown) = cursor.originators().find(|id| !known.contains(id)) {
                return Err(Error::InvalidArgument(format!(
                    "unknown originator node ID in cursor: {}",
                    unknown
                )));
            }
        }
        Ok(())
    }

    fn catch_up_topics(
        &self,
        ctx: &Context,
        sink: &dyn ResponseSink,
        cursors: &mut TopicCursors,
        topics: &[Topic],
    ) -> Result<()> {
        if topics.is_empty() {
            trace!("no topic cursors, skipping catch-up");
            return Ok(());
        }
        sink.send(SubscribeResponse::Status(StreamStatus::Catchup))?;

        let originators = self.registry.originator_ids()?;
        cursors.fill_missing(topics, &originators);

        let backoff = Backoff::from(&self.subscribe.backoff);
        let page_limit = self.subscribe.topic_page_limit;
        let mut sent = 0;
        for chunk in topics.chunks(self.subscribe.max_topics_per_chunk.max(1)) {
            let per_topic = rows_per_entry(chunk.len(), page_limit);
            loop {
                if ctx.is_done() {
                    return Err(Error::Cancelled);
                }
                let page_cursors = cursors.subset(chunk);
                let rows = backoff.retry(ctx, || {
                    self.store
                        .select_by_topic_cursors(&page_cursors, per_topic, page_limit)
                })?;

                let fresh = cursors.advance(&rows);
                if !fresh.is_empty() {
                    sent += fresh.len();
                    sink.send(SubscribeResponse::Envelopes(fresh))?;
                }
                if rows.len() < per_topic {
                    break;
                }
            }
        }
        debug!(topics = topics.len(), envelopes = sent, "topic catch-up complete");
        Ok(())
    }

    fn catch_up_envelopes(
        &self,
        ctx: &Context,
        sink: &dyn ResponseSink,
        query: &EnvelopesQuery,
        cursor: &mut VectorClock,
    ) -> Result<()> {
        sink.send(SubscribeResponse::Status(StreamStatus::Catchup))?;

        let backoff = Backoff::from(&self.subscribe.backoff);
        let limit = self.subscribe.max_requested_rows;
        let mut page = query.clone();
        loop {
            if ctx.is_done() {
                return Err(Error::Cancelled);
            }
            page.last_seen = Some(cursor.clone());
            let rows = backoff.retry(ctx, || self.store.select_envelopes(&page, limit))?;

            let fresh = advance_clock(cursor, &rows);
            if !fresh.is_empty() {
                sink.send(SubscribeResponse::Envelopes(fresh))?;
            }
            if rows.len() < limit {
                return Ok(());
            }
        }
    }

    /// Live phase. `filter` drops what the cursors already cover and
    /// advances them past the rest.
    fn follow(
        &self,
        ctx: &Context,
        sink: &dyn ResponseSink,
        live: &Receiver<Delivery>,
        mut filter: impl FnMut(&[Arc<Envelope>]) -> Vec<Arc<Envelope>>,
    ) -> Result<()> {
        let keepalive = self.subscribe.keepalive_interval();
        loop {
            let event = select! {
                recv(ctx.done()) -> _ => Live::Done,
                recv(self.ctx.done()) -> _ => Live::Done,
                recv(live) -> batch => batch.map_or(Live::Closed, Live::Batch),
                recv(after(keepalive)) -> _ => Live::Keepalive,
            };
            match event {
                Live::Done => {
                    debug!("subscription context done, ending stream");
                    return Ok(());
                }
                Live::Closed => {
                    debug!("listener closed by dispatcher, ending stream");
                    return Ok(());
                }
                Live::Keepalive => sink.send(SubscribeResponse::Status(StreamStatus::Waiting))?,
                Live::Batch(batch) => {
                    let fresh = filter(&batch);
                    if !fresh.is_empty() {
                        sink.send(SubscribeResponse::Envelopes(fresh))?;
                    }
                }
            }
        }
    }
}

/// Keep the envelopes `cursor` doesn't cover yet and advance past them.
fn advance_clock(cursor: &mut VectorClock, envelopes: &[Arc<Envelope>]) -> Vec<Arc<Envelope>> {
    envelopes
        .iter()
        .filter(|env| cursor.advance(env.originator_id, env.sequence_id))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Timestamp, TopicKind};

    fn env(originator: u32, sequence: u64) -> Arc<Envelope> {
        Arc::new(Envelope {
            originator_id: originator,
            sequence_id: sequence,
            topic: Topic::new(TopicKind::GroupMessages, b"t"),
            payload: vec![],
            insert_time: Timestamp(0),
            expiry: None,
            payer_id: None,
        })
    }

    #[test]
    fn test_advance_clock_drops_covered() {
        let mut cursor: VectorClock = [(100, 2)].into_iter().collect();
        let fresh = advance_clock(&mut cursor, &[env(100, 1), env(100, 3), env(200, 1), env(100, 3)]);
        let keys: Vec<_> = fresh.iter().map(|e| (e.originator_id, e.sequence_id)).collect();
        assert_eq!(keys, vec![(100, 3), (200, 1)]);
        assert_eq!(cursor.get(100), 3);
        assert_eq!(cursor.get(200), 1);
    }

    #[test]
    fn test_sender_sink_reports_closed() {
        let (tx, rx) = crossbeam_channel::unbounded();
        tx.send(SubscribeResponse::Status(StreamStatus::Started)).unwrap();
        drop(rx);
        let sink: &dyn ResponseSink = &tx;
        assert!(matches!(
            sink.send(SubscribeResponse::Status(StreamStatus::Waiting)),
            Err(Error::StreamClosed)
        ));
    }

    #[test]
    fn test_response_accessors() {
        let status = SubscribeResponse::Status(StreamStatus::Waiting);
        assert_eq!(status.status(), Some(StreamStatus::Waiting));
        assert!(status.envelopes().is_empty());
        let batch = SubscribeResponse::Envelopes(vec![env(1, 1)]);
        assert_eq!(batch.status(), None);
        assert_eq!(batch.envelopes().len(), 1);
    }
}
