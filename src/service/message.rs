//! The node's message API: publish, pull queries, and (in `subscribe`)
//! streaming subscriptions.

use super::collaborators::{NodeRegistry, PayloadValidator, Signer};
use super::publish::PublishWorker;
use crate::config::{PublishConfig, SubscribeConfig};
use crate::context::Context;
use crate::cursor::EnvelopesQuery;
use crate::error::{Error, Result};
use crate::storage::EnvelopeStore;
use crate::subscriptions::SubscribeWorker;
use crate::types::{
    Envelope, NodeId, OriginatorEnvelope, PayerEnvelope, SequenceId, Topic, TopicKind,
};
use crossbeam_channel::{after, select, tick};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Retention value meaning "keep forever".
pub const INFINITE_RETENTION_DAYS: u32 = u32::MAX;

/// Shortest retention a payer may ask for.
pub const MIN_RETENTION_DAYS: u32 = 2;

const PUBLISH_WAIT_TICK: Duration = Duration::from_millis(10);

pub struct MessageService {
    pub(super) ctx: Context,
    pub(super) store: Arc<EnvelopeStore>,
    pub(super) signer: Arc<dyn Signer>,
    pub(super) registry: Arc<dyn NodeRegistry>,
    pub(super) validator: Arc<dyn PayloadValidator>,
    pub(super) publisher: Arc<PublishWorker>,
    pub(super) subscriber: Arc<SubscribeWorker>,
    pub(super) subscribe: SubscribeConfig,
    pub(super) publish: PublishConfig,
}

impl MessageService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: Context,
        store: Arc<EnvelopeStore>,
        signer: Arc<dyn Signer>,
        registry: Arc<dyn NodeRegistry>,
        validator: Arc<dyn PayloadValidator>,
        publisher: Arc<PublishWorker>,
        subscriber: Arc<SubscribeWorker>,
        subscribe: SubscribeConfig,
        publish: PublishConfig,
    ) -> Self {
        Self {
            ctx,
            store,
            signer,
            registry,
            validator,
            publisher,
            subscriber,
            subscribe,
            publish,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.signer.node_id()
    }

    pub fn store(&self) -> &Arc<EnvelopeStore> {
        &self.store
    }

    pub fn subscriber(&self) -> &Arc<SubscribeWorker> {
        &self.subscriber
    }

    pub fn publisher(&self) -> &Arc<PublishWorker> {
        &self.publisher
    }

    /// Stage payer envelopes for publication by this node.
    ///
    /// Every envelope is validated before any is staged. The returned
    /// envelopes carry their final sequence IDs; the call waits (bounded by
    /// `publish_wait_timeout`) until the worker has made them durable, so a
    /// read issued afterwards normally sees them.
    pub fn publish_payer_envelopes(
        &self,
        ctx: &Context,
        envelopes: Vec<PayerEnvelope>,
    ) -> Result<Vec<OriginatorEnvelope>> {
        if envelopes.is_empty() {
            return Err(Error::InvalidArgument("missing payer envelope".into()));
        }
        for envelope in &envelopes {
            self.validate_payer_envelope(envelope)?;
        }

        let mut signed = Vec::with_capacity(envelopes.len());
        let mut last_staged = 0;
        for envelope in &envelopes {
            let staged = self
                .store
                .staging()
                .insert(envelope.topic.clone(), envelope.to_bytes()?)?;
            debug!(sequence = staged.id, topic = %staged.topic, "staged payer envelope");
            self.publisher.notify_staged_publish();
            last_staged = staged.id;

            let (base_fee, congestion_fee) = if staged.topic.is_reserved() {
                (0, 0)
            } else {
                self.publisher.calculate_fees(&staged, envelope.retention_days)?
            };
            signed.push(self.signer.sign_staged_envelope(
                &staged,
                base_fee,
                congestion_fee,
                envelope.retention_days,
            )?);
        }

        self.wait_for_gateway_publish(ctx, last_staged);
        Ok(signed)
    }

    /// Block until the publish worker is past `staged_id`, the timeout
    /// elapses, or either context is done. Returns whether it got there.
    pub fn wait_for_gateway_publish(&self, ctx: &Context, staged_id: SequenceId) -> bool {
        let timeout = after(self.publish.publish_wait_timeout());
        let ticker = tick(PUBLISH_WAIT_TICK);
        loop {
            if self.publisher.last_processed() >= staged_id {
                return true;
            }
            let keep_waiting = select! {
                recv(ctx.done()) -> _ => false,
                recv(self.ctx.done()) -> _ => false,
                recv(timeout) -> _ => {
                    warn!(sequence = staged_id, "timed out waiting for staged envelope to publish");
                    false
                }
                recv(ticker) -> _ => true,
            };
            if !keep_waiting {
                return self.publisher.last_processed() >= staged_id;
            }
        }
    }

    /// Pull query. A `limit` of zero or above `max_requested_rows` is
    /// clamped to `max_requested_rows`.
    pub fn query_envelopes(&self, query: &EnvelopesQuery, limit: usize) -> Result<Vec<Arc<Envelope>>> {
        self.validate_query(query)?;
        let max = self.subscribe.max_requested_rows;
        let limit = if limit == 0 || limit > max { max } else { limit };
        let rows = self.store.select_envelopes(query, limit)?;
        debug!(rows = rows.len(), limit, "query envelopes");
        Ok(rows)
    }

    pub(super) fn validate_query(&self, query: &EnvelopesQuery) -> Result<()> {
        let limits = &self.subscribe;
        if !query.topics.is_empty() && !query.originators.is_empty() {
            return Err(Error::InvalidArgument(
                "cannot filter by both topic and originator in same subscription request".into(),
            ));
        }
        let filters = query.topics.len() + query.originators.len();
        if filters > limits.max_queries_per_request {
            return Err(Error::InvalidArgument(format!(
                "too many filters in query: {} (max {})",
                filters, limits.max_queries_per_request
            )));
        }
        for topic in &query.topics {
            self.validate_topic(topic)?;
        }
        if let Some(cursor) = &query.last_seen {
            if cursor.len() > limits.max_vector_clock_length {
                return Err(Error::InvalidArgument(format!(
                    "vector clock length exceeds maximum of {}",
                    limits.max_vector_clock_length
                )));
            }
        }
        Ok(())
    }

    pub(super) fn validate_topic(&self, topic: &Topic) -> Result<()> {
        if topic.is_empty() || topic.len() > self.subscribe.max_topic_length {
            return Err(Error::InvalidArgument(format!(
                "invalid topic length {} (must be 1..={})",
                topic.len(),
                self.subscribe.max_topic_length
            )));
        }
        Ok(())
    }

    fn validate_payer_envelope(&self, envelope: &PayerEnvelope) -> Result<()> {
        let node = self.signer.node_id();
        if envelope.target_originator != node {
            return Err(Error::InvalidArgument(format!(
                "invalid target originator {} (this node is {})",
                envelope.target_originator, node
            )));
        }
        if envelope.payer_address.is_empty() {
            return Err(Error::InvalidArgument("missing payer address".into()));
        }
        self.validate_topic(&envelope.topic)?;
        self.validate_retention(envelope.retention_days)?;

        if envelope.topic.is_reserved() {
            return Err(Error::InvalidArgument(
                "reserved topics cannot be published to by gateways".into(),
            ));
        }
        match envelope.topic.kind() {
            Some(TopicKind::IdentityUpdates) => {
                return Err(Error::InvalidArgument(
                    "identity updates must be published via the blockchain".into(),
                ))
            }
            None => {
                return Err(Error::InvalidArgument(format!(
                    "unknown topic kind in {}",
                    envelope.topic
                )))
            }
            Some(_) => {}
        }

        self.validator.validate(envelope).map_err(|e| {
            info!(topic = %envelope.topic, error = %e, "payload rejected");
            match e {
                Error::InvalidArgument(_) => e,
                other => Error::InvalidArgument(other.to_string()),
            }
        })
    }

    fn validate_retention(&self, days: u32) -> Result<()> {
        if days == INFINITE_RETENTION_DAYS {
            return Ok(());
        }
        let max = self.publish.max_retention_days;
        if !(MIN_RETENTION_DAYS..=max).contains(&days) {
            return Err(Error::InvalidArgument(format!(
                "retention days must be between {} and {}, or infinite (got {})",
                MIN_RETENTION_DAYS, max, days
            )));
        }
        Ok(())
    }
}
