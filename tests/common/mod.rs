//! Shared fixtures for integration tests.

#![allow(dead_code)]

use courier::service::{SubscribeResponse, StreamStatus};
use courier::{
    Collaborators, Error, FlatFees, NewEnvelope, Node, NodeConfig, NodeId, OriginatorEnvelope,
    PayerEnvelope, PicoDollars, Result, SequenceId, Signer, StagedEnvelope, StaticNodeRegistry,
    Topic, TopicKind,
};
use crossbeam_channel::Receiver;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const NODE: NodeId = 100;
pub const PEER: NodeId = 200;

/// Signs by echoing fields; optionally fails its first `failures` calls.
pub struct TestSigner {
    node: NodeId,
    failures: AtomicUsize,
    pub calls: AtomicUsize,
}

impl TestSigner {
    pub fn new(node: NodeId) -> Self {
        Self::failing(node, 0)
    }

    pub fn failing(node: NodeId, failures: usize) -> Self {
        Self {
            node,
            failures: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
        }
    }
}

impl Signer for TestSigner {
    fn node_id(&self) -> NodeId {
        self.node
    }

    fn sign_staged_envelope(
        &self,
        staged: &StagedEnvelope,
        base_fee: PicoDollars,
        congestion_fee: PicoDollars,
        retention_days: u32,
    ) -> Result<OriginatorEnvelope> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Signer("key unavailable".into()));
        }
        let expiry = (retention_days != u32::MAX).then(|| {
            staged.originator_time.unix_secs() + i64::from(retention_days) * 86_400
        });
        Ok(OriginatorEnvelope {
            originator_id: self.node,
            sequence_id: staged.id,
            originator_time: staged.originator_time,
            topic: staged.topic.clone(),
            payer_envelope: staged.payer_envelope.clone(),
            base_fee,
            congestion_fee,
            expiry,
            signature: staged.id.to_be_bytes().to_vec(),
        })
    }
}

pub fn fees() -> FlatFees {
    FlatFees {
        per_byte_day: 1,
        per_recent_message: 10,
    }
}

/// Fast timers and small bands so tests exercise partition creation.
pub fn test_config(dir: &Path) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.store.path = dir.join("store");
    config.store.band_width = 10;
    config.store.sync_on_commit = false;
    config.subscribe.poll_interval_ms = 10;
    config.subscribe.keepalive_interval_ms = 60_000;
    config.subscribe.topic_page_limit = 8;
    config.subscribe.max_requested_rows = 8;
    config.publish.poll_interval_ms = 20;
    config.publish.retry_interval_ms = 10;
    config.publish.publish_wait_timeout_ms = 5_000;
    config
}

pub fn start_node(dir: &Path, registry: Arc<StaticNodeRegistry>) -> Node {
    start_node_with(test_config(dir), registry)
}

/// Log output for a test run; safe to call more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn start_node_with(config: NodeConfig, registry: Arc<StaticNodeRegistry>) -> Node {
    init_tracing();
    Node::start(
        config,
        Collaborators::new(Arc::new(TestSigner::new(NODE)), Arc::new(fees()), registry),
    )
    .unwrap()
}

pub fn registry() -> Arc<StaticNodeRegistry> {
    Arc::new(StaticNodeRegistry::new([NODE, PEER]))
}

pub fn topic(name: &str) -> Topic {
    Topic::new(TopicKind::GroupMessages, name.as_bytes())
}

pub fn row(originator: NodeId, sequence: SequenceId, topic: &Topic) -> NewEnvelope {
    NewEnvelope::new(
        originator,
        sequence,
        topic.clone(),
        format!("{}:{}", originator, sequence).into_bytes(),
    )
}

pub fn payer_envelope(topic: &Topic, payload: &[u8]) -> PayerEnvelope {
    PayerEnvelope {
        payer_address: "0xpayer".into(),
        target_originator: NODE,
        topic: topic.clone(),
        payload: payload.to_vec(),
        retention_days: 30,
        signature: vec![1, 2, 3],
    }
}

/// Next response that isn't a keepalive.
pub fn next_response(rx: &Receiver<SubscribeResponse>) -> SubscribeResponse {
    loop {
        let response = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        if response.status() != Some(StreamStatus::Waiting) {
            return response;
        }
    }
}

pub fn expect_status(rx: &Receiver<SubscribeResponse>, status: StreamStatus) {
    assert_eq!(next_response(rx).status(), Some(status));
}

/// Collect delivered (originator, sequence) keys until `expected` distinct
/// keys were seen, keeping duplicates.
pub fn collect_keys(rx: &Receiver<SubscribeResponse>, expected: usize) -> Vec<(NodeId, SequenceId)> {
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut keys = Vec::new();
    let mut distinct = BTreeSet::new();
    while distinct.len() < expected {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let response = rx.recv_timeout(remaining).unwrap();
        for env in response.envelopes() {
            keys.push((env.originator_id, env.sequence_id));
            distinct.insert((env.originator_id, env.sequence_id));
        }
    }
    keys
}

/// Keys delivered within `window`, with nothing further expected.
pub fn drain_keys(rx: &Receiver<SubscribeResponse>, window: Duration) -> Vec<(NodeId, SequenceId)> {
    let deadline = Instant::now() + window;
    let mut keys = Vec::new();
    while let Ok(response) = rx.recv_deadline(deadline) {
        keys.extend(response.envelopes().iter().map(|e| (e.originator_id, e.sequence_id)));
    }
    keys
}
