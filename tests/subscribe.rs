//! Catch-up and live delivery through the message service.

mod common;

use common::*;
use courier::service::{
    StreamStatus, SubscribeResponse, SubscribeTopicsRequest, TopicFilter,
};
use courier::{Context, EnvelopeStore, EnvelopesQuery, Error, NewEnvelope, Node, Result, VectorClock};
use crossbeam_channel::{unbounded, Receiver};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Write rows before the node starts, so live pollers never see them.
fn seed(dir: &Path, rows: &[NewEnvelope]) {
    let config = test_config(dir);
    let store = EnvelopeStore::create(config.store).unwrap();
    store.insert_batch(rows).unwrap();
}

fn spawn_topics(
    node: &Node,
    ctx: &Context,
    request: SubscribeTopicsRequest,
) -> (Receiver<SubscribeResponse>, JoinHandle<Result<()>>) {
    let (tx, rx) = unbounded();
    let service = Arc::clone(node.service());
    let ctx = ctx.clone();
    let handle = thread::spawn(move || service.subscribe_topics(&ctx, &request, &tx));
    (rx, handle)
}

fn spawn_envelopes(
    node: &Node,
    ctx: &Context,
    query: EnvelopesQuery,
) -> (Receiver<SubscribeResponse>, JoinHandle<Result<()>>) {
    let (tx, rx) = unbounded();
    let service = Arc::clone(node.service());
    let ctx = ctx.clone();
    let handle = thread::spawn(move || service.subscribe_envelopes(&ctx, &query, &tx));
    (rx, handle)
}

fn sequences(keys: &[(u32, u64)]) -> Vec<u64> {
    keys.iter().map(|(_, s)| *s).collect()
}

// --- Catch-up ---

#[test]
fn test_empty_cursor_catches_up_everything() {
    let dir = TempDir::new().unwrap();
    let t = topic("chat");
    seed(dir.path(), &[row(PEER, 1, &t), row(PEER, 2, &t), row(PEER, 3, &t)]);
    let node = start_node(dir.path(), registry());

    let ctx = Context::background();
    let request = SubscribeTopicsRequest::new(vec![TopicFilter::from_cursor(t, VectorClock::new())]);
    let (rx, handle) = spawn_topics(&node, &ctx, request);

    expect_status(&rx, StreamStatus::Started);
    expect_status(&rx, StreamStatus::Catchup);
    assert_eq!(sequences(&collect_keys(&rx, 3)), vec![1, 2, 3]);
    expect_status(&rx, StreamStatus::CatchupComplete);

    ctx.cancel();
    handle.join().unwrap().unwrap();
}

#[test]
fn test_cursor_resumes_after_last_seen() {
    let dir = TempDir::new().unwrap();
    let t = topic("chat");
    seed(dir.path(), &[row(PEER, 1, &t), row(PEER, 2, &t), row(PEER, 3, &t)]);
    let node = start_node(dir.path(), registry());

    let ctx = Context::background();
    let cursor: VectorClock = [(PEER, 2)].into_iter().collect();
    let request = SubscribeTopicsRequest::new(vec![TopicFilter::from_cursor(t, cursor)]);
    let (rx, handle) = spawn_topics(&node, &ctx, request);

    expect_status(&rx, StreamStatus::Started);
    expect_status(&rx, StreamStatus::Catchup);
    assert_eq!(collect_keys(&rx, 1), vec![(PEER, 3)]);
    expect_status(&rx, StreamStatus::CatchupComplete);

    ctx.cancel();
    handle.join().unwrap().unwrap();
}

#[test]
fn test_catch_up_pages_across_topics() {
    let dir = TempDir::new().unwrap();
    let a = topic("a");
    let b = topic("b");
    // Interleaved so both topics need several pages of the 8-row limit.
    let rows: Vec<_> = (1..=30)
        .map(|s| row(PEER, s, if s % 2 == 0 { &a } else { &b }))
        .collect();
    seed(dir.path(), &rows);
    let node = start_node(dir.path(), registry());

    let ctx = Context::background();
    let request = SubscribeTopicsRequest::new(vec![
        TopicFilter::from_cursor(a, VectorClock::new()),
        TopicFilter::from_cursor(b, VectorClock::new()),
    ]);
    let (rx, handle) = spawn_topics(&node, &ctx, request);

    expect_status(&rx, StreamStatus::Started);
    expect_status(&rx, StreamStatus::Catchup);
    let keys = collect_keys(&rx, 30);
    assert_eq!(keys.len(), 30);
    expect_status(&rx, StreamStatus::CatchupComplete);

    ctx.cancel();
    handle.join().unwrap().unwrap();
}

// --- Catch-up / live boundary ---

#[test]
fn test_no_duplicates_across_boundary() {
    let dir = TempDir::new().unwrap();
    let t = topic("chat");
    let existing: Vec<_> = (1..=40).map(|s| row(PEER, s, &t)).collect();
    seed(dir.path(), &existing);
    let node = start_node(dir.path(), registry());

    let ctx = Context::background();
    let request = SubscribeTopicsRequest::new(vec![TopicFilter::from_cursor(t.clone(), VectorClock::new())]);
    let (rx, handle) = spawn_topics(&node, &ctx, request);

    // Lands during catch-up or just after; either way exactly once.
    expect_status(&rx, StreamStatus::Started);
    node.store().insert_envelope(row(PEER, 41, &t)).unwrap();

    let mut keys = collect_keys(&rx, 41);
    keys.extend(drain_keys(&rx, Duration::from_millis(300)));

    let distinct: HashSet<_> = keys.iter().copied().collect();
    assert_eq!(distinct.len(), 41);
    assert_eq!(keys.len(), 41, "an envelope was delivered twice");

    // Per originator, delivery order is strictly increasing.
    let seqs = sequences(&keys);
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));

    ctx.cancel();
    handle.join().unwrap().unwrap();
}

// --- Live ---

#[test]
fn test_live_only_skips_history() {
    let dir = TempDir::new().unwrap();
    let t = topic("chat");
    seed(dir.path(), &[row(PEER, 1, &t), row(PEER, 2, &t)]);
    let node = start_node(dir.path(), registry());

    let ctx = Context::background();
    let request = SubscribeTopicsRequest::new(vec![TopicFilter::live(t.clone())]);
    let (rx, handle) = spawn_topics(&node, &ctx, request);

    expect_status(&rx, StreamStatus::Started);
    expect_status(&rx, StreamStatus::CatchupComplete);

    node.store().insert_envelope(row(PEER, 3, &t)).unwrap();
    node.store().insert_envelope(row(PEER, 4, &topic("elsewhere"))).unwrap();
    assert_eq!(collect_keys(&rx, 1), vec![(PEER, 3)]);
    assert!(drain_keys(&rx, Duration::from_millis(200)).is_empty());

    ctx.cancel();
    handle.join().unwrap().unwrap();
}

#[test]
fn test_keepalive_while_idle() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.subscribe.keepalive_interval_ms = 30;
    let node = start_node_with(config, registry());

    let ctx = Context::background();
    let request = SubscribeTopicsRequest::new(vec![TopicFilter::live(topic("quiet"))]);
    let (rx, handle) = spawn_topics(&node, &ctx, request);

    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).unwrap().status(),
        Some(StreamStatus::Started)
    );
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let response = rx.recv_deadline(deadline).unwrap();
        if response.status() == Some(StreamStatus::Waiting) {
            break;
        }
    }

    ctx.cancel();
    handle.join().unwrap().unwrap();
}

#[test]
fn test_shutdown_ends_stream_cleanly() {
    let dir = TempDir::new().unwrap();
    let node = start_node(dir.path(), registry());

    let ctx = Context::background();
    let request = SubscribeTopicsRequest::new(vec![TopicFilter::live(topic("chat"))]);
    let (rx, handle) = spawn_topics(&node, &ctx, request);
    expect_status(&rx, StreamStatus::Started);
    expect_status(&rx, StreamStatus::CatchupComplete);

    node.shutdown().unwrap();
    handle.join().unwrap().unwrap();
}

#[test]
fn test_new_originator_is_followed() {
    let dir = TempDir::new().unwrap();
    let registry = registry();
    let node = start_node(dir.path(), Arc::clone(&registry));

    let ctx = Context::background();
    let (rx, handle) = spawn_envelopes(&node, &ctx, EnvelopesQuery::global());
    expect_status(&rx, StreamStatus::Started);
    expect_status(&rx, StreamStatus::CatchupComplete);

    registry.add_node(300);
    let deadline = Instant::now() + Duration::from_secs(5);
    while !node.service().subscriber().pollers().originators().contains(&300) {
        assert!(Instant::now() < deadline, "poller for new node never started");
        thread::sleep(Duration::from_millis(5));
    }

    node.store().insert_envelope(row(300, 1, &topic("chat"))).unwrap();
    assert_eq!(collect_keys(&rx, 1), vec![(300, 1)]);

    ctx.cancel();
    handle.join().unwrap().unwrap();
}

// --- Envelope subscriptions ---

#[test]
fn test_originator_subscription_catch_up_then_live() {
    let dir = TempDir::new().unwrap();
    let t = topic("chat");
    let mut rows: Vec<_> = (1..=20).map(|s| row(PEER, s, &t)).collect();
    rows.extend((1..=5).map(|s| row(NODE, s, &t)));
    seed(dir.path(), &rows);
    let node = start_node(dir.path(), registry());

    let ctx = Context::background();
    let query = EnvelopesQuery::originators(vec![PEER]).after(VectorClock::new());
    let (rx, handle) = spawn_envelopes(&node, &ctx, query);

    expect_status(&rx, StreamStatus::Started);
    expect_status(&rx, StreamStatus::Catchup);
    let keys = collect_keys(&rx, 20);
    assert!(keys.iter().all(|(o, _)| *o == PEER));
    assert_eq!(sequences(&keys), (1..=20).collect::<Vec<_>>());
    expect_status(&rx, StreamStatus::CatchupComplete);

    node.store().insert_envelope(row(NODE, 6, &t)).unwrap();
    node.store().insert_envelope(row(PEER, 21, &t)).unwrap();
    assert_eq!(collect_keys(&rx, 1), vec![(PEER, 21)]);

    ctx.cancel();
    handle.join().unwrap().unwrap();
}

// --- Validation ---

#[test]
fn test_invalid_topic_requests_rejected() {
    let dir = TempDir::new().unwrap();
    let node = start_node(dir.path(), registry());
    let ctx = Context::background();

    let unknown: VectorClock = [(999, 1)].into_iter().collect();
    let cases = vec![
        SubscribeTopicsRequest::new(vec![]),
        SubscribeTopicsRequest::new(vec![TopicFilter::live(courier::Topic::default())]),
        SubscribeTopicsRequest::new(vec![TopicFilter::live(courier::Topic::from_bytes(vec![0u8; 200]))]),
        SubscribeTopicsRequest::new(vec![TopicFilter::from_cursor(topic("chat"), unknown)]),
    ];

    for request in cases {
        let (rx, handle) = spawn_topics(&node, &ctx, request);
        let result = handle.join().unwrap();
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        // Nothing was sent before the error.
        assert!(rx.try_recv().is_err());
    }
}

#[test]
fn test_unknown_originator_message() {
    let dir = TempDir::new().unwrap();
    let node = start_node(dir.path(), registry());
    let ctx = Context::background();

    let cursor: VectorClock = [(PEER, 1), (777, 3)].into_iter().collect();
    let request = SubscribeTopicsRequest::new(vec![TopicFilter::from_cursor(topic("chat"), cursor)]);
    let (_rx, handle) = spawn_topics(&node, &ctx, request);
    let err = handle.join().unwrap().unwrap_err();
    assert!(err.to_string().contains("unknown originator node ID in cursor: 777"));
}

#[test]
fn test_envelope_query_cannot_mix_filters() {
    let dir = TempDir::new().unwrap();
    let node = start_node(dir.path(), registry());
    let ctx = Context::background();

    let query = EnvelopesQuery {
        topics: vec![topic("chat")],
        originators: vec![PEER],
        last_seen: None,
    };
    let (rx, handle) = spawn_envelopes(&node, &ctx, query);
    assert!(matches!(handle.join().unwrap(), Err(Error::InvalidArgument(_))));
    assert!(rx.try_recv().is_err());
}
