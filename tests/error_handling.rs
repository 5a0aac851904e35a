//! Error handling and edge case tests.

mod common;

use common::{registry, row, test_config, topic, fees, TestSigner, NODE};
use courier::{Collaborators, EnvelopeStore, Error, Node, StoreConfig};
use std::fs;
use std::io;
use std::sync::Arc;
use tempfile::TempDir;

fn test_store(dir: &TempDir) -> EnvelopeStore {
    EnvelopeStore::create(StoreConfig {
        band_width: 10,
        ..StoreConfig::at(dir.path().join("store"))
    })
    .unwrap()
}

// --- Store Errors ---

#[test]
fn test_empty_batch() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    assert!(matches!(store.insert_batch(&[]), Err(Error::EmptyBatch)));
}

#[test]
fn test_sequence_overflow_is_fatal() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    let err = store.insert_envelope(row(7, u64::MAX, &topic("t"))).unwrap_err();
    assert!(matches!(err, Error::SequenceOverflow { originator: 7, .. }));
    assert!(err.is_fatal());
    assert!(store.vector_clock().is_empty());
}

#[test]
fn test_zero_band_width_rejected() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    assert!(matches!(
        store.ensure_partitions(1, 5, 0),
        Err(Error::InvalidArgument(_))
    ));

    let created = EnvelopeStore::create(StoreConfig {
        band_width: 0,
        ..StoreConfig::at(dir.path().join("other"))
    });
    assert!(matches!(created, Err(Error::Config(_))));
}

#[test]
fn test_ensure_partitions_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    assert_eq!(store.ensure_partitions(1, 25, 10).unwrap().len(), 3);
    assert!(store.ensure_partitions(1, 25, 10).unwrap().is_empty());
    assert!(store.ensure_partitions(1, 3, 10).unwrap().is_empty());
    assert_eq!(store.partitions_for(1).len(), 3);
}

#[test]
fn test_corrupt_manifest() {
    let dir = TempDir::new().unwrap();
    drop(test_store(&dir));
    fs::write(dir.path().join("store").join("MANIFEST"), b"NOPE\x01").unwrap();

    let result = EnvelopeStore::open(StoreConfig::at(dir.path().join("store")));
    assert!(matches!(result, Err(Error::InvalidFormat(_))));
}

#[test]
fn test_unknown_envelope_is_none() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    assert!(store.get_envelope(1, 1).unwrap().is_none());
    assert!(store.select_by_originator(1, 0, 10).unwrap().is_empty());
}

// --- Node Errors ---

#[test]
fn test_invalid_config_rejected_at_start() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.subscribe.listener_buffer = 0;

    let result = Node::start(
        config,
        Collaborators::new(Arc::new(TestSigner::new(NODE)), Arc::new(fees()), registry()),
    );
    assert!(matches!(result, Err(Error::Config(_))));
    assert!(!dir.path().join("store").exists());
}

#[test]
fn test_second_node_on_same_store() {
    let dir = TempDir::new().unwrap();
    let _first = common::start_node(dir.path(), registry());
    let second = Node::start(
        test_config(dir.path()),
        Collaborators::new(Arc::new(TestSigner::new(NODE)), Arc::new(fees()), registry()),
    );
    assert!(matches!(second, Err(Error::Locked)));
}

// --- Classification ---

#[test]
fn test_error_classification() {
    assert!(Error::Transient("busy".into()).is_retryable());
    assert!(Error::Io(io::Error::new(io::ErrorKind::TimedOut, "slow")).is_retryable());
    assert!(!Error::Io(io::Error::new(io::ErrorKind::NotFound, "gone")).is_retryable());
    assert!(!Error::InvalidArgument("bad".into()).is_retryable());

    assert!(Error::InvariantViolation("backwards".into()).is_fatal());
    assert!(Error::Corruption("bad crc".into()).is_fatal());
    assert!(!Error::Transient("busy".into()).is_fatal());
    assert!(!Error::Cancelled.is_fatal());
}
