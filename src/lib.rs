//! # Courier
//!
//! A partitioned, append-only envelope log with cursor-based subscriptions
//! and non-blocking fan-out.
//!
//! ## Core Concepts
//!
//! - **Envelopes**: immutable records keyed by (originator, sequence)
//! - **Partitions**: fixed-width sequence bands per originator, created ahead of writers
//! - **Cursors**: vector clocks that let a reader resume without loss or duplicates
//! - **Subscriptions**: catch up from the store, then follow live dispatch
//! - **Publishing**: staged payer envelopes signed and made durable in order
//!
//! ## Example
//!
//! ```ignore
//! use courier::{Collaborators, Node, NodeConfig, StaticNodeRegistry, FlatFees};
//! use courier::service::{SubscribeTopicsRequest, TopicFilter};
//!
//! let mut config = NodeConfig::default();
//! config.store.path = "./node-store".into();
//!
//! let node = Node::start(config, Collaborators::new(
//!     Arc::new(my_signer),
//!     Arc::new(FlatFees::default()),
//!     Arc::new(StaticNodeRegistry::new([100])),
//! ))?;
//!
//! // Publish through this node
//! let signed = node.service().publish_payer_envelopes(&ctx, vec![payer_envelope])?;
//!
//! // Stream a topic from the beginning
//! let (tx, rx) = crossbeam_channel::unbounded();
//! let request = SubscribeTopicsRequest::new(vec![TopicFilter::from_cursor(topic, VectorClock::new())]);
//! node.service().subscribe_topics(&ctx, &request, &tx)?;
//! ```

pub mod config;
pub mod context;
pub mod cursor;
pub mod error;
pub mod node;
pub mod service;
pub mod storage;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use config::{
    BackoffConfig, NodeConfig, PartitionWorkerConfig, PublishConfig, StoreConfig, SubscribeConfig,
};
pub use context::Context;
pub use cursor::{rows_per_entry, EnvelopesQuery, TopicCursors, VectorClock};
pub use error::{Error, Result};
pub use node::{Collaborators, Node};
pub use service::{
    AcceptAll, FeeCalculator, FlatFees, MessageService, NodeRegistry, PayloadValidator, Signer,
    StaticNodeRegistry,
};
pub use storage::{EnvelopeStore, PartitionRange, PartitionWorker, StoreStats};
pub use subscriptions::{Funnel, ListenerFilter, ListenerRegistry, PollingSubscription};
pub use types::*;
