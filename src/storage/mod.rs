//! Durable storage: partitioned envelope segments, indexes, the staging
//! queue and usage counters, all behind [`EnvelopeStore`].

pub mod index;
pub mod partition;
pub mod segment;
pub mod staging;
pub mod store;
pub mod usage;
pub mod worker;

pub use partition::PartitionRange;
pub use staging::StagingQueue;
pub use store::{EnvelopeStore, Savepoint, StoreStats, Transaction};
pub use usage::{PayerUsage, UsageIncrement};
pub use worker::PartitionWorker;
