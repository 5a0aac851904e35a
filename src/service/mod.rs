//! The node-facing service layer and the collaborators it depends on.

pub mod backoff;
pub mod collaborators;
pub mod message;
pub mod publish;
pub mod subscribe;

pub use backoff::Backoff;
pub use collaborators::{
    AcceptAll, FeeCalculator, FlatFees, NodeRegistry, PayloadValidator, Signer, StaticNodeRegistry,
};
pub use message::{MessageService, INFINITE_RETENTION_DAYS, MIN_RETENTION_DAYS};
pub use publish::PublishWorker;
pub use subscribe::{
    ResponseSink, StreamStatus, SubscribeResponse, SubscribeTopicsRequest, TopicFilter,
};
