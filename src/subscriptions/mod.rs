//! Streaming machinery: polling subscriptions, fan-in, and listener dispatch.

pub mod dispatcher;
pub mod funnel;
pub mod listener;
pub mod poll;

pub use dispatcher::{DispatchStats, ListenerCounts, ListenerRegistry, OriginatorPollers, SubscribeWorker};
pub use funnel::Funnel;
pub use listener::{Delivery, DeliveryOutcome, Listener, ListenerFilter, ListenerId};
pub use poll::{PollableQuery, PollingOptions, PollingSubscription};
