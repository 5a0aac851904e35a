//! Node configuration.
//!
//! Every section has defaults, so a partial JSON document (or none at all)
//! yields a working node. Durations are in milliseconds.

use crate::error::{Error, Result};
use crate::storage::partition::DEFAULT_BAND_WIDTH;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Envelope store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Base path for the store.
    pub path: PathBuf,

    /// Width of each partition band, in sequence IDs. Fixed at creation.
    pub band_width: u64,

    /// Decoded envelopes kept in memory.
    pub envelope_cache_size: usize,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,

    /// fsync touched segments before a commit returns.
    pub sync_on_commit: bool,

    /// Minutes of per-originator congestion kept behind the newest one.
    pub congestion_retention_minutes: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./store"),
            band_width: DEFAULT_BAND_WIDTH,
            envelope_cache_size: 1024,
            create_if_missing: true,
            sync_on_commit: true,
            congestion_retention_minutes: 60,
        }
    }
}

impl StoreConfig {
    pub fn at(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionWorkerConfig {
    pub check_interval_ms: u64,
    /// Fraction of the current band after which the next band is created.
    pub fill_threshold: f64,
}

impl Default for PartitionWorkerConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 30 * 60 * 1000,
            fill_threshold: 0.7,
        }
    }
}

impl PartitionWorkerConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_interval_ms: u64,
    pub max_elapsed_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 50,
            max_interval_ms: 300,
            max_elapsed_ms: 2000,
        }
    }
}

/// Subscription and query limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscribeConfig {
    pub poll_interval_ms: u64,
    pub poll_page_size: usize,
    /// Capacity of each listener's channel; a full channel evicts the listener.
    pub listener_buffer: usize,
    pub keepalive_interval_ms: u64,
    pub max_topic_filters: usize,
    pub max_topic_length: usize,
    pub max_vector_clock_length: usize,
    pub max_topics_per_chunk: usize,
    pub topic_page_limit: usize,
    pub max_queries_per_request: usize,
    pub max_requested_rows: usize,
    pub backoff: BackoffConfig,
}

impl Default for SubscribeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            poll_page_size: 1000,
            listener_buffer: 1024,
            keepalive_interval_ms: 30_000,
            max_topic_filters: 10_000,
            max_topic_length: 128,
            max_vector_clock_length: 1024,
            max_topics_per_chunk: 500,
            topic_page_limit: 500,
            max_queries_per_request: 10_000,
            max_requested_rows: 1000,
            backoff: BackoffConfig::default(),
        }
    }
}

impl SubscribeConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    pub poll_interval_ms: u64,
    pub page_size: usize,
    /// Pause before retrying a staged envelope that failed to publish.
    pub retry_interval_ms: u64,
    pub publish_wait_timeout_ms: u64,
    pub max_retention_days: u32,
    /// Minutes of history fed to the congestion fee.
    pub congestion_window_minutes: u32,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            page_size: 100,
            retry_interval_ms: 1000,
            publish_wait_timeout_ms: 30_000,
            max_retention_days: 365,
            congestion_window_minutes: 5,
        }
    }
}

impl PublishConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn publish_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_wait_timeout_ms)
    }
}

/// Everything a [`crate::Node`] needs.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub store: StoreConfig,
    pub partitions: PartitionWorkerConfig,
    pub subscribe: SubscribeConfig,
    pub publish: PublishConfig,
}

impl NodeConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: NodeConfig =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.store.band_width == 0 {
            return Err(Error::Config("store.band_width must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.partitions.fill_threshold) {
            return Err(Error::Config(
                "partitions.fill_threshold must be in [0, 1)".into(),
            ));
        }
        let s = &self.subscribe;
        for (name, value) in [
            ("subscribe.poll_page_size", s.poll_page_size),
            ("subscribe.listener_buffer", s.listener_buffer),
            ("subscribe.max_topics_per_chunk", s.max_topics_per_chunk),
            ("subscribe.topic_page_limit", s.topic_page_limit),
            ("subscribe.max_requested_rows", s.max_requested_rows),
            ("publish.page_size", self.publish.page_size),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("{} must be positive", name)));
            }
        }
        if s.keepalive_interval_ms == 0 || s.poll_interval_ms == 0 {
            return Err(Error::Config("subscribe intervals must be positive".into()));
        }
        let window = self.publish.congestion_window_minutes.max(1);
        if self.store.congestion_retention_minutes < window {
            return Err(Error::Config(
                "store.congestion_retention_minutes must cover publish.congestion_window_minutes"
                    .into(),
            ));
        }
        Ok(())
    }
}
