//! Partition Lifecycle Worker.
//!
//! Creates the next band of each originator ahead of time once the current
//! band is filling up, so writers rarely hit a missing partition.

use super::partition::{self, PartitionRange};
use super::store::EnvelopeStore;
use crate::config::PartitionWorkerConfig;
use crate::context::Context;
use crate::error::Result;
use crate::types::{NodeId, SequenceId};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

pub struct PartitionWorker {
    store: Arc<EnvelopeStore>,
    config: PartitionWorkerConfig,
    /// Bands this process already ensured; only saves calls.
    created: HashSet<(NodeId, SequenceId)>,
}

impl PartitionWorker {
    pub fn new(store: Arc<EnvelopeStore>, config: PartitionWorkerConfig) -> Self {
        Self {
            store,
            config,
            created: HashSet::new(),
        }
    }

    /// Run one check now, then one per interval until `ctx` is cancelled.
    pub fn start(mut self, ctx: Context) -> Result<JoinHandle<()>> {
        let handle = thread::Builder::new()
            .name("partition-worker".into())
            .spawn(move || {
                info!(
                    interval_ms = self.config.check_interval_ms,
                    threshold = self.config.fill_threshold,
                    "partition worker started"
                );
                loop {
                    self.run_check();
                    if !ctx.sleep(self.config.check_interval()) {
                        break;
                    }
                }
                info!("partition worker stopped");
            })?;
        Ok(handle)
    }

    /// One pass over every originator. Returns the partitions it created.
    pub fn run_check(&mut self) -> Vec<(NodeId, PartitionRange)> {
        let band_width = self.store.band_width();
        let mut created = Vec::new();

        for (originator, sequence) in self.store.vector_clock().iter() {
            let ratio = partition::fill_ratio(sequence, band_width);
            if ratio <= self.config.fill_threshold {
                continue;
            }

            let next = match partition::next_band_start(originator, sequence, band_width) {
                Ok(next) => next,
                Err(e) => {
                    error!(originator, sequence, error = %e, "cannot compute next band");
                    continue;
                }
            };
            if self.created.contains(&(originator, next)) {
                continue;
            }

            debug!(originator, sequence, ratio, next, "band filling up");
            match self.store.ensure_partitions(originator, next, band_width) {
                Ok(ranges) => {
                    self.created.insert((originator, next));
                    created.extend(ranges.into_iter().map(|r| (originator, r)));
                }
                Err(e) if e.is_fatal() => {
                    error!(originator, next, error = %e, "failed to create next partition");
                }
                Err(e) => {
                    warn!(originator, next, error = %e, "failed to create next partition");
                }
            }
        }

        for (originator, ranges) in self.store.partitions() {
            if let Err(e) = partition::validate_chain(originator, &ranges) {
                error!(originator, error = %e, "partition chain is broken");
            }
        }
        created
    }
}
