//! The publish worker: turns staged payer envelopes into durable,
//! signed envelopes of this node, strictly in staging order.

use super::collaborators::{FeeCalculator, Signer};
use crate::config::PublishConfig;
use crate::context::Context;
use crate::error::Result;
use crate::storage::EnvelopeStore;
use crate::subscriptions::{PollingOptions, PollingSubscription};
use crate::types::{NewEnvelope, PayerEnvelope, PicoDollars, SequenceId, StagedEnvelope};
use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Deleted staged rows after which the staging log is compacted.
const COMPACT_AFTER_DELETES: usize = 1024;

struct Publisher {
    ctx: Context,
    store: Arc<EnvelopeStore>,
    signer: Arc<dyn Signer>,
    fees: Arc<dyn FeeCalculator>,
    config: PublishConfig,
    last_processed: AtomicU64,
    deletes_since_compaction: AtomicUsize,
}

/// Background worker draining the staging queue.
///
/// A staged envelope that fails to publish is retried after
/// `retry_interval` until it succeeds; nothing staged after it is published
/// in the meantime.
pub struct PublishWorker {
    publisher: Arc<Publisher>,
    notifier: Sender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PublishWorker {
    pub fn start(
        ctx: &Context,
        store: Arc<EnvelopeStore>,
        signer: Arc<dyn Signer>,
        fees: Arc<dyn FeeCalculator>,
        config: PublishConfig,
    ) -> Result<Self> {
        let publisher = Arc::new(Publisher {
            ctx: ctx.clone(),
            store,
            signer,
            fees,
            config,
            last_processed: AtomicU64::new(0),
            deletes_since_compaction: AtomicUsize::new(0),
        });
        publisher.cleanup_orphans()?;

        let (notifier, notifications) = bounded(1);
        let staging_store = Arc::clone(&publisher.store);
        let query = move |last: &SequenceId, limit: usize| -> Result<(Vec<StagedEnvelope>, SequenceId)> {
            let rows = staging_store.staging().select_after(*last, limit);
            let next = rows.last().map_or(*last, |row| row.id);
            Ok((rows, next))
        };
        let options = PollingOptions::new(publisher.config.poll_interval(), publisher.config.page_size)
            .with_notifier(notifications);
        let updates = PollingSubscription::new(ctx.clone(), "staged", query, 0, options).start()?;

        let worker = Arc::clone(&publisher);
        let handle = thread::Builder::new()
            .name("publish-worker".into())
            .spawn(move || worker.run(updates))?;

        info!(node = publisher.signer.node_id(), "publish worker started");
        Ok(Self {
            publisher,
            notifier,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Wake the worker without waiting for its timer. Never blocks.
    pub fn notify_staged_publish(&self) {
        let _ = self.notifier.try_send(());
    }

    /// Highest staged id the worker is done with.
    pub fn last_processed(&self) -> SequenceId {
        self.publisher.last_processed.load(Ordering::SeqCst)
    }

    pub fn calculate_fees(
        &self,
        staged: &StagedEnvelope,
        retention_days: u32,
    ) -> Result<(PicoDollars, PicoDollars)> {
        self.publisher.calculate_fees(staged, retention_days)
    }

    /// One publish attempt. `false` means try again later.
    pub fn publish_staged(&self, staged: &StagedEnvelope) -> bool {
        self.publisher.publish_staged(staged)
    }

    /// Wait for the worker thread; call after cancelling the context.
    pub fn join(&self) {
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                error!("publish worker thread panicked");
            }
        }
    }
}

impl Publisher {
    fn run(&self, updates: Receiver<Vec<StagedEnvelope>>) {
        let done = self.ctx.done().clone();
        'outer: loop {
            let batch = select! {
                recv(done) -> _ => None,
                recv(updates) -> batch => batch.ok(),
            };
            let Some(batch) = batch else {
                break;
            };

            for staged in batch {
                info!(sequence = staged.id, "publishing envelope");
                while !self.publish_staged(&staged) {
                    if !self.ctx.sleep(self.config.retry_interval()) {
                        break 'outer;
                    }
                }
                self.last_processed.store(staged.id, Ordering::SeqCst);
            }
            self.maybe_compact();
        }
        debug!("publish worker stopped");
    }

    fn publish_staged(&self, staged: &StagedEnvelope) -> bool {
        let sequence = staged.id;
        let payer_envelope = match PayerEnvelope::from_bytes(&staged.payer_envelope) {
            Ok(env) => env,
            Err(e) => {
                // Retrying can't fix it; drop it so the queue keeps moving.
                error!(sequence, error = %e, "undecodable staged envelope; discarding");
                self.delete_staged(sequence);
                return true;
            }
        };
        let retention_days = payer_envelope.retention_days;

        // Reserved topics are produced by nodes themselves and are free.
        let reserved = staged.topic.is_reserved();
        let (base_fee, congestion_fee) = if reserved {
            (0, 0)
        } else {
            match self.calculate_fees(staged, retention_days) {
                Ok(fees) => fees,
                Err(e) => {
                    error!(sequence, error = %e, "failed to calculate fees");
                    return false;
                }
            }
        };

        let signed = match self.signer.sign_staged_envelope(
            staged,
            base_fee,
            congestion_fee,
            retention_days,
        ) {
            Ok(signed) => signed,
            Err(e) => {
                error!(sequence, error = %e, "failed to sign staged envelope");
                return false;
            }
        };
        let bytes = match signed.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(sequence, error = %e, "failed to encode originator envelope");
                return false;
            }
        };

        let node = self.signer.node_id();
        let mut row = NewEnvelope::new(node, sequence, staged.topic.clone(), bytes);
        row.insert_time = Some(staged.originator_time);
        row.expiry = signed.expiry;
        if !reserved {
            let payer = match self.store.find_or_create_payer(&payer_envelope.payer_address) {
                Ok(payer) => payer,
                Err(e) => {
                    error!(sequence, error = %e, "failed to find or create payer");
                    return false;
                }
            };
            row = row.with_payer(payer, signed.total_fee());
        }

        match self.store.insert_envelope(row) {
            Ok(0) => debug!(originator = node, sequence, "envelope already inserted"),
            Ok(_) => {}
            Err(e) => {
                if !self.ctx.is_done() {
                    error!(sequence, error = %e, "failed to insert envelope");
                }
                return false;
            }
        }

        // The envelope is durable; a failed delete only leaves an orphan.
        self.delete_staged(sequence);
        true
    }

    fn calculate_fees(
        &self,
        staged: &StagedEnvelope,
        retention_days: u32,
    ) -> Result<(PicoDollars, PicoDollars)> {
        let base_fee = self.fees.calculate_base_fee(
            staged.originator_time,
            staged.payer_envelope.len(),
            retention_days,
        )?;

        let node = self.signer.node_id();
        let recent = self.store.recent_congestion(
            node,
            staged.originator_time.minutes_since_epoch(),
            self.config.congestion_window_minutes,
        );
        let congestion_fee = self
            .fees
            .calculate_congestion_fee(staged.originator_time, node, recent)?;
        Ok((base_fee, congestion_fee))
    }

    fn delete_staged(&self, id: SequenceId) {
        match self.store.staging().delete(id) {
            Ok(0) => debug!(sequence = id, "staged envelope already deleted"),
            Ok(_) => {
                self.deletes_since_compaction.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => warn!(sequence = id, error = %e, "failed to delete staged envelope"),
        }
    }

    /// Delete staged rows whose envelope is already durable.
    fn cleanup_orphans(&self) -> Result<()> {
        let node = self.signer.node_id();
        let staging = self.store.staging();
        let mut removed = 0;
        for staged in staging.select_after(0, usize::MAX) {
            if self.store.get_envelope(node, staged.id)?.is_some() {
                removed += staging.delete(staged.id)?;
            }
        }
        if removed > 0 {
            info!(removed, "removed orphaned staged envelopes");
        }
        Ok(())
    }

    fn maybe_compact(&self) {
        if self.deletes_since_compaction.load(Ordering::SeqCst) < COMPACT_AFTER_DELETES {
            return;
        }
        match self.store.staging().compact() {
            Ok(()) => self.deletes_since_compaction.store(0, Ordering::SeqCst),
            Err(e) => warn!(error = %e, "failed to compact staging queue"),
        }
    }
}
