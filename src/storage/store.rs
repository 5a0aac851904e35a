//! The envelope store: partitioned segments behind one transaction boundary.
//!
//! ```text
//! <path>/MANIFEST                      magic, version, band width
//! <path>/LOCK                          exclusive process lock
//! <path>/partitions/o{O}_s{S}_{E}.seg  one segment per (originator, band)
//! <path>/staged.log                    staging queue
//! <path>/usage.log                     payer and congestion counters
//! ```
//!
//! Writers go through [`EnvelopeStore::run_in_tx`]; the closure stages
//! inserts and counter increments, and the commit applies them under the
//! store write lock. Readers only see committed envelopes.

use super::index::{EnvelopeIndex, IndexEntry};
use super::partition::{self, PartitionRange};
use super::segment::Segment;
use super::staging::StagingQueue;
use super::usage::{PayerUsage, UsageIncrement, UsageLedger};
use crate::config::StoreConfig;
use crate::cursor::{EnvelopesQuery, TopicCursors, VectorClock};
use crate::error::{Error, Result};
use crate::types::{Envelope, NewEnvelope, NodeId, PayerId, SequenceId, Timestamp};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use fs2::FileExt;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Magic bytes for store manifest.
const STORE_MAGIC: &[u8; 4] = b"CRR\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

/// Counts for monitoring and tests.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub envelopes: usize,
    pub originators: usize,
    pub partitions: usize,
    pub topics: usize,
    pub staged: usize,
}

type SegmentMap = HashMap<NodeId, BTreeMap<SequenceId, Arc<Segment>>>;

/// Durable, partitioned log of envelopes keyed by (originator, sequence).
pub struct EnvelopeStore {
    config: StoreConfig,

    /// Band width recorded in the manifest; wins over the config on open.
    band_width: u64,

    /// Lock file for exclusive access.
    _lock_file: File,

    partitions_dir: PathBuf,

    /// Segments per originator, keyed by band start.
    segments: RwLock<SegmentMap>,

    index: EnvelopeIndex,

    cache: Mutex<LruCache<(NodeId, SequenceId), Arc<Envelope>>>,

    usage: UsageLedger,

    staging: StagingQueue,

    /// Serializes commits.
    write_lock: Mutex<()>,

    /// Serializes partition creation.
    partition_lock: Mutex<()>,

    /// Signalled after every commit that stored envelopes.
    notifiers: Mutex<Vec<Sender<()>>>,
}

impl EnvelopeStore {
    /// Open an existing store or create a new one.
    pub fn open_or_create(config: StoreConfig) -> Result<Self> {
        if config.path.join("MANIFEST").exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(Error::NotInitialized)
        }
    }

    /// Create a new store.
    pub fn create(config: StoreConfig) -> Result<Self> {
        if config.band_width == 0 {
            return Err(Error::Config("band width must be positive".into()));
        }
        fs::create_dir_all(config.path.join("partitions"))?;
        let lock_file = Self::acquire_lock(&config.path)?;
        Self::write_manifest(&config.path, config.band_width)?;

        let band_width = config.band_width;
        info!(path = %config.path.display(), band_width, "created envelope store");
        Self::assemble(config, band_width, lock_file, SegmentMap::new(), EnvelopeIndex::new())
    }

    /// Open an existing store, replaying every segment into the index.
    pub fn open(config: StoreConfig) -> Result<Self> {
        let band_width = Self::verify_manifest(&config.path)?;
        if band_width != config.band_width {
            warn!(
                configured = config.band_width,
                stored = band_width,
                "band width is fixed at creation; using the stored value"
            );
        }
        let lock_file = Self::acquire_lock(&config.path)?;

        let partitions_dir = config.path.join("partitions");
        fs::create_dir_all(&partitions_dir)?;

        let index = EnvelopeIndex::new();
        let mut segments = SegmentMap::new();
        for entry in fs::read_dir(&partitions_dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if partition::parse_segment_name(name).is_none() {
                continue;
            }

            let (segment, records) = Segment::open(&path)?;
            let range = segment.range();
            for (offset, envelope) in &records {
                index.insert(
                    envelope,
                    IndexEntry {
                        partition_start: range.start,
                        offset: *offset,
                    },
                );
            }
            segments
                .entry(segment.originator())
                .or_default()
                .insert(range.start, Arc::new(segment));
        }

        for (&originator, by_start) in &segments {
            let ranges: Vec<_> = by_start.values().map(|s| s.range()).collect();
            partition::validate_chain(originator, &ranges)?;
        }

        info!(
            path = %config.path.display(),
            envelopes = index.len(),
            originators = segments.len(),
            "opened envelope store"
        );
        Self::assemble(config, band_width, lock_file, segments, index)
    }

    fn assemble(
        config: StoreConfig,
        band_width: u64,
        lock_file: File,
        segments: SegmentMap,
        index: EnvelopeIndex,
    ) -> Result<Self> {
        let cache_size = NonZeroUsize::new(config.envelope_cache_size.max(1))
            .unwrap_or(NonZeroUsize::MIN);
        let usage = UsageLedger::open(
            config.path.join("usage.log"),
            config.congestion_retention_minutes,
            config.sync_on_commit,
        )?;
        let staging = StagingQueue::open(config.path.join("staged.log"))?;

        Ok(Self {
            partitions_dir: config.path.join("partitions"),
            config,
            band_width,
            _lock_file: lock_file,
            segments: RwLock::new(segments),
            index,
            cache: Mutex::new(LruCache::new(cache_size)),
            usage,
            staging,
            write_lock: Mutex::new(()),
            partition_lock: Mutex::new(()),
            notifiers: Mutex::new(Vec::new()),
        })
    }

    pub fn band_width(&self) -> u64 {
        self.band_width
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn staging(&self) -> &StagingQueue {
        &self.staging
    }

    // --- Writes ---

    /// Run `f` in a transaction and commit what it staged if it returns `Ok`.
    ///
    /// Nothing staged by a failing closure becomes visible.
    pub fn run_in_tx<T>(&self, f: impl FnOnce(&mut Transaction<'_>) -> Result<T>) -> Result<T> {
        let _lock = self.write_lock.lock();
        let mut tx = Transaction::new(self);
        let value = f(&mut tx)?;
        self.commit(tx)?;
        Ok(value)
    }

    /// Insert one envelope. Returns 1, or 0 if `(originator, sequence)` already exists.
    ///
    /// A missing partition is created on the spot and the insert retried once.
    /// Rows with a payer also bump that payer's usage and the originator's
    /// congestion, in the same transaction and only if the row was inserted.
    pub fn insert_envelope(&self, row: NewEnvelope) -> Result<u64> {
        self.run_in_tx(|tx| {
            let inserted = tx.insert_envelope_with_checks(&row)?;
            if inserted > 0 {
                tx.record_usage(&row);
            }
            Ok(inserted)
        })
    }

    /// Insert many envelopes, possibly from several originators, atomically.
    ///
    /// Sequence IDs must be strictly ascending per originator within the
    /// batch. On a missing partition the batch is rolled back to a
    /// savepoint, partitions up to each originator's maximum are created,
    /// and the batch is retried once. Returns the number of rows inserted.
    pub fn insert_batch(&self, batch: &[NewEnvelope]) -> Result<u64> {
        let maxima = validate_batch(batch)?;

        self.run_in_tx(|tx| {
            let savepoint = tx.savepoint();
            match tx.insert_rows(batch) {
                Ok(inserted) => {
                    tx.release(savepoint);
                    Ok(inserted)
                }
                Err(Error::MissingPartition { originator, sequence }) => {
                    debug!(originator, sequence, "batch hit a missing partition; retrying");
                    tx.rollback_to(savepoint);
                    for (&originator, &max) in &maxima {
                        tx.ensure_partitions(originator, max)?;
                    }
                    tx.insert_rows(batch)
                }
                Err(e) => Err(e),
            }
        })
    }

    /// Make sure the band covering `sequence` and every band below it exist.
    ///
    /// Idempotent. Returns the partitions this call created.
    pub fn ensure_partitions(
        &self,
        originator: NodeId,
        sequence: SequenceId,
        band_width: u64,
    ) -> Result<Vec<PartitionRange>> {
        if band_width == 0 {
            return Err(Error::InvalidArgument("band width must be positive".into()));
        }
        let target = PartitionRange::covering(originator, sequence, band_width)?;

        let _guard = self.partition_lock.lock();
        let frontier = self.frontier(originator);
        if sequence < frontier {
            return Ok(Vec::new());
        }

        let mut created = Vec::new();
        let mut start = frontier;
        while start < target.end {
            let end = partition::next_band_start(originator, start, band_width)?;
            let range = PartitionRange::new(start, end);
            let segment = Segment::create(&self.partitions_dir, originator, range)?;
            self.segments
                .write()
                .entry(originator)
                .or_default()
                .insert(start, Arc::new(segment));
            info!(originator, start, end, "created partition");
            created.push(range);
            start = end;
        }
        Ok(created)
    }

    /// End of the highest partition of `originator`, 0 if it has none.
    fn frontier(&self, originator: NodeId) -> SequenceId {
        self.segments
            .read()
            .get(&originator)
            .and_then(|by_start| by_start.values().next_back())
            .map_or(0, |s| s.range().end)
    }

    fn segment_for(&self, originator: NodeId, sequence: SequenceId) -> Option<Arc<Segment>> {
        let segments = self.segments.read();
        let (_, segment) = segments.get(&originator)?.range(..=sequence).next_back()?;
        segment.range().contains(sequence).then(|| Arc::clone(segment))
    }

    fn commit(&self, tx: Transaction<'_>) -> Result<()> {
        let Transaction {
            envelopes,
            usage,
            congestion,
            ..
        } = tx;
        if envelopes.is_empty() && usage.is_empty() && congestion.is_empty() {
            return Ok(());
        }

        // Remember each touched segment's size so a failed commit can be undone.
        let mut touched: HashMap<(NodeId, SequenceId), (Arc<Segment>, u64)> = HashMap::new();
        let mut written = Vec::with_capacity(envelopes.len());
        let appended = (|| -> Result<()> {
            for envelope in envelopes {
                let segment = self
                    .segment_for(envelope.originator_id, envelope.sequence_id)
                    .ok_or(Error::MissingPartition {
                        originator: envelope.originator_id,
                        sequence: envelope.sequence_id,
                    })?;
                let range = segment.range();
                touched
                    .entry((envelope.originator_id, range.start))
                    .or_insert_with(|| (Arc::clone(&segment), segment.size()));
                let offset = segment.append(&envelope)?;
                written.push((
                    envelope,
                    IndexEntry {
                        partition_start: range.start,
                        offset,
                    },
                ));
            }
            if self.config.sync_on_commit {
                for (segment, _) in touched.values() {
                    segment.sync()?;
                }
            }
            self.usage.apply(&usage, &congestion)
        })();

        if let Err(e) = appended {
            for (segment, size) in touched.values() {
                if let Err(undo) = segment.truncate(*size) {
                    warn!(segment = %segment.path().display(), error = %undo, "failed to undo append");
                }
            }
            return Err(e);
        }

        let stored = written.len();
        {
            let mut cache = self.cache.lock();
            for (envelope, entry) in written {
                self.index.insert(&envelope, entry);
                cache.put(
                    (envelope.originator_id, envelope.sequence_id),
                    Arc::new(envelope),
                );
            }
        }

        if stored > 0 {
            self.notify_commit();
        }
        Ok(())
    }

    /// A channel that receives a (coalesced) signal after each commit.
    pub fn commit_notifier(&self) -> Receiver<()> {
        let (tx, rx) = bounded(1);
        self.notifiers.lock().push(tx);
        rx
    }

    fn notify_commit(&self) {
        self.notifiers
            .lock()
            .retain(|tx| !matches!(tx.try_send(()), Err(TrySendError::Disconnected(_))));
    }

    // --- Reads ---

    /// Highest stored sequence per originator.
    pub fn vector_clock(&self) -> VectorClock {
        self.index.vector_clock()
    }

    pub fn get_envelope(
        &self,
        originator: NodeId,
        sequence: SequenceId,
    ) -> Result<Option<Arc<Envelope>>> {
        match self.index.get(originator, sequence) {
            Some(entry) => self.load(originator, sequence, entry).map(Some),
            None => Ok(None),
        }
    }

    /// Up to `limit` envelopes of `originator` after `after`, ascending.
    pub fn select_by_originator(
        &self,
        originator: NodeId,
        after: SequenceId,
        limit: usize,
    ) -> Result<Vec<Arc<Envelope>>> {
        self.index
            .originator_after(originator, after, limit)
            .into_iter()
            .map(|(sequence, entry)| self.load(originator, sequence, entry))
            .collect()
    }

    /// Up to `limit` envelopes past `cursor`, ordered by (originator, sequence).
    pub fn select_unfiltered(&self, cursor: &VectorClock, limit: usize) -> Result<Vec<Arc<Envelope>>> {
        let keys = self.index.unfiltered_after(cursor, limit);
        self.load_keys(keys)
    }

    /// Envelopes past each topic's own cursor: at most `rows_per_entry` per
    /// topic and `limit` overall.
    pub fn select_by_topic_cursors(
        &self,
        cursors: &TopicCursors,
        rows_per_entry: usize,
        limit: usize,
    ) -> Result<Vec<Arc<Envelope>>> {
        let mut topics: Vec<_> = cursors.iter().collect();
        topics.sort_by(|a, b| a.0.cmp(b.0));

        let mut keys = Vec::new();
        for (topic, cursor) in topics {
            if keys.len() >= limit {
                break;
            }
            let budget = rows_per_entry.min(limit - keys.len());
            keys.extend(self.index.topic_after(topic, cursor, budget));
        }
        self.load_keys(keys)
    }

    /// Envelopes matching `query`, ordered by (originator, sequence).
    pub fn select_envelopes(&self, query: &EnvelopesQuery, limit: usize) -> Result<Vec<Arc<Envelope>>> {
        let cursor = query.last_seen.clone().unwrap_or_default();
        let keys = if !query.topics.is_empty() {
            let mut keys: Vec<_> = query
                .topics
                .iter()
                .collect::<HashSet<_>>()
                .into_iter()
                .flat_map(|topic| self.index.topic_after(topic, &cursor, limit))
                .collect();
            keys.sort_unstable();
            keys.dedup();
            keys.truncate(limit);
            keys
        } else if !query.originators.is_empty() {
            self.index.originators_after(&query.originators, &cursor, limit)
        } else {
            self.index.unfiltered_after(&cursor, limit)
        };
        self.load_keys(keys)
    }

    fn load_keys(&self, keys: Vec<(NodeId, SequenceId)>) -> Result<Vec<Arc<Envelope>>> {
        let mut envelopes = Vec::with_capacity(keys.len());
        for (originator, sequence) in keys {
            let entry = self.index.get(originator, sequence).ok_or_else(|| {
                Error::Corruption(format!("index lost {}:{}", originator, sequence))
            })?;
            envelopes.push(self.load(originator, sequence, entry)?);
        }
        Ok(envelopes)
    }

    fn load(&self, originator: NodeId, sequence: SequenceId, entry: IndexEntry) -> Result<Arc<Envelope>> {
        if let Some(envelope) = self.cache.lock().get(&(originator, sequence)) {
            return Ok(Arc::clone(envelope));
        }

        let segment = self
            .segments
            .read()
            .get(&originator)
            .and_then(|by_start| by_start.get(&entry.partition_start).cloned())
            .ok_or_else(|| {
                Error::Corruption(format!(
                    "segment {} of originator {} is gone",
                    entry.partition_start, originator
                ))
            })?;
        let envelope = Arc::new(segment.read_at(entry.offset)?);
        if envelope.originator_id != originator || envelope.sequence_id != sequence {
            return Err(Error::Corruption(format!(
                "expected {}:{} at offset {}, found {}:{}",
                originator, sequence, entry.offset, envelope.originator_id, envelope.sequence_id
            )));
        }

        self.cache
            .lock()
            .put((originator, sequence), Arc::clone(&envelope));
        Ok(envelope)
    }

    /// Partitions of `originator`, ascending.
    pub fn partitions_for(&self, originator: NodeId) -> Vec<PartitionRange> {
        self.segments
            .read()
            .get(&originator)
            .map(|by_start| by_start.values().map(|s| s.range()).collect())
            .unwrap_or_default()
    }

    pub fn partitions(&self) -> BTreeMap<NodeId, Vec<PartitionRange>> {
        self.segments
            .read()
            .iter()
            .map(|(&o, by_start)| (o, by_start.values().map(|s| s.range()).collect()))
            .collect()
    }

    pub fn stats(&self) -> StoreStats {
        let segments = self.segments.read();
        StoreStats {
            envelopes: self.index.len(),
            originators: segments.len(),
            partitions: segments.values().map(BTreeMap::len).sum(),
            topics: self.index.topic_count(),
            staged: self.staging.len(),
        }
    }

    // --- Payers and usage ---

    pub fn find_or_create_payer(&self, address: &str) -> Result<PayerId> {
        self.usage.find_or_create_payer(address)
    }

    pub fn payer_usage(&self, payer: PayerId) -> PayerUsage {
        self.usage.payer_usage(payer)
    }

    pub fn originator_congestion(&self, originator: NodeId, minute: u32) -> u64 {
        self.usage.originator_congestion(originator, minute)
    }

    pub fn recent_congestion(&self, originator: NodeId, minute: u32, window: u32) -> u64 {
        self.usage.recent_congestion(originator, minute, window)
    }

    /// Force sync all segments to disk.
    pub fn sync(&self) -> Result<()> {
        let _lock = self.write_lock.lock();
        for by_start in self.segments.read().values() {
            for segment in by_start.values() {
                segment.sync()?;
            }
        }
        Ok(())
    }

    fn write_manifest(path: &Path, band_width: u64) -> Result<()> {
        let mut file = File::create(path.join("MANIFEST"))?;
        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.write_all(&band_width.to_le_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    /// Returns the stored band width.
    fn verify_manifest(path: &Path) -> Result<u64> {
        let mut file = File::open(path.join("MANIFEST"))?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != STORE_MAGIC {
            return Err(Error::InvalidFormat("Invalid store magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != STORE_VERSION {
            return Err(Error::InvalidFormat(format!(
                "Unsupported store version: {}",
                version[0]
            )));
        }

        let mut band_width = [0u8; 8];
        file.read_exact(&mut band_width)?;
        match u64::from_le_bytes(band_width) {
            0 => Err(Error::InvalidFormat("band width of zero in manifest".into())),
            width => Ok(width),
        }
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;
        lock_file.try_lock_exclusive().map_err(|_| Error::Locked)?;
        Ok(lock_file)
    }
}

impl Drop for EnvelopeStore {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = self.sync();
    }
}

/// Check per-originator ordering and return each originator's highest sequence.
fn validate_batch(batch: &[NewEnvelope]) -> Result<HashMap<NodeId, SequenceId>> {
    if batch.is_empty() {
        return Err(Error::EmptyBatch);
    }
    let mut maxima: HashMap<NodeId, SequenceId> = HashMap::new();
    for row in batch {
        if let Some(&previous) = maxima.get(&row.originator_id) {
            if row.sequence_id <= previous {
                return Err(Error::NonAscendingBatch {
                    originator: row.originator_id,
                    previous,
                    sequence: row.sequence_id,
                });
            }
        }
        maxima.insert(row.originator_id, row.sequence_id);
    }
    Ok(maxima)
}

/// Marks a point a [`Transaction`] can roll back to.
#[derive(Clone, Copy, Debug)]
pub struct Savepoint {
    envelopes: usize,
    usage: usize,
    congestion: usize,
}

/// Writes staged for one commit. See [`EnvelopeStore::run_in_tx`].
pub struct Transaction<'a> {
    store: &'a EnvelopeStore,
    envelopes: Vec<Envelope>,
    keys: HashSet<(NodeId, SequenceId)>,
    usage: Vec<UsageIncrement>,
    congestion: Vec<(NodeId, u32)>,
    now: Timestamp,
}

impl<'a> Transaction<'a> {
    fn new(store: &'a EnvelopeStore) -> Self {
        Self {
            store,
            envelopes: Vec::new(),
            keys: HashSet::new(),
            usage: Vec::new(),
            congestion: Vec::new(),
            now: Timestamp::now(),
        }
    }

    pub fn savepoint(&self) -> Savepoint {
        Savepoint {
            envelopes: self.envelopes.len(),
            usage: self.usage.len(),
            congestion: self.congestion.len(),
        }
    }

    /// Discard everything staged after `savepoint`.
    pub fn rollback_to(&mut self, savepoint: Savepoint) {
        for envelope in self.envelopes.drain(savepoint.envelopes..) {
            self.keys.remove(&(envelope.originator_id, envelope.sequence_id));
        }
        self.usage.truncate(savepoint.usage);
        self.congestion.truncate(savepoint.congestion);
    }

    pub fn release(&mut self, _savepoint: Savepoint) {}

    /// Stage one envelope.
    ///
    /// Returns 0 for a duplicate of a stored or already staged envelope, and
    /// `MissingPartition` if no partition covers its sequence.
    pub fn insert_envelope(&mut self, row: &NewEnvelope) -> Result<u64> {
        if row.topic.len() > u16::MAX as usize {
            return Err(Error::InvalidArgument(format!(
                "topic of {} bytes is too long",
                row.topic.len()
            )));
        }

        let key = (row.originator_id, row.sequence_id);
        if self.keys.contains(&key) || self.store.index.contains(key.0, key.1) {
            return Ok(0);
        }
        if self.store.segment_for(key.0, key.1).is_none() {
            return Err(Error::MissingPartition {
                originator: key.0,
                sequence: key.1,
            });
        }

        self.keys.insert(key);
        self.envelopes.push(row.clone().into_envelope(self.now));
        Ok(1)
    }

    /// [`Transaction::insert_envelope`], creating a missing partition and
    /// retrying once.
    pub fn insert_envelope_with_checks(&mut self, row: &NewEnvelope) -> Result<u64> {
        let savepoint = self.savepoint();
        match self.insert_envelope(row) {
            Err(Error::MissingPartition { originator, sequence }) => {
                self.rollback_to(savepoint);
                self.ensure_partitions(originator, sequence)?;
                self.insert_envelope(row)
            }
            other => {
                self.release(savepoint);
                other
            }
        }
    }

    pub fn increment_unsettled_usage(&mut self, increment: UsageIncrement) {
        self.usage.push(increment);
    }

    pub fn increment_originator_congestion(&mut self, originator: NodeId, minute: u32) {
        self.congestion.push((originator, minute));
    }

    /// Partition creation is immediate and survives a rollback.
    pub fn ensure_partitions(&self, originator: NodeId, sequence: SequenceId) -> Result<()> {
        self.store
            .ensure_partitions(originator, sequence, self.store.band_width)
            .map(|_| ())
    }

    pub fn staged_envelopes(&self) -> usize {
        self.envelopes.len()
    }

    fn insert_rows(&mut self, rows: &[NewEnvelope]) -> Result<u64> {
        let mut inserted = 0;
        for row in rows {
            let n = self.insert_envelope(row)?;
            if n > 0 {
                self.record_usage(row);
            }
            inserted += n;
        }
        Ok(inserted)
    }

    /// Counters for a row that was just inserted; nothing without a payer.
    fn record_usage(&mut self, row: &NewEnvelope) {
        let Some(payer_id) = row.payer_id else {
            return;
        };
        let minute = row.insert_time.unwrap_or(self.now).minutes_since_epoch();
        self.increment_unsettled_usage(UsageIncrement {
            payer_id,
            originator_id: row.originator_id,
            minutes_since_epoch: minute,
            spend: row.spend,
            sequence_id: row.sequence_id,
        });
        self.increment_originator_congestion(row.originator_id, minute);
    }
}
