//! Payer registry and usage counters that ride along with inserts.
//!
//! Counters change only inside a store commit, together with the envelopes
//! they account for. Each change is appended to `usage.log` first and
//! applied in memory only once the append succeeded; a failed append is cut
//! back off the log. Compaction folds the log into a single snapshot entry.
//!
//! Congestion is only needed for the fee window, so minutes older than the
//! retention behind an originator's newest minute are dropped.

use crate::error::{Error, Result};
use crate::types::{NodeId, PayerId, PicoDollars, SequenceId};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Magic bytes for the usage log.
const LEDGER_MAGIC: &[u8; 4] = b"USG\0";

/// Current usage log format version.
const LEDGER_VERSION: u8 = 2;

const HEADER_SIZE: u64 = 5;

/// Upper bound on a single entry, to catch garbage lengths.
const MAX_ENTRY_SIZE: usize = 64 * 1024 * 1024;

/// Appended entries after which the log is folded into a snapshot.
const COMPACT_AFTER_ENTRIES: u64 = 4096;

/// Spend charged to a payer for one durable envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageIncrement {
    pub payer_id: PayerId,
    pub originator_id: NodeId,
    pub minutes_since_epoch: u32,
    pub spend: PicoDollars,
    pub sequence_id: SequenceId,
}

/// Aggregated unsettled usage of one payer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PayerUsage {
    pub total_spend: PicoDollars,
    pub message_count: u64,
    pub last_sequence_id: SequenceId,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
struct UsageCell {
    spend: PicoDollars,
    message_count: u64,
    last_sequence_id: SequenceId,
}

/// Tuple keys flattened into rows.
#[derive(Default, Serialize, Deserialize)]
struct LedgerSnapshot {
    next_payer: PayerId,
    payers: Vec<(String, PayerId)>,
    usage: Vec<(PayerId, NodeId, u32, UsageCell)>,
    congestion: Vec<(NodeId, u32, u64)>,
}

#[derive(Serialize, Deserialize)]
enum LedgerOp {
    Payer {
        address: String,
        id: PayerId,
    },
    Charge {
        usage: Vec<UsageIncrement>,
        congestion: Vec<(NodeId, u32)>,
    },
    Snapshot(LedgerSnapshot),
}

struct LedgerState {
    payers: HashMap<String, PayerId>,
    next_payer: PayerId,
    usage: HashMap<(PayerId, NodeId, u32), UsageCell>,
    congestion: HashMap<(NodeId, u32), u64>,
}

impl LedgerState {
    fn new() -> Self {
        Self {
            payers: HashMap::new(),
            next_payer: 1,
            usage: HashMap::new(),
            congestion: HashMap::new(),
        }
    }

    fn add_payer(&mut self, address: String, id: PayerId) {
        self.next_payer = self.next_payer.max(id + 1);
        self.payers.insert(address, id);
    }

    fn charge(&mut self, usage: &[UsageIncrement], congestion: &[(NodeId, u32)], retention: u32) {
        for inc in usage {
            let cell = self
                .usage
                .entry((inc.payer_id, inc.originator_id, inc.minutes_since_epoch))
                .or_default();
            cell.spend = cell.spend.saturating_add(inc.spend);
            cell.message_count += 1;
            cell.last_sequence_id = cell.last_sequence_id.max(inc.sequence_id);
        }

        let mut newest: HashMap<NodeId, u32> = HashMap::new();
        for &(originator, minute) in congestion {
            *self.congestion.entry((originator, minute)).or_insert(0) += 1;
            let slot = newest.entry(originator).or_insert(minute);
            *slot = (*slot).max(minute);
        }
        if newest.is_empty() {
            return;
        }
        // Keep the `retention` minutes ending at each touched originator's newest minute.
        let cutoffs: HashMap<NodeId, u32> = newest
            .into_iter()
            .map(|(o, m)| (o, m.saturating_sub(retention.saturating_sub(1))))
            .collect();
        self.congestion
            .retain(|(o, m), _| cutoffs.get(o).map_or(true, |&cutoff| *m >= cutoff));
    }

    fn apply(&mut self, op: LedgerOp, retention: u32) {
        match op {
            LedgerOp::Payer { address, id } => self.add_payer(address, id),
            LedgerOp::Charge { usage, congestion } => self.charge(&usage, &congestion, retention),
            LedgerOp::Snapshot(snapshot) => *self = Self::from_snapshot(snapshot),
        }
    }

    fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            next_payer: self.next_payer,
            payers: self.payers.iter().map(|(a, &id)| (a.clone(), id)).collect(),
            usage: self
                .usage
                .iter()
                .map(|(&(p, o, m), &cell)| (p, o, m, cell))
                .collect(),
            congestion: self
                .congestion
                .iter()
                .map(|(&(o, m), &count)| (o, m, count))
                .collect(),
        }
    }

    fn from_snapshot(snapshot: LedgerSnapshot) -> Self {
        Self {
            next_payer: snapshot.next_payer.max(1),
            payers: snapshot.payers.into_iter().collect(),
            usage: snapshot
                .usage
                .into_iter()
                .map(|(p, o, m, cell)| ((p, o, m), cell))
                .collect(),
            congestion: snapshot
                .congestion
                .into_iter()
                .map(|(o, m, count)| ((o, m), count))
                .collect(),
        }
    }
}

struct LedgerLog {
    file: File,
    /// Length of the log up to the last complete entry.
    len: u64,
    /// Entries appended since the last snapshot.
    entries: u64,
    /// A failed append may have left bytes past `len`.
    dirty: bool,
}

pub struct UsageLedger {
    path: PathBuf,
    congestion_retention: u32,
    sync: bool,
    /// Held across an append and the matching state change; taken before `state`.
    log: Mutex<LedgerLog>,
    state: RwLock<LedgerState>,
}

impl UsageLedger {
    /// Open or create the usage log at `path` and replay it.
    ///
    /// `congestion_retention` is in minutes; `sync` fsyncs every append.
    pub fn open(path: impl AsRef<Path>, congestion_retention: u32, sync: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let congestion_retention = congestion_retention.max(1);

        let (state, len, entries) = if path.exists() {
            Self::replay(&path, congestion_retention)?
        } else {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?;
            file.write_all(LEDGER_MAGIC)?;
            file.write_all(&[LEDGER_VERSION])?;
            file.sync_all()?;
            (LedgerState::new(), HEADER_SIZE, 0)
        };

        let file = OpenOptions::new().append(true).open(&path)?;
        debug!(
            path = %path.display(),
            payers = state.payers.len(),
            entries,
            "opened usage ledger"
        );

        Ok(Self {
            path,
            congestion_retention,
            sync,
            log: Mutex::new(LedgerLog {
                file,
                len,
                entries,
                dirty: false,
            }),
            state: RwLock::new(state),
        })
    }

    /// Id for `address`, assigning and persisting a new one if unknown.
    pub fn find_or_create_payer(&self, address: &str) -> Result<PayerId> {
        if address.is_empty() {
            return Err(Error::InvalidArgument("payer address is empty".into()));
        }
        if let Some(&id) = self.state.read().payers.get(address) {
            return Ok(id);
        }

        let mut log = self.log.lock();
        let id = {
            let state = self.state.read();
            if let Some(&id) = state.payers.get(address) {
                return Ok(id);
            }
            state.next_payer
        };
        self.append(
            &mut log,
            &LedgerOp::Payer {
                address: address.to_string(),
                id,
            },
        )?;
        self.state.write().add_payer(address.to_string(), id);
        Ok(id)
    }

    pub fn payer_id(&self, address: &str) -> Option<PayerId> {
        self.state.read().payers.get(address).copied()
    }

    /// Persist counters from a committing transaction, then apply them.
    ///
    /// On error nothing is applied and the log is left as it was.
    pub fn apply(&self, usage: &[UsageIncrement], congestion: &[(NodeId, u32)]) -> Result<()> {
        if usage.is_empty() && congestion.is_empty() {
            return Ok(());
        }

        let mut log = self.log.lock();
        self.append(
            &mut log,
            &LedgerOp::Charge {
                usage: usage.to_vec(),
                congestion: congestion.to_vec(),
            },
        )?;
        self.state
            .write()
            .charge(usage, congestion, self.congestion_retention);

        if log.entries >= COMPACT_AFTER_ENTRIES {
            // The charge is already durable; a failed compaction is retried next time.
            if let Err(e) = self.compact_locked(&mut log) {
                warn!(path = %self.path.display(), error = %e, "usage ledger compaction failed");
            }
        }
        Ok(())
    }

    /// Unsettled usage of `payer` summed over every originator and minute.
    pub fn payer_usage(&self, payer: PayerId) -> PayerUsage {
        let state = self.state.read();
        state
            .usage
            .iter()
            .filter(|((p, _, _), _)| *p == payer)
            .fold(PayerUsage::default(), |mut acc, (_, cell)| {
                acc.total_spend = acc.total_spend.saturating_add(cell.spend);
                acc.message_count += cell.message_count;
                acc.last_sequence_id = acc.last_sequence_id.max(cell.last_sequence_id);
                acc
            })
    }

    /// Envelopes accepted by `originator` during `minute`.
    pub fn originator_congestion(&self, originator: NodeId, minute: u32) -> u64 {
        self.state
            .read()
            .congestion
            .get(&(originator, minute))
            .copied()
            .unwrap_or(0)
    }

    /// Sum of congestion over the `window` minutes ending at `minute`, inclusive.
    pub fn recent_congestion(&self, originator: NodeId, minute: u32, window: u32) -> u64 {
        let state = self.state.read();
        let first = minute.saturating_sub(window.saturating_sub(1));
        (first..=minute)
            .filter_map(|m| state.congestion.get(&(originator, m)))
            .sum()
    }

    /// Rewrite the log as a single snapshot entry.
    pub fn compact(&self) -> Result<()> {
        let mut log = self.log.lock();
        self.compact_locked(&mut log)
    }

    fn compact_locked(&self, log: &mut LedgerLog) -> Result<()> {
        let entry = encode_entry(&LedgerOp::Snapshot(self.state.read().snapshot()))?;

        let tmp = self.path.with_extension("tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(LEDGER_MAGIC)?;
            file.write_all(&[LEDGER_VERSION])?;
            file.write_all(&entry)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        log.file = OpenOptions::new().append(true).open(&self.path)?;
        log.len = HEADER_SIZE + entry.len() as u64;
        log.entries = 0;
        log.dirty = false;
        debug!(path = %self.path.display(), bytes = log.len, "compacted usage ledger");
        Ok(())
    }

    fn append(&self, log: &mut LedgerLog, op: &LedgerOp) -> Result<()> {
        if log.dirty {
            log.file.set_len(log.len)?;
            log.dirty = false;
        }

        let entry = encode_entry(op)?;
        let sync = self.sync;
        let written = log
            .file
            .write_all(&entry)
            .and_then(|()| if sync { log.file.sync_data() } else { Ok(()) });
        if let Err(e) = written {
            if let Err(undo) = log.file.set_len(log.len) {
                warn!(path = %self.path.display(), error = %undo, "failed to undo usage append");
                log.dirty = true;
            }
            return Err(e.into());
        }

        log.len += entry.len() as u64;
        log.entries += 1;
        Ok(())
    }

    fn replay(path: &Path, retention: u32) -> Result<(LedgerState, u64, u64)> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut reader = BufReader::new(file.try_clone()?);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != LEDGER_MAGIC {
            return Err(Error::InvalidFormat("Invalid usage ledger magic".into()));
        }
        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != LEDGER_VERSION {
            return Err(Error::InvalidFormat(format!(
                "Unsupported usage ledger version: {}",
                version[0]
            )));
        }

        let mut state = LedgerState::new();
        let mut offset = HEADER_SIZE;
        let mut entries = 0;
        loop {
            match read_entry(&mut reader) {
                Ok(Some((op, len))) => {
                    offset += len;
                    entries += 1;
                    state.apply(op, retention);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(path = %path.display(), offset, error = %e, "truncating usage ledger tail");
                    file.set_len(offset)?;
                    file.sync_all()?;
                    break;
                }
            }
        }
        Ok((state, offset, entries))
    }

    /// Point appends at another file so tests can make them fail.
    #[cfg(test)]
    pub(crate) fn redirect_log(&self, file: File) {
        self.log.lock().file = file;
    }
}

fn encode_entry(op: &LedgerOp) -> Result<Vec<u8>> {
    let encoded = rmp_serde::to_vec(op)?;
    if encoded.len() > MAX_ENTRY_SIZE {
        return Err(Error::InvalidArgument(format!(
            "usage entry too large: {} bytes",
            encoded.len()
        )));
    }
    let mut entry = Vec::with_capacity(4 + encoded.len() + 4);
    entry.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
    entry.extend_from_slice(&encoded);
    entry.extend_from_slice(&crc32fast::hash(&encoded).to_le_bytes());
    Ok(entry)
}

/// `Ok(None)` at a clean end of file.
fn read_entry(reader: &mut BufReader<File>) -> Result<Option<(LedgerOp, u64)>> {
    if reader.fill_buf()?.is_empty() {
        return Ok(None);
    }
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_ENTRY_SIZE {
        return Err(Error::Corruption("usage entry too large".into()));
    }

    let mut encoded = vec![0u8; len];
    reader.read_exact(&mut encoded)?;

    let mut checksum_bytes = [0u8; 4];
    reader.read_exact(&mut checksum_bytes)?;
    let expected = u32::from_le_bytes(checksum_bytes);
    let actual = crc32fast::hash(&encoded);
    if expected != actual {
        return Err(Error::ChecksumMismatch { expected, actual });
    }

    let op = rmp_serde::from_slice(&encoded)?;
    Ok(Some((op, (4 + len + 4) as u64)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn inc(spend: PicoDollars, sequence_id: SequenceId, minute: u32) -> UsageIncrement {
        UsageIncrement {
            payer_id: 1,
            originator_id: 100,
            minutes_since_epoch: minute,
            spend,
            sequence_id,
        }
    }

    #[test]
    fn test_payer_ids_are_stable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("usage.log");

        let ledger = UsageLedger::open(&path, 60, false).unwrap();
        let alice = ledger.find_or_create_payer("0xalice").unwrap();
        let bob = ledger.find_or_create_payer("0xbob").unwrap();
        assert_ne!(alice, bob);
        assert_eq!(ledger.find_or_create_payer("0xalice").unwrap(), alice);
        assert!(ledger.find_or_create_payer("").is_err());
        drop(ledger);

        let reopened = UsageLedger::open(&path, 60, false).unwrap();
        assert_eq!(reopened.payer_id("0xbob"), Some(bob));
        let carol = reopened.find_or_create_payer("0xcarol").unwrap();
        assert!(carol > bob);
    }

    #[test]
    fn test_usage_and_congestion_accumulate() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("usage.log");
        let ledger = UsageLedger::open(&path, 60, true).unwrap();

        ledger
            .apply(&[inc(10, 1, 5), inc(15, 2, 5), inc(5, 3, 6)], &[(100, 5), (100, 5), (100, 6)])
            .unwrap();

        let usage = ledger.payer_usage(1);
        assert_eq!(usage.total_spend, 30);
        assert_eq!(usage.message_count, 3);
        assert_eq!(usage.last_sequence_id, 3);
        assert_eq!(ledger.originator_congestion(100, 5), 2);
        assert_eq!(ledger.recent_congestion(100, 6, 2), 3);
        assert_eq!(ledger.recent_congestion(100, 6, 1), 1);
        drop(ledger);

        let reopened = UsageLedger::open(&path, 60, false).unwrap();
        assert_eq!(reopened.payer_usage(1).total_spend, 30);
        assert_eq!(reopened.originator_congestion(100, 6), 1);
    }

    #[test]
    fn test_old_congestion_minutes_are_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("usage.log");
        let ledger = UsageLedger::open(&path, 10, false).unwrap();

        ledger.apply(&[], &[(100, 5), (200, 5)]).unwrap();
        ledger.apply(&[], &[(100, 20)]).unwrap();

        // Minute 5 is outside the 10 minutes ending at 20 for originator 100 only.
        assert_eq!(ledger.originator_congestion(100, 5), 0);
        assert_eq!(ledger.originator_congestion(100, 20), 1);
        assert_eq!(ledger.originator_congestion(200, 5), 1);

        // Minutes 11..=20 are still inside the window.
        ledger.apply(&[], &[(100, 11)]).unwrap();
        assert_eq!(ledger.recent_congestion(100, 20, 10), 2);
        drop(ledger);

        let reopened = UsageLedger::open(&path, 10, false).unwrap();
        assert_eq!(reopened.originator_congestion(100, 5), 0);
        assert_eq!(reopened.recent_congestion(100, 20, 10), 2);
        assert_eq!(reopened.originator_congestion(200, 5), 1);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_failed_append_charges_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("usage.log");
        let ledger = UsageLedger::open(&path, 60, false).unwrap();
        ledger.apply(&[inc(10, 1, 5)], &[(100, 5)]).unwrap();

        ledger.redirect_log(OpenOptions::new().write(true).open("/dev/full").unwrap());
        for _ in 0..3 {
            assert!(ledger.apply(&[inc(40, 2, 5)], &[(100, 5)]).is_err());
        }
        assert!(ledger.find_or_create_payer("0xnew").is_err());
        assert_eq!(ledger.payer_id("0xnew"), None);
        assert_eq!(ledger.payer_usage(1).total_spend, 10);
        assert_eq!(ledger.originator_congestion(100, 5), 1);

        ledger.redirect_log(OpenOptions::new().append(true).open(&path).unwrap());
        ledger.apply(&[inc(40, 2, 5)], &[(100, 5)]).unwrap();
        assert_eq!(ledger.payer_usage(1).total_spend, 50);
        drop(ledger);

        let reopened = UsageLedger::open(&path, 60, false).unwrap();
        let usage = reopened.payer_usage(1);
        assert_eq!(usage.total_spend, 50);
        assert_eq!(usage.message_count, 2);
        assert_eq!(reopened.originator_congestion(100, 5), 2);
    }

    #[test]
    fn test_compact_preserves_counters() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("usage.log");
        let ledger = UsageLedger::open(&path, 60, false).unwrap();
        let payer = ledger.find_or_create_payer("0xalice").unwrap();
        for seq in 1..=20 {
            ledger.apply(&[inc(2, seq, 7)], &[(100, 7)]).unwrap();
        }
        let before = fs::metadata(&path).unwrap().len();
        ledger.compact().unwrap();
        assert!(fs::metadata(&path).unwrap().len() < before);

        ledger.apply(&[inc(2, 21, 7)], &[(100, 7)]).unwrap();
        drop(ledger);

        let reopened = UsageLedger::open(&path, 60, false).unwrap();
        assert_eq!(reopened.payer_id("0xalice"), Some(payer));
        let usage = reopened.payer_usage(1);
        assert_eq!(usage.total_spend, 42);
        assert_eq!(usage.last_sequence_id, 21);
        assert_eq!(reopened.originator_congestion(100, 7), 21);
    }

    #[test]
    fn test_torn_tail_is_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("usage.log");
        {
            let ledger = UsageLedger::open(&path, 60, false).unwrap();
            ledger.apply(&[inc(10, 1, 5)], &[]).unwrap();
            ledger.apply(&[inc(10, 2, 5)], &[]).unwrap();
        }
        let len = fs::metadata(&path).unwrap().len();
        OpenOptions::new().write(true).open(&path).unwrap().set_len(len - 3).unwrap();

        let reopened = UsageLedger::open(&path, 60, false).unwrap();
        assert_eq!(reopened.payer_usage(1).total_spend, 10);
        reopened.apply(&[inc(5, 3, 5)], &[]).unwrap();
        drop(reopened);

        let again = UsageLedger::open(&path, 60, false).unwrap();
        assert_eq!(again.payer_usage(1).total_spend, 15);
    }

    #[test]
    fn test_garbage_length_is_corruption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("usage.log");
        let mut bytes = LEDGER_MAGIC.to_vec();
        bytes.push(LEDGER_VERSION);
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        fs::write(&path, &bytes).unwrap();

        let mut reader = BufReader::new(File::open(&path).unwrap());
        reader.seek_relative(HEADER_SIZE as i64).unwrap();
        assert!(matches!(read_entry(&mut reader), Err(Error::Corruption(_))));

        // Opening treats it as a torn tail.
        let ledger = UsageLedger::open(&path, 60, false).unwrap();
        assert_eq!(ledger.payer_usage(1), PayerUsage::default());
        assert_eq!(fs::metadata(&path).unwrap().len(), HEADER_SIZE);
    }
}
