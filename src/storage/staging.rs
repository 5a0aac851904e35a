//! Durable queue of payer envelopes awaiting publication.
//!
//! Staged rows are appended to `staged.log` before the publish worker
//! sequences them; deletion appends a tombstone. The id assigned here is
//! the sequence ID the envelope is later published under, so ids must
//! grow across restarts even after every row has been deleted.

use crate::error::{Error, Result};
use crate::types::{SequenceId, StagedEnvelope, Timestamp, Topic};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Magic bytes for the staging log.
const STAGING_MAGIC: &[u8; 4] = b"STG\0";

/// Current staging log format version.
const STAGING_VERSION: u8 = 1;

const HEADER_SIZE: u64 = 5;

/// Upper bound on a single entry, to catch garbage lengths.
const MAX_ENTRY_SIZE: usize = 64 * 1024 * 1024;

#[derive(Clone, Debug, Serialize, Deserialize)]
enum StagingOp {
    Staged(StagedEnvelope),
    Deleted { id: SequenceId },
    /// Written by compaction so ids keep growing once old rows are gone.
    Watermark { next_id: SequenceId },
}

struct StagingState {
    next_id: SequenceId,
    pending: BTreeMap<SequenceId, StagedEnvelope>,
    writer: BufWriter<File>,
}

/// The staging buffer in front of the publish worker.
pub struct StagingQueue {
    path: PathBuf,
    state: Mutex<StagingState>,
}

impl StagingQueue {
    /// Open or create the staging log and replay it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let (next_id, pending) = if path.exists() {
            Self::replay(&path)?
        } else {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?;
            file.write_all(STAGING_MAGIC)?;
            file.write_all(&[STAGING_VERSION])?;
            file.sync_all()?;
            (1, BTreeMap::new())
        };

        let writer = BufWriter::new(OpenOptions::new().append(true).open(&path)?);
        debug!(path = %path.display(), next_id, pending = pending.len(), "opened staging queue");

        Ok(Self {
            path,
            state: Mutex::new(StagingState {
                next_id,
                pending,
                writer,
            }),
        })
    }

    /// Durably stage a payer envelope, assigning it the next id.
    pub fn insert(&self, topic: Topic, payer_envelope: Vec<u8>) -> Result<StagedEnvelope> {
        let mut state = self.state.lock();
        let staged = StagedEnvelope {
            id: state.next_id,
            originator_time: Timestamp::now(),
            topic,
            payer_envelope,
        };

        Self::write_entry(&mut state.writer, &StagingOp::Staged(staged.clone()))?;
        state.writer.flush()?;
        state.writer.get_ref().sync_all()?;

        state.next_id += 1;
        state.pending.insert(staged.id, staged.clone());
        Ok(staged)
    }

    /// Up to `limit` staged rows with id greater than `last_id`, in id order.
    pub fn select_after(&self, last_id: SequenceId, limit: usize) -> Vec<StagedEnvelope> {
        let state = self.state.lock();
        state
            .pending
            .range((Bound::Excluded(last_id), Bound::Unbounded))
            .take(limit)
            .map(|(_, staged)| staged.clone())
            .collect()
    }

    pub fn get(&self, id: SequenceId) -> Option<StagedEnvelope> {
        self.state.lock().pending.get(&id).cloned()
    }

    /// Delete a staged row. Returns the number of rows removed (0 or 1).
    pub fn delete(&self, id: SequenceId) -> Result<u64> {
        let mut state = self.state.lock();
        if !state.pending.contains_key(&id) {
            return Ok(0);
        }
        Self::write_entry(&mut state.writer, &StagingOp::Deleted { id })?;
        state.writer.flush()?;
        state.pending.remove(&id);
        Ok(1)
    }

    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Id the next staged row will get.
    pub fn next_id(&self) -> SequenceId {
        self.state.lock().next_id
    }

    /// Rewrite the log with only the pending rows and a watermark.
    pub fn compact(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.writer.flush()?;

        let tmp = self.path.with_extension("tmp");
        {
            let mut writer = BufWriter::new(
                OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&tmp)?,
            );
            writer.write_all(STAGING_MAGIC)?;
            writer.write_all(&[STAGING_VERSION])?;
            Self::write_entry(
                &mut writer,
                &StagingOp::Watermark {
                    next_id: state.next_id,
                },
            )?;
            for staged in state.pending.values() {
                Self::write_entry(&mut writer, &StagingOp::Staged(staged.clone()))?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        state.writer = BufWriter::new(OpenOptions::new().append(true).open(&self.path)?);
        debug!(pending = state.pending.len(), next_id = state.next_id, "compacted staging queue");
        Ok(())
    }

    fn replay(path: &Path) -> Result<(SequenceId, BTreeMap<SequenceId, StagedEnvelope>)> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut reader = BufReader::new(file.try_clone()?);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != STAGING_MAGIC {
            return Err(Error::InvalidFormat("Invalid staging log magic".into()));
        }
        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != STAGING_VERSION {
            return Err(Error::InvalidFormat(format!(
                "Unsupported staging log version: {}",
                version[0]
            )));
        }

        let mut next_id = 1;
        let mut pending = BTreeMap::new();
        let mut offset = HEADER_SIZE;
        loop {
            match Self::read_entry(&mut reader) {
                Ok(Some((op, len))) => {
                    offset += len;
                    match op {
                        StagingOp::Staged(staged) => {
                            next_id = next_id.max(staged.id + 1);
                            pending.insert(staged.id, staged);
                        }
                        StagingOp::Deleted { id } => {
                            next_id = next_id.max(id + 1);
                            pending.remove(&id);
                        }
                        StagingOp::Watermark { next_id: mark } => {
                            next_id = next_id.max(mark);
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    // Only the tail can be torn; anything after it is unreadable anyway.
                    warn!(path = %path.display(), offset, error = %e, "truncating staging log tail");
                    file.set_len(offset)?;
                    file.sync_all()?;
                    break;
                }
            }
        }

        Ok((next_id, pending))
    }

    fn write_entry(writer: &mut BufWriter<File>, op: &StagingOp) -> Result<()> {
        let encoded = rmp_serde::to_vec(op)?;

        writer.write_all(&(encoded.len() as u32).to_le_bytes())?;
        writer.write_all(&encoded)?;
        writer.write_all(&crc32fast::hash(&encoded).to_le_bytes())?;
        Ok(())
    }

    /// `Ok(None)` at a clean end of file.
    fn read_entry(reader: &mut BufReader<File>) -> Result<Option<(StagingOp, u64)>> {
        if reader.fill_buf()?.is_empty() {
            return Ok(None);
        }
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_ENTRY_SIZE {
            return Err(Error::Corruption("staging entry too large".into()));
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
}
