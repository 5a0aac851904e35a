//! Append-only segment file backing one partition.
//!
//! Layout: a header (`SEG\0`, version, originator, band start, band end)
//! followed by envelope records. Each record is a fixed little-endian
//! header, the topic, the payload, and a CRC32 over all of it.

use super::partition::{segment_name, PartitionRange};
use crate::error::{Error, Result};
use crate::types::{Envelope, NodeId, Timestamp, Topic};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// Magic bytes for segment files.
const SEGMENT_MAGIC: &[u8; 4] = b"SEG\0";

/// Magic bytes for each envelope record.
const RECORD_MAGIC: &[u8; 4] = b"ENV\0";

/// Current format version.
const SEGMENT_VERSION: u8 = 1;

/// magic + version + originator + start + end
const SEGMENT_HEADER_SIZE: u64 = 4 + 1 + 4 + 8 + 8;

/// magic + version + flags + originator + sequence + insert time + expiry + payer + topic len + payload len
const RECORD_HEADER_SIZE: usize = 4 + 1 + 1 + 4 + 8 + 8 + 8 + 4 + 2 + 4;

/// Upper bound on a record's topic plus payload, to catch garbage lengths.
const MAX_RECORD_BODY: usize = 64 * 1024 * 1024;

const FLAG_EXPIRY: u8 = 0b01;
const FLAG_PAYER: u8 = 0b10;

/// One partition's envelopes on disk.
pub struct Segment {
    path: PathBuf,
    originator: NodeId,
    range: PartitionRange,
    file: Mutex<File>,
    size: AtomicU64,
}

impl Segment {
    /// Create the segment file, or open it if it already exists.
    pub fn create(dir: impl AsRef<Path>, originator: NodeId, range: PartitionRange) -> Result<Self> {
        let path = dir
            .as_ref()
            .join(format!("{}.seg", segment_name(originator, range)));

        let mut file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let (segment, _) = Self::open(&path)?;
                return Ok(segment);
            }
            Err(e) => return Err(e.into()),
        };

        file.write_all(SEGMENT_MAGIC)?;
        file.write_all(&[SEGMENT_VERSION])?;
        file.write_all(&originator.to_le_bytes())?;
        file.write_all(&range.start.to_le_bytes())?;
        file.write_all(&range.end.to_le_bytes())?;
        file.sync_all()?;

        Ok(Self {
            path,
            originator,
            range,
            file: Mutex::new(file),
            size: AtomicU64::new(SEGMENT_HEADER_SIZE),
        })
    }

    /// Open an existing segment and replay its records.
    ///
    /// A torn record at the tail (from a crash mid-append) is truncated away.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Vec<(u64, Envelope)>)> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let file_size = file.metadata()?.len();

        let mut reader = BufReader::new(file.try_clone()?);
        let (originator, range) = read_header(&mut reader)?;

        let mut records = Vec::new();
        let mut offset = SEGMENT_HEADER_SIZE;
        loop {
            match read_record(&mut reader) {
                Ok(Some((envelope, len))) => {
                    if envelope.originator_id != originator || !range.contains(envelope.sequence_id) {
                        return Err(Error::Corruption(format!(
                            "envelope {}:{} does not belong in segment {}",
                            envelope.originator_id,
                            envelope.sequence_id,
                            path.display()
                        )));
                    }
                    records.push((offset, envelope));
                    offset += len;
                }
                Ok(None) => break,
                Err(Error::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                    warn!(
                        segment = %path.display(),
                        offset,
                        dropped = file_size - offset,
                        "truncating torn record at segment tail"
                    );
                    file.set_len(offset)?;
                    file.sync_all()?;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        Ok((
            Self {
                path,
                originator,
                range,
                file: Mutex::new(file),
                size: AtomicU64::new(offset),
            },
            records,
        ))
    }

    pub fn originator(&self) -> NodeId {
        self.originator
    }

    pub fn range(&self) -> PartitionRange {
        self.range
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    /// Append an envelope, returning the offset it was written at.
    ///
    /// Not synced; call [`Segment::sync`] to make it durable.
    pub fn append(&self, envelope: &Envelope) -> Result<u64> {
        if envelope.originator_id != self.originator || !self.range.contains(envelope.sequence_id) {
            return Err(Error::MissingPartition {
                originator: envelope.originator_id,
                sequence: envelope.sequence_id,
            });
        }

        let buf = encode_record(envelope)?;
        let mut file = self.file.lock();
        let offset = self.size.load(Ordering::SeqCst);
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&buf)?;
        self.size.store(offset + buf.len() as u64, Ordering::SeqCst);
        Ok(offset)
    }

    pub fn read_at(&self, offset: u64) -> Result<Envelope> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        match read_record(&mut *file)? {
            Some((envelope, _)) => Ok(envelope),
            None => Err(Error::Corruption(format!(
                "no record at offset {} of {}",
                offset,
                self.path.display()
            ))),
        }
    }

    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_data()?;
        Ok(())
    }

    /// Drop everything past `len`; undoes appends of a failed commit.
    pub fn truncate(&self, len: u64) -> Result<()> {
        let file = self.file.lock();
        if len < SEGMENT_HEADER_SIZE || len > self.size() {
            return Err(Error::InvalidArgument(format!(
                "cannot truncate segment of {} bytes to {}",
                self.size(),
                len
            )));
        }
        file.set_len(len)?;
        self.size.store(len, Ordering::SeqCst);
        Ok(())
    }
}

fn read_header(reader: &mut impl Read) -> Result<(NodeId, PartitionRange)> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != SEGMENT_MAGIC {
        return Err(Error::InvalidFormat("Invalid segment magic".into()));
    }

    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    if version[0] != SEGMENT_VERSION {
        return Err(Error::InvalidFormat(format!(
            "Unsupported segment version: {}",
            version[0]
        )));
    }

    let mut u32_buf = [0u8; 4];
    let mut u64_buf = [0u8; 8];
    reader.read_exact(&mut u32_buf)?;
    let originator = u32::from_le_bytes(u32_buf);
    reader.read_exact(&mut u64_buf)?;
    let start = u64::from_le_bytes(u64_buf);
    reader.read_exact(&mut u64_buf)?;
    let end = u64::from_le_bytes(u64_buf);

    Ok((originator, PartitionRange::new(start, end)))
}

fn encode_record(envelope: &Envelope) -> Result<Vec<u8>> {
    let topic = envelope.topic.as_bytes();
    let topic_len = u16::try_from(topic.len())
        .map_err(|_| Error::InvalidArgument(format!("topic too long: {} bytes", topic.len())))?;
    if topic.len() + envelope.payload.len() > MAX_RECORD_BODY {
        return Err(Error::InvalidArgument(format!(
            "payload too long: {} bytes",
            envelope.payload.len()
        )));
    }
    let payload_len = envelope.payload.len() as u32;

    let mut flags = 0u8;
    if envelope.expiry.is_some() {
        flags |= FLAG_EXPIRY;
    }
    if envelope.payer_id.is_some() {
        flags |= FLAG_PAYER;
    }

    let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + topic.len() + envelope.payload.len() + 4);
    buf.extend_from_slice(RECORD_MAGIC);
    buf.push(SEGMENT_VERSION);
    buf.push(flags);
    buf.extend_from_slice(&envelope.originator_id.to_le_bytes());
    buf.extend_from_slice(&envelope.sequence_id.to_le_bytes());
    buf.extend_from_slice(&envelope.insert_time.0.to_le_bytes());
    buf.extend_from_slice(&envelope.expiry.unwrap_or(0).to_le_bytes());
    buf.extend_from_slice(&envelope.payer_id.unwrap_or(0).to_le_bytes());
    buf.extend_from_slice(&topic_len.to_le_bytes());
    buf.extend_from_slice(&payload_len.to_le_bytes());
    buf.extend_from_slice(topic);
    buf.extend_from_slice(&envelope.payload);

    let checksum = crc32fast::hash(&buf);
    buf.extend_from_slice(&checksum.to_le_bytes());
    Ok(buf)
}

/// Read one record. `Ok(None)` at a clean end of file.
///
/// A record cut short yields an `UnexpectedEof` IO error.
fn read_record(reader: &mut impl Read) -> Result<Option<(Envelope, u64)>> {
    let mut header = [0u8; RECORD_HEADER_SIZE];
    let first = loop {
        match reader.read(&mut header[..1]) {
            Ok(n) => break n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    };
    if first == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut header[1..])?;

    if &header[0..4] != RECORD_MAGIC {
        return Err(Error::Corruption("Invalid record magic".into()));
    }
    if header[4] != SEGMENT_VERSION {
        return Err(Error::InvalidFormat(format!(
            "Unsupported record version: {}",
            header[4]
        )));
    }
    let flags = header[5];
    let originator_id = u32::from_le_bytes(le_array(&header[6..10]));
    let sequence_id = u64::from_le_bytes(le_array(&header[10..18]));
    let insert_time = i64::from_le_bytes(le_array(&header[18..26]));
    let expiry = i64::from_le_bytes(le_array(&header[26..34]));
    let payer_id = u32::from_le_bytes(le_array(&header[34..38]));
    let topic_len = u16::from_le_bytes(le_array(&header[38..40])) as usize;
    let payload_len = u32::from_le_bytes(le_array(&header[40..44])) as usize;
    if topic_len + payload_len > MAX_RECORD_BODY {
        return Err(Error::Corruption(format!(
            "record body of {} bytes exceeds limit",
            topic_len + payload_len
        )));
    }

    let mut body = vec![0u8; topic_len + payload_len];
    reader.read_exact(&mut body)?;

    let mut checksum_bytes = [0u8; 4];
    reader.read_exact(&mut checksum_bytes)?;
    let expected = u32::from_le_bytes(checksum_bytes);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header);
    hasher.update(&body);
    let actual = hasher.finalize();
    if expected != actual {
        return Err(Error::ChecksumMismatch { expected, actual });
    }

    let payload = body.split_off(topic_len);
    let envelope = Envelope {
        originator_id,
        sequence_id,
        topic: Topic(body),
        payload,
        insert_time: Timestamp(insert_time),
        expiry: (flags & FLAG_EXPIRY != 0).then_some(expiry),
        payer_id: (flags & FLAG_PAYER != 0).then_some(payer_id),
    };
    let len = (RECORD_HEADER_SIZE + topic_len + payload_len + 4) as u64;
    Ok(Some((envelope, len)))
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("originator", &self.originator)
            .field("range", &self.range)
            .field("size", &self.size())
            .finish()
    }
}
