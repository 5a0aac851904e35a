//! Fixed-width sequence bands and their segment names.

use crate::error::{Error, Result};
use crate::types::{NodeId, SequenceId};
use std::fmt;

/// Default band width, in sequence IDs.
pub const DEFAULT_BAND_WIDTH: u64 = 1_000_000;

/// Half-open range `[start, end)` of one originator's sequence IDs.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionRange {
    pub start: SequenceId,
    pub end: SequenceId,
}

impl PartitionRange {
    pub fn new(start: SequenceId, end: SequenceId) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, sequence: SequenceId) -> bool {
        sequence >= self.start && sequence < self.end
    }

    pub fn width(&self) -> u64 {
        self.end - self.start
    }

    /// The band of `band_width` that holds `sequence`.
    pub fn covering(originator: NodeId, sequence: SequenceId, band_width: u64) -> Result<Self> {
        let start = band_start(sequence, band_width);
        let end = start
            .checked_add(band_width)
            .ok_or(Error::SequenceOverflow { originator, sequence })?;
        Ok(Self { start, end })
    }
}

impl fmt::Debug for PartitionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

pub fn band_start(sequence: SequenceId, band_width: u64) -> SequenceId {
    (sequence / band_width) * band_width
}

/// Start of the band after the one holding `sequence`.
pub fn next_band_start(
    originator: NodeId,
    sequence: SequenceId,
    band_width: u64,
) -> Result<SequenceId> {
    band_start(sequence, band_width)
        .checked_add(band_width)
        .ok_or(Error::SequenceOverflow { originator, sequence })
}

/// How full the band holding `sequence` is, in `[0, 1)`.
pub fn fill_ratio(sequence: SequenceId, band_width: u64) -> f64 {
    (sequence % band_width) as f64 / band_width as f64
}

/// File name of the segment backing a partition, without extension.
pub fn segment_name(originator: NodeId, range: PartitionRange) -> String {
    format!("o{}_s{}_{}", originator, range.start, range.end)
}

/// Inverse of [`segment_name`]. Accepts an optional `.seg` extension.
pub fn parse_segment_name(name: &str) -> Option<(NodeId, PartitionRange)> {
    let name = name.strip_suffix(".seg").unwrap_or(name);
    let rest = name.strip_prefix('o')?;
    let (originator, rest) = rest.split_once("_s")?;
    let (start, end) = rest.split_once('_')?;

    let originator = originator.parse().ok()?;
    let start: u64 = start.parse().ok()?;
    let end: u64 = end.parse().ok()?;
    if start >= end {
        return None;
    }
    Some((originator, PartitionRange { start, end }))
}

/// Check that an originator's partitions form a gap-free ascending chain from zero.
pub fn validate_chain(originator: NodeId, ranges: &[PartitionRange]) -> Result<()> {
    let mut sorted = ranges.to_vec();
    sorted.sort();

    let mut expected = 0;
    for range in sorted {
        if range.start >= range.end {
            return Err(Error::Corruption(format!(
                "partition {:?} of originator {} is empty",
                range, originator
            )));
        }
        if range.start < expected {
            return Err(Error::Corruption(format!(
                "partition {:?} of originator {} overlaps its predecessor ending at {}",
                range, originator, expected
            )));
        }
        if range.start > expected {
            return Err(Error::Corruption(format!(
                "gap in partitions of originator {}: [{}, {}) is unallocated",
                originator, expected, range.start
            )));
        }
        expected = range.end;
    }
    Ok(())
}
