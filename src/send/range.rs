//! Byte ranges of an artifact and their merging.
//!
//! Every outbound message covers one half-open range `[start, end)` of the
//! source artifact. When a batch ends with both successes and failures,
//! abutting ranges of each outcome are merged so the artifact is split into
//! as few children as possible.
//!
//! ```text
//! success: [0,10) [10,20)        [30,40)
//! failure:                [20,30)
//!
//! merged:  [0,20)x2 [30,40)x1 | [20,30)x1
//! ```

use std::fmt;

use serde::Serialize;

/// Half-open byte interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Create a range. `start` must not exceed `end`.
    #[inline]
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end, "inverted range [{}, {})", start, end);
        Self { start, end }
    }

    /// Number of bytes covered.
    #[inline]
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Check if the range covers no bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// A run of abutting ranges collapsed into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergedRange {
    pub range: ByteRange,
    /// How many original messages the run covers.
    pub message_count: usize,
}

/// Sort `ranges` by start and merge every run where one range ends exactly
/// where the next begins.
pub fn merge_ranges(ranges: &[ByteRange]) -> Vec<MergedRange> {
    let mut sorted = ranges.to_vec();
    sorted.sort_unstable();

    let mut merged: Vec<MergedRange> = Vec::new();
    for range in sorted {
        match merged.last_mut() {
            Some(current) if current.range.end == range.start => {
                current.range.end = range.end;
                current.message_count += 1;
            }
            _ => merged.push(MergedRange {
                range,
                message_count: 1,
            }),
        }
    }
    merged
}
