//! Chunk scheduling for streamed transfers.
//!
//! A `ChunkPlan` covers `[start, end)` with half-open ranges of `block_size`
//! bytes; the last range is clipped to `end`.

use crate::config::StreamConfig;
use std::ops::Range;

/// Ordered, restartable plan of byte ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    start: u64,
    end: u64,
    block_size: u64,
}

impl ChunkPlan {
    /// Plan `[start, end)`. A `start` at or past `end` yields no ranges.
    ///
    /// # Panics
    ///
    /// Panics if `block_size` is zero; `StreamConfig::validate` rejects that
    /// before a plan is ever built.
    pub fn new(start: u64, end: u64, block_size: u64) -> Self {
        assert!(block_size > 0, "block size must be non-zero");
        Self {
            start,
            end: end.max(start),
            block_size,
        }
    }

    /// Plan for `config`, resolving an unset end to `file_size`. An `end`
    /// past the file is clipped to its size.
    pub fn for_config(config: &StreamConfig, file_size: u64) -> Self {
        let end = config.end.map_or(file_size, |end| end.min(file_size));
        Self::new(config.start, end, config.block_size)
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    /// Total bytes covered
    pub fn total_bytes(&self) -> u64 {
        self.end - self.start
    }

    /// Number of ranges: `ceil((end - start) / block_size)`
    pub fn len(&self) -> u64 {
        self.total_bytes().div_ceil(self.block_size)
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn iter(&self) -> Chunks {
        Chunks {
            next: self.start,
            end: self.end,
            block_size: self.block_size,
        }
    }
}

impl IntoIterator for ChunkPlan {
    type Item = Range<u64>;
    type IntoIter = Chunks;

    fn into_iter(self) -> Chunks {
        self.iter()
    }
}

impl IntoIterator for &ChunkPlan {
    type Item = Range<u64>;
    type IntoIter = Chunks;

    fn into_iter(self) -> Chunks {
        self.iter()
    }
}

/// Lazy iterator over the ranges of a `ChunkPlan`.
#[derive(Debug, Clone)]
pub struct Chunks {
    next: u64,
    end: u64,
    block_size: u64,
}

impl Iterator for Chunks {
    type Item = Range<u64>;

    fn next(&mut self) -> Option<Range<u64>> {
        if self.next >= self.end {
            return None;
        }
        let start = self.next;
        let end = start.saturating_add(self.block_size).min(self.end);
        self.next = end;
        Some(start..end)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.end - self.next).div_ceil(self.block_size);
        match usize::try_from(remaining) {
            Ok(n) => (n, Some(n)),
            Err(_) => (usize::MAX, None),
        }
    }
}

impl std::iter::FusedIterator for Chunks {}
