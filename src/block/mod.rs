//! Prefix-compressed key/value blocks.
//!
//! A block is the I/O unit inside an sstable: a run of entries whose keys
//! are stored as deltas against their predecessor, followed by a *restart
//! array* that allows binary search without decoding every entry.
//!
//! # On-disk layout
//!
//! ```text
//! | entry 0 | entry 1 | ... | entry n-1 | restarts[k] u32le ... | k u32le |
//! ```
//!
//! Each entry:
//!
//! ```text
//! | varint shared | varint non_shared | varint value_len | key_tail | value |
//! ```
//!
//! Every `restart_interval` entries (and always at entry 0) a *restart
//! point* is recorded: the absolute offset of an entry written with
//! `shared == 0`, i.e. a full key. [`BlockIter::seek`] binary-searches the
//! restart array, then scans forward linearly.
//!
//! Keys within a block are strictly increasing under the comparator the
//! block was built with. The builder enforces this.
//!
//! Checksums are not handled here: the sstable layer wraps each block in a
//! `(type_byte, masked_crc32c)` trailer on disk.


use std::cmp::Ordering;
use std::sync::Arc;

use thiserror::Error;

use crate::codec::{self, CodecError};

/// Default number of entries between restart points.
pub const DEFAULT_RESTART_INTERVAL: usize = 16;

/// Key ordering used both when building and when searching a block.
///
/// Data and index blocks use the internal-key comparator; the meta-index
/// block uses plain byte order.
pub type KeyComparator = fn(&[u8], &[u8]) -> Ordering;

/// Errors produced by block building and iteration.
#[derive(Debug, Error)]
pub enum BlockError {
    /// Keys must be added in strictly increasing order.
    #[error("keys added out of order")]
    OutOfOrder,

    /// The block contents do not parse (truncated trailer, bad offsets).
    #[error("corrupt block: {0}")]
    Corrupt(&'static str),

    /// Varint decoding failed inside an entry.
    #[error("corrupt block entry: {0}")]
    Codec(#[from] CodecError),
}

// ------------------------------------------------------------------------------------------------
// BlockBuilder
// ------------------------------------------------------------------------------------------------

/// Accumulates sorted `(key, value)` pairs into a serialized block.
pub struct BlockBuilder {
    buf: Vec<u8>,
    restarts: Vec<u32>,
    restart_interval: usize,
    entries_since_restart: usize,
    last_key: Vec<u8>,
    num_entries: usize,
    cmp: KeyComparator,
    finished: bool,
}

impl BlockBuilder {
    /// A builder with the given restart interval and key order.
    pub fn new(restart_interval: usize, cmp: KeyComparator) -> Self {
        BlockBuilder {
            buf: Vec::new(),
            restarts: vec![0],
            restart_interval: restart_interval.max(1),
            entries_since_restart: 0,
            last_key: Vec::new(),
            num_entries: 0,
            cmp,
            finished: false,
        }
    }

    /// Append one entry. `key` must be strictly greater than every key
    /// added before it.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<(), BlockError> {
        debug_assert!(!self.finished);
        if self.num_entries > 0 && (self.cmp)(key, &self.last_key) != Ordering::Greater {
            return Err(BlockError::OutOfOrder);
        }

        let shared = if self.entries_since_restart < self.restart_interval {
            key.iter()
                .zip(&self.last_key)
                .take_while(|(a, b)| a == b)
                .count()
        } else {
            // Restart point: store the full key.
            self.restarts.push(self.buf.len() as u32);
            self.entries_since_restart = 0;
            0
        };
        let non_shared = key.len() - shared;

        codec::put_varint32(&mut self.buf, shared as u32);
        codec::put_varint32(&mut self.buf, non_shared as u32);
        codec::put_varint32(&mut self.buf, value.len() as u32);
        self.buf.extend_from_slice(&key[shared..]);
        self.buf.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.num_entries += 1;
        self.entries_since_restart += 1;
        Ok(())
    }

    /// Serialize the restart trailer and return the finished contents.
    pub fn finish(mut self) -> Vec<u8> {
        for offset in &self.restarts {
            codec::put_fixed32(&mut self.buf, *offset);
        }
        codec::put_fixed32(&mut self.buf, self.restarts.len() as u32);
        self.finished = true;
        std::mem::take(&mut self.buf)
    }

    /// Bytes the finished block would occupy right now.
    pub fn current_size_estimate(&self) -> usize {
        self.buf.len() + self.restarts.len() * 4 + 4
    }

    /// Number of entries added so far.
    pub fn num_entries(&self) -> usize {
        self.num_entries
    }

    /// Whether no entries have been added.
    pub fn is_empty(&self) -> bool {
        self.num_entries == 0
    }

    /// The last key added, for index-separator computation.
    pub fn last_key(&self) -> &[u8] {
        &self.last_key
    }

    /// Clear all state for reuse on the next block.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.restarts.clear();
        self.restarts.push(0);
        self.entries_since_restart = 0;
        self.last_key.clear();
        self.num_entries = 0;
        self.finished = false;
    }
}

// ------------------------------------------------------------------------------------------------
// Block
// ------------------------------------------------------------------------------------------------

/// An immutable, parsed block.
pub struct Block {
    data: Vec<u8>,
    /// Offset where the restart array begins.
    restarts_offset: usize,
    num_restarts: usize,
}

impl Block {
    /// Validate the trailer and wrap the contents.
    pub fn new(data: Vec<u8>) -> Result<Self, BlockError> {
        if data.len() < 4 {
            return Err(BlockError::Corrupt("block shorter than trailer"));
        }
        let num_restarts = codec::decode_fixed32(&data[data.len() - 4..])? as usize;
        let trailer = num_restarts
            .checked_mul(4)
            .and_then(|n| n.checked_add(4))
            .ok_or(BlockError::Corrupt("restart count overflow"))?;
        if trailer > data.len() {
            return Err(BlockError::Corrupt("restart array exceeds block"));
        }
        let restarts_offset = data.len() - trailer;
        Ok(Block {
            data,
            restarts_offset,
            num_restarts,
        })
    }

    /// Total byte size of the block contents.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    fn restart_point(&self, index: usize) -> usize {
        debug_assert!(index < self.num_restarts);
        let at = self.restarts_offset + index * 4;
        codec::decode_fixed32(&self.data[at..]).unwrap_or(0) as usize
    }
}

// ------------------------------------------------------------------------------------------------
// BlockIter
// ------------------------------------------------------------------------------------------------

/// Cursor over the entries of one block.
///
/// Holds its block by `Arc`, so it can outlive a cache handle. After
/// construction the iterator is *invalid*; position it with
/// [`seek_to_first`](Self::seek_to_first), [`seek`](Self::seek), or
/// [`seek_to_last`](Self::seek_to_last).
pub struct BlockIter {
    block: Arc<Block>,
    cmp: KeyComparator,
    /// Offset just past the current entry.
    next_offset: usize,
    key: Vec<u8>,
    value_range: std::ops::Range<usize>,
    valid: bool,
}

impl BlockIter {
    /// An iterator over `block`, positioned before the first entry.
    pub fn new(block: Arc<Block>, cmp: KeyComparator) -> BlockIter {
        BlockIter {
            block,
            cmp,
            next_offset: 0,
            key: Vec::new(),
            value_range: 0..0,
            valid: false,
        }
    }

    /// Whether the iterator is positioned at an entry.
    pub fn valid(&self) -> bool {
        self.valid
    }

    /// True once the iterator has advanced past the last entry.
    pub fn eof(&self) -> bool {
        !self.valid
    }

    /// The current key. Undefined unless [`valid`](Self::valid).
    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        &self.key
    }

    /// The current value. Undefined unless [`valid`](Self::valid).
    pub fn value(&self) -> &[u8] {
        debug_assert!(self.valid);
        &self.block.data[self.value_range.clone()]
    }

    /// Position at the first entry.
    pub fn seek_to_first(&mut self) {
        self.seek_to_restart(0);
        self.parse_next_entry();
    }

    /// Position at the last entry.
    pub fn seek_to_last(&mut self) {
        if self.block.num_restarts == 0 {
            self.valid = false;
            return;
        }
        self.seek_to_restart(self.block.num_restarts - 1);
        // Scan to the final entry of the block.
        while self.parse_next_entry() && self.next_offset < self.block.restarts_offset {}
    }

    /// Position at the first entry whose key is ≥ `target`.
    pub fn seek(&mut self, target: &[u8]) {
        // Binary search: largest restart whose key is < target.
        let mut left = 0usize;
        let mut right = self.block.num_restarts.saturating_sub(1);
        while left < right {
            let mid = right - (right - left) / 2;
            let ordering = self.restart_key(mid).map(|key| (self.cmp)(key, target));
            match ordering {
                Some(Ordering::Less) => left = mid,
                Some(_) => right = mid - 1,
                None => {
                    self.valid = false;
                    return;
                }
            }
        }

        self.seek_to_restart(left);
        while self.parse_next_entry() {
            if (self.cmp)(&self.key, target) != Ordering::Less {
                return;
            }
            if self.next_offset >= self.block.restarts_offset {
                break;
            }
        }
        self.valid = false;
    }

    /// Advance to the next entry; returns `false` at end of block.
    pub fn next(&mut self) -> bool {
        debug_assert!(self.valid);
        if self.next_offset >= self.block.restarts_offset {
            self.valid = false;
            return false;
        }
        self.parse_next_entry()
    }

    fn seek_to_restart(&mut self, index: usize) {
        self.key.clear();
        self.valid = false;
        self.next_offset = if self.block.num_restarts == 0 {
            self.block.restarts_offset
        } else {
            self.block.restart_point(index)
        };
    }

    /// The full key stored at a restart point (`shared == 0` there).
    fn restart_key(&self, index: usize) -> Option<&[u8]> {
        let offset = self.block.restart_point(index);
        let data = &self.block.data[..self.block.restarts_offset];
        let (shared, n0) = codec::decode_varint32(&data[offset..]).ok()?;
        if shared != 0 {
            return None;
        }
        let (non_shared, n1) = codec::decode_varint32(&data[offset + n0..]).ok()?;
        let (_value_len, n2) = codec::decode_varint32(&data[offset + n0 + n1..]).ok()?;
        let key_start = offset + n0 + n1 + n2;
        data.get(key_start..key_start + non_shared as usize)
    }

    /// Decode the entry at `next_offset` into `key`/`value_range`.
    fn parse_next_entry(&mut self) -> bool {
        let limit = self.block.restarts_offset;
        if self.next_offset >= limit {
            self.valid = false;
            return false;
        }
        let data = &self.block.data[..limit];
        let at = self.next_offset;

        let parsed = (|| {
            let (shared, n0) = codec::decode_varint32(&data[at..]).ok()?;
            let (non_shared, n1) = codec::decode_varint32(&data[at + n0..]).ok()?;
            let (value_len, n2) = codec::decode_varint32(&data[at + n0 + n1..]).ok()?;
            let key_start = at + n0 + n1 + n2;
            let value_start = key_start.checked_add(non_shared as usize)?;
            let value_end = value_start.checked_add(value_len as usize)?;
            if value_end > limit || shared as usize > self.key.len() {
                return None;
            }
            Some((shared as usize, key_start..value_start, value_start..value_end))
        })();

        match parsed {
            Some((shared, key_tail, value_range)) => {
                self.key.truncate(shared);
                self.key.extend_from_slice(&self.block.data[key_tail]);
                self.next_offset = value_range.end;
                self.value_range = value_range;
                self.valid = true;
                true
            }
            None => {
                // Treat a malformed entry as end of block; the sstable
                // layer verified the checksum, so this indicates a logic
                // error rather than bit rot.
                self.valid = false;
                false
            }
        }
    }
}
