//! In-memory buffer of pending mutations.
//!
//! A memtable is an ordered map from [internal key](crate::keys) to value
//! bytes, plus a dirty-bytes counter approximating its accounted
//! footprint. It absorbs writes after they are accepted by the commit log
//! and serves reads until its contents reach a level-0 sstable.
//!
//! # Lifecycle
//!
//! Created empty with writes enabled → accepts [`Memtable::apply`] →
//! [`Memtable::seal`]ed once it crosses the engine's dirty-size threshold
//! (no further inserts, reads and iteration still allowed) → flushed to an
//! sstable → destroyed once the published version covers it and the
//! commit-log prefix that produced it has been released.
//!
//! # Invariants
//!
//! - Every live entry's sequence is ≤ the engine's last assigned sequence.
//! - After sealing, `dirty_size` only shrinks (via
//!   [`Memtable::clear_gently`]) until destruction.


use std::collections::BTreeMap;
use std::ops::Bound;

use thiserror::Error;
use tracing::trace;

use crate::codec::{self, CodecError};
use crate::keys::{
    self, InternalKey, KeyError, SequenceNumber, ValueType, lookup_key, parse_internal_key,
};

/// Fixed per-entry overhead charged to the dirty counter, covering the
/// tree node and bookkeeping around the raw bytes.
const ENTRY_OVERHEAD: usize = 32;

/// Entries destroyed per step of [`Memtable::clear_gently`].
const GENTLE_CLEAR_BATCH: usize = 32;

/// Errors returned by memtable operations.
#[derive(Debug, Error)]
pub enum MemtableError {
    /// The memtable has been sealed; no further inserts are accepted.
    #[error("write disabled: memtable is sealed")]
    WriteDisabled,

    /// A mutation failed to decode during replay.
    #[error("corrupt mutation: {0}")]
    Codec(#[from] CodecError),

    /// A mutation carried a malformed internal key.
    #[error("corrupt mutation key: {0}")]
    Key(#[from] KeyError),
}

/// A single write as it travels from the decoder through the commit log
/// into the memtable: an internal key plus the value bytes (empty for a
/// tombstone).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    /// Sequence number assigned by the engine.
    pub sequence: SequenceNumber,
    /// Whether this is a value or a tombstone.
    pub value_type: ValueType,
    /// User key bytes.
    pub key: Vec<u8>,
    /// Value bytes; empty for [`ValueType::Deletion`].
    pub value: Vec<u8>,
}

impl Mutation {
    /// A PUT mutation.
    pub fn put(sequence: SequenceNumber, key: Vec<u8>, value: Vec<u8>) -> Self {
        Mutation {
            sequence,
            value_type: ValueType::Value,
            key,
            value,
        }
    }

    /// A DELETE tombstone.
    pub fn delete(sequence: SequenceNumber, key: Vec<u8>) -> Self {
        Mutation {
            sequence,
            value_type: ValueType::Deletion,
            key,
            value: Vec::new(),
        }
    }

    /// Serialized size of this mutation as a commit-log payload.
    pub fn serialized_size(&self) -> usize {
        codec::varint_length(self.key.len() as u64)
            + self.key.len()
            + keys::TAG_LEN
            + codec::varint_length(self.value.len() as u64)
            + self.value.len()
    }

    /// Append the commit-log payload encoding:
    /// `varint key_len | key | fixed64 tag | varint value_len | value`.
    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        codec::put_length_prefixed_slice(buf, &self.key);
        codec::put_fixed64(buf, keys::pack_tag(self.sequence, self.value_type));
        codec::put_length_prefixed_slice(buf, &self.value);
    }

    /// Decode one mutation from a commit-log payload.
    pub fn decode(buf: &[u8]) -> Result<Mutation, MemtableError> {
        let (key, n) = codec::get_length_prefixed_slice(buf)?;
        let tag = codec::decode_fixed64(&buf[n..])?;
        let (sequence, value_type) = keys::unpack_tag(tag)?;
        let (value, _) = codec::get_length_prefixed_slice(&buf[n + keys::TAG_LEN..])?;
        Ok(Mutation {
            sequence,
            value_type,
            key: key.to_vec(),
            value: value.to_vec(),
        })
    }
}

/// Outcome of a point lookup against one memtable.
#[derive(Debug, PartialEq, Eq)]
pub enum MemtableGetResult {
    /// The newest entry for the key is a value.
    Found(Vec<u8>),
    /// The newest entry for the key is a tombstone.
    Deleted,
    /// This memtable holds nothing for the key.
    NotFound,
}

/// The mutable in-memory layer of a column family.
pub struct Memtable {
    tree: BTreeMap<InternalKey, Vec<u8>>,
    dirty: usize,
    write_enabled: bool,
    highest_sequence: SequenceNumber,
}

impl Memtable {
    /// An empty memtable with writes enabled.
    pub fn new() -> Self {
        Memtable {
            tree: BTreeMap::new(),
            dirty: 0,
            write_enabled: true,
            highest_sequence: 0,
        }
    }

    /// Insert (or overwrite) a mutation.
    ///
    /// Fails with [`MemtableError::WriteDisabled`] once the memtable has
    /// been sealed.
    pub fn apply(&mut self, mutation: Mutation) -> Result<(), MemtableError> {
        if !self.write_enabled {
            return Err(MemtableError::WriteDisabled);
        }
        let key = InternalKey::new(&mutation.key, mutation.sequence, mutation.value_type);
        if mutation.sequence > self.highest_sequence {
            self.highest_sequence = mutation.sequence;
        }
        let key_len = key.as_bytes().len();
        let value_len = mutation.value.len();
        match self.tree.insert(key, mutation.value) {
            Some(old) => {
                // Same internal key reapplied (replay): swap value charge.
                self.dirty = self.dirty.saturating_sub(old.len()) + value_len;
            }
            None => {
                self.dirty += key_len + value_len + ENTRY_OVERHEAD;
            }
        }
        Ok(())
    }

    /// Newest entry for `user_key` visible at `snapshot`, or the absence
    /// of one.
    pub fn get(&self, user_key: &[u8], snapshot: SequenceNumber) -> MemtableGetResult {
        let probe = lookup_key(user_key, snapshot);
        // The first entry at or after the probe is the newest version of
        // `user_key` with sequence ≤ snapshot, if the user key matches.
        let mut range = self.tree.range((Bound::Included(&probe), Bound::Unbounded));
        match range.next() {
            Some((key, value)) => {
                let Ok(parsed) = parse_internal_key(key.as_bytes()) else {
                    return MemtableGetResult::NotFound;
                };
                if parsed.user_key != user_key {
                    return MemtableGetResult::NotFound;
                }
                match parsed.value_type {
                    ValueType::Value => MemtableGetResult::Found(value.clone()),
                    ValueType::Deletion => MemtableGetResult::Deleted,
                }
            }
            None => MemtableGetResult::NotFound,
        }
    }

    /// Ascending iterator over `(internal_key, value)` pairs; drives the
    /// flush into a level-0 sstable.
    pub fn iter(&self) -> impl Iterator<Item = (&InternalKey, &[u8])> {
        self.tree.iter().map(|(k, v)| (k, v.as_slice()))
    }

    /// Disallow further inserts. Reads and iteration stay available.
    pub fn seal(&mut self) {
        self.write_enabled = false;
        trace!(
            entries = self.tree.len(),
            dirty = self.dirty,
            "memtable sealed"
        );
    }

    /// Whether [`seal`](Self::seal) has been called.
    pub fn is_sealed(&self) -> bool {
        !self.write_enabled
    }

    /// Accounted bytes; drives the engine's flush trigger.
    pub fn dirty_size(&self) -> usize {
        self.dirty
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// Whether the memtable holds no entries.
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Highest sequence number applied so far.
    pub fn highest_sequence(&self) -> SequenceNumber {
        self.highest_sequence
    }

    /// Destroy entries in bounded batches, yielding the thread between
    /// batches so a large teardown does not stall the shard.
    pub fn clear_gently(&mut self) {
        while !self.tree.is_empty() {
            for _ in 0..GENTLE_CLEAR_BATCH {
                match self.tree.pop_first() {
                    Some((key, value)) => {
                        self.dirty = self
                            .dirty
                            .saturating_sub(key.as_bytes().len() + value.len() + ENTRY_OVERHEAD);
                    }
                    None => break,
                }
            }
            std::thread::yield_now();
        }
        self.dirty = 0;
    }

    /// Immediate synchronous teardown.
    pub fn clear(&mut self) {
        self.tree.clear();
        self.dirty = 0;
    }
}

impl Default for Memtable {
    fn default() -> Self {
        Self::new()
    }
}
