//! Immutable, block-indexed sstable files.
//!
//! An sstable is the on-disk unit of LSM storage: a sorted run of
//! internal-key/value entries, written once and never modified.
//!
//! # On-disk layout (bottom-up)
//!
//! ```text
//! | data block 0 | data block 1 | ...
//! | filter block                      (bloom over user keys)
//! | meta-index block                  ("filter.bloom" → handle)
//! | index block                       (separator → data block handle)
//! | footer (48 bytes)                 (meta-index handle | index handle |
//! |                                    padding | magic u64 le)
//! ```
//!
//! Data, meta-index, and index blocks use the prefix-compressed
//! [`crate::block`] format and are each followed on disk by a 5-byte
//! trailer `(type_byte, masked_crc32c)`; the CRC covers the block contents
//! plus the type byte. The filter block is raw serialized bloom-filter
//! bytes with the same trailer.
//!
//! Index separators are *shortened* keys: each separator is ≥ the largest
//! key of its block and < the smallest key of the next
//! (see [`crate::keys::shortest_separator`]).
//!
//! # Reading
//!
//! [`Table::open`] memory-maps the file, verifies the footer magic, and
//! keeps the decoded index block and bloom filter on the table object.
//! Point lookups consult the filter, binary-search the index, and fetch
//! the one candidate data block through the shard's block cache. A block
//! whose checksum fails marks the whole table *suspect*; the read fails
//! with corruption and the version read path excludes the table until it
//! is re-verified.

pub mod builder;
pub mod cache;
pub mod iterator;

#[cfg(test)]
mod tests;

pub use builder::TableBuilder;
pub use cache::TableCache;
pub use iterator::TableIterator;

use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bloomfilter::Bloom;
use memmap2::Mmap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::block::{Block, BlockError, BlockIter};
use crate::cache::BlockCache;
use crate::checksum;
use crate::codec::{self, CodecError};
use crate::keys::{self, SequenceNumber, ValueType};

/// Fixed 64-bit constant closing every sstable file.
pub const TABLE_MAGIC: u64 = 0x9fa3_c2e1_7d5b_8e44;

/// Byte size of the footer at the end of every table file.
pub const FOOTER_SIZE: usize = 48;

/// Maximum encoded size of a [`BlockHandle`]: two 10-byte varints.
pub const MAX_BLOCK_HANDLE_SIZE: usize = 20;

/// On-disk trailer after each block: type byte + masked CRC32C.
pub const BLOCK_TRAILER_SIZE: usize = 5;

/// Block type byte: raw, uncompressed contents.
pub const BLOCK_TYPE_RAW: u8 = 0;

/// Target uncompressed size of a data block.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Meta-index key of the bloom filter block.
pub const FILTER_BLOCK_NAME: &str = "filter.bloom";

/// False-positive rate the bloom filter is sized for.
pub const BLOOM_FP_RATE: f64 = 0.01;

/// Errors returned by sstable operations.
#[derive(Debug, Error)]
pub enum TableError {
    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Structural damage: bad magic, bad checksum, truncated block.
    #[error("corruption: {0}")]
    Corruption(String),

    /// Keys fed to the builder out of order.
    #[error("keys added out of order")]
    OutOfOrder,
}

impl From<BlockError> for TableError {
    fn from(err: BlockError) -> Self {
        match err {
            BlockError::OutOfOrder => TableError::OutOfOrder,
            other => TableError::Corruption(other.to_string()),
        }
    }
}

impl From<CodecError> for TableError {
    fn from(err: CodecError) -> Self {
        TableError::Corruption(err.to_string())
    }
}

// ------------------------------------------------------------------------------------------------
// BlockHandle / Footer
// ------------------------------------------------------------------------------------------------

/// Location of a block within the table file: `(offset, size)` varints.
///
/// `size` counts the block contents only, excluding the 5-byte trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHandle {
    /// Byte offset of the block's first byte.
    pub offset: u64,
    /// Byte length of the block contents.
    pub size: u64,
}

impl BlockHandle {
    /// Append the two-varint encoding.
    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        codec::put_varint64(buf, self.offset);
        codec::put_varint64(buf, self.size);
    }

    /// Decode from the front of `buf`; returns `(handle, consumed)`.
    pub fn decode(buf: &[u8]) -> Result<(BlockHandle, usize), TableError> {
        let (offset, n) = codec::decode_varint64(buf)?;
        let (size, m) = codec::decode_varint64(&buf[n..])?;
        Ok((BlockHandle { offset, size }, n + m))
    }
}

/// The fixed-size footer at the end of every table file.
#[derive(Debug, Clone, Copy)]
pub struct Footer {
    /// Handle of the meta-index block.
    pub metaindex: BlockHandle,
    /// Handle of the index block.
    pub index: BlockHandle,
}

impl Footer {
    /// Serialize: two padded handles (40 bytes) then the magic.
    pub fn encode(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = Vec::with_capacity(FOOTER_SIZE);
        self.metaindex.encode_to(&mut buf);
        self.index.encode_to(&mut buf);
        buf.resize(2 * MAX_BLOCK_HANDLE_SIZE, 0);
        codec::put_fixed64(&mut buf, TABLE_MAGIC);
        let mut out = [0u8; FOOTER_SIZE];
        out.copy_from_slice(&buf);
        out
    }

    /// Parse and verify the last 48 bytes of a table file.
    pub fn decode(buf: &[u8]) -> Result<Footer, TableError> {
        if buf.len() < FOOTER_SIZE {
            return Err(TableError::Corruption("footer truncated".into()));
        }
        let magic = codec::decode_fixed64(&buf[FOOTER_SIZE - 8..])?;
        if magic != TABLE_MAGIC {
            return Err(TableError::Corruption(format!(
                "bad table magic 0x{magic:016x}"
            )));
        }
        let (metaindex, n) = BlockHandle::decode(buf)?;
        let (index, _) = BlockHandle::decode(&buf[n..])?;
        Ok(Footer { metaindex, index })
    }
}

// ------------------------------------------------------------------------------------------------
// Block I/O
// ------------------------------------------------------------------------------------------------

/// Read block contents at `handle`, verifying the trailer checksum.
pub(crate) fn read_block_contents(mmap: &Mmap, handle: &BlockHandle) -> Result<Vec<u8>, TableError> {
    let start = usize::try_from(handle.offset)
        .map_err(|_| TableError::Corruption("block offset out of range".into()))?;
    let size = usize::try_from(handle.size)
        .map_err(|_| TableError::Corruption("block size out of range".into()))?;
    let end = start
        .checked_add(size)
        .and_then(|e| e.checked_add(BLOCK_TRAILER_SIZE))
        .ok_or_else(|| TableError::Corruption("block extent overflow".into()))?;
    if end > mmap.len() {
        return Err(TableError::Corruption("block past end of file".into()));
    }

    let contents = &mmap[start..start + size];
    let type_byte = mmap[start + size];
    if type_byte != BLOCK_TYPE_RAW {
        return Err(TableError::Corruption(format!(
            "unknown block type {type_byte}"
        )));
    }
    let stored = codec::decode_fixed32(&mmap[start + size + 1..start + size + 5])?;
    let computed = checksum::masked_crc(&[contents, &[type_byte]]);
    if stored != computed {
        return Err(TableError::Corruption("block checksum mismatch".into()));
    }
    Ok(contents.to_vec())
}

// ------------------------------------------------------------------------------------------------
// Point-lookup result
// ------------------------------------------------------------------------------------------------

/// Outcome of a point lookup against one table.
///
/// Carries the sequence so the level-0 read path can tie-break between
/// overlapping candidates.
#[derive(Debug, PartialEq, Eq)]
pub enum TableGetResult {
    /// Newest visible entry is a value.
    Found(SequenceNumber, Vec<u8>),
    /// Newest visible entry is a tombstone.
    Deleted(SequenceNumber),
    /// This table holds nothing visible for the key.
    NotFound,
}

// ------------------------------------------------------------------------------------------------
// Table
// ------------------------------------------------------------------------------------------------

/// An open, memory-mapped sstable.
pub struct Table {
    file_number: u64,
    mmap: Mmap,
    index: Arc<Block>,
    filter: Option<Bloom<[u8]>>,
    block_cache: Arc<Mutex<BlockCache>>,
    suspect: AtomicBool,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("file_number", &self.file_number)
            .field("suspect", &self.suspect)
            .finish_non_exhaustive()
    }
}

impl Table {
    /// Open the table at `path`, verify the footer, and load the index
    /// and filter blocks.
    pub fn open(
        path: &Path,
        file_number: u64,
        block_cache: Arc<Mutex<BlockCache>>,
    ) -> Result<Table, TableError> {
        let file = File::open(path)?;
        // Safety: table files are immutable once published; the map is
        // read-only and block extents are bounds-checked before slicing.
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < FOOTER_SIZE {
            return Err(TableError::Corruption("file smaller than footer".into()));
        }
        let footer = Footer::decode(&mmap[mmap.len() - FOOTER_SIZE..])?;

        let index_contents = read_block_contents(&mmap, &footer.index)?;
        let index = Arc::new(Block::new(index_contents)?);

        // The meta-index maps well-known names to handles; only the bloom
        // filter is defined today.
        let filter = {
            let meta_contents = read_block_contents(&mmap, &footer.metaindex)?;
            let meta = Arc::new(Block::new(meta_contents)?);
            let mut iter = BlockIter::new(Arc::clone(&meta), |a, b| a.cmp(b));
            iter.seek(FILTER_BLOCK_NAME.as_bytes());
            if iter.valid() && iter.key() == FILTER_BLOCK_NAME.as_bytes() {
                let (handle, _) = BlockHandle::decode(iter.value())?;
                let filter_bytes = read_block_contents(&mmap, &handle)?;
                match Bloom::from_slice(&filter_bytes) {
                    Ok(bloom) => Some(bloom),
                    Err(e) => {
                        // A damaged filter only loses the negative-lookup
                        // shortcut; reads stay correct without it.
                        warn!(file_number, error = %e, "dropping unreadable filter block");
                        None
                    }
                }
            } else {
                None
            }
        };

        debug!(file_number, size = mmap.len(), "sstable opened");
        Ok(Table {
            file_number,
            mmap,
            index,
            filter,
            block_cache,
            suspect: AtomicBool::new(false),
        })
    }

    /// The file number this table was opened under.
    pub fn file_number(&self) -> u64 {
        self.file_number
    }

    /// Whether a checksum failure has excluded this table from reads.
    pub fn is_suspect(&self) -> bool {
        self.suspect.load(Ordering::Acquire)
    }

    /// Whether the filter rules out `user_key`.
    ///
    /// `true` means "maybe present" (or no filter); only `false` is
    /// definitive.
    pub fn may_contain(&self, user_key: &[u8]) -> bool {
        match &self.filter {
            Some(bloom) => bloom.check(user_key),
            None => true,
        }
    }

    /// Newest entry for `user_key` visible at `snapshot`.
    pub fn get(
        &self,
        user_key: &[u8],
        snapshot: SequenceNumber,
    ) -> Result<TableGetResult, TableError> {
        if !self.may_contain(user_key) {
            return Ok(TableGetResult::NotFound);
        }

        let probe = keys::lookup_key(user_key, snapshot);
        let mut index_iter = BlockIter::new(Arc::clone(&self.index), keys::internal_key_cmp);
        index_iter.seek(probe.as_bytes());
        if !index_iter.valid() {
            return Ok(TableGetResult::NotFound);
        }

        let (handle, _) = BlockHandle::decode(index_iter.value())?;
        let block = self.fetch_block(&handle)?;
        let mut iter = BlockIter::new(block, keys::internal_key_cmp);
        iter.seek(probe.as_bytes());
        if !iter.valid() {
            return Ok(TableGetResult::NotFound);
        }

        let parsed = keys::parse_internal_key(iter.key())
            .map_err(|e| TableError::Corruption(e.to_string()))?;
        if parsed.user_key != user_key {
            return Ok(TableGetResult::NotFound);
        }
        Ok(match parsed.value_type {
            ValueType::Value => TableGetResult::Found(parsed.sequence, iter.value().to_vec()),
            ValueType::Deletion => TableGetResult::Deleted(parsed.sequence),
        })
    }

    /// Fetch a data block through the shard's block cache, marking the
    /// table suspect if its contents fail verification.
    pub(crate) fn fetch_block(&self, handle: &BlockHandle) -> Result<Arc<Block>, TableError> {
        let key = (self.file_number, handle.offset);
        let mut cache = self
            .block_cache
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        let result = cache.find_or_insert(key, || {
            let contents = read_block_contents(&self.mmap, handle)?;
            let charge = contents.len();
            let block = Arc::new(Block::new(contents)?);
            Ok::<_, TableError>((block, charge))
        });
        match result {
            Ok(block) => Ok(block),
            Err(e) => {
                if matches!(e, TableError::Corruption(_)) {
                    self.suspect.store(true, Ordering::Release);
                    warn!(
                        file_number = self.file_number,
                        error = %e,
                        "table marked suspect after block corruption"
                    );
                }
                Err(e)
            }
        }
    }
}
