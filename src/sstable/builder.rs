//! SSTable writer — builds a table file from an ascending entry stream.
//!
//! The builder accepts internal-key/value pairs in sorted order, packs
//! them into prefix-compressed data blocks, and on [`TableBuilder::finish`]
//! emits the filter block, meta-index block, index block, and footer.
//!
//! Index entries are deferred: when a data block fills, its handle is
//! parked until the *next* key arrives, so the separator can be chosen as
//! the shortest key that is ≥ the block's last key and < the next block's
//! first key. The final block's separator is a shortest successor instead.
//!
//! Callers stream from a memtable iterator (flush) or a merge iterator
//! (compaction); either way keys arrive already sorted. Output goes to a
//! fresh `%06u.sst` file which the version edit publishes after the
//! builder syncs it.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use bloomfilter::Bloom;
use tracing::{debug, trace};

use super::{
    BLOCK_TRAILER_SIZE, BLOCK_TYPE_RAW, BLOOM_FP_RATE, BlockHandle, DEFAULT_BLOCK_SIZE,
    FILTER_BLOCK_NAME, Footer, TableError,
};
use crate::block::{BlockBuilder, DEFAULT_RESTART_INTERVAL};
use crate::checksum;
use crate::keys;

/// Summary of a finished table, fed into the version edit.
#[derive(Debug, Clone)]
pub struct TableSummary {
    /// Total file size in bytes.
    pub file_size: u64,
    /// Smallest internal key written.
    pub smallest: Vec<u8>,
    /// Largest internal key written.
    pub largest: Vec<u8>,
    /// Number of entries.
    pub num_entries: u64,
}

/// Streams sorted entries into a new sstable file.
pub struct TableBuilder {
    file: File,
    path: PathBuf,
    offset: u64,
    block_size: usize,
    data_block: BlockBuilder,
    index_block: BlockBuilder,
    /// Handle of the last finished data block, awaiting its separator.
    pending_handle: Option<BlockHandle>,
    /// Last key of the last finished data block.
    pending_last_key: Vec<u8>,
    filter: Option<Bloom<[u8]>>,
    smallest: Option<Vec<u8>>,
    last_key: Vec<u8>,
    num_entries: u64,
}

impl TableBuilder {
    /// Create a builder writing to `path`.
    ///
    /// `expected_entries` sizes the bloom filter; zero disables it.
    pub fn new(path: &Path, expected_entries: usize) -> Result<TableBuilder, TableError> {
        Self::with_block_size(path, expected_entries, DEFAULT_BLOCK_SIZE)
    }

    /// Create a builder with an explicit data-block size (tests shrink it).
    pub fn with_block_size(
        path: &Path,
        expected_entries: usize,
        block_size: usize,
    ) -> Result<TableBuilder, TableError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let filter = if expected_entries > 0 {
            Bloom::new_for_fp_rate(expected_entries, BLOOM_FP_RATE).ok()
        } else {
            None
        };
        Ok(TableBuilder {
            file,
            path: path.to_path_buf(),
            offset: 0,
            block_size,
            data_block: BlockBuilder::new(DEFAULT_RESTART_INTERVAL, keys::internal_key_cmp),
            index_block: BlockBuilder::new(1, keys::internal_key_cmp),
            pending_handle: None,
            pending_last_key: Vec::new(),
            filter,
            smallest: None,
            last_key: Vec::new(),
            num_entries: 0,
        })
    }

    /// Append one entry. Keys must arrive in ascending internal-key order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<(), TableError> {
        if self.num_entries > 0
            && keys::internal_key_cmp(key, &self.last_key) != std::cmp::Ordering::Greater
        {
            return Err(TableError::OutOfOrder);
        }

        // Emit the parked index entry now that the next key is known.
        if let Some(handle) = self.pending_handle.take() {
            let separator = keys::shortest_separator(&self.pending_last_key, key);
            let mut encoded = Vec::with_capacity(super::MAX_BLOCK_HANDLE_SIZE);
            handle.encode_to(&mut encoded);
            self.index_block.add(&separator, &encoded)?;
        }

        if let Some(bloom) = self.filter.as_mut() {
            bloom.set(keys::extract_user_key(key));
        }
        if self.smallest.is_none() {
            self.smallest = Some(key.to_vec());
        }
        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.num_entries += 1;

        self.data_block.add(key, value)?;
        if self.data_block.current_size_estimate() >= self.block_size {
            self.flush_data_block()?;
        }
        Ok(())
    }

    /// Finish the table: final data block, filter, meta-index, index,
    /// footer, then flush and sync the file.
    pub fn finish(mut self) -> Result<TableSummary, TableError> {
        if !self.data_block.is_empty() {
            self.flush_data_block()?;
        }
        // The final block's separator does not have a following key;
        // use a shortest successor of its last key.
        if let Some(handle) = self.pending_handle.take() {
            let separator = keys::shortest_successor(&self.pending_last_key);
            let mut encoded = Vec::with_capacity(super::MAX_BLOCK_HANDLE_SIZE);
            handle.encode_to(&mut encoded);
            self.index_block.add(&separator, &encoded)?;
        }

        // Filter block: raw bloom bytes with the standard trailer.
        let mut metaindex = BlockBuilder::new(DEFAULT_RESTART_INTERVAL, |a, b| a.cmp(b));
        if let Some(bloom) = self.filter.take() {
            let filter_handle = self.write_raw_block(&bloom.as_slice().to_vec())?;
            let mut encoded = Vec::with_capacity(super::MAX_BLOCK_HANDLE_SIZE);
            filter_handle.encode_to(&mut encoded);
            metaindex.add(FILTER_BLOCK_NAME.as_bytes(), &encoded)?;
        }
        let metaindex_handle = self.write_raw_block(&metaindex.finish())?;

        let index_contents = std::mem::replace(
            &mut self.index_block,
            BlockBuilder::new(1, keys::internal_key_cmp),
        )
        .finish();
        let index_handle = self.write_raw_block(&index_contents)?;

        let footer = Footer {
            metaindex: metaindex_handle,
            index: index_handle,
        };
        self.file.write_all(&footer.encode())?;
        self.offset += super::FOOTER_SIZE as u64;
        self.file.flush()?;
        self.file.sync_all()?;

        debug!(
            path = %self.path.display(),
            entries = self.num_entries,
            size = self.offset,
            "sstable built"
        );
        Ok(TableSummary {
            file_size: self.offset,
            smallest: self.smallest.unwrap_or_default(),
            largest: self.last_key.clone(),
            num_entries: self.num_entries,
        })
    }

    /// Drop the partially written file.
    pub fn abandon(self) -> Result<(), TableError> {
        drop(self.file);
        std::fs::remove_file(&self.path)?;
        Ok(())
    }

    /// Number of entries added so far.
    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// Bytes written to the file so far (excluding the buffered block).
    pub fn file_size(&self) -> u64 {
        self.offset
    }

    fn flush_data_block(&mut self) -> Result<(), TableError> {
        let last_key = self.data_block.last_key().to_vec();
        let contents = std::mem::replace(
            &mut self.data_block,
            BlockBuilder::new(DEFAULT_RESTART_INTERVAL, keys::internal_key_cmp),
        )
        .finish();
        let handle = self.write_raw_block(&contents)?;
        trace!(offset = handle.offset, size = handle.size, "data block flushed");
        self.pending_handle = Some(handle);
        self.pending_last_key = last_key;
        Ok(())
    }

    /// Write `contents` followed by `(type, masked_crc)`; returns its handle.
    fn write_raw_block(&mut self, contents: &[u8]) -> Result<BlockHandle, TableError> {
        let handle = BlockHandle {
            offset: self.offset,
            size: contents.len() as u64,
        };
        let crc = checksum::masked_crc(&[contents, &[BLOCK_TYPE_RAW]]);
        let mut trailer = [0u8; BLOCK_TRAILER_SIZE];
        trailer[0] = BLOCK_TYPE_RAW;
        trailer[1..].copy_from_slice(&crc.to_le_bytes());

        self.file.write_all(contents)?;
        self.file.write_all(&trailer)?;
        self.offset += contents.len() as u64 + BLOCK_TRAILER_SIZE as u64;
        Ok(handle)
    }
}
