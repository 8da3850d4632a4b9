//! Two-level sstable iteration.
//!
//! [`TableIterator`] walks an sstable in ascending internal-key order:
//! an outer cursor over the index block selects data blocks, an inner
//! cursor walks the current data block. Data blocks are fetched through
//! the shard's block cache as the outer cursor reaches them.
//!
//! Block fetch failures park the iterator in an invalid state and stash
//! the error; flush and compaction callers check [`TableIterator::take_error`]
//! before trusting an early end-of-stream.

use std::sync::Arc;

use crate::block::BlockIter;
use crate::keys;

use super::{BlockHandle, Table, TableError};

/// Ascending iterator over every entry of one table.
pub struct TableIterator {
    table: Arc<Table>,
    index_iter: BlockIter,
    data_iter: Option<BlockIter>,
    error: Option<TableError>,
}

impl TableIterator {
    /// An iterator over `table`, positioned before the first entry.
    pub fn new(table: Arc<Table>) -> TableIterator {
        let index_iter = BlockIter::new(Arc::clone(&table.index), keys::internal_key_cmp);
        TableIterator {
            table,
            index_iter,
            data_iter: None,
            error: None,
        }
    }

    /// Whether the iterator is positioned at an entry.
    pub fn valid(&self) -> bool {
        self.data_iter.as_ref().is_some_and(|it| it.valid())
    }

    /// Current internal key. Undefined unless [`valid`](Self::valid).
    pub fn key(&self) -> &[u8] {
        self.data_iter
            .as_ref()
            .expect("iterator positioned")
            .key()
    }

    /// Current value. Undefined unless [`valid`](Self::valid).
    pub fn value(&self) -> &[u8] {
        self.data_iter
            .as_ref()
            .expect("iterator positioned")
            .value()
    }

    /// Take the first error encountered, if any.
    pub fn take_error(&mut self) -> Option<TableError> {
        self.error.take()
    }

    /// Position at the first entry of the table.
    pub fn seek_to_first(&mut self) {
        self.index_iter.seek_to_first();
        self.load_data_block();
        if let Some(it) = self.data_iter.as_mut() {
            it.seek_to_first();
        }
        self.skip_exhausted_blocks();
    }

    /// Position at the first entry with key ≥ `target`.
    pub fn seek(&mut self, target: &[u8]) {
        self.index_iter.seek(target);
        self.load_data_block();
        if let Some(it) = self.data_iter.as_mut() {
            it.seek(target);
        }
        self.skip_exhausted_blocks();
    }

    /// Advance one entry; returns `false` at the end of the table.
    pub fn next(&mut self) -> bool {
        if let Some(it) = self.data_iter.as_mut() {
            if it.valid() && it.next() {
                return true;
            }
        }
        // Current block exhausted: move to the next one.
        if !self.index_iter.valid() {
            self.data_iter = None;
            return false;
        }
        if !self.index_iter.next() {
            self.data_iter = None;
            return false;
        }
        self.load_data_block();
        if let Some(it) = self.data_iter.as_mut() {
            it.seek_to_first();
        }
        self.skip_exhausted_blocks();
        self.valid()
    }

    /// Decode the handle under the index cursor and fetch that block.
    fn load_data_block(&mut self) {
        self.data_iter = None;
        if !self.index_iter.valid() {
            return;
        }
        let handle = match BlockHandle::decode(self.index_iter.value()) {
            Ok((handle, _)) => handle,
            Err(e) => {
                self.error.get_or_insert(e);
                return;
            }
        };
        match self.table.fetch_block(&handle) {
            Ok(block) => {
                self.data_iter = Some(BlockIter::new(block, keys::internal_key_cmp));
            }
            Err(e) => {
                self.error.get_or_insert(e);
            }
        }
    }

    /// Walk forward over data blocks that yielded no entry (possible when
    /// a seek target lands past the final key of its candidate block).
    fn skip_exhausted_blocks(&mut self) {
        while !self.valid() {
            if self.error.is_some() || !self.index_iter.valid() || !self.index_iter.next() {
                self.data_iter = None;
                return;
            }
            self.load_data_block();
            if let Some(it) = self.data_iter.as_mut() {
                it.seek_to_first();
            }
        }
    }
}
