//! Table cache — open sstable handles, keyed by file number.
//!
//! Opening a table costs a file open, an mmap, and index/filter block
//! decodes; the cache amortises that across reads. Entries are slot-
//! counted rather than byte-counted: each open table charges one slot.
//!
//! Population failures drop the whole cache and retry once before
//! propagating — a failed open mid-eviction must not wedge the read path.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::cache::{BlockCache, DEFAULT_TABLE_CACHE_SLOTS, LruCache};
use crate::filename;

use super::{Table, TableError};

/// Per-shard cache of open [`Table`] handles.
pub struct TableCache {
    dir: PathBuf,
    cache: Mutex<LruCache<u64, Arc<Table>>>,
    block_cache: Arc<Mutex<BlockCache>>,
}

impl TableCache {
    /// A cache for tables under `dir` with the default slot budget.
    pub fn new(dir: &Path, block_cache: Arc<Mutex<BlockCache>>) -> TableCache {
        Self::with_slots(dir, DEFAULT_TABLE_CACHE_SLOTS, block_cache)
    }

    /// A cache with an explicit slot budget (tests shrink it).
    pub fn with_slots(
        dir: &Path,
        slots: usize,
        block_cache: Arc<Mutex<BlockCache>>,
    ) -> TableCache {
        TableCache {
            dir: dir.to_path_buf(),
            cache: Mutex::new(LruCache::new(slots)),
            block_cache,
        }
    }

    /// Fetch (or open) the table for `file_number`.
    pub fn get_table(&self, file_number: u64) -> Result<Arc<Table>, TableError> {
        let open = || {
            let path = filename::table_file(&self.dir, file_number);
            let table = Table::open(&path, file_number, Arc::clone(&self.block_cache))?;
            Ok::<_, TableError>((Arc::new(table), 1))
        };

        let mut cache = self
            .cache
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        match cache.find_or_insert(file_number, &open) {
            Ok(table) => Ok(table),
            Err(first) => {
                // Drop everything and retry once; a second failure is real.
                warn!(file_number, error = %first, "table open failed; clearing table cache and retrying");
                cache.clear();
                cache.find_or_insert(file_number, &open)
            }
        }
    }

    /// Remove the cached handle for a deleted table file.
    pub fn evict(&self, file_number: u64) {
        let mut cache = self
            .cache
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        cache.evict(&file_number);
    }

    /// Drop every cached handle.
    pub fn clear(&self) {
        let mut cache = self
            .cache
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        cache.clear();
    }

    /// Number of open tables currently cached.
    pub fn len(&self) -> usize {
        self.cache
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .len()
    }

    /// Whether no tables are cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
