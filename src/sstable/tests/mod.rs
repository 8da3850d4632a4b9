mod tests_build_read;
mod tests_corruption;

use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::cache::BlockCache;
use crate::keys::{InternalKey, SequenceNumber, ValueType};

use super::{Table, TableBuilder, TableError, TableIterator};

/// Shared 1 MiB block cache for test tables.
pub(super) fn test_block_cache() -> Arc<Mutex<BlockCache>> {
    Arc::new(Mutex::new(BlockCache::new(1 << 20)))
}

/// Build a table at `path` from `(user_key, sequence, value_type, value)`
/// rows, which must already be in internal-key order.
pub(super) fn build_table(
    path: &Path,
    rows: &[(&[u8], SequenceNumber, ValueType, &[u8])],
    block_size: usize,
) -> Result<super::builder::TableSummary, TableError> {
    let mut builder = TableBuilder::with_block_size(path, rows.len(), block_size)?;
    for (user_key, sequence, value_type, value) in rows {
        let key = InternalKey::new(user_key, *sequence, *value_type);
        builder.add(key.as_bytes(), value)?;
    }
    builder.finish()
}

/// Open a freshly built test table.
pub(super) fn open_table(path: &Path, cache: Arc<Mutex<BlockCache>>) -> Arc<Table> {
    Arc::new(Table::open(path, 1, cache).unwrap())
}
