
use std::path::Path;

use tracing_subscriber::EnvFilter;

use crate::Deadline;
use crate::engine::{ColumnFamily, Options};

/// Opt-in tracing for debugging test failures: `RUST_LOG=reefdb=trace`.
pub(super) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Options with a tiny write buffer so every write seals the memtable.
pub(super) fn tiny_buffer_options() -> Options {
    Options {
        write_buffer_size: 1,
        ..Options::default()
    }
}

pub(super) fn open(path: &Path, options: Options) -> ColumnFamily {
    ColumnFamily::open(path, options).expect("open column family")
}

pub(super) fn put(cf: &ColumnFamily, key: &[u8], value: &[u8]) {
    cf.put(key.to_vec(), value.to_vec(), &Deadline::none())
        .expect("put");
}

pub(super) fn get(cf: &ColumnFamily, key: &[u8]) -> Option<Vec<u8>> {
    cf.get(key, &Deadline::none()).expect("get")
}
