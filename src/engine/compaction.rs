//! Background compaction: merge overlapping tables downward.
//!
//! A compaction takes the files picked by the version set (inputs at the
//! trigger level plus overlapping files one level deeper), k-way merges
//! them into a newest-wins stream, and writes bounded-size output tables
//! at the deeper level. Older versions of a key are dropped; tombstones
//! are dropped only when no level below the output could still hold the
//! key. The swap of inputs for outputs is one published version edit.
//!
//! One compaction runs at a time per column family; the
//! `compaction_in_progress` gate also keeps shutdown from racing an
//! active merge.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs;

use tracing::{debug, info};

use crate::filename;
use crate::keys::{self, ValueType};
use crate::sstable::{TableBuilder, TableIterator};
use crate::version::{FileMetadata, MAX_OUTPUT_FILE_SIZE, NUM_LEVELS, VersionEdit};

use super::{CfInner, EngineError, lock_state};

/// One entry in the merge heap. Ordered as a *max*-heap on the inverted
/// key comparison so `BinaryHeap::pop` yields the smallest internal key;
/// ties break toward the lower source index (newer input file).
struct HeapEntry {
    key: Vec<u8>,
    value: Vec<u8>,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        keys::internal_key_cmp(&self.key, &other.key)
            .then_with(|| self.source.cmp(&other.source))
            .reverse()
    }
}

/// Run one compaction round; returns whether anything was compacted.
///
/// With `force`, a round runs even when no level is over threshold, on
/// the shallowest non-empty level (used by tests and operator tooling).
pub(super) fn compact_once(inner: &CfInner, force: bool) -> Result<bool, EngineError> {
    // Acquire the single-compaction gate and pick inputs.
    let (pick, version) = {
        let mut state = lock_state(inner);
        if state.compaction_in_progress || inner.shutdown_requested() {
            return Ok(false);
        }
        let pick = state.versions.pick_compaction().or_else(|| {
            if !force {
                return None;
            }
            let version = state.versions.current();
            (0..NUM_LEVELS - 1)
                .find(|l| !version.files(*l).is_empty())
                .and_then(|level| state.versions.pick_compaction_at(level))
        });
        let Some(pick) = pick else {
            return Ok(false);
        };
        state.compaction_in_progress = true;
        (pick, state.versions.current())
    };

    let result = run_compaction(inner, &pick, &version);

    let mut state = lock_state(inner);
    state.compaction_in_progress = false;
    let outputs = match result {
        Ok(outputs) => outputs,
        Err(e) => return Err(e),
    };

    let output_level = (pick.level + 1).min(NUM_LEVELS - 1);
    let mut edit = VersionEdit {
        last_sequence: Some(state.last_sequence),
        ..VersionEdit::default()
    };
    for file in pick.base.iter() {
        edit.delete_file(pick.level, file.number);
    }
    for file in pick.parents.iter() {
        edit.delete_file(output_level, file.number);
    }
    for meta in &outputs {
        edit.add_file(output_level, meta.clone());
    }
    // Resume the next round after the largest input key of this one.
    let pointer = pick
        .base
        .iter()
        .map(|f| f.largest.clone())
        .max_by(|a, b| keys::internal_key_cmp(a, b))
        .unwrap_or_default();
    edit.compact_pointers.push((pick.level, pointer));

    state.versions.log_and_apply(edit)?;

    info!(
        level = pick.level,
        inputs = pick.base.len() + pick.parents.len(),
        outputs = outputs.len(),
        "compaction published"
    );
    super::delete_obsolete_files(inner, &mut state);
    Ok(true)
}

/// Merge the inputs into bounded-size output tables at `level + 1`.
fn run_compaction(
    inner: &CfInner,
    pick: &crate::version::CompactionPick,
    version: &crate::version::Version,
) -> Result<Vec<FileMetadata>, EngineError> {
    let output_level = (pick.level + 1).min(NUM_LEVELS - 1);

    // Open one iterator per input, primed at its first entry.
    let mut iters: Vec<TableIterator> = Vec::new();
    let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::new();
    for file in pick.base.iter().chain(pick.parents.iter()) {
        let table = inner.table_cache.get_table(file.number)?;
        let mut iter = TableIterator::new(table);
        iter.seek_to_first();
        let source = iters.len();
        if iter.valid() {
            heap.push(HeapEntry {
                key: iter.key().to_vec(),
                value: iter.value().to_vec(),
                source,
            });
        }
        iters.push(iter);
    }

    let mut outputs: Vec<FileMetadata> = Vec::new();
    let mut builder: Option<(u64, TableBuilder)> = None;
    let mut last_user_key: Option<Vec<u8>> = None;
    let mut dropped_versions = 0u64;
    let mut dropped_tombstones = 0u64;

    while let Some(entry) = heap.pop() {
        // Refill from the source that produced this entry.
        {
            let iter = &mut iters[entry.source];
            if iter.next() {
                heap.push(HeapEntry {
                    key: iter.key().to_vec(),
                    value: iter.value().to_vec(),
                    source: entry.source,
                });
            }
        }

        let parsed = keys::parse_internal_key(&entry.key)
            .map_err(|e| EngineError::Corruption(e.to_string()))?;

        // Newest-wins: later entries for the same user key are shadowed.
        if last_user_key.as_deref() == Some(parsed.user_key) {
            dropped_versions += 1;
            continue;
        }
        last_user_key = Some(parsed.user_key.to_vec());

        // A tombstone is spent once no deeper level can hold the key.
        if parsed.value_type == ValueType::Deletion
            && !version.key_may_exist_below(output_level, parsed.user_key)
        {
            dropped_tombstones += 1;
            continue;
        }

        if builder.is_none() {
            let file_number = {
                let mut state = lock_state(inner);
                state.versions.new_file_number()
            };
            let path = filename::table_file(&inner.dir, file_number);
            // Sizing hint: inputs bound the output entry count.
            let hint: usize = pick
                .base
                .iter()
                .chain(pick.parents.iter())
                .map(|f| (f.file_size / 64).max(16) as usize)
                .sum();
            builder = Some((
                file_number,
                TableBuilder::with_block_size(&path, hint, inner.options.block_size)?,
            ));
        }
        let (_, current) = builder.as_mut().expect("builder installed above");
        current.add(&entry.key, &entry.value)?;

        if current.file_size() >= MAX_OUTPUT_FILE_SIZE {
            let (file_number, done) = builder.take().expect("builder active");
            outputs.push(finish_output(file_number, done)?);
        }
    }

    // Surface any iterator error before trusting the merged stream.
    for mut iter in iters {
        if let Some(e) = iter.take_error() {
            if let Some((_, done)) = builder.take() {
                let _ = done.abandon();
            }
            for meta in &outputs {
                let _ = fs::remove_file(filename::table_file(&inner.dir, meta.number));
            }
            return Err(e.into());
        }
    }

    if let Some((file_number, done)) = builder.take() {
        if done.num_entries() > 0 {
            outputs.push(finish_output(file_number, done)?);
        } else {
            done.abandon()?;
        }
    }

    debug!(
        level = pick.level,
        outputs = outputs.len(),
        dropped_versions,
        dropped_tombstones,
        "compaction merge complete"
    );
    Ok(outputs)
}

fn finish_output(file_number: u64, builder: TableBuilder) -> Result<FileMetadata, EngineError> {
    let summary = builder.finish()?;
    Ok(FileMetadata {
        number: file_number,
        file_size: summary.file_size,
        smallest: summary.smallest,
        largest: summary.largest,
    })
}
