//! Column family — the engine coordinating one shard's storage.
//!
//! A [`ColumnFamily`] owns the active memtable, the queue of sealed
//! (immutable) memtables, the commit log, the version set, and the block
//! and table caches. One instance backs one shard; shards share nothing.
//!
//! # Write path
//!
//! Strictly ordered per shard, under one state lock:
//!
//! 1. assign the next sequence number;
//! 2. append the serialized mutation to the commit log (acceptance, not
//!    fsync — [`ColumnFamily::sync`] is the durability barrier);
//! 3. insert into the active memtable;
//! 4. past the dirty-size threshold, seal the memtable, rotate the log,
//!    and queue the sealed memtable for flush;
//! 5. when the immutable queue is full, the write blocks (deadline-aware
//!    backpressure).
//!
//! # Read path
//!
//! Newest first: active memtable → immutables in reverse seal order →
//! level-0 tables (every overlapping candidate, largest sequence wins) →
//! levels ≥ 1 by per-level binary search. The first non-tombstone wins;
//! a tombstone means absent. An empty level-0 candidate set still falls
//! through to deeper levels.
//!
//! # Background work
//!
//! One worker thread per column family flushes the oldest immutable
//! memtable into a level-0 sstable (retrying with bounded backoff on
//! failure) and runs compactions when a level's score reaches 1.0.
//! Running both on a single thread keeps the one-compaction-at-a-time
//! rule structural.
//!
//! # Failure
//!
//! A commit-log I/O error poisons the engine: subsequent writes fail
//! fast, reads are still served.

mod compaction;

#[cfg(test)]
mod tests;

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::Deadline;
use crate::cache::{BlockCache, DEFAULT_BLOCK_CACHE_BUDGET};
use crate::commitlog::{CommitLog, CommitLogError, LogReader, ReplayStop};
use crate::filename::{self, FileType};
use crate::keys::SequenceNumber;
use crate::memtable::{Memtable, MemtableError, MemtableGetResult, Mutation};
use crate::sstable::{TableBuilder, TableCache, TableError};
use crate::version::{FileMetadata, VersionEdit, VersionError, VersionSet};

/// Errors surfaced by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Checksum mismatch, truncated structure, or magic mismatch.
    #[error("corruption: {0}")]
    Corruption(String),

    /// Storage refused an operation.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A caller-supplied argument is out of range or malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The request deadline expired at a blocking point.
    #[error("timed out")]
    Timeout,

    /// An insert reached a sealed memtable.
    #[error("write disabled")]
    WriteDisabled,

    /// The engine is closing; no new work is accepted.
    #[error("shutting down")]
    ShuttingDown,

    /// A commit-log write failed earlier; writes fail fast from then on.
    #[error("engine poisoned: {0}")]
    Poisoned(String),
}

impl From<CommitLogError> for EngineError {
    fn from(err: CommitLogError) -> Self {
        match err {
            CommitLogError::Io(e) => EngineError::Io(e),
            CommitLogError::Timeout => EngineError::Timeout,
            CommitLogError::ShuttingDown => EngineError::ShuttingDown,
            CommitLogError::Poisoned(detail) => EngineError::Poisoned(detail),
            CommitLogError::RecordTooLarge(n) => {
                EngineError::InvalidArgument(format!("mutation of {n} bytes exceeds log limits"))
            }
        }
    }
}

impl From<MemtableError> for EngineError {
    fn from(err: MemtableError) -> Self {
        match err {
            MemtableError::WriteDisabled => EngineError::WriteDisabled,
            other => EngineError::Corruption(other.to_string()),
        }
    }
}

impl From<TableError> for EngineError {
    fn from(err: TableError) -> Self {
        match err {
            TableError::Io(e) => EngineError::Io(e),
            other => EngineError::Corruption(other.to_string()),
        }
    }
}

impl From<VersionError> for EngineError {
    fn from(err: VersionError) -> Self {
        match err {
            VersionError::Io(e) => EngineError::Io(e),
            VersionError::Table(t) => t.into(),
            VersionError::Log(l) => l.into(),
            VersionError::Corruption(c) => EngineError::Corruption(c),
        }
    }
}

/// Tuning knobs for a [`ColumnFamily`]. Defaults suit tests and small
/// deployments; production shards raise the buffer sizes.
pub struct Options {
    /// Memtable dirty-size threshold that triggers a seal (bytes).
    pub write_buffer_size: usize,
    /// Sealed memtables allowed to queue before writes block.
    pub max_immutable_memtables: usize,
    /// Soft byte budget of the block cache.
    pub block_cache_budget: usize,
    /// Target data-block size inside sstables.
    pub block_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            write_buffer_size: 4 << 20,
            max_immutable_memtables: 2,
            block_cache_budget: DEFAULT_BLOCK_CACHE_BUDGET,
            block_size: crate::sstable::DEFAULT_BLOCK_SIZE,
        }
    }
}

impl Options {
    fn validate(&self) -> Result<(), EngineError> {
        if self.max_immutable_memtables == 0 {
            return Err(EngineError::InvalidArgument(
                "max_immutable_memtables must be at least 1".into(),
            ));
        }
        if self.block_size < 64 {
            return Err(EngineError::InvalidArgument(
                "block_size must be at least 64 bytes".into(),
            ));
        }
        Ok(())
    }
}

/// Point-in-time counters returned by [`ColumnFamily::stats`].
#[derive(Debug, Clone)]
pub struct EngineStats {
    /// Highest sequence number assigned.
    pub last_sequence: SequenceNumber,
    /// Dirty bytes in the active memtable.
    pub active_dirty_bytes: usize,
    /// Sealed memtables awaiting flush.
    pub immutable_count: usize,
    /// Files per level in the current version.
    pub files_per_level: Vec<usize>,
    /// Whether the write path is poisoned.
    pub poisoned: bool,
}

/// A sealed memtable waiting for its flush, with the commit-log segment
/// that covers it.
struct ImmutableMemtable {
    memtable: Arc<Memtable>,
    log_number: u64,
}

/// State guarded by the engine's single lock.
struct CfState {
    active: Memtable,
    /// Log segment receiving the active memtable's mutations.
    active_log_number: u64,
    /// Oldest first.
    immutables: VecDeque<ImmutableMemtable>,
    versions: VersionSet,
    log: CommitLog,
    last_sequence: SequenceNumber,
    /// Gate: shutdown must not race an active compaction.
    compaction_in_progress: bool,
}

struct CfInner {
    dir: PathBuf,
    options: Options,
    state: Mutex<CfState>,
    /// Wakes the background worker.
    work_cv: Condvar,
    /// Wakes writers waiting for an immutable-queue slot, and flush
    /// waiters.
    slots_cv: Condvar,
    shutdown: AtomicBool,
    table_cache: TableCache,
    block_cache: Arc<Mutex<BlockCache>>,
    /// Last background flush/compaction failure, for stats and logs.
    bg_error: Mutex<Option<String>>,
}

impl CfInner {
    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

/// The storage engine behind one shard.
pub struct ColumnFamily {
    inner: Arc<CfInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ColumnFamily {
    /// Open (or create) the column family rooted at `dir`.
    ///
    /// Recovery replays every commit-log segment at or above the version
    /// set's log number; a recovered non-empty memtable is flushed to a
    /// level-0 table before the old segments are released.
    pub fn open(dir: impl AsRef<Path>, options: Options) -> Result<ColumnFamily, EngineError> {
        options.validate()?;
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        // Advisory lock: created at open, removed at close.
        fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(filename::lock_file(&dir))?;

        let mut versions = VersionSet::open(&dir)?;

        // Replay commit logs newer than the last published log number.
        let mut recovered = Memtable::new();
        let mut max_sequence = versions.last_sequence();
        let mut segments: Vec<u64> = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str()
                && let Some(FileType::CommitLog(n)) = filename::parse_file_name(name)
                && n >= versions.log_number()
            {
                segments.push(n);
            }
        }
        segments.sort_unstable();
        for number in &segments {
            let replayed = replay_segment(&dir, *number, &mut recovered)?;
            max_sequence = max_sequence.max(recovered.highest_sequence());
            debug!(segment = number, records = replayed, "commit log segment replayed");
        }

        // New log segment for the fresh memtable.
        let new_log_number = versions.new_file_number();
        let log = CommitLog::create(filename::log_file(&dir, new_log_number))?;

        let block_cache = Arc::new(Mutex::new(BlockCache::new(options.block_cache_budget)));
        let table_cache = TableCache::new(&dir, Arc::clone(&block_cache));

        // Materialise the recovered memtable so the old segments can be
        // released; its contents are then covered by a published table.
        let mut edit = VersionEdit {
            log_number: Some(new_log_number),
            last_sequence: Some(max_sequence),
            ..VersionEdit::default()
        };
        if !recovered.is_empty() {
            recovered.seal();
            let file_number = versions.new_file_number();
            let path = filename::table_file(&dir, file_number);
            let mut builder =
                TableBuilder::with_block_size(&path, recovered.len(), options.block_size)?;
            for (key, value) in recovered.iter() {
                builder.add(key.as_bytes(), value)?;
            }
            let summary = builder.finish()?;
            edit.add_file(
                0,
                FileMetadata {
                    number: file_number,
                    file_size: summary.file_size,
                    smallest: summary.smallest,
                    largest: summary.largest,
                },
            );
            info!(
                entries = summary.num_entries,
                file_number, "recovered memtable flushed to level 0"
            );
        }
        versions.set_last_sequence(max_sequence);
        versions.log_and_apply(edit)?;

        let inner = Arc::new(CfInner {
            dir: dir.clone(),
            options,
            state: Mutex::new(CfState {
                active: Memtable::new(),
                active_log_number: new_log_number,
                immutables: VecDeque::new(),
                versions,
                log,
                last_sequence: max_sequence,
                compaction_in_progress: false,
            }),
            work_cv: Condvar::new(),
            slots_cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            table_cache,
            block_cache,
            bg_error: Mutex::new(None),
        });

        // Startup garbage collection: temp files, released segments,
        // unreferenced tables from an earlier crash.
        {
            let mut state = lock_state(&inner);
            delete_obsolete_files(&inner, &mut state);
        }

        let worker = {
            let inner = Arc::clone(&inner);
            std::thread::Builder::new()
                .name("reefdb-worker".into())
                .spawn(move || worker_loop(inner))?
        };

        info!(dir = %dir.display(), last_sequence = max_sequence, "column family opened");
        Ok(ColumnFamily {
            inner,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Insert or overwrite `key`.
    pub fn put(
        &self,
        key: Vec<u8>,
        value: Vec<u8>,
        deadline: &Deadline,
    ) -> Result<(), EngineError> {
        self.write(key, value, false, deadline)
    }

    /// Delete `key` (write a tombstone).
    pub fn delete(&self, key: Vec<u8>, deadline: &Deadline) -> Result<(), EngineError> {
        self.write(key, Vec::new(), true, deadline)
    }

    fn write(
        &self,
        key: Vec<u8>,
        value: Vec<u8>,
        is_delete: bool,
        deadline: &Deadline,
    ) -> Result<(), EngineError> {
        if deadline.expired() {
            return Err(EngineError::Timeout);
        }
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(EngineError::ShuttingDown);
        }

        let mut state = lock_state(&self.inner);

        // Backpressure: wait for room in the immutable queue.
        while state.immutables.len() >= self.inner.options.max_immutable_memtables {
            if deadline.expired() {
                return Err(EngineError::Timeout);
            }
            if self.inner.shutdown.load(Ordering::Acquire) {
                return Err(EngineError::ShuttingDown);
            }
            let wait = deadline.remaining_or(Duration::from_millis(100));
            let (guard, _) = self
                .inner
                .slots_cv
                .wait_timeout(state, wait)
                .unwrap_or_else(|poison| poison.into_inner());
            state = guard;
        }

        let sequence = state.last_sequence + 1;
        let mutation = if is_delete {
            Mutation::delete(sequence, key)
        } else {
            Mutation::put(sequence, key, value)
        };

        let mut payload = Vec::with_capacity(mutation.serialized_size());
        mutation.encode_to(&mut payload);
        state.log.append(&payload, deadline)?;

        state.last_sequence = sequence;
        state.active.apply(mutation)?;

        if state.active.dirty_size() >= self.inner.options.write_buffer_size {
            seal_active(&self.inner, &mut state)?;
            self.inner.work_cv.notify_all();
        }
        Ok(())
    }

    /// Look up `key`. `Ok(None)` means the key is absent (never written,
    /// or newest entry is a tombstone).
    pub fn get(&self, key: &[u8], deadline: &Deadline) -> Result<Option<Vec<u8>>, EngineError> {
        if deadline.expired() {
            return Err(EngineError::Timeout);
        }

        let (version, snapshot) = {
            let state = lock_state(&self.inner);

            match state.active.get(key, state.last_sequence) {
                MemtableGetResult::Found(value) => return Ok(Some(value)),
                MemtableGetResult::Deleted => return Ok(None),
                MemtableGetResult::NotFound => {}
            }
            for immutable in state.immutables.iter().rev() {
                match immutable.memtable.get(key, state.last_sequence) {
                    MemtableGetResult::Found(value) => return Ok(Some(value)),
                    MemtableGetResult::Deleted => return Ok(None),
                    MemtableGetResult::NotFound => {}
                }
            }
            (state.versions.current(), state.last_sequence)
        };

        // Table reads happen outside the state lock; the version snapshot
        // pins every file it references.
        if deadline.expired() {
            return Err(EngineError::Timeout);
        }
        Ok(version.get(&self.inner.table_cache, key, snapshot)?)
    }

    /// Durability barrier: every write accepted before this call is on
    /// disk when it returns.
    pub fn sync(&self, deadline: &Deadline) -> Result<(), EngineError> {
        let state = lock_state(&self.inner);
        state.log.sync(deadline)?;
        Ok(())
    }

    /// Seal the active memtable (if non-empty) and wait until every
    /// sealed memtable has been flushed to level 0.
    pub fn flush(&self, deadline: &Deadline) -> Result<(), EngineError> {
        let mut state = lock_state(&self.inner);
        if !state.active.is_empty() {
            seal_active(&self.inner, &mut state)?;
            self.inner.work_cv.notify_all();
        }
        while !state.immutables.is_empty() {
            if deadline.expired() {
                return Err(EngineError::Timeout);
            }
            if self.inner.shutdown.load(Ordering::Acquire) {
                return Err(EngineError::ShuttingDown);
            }
            let bg_error = self
                .inner
                .bg_error
                .lock()
                .unwrap_or_else(|poison| poison.into_inner())
                .clone();
            if let Some(err) = bg_error {
                return Err(EngineError::Io(io::Error::other(err)));
            }
            let wait = deadline.remaining_or(Duration::from_millis(100));
            let (guard, _) = self
                .inner
                .slots_cv
                .wait_timeout(state, wait)
                .unwrap_or_else(|poison| poison.into_inner());
            state = guard;
        }
        Ok(())
    }

    /// Run one compaction round on the calling thread.
    ///
    /// Picks the highest-scoring level, or — when no level is over
    /// threshold and `force` is set — the shallowest non-empty level.
    /// Returns whether a compaction ran.
    pub fn compact_once(&self, force: bool) -> Result<bool, EngineError> {
        compaction::compact_once(&self.inner, force)
    }

    /// Highest sequence number assigned so far.
    pub fn last_sequence(&self) -> SequenceNumber {
        lock_state(&self.inner).last_sequence
    }

    /// A snapshot of engine counters.
    pub fn stats(&self) -> EngineStats {
        let state = lock_state(&self.inner);
        let version = state.versions.current();
        EngineStats {
            last_sequence: state.last_sequence,
            active_dirty_bytes: state.active.dirty_size(),
            immutable_count: state.immutables.len(),
            files_per_level: (0..crate::version::NUM_LEVELS)
                .map(|l| version.files(l).len())
                .collect(),
            poisoned: state.log.is_poisoned(),
        }
    }

    /// Graceful shutdown: stop writers, flush sealed memtables, close the
    /// commit log, drop caches, release the lock file.
    pub fn close(&self) -> Result<(), EngineError> {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return Ok(()); // already closed
        }
        self.inner.work_cv.notify_all();
        self.inner.slots_cv.notify_all();
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }

        // The worker is gone; flush the remaining immutables inline.
        loop {
            match flush_oldest_immutable(&self.inner) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    error!(error = %e, "final flush failed during close");
                    break;
                }
            }
        }
        let state = lock_state(&self.inner);
        state.log.sync(&Deadline::none())?;

        self.inner.table_cache.clear();
        self.inner
            .block_cache
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .clear();
        drop(state);

        let _ = fs::remove_file(filename::lock_file(&self.inner.dir));
        info!(dir = %self.inner.dir.display(), "column family closed");
        Ok(())
    }
}

impl Drop for ColumnFamily {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(error = %e, "column family close failed on drop");
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Internal helpers
// ------------------------------------------------------------------------------------------------

fn lock_state(inner: &CfInner) -> std::sync::MutexGuard<'_, CfState> {
    inner
        .state
        .lock()
        .unwrap_or_else(|poison| poison.into_inner())
}

/// Replay one commit-log segment into `memtable`.
///
/// Stops at the first bad record (the tail after it is reported lost, not
/// guessed); an orphan fragment at the tail is a clean stop.
fn replay_segment(dir: &Path, number: u64, memtable: &mut Memtable) -> Result<u64, EngineError> {
    let path = filename::log_file(dir, number);
    let mut reader = LogReader::open(&path)?;
    let mut records = 0u64;
    loop {
        match reader.read_record()? {
            Some(payload) => match Mutation::decode(&payload) {
                Ok(mutation) => {
                    memtable.apply(mutation)?;
                    records += 1;
                }
                Err(e) => {
                    warn!(
                        segment = number,
                        records,
                        error = %e,
                        "undecodable mutation; dropping the rest of the segment"
                    );
                    break;
                }
            },
            None => break,
        }
    }
    match reader.stop_reason() {
        Some(ReplayStop::Corruption(reason)) => {
            warn!(
                segment = number,
                records, reason, "commit log corruption; records after this point are lost"
            );
        }
        Some(ReplayStop::TruncatedTail) => {
            debug!(segment = number, records, "commit log ends mid-record");
        }
        _ => {}
    }
    Ok(records)
}

/// Seal the active memtable, rotate the commit log, and queue the sealed
/// memtable for flush. Caller holds the state lock.
fn seal_active(inner: &CfInner, state: &mut CfState) -> Result<(), EngineError> {
    let new_log_number = state.versions.new_file_number();
    state
        .log
        .rotate(filename::log_file(&inner.dir, new_log_number))?;

    let mut sealed = std::mem::replace(&mut state.active, Memtable::new());
    sealed.seal();
    let sealed_log_number = state.active_log_number;
    state.active_log_number = new_log_number;
    debug!(
        dirty = sealed.dirty_size(),
        entries = sealed.len(),
        log_segment = sealed_log_number,
        "memtable sealed"
    );
    state.immutables.push_back(ImmutableMemtable {
        memtable: Arc::new(sealed),
        log_number: sealed_log_number,
    });
    Ok(())
}

/// Flush the oldest immutable memtable into a level-0 table and publish
/// the version that covers it. Returns `false` when the queue is empty.
///
/// The table build runs without the state lock; flushes are serialised
/// (worker thread, or close after the worker has exited), so the front of
/// the queue cannot change underneath the build.
fn flush_oldest_immutable(inner: &CfInner) -> Result<bool, EngineError> {
    let (memtable, file_number) = {
        let mut state = lock_state(inner);
        let Some(front) = state.immutables.front() else {
            return Ok(false);
        };
        (Arc::clone(&front.memtable), state.versions.new_file_number())
    };
    let path = filename::table_file(&inner.dir, file_number);

    let build = || -> Result<FileMetadata, EngineError> {
        let mut builder =
            TableBuilder::with_block_size(&path, memtable.len(), inner.options.block_size)?;
        for (key, value) in memtable.iter() {
            builder.add(key.as_bytes(), value)?;
        }
        let summary = builder.finish()?;
        Ok(FileMetadata {
            number: file_number,
            file_size: summary.file_size,
            smallest: summary.smallest,
            largest: summary.largest,
        })
    };
    let meta = match build() {
        Ok(meta) => meta,
        Err(e) => {
            let _ = fs::remove_file(&path);
            return Err(e);
        }
    };

    let mut state = lock_state(inner);

    // The next log still needed is the next immutable's segment, or the
    // active segment once the queue drains.
    let released_up_to = state
        .immutables
        .iter()
        .nth(1)
        .map(|imm| imm.log_number)
        .unwrap_or(state.active_log_number);

    let mut edit = VersionEdit {
        log_number: Some(released_up_to),
        last_sequence: Some(state.last_sequence),
        ..VersionEdit::default()
    };
    edit.add_file(0, meta);
    let last_sequence = state.last_sequence;
    state.versions.set_last_sequence(last_sequence);
    state.versions.log_and_apply(edit)?;

    let flushed = state
        .immutables
        .pop_front()
        .expect("front checked above");
    info!(
        file_number,
        entries = flushed.memtable.len(),
        log_segment = flushed.log_number,
        "immutable memtable flushed to level 0"
    );

    delete_obsolete_files(inner, &mut state);
    drop(state);

    // Tear the memtable down in bounded batches when these were the last
    // references.
    drop(memtable);
    if let Some(mut memtable) = Arc::into_inner(flushed.memtable) {
        memtable.clear_gently();
    }
    Ok(true)
}

/// Remove files no live version references. Caller holds the state lock.
fn delete_obsolete_files(inner: &CfInner, state: &mut CfState) {
    let live = state.versions.live_files();
    let log_floor = state.versions.log_number();
    let manifest_number = state.versions.manifest_number();
    let pending_logs: Vec<u64> = state.immutables.iter().map(|imm| imm.log_number).collect();

    let Ok(entries) = fs::read_dir(&inner.dir) else {
        return;
    };
    for entry in entries.flatten() {
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        let keep = match filename::parse_file_name(&name) {
            Some(FileType::CommitLog(n)) => {
                n >= log_floor || n == state.active_log_number || pending_logs.contains(&n)
            }
            Some(FileType::Table(n)) => {
                let keep = live.contains(&n);
                if !keep {
                    inner.table_cache.evict(n);
                }
                keep
            }
            Some(FileType::Manifest(n)) => n == manifest_number,
            Some(FileType::Temp(_)) => false,
            _ => true,
        };
        if !keep {
            debug!(file = %name, "removing obsolete file");
            let _ = fs::remove_file(inner.dir.join(&name));
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Background worker
// ------------------------------------------------------------------------------------------------

fn worker_loop(inner: Arc<CfInner>) {
    let mut flush_backoff = Duration::from_millis(100);
    loop {
        // Wait for work.
        {
            let mut state = lock_state(&inner);
            loop {
                if inner.shutdown.load(Ordering::Acquire) {
                    return;
                }
                let compaction_due = state.versions.current().best_compaction_level().1 >= 1.0;
                if !state.immutables.is_empty() || compaction_due {
                    break;
                }
                let (guard, _) = inner
                    .work_cv
                    .wait_timeout(state, Duration::from_millis(500))
                    .unwrap_or_else(|poison| poison.into_inner());
                state = guard;
            }
        }

        // Flush first: immutables hold memory and block writers.
        let flushed = match flush_oldest_immutable(&inner) {
            Ok(flushed) => {
                flush_backoff = Duration::from_millis(100);
                *inner.bg_error.lock().unwrap_or_else(|p| p.into_inner()) = None;
                inner.slots_cv.notify_all();
                flushed
            }
            Err(e) => {
                // Keep the immutable and retry with bounded backoff.
                warn!(error = %e, backoff_ms = flush_backoff.as_millis() as u64, "flush failed; retrying");
                *inner.bg_error.lock().unwrap_or_else(|p| p.into_inner()) = Some(e.to_string());
                std::thread::sleep(flush_backoff);
                flush_backoff = (flush_backoff * 2).min(Duration::from_secs(5));
                continue;
            }
        };

        if inner.shutdown.load(Ordering::Acquire) {
            return;
        }
        let compacted = match compaction::compact_once(&inner, false) {
            Ok(compacted) => compacted,
            Err(e) => {
                warn!(error = %e, "background compaction failed");
                *inner.bg_error.lock().unwrap_or_else(|p| p.into_inner()) = Some(e.to_string());
                std::thread::sleep(Duration::from_millis(500));
                false
            }
        };

        // No progress (a foreground compaction may hold the gate): back
        // off instead of spinning on the still-due score.
        if !flushed && !compacted {
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}
