//! Versions: immutable snapshots of the sstable set.
//!
//! A [`Version`] lists, per level, the sstables that make up a column
//! family at one instant. Level 0 may hold overlapping ranges (newest
//! file first); levels ≥ 1 hold pairwise disjoint, sorted runs. Reads
//! always observe exactly one fully published version.
//!
//! A [`VersionEdit`] is the delta between two versions: files added and
//! deleted per level, plus counter advances (log number, next file
//! number, last sequence) and compaction pointers. Edits are appended to
//! a **MANIFEST** file using the commit-log record framing, and the
//! well-known `CURRENT` file names the live MANIFEST. `CURRENT` is
//! rewritten via a temp file + rename only after the new MANIFEST is
//! fsynced.
//!
//! # Publication
//!
//! [`VersionSet::log_and_apply`] walks the state machine
//! `STABLE → EDITING → LOGGING → SWAPPING → STABLE`: the edit is applied
//! to a copy of the current version, durably appended to the MANIFEST,
//! and only then does a pointer swap expose the new version. One editor
//! at a time; the engine serialises callers.
//!
//! # Invariants
//!
//! - A file referenced by any live version is never deleted
//!   ([`VersionSet::live_files`] feeds garbage collection).
//! - File numbers are strictly monotonic.
//! - `last_sequence` is ≥ every sequence in the version's files.

#[cfg(test)]
mod tests;

use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::codec::{self, CodecError};
use crate::commitlog::{CommitLogError, LogReader, LogWriter, ReplayStop};
use crate::filename;
use crate::keys::{self, SequenceNumber};
use crate::sstable::{TableCache, TableError, TableGetResult};

/// Number of levels in the tree.
pub const NUM_LEVELS: usize = 7;

/// Level-0 file count that triggers compaction.
pub const L0_COMPACTION_TRIGGER: usize = 4;

/// Byte budget of level 1; each deeper level gets ten times more.
pub const LEVEL1_MAX_BYTES: u64 = 10 * 1024 * 1024;

/// Bound on the size of a compaction output file.
pub const MAX_OUTPUT_FILE_SIZE: u64 = 2 * 1024 * 1024;

/// Errors from version bookkeeping and the leveled read path.
#[derive(Debug, Error)]
pub enum VersionError {
    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// MANIFEST or CURRENT contents are damaged.
    #[error("corruption: {0}")]
    Corruption(String),

    /// MANIFEST record framing failed.
    #[error("manifest log: {0}")]
    Log(#[from] CommitLogError),

    /// A table read failed.
    #[error("table: {0}")]
    Table(#[from] TableError),
}

impl From<CodecError> for VersionError {
    fn from(err: CodecError) -> Self {
        VersionError::Corruption(err.to_string())
    }
}

// ------------------------------------------------------------------------------------------------
// FileMetadata
// ------------------------------------------------------------------------------------------------

/// Descriptor of one sstable inside a version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    /// Monotonic file number (names the `.sst` file).
    pub number: u64,
    /// File size in bytes.
    pub file_size: u64,
    /// Smallest internal key in the table.
    pub smallest: Vec<u8>,
    /// Largest internal key in the table.
    pub largest: Vec<u8>,
}

impl FileMetadata {
    /// Whether `[smallest, largest]` may contain `user_key`.
    pub fn overlaps_user_key(&self, user_key: &[u8]) -> bool {
        keys::extract_user_key(&self.smallest) <= user_key
            && user_key <= keys::extract_user_key(&self.largest)
    }

    /// Whether this file's user-key range intersects `[start, end]`.
    pub fn overlaps_range(&self, start: &[u8], end: &[u8]) -> bool {
        keys::extract_user_key(&self.smallest) <= end
            && start <= keys::extract_user_key(&self.largest)
    }
}

// ------------------------------------------------------------------------------------------------
// Version
// ------------------------------------------------------------------------------------------------

/// Immutable snapshot of the sstable set, one file list per level.
pub struct Version {
    files: [Vec<Arc<FileMetadata>>; NUM_LEVELS],
}

impl Version {
    /// A version holding no files.
    pub fn empty() -> Version {
        Version {
            files: Default::default(),
        }
    }

    /// Files at `level`; level 0 is newest-first, deeper levels sorted by
    /// smallest key.
    pub fn files(&self, level: usize) -> &[Arc<FileMetadata>] {
        &self.files[level]
    }

    /// Total bytes at `level`.
    pub fn level_bytes(&self, level: usize) -> u64 {
        self.files[level].iter().map(|f| f.file_size).sum()
    }

    /// Total number of files across all levels.
    pub fn file_count(&self) -> usize {
        self.files.iter().map(Vec::len).sum()
    }

    /// Look up `user_key` at `snapshot`, newest level first.
    ///
    /// Level 0 consults *every* overlapping candidate and keeps the hit
    /// with the largest sequence; deeper levels binary-search for the one
    /// candidate file per level. An empty level-0 candidate set still
    /// falls through to deeper levels.
    pub fn get(
        &self,
        table_cache: &TableCache,
        user_key: &[u8],
        snapshot: SequenceNumber,
    ) -> Result<Option<Vec<u8>>, VersionError> {
        // Level 0: overlapping candidates, largest sequence wins.
        let mut best: Option<(SequenceNumber, Option<Vec<u8>>)> = None;
        for file in &self.files[0] {
            if !file.overlaps_user_key(user_key) {
                continue;
            }
            let table = table_cache.get_table(file.number)?;
            if table.is_suspect() {
                warn!(file_number = file.number, "skipping suspect level-0 table");
                continue;
            }
            match table.get(user_key, snapshot)? {
                TableGetResult::Found(seq, value) => {
                    if best.as_ref().is_none_or(|(s, _)| seq > *s) {
                        best = Some((seq, Some(value)));
                    }
                }
                TableGetResult::Deleted(seq) => {
                    if best.as_ref().is_none_or(|(s, _)| seq > *s) {
                        best = Some((seq, None));
                    }
                }
                TableGetResult::NotFound => {}
            }
        }
        if let Some((_, value)) = best {
            return Ok(value);
        }

        // Levels ≥ 1: at most one candidate per level.
        for level in 1..NUM_LEVELS {
            let files = &self.files[level];
            if files.is_empty() {
                continue;
            }
            let idx = files.partition_point(|f| {
                keys::extract_user_key(&f.largest) < user_key
            });
            if idx >= files.len() {
                continue;
            }
            let file = &files[idx];
            if !file.overlaps_user_key(user_key) {
                continue;
            }
            let table = table_cache.get_table(file.number)?;
            if table.is_suspect() {
                warn!(file_number = file.number, level, "skipping suspect table");
                continue;
            }
            match table.get(user_key, snapshot)? {
                TableGetResult::Found(_, value) => return Ok(Some(value)),
                TableGetResult::Deleted(_) => return Ok(None),
                TableGetResult::NotFound => {}
            }
        }
        Ok(None)
    }

    /// Files at `level` whose user-key range intersects `[start, end]`.
    pub fn overlapping_files(
        &self,
        level: usize,
        start: &[u8],
        end: &[u8],
    ) -> Vec<Arc<FileMetadata>> {
        self.files[level]
            .iter()
            .filter(|f| f.overlaps_range(start, end))
            .cloned()
            .collect()
    }

    /// Whether any level deeper than `level` holds a file overlapping
    /// `user_key`. Tombstones may be dropped only when this is false.
    pub fn key_may_exist_below(&self, level: usize, user_key: &[u8]) -> bool {
        for deeper in (level + 1)..NUM_LEVELS {
            if self.files[deeper]
                .iter()
                .any(|f| f.overlaps_user_key(user_key))
            {
                return true;
            }
        }
        false
    }

    /// Compaction score of `level`: ≥ 1.0 means compaction is due.
    pub fn compaction_score(&self, level: usize) -> f64 {
        if level == 0 {
            self.files[0].len() as f64 / L0_COMPACTION_TRIGGER as f64
        } else {
            self.level_bytes(level) as f64 / max_bytes_for_level(level) as f64
        }
    }

    /// The level with the highest compaction score, with its score.
    pub fn best_compaction_level(&self) -> (usize, f64) {
        let mut best = (0usize, self.compaction_score(0));
        for level in 1..NUM_LEVELS - 1 {
            let score = self.compaction_score(level);
            if score > best.1 {
                best = (level, score);
            }
        }
        best
    }
}

/// Byte budget for `level` (≥ 1): 10 MiB at level 1, ×10 per level.
pub fn max_bytes_for_level(level: usize) -> u64 {
    debug_assert!(level >= 1);
    let mut bytes = LEVEL1_MAX_BYTES;
    for _ in 1..level {
        bytes = bytes.saturating_mul(10);
    }
    bytes
}

// ------------------------------------------------------------------------------------------------
// VersionEdit
// ------------------------------------------------------------------------------------------------

/// Tag bytes of the MANIFEST record fields.
mod tag {
    pub const LOG_NUMBER: u32 = 1;
    pub const NEXT_FILE_NUMBER: u32 = 2;
    pub const LAST_SEQUENCE: u32 = 3;
    pub const COMPACT_POINTER: u32 = 4;
    pub const DELETED_FILE: u32 = 5;
    pub const NEW_FILE: u32 = 6;
}

/// The delta between two versions, as appended to the MANIFEST.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct VersionEdit {
    /// New commit-log number; segments below it are released.
    pub log_number: Option<u64>,
    /// Advance of the file-number counter.
    pub next_file_number: Option<u64>,
    /// Advance of the last assigned sequence.
    pub last_sequence: Option<SequenceNumber>,
    /// Per-level compaction cursors (level, internal key).
    pub compact_pointers: Vec<(usize, Vec<u8>)>,
    /// Files removed, per level.
    pub deleted_files: Vec<(usize, u64)>,
    /// Files added, per level.
    pub new_files: Vec<(usize, FileMetadata)>,
}

impl VersionEdit {
    /// Record a new file at `level`.
    pub fn add_file(&mut self, level: usize, meta: FileMetadata) {
        self.new_files.push((level, meta));
    }

    /// Record the removal of file `number` from `level`.
    pub fn delete_file(&mut self, level: usize, number: u64) {
        self.deleted_files.push((level, number));
    }

    /// Serialize as one MANIFEST record payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        if let Some(n) = self.log_number {
            codec::put_varint32(&mut buf, tag::LOG_NUMBER);
            codec::put_varint64(&mut buf, n);
        }
        if let Some(n) = self.next_file_number {
            codec::put_varint32(&mut buf, tag::NEXT_FILE_NUMBER);
            codec::put_varint64(&mut buf, n);
        }
        if let Some(n) = self.last_sequence {
            codec::put_varint32(&mut buf, tag::LAST_SEQUENCE);
            codec::put_varint64(&mut buf, n);
        }
        for (level, key) in &self.compact_pointers {
            codec::put_varint32(&mut buf, tag::COMPACT_POINTER);
            codec::put_varint32(&mut buf, *level as u32);
            codec::put_length_prefixed_slice(&mut buf, key);
        }
        for (level, number) in &self.deleted_files {
            codec::put_varint32(&mut buf, tag::DELETED_FILE);
            codec::put_varint32(&mut buf, *level as u32);
            codec::put_varint64(&mut buf, *number);
        }
        for (level, meta) in &self.new_files {
            codec::put_varint32(&mut buf, tag::NEW_FILE);
            codec::put_varint32(&mut buf, *level as u32);
            codec::put_varint64(&mut buf, meta.number);
            codec::put_varint64(&mut buf, meta.file_size);
            codec::put_length_prefixed_slice(&mut buf, &meta.smallest);
            codec::put_length_prefixed_slice(&mut buf, &meta.largest);
        }
        buf
    }

    /// Decode one MANIFEST record payload.
    pub fn decode(mut buf: &[u8]) -> Result<VersionEdit, VersionError> {
        let mut edit = VersionEdit::default();
        while !buf.is_empty() {
            let (field, n) = codec::decode_varint32(buf)?;
            buf = &buf[n..];
            match field {
                tag::LOG_NUMBER => {
                    let (v, n) = codec::decode_varint64(buf)?;
                    buf = &buf[n..];
                    edit.log_number = Some(v);
                }
                tag::NEXT_FILE_NUMBER => {
                    let (v, n) = codec::decode_varint64(buf)?;
                    buf = &buf[n..];
                    edit.next_file_number = Some(v);
                }
                tag::LAST_SEQUENCE => {
                    let (v, n) = codec::decode_varint64(buf)?;
                    buf = &buf[n..];
                    edit.last_sequence = Some(v);
                }
                tag::COMPACT_POINTER => {
                    let (level, n) = codec::decode_varint32(buf)?;
                    buf = &buf[n..];
                    let (key, n) = codec::get_length_prefixed_slice(buf)?;
                    let key = key.to_vec();
                    buf = &buf[n..];
                    edit.compact_pointers.push((Self::level(level)?, key));
                }
                tag::DELETED_FILE => {
                    let (level, n) = codec::decode_varint32(buf)?;
                    buf = &buf[n..];
                    let (number, n) = codec::decode_varint64(buf)?;
                    buf = &buf[n..];
                    edit.deleted_files.push((Self::level(level)?, number));
                }
                tag::NEW_FILE => {
                    let (level, n) = codec::decode_varint32(buf)?;
                    buf = &buf[n..];
                    let (number, n) = codec::decode_varint64(buf)?;
                    buf = &buf[n..];
                    let (file_size, n) = codec::decode_varint64(buf)?;
                    buf = &buf[n..];
                    let (smallest, n) = codec::get_length_prefixed_slice(buf)?;
                    let smallest = smallest.to_vec();
                    buf = &buf[n..];
                    let (largest, n) = codec::get_length_prefixed_slice(buf)?;
                    let largest = largest.to_vec();
                    buf = &buf[n..];
                    edit.new_files.push((
                        Self::level(level)?,
                        FileMetadata {
                            number,
                            file_size,
                            smallest,
                            largest,
                        },
                    ));
                }
                other => {
                    return Err(VersionError::Corruption(format!(
                        "unknown version edit tag {other}"
                    )));
                }
            }
        }
        Ok(edit)
    }

    fn level(raw: u32) -> Result<usize, VersionError> {
        let level = raw as usize;
        if level >= NUM_LEVELS {
            return Err(VersionError::Corruption(format!("level {level} out of range")));
        }
        Ok(level)
    }
}

// ------------------------------------------------------------------------------------------------
// Compaction pick
// ------------------------------------------------------------------------------------------------

/// Inputs selected for one compaction: files at the trigger level plus
/// the overlapping files one level deeper.
pub struct CompactionPick {
    /// The trigger level; outputs land at `level + 1`.
    pub level: usize,
    /// Input files at `level`.
    pub base: Vec<Arc<FileMetadata>>,
    /// Overlapping input files at `level + 1`.
    pub parents: Vec<Arc<FileMetadata>>,
}

impl CompactionPick {
    /// User-key range covered by every input file.
    pub fn user_key_range(&self) -> (Vec<u8>, Vec<u8>) {
        let mut start: Option<Vec<u8>> = None;
        let mut end: Option<Vec<u8>> = None;
        for f in self.base.iter().chain(&self.parents) {
            let s = keys::extract_user_key(&f.smallest);
            let e = keys::extract_user_key(&f.largest);
            if start.as_deref().is_none_or(|cur| s < cur) {
                start = Some(s.to_vec());
            }
            if end.as_deref().is_none_or(|cur| e > cur) {
                end = Some(e.to_vec());
            }
        }
        (start.unwrap_or_default(), end.unwrap_or_default())
    }
}

// ------------------------------------------------------------------------------------------------
// VersionSet
// ------------------------------------------------------------------------------------------------

/// Publication state of the version set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PublishState {
    /// No edit in progress.
    Stable,
    /// An edit is being built against the current version.
    Editing,
    /// The edit is being durably appended to the MANIFEST.
    Logging,
    /// The current pointer is being flipped.
    Swapping,
}

/// Owner of the current [`Version`], counters, and the MANIFEST.
pub struct VersionSet {
    dir: PathBuf,
    current: Arc<Version>,
    /// Every version handed out, for live-file accounting.
    live_versions: Vec<Weak<Version>>,
    manifest: Option<LogWriter>,
    manifest_number: u64,
    next_file_number: u64,
    last_sequence: SequenceNumber,
    /// Commit-log segments numbered below this are released.
    log_number: u64,
    compact_pointers: Vec<Vec<u8>>,
    state: PublishState,
}

impl VersionSet {
    /// Open the version set in `dir`, creating a fresh database when no
    /// `CURRENT` file exists, otherwise recovering from the MANIFEST.
    pub fn open(dir: &Path) -> Result<VersionSet, VersionError> {
        let mut set = VersionSet {
            dir: dir.to_path_buf(),
            current: Arc::new(Version::empty()),
            live_versions: Vec::new(),
            manifest: None,
            manifest_number: 1,
            next_file_number: 2,
            last_sequence: 0,
            log_number: 0,
            compact_pointers: vec![Vec::new(); NUM_LEVELS],
            state: PublishState::Stable,
        };

        let current_path = filename::current_file(dir);
        if current_path.exists() {
            set.recover(&current_path)?;
        } else {
            info!(dir = %dir.display(), "creating fresh database");
        }
        // A fresh MANIFEST snapshot either way; recovery appends to a new
        // descriptor rather than the replayed one.
        set.write_snapshot()?;
        Ok(set)
    }

    /// The published version.
    pub fn current(&self) -> Arc<Version> {
        Arc::clone(&self.current)
    }

    /// Allocate the next file number.
    pub fn new_file_number(&mut self) -> u64 {
        let n = self.next_file_number;
        self.next_file_number += 1;
        n
    }

    /// Highest sequence number recorded by a published edit.
    pub fn last_sequence(&self) -> SequenceNumber {
        self.last_sequence
    }

    /// Record the engine's last assigned sequence (published on the next
    /// edit).
    pub fn set_last_sequence(&mut self, seq: SequenceNumber) {
        debug_assert!(seq >= self.last_sequence);
        self.last_sequence = seq;
    }

    /// Commit-log number below which segments are obsolete.
    pub fn log_number(&self) -> u64 {
        self.log_number
    }

    /// Number of the live MANIFEST file.
    pub fn manifest_number(&self) -> u64 {
        self.manifest_number
    }

    /// File numbers referenced by any live version.
    pub fn live_files(&mut self) -> BTreeSet<u64> {
        let mut live = BTreeSet::new();
        self.live_versions.retain(|weak| weak.strong_count() > 0);
        for weak in &self.live_versions {
            if let Some(version) = weak.upgrade() {
                for level in 0..NUM_LEVELS {
                    for file in version.files(level) {
                        live.insert(file.number);
                    }
                }
            }
        }
        for level in 0..NUM_LEVELS {
            for file in self.current.files(level) {
                live.insert(file.number);
            }
        }
        live
    }

    /// Apply `edit` and publish the resulting version.
    ///
    /// Walks STABLE → EDITING (build the new file lists) → LOGGING
    /// (MANIFEST append + fsync) → SWAPPING (pointer flip) → STABLE.
    pub fn log_and_apply(&mut self, mut edit: VersionEdit) -> Result<(), VersionError> {
        assert_eq!(
            self.state,
            PublishState::Stable,
            "one version edit at a time"
        );

        self.state = PublishState::Editing;
        if edit.next_file_number.is_none() {
            edit.next_file_number = Some(self.next_file_number);
        }
        if edit.last_sequence.is_none() {
            edit.last_sequence = Some(self.last_sequence);
        }
        let new_version = match self.build_version(&edit) {
            Ok(v) => v,
            Err(e) => {
                self.state = PublishState::Stable;
                return Err(e);
            }
        };

        self.state = PublishState::Logging;
        let result = (|| {
            let manifest = self
                .manifest
                .as_mut()
                .expect("manifest writer exists after open");
            manifest.add_record(&edit.encode())?;
            manifest.sync()?;
            Ok::<(), VersionError>(())
        })();
        if let Err(e) = result {
            self.state = PublishState::Stable;
            return Err(e);
        }

        self.state = PublishState::Swapping;
        self.apply_counters(&edit);
        let new_version = Arc::new(new_version);
        self.live_versions.push(Arc::downgrade(&new_version));
        self.current = new_version;
        self.state = PublishState::Stable;

        debug!(
            files = self.current.file_count(),
            last_sequence = self.last_sequence,
            "version published"
        );
        Ok(())
    }

    /// Choose compaction inputs for the level with the highest score, or
    /// `None` when no level is due.
    pub fn pick_compaction(&self) -> Option<CompactionPick> {
        let (level, score) = self.current.best_compaction_level();
        if score < 1.0 {
            return None;
        }

        let files = self.current.files(level);
        if files.is_empty() {
            return None;
        }

        // Round-robin: first file past the level's compaction pointer.
        let pointer = &self.compact_pointers[level];
        let seed = files
            .iter()
            .find(|f| {
                pointer.is_empty()
                    || keys::internal_key_cmp(&f.largest, pointer) == std::cmp::Ordering::Greater
            })
            .unwrap_or(&files[0])
            .clone();

        let mut base = vec![seed.clone()];
        if level == 0 {
            // Level-0 ranges overlap each other; widen to all overlapping
            // level-0 files so newer data never lands below older data.
            let (mut start, mut end) = (
                keys::extract_user_key(&seed.smallest).to_vec(),
                keys::extract_user_key(&seed.largest).to_vec(),
            );
            loop {
                let widened = self.current.overlapping_files(0, &start, &end);
                if widened.len() == base.len() {
                    base = widened;
                    break;
                }
                base = widened;
                for f in &base {
                    let s = keys::extract_user_key(&f.smallest);
                    let e = keys::extract_user_key(&f.largest);
                    if s < start.as_slice() {
                        start = s.to_vec();
                    }
                    if e > end.as_slice() {
                        end = e.to_vec();
                    }
                }
            }
        }

        let (start, end) = {
            let pick = CompactionPick {
                level,
                base: base.clone(),
                parents: Vec::new(),
            };
            pick.user_key_range()
        };
        let parents = if level + 1 < NUM_LEVELS {
            self.current.overlapping_files(level + 1, &start, &end)
        } else {
            Vec::new()
        };

        Some(CompactionPick {
            level,
            base,
            parents,
        })
    }

    /// Compaction inputs for `level` regardless of score: every file at
    /// the level plus the overlapping files one level deeper. Used by
    /// forced (operator/test) compactions.
    pub fn pick_compaction_at(&self, level: usize) -> Option<CompactionPick> {
        if level + 1 >= NUM_LEVELS {
            return None;
        }
        let base: Vec<Arc<FileMetadata>> = self.current.files(level).to_vec();
        if base.is_empty() {
            return None;
        }
        let (start, end) = {
            let pick = CompactionPick {
                level,
                base: base.clone(),
                parents: Vec::new(),
            };
            pick.user_key_range()
        };
        let parents = self.current.overlapping_files(level + 1, &start, &end);
        Some(CompactionPick {
            level,
            base,
            parents,
        })
    }

    /// Record where the next compaction at `level` should resume.
    pub fn set_compact_pointer(&mut self, level: usize, key: Vec<u8>) {
        self.compact_pointers[level] = key;
    }

    // --------------------------------------------------------------------
    // Internal
    // --------------------------------------------------------------------

    /// Build the file lists of the next version from the current one.
    fn build_version(&self, edit: &VersionEdit) -> Result<Version, VersionError> {
        let mut files: [Vec<Arc<FileMetadata>>; NUM_LEVELS] = Default::default();
        for level in 0..NUM_LEVELS {
            let deleted: Vec<u64> = edit
                .deleted_files
                .iter()
                .filter(|(l, _)| *l == level)
                .map(|(_, n)| *n)
                .collect();
            files[level] = self
                .current
                .files(level)
                .iter()
                .filter(|f| !deleted.contains(&f.number))
                .cloned()
                .collect();
            for (l, meta) in &edit.new_files {
                if *l == level {
                    files[level].push(Arc::new(meta.clone()));
                }
            }
            if level == 0 {
                // Newest first.
                files[0].sort_by(|a, b| b.number.cmp(&a.number));
            } else {
                files[level]
                    .sort_by(|a, b| keys::internal_key_cmp(&a.smallest, &b.smallest));
                // Levels ≥ 1 must stay pairwise disjoint.
                for pair in files[level].windows(2) {
                    let left_end = keys::extract_user_key(&pair[0].largest);
                    let right_start = keys::extract_user_key(&pair[1].smallest);
                    if left_end >= right_start {
                        return Err(VersionError::Corruption(format!(
                            "overlapping files {} and {} at level {level}",
                            pair[0].number, pair[1].number
                        )));
                    }
                }
            }
        }
        Ok(Version { files })
    }

    fn apply_counters(&mut self, edit: &VersionEdit) {
        if let Some(n) = edit.log_number {
            debug_assert!(n >= self.log_number);
            self.log_number = n;
        }
        if let Some(n) = edit.next_file_number {
            self.next_file_number = self.next_file_number.max(n);
        }
        if let Some(n) = edit.last_sequence {
            self.last_sequence = self.last_sequence.max(n);
        }
        for (level, key) in &edit.compact_pointers {
            self.compact_pointers[*level] = key.clone();
        }
    }

    /// Replay the MANIFEST named by `CURRENT`.
    fn recover(&mut self, current_path: &Path) -> Result<(), VersionError> {
        let name = fs::read_to_string(current_path)?;
        let name = name.trim_end_matches('\n');
        let Some(filename::FileType::Manifest(number)) = filename::parse_file_name(name) else {
            return Err(VersionError::Corruption(format!(
                "CURRENT names '{name}', not a MANIFEST"
            )));
        };

        let manifest_path = self.dir.join(name);
        let mut reader = LogReader::open(&manifest_path)?;
        let mut edits = 0usize;
        while let Some(record) = reader.read_record()? {
            let edit = VersionEdit::decode(&record)?;
            let version = self.build_version(&edit)?;
            self.apply_counters(&edit);
            self.current = Arc::new(version);
            edits += 1;
        }
        match reader.stop_reason() {
            Some(ReplayStop::CleanEof) | None => {}
            Some(ReplayStop::TruncatedTail) => {
                warn!("MANIFEST ends mid-record; using last complete edit");
            }
            Some(ReplayStop::Corruption(reason)) => {
                return Err(VersionError::Corruption(format!(
                    "MANIFEST-{number:06}: {reason}"
                )));
            }
        }
        self.manifest_number = number;
        info!(
            manifest = number,
            edits,
            files = self.current.file_count(),
            last_sequence = self.last_sequence,
            "recovered version state"
        );
        Ok(())
    }

    /// Start a new MANIFEST holding a full snapshot, then point `CURRENT`
    /// at it.
    fn write_snapshot(&mut self) -> Result<(), VersionError> {
        let number = self.next_file_number.max(self.manifest_number + 1);
        self.next_file_number = number + 1;

        let path = filename::manifest_file(&self.dir, number);
        let mut writer = LogWriter::create(&path)?;

        let mut snapshot = VersionEdit {
            log_number: Some(self.log_number),
            next_file_number: Some(self.next_file_number),
            last_sequence: Some(self.last_sequence),
            ..VersionEdit::default()
        };
        for (level, pointer) in self.compact_pointers.iter().enumerate() {
            if !pointer.is_empty() {
                snapshot.compact_pointers.push((level, pointer.clone()));
            }
        }
        for level in 0..NUM_LEVELS {
            for file in self.current.files(level) {
                snapshot.new_files.push((level, (**file).clone()));
            }
        }
        writer.add_record(&snapshot.encode())?;
        writer.sync()?;

        set_current_file(&self.dir, number)?;
        let old_manifest = self.manifest_number;
        self.manifest = Some(writer);
        self.manifest_number = number;
        if old_manifest != number {
            let old_path = filename::manifest_file(&self.dir, old_manifest);
            if old_path.exists() {
                let _ = fs::remove_file(old_path);
            }
        }
        Ok(())
    }
}

/// Atomically point `CURRENT` at `MANIFEST-<number>`.
///
/// The name is written to a temp file which is fsynced and renamed over
/// `CURRENT`; callers must already have fsynced the MANIFEST itself.
pub fn set_current_file(dir: &Path, manifest_number: u64) -> Result<(), VersionError> {
    let tmp = filename::temp_file(dir, manifest_number);
    {
        let mut file = fs::File::create(&tmp)?;
        let name = filename::manifest_file(dir, manifest_number);
        let name = name
            .file_name()
            .and_then(|n| n.to_str())
            .expect("manifest names are valid UTF-8");
        file.write_all(name.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?;
    }
    fs::rename(&tmp, filename::current_file(dir))?;
    // Make the rename durable.
    if let Ok(dir_file) = fs::File::open(dir) {
        let _ = dir_file.sync_all();
    }
    Ok(())
}
