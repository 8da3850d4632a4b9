//! Record-framed, double-buffered write-ahead log.
//!
//! Every accepted mutation is appended here before it reaches the
//! memtable. The same record framing also backs the MANIFEST (see
//! [`crate::version`]), via the synchronous [`LogWriter`].
//!
//! # On-disk layout
//!
//! Records are framed as
//!
//! ```text
//! | masked_crc32c (u32 le) | len_lo (u8) | len_hi (u8) | type (u8) | payload |
//! ```
//!
//! and laid out inside fixed 32 KiB blocks. A record never straddles a
//! block boundary: it is split into FIRST / MIDDLE* / LAST fragments
//! instead. A block whose remaining space is smaller than the 7-byte
//! header is zero-filled; readers treat an all-zero header as padding and
//! skip to the next block.
//!
//! The CRC covers `type || payload` and is stored masked
//! (see [`crate::checksum`]).
//!
//! # Group commit
//!
//! [`CommitLog`] owns a pool of flush buffers (32 by default). `append`
//! reserves space in the current buffer; when the buffer cannot take the
//! whole record it is *closed* — zero-padded to the block boundary and
//! handed to the flusher thread — and a fresh buffer is acquired from the
//! released pool, blocking (deadline-aware) when all buffers are in
//! flight. The flusher writes each closed buffer at the file's running
//! offset and fsyncs before recycling it.
//!
//! A timer closes a lingering buffer early: every 8 s the current buffer
//! is touched, and a buffer over 80 % full or touched 10 times is closed
//! even if not full. This bounds worst-case fsync latency for quiet
//! shards.
//!
//! Appends return once the bytes are in the buffer ("accepted");
//! [`CommitLog::sync`] is the durability barrier. Once a buffer has been
//! handed to the flusher, a write error is fatal: the log is poisoned and
//! every later append fails fast.

#[cfg(test)]
mod tests;

use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, bounded, unbounded};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::Deadline;
use crate::checksum;
use crate::codec;

/// Size of a log block. Records never straddle block boundaries.
pub const BLOCK_SIZE: usize = 32 * 1024;

/// Bytes of record header: crc(4) + len(2) + type(1).
pub const HEADER_SIZE: usize = 7;

/// Number of flush buffers in the pool.
pub const FLUSH_BUFFER_COUNT: usize = 32;

/// Capacity of one flush buffer: four log blocks.
pub const FLUSH_BUFFER_CAPACITY: usize = 4 * BLOCK_SIZE;

/// Interval of the periodic buffer-close timer.
const PERIODIC_FLUSH_INTERVAL: Duration = Duration::from_secs(8);

/// A touched buffer fuller than this fraction of its capacity is closed.
const CLOSE_FILL_RATIO: f64 = 0.8;

/// A buffer touched this many times is closed regardless of fill.
const CLOSE_TOUCH_LIMIT: u32 = 10;

/// Record fragment types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// A record contained entirely in one fragment.
    Full = 1,
    /// First fragment of a split record.
    First = 2,
    /// Interior fragment.
    Middle = 3,
    /// Final fragment.
    Last = 4,
}

impl RecordType {
    fn from_byte(byte: u8) -> Option<RecordType> {
        match byte {
            1 => Some(RecordType::Full),
            2 => Some(RecordType::First),
            3 => Some(RecordType::Middle),
            4 => Some(RecordType::Last),
            _ => None,
        }
    }
}

/// Errors returned by commit-log operations.
#[derive(Debug, Error)]
pub enum CommitLogError {
    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A record larger than a flush buffer can hold.
    #[error("record too large ({0} bytes)")]
    RecordTooLarge(usize),

    /// The deadline expired while waiting for a buffer or for durability.
    #[error("timed out")]
    Timeout,

    /// The log is closed to new work.
    #[error("shutting down")]
    ShuttingDown,

    /// An earlier flush failed; the log accepts no further writes.
    #[error("commit log poisoned: {0}")]
    Poisoned(String),
}

// ------------------------------------------------------------------------------------------------
// Record framing (shared with the MANIFEST writer)
// ------------------------------------------------------------------------------------------------

/// Append `payload` to `buf` as one or more framed fragments.
///
/// `buf.len() % BLOCK_SIZE` must equal the in-block offset of the next
/// byte — true for flush buffers (which start block-aligned) and for the
/// manifest writer (which pads identically).
pub(crate) fn frame_record(buf: &mut Vec<u8>, payload: &[u8]) {
    let mut remaining = payload;
    let mut first = true;
    loop {
        let block_left = BLOCK_SIZE - (buf.len() % BLOCK_SIZE);
        if block_left < HEADER_SIZE {
            // Too small for a header: zero-fill to the block boundary.
            buf.resize(buf.len() + block_left, 0);
            continue;
        }
        let fragment_len = remaining.len().min(block_left - HEADER_SIZE);
        let (fragment, rest) = remaining.split_at(fragment_len);
        let record_type = match (first, rest.is_empty()) {
            (true, true) => RecordType::Full,
            (true, false) => RecordType::First,
            (false, false) => RecordType::Middle,
            (false, true) => RecordType::Last,
        };

        let type_byte = record_type as u8;
        let crc = checksum::masked_crc(&[&[type_byte], fragment]);
        codec::put_fixed32(buf, crc);
        buf.push((fragment_len & 0xff) as u8);
        buf.push((fragment_len >> 8) as u8);
        buf.push(type_byte);
        buf.extend_from_slice(fragment);

        if rest.is_empty() {
            return;
        }
        remaining = rest;
        first = false;
    }
}

/// Bytes `frame_record` will use for `payload` starting at `in_block`
/// bytes into a block, including padding and fragment headers.
pub(crate) fn framed_size(mut in_block: usize, payload_len: usize) -> usize {
    let mut total = 0usize;
    let mut remaining = payload_len;
    loop {
        let block_left = BLOCK_SIZE - in_block;
        if block_left < HEADER_SIZE {
            total += block_left;
            in_block = 0;
            continue;
        }
        let fragment = remaining.min(block_left - HEADER_SIZE);
        total += HEADER_SIZE + fragment;
        in_block = (in_block + HEADER_SIZE + fragment) % BLOCK_SIZE;
        remaining -= fragment;
        if remaining == 0 {
            return total;
        }
    }
}

// ------------------------------------------------------------------------------------------------
// LogWriter — synchronous framing over a file (MANIFEST path)
// ------------------------------------------------------------------------------------------------

/// A synchronous record writer sharing the commit-log framing.
///
/// Used for the MANIFEST, where each version edit is appended and fsynced
/// in the caller's thread; the group-commit machinery is unnecessary
/// there.
pub struct LogWriter {
    file: File,
    /// Bytes written so far; `offset % BLOCK_SIZE` is the in-block position.
    offset: u64,
}

impl LogWriter {
    /// Create a fresh log at `path`, truncating any existing file.
    pub fn create(path: &Path) -> Result<Self, CommitLogError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(LogWriter { file, offset: 0 })
    }

    /// Append one record and flush it to the OS.
    pub fn add_record(&mut self, payload: &[u8]) -> Result<(), CommitLogError> {
        let mut buf = Vec::with_capacity(payload.len() + 2 * HEADER_SIZE);
        // Seed the in-block offset, then strip the seed before writing.
        let seed = (self.offset % BLOCK_SIZE as u64) as usize;
        buf.resize(seed, 0);
        frame_record(&mut buf, payload);
        let framed = &buf[seed..];
        self.file.write_all_at(framed, self.offset)?;
        self.offset += framed.len() as u64;
        Ok(())
    }

    /// Force written records to stable storage.
    pub fn sync(&mut self) -> Result<(), CommitLogError> {
        self.file.sync_data()?;
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// LogReader — replay
// ------------------------------------------------------------------------------------------------

/// Why a reader stopped before the end of the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayStop {
    /// Every record was consumed.
    CleanEof,
    /// A checksum mismatch or malformed header; replay truncates here.
    Corruption(String),
    /// The file ended mid-header or mid-payload (writer died mid-record).
    TruncatedTail,
}

/// Sequential reader over framed records.
///
/// Scans block-aligned fragments, verifies each masked CRC, and
/// reassembles FIRST/MIDDLE*/LAST sequences into logical records. Stops
/// at the first bad CRC or truncated tail; an orphan FIRST/MIDDLE run at
/// the end of the file is reported as a truncated tail, not corruption.
pub struct LogReader {
    file: File,
    offset: u64,
    block: Vec<u8>,
    block_len: usize,
    block_pos: usize,
    stop: Option<ReplayStop>,
}

impl LogReader {
    /// A reader positioned at the start of `path`.
    pub fn open(path: &Path) -> Result<Self, CommitLogError> {
        let file = File::open(path)?;
        Ok(LogReader {
            file,
            offset: 0,
            block: vec![0u8; BLOCK_SIZE],
            block_len: 0,
            block_pos: 0,
            stop: None,
        })
    }

    /// Why iteration ended, once `read_record` has returned `None`.
    pub fn stop_reason(&self) -> Option<&ReplayStop> {
        self.stop.as_ref()
    }

    /// Next logical record, or `None` once the reader has stopped.
    pub fn read_record(&mut self) -> Result<Option<Vec<u8>>, CommitLogError> {
        if self.stop.is_some() {
            return Ok(None);
        }

        let mut assembling: Option<Vec<u8>> = None;
        loop {
            // Refill the block buffer when exhausted.
            if self.block_pos >= self.block_len {
                self.block_len = 0;
                self.block_pos = 0;
                let mut read = 0usize;
                while read < BLOCK_SIZE {
                    let n = self.file.read(&mut self.block[read..])?;
                    if n == 0 {
                        break;
                    }
                    read += n;
                }
                if read == 0 {
                    self.stop = Some(if assembling.is_some() {
                        // Writer died after FIRST/MIDDLE fragments.
                        ReplayStop::TruncatedTail
                    } else {
                        ReplayStop::CleanEof
                    });
                    return Ok(None);
                }
                self.block_len = read;
                self.offset += read as u64;
            }

            let available = self.block_len - self.block_pos;
            if available < HEADER_SIZE {
                if self.block_len < BLOCK_SIZE {
                    // Short final block ending mid-header.
                    self.stop = Some(ReplayStop::TruncatedTail);
                    return Ok(None);
                }
                // Block trailer smaller than a header: padding.
                self.block_pos = self.block_len;
                continue;
            }

            let header = &self.block[self.block_pos..self.block_pos + HEADER_SIZE];
            let stored_crc = codec::decode_fixed32(header)
                .map_err(|e| CommitLogError::Io(io::Error::other(e.to_string())))?;
            let len = usize::from(header[4]) | (usize::from(header[5]) << 8);
            let type_byte = header[6];

            if stored_crc == 0 && len == 0 && type_byte == 0 {
                // Zero-filled region: skip to the next block boundary.
                self.block_pos = self.block_len;
                continue;
            }

            let Some(record_type) = RecordType::from_byte(type_byte) else {
                self.stop = Some(ReplayStop::Corruption(format!(
                    "unknown record type {type_byte}"
                )));
                return Ok(None);
            };

            if self.block_pos + HEADER_SIZE + len > self.block_len {
                self.stop = Some(if self.block_len < BLOCK_SIZE {
                    ReplayStop::TruncatedTail
                } else {
                    ReplayStop::Corruption("fragment overruns block".into())
                });
                return Ok(None);
            }

            let payload_start = self.block_pos + HEADER_SIZE;
            let fragment = &self.block[payload_start..payload_start + len];
            let computed = checksum::masked_crc(&[&[type_byte], fragment]);
            if computed != stored_crc {
                self.stop = Some(ReplayStop::Corruption("checksum mismatch".into()));
                return Ok(None);
            }

            let fragment = fragment.to_vec();
            self.block_pos = payload_start + len;

            match record_type {
                RecordType::Full => {
                    if assembling.is_some() {
                        self.stop = Some(ReplayStop::Corruption(
                            "FULL record interrupts a fragmented record".into(),
                        ));
                        return Ok(None);
                    }
                    return Ok(Some(fragment));
                }
                RecordType::First => {
                    if assembling.is_some() {
                        self.stop = Some(ReplayStop::Corruption(
                            "FIRST record interrupts a fragmented record".into(),
                        ));
                        return Ok(None);
                    }
                    assembling = Some(fragment);
                }
                RecordType::Middle => match assembling.as_mut() {
                    Some(buf) => buf.extend_from_slice(&fragment),
                    None => {
                        self.stop =
                            Some(ReplayStop::Corruption("MIDDLE without FIRST".into()));
                        return Ok(None);
                    }
                },
                RecordType::Last => match assembling.take() {
                    Some(mut buf) => {
                        buf.extend_from_slice(&fragment);
                        return Ok(Some(buf));
                    }
                    None => {
                        self.stop = Some(ReplayStop::Corruption("LAST without FIRST".into()));
                        return Ok(None);
                    }
                },
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// CommitLog — group commit
// ------------------------------------------------------------------------------------------------

/// One buffer travelling between appenders and the flusher.
struct FlushBuffer {
    data: Vec<u8>,
}

/// Work items consumed by the flusher thread.
enum FlushTask {
    /// Write this buffer at the running offset, fsync, recycle it.
    Buffer(FlushBuffer),
    /// Drain, fsync, then switch output to an already-created segment.
    Rotate(File),
    /// Drain, fsync, exit.
    Shutdown,
}

/// Writer-side state, serialised under one mutex.
struct WriterState {
    /// Buffer currently accepting appends, if any.
    current: Option<FlushBuffer>,
    /// Timer touches since the current buffer was acquired.
    touches: u32,
    /// Buffers handed to the flusher so far.
    enqueued: u64,
    /// No further appends accepted.
    closed: bool,
}

/// Flusher-side durability progress, guarded separately so `sync` can
/// wait without blocking appenders.
struct DurableState {
    /// Buffers durably written and fsynced.
    durable: u64,
    /// First flush error, if any. Fatal.
    error: Option<String>,
}

struct Shared {
    state: Mutex<WriterState>,
    durable: Mutex<DurableState>,
    durable_cv: Condvar,
    pending_tx: Sender<FlushTask>,
    released_rx: Receiver<FlushBuffer>,
    poisoned: AtomicBool,
    buffer_capacity: usize,
}

/// The group-committed write-ahead log of one column family.
pub struct CommitLog {
    shared: Arc<Shared>,
    flusher: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
    timer_tx: Sender<()>,
    path: PathBuf,
}

impl CommitLog {
    /// Create a fresh log segment at `path` with default pool sizing.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, CommitLogError> {
        Self::create_with(path, FLUSH_BUFFER_COUNT, FLUSH_BUFFER_CAPACITY)
    }

    /// Create with explicit pool sizing (tests shrink these).
    pub fn create_with(
        path: impl AsRef<Path>,
        buffer_count: usize,
        buffer_capacity: usize,
    ) -> Result<Self, CommitLogError> {
        let path = path.as_ref().to_path_buf();
        debug_assert!(buffer_capacity % BLOCK_SIZE == 0);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        let (pending_tx, pending_rx) = unbounded::<FlushTask>();
        let (released_tx, released_rx) = bounded::<FlushBuffer>(buffer_count);
        for _ in 0..buffer_count {
            released_tx
                .send(FlushBuffer {
                    data: Vec::with_capacity(buffer_capacity),
                })
                .expect("released pool has capacity for the initial buffers");
        }

        let shared = Arc::new(Shared {
            state: Mutex::new(WriterState {
                current: None,
                touches: 0,
                enqueued: 0,
                closed: false,
            }),
            durable: Mutex::new(DurableState {
                durable: 0,
                error: None,
            }),
            durable_cv: Condvar::new(),
            pending_tx,
            released_rx,
            poisoned: AtomicBool::new(false),
            buffer_capacity,
        });

        let flusher = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("commitlog-flush".into())
                .spawn(move || flusher_loop(file, pending_rx, released_tx, shared))?
        };

        let (timer_tx, timer_rx) = bounded::<()>(1);
        let timer = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("commitlog-timer".into())
                .spawn(move || timer_loop(timer_rx, shared))?
        };

        info!(path = %path.display(), "commit log created");
        Ok(CommitLog {
            shared,
            flusher: Some(flusher),
            timer: Some(timer),
            timer_tx,
            path,
        })
    }

    /// Path of the current segment file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether an earlier flush error has poisoned the log.
    pub fn is_poisoned(&self) -> bool {
        self.shared.poisoned.load(Ordering::Acquire)
    }

    /// Append one serialized mutation.
    ///
    /// Returns once the record is in the in-memory buffer; durability
    /// follows when the flusher reaches it. Blocks (deadline-aware) when
    /// every buffer in the pool is in flight.
    pub fn append(&self, payload: &[u8], deadline: &Deadline) -> Result<(), CommitLogError> {
        self.check_poison()?;

        // Worst case framing: one header per block the payload may span.
        let worst = framed_size(0, payload.len()) + BLOCK_SIZE;
        if worst > self.shared.buffer_capacity {
            return Err(CommitLogError::RecordTooLarge(payload.len()));
        }

        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        if state.closed {
            return Err(CommitLogError::ShuttingDown);
        }

        // Close the current buffer when the record cannot fit.
        if let Some(current) = state.current.as_ref() {
            let in_block = current.data.len() % BLOCK_SIZE;
            let needed = framed_size(in_block, payload.len());
            if current.data.len() + needed > self.shared.buffer_capacity {
                self.enqueue_current(&mut state);
            }
        }

        // Acquire a fresh buffer if needed, bounded by the deadline.
        if state.current.is_none() {
            loop {
                if deadline.expired() {
                    return Err(CommitLogError::Timeout);
                }
                let wait = deadline.remaining_or(Duration::from_millis(100));
                match self.shared.released_rx.recv_timeout(wait) {
                    Ok(buffer) => {
                        state.current = Some(buffer);
                        state.touches = 0;
                        break;
                    }
                    Err(crossbeam::channel::RecvTimeoutError::Timeout) => {
                        self.check_poison()?;
                        continue;
                    }
                    Err(crossbeam::channel::RecvTimeoutError::Disconnected) => {
                        return Err(CommitLogError::ShuttingDown);
                    }
                }
            }
        }

        let buffer = state
            .current
            .as_mut()
            .expect("buffer acquired in the loop above");
        frame_record(&mut buffer.data, payload);
        trace!(bytes = payload.len(), "commit log append accepted");
        Ok(())
    }

    /// Durability barrier: returns once every append accepted before this
    /// call is on disk.
    pub fn sync(&self, deadline: &Deadline) -> Result<(), CommitLogError> {
        let target = {
            let mut state = self
                .shared
                .state
                .lock()
                .unwrap_or_else(|poison| poison.into_inner());
            if state
                .current
                .as_ref()
                .is_some_and(|b| !b.data.is_empty())
            {
                self.enqueue_current(&mut state);
            }
            state.enqueued
        };
        self.wait_durable(target, deadline)
    }

    /// Switch output to a new segment file after draining pending work.
    ///
    /// The current buffer is closed first so its records land in the old
    /// segment.
    pub fn rotate(&mut self, new_path: impl AsRef<Path>) -> Result<(), CommitLogError> {
        self.check_poison()?;
        let new_path = new_path.as_ref().to_path_buf();
        // Create the segment here so it exists on disk as soon as rotate
        // returns; the flusher only swaps its handle.
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&new_path)?;
        {
            let mut state = self
                .shared
                .state
                .lock()
                .unwrap_or_else(|poison| poison.into_inner());
            if state.closed {
                return Err(CommitLogError::ShuttingDown);
            }
            if state
                .current
                .as_ref()
                .is_some_and(|b| !b.data.is_empty())
            {
                self.enqueue_current(&mut state);
            }
            self.shared
                .pending_tx
                .send(FlushTask::Rotate(file))
                .map_err(|_| CommitLogError::ShuttingDown)?;
        }
        self.path = new_path;
        Ok(())
    }

    /// Refuse new appends, drain pending buffers, fsync, join threads.
    pub fn close(mut self) -> Result<(), CommitLogError> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> Result<(), CommitLogError> {
        let target = {
            let mut state = self
                .shared
                .state
                .lock()
                .unwrap_or_else(|poison| poison.into_inner());
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            if state
                .current
                .as_ref()
                .is_some_and(|b| !b.data.is_empty())
            {
                self.enqueue_current(&mut state);
            }
            state.current = None;
            state.enqueued
        };

        let _ = self.shared.pending_tx.send(FlushTask::Shutdown);
        let _ = self.timer_tx.send(());

        if let Some(handle) = self.flusher.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.timer.take() {
            let _ = handle.join();
        }

        // Every enqueued buffer must have been flushed by the shutdown
        // drain; surface a poisoning error if not.
        let durable = self
            .shared
            .durable
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        if let Some(err) = &durable.error {
            return Err(CommitLogError::Poisoned(err.clone()));
        }
        debug_assert!(durable.durable >= target);
        info!(path = %self.path.display(), "commit log closed");
        Ok(())
    }

    /// Hand the current buffer to the flusher. Caller holds the state lock.
    fn enqueue_current(&self, state: &mut WriterState) {
        if let Some(mut buffer) = state.current.take() {
            if buffer.data.is_empty() {
                // Nothing written: return it to the pool directly.
                let _ = self.shared.pending_tx.send(FlushTask::Buffer(buffer));
                state.enqueued += 1;
                return;
            }
            // Pad to the block boundary so segments stay block-aligned
            // (and therefore 4 KiB-aligned for the flusher's writes).
            let tail = buffer.data.len() % BLOCK_SIZE;
            if tail != 0 {
                let pad = BLOCK_SIZE - tail;
                buffer.data.resize(buffer.data.len() + pad, 0);
            }
            state.enqueued += 1;
            state.touches = 0;
            let _ = self.shared.pending_tx.send(FlushTask::Buffer(buffer));
        }
    }

    fn wait_durable(&self, target: u64, deadline: &Deadline) -> Result<(), CommitLogError> {
        let mut durable = self
            .shared
            .durable
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        loop {
            if let Some(err) = &durable.error {
                return Err(CommitLogError::Poisoned(err.clone()));
            }
            if durable.durable >= target {
                return Ok(());
            }
            if deadline.expired() {
                return Err(CommitLogError::Timeout);
            }
            let wait = deadline.remaining_or(Duration::from_millis(100));
            let (guard, _timeout) = self
                .shared
                .durable_cv
                .wait_timeout(durable, wait)
                .unwrap_or_else(|poison| poison.into_inner());
            durable = guard;
        }
    }

    fn check_poison(&self) -> Result<(), CommitLogError> {
        if self.shared.poisoned.load(Ordering::Acquire) {
            let durable = self
                .shared
                .durable
                .lock()
                .unwrap_or_else(|poison| poison.into_inner());
            let detail = durable
                .error
                .clone()
                .unwrap_or_else(|| "unknown flush failure".into());
            return Err(CommitLogError::Poisoned(detail));
        }
        Ok(())
    }
}

impl Drop for CommitLog {
    fn drop(&mut self) {
        if let Err(e) = self.close_inner() {
            error!(error = %e, "commit log close failed on drop");
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Background threads
// ------------------------------------------------------------------------------------------------

fn flusher_loop(
    mut file: File,
    pending_rx: Receiver<FlushTask>,
    released_tx: Sender<FlushBuffer>,
    shared: Arc<Shared>,
) {
    let mut offset: u64 = 0;

    let fail = |shared: &Shared, err: &io::Error| {
        error!(error = %err, "commit log flush failed; poisoning log");
        shared.poisoned.store(true, Ordering::Release);
        let mut durable = shared
            .durable
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        if durable.error.is_none() {
            durable.error = Some(err.to_string());
        }
        shared.durable_cv.notify_all();
    };

    for task in pending_rx.iter() {
        match task {
            FlushTask::Buffer(mut buffer) => {
                if !buffer.data.is_empty() && !shared.poisoned.load(Ordering::Acquire) {
                    let result = file
                        .write_all_at(&buffer.data, offset)
                        .and_then(|()| file.sync_data());
                    match result {
                        Ok(()) => {
                            offset += buffer.data.len() as u64;
                            trace!(offset, "commit log buffer flushed");
                        }
                        Err(e) => fail(&shared, &e),
                    }
                }
                buffer.data.clear();

                {
                    let mut durable = shared
                        .durable
                        .lock()
                        .unwrap_or_else(|poison| poison.into_inner());
                    durable.durable += 1;
                    shared.durable_cv.notify_all();
                }
                // The pool can never be full here: this buffer came out of it.
                let _ = released_tx.send(buffer);
            }
            FlushTask::Rotate(new_file) => {
                if let Err(e) = file.sync_data() {
                    fail(&shared, &e);
                }
                file = new_file;
                offset = 0;
                debug!("commit log rotated to a fresh segment");
            }
            FlushTask::Shutdown => {
                if let Err(e) = file.sync_data() {
                    fail(&shared, &e);
                }
                break;
            }
        }
    }
}

fn timer_loop(shutdown_rx: Receiver<()>, shared: Arc<Shared>) {
    loop {
        match shutdown_rx.recv_timeout(PERIODIC_FLUSH_INTERVAL) {
            Ok(()) | Err(crossbeam::channel::RecvTimeoutError::Disconnected) => return,
            Err(crossbeam::channel::RecvTimeoutError::Timeout) => {}
        }

        let mut state = shared
            .state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        if state.closed {
            return;
        }
        let Some(buffer) = state.current.as_ref() else {
            continue;
        };
        if buffer.data.is_empty() {
            continue;
        }
        let buffer_len = buffer.data.len();
        state.touches += 1;
        let fill = buffer_len as f64 / shared.buffer_capacity as f64;
        if fill > CLOSE_FILL_RATIO || state.touches >= CLOSE_TOUCH_LIMIT {
            if let Some(mut buffer) = state.current.take() {
                let tail = buffer.data.len() % BLOCK_SIZE;
                if tail != 0 {
                    buffer.data.resize(buffer.data.len() + (BLOCK_SIZE - tail), 0);
                }
                state.enqueued += 1;
                state.touches = 0;
                warn!(fill = format_args!("{:.0}%", fill * 100.0), "idle commit log buffer closed by timer");
                let _ = shared.pending_tx.send(FlushTask::Buffer(buffer));
            }
        }
    }
}
