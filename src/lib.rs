//! # ReefDB
//!
//! The persistent storage engine behind each shard of a Redis-compatible,
//! sharded key-value server. Every shard owns one [`engine::ColumnFamily`]:
//! a log-structured merge tree made of a group-committed commit log, an
//! in-memory memtable, a queue of sealed (immutable) memtables awaiting
//! flush, and a leveled set of immutable on-disk sstables fronted by block
//! and table caches.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                      ColumnFamily                         │
//! │   ┌──────────┐   ┌─────────────┐   ┌──────────────────┐  │
//! │   │  Active   │   │  Immutable  │   │  SSTables        │  │
//! │   │  Memtable │   │  Memtables  │   │  level 0..6      │  │
//! │   └────┬─────┘   └──────┬──────┘   └────────┬─────────┘  │
//! │        │  seal          │  flush            │  compact    │
//! │        └────────►       └─────────►         ▼            │
//! │   ┌──────────────────────────────────────────────────┐   │
//! │   │  Commit log (group commit)  ·  Versions/MANIFEST │   │
//! │   └──────────────────────────────────────────────────┘   │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`engine`] | Column family — write/read paths, flush, compaction |
//! | [`memtable`] | Ordered in-memory buffer of pending mutations |
//! | [`commitlog`] | Record-framed, double-buffered write-ahead log |
//! | [`sstable`] | Immutable block-indexed table files with bloom filters |
//! | [`block`] | Prefix-compressed key/value blocks with restart points |
//! | [`version`] | Immutable sstable-set snapshots, MANIFEST, CURRENT |
//! | [`cache`] | LRU block and table caches with pinned-entry reclaim |
//! | [`resp`] | Line-protocol request decoder and command dispatch |
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use reefdb::engine::{ColumnFamily, Options};
//! use reefdb::Deadline;
//!
//! let cf = ColumnFamily::open("/tmp/shard-0", Options::default()).unwrap();
//!
//! cf.put(b"hello".to_vec(), b"world".to_vec(), &Deadline::none()).unwrap();
//! assert_eq!(
//!     cf.get(b"hello", &Deadline::none()).unwrap(),
//!     Some(b"world".to_vec())
//! );
//!
//! cf.delete(b"hello".to_vec(), &Deadline::none()).unwrap();
//! assert_eq!(cf.get(b"hello", &Deadline::none()).unwrap(), None);
//!
//! cf.close().unwrap();
//! ```

pub mod block;
pub mod cache;
pub mod checksum;
pub mod codec;
pub mod commitlog;
pub mod engine;
pub mod filename;
pub mod keys;
pub mod memtable;
pub mod resp;
pub mod sstable;
pub mod version;

mod deadline;

pub use deadline::Deadline;
