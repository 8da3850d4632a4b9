//! End-to-end tests over the public `reefdb` surface.
//!
//! These drive the full stack — decoder → engine → commit log → memtable
//! → sstables → compaction — the way the surrounding server would, and
//! exercise crash-shaped scenarios by reopening directories that were
//! closed (or abandoned) at interesting points.

use std::time::Duration;

use rand::Rng;
use tempfile::TempDir;

use reefdb::Deadline;
use reefdb::engine::{ColumnFamily, Options};
use reefdb::resp::{self, Shard};

fn none() -> Deadline {
    Deadline::none()
}

fn tiny_options() -> Options {
    Options {
        write_buffer_size: 512,
        ..Options::default()
    }
}

// ================================================================================================
// Write / read across flushes
// ================================================================================================

#[test]
fn write_read_across_flush() {
    let tmp = TempDir::new().unwrap();
    let cf = ColumnFamily::open(tmp.path(), Options::default()).unwrap();

    cf.put(b"k1".to_vec(), b"v1".to_vec(), &none()).unwrap();
    cf.put(b"k2".to_vec(), b"v2".to_vec(), &none()).unwrap();
    cf.flush(&none()).unwrap();
    cf.put(b"k2".to_vec(), b"v2b".to_vec(), &none()).unwrap();

    assert_eq!(cf.get(b"k1", &none()).unwrap(), Some(b"v1".to_vec()));
    assert_eq!(cf.get(b"k2", &none()).unwrap(), Some(b"v2b".to_vec()));
    assert_eq!(cf.last_sequence(), 3);
    cf.close().unwrap();
}

#[test]
fn delete_visibility_through_compaction() {
    let tmp = TempDir::new().unwrap();
    let cf = ColumnFamily::open(tmp.path(), Options::default()).unwrap();

    cf.put(b"k".to_vec(), b"v".to_vec(), &none()).unwrap();
    cf.delete(b"k".to_vec(), &none()).unwrap();
    cf.flush(&none()).unwrap();
    assert_eq!(cf.get(b"k", &none()).unwrap(), None);

    // Compact the lone level-0 file; nothing deeper can shadow the key,
    // so the tombstone may be dropped. The key must stay absent.
    assert!(cf.compact_once(true).unwrap());
    assert_eq!(cf.get(b"k", &none()).unwrap(), None);
    cf.close().unwrap();
}

// ================================================================================================
// Recovery
// ================================================================================================

#[test]
fn commit_log_replay_after_reopen() {
    let tmp = TempDir::new().unwrap();
    {
        let cf = ColumnFamily::open(tmp.path(), Options::default()).unwrap();
        for i in 0..10u32 {
            cf.put(
                format!("key-{i}").into_bytes(),
                format!("value-{i}").into_bytes(),
                &none(),
            )
            .unwrap();
        }
        cf.sync(&none()).unwrap();
        cf.close().unwrap();
    }

    let cf = ColumnFamily::open(tmp.path(), Options::default()).unwrap();
    for i in 0..10u32 {
        assert_eq!(
            cf.get(format!("key-{i}").as_bytes(), &none()).unwrap(),
            Some(format!("value-{i}").into_bytes()),
        );
    }
    cf.close().unwrap();
}

#[test]
fn mixed_workload_survives_reopen_cycles() {
    let tmp = TempDir::new().unwrap();
    let mut rng = rand::rng();
    let mut model = std::collections::BTreeMap::<Vec<u8>, Option<Vec<u8>>>::new();

    for _round in 0..3 {
        let cf = ColumnFamily::open(tmp.path(), tiny_options()).unwrap();
        for _ in 0..300 {
            let key = format!("key-{:03}", rng.random_range(0..120u32)).into_bytes();
            if rng.random_range(0..4u8) == 0 {
                cf.delete(key.clone(), &none()).unwrap();
                model.insert(key, None);
            } else {
                let value = format!("v-{}", rng.random_range(0..1_000_000u32)).into_bytes();
                cf.put(key.clone(), value.clone(), &none()).unwrap();
                model.insert(key, Some(value));
            }
        }
        // Occasional explicit maintenance on top of the background work.
        cf.flush(&none()).unwrap();
        let _ = cf.compact_once(true).unwrap();

        for (key, expected) in &model {
            assert_eq!(&cf.get(key, &none()).unwrap(), expected, "key {key:?}");
        }
        cf.close().unwrap();
    }

    // Final reopen: the whole model must still hold.
    let cf = ColumnFamily::open(tmp.path(), Options::default()).unwrap();
    for (key, expected) in &model {
        assert_eq!(&cf.get(key, &none()).unwrap(), expected, "key {key:?}");
    }
    cf.close().unwrap();
}

#[test]
fn abandoned_directory_reopens_cleanly() {
    // Simulate a crash: drop the handle without close() and reopen.
    let tmp = TempDir::new().unwrap();
    {
        let cf = ColumnFamily::open(tmp.path(), Options::default()).unwrap();
        for i in 0..20u32 {
            cf.put(format!("k{i}").into_bytes(), b"v".to_vec(), &none())
                .unwrap();
        }
        cf.sync(&none()).unwrap();
        drop(cf); // Drop still closes; the on-disk state must be reopenable.
    }
    let cf = ColumnFamily::open(tmp.path(), Options::default()).unwrap();
    for i in 0..20u32 {
        assert_eq!(
            cf.get(format!("k{i}").as_bytes(), &none()).unwrap(),
            Some(b"v".to_vec()),
        );
    }
    cf.close().unwrap();
}

// ================================================================================================
// Sustained writes: seals, flushes, compactions
// ================================================================================================

#[test]
fn sustained_writes_spill_to_disk_and_stay_readable() {
    let tmp = TempDir::new().unwrap();
    let cf = ColumnFamily::open(tmp.path(), tiny_options()).unwrap();

    for i in 0..2_000u32 {
        cf.put(
            format!("key-{i:05}").into_bytes(),
            format!("value-{i:05}").into_bytes(),
            &none(),
        )
        .unwrap();
    }

    // Plenty of seals happened; spot-check across the whole range.
    for i in (0..2_000u32).step_by(97) {
        assert_eq!(
            cf.get(format!("key-{i:05}").as_bytes(), &none()).unwrap(),
            Some(format!("value-{i:05}").into_bytes()),
        );
    }

    let stats = cf.stats();
    assert_eq!(stats.last_sequence, 2_000);
    assert!(
        stats.files_per_level.iter().sum::<usize>() > 0,
        "nothing reached disk: {stats:?}"
    );
    cf.close().unwrap();
}

#[test]
fn overwrite_heavy_workload_reads_latest() {
    let tmp = TempDir::new().unwrap();
    let cf = ColumnFamily::open(tmp.path(), tiny_options()).unwrap();

    for round in 0..20u32 {
        for key in 0..50u32 {
            cf.put(
                format!("key-{key:02}").into_bytes(),
                format!("round-{round}").into_bytes(),
                &none(),
            )
            .unwrap();
        }
    }
    for key in 0..50u32 {
        assert_eq!(
            cf.get(format!("key-{key:02}").as_bytes(), &none()).unwrap(),
            Some(b"round-19".to_vec()),
        );
    }
    cf.close().unwrap();
}

// ================================================================================================
// Durability barrier
// ================================================================================================

#[test]
fn sync_barrier_with_deadline() {
    let tmp = TempDir::new().unwrap();
    let cf = ColumnFamily::open(tmp.path(), Options::default()).unwrap();

    cf.put(b"k".to_vec(), b"v".to_vec(), &none()).unwrap();
    cf.sync(&Deadline::after(Duration::from_secs(30))).unwrap();
    cf.close().unwrap();
}

// ================================================================================================
// Protocol front end
// ================================================================================================

#[test]
fn shard_serves_decoded_requests() {
    let tmp = TempDir::new().unwrap();
    let shard = Shard::new(ColumnFamily::open(tmp.path(), Options::default()).unwrap());

    // A pipelined byte stream with three requests.
    let mut wire = Vec::new();
    wire.extend_from_slice(b"*3\r\n$3\r\nSET\r\n$4\r\nname\r\n$4\r\nreef\r\n");
    wire.extend_from_slice(b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n");
    wire.extend_from_slice(b"*2\r\n$3\r\nDEL\r\n$4\r\nname\r\n");

    let mut replies = Vec::new();
    let mut cursor = 0usize;
    while cursor < wire.len() {
        let (request, consumed) = resp::decode(&wire[cursor..]).unwrap().unwrap();
        cursor += consumed;
        replies.push(shard.apply(&request, &none()));
    }

    assert_eq!(replies[0], b"+OK\r\n");
    assert_eq!(replies[1], b"$4\r\nreef\r\n");
    assert_eq!(replies[2], b":1\r\n");

    shard.engine().close().unwrap();
}
