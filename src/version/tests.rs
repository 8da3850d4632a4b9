use std::sync::Arc;

use tempfile::TempDir;

use super::*;
use crate::keys::{InternalKey, ValueType};

fn ikey(user: &[u8], seq: u64) -> Vec<u8> {
    InternalKey::new(user, seq, ValueType::Value).into_bytes()
}

fn meta(number: u64, smallest: &[u8], largest: &[u8]) -> FileMetadata {
    FileMetadata {
        number,
        file_size: 1000,
        smallest: ikey(smallest, 100),
        largest: ikey(largest, 1),
    }
}

#[test]
fn version_edit_encode_decode_round_trip() {
    let mut edit = VersionEdit {
        log_number: Some(12),
        next_file_number: Some(99),
        last_sequence: Some(1 << 40),
        ..VersionEdit::default()
    };
    edit.compact_pointers.push((2, ikey(b"cursor", 5)));
    edit.delete_file(1, 7);
    edit.delete_file(2, 8);
    edit.add_file(0, meta(13, b"aaa", b"zzz"));
    edit.add_file(3, meta(14, b"m", b"n"));

    let decoded = VersionEdit::decode(&edit.encode()).unwrap();
    assert_eq!(decoded, edit);
}

#[test]
fn version_edit_rejects_unknown_tag() {
    let mut buf = Vec::new();
    crate::codec::put_varint32(&mut buf, 250);
    assert!(matches!(
        VersionEdit::decode(&buf),
        Err(VersionError::Corruption(_))
    ));
}

#[test]
fn fresh_database_then_reopen() {
    let tmp = TempDir::new().unwrap();
    {
        let mut set = VersionSet::open(tmp.path()).unwrap();
        assert_eq!(set.current().file_count(), 0);
        assert_eq!(set.last_sequence(), 0);

        let mut edit = VersionEdit::default();
        edit.add_file(0, meta(5, b"a", b"m"));
        edit.last_sequence = Some(42);
        edit.log_number = Some(3);
        set.log_and_apply(edit).unwrap();
    }

    let set = VersionSet::open(tmp.path()).unwrap();
    assert_eq!(set.last_sequence(), 42);
    assert_eq!(set.log_number(), 3);
    let version = set.current();
    assert_eq!(version.files(0).len(), 1);
    assert_eq!(version.files(0)[0].number, 5);
}

#[test]
fn edits_accumulate_across_reopens() {
    let tmp = TempDir::new().unwrap();
    {
        let mut set = VersionSet::open(tmp.path()).unwrap();
        for i in 0..3u64 {
            let mut edit = VersionEdit::default();
            edit.add_file(0, meta(10 + i, b"a", b"z"));
            edit.last_sequence = Some(100 + i);
            set.log_and_apply(edit).unwrap();
        }
        // Move two of them to level 1 is invalid (overlap), so delete one
        // instead.
        let mut edit = VersionEdit::default();
        edit.delete_file(0, 11);
        set.log_and_apply(edit).unwrap();
    }

    let set = VersionSet::open(tmp.path()).unwrap();
    let version = set.current();
    let numbers: Vec<u64> = version.files(0).iter().map(|f| f.number).collect();
    assert_eq!(numbers, vec![12, 10]); // newest-first, 11 deleted
    assert_eq!(set.last_sequence(), 102);
}

#[test]
fn level0_is_newest_first_and_level1_sorted() {
    let tmp = TempDir::new().unwrap();
    let mut set = VersionSet::open(tmp.path()).unwrap();

    let mut edit = VersionEdit::default();
    edit.add_file(0, meta(3, b"k", b"p"));
    edit.add_file(0, meta(9, b"a", b"z"));
    edit.add_file(1, meta(5, b"n", b"q"));
    edit.add_file(1, meta(4, b"a", b"c"));
    set.log_and_apply(edit).unwrap();

    let version = set.current();
    let l0: Vec<u64> = version.files(0).iter().map(|f| f.number).collect();
    assert_eq!(l0, vec![9, 3]);
    let l1: Vec<u64> = version.files(1).iter().map(|f| f.number).collect();
    assert_eq!(l1, vec![4, 5]);
}

#[test]
fn overlapping_level1_files_rejected() {
    let tmp = TempDir::new().unwrap();
    let mut set = VersionSet::open(tmp.path()).unwrap();

    let mut edit = VersionEdit::default();
    edit.add_file(1, meta(4, b"a", b"m"));
    edit.add_file(1, meta(5, b"k", b"z"));
    assert!(matches!(
        set.log_and_apply(edit),
        Err(VersionError::Corruption(_))
    ));
    // The failed edit must not have been published.
    assert_eq!(set.current().file_count(), 0);
}

#[test]
fn file_numbers_stay_monotonic_across_reopen() {
    let tmp = TempDir::new().unwrap();
    let first = {
        let mut set = VersionSet::open(tmp.path()).unwrap();
        let n = set.new_file_number();
        let mut edit = VersionEdit::default();
        edit.add_file(0, meta(n, b"a", b"b"));
        set.log_and_apply(edit).unwrap();
        n
    };
    let mut set = VersionSet::open(tmp.path()).unwrap();
    let next = set.new_file_number();
    assert!(next > first);
}

#[test]
fn compaction_score_and_pick() {
    let tmp = TempDir::new().unwrap();
    let mut set = VersionSet::open(tmp.path()).unwrap();

    // Four level-0 files trip the trigger.
    let mut edit = VersionEdit::default();
    for i in 0..4u64 {
        edit.add_file(0, meta(10 + i, b"a", b"z"));
    }
    // A level-1 file overlapping the level-0 range becomes a parent.
    edit.add_file(1, meta(20, b"m", b"q"));
    set.log_and_apply(edit).unwrap();

    let version = set.current();
    assert!(version.compaction_score(0) >= 1.0);

    let pick = set.pick_compaction().unwrap();
    assert_eq!(pick.level, 0);
    assert_eq!(pick.base.len(), 4); // all overlapping level-0 files
    assert_eq!(pick.parents.len(), 1);
    assert_eq!(pick.parents[0].number, 20);

    let (start, end) = pick.user_key_range();
    assert_eq!(start, b"a".to_vec());
    assert_eq!(end, b"z".to_vec());
}

#[test]
fn no_compaction_when_under_threshold() {
    let tmp = TempDir::new().unwrap();
    let mut set = VersionSet::open(tmp.path()).unwrap();
    let mut edit = VersionEdit::default();
    edit.add_file(0, meta(7, b"a", b"z"));
    set.log_and_apply(edit).unwrap();
    assert!(set.pick_compaction().is_none());
}

#[test]
fn key_may_exist_below_consults_deeper_levels() {
    let tmp = TempDir::new().unwrap();
    let mut set = VersionSet::open(tmp.path()).unwrap();
    let mut edit = VersionEdit::default();
    edit.add_file(2, meta(30, b"f", b"j"));
    set.log_and_apply(edit).unwrap();

    let version = set.current();
    assert!(version.key_may_exist_below(0, b"g"));
    assert!(version.key_may_exist_below(1, b"g"));
    assert!(!version.key_may_exist_below(2, b"g"));
    assert!(!version.key_may_exist_below(0, b"z"));
}

#[test]
fn live_files_tracks_referenced_versions() {
    let tmp = TempDir::new().unwrap();
    let mut set = VersionSet::open(tmp.path()).unwrap();

    let mut edit = VersionEdit::default();
    edit.add_file(0, meta(8, b"a", b"b"));
    set.log_and_apply(edit).unwrap();

    // Hold the old version while a newer edit removes its file.
    let held: Arc<Version> = set.current();
    let mut edit = VersionEdit::default();
    edit.delete_file(0, 8);
    edit.add_file(0, meta(9, b"a", b"b"));
    set.log_and_apply(edit).unwrap();

    let live = set.live_files();
    assert!(live.contains(&8), "held version still references file 8");
    assert!(live.contains(&9));

    drop(held);
    let live = set.live_files();
    assert!(!live.contains(&8));
    assert!(live.contains(&9));
}

#[test]
fn current_file_points_at_a_manifest() {
    let tmp = TempDir::new().unwrap();
    let _set = VersionSet::open(tmp.path()).unwrap();
    let contents = std::fs::read_to_string(filename::current_file(tmp.path())).unwrap();
    let name = contents.trim_end();
    assert!(matches!(
        filename::parse_file_name(name),
        Some(filename::FileType::Manifest(_))
    ));
    assert!(tmp.path().join(name).exists());
}
