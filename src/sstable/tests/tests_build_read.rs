use tempfile::TempDir;

use super::*;
use crate::keys::{self, MAX_SEQUENCE, ValueType};
use crate::sstable::{DEFAULT_BLOCK_SIZE, TableGetResult};

#[test]
fn build_then_point_lookup() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("000001.sst");
    let rows: Vec<(&[u8], u64, ValueType, &[u8])> = vec![
        (b"apple", 3, ValueType::Value, b"red"),
        (b"banana", 1, ValueType::Value, b"yellow"),
        (b"cherry", 2, ValueType::Deletion, b""),
    ];
    build_table(&path, &rows, DEFAULT_BLOCK_SIZE).unwrap();
    let table = open_table(&path, test_block_cache());

    assert_eq!(
        table.get(b"apple", MAX_SEQUENCE).unwrap(),
        TableGetResult::Found(3, b"red".to_vec())
    );
    assert_eq!(
        table.get(b"banana", MAX_SEQUENCE).unwrap(),
        TableGetResult::Found(1, b"yellow".to_vec())
    );
    assert_eq!(
        table.get(b"cherry", MAX_SEQUENCE).unwrap(),
        TableGetResult::Deleted(2)
    );
    assert_eq!(
        table.get(b"durian", MAX_SEQUENCE).unwrap(),
        TableGetResult::NotFound
    );
}

#[test]
fn snapshot_filters_newer_versions() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("000001.sst");
    // Two versions of one key: seq 7 (newer) sorts before seq 2.
    let rows: Vec<(&[u8], u64, ValueType, &[u8])> = vec![
        (b"k", 7, ValueType::Value, b"new"),
        (b"k", 2, ValueType::Value, b"old"),
    ];
    build_table(&path, &rows, DEFAULT_BLOCK_SIZE).unwrap();
    let table = open_table(&path, test_block_cache());

    assert_eq!(
        table.get(b"k", MAX_SEQUENCE).unwrap(),
        TableGetResult::Found(7, b"new".to_vec())
    );
    assert_eq!(
        table.get(b"k", 5).unwrap(),
        TableGetResult::Found(2, b"old".to_vec())
    );
    assert_eq!(table.get(b"k", 1).unwrap(), TableGetResult::NotFound);
}

#[test]
fn iterator_round_trips_the_input_order() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("000001.sst");

    let owned: Vec<(Vec<u8>, u64, Vec<u8>)> = (0..500u32)
        .map(|i| {
            (
                format!("key-{i:05}").into_bytes(),
                u64::from(1000 - i),
                format!("value-{i}").into_bytes(),
            )
        })
        .collect();
    let rows: Vec<(&[u8], u64, ValueType, &[u8])> = owned
        .iter()
        .map(|(k, s, v)| (k.as_slice(), *s, ValueType::Value, v.as_slice()))
        .collect();

    // Small blocks force many data blocks and index entries.
    build_table(&path, &rows, 256).unwrap();
    let table = open_table(&path, test_block_cache());

    let mut iter = TableIterator::new(Arc::clone(&table));
    iter.seek_to_first();
    let mut seen = Vec::new();
    while iter.valid() {
        let parsed = keys::parse_internal_key(iter.key()).unwrap();
        seen.push((
            parsed.user_key.to_vec(),
            parsed.sequence,
            iter.value().to_vec(),
        ));
        iter.next();
    }
    assert!(iter.take_error().is_none());
    assert_eq!(seen.len(), owned.len());
    for ((k, s, v), (ek, es, ev)) in seen.iter().zip(&owned) {
        assert_eq!(k, ek);
        assert_eq!(s, es);
        assert_eq!(v, ev);
    }
}

#[test]
fn iterator_seek_lands_mid_table() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("000001.sst");
    let owned: Vec<Vec<u8>> = (0..200u32)
        .map(|i| format!("key-{i:04}").into_bytes())
        .collect();
    let rows: Vec<(&[u8], u64, ValueType, &[u8])> = owned
        .iter()
        .map(|k| (k.as_slice(), 1, ValueType::Value, b"v".as_slice()))
        .collect();
    build_table(&path, &rows, 128).unwrap();
    let table = open_table(&path, test_block_cache());

    let target = keys::InternalKey::new(b"key-0100", MAX_SEQUENCE, ValueType::Value);
    let mut iter = TableIterator::new(Arc::clone(&table));
    iter.seek(target.as_bytes());
    assert!(iter.valid());
    assert_eq!(
        keys::parse_internal_key(iter.key()).unwrap().user_key,
        b"key-0100"
    );

    // Seeking past the end goes invalid without error.
    let past = keys::InternalKey::new(b"zzz", MAX_SEQUENCE, ValueType::Value);
    iter.seek(past.as_bytes());
    assert!(!iter.valid());
    assert!(iter.take_error().is_none());
}

#[test]
fn single_entry_table_has_equal_bounds() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("000001.sst");
    let rows: Vec<(&[u8], u64, ValueType, &[u8])> =
        vec![(b"only", 9, ValueType::Value, b"entry")];
    let summary = build_table(&path, &rows, DEFAULT_BLOCK_SIZE).unwrap();

    assert_eq!(summary.num_entries, 1);
    assert_eq!(summary.smallest, summary.largest);
    assert_eq!(keys::extract_user_key(&summary.smallest), b"only");

    let table = open_table(&path, test_block_cache());
    assert_eq!(
        table.get(b"only", MAX_SEQUENCE).unwrap(),
        TableGetResult::Found(9, b"entry".to_vec())
    );
}

#[test]
fn oversized_key_gets_its_own_block() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("000001.sst");
    let block_size = 512usize;
    let huge_key = vec![b'k'; 2 * block_size];
    let rows: Vec<(&[u8], u64, ValueType, &[u8])> = vec![
        (b"aaa", 1, ValueType::Value, b"before"),
        (huge_key.as_slice(), 2, ValueType::Value, b"big"),
        (b"zzz", 3, ValueType::Value, b"after"),
    ];
    build_table(&path, &rows, block_size).unwrap();
    let table = open_table(&path, test_block_cache());

    assert_eq!(
        table.get(&huge_key, MAX_SEQUENCE).unwrap(),
        TableGetResult::Found(2, b"big".to_vec())
    );
    assert_eq!(
        table.get(b"aaa", MAX_SEQUENCE).unwrap(),
        TableGetResult::Found(1, b"before".to_vec())
    );
    assert_eq!(
        table.get(b"zzz", MAX_SEQUENCE).unwrap(),
        TableGetResult::Found(3, b"after".to_vec())
    );
}

#[test]
fn bloom_filter_short_circuits_absent_keys() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("000001.sst");
    let owned: Vec<Vec<u8>> = (0..100u32)
        .map(|i| format!("present-{i:03}").into_bytes())
        .collect();
    let rows: Vec<(&[u8], u64, ValueType, &[u8])> = owned
        .iter()
        .map(|k| (k.as_slice(), 1, ValueType::Value, b"v".as_slice()))
        .collect();
    build_table(&path, &rows, DEFAULT_BLOCK_SIZE).unwrap();
    let table = open_table(&path, test_block_cache());

    for k in &owned {
        assert!(table.may_contain(k));
    }
    // At a 1% target rate, 100 distinct absent probes should see the
    // filter reject the overwhelming majority.
    let rejected = (0..100u32)
        .filter(|i| !table.may_contain(format!("absent-{i:03}").as_bytes()))
        .count();
    assert!(rejected > 80, "only {rejected} rejections");
}

#[test]
fn builder_rejects_out_of_order_keys() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("000001.sst");
    let mut builder = TableBuilder::new(&path, 4).unwrap();
    let first = InternalKey::new(b"m", 5, ValueType::Value);
    builder.add(first.as_bytes(), b"v").unwrap();

    let smaller_user_key = InternalKey::new(b"a", 9, ValueType::Value);
    assert!(matches!(
        builder.add(smaller_user_key.as_bytes(), b"v"),
        Err(TableError::OutOfOrder)
    ));

    // Same user key with a *higher* sequence sorts earlier, so it is also
    // out of order.
    let newer_same_key = InternalKey::new(b"m", 9, ValueType::Value);
    assert!(matches!(
        builder.add(newer_same_key.as_bytes(), b"v"),
        Err(TableError::OutOfOrder)
    ));
}

#[test]
fn abandon_removes_the_partial_file() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("000001.sst");
    let mut builder = TableBuilder::new(&path, 4).unwrap();
    let key = InternalKey::new(b"k", 1, ValueType::Value);
    builder.add(key.as_bytes(), b"v").unwrap();
    builder.abandon().unwrap();
    assert!(!path.exists());
}
