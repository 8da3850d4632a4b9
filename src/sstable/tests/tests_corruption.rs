use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};

use tempfile::TempDir;

use super::*;
use crate::keys::{MAX_SEQUENCE, ValueType};
use crate::sstable::{FOOTER_SIZE, TableError};

fn flip_byte(path: &std::path::Path, offset: u64) {
    let mut file = OpenOptions::new().read(true).write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    let mut byte = [0u8; 1];
    file.read_exact(&mut byte).unwrap();
    byte[0] ^= 0xff;
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(&byte).unwrap();
}

fn sample_rows() -> Vec<(&'static [u8], u64, ValueType, &'static [u8])> {
    vec![
        (b"alpha", 1, ValueType::Value, b"1"),
        (b"beta", 2, ValueType::Value, b"2"),
        (b"gamma", 3, ValueType::Value, b"3"),
    ]
}

#[test]
fn bad_magic_rejected_at_open() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("000001.sst");
    build_table(&path, &sample_rows(), 4096).unwrap();

    let len = std::fs::metadata(&path).unwrap().len();
    flip_byte(&path, len - 1); // inside the magic

    let err = Table::open(&path, 1, test_block_cache()).unwrap_err();
    assert!(matches!(err, TableError::Corruption(_)));
}

#[test]
fn truncated_file_rejected_at_open() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("000001.sst");
    build_table(&path, &sample_rows(), 4096).unwrap();

    let file = OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len((FOOTER_SIZE - 1) as u64).unwrap();
    drop(file);

    assert!(Table::open(&path, 1, test_block_cache()).is_err());
}

#[test]
fn corrupt_data_block_fails_the_read_and_marks_suspect() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("000001.sst");
    build_table(&path, &sample_rows(), 4096).unwrap();

    // The data block starts at offset 0; corrupt its first entry.
    flip_byte(&path, 10);

    let table = open_table(&path, test_block_cache());
    assert!(!table.is_suspect());
    let err = table.get(b"alpha", MAX_SEQUENCE).unwrap_err();
    assert!(matches!(err, TableError::Corruption(_)));
    assert!(table.is_suspect());
}

#[test]
fn corrupt_index_block_rejected_at_open() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("000001.sst");
    build_table(&path, &sample_rows(), 4096).unwrap();

    // The index block sits just before the footer; walk back a little
    // past the footer and trailer to hit its contents.
    let len = std::fs::metadata(&path).unwrap().len();
    flip_byte(&path, len - (FOOTER_SIZE + 8) as u64);

    assert!(Table::open(&path, 1, test_block_cache()).is_err());
}

#[test]
fn cached_block_survives_later_file_corruption() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("000001.sst");
    build_table(&path, &sample_rows(), 4096).unwrap();

    let cache = test_block_cache();
    let table = open_table(&path, cache);

    // First read populates the block cache.
    assert!(matches!(
        table.get(b"alpha", MAX_SEQUENCE).unwrap(),
        crate::sstable::TableGetResult::Found(1, _)
    ));

    // Later reads of the same block are served from cache, so the
    // on-disk bytes are no longer consulted.
    flip_byte(&path, 10);
    assert!(matches!(
        table.get(b"beta", MAX_SEQUENCE).unwrap(),
        crate::sstable::TableGetResult::Found(2, _)
    ));
}
