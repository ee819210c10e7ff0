use super::*;
use anyhow::Result;
use memtable::{extract_user_key, LookupKey, MAX_SEQUENCE_NUMBER};
use tempfile::tempdir;

fn build(n: u64) -> Result<(tempfile::TempDir, Arc<SSTableReader>)> {
    let dir = tempdir()?;
    let path = dir.path().join("000001.sst");
    write_memtable(&path, 1, &numbered_memtable(n), &small_block_options())?;
    let reader = open(&path, 1)?;
    Ok((dir, reader))
}

fn user(k: &[u8]) -> String {
    String::from_utf8_lossy(extract_user_key(k)).into_owned()
}

#[test]
fn forward_scan_matches_insert_order() -> Result<()> {
    let (_dir, reader) = build(250)?;
    let mut it = reader.iter(false);
    it.seek_to_first();
    for i in 0..250u64 {
        assert!(it.valid());
        assert_eq!(user(it.key()), format!("key{:05}", i));
        assert_eq!(it.value(), format!("val{}", i).as_bytes());
        it.next();
    }
    assert!(!it.valid());
    Ok(())
}

#[test]
fn backward_scan_crosses_block_boundaries() -> Result<()> {
    let (_dir, reader) = build(250)?;
    let mut it = reader.iter(false);
    it.seek_to_last();
    for i in (0..250u64).rev() {
        assert!(it.valid());
        assert_eq!(user(it.key()), format!("key{:05}", i));
        it.prev();
    }
    assert!(!it.valid());
    Ok(())
}

#[test]
fn seek_lands_on_next_key() -> Result<()> {
    let (_dir, reader) = build(100)?;
    let mut it = reader.iter(false);

    it.seek(LookupKey::new(b"key00042", MAX_SEQUENCE_NUMBER).internal_key());
    assert_eq!(user(it.key()), "key00042");

    it.seek(LookupKey::new(b"key00042a", MAX_SEQUENCE_NUMBER).internal_key());
    assert_eq!(user(it.key()), "key00043");

    it.seek(LookupKey::new(b"a", MAX_SEQUENCE_NUMBER).internal_key());
    assert_eq!(user(it.key()), "key00000");

    it.seek(LookupKey::new(b"zzz", MAX_SEQUENCE_NUMBER).internal_key());
    assert!(!it.valid());
    Ok(())
}

#[test]
fn direction_switch_at_block_edge() -> Result<()> {
    let (_dir, reader) = build(200)?;
    let mut it = reader.iter(false);
    it.seek_to_first();
    // Walk far enough to leave the first block.
    for _ in 0..20 {
        it.next();
    }
    let here = user(it.key());
    it.prev();
    it.next();
    assert_eq!(user(it.key()), here);
    Ok(())
}

#[test]
fn newer_versions_come_first() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("000001.sst");
    let mem = Arc::new(MemTable::new(icmp()));
    mem.add(1, ValueKind::Value, b"k", b"old");
    mem.add(2, ValueKind::Deletion, b"k", b"");
    mem.add(3, ValueKind::Value, b"k", b"new");
    write_memtable(&path, 1, &mem, &Options::default())?;

    let reader = open(&path, 1)?;
    let mut it = reader.iter(false);
    it.seek_to_first();
    let mut seqs = Vec::new();
    while it.valid() {
        seqs.push(memtable::parse_internal_key(it.key()).unwrap().sequence);
        it.next();
    }
    assert_eq!(seqs, vec![3, 2, 1]);
    Ok(())
}

#[test]
fn corrupt_block_sets_status() -> Result<()> {
    let (dir, _) = build(200)?;
    let path = dir.path().join("000001.sst");
    let mut data = std::fs::read(&path)?;
    data[10] ^= 0xFF;
    std::fs::write(&path, &data)?;

    let reader = open(&path, 1)?;
    let mut it = reader.iter(true);
    it.seek_to_first();
    assert!(!it.valid());
    assert!(it.status().is_some());
    Ok(())
}

#[test]
fn iterator_keeps_reader_alive() -> Result<()> {
    let (_dir, reader) = build(10)?;
    let mut it = reader.iter(false);
    drop(reader);
    it.seek_to_first();
    assert!(it.valid());
    assert_eq!(it.table().number(), 1);
    Ok(())
}

#[test]
fn empty_block_iterator_is_never_valid() -> Result<()> {
    use crate::block::{Block, BlockBuilder};

    let block = Arc::new(Block::new(BlockBuilder::new().finish())?);
    assert!(block.is_empty());
    let mut it = block.iter(icmp());
    it.seek_to_last();
    assert!(!it.valid());
    it.seek_to_first();
    assert!(!it.valid());
    it.prev();
    assert!(!it.valid());
    Ok(())
}
