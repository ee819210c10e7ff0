use super::*;
use crate::TableError;
use anyhow::Result;
use memtable::LookupKey;
use tempfile::tempdir;

// -------------------- Basic open & get --------------------

#[test]
fn open_and_get_entries() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("000001.sst");
    write_memtable(&path, 1, &sample_memtable(), &Options::default())?;
    let reader = open(&path, 1)?;

    assert_eq!(
        reader.get(&LookupKey::new(b"a", 10), false)?,
        Some((ValueKind::Value, b"apple".to_vec()))
    );
    assert_eq!(
        reader.get(&LookupKey::new(b"b", 10), false)?,
        Some((ValueKind::Value, b"banana".to_vec()))
    );
    // Present but empty.
    assert_eq!(
        reader.get(&LookupKey::new(b"c", 10), false)?,
        Some((ValueKind::Value, Vec::new()))
    );
    // Tombstones are returned so callers stop searching.
    assert_eq!(
        reader.get(&LookupKey::new(b"d", 10), false)?,
        Some((ValueKind::Deletion, Vec::new()))
    );
    assert!(reader.get(&LookupKey::new(b"nope", 10), false)?.is_none());
    Ok(())
}

#[test]
fn get_honours_sequence_bound() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("000001.sst");
    let mem = Arc::new(MemTable::new(icmp()));
    mem.add(3, ValueKind::Value, b"k", b"v3");
    mem.add(7, ValueKind::Value, b"k", b"v7");
    write_memtable(&path, 1, &mem, &Options::default())?;
    let reader = open(&path, 1)?;

    assert_eq!(
        reader.get(&LookupKey::new(b"k", 100), false)?,
        Some((ValueKind::Value, b"v7".to_vec()))
    );
    assert_eq!(
        reader.get(&LookupKey::new(b"k", 5), false)?,
        Some((ValueKind::Value, b"v3".to_vec()))
    );
    assert!(reader.get(&LookupKey::new(b"k", 2), false)?.is_none());
    Ok(())
}

#[test]
fn summary_survives_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("000042.sst");
    let written = write_memtable(&path, 42, &sample_memtable(), &Options::default())?;

    let reader = open(&path, 42)?;
    assert_eq!(reader.summary(), &written);
    assert_eq!(reader.number(), 42);
    assert_eq!(reader.file_size(), written.file_size);
    Ok(())
}

// -------------------- Large values --------------------

#[test]
fn large_value_roundtrip() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("000001.sst");

    let mem = Arc::new(MemTable::new(icmp()));
    mem.add(1, ValueKind::Value, b"big", &vec![b'x'; 500_000]);
    write_memtable(&path, 1, &mem, &Options::default())?;

    let reader = open(&path, 1)?;
    let (_, value) = reader.get(&LookupKey::new(b"big", 1), true)?.unwrap();
    assert_eq!(value.len(), 500_000);
    Ok(())
}

// -------------------- Bloom filter --------------------

#[test]
fn filter_finds_all_inserted_keys() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("000001.sst");
    write_memtable(&path, 1, &numbered_memtable(500), &small_block_options())?;

    let reader = open(&path, 1)?;
    assert!(reader.has_filter());
    for i in 0..500u64 {
        let key = format!("key{:05}", i);
        let hit = reader.get(&LookupKey::new(key.as_bytes(), 1000), false)?;
        assert_eq!(hit, Some((ValueKind::Value, format!("val{}", i).into_bytes())));
    }
    Ok(())
}

#[test]
fn missing_keys_between_existing_ones_are_not_found() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("000001.sst");
    write_memtable(&path, 1, &numbered_memtable(100), &small_block_options())?;

    let reader = open(&path, 1)?;
    for i in 0..100u64 {
        let key = format!("key{:05}x", i);
        assert!(reader.get(&LookupKey::new(key.as_bytes(), 1000), false)?.is_none());
    }
    Ok(())
}

// -------------------- Validation errors --------------------

#[test]
fn open_file_too_small() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("000001.sst");
    std::fs::write(&path, b"short").unwrap();

    assert!(matches!(
        SSTableReader::open(&path, 1, icmp(), false),
        Err(TableError::Corruption(_))
    ));
}

#[test]
fn open_bad_magic() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("000001.sst");
    write_memtable(&path, 1, &sample_memtable(), &Options::default())?;

    let mut data = std::fs::read(&path)?;
    let n = data.len();
    data[n - 4..].copy_from_slice(&[0xBA, 0xAD, 0xF0, 0x0D]);
    std::fs::write(&path, &data)?;

    let err = SSTableReader::open(&path, 1, icmp(), false).unwrap_err();
    assert!(err.to_string().contains("magic"));
    Ok(())
}

#[test]
fn open_nonexistent_file() {
    let dir = tempdir().unwrap();
    let result = SSTableReader::open(dir.path().join("000009.sst"), 9, icmp(), false);
    assert!(matches!(result, Err(TableError::Io(_))));
}

#[test]
fn open_with_wrong_number_is_corruption() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("000001.sst");
    write_memtable(&path, 1, &sample_memtable(), &Options::default())?;

    assert!(matches!(
        SSTableReader::open(&path, 2, icmp(), false),
        Err(TableError::Corruption(_))
    ));
    Ok(())
}

#[test]
fn flipped_data_byte_is_detected_when_verifying() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("000001.sst");
    write_memtable(&path, 1, &sample_memtable(), &Options::default())?;

    // The first data block starts at offset 0; byte 4 is inside key "a".
    let mut data = std::fs::read(&path)?;
    data[4] ^= 0xFF;
    std::fs::write(&path, &data)?;

    let reader = open(&path, 1)?;
    let err = reader.get(&LookupKey::new(b"b", 10), true).unwrap_err();
    assert!(matches!(err, TableError::Corruption(_)));

    let paranoid = SSTableReader::open(&path, 1, icmp(), true)?;
    assert!(paranoid.get(&LookupKey::new(b"b", 10), false).is_err());
    Ok(())
}

#[test]
fn damaged_index_fails_open() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("000001.sst");
    write_memtable(&path, 1, &sample_memtable(), &Options::default())?;

    let mut data = std::fs::read(&path)?;
    let footer = crate::Footer::decode(&data[data.len() - crate::FOOTER_BYTES..])?;
    data[footer.index.offset as usize] ^= 0xFF;
    std::fs::write(&path, &data)?;

    assert!(matches!(
        SSTableReader::open(&path, 1, icmp(), false),
        Err(TableError::Corruption(_))
    ));
    Ok(())
}

// -------------------- Concurrency --------------------

#[test]
fn concurrent_gets_share_one_reader() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("000001.sst");
    write_memtable(&path, 1, &numbered_memtable(300), &small_block_options())?;
    let reader = open(&path, 1)?;

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let r = Arc::clone(&reader);
            std::thread::spawn(move || {
                for i in (t..300u64).step_by(4) {
                    let key = format!("key{:05}", i);
                    let hit = r.get(&LookupKey::new(key.as_bytes(), 1000), false).unwrap();
                    assert!(hit.is_some());
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    Ok(())
}
