use anyhow::Result;
use tempfile::tempdir;

use super::{del, get, open, put, scan, small_options};
use crate::*;

#[test]
fn batch_delete_then_put() -> Result<()> {
    let dir = tempdir()?;
    let db = open(dir.path())?;

    put(&db, "key1", "value1")?;
    assert_eq!(get(&db, "key1")?.as_deref(), Some("value1"));

    let mut batch = WriteBatch::new();
    batch.delete(b"key1");
    batch.put(b"key2", b"value2");
    db.write(&WriteOptions::default(), batch)?;

    assert_eq!(get(&db, "key1")?, None);
    assert_eq!(get(&db, "key2")?.as_deref(), Some("value2"));
    assert_eq!(
        scan(&db, &ReadOptions::default())?,
        vec![("key2".to_string(), "value2".to_string())]
    );
    Ok(())
}

#[test]
fn get_sees_every_tier() -> Result<()> {
    let dir = tempdir()?;
    let db = open(dir.path())?;

    put(&db, "deep", "1")?;
    db.compact_range(None, None)?;
    put(&db, "l0", "2")?;
    db.force_flush()?;
    put(&db, "mem", "3")?;

    assert_eq!(get(&db, "deep")?.as_deref(), Some("1"));
    assert_eq!(get(&db, "l0")?.as_deref(), Some("2"));
    assert_eq!(get(&db, "mem")?.as_deref(), Some("3"));
    Ok(())
}

#[test]
fn newest_version_wins_across_tables() -> Result<()> {
    let dir = tempdir()?;
    let db = open(dir.path())?;

    for round in 0..4 {
        put(&db, "k", &format!("v{}", round))?;
        db.force_flush()?;
    }
    assert_eq!(get(&db, "k")?.as_deref(), Some("v3"));

    db.compact_range(None, None)?;
    assert_eq!(get(&db, "k")?.as_deref(), Some("v3"));
    Ok(())
}

#[test]
fn tombstone_in_table_hides_older_table() -> Result<()> {
    let dir = tempdir()?;
    let db = open(dir.path())?;

    put(&db, "k", "v")?;
    db.force_flush()?;
    del(&db, "k")?;
    db.force_flush()?;

    assert_eq!(get(&db, "k")?, None);
    assert!(scan(&db, &ReadOptions::default())?.is_empty());
    Ok(())
}

#[test]
fn verify_checksums_read() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(small_options(), dir.path())?;

    for i in 0..300 {
        put(&db, &format!("k{:04}", i), &format!("v{:04}", i))?;
    }
    db.force_flush()?;

    let opts = ReadOptions {
        verify_checksums: true,
        fill_cache: false,
        ..ReadOptions::default()
    };
    assert_eq!(
        db.get(&opts, b"k0123")?.as_deref(),
        Some(&b"v0123"[..])
    );
    assert_eq!(scan(&db, &opts)?.len(), 300);
    Ok(())
}

#[test]
fn reads_during_background_flushes() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(small_options(), dir.path())?;

    for i in 0..2000 {
        put(&db, &format!("k{:05}", i), &format!("v{}", i))?;
        if i % 250 == 0 {
            // Everything written so far stays visible while stages rotate.
            for j in (0..=i).step_by(61) {
                assert_eq!(get(&db, &format!("k{:05}", j))?, Some(format!("v{}", j)));
            }
        }
    }
    Ok(())
}

#[test]
fn properties() -> Result<()> {
    let dir = tempdir()?;
    let db = open(dir.path())?;

    put(&db, "a", "1")?;
    db.force_flush()?;

    let total: usize = (0..7)
        .map(|level| {
            db.property(&format!("shoal.num-files-at-level{}", level))
                .and_then(|s| s.parse::<usize>().ok())
                .unwrap_or(0)
        })
        .sum();
    assert_eq!(total, 1);

    assert!(db.property("shoal.stats").is_some());
    assert!(db.property("shoal.sstables").is_some());
    assert!(db
        .property("shoal.approximate-memory-usage")
        .and_then(|s| s.parse::<usize>().ok())
        .is_some());
    assert_eq!(db.property("shoal.num-files-at-level99"), None);
    assert_eq!(db.property("shoal.unknown"), None);
    assert_eq!(db.property("other.stats"), None);
    Ok(())
}
