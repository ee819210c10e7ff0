use std::sync::Arc;

use anyhow::Result;
use tempfile::tempdir;

use super::{del, get, open, put, scan, small_options};
use crate::snapshot::SnapshotList;
use crate::*;

fn at(snapshot: &Snapshot) -> ReadOptions<'_> {
    ReadOptions {
        snapshot: Some(snapshot),
        ..ReadOptions::default()
    }
}

#[test]
fn snapshot_list_tracks_oldest() {
    let list = SnapshotList::default();
    assert_eq!(list.oldest(), None);

    list.acquire(5);
    list.acquire(3);
    list.acquire(3);
    assert_eq!(list.oldest(), Some(3));
    assert_eq!(list.len(), 3);
}

#[test]
fn dropping_snapshots_releases_them() -> Result<()> {
    let dir = tempdir()?;
    let db = open(dir.path())?;

    put(&db, "k", "1")?;
    let first = db.snapshot();
    let same = db.snapshot();
    put(&db, "k", "2")?;
    let second = db.snapshot();
    assert_eq!(db.inner.snapshots.oldest(), Some(first.sequence()));
    assert_eq!(db.inner.snapshots.len(), 3);

    drop(first);
    assert_eq!(db.inner.snapshots.oldest(), Some(same.sequence()));
    db.release_snapshot(same);
    assert_eq!(db.inner.snapshots.oldest(), Some(second.sequence()));
    drop(second);
    assert_eq!(db.inner.snapshots.oldest(), None);
    Ok(())
}

#[test]
fn snapshot_reads_are_frozen() -> Result<()> {
    let dir = tempdir()?;
    let db = open(dir.path())?;

    put(&db, "a", "1")?;
    put(&db, "b", "1")?;
    let snap = db.snapshot();
    assert_eq!(snap.sequence(), 2);

    put(&db, "a", "2")?;
    del(&db, "b")?;
    put(&db, "c", "new")?;

    assert_eq!(db.get(&at(&snap), b"a")?, Some(b"1".to_vec()));
    assert_eq!(db.get(&at(&snap), b"b")?, Some(b"1".to_vec()));
    assert_eq!(db.get(&at(&snap), b"c")?, None);
    assert_eq!(
        scan(&db, &at(&snap))?,
        vec![
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "1".to_string())
        ]
    );

    assert_eq!(get(&db, "a")?.as_deref(), Some("2"));
    assert_eq!(get(&db, "b")?, None);
    Ok(())
}

#[test]
fn snapshot_on_empty_store() -> Result<()> {
    let dir = tempdir()?;
    let db = open(dir.path())?;
    let snap = db.snapshot();
    put(&db, "k", "v")?;

    assert_eq!(snap.sequence(), 0);
    assert_eq!(db.get(&at(&snap), b"k")?, None);
    assert!(scan(&db, &at(&snap))?.is_empty());
    Ok(())
}

#[test]
fn snapshot_survives_flushes() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(small_options(), dir.path())?;

    for i in 0..200 {
        put(&db, &format!("k{:03}", i), "before")?;
    }
    let snap = db.snapshot();
    for i in 0..200 {
        put(&db, &format!("k{:03}", i), "after")?;
    }
    db.force_flush()?;

    let old = scan(&db, &at(&snap))?;
    assert_eq!(old.len(), 200);
    assert!(old.iter().all(|(_, v)| v == "before"));
    let new = scan(&db, &ReadOptions::default())?;
    assert!(new.iter().all(|(_, v)| v == "after"));
    Ok(())
}

#[test]
fn snapshots_across_threads() -> Result<()> {
    let dir = tempdir()?;
    let db = Arc::new(open(dir.path())?);
    put(&db, "k", "base")?;
    let snap = db.snapshot();

    let writer = {
        let db = Arc::clone(&db);
        std::thread::spawn(move || -> crate::Result<()> {
            for i in 0..100 {
                db.put(&WriteOptions::default(), b"k", format!("w{}", i).as_bytes())?;
            }
            Ok(())
        })
    };
    for _ in 0..100 {
        assert_eq!(db.get(&at(&snap), b"k")?, Some(b"base".to_vec()));
    }
    writer.join().expect("writer thread panicked")?;
    assert_eq!(get(&db, "k")?.as_deref(), Some("w99"));
    Ok(())
}
