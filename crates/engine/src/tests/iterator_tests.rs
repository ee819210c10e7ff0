use anyhow::Result;
use tempfile::tempdir;

use super::{del, open, put, scan, small_options};
use crate::*;

fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
    items
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn collect_reverse(it: &mut DbIterator) -> Vec<String> {
    let mut keys = Vec::new();
    it.seek_to_last();
    while it.valid() {
        keys.push(String::from_utf8_lossy(it.key()).into_owned());
        it.prev();
    }
    keys
}

#[test]
fn empty_store_iterates_nothing() -> Result<()> {
    let dir = tempdir()?;
    let db = open(dir.path())?;

    let mut it = db.iter(&ReadOptions::default())?;
    assert!(!it.valid());
    it.seek_to_first();
    assert!(!it.valid());
    it.seek_to_last();
    assert!(!it.valid());
    it.seek(b"x");
    assert!(!it.valid());
    assert!(it.key().is_empty());
    it.status()?;
    Ok(())
}

#[test]
fn forward_scan_hides_deletes_and_old_versions() -> Result<()> {
    let dir = tempdir()?;
    let db = open(dir.path())?;

    put(&db, "b", "old")?;
    put(&db, "a", "1")?;
    put(&db, "c", "3")?;
    put(&db, "b", "2")?;
    del(&db, "c")?;
    put(&db, "d", "4")?;

    assert_eq!(
        scan(&db, &ReadOptions::default())?,
        pairs(&[("a", "1"), ("b", "2"), ("d", "4")])
    );
    Ok(())
}

#[test]
fn reverse_scan() -> Result<()> {
    let dir = tempdir()?;
    let db = open(dir.path())?;

    for k in ["a", "b", "c", "d"] {
        put(&db, k, k)?;
    }
    del(&db, "c")?;
    put(&db, "a", "again")?;

    let mut it = db.iter(&ReadOptions::default())?;
    assert_eq!(collect_reverse(&mut it), vec!["d", "b", "a"]);
    it.status()?;
    Ok(())
}

#[test]
fn seek_lands_on_first_key_at_or_after_target() -> Result<()> {
    let dir = tempdir()?;
    let db = open(dir.path())?;

    for k in ["apple", "banana", "cherry"] {
        put(&db, k, "x")?;
    }
    let mut it = db.iter(&ReadOptions::default())?;

    it.seek(b"banana");
    assert_eq!(it.key(), b"banana");
    it.seek(b"bb");
    assert_eq!(it.key(), b"cherry");
    it.seek(b"a");
    assert_eq!(it.key(), b"apple");
    it.seek(b"zzz");
    assert!(!it.valid());
    Ok(())
}

#[test]
fn direction_changes() -> Result<()> {
    let dir = tempdir()?;
    let db = open(dir.path())?;

    for k in ["a", "b", "c", "d", "e"] {
        put(&db, k, k)?;
    }
    let mut it = db.iter(&ReadOptions::default())?;

    it.seek(b"c");
    assert_eq!(it.key(), b"c");
    it.prev();
    assert_eq!(it.key(), b"b");
    it.next();
    assert_eq!(it.key(), b"c");
    it.next();
    assert_eq!(it.key(), b"d");
    it.prev();
    it.prev();
    assert_eq!(it.key(), b"b");
    assert_eq!(it.value(), b"b");

    it.seek_to_first();
    it.prev();
    assert!(!it.valid());
    Ok(())
}

#[test]
fn direction_changes_skip_hidden_entries() -> Result<()> {
    let dir = tempdir()?;
    let db = open(dir.path())?;

    put(&db, "a", "1")?;
    put(&db, "b", "1")?;
    put(&db, "b", "2")?;
    put(&db, "c", "1")?;
    del(&db, "c")?;
    put(&db, "d", "1")?;

    let mut it = db.iter(&ReadOptions::default())?;
    it.seek_to_last();
    assert_eq!(it.key(), b"d");
    it.prev();
    assert_eq!((it.key(), it.value()), (&b"b"[..], &b"2"[..]));
    it.next();
    assert_eq!(it.key(), b"d");
    it.prev();
    it.prev();
    assert_eq!(it.key(), b"a");
    it.next();
    assert_eq!((it.key(), it.value()), (&b"b"[..], &b"2"[..]));
    Ok(())
}

#[test]
fn iterator_is_a_point_in_time_view() -> Result<()> {
    let dir = tempdir()?;
    let db = open(dir.path())?;

    put(&db, "a", "1")?;
    put(&db, "b", "2")?;
    let mut it = db.iter(&ReadOptions::default())?;

    put(&db, "c", "3")?;
    del(&db, "a")?;
    db.force_flush()?;

    let mut seen = Vec::new();
    it.seek_to_first();
    while it.valid() {
        seen.push(String::from_utf8_lossy(it.key()).into_owned());
        it.next();
    }
    assert_eq!(seen, vec!["a", "b"]);
    Ok(())
}

#[test]
fn iterator_pins_tables_through_compaction() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(small_options(), dir.path())?;

    for i in 0..400 {
        put(&db, &format!("k{:04}", i), "v")?;
    }
    db.force_flush()?;
    let mut it = db.iter(&ReadOptions::default())?;

    // Compaction rewrites and deletes the tables the iterator reads.
    for i in 0..400 {
        del(&db, &format!("k{:04}", i))?;
    }
    db.compact_range(None, None)?;

    let mut count = 0;
    it.seek_to_first();
    while it.valid() {
        count += 1;
        it.next();
    }
    it.status()?;
    assert_eq!(count, 400);
    assert!(scan(&db, &ReadOptions::default())?.is_empty());
    Ok(())
}

#[test]
fn merged_scan_across_stage_and_levels() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(small_options(), dir.path())?;

    for i in (0..300).step_by(3) {
        put(&db, &format!("k{:04}", i), "deep")?;
    }
    db.compact_range(None, None)?;
    for i in (1..300).step_by(3) {
        put(&db, &format!("k{:04}", i), "l0")?;
    }
    db.force_flush()?;
    for i in (2..300).step_by(3) {
        put(&db, &format!("k{:04}", i), "mem")?;
    }

    let all = scan(&db, &ReadOptions::default())?;
    assert_eq!(all.len(), 300);
    for (i, (key, value)) in all.iter().enumerate() {
        assert_eq!(key, &format!("k{:04}", i));
        let expected = match i % 3 {
            0 => "deep",
            1 => "l0",
            _ => "mem",
        };
        assert_eq!(value, expected);
    }

    let mut it = db.iter(&ReadOptions::default())?;
    let reversed = collect_reverse(&mut it);
    assert_eq!(reversed.len(), 300);
    assert_eq!(reversed.first().map(String::as_str), Some("k0299"));
    assert_eq!(reversed.last().map(String::as_str), Some("k0000"));
    Ok(())
}
