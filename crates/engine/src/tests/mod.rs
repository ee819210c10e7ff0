use std::fs;
use std::path::Path;

use anyhow::Result;

use crate::{Db, Options, ReadOptions, WriteOptions};

mod iterator_tests;
mod read_tests;
mod snapshot_tests;

fn options() -> Options {
    Options {
        create_if_missing: true,
        ..Options::default()
    }
}

/// Tiny buffers so a few hundred writes produce several tables.
fn small_options() -> Options {
    Options {
        create_if_missing: true,
        write_buffer_size: 4 * 1024,
        max_file_size: 8 * 1024,
        block_size: 256,
        max_bytes_for_level_base: 32 * 1024,
        ..Options::default()
    }
}

fn open(path: &Path) -> Result<Db> {
    Ok(Db::open(options(), path)?)
}

fn put(db: &Db, key: &str, value: &str) -> Result<()> {
    db.put(&WriteOptions::default(), key.as_bytes(), value.as_bytes())?;
    Ok(())
}

fn del(db: &Db, key: &str) -> Result<()> {
    db.delete(&WriteOptions::default(), key.as_bytes())?;
    Ok(())
}

fn get(db: &Db, key: &str) -> Result<Option<String>> {
    let value = db.get(&ReadOptions::default(), key.as_bytes())?;
    Ok(value.map(|v| String::from_utf8_lossy(&v).into_owned()))
}

/// Every visible pair, in key order.
fn scan(db: &Db, opts: &ReadOptions<'_>) -> Result<Vec<(String, String)>> {
    let mut it = db.iter(opts)?;
    let mut out = Vec::new();
    it.seek_to_first();
    while it.valid() {
        out.push((
            String::from_utf8_lossy(it.key()).into_owned(),
            String::from_utf8_lossy(it.value()).into_owned(),
        ));
        it.next();
    }
    it.status()?;
    Ok(out)
}

fn count_files(dir: &Path, ext: &str) -> usize {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| {
                    e.path()
                        .extension()
                        .and_then(|s| s.to_str())
                        .map(|x| x == ext)
                        .unwrap_or(false)
                })
                .count()
        })
        .unwrap_or(0)
}

fn total_table_files(db: &Db) -> usize {
    (0..7).map(|level| db.num_files_at_level(level)).sum()
}
