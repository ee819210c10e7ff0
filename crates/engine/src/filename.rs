//! On-disk layout of a store.
//!
//! ```text
//! <db>/CURRENT            name of the live manifest
//! <db>/MANIFEST-NNNNNN    version edit log
//! <db>/LOCK               held exclusively while the store is open
//! <db>/wal/NNNNNN.log     write-ahead logs
//! <db>/sst/NNNNNN.sst     table files
//! ```
//!
//! Every file number comes from one counter, so numbers are never reused
//! across kinds.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub(crate) const WAL_DIR: &str = "wal";
pub(crate) const SST_DIR: &str = "sst";
pub(crate) const CURRENT: &str = "CURRENT";
pub(crate) const LOCK: &str = "LOCK";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FileType {
    Log(u64),
    Table(u64),
    Manifest(u64),
    Current,
    Lock,
    /// A half-written table or CURRENT replacement.
    Temp,
}

pub(crate) fn wal_dir(db: &Path) -> PathBuf {
    db.join(WAL_DIR)
}

pub(crate) fn sst_dir(db: &Path) -> PathBuf {
    db.join(SST_DIR)
}

pub(crate) fn log_file_path(db: &Path, number: u64) -> PathBuf {
    wal_dir(db).join(format!("{:06}.log", number))
}

pub(crate) fn table_file_name(number: u64) -> String {
    format!("{:06}.sst", number)
}

pub(crate) fn table_file_path(db: &Path, number: u64) -> PathBuf {
    sst_dir(db).join(table_file_name(number))
}

pub(crate) fn manifest_file_name(number: u64) -> String {
    format!("MANIFEST-{:06}", number)
}

pub(crate) fn current_file_path(db: &Path) -> PathBuf {
    db.join(CURRENT)
}

pub(crate) fn lock_file_path(db: &Path) -> PathBuf {
    db.join(LOCK)
}

/// Classifies a file name found in one of the store's directories.
pub(crate) fn parse_file_name(name: &str) -> Option<FileType> {
    match name {
        CURRENT => return Some(FileType::Current),
        LOCK => return Some(FileType::Lock),
        _ => {}
    }
    if name.ends_with(".tmp") || name.ends_with(".dbtmp") {
        return Some(FileType::Temp);
    }
    if let Some(rest) = name.strip_prefix("MANIFEST-") {
        return rest.parse().ok().map(FileType::Manifest);
    }
    if let Some(stem) = name.strip_suffix(".log") {
        return stem.parse().ok().map(FileType::Log);
    }
    if let Some(stem) = name.strip_suffix(".sst") {
        return stem.parse().ok().map(FileType::Table);
    }
    None
}

/// Points CURRENT at manifest `number`: write a temp file, fsync, rename.
pub(crate) fn set_current_file(db: &Path, number: u64) -> io::Result<()> {
    let tmp = db.join(format!("{:06}.dbtmp", number));
    {
        let mut f = File::create(&tmp)?;
        writeln!(f, "{}", manifest_file_name(number))?;
        f.sync_all()?;
    }
    if let Err(e) = fs::rename(&tmp, current_file_path(db)) {
        if let Err(rm) = fs::remove_file(&tmp) {
            tracing::warn!(file = %tmp.display(), error = %rm, "failed to remove temp CURRENT");
        }
        return Err(e);
    }
    sync_dir(db);
    Ok(())
}

/// Reads CURRENT and returns the manifest file name it names.
pub(crate) fn read_current_file(db: &Path) -> io::Result<String> {
    let contents = fs::read_to_string(current_file_path(db))?;
    let name = contents.trim_end_matches('\n');
    if name.is_empty() || name.contains('\n') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "CURRENT file is malformed",
        ));
    }
    Ok(name.to_string())
}

/// Makes renames and creations inside `dir` durable. Best effort.
pub(crate) fn sync_dir(dir: &Path) {
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        tracing::debug!(dir = %dir.display(), error = %e, "directory sync skipped");
    }
}
