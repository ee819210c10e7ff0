//! Recovery on open, obsolete-file deletion and `destroy`.
//!
//! Open replays, in file-number order, every log at or after the log
//! number the manifest recorded. Each log becomes one or more L0 tables;
//! the edit that adds them goes into the fresh manifest the open writes,
//! after which the replayed logs are obsolete.

use std::cmp::max;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use config::Options;
use fs2::FileExt;
use memtable::{InternalKeyComparator, MemTable, SequenceNumber};
use parking_lot::MutexGuard;
use wal::{WalReader, WalWriter};

use crate::batch::WriteBatch;
use crate::compaction::build_table;
use crate::error::{Error, Result};
use crate::filename::{self, FileType};
use crate::manifest::VersionSet;
use crate::version_edit::{FileMetaData, VersionEdit};
use crate::{DbInner, DbState};

/// Everything `Db::open` needs from recovery.
pub(crate) struct Recovered {
    pub(crate) versions: VersionSet,
    pub(crate) log: WalWriter,
    pub(crate) log_number: u64,
}

/// Takes the exclusive lock on `<db>/LOCK`.
pub(crate) fn acquire_lock(db: &Path) -> Result<File> {
    let file = File::options()
        .create(true)
        .truncate(false)
        .write(true)
        .open(filename::lock_file_path(db))?;
    file.try_lock_exclusive().map_err(|e| {
        Error::from(io::Error::new(
            e.kind(),
            format!("{} is in use by another process: {}", db.display(), e),
        ))
    })?;
    Ok(file)
}

/// Drops the advisory lock taken by [`acquire_lock`].
pub(crate) fn release_lock(file: &File, db: &Path) {
    if let Err(e) = FileExt::unlock(file) {
        tracing::warn!(path = %db.display(), error = %e, "failed to release store lock");
    }
}

/// Removes leftover temp files of interrupted table writes and CURRENT
/// replacements.
pub(crate) fn cleanup_tmp_files(db: &Path) {
    for dir in [db.to_path_buf(), filename::sst_dir(db)] {
        let Ok(entries) = fs::read_dir(&dir) else { continue };
        for entry in entries.flatten() {
            let name = entry.file_name();
            if filename::parse_file_name(&name.to_string_lossy()) == Some(FileType::Temp) {
                tracing::debug!(file = %entry.path().display(), "removing temp file");
                if let Err(e) = fs::remove_file(entry.path()) {
                    tracing::warn!(file = %entry.path().display(), error = %e, "failed to remove temp file");
                }
            }
        }
    }
}

/// Numbers of every file of kind `pick` in `dir`.
fn list_numbers(dir: &Path, pick: fn(FileType) -> Option<u64>) -> io::Result<Vec<u64>> {
    let mut numbers = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(n) = filename::parse_file_name(&entry.file_name().to_string_lossy()).and_then(pick)
        {
            numbers.push(n);
        }
    }
    numbers.sort_unstable();
    Ok(numbers)
}

fn as_log(t: FileType) -> Option<u64> {
    match t {
        FileType::Log(n) => Some(n),
        _ => None,
    }
}

/// Loads (or creates) the store at `db` up to the point where a new log
/// and manifest are in place.
pub(crate) fn recover(
    db: &Path,
    options: &Arc<Options>,
    icmp: &InternalKeyComparator,
) -> Result<Recovered> {
    let mut versions = VersionSet::new(db, Arc::clone(options), icmp.clone());

    if filename::current_file_path(db).exists() {
        if options.error_if_exists {
            return Err(Error::InvalidArgument(format!(
                "{} exists (error_if_exists is set)",
                db.display()
            )));
        }
        versions.recover()?;
    } else {
        if !options.create_if_missing {
            return Err(Error::InvalidArgument(format!(
                "{} does not exist (create_if_missing is not set)",
                db.display()
            )));
        }
        tracing::info!(path = %db.display(), "creating new store");
    }

    let min_log = versions.log_number();
    let logs: Vec<u64> = list_numbers(&filename::wal_dir(db), as_log)?
        .into_iter()
        .filter(|&n| n >= min_log)
        .collect();
    // Claim every log number before replay hands out table numbers.
    for &n in &logs {
        versions.mark_file_number_used(n);
    }

    let mut edit = VersionEdit::default();
    let mut max_sequence = versions.last_sequence();
    for &n in &logs {
        replay_log(db, n, options, icmp, &mut versions, &mut edit, &mut max_sequence)?;
    }
    versions.set_last_sequence(max_sequence);

    let log_number = versions.new_file_number();
    let log = WalWriter::create(filename::log_file_path(db, log_number), false)?;
    edit.set_log_number(log_number);
    versions.create_new_manifest(edit)?;

    Ok(Recovered {
        versions,
        log,
        log_number,
    })
}

fn replay_log(
    db: &Path,
    number: u64,
    options: &Options,
    icmp: &InternalKeyComparator,
    versions: &mut VersionSet,
    edit: &mut VersionEdit,
    max_sequence: &mut SequenceNumber,
) -> Result<()> {
    let mut reader = WalReader::open(filename::log_file_path(db, number))?;
    let mut mem = Arc::new(MemTable::new(icmp.clone()));
    let mut failure: Option<Error> = None;
    let mut tables = 0usize;

    let summary = reader.replay(|record| {
        if failure.is_some() {
            return;
        }
        let step = apply_record(record, &mem, &mut *max_sequence).and_then(|()| {
            if mem.approximate_memory_usage() > options.write_buffer_size {
                flush_recovered(db, options, &mut *versions, &mut *edit, &mem)?;
                mem = Arc::new(MemTable::new(icmp.clone()));
                tables += 1;
            }
            Ok(())
        });
        match step {
            Ok(()) => {}
            Err(Error::Corruption(msg)) if !options.paranoid_checks => {
                tracing::warn!(log = number, error = %msg, "skipping damaged log record");
            }
            Err(e) => failure = Some(e),
        }
    })?;
    if let Some(e) = failure {
        return Err(e);
    }

    if !mem.is_empty() {
        flush_recovered(db, options, versions, edit, &mem)?;
        tables += 1;
    }
    tracing::info!(
        log = number,
        records = summary.records,
        dropped_bytes = summary.dropped_bytes,
        tables,
        "replayed log"
    );
    Ok(())
}

fn apply_record(record: &[u8], mem: &MemTable, max_sequence: &mut SequenceNumber) -> Result<()> {
    let batch = WriteBatch::from_contents(record)?;
    batch.insert_into(mem)?;
    if !batch.is_empty() {
        let last = batch.sequence() + u64::from(batch.len()) - 1;
        *max_sequence = max(*max_sequence, last);
    }
    Ok(())
}

fn flush_recovered(
    db: &Path,
    options: &Options,
    versions: &mut VersionSet,
    edit: &mut VersionEdit,
    mem: &Arc<MemTable>,
) -> Result<()> {
    let number = versions.new_file_number();
    if let Some(summary) = build_table(db, number, options, mem.iter())? {
        tracing::info!(
            file = number,
            entries = summary.entries,
            bytes = summary.file_size,
            "recovered table"
        );
        edit.add_file(0, FileMetaData::from(summary));
    }
    Ok(())
}

impl DbInner {
    /// Deletes every file no live version, pending output or current log
    /// still needs. Skipped once a background error is latched, since the
    /// state on disk may then be the only good copy.
    pub(crate) fn delete_obsolete_files(&self, state: &mut MutexGuard<'_, DbState>) {
        if state.bg_error.is_some() {
            return;
        }
        let mut live = state.versions.live_files();
        live.extend(state.pending_outputs.iter().copied());
        let log_number = state.versions.log_number();
        let manifest_number = state.versions.manifest_file_number();

        // Listing happens under the lock so no file created meanwhile can
        // be mistaken for garbage.
        let doomed = obsolete_files(&self.path, &live, log_number, manifest_number);
        if doomed.is_empty() {
            return;
        }
        for (_, kind) in &doomed {
            if let FileType::Table(n) = kind {
                self.table_cache.evict(*n);
            }
        }
        MutexGuard::unlocked(state, || {
            for (path, kind) in &doomed {
                match fs::remove_file(path) {
                    Ok(()) => tracing::info!(file = %path.display(), ?kind, "deleted obsolete file"),
                    Err(e) => {
                        tracing::warn!(file = %path.display(), error = %e, "failed to delete obsolete file")
                    }
                }
            }
        });
    }
}

fn obsolete_files(
    db: &Path,
    live: &HashSet<u64>,
    log_number: u64,
    manifest_number: u64,
) -> Vec<(PathBuf, FileType)> {
    let mut doomed = Vec::new();
    for dir in [db.to_path_buf(), filename::wal_dir(db), filename::sst_dir(db)] {
        let Ok(entries) = fs::read_dir(&dir) else { continue };
        for entry in entries.flatten() {
            let Some(kind) = filename::parse_file_name(&entry.file_name().to_string_lossy())
            else {
                continue;
            };
            let obsolete = match kind {
                FileType::Log(n) => n < log_number,
                FileType::Table(n) => !live.contains(&n),
                FileType::Manifest(n) => n < manifest_number,
                FileType::Current | FileType::Lock | FileType::Temp => false,
            };
            if obsolete {
                doomed.push((entry.path(), kind));
            }
        }
    }
    doomed
}

/// Removes every file of the store at `path`, then the directories if they
/// end up empty.
///
/// # Errors
///
/// Fails if the store is open (its lock is held) or a file cannot be
/// removed. A missing directory is not an error.
pub fn destroy<P: AsRef<Path>>(path: P, _options: &Options) -> Result<()> {
    let db = path.as_ref();
    if !db.exists() {
        return Ok(());
    }
    let lock = acquire_lock(db)?;

    let mut removed = 0usize;
    for dir in [filename::wal_dir(db), filename::sst_dir(db)] {
        let Ok(entries) = fs::read_dir(&dir) else { continue };
        for entry in entries.flatten() {
            if filename::parse_file_name(&entry.file_name().to_string_lossy()).is_some() {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        remove_dir_if_empty(&dir);
    }
    for entry in fs::read_dir(db)?.flatten() {
        match filename::parse_file_name(&entry.file_name().to_string_lossy()) {
            Some(FileType::Lock) | None => {}
            Some(_) => {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
    }

    release_lock(&lock, db);
    drop(lock);
    let lock_path = filename::lock_file_path(db);
    if let Err(e) = fs::remove_file(&lock_path) {
        tracing::debug!(file = %lock_path.display(), error = %e, "lock file not removed");
    }
    remove_dir_if_empty(db);
    tracing::info!(path = %db.display(), files = removed, "destroyed store");
    Ok(())
}

/// Directories holding foreign files are left in place.
fn remove_dir_if_empty(dir: &Path) {
    if let Err(e) = fs::remove_dir(dir) {
        tracing::debug!(dir = %dir.display(), error = %e, "directory not removed");
    }
}
