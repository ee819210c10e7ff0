//! # Engine - ShoalDB Storage Engine
//!
//! Ties the [`memtable`], [`wal`] and [`sstable`] crates together into a
//! crash-consistent LSM-tree key-value store with one writer queue, any
//! number of concurrent readers and a single background worker.
//!
//! ## Architecture
//!
//! ```text
//! Client
//!   |
//!   v
//! ┌──────────────────────────────────────────────────────┐
//! │                       ENGINE                         │
//! │                                                      │
//! │ write.rs → group commit → log append → mutable stage │
//! │              |                                       │
//! │              |  (stage full?)                        │
//! │              v                                       │
//! │           freeze → worker flushes → L0 table         │
//! │              |                                       │
//! │              |  (level over budget?)                 │
//! │              v                                       │
//! │           compaction.rs → merged tables in L+1       │
//! │                                                      │
//! │ read.rs → mutable → frozen → L0 → L1 ... L6          │
//! │            (first visible entry wins)                │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Responsibilities
//!
//! | Module           | Purpose                                              |
//! |------------------|------------------------------------------------------|
//! | `lib.rs`         | `Db` handle, open/close, properties, `Debug`, `Drop`  |
//! | [`batch`]        | `WriteBatch`, the unit of atomic writes               |
//! | `write`          | group commit, stage rotation, `force_flush()`         |
//! | `read`           | `get()`, `iter()`, snapshots                          |
//! | `iterator`       | merging iterator and the user-facing `DbIterator`     |
//! | `compaction`     | background worker, flush, merge, trivial moves        |
//! | `version`        | immutable per-level file lists                        |
//! | `manifest`       | `VersionSet`, manifest log, compaction picking        |
//! | `recovery`       | open-time replay, obsolete files, `destroy()`         |
//! | `table_cache`    | shared LRU of open table readers                      |
//!
//! ## Crash Safety
//!
//! Every write group is appended to the log **before** it is applied to the
//! mutable stage. A log is deleted only after the manifest records a table
//! holding its contents. Tables and CURRENT are written to temp files and
//! renamed into place, and a table is deleted only once no version that
//! any reader can still hold references it.
//!
//! ```rust,no_run
//! use engine::{Db, Options, ReadOptions, WriteOptions};
//!
//! # fn main() -> engine::Result<()> {
//! let mut opts = Options::default();
//! opts.create_if_missing = true;
//! let db = Db::open(opts, "/tmp/shoal-demo")?;
//! db.put(&WriteOptions::default(), b"k", b"v")?;
//! assert_eq!(db.get(&ReadOptions::default(), b"k")?, Some(b"v".to_vec()));
//! db.close()
//! # }
//! ```

pub mod batch;
mod compaction;
mod error;
mod filename;
mod iterator;
mod manifest;
mod read;
mod recovery;
mod snapshot;
mod table_cache;
mod version;
mod version_edit;
mod write;

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use memtable::{InternalKeyComparator, MemTable, SequenceNumber};
use parking_lot::{Condvar, Mutex};
use wal::WalWriter;

pub use batch::{BatchOp, WriteBatch};
pub use config::{BytewiseComparator, Comparator, Options, WriteOptions};
pub use error::{Error, Result};
pub use iterator::DbIterator;
pub use recovery::destroy;
pub use snapshot::Snapshot;

use compaction::{CompactionStats, ManualCompaction};
use manifest::VersionSet;
use recovery::Recovered;
use snapshot::SnapshotList;
use table_cache::TableCache;
use write::PendingWrite;

/// Per-read settings, bound to this crate's [`Snapshot`].
pub type ReadOptions<'a> = config::ReadOptions<'a, Snapshot>;

/// Maximum allowed key size in bytes (64 KiB).
pub const MAX_KEY_SIZE: usize = 64 * 1024;
/// Maximum allowed value size in bytes (10 MiB).
pub const MAX_VALUE_SIZE: usize = 10 * 1024 * 1024;

/// Everything guarded by the state lock.
pub(crate) struct DbState {
    pub(crate) mem: Arc<MemTable>,
    /// Frozen stage waiting to be flushed.
    pub(crate) imm: Option<Arc<MemTable>>,
    /// `None` only while a leader appends with the lock released.
    pub(crate) log: Option<WalWriter>,
    pub(crate) log_number: u64,
    pub(crate) versions: VersionSet,
    /// First background failure. Once set, writes fail with it.
    pub(crate) bg_error: Option<Error>,
    pub(crate) shutting_down: bool,
    pub(crate) bg_busy: bool,

    pub(crate) writers: VecDeque<PendingWrite>,
    pub(crate) next_writer_id: u64,
    /// Status for followers a leader committed.
    pub(crate) completed: HashMap<u64, Result<()>>,

    pub(crate) manual: VecDeque<ManualCompaction>,
    pub(crate) next_manual_id: u64,
    pub(crate) manual_results: HashMap<u64, Result<()>>,

    /// Tables being written that no version lists yet.
    pub(crate) pending_outputs: HashSet<u64>,
    pub(crate) stats: Vec<CompactionStats>,
}

pub(crate) struct DbInner {
    pub(crate) path: PathBuf,
    pub(crate) options: Arc<Options>,
    pub(crate) icmp: InternalKeyComparator,
    pub(crate) table_cache: Arc<TableCache>,
    pub(crate) snapshots: Arc<SnapshotList>,
    pub(crate) state: Mutex<DbState>,
    /// Wakes the worker.
    pub(crate) bg_cv: Condvar,
    /// Signalled whenever background work finishes a step.
    pub(crate) done_cv: Condvar,
    /// Signalled whenever the writer queue advances.
    pub(crate) writers_cv: Condvar,
    /// Mirrors `state.imm.is_some()` so a running merge can poll it.
    pub(crate) has_imm: AtomicBool,
    pub(crate) shutting_down: AtomicBool,
    lock_file: File,
}

impl Drop for DbInner {
    fn drop(&mut self) {
        recovery::release_lock(&self.lock_file, &self.path);
    }
}

/// Handle to an open store.
///
/// `Db` is `Send + Sync`; share it between threads with an `Arc`. Reads
/// never block on writes, and writes from many threads are committed in
/// groups.
///
/// # Write Path
///
/// 1. Queue the batch; the front writer leads a group.
/// 2. Make room: rotate a full stage, or wait if the worker is behind.
/// 3. Append the group to the log as one record, then apply it.
/// 4. Publish the group's last sequence number.
///
/// # Read Path
///
/// 1. Mutable stage, then the frozen stage.
/// 2. L0 tables newest first, then one table per deeper level.
/// 3. First entry at or below the read sequence wins; tombstones hide.
///
/// # Recovery
///
/// [`Db::open`] rebuilds the table layout from the manifest and replays
/// newer logs into L0 tables before accepting writes.
pub struct Db {
    inner: Arc<DbInner>,
    worker: Option<JoinHandle<()>>,
}

impl Db {
    /// Opens the store at `path`.
    ///
    /// # Errors
    ///
    /// * `InvalidArgument` for bad options, a missing store without
    ///   `create_if_missing`, an existing one with `error_if_exists`, or a
    ///   comparator that differs from the one the store was created with.
    /// * `Io` if another handle holds the store's lock.
    /// * `Corruption` if the manifest or a log is damaged beyond a torn tail.
    pub fn open<P: AsRef<Path>>(options: Options, path: P) -> Result<Db> {
        options.validate().map_err(Error::InvalidArgument)?;
        let path = path.as_ref().to_path_buf();
        if !options.create_if_missing && !filename::current_file_path(&path).exists() {
            return Err(Error::InvalidArgument(format!(
                "{} does not exist (create_if_missing is not set)",
                path.display()
            )));
        }

        fs::create_dir_all(filename::wal_dir(&path))?;
        fs::create_dir_all(filename::sst_dir(&path))?;
        let lock_file = recovery::acquire_lock(&path)?;
        recovery::cleanup_tmp_files(&path);

        let options = Arc::new(options);
        let icmp = InternalKeyComparator::new(Arc::clone(&options.comparator));
        let Recovered {
            versions,
            log,
            log_number,
        } = recovery::recover(&path, &options, &icmp)?;

        let num_levels = options.num_levels;
        let inner = Arc::new(DbInner {
            table_cache: Arc::new(TableCache::new(&path, &options, icmp.clone())),
            snapshots: Arc::new(SnapshotList::default()),
            state: Mutex::new(DbState {
                mem: Arc::new(MemTable::new(icmp.clone())),
                imm: None,
                log: Some(log),
                log_number,
                versions,
                bg_error: None,
                shutting_down: false,
                bg_busy: false,
                writers: VecDeque::new(),
                next_writer_id: 0,
                completed: HashMap::new(),
                manual: VecDeque::new(),
                next_manual_id: 0,
                manual_results: HashMap::new(),
                pending_outputs: HashSet::new(),
                stats: vec![CompactionStats::default(); num_levels],
            }),
            bg_cv: Condvar::new(),
            done_cv: Condvar::new(),
            writers_cv: Condvar::new(),
            has_imm: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            path,
            options,
            icmp,
            lock_file,
        });

        {
            let mut state = inner.state.lock();
            inner.delete_obsolete_files(&mut state);
            tracing::info!(
                path = %inner.path.display(),
                last_sequence = state.versions.last_sequence(),
                log = log_number,
                files = %state.versions.level_summary(),
                "opened store"
            );
        }

        let worker = thread::Builder::new().name("shoal-bg".into()).spawn({
            let inner = Arc::clone(&inner);
            move || inner.background_loop()
        })?;

        Ok(Db {
            inner,
            worker: Some(worker),
        })
    }

    /// Flushes the mutable stage, lets in-flight background work finish and
    /// stops the worker. The lock is released when the handle is gone.
    ///
    /// # Errors
    ///
    /// The flush error or the latched background error. The store is shut
    /// down either way.
    pub fn close(mut self) -> Result<()> {
        let flushed = self.inner.force_flush();
        {
            let mut state = self.inner.state.lock();
            while state.bg_busy {
                self.inner.done_cv.wait(&mut state);
            }
        }
        self.shutdown();
        tracing::info!(path = %self.inner.path.display(), "closed store");
        flushed
    }

    fn shutdown(&mut self) {
        {
            let mut state = self.inner.state.lock();
            state.shutting_down = true;
        }
        self.inner.shutting_down.store(true, AtomicOrdering::Release);
        self.inner.bg_cv.notify_all();
        self.inner.done_cv.notify_all();
        self.inner.writers_cv.notify_all();
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                tracing::error!("background worker panicked");
            }
        }
    }

    /// Compacts every table overlapping the user-key range `[begin, end]`
    /// (`None` is unbounded) down to the deepest level holding any of it.
    /// Flushes the mutable stage first.
    pub fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        self.force_flush()?;
        let max_level_with_files = {
            let state = self.inner.state.lock();
            let current = state.versions.current();
            (1..current.num_levels())
                .filter(|&level| current.overlap_in_level(level, begin, end))
                .max()
                .unwrap_or(1)
        };
        for level in 0..max_level_with_files {
            self.inner.run_manual_compaction(level, begin, end)?;
        }
        Ok(())
    }

    /// Reports internal state. Known names:
    ///
    /// * `shoal.num-files-at-level<N>`
    /// * `shoal.stats`: per-level file counts, sizes and compaction I/O
    /// * `shoal.sstables`: every table of every level
    /// * `shoal.approximate-memory-usage`: bytes held by the stages
    pub fn property(&self, name: &str) -> Option<String> {
        let rest = name.strip_prefix("shoal.")?;
        let state = self.inner.state.lock();
        let current = state.versions.current();

        if let Some(level) = rest.strip_prefix("num-files-at-level") {
            let level: usize = level.parse().ok()?;
            if level >= current.num_levels() {
                return None;
            }
            return Some(current.num_files(level).to_string());
        }

        match rest {
            "stats" => {
                let mut out = String::from(
                    "                               Compactions\n\
                     Level  Files Size(MB) Time(sec) Read(MB) Write(MB)\n\
                     --------------------------------------------------\n",
                );
                const MB: f64 = 1_048_576.0;
                for (level, stats) in state.stats.iter().enumerate() {
                    let files = current.num_files(level);
                    if files == 0 && stats.micros == 0 {
                        continue;
                    }
                    out.push_str(&format!(
                        "{:>3} {:>8} {:>8.0} {:>9.0} {:>8.0} {:>9.0}\n",
                        level,
                        files,
                        current.level_bytes(level) as f64 / MB,
                        stats.micros as f64 / 1e6,
                        stats.bytes_read as f64 / MB,
                        stats.bytes_written as f64 / MB,
                    ));
                }
                Some(out)
            }
            "sstables" => Some(current.debug_string()),
            "approximate-memory-usage" => {
                let mut total = state.mem.approximate_memory_usage();
                if let Some(imm) = &state.imm {
                    total += imm.approximate_memory_usage();
                }
                Some(total.to_string())
            }
            _ => None,
        }
    }

    pub fn num_files_at_level(&self, level: usize) -> usize {
        self.inner.state.lock().versions.current().num_files(level)
    }

    /// Sequence number of the most recent committed write.
    pub fn last_sequence(&self) -> SequenceNumber {
        self.inner.state.lock().versions.last_sequence()
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }
}

impl DbInner {
    /// Queues a range compaction of one level and waits for it.
    fn run_manual_compaction(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let id = state.next_manual_id;
        state.next_manual_id += 1;
        state.manual.push_back(ManualCompaction {
            id,
            level,
            begin: begin.map(<[u8]>::to_vec),
            end: end.map(<[u8]>::to_vec),
        });
        self.bg_cv.notify_one();

        loop {
            if let Some(result) = state.manual_results.remove(&id) {
                return result;
            }
            if let Some(e) = &state.bg_error {
                return Err(e.clone());
            }
            if state.shutting_down {
                return Err(Error::Closed);
            }
            self.done_cv.wait(&mut state);
        }
    }
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Db")
            .field("path", &self.inner.path)
            .field("last_sequence", &state.versions.last_sequence())
            .field("log_number", &state.log_number)
            .field("memtable_bytes", &state.mem.approximate_memory_usage())
            .field("frozen_stage", &state.imm.is_some())
            .field("files", &state.versions.level_summary())
            .field("open_tables", &self.inner.table_cache.len())
            .field("snapshots", &self.inner.snapshots.len())
            .field("bg_error", &state.bg_error)
            .finish()
    }
}

/// Stops the worker without flushing. Unflushed writes stay in the log and
/// are replayed by the next open.
impl Drop for Db {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests;
