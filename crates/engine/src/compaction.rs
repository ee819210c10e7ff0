//! Background flush and compaction.
//!
//! A single worker thread owns all background work. Each round it does, in
//! priority order:
//!
//! 1. flush the frozen stage into a table (usually L0);
//! 2. the oldest queued manual range compaction;
//! 3. the compaction the current version scores highest.
//!
//! A merge streams every input through a [`MergingIterator`], dropping
//! entries no snapshot can see, and cuts outputs at user-key boundaries.
//! The resulting edit reaches the manifest before any input is deleted.
//! Any failure is latched as the background error: writes start failing
//! with it and the worker stops scheduling work.

use std::cmp::Ordering;
use std::path::Path;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use std::time::Instant;

use config::Options;
use memtable::{parse_internal_key, MemTable, MemTableIterator, ValueKind, MAX_SEQUENCE_NUMBER};
use parking_lot::MutexGuard;
use sstable::{SSTableWriter, TableSummary};

use crate::error::{Error, Result};
use crate::filename;
use crate::iterator::{LevelIter, MergingIterator, SourceIter};
use crate::version::{max_grandparent_overlap_bytes, total_file_size, Version};
use crate::version_edit::{FileMetaData, VersionEdit};
use crate::{DbInner, DbState};

/// Per-level counters reported by the `shoal.stats` property.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CompactionStats {
    pub(crate) micros: u64,
    pub(crate) bytes_read: u64,
    pub(crate) bytes_written: u64,
}

impl CompactionStats {
    fn add(&mut self, other: &CompactionStats) {
        self.micros += other.micros;
        self.bytes_read += other.bytes_read;
        self.bytes_written += other.bytes_written;
    }
}

/// A queued `compact_range` request for one level.
#[derive(Debug)]
pub(crate) struct ManualCompaction {
    pub(crate) id: u64,
    pub(crate) level: usize,
    pub(crate) begin: Option<Vec<u8>>,
    pub(crate) end: Option<Vec<u8>>,
}

/// One merge of `inputs[0]` (at `level`) with `inputs[1]` (at `level + 1`).
pub(crate) struct Compaction {
    pub(crate) level: usize,
    pub(crate) inputs: [Vec<Arc<FileMetaData>>; 2],
    /// Files of `level + 2` overlapping the inputs.
    pub(crate) grandparents: Vec<Arc<FileMetaData>>,
    pub(crate) input_version: Arc<Version>,
    pub(crate) edit: VersionEdit,
    max_output_file_size: u64,
    max_grandparent_overlap: u64,
    grandparent_index: usize,
    seen_key: bool,
    overlapped_bytes: u64,
    /// Per level, where `is_base_level_for_key` left off.
    level_ptrs: Vec<usize>,
}

impl Compaction {
    pub(crate) fn new(level: usize, input_version: Arc<Version>, options: &Options) -> Self {
        let num_levels = input_version.num_levels();
        Self {
            level,
            inputs: [Vec::new(), Vec::new()],
            grandparents: Vec::new(),
            input_version,
            edit: VersionEdit::default(),
            max_output_file_size: options.max_file_size as u64,
            max_grandparent_overlap: max_grandparent_overlap_bytes(options),
            grandparent_index: 0,
            seen_key: false,
            overlapped_bytes: 0,
            level_ptrs: vec![0; num_levels],
        }
    }

    pub(crate) fn num_input_files(&self, which: usize) -> usize {
        self.inputs[which].len()
    }

    /// A single file with nothing beneath it can be re-parented without
    /// rewriting it.
    pub(crate) fn is_trivial_move(&self) -> bool {
        self.num_input_files(0) == 1
            && self.num_input_files(1) == 0
            && total_file_size(&self.grandparents) <= self.max_grandparent_overlap
    }

    pub(crate) fn add_input_deletions(&mut self) {
        for which in 0..2 {
            for f in &self.inputs[which] {
                self.edit.delete_file(self.level + which, f.number);
            }
        }
    }

    /// True when no level below the output can hold `user_key`, so a
    /// tombstone for it has nothing left to shadow. Keys must be passed in
    /// ascending order.
    pub(crate) fn is_base_level_for_key(&mut self, user_key: &[u8]) -> bool {
        let icmp = self.input_version.comparator();
        for level in (self.level + 2)..self.input_version.num_levels() {
            let files = self.input_version.files(level);
            while self.level_ptrs[level] < files.len() {
                let f = &files[self.level_ptrs[level]];
                if icmp.compare_user(user_key, f.largest.user_key()) != Ordering::Greater {
                    if icmp.compare_user(user_key, f.smallest.user_key()) != Ordering::Less {
                        return false;
                    }
                    break;
                }
                self.level_ptrs[level] += 1;
            }
        }
        true
    }

    /// Whether the output being built should end before `ikey` to bound
    /// how much of `level + 2` a later merge of it would pull in.
    pub(crate) fn should_stop_before(&mut self, ikey: &[u8]) -> bool {
        let icmp = self.input_version.comparator();
        while self.grandparent_index < self.grandparents.len()
            && icmp.compare(ikey, self.grandparents[self.grandparent_index].largest.encoded())
                == Ordering::Greater
        {
            if self.seen_key {
                self.overlapped_bytes += self.grandparents[self.grandparent_index].file_size;
            }
            self.grandparent_index += 1;
        }
        self.seen_key = true;
        if self.overlapped_bytes > self.max_grandparent_overlap {
            self.overlapped_bytes = 0;
            true
        } else {
            false
        }
    }

    fn input_bytes(&self) -> u64 {
        total_file_size(&self.inputs[0]) + total_file_size(&self.inputs[1])
    }
}

/// Writes every entry of `iter` to table `number`. Returns `None` and
/// leaves no file behind when the stage is empty.
pub(crate) fn build_table(
    db_path: &Path,
    number: u64,
    options: &Options,
    mut iter: MemTableIterator,
) -> Result<Option<TableSummary>> {
    iter.seek_to_first();
    if !iter.valid() {
        return Ok(None);
    }
    let path = filename::table_file_path(db_path, number);
    let mut writer = SSTableWriter::create(&path, number, options)?;
    while iter.valid() {
        if let Err(e) = writer.add(iter.key(), iter.value()) {
            writer.abandon();
            return Err(e.into());
        }
        iter.next();
    }
    Ok(Some(writer.finish()?))
}

/// An output table being filled by a merge.
struct Output {
    number: u64,
    writer: SSTableWriter,
}

impl DbInner {
    /// Body of the background thread.
    pub(crate) fn background_loop(self: Arc<Self>) {
        let mut state = self.state.lock();
        loop {
            while !state.shutting_down && !self.has_background_work(&state) {
                self.bg_cv.wait(&mut state);
            }
            if state.shutting_down {
                break;
            }

            state.bg_busy = true;
            let result = self.background_compaction(&mut state);
            state.bg_busy = false;
            if let Err(e) = result {
                if !matches!(e, Error::Closed) {
                    self.record_background_error(&mut state, e);
                }
            }
            self.done_cv.notify_all();
        }
        state.bg_busy = false;
        self.done_cv.notify_all();
        tracing::debug!("background worker stopped");
    }

    fn has_background_work(&self, state: &DbState) -> bool {
        state.bg_error.is_none()
            && (state.imm.is_some()
                || !state.manual.is_empty()
                || state.versions.needs_compaction())
    }

    /// Latches `e`; writes fail with it from now on.
    pub(crate) fn record_background_error(&self, state: &mut DbState, e: Error) {
        if state.bg_error.is_none() {
            tracing::error!(error = %e, "background error, the store is now read-only");
            state.bg_error = Some(e);
            self.writers_cv.notify_all();
            self.done_cv.notify_all();
        }
    }

    fn background_compaction(&self, state: &mut MutexGuard<'_, DbState>) -> Result<()> {
        if state.imm.is_some() {
            self.compact_memtable(state)?;
        } else if let Some(manual) = state.manual.pop_front() {
            let id = manual.id;
            let result = self.run_manual(state, manual);
            if result.is_ok() {
                self.delete_obsolete_files(state);
            }
            state.manual_results.insert(id, result.clone());
            return result;
        } else if let Some(c) = state.versions.pick_compaction() {
            self.run_compaction(state, c)?;
        } else {
            return Ok(());
        }
        // The finished job's input version is gone by now, so its inputs
        // are no longer reported live.
        self.delete_obsolete_files(state);
        Ok(())
    }

    fn run_manual(
        &self,
        state: &mut MutexGuard<'_, DbState>,
        manual: ManualCompaction,
    ) -> Result<()> {
        let picked = state.versions.compact_range(
            manual.level,
            manual.begin.as_deref(),
            manual.end.as_deref(),
        );
        match picked {
            Some(c) => self.run_compaction(state, c),
            None => Ok(()),
        }
    }

    fn run_compaction(&self, state: &mut MutexGuard<'_, DbState>, mut c: Compaction) -> Result<()> {
        if c.is_trivial_move() {
            let f = Arc::clone(&c.inputs[0][0]);
            c.edit.delete_file(c.level, f.number);
            c.edit.add_file(c.level + 1, (*f).clone());
            self.log_and_apply(state, c.edit)?;
            tracing::info!(
                file = f.number,
                from = c.level,
                to = c.level + 1,
                bytes = f.file_size,
                "moved table"
            );
        } else {
            let result = self.do_compaction_work(state, &mut c);
            if let Err(e) = result {
                if state.shutting_down {
                    return Err(Error::Closed);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    // -------------------- flush --------------------

    /// Flushes the frozen stage and drops the logs it covered.
    pub(crate) fn compact_memtable(&self, state: &mut MutexGuard<'_, DbState>) -> Result<()> {
        let Some(imm) = state.imm.clone() else {
            return Ok(());
        };
        let base = state.versions.current();
        let mut edit = VersionEdit::default();
        let start = Instant::now();
        let level = self.write_level0_table(state, &imm, &mut edit, Some(&base))?;

        if state.shutting_down {
            return Err(Error::Closed);
        }
        // Logs older than the live one now live on in tables.
        edit.set_log_number(state.log_number);
        self.log_and_apply(state, edit)?;

        state.imm = None;
        self.has_imm.store(false, AtomicOrdering::Release);
        if let Some((level, bytes)) = level {
            state.stats[level].add(&CompactionStats {
                micros: start.elapsed().as_micros() as u64,
                bytes_read: 0,
                bytes_written: bytes,
            });
        }
        self.done_cv.notify_all();
        Ok(())
    }

    /// Writes `mem` to a new table with the state lock released and adds
    /// it to `edit`. Returns the level and size of the table, if any.
    pub(crate) fn write_level0_table(
        &self,
        state: &mut MutexGuard<'_, DbState>,
        mem: &Arc<MemTable>,
        edit: &mut VersionEdit,
        base: Option<&Arc<Version>>,
    ) -> Result<Option<(usize, u64)>> {
        let number = state.versions.new_file_number();
        state.pending_outputs.insert(number);
        let iter = mem.iter();
        let result = MutexGuard::unlocked(state, || {
            build_table(&self.path, number, &self.options, iter)
        });
        state.pending_outputs.remove(&number);

        let Some(summary) = result? else {
            return Ok(None);
        };
        let level = base.map_or(0, |v| {
            v.pick_level_for_memtable_output(
                summary.smallest.user_key(),
                summary.largest.user_key(),
                &self.options,
            )
        });
        tracing::info!(
            file = number,
            level,
            entries = summary.entries,
            bytes = summary.file_size,
            "flushed memtable"
        );
        let bytes = summary.file_size;
        edit.add_file(level, FileMetaData::from(summary));
        Ok(Some((level, bytes)))
    }

    // -------------------- merge --------------------

    fn make_input_iterator(&self, c: &Compaction) -> Result<MergingIterator> {
        let mut children = Vec::new();
        for which in 0..2 {
            if c.inputs[which].is_empty() {
                continue;
            }
            if c.level + which == 0 {
                for f in &c.inputs[which] {
                    let it = self.table_cache.iter(f.number, f.file_size, true, false)?;
                    children.push(SourceIter::Table(it));
                }
            } else {
                children.push(SourceIter::Level(LevelIter::new(
                    c.inputs[which].clone(),
                    Arc::clone(&self.table_cache),
                    true,
                    false,
                )));
            }
        }
        Ok(MergingIterator::new(children, self.icmp.clone()))
    }

    fn do_compaction_work(
        &self,
        state: &mut MutexGuard<'_, DbState>,
        c: &mut Compaction,
    ) -> Result<()> {
        let start = Instant::now();
        let smallest_snapshot = self
            .snapshots
            .oldest()
            .unwrap_or_else(|| state.versions.last_sequence());
        tracing::info!(
            level = c.level,
            inputs = c.num_input_files(0),
            next_level_inputs = c.num_input_files(1),
            smallest_snapshot,
            "compacting"
        );

        let mut outputs: Vec<FileMetaData> = Vec::new();
        let result = MutexGuard::unlocked(state, || {
            self.merge_inputs(c, smallest_snapshot, &mut outputs)
        });

        for f in &outputs {
            state.pending_outputs.remove(&f.number);
        }
        result?;

        let mut stats = CompactionStats {
            micros: start.elapsed().as_micros() as u64,
            bytes_read: c.input_bytes(),
            bytes_written: 0,
        };
        c.add_input_deletions();
        for f in &outputs {
            stats.bytes_written += f.file_size;
            c.edit.add_file(c.level + 1, f.clone());
        }
        self.log_and_apply(state, std::mem::take(&mut c.edit))?;
        state.stats[c.level + 1].add(&stats);
        tracing::info!(
            level = c.level + 1,
            outputs = outputs.len(),
            bytes_read = stats.bytes_read,
            bytes_written = stats.bytes_written,
            summary = %state.versions.level_summary(),
            "compacted"
        );
        Ok(())
    }

    /// Runs with the state lock released. Every finished output is pushed
    /// to `outputs` even on failure so the caller can un-pin it.
    fn merge_inputs(
        &self,
        c: &mut Compaction,
        smallest_snapshot: u64,
        outputs: &mut Vec<FileMetaData>,
    ) -> Result<()> {
        let mut input = self.make_input_iterator(c)?;
        input.seek_to_first();

        let ucmp = Arc::clone(self.icmp.user_comparator());
        let mut current: Option<Output> = None;
        let mut current_user_key: Option<Vec<u8>> = None;
        let mut last_sequence_for_key = MAX_SEQUENCE_NUMBER;

        let result = (|| -> Result<()> {
            while input.valid() {
                if self.shutting_down.load(AtomicOrdering::Acquire) {
                    return Err(Error::Closed);
                }
                if self.has_imm.load(AtomicOrdering::Acquire) {
                    let mut state = self.state.lock();
                    self.compact_memtable(&mut state)?;
                }

                let key = input.key();
                let parsed = parse_internal_key(key).ok_or_else(|| {
                    Error::Corruption("malformed internal key in compaction input".into())
                })?;

                let new_user_key = current_user_key
                    .as_deref()
                    .map_or(true, |k| ucmp.compare(parsed.user_key, k) != Ordering::Equal);
                let stop = c.should_stop_before(key);
                if new_user_key {
                    if let Some(out) = current.as_ref() {
                        if stop || out.writer.estimated_size() >= c.max_output_file_size {
                            if let Some(out) = current.take() {
                                outputs.push(self.finish_output(out)?);
                            }
                        }
                    }
                    current_user_key = Some(parsed.user_key.to_vec());
                    last_sequence_for_key = MAX_SEQUENCE_NUMBER;
                }

                let drop = if last_sequence_for_key <= smallest_snapshot {
                    // A newer entry for this key is already visible to
                    // every snapshot.
                    true
                } else {
                    parsed.kind == ValueKind::Deletion
                        && parsed.sequence <= smallest_snapshot
                        && c.is_base_level_for_key(parsed.user_key)
                };
                last_sequence_for_key = parsed.sequence;

                if !drop {
                    if current.is_none() {
                        current = Some(self.open_output()?);
                    }
                    if let Some(out) = current.as_mut() {
                        out.writer.add(key, input.value())?;
                    }
                }
                input.next();
            }
            input.status()?;
            if let Some(out) = current.take() {
                outputs.push(self.finish_output(out)?);
            }
            Ok(())
        })();

        if let Some(out) = current.take() {
            self.state.lock().pending_outputs.remove(&out.number);
            out.writer.abandon();
        }
        result
    }

    fn open_output(&self) -> Result<Output> {
        let number = {
            let mut state = self.state.lock();
            let n = state.versions.new_file_number();
            state.pending_outputs.insert(n);
            n
        };
        let path = filename::table_file_path(&self.path, number);
        match SSTableWriter::create(&path, number, &self.options) {
            Ok(writer) => Ok(Output { number, writer }),
            Err(e) => {
                self.state.lock().pending_outputs.remove(&number);
                Err(e.into())
            }
        }
    }

    fn finish_output(&self, out: Output) -> Result<FileMetaData> {
        let number = out.number;
        let summary = match out.writer.finish() {
            Ok(s) => s,
            Err(e) => {
                self.state.lock().pending_outputs.remove(&number);
                return Err(e.into());
            }
        };
        // Make sure the new table is readable before it is installed.
        self.table_cache.get_table(number, summary.file_size, true)?;
        tracing::debug!(
            file = number,
            entries = summary.entries,
            bytes = summary.file_size,
            "compaction output"
        );
        Ok(FileMetaData::from(summary))
    }
}
