//! The version set and its durable log, the manifest.
//!
//! The manifest is a log of [`VersionEdit`] records in WAL framing,
//! starting with a full snapshot of the state. `CURRENT` names the live
//! manifest and is replaced atomically. Each open writes a fresh manifest,
//! so a store that is reopened repeatedly does not grow its history.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use config::Options;
use memtable::{InternalKey, InternalKeyComparator, SequenceNumber};
use parking_lot::MutexGuard;
use wal::{WalReader, WalWriter};

use crate::compaction::Compaction;
use crate::error::{Error, Result};
use crate::filename;
use crate::version::Version;
use crate::version_edit::{FileMetaData, VersionEdit};
use crate::{DbInner, DbState};

/// Extra bytes an L0 input set may grow to when widening a compaction.
const EXPANDED_COMPACTION_FACTOR: u64 = 25;

pub(crate) struct VersionSet {
    db_path: PathBuf,
    options: Arc<Options>,
    icmp: InternalKeyComparator,
    current: Arc<Version>,
    /// Every version handed out; a file stays on disk while one of them
    /// still lists it.
    live: Vec<Weak<Version>>,
    next_file_number: u64,
    manifest_file_number: u64,
    last_sequence: SequenceNumber,
    log_number: u64,
    /// Per level, the largest key compacted last; the next pick starts
    /// after it.
    compact_pointers: Vec<Option<InternalKey>>,
    /// `None` while an append is in flight with the lock released.
    manifest_log: Option<WalWriter>,
}

impl VersionSet {
    pub(crate) fn new(db_path: &Path, options: Arc<Options>, icmp: InternalKeyComparator) -> Self {
        let num_levels = options.num_levels;
        let current = Arc::new(Version::new(num_levels, icmp.clone()));
        Self {
            db_path: db_path.to_path_buf(),
            options,
            icmp,
            live: vec![Arc::downgrade(&current)],
            current,
            next_file_number: 2,
            manifest_file_number: 0,
            last_sequence: 0,
            log_number: 0,
            compact_pointers: vec![None; num_levels],
            manifest_log: None,
        }
    }

    pub(crate) fn current(&self) -> Arc<Version> {
        Arc::clone(&self.current)
    }

    pub(crate) fn new_file_number(&mut self) -> u64 {
        let n = self.next_file_number;
        self.next_file_number += 1;
        n
    }

    /// Returns `number` to the pool if it was the last one handed out.
    pub(crate) fn reuse_file_number(&mut self, number: u64) {
        if self.next_file_number == number + 1 {
            self.next_file_number = number;
        }
    }

    pub(crate) fn mark_file_number_used(&mut self, number: u64) {
        if self.next_file_number <= number {
            self.next_file_number = number + 1;
        }
    }

    pub(crate) fn last_sequence(&self) -> SequenceNumber {
        self.last_sequence
    }

    pub(crate) fn set_last_sequence(&mut self, seq: SequenceNumber) {
        debug_assert!(seq >= self.last_sequence);
        self.last_sequence = seq;
    }

    pub(crate) fn log_number(&self) -> u64 {
        self.log_number
    }

    pub(crate) fn manifest_file_number(&self) -> u64 {
        self.manifest_file_number
    }

    pub(crate) fn needs_compaction(&self) -> bool {
        self.current.compaction_score() >= 1.0
    }

    pub(crate) fn level_summary(&self) -> String {
        self.current.level_summary()
    }

    /// Rebuilds the state recorded by the manifest that CURRENT names.
    pub(crate) fn recover(&mut self) -> Result<()> {
        let name = filename::read_current_file(&self.db_path)?;
        let path = self.db_path.join(&name);
        let manifest_number = name
            .strip_prefix("MANIFEST-")
            .and_then(|n| n.parse::<u64>().ok())
            .ok_or_else(|| Error::Corruption(format!("CURRENT names {:?}", name)))?;

        let mut reader = WalReader::open(&path).map_err(|e| match e {
            wal::WalError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
                Error::Corruption(format!("CURRENT points to missing {}", name))
            }
            other => other.into(),
        })?;

        let mut version = Version::new(self.options.num_levels, self.icmp.clone());
        let mut log_number = None;
        let mut next_file = None;
        let mut last_sequence = None;
        let mut failure: Option<Error> = None;
        let mut edits = 0u64;

        let summary = reader.replay(|record| {
            if failure.is_some() {
                return;
            }
            let step = VersionEdit::decode(record).and_then(|edit| {
                if let Some(cmp) = &edit.comparator {
                    let ours = self.icmp.user_comparator().name();
                    if cmp != ours {
                        return Err(Error::InvalidArgument(format!(
                            "store was created with comparator {}, not {}",
                            cmp, ours
                        )));
                    }
                }
                version = version.apply(&edit, &self.options)?;
                for (level, key) in &edit.compact_pointers {
                    if let Some(slot) = self.compact_pointers.get_mut(*level) {
                        *slot = Some(key.clone());
                    }
                }
                log_number = edit.log_number.or(log_number);
                next_file = edit.next_file_number.or(next_file);
                last_sequence = edit.last_sequence.or(last_sequence);
                Ok(())
            });
            match step {
                Ok(()) => edits += 1,
                Err(e) => failure = Some(e),
            }
        })?;
        if let Some(e) = failure {
            return Err(e);
        }

        let next_file = next_file.ok_or_else(|| missing("next file number"))?;
        let log_number = log_number.ok_or_else(|| missing("log number"))?;
        let last_sequence = last_sequence.ok_or_else(|| missing("last sequence"))?;

        self.next_file_number = next_file;
        self.mark_file_number_used(manifest_number);
        self.mark_file_number_used(log_number);
        self.manifest_file_number = manifest_number;
        self.log_number = log_number;
        self.last_sequence = last_sequence;
        self.install(version);

        tracing::info!(
            manifest = %name,
            edits,
            dropped_bytes = summary.dropped_bytes,
            log_number,
            last_sequence,
            files = %self.level_summary(),
            "recovered manifest"
        );
        Ok(())
    }

    /// Applies `edit`, then starts a new manifest holding a snapshot of the
    /// result and points CURRENT at it. Used once per open.
    pub(crate) fn create_new_manifest(&mut self, mut edit: VersionEdit) -> Result<()> {
        let version = self.prepare(&mut edit)?;
        self.apply_compact_pointers(&edit);
        self.install(version);
        if let Some(n) = edit.log_number {
            self.log_number = n;
        }

        let number = self.new_file_number();
        let path = self.db_path.join(filename::manifest_file_name(number));
        let mut log = WalWriter::create(&path, false)?;
        let result = log
            .append(&self.snapshot_edit().encode())
            .and_then(|_| log.sync())
            .map_err(Error::from)
            .and_then(|()| filename::set_current_file(&self.db_path, number).map_err(Error::from));
        if let Err(e) = result {
            drop(log);
            if let Err(rm) = std::fs::remove_file(&path) {
                tracing::warn!(file = %path.display(), error = %rm, "failed to remove unused manifest");
            }
            return Err(e);
        }
        self.manifest_file_number = number;
        self.manifest_log = Some(log);
        tracing::debug!(manifest = number, "wrote new manifest");
        Ok(())
    }

    /// Fills in the bookkeeping fields of `edit` and builds the version it
    /// produces. Nothing is installed.
    pub(crate) fn prepare(&self, edit: &mut VersionEdit) -> Result<Version> {
        match edit.log_number {
            Some(n) if n < self.log_number || n >= self.next_file_number => {
                return Err(Error::Corruption(format!(
                    "log number {} out of range {}..{}",
                    n, self.log_number, self.next_file_number
                )))
            }
            Some(_) => {}
            None => edit.set_log_number(self.log_number),
        }
        edit.set_next_file_number(self.next_file_number);
        edit.set_last_sequence(self.last_sequence);
        self.current.apply(edit, &self.options)
    }

    /// Makes `version` current.
    pub(crate) fn install(&mut self, version: Version) {
        let v = Arc::new(version);
        self.live.retain(|w| w.strong_count() > 0);
        self.live.push(Arc::downgrade(&v));
        self.current = v;
    }

    fn apply_compact_pointers(&mut self, edit: &VersionEdit) {
        for (level, key) in &edit.compact_pointers {
            if let Some(slot) = self.compact_pointers.get_mut(*level) {
                *slot = Some(key.clone());
            }
        }
    }

    /// An edit that recreates the current state from nothing.
    fn snapshot_edit(&self) -> VersionEdit {
        let mut edit = VersionEdit::default();
        edit.set_comparator_name(self.icmp.user_comparator().name());
        edit.set_log_number(self.log_number);
        edit.set_next_file_number(self.next_file_number);
        edit.set_last_sequence(self.last_sequence);
        for (level, key) in self.compact_pointers.iter().enumerate() {
            if let Some(key) = key {
                edit.set_compact_pointer(level, key.clone());
            }
        }
        for level in 0..self.current.num_levels() {
            for f in self.current.files(level) {
                edit.add_file(level, (**f).clone());
            }
        }
        edit
    }

    /// Numbers of every table some live version references.
    pub(crate) fn live_files(&mut self) -> HashSet<u64> {
        self.live.retain(|w| w.strong_count() > 0);
        let mut live = HashSet::new();
        for v in self.live.iter().filter_map(Weak::upgrade) {
            v.add_live_files(&mut live);
        }
        self.current.add_live_files(&mut live);
        live
    }

    // -------------------- picking --------------------

    /// The compaction the current version needs most, if any level scores
    /// at least 1.
    pub(crate) fn pick_compaction(&mut self) -> Option<Compaction> {
        let current = self.current();
        if current.compaction_score() < 1.0 {
            return None;
        }
        let level = current.compaction_level();
        let files = current.files(level);
        if files.is_empty() {
            return None;
        }

        // Round-robin: first file past the last compacted key.
        let first = match &self.compact_pointers[level] {
            Some(ptr) if level > 0 => files
                .iter()
                .find(|f| {
                    self.icmp.compare(f.largest.encoded(), ptr.encoded()) == Ordering::Greater
                })
                .unwrap_or(&files[0]),
            // Oldest L0 file first.
            _ if level == 0 => files.last().unwrap_or(&files[0]),
            _ => &files[0],
        };

        let mut c = Compaction::new(level, Arc::clone(&current), &self.options);
        c.inputs[0].push(Arc::clone(first));

        if level == 0 {
            let (smallest, largest) = self.user_range(&c.inputs[0]);
            c.inputs[0] = current.overlapping_inputs(0, Some(&smallest), Some(&largest));
        }
        self.setup_other_inputs(&mut c);
        Some(c)
    }

    /// A compaction of every file in `level` overlapping `[begin, end]`.
    pub(crate) fn compact_range(
        &mut self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Option<Compaction> {
        if level + 1 >= self.current.num_levels() {
            return None;
        }
        let current = self.current();
        let inputs = current.overlapping_inputs(level, begin, end);
        if inputs.is_empty() {
            return None;
        }
        let mut c = Compaction::new(level, Arc::clone(&current), &self.options);
        c.inputs[0] = inputs;
        self.setup_other_inputs(&mut c);
        Some(c)
    }

    fn setup_other_inputs(&mut self, c: &mut Compaction) {
        let level = c.level;
        let current = Arc::clone(&c.input_version);
        let (smallest, largest) = self.user_range(&c.inputs[0]);
        c.inputs[1] = current.overlapping_inputs(level + 1, Some(&smallest), Some(&largest));

        // Widen the inputs at `level` if that does not pull in more of
        // `level + 1`.
        let (mut all_smallest, mut all_largest) = self.user_range_of_both(c);
        if !c.inputs[1].is_empty() {
            let expanded0 =
                current.overlapping_inputs(level, Some(&all_smallest), Some(&all_largest));
            let limit = EXPANDED_COMPACTION_FACTOR * self.options.max_file_size as u64;
            let expanded_bytes = crate::version::total_file_size(&expanded0)
                + crate::version::total_file_size(&c.inputs[1]);
            if expanded0.len() > c.inputs[0].len() && expanded_bytes < limit {
                let (new_start, new_limit) = self.user_range(&expanded0);
                let expanded1 =
                    current.overlapping_inputs(level + 1, Some(&new_start), Some(&new_limit));
                if expanded1.len() == c.inputs[1].len() {
                    tracing::debug!(
                        level,
                        from = c.inputs[0].len(),
                        to = expanded0.len(),
                        "expanding compaction inputs"
                    );
                    c.inputs[0] = expanded0;
                    c.inputs[1] = expanded1;
                    let (s, l) = self.user_range_of_both(c);
                    all_smallest = s;
                    all_largest = l;
                }
            }
        }

        if level + 2 < current.num_levels() {
            c.grandparents =
                current.overlapping_inputs(level + 2, Some(&all_smallest), Some(&all_largest));
        }

        // The next pick at this level starts after these inputs.
        if let Some(largest) = self.largest_key(&c.inputs[0]) {
            self.compact_pointers[level] = Some(largest.clone());
            c.edit.set_compact_pointer(level, largest);
        }
    }

    fn user_range(&self, files: &[Arc<FileMetaData>]) -> (Vec<u8>, Vec<u8>) {
        let mut smallest: &[u8] = &[];
        let mut largest: &[u8] = &[];
        for (i, f) in files.iter().enumerate() {
            if i == 0 || self.icmp.compare_user(f.smallest.user_key(), smallest) == Ordering::Less {
                smallest = f.smallest.user_key();
            }
            if i == 0 || self.icmp.compare_user(f.largest.user_key(), largest) == Ordering::Greater
            {
                largest = f.largest.user_key();
            }
        }
        (smallest.to_vec(), largest.to_vec())
    }

    fn user_range_of_both(&self, c: &Compaction) -> (Vec<u8>, Vec<u8>) {
        let all: Vec<Arc<FileMetaData>> =
            c.inputs[0].iter().chain(c.inputs[1].iter()).cloned().collect();
        self.user_range(&all)
    }

    fn largest_key(&self, files: &[Arc<FileMetaData>]) -> Option<InternalKey> {
        files
            .iter()
            .map(|f| &f.largest)
            .max_by(|a, b| self.icmp.compare(a.encoded(), b.encoded()))
            .cloned()
    }

    pub(crate) fn take_manifest_log(&mut self) -> Option<WalWriter> {
        self.manifest_log.take()
    }

    pub(crate) fn restore_manifest_log(&mut self, log: WalWriter) {
        self.manifest_log = Some(log);
    }
}

fn missing(what: &str) -> Error {
    Error::Corruption(format!("manifest has no {}", what))
}

impl DbInner {
    /// Durably records `edit` and installs the version it produces.
    ///
    /// The append and fsync run with the state lock released. Only the
    /// background worker calls this once the store is open, so no second
    /// edit can be in flight meanwhile.
    pub(crate) fn log_and_apply(
        &self,
        state: &mut MutexGuard<'_, DbState>,
        mut edit: VersionEdit,
    ) -> Result<()> {
        let version = state.versions.prepare(&mut edit)?;
        let record = edit.encode();
        let Some(mut log) = state.versions.take_manifest_log() else {
            return Err(Error::Corruption("manifest is not open".into()));
        };

        let result = MutexGuard::unlocked(state, || -> Result<()> {
            log.append(&record)?;
            log.sync()?;
            Ok(())
        });
        state.versions.restore_manifest_log(log);
        result?;

        state.versions.apply_compact_pointers(&edit);
        state.versions.install(version);
        if let Some(n) = edit.log_number {
            state.versions.log_number = n;
        }
        Ok(())
    }
}
