//! Immutable snapshots of the table layout.
//!
//! A [`Version`] lists the table files of every level. Level 0 holds
//! flushed stages, newest first, and its files may overlap. Every deeper
//! level is sorted by smallest key and its files cover disjoint user-key
//! ranges. Versions are never mutated: applying an edit builds a new one.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use config::Options;
use memtable::{InternalKeyComparator, LookupKey, MemGet, ValueKind};

use crate::error::{Error, Result};
use crate::iterator::{LevelIter, SourceIter};
use crate::table_cache::TableCache;
use crate::version_edit::{FileMetaData, VersionEdit};

/// Deepest level a flushed stage may be pushed to directly.
const MAX_MEM_COMPACT_LEVEL: usize = 2;

/// Bytes of grandparent overlap a single output file may accumulate.
pub(crate) fn max_grandparent_overlap_bytes(options: &Options) -> u64 {
    10 * options.max_file_size as u64
}

pub(crate) fn total_file_size(files: &[Arc<FileMetaData>]) -> u64 {
    files.iter().map(|f| f.file_size).sum()
}

pub struct Version {
    files: Vec<Vec<Arc<FileMetaData>>>,
    icmp: InternalKeyComparator,
    compaction_score: f64,
    compaction_level: usize,
}

impl Version {
    pub(crate) fn new(num_levels: usize, icmp: InternalKeyComparator) -> Self {
        Self {
            files: vec![Vec::new(); num_levels],
            icmp,
            compaction_score: 0.0,
            compaction_level: 0,
        }
    }

    pub fn num_levels(&self) -> usize {
        self.files.len()
    }

    pub fn files(&self, level: usize) -> &[Arc<FileMetaData>] {
        &self.files[level]
    }

    pub fn num_files(&self, level: usize) -> usize {
        self.files.get(level).map_or(0, Vec::len)
    }

    pub fn level_bytes(&self, level: usize) -> u64 {
        self.files.get(level).map_or(0, |f| total_file_size(f))
    }

    pub(crate) fn compaction_score(&self) -> f64 {
        self.compaction_score
    }

    pub(crate) fn compaction_level(&self) -> usize {
        self.compaction_level
    }

    pub(crate) fn comparator(&self) -> &InternalKeyComparator {
        &self.icmp
    }

    /// Builds the version that results from applying `edit` to `self`.
    pub(crate) fn apply(&self, edit: &VersionEdit, options: &Options) -> Result<Version> {
        let num_levels = self.files.len();
        let mut files = self.files.clone();

        for &(level, number) in edit.deleted_files() {
            let list = files.get_mut(level).ok_or_else(|| bad_level(level))?;
            list.retain(|f| f.number != number);
        }
        for (level, meta) in edit.new_files() {
            let list = files.get_mut(*level).ok_or_else(|| bad_level(*level))?;
            list.retain(|f| f.number != meta.number);
            list.push(Arc::new(meta.clone()));
        }

        files[0].sort_by(|a, b| b.number.cmp(&a.number));
        for level in 1..num_levels {
            files[level].sort_by(|a, b| {
                self.icmp
                    .compare(a.smallest.encoded(), b.smallest.encoded())
                    .then(a.number.cmp(&b.number))
            });
            for pair in files[level].windows(2) {
                if self
                    .icmp
                    .compare_user(pair[0].largest.user_key(), pair[1].smallest.user_key())
                    != Ordering::Less
                {
                    return Err(Error::Corruption(format!(
                        "tables {} and {} overlap in level {}",
                        pair[0].number, pair[1].number, level
                    )));
                }
            }
        }

        let mut v = Version {
            files,
            icmp: self.icmp.clone(),
            compaction_score: 0.0,
            compaction_level: 0,
        };
        v.finalize(options);
        Ok(v)
    }

    /// Picks the level most in need of compaction.
    fn finalize(&mut self, options: &Options) {
        let mut best_level = 0;
        let mut best_score = -1.0;
        for level in 0..self.files.len().saturating_sub(1) {
            let score = if level == 0 {
                self.files[0].len() as f64 / options.l0_compaction_trigger as f64
            } else {
                self.level_bytes(level) as f64 / options.max_bytes_for_level(level) as f64
            };
            if score > best_score {
                best_score = score;
                best_level = level;
            }
        }
        self.compaction_level = best_level;
        self.compaction_score = best_score;
    }

    /// Looks `key` up in the table files, shallowest level first.
    ///
    /// Level 0 files are probed newest first; deeper levels need at most
    /// one probe each. The first entry found decides the result.
    pub(crate) fn get(
        &self,
        key: &LookupKey,
        cache: &TableCache,
        verify: bool,
        fill_cache: bool,
    ) -> Result<Option<MemGet>> {
        let user_key = key.user_key();

        for f in &self.files[0] {
            if self.icmp.compare_user(user_key, f.smallest.user_key()) == Ordering::Less
                || self.icmp.compare_user(user_key, f.largest.user_key()) == Ordering::Greater
            {
                continue;
            }
            if let Some(found) = probe(cache, f, key, verify, fill_cache)? {
                return Ok(Some(found));
            }
        }

        for level in 1..self.files.len() {
            let files = &self.files[level];
            let idx = find_file(&self.icmp, files, key.internal_key());
            let Some(f) = files.get(idx) else { continue };
            if self.icmp.compare_user(user_key, f.smallest.user_key()) == Ordering::Less {
                continue;
            }
            if let Some(found) = probe(cache, f, key, verify, fill_cache)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// Whether any file in `level` overlaps the user-key range
    /// `[smallest, largest]`; `None` is unbounded.
    pub(crate) fn overlap_in_level(
        &self,
        level: usize,
        smallest: Option<&[u8]>,
        largest: Option<&[u8]>,
    ) -> bool {
        let ucmp = |a: &[u8], b: &[u8]| self.icmp.compare_user(a, b);
        let files = &self.files[level];
        if level == 0 {
            return files.iter().any(|f| {
                !(smallest.is_some_and(|s| ucmp(f.largest.user_key(), s) == Ordering::Less)
                    || largest.is_some_and(|l| ucmp(f.smallest.user_key(), l) == Ordering::Greater))
            });
        }
        let idx = match smallest {
            Some(s) => {
                let probe = memtable::LookupKey::new(s, memtable::MAX_SEQUENCE_NUMBER);
                find_file(&self.icmp, files, probe.internal_key())
            }
            None => 0,
        };
        match files.get(idx) {
            None => false,
            Some(f) => !largest.is_some_and(|l| ucmp(l, f.smallest.user_key()) == Ordering::Less),
        }
    }

    /// Files in `level` overlapping the user-key range `[begin, end]`.
    ///
    /// For level 0 the range grows to cover every file it touches, since
    /// an older overlapping L0 file cannot be left behind a newer one.
    pub(crate) fn overlapping_inputs(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Vec<Arc<FileMetaData>> {
        let ucmp = |a: &[u8], b: &[u8]| self.icmp.compare_user(a, b);
        let mut begin = begin.map(<[u8]>::to_vec);
        let mut end = end.map(<[u8]>::to_vec);
        let files = &self.files[level];
        let mut inputs = Vec::new();
        let mut i = 0;
        while i < files.len() {
            let f = &files[i];
            i += 1;
            let (lo, hi) = (f.smallest.user_key(), f.largest.user_key());
            if begin.as_deref().is_some_and(|b| ucmp(hi, b) == Ordering::Less) {
                continue;
            }
            if end.as_deref().is_some_and(|e| ucmp(lo, e) == Ordering::Greater) {
                continue;
            }
            inputs.push(Arc::clone(f));
            if level == 0 {
                if begin.as_deref().is_some_and(|b| ucmp(lo, b) == Ordering::Less) {
                    begin = Some(lo.to_vec());
                    inputs.clear();
                    i = 0;
                } else if end.as_deref().is_some_and(|e| ucmp(hi, e) == Ordering::Greater) {
                    end = Some(hi.to_vec());
                    inputs.clear();
                    i = 0;
                }
            }
        }
        inputs
    }

    /// Level a freshly flushed stage covering `[smallest, largest]` goes
    /// to. Pushing past L0 saves merges when nothing above overlaps.
    pub(crate) fn pick_level_for_memtable_output(
        &self,
        smallest: &[u8],
        largest: &[u8],
        options: &Options,
    ) -> usize {
        let mut level = 0;
        if self.overlap_in_level(0, Some(smallest), Some(largest)) {
            return level;
        }
        let limit = MAX_MEM_COMPACT_LEVEL.min(self.files.len().saturating_sub(1));
        while level < limit {
            if self.overlap_in_level(level + 1, Some(smallest), Some(largest)) {
                break;
            }
            if level + 2 < self.files.len() {
                let grandparents =
                    self.overlapping_inputs(level + 2, Some(smallest), Some(largest));
                if total_file_size(&grandparents) > max_grandparent_overlap_bytes(options) {
                    break;
                }
            }
            level += 1;
        }
        level
    }

    /// One source per L0 table, one lazy level iterator per deeper level.
    pub(crate) fn source_iters(
        &self,
        cache: &Arc<TableCache>,
        verify: bool,
        fill_cache: bool,
        out: &mut Vec<SourceIter>,
    ) -> Result<()> {
        for f in &self.files[0] {
            out.push(SourceIter::Table(cache.iter(
                f.number,
                f.file_size,
                verify,
                fill_cache,
            )?));
        }
        for level in 1..self.files.len() {
            if !self.files[level].is_empty() {
                out.push(SourceIter::Level(LevelIter::new(
                    self.files[level].clone(),
                    Arc::clone(cache),
                    verify,
                    fill_cache,
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn add_live_files(&self, live: &mut HashSet<u64>) {
        for level in &self.files {
            live.extend(level.iter().map(|f| f.number));
        }
    }

    /// `files[ 2 0 1 0 0 0 0 ]`
    pub fn level_summary(&self) -> String {
        let counts: Vec<String> = self.files.iter().map(|l| l.len().to_string()).collect();
        format!("files[ {} ]", counts.join(" "))
    }

    /// One line per level followed by one line per file.
    pub fn debug_string(&self) -> String {
        let mut out = String::new();
        for (level, files) in self.files.iter().enumerate() {
            out.push_str(&format!("--- level {} ---\n", level));
            for f in files {
                out.push_str(&format!(
                    " {}:{}[{:?} .. {:?}]\n",
                    f.number, f.file_size, f.smallest, f.largest
                ));
            }
        }
        out
    }
}

impl std::fmt::Debug for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Version")
            .field("files", &self.level_summary())
            .field("compaction_score", &self.compaction_score)
            .field("compaction_level", &self.compaction_level)
            .finish()
    }
}

fn bad_level(level: usize) -> Error {
    Error::Corruption(format!("version edit names level {}", level))
}

fn probe(
    cache: &TableCache,
    f: &FileMetaData,
    key: &LookupKey,
    verify: bool,
    fill_cache: bool,
) -> Result<Option<MemGet>> {
    Ok(
        match cache.get(f.number, f.file_size, key, verify, fill_cache)? {
            Some((ValueKind::Value, v)) => Some(MemGet::Value(v)),
            Some((ValueKind::Deletion, _)) => Some(MemGet::Deleted),
            None => None,
        },
    )
}

/// Index of the first file whose largest key is `>= target`, or
/// `files.len()` when there is none. `files` must be a sorted level.
pub(crate) fn find_file(
    icmp: &InternalKeyComparator,
    files: &[Arc<FileMetaData>],
    target: &[u8],
) -> usize {
    files.partition_point(|f| icmp.compare(f.largest.encoded(), target) == Ordering::Less)
}
