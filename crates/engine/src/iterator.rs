//! Read-side iteration: per-source cursors, their merge, and the user
//! facing [`DbIterator`].
//!
//! ```text
//! DbIterator          visibility, dedup, tombstones (user keys)
//!   MergingIterator   heap over every source (internal keys)
//!     Mem             mutable and frozen stages
//!     Table           one per L0 file
//!     Level           one per deeper level, opens files lazily
//! ```

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use config::Comparator;
use memtable::{
    extract_user_key, parse_internal_key, InternalKeyComparator, LookupKey, MemTable,
    MemTableIterator, SequenceNumber, ValueKind,
};
use sstable::SSTableIterator;

use crate::error::{Error, Result};
use crate::version::{find_file, Version};
use crate::version_edit::FileMetaData;
use crate::table_cache::TableCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

/// A cursor over internal keys from one source.
pub(crate) enum SourceIter {
    Mem(MemTableIterator),
    Table(SSTableIterator),
    Level(LevelIter),
}

impl SourceIter {
    pub(crate) fn valid(&self) -> bool {
        match self {
            SourceIter::Mem(it) => it.valid(),
            SourceIter::Table(it) => it.valid(),
            SourceIter::Level(it) => it.valid(),
        }
    }

    pub(crate) fn seek_to_first(&mut self) {
        match self {
            SourceIter::Mem(it) => it.seek_to_first(),
            SourceIter::Table(it) => it.seek_to_first(),
            SourceIter::Level(it) => it.seek_to_first(),
        }
    }

    pub(crate) fn seek_to_last(&mut self) {
        match self {
            SourceIter::Mem(it) => it.seek_to_last(),
            SourceIter::Table(it) => it.seek_to_last(),
            SourceIter::Level(it) => it.seek_to_last(),
        }
    }

    pub(crate) fn seek(&mut self, target: &[u8]) {
        match self {
            SourceIter::Mem(it) => it.seek(target),
            SourceIter::Table(it) => it.seek(target),
            SourceIter::Level(it) => it.seek(target),
        }
    }

    pub(crate) fn next(&mut self) {
        match self {
            SourceIter::Mem(it) => it.next(),
            SourceIter::Table(it) => it.next(),
            SourceIter::Level(it) => it.next(),
        }
    }

    pub(crate) fn prev(&mut self) {
        match self {
            SourceIter::Mem(it) => it.prev(),
            SourceIter::Table(it) => it.prev(),
            SourceIter::Level(it) => it.prev(),
        }
    }

    pub(crate) fn key(&self) -> &[u8] {
        match self {
            SourceIter::Mem(it) => it.key(),
            SourceIter::Table(it) => it.key(),
            SourceIter::Level(it) => it.key(),
        }
    }

    pub(crate) fn value(&self) -> &[u8] {
        match self {
            SourceIter::Mem(it) => it.value(),
            SourceIter::Table(it) => it.value(),
            SourceIter::Level(it) => it.value(),
        }
    }

    pub(crate) fn status(&self) -> Result<()> {
        match self {
            SourceIter::Mem(_) => Ok(()),
            SourceIter::Table(it) => it.status().map_or(Ok(()), |e| Err(Error::from_table_ref(e))),
            SourceIter::Level(it) => it.status(),
        }
    }
}

// -------------------- LevelIter --------------------

/// Concatenation of the sorted, disjoint files of one level. A file is
/// opened only when the cursor enters it.
pub(crate) struct LevelIter {
    files: Vec<Arc<FileMetaData>>,
    cache: Arc<TableCache>,
    verify: bool,
    fill_cache: bool,
    /// Index of the open file; `files.len()` when none is.
    index: usize,
    current: Option<SSTableIterator>,
    status: Option<Error>,
}

impl LevelIter {
    pub(crate) fn new(
        files: Vec<Arc<FileMetaData>>,
        cache: Arc<TableCache>,
        verify: bool,
        fill_cache: bool,
    ) -> Self {
        let index = files.len();
        Self {
            files,
            cache,
            verify,
            fill_cache,
            index,
            current: None,
            status: None,
        }
    }

    pub(crate) fn valid(&self) -> bool {
        self.current.as_ref().is_some_and(SSTableIterator::valid)
    }

    fn open(&mut self, index: usize) {
        if index == self.index && self.current.is_some() {
            return;
        }
        self.index = index;
        self.current = None;
        let Some(f) = self.files.get(index) else { return };
        match self.cache.iter(f.number, f.file_size, self.verify, self.fill_cache) {
            Ok(it) => self.current = Some(it),
            Err(e) => {
                if self.status.is_none() {
                    self.status = Some(e);
                }
            }
        }
    }

    pub(crate) fn seek_to_first(&mut self) {
        self.open(0);
        if let Some(it) = self.current.as_mut() {
            it.seek_to_first();
        }
        self.skip_forward();
    }

    pub(crate) fn seek_to_last(&mut self) {
        self.open(self.files.len().saturating_sub(1));
        if let Some(it) = self.current.as_mut() {
            it.seek_to_last();
        }
        self.skip_backward();
    }

    pub(crate) fn seek(&mut self, target: &[u8]) {
        let idx = find_file(self.cache.comparator(), &self.files, target);
        self.open(idx);
        if let Some(it) = self.current.as_mut() {
            it.seek(target);
        }
        self.skip_forward();
    }

    pub(crate) fn next(&mut self) {
        if let Some(it) = self.current.as_mut() {
            it.next();
        }
        self.skip_forward();
    }

    pub(crate) fn prev(&mut self) {
        if let Some(it) = self.current.as_mut() {
            it.prev();
        }
        self.skip_backward();
    }

    pub(crate) fn key(&self) -> &[u8] {
        self.current.as_ref().map_or(&[][..], SSTableIterator::key)
    }

    pub(crate) fn value(&self) -> &[u8] {
        self.current.as_ref().map_or(&[][..], SSTableIterator::value)
    }

    pub(crate) fn status(&self) -> Result<()> {
        if let Some(e) = &self.status {
            return Err(e.clone());
        }
        match self.current.as_ref().and_then(SSTableIterator::status) {
            Some(e) => Err(Error::from_table_ref(e)),
            None => Ok(()),
        }
    }

    fn stuck(&self) -> bool {
        self.status.is_some()
            || self
                .current
                .as_ref()
                .is_some_and(|it| it.status().is_some())
    }

    fn skip_forward(&mut self) {
        while !self.valid() && !self.stuck() {
            if self.index + 1 >= self.files.len() {
                self.current = None;
                self.index = self.files.len();
                return;
            }
            self.open(self.index + 1);
            if let Some(it) = self.current.as_mut() {
                it.seek_to_first();
            }
        }
    }

    fn skip_backward(&mut self) {
        while !self.valid() && !self.stuck() {
            if self.index == 0 || self.index >= self.files.len() {
                self.current = None;
                self.index = self.files.len();
                return;
            }
            self.open(self.index - 1);
            if let Some(it) = self.current.as_mut() {
                it.seek_to_last();
            }
        }
    }
}

// -------------------- MergingIterator --------------------

/// Heap entry: a copy of a child's current key.
struct HeapItem {
    key: Vec<u8>,
    child: usize,
    icmp: InternalKeyComparator,
    direction: Direction,
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: forward wants the smallest key on top.
        let ord = self
            .icmp
            .compare(&self.key, &other.key)
            .then(self.child.cmp(&other.child));
        match self.direction {
            Direction::Forward => ord.reverse(),
            Direction::Reverse => ord,
        }
    }
}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapItem {}

/// Sorted union of several sources. Positions on the smallest current key
/// going forward and the largest going backward.
pub(crate) struct MergingIterator {
    children: Vec<SourceIter>,
    icmp: InternalKeyComparator,
    heap: BinaryHeap<HeapItem>,
    direction: Direction,
    current: Option<usize>,
}

impl MergingIterator {
    pub(crate) fn new(children: Vec<SourceIter>, icmp: InternalKeyComparator) -> Self {
        Self {
            children,
            icmp,
            heap: BinaryHeap::new(),
            direction: Direction::Forward,
            current: None,
        }
    }

    pub(crate) fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn push(&mut self, child: usize) {
        if self.children[child].valid() {
            self.heap.push(HeapItem {
                key: self.children[child].key().to_vec(),
                child,
                icmp: self.icmp.clone(),
                direction: self.direction,
            });
        }
    }

    fn rebuild(&mut self) {
        self.heap.clear();
        for i in 0..self.children.len() {
            self.push(i);
        }
        self.current = self.heap.pop().map(|item| item.child);
    }

    pub(crate) fn seek_to_first(&mut self) {
        for c in &mut self.children {
            c.seek_to_first();
        }
        self.direction = Direction::Forward;
        self.rebuild();
    }

    pub(crate) fn seek_to_last(&mut self) {
        for c in &mut self.children {
            c.seek_to_last();
        }
        self.direction = Direction::Reverse;
        self.rebuild();
    }

    pub(crate) fn seek(&mut self, target: &[u8]) {
        for c in &mut self.children {
            c.seek(target);
        }
        self.direction = Direction::Forward;
        self.rebuild();
    }

    pub(crate) fn next(&mut self) {
        let Some(cur) = self.current else { return };
        if self.direction != Direction::Forward {
            // Every other child must move to the first key after ours.
            let key = self.children[cur].key().to_vec();
            for (i, c) in self.children.iter_mut().enumerate() {
                if i == cur {
                    continue;
                }
                c.seek(&key);
                if c.valid() && self.icmp.compare(&key, c.key()) == Ordering::Equal {
                    c.next();
                }
            }
            self.direction = Direction::Forward;
            self.children[cur].next();
            self.rebuild();
            return;
        }
        self.children[cur].next();
        self.push(cur);
        self.current = self.heap.pop().map(|item| item.child);
    }

    pub(crate) fn prev(&mut self) {
        let Some(cur) = self.current else { return };
        if self.direction != Direction::Reverse {
            // Every other child must move to the last key before ours.
            let key = self.children[cur].key().to_vec();
            for (i, c) in self.children.iter_mut().enumerate() {
                if i == cur {
                    continue;
                }
                c.seek(&key);
                if c.valid() {
                    c.prev();
                } else {
                    c.seek_to_last();
                }
            }
            self.direction = Direction::Reverse;
            self.children[cur].prev();
            self.rebuild();
            return;
        }
        self.children[cur].prev();
        self.push(cur);
        self.current = self.heap.pop().map(|item| item.child);
    }

    pub(crate) fn key(&self) -> &[u8] {
        self.current.map_or(&[][..], |c| self.children[c].key())
    }

    pub(crate) fn value(&self) -> &[u8] {
        self.current.map_or(&[][..], |c| self.children[c].value())
    }

    pub(crate) fn status(&self) -> Result<()> {
        self.children.iter().try_for_each(SourceIter::status)
    }
}

// -------------------- DbIterator --------------------

/// Ordered view of the user keys visible at one sequence number.
///
/// Created by [`Db::iter`](crate::Db::iter). The iterator pins the stages
/// and the table version it was built from, so it keeps seeing the same
/// data while writes, flushes and compactions go on.
///
/// ```rust,no_run
/// # fn demo(db: &engine::Db) -> engine::Result<()> {
/// let mut it = db.iter(&engine::ReadOptions::default())?;
/// it.seek_to_first();
/// while it.valid() {
///     println!("{:?} = {:?}", it.key(), it.value());
///     it.next();
/// }
/// it.status()
/// # }
/// ```
pub struct DbIterator {
    inner: MergingIterator,
    user_cmp: Arc<dyn Comparator>,
    sequence: SequenceNumber,
    direction: Direction,
    valid: bool,
    /// Forward: the key being skipped. Reverse: the current user key.
    saved_key: Vec<u8>,
    /// Reverse only: the current value.
    saved_value: Vec<u8>,
    status: Option<Error>,
    _version: Arc<Version>,
    _stages: Vec<Arc<MemTable>>,
}

impl DbIterator {
    pub(crate) fn new(
        inner: MergingIterator,
        sequence: SequenceNumber,
        version: Arc<Version>,
        stages: Vec<Arc<MemTable>>,
    ) -> Self {
        let user_cmp = Arc::clone(inner.icmp.user_comparator());
        Self {
            inner,
            user_cmp,
            sequence,
            direction: Direction::Forward,
            valid: false,
            saved_key: Vec::new(),
            saved_value: Vec::new(),
            status: None,
            _version: version,
            _stages: stages,
        }
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    /// Current user key. Empty when not [`valid`](Self::valid).
    pub fn key(&self) -> &[u8] {
        if !self.valid {
            return &[];
        }
        match self.direction {
            Direction::Forward => extract_user_key(self.inner.key()),
            Direction::Reverse => &self.saved_key,
        }
    }

    pub fn value(&self) -> &[u8] {
        if !self.valid {
            return &[];
        }
        match self.direction {
            Direction::Forward => self.inner.value(),
            Direction::Reverse => &self.saved_value,
        }
    }

    /// First error hit by any source, if any.
    pub fn status(&self) -> Result<()> {
        match &self.status {
            Some(e) => Err(e.clone()),
            None => self.inner.status(),
        }
    }

    pub fn seek_to_first(&mut self) {
        self.direction = Direction::Forward;
        self.saved_value.clear();
        self.inner.seek_to_first();
        if self.inner.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    pub fn seek_to_last(&mut self) {
        self.direction = Direction::Reverse;
        self.saved_value.clear();
        self.inner.seek_to_last();
        self.find_prev_user_entry();
    }

    /// Positions at the first key `>= target`.
    pub fn seek(&mut self, target: &[u8]) {
        self.direction = Direction::Forward;
        self.saved_value.clear();
        let lookup = LookupKey::new(target, self.sequence);
        self.inner.seek(lookup.internal_key());
        if self.inner.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    pub fn next(&mut self) {
        if !self.valid {
            return;
        }
        if self.direction == Direction::Reverse {
            // The merge sits just before the entries of the current key.
            self.direction = Direction::Forward;
            if self.inner.valid() {
                self.inner.next();
            } else {
                self.inner.seek_to_first();
            }
            if !self.inner.valid() {
                self.valid = false;
                self.saved_key.clear();
                return;
            }
        } else {
            self.saved_key.clear();
            self.saved_key.extend_from_slice(extract_user_key(self.inner.key()));
            self.inner.next();
            if !self.inner.valid() {
                self.valid = false;
                self.saved_key.clear();
                return;
            }
        }
        self.find_next_user_entry(true);
    }

    pub fn prev(&mut self) {
        if !self.valid {
            return;
        }
        if self.direction == Direction::Forward {
            // Back up until the merge is before every entry of this key.
            self.saved_key.clear();
            self.saved_key.extend_from_slice(extract_user_key(self.inner.key()));
            loop {
                self.inner.prev();
                if !self.inner.valid() {
                    self.valid = false;
                    self.saved_key.clear();
                    self.saved_value.clear();
                    return;
                }
                if self
                    .user_cmp
                    .compare(extract_user_key(self.inner.key()), &self.saved_key)
                    == Ordering::Less
                {
                    break;
                }
            }
            self.direction = Direction::Reverse;
        }
        self.find_prev_user_entry();
    }

    fn corrupt_key(&mut self) {
        if self.status.is_none() {
            self.status = Some(Error::Corruption("malformed internal key".into()));
        }
        self.valid = false;
    }

    /// Advances to the next visible entry, hiding everything at or before
    /// `saved_key` while `skipping`.
    fn find_next_user_entry(&mut self, mut skipping: bool) {
        while self.inner.valid() {
            let Some(parsed) = parse_internal_key(self.inner.key()) else {
                self.corrupt_key();
                return;
            };
            if parsed.sequence <= self.sequence {
                match parsed.kind {
                    ValueKind::Deletion => {
                        self.saved_key.clear();
                        self.saved_key.extend_from_slice(parsed.user_key);
                        skipping = true;
                    }
                    ValueKind::Value => {
                        let hidden = skipping
                            && self.user_cmp.compare(parsed.user_key, &self.saved_key)
                                != Ordering::Greater;
                        if !hidden {
                            self.valid = true;
                            self.saved_key.clear();
                            return;
                        }
                    }
                }
            }
            self.inner.next();
        }
        self.saved_key.clear();
        self.valid = false;
    }

    /// Walks backward collecting the newest visible entry of the previous
    /// user key into `saved_key` / `saved_value`.
    fn find_prev_user_entry(&mut self) {
        let mut kind = ValueKind::Deletion;
        while self.inner.valid() {
            let Some(parsed) = parse_internal_key(self.inner.key()) else {
                self.corrupt_key();
                return;
            };
            if parsed.sequence <= self.sequence {
                if kind != ValueKind::Deletion
                    && self.user_cmp.compare(parsed.user_key, &self.saved_key) == Ordering::Less
                {
                    // Passed the start of the saved key's entries.
                    break;
                }
                kind = parsed.kind;
                if kind == ValueKind::Deletion {
                    self.saved_key.clear();
                    self.saved_value.clear();
                } else {
                    self.saved_key.clear();
                    self.saved_key.extend_from_slice(parsed.user_key);
                    self.saved_value.clear();
                    self.saved_value.extend_from_slice(self.inner.value());
                }
            }
            self.inner.prev();
        }

        if kind == ValueKind::Deletion {
            self.valid = false;
            self.saved_key.clear();
            self.saved_value.clear();
            self.direction = Direction::Forward;
        } else {
            self.valid = true;
        }
    }
}

impl std::fmt::Debug for DbIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbIterator")
            .field("sequence", &self.sequence)
            .field("valid", &self.valid)
            .finish()
    }
}
