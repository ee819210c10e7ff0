//! # Memtable - ShoalDB mutable stage
//!
//! Recent writes live here, ordered by internal key, until the stage is
//! frozen and flushed to a level-0 table. Nothing is ever removed in place:
//! a deletion is one more entry with [`ValueKind::Deletion`].
//!
//! The stage is a [`crossbeam_skiplist::SkipMap`], so readers walk it
//! without locks while the single write path inserts.

pub mod key;

use std::cmp::Ordering;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use crossbeam_skiplist::map::Entry;
use crossbeam_skiplist::SkipMap;

pub use key::{
    extract_user_key, pack_tag, parse_internal_key, InternalKey, InternalKeyComparator,
    LookupKey, ParsedInternalKey, SequenceNumber, ValueKind, MAX_SEQUENCE_NUMBER, TAG_BYTES,
};

/// Per-entry bookkeeping charged on top of key and value bytes.
const ENTRY_OVERHEAD: usize = 48;

/// Skiplist key: an encoded internal key that orders itself with the
/// stage's comparator.
struct MemKey {
    ikey: Vec<u8>,
    icmp: InternalKeyComparator,
}

impl PartialEq for MemKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MemKey {}

impl PartialOrd for MemKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MemKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.icmp.compare(&self.ikey, &other.ikey)
    }
}

/// Result of a point lookup that found the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemGet {
    Value(Vec<u8>),
    /// The newest visible entry is a tombstone; older sources must not be
    /// consulted.
    Deleted,
}

pub struct MemTable {
    table: SkipMap<MemKey, Vec<u8>>,
    icmp: InternalKeyComparator,
    usage: AtomicUsize,
}

impl MemTable {
    pub fn new(icmp: InternalKeyComparator) -> Self {
        Self {
            table: SkipMap::new(),
            icmp,
            usage: AtomicUsize::new(0),
        }
    }

    fn search_key(&self, ikey: &[u8]) -> MemKey {
        MemKey {
            ikey: ikey.to_vec(),
            icmp: self.icmp.clone(),
        }
    }

    /// Inserts one entry. Sequence numbers are unique, so an insert never
    /// replaces an existing entry.
    pub fn add(&self, seq: SequenceNumber, kind: ValueKind, user_key: &[u8], value: &[u8]) {
        let ikey = InternalKey::new(user_key, seq, kind).into_bytes();
        let charge = ikey.len() + value.len() + ENTRY_OVERHEAD;
        self.table.insert(
            MemKey {
                ikey,
                icmp: self.icmp.clone(),
            },
            value.to_vec(),
        );
        self.usage.fetch_add(charge, AtomicOrdering::Relaxed);
    }

    /// Newest entry for the lookup's user key with a sequence number at or
    /// below the lookup's. `None` means this stage knows nothing about it.
    pub fn get(&self, key: &LookupKey) -> Option<MemGet> {
        let probe = self.search_key(key.internal_key());
        let entry = self.table.lower_bound(Bound::Included(&probe))?;
        let parsed = parse_internal_key(&entry.key().ikey)?;
        if self.icmp.compare_user(parsed.user_key, key.user_key()) != Ordering::Equal {
            return None;
        }
        Some(match parsed.kind {
            ValueKind::Value => MemGet::Value(entry.value().clone()),
            ValueKind::Deletion => MemGet::Deleted,
        })
    }

    /// Bytes charged to this stage so far.
    pub fn approximate_memory_usage(&self) -> usize {
        self.usage.load(AtomicOrdering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn comparator(&self) -> &InternalKeyComparator {
        &self.icmp
    }

    /// Iterator that keeps this stage alive for as long as it exists.
    pub fn iter(self: &Arc<Self>) -> MemTableIterator {
        MemTableIterator {
            mem: Arc::clone(self),
            current: None,
        }
    }
}

impl std::fmt::Debug for MemTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTable")
            .field("entries", &self.len())
            .field("approximate_memory_usage", &self.approximate_memory_usage())
            .finish()
    }
}

/// Bidirectional cursor over a [`MemTable`].
///
/// Starts unpositioned; call one of the seek methods first. Entries
/// inserted after the cursor was positioned are seen if they fall ahead of
/// it.
pub struct MemTableIterator {
    mem: Arc<MemTable>,
    current: Option<(Vec<u8>, Vec<u8>)>,
}

impl MemTableIterator {
    fn land(&mut self, entry: Option<Entry<'_, MemKey, Vec<u8>>>) {
        self.current = entry.map(|e| (e.key().ikey.clone(), e.value().clone()));
    }

    pub fn valid(&self) -> bool {
        self.current.is_some()
    }

    pub fn seek_to_first(&mut self) {
        let mem = Arc::clone(&self.mem);
        self.land(mem.table.front());
    }

    pub fn seek_to_last(&mut self) {
        let mem = Arc::clone(&self.mem);
        self.land(mem.table.back());
    }

    /// Positions at the first entry at or after `target` (an internal key).
    pub fn seek(&mut self, target: &[u8]) {
        let mem = Arc::clone(&self.mem);
        let probe = mem.search_key(target);
        self.land(mem.table.lower_bound(Bound::Included(&probe)));
    }

    pub fn next(&mut self) {
        let Some((key, _)) = self.current.take() else {
            return;
        };
        let mem = Arc::clone(&self.mem);
        let probe = mem.search_key(&key);
        self.land(mem.table.lower_bound(Bound::Excluded(&probe)));
    }

    pub fn prev(&mut self) {
        let Some((key, _)) = self.current.take() else {
            return;
        };
        let mem = Arc::clone(&self.mem);
        let probe = mem.search_key(&key);
        self.land(mem.table.upper_bound(Bound::Excluded(&probe)));
    }

    /// Encoded internal key at the cursor; empty when not valid.
    pub fn key(&self) -> &[u8] {
        self.current.as_ref().map_or(&[][..], |(k, _)| k.as_slice())
    }

    pub fn value(&self) -> &[u8] {
        self.current.as_ref().map_or(&[][..], |(_, v)| v.as_slice())
    }
}

#[cfg(test)]
mod tests;
