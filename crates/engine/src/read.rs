//! Read path: `get()`, `iter()`, snapshots.
//!
//! Point lookups consult the mutable stage, then the frozen stage, then the
//! table files shallowest level first. The first entry at or below the read
//! sequence decides: a value is returned, a tombstone ends the search.

use std::sync::Arc;

use memtable::{LookupKey, MemGet, MemTable, SequenceNumber};

use crate::error::Result;
use crate::iterator::{DbIterator, MergingIterator, SourceIter};
use crate::snapshot::Snapshot;
use crate::version::Version;
use crate::{Db, ReadOptions};

/// What a read captures under the lock.
struct ReadView {
    mem: Arc<MemTable>,
    imm: Option<Arc<MemTable>>,
    version: Arc<Version>,
    sequence: SequenceNumber,
}

impl Db {
    fn read_view(&self, opts: &ReadOptions<'_>) -> ReadView {
        let state = self.inner.state.lock();
        ReadView {
            mem: Arc::clone(&state.mem),
            imm: state.imm.clone(),
            version: state.versions.current(),
            sequence: opts
                .snapshot
                .map_or_else(|| state.versions.last_sequence(), Snapshot::sequence),
        }
    }

    /// Returns the value of `key`, or `None` if it is absent or deleted.
    ///
    /// # Errors
    ///
    /// Table read failures, including checksum mismatches when
    /// `opts.verify_checksums` is set.
    pub fn get(&self, opts: &ReadOptions<'_>, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let view = self.read_view(opts);
        let lookup = LookupKey::new(key, view.sequence);

        let stages = std::iter::once(&view.mem).chain(view.imm.as_ref());
        for stage in stages {
            if let Some(found) = stage.get(&lookup) {
                return Ok(visible(found));
            }
        }

        let found = view.version.get(
            &lookup,
            &self.inner.table_cache,
            opts.verify_checksums,
            opts.fill_cache,
        )?;
        Ok(found.and_then(visible))
    }

    /// An iterator over the keys visible at `opts.snapshot` (or now).
    ///
    /// The iterator starts unpositioned; call one of the seek methods.
    pub fn iter(&self, opts: &ReadOptions<'_>) -> Result<DbIterator> {
        let view = self.read_view(opts);

        let mut children = vec![SourceIter::Mem(view.mem.iter())];
        let mut stages = vec![Arc::clone(&view.mem)];
        if let Some(imm) = &view.imm {
            children.push(SourceIter::Mem(imm.iter()));
            stages.push(Arc::clone(imm));
        }
        view.version.source_iters(
            &self.inner.table_cache,
            opts.verify_checksums,
            opts.fill_cache,
            &mut children,
        )?;

        let merged = MergingIterator::new(children, self.inner.icmp.clone());
        Ok(DbIterator::new(merged, view.sequence, view.version, stages))
    }

    /// Captures the current state as a read point.
    pub fn snapshot(&self) -> Snapshot {
        let state = self.inner.state.lock();
        Snapshot::new(
            state.versions.last_sequence(),
            state.versions.current(),
            Arc::clone(&self.inner.snapshots),
        )
    }

    /// Ends a snapshot's lease. Same as dropping it.
    pub fn release_snapshot(&self, snapshot: Snapshot) {
        drop(snapshot);
    }
}

fn visible(found: MemGet) -> Option<Vec<u8>> {
    match found {
        MemGet::Value(v) => Some(v),
        MemGet::Deleted => None,
    }
}
