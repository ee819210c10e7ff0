use std::collections::BTreeMap;
use std::sync::Arc;

use memtable::SequenceNumber;
use parking_lot::Mutex;

use crate::version::Version;

/// Sequence numbers held by live snapshots, with a count per number.
#[derive(Debug, Default)]
pub(crate) struct SnapshotList {
    held: Mutex<BTreeMap<SequenceNumber, usize>>,
}

impl SnapshotList {
    pub(crate) fn acquire(&self, seq: SequenceNumber) {
        *self.held.lock().entry(seq).or_insert(0) += 1;
    }

    fn release(&self, seq: SequenceNumber) {
        let mut held = self.held.lock();
        if let Some(count) = held.get_mut(&seq) {
            *count -= 1;
            if *count == 0 {
                held.remove(&seq);
            }
        }
    }

    /// Smallest sequence a snapshot still reads at. Compaction may not
    /// discard anything visible at this point.
    pub(crate) fn oldest(&self) -> Option<SequenceNumber> {
        self.held.lock().keys().next().copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.held.lock().values().sum()
    }
}

/// A consistent read point.
///
/// Reads given this snapshot see exactly the writes with a sequence number
/// at or below [`sequence`](Snapshot::sequence). The lease ends when the
/// snapshot is dropped or passed to
/// [`Db::release_snapshot`](crate::Db::release_snapshot).
pub struct Snapshot {
    sequence: SequenceNumber,
    _version: Arc<Version>,
    list: Arc<SnapshotList>,
}

impl Snapshot {
    pub(crate) fn new(
        sequence: SequenceNumber,
        version: Arc<Version>,
        list: Arc<SnapshotList>,
    ) -> Self {
        list.acquire(sequence);
        Self {
            sequence,
            _version: version,
            list,
        }
    }

    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.list.release(self.sequence);
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("sequence", &self.sequence)
            .finish()
    }
}
