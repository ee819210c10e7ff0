//! Write path: `put()`, `delete()`, `write()`, `force_flush()`.
//!
//! Writers queue up under the state lock. The writer at the front of the
//! queue is the leader: it makes room in the mutable stage, folds the
//! batches queued behind it into one group, appends that group to the log
//! as a single record with the lock released, inserts it into the stage
//! and finally publishes the new last sequence. Every writer in the group
//! is released with the leader's status.
//!
//! ```text
//! Idle -> Batching (leader builds group) -> LogWriting -> Applying -> Idle
//! ```

use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use std::time::Duration;

use config::WriteOptions;
use memtable::{MemTable, MAX_SEQUENCE_NUMBER};
use parking_lot::MutexGuard;
use wal::WalWriter;

use crate::batch::WriteBatch;
use crate::error::{Error, Result};
use crate::{filename, Db, DbInner, DbState, MAX_KEY_SIZE, MAX_VALUE_SIZE};

/// A writer waiting in the queue.
pub(crate) struct PendingWrite {
    id: u64,
    /// Taken by the leader that commits it.
    batch: Option<WriteBatch>,
    sync: bool,
    /// Freeze the stage even if it has room; carries no batch.
    rotate: bool,
}

impl Db {
    /// Sets `key` to `value`.
    pub fn put(&self, opts: &WriteOptions, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(opts, batch)
    }

    /// Removes `key`. Deleting a missing key is not an error.
    pub fn delete(&self, opts: &WriteOptions, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(opts, batch)
    }

    /// Applies every operation of `batch` atomically and in order.
    ///
    /// With `opts.sync` the log is fsynced before this returns; otherwise
    /// a crash may lose the write but never part of it.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for oversized keys or values, otherwise the log
    /// error of the group this write was committed with, or the latched
    /// background error.
    pub fn write(&self, opts: &WriteOptions, batch: WriteBatch) -> Result<()> {
        for op in batch.iter() {
            let (key, value) = match op? {
                crate::BatchOp::Put { key, value } => (key, value),
                crate::BatchOp::Delete { key } => (key, &[][..]),
            };
            if key.len() > MAX_KEY_SIZE {
                return Err(Error::InvalidArgument(format!(
                    "key too large: {} bytes (max {})",
                    key.len(),
                    MAX_KEY_SIZE
                )));
            }
            if value.len() > MAX_VALUE_SIZE {
                return Err(Error::InvalidArgument(format!(
                    "value too large: {} bytes (max {})",
                    value.len(),
                    MAX_VALUE_SIZE
                )));
            }
        }
        self.inner.write(opts.sync, Some(batch))
    }

    /// Freezes the mutable stage, even a small one, and waits until it has
    /// been written to a table.
    pub fn force_flush(&self) -> Result<()> {
        self.inner.force_flush()
    }
}

impl DbInner {
    /// Queues a write and returns once a leader has committed it.
    /// `batch == None` asks for a stage rotation instead.
    pub(crate) fn write(&self, sync: bool, batch: Option<WriteBatch>) -> Result<()> {
        let mut state = self.state.lock();
        let id = state.next_writer_id;
        state.next_writer_id += 1;
        let rotate = batch.is_none();
        state.writers.push_back(PendingWrite {
            id,
            batch,
            sync,
            rotate,
        });

        loop {
            if let Some(result) = state.completed.remove(&id) {
                return result;
            }
            if state.writers.front().map(|w| w.id) == Some(id) {
                break;
            }
            self.writers_cv.wait(&mut state);
        }

        // Leader from here on.
        let mut result = self.make_room_for_write(&mut state, rotate);
        let mut last_id = id;
        if result.is_ok() && !rotate {
            let (group, group_last, group_sync) = self.build_batch_group(&mut state);
            last_id = group_last;
            result = self.commit_group(&mut state, group, group_sync);
        }

        while let Some(w) = state.writers.pop_front() {
            if w.id != id {
                state.completed.insert(w.id, result.clone());
            }
            if w.id == last_id {
                break;
            }
        }
        self.writers_cv.notify_all();
        result
    }

    /// Merges the leader's batch with the ones queued behind it.
    fn build_batch_group(&self, state: &mut DbState) -> (WriteBatch, u64, bool) {
        let front = &mut state.writers[0];
        let leader_sync = front.sync;
        let mut last_id = front.id;
        let mut group = front.batch.take().unwrap_or_default();

        // Keep small writes fast: a tiny leader does not wait for a full
        // group's worth of followers.
        let max = self.options.max_write_group_bytes;
        let size = group.approximate_size();
        let max_size = if size <= max / 8 { size + max / 8 } else { max };

        for w in state.writers.iter_mut().skip(1) {
            if w.rotate || (w.sync && !leader_sync) {
                break;
            }
            let Some(batch) = w.batch.as_ref() else { break };
            if group.approximate_size() + batch.approximate_size() > max_size {
                break;
            }
            group.append(batch);
            w.batch = None;
            last_id = w.id;
        }
        (group, last_id, leader_sync)
    }

    /// Logs and applies one group.
    fn commit_group(
        &self,
        state: &mut MutexGuard<'_, DbState>,
        mut group: WriteBatch,
        sync: bool,
    ) -> Result<()> {
        let last = state.versions.last_sequence();
        let count = u64::from(group.len());
        if last + count > MAX_SEQUENCE_NUMBER {
            return Err(Error::InvalidArgument("sequence numbers exhausted".into()));
        }
        group.set_sequence(last + 1);

        let Some(mut log) = state.log.take() else {
            return Err(Error::Closed);
        };
        let mem = Arc::clone(&state.mem);
        let result = MutexGuard::unlocked(state, || -> Result<()> {
            log.append(group.contents())?;
            if sync {
                log.sync()?;
            }
            group.insert_into(&mem)
        });
        state.log = Some(log);

        match result {
            Ok(()) => {
                state.versions.set_last_sequence(last + count);
                Ok(())
            }
            Err(e) => {
                self.record_background_error(state, e.clone());
                Err(e)
            }
        }
    }

    /// Ensures the mutable stage can take more writes, rotating it into the
    /// frozen slot when full (or when `force` is set).
    fn make_room_for_write(&self, state: &mut MutexGuard<'_, DbState>, mut force: bool) -> Result<()> {
        let mut allow_delay = !force;
        loop {
            if let Some(e) = &state.bg_error {
                return Err(e.clone());
            }
            if state.shutting_down {
                return Err(Error::Closed);
            }
            let l0 = state.versions.current().num_files(0);

            if allow_delay && l0 >= self.options.l0_slowdown_writes_trigger {
                // Hand the worker some CPU instead of stalling one write for
                // seconds later on.
                MutexGuard::unlocked(state, || std::thread::sleep(Duration::from_millis(1)));
                allow_delay = false;
            } else if !force
                && state.mem.approximate_memory_usage() <= self.options.write_buffer_size
            {
                return Ok(());
            } else if state.imm.is_some() {
                tracing::debug!("mutable stage full, waiting for flush");
                self.done_cv.wait(state);
            } else if l0 >= self.options.l0_stop_writes_trigger {
                tracing::warn!(l0_files = l0, "too many L0 tables, writes stalled");
                self.done_cv.wait(state);
            } else {
                self.switch_memtable(state)?;
                force = false;
            }
        }
    }

    /// Starts a new log, freezes the stage and wakes the worker.
    fn switch_memtable(&self, state: &mut MutexGuard<'_, DbState>) -> Result<()> {
        let number = state.versions.new_file_number();
        let log = match WalWriter::create(filename::log_file_path(&self.path, number), false) {
            Ok(log) => log,
            Err(e) => {
                state.versions.reuse_file_number(number);
                return Err(e.into());
            }
        };
        if let Some(mut old) = state.log.replace(log) {
            // Buffered bytes of the old log must reach the file.
            old.sync()?;
        }
        state.log_number = number;
        let fresh = Arc::new(MemTable::new(self.icmp.clone()));
        let frozen = std::mem::replace(&mut state.mem, fresh);
        tracing::debug!(
            log = number,
            entries = frozen.len(),
            bytes = frozen.approximate_memory_usage(),
            "froze mutable stage"
        );
        state.imm = Some(frozen);
        self.has_imm.store(true, AtomicOrdering::Release);
        self.bg_cv.notify_one();
        Ok(())
    }

    pub(crate) fn force_flush(&self) -> Result<()> {
        {
            let state = self.state.lock();
            if state.mem.is_empty() {
                drop(state);
                return self.wait_for_flush();
            }
        }
        self.write(false, None)?;
        self.wait_for_flush()
    }

    /// Blocks until no frozen stage is pending.
    fn wait_for_flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        while state.imm.is_some() {
            if let Some(e) = &state.bg_error {
                return Err(e.clone());
            }
            if state.shutting_down {
                return Err(Error::Closed);
            }
            self.done_cv.wait(&mut state);
        }
        match &state.bg_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}
