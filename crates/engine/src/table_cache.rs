//! Shared cache of open table readers.
//!
//! Readers are keyed by file number and handed out as `Arc`s, so a reader
//! stays usable for as long as an iterator holds it even after eviction.
//! The budget counts open tables; an entry that is still borrowed is never
//! evicted, which means the cache can sit above its budget for a while.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use config::Options;
use lru::LruCache;
use memtable::{InternalKeyComparator, LookupKey, ValueKind};
use parking_lot::Mutex;
use sstable::{SSTableIterator, SSTableReader};

use crate::error::{Error, Result};
use crate::filename;

pub(crate) struct TableCache {
    db_path: PathBuf,
    icmp: InternalKeyComparator,
    capacity: usize,
    paranoid: bool,
    cache: Mutex<LruCache<u64, Arc<SSTableReader>>>,
}

impl TableCache {
    pub(crate) fn new(db_path: &Path, options: &Options, icmp: InternalKeyComparator) -> Self {
        Self {
            db_path: db_path.to_path_buf(),
            icmp,
            capacity: options.table_cache_capacity.max(1),
            paranoid: options.paranoid_checks,
            cache: Mutex::new(LruCache::unbounded()),
        }
    }

    /// Returns the reader for table `number`, opening it on a miss.
    ///
    /// The file is opened without holding the cache lock. Open failures are
    /// returned and never cached, so a later call retries.
    pub(crate) fn get_table(
        &self,
        number: u64,
        file_size: u64,
        fill_cache: bool,
    ) -> Result<Arc<SSTableReader>> {
        if let Some(table) = self.cache.lock().get(&number) {
            return Ok(Arc::clone(table));
        }

        let path = filename::table_file_path(&self.db_path, number);
        let table = match SSTableReader::open(&path, number, self.icmp.clone(), self.paranoid) {
            Ok(t) => Arc::new(t),
            Err(e) => {
                tracing::warn!(file = number, error = %e, "failed to open table");
                return Err(e.into());
            }
        };
        if table.file_size() != file_size {
            return Err(Error::Corruption(format!(
                "table {} is {} bytes, manifest says {}",
                number,
                table.file_size(),
                file_size
            )));
        }

        if !fill_cache {
            return Ok(table);
        }
        let mut cache = self.cache.lock();
        // Another reader may have opened the same table meanwhile.
        if let Some(existing) = cache.get(&number) {
            return Ok(Arc::clone(existing));
        }
        cache.put(number, Arc::clone(&table));
        self.evict_excess(&mut cache);
        Ok(table)
    }

    fn evict_excess(&self, cache: &mut LruCache<u64, Arc<SSTableReader>>) {
        while cache.len() > self.capacity {
            // Least recently used first; skip readers somebody still holds.
            let victim = cache
                .iter()
                .rev()
                .find(|(_, t)| Arc::strong_count(t) == 1)
                .map(|(n, _)| *n);
            match victim {
                Some(n) => {
                    cache.pop(&n);
                }
                None => break,
            }
        }
    }

    pub(crate) fn get(
        &self,
        number: u64,
        file_size: u64,
        key: &LookupKey,
        verify: bool,
        fill_cache: bool,
    ) -> Result<Option<(ValueKind, Vec<u8>)>> {
        let table = self.get_table(number, file_size, fill_cache)?;
        Ok(table.get(key, verify)?)
    }

    pub(crate) fn iter(
        &self,
        number: u64,
        file_size: u64,
        verify: bool,
        fill_cache: bool,
    ) -> Result<SSTableIterator> {
        let table = self.get_table(number, file_size, fill_cache)?;
        Ok(table.iter(verify))
    }

    /// Drops the cached reader of a table that is being deleted.
    pub(crate) fn evict(&self, number: u64) {
        self.cache.lock().pop(&number);
    }

    pub(crate) fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub(crate) fn comparator(&self) -> &InternalKeyComparator {
        &self.icmp
    }
}
