use std::sync::Arc;

use crate::block::BlockIter;
use crate::error::TableError;
use crate::format::BlockHandle;
use crate::reader::SSTableReader;

/// Two-level cursor over a table: the index block picks a data block, the
/// data block cursor walks its entries.
///
/// Moves in either direction. A failed block read leaves the cursor
/// invalid and is kept in [`status`](SSTableIterator::status); callers must
/// check it once the cursor stops being valid.
pub struct SSTableIterator {
    table: Arc<SSTableReader>,
    verify: bool,
    index_iter: BlockIter,
    data_iter: Option<BlockIter>,
    /// Handle of the block `data_iter` walks, to skip re-reading it.
    data_handle: Option<BlockHandle>,
    status: Option<TableError>,
}

impl SSTableIterator {
    pub(crate) fn new(table: Arc<SSTableReader>, verify: bool) -> Self {
        let index_iter = table.index_block().iter(table.comparator().clone());
        Self {
            table,
            verify,
            index_iter,
            data_iter: None,
            data_handle: None,
            status: None,
        }
    }

    pub fn valid(&self) -> bool {
        self.data_iter.as_ref().is_some_and(BlockIter::valid)
    }

    pub fn seek_to_first(&mut self) {
        self.index_iter.seek_to_first();
        self.load_data_block();
        if let Some(it) = &mut self.data_iter {
            it.seek_to_first();
        }
        self.skip_empty_blocks_forward();
    }

    pub fn seek_to_last(&mut self) {
        self.index_iter.seek_to_last();
        self.load_data_block();
        if let Some(it) = &mut self.data_iter {
            it.seek_to_last();
        }
        self.skip_empty_blocks_backward();
    }

    /// Positions at the first entry whose internal key is `>= target`.
    pub fn seek(&mut self, target: &[u8]) {
        self.index_iter.seek(target);
        self.load_data_block();
        if let Some(it) = &mut self.data_iter {
            it.seek(target);
        }
        self.skip_empty_blocks_forward();
    }

    pub fn next(&mut self) {
        if let Some(it) = &mut self.data_iter {
            it.next();
        }
        self.skip_empty_blocks_forward();
    }

    pub fn prev(&mut self) {
        if let Some(it) = &mut self.data_iter {
            it.prev();
        }
        self.skip_empty_blocks_backward();
    }

    pub fn key(&self) -> &[u8] {
        self.data_iter.as_ref().map_or(&[][..], BlockIter::key)
    }

    pub fn value(&self) -> &[u8] {
        self.data_iter.as_ref().map_or(&[][..], BlockIter::value)
    }

    /// First error met while reading blocks, if any.
    pub fn status(&self) -> Option<&TableError> {
        self.status.as_ref()
    }

    pub fn table(&self) -> &Arc<SSTableReader> {
        &self.table
    }

    /// Points `data_iter` at the block the index cursor names.
    fn load_data_block(&mut self) {
        if !self.index_iter.valid() {
            self.data_iter = None;
            self.data_handle = None;
            return;
        }
        let handle = match BlockHandle::decode_from(&mut self.index_iter.value()) {
            Ok(h) => h,
            Err(e) => {
                self.fail(e);
                return;
            }
        };
        if self.data_iter.is_some() && self.data_handle == Some(handle) {
            return;
        }
        match self.table.read_block(&handle, self.verify) {
            Ok(block) => {
                self.data_iter = Some(block.iter(self.table.comparator().clone()));
                self.data_handle = Some(handle);
            }
            Err(e) => self.fail(e),
        }
    }

    fn fail(&mut self, e: TableError) {
        self.data_iter = None;
        self.data_handle = None;
        if self.status.is_none() {
            self.status = Some(e);
        }
    }

    fn skip_empty_blocks_forward(&mut self) {
        while !self.valid() {
            if self.status.is_some() || !self.index_iter.valid() {
                self.data_iter = None;
                return;
            }
            self.index_iter.next();
            self.load_data_block();
            if let Some(it) = &mut self.data_iter {
                it.seek_to_first();
            }
        }
    }

    fn skip_empty_blocks_backward(&mut self) {
        while !self.valid() {
            if self.status.is_some() || !self.index_iter.valid() {
                self.data_iter = None;
                return;
            }
            self.index_iter.prev();
            self.load_data_block();
            if let Some(it) = &mut self.data_iter {
                it.seek_to_last();
            }
        }
    }
}
