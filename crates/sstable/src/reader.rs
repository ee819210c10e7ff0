use std::cmp::Ordering;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bloom::BloomFilter;
use crc32fast::Hasher as Crc32;
use memtable::{parse_internal_key, InternalKeyComparator, LookupKey, ValueKind};
use parking_lot::Mutex;

use crate::block::Block;
use crate::error::{corruption, Result};
use crate::format::{
    decode_properties, BlockHandle, Footer, TableSummary, BLOCK_TRAILER_BYTES, FOOTER_BYTES,
};
use crate::iter::SSTableIterator;

/// An open table file.
///
/// On [`open`](SSTableReader::open) the footer, properties, index block and
/// filter are read and kept in memory; data blocks are read on demand
/// through one persistent file handle behind a [`Mutex`], so `get` and any
/// number of iterators can share a reader through `&self` / `Arc`.
pub struct SSTableReader {
    path: PathBuf,
    file: Mutex<File>,
    icmp: InternalKeyComparator,
    index: Arc<Block>,
    filter: Option<BloomFilter>,
    summary: TableSummary,
    /// Check data block checksums on every read, not only when asked.
    paranoid: bool,
}

impl SSTableReader {
    /// Opens table `number` at `path`.
    ///
    /// Footer, properties, filter and index are always checksum-verified.
    /// With `paranoid` set, data blocks are verified on every read as well.
    ///
    /// # Errors
    ///
    /// `TableError::Corruption` for a bad magic, version, handle or
    /// checksum, `TableError::Io` if the file cannot be read.
    pub fn open<P: AsRef<Path>>(
        path: P,
        number: u64,
        icmp: InternalKeyComparator,
        paranoid: bool,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        let file_size = file.metadata()?.len();

        if file_size < FOOTER_BYTES as u64 {
            return Err(corruption(format!(
                "table {} too small ({} bytes)",
                number, file_size
            )));
        }
        file.seek(SeekFrom::End(-(FOOTER_BYTES as i64)))?;
        let mut footer_buf = vec![0u8; FOOTER_BYTES];
        file.read_exact(&mut footer_buf)?;
        let footer = Footer::decode(&footer_buf)?;

        let body_end = file_size - FOOTER_BYTES as u64;
        let check = |h: &BlockHandle, what: &str| -> Result<()> {
            let end = h
                .offset
                .saturating_add(h.size)
                .saturating_add(BLOCK_TRAILER_BYTES as u64);
            if end > body_end {
                return Err(corruption(format!(
                    "{} handle of table {} points past the data",
                    what, number
                )));
            }
            Ok(())
        };
        check(&footer.index, "index")?;
        check(&footer.properties, "properties")?;
        if let Some(h) = &footer.filter {
            check(h, "filter")?;
        }

        let index = Arc::new(Block::new(read_raw_block(&mut file, &footer.index, true)?)?);
        let properties = read_raw_block(&mut file, &footer.properties, true)?;
        let summary = decode_properties(&properties, file_size)?;
        if summary.number != number {
            return Err(corruption(format!(
                "table file {} claims to be table {}",
                number, summary.number
            )));
        }
        let filter = match &footer.filter {
            Some(h) => {
                let raw = read_raw_block(&mut file, h, true)?;
                Some(
                    BloomFilter::from_bytes(&raw)
                        .ok_or_else(|| corruption("undersized filter block"))?,
                )
            }
            None => None,
        };

        tracing::debug!(file = number, entries = summary.entries, "table opened");
        Ok(Self {
            path,
            file: Mutex::new(file),
            icmp,
            index,
            filter,
            summary,
            paranoid,
        })
    }

    /// Reads and decodes the data block at `handle`.
    pub(crate) fn read_block(&self, handle: &BlockHandle, verify: bool) -> Result<Arc<Block>> {
        let raw = {
            let mut f = self.file.lock();
            read_raw_block(&mut f, handle, verify || self.paranoid)?
        };
        match Block::new(raw) {
            Ok(block) => Ok(Arc::new(block)),
            Err(e) => {
                tracing::error!(file = self.summary.number, offset = handle.offset, error = %e, "bad data block");
                Err(e)
            }
        }
    }

    /// Newest entry for the lookup's user key at or below its sequence.
    ///
    /// Returns `Ok(None)` if the table holds no visible version of the key.
    /// The filter is consulted first; a negative answer costs no I/O.
    pub fn get(&self, key: &LookupKey, verify: bool) -> Result<Option<(ValueKind, Vec<u8>)>> {
        if let Some(bf) = &self.filter {
            if !bf.may_contain(key.user_key()) {
                return Ok(None);
            }
        }

        let target = key.internal_key();
        let mut index_iter = self.index.iter(self.icmp.clone());
        index_iter.seek(target);
        if !index_iter.valid() {
            return Ok(None);
        }
        let handle = BlockHandle::decode_from(&mut index_iter.value())?;
        let block = self.read_block(&handle, verify)?;

        let mut it = block.iter(self.icmp.clone());
        it.seek(target);
        if !it.valid() {
            return Ok(None);
        }
        let parsed = parse_internal_key(it.key())
            .ok_or_else(|| corruption(format!("bad internal key in table {}", self.number())))?;
        if self.icmp.compare_user(parsed.user_key, key.user_key()) != Ordering::Equal {
            return Ok(None);
        }
        Ok(Some((parsed.kind, it.value().to_vec())))
    }

    /// A cursor over every entry; keeps this reader alive.
    pub fn iter(self: &Arc<Self>, verify: bool) -> SSTableIterator {
        SSTableIterator::new(Arc::clone(self), verify)
    }

    pub(crate) fn index_block(&self) -> &Arc<Block> {
        &self.index
    }

    pub fn comparator(&self) -> &InternalKeyComparator {
        &self.icmp
    }

    pub fn summary(&self) -> &TableSummary {
        &self.summary
    }

    pub fn number(&self) -> u64 {
        self.summary.number
    }

    pub fn file_size(&self) -> u64 {
        self.summary.file_size
    }

    pub fn has_filter(&self) -> bool {
        self.filter.is_some()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for SSTableReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SSTableReader")
            .field("number", &self.summary.number)
            .field("entries", &self.summary.entries)
            .field("file_size", &self.summary.file_size)
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

/// Reads the body at `handle`, checking its CRC trailer when `verify`.
fn read_raw_block(file: &mut File, handle: &BlockHandle, verify: bool) -> Result<Vec<u8>> {
    let len = usize::try_from(handle.size)
        .map_err(|_| corruption(format!("block size {} out of range", handle.size)))?;
    let mut buf = vec![0u8; len + BLOCK_TRAILER_BYTES];
    file.seek(SeekFrom::Start(handle.offset))?;
    file.read_exact(&mut buf)?;

    let mut trailer = [0u8; BLOCK_TRAILER_BYTES];
    trailer.copy_from_slice(&buf[len..]);
    buf.truncate(len);
    if verify {
        let stored = u32::from_le_bytes(trailer);
        let mut hasher = Crc32::new();
        hasher.update(&buf);
        let actual = hasher.finalize();
        if actual != stored {
            return Err(corruption(format!(
                "block checksum mismatch at offset {}: expected {:#010x}, got {:#010x}",
                handle.offset, stored, actual
            )));
        }
    }
    Ok(buf)
}
