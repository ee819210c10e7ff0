use std::cmp::Ordering;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use bloom::{bloom_hash, BloomFilter};
use config::Options;
use crc32fast::Hasher as Crc32;
use memtable::{parse_internal_key, InternalKey, InternalKeyComparator};

use crate::block::BlockBuilder;
use crate::error::{Result, TableError};
use crate::format::{encode_properties, BlockHandle, Footer, TableSummary};

/// Streams sorted entries into a new table file.
///
/// Entries are written to `<path>.tmp`; [`finish`](SSTableWriter::finish)
/// fsyncs the file, renames it into place and fsyncs the directory, so a
/// crash leaves either no table or a complete one. A leftover `.tmp` file is
/// removed by the engine on the next open.
///
/// ```text
/// [data block][crc] ... [filter block][crc] [properties][crc] [index][crc] [footer]
/// ```
pub struct SSTableWriter {
    path: PathBuf,
    tmp_path: PathBuf,
    number: u64,
    file: BufWriter<File>,
    /// Bytes written to `file` so far.
    offset: u64,
    icmp: InternalKeyComparator,
    block_size: usize,
    bits_per_key: Option<usize>,
    data_block: BlockBuilder,
    index_block: BlockBuilder,
    /// One hash per distinct user key, for the filter.
    key_hashes: Vec<u64>,
    smallest: Vec<u8>,
    last_key: Vec<u8>,
    entries: u64,
    max_seq: u64,
}

impl SSTableWriter {
    /// Starts a table at `path` that will carry file number `number`.
    pub fn create<P: AsRef<Path>>(path: P, number: u64, opts: &Options) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let tmp_path = path.with_extension("sst.tmp");
        let raw = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        Ok(Self {
            path,
            tmp_path,
            number,
            file: BufWriter::new(raw),
            offset: 0,
            icmp: InternalKeyComparator::new(opts.comparator.clone()),
            block_size: opts.block_size,
            bits_per_key: opts.bloom_bits_per_key,
            data_block: BlockBuilder::new(),
            index_block: BlockBuilder::new(),
            key_hashes: Vec::new(),
            smallest: Vec::new(),
            last_key: Vec::new(),
            entries: 0,
            max_seq: 0,
        })
    }

    /// Appends an entry. Internal keys must be strictly increasing.
    pub fn add(&mut self, ikey: &[u8], value: &[u8]) -> Result<()> {
        let parsed = parse_internal_key(ikey)
            .ok_or_else(|| TableError::InvalidArgument("malformed internal key".into()))?;

        if self.entries > 0 {
            if self.icmp.compare(ikey, &self.last_key) != Ordering::Greater {
                return Err(TableError::InvalidArgument(format!(
                    "keys out of order: {:?} after {:?}",
                    InternalKey::decode_from(ikey),
                    InternalKey::decode_from(&self.last_key)
                )));
            }
            let prev_user = memtable::extract_user_key(&self.last_key);
            if self.icmp.compare_user(prev_user, parsed.user_key) != Ordering::Equal {
                self.key_hashes.push(bloom_hash(parsed.user_key));
            }
        } else {
            self.smallest = ikey.to_vec();
            self.key_hashes.push(bloom_hash(parsed.user_key));
        }

        self.max_seq = self.max_seq.max(parsed.sequence);
        self.entries += 1;
        self.last_key.clear();
        self.last_key.extend_from_slice(ikey);

        self.data_block.add(ikey, value);
        if self.data_block.estimated_size() >= self.block_size {
            self.flush_data_block()?;
        }
        Ok(())
    }

    /// Bytes the file would occupy if finished now (footer aside).
    pub fn estimated_size(&self) -> u64 {
        self.offset + self.data_block.estimated_size() as u64
    }

    pub fn entries(&self) -> u64 {
        self.entries
    }

    /// Completes the table and moves it into place.
    ///
    /// # Errors
    ///
    /// Refuses to write a table with no entries; the temp file is removed in
    /// that case and on any I/O failure.
    pub fn finish(mut self) -> Result<TableSummary> {
        if self.entries == 0 {
            self.abandon();
            return Err(TableError::InvalidArgument(
                "refusing to write an empty table".into(),
            ));
        }
        match self.write_trailer() {
            Ok(summary) => Ok(summary),
            Err(e) => {
                self.abandon();
                Err(e)
            }
        }
    }

    /// Drops the partial table and its temp file.
    pub fn abandon(self) {
        let tmp = self.tmp_path.clone();
        drop(self.file);
        if let Err(e) = fs::remove_file(&tmp) {
            tracing::warn!(path = %tmp.display(), error = %e, "could not remove partial table");
        }
    }

    fn write_trailer(&mut self) -> Result<TableSummary> {
        self.flush_data_block()?;

        let filter = match self.bits_per_key {
            Some(bpk) if !self.key_hashes.is_empty() => {
                let bf = BloomFilter::build(&self.key_hashes, bpk);
                Some(self.write_block(&bf.to_bytes())?)
            }
            _ => None,
        };

        let mut summary = TableSummary {
            number: self.number,
            file_size: 0,
            entries: self.entries,
            smallest: InternalKey::decode_from(&self.smallest),
            largest: InternalKey::decode_from(&self.last_key),
            max_seq: self.max_seq,
        };
        let properties = self.write_block(&encode_properties(&summary))?;

        let index_bytes = self.index_block.finish();
        let index = self.write_block(&index_bytes)?;

        let footer = Footer {
            filter,
            properties,
            index,
        };
        let footer_bytes = footer.encode();
        self.file.write_all(&footer_bytes)?;
        self.offset += footer_bytes.len() as u64;

        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        fs::rename(&self.tmp_path, &self.path)?;

        // The rename is only durable once the directory entry is.
        if let Some(parent) = self.path.parent() {
            if let Err(e) = File::open(parent).and_then(|dir| dir.sync_all()) {
                tracing::warn!(dir = %parent.display(), error = %e, "table directory sync failed");
            }
        }

        summary.file_size = self.offset;
        tracing::debug!(
            file = self.number,
            entries = self.entries,
            bytes = self.offset,
            "table written"
        );
        Ok(summary)
    }

    fn flush_data_block(&mut self) -> Result<()> {
        if self.data_block.is_empty() {
            return Ok(());
        }
        let last_key = self.data_block.last_key().to_vec();
        let bytes = self.data_block.finish();
        let handle = self.write_block(&bytes)?;
        self.index_block.add(&last_key, &handle.encode());
        Ok(())
    }

    /// Writes `body` plus its CRC trailer; returns the body's handle.
    fn write_block(&mut self, body: &[u8]) -> Result<BlockHandle> {
        let mut hasher = Crc32::new();
        hasher.update(body);
        let crc = hasher.finalize();

        let handle = BlockHandle::new(self.offset, body.len() as u64);
        self.file.write_all(body)?;
        self.file.write_all(&crc.to_le_bytes())?;
        self.offset += body.len() as u64 + 4;
        Ok(handle)
    }
}
