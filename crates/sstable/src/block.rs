//! Sorted key/value blocks, used for both data and index blocks.
//!
//! ```text
//! [entry 0] ... [entry n-1] [offset 0: u32] ... [offset n-1: u32] [count: u32]
//! entry = [klen: u32][key][vlen: u32][value]
//! ```
//!
//! Keys are encoded internal keys. The offset array allows binary search
//! without decoding every entry.

use std::cmp::Ordering;
use std::ops::Range;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use memtable::InternalKeyComparator;

use crate::error::{corruption, Result};

/// Accumulates sorted entries into one encoded block.
#[derive(Debug, Default)]
pub struct BlockBuilder {
    buf: Vec<u8>,
    offsets: Vec<u32>,
    last_key: Vec<u8>,
}

impl BlockBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry; keys must arrive in increasing order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        self.offsets.push(self.buf.len() as u32);
        self.buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(key);
        self.buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(value);
        self.last_key.clear();
        self.last_key.extend_from_slice(key);
    }

    /// Size of the block if it were finished now.
    pub fn estimated_size(&self) -> usize {
        self.buf.len() + self.offsets.len() * 4 + 4
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn last_key(&self) -> &[u8] {
        &self.last_key
    }

    /// Returns the encoded block and resets the builder.
    pub fn finish(&mut self) -> Vec<u8> {
        let mut out = std::mem::take(&mut self.buf);
        out.reserve(self.offsets.len() * 4 + 4);
        for off in &self.offsets {
            out.extend_from_slice(&off.to_le_bytes());
        }
        out.extend_from_slice(&(self.offsets.len() as u32).to_le_bytes());
        self.offsets.clear();
        self.last_key.clear();
        out
    }
}

/// A decoded, validated block.
///
/// Every entry's bounds are checked once at construction, so iteration
/// afterwards cannot fail.
pub struct Block {
    data: Vec<u8>,
    entries: Vec<(Range<usize>, Range<usize>)>,
}

impl Block {
    pub fn new(data: Vec<u8>) -> Result<Self> {
        if data.len() < 4 {
            return Err(corruption("block too short"));
        }
        let count = LittleEndian::read_u32(&data[data.len() - 4..]) as usize;
        let offsets_start = data
            .len()
            .checked_sub(4 + count.saturating_mul(4))
            .ok_or_else(|| corruption(format!("block claims {} entries", count)))?;

        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let at = offsets_start + i * 4;
            let off = LittleEndian::read_u32(&data[at..at + 4]) as usize;
            entries.push(Self::entry_bounds(&data[..offsets_start], off)?);
        }
        Ok(Self { data, entries })
    }

    fn entry_bounds(body: &[u8], off: usize) -> Result<(Range<usize>, Range<usize>)> {
        let read_len = |at: usize| -> Result<usize> {
            body.get(at..at + 4)
                .map(|b| LittleEndian::read_u32(b) as usize)
                .ok_or_else(|| corruption(format!("entry at {} runs past block end", off)))
        };
        let klen = read_len(off)?;
        let key = off + 4..off + 4 + klen;
        let vlen = read_len(key.end)?;
        let value = key.end + 4..key.end + 4 + vlen;
        if value.end > body.len() {
            return Err(corruption(format!("entry at {} runs past block end", off)));
        }
        Ok((key, value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn key(&self, i: usize) -> &[u8] {
        &self.data[self.entries[i].0.clone()]
    }

    fn value(&self, i: usize) -> &[u8] {
        &self.data[self.entries[i].1.clone()]
    }

    /// Index of the first entry whose key is `>= target`, or `len()`.
    fn lower_bound(&self, target: &[u8], icmp: &InternalKeyComparator) -> usize {
        let (mut lo, mut hi) = (0, self.entries.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if icmp.compare(self.key(mid), target) == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    pub fn iter(self: &Arc<Self>, icmp: InternalKeyComparator) -> BlockIter {
        BlockIter {
            block: Arc::clone(self),
            icmp,
            pos: self.entries.len(),
        }
    }
}

/// Bidirectional cursor over one [`Block`]. `pos == len` means invalid.
pub struct BlockIter {
    block: Arc<Block>,
    icmp: InternalKeyComparator,
    pos: usize,
}

impl BlockIter {
    pub fn valid(&self) -> bool {
        self.pos < self.block.len()
    }

    pub fn seek_to_first(&mut self) {
        self.pos = 0;
    }

    pub fn seek_to_last(&mut self) {
        self.pos = if self.block.is_empty() { 0 } else { self.block.len() - 1 };
    }

    pub fn seek(&mut self, target: &[u8]) {
        self.pos = self.block.lower_bound(target, &self.icmp);
    }

    pub fn next(&mut self) {
        if self.valid() {
            self.pos += 1;
        }
    }

    pub fn prev(&mut self) {
        self.pos = if self.pos == 0 || !self.valid() {
            self.block.len()
        } else {
            self.pos - 1
        };
    }

    pub fn key(&self) -> &[u8] {
        if self.valid() {
            self.block.key(self.pos)
        } else {
            &[]
        }
    }

    pub fn value(&self) -> &[u8] {
        if self.valid() {
            self.block.value(self.pos)
        } else {
            &[]
        }
    }
}
