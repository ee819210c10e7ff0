//! Atomic groups of updates.
//!
//! ```text
//! [sequence: u64 LE][count: u32 LE] then per op:
//! [kind: u8][klen: u32 LE][key][vlen: u32 LE][value]
//! ```
//!
//! The encoded batch is exactly the body of one WAL record. Ops are applied
//! in order, with consecutive sequence numbers starting at the header's.

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use memtable::{MemTable, SequenceNumber, ValueKind};

use crate::error::{Error, Result};

pub(crate) const BATCH_HEADER: usize = 12;

/// An ordered list of puts and deletes applied atomically by
/// [`Db::write`](crate::Db::write).
///
/// ```rust
/// let mut batch = engine::WriteBatch::new();
/// batch.delete(b"key1");
/// batch.put(b"key2", b"value2");
/// assert_eq!(batch.len(), 2);
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct WriteBatch {
    rep: Vec<u8>,
}

/// One operation of a batch, borrowed from its encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOp<'a> {
    Put { key: &'a [u8], value: &'a [u8] },
    Delete { key: &'a [u8] },
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteBatch {
    pub fn new() -> Self {
        Self {
            rep: vec![0u8; BATCH_HEADER],
        }
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.push(ValueKind::Value, key, value);
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.push(ValueKind::Deletion, key, &[]);
    }

    fn push(&mut self, kind: ValueKind, key: &[u8], value: &[u8]) {
        self.set_count(self.len() + 1);
        self.rep.push(kind as u8);
        self.rep.extend_from_slice(&(key.len() as u32).to_le_bytes());
        self.rep.extend_from_slice(key);
        self.rep.extend_from_slice(&(value.len() as u32).to_le_bytes());
        self.rep.extend_from_slice(value);
    }

    pub fn clear(&mut self) {
        self.rep.clear();
        self.rep.resize(BATCH_HEADER, 0);
    }

    /// Number of operations.
    pub fn len(&self) -> u32 {
        LittleEndian::read_u32(&self.rep[8..12])
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encoded size in bytes.
    pub fn approximate_size(&self) -> usize {
        self.rep.len()
    }

    /// Appends every operation of `other` after this batch's own.
    pub fn append(&mut self, other: &WriteBatch) {
        self.set_count(self.len() + other.len());
        self.rep.extend_from_slice(&other.rep[BATCH_HEADER..]);
    }

    pub fn iter(&self) -> BatchIter<'_> {
        BatchIter {
            data: &self.rep[BATCH_HEADER..],
            remaining: self.len(),
        }
    }

    pub(crate) fn sequence(&self) -> SequenceNumber {
        LittleEndian::read_u64(&self.rep[..8])
    }

    pub(crate) fn set_sequence(&mut self, seq: SequenceNumber) {
        LittleEndian::write_u64(&mut self.rep[..8], seq);
    }

    fn set_count(&mut self, n: u32) {
        LittleEndian::write_u32(&mut self.rep[8..12], n);
    }

    pub(crate) fn contents(&self) -> &[u8] {
        &self.rep
    }

    /// Wraps a WAL record body.
    pub(crate) fn from_contents(rep: &[u8]) -> Result<Self> {
        if rep.len() < BATCH_HEADER {
            return Err(Error::Corruption(format!(
                "write batch too small ({} bytes)",
                rep.len()
            )));
        }
        Ok(Self { rep: rep.to_vec() })
    }

    /// Inserts every op into `mem`, numbering them from the header's
    /// sequence.
    pub(crate) fn insert_into(&self, mem: &MemTable) -> Result<()> {
        let mut seq = self.sequence();
        let mut found = 0u32;
        for op in self.iter() {
            match op? {
                BatchOp::Put { key, value } => mem.add(seq, ValueKind::Value, key, value),
                BatchOp::Delete { key } => mem.add(seq, ValueKind::Deletion, key, &[]),
            }
            seq += 1;
            found += 1;
        }
        if found != self.len() {
            return Err(Error::Corruption("write batch has wrong count".into()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for WriteBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBatch")
            .field("sequence", &self.sequence())
            .field("count", &self.len())
            .field("bytes", &self.rep.len())
            .finish()
    }
}

/// Iterator over the operations of a [`WriteBatch`].
pub struct BatchIter<'a> {
    data: &'a [u8],
    remaining: u32,
}

impl<'a> BatchIter<'a> {
    fn read_slice(&mut self) -> Result<&'a [u8]> {
        let len = self
            .data
            .read_u32::<LittleEndian>()
            .map_err(|_| Error::Corruption("truncated write batch".into()))? as usize;
        if self.data.len() < len {
            return Err(Error::Corruption("write batch entry runs past end".into()));
        }
        let (head, rest) = self.data.split_at(len);
        self.data = rest;
        Ok(head)
    }

    fn read_op(&mut self) -> Result<BatchOp<'a>> {
        let kind = self
            .data
            .read_u8()
            .map_err(|_| Error::Corruption("truncated write batch".into()))?;
        let key = self.read_slice()?;
        let value = self.read_slice()?;
        match ValueKind::from_u8(kind) {
            Some(ValueKind::Value) => Ok(BatchOp::Put { key, value }),
            Some(ValueKind::Deletion) => Ok(BatchOp::Delete { key }),
            None => Err(Error::Corruption(format!("unknown write batch op {}", kind))),
        }
    }
}

impl<'a> Iterator for BatchIter<'a> {
    type Item = Result<BatchOp<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return if self.data.is_empty() {
                None
            } else {
                self.data = &[];
                Some(Err(Error::Corruption("trailing bytes in write batch".into())))
            };
        }
        self.remaining -= 1;
        match self.read_op() {
            Ok(op) => Some(Ok(op)),
            Err(e) => {
                self.remaining = 0;
                self.data = &[];
                Some(Err(e))
            }
        }
    }
}
