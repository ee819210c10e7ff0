//! Deltas between two versions, as stored in the manifest.
//!
//! An edit is a sequence of tagged fields:
//!
//! ```text
//! COMPARATOR       [len u32][name]
//! LOG_NUMBER       [u64]
//! NEXT_FILE        [u64]
//! LAST_SEQUENCE    [u64]
//! COMPACT_POINTER  [level u32][len u32][internal key]
//! DELETED_FILE     [level u32][number u64]
//! NEW_FILE         [level u32][number u64][size u64][len u32][smallest][len u32][largest]
//! ```
//!
//! Integers are little-endian. Unknown tags are corruption.

use std::collections::BTreeSet;
use std::io::Read;

use byteorder::{LittleEndian, ReadBytesExt};
use memtable::{InternalKey, SequenceNumber};

use crate::error::{Error, Result};

const COMPARATOR: u8 = 0x01;
const LOG_NUMBER: u8 = 0x02;
const NEXT_FILE: u8 = 0x03;
const LAST_SEQUENCE: u8 = 0x04;
const COMPACT_POINTER: u8 = 0x05;
const DELETED_FILE: u8 = 0x06;
const NEW_FILE: u8 = 0x07;

/// A table file as the manifest knows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetaData {
    pub number: u64,
    pub file_size: u64,
    pub smallest: InternalKey,
    pub largest: InternalKey,
}

impl From<sstable::TableSummary> for FileMetaData {
    fn from(s: sstable::TableSummary) -> Self {
        Self {
            number: s.number,
            file_size: s.file_size,
            smallest: s.smallest,
            largest: s.largest,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionEdit {
    pub(crate) comparator: Option<String>,
    pub(crate) log_number: Option<u64>,
    pub(crate) next_file_number: Option<u64>,
    pub(crate) last_sequence: Option<SequenceNumber>,
    pub(crate) compact_pointers: Vec<(usize, InternalKey)>,
    pub(crate) deleted_files: BTreeSet<(usize, u64)>,
    pub(crate) new_files: Vec<(usize, FileMetaData)>,
}

impl VersionEdit {
    pub fn set_comparator_name(&mut self, name: &str) {
        self.comparator = Some(name.to_string());
    }

    pub fn set_log_number(&mut self, n: u64) {
        self.log_number = Some(n);
    }

    pub fn set_next_file_number(&mut self, n: u64) {
        self.next_file_number = Some(n);
    }

    pub fn set_last_sequence(&mut self, seq: SequenceNumber) {
        self.last_sequence = Some(seq);
    }

    pub fn set_compact_pointer(&mut self, level: usize, key: InternalKey) {
        self.compact_pointers.push((level, key));
    }

    pub fn add_file(&mut self, level: usize, meta: FileMetaData) {
        self.new_files.push((level, meta));
    }

    pub fn delete_file(&mut self, level: usize, number: u64) {
        self.deleted_files.insert((level, number));
    }

    pub fn new_files(&self) -> &[(usize, FileMetaData)] {
        &self.new_files
    }

    pub fn deleted_files(&self) -> &BTreeSet<(usize, u64)> {
        &self.deleted_files
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        if let Some(name) = &self.comparator {
            buf.push(COMPARATOR);
            put_bytes(&mut buf, name.as_bytes());
        }
        if let Some(n) = self.log_number {
            buf.push(LOG_NUMBER);
            put_u64(&mut buf, n);
        }
        if let Some(n) = self.next_file_number {
            buf.push(NEXT_FILE);
            put_u64(&mut buf, n);
        }
        if let Some(n) = self.last_sequence {
            buf.push(LAST_SEQUENCE);
            put_u64(&mut buf, n);
        }
        for (level, key) in &self.compact_pointers {
            buf.push(COMPACT_POINTER);
            put_u32(&mut buf, *level as u32);
            put_bytes(&mut buf, key.encoded());
        }
        for (level, number) in &self.deleted_files {
            buf.push(DELETED_FILE);
            put_u32(&mut buf, *level as u32);
            put_u64(&mut buf, *number);
        }
        for (level, f) in &self.new_files {
            buf.push(NEW_FILE);
            put_u32(&mut buf, *level as u32);
            put_u64(&mut buf, f.number);
            put_u64(&mut buf, f.file_size);
            put_bytes(&mut buf, f.smallest.encoded());
            put_bytes(&mut buf, f.largest.encoded());
        }
        buf
    }

    pub fn decode(mut data: &[u8]) -> Result<Self> {
        let mut edit = VersionEdit::default();
        let rdr = &mut data;
        while !rdr.is_empty() {
            let tag = rdr.read_u8().map_err(truncated)?;
            match tag {
                COMPARATOR => {
                    let name = read_bytes(rdr)?;
                    let name = String::from_utf8(name)
                        .map_err(|_| Error::Corruption("comparator name is not utf-8".into()))?;
                    edit.comparator = Some(name);
                }
                LOG_NUMBER => edit.log_number = Some(rdr.read_u64::<LittleEndian>().map_err(truncated)?),
                NEXT_FILE => {
                    edit.next_file_number = Some(rdr.read_u64::<LittleEndian>().map_err(truncated)?)
                }
                LAST_SEQUENCE => {
                    edit.last_sequence = Some(rdr.read_u64::<LittleEndian>().map_err(truncated)?)
                }
                COMPACT_POINTER => {
                    let level = read_level(rdr)?;
                    let key = read_internal_key(rdr)?;
                    edit.compact_pointers.push((level, key));
                }
                DELETED_FILE => {
                    let level = read_level(rdr)?;
                    let number = rdr.read_u64::<LittleEndian>().map_err(truncated)?;
                    edit.deleted_files.insert((level, number));
                }
                NEW_FILE => {
                    let level = read_level(rdr)?;
                    let number = rdr.read_u64::<LittleEndian>().map_err(truncated)?;
                    let file_size = rdr.read_u64::<LittleEndian>().map_err(truncated)?;
                    let smallest = read_internal_key(rdr)?;
                    let largest = read_internal_key(rdr)?;
                    edit.new_files.push((
                        level,
                        FileMetaData {
                            number,
                            file_size,
                            smallest,
                            largest,
                        },
                    ));
                }
                other => {
                    return Err(Error::Corruption(format!(
                        "unknown version edit tag {:#04x}",
                        other
                    )))
                }
            }
        }
        Ok(edit)
    }
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_bytes(buf: &mut Vec<u8>, b: &[u8]) {
    put_u32(buf, b.len() as u32);
    buf.extend_from_slice(b);
}

fn truncated(_: std::io::Error) -> Error {
    Error::Corruption("truncated version edit".into())
}

fn read_level(rdr: &mut &[u8]) -> Result<usize> {
    Ok(rdr.read_u32::<LittleEndian>().map_err(truncated)? as usize)
}

fn read_bytes(rdr: &mut &[u8]) -> Result<Vec<u8>> {
    let len = rdr.read_u32::<LittleEndian>().map_err(truncated)? as usize;
    if rdr.len() < len {
        return Err(Error::Corruption("truncated version edit".into()));
    }
    let mut out = vec![0u8; len];
    rdr.read_exact(&mut out).map_err(truncated)?;
    Ok(out)
}

fn read_internal_key(rdr: &mut &[u8]) -> Result<InternalKey> {
    let raw = read_bytes(rdr)?;
    if memtable::parse_internal_key(&raw).is_none() {
        return Err(Error::Corruption("malformed internal key in version edit".into()));
    }
    Ok(InternalKey::decode_from(&raw))
}
