//! Table file format constants, block handles, the footer and the
//! properties block.
//!
//! ## Footer (64 bytes)
//!
//! ```text
//! [filter handle: 16][properties handle: 16][index handle: 16]
//! [reserved: u64][format version: u32][magic: u32 "SST4"]
//! ```
//!
//! A handle is `[offset: u64 LE][size: u64 LE]`; `size` excludes the 4-byte
//! CRC trailer every block carries. A filter handle of size 0 means the table
//! has no filter.
//!
//! The reader checks the magic first, then the version, and refuses anything
//! it does not know.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use memtable::InternalKey;

use crate::error::{corruption, Result};

/// Magic number identifying table files (ASCII "SST4").
pub const TABLE_MAGIC: u32 = 0x5353_5434;

pub const FORMAT_VERSION: u32 = 4;

/// Size of the footer in bytes.
pub const FOOTER_BYTES: usize = 64;

/// Size of the CRC32 trailer after every block.
pub const BLOCK_TRAILER_BYTES: usize = 4;

/// Encoded size of a [`BlockHandle`].
pub const HANDLE_BYTES: usize = 16;

/// Location of a block inside a table file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

impl BlockHandle {
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    pub fn encode_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HANDLE_BYTES);
        self.encode_to(&mut out);
        out
    }

    /// Reads a handle from the front of `input`, advancing it.
    pub fn decode_from(input: &mut &[u8]) -> Result<Self> {
        let offset = input
            .read_u64::<LittleEndian>()
            .map_err(|_| corruption("truncated block handle"))?;
        let size = input
            .read_u64::<LittleEndian>()
            .map_err(|_| corruption("truncated block handle"))?;
        Ok(Self { offset, size })
    }
}

/// The fixed-size trailer of every table file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub filter: Option<BlockHandle>,
    pub properties: BlockHandle,
    pub index: BlockHandle,
}

impl Footer {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FOOTER_BYTES);
        self.filter.unwrap_or_default().encode_to(&mut out);
        self.properties.encode_to(&mut out);
        self.index.encode_to(&mut out);
        out.extend_from_slice(&0u64.to_le_bytes());
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&TABLE_MAGIC.to_le_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != FOOTER_BYTES {
            return Err(corruption(format!(
                "footer is {} bytes, expected {}",
                data.len(),
                FOOTER_BYTES
            )));
        }
        let mut tail = &data[FOOTER_BYTES - 8..];
        let version = tail.read_u32::<LittleEndian>()?;
        let magic = tail.read_u32::<LittleEndian>()?;
        if magic != TABLE_MAGIC {
            return Err(corruption(format!("bad table magic {:#x}", magic)));
        }
        if version != FORMAT_VERSION {
            return Err(corruption(format!("unsupported table version {}", version)));
        }

        let mut input = data;
        let filter = BlockHandle::decode_from(&mut input)?;
        let properties = BlockHandle::decode_from(&mut input)?;
        let index = BlockHandle::decode_from(&mut input)?;
        Ok(Self {
            filter: (filter.size > 0).then_some(filter),
            properties,
            index,
        })
    }
}

/// What a finished table holds. Stored in the properties block and handed
/// back by [`SSTableWriter::finish`](crate::SSTableWriter::finish).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSummary {
    /// File number the table was created under.
    pub number: u64,
    /// Size of the file on disk, footer included.
    pub file_size: u64,
    pub entries: u64,
    /// Smallest internal key in the table.
    pub smallest: InternalKey,
    /// Largest internal key in the table.
    pub largest: InternalKey,
    /// Highest sequence number of any entry.
    pub max_seq: u64,
}

/// Properties block body:
/// `[number u64][entries u64][max_seq u64][slen u32][smallest][llen u32][largest]`.
/// `file_size` is not stored; the reader takes it from the file itself.
pub(crate) fn encode_properties(summary: &TableSummary) -> Vec<u8> {
    let smallest = summary.smallest.encoded();
    let largest = summary.largest.encoded();
    let mut out = Vec::with_capacity(32 + smallest.len() + largest.len());
    // Writes into a Vec cannot fail.
    let _ = out.write_u64::<LittleEndian>(summary.number);
    let _ = out.write_u64::<LittleEndian>(summary.entries);
    let _ = out.write_u64::<LittleEndian>(summary.max_seq);
    let _ = out.write_u32::<LittleEndian>(smallest.len() as u32);
    out.extend_from_slice(smallest);
    let _ = out.write_u32::<LittleEndian>(largest.len() as u32);
    out.extend_from_slice(largest);
    out
}

pub(crate) fn decode_properties(data: &[u8], file_size: u64) -> Result<TableSummary> {
    let bad = |_| corruption("truncated properties block");
    let mut input = data;
    let number = input.read_u64::<LittleEndian>().map_err(bad)?;
    let entries = input.read_u64::<LittleEndian>().map_err(bad)?;
    let max_seq = input.read_u64::<LittleEndian>().map_err(bad)?;
    let smallest = read_key(&mut input)?;
    let largest = read_key(&mut input)?;
    Ok(TableSummary {
        number,
        file_size,
        entries,
        smallest,
        largest,
        max_seq,
    })
}

fn read_key(input: &mut &[u8]) -> Result<InternalKey> {
    let len = input
        .read_u32::<LittleEndian>()
        .map_err(|_| corruption("truncated properties key"))? as usize;
    if input.len() < len {
        return Err(corruption("properties key runs past block end"));
    }
    let (key, rest) = input.split_at(len);
    *input = rest;
    Ok(InternalKey::decode_from(key))
}
