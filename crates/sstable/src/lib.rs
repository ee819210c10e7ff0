//! # SSTable - Sorted String Table
//!
//! Immutable, on-disk table files for the ShoalDB storage engine.
//!
//! A frozen mutable stage is flushed to a level-0 table, and compaction
//! merges tables into new ones. Tables are *write-once, read-many*: once
//! renamed into place they are never modified, only deleted when no
//! version references them any more.
//!
//! ## File layout
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ DATA BLOCKS  (sorted internal keys)                            │
//! │   [klen u32][internal key][vlen u32][value] ...                │
//! │   [offset u32] ... [count u32]                    + crc32      │
//! ├───────────────────────────────────────────────────────────────┤
//! │ FILTER BLOCK (optional bloom filter over user keys)  + crc32   │
//! ├───────────────────────────────────────────────────────────────┤
//! │ PROPERTIES   number, entries, max_seq, smallest, largest       │
//! │                                                    + crc32     │
//! ├───────────────────────────────────────────────────────────────┤
//! │ INDEX BLOCK  last internal key of each data block -> handle    │
//! │                                                    + crc32     │
//! ├───────────────────────────────────────────────────────────────┤
//! │ FOOTER (64 bytes)                                              │
//! │   filter | properties | index handles, version, magic "SST4"   │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian. An internal key is the user key followed
//! by an 8-byte tag (`seq << 8 | kind`), see [`memtable::key`].

mod block;
mod error;
mod format;
mod iter;
mod reader;
mod writer;

pub use error::{Result, TableError};
pub use format::{BlockHandle, Footer, TableSummary, FOOTER_BYTES, FORMAT_VERSION, TABLE_MAGIC};
pub use iter::SSTableIterator;
pub use reader::SSTableReader;
pub use writer::SSTableWriter;

#[cfg(test)]
mod tests;
