use std::path::Path;
use std::sync::Arc;

use config::{BytewiseComparator, Options};
use memtable::{InternalKey, InternalKeyComparator, MemTable, ValueKind};

use crate::{SSTableReader, SSTableWriter, TableSummary};

mod iter_tests;
mod reader_tests;

fn icmp() -> InternalKeyComparator {
    InternalKeyComparator::new(Arc::new(BytewiseComparator))
}

fn small_block_options() -> Options {
    Options {
        block_size: 128,
        ..Options::default()
    }
}

/// Writes every entry of `mem` to table `number` at `path`.
fn write_memtable(
    path: &Path,
    number: u64,
    mem: &Arc<MemTable>,
    opts: &Options,
) -> crate::Result<TableSummary> {
    let mut w = SSTableWriter::create(path, number, opts)?;
    let mut it = mem.iter();
    it.seek_to_first();
    while it.valid() {
        w.add(it.key(), it.value())?;
        it.next();
    }
    w.finish()
}

/// a=apple@1, b=banana@2, c=""@3, d deleted@4.
fn sample_memtable() -> Arc<MemTable> {
    let m = Arc::new(MemTable::new(icmp()));
    m.add(1, ValueKind::Value, b"a", b"apple");
    m.add(2, ValueKind::Value, b"b", b"banana");
    m.add(3, ValueKind::Value, b"c", b"");
    m.add(4, ValueKind::Deletion, b"d", b"");
    m
}

fn numbered_memtable(n: u64) -> Arc<MemTable> {
    let m = Arc::new(MemTable::new(icmp()));
    for i in 0..n {
        m.add(i + 1, ValueKind::Value, format!("key{:05}", i).as_bytes(), format!("val{}", i).as_bytes());
    }
    m
}

fn open(path: &Path, number: u64) -> crate::Result<Arc<SSTableReader>> {
    Ok(Arc::new(SSTableReader::open(path, number, icmp(), false)?))
}

fn ikey(user: &[u8], seq: u64, kind: ValueKind) -> Vec<u8> {
    InternalKey::new(user, seq, kind).into_bytes()
}
