use super::*;
use config::BytewiseComparator;
use std::cmp::Ordering;

fn icmp() -> InternalKeyComparator {
    InternalKeyComparator::new(Arc::new(BytewiseComparator))
}

fn new_mem() -> Arc<MemTable> {
    Arc::new(MemTable::new(icmp()))
}

fn collect_forward(mem: &Arc<MemTable>) -> Vec<(Vec<u8>, u64, ValueKind)> {
    let mut it = mem.iter();
    it.seek_to_first();
    let mut out = Vec::new();
    while it.valid() {
        let p = parse_internal_key(it.key()).unwrap();
        out.push((p.user_key.to_vec(), p.sequence, p.kind));
        it.next();
    }
    out
}

// -------------------- Internal keys --------------------

#[test]
fn internal_key_roundtrips_through_parse() {
    let k = InternalKey::new(b"user", 42, ValueKind::Deletion);
    assert_eq!(k.user_key(), b"user");
    let p = parse_internal_key(k.encoded()).unwrap();
    assert_eq!(p.user_key, b"user");
    assert_eq!(p.sequence, 42);
    assert_eq!(p.kind, ValueKind::Deletion);
}

#[test]
fn parse_rejects_short_and_unknown_kind() {
    assert!(parse_internal_key(b"short").is_none());
    let mut bad = InternalKey::new(b"k", 1, ValueKind::Value).into_bytes();
    let tag_start = bad.len() - TAG_BYTES;
    bad[tag_start] = 7;
    assert!(parse_internal_key(&bad).is_none());
}

#[test]
fn max_sequence_survives_tag_packing() {
    let k = InternalKey::new(b"k", MAX_SEQUENCE_NUMBER, ValueKind::Value);
    assert_eq!(
        parse_internal_key(k.encoded()).unwrap().sequence,
        MAX_SEQUENCE_NUMBER
    );
}

#[test]
fn newer_sequence_sorts_first_for_same_user_key() {
    let c = icmp();
    let old = InternalKey::new(b"k", 1, ValueKind::Value);
    let new = InternalKey::new(b"k", 2, ValueKind::Value);
    assert_eq!(c.compare(new.encoded(), old.encoded()), Ordering::Less);
}

#[test]
fn user_key_order_dominates_sequence() {
    let c = icmp();
    let a = InternalKey::new(b"a", 1, ValueKind::Value);
    let b = InternalKey::new(b"b", 100, ValueKind::Value);
    assert_eq!(c.compare(a.encoded(), b.encoded()), Ordering::Less);
}

#[test]
fn value_sorts_before_deletion_at_same_sequence() {
    let c = icmp();
    let v = InternalKey::new(b"k", 5, ValueKind::Value);
    let d = InternalKey::new(b"k", 5, ValueKind::Deletion);
    assert_eq!(c.compare(v.encoded(), d.encoded()), Ordering::Less);
}

#[test]
fn internal_key_debug_is_readable() {
    let k = InternalKey::new(b"abc", 9, ValueKind::Value);
    assert_eq!(format!("{:?}", k), "'abc' @ 9 : Value");
}

// -------------------- Point lookups --------------------

#[test]
fn get_returns_latest_value() {
    let m = new_mem();
    m.add(1, ValueKind::Value, b"k1", b"v1");
    m.add(2, ValueKind::Value, b"k1", b"v2");

    assert_eq!(
        m.get(&LookupKey::new(b"k1", 10)),
        Some(MemGet::Value(b"v2".to_vec()))
    );
}

#[test]
fn get_respects_snapshot_sequence() {
    let m = new_mem();
    m.add(1, ValueKind::Value, b"k", b"old");
    m.add(5, ValueKind::Value, b"k", b"new");

    assert_eq!(
        m.get(&LookupKey::new(b"k", 4)),
        Some(MemGet::Value(b"old".to_vec()))
    );
    assert_eq!(
        m.get(&LookupKey::new(b"k", 5)),
        Some(MemGet::Value(b"new".to_vec()))
    );
    assert_eq!(m.get(&LookupKey::new(b"k", 0)), None);
}

#[test]
fn tombstone_is_reported_as_deleted() {
    let m = new_mem();
    m.add(1, ValueKind::Value, b"k", b"v");
    m.add(2, ValueKind::Deletion, b"k", b"");

    assert_eq!(m.get(&LookupKey::new(b"k", 2)), Some(MemGet::Deleted));
    assert_eq!(
        m.get(&LookupKey::new(b"k", 1)),
        Some(MemGet::Value(b"v".to_vec()))
    );
}

#[test]
fn get_missing_key_is_none() {
    let m = new_mem();
    m.add(1, ValueKind::Value, b"a", b"1");
    m.add(2, ValueKind::Value, b"c", b"3");
    assert_eq!(m.get(&LookupKey::new(b"b", 10)), None);
    assert_eq!(m.get(&LookupKey::new(b"d", 10)), None);
}

#[test]
fn prefix_keys_do_not_collide() {
    let m = new_mem();
    m.add(1, ValueKind::Value, b"ab", b"long");
    assert_eq!(m.get(&LookupKey::new(b"a", 10)), None);
}

#[test]
fn empty_key_and_value_are_allowed() {
    let m = new_mem();
    m.add(1, ValueKind::Value, b"", b"");
    assert_eq!(
        m.get(&LookupKey::new(b"", 1)),
        Some(MemGet::Value(Vec::new()))
    );
}

// -------------------- Accounting --------------------

#[test]
fn memory_usage_grows_with_inserts() {
    let m = new_mem();
    assert!(m.is_empty());
    assert_eq!(m.approximate_memory_usage(), 0);

    m.add(1, ValueKind::Value, b"a", b"aaa");
    let after_one = m.approximate_memory_usage();
    assert!(after_one >= 1 + 3 + TAG_BYTES);

    m.add(2, ValueKind::Deletion, b"a", b"");
    assert!(m.approximate_memory_usage() > after_one);
    assert_eq!(m.len(), 2);
}

// -------------------- Iteration --------------------

#[test]
fn iterator_walks_internal_order() {
    let m = new_mem();
    m.add(3, ValueKind::Value, b"b", b"b3");
    m.add(1, ValueKind::Value, b"a", b"a1");
    m.add(4, ValueKind::Deletion, b"a", b"");
    m.add(2, ValueKind::Value, b"c", b"c2");

    assert_eq!(
        collect_forward(&m),
        vec![
            (b"a".to_vec(), 4, ValueKind::Deletion),
            (b"a".to_vec(), 1, ValueKind::Value),
            (b"b".to_vec(), 3, ValueKind::Value),
            (b"c".to_vec(), 2, ValueKind::Value),
        ]
    );
}

#[test]
fn iterator_moves_backwards() {
    let m = new_mem();
    for (i, k) in [b"a", b"b", b"c"].iter().enumerate() {
        m.add(i as u64 + 1, ValueKind::Value, *k, *k);
    }

    let mut it = m.iter();
    it.seek_to_last();
    let mut seen = Vec::new();
    while it.valid() {
        seen.push(extract_user_key(it.key()).to_vec());
        it.prev();
    }
    assert_eq!(seen, vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
}

#[test]
fn seek_lands_on_first_entry_at_or_after_target() {
    let m = new_mem();
    m.add(1, ValueKind::Value, b"apple", b"1");
    m.add(2, ValueKind::Value, b"cherry", b"2");

    let mut it = m.iter();
    it.seek(LookupKey::new(b"banana", MAX_SEQUENCE_NUMBER).internal_key());
    assert!(it.valid());
    assert_eq!(extract_user_key(it.key()), b"cherry");
    assert_eq!(it.value(), b"2");

    it.seek(LookupKey::new(b"zebra", MAX_SEQUENCE_NUMBER).internal_key());
    assert!(!it.valid());
    assert!(it.key().is_empty());
}

#[test]
fn direction_change_mid_scan() {
    let m = new_mem();
    m.add(1, ValueKind::Value, b"a", b"1");
    m.add(2, ValueKind::Value, b"b", b"2");
    m.add(3, ValueKind::Value, b"c", b"3");

    let mut it = m.iter();
    it.seek_to_first();
    it.next();
    assert_eq!(extract_user_key(it.key()), b"b");
    it.prev();
    assert_eq!(extract_user_key(it.key()), b"a");
    it.prev();
    assert!(!it.valid());
}

#[test]
fn iterator_keeps_frozen_stage_alive() {
    let m = new_mem();
    m.add(1, ValueKind::Value, b"k", b"v");
    let mut it = m.iter();
    drop(m);

    it.seek_to_first();
    assert!(it.valid());
    assert_eq!(it.value(), b"v");
}

#[test]
fn concurrent_readers_see_inserts() {
    let m = new_mem();
    let writer = Arc::clone(&m);
    let handle = std::thread::spawn(move || {
        for i in 0..1000u64 {
            writer.add(i + 1, ValueKind::Value, &i.to_be_bytes(), b"v");
        }
    });
    // Reads race with the writer; they must never observe a torn entry.
    for _ in 0..100 {
        let mut it = m.iter();
        it.seek_to_first();
        while it.valid() {
            assert!(parse_internal_key(it.key()).is_some());
            it.next();
        }
    }
    handle.join().unwrap();
    assert_eq!(m.len(), 1000);
}
