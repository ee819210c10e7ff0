use super::*;
use std::fs;
use std::io::Cursor;
use tempfile::tempdir;

// -------------------- Helpers --------------------

fn replay_all(path: &std::path::Path) -> Result<Vec<Vec<u8>>, WalError> {
    let mut reader = WalReader::open(path)?;
    let mut recs = Vec::new();
    reader.replay(|r| recs.push(r.to_vec()))?;
    Ok(recs)
}

fn replay_from_bytes(data: &[u8]) -> Result<(Vec<Vec<u8>>, ReplaySummary), WalError> {
    let cursor = Cursor::new(data.to_vec());
    let mut reader = WalReader::from_reader(cursor);
    let mut recs = Vec::new();
    let summary = reader.replay(|r| recs.push(r.to_vec()))?;
    Ok((recs, summary))
}

fn frame(body: &[u8]) -> Vec<u8> {
    let mut hasher = Crc32::new();
    hasher.update(body);
    let mut out = Vec::new();
    out.extend_from_slice(&((body.len() + 4) as u32).to_le_bytes());
    out.extend_from_slice(&hasher.finalize().to_le_bytes());
    out.extend_from_slice(body);
    out
}

fn write_records(path: &std::path::Path, records: &[&[u8]]) {
    let mut w = WalWriter::create(path, true).unwrap();
    for r in records {
        w.append(r).unwrap();
    }
}

// -------------------- Basic write & replay --------------------

#[test]
fn write_and_replay_records() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("000001.log");

    write_records(&path, &[b"first", b"second", b"third"]);

    let recs = replay_all(&path).unwrap();
    assert_eq!(recs, vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]);
}

#[test]
fn append_reports_end_offset() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("000001.log");

    let mut w = WalWriter::create(&path, false).unwrap();
    assert_eq!(w.position(), 0);
    let end = w.append(b"abc").unwrap();
    assert_eq!(end, (HEADER_BYTES + 3) as u64);
    let end = w.append(b"de").unwrap();
    assert_eq!(end, (2 * HEADER_BYTES + 5) as u64);
    assert_eq!(w.position(), end);
}

#[test]
fn append_to_existing_wal() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("000001.log");

    write_records(&path, &[b"a"]);
    let w = WalWriter::create(&path, true).unwrap();
    assert_eq!(w.position(), (HEADER_BYTES + 1) as u64);
    drop(w);
    write_records(&path, &[b"b"]);

    let recs = replay_all(&path).unwrap();
    assert_eq!(recs, vec![b"a".to_vec(), b"b".to_vec()]);
}

#[test]
fn empty_record_is_rejected() {
    let dir = tempdir().unwrap();
    let mut w = WalWriter::create(dir.path().join("000001.log"), false).unwrap();
    assert!(matches!(w.append(b""), Err(WalError::Io(_))));
}

#[test]
fn sync_does_not_error() {
    let dir = tempdir().unwrap();
    let mut w = WalWriter::create(dir.path().join("000001.log"), false).unwrap();
    w.append(b"k").unwrap();
    w.sync().unwrap();
}

// -------------------- Empty WAL --------------------

#[test]
fn replay_empty_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("000001.log");
    fs::write(&path, b"").unwrap();

    assert!(replay_all(&path).unwrap().is_empty());
}

#[test]
fn open_non_existent_file_returns_error() {
    let dir = tempdir().unwrap();
    let result = WalReader::open(dir.path().join("missing.log"));
    assert!(matches!(result, Err(WalError::Io(_))));
}

// -------------------- Torn tails --------------------

#[test]
fn truncated_header_is_dropped() {
    let mut data = frame(b"k1");
    data.extend_from_slice(&[0x20, 0x00, 0x00]);

    let (recs, summary) = replay_from_bytes(&data).unwrap();
    assert_eq!(recs, vec![b"k1".to_vec()]);
    assert_eq!(summary.records, 1);
    assert_eq!(summary.dropped_bytes, 3);
}

#[test]
fn truncated_body_is_dropped() {
    let mut data = frame(b"k1");
    let partial = frame(b"a much longer record body");
    data.extend_from_slice(&partial[..partial.len() - 5]);

    let (recs, summary) = replay_from_bytes(&data).unwrap();
    assert_eq!(recs, vec![b"k1".to_vec()]);
    assert_eq!(summary.dropped_bytes, (partial.len() - 5) as u64);
}

#[test]
fn bad_checksum_in_last_record_is_a_torn_tail() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("000001.log");
    write_records(&path, &[b"keep", b"torn"]);

    let mut data = fs::read(&path).unwrap();
    let last = data.len() - 1;
    data[last] ^= 0xFF;
    fs::write(&path, &data).unwrap();

    let recs = replay_all(&path).unwrap();
    assert_eq!(recs, vec![b"keep".to_vec()]);
}

#[test]
fn zeroed_tail_is_dropped() {
    let mut data = frame(b"ok");
    data.extend_from_slice(&[0u8; 64]);

    let (recs, summary) = replay_from_bytes(&data).unwrap();
    assert_eq!(recs.len(), 1);
    assert_eq!(summary.dropped_bytes, 64);
}

#[test]
fn garbage_only_log_yields_nothing() {
    let (recs, summary) = replay_from_bytes(&[0, 1, 2, 3, 4, 5, 6, 7]).unwrap();
    assert!(recs.is_empty());
    assert_eq!(summary.dropped_bytes, 8);
}

#[test]
fn damaged_tail_carrying_a_framed_body_is_dropped() {
    // The manifest logs framed edits, so a body may itself hold a frame.
    let mut inner = b"edit:".to_vec();
    inner.extend_from_slice(&frame(b"nested"));
    let mut data = frame(b"ok");
    let mut tail = frame(&inner);
    tail[HEADER_BYTES] ^= 0xFF;
    data.extend_from_slice(&tail);

    let (recs, summary) = replay_from_bytes(&data).unwrap();
    assert_eq!(recs, vec![b"ok".to_vec()]);
    assert_eq!(summary.dropped_bytes, tail.len() as u64);
}

// -------------------- Mid-stream corruption --------------------

#[test]
fn corruption_before_valid_records_is_an_error() {
    let mut data = frame(b"first");
    let damaged_at = data.len();
    let mut second = frame(b"second");
    let n = second.len();
    second[n - 1] ^= 0xFF;
    data.extend_from_slice(&second);
    data.extend_from_slice(&frame(b"third"));

    let err = replay_from_bytes(&data).unwrap_err();
    match err {
        WalError::Corrupt { offset } => assert_eq!(offset, damaged_at as u64),
        other => panic!("expected Corrupt, got {:?}", other),
    }
}

#[test]
fn corrupted_length_before_valid_records_is_an_error() {
    let mut data = frame(b"first");
    let mut second = frame(b"second");
    second[0] = 0xFF;
    second[1] = 0xFF;
    data.extend_from_slice(&second);
    data.extend_from_slice(&frame(b"third"));

    assert!(matches!(
        replay_from_bytes(&data),
        Err(WalError::Corrupt { .. })
    ));
}

#[test]
fn records_before_corruption_are_not_applied_twice() {
    let mut data = frame(b"a");
    let mut bad = frame(b"b");
    bad[5] ^= 0x01;
    data.extend_from_slice(&bad);
    data.extend_from_slice(&frame(b"c"));

    let mut seen = Vec::new();
    let mut reader = WalReader::from_reader(Cursor::new(data));
    assert!(reader.replay(|r| seen.push(r.to_vec())).is_err());
    assert_eq!(seen, vec![b"a".to_vec()]);
}

// -------------------- Payload shapes --------------------

#[test]
fn large_record_roundtrip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("000001.log");
    let big = vec![b'x'; 1_000_000];

    write_records(&path, &[&big]);

    let recs = replay_all(&path).unwrap();
    assert_eq!(recs.len(), 1);
    assert_eq!(recs[0].len(), 1_000_000);
}

#[test]
fn binary_payload_roundtrip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("000001.log");
    let payload = [0x00u8, 0xFF, 0x80, 0xDE, 0xAD, 0xBE, 0xEF];

    write_records(&path, &[&payload]);
    assert_eq!(replay_all(&path).unwrap(), vec![payload.to_vec()]);
}

#[test]
fn many_records_roundtrip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("000001.log");

    let n = 5_000usize;
    {
        let mut w = WalWriter::create(&path, false).unwrap();
        for i in 0..n {
            w.append(format!("record{}", i).as_bytes()).unwrap();
        }
        w.sync().unwrap();
    }

    let recs = replay_all(&path).unwrap();
    assert_eq!(recs.len(), n);
    for (i, rec) in recs.iter().enumerate() {
        assert_eq!(rec, &format!("record{}", i).into_bytes());
    }
}
