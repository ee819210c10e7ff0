//! Internal key encoding shared by the mutable stage, table files and the
//! engine.
//!
//! ```text
//! internal key = [user key bytes][tag: u64 LE]
//! tag          = (sequence << 8) | kind
//! ```
//!
//! Internal keys sort by user key ascending, then by tag descending, so the
//! newest version of a user key is met first by any forward scan.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use config::Comparator;

pub type SequenceNumber = u64;

/// Sequence numbers are 56 bits wide; the low byte of the tag holds the kind.
pub const MAX_SEQUENCE_NUMBER: SequenceNumber = (1 << 56) - 1;

/// Bytes the tag adds after the user key.
pub const TAG_BYTES: usize = 8;

/// What an entry records about its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueKind {
    /// Tombstone.
    Deletion = 0,
    Value = 1,
}

impl ValueKind {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(ValueKind::Deletion),
            1 => Some(ValueKind::Value),
            _ => None,
        }
    }
}

/// Packs a sequence number and kind into a tag.
#[must_use]
pub fn pack_tag(seq: SequenceNumber, kind: ValueKind) -> u64 {
    debug_assert!(seq <= MAX_SEQUENCE_NUMBER);
    (seq << 8) | kind as u64
}

/// The three parts of an internal key, borrowed from its encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedInternalKey<'a> {
    pub user_key: &'a [u8],
    pub sequence: SequenceNumber,
    pub kind: ValueKind,
}

/// Splits an encoded internal key. Returns `None` when it is too short or
/// carries an unknown kind byte.
#[must_use]
pub fn parse_internal_key(ikey: &[u8]) -> Option<ParsedInternalKey<'_>> {
    if ikey.len() < TAG_BYTES {
        return None;
    }
    let (user_key, tag_bytes) = ikey.split_at(ikey.len() - TAG_BYTES);
    let mut raw = [0u8; TAG_BYTES];
    raw.copy_from_slice(tag_bytes);
    let tag = u64::from_le_bytes(raw);
    let kind = ValueKind::from_u8((tag & 0xff) as u8)?;
    Some(ParsedInternalKey {
        user_key,
        sequence: tag >> 8,
        kind,
    })
}

/// User key part of an encoded internal key.
///
/// Inputs shorter than a tag yield an empty slice.
#[must_use]
pub fn extract_user_key(ikey: &[u8]) -> &[u8] {
    &ikey[..ikey.len().saturating_sub(TAG_BYTES)]
}

fn extract_tag(ikey: &[u8]) -> u64 {
    let start = ikey.len().saturating_sub(TAG_BYTES);
    let mut raw = [0u8; TAG_BYTES];
    let tail = &ikey[start..];
    raw[..tail.len()].copy_from_slice(tail);
    u64::from_le_bytes(raw)
}

/// An owned, encoded internal key.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct InternalKey(Vec<u8>);

impl InternalKey {
    pub fn new(user_key: &[u8], seq: SequenceNumber, kind: ValueKind) -> Self {
        let mut buf = Vec::with_capacity(user_key.len() + TAG_BYTES);
        buf.extend_from_slice(user_key);
        buf.extend_from_slice(&pack_tag(seq, kind).to_le_bytes());
        InternalKey(buf)
    }

    /// Wraps bytes that already hold an encoded internal key.
    pub fn decode_from(encoded: &[u8]) -> Self {
        InternalKey(encoded.to_vec())
    }

    pub fn encoded(&self) -> &[u8] {
        &self.0
    }

    pub fn user_key(&self) -> &[u8] {
        extract_user_key(&self.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl fmt::Debug for InternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match parse_internal_key(&self.0) {
            Some(p) => write!(
                f,
                "'{}' @ {} : {:?}",
                String::from_utf8_lossy(p.user_key),
                p.sequence,
                p.kind
            ),
            None => write!(f, "(bad){:?}", self.0),
        }
    }
}

/// Key used to look up a user key as of a sequence number.
///
/// It is the internal key `(user_key, seq, Value)`: since `Value` is the
/// larger kind it sorts before every entry of that user key with the same
/// sequence number, so a seek lands on the newest visible version.
#[derive(Debug, Clone)]
pub struct LookupKey {
    ikey: InternalKey,
}

impl LookupKey {
    pub fn new(user_key: &[u8], seq: SequenceNumber) -> Self {
        LookupKey {
            ikey: InternalKey::new(user_key, seq, ValueKind::Value),
        }
    }

    pub fn internal_key(&self) -> &[u8] {
        self.ikey.encoded()
    }

    pub fn user_key(&self) -> &[u8] {
        self.ikey.user_key()
    }
}

/// Orders encoded internal keys: user key by the configured comparator,
/// then tag descending.
#[derive(Clone)]
pub struct InternalKeyComparator {
    user: Arc<dyn Comparator>,
}

impl InternalKeyComparator {
    pub fn new(user: Arc<dyn Comparator>) -> Self {
        Self { user }
    }

    pub fn user_comparator(&self) -> &Arc<dyn Comparator> {
        &self.user
    }

    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.user
            .compare(extract_user_key(a), extract_user_key(b))
            .then_with(|| extract_tag(b).cmp(&extract_tag(a)))
    }

    pub fn compare_user(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.user.compare(a, b)
    }
}

impl fmt::Debug for InternalKeyComparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("InternalKeyComparator")
            .field(&self.user.name())
            .finish()
    }
}
