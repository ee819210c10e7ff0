use std::cmp::Ordering;

/// Total order over user keys.
///
/// The name is persisted in the manifest; reopening a store with a
/// comparator of a different name is rejected because every table on disk
/// is sorted by the old order.
pub trait Comparator: Send + Sync {
    /// Stable identifier written to the manifest.
    fn name(&self) -> &str;

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// Lexicographic byte ordering. The default comparator.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytewiseComparator;

impl Comparator for BytewiseComparator {
    fn name(&self) -> &str {
        "shoal.BytewiseComparator"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

impl std::fmt::Debug for dyn Comparator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Comparator").field(&self.name()).finish()
    }
}
