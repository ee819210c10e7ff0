//! # Bloom Filter
//!
//! A space-efficient probabilistic data structure for set membership testing.
//!
//! A bloom filter can tell you with certainty that a key is **not** in the set
//! (no false negatives), but may occasionally report that a key **is** in the
//! set when it isn't (false positives). The false positive rate depends on the
//! number of bits spent per key.
//!
//! ## Usage in ShoalDB
//!
//! Every table file may embed one filter built over the *user* keys it
//! contains. Point lookups consult the filter first; a negative answer skips
//! the index search and the data block read entirely.
//!
//! ## Encoding
//!
//! ```text
//! [bits: bytes][num_probes: u8]
//! ```
//!
//! The probe count travels with the filter so that tables written with a
//! different `bits_per_key` stay readable.
//!
//! ## Example
//!
//! ```rust
//! use bloom::{bloom_hash, BloomFilter};
//!
//! let hashes = [bloom_hash(b"hello"), bloom_hash(b"world")];
//! let bf = BloomFilter::build(&hashes, 10);
//! assert!(bf.may_contain(b"hello"));
//!
//! let decoded = BloomFilter::from_bytes(&bf.to_bytes()).unwrap();
//! assert!(decoded.may_contain(b"world"));
//! ```

use xxhash_rust::xxh3::xxh3_64;

/// Upper bound on probes; anything above this only burns CPU.
const MAX_PROBES: usize = 30;

/// Smallest filter we ever emit, to keep the FPR sane for tiny tables.
const MIN_BITS: usize = 64;

/// Hashes a key the way the filter expects.
///
/// Callers building a filter keep only these 64-bit hashes while streaming
/// keys, which is cheaper than buffering the keys themselves.
#[must_use]
pub fn bloom_hash(key: &[u8]) -> u64 {
    xxh3_64(key)
}

/// An immutable bloom filter over a fixed set of keys.
#[derive(Clone, PartialEq, Eq)]
pub struct BloomFilter {
    /// The bit vector storing the filter state.
    bits: Vec<u8>,
    /// Number of probes (k) per key.
    num_probes: u8,
}

impl BloomFilter {
    /// Builds a filter from pre-computed key hashes.
    ///
    /// `bits_per_key` controls the false positive rate: 10 bits per key gives
    /// roughly 1%.
    ///
    /// # Panics
    ///
    /// Panics if `bits_per_key` is 0.
    pub fn build(key_hashes: &[u64], bits_per_key: usize) -> Self {
        assert!(bits_per_key > 0, "bits_per_key must be > 0");

        // k = bits_per_key * ln(2) is optimal; round down like the classic
        // implementation to save a little CPU per probe.
        let k = ((bits_per_key as f64) * std::f64::consts::LN_2) as usize;
        let k = k.clamp(1, MAX_PROBES);

        let num_bits = (key_hashes.len() * bits_per_key).max(MIN_BITS);
        let byte_len = (num_bits + 7) / 8;
        let num_bits = (byte_len * 8) as u64;

        let mut bits = vec![0u8; byte_len];
        for &h in key_hashes {
            for bit in probe_positions(h, k, num_bits) {
                bits[(bit / 8) as usize] |= 1 << (bit % 8);
            }
        }

        Self {
            bits,
            num_probes: k as u8,
        }
    }

    /// Decodes a filter produced by [`to_bytes`](BloomFilter::to_bytes).
    ///
    /// Returns `None` for input too short to hold a probe count.
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        let (&num_probes, bits) = data.split_last()?;
        if bits.is_empty() {
            return None;
        }
        Some(Self {
            bits: bits.to_vec(),
            num_probes,
        })
    }

    /// Serializes the filter: the bit vector followed by the probe count.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bits.len() + 1);
        out.extend_from_slice(&self.bits);
        out.push(self.num_probes);
        out
    }

    /// Returns `true` if the key **might** be in the set, `false` if it is
    /// **definitely not** in the set.
    #[must_use]
    pub fn may_contain(&self, key: &[u8]) -> bool {
        self.may_contain_hash(bloom_hash(key))
    }

    /// Same as [`may_contain`](BloomFilter::may_contain) for a pre-hashed key.
    #[must_use]
    pub fn may_contain_hash(&self, hash: u64) -> bool {
        // Probe counts above the cap are reserved for future encodings;
        // treat them as a match rather than guessing.
        if self.num_probes as usize > MAX_PROBES {
            return true;
        }
        let num_bits = (self.bits.len() * 8) as u64;
        probe_positions(hash, self.num_probes as usize, num_bits)
            .all(|bit| self.bits[(bit / 8) as usize] & (1 << (bit % 8)) != 0)
    }

    /// Number of bits in the filter.
    #[must_use]
    pub fn num_bits(&self) -> u64 {
        (self.bits.len() * 8) as u64
    }

    /// Number of probes per key.
    #[must_use]
    pub fn num_probes(&self) -> u8 {
        self.num_probes
    }
}

/// Double hashing: `h1 + i * h2` where both halves come from one 64-bit hash.
fn probe_positions(hash: u64, k: usize, num_bits: u64) -> impl Iterator<Item = u64> {
    let h1 = hash & 0xffff_ffff;
    // Force h2 odd so consecutive probes never collapse onto one bit.
    let h2 = (hash >> 32) | 1;
    (0..k as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % num_bits)
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomFilter")
            .field("num_bits", &self.num_bits())
            .field("num_probes", &self.num_probes)
            .finish()
    }
}
