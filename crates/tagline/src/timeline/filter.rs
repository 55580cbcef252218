//! Bloom filter over the `(entity, key)` pairs written to a shard.

use crate::tag::EntityId;
use xxhash_rust::xxh64::Xxh64;

/// Default number of hash functions.
pub const DEFAULT_HASH_COUNT: u8 = 3;

/// Bits allocated per expected item (about 1% false positives with k=3).
const BITS_PER_ITEM: usize = 10;

/// Probabilistic set of `(entity, key)` pairs.
///
/// A negative answer is authoritative; a positive answer must be confirmed
/// against the timeline. Pairs are never removed, so deleted keys stay
/// "possibly present" until the filter is rebuilt.
#[derive(Debug, Clone)]
pub struct ExistenceFilter {
    /// Bit array for the filter.
    bits: Vec<u64>,
    /// Number of hash functions to use.
    hash_count: u8,
    /// Number of insertions performed.
    inserted: usize,
}

impl ExistenceFilter {
    /// Creates a filter sized for `expected_items` pairs.
    pub fn new(expected_items: usize) -> Self {
        let num_bits = (expected_items.saturating_mul(BITS_PER_ITEM)).max(64);
        let num_words = num_bits.div_ceil(64);

        Self {
            bits: vec![0u64; num_words],
            hash_count: DEFAULT_HASH_COUNT,
            inserted: 0,
        }
    }

    /// `h_i = xxhash64(entity || 0xff || key, seed = i)`
    fn bit_index(&self, entity_id: &EntityId, key: &str, seed: u8) -> (usize, u64) {
        let mut hasher = Xxh64::new(seed as u64);
        hasher.update(entity_id.as_bytes());
        hasher.update(&[0xff]);
        hasher.update(key.as_bytes());

        let num_bits = (self.bits.len() * 64) as u64;
        let bit_idx = hasher.digest() % num_bits;
        ((bit_idx / 64) as usize, bit_idx % 64)
    }

    /// Records that `key` was written on `entity_id`.
    pub fn insert(&mut self, entity_id: &EntityId, key: &str) {
        for seed in 0..self.hash_count {
            let (word_idx, bit_pos) = self.bit_index(entity_id, key, seed);
            self.bits[word_idx] |= 1u64 << bit_pos;
        }
        self.inserted += 1;
    }

    /// Returns `false` only if `key` was definitely never written on
    /// `entity_id`.
    pub fn maybe_contains(&self, entity_id: &EntityId, key: &str) -> bool {
        (0..self.hash_count).all(|seed| {
            let (word_idx, bit_pos) = self.bit_index(entity_id, key, seed);
            self.bits[word_idx] & (1u64 << bit_pos) != 0
        })
    }

    /// Number of insertions, counting repeats.
    pub fn len(&self) -> usize {
        self.inserted
    }

    /// Returns true if nothing was inserted.
    pub fn is_empty(&self) -> bool {
        self.inserted == 0
    }

    /// Size of the bit array.
    pub fn bit_len(&self) -> usize {
        self.bits.len() * 64
    }

    /// Expected false positive rate at the current load,
    /// `(1 - e^(-k*n/m))^k`.
    pub fn estimated_false_positive_rate(&self) -> f64 {
        let k = self.hash_count as f64;
        let n = self.inserted as f64;
        let m = self.bit_len() as f64;
        (1.0 - (-k * n / m).exp()).powf(k)
    }
}
