//! Filter policies.
//!
//! A [`FilterPolicy`] summarises a set of keys into a compact byte string
//! that can later answer "might this key be in the set?". False positives
//! are allowed; false negatives are not. Filters are an optimization only
//! and are never authoritative.

use std::sync::Arc;

use crate::types::extract_user_key;
use crate::util::hash::bloom_hash;

/// Trait for key-set summaries attached to tables.
pub trait FilterPolicy: Send + Sync {
    /// Name of the policy. Recorded next to the filter data; a table
    /// written with one policy must be read with the same one.
    fn name(&self) -> &str;

    /// Append a filter summarising `keys` to `dst`.
    fn create_filter(&self, keys: &[&[u8]], dst: &mut Vec<u8>);

    /// Whether `key` may be present in the set `filter` was built from.
    ///
    /// Must return true for every key passed to the matching
    /// `create_filter` call; should usually return false otherwise.
    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool;
}

/// Bloom filter policy with a configurable bits-per-key budget.
///
/// Uses double hashing: a single base hash advanced by its own rotation,
/// probing `k` bits per key. The probe count is stored as the final filter
/// byte so readers reproduce it without configuration.
pub struct BloomFilterPolicy {
    bits_per_key: usize,
    k: usize,
}

impl BloomFilterPolicy {
    /// Create a bloom policy using roughly `bits_per_key` filter bits per key.
    pub fn new(bits_per_key: usize) -> Self {
        // Round intended probes down a bit to reduce probing cost.
        // k = bits_per_key * ln(2), clamped to a sane range.
        let k = ((bits_per_key as f64) * 0.69) as usize;
        let k = k.clamp(1, 30);
        Self { bits_per_key, k }
    }
}

impl FilterPolicy for BloomFilterPolicy {
    fn name(&self) -> &str {
        "leveldb.BuiltinBloomFilter2"
    }

    fn create_filter(&self, keys: &[&[u8]], dst: &mut Vec<u8>) {
        // Compute bloom filter size, with a floor that keeps the false
        // positive rate bounded for very small key sets.
        let mut bits = keys.len() * self.bits_per_key;
        if bits < 64 {
            bits = 64;
        }
        let bytes = (bits + 7) / 8;
        let bits = bytes * 8;

        let init_size = dst.len();
        dst.resize(init_size + bytes, 0);
        dst.push(self.k as u8);

        let array = &mut dst[init_size..init_size + bytes];
        for key in keys {
            let mut h = bloom_hash(key);
            let delta = (h >> 17) | (h << 15);
            for _ in 0..self.k {
                let bit_pos = (h as usize) % bits;
                array[bit_pos / 8] |= 1 << (bit_pos % 8);
                h = h.wrapping_add(delta);
            }
        }
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        let len = filter.len();
        if len < 2 {
            return false;
        }

        let array = &filter[..len - 1];
        let bits = array.len() * 8;

        let k = filter[len - 1] as usize;
        if k > 30 {
            // Reserved for future encodings; treat as a match.
            return true;
        }

        let mut h = bloom_hash(key);
        let delta = (h >> 17) | (h << 15);
        for _ in 0..k {
            let bit_pos = (h as usize) % bits;
            if array[bit_pos / 8] & (1 << (bit_pos % 8)) == 0 {
                return false;
            }
            h = h.wrapping_add(delta);
        }
        true
    }
}

/// Adapts a user-key policy to tables keyed by internal keys.
///
/// Strips the trailing (sequence, type) tag before both building and
/// probing, so lookups match regardless of the sequence in the probe key.
pub struct InternalFilterPolicy {
    user_policy: Arc<dyn FilterPolicy>,
}

impl InternalFilterPolicy {
    /// Wrap a user-key filter policy.
    pub fn new(user_policy: Arc<dyn FilterPolicy>) -> Self {
        Self { user_policy }
    }
}

impl FilterPolicy for InternalFilterPolicy {
    fn name(&self) -> &str {
        self.user_policy.name()
    }

    fn create_filter(&self, keys: &[&[u8]], dst: &mut Vec<u8>) {
        let user_keys: Vec<&[u8]> = keys.iter().map(|k| extract_user_key(k)).collect();
        self.user_policy.create_filter(&user_keys, dst);
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        self.user_policy.key_may_match(extract_user_key(key), filter)
    }
}
