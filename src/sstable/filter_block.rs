//! Filter meta blocks.
//!
//! A filter block maps ranges of data-block offsets to filters. One
//! filter is generated per `FILTER_BASE` (2 KiB) window of file offsets:
//! a data block starting at offset `o` is covered by filter `o >> base_lg`.
//!
//! ```text
//! filter_0 .. filter_n-1
//! fixed32 offset_of_filter_i  (n entries)
//! fixed32 offset_array_start
//! byte    base_lg
//! ```

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use crate::util::coding::{decode_fixed32, put_fixed32};
use crate::util::filter::FilterPolicy;

/// Base-two exponent of the filter window.
pub const FILTER_BASE_LG: u8 = 11;

/// Bytes of file offset covered per filter.
pub const FILTER_BASE: u64 = 1 << FILTER_BASE_LG;

/// Accumulates keys and emits one filter per offset window.
///
/// Call sequence: repeated (`start_block`, `add_key`*) in increasing
/// offset order, then `finish`.
pub struct FilterBlockBuilder {
    policy: Arc<dyn FilterPolicy>,
    /// Keys waiting for the current filter.
    keys: Vec<Vec<u8>>,
    /// Start offsets of generated filters within `result`.
    filter_offsets: Vec<u32>,
    result: Vec<u8>,
}

impl FilterBlockBuilder {
    /// Create a builder for `policy`.
    pub fn new(policy: Arc<dyn FilterPolicy>) -> Self {
        Self {
            policy,
            keys: Vec::new(),
            filter_offsets: Vec::new(),
            result: Vec::new(),
        }
    }

    /// Note that a data block begins at `block_offset`; closes filters for
    /// every window boundary passed since the last call. Empty windows
    /// produce empty filters (their recorded offsets coincide).
    pub fn start_block(&mut self, block_offset: u64) {
        let filter_index = block_offset / FILTER_BASE;
        debug_assert!(filter_index >= self.filter_offsets.len() as u64);
        while filter_index > self.filter_offsets.len() as u64 {
            self.generate_filter();
        }
    }

    /// Add a key belonging to the current data block.
    pub fn add_key(&mut self, key: &[u8]) {
        self.keys.push(key.to_vec());
    }

    /// Close the final filter and append the offset array and trailer.
    pub fn finish(mut self) -> Bytes {
        if !self.keys.is_empty() {
            self.generate_filter();
        }

        let mut out = BytesMut::from(&self.result[..]);
        let array_offset = out.len() as u32;
        for &offset in &self.filter_offsets {
            put_fixed32(&mut out, offset);
        }
        put_fixed32(&mut out, array_offset);
        out.put_u8(FILTER_BASE_LG);
        out.freeze()
    }

    fn generate_filter(&mut self) {
        self.filter_offsets.push(self.result.len() as u32);
        if self.keys.is_empty() {
            // Empty window: zero-length filter.
            return;
        }

        let key_slices: Vec<&[u8]> = self.keys.iter().map(|k| k.as_slice()).collect();
        self.policy.create_filter(&key_slices, &mut self.result);
        self.keys.clear();
    }
}

/// Answers membership probes against a finished filter block.
pub struct FilterBlockReader {
    policy: Arc<dyn FilterPolicy>,
    data: Bytes,
    /// Start of the offset array within `data`.
    offset_start: usize,
    /// Number of filters.
    num: usize,
    base_lg: u8,
}

impl FilterBlockReader {
    /// Parse filter block `contents`. A malformed block yields a reader
    /// that matches every key, since filters are advisory.
    pub fn new(policy: Arc<dyn FilterPolicy>, contents: Bytes) -> Self {
        let mut reader = Self {
            policy,
            data: Bytes::new(),
            offset_start: 0,
            num: 0,
            base_lg: 0,
        };

        let n = contents.len();
        if n < 5 {
            return reader;
        }
        reader.base_lg = contents[n - 1];

        let Some(last_word) = decode_fixed32(&contents[n - 5..]) else {
            return reader;
        };
        if last_word as usize > n - 5 {
            return reader;
        }

        reader.offset_start = last_word as usize;
        reader.num = (n - 5 - reader.offset_start) / 4;
        reader.data = contents;
        reader
    }

    /// Whether `key` may be present in the data block at `block_offset`.
    ///
    /// Out-of-range indices and malformed entries answer true; an empty
    /// filter answers false.
    pub fn key_may_match(&self, block_offset: u64, key: &[u8]) -> bool {
        let index = (block_offset >> self.base_lg) as usize;
        if index >= self.num {
            return true;
        }

        let entry = self.offset_start + index * 4;
        let (Some(start), Some(limit)) = (
            decode_fixed32(&self.data[entry..]),
            decode_fixed32(&self.data[entry + 4..]),
        ) else {
            return true;
        };
        let (start, limit) = (start as usize, limit as usize);

        if start == limit {
            // Empty filters match nothing.
            return false;
        }
        if start > limit || limit > self.offset_start {
            // Malformed entry: stay conservative.
            return true;
        }

        self.policy.key_may_match(key, &self.data[start..limit])
    }
}
