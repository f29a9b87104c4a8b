//! Data block construction.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use crate::util::coding::{put_fixed32, put_varint32};
use crate::util::comparator::Comparator;

/// Builds a block of prefix-compressed entries.
///
/// Keys must arrive in comparator order. Every `restart_interval`-th
/// entry stores its full key and is recorded in the restart array so
/// readers can binary-search.
pub struct BlockBuilder {
    buffer: BytesMut,
    restarts: Vec<u32>,
    /// Entries since the last restart point.
    counter: usize,
    restart_interval: usize,
    comparator: Arc<dyn Comparator>,
    last_key: Vec<u8>,
    finished: bool,
}

impl BlockBuilder {
    /// Create a builder with the given restart interval.
    pub fn new(restart_interval: usize, comparator: Arc<dyn Comparator>) -> Self {
        debug_assert!(restart_interval >= 1);
        Self {
            buffer: BytesMut::new(),
            restarts: vec![0],
            counter: 0,
            restart_interval,
            comparator,
            last_key: Vec::new(),
            finished: false,
        }
    }

    /// Append an entry. `key` must order after every key added so far.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        debug_assert!(!self.finished);
        debug_assert!(self.counter <= self.restart_interval);
        debug_assert!(
            self.buffer.is_empty()
                || self.comparator.compare(key, &self.last_key) == std::cmp::Ordering::Greater,
            "keys must be added in order"
        );

        let shared = if self.counter < self.restart_interval {
            // Shared prefix with the previous key.
            let min_len = std::cmp::min(self.last_key.len(), key.len());
            let mut shared = 0;
            while shared < min_len && self.last_key[shared] == key[shared] {
                shared += 1;
            }
            shared
        } else {
            // Restart point: store the full key.
            self.restarts.push(self.buffer.len() as u32);
            self.counter = 0;
            0
        };

        let non_shared = key.len() - shared;

        put_varint32(&mut self.buffer, shared as u32);
        put_varint32(&mut self.buffer, non_shared as u32);
        put_varint32(&mut self.buffer, value.len() as u32);
        self.buffer.put_slice(&key[shared..]);
        self.buffer.put_slice(value);

        self.last_key.truncate(shared);
        self.last_key.extend_from_slice(&key[shared..]);
        debug_assert_eq!(self.last_key, key);
        self.counter += 1;
    }

    /// Whether no entries have been added since the last reset.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Size the finished block would have right now, including the
    /// restart array and its length word.
    pub fn current_size_estimate(&self) -> usize {
        self.buffer.len() + self.restarts.len() * 4 + 4
    }

    /// Append the restart array and return the block contents.
    pub fn finish(&mut self) -> Bytes {
        debug_assert!(!self.finished);
        self.finished = true;

        for &restart in &self.restarts {
            put_fixed32(&mut self.buffer, restart);
        }
        put_fixed32(&mut self.buffer, self.restarts.len() as u32);

        self.buffer.split().freeze()
    }

    /// Reset for building another block.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.restarts.clear();
        self.restarts.push(0);
        self.counter = 0;
        self.last_key.clear();
        self.finished = false;
    }
}
