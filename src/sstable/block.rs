//! Data block reading.
//!
//! A block body is a run of prefix-compressed entries followed by a
//! restart array and its length:
//!
//! ```text
//! entry := varint32 shared | varint32 non_shared | varint32 value_len
//!          | key_delta[non_shared] | value[value_len]
//! trailer := fixed32 restart_offset[num_restarts] | fixed32 num_restarts
//! ```
//!
//! Entries at restart offsets store their full key (`shared = 0`), which
//! is what lets `seek` binary-search the restart array before scanning.

use std::cmp::Ordering;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::util::coding::{decode_fixed32, get_varint32, get_varint64, put_varint64};
use crate::util::comparator::Comparator;

/// Locates a block within a table file: varint64 offset, varint64 size.
/// The size excludes the 5-byte trailer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockHandle {
    offset: u64,
    size: u64,
}

impl BlockHandle {
    /// Largest encoded form: two maximal varint64s.
    pub const MAX_ENCODED_LENGTH: usize = 10 + 10;

    /// Create a handle.
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// Byte offset of the block within the file.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Size of the block, excluding its trailer.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Append the varint encoding to `buf`.
    pub fn encode_to(&self, buf: &mut BytesMut) {
        put_varint64(buf, self.offset);
        put_varint64(buf, self.size);
    }

    /// The varint encoding as an owned buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::MAX_ENCODED_LENGTH);
        self.encode_to(&mut buf);
        buf.freeze()
    }

    /// Decode from the front of `data`, advancing it.
    pub fn decode_from(data: &mut &[u8]) -> Result<Self> {
        let offset = get_varint64(data).ok_or_else(|| Error::corruption("bad block handle"))?;
        let size = get_varint64(data).ok_or_else(|| Error::corruption("bad block handle"))?;
        Ok(Self { offset, size })
    }
}

/// An in-memory block: decompressed contents plus the parsed restart array.
///
/// Cheap to share; iterators hold a reference-counted view of the
/// contents, so a block handed out by the cache stays alive as long as
/// any iterator over it.
#[derive(Debug)]
pub struct Block {
    data: Bytes,
    /// Offset of the restart array within `data`.
    restart_offset: usize,
    num_restarts: u32,
}

impl Block {
    /// Parse block contents (without the on-disk trailer).
    pub fn new(data: Bytes) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::corruption("block too short"));
        }

        let num_restarts = decode_fixed32(&data[data.len() - 4..])
            .ok_or_else(|| Error::corruption("block too short"))?;

        let max_restarts = (data.len() - 4) / 4;
        if num_restarts as usize > max_restarts {
            return Err(Error::corruption("bad restart count in block"));
        }

        let restart_offset = data.len() - 4 - num_restarts as usize * 4;
        Ok(Self {
            data,
            restart_offset,
            num_restarts,
        })
    }

    /// Size of the block contents in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Number of restart points.
    pub fn num_restarts(&self) -> u32 {
        self.num_restarts
    }

    fn restart_point(&self, index: u32) -> u32 {
        debug_assert!(index < self.num_restarts);
        let offset = self.restart_offset + index as usize * 4;
        decode_fixed32(&self.data[offset..]).unwrap_or(0)
    }

    /// Create an iterator ordered by `comparator`.
    pub fn iter(&self, comparator: Arc<dyn Comparator>) -> BlockIterator {
        BlockIterator::new(
            self.data.clone(),
            self.restart_offset,
            self.num_restarts,
            comparator,
        )
    }
}

/// Cursor over a block's entries.
///
/// The key is rebuilt in an owned buffer on every step (prefix + delta);
/// the value is a view into the block contents, valid until the iterator
/// moves.
pub struct BlockIterator {
    data: Bytes,
    comparator: Arc<dyn Comparator>,
    restart_offset: usize,
    num_restarts: u32,

    /// Offset of the current entry, `restart_offset` when exhausted.
    current: usize,
    /// Restart block containing the current entry.
    restart_index: u32,
    key: Vec<u8>,
    value_offset: usize,
    value_len: usize,
    status: Result<()>,
}

impl BlockIterator {
    fn new(
        data: Bytes,
        restart_offset: usize,
        num_restarts: u32,
        comparator: Arc<dyn Comparator>,
    ) -> Self {
        Self {
            data,
            comparator,
            restart_offset,
            num_restarts,
            current: restart_offset,
            restart_index: num_restarts,
            key: Vec::new(),
            value_offset: 0,
            value_len: 0,
            status: Ok(()),
        }
    }

    /// Whether the iterator is positioned at an entry.
    pub fn valid(&self) -> bool {
        self.current < self.restart_offset && self.status.is_ok()
    }

    /// Deferred corruption, surfaced after the iterator invalidates.
    pub fn status(&self) -> Result<()> {
        self.status.clone()
    }

    /// The current entry's key. Requires `valid()`.
    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        &self.key
    }

    /// The current entry's value. Requires `valid()`.
    pub fn value(&self) -> &[u8] {
        debug_assert!(self.valid());
        &self.data[self.value_offset..self.value_offset + self.value_len]
    }

    fn restart_point(&self, index: u32) -> u32 {
        let offset = self.restart_offset + index as usize * 4;
        decode_fixed32(&self.data[offset..]).unwrap_or(0)
    }

    /// Offset just past the current entry.
    fn next_entry_offset(&self) -> usize {
        self.value_offset + self.value_len
    }

    fn seek_to_restart_point(&mut self, index: u32) {
        self.key.clear();
        self.restart_index = index;
        // Position parsing at the restart; value fields are set so that
        // next_entry_offset lands there.
        self.value_offset = self.restart_point(index) as usize;
        self.value_len = 0;
    }

    fn corruption(&mut self) {
        self.current = self.restart_offset;
        self.restart_index = self.num_restarts;
        self.status = Err(Error::corruption("bad entry in block"));
        self.key.clear();
    }

    /// Decode the entry at `next_entry_offset`, extending the key buffer.
    /// Returns false at the end of the entry area or on corruption.
    fn parse_next_key(&mut self) -> bool {
        self.current = self.next_entry_offset();
        if self.current >= self.restart_offset {
            // No more entries; mark exhausted.
            self.current = self.restart_offset;
            self.restart_index = self.num_restarts;
            return false;
        }

        let mut cursor = &self.data[self.current..self.restart_offset];
        let before = cursor.len();

        let header = (
            get_varint32(&mut cursor),
            get_varint32(&mut cursor),
            get_varint32(&mut cursor),
        );
        let (Some(shared), Some(non_shared), Some(value_len)) = header else {
            self.corruption();
            return false;
        };
        let (shared, non_shared, value_len) =
            (shared as usize, non_shared as usize, value_len as usize);

        if self.key.len() < shared || cursor.len() < non_shared + value_len {
            self.corruption();
            return false;
        }

        let header_len = before - cursor.len();
        let delta_offset = self.current + header_len;

        self.key.truncate(shared);
        self.key
            .extend_from_slice(&self.data[delta_offset..delta_offset + non_shared]);
        self.value_offset = delta_offset + non_shared;
        self.value_len = value_len;

        // Track which restart block we are in.
        while self.restart_index + 1 < self.num_restarts
            && self.restart_point(self.restart_index + 1) as usize <= self.current
        {
            self.restart_index += 1;
        }
        true
    }

    /// Position at the first entry.
    pub fn seek_to_first(&mut self) {
        if self.num_restarts == 0 {
            self.current = self.restart_offset;
            return;
        }
        self.seek_to_restart_point(0);
        self.parse_next_key();
    }

    /// Position at the last entry.
    pub fn seek_to_last(&mut self) {
        if self.num_restarts == 0 {
            self.current = self.restart_offset;
            return;
        }
        self.seek_to_restart_point(self.num_restarts - 1);
        // Scan forward within the final restart block.
        while self.parse_next_key() && self.next_entry_offset() < self.restart_offset {}
    }

    /// Position at the first entry with key >= target.
    pub fn seek(&mut self, target: &[u8]) {
        if self.num_restarts == 0 {
            self.current = self.restart_offset;
            return;
        }

        // Binary search the restart array for the last restart whose full
        // key is < target.
        let mut left = 0u32;
        let mut right = self.num_restarts - 1;
        while left < right {
            let mid = (left + right + 1) / 2;
            let region_offset = self.restart_point(mid) as usize;
            if region_offset >= self.restart_offset {
                self.corruption();
                return;
            }

            let mut cursor = &self.data[region_offset..self.restart_offset];
            let before = cursor.len();
            let header = (
                get_varint32(&mut cursor),
                get_varint32(&mut cursor),
                get_varint32(&mut cursor),
            );
            let (Some(shared), Some(non_shared), Some(_)) = header else {
                self.corruption();
                return;
            };
            if shared != 0 || cursor.len() < non_shared as usize {
                // Restart keys must be stored whole.
                self.corruption();
                return;
            }
            let header_len = before - cursor.len();
            let key_start = region_offset + header_len;
            let mid_key = &self.data[key_start..key_start + non_shared as usize];

            if self.comparator.compare(mid_key, target) == Ordering::Less {
                left = mid;
            } else {
                right = mid - 1;
            }
        }

        // Linear scan from the chosen restart.
        self.seek_to_restart_point(left);
        loop {
            if !self.parse_next_key() {
                return;
            }
            if self.comparator.compare(&self.key, target) != Ordering::Less {
                return;
            }
        }
    }

    /// Advance. Requires `valid()`.
    pub fn next(&mut self) {
        debug_assert!(self.valid());
        self.parse_next_key();
    }

    /// Retreat; costs a scan from the previous restart point.
    /// Requires `valid()`.
    pub fn prev(&mut self) {
        debug_assert!(self.valid());
        let original = self.current;

        // Back up to the restart point before the current entry.
        while self.restart_point(self.restart_index) as usize >= original {
            if self.restart_index == 0 {
                // No entries before the first one.
                self.current = self.restart_offset;
                self.restart_index = self.num_restarts;
                return;
            }
            self.restart_index -= 1;
        }

        self.seek_to_restart_point(self.restart_index);
        // Scan forward until the entry just before `original`.
        while self.parse_next_key() && self.next_entry_offset() < original {}
    }
}
