//! MemTable: ordered in-memory store for recent writes.
//!
//! Entries are encoded into an arena and indexed by a skip list, so a
//! single writer can insert while any number of readers look up or scan
//! without locks. Each entry packs the internal key and value into one
//! arena allocation:
//!
//! ```text
//! varint32(|internal_key|) | user_key | packed(seq, type) | varint32(|value|) | value
//! ```
//!
//! Reads at a snapshot see the newest version at or before the snapshot's
//! sequence, a direct consequence of the internal-key ordering.

pub mod arena;
pub mod skiplist;

use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;

use bytes::Bytes;

use crate::types::{
    BatchHandler, LookupKey, LookupResult, SequenceNumber, ValueType,
    pack_sequence_and_type,
};
use crate::util::coding::{encode_varint32_to_array, varint_length};
use crate::util::comparator::{Comparator, InternalKeyComparator};

use arena::Arena;
use skiplist::{KeyComparator, SkipList, SkipListIterator};

/// Decode the varint32 length prefix at `p`, returning (payload, next).
///
/// # Safety
/// `p` must point at a length-prefixed buffer fully inside the arena.
unsafe fn decode_prefixed<'a>(p: *const u8) -> (&'a [u8], *const u8) {
    let mut len: u32 = 0;
    let mut shift = 0;
    let mut i = 0;
    loop {
        let byte = *p.add(i);
        i += 1;
        len |= ((byte & 0x7F) as u32) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    (
        std::slice::from_raw_parts(p.add(i), len as usize),
        p.add(i + len as usize),
    )
}

/// Skip-list comparator for encoded memtable entries: strip the length
/// prefix, then order by the internal-key comparator.
#[derive(Clone)]
pub struct MemtableKeyComparator {
    comparator: InternalKeyComparator,
}

impl KeyComparator for MemtableKeyComparator {
    unsafe fn compare_keys(&self, a: *const u8, b: *const u8) -> CmpOrdering {
        let (a_key, _) = decode_prefixed(a);
        let (b_key, _) = decode_prefixed(b);
        self.comparator.compare(a_key, b_key)
    }

    unsafe fn compare_key_with(&self, a: *const u8, b: &[u8]) -> CmpOrdering {
        let (a_key, _) = decode_prefixed(a);
        let mut b = b;
        match crate::util::coding::get_varint32(&mut b) {
            Some(len) => self.comparator.compare(a_key, &b[..len as usize]),
            None => CmpOrdering::Greater,
        }
    }
}

/// Mutable, ordered, in-memory store backed by a skip list over an arena.
///
/// One writer at a time may call [`MemTable::add`]; readers are wait-free.
/// Share across threads with `Arc`; the arena (and every view handed out)
/// lives until the last reference drops.
pub struct MemTable {
    comparator: InternalKeyComparator,
    list: SkipList<MemtableKeyComparator>,
}

impl MemTable {
    /// Create an empty memtable ordered by `comparator`.
    pub fn new(comparator: InternalKeyComparator) -> Self {
        let arena = Arc::new(Arena::new());
        let list = SkipList::new(
            MemtableKeyComparator {
                comparator: comparator.clone(),
            },
            arena,
        );
        Self { comparator, list }
    }

    /// Approximate bytes held by this memtable's arena.
    pub fn approximate_memory_usage(&self) -> usize {
        self.list.arena().memory_usage()
    }

    /// Insert an entry. Writer-side only; `(key, sequence, value_type)`
    /// must be strictly greater (in internal-key order) than any entry
    /// already present for the same user key.
    pub fn add(
        &self,
        sequence: SequenceNumber,
        value_type: ValueType,
        key: &[u8],
        value: &[u8],
    ) {
        let internal_key_size = key.len() + 8;
        let encoded_len = varint_length(internal_key_size as u64)
            + internal_key_size
            + varint_length(value.len() as u64)
            + value.len();

        let buf = self.list.arena().allocate(encoded_len);
        unsafe {
            let mut p = buf;

            let (prefix, len) = encode_varint32_to_array(internal_key_size as u32);
            std::ptr::copy_nonoverlapping(prefix.as_ptr(), p, len);
            p = p.add(len);

            std::ptr::copy_nonoverlapping(key.as_ptr(), p, key.len());
            p = p.add(key.len());

            let tag = pack_sequence_and_type(sequence, value_type).to_le_bytes();
            std::ptr::copy_nonoverlapping(tag.as_ptr(), p, 8);
            p = p.add(8);

            let (prefix, len) = encode_varint32_to_array(value.len() as u32);
            std::ptr::copy_nonoverlapping(prefix.as_ptr(), p, len);
            p = p.add(len);

            std::ptr::copy_nonoverlapping(value.as_ptr(), p, value.len());
            debug_assert_eq!(p.add(value.len()) as usize, buf as usize + encoded_len);

            self.list.insert(buf);
        }
    }

    /// Point lookup.
    ///
    /// Seeks directly to the newest entry at or before the lookup key's
    /// sequence; the comparator's descending-sequence tie-break makes a
    /// single seek sufficient. A tombstone yields `Deleted`, masking any
    /// older value.
    pub fn get(&self, key: &LookupKey) -> LookupResult {
        let mut iter = self.list.iter();
        iter.seek(key.memtable_key());
        if !iter.valid() {
            return LookupResult::NotFound;
        }

        unsafe {
            let (entry_key, value_ptr) = decode_prefixed(iter.key());
            let user_key = &entry_key[..entry_key.len() - 8];
            if self
                .comparator
                .user_comparator()
                .compare(user_key, key.user_key())
                != CmpOrdering::Equal
            {
                return LookupResult::NotFound;
            }

            let tag = u64::from_le_bytes(entry_key[entry_key.len() - 8..].try_into().unwrap());
            match ValueType::from_byte((tag & 0xFF) as u8) {
                Some(ValueType::Value) => {
                    let (value, _) = decode_prefixed(value_ptr);
                    LookupResult::Found(Bytes::copy_from_slice(value))
                }
                Some(ValueType::Deletion) => LookupResult::Deleted,
                None => LookupResult::NotFound,
            }
        }
    }

    /// Iterate over all entries in internal-key order.
    pub fn iter(&self) -> MemTableIterator<'_> {
        MemTableIterator {
            iter: self.list.iter(),
            scratch: Vec::new(),
        }
    }
}

/// Cursor over memtable entries.
///
/// Keys and values are views into the arena; they stay valid as long as
/// the memtable does, including across iterator steps.
pub struct MemTableIterator<'a> {
    iter: SkipListIterator<'a, MemtableKeyComparator>,
    scratch: Vec<u8>,
}

impl<'a> MemTableIterator<'a> {
    /// Whether the cursor is positioned at an entry.
    pub fn valid(&self) -> bool {
        self.iter.valid()
    }

    /// Position at the first entry >= the given internal key.
    pub fn seek(&mut self, internal_key: &[u8]) {
        self.scratch.clear();
        crate::util::coding::put_varint32_vec(&mut self.scratch, internal_key.len() as u32);
        self.scratch.extend_from_slice(internal_key);
        self.iter.seek(&self.scratch);
    }

    /// Position at the first entry.
    pub fn seek_to_first(&mut self) {
        self.iter.seek_to_first();
    }

    /// Position at the last entry.
    pub fn seek_to_last(&mut self) {
        self.iter.seek_to_last();
    }

    /// Advance. Requires `valid()`.
    pub fn next(&mut self) {
        self.iter.next();
    }

    /// Retreat. Requires `valid()`.
    pub fn prev(&mut self) {
        self.iter.prev();
    }

    /// The current entry's internal key. Requires `valid()`.
    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        unsafe { decode_prefixed(self.iter.key()).0 }
    }

    /// The current entry's value. Requires `valid()`.
    pub fn value(&self) -> &[u8] {
        debug_assert!(self.valid());
        unsafe {
            let (_, value_ptr) = decode_prefixed(self.iter.key());
            decode_prefixed(value_ptr).0
        }
    }
}

/// Applies a [`crate::types::WriteBatch`] into a memtable, record by
/// record, at the batch's assigned sequence numbers.
pub struct MemTableInserter<'a> {
    mem: &'a MemTable,
}

impl<'a> MemTableInserter<'a> {
    /// Create an inserter targeting `mem`.
    pub fn new(mem: &'a MemTable) -> Self {
        Self { mem }
    }
}

impl BatchHandler for MemTableInserter<'_> {
    fn put(&mut self, sequence: SequenceNumber, key: &[u8], value: &[u8]) {
        self.mem.add(sequence, ValueType::Value, key, value);
    }

    fn delete(&mut self, sequence: SequenceNumber, key: &[u8]) {
        self.mem.add(sequence, ValueType::Deletion, key, &[]);
    }
}
