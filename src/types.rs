//! Core types: internal keys, lookup keys and write batches.
//!
//! Every record inside the engine is addressed by an *internal key*:
//! the user key followed by a little-endian packed `(sequence << 8) | type`
//! word. The sequence number orders versions of the same user key; the
//! type distinguishes live values from tombstones.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::util::coding::{
    decode_fixed64, get_fixed32, get_fixed64, get_length_prefixed_slice,
    put_length_prefixed_slice, put_varint32_vec,
};

/// Sequence number of a write. 56 bits are available; the low byte of the
/// packed representation holds the value type.
pub type SequenceNumber = u64;

/// Maximum valid sequence number (`2^56 - 1`).
pub const MAX_SEQUENCE: SequenceNumber = (1 << 56) - 1;

/// Size in bytes of the packed (sequence, type) tag.
pub const TAG_SIZE: usize = 8;

/// Write-batch header: fixed64 sequence + fixed32 count.
pub const BATCH_HEADER_SIZE: usize = 12;

/// Value type tag in internal keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueType {
    /// Deletion marker (tombstone).
    Deletion = 0,
    /// Normal value.
    Value = 1,
}

impl ValueType {
    /// Create from the low byte of a packed tag.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(ValueType::Deletion),
            1 => Some(ValueType::Value),
            _ => None,
        }
    }

    /// Convert to the tag byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// The type used when building seek targets.
    ///
    /// `Value` is the numerically largest type, and the comparator orders
    /// types descending, so a seek tagged `Value` lands on any entry with
    /// an equal sequence regardless of its type.
    pub fn for_seek() -> Self {
        ValueType::Value
    }

    /// Check if this is a deletion marker.
    pub fn is_deletion(&self) -> bool {
        matches!(self, ValueType::Deletion)
    }
}

/// Pack a sequence number and value type into the 8-byte trailer word.
pub fn pack_sequence_and_type(sequence: SequenceNumber, value_type: ValueType) -> u64 {
    debug_assert!(sequence <= MAX_SEQUENCE);
    (sequence << 8) | value_type.to_byte() as u64
}

/// Append `user_key` plus the packed tag to `buf`, forming an internal key.
pub fn append_internal_key(
    buf: &mut Vec<u8>,
    user_key: &[u8],
    sequence: SequenceNumber,
    value_type: ValueType,
) {
    buf.extend_from_slice(user_key);
    buf.extend_from_slice(&pack_sequence_and_type(sequence, value_type).to_le_bytes());
}

/// The user-key portion of an encoded internal key.
///
/// Keys shorter than the tag are passed through unchanged; callers that
/// care validate via [`ParsedInternalKey::parse`].
pub fn extract_user_key(internal_key: &[u8]) -> &[u8] {
    if internal_key.len() < TAG_SIZE {
        internal_key
    } else {
        &internal_key[..internal_key.len() - TAG_SIZE]
    }
}

/// An internal key split into its parts, borrowing the user key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedInternalKey<'a> {
    /// The user-provided key.
    pub user_key: &'a [u8],
    /// Sequence number of the write.
    pub sequence: SequenceNumber,
    /// Value type.
    pub value_type: ValueType,
}

impl<'a> ParsedInternalKey<'a> {
    /// Parse an encoded internal key.
    ///
    /// Returns None when the key is too short or its type byte is out of
    /// range; such keys are treated as corrupt by callers.
    pub fn parse(internal_key: &'a [u8]) -> Option<Self> {
        if internal_key.len() < TAG_SIZE {
            return None;
        }
        let tag = decode_fixed64(&internal_key[internal_key.len() - TAG_SIZE..])?;
        let value_type = ValueType::from_byte((tag & 0xFF) as u8)?;
        Some(Self {
            user_key: &internal_key[..internal_key.len() - TAG_SIZE],
            sequence: tag >> 8,
            value_type,
        })
    }
}

/// An owned internal key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalKey {
    rep: Vec<u8>,
}

impl InternalKey {
    /// Build an internal key from its parts.
    pub fn new(user_key: &[u8], sequence: SequenceNumber, value_type: ValueType) -> Self {
        let mut rep = Vec::with_capacity(user_key.len() + TAG_SIZE);
        append_internal_key(&mut rep, user_key, sequence, value_type);
        Self { rep }
    }

    /// Adopt an already-encoded internal key.
    pub fn decode_from(encoded: &[u8]) -> Self {
        Self {
            rep: encoded.to_vec(),
        }
    }

    /// The encoded representation.
    pub fn encode(&self) -> &[u8] {
        &self.rep
    }

    /// The user-key portion.
    pub fn user_key(&self) -> &[u8] {
        extract_user_key(&self.rep)
    }

    /// Split into parts; None marks a corrupt key.
    pub fn parse(&self) -> Option<ParsedInternalKey<'_>> {
        ParsedInternalKey::parse(&self.rep)
    }
}

/// A probe key for memtable and table lookups.
///
/// One buffer carries all three layouts a lookup needs:
///
/// ```text
/// varint32(|user_key| + 8) | user_key | packed(sequence, seek type)
/// ^ memtable_key           ^ user_key |
///          internal_key:   <-------------------->
/// ```
pub struct LookupKey {
    data: Vec<u8>,
    // Offset where the user key begins (end of the varint prefix).
    kstart: usize,
}

impl LookupKey {
    /// Build a lookup key for `user_key` at snapshot `sequence`.
    pub fn new(user_key: &[u8], sequence: SequenceNumber) -> Self {
        let internal_len = user_key.len() + TAG_SIZE;
        let mut data = Vec::with_capacity(5 + internal_len);
        put_varint32_vec(&mut data, internal_len as u32);
        let kstart = data.len();
        append_internal_key(&mut data, user_key, sequence, ValueType::for_seek());
        Self { data, kstart }
    }

    /// The full length-prefixed form consumed by memtable probes.
    pub fn memtable_key(&self) -> &[u8] {
        &self.data
    }

    /// The internal-key form consumed by table probes.
    pub fn internal_key(&self) -> &[u8] {
        &self.data[self.kstart..]
    }

    /// The bare user key.
    pub fn user_key(&self) -> &[u8] {
        &self.data[self.kstart..self.data.len() - TAG_SIZE]
    }
}

/// Result of a point lookup against a memtable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupResult {
    /// A live value was found.
    Found(Bytes),
    /// A tombstone masks the key.
    Deleted,
    /// No entry for the key.
    NotFound,
}

impl LookupResult {
    /// Check if a live value was found.
    pub fn is_found(&self) -> bool {
        matches!(self, LookupResult::Found(_))
    }

    /// The value, if one was found.
    pub fn value(&self) -> Option<&Bytes> {
        match self {
            LookupResult::Found(v) => Some(v),
            _ => None,
        }
    }
}

/// Callback interface for [`WriteBatch::iterate`].
pub trait BatchHandler {
    /// A put record at the given sequence.
    fn put(&mut self, sequence: SequenceNumber, key: &[u8], value: &[u8]);
    /// A deletion record at the given sequence.
    fn delete(&mut self, sequence: SequenceNumber, key: &[u8]);
}

/// An atomic batch of write operations.
///
/// The serialized form doubles as the WAL payload and the memtable input:
///
/// ```text
/// fixed64 sequence | fixed32 count | record*
/// record := tag(1) | varstring key [| varstring value]
/// ```
///
/// where the value is present only for `Value` tags and a `varstring` is a
/// varint32 length followed by that many bytes.
#[derive(Debug, Clone)]
pub struct WriteBatch {
    rep: BytesMut,
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteBatch {
    /// Create an empty batch.
    pub fn new() -> Self {
        let mut rep = BytesMut::with_capacity(BATCH_HEADER_SIZE);
        rep.resize(BATCH_HEADER_SIZE, 0);
        Self { rep }
    }

    /// Reconstruct a batch from its serialized form (e.g. a WAL record).
    ///
    /// Content is validated lazily by [`WriteBatch::iterate`].
    pub fn from_contents(contents: &[u8]) -> Result<Self> {
        if contents.len() < BATCH_HEADER_SIZE {
            return Err(Error::corruption("write batch shorter than header"));
        }
        Self::from_bytes(BytesMut::from(contents))
    }

    fn from_bytes(rep: BytesMut) -> Result<Self> {
        Ok(Self { rep })
    }

    /// Add a put record.
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.put_u8(ValueType::Value.to_byte());
        put_length_prefixed_slice(&mut self.rep, key);
        put_length_prefixed_slice(&mut self.rep, value);
    }

    /// Add a deletion record.
    pub fn delete(&mut self, key: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.put_u8(ValueType::Deletion.to_byte());
        put_length_prefixed_slice(&mut self.rep, key);
    }

    /// Append all records of `other` to this batch.
    pub fn append(&mut self, other: &WriteBatch) {
        self.set_count(self.count() + other.count());
        self.rep.extend_from_slice(&other.rep[BATCH_HEADER_SIZE..]);
    }

    /// Drop all records, keeping the buffer.
    pub fn clear(&mut self) {
        self.rep.clear();
        self.rep.resize(BATCH_HEADER_SIZE, 0);
    }

    /// Number of records in the batch.
    pub fn count(&self) -> u32 {
        let mut header = &self.rep[8..BATCH_HEADER_SIZE];
        get_fixed32(&mut header).unwrap_or(0)
    }

    fn set_count(&mut self, count: u32) {
        self.rep[8..BATCH_HEADER_SIZE].copy_from_slice(&count.to_le_bytes());
    }

    /// Sequence number assigned to the first record.
    pub fn sequence(&self) -> SequenceNumber {
        let mut header = &self.rep[..8];
        get_fixed64(&mut header).unwrap_or(0)
    }

    /// Assign the sequence number of the first record; later records take
    /// consecutive numbers.
    pub fn set_sequence(&mut self, sequence: SequenceNumber) {
        self.rep[..8].copy_from_slice(&sequence.to_le_bytes());
    }

    /// Serialized size in bytes.
    pub fn size(&self) -> usize {
        self.rep.len()
    }

    /// Check if the batch holds no records.
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// The serialized form, suitable as a WAL payload.
    pub fn contents(&self) -> &[u8] {
        &self.rep
    }

    /// Walk all records in order, handing each to `handler` with the
    /// sequence number it commits at.
    ///
    /// Fails with `Corruption` when the buffer is shorter than its header,
    /// a record carries an unknown tag, a varstring is malformed, or the
    /// header count disagrees with the records present.
    pub fn iterate(&self, handler: &mut dyn BatchHandler) -> Result<()> {
        if self.rep.len() < BATCH_HEADER_SIZE {
            return Err(Error::corruption("write batch shorter than header"));
        }

        let sequence = self.sequence();
        let expected = self.count();
        let mut input = &self.rep[BATCH_HEADER_SIZE..];
        let mut found: u32 = 0;

        while !input.is_empty() {
            let tag = input[0];
            input = &input[1..];

            match ValueType::from_byte(tag) {
                Some(ValueType::Value) => {
                    let key = get_length_prefixed_slice(&mut input)
                        .ok_or_else(|| Error::corruption("bad write batch put key"))?;
                    let value = get_length_prefixed_slice(&mut input)
                        .ok_or_else(|| Error::corruption("bad write batch put value"))?;
                    handler.put(sequence + found as u64, key, value);
                }
                Some(ValueType::Deletion) => {
                    let key = get_length_prefixed_slice(&mut input)
                        .ok_or_else(|| Error::corruption("bad write batch delete key"))?;
                    handler.delete(sequence + found as u64, key);
                }
                None => {
                    return Err(Error::corruption2(
                        "unknown write batch tag",
                        format!("{}", tag),
                    ));
                }
            }
            found += 1;
        }

        if found != expected {
            return Err(Error::corruption("write batch count mismatch"));
        }
        Ok(())
    }
}
