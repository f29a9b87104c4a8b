//! Sorted tables: immutable on-disk files of ordered key-value entries.
//!
//! # File layout
//!
//! ```text
//! +---------------------+
//! | data block 1        |
//! +---------------------+
//! | ...                 |
//! +---------------------+
//! | data block N        |
//! +---------------------+
//! | filter block        |  (optional meta block)
//! +---------------------+
//! | metaindex block     |  (meta block name -> handle)
//! +---------------------+
//! | index block         |  (separator key -> data block handle)
//! +---------------------+
//! | footer (48 bytes)   |
//! +---------------------+
//! ```
//!
//! Every block on disk is followed by a 5-byte trailer: a compression
//! type byte and a masked CRC32 over the block contents plus that byte.
//! The footer holds the metaindex and index handles (varint-encoded,
//! zero-padded to 40 bytes) and an 8-byte magic number.

mod block;
mod block_builder;
mod filter_block;
mod iterator;
mod reader;
mod writer;

pub use block::{Block, BlockHandle, BlockIterator};
pub use block_builder::BlockBuilder;
pub use filter_block::{FilterBlockBuilder, FilterBlockReader};
pub use iterator::SSTableIterator;
pub use reader::SSTableReader;
pub use writer::{SSTableInfo, SSTableWriter};

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::util::coding::{decode_fixed64, put_fixed64};

/// Magic number closing every table file.
pub const FOOTER_MAGIC: u64 = 0xdb4775248b80fb57;

/// Encoded footer size: two zero-padded handles plus the magic.
pub const FOOTER_SIZE: usize = 2 * BlockHandle::MAX_ENCODED_LENGTH + 8;

/// Per-block trailer: compression type (1) + masked CRC32 (4).
pub const BLOCK_TRAILER_SIZE: usize = 5;

/// Metaindex key prefix for filter blocks; the policy name follows.
pub const FILTER_KEY_PREFIX: &str = "filter.";

/// Metaindex key recording the comparator the table was built with.
pub const COMPARATOR_KEY: &str = "comparator";

/// Block compression codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CompressionType {
    /// Stored uncompressed.
    #[default]
    None = 0,
    /// Snappy.
    Snappy = 1,
    /// LZ4.
    Lz4 = 2,
}

impl CompressionType {
    /// Create from the trailer byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(CompressionType::None),
            1 => Some(CompressionType::Snappy),
            2 => Some(CompressionType::Lz4),
            _ => None,
        }
    }

    /// Convert to the trailer byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// Fixed-size table footer locating the metaindex and index blocks.
#[derive(Debug, Clone)]
pub struct Footer {
    /// Handle of the metaindex block.
    pub metaindex_handle: BlockHandle,
    /// Handle of the index block.
    pub index_handle: BlockHandle,
}

impl Footer {
    /// Create a footer from the two handles.
    pub fn new(metaindex_handle: BlockHandle, index_handle: BlockHandle) -> Self {
        Self {
            metaindex_handle,
            index_handle,
        }
    }

    /// Encode to the fixed 48-byte representation.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FOOTER_SIZE);
        self.metaindex_handle.encode_to(&mut buf);
        self.index_handle.encode_to(&mut buf);
        buf.resize(FOOTER_SIZE - 8, 0);
        put_fixed64(&mut buf, FOOTER_MAGIC);
        debug_assert_eq!(buf.len(), FOOTER_SIZE);
        buf.freeze()
    }

    /// Decode from exactly [`FOOTER_SIZE`] bytes.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < FOOTER_SIZE {
            return Err(Error::corruption("footer too short"));
        }

        let magic = decode_fixed64(&data[FOOTER_SIZE - 8..])
            .ok_or_else(|| Error::corruption("footer too short"))?;
        if magic != FOOTER_MAGIC {
            return Err(Error::corruption("not an sstable (bad magic number)"));
        }

        let mut cursor = data;
        let metaindex_handle = BlockHandle::decode_from(&mut cursor)?;
        let index_handle = BlockHandle::decode_from(&mut cursor)?;

        Ok(Self {
            metaindex_handle,
            index_handle,
        })
    }
}
