//! # siltdb
//!
//! Core of an embedded, ordered key-value storage engine organized as a
//! log-structured merge system. The crate provides the on-disk storage
//! layer and its in-memory collaborators:
//!
//! - internal keys coupling each user key with a sequence number and
//!   type tag, and the comparator ordering them;
//! - a block-framed write-ahead log with a resynchronising reader;
//! - atomic write batches that serve as both WAL payload and memtable
//!   input;
//! - a memtable over a lock-free-read skip list backed by an arena;
//! - sorted table files with prefix-compressed blocks, Bloom filters, an
//!   index block and a fixed footer;
//! - a sharded LRU block cache with pinned entries;
//! - a snapshot list bounding read visibility.
//!
//! Compaction scheduling, version management, recovery orchestration and
//! the public database façade are intentionally out of scope; they sit
//! on top of these pieces.
//!
//! ## Example
//!
//! ```rust,ignore
//! use siltdb::{LookupKey, MemTable, ValueType, WriteBatch};
//! use siltdb::util::comparator::InternalKeyComparator;
//!
//! let mem = MemTable::new(InternalKeyComparator::default());
//! mem.add(1, ValueType::Value, b"hello", b"world");
//! let result = mem.get(&LookupKey::new(b"hello", 1));
//! ```

pub mod error;
pub mod options;
pub mod types;

pub mod cache;
pub mod memtable;
pub mod snapshot;
pub mod sstable;
pub mod util;
pub mod wal;

pub use error::{Error, Result};
pub use options::{Options, ReadOptions, SyncMode};
pub use types::{
    BatchHandler, InternalKey, LookupKey, LookupResult, ParsedInternalKey, SequenceNumber,
    ValueType, WriteBatch, MAX_SEQUENCE,
};

pub use cache::{BlockCache, CacheHandle, LruCache};
pub use memtable::{MemTable, MemTableInserter};
pub use snapshot::{Snapshot, SnapshotList};
pub use sstable::{
    Block, BlockBuilder, BlockHandle, CompressionType, SSTableReader, SSTableWriter,
};
pub use wal::{Reporter, WalReader, WalWriter};
