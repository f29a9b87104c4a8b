//! Configuration options for siltdb.

use std::sync::Arc;

use crate::sstable::CompressionType;
use crate::util::comparator::{BytewiseComparator, Comparator};
use crate::util::filter::FilterPolicy;

/// Default target size for uncompressed data blocks.
pub const DEFAULT_BLOCK_SIZE: usize = 4 * 1024;

/// Default number of entries between restart points in data blocks.
pub const DEFAULT_BLOCK_RESTART_INTERVAL: usize = 16;

/// Restart interval for index blocks: every entry is a restart point so
/// binary search always lands on full keys.
pub const INDEX_BLOCK_RESTART_INTERVAL: usize = 1;

/// Default bloom filter budget in bits per key.
pub const DEFAULT_BLOOM_BITS_PER_KEY: usize = 10;

/// WAL sync policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Sync after every record (safest, slowest).
    Always,
    /// Sync after roughly this many bytes have been appended.
    Bytes {
        /// Byte threshold between syncs.
        bytes: usize,
    },
    /// Leave syncing to the caller and the OS.
    #[default]
    None,
}

/// Options controlling table construction and reads.
#[derive(Clone)]
pub struct Options {
    /// Ordering over keys. Tables record the comparator's name and refuse
    /// to open under a different one.
    pub comparator: Arc<dyn Comparator>,

    /// Filter policy for table filter blocks, or None to skip filters.
    pub filter_policy: Option<Arc<dyn FilterPolicy>>,

    /// Target size of uncompressed data blocks.
    pub block_size: usize,

    /// Entries between restart points in data blocks.
    pub block_restart_interval: usize,

    /// Compression applied to data blocks.
    pub compression: CompressionType,

    /// Verify block checksums on every read.
    pub paranoid_checks: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            comparator: Arc::new(BytewiseComparator::new()),
            filter_policy: None,
            block_size: DEFAULT_BLOCK_SIZE,
            block_restart_interval: DEFAULT_BLOCK_RESTART_INTERVAL,
            compression: CompressionType::None,
            paranoid_checks: false,
        }
    }
}

/// Options for an individual read.
#[derive(Debug, Clone, Copy)]
pub struct ReadOptions {
    /// Verify the checksum of every block touched by this read.
    pub verify_checksums: bool,

    /// Insert blocks read from disk into the block cache.
    pub fill_cache: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            verify_checksums: false,
            fill_cache: true,
        }
    }
}
