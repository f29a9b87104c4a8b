//! Block cache for table data blocks.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use crate::sstable::Block;

use super::lru::{CacheHandle, LruCache};

/// Caches decompressed data blocks across all open tables.
///
/// Keys are 16 bytes: the owning table's cache id and the block's file
/// offset, both fixed64. Each entry is charged its decompressed size.
pub struct BlockCache {
    cache: Arc<LruCache<Block>>,
}

impl BlockCache {
    /// Create a cache bounded to `capacity` bytes of block data.
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: LruCache::new(capacity),
        }
    }

    /// Vend a process-unique id for a newly opened table.
    pub fn new_id(&self) -> u64 {
        self.cache.new_id()
    }

    fn cache_key(cache_id: u64, offset: u64) -> Bytes {
        let mut key = BytesMut::with_capacity(16);
        key.put_u64_le(cache_id);
        key.put_u64_le(offset);
        key.freeze()
    }

    /// Look up the block at (`cache_id`, `offset`), pinning it on a hit.
    pub fn lookup(&self, cache_id: u64, offset: u64) -> Option<CacheHandle<Block>> {
        self.cache.lookup(&Self::cache_key(cache_id, offset))
    }

    /// Insert a block, returning a pinning handle.
    pub fn insert(&self, cache_id: u64, offset: u64, block: Block) -> CacheHandle<Block> {
        let charge = block.size();
        self.cache
            .insert(Self::cache_key(cache_id, offset), block, charge)
    }

    /// Forget the block at (`cache_id`, `offset`).
    pub fn erase(&self, cache_id: u64, offset: u64) {
        self.cache.erase(&Self::cache_key(cache_id, offset));
    }

    /// Evict all unpinned blocks.
    pub fn prune(&self) {
        self.cache.prune();
    }

    /// Bytes of block data currently cached.
    pub fn total_charge(&self) -> usize {
        self.cache.total_charge()
    }
}
