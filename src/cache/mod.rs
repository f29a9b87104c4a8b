//! Caching infrastructure.
//!
//! - [`LruCache`]: generic sharded LRU with pinned, charge-accounted
//!   entries;
//! - [`BlockCache`]: caches decompressed table blocks keyed by
//!   (table cache id, block offset).

mod block_cache;
mod lru;

pub use block_cache::BlockCache;
pub use lru::{CacheHandle, LruCache};
