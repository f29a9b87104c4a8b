//! Sharded LRU cache with pinned entries.
//!
//! The cache is split into 16 shards selected by the top 4 bits of the
//! key hash; each shard is an independent LRU behind its own mutex.
//!
//! Within a shard every entry is on exactly one of two circular lists:
//!
//! - `in_use`: entries pinned by at least one live handle
//!   (`refs >= 2`, counting the cache's own reference);
//! - `lru`: cached but unpinned entries (`refs == 1`), eviction order.
//!
//! An entry leaves `in_use` for `lru` when its last handle drops, and
//! moves back on a hit. Eviction only ever takes the oldest `lru` entry,
//! so pinned entries are never evicted no matter how far a shard is over
//! capacity. An erased entry survives, off both lists, until its last
//! handle drops.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::util::hash::hash;

const NUM_SHARD_BITS: u32 = 4;
const NUM_SHARDS: usize = 1 << NUM_SHARD_BITS;

/// Slot index of the lru-list sentinel.
const LRU: usize = 0;
/// Slot index of the in-use-list sentinel.
const IN_USE: usize = 1;

struct EntryData<T> {
    key: Bytes,
    value: Arc<T>,
    charge: usize,
    /// References held: one for the cache while `in_cache`, one per
    /// outstanding handle.
    refs: u32,
    /// The cache still indexes this entry.
    in_cache: bool,
}

struct Slot<T> {
    prev: usize,
    next: usize,
    data: Option<EntryData<T>>,
}

struct LruShard<T> {
    capacity: usize,
    usage: usize,
    table: HashMap<Bytes, usize>,
    /// Slot arena; slots 0 and 1 are the list sentinels.
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
}

impl<T> LruShard<T> {
    fn new(capacity: usize) -> Self {
        let slots = vec![
            Slot { prev: LRU, next: LRU, data: None },
            Slot { prev: IN_USE, next: IN_USE, data: None },
        ];
        Self {
            capacity,
            usage: 0,
            table: HashMap::new(),
            slots,
            free: Vec::new(),
        }
    }

    fn data(&self, slot: usize) -> &EntryData<T> {
        self.slots[slot].data.as_ref().expect("empty cache slot")
    }

    fn data_mut(&mut self, slot: usize) -> &mut EntryData<T> {
        self.slots[slot].data.as_mut().expect("empty cache slot")
    }

    fn list_remove(&mut self, slot: usize) {
        let (prev, next) = (self.slots[slot].prev, self.slots[slot].next);
        self.slots[prev].next = next;
        self.slots[next].prev = prev;
    }

    /// Insert `slot` as the newest entry of the list anchored at `head`.
    fn list_append(&mut self, head: usize, slot: usize) {
        let tail = self.slots[head].prev;
        self.slots[slot].prev = tail;
        self.slots[slot].next = head;
        self.slots[tail].next = slot;
        self.slots[head].prev = slot;
    }

    fn alloc_slot(&mut self, data: EntryData<T>) -> usize {
        if let Some(slot) = self.free.pop() {
            self.slots[slot].data = Some(data);
            slot
        } else {
            self.slots.push(Slot {
                prev: 0,
                next: 0,
                data: Some(data),
            });
            self.slots.len() - 1
        }
    }

    fn ref_entry(&mut self, slot: usize) {
        let entry = self.data(slot);
        if entry.refs == 1 && entry.in_cache {
            // Gaining its first handle: lru -> in_use.
            self.list_remove(slot);
            self.list_append(IN_USE, slot);
        }
        self.data_mut(slot).refs += 1;
    }

    fn unref(&mut self, slot: usize) {
        let entry = self.data_mut(slot);
        debug_assert!(entry.refs > 0);
        entry.refs -= 1;

        if entry.refs == 0 {
            // Only reachable after erase; the entry is on no list.
            debug_assert!(!entry.in_cache);
            self.slots[slot].data = None;
            self.free.push(slot);
        } else if entry.in_cache && entry.refs == 1 {
            // Last handle gone: in_use -> lru.
            self.list_remove(slot);
            self.list_append(LRU, slot);
        }
    }

    /// Detach an entry already removed from the hash table.
    fn finish_erase(&mut self, slot: usize) {
        let entry = self.data_mut(slot);
        debug_assert!(entry.in_cache);
        entry.in_cache = false;
        let charge = entry.charge;
        self.list_remove(slot);
        self.usage -= charge;
        self.unref(slot);
    }

    fn lookup(&mut self, key: &[u8]) -> Option<usize> {
        let slot = *self.table.get(key)?;
        self.ref_entry(slot);
        Some(slot)
    }

    fn insert(&mut self, key: Bytes, value: Arc<T>, charge: usize) -> usize {
        let cache_it = self.capacity > 0;
        let slot = self.alloc_slot(EntryData {
            key: key.clone(),
            value,
            charge,
            // One for the returned handle, one for the cache itself.
            refs: if cache_it { 2 } else { 1 },
            in_cache: cache_it,
        });

        if cache_it {
            self.list_append(IN_USE, slot);
            self.usage += charge;
            if let Some(old) = self.table.insert(key, slot) {
                self.finish_erase(old);
            }
        }
        // Capacity zero turns caching off; the entry lives only as long
        // as its handle.

        while self.usage > self.capacity && self.slots[LRU].next != LRU {
            let oldest = self.slots[LRU].next;
            let old_key = self.data(oldest).key.clone();
            debug_assert_eq!(self.data(oldest).refs, 1);
            self.table.remove(&old_key);
            self.finish_erase(oldest);
        }

        slot
    }

    fn erase(&mut self, key: &[u8]) {
        if let Some(slot) = self.table.remove(key) {
            self.finish_erase(slot);
        }
    }

    fn prune(&mut self) {
        while self.slots[LRU].next != LRU {
            let slot = self.slots[LRU].next;
            debug_assert_eq!(self.data(slot).refs, 1);
            let key = self.data(slot).key.clone();
            self.table.remove(&key);
            self.finish_erase(slot);
        }
    }
}

/// Sharded, charge-accounted LRU cache.
///
/// Values are shared out as `Arc<T>` through pinning [`CacheHandle`]s.
/// Construct inside an `Arc`; handle-producing operations take
/// `&Arc<Self>` so handles can release themselves on drop.
pub struct LruCache<T> {
    shards: Vec<Mutex<LruShard<T>>>,
    id_counter: Mutex<u64>,
}

impl<T> LruCache<T> {
    /// Create a cache with `capacity` total charge, split evenly across
    /// the shards.
    pub fn new(capacity: usize) -> Arc<Self> {
        let per_shard = (capacity + NUM_SHARDS - 1) / NUM_SHARDS;
        Arc::new(Self {
            shards: (0..NUM_SHARDS)
                .map(|_| Mutex::new(LruShard::new(per_shard)))
                .collect(),
            id_counter: Mutex::new(0),
        })
    }

    fn shard_index(key: &[u8]) -> usize {
        (hash(key, 0) >> (32 - NUM_SHARD_BITS)) as usize
    }

    /// Insert an entry, evicting unpinned entries as needed in the same
    /// call. Returns a handle pinning the new entry.
    ///
    /// An entry whose charge exceeds shard capacity is still admitted; it
    /// ages out once unpinned and pressure arrives.
    pub fn insert(self: &Arc<Self>, key: Bytes, value: T, charge: usize) -> CacheHandle<T> {
        let shard = Self::shard_index(&key);
        let value = Arc::new(value);
        let slot = self.shards[shard].lock().insert(key, value.clone(), charge);
        CacheHandle {
            cache: Arc::clone(self),
            shard,
            slot,
            value,
        }
    }

    /// Look up an entry, pinning it on a hit.
    pub fn lookup(self: &Arc<Self>, key: &[u8]) -> Option<CacheHandle<T>> {
        let shard = Self::shard_index(key);
        let mut guard = self.shards[shard].lock();
        let slot = guard.lookup(key)?;
        let value = guard.data(slot).value.clone();
        Some(CacheHandle {
            cache: Arc::clone(self),
            shard,
            slot,
            value,
        })
    }

    /// Drop the cache's reference to `key`. Outstanding handles keep the
    /// value alive; the entry is gone for future lookups immediately.
    pub fn erase(&self, key: &[u8]) {
        self.shards[Self::shard_index(key)].lock().erase(key);
    }

    /// Evict everything not currently pinned.
    pub fn prune(&self) {
        for shard in &self.shards {
            shard.lock().prune();
        }
    }

    /// Combined charge of all cached entries.
    pub fn total_charge(&self) -> usize {
        self.shards.iter().map(|s| s.lock().usage).sum()
    }

    /// Vend a process-unique id for composing cache keys.
    pub fn new_id(&self) -> u64 {
        let mut counter = self.id_counter.lock();
        *counter += 1;
        *counter
    }

    fn release(&self, shard: usize, slot: usize) {
        self.shards[shard].lock().unref(slot);
    }
}

/// A pin on a cache entry.
///
/// Dereferences to the cached value. The pin is released when the handle
/// drops; each handle releases exactly once.
pub struct CacheHandle<T> {
    cache: Arc<LruCache<T>>,
    shard: usize,
    slot: usize,
    value: Arc<T>,
}

impl<T> CacheHandle<T> {
    /// The cached value, independent of the pin's lifetime.
    pub fn value(&self) -> &Arc<T> {
        &self.value
    }
}

impl<T> Deref for CacheHandle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> Drop for CacheHandle<T> {
    fn drop(&mut self) {
        self.cache.release(self.shard, self.slot);
    }
}
