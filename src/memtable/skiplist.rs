//! Concurrent skip list over arena-resident keys.
//!
//! Keys are raw pointers into an [`Arena`]; the list never copies or frees
//! them. The concurrency contract is single-writer / many-reader: writers
//! are serialized externally, readers run lock-free. Writers publish new
//! nodes with release stores and readers traverse with acquire loads, so a
//! reader never observes a node before its contents are written. Nodes are
//! never unlinked or mutated after insertion (other than their forward
//! pointers), and nothing is freed until the arena dies — which is what
//! makes reads safe without reference counting.

use std::cmp::Ordering as CmpOrdering;
use std::ptr::{self, null_mut};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;

use super::arena::Arena;

/// Maximum tower height of any node.
pub const MAX_HEIGHT: usize = 12;

/// Branching factor: each level keeps roughly a quarter of the one below.
const BRANCHING: u32 = 4;

/// Ordering over the encoded keys the list stores.
///
/// Implementations decode the pointed-at representation themselves; the
/// list never inspects key bytes.
pub trait KeyComparator: Send + Sync {
    /// Compare two stored keys.
    ///
    /// # Safety
    /// Both pointers must reference keys previously handed to this list's
    /// arena and encoded in the comparator's expected format.
    unsafe fn compare_keys(&self, a: *const u8, b: *const u8) -> CmpOrdering;

    /// Compare a stored key against an encoded probe.
    ///
    /// # Safety
    /// `a` must reference a key in this list's arena; `b` must be encoded
    /// in the same format.
    unsafe fn compare_key_with(&self, a: *const u8, b: &[u8]) -> CmpOrdering;
}

#[repr(C)]
struct Node {
    key: *const u8,
    // First element of the forward-pointer tower; the remaining
    // `height - 1` pointers are allocated contiguously after the struct.
    next: [AtomicPtr<Node>; 1],
}

impl Node {
    /// Allocate a node with a tower of `height` pointers, all null.
    unsafe fn alloc(arena: &Arena, key: *const u8, height: usize) -> *mut Node {
        debug_assert!((1..=MAX_HEIGHT).contains(&height));
        let size = std::mem::size_of::<Node>()
            + (height - 1) * std::mem::size_of::<AtomicPtr<Node>>();
        let node = arena.allocate_aligned(size) as *mut Node;
        ptr::addr_of_mut!((*node).key).write(key);
        for level in 0..height {
            ptr::addr_of_mut!((*node).next)
                .cast::<AtomicPtr<Node>>()
                .add(level)
                .write(AtomicPtr::new(null_mut()));
        }
        node
    }

    unsafe fn tower(&self, level: usize) -> &AtomicPtr<Node> {
        &*self.next.as_ptr().add(level)
    }

    unsafe fn next(&self, level: usize) -> *mut Node {
        // Acquire pairs with the release in set_next: a non-null result is
        // a fully initialized node.
        self.tower(level).load(Ordering::Acquire)
    }

    unsafe fn set_next(&self, level: usize, node: *mut Node) {
        self.tower(level).store(node, Ordering::Release);
    }

    unsafe fn no_barrier_next(&self, level: usize) -> *mut Node {
        self.tower(level).load(Ordering::Relaxed)
    }

    unsafe fn no_barrier_set_next(&self, level: usize, node: *mut Node) {
        self.tower(level).store(node, Ordering::Relaxed);
    }
}

/// Skip list keyed by arena pointers.
pub struct SkipList<C: KeyComparator> {
    cmp: C,
    arena: Arc<Arena>,
    head: *mut Node,
    // Height of the tallest node. Readers may see a stale value: an old
    // height just means extra null checks at the top; a new height is only
    // observed together with the node that raised it.
    max_height: AtomicUsize,
}

// Safety: the single-writer/many-reader contract above. All shared state is
// reached through atomics; node memory is owned by the arena and immortal
// for the list's lifetime.
unsafe impl<C: KeyComparator> Send for SkipList<C> {}
unsafe impl<C: KeyComparator> Sync for SkipList<C> {}

impl<C: KeyComparator> SkipList<C> {
    /// Create an empty list allocating from `arena`.
    pub fn new(cmp: C, arena: Arc<Arena>) -> Self {
        let head = unsafe { Node::alloc(&arena, ptr::null(), MAX_HEIGHT) };
        Self {
            cmp,
            arena,
            head,
            max_height: AtomicUsize::new(1),
        }
    }

    /// The arena backing this list.
    pub fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }

    fn random_height(&self) -> usize {
        let mut rng = rand::thread_rng();
        let mut height = 1;
        while height < MAX_HEIGHT && rng.gen_ratio(1, BRANCHING) {
            height += 1;
        }
        height
    }

    /// Insert a key. Must be called by the (single) writer; no key equal
    /// to `key` may already be present.
    ///
    /// # Safety
    /// `key` must point at an encoded key in this list's arena and remain
    /// valid for the arena's lifetime.
    pub unsafe fn insert(&self, key: *const u8) {
        let mut prev = [null_mut(); MAX_HEIGHT];
        let next = self.find_splice(key, &mut prev);
        debug_assert!(
            next.is_null() || self.cmp.compare_keys((*next).key, key) != CmpOrdering::Equal,
            "duplicate key inserted into skip list"
        );

        let height = self.random_height();
        let max_height = self.max_height.load(Ordering::Relaxed);
        if height > max_height {
            for slot in prev.iter_mut().take(height).skip(max_height) {
                *slot = self.head;
            }
            // A plain store suffices: concurrent readers handle both the
            // old value (they skip the new levels) and the new one (head's
            // pointers there are still null, which sorts after everything).
            self.max_height.store(height, Ordering::Relaxed);
        }

        let node = Node::alloc(&self.arena, key, height);
        for level in 0..height {
            // Link bottom-up. The relaxed store into the new node is safe
            // because the release store into prev publishes it.
            (*node).no_barrier_set_next(level, (*prev[level]).no_barrier_next(level));
            (*prev[level]).set_next(level, node);
        }
    }

    /// Whether an entry equal to the encoded probe is in the list.
    pub fn contains(&self, target: &[u8]) -> bool {
        unsafe {
            let node = self.find_greater_or_equal(target);
            !node.is_null() && self.cmp.compare_key_with((*node).key, target) == CmpOrdering::Equal
        }
    }

    /// First node whose key is >= the encoded probe.
    unsafe fn find_greater_or_equal(&self, target: &[u8]) -> *mut Node {
        let mut node = self.head;
        let mut level = self.max_height.load(Ordering::Relaxed) - 1;
        loop {
            let next = (*node).next(level);
            let descend = next.is_null()
                || self.cmp.compare_key_with((*next).key, target) != CmpOrdering::Less;
            if descend {
                if level == 0 {
                    return next;
                }
                level -= 1;
            } else {
                node = next;
            }
        }
    }

    /// Like [`SkipList::find_greater_or_equal`] for a stored key, filling
    /// `prev` with the per-level predecessors of the returned position.
    unsafe fn find_splice(
        &self,
        key: *const u8,
        prev: &mut [*mut Node; MAX_HEIGHT],
    ) -> *mut Node {
        let mut node = self.head;
        let mut level = self.max_height.load(Ordering::Relaxed) - 1;
        loop {
            let next = (*node).next(level);
            let descend = next.is_null()
                || self.cmp.compare_keys((*next).key, key) != CmpOrdering::Less;
            if descend {
                prev[level] = node;
                if level == 0 {
                    return next;
                }
                level -= 1;
            } else {
                node = next;
            }
        }
    }

    /// Last node whose key orders strictly before `key`; head when none.
    unsafe fn find_less_than(&self, key: *const u8) -> *mut Node {
        let mut node = self.head;
        let mut level = self.max_height.load(Ordering::Relaxed) - 1;
        loop {
            let next = (*node).next(level);
            let before_key =
                !next.is_null() && self.cmp.compare_keys((*next).key, key) == CmpOrdering::Less;
            if before_key {
                node = next;
            } else {
                if level == 0 {
                    return node;
                }
                level -= 1;
            }
        }
    }

    /// Last node in the list; head when empty.
    unsafe fn find_last(&self) -> *mut Node {
        let mut node = self.head;
        let mut level = self.max_height.load(Ordering::Relaxed) - 1;
        loop {
            let next = (*node).next(level);
            if !next.is_null() {
                node = next;
            } else {
                if level == 0 {
                    return node;
                }
                level -= 1;
            }
        }
    }

    /// Create an iterator over the list.
    pub fn iter(&self) -> SkipListIterator<'_, C> {
        SkipListIterator {
            list: self,
            node: null_mut(),
        }
    }
}

/// Cursor over a skip list.
///
/// Reads are lock-free; the iterator observes at least every entry
/// inserted before it was created.
pub struct SkipListIterator<'a, C: KeyComparator> {
    list: &'a SkipList<C>,
    node: *mut Node,
}

impl<'a, C: KeyComparator> SkipListIterator<'a, C> {
    /// Whether the iterator is positioned at an entry.
    pub fn valid(&self) -> bool {
        !self.node.is_null()
    }

    /// Pointer to the current entry's encoded key.
    ///
    /// Valid for the arena's lifetime. Requires `valid()`.
    pub fn key(&self) -> *const u8 {
        debug_assert!(self.valid());
        unsafe { (*self.node).key }
    }

    /// Advance to the next entry. Requires `valid()`.
    pub fn next(&mut self) {
        debug_assert!(self.valid());
        unsafe {
            self.node = (*self.node).next(0);
        }
    }

    /// Retreat to the previous entry. Requires `valid()`.
    ///
    /// Implemented as a search from the head rather than a back pointer;
    /// costs O(log n).
    pub fn prev(&mut self) {
        debug_assert!(self.valid());
        unsafe {
            let node = self.list.find_less_than((*self.node).key);
            self.node = if node == self.list.head {
                null_mut()
            } else {
                node
            };
        }
    }

    /// Position at the first entry whose key is >= the encoded probe.
    pub fn seek(&mut self, target: &[u8]) {
        unsafe {
            self.node = self.list.find_greater_or_equal(target);
        }
    }

    /// Position at the first entry.
    pub fn seek_to_first(&mut self) {
        unsafe {
            self.node = (*self.list.head).next(0);
        }
    }

    /// Position at the last entry.
    pub fn seek_to_last(&mut self) {
        unsafe {
            let node = self.list.find_last();
            self.node = if node == self.list.head {
                null_mut()
            } else {
                node
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::coding::get_varint32;

    /// Test comparator over varint32-length-prefixed byte strings, ordered
    /// bytewise — the same framing the memtable uses.
    struct PrefixedBytewise;

    unsafe fn decode<'a>(p: *const u8) -> &'a [u8] {
        // Read the varint prefix byte-wise to stay inside the allocation.
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
        std::slice::from_raw_parts(p.add(i), len as usize)
    }

    impl KeyComparator for PrefixedBytewise {
        unsafe fn compare_keys(&self, a: *const u8, b: *const u8) -> CmpOrdering {
            decode(a).cmp(decode(b))
        }

        unsafe fn compare_key_with(&self, a: *const u8, b: &[u8]) -> CmpOrdering {
            let mut b = b;
            let target = get_varint32(&mut b).unwrap() as usize;
            decode(a).cmp(&b[..target])
        }
    }

    fn encode_key(arena: &Arena, key: &[u8]) -> *const u8 {
        let mut buf = Vec::with_capacity(key.len() + 5);
        crate::util::coding::put_varint32_vec(&mut buf, key.len() as u32);
        buf.extend_from_slice(key);
        arena.allocate_copy(&buf)
    }

    fn probe(key: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(key.len() + 5);
        crate::util::coding::put_varint32_vec(&mut buf, key.len() as u32);
        buf.extend_from_slice(key);
        buf
    }

    fn new_list() -> SkipList<PrefixedBytewise> {
        SkipList::new(PrefixedBytewise, Arc::new(Arena::new()))
    }

    #[test]
    fn test_empty_list() {
        let list = new_list();
        assert!(!list.contains(&probe(b"a")));

        let mut iter = list.iter();
        assert!(!iter.valid());
        iter.seek_to_first();
        assert!(!iter.valid());
        iter.seek_to_last();
        assert!(!iter.valid());
        iter.seek(&probe(b"a"));
        assert!(!iter.valid());
    }

    #[test]
    fn test_insert_contains_permutation() {
        let list = new_list();
        let mut keys: Vec<String> = (0..200).map(|i| format!("key{:04}", i * 3)).collect();

        // Shuffle deterministically.
        let len = keys.len();
        for i in 0..len {
            keys.swap(i, (i * 7 + 3) % len);
        }

        for key in &keys {
            let ptr = encode_key(list.arena(), key.as_bytes());
            unsafe { list.insert(ptr) };
        }

        for key in &keys {
            assert!(list.contains(&probe(key.as_bytes())), "missing {}", key);
        }
        assert!(!list.contains(&probe(b"key0001")));
        assert!(!list.contains(&probe(b"zzz")));
    }

    #[test]
    fn test_iteration_is_sorted() {
        let list = new_list();
        let keys = [&b"delta"[..], b"alpha", b"echo", b"charlie", b"bravo"];
        for key in keys {
            let ptr = encode_key(list.arena(), key);
            unsafe { list.insert(ptr) };
        }

        let mut iter = list.iter();
        iter.seek_to_first();
        let mut seen = Vec::new();
        while iter.valid() {
            seen.push(unsafe { decode(iter.key()) }.to_vec());
            iter.next();
        }
        assert_eq!(
            seen,
            vec![
                b"alpha".to_vec(),
                b"bravo".to_vec(),
                b"charlie".to_vec(),
                b"delta".to_vec(),
                b"echo".to_vec()
            ]
        );
    }

    #[test]
    fn test_seek_lands_on_least_geq() {
        let list = new_list();
        for key in [&b"b"[..], b"d", b"f"] {
            let ptr = encode_key(list.arena(), key);
            unsafe { list.insert(ptr) };
        }

        let mut iter = list.iter();

        iter.seek(&probe(b"a"));
        assert!(iter.valid());
        assert_eq!(unsafe { decode(iter.key()) }, b"b");

        iter.seek(&probe(b"d"));
        assert!(iter.valid());
        assert_eq!(unsafe { decode(iter.key()) }, b"d");

        iter.seek(&probe(b"e"));
        assert!(iter.valid());
        assert_eq!(unsafe { decode(iter.key()) }, b"f");

        iter.seek(&probe(b"g"));
        assert!(!iter.valid());
    }

    #[test]
    fn test_prev_and_seek_to_last() {
        let list = new_list();
        for key in [&b"a"[..], b"b", b"c"] {
            let ptr = encode_key(list.arena(), key);
            unsafe { list.insert(ptr) };
        }

        let mut iter = list.iter();
        iter.seek_to_last();
        assert!(iter.valid());
        assert_eq!(unsafe { decode(iter.key()) }, b"c");

        iter.prev();
        assert_eq!(unsafe { decode(iter.key()) }, b"b");
        iter.prev();
        assert_eq!(unsafe { decode(iter.key()) }, b"a");
        iter.prev();
        assert!(!iter.valid());
    }

    #[test]
    fn test_single_writer_concurrent_readers() {
        use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
        use std::thread;

        let list = Arc::new(new_list());
        let done = Arc::new(AtomicBool::new(false));

        let mut readers = Vec::new();
        for _ in 0..4 {
            let list = Arc::clone(&list);
            let done = Arc::clone(&done);
            readers.push(thread::spawn(move || {
                while !done.load(AtomicOrdering::Acquire) {
                    let mut iter = list.iter();
                    iter.seek_to_first();
                    let mut last: Option<Vec<u8>> = None;
                    while iter.valid() {
                        let key = unsafe { decode(iter.key()) }.to_vec();
                        if let Some(prev) = &last {
                            assert!(prev < &key, "reader saw out-of-order keys");
                        }
                        last = Some(key);
                        iter.next();
                    }
                }
            }));
        }

        for i in 0..2000u32 {
            // XOR keeps the keys distinct while scrambling insert order.
            let key = format!("key{:08}", i ^ 0x2A5);
            let ptr = encode_key(list.arena(), key.as_bytes());
            unsafe { list.insert(ptr) };
        }
        done.store(true, AtomicOrdering::Release);

        for reader in readers {
            reader.join().unwrap();
        }
    }
}
