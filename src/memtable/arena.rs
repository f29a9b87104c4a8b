//! Memory arena for memtable allocation.
//!
//! The arena hands out raw bytes from bump-pointer chunks and frees
//! everything at once when dropped. Skip-list nodes and encoded entries
//! live here, which is what lets readers walk the list without locks:
//! nothing allocated from an arena moves or is freed while the arena is
//! alive.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Size of a standard arena chunk.
const CHUNK_SIZE: usize = 4 * 1024;

/// Bump-pointer chunk allocator.
///
/// Requests larger than a quarter chunk get a dedicated chunk so the tail
/// of the current chunk is not wasted on them. Smaller requests that miss
/// the current chunk start a fresh one, abandoning the old tail.
pub struct Arena {
    /// Allocation pointer within the current chunk.
    alloc_ptr: UnsafeCell<*mut u8>,
    /// Bytes remaining in the current chunk.
    alloc_bytes_remaining: UnsafeCell<usize>,
    /// All chunks with their layouts, for deallocation on drop.
    chunks: UnsafeCell<Vec<(NonNull<u8>, Layout)>>,
    /// Total bytes reserved, readable without synchronization.
    memory_usage: AtomicUsize,
}

// Safety: a single writer thread allocates (serialized by the owning
// memtable's writer contract); concurrent readers only dereference memory
// handed out earlier, which is never moved or reclaimed until drop. The
// usage counter is atomic.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self {
            alloc_ptr: UnsafeCell::new(std::ptr::null_mut()),
            alloc_bytes_remaining: UnsafeCell::new(0),
            chunks: UnsafeCell::new(Vec::new()),
            memory_usage: AtomicUsize::new(0),
        }
    }

    /// Allocate `size` uninitialized bytes.
    ///
    /// The returned pointer stays valid until the arena is dropped.
    /// `size` must be non-zero.
    pub fn allocate(&self, size: usize) -> *mut u8 {
        debug_assert!(size > 0);
        unsafe {
            let remaining = *self.alloc_bytes_remaining.get();
            if size <= remaining {
                let result = *self.alloc_ptr.get();
                *self.alloc_ptr.get() = result.add(size);
                *self.alloc_bytes_remaining.get() = remaining - size;
                return result;
            }
        }
        self.allocate_fallback(size)
    }

    /// Allocate `size` bytes aligned for pointer-sized data.
    pub fn allocate_aligned(&self, size: usize) -> *mut u8 {
        let align = std::cmp::max(std::mem::size_of::<usize>(), 8);
        debug_assert!(align.is_power_of_two());

        unsafe {
            let current = *self.alloc_ptr.get() as usize;
            let slop = (align - current % align) % align;
            let needed = size + slop;

            let remaining = *self.alloc_bytes_remaining.get();
            if needed <= remaining {
                let result = (current + slop) as *mut u8;
                *self.alloc_ptr.get() = result.add(size);
                *self.alloc_bytes_remaining.get() = remaining - needed;
                return result;
            }
        }

        // Fresh chunks come from the global allocator at 8-byte alignment,
        // which satisfies the contract directly.
        self.allocate_fallback(size)
    }

    /// Allocate from a new chunk.
    fn allocate_fallback(&self, size: usize) -> *mut u8 {
        if size > CHUNK_SIZE / 4 {
            // Large request: dedicated chunk, current chunk stays current.
            return self.new_chunk(size);
        }

        // Discard the tail of the current chunk and start a fresh one.
        let chunk = self.new_chunk(CHUNK_SIZE);
        unsafe {
            *self.alloc_ptr.get() = chunk.add(size);
            *self.alloc_bytes_remaining.get() = CHUNK_SIZE - size;
        }
        chunk
    }

    fn new_chunk(&self, size: usize) -> *mut u8 {
        let layout = match Layout::from_size_align(size, 8) {
            Ok(layout) => layout,
            Err(_) => handle_alloc_error(Layout::new::<u8>()),
        };

        let ptr = unsafe { alloc(layout) };
        let Some(non_null) = NonNull::new(ptr) else {
            handle_alloc_error(layout);
        };

        unsafe {
            (*self.chunks.get()).push((non_null, layout));
        }
        self.memory_usage
            .fetch_add(size + std::mem::size_of::<usize>(), Ordering::Relaxed);
        ptr
    }

    /// Allocate and fill with a copy of `data`.
    pub fn allocate_copy(&self, data: &[u8]) -> *mut u8 {
        let ptr = self.allocate(data.len());
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len());
        }
        ptr
    }

    /// Approximate bytes reserved by the arena.
    pub fn memory_usage(&self) -> usize {
        self.memory_usage.load(Ordering::Relaxed)
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let chunks = unsafe { &mut *self.chunks.get() };
        for (ptr, layout) in chunks.drain(..) {
            unsafe {
                dealloc(ptr.as_ptr(), layout);
            }
        }
    }
}
