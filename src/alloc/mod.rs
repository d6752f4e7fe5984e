//! Recyclable byte-buffer pool
//!
//! Read paths allocate one buffer per inbound document; the pool hands
//! those buffers out from size-class free lists and takes them back when
//! they are dropped. Releases from hot paths go through a bounded
//! deferred-release queue so they never contend with the arena lock;
//! the queue is drained on the next allocation.
//!
//! A `Buffer` returns itself to its pool on drop, so every allocation is
//! released exactly once and a double release is unrepresentable.

use std::collections::VecDeque;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;

/// Capacity of the deferred-release queue.
const RECYCLE_QUEUE_DEPTH: usize = 128;

/// A contiguous byte region borrowed from a [`BufferPool`].
///
/// Dereferences to `[u8]`. Dropping the buffer returns it to the pool it
/// came from; buffers the arena refused (oversized allocations) go back
/// to the heap instead.
pub struct Buffer {
    data: Vec<u8>,
    class: Option<usize>,
    pool: Option<Arc<BufferPool>>,
}

impl Buffer {
    /// Length of the usable region in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Borrow the buffer contents.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Copy the contents into a plain vector.
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.clone()
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl DerefMut for Buffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.data.len())
            .field("pooled", &self.class.is_some())
            .finish()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let Some(class) = self.class else { return };
        let Some(pool) = self.pool.take() else { return };
        let data = mem::take(&mut self.data);
        pool.release(class, data);
    }
}

/// Free lists and counters behind the arena lock.
struct Arena {
    /// Per-class retained buffers, index-aligned with `BufferPool::classes`
    free: Vec<Vec<Vec<u8>>>,
    /// Buffers handed out since creation
    allocs: u64,
    /// Allocations served from a free list
    reuses: u64,
}

/// Statistics about a buffer pool
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Buffers handed out since creation
    pub allocs: u64,
    /// Allocations served from a recycled buffer
    pub reuses: u64,
    /// Buffers currently retained across all size classes
    pub retained: usize,
    /// Releases parked in the deferred queue
    pub pending_recycle: usize,
}

/// Thread-safe recyclable buffer pool with size-class backing.
pub struct BufferPool {
    /// Size classes, ascending
    classes: Vec<usize>,
    arena: Mutex<Arena>,
    /// Deferred releases; drained into `arena` on the next alloc
    recycle: Mutex<VecDeque<(usize, Vec<u8>)>>,
}

impl BufferPool {
    /// Create a pool whose smallest class is `start_chunk_size` bytes,
    /// growing by `growth_factor` up to `slab_size`.
    ///
    /// The recommended parameters are `(48, 1 << 20, 2.0)`.
    pub fn new(start_chunk_size: usize, slab_size: usize, growth_factor: f64) -> Arc<Self> {
        let mut classes = Vec::new();
        let mut size = start_chunk_size.max(1);
        while size < slab_size {
            classes.push(size);
            let next = (size as f64 * growth_factor) as usize;
            size = next.max(size + 1);
        }
        classes.push(slab_size);

        let free = classes.iter().map(|_| Vec::new()).collect();
        Arc::new(Self {
            classes,
            arena: Mutex::new(Arena { free, allocs: 0, reuses: 0 }),
            recycle: Mutex::new(VecDeque::with_capacity(RECYCLE_QUEUE_DEPTH)),
        })
    }

    /// Create a pool with the recommended parameters.
    pub fn with_defaults() -> Arc<Self> {
        Self::new(48, 1 << 20, 2.0)
    }

    /// Allocate a zeroed buffer of `n` bytes.
    ///
    /// Requests larger than the largest size class fall back to a plain
    /// heap buffer that bypasses the pool entirely.
    pub fn alloc(self: &Arc<Self>, n: usize) -> Buffer {
        let Some(class) = self.class_for(n) else {
            return Buffer { data: vec![0; n], class: None, pool: None };
        };

        let mut arena = self.arena.lock();
        self.drain_recycle(&mut arena);
        arena.allocs += 1;

        let mut data = match arena.free[class].pop() {
            Some(v) => {
                arena.reuses += 1;
                v
            }
            None => Vec::with_capacity(self.classes[class]),
        };
        drop(arena);

        data.clear();
        data.resize(n, 0);
        Buffer { data, class: Some(class), pool: Some(self.clone()) }
    }

    /// Get statistics about the pool
    pub fn stats(&self) -> PoolStats {
        let arena = self.arena.lock();
        let retained = arena.free.iter().map(Vec::len).sum();
        let pending_recycle = self.recycle.lock().len();
        PoolStats {
            allocs: arena.allocs,
            reuses: arena.reuses,
            retained,
            pending_recycle,
        }
    }

    /// Smallest class that fits `n`, or None when the arena refuses.
    fn class_for(&self, n: usize) -> Option<usize> {
        self.classes.iter().position(|&size| size >= n)
    }

    /// Move deferred releases into the free lists. Caller holds the arena lock.
    fn drain_recycle(&self, arena: &mut Arena) {
        let mut queue = self.recycle.lock();
        while let Some((class, data)) = queue.pop_front() {
            arena.free[class].push(data);
        }
    }

    /// Take a buffer back. Queues it when the deferred queue has room,
    /// otherwise releases synchronously under the arena lock.
    fn release(&self, class: usize, data: Vec<u8>) {
        {
            let mut queue = self.recycle.lock();
            if queue.len() < RECYCLE_QUEUE_DEPTH {
                queue.push_back((class, data));
                return;
            }
        }
        self.arena.lock().free[class].push(data);
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("classes", &self.classes.len())
            .field("largest", &self.classes.last())
            .finish()
    }
}
