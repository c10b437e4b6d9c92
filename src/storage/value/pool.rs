//! Block pool backing device slots, and the batched initializer
//!
//! The pool carves fixed-size blocks out of large chunks obtained from an
//! [`Allocator`]. Freed blocks go on a min-heap so the lowest offset is
//! handed out first (better locality); otherwise the bump cursor advances.
//!
//! The pool is itself an [`Allocator`] handing out one block per request. A
//! tier holding [`DeviceSlot`]s is built over it, so destroying a slot puts
//! its block back on the free list.

use super::device::DeviceSlot;
use crate::storage::allocator::{Allocator, AllocatorStats, ALLOCATOR_ALIGNMENT};
use crate::types::Element;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ptr::{self, NonNull};
use std::sync::Arc;
use tracing::debug;

struct PoolInner {
    chunks: Vec<NonNull<u8>>,
    /// Free block indices
    free_blocks: BinaryHeap<Reverse<usize>>,
    /// Next block index to hand out (if no free blocks)
    next_block: usize,
}

/// Fixed-size block pool for slot data
pub struct EmbeddingMemoryPool<V> {
    alloc: Arc<dyn Allocator>,
    /// Elements per block
    block_len: usize,
    blocks_per_chunk: usize,
    inner: Mutex<PoolInner>,
    _marker: PhantomData<V>,
}

// SAFETY: chunk pointers are only touched under the mutex
unsafe impl<V: Send> Send for EmbeddingMemoryPool<V> {}
unsafe impl<V: Sync> Sync for EmbeddingMemoryPool<V> {}

impl<V: Element> EmbeddingMemoryPool<V> {
    /// Create a new pool handing out blocks of `block_len` elements
    pub fn new(alloc: Arc<dyn Allocator>, block_len: usize, blocks_per_chunk: usize) -> Self {
        assert!(block_len > 0 && blocks_per_chunk > 0);
        Self {
            alloc,
            block_len,
            blocks_per_chunk,
            inner: Mutex::new(PoolInner {
                chunks: Vec::new(),
                free_blocks: BinaryHeap::new(),
                next_block: 0,
            }),
            _marker: PhantomData,
        }
    }

    fn block_bytes(&self) -> usize {
        self.block_len * size_of::<V>()
    }

    fn chunk_bytes(&self) -> usize {
        self.block_bytes() * self.blocks_per_chunk
    }

    pub fn block_len(&self) -> usize {
        self.block_len
    }

    /// Allocate one block
    pub fn allocate(&self) -> NonNull<V> {
        let mut inner = self.inner.lock();
        // Try to reuse a free block first
        let index = match inner.free_blocks.pop() {
            Some(Reverse(index)) => index,
            None => {
                let index = inner.next_block;
                inner.next_block += 1;
                index
            }
        };

        let chunk = index / self.blocks_per_chunk;
        while inner.chunks.len() <= chunk {
            let raw = self.alloc.allocate_raw(ALLOCATOR_ALIGNMENT, self.chunk_bytes());
            debug!(
                allocator = self.alloc.name(),
                chunk = inner.chunks.len(),
                bytes = self.chunk_bytes(),
                "Embedding pool grew"
            );
            inner.chunks.push(raw);
        }

        let within = (index % self.blocks_per_chunk) * self.block_bytes();
        // SAFETY: `within` is inside the chunk
        unsafe { NonNull::new_unchecked(inner.chunks[chunk].as_ptr().add(within) as *mut V) }
    }

    /// Return a block obtained from [`EmbeddingMemoryPool::allocate`]
    pub fn deallocate(&self, block: NonNull<V>) {
        let mut inner = self.inner.lock();
        let addr = block.as_ptr() as usize;
        let chunk_bytes = self.chunk_bytes();
        let found = inner.chunks.iter().enumerate().find_map(|(i, c)| {
            let start = c.as_ptr() as usize;
            (addr >= start && addr < start + chunk_bytes).then(|| (i, addr - start))
        });
        match found {
            Some((chunk, within)) => {
                let index = chunk * self.blocks_per_chunk + within / self.block_bytes();
                inner.free_blocks.push(Reverse(index));
            }
            None => panic!("block {:p} does not belong to this pool", block.as_ptr()),
        }
    }

    /// Number of blocks on the free list
    pub fn free_count(&self) -> usize {
        self.inner.lock().free_blocks.len()
    }

    /// Total blocks handed out so far (including freed ones)
    pub fn total_blocks(&self) -> usize {
        self.inner.lock().next_block
    }
}

impl<V: Element> Allocator for EmbeddingMemoryPool<V> {
    fn name(&self) -> &str {
        self.alloc.name()
    }

    /// One whole block; requests larger than a block or more aligned than `V` panic
    fn allocate_raw(&self, alignment: usize, num_bytes: usize) -> NonNull<u8> {
        assert!(
            num_bytes <= self.block_bytes() && alignment <= align_of::<V>(),
            "pool block of {} bytes cannot serve {} bytes aligned to {}",
            self.block_bytes(),
            num_bytes,
            alignment
        );
        self.allocate().cast()
    }

    unsafe fn deallocate_raw(&self, ptr: NonNull<u8>, _alignment: usize, _num_bytes: usize) {
        self.deallocate(ptr.cast());
    }

    fn stats(&self) -> AllocatorStats {
        let inner = self.inner.lock();
        let live = (inner.next_block - inner.free_blocks.len()) as u64;
        AllocatorStats {
            live_blocks: live,
            live_bytes: live * self.block_bytes() as u64,
            ..AllocatorStats::default()
        }
    }
}

impl<V> Drop for EmbeddingMemoryPool<V> {
    fn drop(&mut self) {
        let bytes = self.block_len * size_of::<V>() * self.blocks_per_chunk;
        for chunk in self.inner.get_mut().chunks.drain(..) {
            // SAFETY: every chunk came from `allocate_raw` with these parameters
            unsafe { self.alloc.deallocate_raw(chunk, ALLOCATOR_ALIGNMENT, bytes) };
        }
    }
}

/// Collects rows that need device initialization from parallel workers
///
/// Each worker submits its own cursor list; [`BatchInitializer::initialize`]
/// merges them and performs the allocation and default copy outside any
/// per-slot lock.
#[derive(Default)]
pub struct BatchInitializer {
    cursor_lists: Mutex<Vec<Vec<usize>>>,
}

impl BatchInitializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand over one worker's cursor list
    pub fn submit(&self, cursor: Vec<usize>) {
        if !cursor.is_empty() {
            self.cursor_lists.lock().push(cursor);
        }
    }

    /// Concatenate all submitted lists in row order
    pub fn merge(&self) -> Vec<usize> {
        let mut merged: Vec<usize> = self.cursor_lists.lock().drain(..).flatten().collect();
        merged.sort_unstable();
        merged
    }

    /// Attach memory and copy defaults for every submitted row
    ///
    /// `slots[row]` is the slot of row `row`; `default_for(row)` returns its
    /// default value. Returns the initialized column pointer per merged row.
    pub fn initialize<'d, V, F>(
        &self,
        slots: &[&DeviceSlot<V>],
        pool: &EmbeddingMemoryPool<V>,
        column: usize,
        value_len: usize,
        offset: usize,
        default_for: F,
    ) -> Vec<(usize, NonNull<V>)>
    where
        V: Element,
        F: Fn(usize) -> &'d [V],
    {
        let cursor = self.merge();
        let mut out = Vec::with_capacity(cursor.len());
        for row in cursor {
            let slot = slots[row];
            if slot.data_ptr().is_none() {
                let block = pool.allocate();
                if !slot.set_ptr(block) {
                    pool.deallocate(block);
                }
            }
            let Some(base) = slot.data_ptr() else {
                unreachable!("device slot has no memory after set_ptr");
            };
            // SAFETY: offset + value_len fits in one pool block
            let dst = unsafe { NonNull::new_unchecked(base.as_ptr().add(offset)) };
            if !slot.is_initialized(column) {
                let default = default_for(row);
                assert!(default.len() >= value_len);
                // SAFETY: dst has room for value_len elements
                unsafe { ptr::copy_nonoverlapping(default.as_ptr(), dst.as_ptr(), value_len) };
                slot.set_initialized(column);
            }
            out.push((row, dst));
        }
        debug!(rows = out.len(), "Initialized device rows");
        out
    }
}
