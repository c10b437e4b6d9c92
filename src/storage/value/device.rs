//! Device-resident layout: host header, data block owned by a memory pool
//!
//! Column initialization is split in two phases so that no pool allocation
//! or bulk copy happens while the per-slot flag is held:
//!
//! ```text
//!  worker threads                        batch owner (single thread)
//!  ──────────────                        ───────────────────────────
//!  get_or_claim(col) ─► Ready(ptr)
//!                   └─► NeedsInit ─► cursor list ─► merge ─► pool.allocate
//!                                                          ─► set_ptr
//!                                                          ─► copy default
//!                                                          ─► set_initialized
//! ```

use super::header::{FixedLengthHeader, SpinFlag, FIXED_COLUMN_FLAGS};
use super::{ColumnLookup, LayoutType, SlotMeta, ValueSlot};
use crate::storage::allocator::Allocator;
use crate::types::Element;
use std::mem::{align_of, size_of};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU16, Ordering};

/// Outcome of [`DeviceSlot::get_or_claim`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim<V> {
    /// Column is initialized; pointer into the attached block
    Ready(NonNull<V>),
    /// Caller must schedule initialization through a batch initializer
    NeedsInit,
}

/// Header in host memory plus a pointer to a pooled data block
pub struct DeviceSlot<V> {
    header: FixedLengthHeader,
    data: AtomicPtr<V>,
    claimed: AtomicU16,
    len: usize,
    flag: SpinFlag,
}

impl<V: Element> DeviceSlot<V> {
    /// Attached data block, if any
    pub fn data_ptr(&self) -> Option<NonNull<V>> {
        NonNull::new(self.data.load(Ordering::Acquire))
    }

    fn column_ptr(&self, offset: usize) -> Option<NonNull<V>> {
        // SAFETY: offset < len for every column the caller configured
        self.data_ptr()
            .map(|base| unsafe { NonNull::new_unchecked(base.as_ptr().add(offset)) })
    }

    pub fn is_initialized(&self, column: usize) -> bool {
        self.header.is_initialized(column)
    }

    /// Fast phase of two-phase allocation
    ///
    /// Returns the column if it is already initialized; otherwise marks it
    /// claimed and tells the caller to schedule initialization.
    pub fn get_or_claim(&self, column: usize, offset: usize) -> Claim<V> {
        assert!(column < FIXED_COLUMN_FLAGS, "column {} out of range", column);
        if !self.header.is_initialized(column) {
            let _guard = self.flag.lock();
            if !self.header.is_initialized(column) {
                self.claimed.fetch_or(1 << column, Ordering::Relaxed);
                return Claim::NeedsInit;
            }
        }
        match self.column_ptr(offset) {
            Some(p) => Claim::Ready(p),
            None => unreachable!("initialized device column without memory"),
        }
    }

    /// Attach a data block; returns false if one is already attached
    pub fn set_ptr(&self, ptr: NonNull<V>) -> bool {
        let _guard = self.flag.lock();
        if self.data.load(Ordering::Relaxed).is_null() {
            self.data.store(ptr.as_ptr(), Ordering::Release);
            true
        } else {
            false
        }
    }

    pub fn set_initialized(&self, column: usize) {
        let _guard = self.flag.lock();
        self.header.set_initialized(column);
        self.claimed.fetch_and(!(1 << column), Ordering::Relaxed);
    }
}

impl<V: Element> ValueSlot for DeviceSlot<V> {
    type Elem = V;
    const MAX_COLUMNS: usize = FIXED_COLUMN_FLAGS;

    fn create(_alloc: &dyn Allocator, capacity: usize) -> Self {
        Self {
            header: FixedLengthHeader::new(),
            data: AtomicPtr::new(ptr::null_mut()),
            claimed: AtomicU16::new(0),
            len: capacity,
            flag: SpinFlag::new(),
        }
    }

    fn capacity_for(columns: usize, stride: usize) -> usize {
        columns * stride
    }

    fn layout_type(&self) -> LayoutType {
        LayoutType::NormalContiguousGpu
    }

    fn capacity(&self) -> usize {
        self.len
    }

    /// Synchronous initialization; the data block must already be attached
    fn get_or_allocate(
        &self,
        _alloc: &dyn Allocator,
        column: usize,
        value_len: usize,
        default: &[V],
        offset: usize,
    ) -> NonNull<V> {
        assert!(column < FIXED_COLUMN_FLAGS, "column {} out of range", column);
        assert!(offset + value_len <= self.len, "column {} out of range", column);
        assert!(default.len() >= value_len, "default value shorter than value_len");
        let Some(dst) = self.column_ptr(offset) else {
            panic!("device slot used before memory is attached");
        };

        if !self.header.is_initialized(column) {
            let _guard = self.flag.lock();
            if !self.header.is_initialized(column) {
                // SAFETY: dst points at value_len elements inside the block
                unsafe { ptr::copy_nonoverlapping(default.as_ptr(), dst.as_ptr(), value_len) };
                self.header.set_initialized(column);
                self.claimed.fetch_and(!(1 << column), Ordering::Relaxed);
            }
        }
        dst
    }

    fn get(&self, column: usize, offset: usize) -> Option<NonNull<V>> {
        if !self.header.is_initialized(column) {
            return None;
        }
        self.column_ptr(offset)
    }

    fn lookup(&self, column: usize, offset: usize) -> ColumnLookup<V> {
        if let Some(p) = self.get(column, offset) {
            return ColumnLookup::Present(p);
        }
        if column < FIXED_COLUMN_FLAGS && self.claimed.load(Ordering::Relaxed) & (1 << column) != 0
        {
            ColumnLookup::NotResident
        } else {
            ColumnLookup::Unset
        }
    }

    /// Return the attached block to `alloc`, the pool the tier is built over
    fn destroy(self, alloc: &dyn Allocator) {
        if let Some(block) = self.data_ptr() {
            // SAFETY: the block came from this pool and the slot is gone
            unsafe { alloc.deallocate_raw(block.cast(), align_of::<V>(), self.len * size_of::<V>()) };
        }
    }
}

impl<V: Element> SlotMeta for DeviceSlot<V> {
    fn step(&self) -> i64 {
        self.header.step()
    }

    fn set_step(&self, step: i64) {
        self.header.set_step(step)
    }

    fn freq(&self) -> i64 {
        self.header.freq()
    }

    fn set_freq(&self, freq: i64) {
        self.header.set_freq(freq)
    }

    fn add_freq(&self, count: i64) {
        self.header.add_freq(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::allocator::HostAllocator;
    use crate::storage::value::EmbeddingMemoryPool;
    use std::sync::Arc;

    fn pool<V: Element>(block_len: usize) -> EmbeddingMemoryPool<V> {
        EmbeddingMemoryPool::new(Arc::new(HostAllocator::new("test")), block_len, 4)
    }

    #[test]
    fn test_claim_then_initialize() {
        let alloc = pool::<f32>(4);
        let slot = DeviceSlot::<f32>::create(&alloc, 4);
        assert_eq!(slot.lookup(0, 0), ColumnLookup::Unset);

        assert_eq!(slot.get_or_claim(0, 0), Claim::NeedsInit);
        assert_eq!(slot.lookup(0, 0), ColumnLookup::NotResident);
        // still unclaimed columns stay unset
        assert_eq!(slot.lookup(1, 2), ColumnLookup::Unset);

        let base = alloc.allocate();
        assert!(slot.set_ptr(base));
        assert!(!slot.set_ptr(base));

        slot.set_initialized(0);
        assert_eq!(slot.get_or_claim(0, 0), Claim::Ready(base));
        assert_eq!(slot.lookup(0, 0), ColumnLookup::Present(base));
        slot.destroy(&alloc);
        assert_eq!(alloc.free_count(), 1);
    }

    #[test]
    fn test_sync_allocate_after_attach() {
        let alloc = pool::<f64>(4);
        let slot = DeviceSlot::<f64>::create(&alloc, 4);
        let block = alloc.allocate();
        slot.set_ptr(block);

        let p = slot.get_or_allocate(&alloc, 1, 2, &[7.0, 8.0], 2);
        assert_eq!(unsafe { *p.as_ptr() }, 7.0);
        assert_eq!(unsafe { *block.as_ptr().add(3) }, 8.0);
        assert_eq!(slot.step(), -1);
        slot.destroy(&alloc);
        assert_eq!(alloc.stats().live_blocks, 0);
    }

    #[test]
    fn test_destroy_without_memory_returns_nothing() {
        let alloc = pool::<f32>(2);
        let slot = DeviceSlot::<f32>::create(&alloc, 2);
        slot.destroy(&alloc);
        assert_eq!(alloc.free_count(), 0);
        assert_eq!(alloc.total_blocks(), 0);
    }

    #[test]
    #[should_panic(expected = "before memory is attached")]
    fn test_sync_allocate_without_memory_panics() {
        let alloc = HostAllocator::new("test");
        let slot = DeviceSlot::<f32>::create(&alloc, 2);
        slot.get_or_allocate(&alloc, 0, 2, &[0.0, 0.0], 0);
    }
}
