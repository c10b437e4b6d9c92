//! Contiguous layout: header and all columns in one allocation

use super::header::{FixedLengthHeader, SpinFlag, FIXED_COLUMN_FLAGS};
use super::{LayoutType, SlotMeta, TierCopy, ValueSlot};
use crate::storage::allocator::{Allocator, ALLOCATOR_ALIGNMENT};
use crate::types::Element;
use std::marker::PhantomData;
use std::mem::size_of;
use std::ptr::{self, NonNull};

const HEADER_BYTES: usize = size_of::<FixedLengthHeader>();

/// `FixedLengthHeader` followed by `len` elements, columns at fixed offsets
///
/// The whole blob is a single allocation, so it can be copied wholesale
/// between tiers.
pub struct ContiguousSlot<V> {
    blob: NonNull<u8>,
    len: usize,
    flag: SpinFlag,
    _marker: PhantomData<V>,
}

// SAFETY: the blob is only mutated through atomics in the header, under the
// spin flag, or by callers owning disjoint rows
unsafe impl<V: Send> Send for ContiguousSlot<V> {}
unsafe impl<V: Sync> Sync for ContiguousSlot<V> {}

impl<V: Element> ContiguousSlot<V> {
    fn blob_bytes(len: usize) -> usize {
        HEADER_BYTES + len * size_of::<V>()
    }

    pub fn header(&self) -> &FixedLengthHeader {
        // SAFETY: the blob starts with a header written in `create`
        unsafe { &*(self.blob.as_ptr() as *const FixedLengthHeader) }
    }

    fn data(&self) -> *mut V {
        // SAFETY: the data region starts right after the 16-byte header and the
        // blob is 64-byte aligned
        unsafe { self.blob.as_ptr().add(HEADER_BYTES) as *mut V }
    }

    /// Total number of elements in the data region
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Fill the whole data region with `val`
    pub fn set_value(&self, val: V) {
        let _guard = self.flag.lock();
        for i in 0..self.len {
            // SAFETY: i < len
            unsafe { self.data().add(i).write(val) };
        }
    }
}

impl<V: Element> ValueSlot for ContiguousSlot<V> {
    type Elem = V;
    const MAX_COLUMNS: usize = FIXED_COLUMN_FLAGS;

    fn create(alloc: &dyn Allocator, capacity: usize) -> Self {
        let bytes = Self::blob_bytes(capacity);
        let blob = alloc.allocate_raw(ALLOCATOR_ALIGNMENT, bytes);
        // SAFETY: blob has room for the header followed by `capacity` elements
        unsafe {
            ptr::write(blob.as_ptr() as *mut FixedLengthHeader, FixedLengthHeader::new());
            ptr::write_bytes(blob.as_ptr().add(HEADER_BYTES), 0, capacity * size_of::<V>());
        }
        Self {
            blob,
            len: capacity,
            flag: SpinFlag::new(),
            _marker: PhantomData,
        }
    }

    fn capacity_for(columns: usize, stride: usize) -> usize {
        columns * stride
    }

    fn layout_type(&self) -> LayoutType {
        LayoutType::NormalContiguous
    }

    fn capacity(&self) -> usize {
        self.len
    }

    fn get_or_allocate(
        &self,
        _alloc: &dyn Allocator,
        column: usize,
        value_len: usize,
        default: &[V],
        offset: usize,
    ) -> NonNull<V> {
        assert!(
            column < FIXED_COLUMN_FLAGS,
            "column {} out of range (at most {} columns)",
            column,
            FIXED_COLUMN_FLAGS
        );
        assert!(
            offset + value_len <= self.len,
            "column {} out of range: offset {} + len {} exceeds {}",
            column,
            offset,
            value_len,
            self.len
        );
        assert!(default.len() >= value_len, "default value shorter than value_len");

        // SAFETY: offset + value_len <= len
        let dst = unsafe { self.data().add(offset) };
        if !self.header().is_initialized(column) {
            let _guard = self.flag.lock();
            if !self.header().is_initialized(column) {
                // SAFETY: region is inside the blob and not yet published
                unsafe { ptr::copy_nonoverlapping(default.as_ptr(), dst, value_len) };
                self.header().set_initialized(column);
            }
        }
        // SAFETY: derived from the non-null blob pointer
        unsafe { NonNull::new_unchecked(dst) }
    }

    fn get(&self, column: usize, offset: usize) -> Option<NonNull<V>> {
        if !self.header().is_initialized(column) || offset > self.len {
            return None;
        }
        // SAFETY: offset within the data region
        NonNull::new(unsafe { self.data().add(offset) })
    }

    fn destroy(self, alloc: &dyn Allocator) {
        // SAFETY: same size and alignment as in `create`
        unsafe {
            alloc.deallocate_raw(self.blob, ALLOCATOR_ALIGNMENT, Self::blob_bytes(self.len))
        };
    }
}

impl<V: Element> TierCopy for ContiguousSlot<V> {
    fn copy_from(&self, _alloc: &dyn Allocator, src: &Self) {
        assert_eq!(self.len, src.len, "contiguous copy between different sizes");
        let _guard = self.flag.lock();
        // data first, then the header so the flags publish the copied bytes
        // SAFETY: both blobs hold `len` elements and do not overlap
        unsafe { ptr::copy_nonoverlapping(src.data(), self.data(), self.len) };
        self.header().copy_from(src.header());
    }
}

impl<V: Element> SlotMeta for ContiguousSlot<V> {
    fn step(&self) -> i64 {
        self.header().step()
    }

    fn set_step(&self, step: i64) {
        self.header().set_step(step)
    }

    fn freq(&self) -> i64 {
        self.header().freq()
    }

    fn set_freq(&self, freq: i64) {
        self.header().set_freq(freq)
    }

    fn add_freq(&self, count: i64) {
        self.header().add_freq(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::allocator::HostAllocator;

    fn read(p: NonNull<f32>, n: usize) -> Vec<f32> {
        unsafe { std::slice::from_raw_parts(p.as_ptr(), n) }.to_vec()
    }

    #[test]
    fn test_single_allocation() {
        let alloc = HostAllocator::new("test");
        let slot = ContiguousSlot::<f32>::create(&alloc, 8);
        assert_eq!(alloc.stats().live_blocks, 1);
        assert_eq!(alloc.stats().live_bytes, 16 + 8 * 4);
        assert_eq!(slot.step(), -1);
        assert_eq!(slot.freq(), 0);

        let a = slot.get_or_allocate(&alloc, 0, 4, &[1.0; 4], 0);
        let b = slot.get_or_allocate(&alloc, 1, 4, &[2.0; 4], 4);
        assert_eq!(alloc.stats().live_blocks, 1);
        assert_eq!(unsafe { b.as_ptr().offset_from(a.as_ptr()) }, 4);
        assert_eq!(read(a, 8), vec![1.0, 1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 2.0]);

        slot.destroy(&alloc);
        assert_eq!(alloc.stats().live_bytes, 0);
    }

    #[test]
    fn test_get_respects_flags() {
        let alloc = HostAllocator::new("test");
        let slot = ContiguousSlot::<f32>::create(&alloc, 4);
        assert!(slot.get(0, 0).is_none());
        slot.get_or_allocate(&alloc, 0, 2, &[3.0, 3.0], 0);
        assert!(slot.get(0, 0).is_some());
        assert!(slot.get(1, 2).is_none());
        slot.destroy(&alloc);
    }

    #[test]
    fn test_step_does_not_clobber_flags() {
        let alloc = HostAllocator::new("test");
        let slot = ContiguousSlot::<f64>::create(&alloc, 2);
        slot.get_or_allocate(&alloc, 0, 2, &[1.0, 1.0], 0);
        slot.set_step(77);
        assert!(slot.get(0, 0).is_some());
        assert_eq!(slot.step(), 77);
        slot.destroy(&alloc);
    }

    #[test]
    fn test_set_value_and_copy() {
        let alloc = HostAllocator::new("test");
        let src = ContiguousSlot::<f32>::create(&alloc, 3);
        src.get_or_allocate(&alloc, 0, 3, &[0.0; 3], 0);
        src.set_value(2.5);
        src.set_step(5);
        src.add_freq(3);

        let dst = ContiguousSlot::<f32>::create(&alloc, 3);
        dst.copy_from(&alloc, &src);
        assert_eq!(dst.step(), 5);
        assert_eq!(dst.freq(), 3);
        assert_eq!(read(dst.get(0, 0).unwrap(), 3), vec![2.5; 3]);

        src.destroy(&alloc);
        dst.destroy(&alloc);
        assert_eq!(alloc.stats().live_blocks, 0);
    }

    #[test]
    #[should_panic]
    fn test_offset_overflow_panics() {
        let alloc = HostAllocator::new("test");
        let slot = ContiguousSlot::<f32>::create(&alloc, 4);
        slot.get_or_allocate(&alloc, 1, 4, &[0.0; 4], 2);
    }
}
