//! Pointer-indirect layouts: one separately allocated region per column

use super::header::{IndirectHeader, LightHeader, NormalHeader, SpinFlag, COLUMN_BITSET_SIZE};
use super::{LayoutType, SlotMeta, TierCopy, ValueSlot};
use crate::storage::allocator::{Allocator, ALLOCATOR_ALIGNMENT};
use crate::types::Element;
use std::mem::size_of;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// Indirect layout with step/frequency bookkeeping
pub type NormalSlot<V> = IndirectSlot<V, NormalHeader>;

/// Indirect layout with an 8-byte header and no bookkeeping
pub type LightSlot<V> = IndirectSlot<V, LightHeader>;

struct Column<V> {
    ptr: AtomicPtr<V>,
    len: AtomicUsize,
}

impl<V> Column<V> {
    fn empty() -> Self {
        Self {
            ptr: AtomicPtr::new(ptr::null_mut()),
            len: AtomicUsize::new(0),
        }
    }
}

/// Header + column pointer array; columns are allocated individually
pub struct IndirectSlot<V, H> {
    header: H,
    flag: SpinFlag,
    columns: Box<[Column<V>]>,
}

impl<V: Element, H: IndirectHeader> IndirectSlot<V, H> {
    /// Number of materialized columns
    pub fn embed_num(&self) -> usize {
        self.header.load_meta().embed_num()
    }

    pub fn header(&self) -> &H {
        &self.header
    }

    fn alloc_column(alloc: &dyn Allocator, len: usize, src: &[V]) -> NonNull<V> {
        let raw = alloc.allocate_raw(ALLOCATOR_ALIGNMENT, len * size_of::<V>());
        let dst = raw.cast::<V>();
        // SAFETY: freshly allocated region of `len` elements; src.len() >= len
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), len) };
        dst
    }

    /// Store a column pointer and publish it in the bitset; caller holds the flag
    fn publish(&self, column: usize, ptr: NonNull<V>, len: usize) {
        let col = &self.columns[column];
        col.len.store(len, Ordering::Relaxed);
        col.ptr.store(ptr.as_ptr(), Ordering::Release);
        let meta = self.header.load_meta().with_column(column);
        self.header.meta().store(meta.raw(), Ordering::Release);
    }
}

impl<V: Element, H: IndirectHeader + 'static> ValueSlot for IndirectSlot<V, H> {
    type Elem = V;
    const MAX_COLUMNS: usize = COLUMN_BITSET_SIZE;

    fn create(_alloc: &dyn Allocator, capacity: usize) -> Self {
        assert!(
            capacity <= COLUMN_BITSET_SIZE,
            "indirect slot supports at most {} columns, got {}",
            COLUMN_BITSET_SIZE,
            capacity
        );
        Self {
            header: H::new(),
            flag: SpinFlag::new(),
            columns: (0..capacity).map(|_| Column::empty()).collect(),
        }
    }

    fn capacity_for(columns: usize, _stride: usize) -> usize {
        columns
    }

    fn layout_type(&self) -> LayoutType {
        H::LAYOUT
    }

    fn capacity(&self) -> usize {
        self.columns.len()
    }

    fn get_or_allocate(
        &self,
        alloc: &dyn Allocator,
        column: usize,
        value_len: usize,
        default: &[V],
        _offset: usize,
    ) -> NonNull<V> {
        assert!(
            column < self.columns.len(),
            "column {} out of range (capacity {})",
            column,
            self.columns.len()
        );
        assert!(default.len() >= value_len, "default value shorter than value_len");

        if !self.header.load_meta().test_column(column) {
            let _guard = self.flag.lock();
            if !self.header.load_meta().test_column(column) {
                let ptr = Self::alloc_column(alloc, value_len, default);
                self.publish(column, ptr, value_len);
                return ptr;
            }
        }

        let raw = self.columns[column].ptr.load(Ordering::Acquire);
        // Bit set implies the pointer was stored before it (release/acquire)
        NonNull::new(raw).unwrap_or_else(|| unreachable!("column bit set without memory"))
    }

    fn get(&self, column: usize, _offset: usize) -> Option<NonNull<V>> {
        if column >= self.columns.len() || !self.header.load_meta().test_column(column) {
            return None;
        }
        NonNull::new(self.columns[column].ptr.load(Ordering::Acquire))
    }

    fn destroy(self, alloc: &dyn Allocator) {
        for col in self.columns.iter() {
            if let Some(p) = NonNull::new(col.ptr.load(Ordering::Acquire)) {
                let bytes = col.len.load(Ordering::Relaxed) * size_of::<V>();
                // SAFETY: allocated in alloc_column with the same size and alignment
                unsafe { alloc.deallocate_raw(p.cast(), ALLOCATOR_ALIGNMENT, bytes) };
            }
        }
    }
}

impl<V: Element, H: IndirectHeader + CopyHeader + 'static> TierCopy for IndirectSlot<V, H> {
    fn copy_from(&self, alloc: &dyn Allocator, src: &Self) {
        assert_eq!(self.capacity(), src.capacity());
        let _guard = self.flag.lock();
        for column in 0..src.capacity() {
            let Some(p) = src.get(column, 0) else {
                continue;
            };
            if self.header.load_meta().test_column(column) {
                continue;
            }
            let len = src.columns[column].len.load(Ordering::Relaxed);
            // SAFETY: src column holds `len` initialized elements
            let values = unsafe { std::slice::from_raw_parts(p.as_ptr(), len) };
            let ptr = Self::alloc_column(alloc, len, values);
            self.publish(column, ptr, len);
        }
        self.header.copy_bookkeeping(&src.header);
    }
}

/// Copy the non-bitset header words between slots of one layout
pub trait CopyHeader {
    fn copy_bookkeeping(&self, src: &Self);
}

impl CopyHeader for LightHeader {
    fn copy_bookkeeping(&self, _src: &Self) {}
}

impl CopyHeader for NormalHeader {
    fn copy_bookkeeping(&self, src: &Self) {
        self.set_step(src.step());
        self.set_freq(src.freq());
    }
}

impl<V: Element> SlotMeta for IndirectSlot<V, NormalHeader> {
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
