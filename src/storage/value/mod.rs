//! Per-key value slots
//!
//! A value slot is the memory owned by one key: a small atomic header plus
//! one region per column (the primary embedding and optional optimizer
//! slots). Columns are materialized lazily on first `get_or_allocate` and
//! never move afterwards, so pointers handed out stay valid until the slot
//! is destroyed.
//!
//! # Layouts
//!
//! ```text
//!  NormalSlot / LightSlot (indirect)      ContiguousSlot
//!  ┌──────────────┐                       ┌──────────────────────────┐
//!  │ header       │──► column 0 region    │ FixedLengthHeader (16 B) │
//!  │ column ptrs  │──► column 1 region    │ col 0 │ col 1 │ ...      │
//!  └──────────────┘                       └──────────────────────────┘
//!
//!  DeviceSlot
//!  ┌──────────────────┐
//!  │ FixedLengthHeader│
//!  │ data ptr ────────┼──► block in EmbeddingMemoryPool
//!  └──────────────────┘
//! ```
//!
//! Step and frequency bookkeeping is a separate capability ([`SlotMeta`]):
//! the compact [`LightSlot`] does not implement it at all.

mod contiguous;
mod device;
pub mod header;
mod indirect;
mod pool;

pub use contiguous::ContiguousSlot;
pub use device::{Claim, DeviceSlot};
pub use header::{FixedLengthHeader, LightHeader, MetaWord, NormalHeader, SpinFlag};
pub use indirect::{IndirectSlot, LightSlot, NormalSlot};
pub use pool::{BatchInitializer, EmbeddingMemoryPool};

use super::allocator::Allocator;
use crate::types::Element;
use std::fmt;
use std::ptr::NonNull;

/// Layout tag stored in slot headers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LayoutType {
    Light = 0,
    Normal = 1,
    NormalContiguous = 3,
    NormalContiguousGpu = 4,
}

impl LayoutType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(LayoutType::Light),
            1 => Some(LayoutType::Normal),
            3 => Some(LayoutType::NormalContiguous),
            4 => Some(LayoutType::NormalContiguousGpu),
            _ => None,
        }
    }
}

/// Result of a non-allocating column lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnLookup<V> {
    /// Column memory is allocated and initialized
    Present(NonNull<V>),
    /// Column was never allocated
    Unset,
    /// Column exists logically but its memory is not resident here
    NotResident,
}

impl<V> ColumnLookup<V> {
    pub fn ptr(self) -> Option<NonNull<V>> {
        match self {
            ColumnLookup::Present(p) => Some(p),
            _ => None,
        }
    }
}

/// Core capability set shared by all layouts
///
/// `capacity` means the number of columns for indirect layouts and the total
/// number of elements for fixed-length layouts. `offset` is the element offset
/// of a column inside the fixed-length data region and is ignored by indirect
/// layouts.
pub trait ValueSlot: Send + Sync + Sized + 'static {
    type Elem: Element;

    /// Most columns one slot can hold
    const MAX_COLUMNS: usize;

    /// Create an empty slot; no column is materialized yet
    fn create(alloc: &dyn Allocator, capacity: usize) -> Self;

    /// Capacity holding `columns` columns of `stride` elements each
    fn capacity_for(columns: usize, stride: usize) -> usize;

    fn layout_type(&self) -> LayoutType;

    /// Capacity passed to [`ValueSlot::create`]
    fn capacity(&self) -> usize;

    /// Return the column, allocating it and copying `default` on first use
    ///
    /// Concurrent callers for the same column observe exactly one allocation.
    /// Panics if `column` is outside the slot's capacity or `default` is
    /// shorter than `value_len`.
    fn get_or_allocate(
        &self,
        alloc: &dyn Allocator,
        column: usize,
        value_len: usize,
        default: &[Self::Elem],
        offset: usize,
    ) -> NonNull<Self::Elem>;

    /// Non-allocating lookup
    fn get(&self, column: usize, offset: usize) -> Option<NonNull<Self::Elem>>;

    fn lookup(&self, column: usize, offset: usize) -> ColumnLookup<Self::Elem> {
        match self.get(column, offset) {
            Some(p) => ColumnLookup::Present(p),
            None => ColumnLookup::Unset,
        }
    }

    /// Return every allocated region to `alloc`
    fn destroy(self, alloc: &dyn Allocator);
}

/// Step and frequency bookkeeping
pub trait SlotMeta {
    fn step(&self) -> i64;
    fn set_step(&self, step: i64);
    fn freq(&self) -> i64;
    fn set_freq(&self, freq: i64);
    /// Best-effort increment; may under-count under contention
    fn add_freq(&self, count: i64);
}

/// Layouts whose full contents can be copied into a slot of another tier
pub trait TierCopy: ValueSlot {
    /// Copy header and every materialized column from `src`
    ///
    /// `self` must be freshly created with `src.capacity()`; any memory needed
    /// is taken from `alloc`, the allocator of the tier that owns `self`.
    fn copy_from(&self, alloc: &dyn Allocator, src: &Self);
}

/// Owning raw handle to a heap-allocated slot
///
/// Handles are what the key maps store. They are `Copy`: ownership is a
/// protocol between map entries, the retire list and `Tier::destroy_slot`,
/// not something the type system tracks. Dereferencing is `unsafe` because a
/// handle may outlive its slot once it has been destroyed.
pub struct SlotPtr<S>(NonNull<S>);

// SAFETY: the pointee is Send + Sync (ValueSlot bound on every constructor)
unsafe impl<S: Send + Sync> Send for SlotPtr<S> {}
unsafe impl<S: Send + Sync> Sync for SlotPtr<S> {}

impl<S> SlotPtr<S> {
    pub fn new(slot: S) -> Self {
        Self(NonNull::from(Box::leak(Box::new(slot))))
    }

    /// # Safety
    /// The slot must not have been destroyed, and must stay alive for `'a`.
    pub unsafe fn as_ref<'a>(self) -> &'a S {
        &*self.0.as_ptr()
    }

    pub fn as_ptr(self) -> *const S {
        self.0.as_ptr()
    }

    /// Reclaim the box
    ///
    /// # Safety
    /// Must be called at most once per slot, with no outstanding references.
    pub(crate) unsafe fn into_box(self) -> Box<S> {
        Box::from_raw(self.0.as_ptr())
    }
}

impl<S> Clone for SlotPtr<S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S> Copy for SlotPtr<S> {}

impl<S> PartialEq for SlotPtr<S> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<S> Eq for SlotPtr<S> {}

impl<S> fmt::Debug for SlotPtr<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SlotPtr({:p})", self.0.as_ptr())
    }
}

/// Destroy a slot handle with its owning allocator
///
/// # Safety
/// See [`SlotPtr::into_box`].
pub(crate) unsafe fn destroy_slot<S: ValueSlot>(ptr: SlotPtr<S>, alloc: &dyn Allocator) {
    let slot = *ptr.into_box();
    slot.destroy(alloc);
}

/// View a column as a slice
///
/// # Safety
/// `ptr` must point at `len` initialized elements that outlive `'a`.
pub unsafe fn column_slice<'a, V>(ptr: NonNull<V>, len: usize) -> &'a [V] {
    std::slice::from_raw_parts(ptr.as_ptr(), len)
}

/// Mutable view of a column
///
/// # Safety
/// As [`column_slice`]; additionally no other reference to the region may be
/// live. Concurrent writers to the same key are the caller's responsibility.
pub unsafe fn column_slice_mut<'a, V>(ptr: NonNull<V>, len: usize) -> &'a mut [V] {
    std::slice::from_raw_parts_mut(ptr.as_ptr(), len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::allocator::HostAllocator;

    #[test]
    fn test_layout_tag_roundtrip() {
        for layout in [
            LayoutType::Light,
            LayoutType::Normal,
            LayoutType::NormalContiguous,
            LayoutType::NormalContiguousGpu,
        ] {
            assert_eq!(LayoutType::from_tag(layout as u8), Some(layout));
        }
        assert_eq!(LayoutType::from_tag(2), None);
        assert_eq!(LayoutType::from_tag(200), None);
    }

    #[test]
    fn test_slot_ptr_lifecycle() {
        let alloc = HostAllocator::new("test");
        let ptr = SlotPtr::new(NormalSlot::<f32>::create(&alloc, 2));
        let copy = ptr;
        assert_eq!(ptr, copy);

        let slot = unsafe { ptr.as_ref() };
        slot.get_or_allocate(&alloc, 0, 4, &[1.0; 4], 0);
        assert_eq!(alloc.stats().live_blocks, 1);

        unsafe { destroy_slot(ptr, &alloc) };
        assert_eq!(alloc.stats().live_blocks, 0);
    }

    #[test]
    fn test_lookup_default_impl() {
        let alloc = HostAllocator::new("test");
        let slot = NormalSlot::<f64>::create(&alloc, 3);
        assert_eq!(slot.lookup(1, 0), ColumnLookup::Unset);
        let p = slot.get_or_allocate(&alloc, 1, 2, &[0.5, 0.5], 0);
        assert_eq!(slot.lookup(1, 0), ColumnLookup::Present(p));
        assert_eq!(slot.lookup(1, 0).ptr(), Some(p));
        slot.destroy(&alloc);
    }
}
