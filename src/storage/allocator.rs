//! Raw memory allocators backing value slots
//!
//! Every tier owns an [`Allocator`]. Slots call `allocate_raw` for column
//! memory (or for the whole blob in contiguous layouts) and return it with
//! `deallocate_raw` when they are destroyed. Allocators are shared across
//! worker threads and must tolerate concurrent calls.

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

/// Default alignment for allocator requests (one cache line)
pub const ALLOCATOR_ALIGNMENT: usize = 64;

/// Memory allocator collaborator
///
/// Resource exhaustion is not reported through this interface: an allocator
/// that cannot satisfy a request aborts, the same way the global allocator does.
pub trait Allocator: Send + Sync {
    /// Human-readable name (appears in logs)
    fn name(&self) -> &str;

    /// Allocate `num_bytes` with the given power-of-two alignment
    fn allocate_raw(&self, alignment: usize, num_bytes: usize) -> NonNull<u8>;

    /// Return memory obtained from [`Allocator::allocate_raw`]
    ///
    /// # Safety
    /// `ptr` must have been returned by `allocate_raw` on this allocator with
    /// the same `alignment` and `num_bytes`, and must not be used afterwards.
    unsafe fn deallocate_raw(&self, ptr: NonNull<u8>, alignment: usize, num_bytes: usize);

    /// Allocation counters
    fn stats(&self) -> AllocatorStats {
        AllocatorStats::default()
    }
}

/// Allocation counters reported by an allocator
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Blocks currently allocated
    pub live_blocks: u64,
    /// Bytes currently allocated
    pub live_bytes: u64,
    /// Total `allocate_raw` calls
    pub allocations: u64,
    /// Total `deallocate_raw` calls
    pub deallocations: u64,
}

/// Host-memory allocator built on the global allocator
///
/// Keeps relaxed counters so tests and the CLI can observe when memory is
/// actually returned (e.g. after deferred reclamation).
pub struct HostAllocator {
    name: String,
    live_blocks: AtomicU64,
    live_bytes: AtomicU64,
    allocations: AtomicU64,
    deallocations: AtomicU64,
}

impl HostAllocator {
    /// Create a new host allocator
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            live_blocks: AtomicU64::new(0),
            live_bytes: AtomicU64::new(0),
            allocations: AtomicU64::new(0),
            deallocations: AtomicU64::new(0),
        }
    }

    fn layout(alignment: usize, num_bytes: usize) -> Layout {
        // Zero-sized requests still hand out a unique pointer
        match Layout::from_size_align(num_bytes.max(1), alignment) {
            Ok(layout) => layout,
            Err(e) => panic!(
                "invalid allocation request ({} bytes, align {}): {}",
                num_bytes, alignment, e
            ),
        }
    }
}

impl Default for HostAllocator {
    fn default() -> Self {
        Self::new("host")
    }
}

impl fmt::Debug for HostAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostAllocator")
            .field("name", &self.name)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Allocator for HostAllocator {
    fn name(&self) -> &str {
        &self.name
    }

    fn allocate_raw(&self, alignment: usize, num_bytes: usize) -> NonNull<u8> {
        let layout = Self::layout(alignment, num_bytes);
        // SAFETY: layout has non-zero size
        let ptr = unsafe { alloc::alloc(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            alloc::handle_alloc_error(layout);
        };

        self.allocations.fetch_add(1, Ordering::Relaxed);
        self.live_blocks.fetch_add(1, Ordering::Relaxed);
        self.live_bytes
            .fetch_add(layout.size() as u64, Ordering::Relaxed);
        ptr
    }

    unsafe fn deallocate_raw(&self, ptr: NonNull<u8>, alignment: usize, num_bytes: usize) {
        let layout = Self::layout(alignment, num_bytes);
        alloc::dealloc(ptr.as_ptr(), layout);

        self.deallocations.fetch_add(1, Ordering::Relaxed);
        self.live_blocks.fetch_sub(1, Ordering::Relaxed);
        self.live_bytes
            .fetch_sub(layout.size() as u64, Ordering::Relaxed);
    }

    fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            live_blocks: self.live_blocks.load(Ordering::Relaxed),
            live_bytes: self.live_bytes.load(Ordering::Relaxed),
            allocations: self.allocations.load(Ordering::Relaxed),
            deallocations: self.deallocations.load(Ordering::Relaxed),
        }
    }
}
