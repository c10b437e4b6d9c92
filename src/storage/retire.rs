//! Deferred destruction of evicted slots
//!
//! A slot evicted from the primary tier may still be referenced by a reader
//! that fetched its pointer before the eviction ran. Instead of freeing it,
//! the eviction pushes it here; [`RetireList::release`] frees everything at a
//! point where the caller guarantees no such reader exists.

use super::tier::Tier;
use super::value::{SlotPtr, ValueSlot};
use crate::metrics::RETIRED_SLOTS;
use crate::types::Key;
use crossbeam::queue::SegQueue;
use tracing::{debug, warn};

/// Retired slot plus the level of the tier whose allocator owns it
struct Retired<S> {
    slot: SlotPtr<S>,
    level: usize,
}

/// Lock-free list of slots awaiting reclamation
pub struct RetireList<S> {
    queue: SegQueue<Retired<S>>,
}

impl<S: ValueSlot> RetireList<S> {
    pub fn new() -> Self {
        Self {
            queue: SegQueue::new(),
        }
    }

    /// Defer destruction of `slot`, created by the tier at `level`
    pub fn retire(&self, slot: SlotPtr<S>, level: usize) {
        self.queue.push(Retired { slot, level });
        RETIRED_SLOTS.inc();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Destroy every retired slot with its owning tier's allocator
    ///
    /// # Safety
    /// No reference to any retired slot may be live, and `tiers` must be the
    /// tier list the slots were retired from.
    pub unsafe fn release<K: Key>(&self, tiers: &[Tier<K, S>]) -> usize {
        let mut released = 0;
        while let Some(Retired { slot, level }) = self.queue.pop() {
            match tiers.get(level) {
                Some(tier) => tier.destroy_slot(slot),
                None => {
                    // never produced by the storage managers
                    warn!(level, "Retired slot from unknown tier leaked");
                    continue;
                }
            }
            released += 1;
        }
        if released > 0 {
            RETIRED_SLOTS.sub(released as i64);
            debug!(released, "Released retired slots");
        }
        released
    }
}

impl<S: ValueSlot> Default for RetireList<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::allocator::{Allocator, HostAllocator};
    use crate::storage::kv::MapKind;
    use crate::storage::value::NormalSlot;
    use std::sync::Arc;

    #[test]
    fn test_release_frees_with_owning_tier() {
        let a0 = Arc::new(HostAllocator::new("t0"));
        let a1 = Arc::new(HostAllocator::new("t1"));
        let tiers: Vec<Tier<i64, NormalSlot<f32>>> = vec![
            Tier::with_map("t0", 0, MapKind::Lockless, a0.clone()),
            Tier::with_map("t1", 1, MapKind::Lockless, a1.clone()),
        ];

        let retire = RetireList::new();
        for level in [0usize, 1, 1] {
            let slot = tiers[level].create_slot(1);
            unsafe { slot.as_ref() }.get_or_allocate(tiers[level].allocator(), 0, 2, &[0.0; 2], 0);
            retire.retire(slot, level);
        }
        assert_eq!(retire.len(), 3);
        assert_eq!(a0.stats().live_blocks, 1);
        assert_eq!(a1.stats().live_blocks, 2);

        let released = unsafe { retire.release(&tiers) };
        assert_eq!(released, 3);
        assert!(retire.is_empty());
        assert_eq!(a0.stats().live_blocks, 0);
        assert_eq!(a1.stats().live_blocks, 0);
    }
}
