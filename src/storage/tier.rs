//! One storage level: a key → slot map plus the allocator its slots use

use super::allocator::Allocator;
use super::kv::{new_kv, KvInterface, MapKind};
use super::shrink::{ShrinkArgs, ShrinkPolicy};
use super::value::{destroy_slot, SlotMeta, SlotPtr, TierCopy, ValueSlot};
use crate::error::Result;
use crate::metrics;
use crate::types::Key;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// A single storage level
///
/// Slots stored in a tier are owned by its map entries and were created with
/// its allocator. Removing a key hands ownership back to the caller, who must
/// either destroy the slot through [`Tier::destroy_slot`] or retire it.
pub struct Tier<K: Key, S: ValueSlot> {
    name: String,
    level: usize,
    kv: Box<dyn KvInterface<K, S>>,
    alloc: Arc<dyn Allocator>,
    /// Serializes eviction batches touching this tier
    lock: Mutex<()>,
    shrink_policy: ShrinkPolicy,
}

impl<K: Key, S: ValueSlot> Tier<K, S> {
    /// Create a new tier
    pub fn new(
        name: impl Into<String>,
        level: usize,
        kv: Box<dyn KvInterface<K, S>>,
        alloc: Arc<dyn Allocator>,
    ) -> Self {
        Self {
            name: name.into(),
            level,
            kv,
            alloc,
            lock: Mutex::new(()),
            shrink_policy: ShrinkPolicy::None,
        }
    }

    /// Create a tier backed by a map of the given kind
    pub fn with_map(
        name: impl Into<String>,
        level: usize,
        kind: MapKind,
        alloc: Arc<dyn Allocator>,
    ) -> Self {
        Self::new(name, level, new_kv(kind), alloc)
    }

    pub fn with_shrink_policy(mut self, policy: ShrinkPolicy) -> Self {
        self.shrink_policy = policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn shrink_policy(&self) -> ShrinkPolicy {
        self.shrink_policy
    }

    pub fn allocator(&self) -> &dyn Allocator {
        self.alloc.as_ref()
    }

    pub fn get(&self, key: K) -> Option<SlotPtr<S>> {
        self.kv.lookup(key)
    }

    pub fn contains(&self, key: K) -> bool {
        self.kv.contains(key)
    }

    /// Upsert; returns the slot that was replaced
    pub fn insert(&self, key: K, slot: SlotPtr<S>) -> Option<SlotPtr<S>> {
        self.kv.insert(key, slot)
    }

    /// Insert only if absent (`Error::AlreadyExists` otherwise)
    pub fn try_insert(&self, key: K, slot: SlotPtr<S>) -> Result<()> {
        self.kv.try_insert(key, slot)
    }

    pub fn remove(&self, key: K) -> Option<SlotPtr<S>> {
        self.kv.remove(key)
    }

    pub fn size(&self) -> usize {
        self.kv.size()
    }

    pub fn snapshot(&self) -> (Vec<K>, Vec<SlotPtr<S>>) {
        self.kv.snapshot()
    }

    /// Allocate an empty slot from this tier's allocator
    pub fn create_slot(&self, capacity: usize) -> SlotPtr<S> {
        SlotPtr::new(S::create(self.alloc.as_ref(), capacity))
    }

    /// Destroy a slot created by this tier
    ///
    /// # Safety
    /// The slot must not be in any map, and no reference to it may be live.
    pub unsafe fn destroy_slot(&self, slot: SlotPtr<S>) {
        destroy_slot(slot, self.alloc.as_ref());
    }

    /// Acquire the tier's eviction lock
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock()
    }
}

impl<K: Key, S: TierCopy> Tier<K, S> {
    /// Copy `src` into a new slot of this tier and upsert it under `key`
    ///
    /// Returns the stale slot this tier held for `key`, if any.
    pub fn commit(&self, key: K, src: &S) -> Option<SlotPtr<S>> {
        let slot = self.create_slot(src.capacity());
        // SAFETY: freshly created, not shared yet
        unsafe { slot.as_ref() }.copy_from(self.alloc.as_ref(), src);
        self.kv.insert(key, slot)
    }
}

impl<K: Key, S: ValueSlot + SlotMeta> Tier<K, S> {
    /// Drop entries failing the shrink policy from the map and the snapshot
    ///
    /// Callers must guarantee no reader holds pointers into the dropped
    /// slots. Returns the number of keys removed.
    pub fn shrink(
        &self,
        args: &ShrinkArgs,
        keys: &mut Vec<K>,
        slots: &mut Vec<SlotPtr<S>>,
    ) -> usize {
        if self.shrink_policy.is_none() {
            return 0;
        }

        let mut kept_keys = Vec::with_capacity(keys.len());
        let mut kept_slots = Vec::with_capacity(slots.len());
        let mut removed = 0;
        for (key, slot) in keys.drain(..).zip(slots.drain(..)) {
            // SAFETY: snapshot entries are live until removed here
            if self.shrink_policy.should_remove(unsafe { slot.as_ref() }, args) {
                if let Some(owned) = self.kv.remove(key) {
                    // SAFETY: just unlinked from the map
                    unsafe { self.destroy_slot(owned) };
                }
                removed += 1;
            } else {
                kept_keys.push(key);
                kept_slots.push(slot);
            }
        }
        *keys = kept_keys;
        *slots = kept_slots;

        if removed > 0 {
            metrics::record_shrink(&self.name, removed);
        }
        debug!(
            tier = %self.name,
            removed,
            kept = keys.len(),
            global_step = args.global_step,
            "Shrink completed"
        );
        removed
    }
}

impl<K: Key, S: ValueSlot> fmt::Debug for Tier<K, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tier")
            .field("name", &self.name)
            .field("level", &self.level)
            .field("allocator", &self.alloc.name())
            .field("shrink_policy", &self.shrink_policy)
            .finish()
    }
}

impl<K: Key, S: ValueSlot> Drop for Tier<K, S> {
    fn drop(&mut self) {
        let (_, slots) = self.kv.snapshot();
        let count = slots.len();
        for slot in slots {
            // SAFETY: teardown; the map owns every slot it still lists
            unsafe { destroy_slot(slot, self.alloc.as_ref()) };
        }
        if count > 0 {
            debug!(tier = %self.name, slots = count, "Tier dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::storage::allocator::HostAllocator;
    use crate::storage::value::{ContiguousSlot, LightSlot, NormalSlot};

    fn host() -> Arc<HostAllocator> {
        Arc::new(HostAllocator::new("test"))
    }

    #[test]
    fn test_tier_basic_operations() -> Result<()> {
        let alloc = host();
        let tier: Tier<i64, NormalSlot<f32>> =
            Tier::with_map("dram", 0, MapKind::Lockless, alloc.clone());

        let slot = tier.create_slot(2);
        tier.try_insert(1, slot)?;
        assert!(tier.contains(1));
        assert_eq!(tier.get(1), Some(slot));
        assert_eq!(tier.size(), 1);

        let other = tier.create_slot(2);
        assert!(matches!(tier.try_insert(1, other), Err(Error::AlreadyExists(_))));
        unsafe { tier.destroy_slot(other) };

        let removed = tier.remove(1).unwrap();
        assert_eq!(removed, slot);
        assert!(!tier.contains(1));
        unsafe { tier.destroy_slot(removed) };
        Ok(())
    }

    #[test]
    fn test_light_slots_in_locked_tier() -> Result<()> {
        let alloc = host();
        let tier: Tier<u32, LightSlot<f64>> =
            Tier::with_map("compact", 0, MapKind::Locked, alloc.clone());
        for key in 0..10u32 {
            let slot = tier.create_slot(1);
            unsafe { slot.as_ref() }.get_or_allocate(tier.allocator(), 0, 4, &[0.0; 4], 0);
            tier.try_insert(key, slot)?;
        }
        assert_eq!(tier.size(), 10);
        assert_eq!(alloc.stats().live_blocks, 10);

        drop(tier);
        assert_eq!(alloc.stats().live_blocks, 0);
        Ok(())
    }

    #[test]
    fn test_commit_returns_stale_copy() {
        let src_alloc = host();
        let dst_alloc = host();
        let src_tier: Tier<i64, ContiguousSlot<f32>> =
            Tier::with_map("dram", 0, MapKind::Lockless, src_alloc.clone());
        let dst_tier: Tier<i64, ContiguousSlot<f32>> =
            Tier::with_map("pmem", 1, MapKind::Locked, dst_alloc.clone());

        let slot = src_tier.create_slot(4);
        let src = unsafe { slot.as_ref() };
        src.get_or_allocate(src_tier.allocator(), 0, 4, &[1.5; 4], 0);
        src.set_step(3);

        assert!(dst_tier.commit(9, src).is_none());
        let stale = dst_tier.commit(9, src).unwrap();
        assert_eq!(dst_alloc.stats().live_blocks, 2);
        unsafe { dst_tier.destroy_slot(stale) };

        let copy = unsafe { dst_tier.get(9).unwrap().as_ref() };
        assert_eq!(copy.step(), 3);
        let p = copy.get(0, 0).unwrap();
        assert_eq!(unsafe { std::slice::from_raw_parts(p.as_ptr(), 4) }, &[1.5; 4]);

        src_tier.insert(9, slot);
    }

    #[test]
    fn test_shrink_removes_and_destroys() {
        let alloc = host();
        let tier: Tier<i64, NormalSlot<f32>> =
            Tier::with_map("dram", 0, MapKind::Lockless, alloc.clone())
                .with_shrink_policy(ShrinkPolicy::GlobalStep { steps_to_live: 5 });

        for key in 0..6i64 {
            let slot = tier.create_slot(1);
            let s = unsafe { slot.as_ref() };
            s.get_or_allocate(tier.allocator(), 0, 1, &[key as f32], 0);
            s.set_step(key * 2);
            tier.insert(key, slot);
        }

        let (mut keys, mut slots) = tier.snapshot();
        let removed = tier.shrink(&ShrinkArgs::new(10, 1), &mut keys, &mut slots);
        // steps 0, 2, 4 are older than 10 - 5
        assert_eq!(removed, 3);
        keys.sort();
        assert_eq!(keys, vec![3, 4, 5]);
        assert_eq!(slots.len(), 3);
        assert_eq!(tier.size(), 3);
        assert_eq!(alloc.stats().live_blocks, 3);
    }
}
