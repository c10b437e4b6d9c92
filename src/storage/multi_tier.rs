//! Tiered storage manager
//!
//! ```text
//!   get ──► tier 0 ──hit──► slot
//!             │ miss
//!             ▼
//!           tier 1..n ──hit──► copy into new tier-0 slot ──► try_insert
//!                                                   lost race: destroy copy,
//!                                                   re-read tier 0
//!
//!   eviction: lock tier 0, lock tier 1
//!             commit tier-0 slot into tier 1, remove from tier 0,
//!             destroy (or retire) the vacated slot
//! ```
//!
//! A promoted key keeps its lower-tier copy; the next eviction overwrites it
//! through `Tier::commit`. Promotions read that copy without holding any tier
//! lock, so callers must not `remove`, `shrink` or `save` a key while a `get`
//! of it may still be running.

use super::allocator::Allocator;
use super::engine::{create_in, save_snapshot, unsupported, SaveContext, Storage};
use super::retire::RetireList;
use super::shrink::ShrinkArgs;
use super::tier::Tier;
use super::value::{SlotMeta, SlotPtr, TierCopy, ValueSlot};
use crate::checkpoint::{CheckpointWriter, ValueIterator};
use crate::error::{Error, Result};
use crate::metrics::{self, PROMOTIONS_TOTAL, PROMOTION_RACES_TOTAL};
use crate::types::Key;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, trace};

/// Two or more tiers ordered fastest first
pub struct TieredStorage<K: Key, S: ValueSlot> {
    tiers: Vec<Tier<K, S>>,
    retired: RetireList<S>,
    alloc_len: AtomicUsize,
}

impl<K: Key, S: TierCopy + SlotMeta> TieredStorage<K, S> {
    /// Build from tiers ordered by level
    pub fn new(tiers: Vec<Tier<K, S>>) -> Result<Self> {
        if tiers.len() < 2 {
            return Err(Error::InvalidArgument(format!(
                "tiered storage needs at least 2 tiers, got {}",
                tiers.len()
            )));
        }
        if let Some((i, t)) = tiers.iter().enumerate().find(|(i, t)| t.level() != *i) {
            return Err(Error::InvalidArgument(format!(
                "tier {} at position {} has level {}",
                t.name(),
                i,
                t.level()
            )));
        }
        info!(
            tiers = ?tiers.iter().map(|t| t.name()).collect::<Vec<_>>(),
            "Created tiered storage"
        );
        Ok(Self {
            tiers,
            retired: RetireList::new(),
            alloc_len: AtomicUsize::new(0),
        })
    }

    pub fn tiers(&self) -> &[Tier<K, S>] {
        &self.tiers
    }

    /// Slots awaiting `release_invalid_slots`
    pub fn retired_len(&self) -> usize {
        self.retired.len()
    }

    fn primary(&self) -> &Tier<K, S> {
        &self.tiers[0]
    }

    /// Copy `src` into a new primary-tier slot and publish it
    ///
    /// Returns `None` if another thread published `key` first.
    fn promote(&self, key: K, src: SlotPtr<S>) -> Option<SlotPtr<S>> {
        let primary = self.primary();
        // SAFETY: the caller keeps `key` from being removed, shrunk or saved
        // while this get runs; those paths destroy lower-tier slots directly
        let src = unsafe { src.as_ref() };
        let slot = primary.create_slot(src.capacity());
        // SAFETY: not published yet
        unsafe { slot.as_ref() }.copy_from(primary.allocator(), src);

        match primary.try_insert(key, slot) {
            Ok(()) => {
                PROMOTIONS_TOTAL.inc();
                trace!(?key, "Promoted key");
                Some(slot)
            }
            Err(_) => {
                // SAFETY: never published
                unsafe { primary.destroy_slot(slot) };
                PROMOTION_RACES_TOTAL.inc();
                None
            }
        }
    }

    /// Commit `keys` from tier 0 into tier 1 with both tier locks held
    fn evict_locked(&self, keys: &[K], delayed: bool) -> usize {
        let (primary, capacity) = (&self.tiers[0], &self.tiers[1]);
        let _primary_guard = primary.lock();
        let _capacity_guard = capacity.lock();

        let mut evicted = 0;
        for &key in keys {
            let Some(slot) = primary.get(key) else {
                continue;
            };
            // SAFETY: tier-0 slots are only destroyed under the tier-0 lock
            if let Some(stale) = capacity.commit(key, unsafe { slot.as_ref() }) {
                self.retired.retire(stale, capacity.level());
            }
            if let Some(owned) = primary.remove(key) {
                if delayed {
                    self.retired.retire(owned, primary.level());
                } else {
                    // SAFETY: unlinked; immediate eviction requires no concurrent readers
                    unsafe { primary.destroy_slot(owned) };
                }
            }
            evicted += 1;
        }

        metrics::record_eviction(delayed, evicted);
        debug!(
            requested = keys.len(),
            evicted,
            delayed,
            retired = self.retired.len(),
            "Eviction batch completed"
        );
        evicted
    }
}

impl<K: Key, S: TierCopy + SlotMeta> Storage<K, S> for TieredStorage<K, S> {
    fn get(&self, key: K) -> Result<SlotPtr<S>> {
        loop {
            if let Some(slot) = self.primary().get(key) {
                return Ok(slot);
            }
            let Some(src) = self.tiers[1..].iter().find_map(|t| t.get(key)) else {
                return Err(Error::NotFound(format!("key {:?}", key)));
            };
            if let Some(slot) = self.promote(key, src) {
                return Ok(slot);
            }
        }
    }

    fn get_or_create(&self, key: K, capacity: usize) -> SlotPtr<S> {
        loop {
            if let Ok(slot) = self.get(key) {
                return slot;
            }
            if let Some(slot) = create_in(self.primary(), key, capacity) {
                return slot;
            }
        }
    }

    fn insert(&self, _key: K, _slot: SlotPtr<S>) -> Result<()> {
        unsupported("tiered storage", "insert")
    }

    fn create_slot(&self, capacity: usize) -> SlotPtr<S> {
        self.primary().create_slot(capacity)
    }

    fn remove(&self, key: K) -> Result<()> {
        for tier in &self.tiers {
            if let Some(slot) = tier.remove(key) {
                // SAFETY: unlinked; removal racing readers of the same key is a caller error
                unsafe { tier.destroy_slot(slot) };
            }
        }
        Ok(())
    }

    fn contains(&self, key: K) -> bool {
        self.tiers.iter().any(|t| t.contains(key))
    }

    fn size(&self) -> usize {
        self.tiers.iter().map(|t| t.size()).sum()
    }

    fn size_at(&self, level: usize) -> Option<usize> {
        self.tiers.get(level).map(|t| t.size())
    }

    fn lookup_tier(&self, key: K) -> Option<usize> {
        self.tiers.iter().position(|t| t.contains(key))
    }

    fn is_multi_level(&self) -> bool {
        true
    }

    fn eviction(&self, keys: &[K]) -> Result<usize> {
        Ok(self.evict_locked(keys, false))
    }

    fn eviction_with_delayed_destroy(&self, keys: &[K]) -> Result<usize> {
        Ok(self.evict_locked(keys, true))
    }

    unsafe fn release_invalid_slots(&self) -> usize {
        let _primary_guard = self.tiers[0].lock();
        let _capacity_guard = self.tiers[1].lock();
        self.retired.release(&self.tiers)
    }

    fn snapshot(&self) -> (Vec<K>, Vec<SlotPtr<S>>) {
        let (mut keys, mut slots) = self.primary().snapshot();
        let mut seen: HashSet<K> = keys.iter().copied().collect();
        for tier in &self.tiers[1..] {
            let (lower_keys, lower_slots) = tier.snapshot();
            for (key, slot) in lower_keys.into_iter().zip(lower_slots) {
                if seen.insert(key) {
                    keys.push(key);
                    slots.push(slot);
                }
            }
        }
        (keys, slots)
    }

    fn shrink(&self, args: &ShrinkArgs) -> usize {
        self.tiers
            .iter()
            .map(|tier| {
                let (mut keys, mut slots) = tier.snapshot();
                tier.shrink(args, &mut keys, &mut slots)
            })
            .sum()
    }

    fn save(
        &self,
        name: &str,
        writer: &mut dyn CheckpointWriter,
        ctx: &SaveContext<'_, S::Elem>,
        value_iter: Option<&mut dyn ValueIterator<S::Elem>>,
    ) -> Result<()> {
        let primary = self.primary();
        let (mut keys, mut slots) = primary.snapshot();
        primary.shrink(&ctx.shrink_args, &mut keys, &mut slots);

        let mut merged = 0;
        for tier in &self.tiers[1..] {
            let (mut lower_keys, mut lower_slots) = tier.snapshot();
            tier.shrink(&ctx.shrink_args, &mut lower_keys, &mut lower_slots);
            for (key, slot) in lower_keys.into_iter().zip(lower_slots) {
                // promoted keys are saved from tier 0
                if !primary.contains(key) {
                    keys.push(key);
                    slots.push(slot);
                    merged += 1;
                }
            }
        }
        debug!(
            tensor = name,
            total = keys.len(),
            lower_only = merged,
            "Merged tier snapshots"
        );
        save_snapshot(name, writer, ctx, &keys, &slots, value_iter)
    }

    fn allocator(&self) -> &dyn Allocator {
        self.primary().allocator()
    }

    fn alloc_len(&self) -> usize {
        self.alloc_len.load(Ordering::Relaxed)
    }

    fn set_alloc_len(&self, len: usize) {
        self.alloc_len.store(len, Ordering::Relaxed);
    }
}

impl<K: Key, S: ValueSlot> Drop for TieredStorage<K, S> {
    fn drop(&mut self) {
        // SAFETY: no handle outlives the storage
        unsafe { self.retired.release(&self.tiers) };
    }
}
