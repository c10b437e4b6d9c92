//! Storage with a single host-memory tier

use super::allocator::Allocator;
use super::engine::{create_in, save_snapshot, unsupported, SaveContext, Storage};
use super::shrink::ShrinkArgs;
use super::tier::Tier;
use super::value::{SlotMeta, SlotPtr, ValueSlot};
use crate::checkpoint::{CheckpointWriter, ValueIterator};
use crate::error::{Error, Result};
use crate::types::Key;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::info;

/// One tier; nothing to promote or evict
pub struct SingleTierStorage<K: Key, S: ValueSlot> {
    tier: Tier<K, S>,
    alloc_len: AtomicUsize,
}

impl<K: Key, S: ValueSlot> SingleTierStorage<K, S> {
    pub fn new(tier: Tier<K, S>) -> Self {
        info!(tier = tier.name(), "Created single-tier storage");
        Self {
            tier,
            alloc_len: AtomicUsize::new(0),
        }
    }

    pub fn tier(&self) -> &Tier<K, S> {
        &self.tier
    }
}

impl<K: Key, S: ValueSlot + SlotMeta> Storage<K, S> for SingleTierStorage<K, S> {
    fn get(&self, key: K) -> Result<SlotPtr<S>> {
        self.tier
            .get(key)
            .ok_or_else(|| Error::NotFound(format!("key {:?}", key)))
    }

    fn get_or_create(&self, key: K, capacity: usize) -> SlotPtr<S> {
        loop {
            if let Some(slot) = self.tier.get(key) {
                return slot;
            }
            if let Some(slot) = create_in(&self.tier, key, capacity) {
                return slot;
            }
        }
    }

    fn insert(&self, key: K, slot: SlotPtr<S>) -> Result<()> {
        self.tier.try_insert(key, slot)
    }

    fn create_slot(&self, capacity: usize) -> SlotPtr<S> {
        self.tier.create_slot(capacity)
    }

    fn remove(&self, key: K) -> Result<()> {
        if let Some(slot) = self.tier.remove(key) {
            // SAFETY: unlinked; removal racing readers of the same key is a caller error
            unsafe { self.tier.destroy_slot(slot) };
        }
        Ok(())
    }

    fn contains(&self, key: K) -> bool {
        self.tier.contains(key)
    }

    fn size(&self) -> usize {
        self.tier.size()
    }

    fn size_at(&self, level: usize) -> Option<usize> {
        (level == 0).then(|| self.tier.size())
    }

    fn lookup_tier(&self, key: K) -> Option<usize> {
        self.tier.contains(key).then_some(0)
    }

    fn is_multi_level(&self) -> bool {
        false
    }

    fn eviction(&self, _keys: &[K]) -> Result<usize> {
        unsupported("single-tier storage", "eviction")
    }

    fn eviction_with_delayed_destroy(&self, _keys: &[K]) -> Result<usize> {
        unsupported("single-tier storage", "eviction_with_delayed_destroy")
    }

    unsafe fn release_invalid_slots(&self) -> usize {
        0
    }

    fn snapshot(&self) -> (Vec<K>, Vec<SlotPtr<S>>) {
        self.tier.snapshot()
    }

    fn shrink(&self, args: &ShrinkArgs) -> usize {
        let (mut keys, mut slots) = self.tier.snapshot();
        self.tier.shrink(args, &mut keys, &mut slots)
    }

    fn save(
        &self,
        name: &str,
        writer: &mut dyn CheckpointWriter,
        ctx: &SaveContext<'_, S::Elem>,
        value_iter: Option<&mut dyn ValueIterator<S::Elem>>,
    ) -> Result<()> {
        let (mut keys, mut slots) = self.tier.snapshot();
        self.tier.shrink(&ctx.shrink_args, &mut keys, &mut slots);
        save_snapshot(name, writer, ctx, &keys, &slots, value_iter)
    }

    fn allocator(&self) -> &dyn Allocator {
        self.tier.allocator()
    }

    fn alloc_len(&self) -> usize {
        self.alloc_len.load(Ordering::Relaxed)
    }

    fn set_alloc_len(&self, len: usize) {
        self.alloc_len.store(len, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointReader, ColumnSpec, MemoryBundle, DEFAULT_BYTES_LIMIT};
    use crate::config::EmbeddingConfig;
    use crate::storage::allocator::HostAllocator;
    use crate::storage::kv::MapKind;
    use crate::storage::shrink::ShrinkPolicy;
    use crate::storage::value::NormalSlot;
    use std::sync::Arc;

    fn storage(policy: ShrinkPolicy) -> SingleTierStorage<i64, NormalSlot<f32>> {
        let alloc = Arc::new(HostAllocator::new("dram"));
        SingleTierStorage::new(
            Tier::with_map("dram", 0, MapKind::Lockless, alloc).with_shrink_policy(policy),
        )
    }

    #[test]
    fn test_get_or_create_and_remove() -> Result<()> {
        let storage = storage(ShrinkPolicy::None);
        assert!(matches!(storage.get(1), Err(Error::NotFound(_))));

        let slot = storage.get_or_create(1, 2);
        assert_eq!(storage.get_or_create(1, 2), slot);
        assert_eq!(storage.get(1)?, slot);
        assert_eq!(storage.lookup_tier(1), Some(0));
        assert_eq!(storage.size_at(0), Some(1));
        assert_eq!(storage.size_at(1), None);

        storage.remove(1)?;
        // idempotent
        storage.remove(1)?;
        assert_eq!(storage.lookup_tier(1), None);
        assert_eq!(storage.allocator().stats().live_blocks, 0);
        Ok(())
    }

    #[test]
    fn test_insert_rejects_duplicate() -> Result<()> {
        let storage = storage(ShrinkPolicy::None);
        let slot = storage.create_slot(1);
        storage.insert(7, slot)?;
        let dup = storage.create_slot(1);
        assert!(matches!(storage.insert(7, dup), Err(Error::AlreadyExists(_))));
        unsafe { storage.tier().destroy_slot(dup) };
        Ok(())
    }

    #[test]
    fn test_eviction_unsupported() {
        let storage = storage(ShrinkPolicy::None);
        assert!(!storage.is_multi_level());
        assert!(matches!(storage.eviction(&[1]), Err(Error::Unsupported(_))));
        assert!(matches!(
            storage.eviction_with_delayed_destroy(&[1]),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn test_save_shrinks_first() -> Result<()> {
        let storage = storage(ShrinkPolicy::GlobalStep { steps_to_live: 25 });
        for key in 0..4i64 {
            let slot = unsafe { storage.get_or_create(key, 1).as_ref() };
            slot.get_or_allocate(storage.allocator(), 0, 2, &[key as f32; 2], 0);
            slot.set_step(key * 10);
        }

        let config = EmbeddingConfig {
            steps_to_live: 25,
            ..Default::default()
        };
        let ctx = SaveContext {
            config: &config,
            shrink_args: ShrinkArgs::new(30, 2),
            spec: ColumnSpec::new(2),
            default_value: &[0.0; 2],
            bytes_limit: DEFAULT_BYTES_LIMIT,
        };
        let mut bundle = MemoryBundle::new();
        storage.save("ev", &mut bundle, &ctx, None)?;

        // step 0 is 30 steps old
        let mut keys = bundle.read_tensor("ev-keys")?.to_vec::<i64>()?;
        keys.sort();
        assert_eq!(keys, vec![1, 2, 3]);
        assert_eq!(storage.size(), 3);
        assert_eq!(bundle.read_tensor("ev-versions")?.to_vec::<i64>()?.len(), 3);
        Ok(())
    }
}
