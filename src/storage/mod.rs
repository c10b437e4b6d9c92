//! Storage layer
//!
//! # Architecture
//!
//! ```text
//! Storage (SingleTierStorage | TieredStorage)
//!   └─→ Tier 0..n  (fastest first)
//!        ├─→ KvInterface   key → SlotPtr
//!        └─→ Allocator     memory behind every slot of the tier
//!             └─→ ValueSlot   header + columns of one key
//! ```
//!
//! ## Slots
//!
//! A [`ValueSlot`] owns the columns of one key (see [`value`]). Columns are
//! allocated lazily and never move, so readers may keep raw pointers into a
//! slot for as long as the slot lives.
//!
//! ## Tiers
//!
//! Tiers differ only in their map and allocator. [`TieredStorage`] promotes
//! keys into tier 0 on read and evicts them into tier 1 when the hot-key
//! cache ([`cache::EvictionCache`]) grows past capacity. Evicted slots are
//! either destroyed right away or retired until
//! [`Storage::release_invalid_slots`].

pub mod allocator;
pub mod cache;
pub mod engine;
pub mod kv;
pub mod multi_tier;
pub mod retire;
pub mod shrink;
pub mod single_tier;
pub mod tier;
pub mod value;

pub use allocator::{Allocator, AllocatorStats, HostAllocator};
pub use cache::{CacheStats, EvictionCache};
pub use engine::{SaveContext, Storage};
pub use kv::{KvInterface, MapKind};
pub use multi_tier::TieredStorage;
pub use shrink::{ShrinkArgs, ShrinkPolicy};
pub use single_tier::SingleTierStorage;
pub use tier::Tier;
pub use value::{
    ContiguousSlot, DeviceSlot, LayoutType, LightSlot, NormalSlot, SlotMeta, SlotPtr, TierCopy,
    ValueSlot,
};

use crate::config::StorageConfig;
use crate::error::Result;
use crate::types::Key;
use std::sync::Arc;

/// Build host-memory storage as described by `config`
///
/// Every tier gets its own [`HostAllocator`]; a `DramPmem` configuration
/// stands the capacity tier up in host memory as well.
pub fn new_storage<K: Key, S: TierCopy + SlotMeta>(
    config: &StorageConfig,
    policy: ShrinkPolicy,
) -> Result<Box<dyn Storage<K, S>>> {
    let dram = Tier::with_map(
        "dram",
        0,
        config.primary_map,
        Arc::new(HostAllocator::new("dram")),
    )
    .with_shrink_policy(policy);

    if !config.is_multi_level() {
        return Ok(Box::new(SingleTierStorage::new(dram)));
    }

    let pmem = Tier::with_map(
        "pmem",
        1,
        config.capacity_map,
        Arc::new(HostAllocator::new("pmem")),
    )
    .with_shrink_policy(policy);
    Ok(Box::new(TieredStorage::new(vec![dram, pmem])?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageType;

    #[test]
    fn test_new_storage_by_type() -> Result<()> {
        let mut config = StorageConfig::default();
        let single: Box<dyn Storage<i64, NormalSlot<f32>>> =
            new_storage(&config, ShrinkPolicy::None)?;
        assert!(!single.is_multi_level());
        assert_eq!(single.size_at(1), None);

        config.storage_type = StorageType::DramPmem;
        let tiered: Box<dyn Storage<i64, ContiguousSlot<f32>>> =
            new_storage(&config, ShrinkPolicy::None)?;
        assert!(tiered.is_multi_level());
        assert_eq!(tiered.size_at(1), Some(0));
        Ok(())
    }
}
