//! Storage manager trait

use super::allocator::Allocator;
use super::shrink::ShrinkArgs;
use super::tier::Tier;
use super::value::{SlotMeta, SlotPtr, ValueSlot};
use crate::checkpoint::{save_to_checkpoint, CheckpointWriter, ColumnSpec, ValueIterator};
use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};
use crate::metrics::PROMOTION_RACES_TOTAL;
use crate::types::Key;
use tracing::{error, trace};

/// Everything `Storage::save` needs besides the writer
#[derive(Debug, Clone, Copy)]
pub struct SaveContext<'a, V> {
    pub config: &'a EmbeddingConfig,
    pub shrink_args: ShrinkArgs,
    pub spec: ColumnSpec,
    /// Row written for admitted keys whose column was never allocated
    pub default_value: &'a [V],
    pub bytes_limit: usize,
}

/// Key → slot storage over one or more tiers
///
/// Slot handles returned by `get` and `get_or_create` stay valid until the
/// key is removed, shrunk, or evicted without delayed destroy. Holding a
/// handle across any of those is the caller's responsibility.
pub trait Storage<K: Key, S: ValueSlot + SlotMeta>: Send + Sync {
    /// Find a slot in any tier, promoting it into the primary tier
    ///
    /// A promotion reads the lower-tier slot unlocked, so `get` must not race
    /// `remove`, `shrink` or `save` of the same key.
    fn get(&self, key: K) -> Result<SlotPtr<S>>;

    /// Find or create; concurrent creators all receive the same slot
    fn get_or_create(&self, key: K, capacity: usize) -> SlotPtr<S>;

    /// Insert a slot created by [`Storage::create_slot`]
    ///
    /// On error the slot is still owned by the caller.
    fn insert(&self, key: K, slot: SlotPtr<S>) -> Result<()>;

    /// Allocate an unlinked slot from the primary tier
    fn create_slot(&self, capacity: usize) -> SlotPtr<S>;

    /// Remove `key` from every tier and destroy its slots
    fn remove(&self, key: K) -> Result<()>;

    fn contains(&self, key: K) -> bool;

    /// Number of entries over all tiers
    fn size(&self) -> usize;

    /// Entries in the tier at `level`
    fn size_at(&self, level: usize) -> Option<usize>;

    /// Fastest tier holding `key`
    fn lookup_tier(&self, key: K) -> Option<usize>;

    fn is_multi_level(&self) -> bool;

    /// Move `keys` out of the primary tier, destroying the vacated slots
    fn eviction(&self, keys: &[K]) -> Result<usize>;

    /// Move `keys` out of the primary tier, retiring the vacated slots
    fn eviction_with_delayed_destroy(&self, keys: &[K]) -> Result<usize>;

    /// Free every slot retired by earlier evictions
    ///
    /// # Safety
    /// No handle to a retired slot may still be dereferenced.
    unsafe fn release_invalid_slots(&self) -> usize;

    /// Enumerate every key once, with the slot of its fastest tier
    fn snapshot(&self) -> (Vec<K>, Vec<SlotPtr<S>>);

    /// Apply each tier's shrink policy; returns the number of keys dropped
    fn shrink(&self, args: &ShrinkArgs) -> usize;

    /// Shrink, merge the tiers and export a checkpoint
    fn save(
        &self,
        name: &str,
        writer: &mut dyn CheckpointWriter,
        ctx: &SaveContext<'_, S::Elem>,
        value_iter: Option<&mut dyn ValueIterator<S::Elem>>,
    ) -> Result<()>;

    /// Allocator of the primary tier
    fn allocator(&self) -> &dyn Allocator;

    /// Element stride of one column in fixed-length layouts
    fn alloc_len(&self) -> usize;

    fn set_alloc_len(&self, len: usize);

    /// Element offset of `column` in fixed-length layouts
    fn offset(&self, column: usize) -> usize {
        column * self.alloc_len()
    }
}

/// Report a call the storage configuration does not support
pub(crate) fn unsupported<T>(storage: &str, op: &str) -> Result<T> {
    error!(storage, op, "Unsupported storage operation");
    Err(Error::Unsupported(format!("{} on {}", op, storage)))
}

/// Create a slot in `tier` unless another thread got there first
pub(crate) fn create_in<K: Key, S: ValueSlot>(
    tier: &Tier<K, S>,
    key: K,
    capacity: usize,
) -> Option<SlotPtr<S>> {
    let slot = tier.create_slot(capacity);
    match tier.try_insert(key, slot) {
        Ok(()) => Some(slot),
        Err(_) => {
            // SAFETY: never published
            unsafe { tier.destroy_slot(slot) };
            PROMOTION_RACES_TOTAL.inc();
            trace!(?key, "Lost creation race");
            None
        }
    }
}

/// Export a merged snapshot
pub(crate) fn save_snapshot<K: Key, S: ValueSlot + SlotMeta>(
    name: &str,
    writer: &mut dyn CheckpointWriter,
    ctx: &SaveContext<'_, S::Elem>,
    keys: &[K],
    slots: &[SlotPtr<S>],
    value_iter: Option<&mut dyn ValueIterator<S::Elem>>,
) -> Result<()> {
    // SAFETY: save runs without concurrent removal or eviction
    let refs: Vec<&S> = slots.iter().map(|p| unsafe { p.as_ref() }).collect();
    save_to_checkpoint(
        name,
        writer,
        ctx.config,
        ctx.spec,
        ctx.default_value,
        keys,
        &refs,
        value_iter,
        ctx.bytes_limit,
    )
}
