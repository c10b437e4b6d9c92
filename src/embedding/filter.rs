//! Admission filter collaborator
//!
//! A filter decides whether a key may materialize its embedding. Keys it
//! rejects still get a slot (so their frequency can be tracked) but no
//! allocated column, which is how checkpoints tell them apart.

use crate::storage::{SlotMeta, SlotPtr, Storage, ValueSlot};
use crate::types::Key;

pub trait FilterPolicy<K: Key, S: ValueSlot + SlotMeta>: Send + Sync {
    /// Find or create the slot of `key`, seen `count` more times
    fn lookup_or_create_key(
        &self,
        storage: &dyn Storage<K, S>,
        key: K,
        capacity: usize,
        count: i64,
    ) -> SlotPtr<S>;

    /// Whether `key` may read and write its embedding
    fn is_admit(&self, key: K, slot: &S) -> bool;
}

/// Admits every key
#[derive(Debug, Default, Clone, Copy)]
pub struct NullableFilter;

impl<K: Key, S: ValueSlot + SlotMeta> FilterPolicy<K, S> for NullableFilter {
    fn lookup_or_create_key(
        &self,
        storage: &dyn Storage<K, S>,
        key: K,
        capacity: usize,
        _count: i64,
    ) -> SlotPtr<S> {
        storage.get_or_create(key, capacity)
    }

    fn is_admit(&self, _key: K, _slot: &S) -> bool {
        true
    }
}
