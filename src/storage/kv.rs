//! Key → slot map collaborators
//!
//! A tier does not care how its map is implemented, only that it supports
//! concurrent lookup and an insert that refuses to overwrite (`try_insert`),
//! which is how promotion and creation races are resolved.

use super::value::SlotPtr;
use crate::error::{Error, Result};
use crate::types::Key;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::{self, HashMap};

/// Backing map implementation selected per tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapKind {
    /// Sharded concurrent map
    #[default]
    Lockless,
    /// Single map behind a reader-writer lock
    Locked,
}

/// Concurrent key → slot map
pub trait KvInterface<K, S>: Send + Sync {
    fn lookup(&self, key: K) -> Option<SlotPtr<S>>;

    fn contains(&self, key: K) -> bool;

    /// Upsert; returns the slot that was replaced
    fn insert(&self, key: K, slot: SlotPtr<S>) -> Option<SlotPtr<S>>;

    /// Insert only if absent, `Error::AlreadyExists` otherwise
    fn try_insert(&self, key: K, slot: SlotPtr<S>) -> Result<()>;

    fn remove(&self, key: K) -> Option<SlotPtr<S>>;

    fn size(&self) -> usize;

    /// Enumerate all entries
    fn snapshot(&self) -> (Vec<K>, Vec<SlotPtr<S>>);
}

/// Build a map of the requested kind
pub fn new_kv<K: Key, S: Send + Sync + 'static>(kind: MapKind) -> Box<dyn KvInterface<K, S>> {
    match kind {
        MapKind::Lockless => Box::new(LocklessHashMap::new()),
        MapKind::Locked => Box::new(LockedHashMap::new()),
    }
}

fn already_exists<K: Key>(key: K) -> Error {
    Error::AlreadyExists(format!("key {:?}", key))
}

/// DashMap-backed map
pub struct LocklessHashMap<K: Key, S> {
    map: DashMap<K, SlotPtr<S>>,
}

impl<K: Key, S> LocklessHashMap<K, S> {
    pub fn new() -> Self {
        Self { map: DashMap::new() }
    }
}

impl<K: Key, S> Default for LocklessHashMap<K, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key, S: Send + Sync> KvInterface<K, S> for LocklessHashMap<K, S> {
    fn lookup(&self, key: K) -> Option<SlotPtr<S>> {
        self.map.get(&key).map(|e| *e.value())
    }

    fn contains(&self, key: K) -> bool {
        self.map.contains_key(&key)
    }

    fn insert(&self, key: K, slot: SlotPtr<S>) -> Option<SlotPtr<S>> {
        self.map.insert(key, slot)
    }

    fn try_insert(&self, key: K, slot: SlotPtr<S>) -> Result<()> {
        match self.map.entry(key) {
            Entry::Occupied(_) => Err(already_exists(key)),
            Entry::Vacant(v) => {
                v.insert(slot);
                Ok(())
            }
        }
    }

    fn remove(&self, key: K) -> Option<SlotPtr<S>> {
        self.map.remove(&key).map(|(_, v)| v)
    }

    fn size(&self) -> usize {
        self.map.len()
    }

    fn snapshot(&self) -> (Vec<K>, Vec<SlotPtr<S>>) {
        let mut keys = Vec::with_capacity(self.map.len());
        let mut slots = Vec::with_capacity(self.map.len());
        for entry in self.map.iter() {
            keys.push(*entry.key());
            slots.push(*entry.value());
        }
        (keys, slots)
    }
}

/// HashMap behind a parking_lot RwLock
pub struct LockedHashMap<K, S> {
    map: RwLock<HashMap<K, SlotPtr<S>>>,
}

impl<K: Key, S> LockedHashMap<K, S> {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }
}

impl<K: Key, S> Default for LockedHashMap<K, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key, S: Send + Sync> KvInterface<K, S> for LockedHashMap<K, S> {
    fn lookup(&self, key: K) -> Option<SlotPtr<S>> {
        self.map.read().get(&key).copied()
    }

    fn contains(&self, key: K) -> bool {
        self.map.read().contains_key(&key)
    }

    fn insert(&self, key: K, slot: SlotPtr<S>) -> Option<SlotPtr<S>> {
        self.map.write().insert(key, slot)
    }

    fn try_insert(&self, key: K, slot: SlotPtr<S>) -> Result<()> {
        match self.map.write().entry(key) {
            hash_map::Entry::Occupied(_) => Err(already_exists(key)),
            hash_map::Entry::Vacant(v) => {
                v.insert(slot);
                Ok(())
            }
        }
    }

    fn remove(&self, key: K) -> Option<SlotPtr<S>> {
        self.map.write().remove(&key)
    }

    fn size(&self) -> usize {
        self.map.read().len()
    }

    fn snapshot(&self) -> (Vec<K>, Vec<SlotPtr<S>>) {
        let map = self.map.read();
        map.iter().map(|(k, v)| (*k, *v)).unzip()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(kv: &dyn KvInterface<i64, u32>) -> Result<()> {
        let a = SlotPtr::new(1u32);
        let b = SlotPtr::new(2u32);

        assert!(kv.lookup(7).is_none());
        kv.try_insert(7, a)?;
        assert!(matches!(kv.try_insert(7, b), Err(Error::AlreadyExists(_))));
        assert_eq!(kv.lookup(7), Some(a));
        assert!(kv.contains(7));
        assert_eq!(kv.size(), 1);

        assert_eq!(kv.insert(7, b), Some(a));
        assert_eq!(kv.insert(8, a), None);
        let (mut keys, _) = kv.snapshot();
        keys.sort();
        assert_eq!(keys, vec![7, 8]);

        assert_eq!(kv.remove(7), Some(b));
        assert_eq!(kv.remove(7), None);
        assert_eq!(kv.size(), 1);

        unsafe {
            drop(a.into_box());
            drop(b.into_box());
        }
        Ok(())
    }

    #[test]
    fn test_lockless_map() -> Result<()> {
        exercise(&LocklessHashMap::new())
    }

    #[test]
    fn test_locked_map() -> Result<()> {
        exercise(&LockedHashMap::new())
    }

    #[test]
    fn test_try_insert_single_winner() {
        let kv: Box<dyn KvInterface<u64, u32>> = new_kv(MapKind::Lockless);
        let wins = std::sync::atomic::AtomicUsize::new(0);
        std::thread::scope(|s| {
            for i in 0..8u32 {
                let (kv, wins) = (&kv, &wins);
                s.spawn(move || {
                    let slot = SlotPtr::new(i);
                    match kv.try_insert(42, slot) {
                        Ok(()) => {
                            wins.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        }
                        Err(_) => unsafe { drop(slot.into_box()) },
                    }
                });
            }
        });
        assert_eq!(wins.into_inner(), 1);
        if let Some(slot) = kv.remove(42) {
            unsafe { drop(slot.into_box()) };
        }
    }
}
