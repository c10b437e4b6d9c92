//! Promotion and eviction across the DRAM and capacity tiers

use evstore::storage::value::column_slice;
use evstore::storage::{
    Allocator, ContiguousSlot, HostAllocator, MapKind, NormalSlot, SlotMeta, Storage, Tier,
    TierCopy, TieredStorage, ValueSlot,
};
use std::sync::Arc;

const VALUE_LEN: usize = 4;

struct Fixture<S: TierCopy + SlotMeta> {
    storage: TieredStorage<i64, S>,
    dram: Arc<HostAllocator>,
    pmem: Arc<HostAllocator>,
}

fn fixture<S: TierCopy + SlotMeta>() -> Fixture<S> {
    let dram = Arc::new(HostAllocator::new("dram"));
    let pmem = Arc::new(HostAllocator::new("pmem"));
    let storage = TieredStorage::new(vec![
        Tier::with_map("dram", 0, MapKind::Lockless, dram.clone()),
        Tier::with_map("pmem", 1, MapKind::Locked, pmem.clone()),
    ])
    .expect("Failed to create tiered storage");
    Fixture {
        storage,
        dram,
        pmem,
    }
}

/// Create `key` in the primary tier holding `[key; VALUE_LEN]`
fn put<S>(storage: &TieredStorage<i64, S>, key: i64)
where
    S: TierCopy<Elem = f32> + SlotMeta,
{
    let slot = unsafe { storage.get_or_create(key, VALUE_LEN).as_ref() };
    slot.get_or_allocate(storage.allocator(), 0, VALUE_LEN, &[key as f32; VALUE_LEN], 0);
    slot.set_step(key);
}

fn read<S>(storage: &TieredStorage<i64, S>, key: i64) -> Vec<f32>
where
    S: TierCopy<Elem = f32> + SlotMeta,
{
    let slot = unsafe { storage.get(key).expect("key present").as_ref() };
    let p = slot.get(0, 0).expect("column allocated");
    unsafe { column_slice(p, VALUE_LEN) }.to_vec()
}

#[test]
fn test_evicted_keys_live_in_capacity_tier() {
    let f = fixture::<ContiguousSlot<f32>>();
    for key in 0..10 {
        put(&f.storage, key);
    }
    let victims: Vec<i64> = (0..5).collect();
    assert_eq!(f.storage.eviction(&victims).expect("eviction"), 5);

    for &key in &victims {
        assert_eq!(f.storage.lookup_tier(key), Some(1), "key {}", key);
        assert!(!f.storage.tiers()[0].contains(key));
    }
    for key in 5..10 {
        assert_eq!(f.storage.lookup_tier(key), Some(0));
    }
    assert_eq!(f.storage.size_at(0), Some(5));
    assert_eq!(f.storage.size_at(1), Some(5));

    // values and steps survive the move
    for &key in &victims {
        assert_eq!(read(&f.storage, key), vec![key as f32; VALUE_LEN]);
        let slot = unsafe { f.storage.get(key).expect("key present").as_ref() };
        assert_eq!(slot.step(), key);
    }
    assert_eq!(f.storage.retired_len(), 0);
    println!("✓ {} keys evicted and read back", victims.len());
}

#[test]
fn test_lower_tier_key_is_promoted_once() {
    let f = fixture::<NormalSlot<f32>>();
    let pmem = &f.storage.tiers()[1];
    let lower = pmem.create_slot(1);
    unsafe { lower.as_ref() }.get_or_allocate(pmem.allocator(), 0, VALUE_LEN, &[7.0; VALUE_LEN], 0);
    assert!(pmem.insert(42, lower).is_none());
    assert_eq!(f.storage.lookup_tier(42), Some(1));

    let first = f.storage.get(42).expect("promoted");
    assert_eq!(f.storage.lookup_tier(42), Some(0));
    assert_ne!(first, lower);

    // a second read must not need the capacity tier at all
    let removed = pmem.remove(42).expect("lower copy still present");
    unsafe { pmem.destroy_slot(removed) };
    assert_eq!(f.pmem.stats().live_blocks, 0);

    let second = f.storage.get(42).expect("served from primary");
    assert_eq!(first, second);
    assert_eq!(read(&f.storage, 42), vec![7.0; VALUE_LEN]);
}

#[test]
fn test_get_on_missing_key() {
    let f = fixture::<ContiguousSlot<f32>>();
    assert!(matches!(
        f.storage.get(1),
        Err(evstore::error::Error::NotFound(_))
    ));
    assert_eq!(f.storage.lookup_tier(1), None);
}

#[test]
fn test_delayed_destroy_keeps_memory_until_release() {
    let f = fixture::<ContiguousSlot<f32>>();
    for key in 0..4 {
        put(&f.storage, key);
    }
    let held = f.storage.tiers()[0].get(2).expect("primary slot");
    let blocks_before = f.dram.stats().live_blocks;

    assert_eq!(
        f.storage
            .eviction_with_delayed_destroy(&[1, 2])
            .expect("eviction"),
        2
    );

    // gone from the primary tier, but the memory behind `held` is intact
    assert!(f.storage.tiers()[0].get(2).is_none());
    assert_eq!(f.storage.lookup_tier(2), Some(1));
    let held = unsafe { held.as_ref() };
    let p = held.get(0, 0).expect("column still readable");
    assert_eq!(unsafe { column_slice(p, VALUE_LEN) }, &[2.0; VALUE_LEN]);
    assert_eq!(f.dram.stats().live_blocks, blocks_before);
    assert_eq!(f.storage.retired_len(), 2);

    // a later eviction batch does not free earlier retirees
    f.storage
        .eviction_with_delayed_destroy(&[3])
        .expect("eviction");
    assert_eq!(f.storage.retired_len(), 3);
    assert_eq!(f.dram.stats().live_blocks, blocks_before);

    let released = unsafe { f.storage.release_invalid_slots() };
    assert_eq!(released, 3);
    assert_eq!(f.storage.retired_len(), 0);
    assert_eq!(f.dram.stats().live_blocks, blocks_before - 3);
}

#[test]
fn test_reevicting_a_promoted_key_retires_the_stale_copy() {
    let f = fixture::<NormalSlot<f32>>();
    put(&f.storage, 9);
    f.storage.eviction(&[9]).expect("eviction");
    let pmem_blocks = f.pmem.stats().live_blocks;

    // promote, then evict again: the capacity tier now holds two generations
    f.storage.get(9).expect("promoted");
    f.storage.eviction(&[9]).expect("eviction");
    assert_eq!(f.storage.size_at(1), Some(1));
    assert_eq!(f.storage.retired_len(), 1);

    unsafe { f.storage.release_invalid_slots() };
    assert_eq!(f.pmem.stats().live_blocks, pmem_blocks);
    assert_eq!(read(&f.storage, 9), vec![9.0; VALUE_LEN]);
}

#[test]
fn test_snapshot_lists_each_key_once() {
    let f = fixture::<ContiguousSlot<f32>>();
    for key in 0..6 {
        put(&f.storage, key);
    }
    f.storage.eviction(&[0, 1, 2]).expect("eviction");
    // promote 0 back; it now has a copy in both tiers
    f.storage.get(0).expect("promoted");

    assert_eq!(f.storage.size(), 7);
    let (mut keys, slots) = f.storage.snapshot();
    keys.sort();
    assert_eq!(keys, (0..6).collect::<Vec<_>>());
    assert_eq!(slots.len(), 6);
}

#[test]
fn test_remove_clears_every_tier() {
    let f = fixture::<ContiguousSlot<f32>>();
    put(&f.storage, 5);
    f.storage.eviction(&[5]).expect("eviction");
    f.storage.get(5).expect("promoted");

    f.storage.remove(5).expect("remove");
    assert_eq!(f.storage.lookup_tier(5), None);
    assert_eq!(f.dram.stats().live_blocks, 0);
    assert_eq!(f.pmem.stats().live_blocks, 0);
}

#[test]
fn test_single_insert_is_unsupported() {
    let f = fixture::<ContiguousSlot<f32>>();
    let slot = f.storage.create_slot(VALUE_LEN);
    assert!(matches!(
        f.storage.insert(1, slot),
        Err(evstore::error::Error::Unsupported(_))
    ));
    unsafe { f.storage.tiers()[0].destroy_slot(slot) };
}
