//! Racing creators, allocators and promoters

use evstore::config::EmbeddingConfig;
use evstore::storage::value::column_slice;
use evstore::storage::{
    Allocator, ContiguousSlot, HostAllocator, MapKind, NormalSlot, SingleTierStorage, SlotPtr,
    Storage, Tier, TieredStorage, ValueSlot,
};
use evstore::{EmbeddingVar, RayonPool};
use std::sync::{Arc, Barrier};
use std::thread;

const THREADS: usize = 8;

fn single_tier() -> SingleTierStorage<i64, NormalSlot<f32>> {
    SingleTierStorage::new(Tier::with_map(
        "dram",
        0,
        MapKind::Lockless,
        Arc::new(HostAllocator::new("dram")),
    ))
}

fn tiered() -> TieredStorage<i64, ContiguousSlot<f32>> {
    TieredStorage::new(vec![
        Tier::with_map("dram", 0, MapKind::Lockless, Arc::new(HostAllocator::new("dram"))),
        Tier::with_map("pmem", 1, MapKind::Locked, Arc::new(HostAllocator::new("pmem"))),
    ])
    .expect("Failed to create tiered storage")
}

/// Run `f` on `THREADS` threads released at the same instant
fn race<T: Send, F: Fn() -> T + Sync>(f: F) -> Vec<T> {
    let barrier = Barrier::new(THREADS);
    thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    f()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("worker panicked"))
            .collect()
    })
}

#[test]
fn test_concurrent_get_or_create_yields_one_slot() {
    let storage = single_tier();
    for key in 0..50i64 {
        let slots: Vec<SlotPtr<NormalSlot<f32>>> = race(|| storage.get_or_create(key, 2));
        assert!(slots.iter().all(|s| *s == slots[0]), "key {}", key);
    }
    assert_eq!(storage.size(), 50);
}

#[test]
fn test_concurrent_get_or_create_on_tiered_storage() {
    let storage = tiered();
    let slots = race(|| storage.get_or_create(77, 4));
    assert!(slots.iter().all(|s| *s == slots[0]));
    assert_eq!(storage.size_at(0), Some(1));
    assert_eq!(storage.size_at(1), Some(0));
    // losers' slots were destroyed
    assert_eq!(storage.allocator().stats().live_blocks, 1);
}

#[test]
fn test_concurrent_get_or_allocate_allocates_once() {
    let alloc = HostAllocator::new("dram");
    let slot = NormalSlot::<f32>::create(&alloc, 3);

    for column in 0..3 {
        let default = [column as f32; 8];
        // addresses, since raw pointers are not Send
        let addrs = race(|| slot.get_or_allocate(&alloc, column, 8, &default, 0).as_ptr() as usize);
        let first = slot.get(column, 0).expect("column allocated");
        assert!(addrs.iter().all(|a| *a == first.as_ptr() as usize));
        assert_eq!(unsafe { column_slice(first, 8) }, &default);
    }
    assert_eq!(alloc.stats().live_blocks, 3);
    slot.destroy(&alloc);
    assert_eq!(alloc.stats().live_blocks, 0);
}

#[test]
fn test_concurrent_contiguous_columns_initialize_once() {
    let alloc = HostAllocator::new("dram");
    let slot = ContiguousSlot::<f32>::create(&alloc, 8);

    let addrs = race(|| slot.get_or_allocate(&alloc, 1, 4, &[3.0; 4], 4).as_ptr() as usize);
    let column = slot.get(1, 4).expect("column initialized");
    assert!(addrs.iter().all(|a| *a == column.as_ptr() as usize));
    assert_eq!(unsafe { column_slice(column, 4) }, &[3.0; 4]);
    // column 0 untouched
    assert!(slot.get(0, 0).is_none());
    slot.destroy(&alloc);
}

#[test]
fn test_concurrent_promotion_of_one_key() {
    let storage = tiered();
    let slot = unsafe { storage.get_or_create(5, 4).as_ref() };
    slot.get_or_allocate(storage.allocator(), 0, 4, &[5.0; 4], 0);
    storage.eviction(&[5]).expect("eviction");

    let slots = race(|| storage.get(5).expect("promoted"));
    assert!(slots.iter().all(|s| *s == slots[0]));
    assert_eq!(storage.size_at(0), Some(1));
    let promoted = unsafe { slots[0].as_ref() };
    let p = promoted.get(0, 0).expect("column copied");
    assert_eq!(unsafe { column_slice(p, 4) }, &[5.0; 4]);
}

#[test]
fn test_parallel_gather_with_eviction() {
    let pool = RayonPool::new(4).expect("pool");
    let storage: Arc<dyn Storage<i64, ContiguousSlot<f32>>> = Arc::new(tiered());
    let config = EmbeddingConfig {
        default_value_dim: 1,
        ..Default::default()
    };
    let ev = EmbeddingVar::new("ev", storage, config, vec![0.25; 8])
        .expect("embedding var")
        .with_cache_capacity(64);

    thread::scope(|s| {
        for t in 0..4i64 {
            let ev = &ev;
            let pool = &pool;
            s.spawn(move || {
                let keys: Vec<i64> = (0..256).map(|i| t * 1000 + i).collect();
                let mut out = vec![0.0f32; keys.len() * 8];
                ev.gather_embeddings(pool, &keys, &mut out)
                    .expect("gather");
                assert!(out.iter().all(|v| *v == 0.25));
            });
        }
    });

    // eviction runs after the gathers finished
    let keys: Vec<i64> = (0..4).flat_map(|t| (0..256).map(move |i| t * 1000 + i)).collect();
    let evicted = ev.update_cache(&keys[..16]).expect("update cache");
    assert_eq!(evicted, 1024 - 64);
    assert_eq!(ev.storage().size_at(0), Some(64));
    assert_eq!(ev.storage().size_at(1), Some(1024 - 64));
    let released = unsafe { ev.release_invalid_slots() };
    assert_eq!(released, evicted);

    let mut out = vec![0.0f32; 8];
    ev.get_embeddings(&pool, &[3255], &mut out).expect("lookup");
    assert_eq!(out, vec![0.25; 8]);
}
