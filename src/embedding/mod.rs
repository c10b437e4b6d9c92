//! Embedding variable facade
//!
//! An [`EmbeddingVar`] is one named column family over a shared [`Storage`]:
//! the primary embedding and each optimizer slot are separate variables that
//! address different columns of the same value slots.
//!
//! ```text
//!  keys ─► FilterPolicy ─► Storage::get_or_create ─► ValueSlot column
//!                │                                       │
//!                └─ frequency / version bookkeeping      └─► out rows
//!  touched keys ─► EvictionCache ─► eviction_with_delayed_destroy
//! ```
//!
//! Batch operations fan out over a [`WorkerPool`]; every worker writes its
//! own rows of the output buffer.

mod filter;
mod shard;

pub use filter::{FilterPolicy, NullableFilter};
pub use shard::{shard_rows, RayonPool, WorkerPool, MIN_COST_PER_SHARD};

use crate::checkpoint::{
    CheckpointReader, CheckpointWriter, ColumnSpec, DefaultValueIterator, RestoreData,
    ValueIterator, DEFAULT_BYTES_LIMIT,
};
use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};
use crate::storage::value::{
    column_slice, column_slice_mut, BatchInitializer, Claim, EmbeddingMemoryPool,
};
use crate::storage::{
    Allocator, CacheStats, DeviceSlot, EvictionCache, SaveContext, ShrinkArgs, SlotMeta, SlotPtr, Storage,
    ValueSlot,
};
use crate::types::{Element, Key};
use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Column byte width is rounded up to this for fixed-length layouts
const ALLOC_ALIGN_BYTES: usize = 16;

/// Elements per column once `value_len` is padded to [`ALLOC_ALIGN_BYTES`]
fn padded_len<V>(value_len: usize) -> usize {
    let bytes = value_len * size_of::<V>();
    let rem = bytes % ALLOC_ALIGN_BYTES;
    if rem == 0 {
        value_len
    } else {
        value_len + (ALLOC_ALIGN_BYTES - rem) / size_of::<V>()
    }
}

/// One embedding column family over a shared storage
pub struct EmbeddingVar<K: Key, S: ValueSlot + SlotMeta> {
    name: String,
    storage: Arc<dyn Storage<K, S>>,
    config: EmbeddingConfig,
    /// `default_value_dim` rows of `value_len`
    default_values: Vec<S::Elem>,
    default_value_no_permission: Vec<S::Elem>,
    value_len: usize,
    filter: Box<dyn FilterPolicy<K, S>>,
    cache: Option<EvictionCache<K>>,
    cache_capacity: usize,
    bytes_limit: usize,
}

impl<K: Key, S: ValueSlot + SlotMeta> EmbeddingVar<K, S> {
    /// Create a variable; `default_values` holds `config.default_value_dim` rows
    pub fn new(
        name: impl Into<String>,
        storage: Arc<dyn Storage<K, S>>,
        config: EmbeddingConfig,
        default_values: Vec<S::Elem>,
    ) -> Result<Self> {
        let name = name.into();
        config.validate()?;
        if config.column_num() > S::MAX_COLUMNS {
            return Err(Error::Config(format!(
                "{}: {} columns exceed the {} a {} slot holds",
                name,
                config.column_num(),
                S::MAX_COLUMNS,
                std::any::type_name::<S>()
            )));
        }
        let dim = config.default_value_dim;
        if default_values.is_empty() || default_values.len() % dim != 0 {
            return Err(Error::InvalidArgument(format!(
                "{}: {} default values do not split into {} rows",
                name,
                default_values.len(),
                dim
            )));
        }
        let value_len = default_values.len() / dim;

        let alloc_len = padded_len::<S::Elem>(value_len);
        if storage.alloc_len() == 0 {
            storage.set_alloc_len(alloc_len);
        } else if storage.alloc_len() != alloc_len {
            return Err(Error::InvalidArgument(format!(
                "{}: column stride {} conflicts with storage stride {}",
                name,
                alloc_len,
                storage.alloc_len()
            )));
        }

        let no_permission = vec![
            S::Elem::from_f64(config.default_value_no_permission);
            value_len
        ];
        let cache = storage.is_multi_level().then(EvictionCache::new);

        info!(
            name = %name,
            value_len,
            alloc_len,
            emb_index = config.emb_index,
            primary = config.is_primary(),
            multi_level = storage.is_multi_level(),
            "Created embedding variable"
        );

        Ok(Self {
            name,
            storage,
            config,
            default_values,
            default_value_no_permission: no_permission,
            value_len,
            filter: Box::new(NullableFilter),
            cache,
            cache_capacity: usize::MAX,
            bytes_limit: DEFAULT_BYTES_LIMIT,
        })
    }

    /// Keep at most `capacity` keys in the primary tier
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn with_filter(mut self, filter: impl FilterPolicy<K, S> + 'static) -> Self {
        self.filter = Box::new(filter);
        self
    }

    /// Staging buffer size used when exporting
    pub fn with_bytes_limit(mut self, bytes_limit: usize) -> Self {
        self.bytes_limit = bytes_limit;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &EmbeddingConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn Storage<K, S>> {
        &self.storage
    }

    pub fn value_len(&self) -> usize {
        self.value_len
    }

    /// Capacity every slot of this variable is created with
    pub fn slot_capacity(&self) -> usize {
        S::capacity_for(self.config.column_num(), self.storage.alloc_len())
    }

    /// Default row of `key`
    pub fn get_default_value(&self, key: K) -> &[S::Elem] {
        let dim = self.config.default_value_dim as i64;
        let row = key.as_i64().rem_euclid(dim) as usize;
        &self.default_values[row * self.value_len..(row + 1) * self.value_len]
    }

    /// Row returned for keys the filter did not admit
    pub fn default_value_no_permission(&self) -> &[S::Elem] {
        &self.default_value_no_permission
    }

    pub fn lookup_key(&self, key: K) -> Result<SlotPtr<S>> {
        self.storage.get(key)
    }

    /// Find or create through the filter, then count `count` accesses
    pub fn lookup_or_create_key(&self, key: K, count: i64) -> SlotPtr<S> {
        let slot = self
            .filter
            .lookup_or_create_key(&*self.storage, key, self.slot_capacity(), count);
        // SAFETY: freshly returned by the storage
        self.add_freq(unsafe { slot.as_ref() }, count);
        slot
    }

    pub fn add_freq(&self, slot: &S, count: i64) {
        if self.storage.is_multi_level() || self.config.record_freq {
            slot.add_freq(count);
        } else if self.config.is_counter_filter() && slot.freq() < self.config.filter_freq {
            slot.add_freq(count);
        }
    }

    pub fn update_version(&self, slot: &S, step: i64) {
        if self.config.is_save_version() {
            slot.set_step(step);
        }
    }

    /// Column of this variable in `slot`, materialized from `default` on first use
    pub fn lookup_or_create_emb(&self, slot: &S, default: &[S::Elem]) -> NonNull<S::Elem> {
        let column = self.config.emb_index;
        slot.get_or_allocate(
            self.storage.allocator(),
            column,
            self.value_len,
            default,
            self.storage.offset(column),
        )
    }

    /// Primary embedding of `slot`, if materialized
    pub fn lookup_primary_emb(&self, slot: &S) -> Option<NonNull<S::Elem>> {
        let column = self.config.primary_emb_index;
        slot.get(column, self.storage.offset(column))
    }

    fn check_output(&self, keys: &[K], out: &[S::Elem]) -> Result<()> {
        if out.len() != keys.len() * self.value_len {
            return Err(Error::InvalidArgument(format!(
                "{}: output of {} elements for {} keys of length {}",
                self.name,
                out.len(),
                keys.len(),
                self.value_len
            )));
        }
        Ok(())
    }

    /// Copy the embeddings of `keys` into `out` without creating anything
    ///
    /// Missing keys and unset columns read the default row; keys the filter
    /// rejects read the no-permission row.
    pub fn get_embeddings(
        &self,
        pool: &dyn WorkerPool,
        keys: &[K],
        out: &mut [S::Elem],
    ) -> Result<()> {
        self.check_output(keys, out)?;
        let column = self.config.emb_index;
        let offset = self.storage.offset(column);
        let value_len = self.value_len;
        shard_rows(pool, out, value_len, value_len * 10, &|i, row| {
            let key = keys[i];
            let Ok(ptr) = self.storage.get(key) else {
                row.copy_from_slice(self.get_default_value(key));
                return;
            };
            // SAFETY: no concurrent removal during lookups
            let slot = unsafe { ptr.as_ref() };
            if !self.filter.is_admit(key, slot) {
                row.copy_from_slice(&self.default_value_no_permission);
                return;
            }
            match slot.get(column, offset) {
                // SAFETY: allocated columns hold value_len elements
                Some(p) => row.copy_from_slice(unsafe { column_slice(p, value_len) }),
                None => row.copy_from_slice(self.get_default_value(key)),
            }
        });
        Ok(())
    }

    /// Find or create every key, then copy its embedding into `out`
    ///
    /// Returns the slots row by row and marks the keys as recently used.
    pub fn gather_embeddings(
        &self,
        pool: &dyn WorkerPool,
        keys: &[K],
        out: &mut [S::Elem],
    ) -> Result<Vec<SlotPtr<S>>> {
        self.check_output(keys, out)?;

        let mut found: Vec<Option<SlotPtr<S>>> = vec![None; keys.len()];
        shard_rows(pool, &mut found, 1, 1000, &|i, row| {
            row[0] = Some(self.lookup_or_create_key(keys[i], 1));
        });
        let slots: Vec<SlotPtr<S>> = found.into_iter().flatten().collect();

        let value_len = self.value_len;
        shard_rows(pool, out, value_len, value_len * 10, &|i, row| {
            let key = keys[i];
            // SAFETY: created above; eviction only runs from update_cache
            let slot = unsafe { slots[i].as_ref() };
            if self.filter.is_admit(key, slot) {
                let p = self.lookup_or_create_emb(slot, self.get_default_value(key));
                // SAFETY: the column holds value_len elements
                row.copy_from_slice(unsafe { column_slice(p, value_len) });
            } else {
                row.copy_from_slice(&self.default_value_no_permission);
            }
        });

        self.add_to_cache(keys);
        Ok(slots)
    }

    /// Mark `keys` as recently used
    pub fn add_to_cache(&self, keys: &[K]) {
        if let Some(cache) = &self.cache {
            cache.update(keys);
        }
    }

    /// Touch `keys`, then evict least-recent keys beyond the cache capacity
    ///
    /// Evicted slots are retired, not freed; see
    /// [`EmbeddingVar::release_invalid_slots`].
    pub fn update_cache(&self, keys: &[K]) -> Result<usize> {
        self.add_to_cache(keys);
        self.evict_cold()
    }

    /// Evict least-recent keys beyond the cache capacity without touching any
    ///
    /// Use after [`EmbeddingVar::gather_embeddings`], which already touched
    /// the gathered keys.
    pub fn evict_cold(&self) -> Result<usize> {
        let Some(cache) = &self.cache else {
            return Ok(0);
        };
        let victims = cache.evict_over(self.cache_capacity);
        if victims.is_empty() {
            return Ok(0);
        }
        let evicted = self.storage.eviction_with_delayed_destroy(&victims)?;
        debug!(name = %self.name, victims = victims.len(), evicted, "Evicted cold keys");
        Ok(evicted)
    }

    /// Free slots retired by earlier evictions
    ///
    /// # Safety
    /// No slot handle obtained before the evictions may still be dereferenced.
    pub unsafe fn release_invalid_slots(&self) -> usize {
        self.storage.release_invalid_slots()
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(|c| c.stats())
    }

    fn shrink_args(&self, global_step: i64) -> ShrinkArgs {
        let primary = self.config.primary_emb_index;
        ShrinkArgs::new(global_step, self.value_len)
            .with_column(primary, self.storage.offset(primary))
    }

    /// Apply the retention policy; only the primary variable shrinks
    pub fn shrink(&self, global_step: i64) -> usize {
        if !self.config.is_primary() {
            return 0;
        }
        let removed = self.storage.shrink(&self.shrink_args(global_step));
        if let Some(cache) = &self.cache {
            if removed > 0 {
                // drop cache entries of keys that no longer exist
                let (keys, _) = self.storage.snapshot();
                cache.clear();
                cache.update(&keys);
            }
        }
        debug!(name = %self.name, global_step, removed, "Shrink completed");
        removed
    }

    /// Export as the nine `name-*` tensors
    ///
    /// Values that are not resident come from `value_iter`, or the first
    /// default row when none is given.
    pub fn save(
        &self,
        writer: &mut dyn CheckpointWriter,
        global_step: i64,
        value_iter: Option<&mut dyn ValueIterator<S::Elem>>,
    ) -> Result<()> {
        let default_value = &self.default_values[..self.value_len];
        let ctx = SaveContext {
            config: &self.config,
            shrink_args: self.shrink_args(global_step),
            spec: ColumnSpec::new(self.value_len).with_offsets(
                self.storage.offset(self.config.emb_index),
                self.storage.offset(self.config.primary_emb_index),
            ),
            default_value,
            bytes_limit: self.bytes_limit,
        };
        let mut fallback = DefaultValueIterator::new(default_value);
        let value_iter: &mut dyn ValueIterator<S::Elem> = match value_iter {
            Some(iter) => iter,
            None => &mut fallback,
        };
        self.storage.save(&self.name, writer, &ctx, Some(value_iter))?;
        info!(name = %self.name, global_step, size = self.size(), "Saved embedding variable");
        Ok(())
    }

    /// Load restore shard `partition_id` of `partition_num`
    ///
    /// Returns the number of admitted keys restored.
    pub fn restore(
        &self,
        reader: &dyn CheckpointReader,
        partition_id: usize,
        partition_num: usize,
        reset_version: bool,
    ) -> Result<usize> {
        let data: RestoreData<K, S::Elem> =
            RestoreData::load(reader, &self.name, partition_id, partition_num)?;
        if !data.keys.is_empty() && data.value_len != self.value_len {
            return Err(Error::Checkpoint(format!(
                "{}: saved value length {} != {}",
                self.name, data.value_len, self.value_len
            )));
        }

        let capacity = self.slot_capacity();
        for (i, &key) in data.keys.iter().enumerate() {
            // SAFETY: restore runs before lookups start
            let slot = unsafe { self.storage.get_or_create(key, capacity).as_ref() };
            let row = data.row(i);
            let p = self.lookup_or_create_emb(slot, row);
            // SAFETY: the column holds value_len elements and nobody else writes it
            unsafe { column_slice_mut(p, self.value_len) }.copy_from_slice(row);
            if !reset_version {
                if let Some(step) = data.version(i) {
                    slot.set_step(step);
                }
            }
            if let Some(freq) = data.freq(i) {
                slot.set_freq(freq);
            }
        }

        for (i, &key) in data.keys_filtered.iter().enumerate() {
            // SAFETY: as above
            let slot = unsafe { self.storage.get_or_create(key, capacity).as_ref() };
            if !reset_version {
                if let Some(&step) = data.versions_filtered.get(i) {
                    slot.set_step(step);
                }
            }
            if let Some(&freq) = data.freqs_filtered.get(i) {
                slot.set_freq(freq);
            }
        }

        self.add_to_cache(&data.keys);
        if data.is_empty() {
            warn!(name = %self.name, partition_id, partition_num, "Restored an empty shard");
        }
        info!(
            name = %self.name,
            partition_id,
            keys = data.keys.len(),
            filtered = data.keys_filtered.len(),
            "Restored embedding variable"
        );
        Ok(data.len())
    }

    /// Drop `key` from storage and from the eviction cache
    pub fn remove(&self, key: K) -> Result<()> {
        self.storage.remove(key)?;
        if let Some(cache) = &self.cache {
            cache.remove(&key);
        }
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.storage.size()
    }

    pub fn get_freq(&self, key: K) -> Option<i64> {
        // SAFETY: the handle is used immediately
        self.storage.get(key).ok().map(|p| unsafe { p.as_ref() }.freq())
    }

    pub fn get_version(&self, key: K) -> Option<i64> {
        // SAFETY: the handle is used immediately
        self.storage.get(key).ok().map(|p| unsafe { p.as_ref() }.step())
    }
}

impl<K: Key, V: Element> EmbeddingVar<K, DeviceSlot<V>> {
    /// Find or create every key and return its device column
    ///
    /// Workers only claim uninitialized columns; pool allocation and default
    /// copies happen afterwards in one batch on the calling thread.
    ///
    /// The storage tier must be built over `mem_pool` so removed slots give
    /// their blocks back.
    pub fn batch_lookup_or_create_emb(
        &self,
        pool: &dyn WorkerPool,
        mem_pool: &EmbeddingMemoryPool<V>,
        keys: &[K],
    ) -> Result<Vec<NonNull<V>>> {
        let tier_alloc = self.storage.allocator() as *const dyn Allocator;
        if !std::ptr::eq(tier_alloc.cast::<()>(), (mem_pool as *const EmbeddingMemoryPool<V>).cast()) {
            return Err(Error::InvalidArgument(format!(
                "{}: storage allocator {} is not the device block pool",
                self.name,
                self.storage.allocator().name()
            )));
        }
        if mem_pool.block_len() < self.slot_capacity() {
            return Err(Error::InvalidArgument(format!(
                "{}: pool block of {} elements is smaller than a slot ({})",
                self.name,
                mem_pool.block_len(),
                self.slot_capacity()
            )));
        }

        let mut found: Vec<Option<SlotPtr<DeviceSlot<V>>>> = vec![None; keys.len()];
        shard_rows(pool, &mut found, 1, 1000, &|i, row| {
            row[0] = Some(self.lookup_or_create_key(keys[i], 1));
        });
        // SAFETY: created above; device slots are never evicted
        let slots: Vec<&DeviceSlot<V>> = found
            .into_iter()
            .flatten()
            .map(|p| unsafe { p.as_ref() })
            .collect();

        let column = self.config.emb_index;
        let offset = self.storage.offset(column);
        let initializer = BatchInitializer::new();
        pool.shard(slots.len(), 100, &|start, end| {
            let mut cursor = Vec::new();
            for (row, slot) in slots[start..end].iter().enumerate() {
                if let Claim::NeedsInit = slot.get_or_claim(column, offset) {
                    cursor.push(start + row);
                }
            }
            initializer.submit(cursor);
        });

        let initialized = initializer.initialize(
            &slots,
            mem_pool,
            column,
            self.value_len,
            offset,
            |row| self.get_default_value(keys[row]),
        );
        debug!(
            name = %self.name,
            keys = keys.len(),
            initialized = initialized.len(),
            "Batch lookup completed"
        );

        slots
            .iter()
            .zip(keys)
            .map(|(slot, key)| {
                slot.get(column, offset)
                    .ok_or_else(|| Error::NotFound(format!("device column of key {:?}", key)))
            })
            .collect()
    }
}
