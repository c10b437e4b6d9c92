//! Columnar checkpoint dataset
//!
//! Keys are classified into admitted keys (with a value row) and filtered
//! keys (seen by the admission filter but never given a value). Both kinds
//! are bucketed into [`SAVED_PARTITION_NUM`] partitions by key so a restore
//! running with a different shard count can pick its own ranges.

use super::bundle::CheckpointWriter;
use super::dump::{save_tensor_with_fixed_buffer, ValueDumpIterator, VecDumpIterator};
use super::{tensor_name, ValueIterator};
use crate::config::EmbeddingConfig;
use crate::error::Result;
use crate::metrics;
use crate::storage::value::{column_slice, ColumnLookup, SlotMeta, ValueSlot};
use crate::types::{Element, Key, Scalar};
use bytes::BytesMut;
use tracing::debug;

/// Partitions written per checkpoint
pub const SAVED_PARTITION_NUM: usize = 1000;

/// Value of one admitted key
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ValueRef<'a, V> {
    /// Column memory of the slot
    Stored(&'a [V]),
    /// Column never allocated; the default row stands in
    Default(&'a [V]),
    /// Column lives outside the exporting tier
    NotResident,
}

/// Where the exported columns sit inside a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    pub value_len: usize,
    /// Element offset of `emb_index` (fixed-length layouts)
    pub value_offset: usize,
    /// Element offset of `primary_emb_index`
    pub primary_offset: usize,
}

impl ColumnSpec {
    pub fn new(value_len: usize) -> Self {
        Self {
            value_len,
            value_offset: 0,
            primary_offset: 0,
        }
    }

    pub fn with_offsets(mut self, value_offset: usize, primary_offset: usize) -> Self {
        self.value_offset = value_offset;
        self.primary_offset = primary_offset;
        self
    }
}

/// The nine arrays of one checkpoint
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointData<'a, K, V> {
    pub keys: Vec<K>,
    pub values: Vec<ValueRef<'a, V>>,
    pub versions: Vec<i64>,
    pub freqs: Vec<i64>,
    pub keys_filtered: Vec<K>,
    pub versions_filtered: Vec<i64>,
    pub freqs_filtered: Vec<i64>,
    pub partition_offset: Vec<i32>,
    pub partition_filter_offset: Vec<i32>,
}

impl<K, V> Default for CheckpointData<'_, K, V> {
    fn default() -> Self {
        Self {
            keys: Vec::new(),
            values: Vec::new(),
            versions: Vec::new(),
            freqs: Vec::new(),
            keys_filtered: Vec::new(),
            versions_filtered: Vec::new(),
            freqs_filtered: Vec::new(),
            partition_offset: Vec::new(),
            partition_filter_offset: Vec::new(),
        }
    }
}

impl<'a, K: Key, V: Element> CheckpointData<'a, K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one key
    ///
    /// A key whose primary column was never allocated while a frequency
    /// filter is active is a filtered key: it is kept (without value) only
    /// if `save_unfiltered_features` is set. Every other key is admitted.
    pub fn emplace<S>(
        &mut self,
        key: K,
        slot: &'a S,
        config: &EmbeddingConfig,
        default_value: &'a [V],
        spec: ColumnSpec,
    ) where
        S: ValueSlot<Elem = V> + SlotMeta,
    {
        let primary = slot.lookup(config.primary_emb_index, spec.primary_offset);
        let is_filtered = primary == ColumnLookup::Unset && config.filter_freq != 0;

        if is_filtered {
            if !config.save_unfiltered_features {
                return;
            }
            self.keys_filtered.push(key);
            if config.is_save_version() {
                self.versions_filtered.push(slot.step());
            }
            self.freqs_filtered.push(slot.freq());
            return;
        }

        let value = match primary {
            ColumnLookup::Unset => ValueRef::Default(default_value),
            ColumnLookup::NotResident => ValueRef::NotResident,
            ColumnLookup::Present(_) => match slot.lookup(config.emb_index, spec.value_offset) {
                // SAFETY: an allocated column holds value_len elements and
                // lives as long as the slot borrow
                ColumnLookup::Present(p) => {
                    ValueRef::Stored(unsafe { column_slice(p, spec.value_len) })
                }
                ColumnLookup::Unset => ValueRef::Default(default_value),
                ColumnLookup::NotResident => ValueRef::NotResident,
            },
        };
        self.keys.push(key);
        self.values.push(value);
        if config.is_save_version() {
            self.versions.push(slot.step());
        }
        if config.is_save_freq() {
            self.freqs.push(slot.freq());
        }
    }

    /// Record a key with an explicit value and no bookkeeping
    pub fn emplace_value(&mut self, key: K, value: ValueRef<'a, V>) {
        self.keys.push(key);
        self.values.push(value);
    }

    /// Concatenate partitions in order, recording cumulative offsets
    pub fn set_with_partition(&mut self, parts: Vec<CheckpointData<'a, K, V>>) {
        self.partition_offset = Vec::with_capacity(parts.len() + 1);
        self.partition_filter_offset = Vec::with_capacity(parts.len() + 1);
        self.partition_offset.push(0);
        self.partition_filter_offset.push(0);

        for part in parts {
            let last = *self.partition_offset.last().unwrap_or(&0);
            self.partition_offset.push(last + part.keys.len() as i32);
            let last = *self.partition_filter_offset.last().unwrap_or(&0);
            self.partition_filter_offset
                .push(last + part.keys_filtered.len() as i32);

            self.keys.extend(part.keys);
            self.values.extend(part.values);
            self.versions.extend(part.versions);
            self.freqs.extend(part.freqs);
            self.keys_filtered.extend(part.keys_filtered);
            self.versions_filtered.extend(part.versions_filtered);
            self.freqs_filtered.extend(part.freqs_filtered);
        }
    }

    /// Stream all nine arrays, stopping at the first failed write
    pub fn export_to_ckpt(
        &self,
        name: &str,
        writer: &mut dyn CheckpointWriter,
        value_len: usize,
        value_iter: Option<&mut dyn ValueIterator<V>>,
        bytes_limit: usize,
    ) -> Result<()> {
        let mut buf = BytesMut::with_capacity(bytes_limit);

        dump_vec(name, "keys", writer, &mut buf, bytes_limit, &self.keys)?;
        save_tensor_with_fixed_buffer(
            &tensor_name(name, "values"),
            writer,
            &mut buf,
            bytes_limit,
            &mut ValueDumpIterator::new(&self.values, value_len, value_iter),
            &[self.values.len(), value_len],
        )?;
        dump_vec(name, "versions", writer, &mut buf, bytes_limit, &self.versions)?;
        dump_vec(name, "freqs", writer, &mut buf, bytes_limit, &self.freqs)?;
        dump_vec(name, "keys_filtered", writer, &mut buf, bytes_limit, &self.keys_filtered)?;
        dump_vec(
            name,
            "versions_filtered",
            writer,
            &mut buf,
            bytes_limit,
            &self.versions_filtered,
        )?;
        dump_vec(name, "freqs_filtered", writer, &mut buf, bytes_limit, &self.freqs_filtered)?;
        dump_vec(
            name,
            "partition_offset",
            writer,
            &mut buf,
            bytes_limit,
            &self.partition_offset,
        )?;
        dump_vec(
            name,
            "partition_filter_offset",
            writer,
            &mut buf,
            bytes_limit,
            &self.partition_filter_offset,
        )?;

        debug!(
            tensor = name,
            keys = self.keys.len(),
            filtered = self.keys_filtered.len(),
            "Exported checkpoint arrays"
        );
        Ok(())
    }
}

fn dump_vec<T: Scalar>(
    name: &str,
    suffix: &str,
    writer: &mut dyn CheckpointWriter,
    buf: &mut BytesMut,
    bytes_limit: usize,
    data: &[T],
) -> Result<()> {
    save_tensor_with_fixed_buffer(
        &tensor_name(name, suffix),
        writer,
        buf,
        bytes_limit,
        &mut VecDumpIterator::new(data),
        &[data.len()],
    )
}

/// Partition of a key in the saved layout
pub fn saved_partition<K: Key>(key: K) -> usize {
    key.as_i64().rem_euclid(SAVED_PARTITION_NUM as i64) as usize
}

/// Build a partitioned dataset from a merged snapshot and export it
#[allow(clippy::too_many_arguments)]
pub fn save_to_checkpoint<'a, K, S>(
    name: &str,
    writer: &mut dyn CheckpointWriter,
    config: &EmbeddingConfig,
    spec: ColumnSpec,
    default_value: &'a [S::Elem],
    keys: &[K],
    slots: &[&'a S],
    value_iter: Option<&mut dyn ValueIterator<S::Elem>>,
    bytes_limit: usize,
) -> Result<()>
where
    K: Key,
    S: ValueSlot + SlotMeta,
{
    let mut parts: Vec<CheckpointData<'a, K, S::Elem>> =
        (0..SAVED_PARTITION_NUM).map(|_| CheckpointData::new()).collect();
    for (&key, &slot) in keys.iter().zip(slots) {
        parts[saved_partition(key)].emplace(key, slot, config, default_value, spec);
    }

    let mut data = CheckpointData::new();
    data.set_with_partition(parts);
    metrics::record_checkpoint(data.keys.len(), data.keys_filtered.len());

    data.export_to_ckpt(name, writer, spec.value_len, value_iter, bytes_limit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointReader, MemoryBundle};
    use crate::storage::allocator::HostAllocator;
    use crate::storage::value::NormalSlot;

    fn slot_with_value(alloc: &HostAllocator, value: Option<&[f32]>) -> NormalSlot<f32> {
        let slot = NormalSlot::create(alloc, 2);
        if let Some(v) = value {
            slot.get_or_allocate(alloc, 0, v.len(), v, 0);
        }
        slot
    }

    #[test]
    fn test_emplace_classification() {
        let alloc = HostAllocator::new("test");
        let default = [9.0f32, 9.0];
        let admitted = slot_with_value(&alloc, Some(&[1.0, 2.0]));
        admitted.set_step(4);
        admitted.set_freq(7);
        let rejected = slot_with_value(&alloc, None);
        rejected.set_freq(1);

        let config = EmbeddingConfig {
            filter_freq: 3,
            steps_to_live: 10,
            ..Default::default()
        };

        let mut data: CheckpointData<'_, i64, f32> = CheckpointData::new();
        data.emplace(1, &admitted, &config, &default, ColumnSpec::new(2));
        data.emplace(2, &rejected, &config, &default, ColumnSpec::new(2));
        assert_eq!(data.keys, vec![1]);
        assert_eq!(data.values, vec![ValueRef::Stored(&[1.0, 2.0][..])]);
        assert_eq!(data.versions, vec![4]);
        assert_eq!(data.freqs, vec![7]);
        assert!(data.keys_filtered.is_empty());

        let config = EmbeddingConfig {
            save_unfiltered_features: true,
            ..config
        };
        data.emplace(2, &rejected, &config, &default, ColumnSpec::new(2));
        assert_eq!(data.keys_filtered, vec![2]);
        assert_eq!(data.versions_filtered, vec![-1]);
        assert_eq!(data.freqs_filtered, vec![1]);
        assert_eq!(data.keys.len(), 1);

        admitted.destroy(&alloc);
        rejected.destroy(&alloc);
    }

    #[test]
    fn test_unset_primary_without_filter_uses_default() {
        let alloc = HostAllocator::new("test");
        let default = [0.5f32; 2];
        let slot = slot_with_value(&alloc, None);

        let mut data: CheckpointData<'_, i32, f32> = CheckpointData::new();
        data.emplace(5, &slot, &EmbeddingConfig::default(), &default, ColumnSpec::new(2));
        assert_eq!(data.values, vec![ValueRef::Default(&default[..])]);
        // no version/freq recording configured
        assert!(data.versions.is_empty());
        assert!(data.freqs.is_empty());
        slot.destroy(&alloc);
    }

    #[test]
    fn test_set_with_partition_offsets() {
        let mut parts: Vec<CheckpointData<'_, i64, f32>> =
            (0..4).map(|_| CheckpointData::new()).collect();
        parts[0].emplace_value(0, ValueRef::NotResident);
        parts[2].emplace_value(2, ValueRef::NotResident);
        parts[2].emplace_value(6, ValueRef::NotResident);
        parts[3].keys_filtered.push(3);

        let mut merged = CheckpointData::new();
        merged.set_with_partition(parts);
        assert_eq!(merged.keys, vec![0, 2, 6]);
        assert_eq!(merged.partition_offset, vec![0, 1, 1, 3, 3]);
        assert_eq!(merged.partition_filter_offset, vec![0, 0, 0, 0, 1]);
    }

    #[test]
    fn test_export_writes_nine_arrays() -> Result<()> {
        let row = [1.0f64, 2.0, 3.0];
        let mut part: CheckpointData<'_, i64, f64> = CheckpointData::new();
        part.emplace_value(10, ValueRef::Stored(&row[..]));
        part.emplace_value(11, ValueRef::Default(&row[..]));
        part.versions.extend([3, 4]);
        let mut data = CheckpointData::new();
        data.set_with_partition(vec![part]);

        let mut bundle = MemoryBundle::new();
        data.export_to_ckpt("ev", &mut bundle, 3, None, 1024)?;
        assert_eq!(bundle.len(), 9);
        let values = bundle.read_tensor("ev-values")?;
        assert_eq!(values.shape, vec![2, 3]);
        assert_eq!(bundle.read_tensor("ev-partition_offset")?.to_vec::<i32>()?, vec![0, 1]);
        assert!(bundle.read_tensor("ev-keys_filtered")?.to_vec::<i64>()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_saved_partition_handles_negative_keys() {
        assert_eq!(saved_partition(1234i64), 234);
        assert_eq!(saved_partition(-1i64), 999);
        assert_eq!(saved_partition(7u32), 7);
    }
}
