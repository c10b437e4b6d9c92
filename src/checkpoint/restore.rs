//! Reading a checkpoint back, one restore shard at a time

use super::bundle::{CheckpointReader, Tensor};
use super::tensor_name;
use crate::error::{Error, Result};
use crate::types::{Element, Key, Scalar};
use std::ops::Range;
use tracing::debug;

/// Arrays of the saved partitions that belong to one restore shard
///
/// Saved partition `p` belongs to shard `p % partition_num`. Versions and
/// frequencies are empty when the saving variable did not record them.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoreData<K, V> {
    pub value_len: usize,
    pub keys: Vec<K>,
    /// Row-major, `value_len` per key
    pub values: Vec<V>,
    pub versions: Vec<i64>,
    pub freqs: Vec<i64>,
    pub keys_filtered: Vec<K>,
    pub versions_filtered: Vec<i64>,
    pub freqs_filtered: Vec<i64>,
}

impl<K, V> Default for RestoreData<K, V> {
    fn default() -> Self {
        Self {
            value_len: 0,
            keys: Vec::new(),
            values: Vec::new(),
            versions: Vec::new(),
            freqs: Vec::new(),
            keys_filtered: Vec::new(),
            versions_filtered: Vec::new(),
            freqs_filtered: Vec::new(),
        }
    }
}

fn read<T: Scalar>(reader: &dyn CheckpointReader, name: &str, suffix: &str) -> Result<Vec<T>> {
    reader.read_tensor(&tensor_name(name, suffix))?.to_vec()
}

/// Validate a cumulative offset array against the length it indexes
fn check_offsets(offsets: &[i32], len: usize, what: &str) -> Result<()> {
    if offsets.first() != Some(&0) {
        return Err(Error::Checkpoint(format!("{}: offsets must start at 0", what)));
    }
    let monotone = offsets.windows(2).all(|w| w[0] <= w[1]);
    let last = offsets.last().copied().unwrap_or(0) as usize;
    if !monotone || last != len {
        return Err(Error::Checkpoint(format!(
            "{}: offsets do not cover {} entries",
            what, len
        )));
    }
    Ok(())
}

/// Copy `range` of `src` if `src` is parallel to the key array
fn extend_parallel<T: Copy>(dst: &mut Vec<T>, src: &[T], keys: usize, range: Range<usize>) {
    if src.len() == keys {
        dst.extend_from_slice(&src[range]);
    }
}

impl<K: Key, V: Element> RestoreData<K, V> {
    /// Load the shard `partition_id` of `partition_num` from tensors named `name-*`
    pub fn load(
        reader: &dyn CheckpointReader,
        name: &str,
        partition_id: usize,
        partition_num: usize,
    ) -> Result<Self> {
        if partition_num == 0 || partition_id >= partition_num {
            return Err(Error::InvalidArgument(format!(
                "partition {} of {}",
                partition_id, partition_num
            )));
        }

        let keys: Vec<K> = read(reader, name, "keys")?;
        let values_tensor: Tensor = reader.read_tensor(&tensor_name(name, "values"))?;
        let value_len = match values_tensor.shape.as_slice() {
            [n, len] if *n == keys.len() => *len,
            shape => {
                return Err(Error::Checkpoint(format!(
                    "values shape {:?} does not match {} keys",
                    shape,
                    keys.len()
                )))
            }
        };
        let values: Vec<V> = values_tensor.to_vec()?;
        let versions: Vec<i64> = read(reader, name, "versions")?;
        let freqs: Vec<i64> = read(reader, name, "freqs")?;
        let keys_filtered: Vec<K> = read(reader, name, "keys_filtered")?;
        let versions_filtered: Vec<i64> = read(reader, name, "versions_filtered")?;
        let freqs_filtered: Vec<i64> = read(reader, name, "freqs_filtered")?;
        let offsets: Vec<i32> = read(reader, name, "partition_offset")?;
        let filter_offsets: Vec<i32> = read(reader, name, "partition_filter_offset")?;

        check_offsets(&offsets, keys.len(), "partition_offset")?;
        check_offsets(&filter_offsets, keys_filtered.len(), "partition_filter_offset")?;
        if offsets.len() != filter_offsets.len() {
            return Err(Error::Checkpoint("partition offset arrays differ in length".into()));
        }

        let mut out = RestoreData {
            value_len,
            ..Default::default()
        };
        for p in (partition_id..offsets.len() - 1).step_by(partition_num) {
            let range = offsets[p] as usize..offsets[p + 1] as usize;
            out.keys.extend_from_slice(&keys[range.clone()]);
            out.values
                .extend_from_slice(&values[range.start * value_len..range.end * value_len]);
            extend_parallel(&mut out.versions, &versions, keys.len(), range.clone());
            extend_parallel(&mut out.freqs, &freqs, keys.len(), range);

            let range = filter_offsets[p] as usize..filter_offsets[p + 1] as usize;
            out.keys_filtered.extend_from_slice(&keys_filtered[range.clone()]);
            let n = keys_filtered.len();
            extend_parallel(&mut out.versions_filtered, &versions_filtered, n, range.clone());
            extend_parallel(&mut out.freqs_filtered, &freqs_filtered, n, range);
        }

        debug!(
            tensor = name,
            partition_id,
            partition_num,
            keys = out.keys.len(),
            filtered = out.keys_filtered.len(),
            "Loaded restore shard"
        );
        Ok(out)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.keys_filtered.is_empty()
    }

    /// Value row of the `i`-th admitted key
    pub fn row(&self, i: usize) -> &[V] {
        &self.values[i * self.value_len..(i + 1) * self.value_len]
    }

    pub fn version(&self, i: usize) -> Option<i64> {
        self.versions.get(i).copied()
    }

    pub fn freq(&self, i: usize) -> Option<i64> {
        self.freqs.get(i).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointData, MemoryBundle, ValueRef};

    fn saved_bundle() -> Result<MemoryBundle> {
        let rows = [[0.0f32, 0.5], [1.0, 1.5], [2.0, 2.5], [3.0, 3.5]];
        let mut parts: Vec<CheckpointData<'_, i64, f32>> =
            (0..4).map(|_| CheckpointData::new()).collect();
        for (k, row) in rows.iter().enumerate() {
            let part = &mut parts[k % 4];
            part.emplace_value(k as i64, ValueRef::Stored(&row[..]));
            part.freqs.push(10 + k as i64);
        }
        parts[1].keys_filtered.push(101);
        parts[1].freqs_filtered.push(1);

        let mut data = CheckpointData::new();
        data.set_with_partition(parts);
        let mut bundle = MemoryBundle::new();
        data.export_to_ckpt("ev", &mut bundle, 2, None, 64)?;
        Ok(bundle)
    }

    #[test]
    fn test_load_single_shard() -> Result<()> {
        let bundle = saved_bundle()?;
        let data: RestoreData<i64, f32> = RestoreData::load(&bundle, "ev", 0, 1)?;
        assert_eq!(data.keys, vec![0, 1, 2, 3]);
        assert_eq!(data.row(2), &[2.0, 2.5]);
        assert_eq!(data.freq(3), Some(13));
        assert_eq!(data.version(0), None);
        assert_eq!(data.keys_filtered, vec![101]);
        assert_eq!(data.freqs_filtered, vec![1]);
        // versions were not saved for filtered keys either
        assert!(data.versions_filtered.is_empty());
        Ok(())
    }

    #[test]
    fn test_load_splits_partitions_across_shards() -> Result<()> {
        let bundle = saved_bundle()?;
        let even: RestoreData<i64, f32> = RestoreData::load(&bundle, "ev", 0, 2)?;
        let odd: RestoreData<i64, f32> = RestoreData::load(&bundle, "ev", 1, 2)?;
        assert_eq!(even.keys, vec![0, 2]);
        assert_eq!(odd.keys, vec![1, 3]);
        assert_eq!(odd.row(1), &[3.0, 3.5]);
        assert_eq!(odd.freqs, vec![11, 13]);
        assert_eq!(odd.keys_filtered, vec![101]);
        assert!(even.keys_filtered.is_empty());
        Ok(())
    }

    #[test]
    fn test_invalid_partition_args() -> Result<()> {
        let bundle = saved_bundle()?;
        let res: Result<RestoreData<i64, f32>> = RestoreData::load(&bundle, "ev", 2, 2);
        assert!(matches!(res, Err(Error::InvalidArgument(_))));
        let res: Result<RestoreData<i64, f32>> = RestoreData::load(&bundle, "missing", 0, 1);
        assert!(matches!(res, Err(Error::NotFound(_))));
        Ok(())
    }

    #[test]
    fn test_default_needs_no_default_key() {
        // key types are not required to implement Default
        #[derive(Debug, Clone, PartialEq)]
        struct Opaque(i64);

        let data: RestoreData<Opaque, f32> = RestoreData::default();
        assert_eq!(data.value_len, 0);
        assert!(data.keys.is_empty());
        assert!(data.keys_filtered.is_empty());
    }
}
