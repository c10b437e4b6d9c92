//! Checkpoint export and restore
//!
//! A saved embedding variable `name` is nine tensors:
//!
//! ```text
//! name-keys                    [n]            admitted keys
//! name-values                  [n, value_len] one row per admitted key
//! name-versions                [n] or [0]     last update step
//! name-freqs                   [n] or [0]     access frequency
//! name-keys_filtered           [m]            keys rejected by admission
//! name-versions_filtered       [m] or [0]
//! name-freqs_filtered          [m]
//! name-partition_offset        [1001]         cumulative admitted counts
//! name-partition_filter_offset [1001]         cumulative filtered counts
//! ```
//!
//! Tensors are streamed through a fixed buffer, so a table never needs to be
//! materialized in one contiguous allocation.

mod bundle;
mod data;
mod dump;
mod restore;

pub use bundle::{
    data_path, index_path, BundleReader, BundleWriter, CheckpointReader, CheckpointWriter,
    MemoryBundle, Tensor, TensorEntry,
};
pub use data::{
    save_to_checkpoint, saved_partition, CheckpointData, ColumnSpec, ValueRef,
    SAVED_PARTITION_NUM,
};
pub use dump::{
    save_tensor_with_fixed_buffer, DumpIterator, ValueDumpIterator, VecDumpIterator,
    DEFAULT_BYTES_LIMIT,
};
pub use restore::RestoreData;

/// Name of one array of a saved variable
pub fn tensor_name(name: &str, suffix: &str) -> String {
    format!("{}-{}", name, suffix)
}

/// Supplies rows for values that are not resident in the exporting tier
///
/// Rows are consumed in export order, one per [`ValueRef::NotResident`].
pub trait ValueIterator<V> {
    fn next_value(&mut self) -> Option<&[V]>;
}

/// Yields the same row forever
pub struct DefaultValueIterator<'a, V> {
    value: &'a [V],
}

impl<'a, V> DefaultValueIterator<'a, V> {
    pub fn new(value: &'a [V]) -> Self {
        Self { value }
    }
}

impl<V> ValueIterator<V> for DefaultValueIterator<'_, V> {
    fn next_value(&mut self) -> Option<&[V]> {
        Some(self.value)
    }
}
