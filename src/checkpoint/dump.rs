//! Streaming tensors through a fixed-size buffer

use super::bundle::CheckpointWriter;
use super::data::ValueRef;
use super::ValueIterator;
use crate::error::{Error, Result};
use crate::types::{DataType, Element, Scalar};
use bytes::BytesMut;
use std::slice;

/// Size of the reusable export buffer
pub const DEFAULT_BYTES_LIMIT: usize = 8 << 20;

/// Source of tensor bytes, produced one record at a time
pub trait DumpIterator {
    fn dtype(&self) -> DataType;

    /// Bytes appended by every successful `write_next`
    fn record_size(&self) -> usize;

    /// Append the next record to `buf`; `false` once exhausted
    fn write_next(&mut self, buf: &mut BytesMut) -> Result<bool>;
}

/// Dumps a flat slice of scalars
pub struct VecDumpIterator<'a, T> {
    items: slice::Iter<'a, T>,
}

impl<'a, T: Scalar> VecDumpIterator<'a, T> {
    pub fn new(items: &'a [T]) -> Self {
        Self { items: items.iter() }
    }
}

impl<T: Scalar> DumpIterator for VecDumpIterator<'_, T> {
    fn dtype(&self) -> DataType {
        T::DTYPE
    }

    fn record_size(&self) -> usize {
        T::DTYPE.size()
    }

    fn write_next(&mut self, buf: &mut BytesMut) -> Result<bool> {
        match self.items.next() {
            Some(&v) => {
                v.put_le(buf);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Dumps one `value_len` row per key
///
/// Rows that are not resident in the exporting tier are pulled, in order,
/// from the supplied [`ValueIterator`].
pub struct ValueDumpIterator<'a, 'i, V> {
    values: slice::Iter<'a, ValueRef<'a, V>>,
    value_len: usize,
    value_iter: Option<&'i mut dyn ValueIterator<V>>,
}

impl<'a, 'i, V: Element> ValueDumpIterator<'a, 'i, V> {
    pub fn new(
        values: &'a [ValueRef<'a, V>],
        value_len: usize,
        value_iter: Option<&'i mut dyn ValueIterator<V>>,
    ) -> Self {
        Self {
            values: values.iter(),
            value_len,
            value_iter,
        }
    }

    fn put_row(&self, row: &[V], buf: &mut BytesMut) -> Result<()> {
        if row.len() < self.value_len {
            return Err(Error::Checkpoint(format!(
                "row has {} elements, expected {}",
                row.len(),
                self.value_len
            )));
        }
        for &v in &row[..self.value_len] {
            v.put_le(buf);
        }
        Ok(())
    }
}

impl<V: Element> DumpIterator for ValueDumpIterator<'_, '_, V> {
    fn dtype(&self) -> DataType {
        V::DTYPE
    }

    fn record_size(&self) -> usize {
        self.value_len * V::DTYPE.size()
    }

    fn write_next(&mut self, buf: &mut BytesMut) -> Result<bool> {
        let Some(value) = self.values.next() else {
            return Ok(false);
        };
        match *value {
            ValueRef::Stored(row) | ValueRef::Default(row) => self.put_row(row, buf)?,
            ValueRef::NotResident => {
                let iter = self.value_iter.as_mut().ok_or_else(|| {
                    Error::Checkpoint("non-resident value without a value iterator".into())
                })?;
                let row = iter.next_value().ok_or_else(|| {
                    Error::Checkpoint("value iterator exhausted".into())
                })?;
                if row.len() < self.value_len {
                    return Err(Error::Checkpoint(format!(
                        "row has {} elements, expected {}",
                        row.len(),
                        self.value_len
                    )));
                }
                for &v in &row[..self.value_len] {
                    v.put_le(buf);
                }
            }
        }
        Ok(true)
    }
}

/// Write one tensor, flushing `iter` through a buffer of `bytes_limit` bytes
pub fn save_tensor_with_fixed_buffer(
    name: &str,
    writer: &mut dyn CheckpointWriter,
    buf: &mut BytesMut,
    bytes_limit: usize,
    iter: &mut dyn DumpIterator,
    shape: &[usize],
) -> Result<()> {
    let record = iter.record_size();
    if record > bytes_limit {
        return Err(Error::Checkpoint(format!(
            "{}: record of {} bytes exceeds buffer limit {}",
            name, record, bytes_limit
        )));
    }

    writer.begin_tensor(name, iter.dtype(), shape)?;
    buf.clear();
    loop {
        if buf.len() + record > bytes_limit {
            writer.append(buf)?;
            buf.clear();
        }
        if !iter.write_next(buf)? {
            break;
        }
    }
    if !buf.is_empty() {
        writer.append(buf)?;
        buf.clear();
    }
    writer.end_tensor()
}
