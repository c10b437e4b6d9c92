//! Checkpoint bundle writer and reader
//!
//! A bundle is two files sharing a prefix:
//!
//! ```text
//! <prefix>.data   tensor payloads appended back to back
//! <prefix>.index  [4-byte length][json index][4-byte checksum]
//! ```
//!
//! The index maps tensor names to dtype, shape, byte range and an XOR
//! checksum of the payload. It is written once, by [`BundleWriter::finish`];
//! a bundle without an index is incomplete and cannot be opened.

use crate::error::{Error, Result};
use crate::types::{DataType, Scalar};
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Streaming tensor sink
///
/// Tensors are written one at a time: `begin_tensor`, any number of
/// `append` calls, then `end_tensor`. The sink is append-only; a failed
/// tensor is not retracted.
pub trait CheckpointWriter {
    fn begin_tensor(&mut self, name: &str, dtype: DataType, shape: &[usize]) -> Result<()>;
    fn append(&mut self, bytes: &[u8]) -> Result<()>;
    fn end_tensor(&mut self) -> Result<()>;
}

/// Tensor source
pub trait CheckpointReader {
    fn contains(&self, name: &str) -> bool;
    fn read_tensor(&self, name: &str) -> Result<Tensor>;
}

/// A tensor read back from a checkpoint
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub dtype: DataType,
    pub shape: Vec<usize>,
    pub data: Bytes,
}

impl Tensor {
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Decode the payload as a flat vector of `T`
    pub fn to_vec<T: Scalar>(&self) -> Result<Vec<T>> {
        if T::DTYPE != self.dtype {
            return Err(Error::Checkpoint(format!(
                "dtype mismatch: tensor is {}, requested {}",
                self.dtype,
                T::DTYPE
            )));
        }
        let n = self.num_elements();
        if self.data.len() != n * self.dtype.size() {
            return Err(Error::Checkpoint(format!(
                "payload is {} bytes, shape {:?} needs {}",
                self.data.len(),
                self.shape,
                n * self.dtype.size()
            )));
        }
        let mut buf = self.data.clone();
        Ok((0..n).map(|_| T::get_le(&mut buf)).collect())
    }
}

/// Index entry of one tensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorEntry {
    pub dtype: DataType,
    pub shape: Vec<usize>,
    pub offset: u64,
    pub len: u64,
    pub checksum: u32,
}

impl TensorEntry {
    fn expected_len(&self) -> u64 {
        (self.shape.iter().product::<usize>() * self.dtype.size()) as u64
    }
}

/// XOR all bytes into a running checksum
fn xor_checksum(acc: u32, bytes: &[u8]) -> u32 {
    bytes.iter().fold(acc, |acc, &b| acc ^ (b as u32))
}

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut s = OsString::from(prefix.as_os_str());
    s.push(suffix);
    PathBuf::from(s)
}

pub fn data_path(prefix: &Path) -> PathBuf {
    with_suffix(prefix, ".data")
}

pub fn index_path(prefix: &Path) -> PathBuf {
    with_suffix(prefix, ".index")
}

/// Tensor being streamed
struct Pending {
    name: String,
    entry: TensorEntry,
}

fn begin(pending: &mut Option<Pending>, name: &str, entry: TensorEntry) -> Result<()> {
    if let Some(p) = pending {
        return Err(Error::Checkpoint(format!(
            "cannot begin {} while {} is open",
            name, p.name
        )));
    }
    *pending = Some(Pending {
        name: name.to_string(),
        entry,
    });
    Ok(())
}

fn finish_pending(pending: &mut Option<Pending>) -> Result<(String, TensorEntry)> {
    let p = pending
        .take()
        .ok_or_else(|| Error::Checkpoint("end_tensor without begin_tensor".into()))?;
    if p.entry.len != p.entry.expected_len() {
        return Err(Error::Checkpoint(format!(
            "{}: wrote {} bytes, shape {:?} of {} needs {}",
            p.name,
            p.entry.len,
            p.entry.shape,
            p.entry.dtype,
            p.entry.expected_len()
        )));
    }
    Ok((p.name, p.entry))
}

/// File-backed bundle writer
pub struct BundleWriter {
    prefix: PathBuf,
    data: BufWriter<File>,
    offset: u64,
    index: BTreeMap<String, TensorEntry>,
    pending: Option<Pending>,
}

impl BundleWriter {
    /// Create `<prefix>.data`, truncating any previous bundle
    pub fn create<P: AsRef<Path>>(prefix: P) -> Result<Self> {
        let prefix = prefix.as_ref().to_path_buf();
        if let Some(parent) = prefix.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let data = BufWriter::new(File::create(data_path(&prefix))?);
        Ok(Self {
            prefix,
            data,
            offset: 0,
            index: BTreeMap::new(),
            pending: None,
        })
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    /// Flush the payload and write the index
    pub fn finish(mut self) -> Result<()> {
        if let Some(p) = &self.pending {
            return Err(Error::Checkpoint(format!("tensor {} left open", p.name)));
        }
        self.data.flush()?;

        let json = serde_json::to_vec(&self.index)
            .map_err(|e| Error::SerializationError(format!("Failed to serialize index: {}", e)))?;
        let mut out = Vec::with_capacity(json.len() + 8);
        out.extend_from_slice(&(json.len() as u32).to_le_bytes());
        out.extend_from_slice(&json);
        out.extend_from_slice(&xor_checksum(0, &json).to_le_bytes());
        std::fs::write(index_path(&self.prefix), out)?;

        info!(
            prefix = %self.prefix.display(),
            tensors = self.index.len(),
            bytes = self.offset,
            "Checkpoint bundle written"
        );
        Ok(())
    }
}

impl CheckpointWriter for BundleWriter {
    fn begin_tensor(&mut self, name: &str, dtype: DataType, shape: &[usize]) -> Result<()> {
        if self.index.contains_key(name) {
            return Err(Error::AlreadyExists(format!("tensor {}", name)));
        }
        let entry = TensorEntry {
            dtype,
            shape: shape.to_vec(),
            offset: self.offset,
            len: 0,
            checksum: 0,
        };
        begin(&mut self.pending, name, entry)
    }

    fn append(&mut self, bytes: &[u8]) -> Result<()> {
        let p = self
            .pending
            .as_mut()
            .ok_or_else(|| Error::Checkpoint("append without begin_tensor".into()))?;
        self.data.write_all(bytes)?;
        p.entry.len += bytes.len() as u64;
        p.entry.checksum = xor_checksum(p.entry.checksum, bytes);
        self.offset += bytes.len() as u64;
        Ok(())
    }

    fn end_tensor(&mut self) -> Result<()> {
        let (name, entry) = finish_pending(&mut self.pending)?;
        debug!(tensor = %name, bytes = entry.len, "Tensor written");
        self.index.insert(name, entry);
        Ok(())
    }
}

/// Reader over a finished bundle
///
/// The payload file is loaded once; tensors are zero-copy slices of it.
pub struct BundleReader {
    data: Bytes,
    index: BTreeMap<String, TensorEntry>,
}

impl BundleReader {
    pub fn open<P: AsRef<Path>>(prefix: P) -> Result<Self> {
        let prefix = prefix.as_ref();
        let raw = std::fs::read(index_path(prefix))?;
        if raw.len() < 8 {
            return Err(Error::Checkpoint("index too short".into()));
        }
        let len = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
        if raw.len() < len + 8 {
            return Err(Error::Checkpoint(format!(
                "incomplete index: expected {} bytes, got {}",
                len + 8,
                raw.len()
            )));
        }
        let json = &raw[4..4 + len];
        let stored = u32::from_le_bytes([raw[4 + len], raw[5 + len], raw[6 + len], raw[7 + len]]);
        if stored != xor_checksum(0, json) {
            return Err(Error::Checkpoint("index checksum mismatch".into()));
        }
        let index: BTreeMap<String, TensorEntry> = serde_json::from_slice(json)
            .map_err(|e| Error::SerializationError(format!("Failed to parse index: {}", e)))?;

        let data = Bytes::from(std::fs::read(data_path(prefix))?);
        debug!(prefix = %prefix.display(), tensors = index.len(), "Opened checkpoint bundle");
        Ok(Self { data, index })
    }

    pub fn tensor_names(&self) -> impl Iterator<Item = &str> {
        self.index.keys().map(String::as_str)
    }

    pub fn entry(&self, name: &str) -> Option<&TensorEntry> {
        self.index.get(name)
    }
}

impl CheckpointReader for BundleReader {
    fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    fn read_tensor(&self, name: &str) -> Result<Tensor> {
        let entry = self
            .index
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("tensor {}", name)))?;
        let start = entry.offset as usize;
        let end = start + entry.len as usize;
        if end > self.data.len() {
            return Err(Error::Checkpoint(format!("{}: payload truncated", name)));
        }
        let data = self.data.slice(start..end);
        if xor_checksum(0, &data) != entry.checksum {
            return Err(Error::Checkpoint(format!("{}: checksum mismatch", name)));
        }
        Ok(Tensor {
            dtype: entry.dtype,
            shape: entry.shape.clone(),
            data,
        })
    }
}

/// In-memory bundle; both a writer and a reader
#[derive(Default)]
pub struct MemoryBundle {
    tensors: BTreeMap<String, Tensor>,
    pending: Option<Pending>,
    buf: BytesMut,
}

impl MemoryBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn tensor_names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }
}

impl CheckpointWriter for MemoryBundle {
    fn begin_tensor(&mut self, name: &str, dtype: DataType, shape: &[usize]) -> Result<()> {
        if self.tensors.contains_key(name) {
            return Err(Error::AlreadyExists(format!("tensor {}", name)));
        }
        let entry = TensorEntry {
            dtype,
            shape: shape.to_vec(),
            offset: 0,
            len: 0,
            checksum: 0,
        };
        begin(&mut self.pending, name, entry)?;
        self.buf.clear();
        Ok(())
    }

    fn append(&mut self, bytes: &[u8]) -> Result<()> {
        let p = self
            .pending
            .as_mut()
            .ok_or_else(|| Error::Checkpoint("append without begin_tensor".into()))?;
        self.buf.extend_from_slice(bytes);
        p.entry.len += bytes.len() as u64;
        Ok(())
    }

    fn end_tensor(&mut self) -> Result<()> {
        let (name, entry) = finish_pending(&mut self.pending)?;
        let tensor = Tensor {
            dtype: entry.dtype,
            shape: entry.shape,
            data: self.buf.split().freeze(),
        };
        self.tensors.insert(name, tensor);
        Ok(())
    }
}

impl CheckpointReader for MemoryBundle {
    fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    fn read_tensor(&self, name: &str) -> Result<Tensor> {
        self.tensors
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("tensor {}", name)))
    }
}
