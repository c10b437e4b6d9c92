//! Numeric types stored in embedding tables
//!
//! Keys and values are generic over a small closed set of primitive types.
//! Every type that ends up in a checkpoint implements [`Scalar`], which knows
//! its on-disk tag and how to encode itself little-endian.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;

/// Element type tag recorded with every checkpoint tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    I32,
    I64,
    U32,
    U64,
    F32,
    F64,
}

impl DataType {
    /// Size of one element in bytes
    pub fn size(self) -> usize {
        match self {
            DataType::I32 | DataType::U32 | DataType::F32 => 4,
            DataType::I64 | DataType::U64 | DataType::F64 => 8,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::I32 => "i32",
            DataType::I64 => "i64",
            DataType::U32 => "u32",
            DataType::U64 => "u64",
            DataType::F32 => "f32",
            DataType::F64 => "f64",
        };
        f.write_str(name)
    }
}

/// A fixed-width primitive that can be dumped into a checkpoint
pub trait Scalar: Copy + Send + Sync + 'static {
    const DTYPE: DataType;

    /// Append the little-endian encoding of `self`
    fn put_le<B: BufMut>(self, buf: &mut B);

    /// Decode one value, advancing `buf`
    fn get_le<B: Buf>(buf: &mut B) -> Self;
}

macro_rules! impl_scalar {
    ($ty:ty, $tag:ident, $put:ident, $get:ident) => {
        impl Scalar for $ty {
            const DTYPE: DataType = DataType::$tag;

            #[inline]
            fn put_le<B: BufMut>(self, buf: &mut B) {
                buf.$put(self)
            }

            #[inline]
            fn get_le<B: Buf>(buf: &mut B) -> Self {
                buf.$get()
            }
        }
    };
}

impl_scalar!(i32, I32, put_i32_le, get_i32_le);
impl_scalar!(i64, I64, put_i64_le, get_i64_le);
impl_scalar!(u32, U32, put_u32_le, get_u32_le);
impl_scalar!(u64, U64, put_u64_le, get_u64_le);
impl_scalar!(f32, F32, put_f32_le, get_f32_le);
impl_scalar!(f64, F64, put_f64_le, get_f64_le);

/// Feature id type
pub trait Key: Scalar + Eq + Ord + Hash + fmt::Debug {
    /// Widen to i64 (used for partitioning and default-value selection)
    fn as_i64(self) -> i64;

    /// Narrow from i64 (used on restore)
    fn from_i64(v: i64) -> Self;
}

impl Key for i32 {
    fn as_i64(self) -> i64 {
        self as i64
    }
    fn from_i64(v: i64) -> Self {
        v as i32
    }
}

impl Key for i64 {
    fn as_i64(self) -> i64 {
        self
    }
    fn from_i64(v: i64) -> Self {
        v
    }
}

impl Key for u32 {
    fn as_i64(self) -> i64 {
        self as i64
    }
    fn from_i64(v: i64) -> Self {
        v as u32
    }
}

impl Key for u64 {
    fn as_i64(self) -> i64 {
        self as i64
    }
    fn from_i64(v: i64) -> Self {
        v as u64
    }
}

/// Embedding value element type
pub trait Element: Scalar + Default + PartialEq + PartialOrd + fmt::Debug {
    fn to_f64(self) -> f64;
    fn from_f64(v: f64) -> Self;
}

impl Element for f32 {
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as f32
    }
}

impl Element for f64 {
    fn to_f64(self) -> f64 {
        self
    }
    fn from_f64(v: f64) -> Self {
        v
    }
}
