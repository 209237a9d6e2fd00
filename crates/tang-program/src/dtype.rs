//! Element types and their little-endian byte encodings.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Element type of an array value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// Boolean, stored as one byte (0 or 1).
    Pred,
    U8,
    I32,
    I64,
    F32,
    F64,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_bytes(self) -> usize {
        match self {
            Self::Pred | Self::U8 => 1,
            Self::I32 | Self::F32 => 4,
            Self::I64 | Self::F64 => 8,
        }
    }

    /// Whether element-wise arithmetic is defined for this type.
    pub fn is_arithmetic(self) -> bool {
        matches!(self, Self::I32 | Self::I64 | Self::F32 | Self::F64)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pred => "pred",
            Self::U8 => "u8",
            Self::I32 => "s32",
            Self::I64 => "s64",
            Self::F32 => "f32",
            Self::F64 => "f64",
        };
        f.write_str(name)
    }
}

/// A Rust type that maps one-to-one onto a `DType`.
pub trait NativeType: Copy + Send + Sync + 'static {
    const DTYPE: DType;

    /// Append the little-endian encoding of `self`.
    fn write_le(self, out: &mut Vec<u8>);

    /// Decode from exactly `DTYPE.size_bytes()` bytes.
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! native_type {
    ($ty:ty, $dtype:expr) => {
        impl NativeType for $ty {
            const DTYPE: DType = $dtype;

            #[inline]
            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            #[inline]
            fn read_le(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(bytes);
                <$ty>::from_le_bytes(raw)
            }
        }
    };
}

native_type!(u8, DType::U8);
native_type!(i32, DType::I32);
native_type!(i64, DType::I64);
native_type!(f32, DType::F32);
native_type!(f64, DType::F64);

impl NativeType for bool {
    const DTYPE: DType = DType::Pred;

    #[inline]
    fn write_le(self, out: &mut Vec<u8>) {
        out.push(self as u8);
    }

    #[inline]
    fn read_le(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}
