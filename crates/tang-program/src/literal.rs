//! Host-resident tensor values.
//!
//! A `Literal` stores array data as raw little-endian bytes so it can carry
//! every `DType` through transfers and serialization without a type parameter.
//! Typed access goes through `NativeType`.

use serde::{Deserialize, Serialize};

use crate::dtype::{DType, NativeType};
use crate::error::ProgramError;
use crate::shape::Shape;

/// A dense array or tuple value held in host memory.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Literal {
    Array {
        dtype: DType,
        dims: Vec<usize>,
        bytes: Vec<u8>,
    },
    Tuple(Vec<Literal>),
}

impl Literal {
    /// Build an array literal from typed values.
    ///
    /// Panics if `values.len()` does not match the product of `dims`.
    pub fn from_slice<T: NativeType>(dims: &[usize], values: &[T]) -> Self {
        let numel: usize = dims.iter().product();
        assert_eq!(values.len(), numel, "data length {} != shape product {}", values.len(), numel);
        let mut bytes = Vec::with_capacity(numel * T::DTYPE.size_bytes());
        for &v in values {
            v.write_le(&mut bytes);
        }
        Self::Array { dtype: T::DTYPE, dims: dims.to_vec(), bytes }
    }

    /// Rank-0 array.
    pub fn scalar<T: NativeType>(value: T) -> Self {
        Self::from_slice(&[], &[value])
    }

    pub fn tuple(elements: Vec<Literal>) -> Self {
        Self::Tuple(elements)
    }

    /// Wrap raw bytes as an array of `shape`, checking the byte count.
    pub fn from_raw(shape: &Shape, bytes: Vec<u8>) -> Result<Self, ProgramError> {
        match shape {
            Shape::Array { dtype, dims } => {
                let expected = shape.byte_size();
                if bytes.len() != expected {
                    return Err(ProgramError::BufferSize { expected, got: bytes.len() });
                }
                Ok(Self::Array { dtype: *dtype, dims: dims.clone(), bytes })
            }
            Shape::Tuple(_) => Err(ProgramError::ShapeMismatch(format!(
                "cannot build a tuple literal from raw bytes ({shape})"
            ))),
        }
    }

    /// Zero-filled value of any shape.
    pub fn zeros(shape: &Shape) -> Self {
        match shape {
            Shape::Array { dtype, dims } => Self::Array {
                dtype: *dtype,
                dims: dims.clone(),
                bytes: vec![0u8; shape.byte_size()],
            },
            Shape::Tuple(elements) => Self::Tuple(elements.iter().map(Self::zeros).collect()),
        }
    }

    pub fn shape(&self) -> Shape {
        match self {
            Self::Array { dtype, dims, .. } => Shape::Array { dtype: *dtype, dims: dims.clone() },
            Self::Tuple(elements) => Shape::Tuple(elements.iter().map(Literal::shape).collect()),
        }
    }

    pub fn is_tuple(&self) -> bool {
        matches!(self, Self::Tuple(_))
    }

    /// Raw bytes of an array literal.
    pub fn raw_bytes(&self) -> Result<&[u8], ProgramError> {
        match self {
            Self::Array { bytes, .. } => Ok(bytes),
            Self::Tuple(_) => Err(ProgramError::ShapeMismatch(
                "tuple literal has no contiguous byte buffer".into(),
            )),
        }
    }

    /// Total payload size in bytes, summed over tuple elements.
    pub fn byte_size(&self) -> usize {
        match self {
            Self::Array { bytes, .. } => bytes.len(),
            Self::Tuple(elements) => elements.iter().map(Literal::byte_size).sum(),
        }
    }

    /// Decode array contents into typed values.
    pub fn to_vec<T: NativeType>(&self) -> Result<Vec<T>, ProgramError> {
        match self {
            Self::Array { dtype, bytes, .. } => {
                if *dtype != T::DTYPE {
                    return Err(ProgramError::TypeMismatch(format!(
                        "literal is {dtype}, requested {}",
                        T::DTYPE
                    )));
                }
                Ok(bytes
                    .chunks_exact(dtype.size_bytes())
                    .map(T::read_le)
                    .collect())
            }
            Self::Tuple(_) => Err(ProgramError::TypeMismatch(
                "cannot read a tuple literal as an array".into(),
            )),
        }
    }

    /// Split a tuple into its elements. Arrays come back as a single element.
    pub fn decompose_tuple(self) -> Vec<Literal> {
        match self {
            Self::Tuple(elements) => elements,
            array => vec![array],
        }
    }

    /// Same bytes, new dimensions.
    pub fn reshape(self, new_dims: &[usize]) -> Result<Self, ProgramError> {
        match self {
            Self::Array { dtype, dims, bytes } => {
                let old: usize = dims.iter().product();
                let new: usize = new_dims.iter().product();
                if old != new {
                    return Err(ProgramError::ShapeMismatch(format!(
                        "reshape {dims:?} -> {new_dims:?} changes element count"
                    )));
                }
                Ok(Self::Array { dtype, dims: new_dims.to_vec(), bytes })
            }
            Self::Tuple(_) => Err(ProgramError::ShapeMismatch("cannot reshape a tuple".into())),
        }
    }
}
