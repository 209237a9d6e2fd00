//! Array and tuple shape descriptors.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dtype::DType;

/// Logical shape of a value: a dense array or a tuple of shapes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Shape {
    Array { dtype: DType, dims: Vec<usize> },
    Tuple(Vec<Shape>),
}

impl Shape {
    pub fn array(dtype: DType, dims: &[usize]) -> Self {
        Self::Array { dtype, dims: dims.to_vec() }
    }

    pub fn scalar(dtype: DType) -> Self {
        Self::Array { dtype, dims: Vec::new() }
    }

    pub fn tuple(elements: Vec<Shape>) -> Self {
        Self::Tuple(elements)
    }

    pub fn is_tuple(&self) -> bool {
        matches!(self, Self::Tuple(_))
    }

    /// Element type, `None` for tuples.
    pub fn dtype(&self) -> Option<DType> {
        match self {
            Self::Array { dtype, .. } => Some(*dtype),
            Self::Tuple(_) => None,
        }
    }

    /// Dimensions of an array shape (empty for scalars and tuples).
    pub fn dims(&self) -> &[usize] {
        match self {
            Self::Array { dims, .. } => dims,
            Self::Tuple(_) => &[],
        }
    }

    pub fn ndim(&self) -> usize {
        self.dims().len()
    }

    /// Tuple elements (empty for arrays).
    pub fn tuple_elements(&self) -> &[Shape] {
        match self {
            Self::Array { .. } => &[],
            Self::Tuple(elements) => elements,
        }
    }

    /// Number of array elements. Zero-sized dimensions give zero; scalars give one.
    pub fn element_count(&self) -> usize {
        match self {
            Self::Array { dims, .. } => dims.iter().product(),
            Self::Tuple(elements) => elements.iter().map(Shape::element_count).sum(),
        }
    }

    /// Dense byte size, summed over tuple elements.
    pub fn byte_size(&self) -> usize {
        match self {
            Self::Array { dtype, dims } => dims.iter().product::<usize>() * dtype.size_bytes(),
            Self::Tuple(elements) => elements.iter().map(Shape::byte_size).sum(),
        }
    }

    /// Contiguous row-major strides, in elements.
    pub fn contiguous_strides(&self) -> Vec<usize> {
        let dims = self.dims();
        let n = dims.len();
        if n == 0 {
            return Vec::new();
        }
        let mut strides = vec![0usize; n];
        strides[n - 1] = 1;
        for i in (0..n - 1).rev() {
            strides[i] = strides[i + 1] * dims[i + 1];
        }
        strides
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Array { dtype, dims } => {
                write!(f, "{dtype}[")?;
                for (i, d) in dims.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{d}")?;
                }
                f.write_str("]")
            }
            Self::Tuple(elements) => {
                f.write_str("(")?;
                for (i, e) in elements.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{e}")?;
                }
                f.write_str(")")
            }
        }
    }
}
