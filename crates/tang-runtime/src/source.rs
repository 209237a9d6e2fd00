//! Host-side data sources for uploads.

use tang_program::{DType, Literal, Shape};

use crate::error::{Result, RuntimeError};

/// A host buffer bound for a device.
///
/// Bytes are dense, row-major, little-endian, matching `shape`.
pub trait TensorSource: Send + Sync {
    fn shape(&self) -> &Shape;
    fn data(&self) -> &[u8];
    fn device(&self) -> &str;

    fn dtype(&self) -> Option<DType> {
        self.shape().dtype()
    }
}

/// A [`TensorSource`] backed by an array [`Literal`].
#[derive(Clone, Debug)]
pub struct LiteralSource {
    literal: Literal,
    shape: Shape,
    device: String,
}

impl LiteralSource {
    pub fn new(literal: Literal, device: impl Into<String>) -> Result<Self> {
        if literal.is_tuple() {
            return Err(RuntimeError::InvalidSource(format!(
                "tuple literal {} cannot be uploaded as one buffer",
                literal.shape()
            )));
        }
        Ok(Self {
            shape: literal.shape(),
            literal,
            device: device.into(),
        })
    }

    pub fn literal(&self) -> &Literal {
        &self.literal
    }
}

impl TensorSource for LiteralSource {
    fn shape(&self) -> &Shape {
        &self.shape
    }

    fn data(&self) -> &[u8] {
        self.literal.raw_bytes().unwrap_or_default()
    }

    fn device(&self) -> &str {
        &self.device
    }
}
