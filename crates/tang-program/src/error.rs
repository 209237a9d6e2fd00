//! Error types for tang-program.

use std::fmt;

use crate::shape::Shape;

/// Errors raised while validating, decoding or evaluating a program.
#[derive(Clone, Debug, PartialEq)]
pub enum ProgramError {
    /// Program encoded with an unsupported format version.
    VersionMismatch { expected: u32, got: u32 },
    /// An instruction refers to an operand that is not defined before it.
    InvalidOperand { instr: u32, operand: u32 },
    /// `Parameter(n)` with `n` outside the declared parameter list.
    ParameterOutOfRange { index: u32, count: usize },
    /// Operand shapes are incompatible for an instruction.
    ShapeMismatch(String),
    /// Operand element types are incompatible for an instruction.
    TypeMismatch(String),
    /// Wrong number of arguments passed to `evaluate`.
    ArgumentCount { expected: usize, got: usize },
    /// An argument does not match its declared parameter shape.
    ArgumentShape { index: usize, expected: Shape, got: Shape },
    /// Raw byte buffer does not match the shape's byte size.
    BufferSize { expected: usize, got: usize },
    /// Serialization/deserialization error.
    Serde(String),
}

impl fmt::Display for ProgramError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VersionMismatch { expected, got } => {
                write!(f, "program version mismatch: expected {expected}, got {got}")
            }
            Self::InvalidOperand { instr, operand } => {
                write!(f, "instruction {instr} references undefined operand {operand}")
            }
            Self::ParameterOutOfRange { index, count } => {
                write!(f, "parameter {index} out of range ({count} declared)")
            }
            Self::ShapeMismatch(msg) => write!(f, "shape mismatch: {msg}"),
            Self::TypeMismatch(msg) => write!(f, "type mismatch: {msg}"),
            Self::ArgumentCount { expected, got } => {
                write!(f, "expected {expected} arguments, got {got}")
            }
            Self::ArgumentShape { index, expected, got } => {
                write!(f, "argument {index}: expected {expected}, got {got}")
            }
            Self::BufferSize { expected, got } => {
                write!(f, "buffer holds {got} bytes, shape requires {expected}")
            }
            Self::Serde(msg) => write!(f, "serialization error: {msg}"),
        }
    }
}

impl std::error::Error for ProgramError {}

impl From<postcard::Error> for ProgramError {
    fn from(e: postcard::Error) -> Self {
        Self::Serde(e.to_string())
    }
}
