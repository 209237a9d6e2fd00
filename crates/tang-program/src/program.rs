//! Program arena and builder.
//!
//! Instructions live in a flat vector in topological order: every operand
//! index is smaller than the index of the instruction using it. The builder
//! interns identical instructions, so repeated subexpressions share one slot.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ProgramError;
use crate::literal::Literal;
use crate::shape::Shape;

/// Program format version. Incremented on breaking encoding changes.
pub const PROGRAM_VERSION: u32 = 1;

/// Handle to an instruction inside a `Program`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstrId(pub(crate) u32);

impl InstrId {
    #[inline]
    pub fn from_index(index: u32) -> Self {
        Self(index)
    }

    #[inline]
    pub fn index(&self) -> u32 {
        self.0
    }
}

impl fmt::Debug for InstrId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

impl fmt::Display for InstrId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// One tensor instruction.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Instr {
    /// The n-th program parameter.
    Parameter(u32),
    /// An embedded constant value.
    Constant(Literal),
    Add(InstrId, InstrId),
    Sub(InstrId, InstrId),
    Mul(InstrId, InstrId),
    Max(InstrId, InstrId),
    Neg(InstrId),
    /// Pack operands into a tuple.
    Tuple(Vec<InstrId>),
    /// Extract element `n` of a tuple.
    GetTupleElement(InstrId, u32),
    /// Reinterpret an array with new dimensions (same element count).
    Reshape(InstrId, Vec<usize>),
    /// Broadcast a scalar to the given dimensions.
    Broadcast(InstrId, Vec<usize>),
}

impl Instr {
    /// Direct operand indices.
    pub fn operands(&self) -> Vec<InstrId> {
        match self {
            Self::Parameter(_) | Self::Constant(_) => vec![],
            Self::Add(a, b) | Self::Sub(a, b) | Self::Mul(a, b) | Self::Max(a, b) => vec![*a, *b],
            Self::Neg(a)
            | Self::GetTupleElement(a, _)
            | Self::Reshape(a, _)
            | Self::Broadcast(a, _) => vec![*a],
            Self::Tuple(elements) => elements.clone(),
        }
    }
}

/// A declared program parameter.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub shape: Shape,
}

/// A complete, serializable tensor program.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    /// Format version for forward compatibility.
    pub version: u32,
    /// Declared parameters, indexed by `Instr::Parameter(n)`.
    pub parameters: Vec<Parameter>,
    /// All instructions in topological order.
    pub instrs: Vec<Instr>,
    /// Instruction whose value is the program result.
    pub root: InstrId,
}

impl Program {
    /// Serialize to postcard bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProgramError> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Deserialize from postcard bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProgramError> {
        Ok(postcard::from_bytes(bytes)?)
    }

    pub fn parameter_count(&self) -> usize {
        self.parameters.len()
    }

    pub fn parameter_names(&self) -> Vec<String> {
        self.parameters.iter().map(|p| p.name.clone()).collect()
    }
}

/// Incremental program construction with structural interning.
pub struct ProgramBuilder {
    parameters: Vec<Parameter>,
    instrs: Vec<Instr>,
    intern: HashMap<Instr, InstrId>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self {
            parameters: Vec::new(),
            instrs: Vec::new(),
            intern: HashMap::new(),
        }
    }

    fn insert(&mut self, instr: Instr) -> InstrId {
        if let Some(&id) = self.intern.get(&instr) {
            return id;
        }
        let id = InstrId(self.instrs.len() as u32);
        self.instrs.push(instr.clone());
        self.intern.insert(instr, id);
        id
    }

    /// Declare the next parameter.
    pub fn parameter(&mut self, shape: Shape, name: impl Into<String>) -> InstrId {
        let index = self.parameters.len() as u32;
        self.parameters.push(Parameter { name: name.into(), shape });
        self.insert(Instr::Parameter(index))
    }

    pub fn constant(&mut self, value: Literal) -> InstrId {
        self.insert(Instr::Constant(value))
    }

    pub fn add(&mut self, a: InstrId, b: InstrId) -> InstrId {
        self.insert(Instr::Add(a, b))
    }

    pub fn sub(&mut self, a: InstrId, b: InstrId) -> InstrId {
        self.insert(Instr::Sub(a, b))
    }

    pub fn mul(&mut self, a: InstrId, b: InstrId) -> InstrId {
        self.insert(Instr::Mul(a, b))
    }

    pub fn max(&mut self, a: InstrId, b: InstrId) -> InstrId {
        self.insert(Instr::Max(a, b))
    }

    pub fn neg(&mut self, a: InstrId) -> InstrId {
        self.insert(Instr::Neg(a))
    }

    pub fn tuple(&mut self, elements: &[InstrId]) -> InstrId {
        self.insert(Instr::Tuple(elements.to_vec()))
    }

    pub fn get_tuple_element(&mut self, tuple: InstrId, index: u32) -> InstrId {
        self.insert(Instr::GetTupleElement(tuple, index))
    }

    pub fn reshape(&mut self, a: InstrId, dims: &[usize]) -> InstrId {
        self.insert(Instr::Reshape(a, dims.to_vec()))
    }

    pub fn broadcast(&mut self, scalar: InstrId, dims: &[usize]) -> InstrId {
        self.insert(Instr::Broadcast(scalar, dims.to_vec()))
    }

    /// Finish the program with `root` as its result.
    pub fn build(self, root: InstrId) -> Program {
        Program {
            version: PROGRAM_VERSION,
            parameters: self.parameters,
            instrs: self.instrs,
            root,
        }
    }
}

impl Default for ProgramBuilder {
    fn default() -> Self {
        Self::new()
    }
}
