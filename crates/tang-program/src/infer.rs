//! Shape inference and structural validation.

use serde::{Deserialize, Serialize};

use crate::error::ProgramError;
use crate::program::{Instr, InstrId, Program, PROGRAM_VERSION};
use crate::shape::Shape;

/// Parameter and result shapes of a program.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProgramShape {
    pub parameters: Vec<Shape>,
    pub parameter_names: Vec<String>,
    pub result: Shape,
}

impl ProgramShape {
    pub fn parameters_size(&self) -> usize {
        self.parameters.len()
    }
}

impl Program {
    /// Validate the program and infer its signature.
    pub fn program_shape(&self) -> Result<ProgramShape, ProgramError> {
        let shapes = self.infer_shapes()?;
        let root = self.root.index() as usize;
        let result = shapes
            .get(root)
            .cloned()
            .ok_or(ProgramError::InvalidOperand { instr: root as u32, operand: root as u32 })?;
        Ok(ProgramShape {
            parameters: self.parameters.iter().map(|p| p.shape.clone()).collect(),
            parameter_names: self.parameter_names(),
            result,
        })
    }

    /// Shape of every instruction, in index order.
    pub(crate) fn infer_shapes(&self) -> Result<Vec<Shape>, ProgramError> {
        if self.version != PROGRAM_VERSION {
            return Err(ProgramError::VersionMismatch {
                expected: PROGRAM_VERSION,
                got: self.version,
            });
        }

        let mut shapes: Vec<Shape> = Vec::with_capacity(self.instrs.len());
        for (i, instr) in self.instrs.iter().enumerate() {
            for op in instr.operands() {
                if op.index() as usize >= i {
                    return Err(ProgramError::InvalidOperand { instr: i as u32, operand: op.index() });
                }
            }
            let shape = match instr {
                Instr::Parameter(n) => self
                    .parameters
                    .get(*n as usize)
                    .map(|p| p.shape.clone())
                    .ok_or(ProgramError::ParameterOutOfRange {
                        index: *n,
                        count: self.parameters.len(),
                    })?,
                Instr::Constant(value) => value.shape(),
                Instr::Add(a, b) | Instr::Sub(a, b) | Instr::Mul(a, b) | Instr::Max(a, b) => {
                    elementwise(i, at(&shapes, *a), at(&shapes, *b))?
                }
                Instr::Neg(a) => {
                    let s = at(&shapes, *a);
                    arithmetic_array(i, s)?;
                    s.clone()
                }
                Instr::Tuple(elements) => {
                    Shape::Tuple(elements.iter().map(|e| at(&shapes, *e).clone()).collect())
                }
                Instr::GetTupleElement(t, n) => {
                    let s = at(&shapes, *t);
                    if !s.is_tuple() {
                        return Err(ProgramError::ShapeMismatch(format!(
                            "instruction {i}: get-tuple-element on non-tuple {s}"
                        )));
                    }
                    s.tuple_elements().get(*n as usize).cloned().ok_or_else(|| {
                        ProgramError::ShapeMismatch(format!(
                            "instruction {i}: tuple index {n} out of range for {s}"
                        ))
                    })?
                }
                Instr::Reshape(a, dims) => {
                    let s = at(&shapes, *a);
                    let dtype = s.dtype().ok_or_else(|| {
                        ProgramError::ShapeMismatch(format!("instruction {i}: cannot reshape tuple"))
                    })?;
                    let new: usize = dims.iter().product();
                    if new != s.element_count() {
                        return Err(ProgramError::ShapeMismatch(format!(
                            "instruction {i}: reshape {s} to {dims:?} changes element count"
                        )));
                    }
                    Shape::array(dtype, dims)
                }
                Instr::Broadcast(a, dims) => {
                    let s = at(&shapes, *a);
                    match s {
                        Shape::Array { dtype, dims: from } if from.is_empty() => {
                            Shape::array(*dtype, dims)
                        }
                        _ => {
                            return Err(ProgramError::ShapeMismatch(format!(
                                "instruction {i}: broadcast operand must be a scalar, got {s}"
                            )))
                        }
                    }
                }
            };
            shapes.push(shape);
        }

        if self.root.index() as usize >= self.instrs.len() {
            return Err(ProgramError::InvalidOperand {
                instr: self.instrs.len() as u32,
                operand: self.root.index(),
            });
        }
        Ok(shapes)
    }
}

fn at(shapes: &[Shape], id: InstrId) -> &Shape {
    &shapes[id.index() as usize]
}

fn arithmetic_array(i: usize, s: &Shape) -> Result<(), ProgramError> {
    match s.dtype() {
        Some(dtype) if dtype.is_arithmetic() => Ok(()),
        Some(dtype) => Err(ProgramError::TypeMismatch(format!(
            "instruction {i}: arithmetic on {dtype}"
        ))),
        None => Err(ProgramError::ShapeMismatch(format!(
            "instruction {i}: arithmetic on tuple {s}"
        ))),
    }
}

fn elementwise(i: usize, a: &Shape, b: &Shape) -> Result<Shape, ProgramError> {
    arithmetic_array(i, a)?;
    arithmetic_array(i, b)?;
    if a.dtype() != b.dtype() {
        return Err(ProgramError::TypeMismatch(format!("instruction {i}: {a} vs {b}")));
    }
    if a.dims() != b.dims() {
        return Err(ProgramError::ShapeMismatch(format!("instruction {i}: {a} vs {b}")));
    }
    Ok(a.clone())
}
