//! Reference interpreter over host literals.

use crate::dtype::{DType, NativeType};
use crate::error::ProgramError;
use crate::literal::Literal;
use crate::program::{Instr, InstrId, Program};

#[derive(Clone, Copy)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Max,
}

/// Arithmetic element types. Integer ops wrap on overflow.
trait Arith: NativeType {
    fn binary(op: BinaryOp, a: Self, b: Self) -> Self;
    fn negate(a: Self) -> Self;
}

macro_rules! int_arith {
    ($ty:ty) => {
        impl Arith for $ty {
            fn binary(op: BinaryOp, a: Self, b: Self) -> Self {
                match op {
                    BinaryOp::Add => a.wrapping_add(b),
                    BinaryOp::Sub => a.wrapping_sub(b),
                    BinaryOp::Mul => a.wrapping_mul(b),
                    BinaryOp::Max => a.max(b),
                }
            }

            fn negate(a: Self) -> Self {
                a.wrapping_neg()
            }
        }
    };
}

macro_rules! float_arith {
    ($ty:ty) => {
        impl Arith for $ty {
            fn binary(op: BinaryOp, a: Self, b: Self) -> Self {
                match op {
                    BinaryOp::Add => a + b,
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    BinaryOp::Max => a.max(b),
                }
            }

            fn negate(a: Self) -> Self {
                -a
            }
        }
    };
}

int_arith!(i32);
int_arith!(i64);
float_arith!(f32);
float_arith!(f64);

fn zip_typed<T: Arith>(op: BinaryOp, dims: &[usize], a: &Literal, b: &Literal) -> Result<Literal, ProgramError> {
    let xs = a.to_vec::<T>()?;
    let ys = b.to_vec::<T>()?;
    let out: Vec<T> = xs.into_iter().zip(ys).map(|(x, y)| T::binary(op, x, y)).collect();
    Ok(Literal::from_slice(dims, &out))
}

fn neg_typed<T: Arith>(dims: &[usize], a: &Literal) -> Result<Literal, ProgramError> {
    let out: Vec<T> = a.to_vec::<T>()?.into_iter().map(T::negate).collect();
    Ok(Literal::from_slice(dims, &out))
}

fn binary(op: BinaryOp, a: &Literal, b: &Literal) -> Result<Literal, ProgramError> {
    let shape = a.shape();
    if shape != b.shape() {
        return Err(ProgramError::ShapeMismatch(format!("{shape} vs {}", b.shape())));
    }
    let dims = shape.dims();
    match shape.dtype() {
        Some(DType::I32) => zip_typed::<i32>(op, dims, a, b),
        Some(DType::I64) => zip_typed::<i64>(op, dims, a, b),
        Some(DType::F32) => zip_typed::<f32>(op, dims, a, b),
        Some(DType::F64) => zip_typed::<f64>(op, dims, a, b),
        _ => Err(ProgramError::TypeMismatch(format!("arithmetic on {shape}"))),
    }
}

fn negate(a: &Literal) -> Result<Literal, ProgramError> {
    let shape = a.shape();
    let dims = shape.dims();
    match shape.dtype() {
        Some(DType::I32) => neg_typed::<i32>(dims, a),
        Some(DType::I64) => neg_typed::<i64>(dims, a),
        Some(DType::F32) => neg_typed::<f32>(dims, a),
        Some(DType::F64) => neg_typed::<f64>(dims, a),
        _ => Err(ProgramError::TypeMismatch(format!("arithmetic on {shape}"))),
    }
}

fn broadcast(a: &Literal, dims: &[usize]) -> Result<Literal, ProgramError> {
    match a {
        Literal::Array { dtype, dims: from, bytes } if from.is_empty() => {
            let numel: usize = dims.iter().product();
            Ok(Literal::Array {
                dtype: *dtype,
                dims: dims.to_vec(),
                bytes: bytes.repeat(numel),
            })
        }
        other => Err(ProgramError::ShapeMismatch(format!(
            "broadcast operand must be a scalar, got {}",
            other.shape()
        ))),
    }
}

fn at(vals: &[Literal], id: InstrId) -> &Literal {
    &vals[id.index() as usize]
}

impl Program {
    /// Run the program on host literals.
    ///
    /// Arguments must match the declared parameter shapes exactly.
    pub fn evaluate(&self, args: &[Literal]) -> Result<Literal, ProgramError> {
        // Validates structure up front so the loop below can index freely.
        self.infer_shapes()?;

        if args.len() != self.parameters.len() {
            return Err(ProgramError::ArgumentCount {
                expected: self.parameters.len(),
                got: args.len(),
            });
        }
        for (index, (arg, param)) in args.iter().zip(&self.parameters).enumerate() {
            let got = arg.shape();
            if got != param.shape {
                return Err(ProgramError::ArgumentShape {
                    index,
                    expected: param.shape.clone(),
                    got,
                });
            }
        }

        let n = self.root.index() as usize + 1;
        let mut vals: Vec<Literal> = Vec::with_capacity(n);
        for instr in &self.instrs[..n] {
            let value = match instr {
                Instr::Parameter(p) => args[*p as usize].clone(),
                Instr::Constant(c) => c.clone(),
                Instr::Add(a, b) => binary(BinaryOp::Add, at(&vals, *a), at(&vals, *b))?,
                Instr::Sub(a, b) => binary(BinaryOp::Sub, at(&vals, *a), at(&vals, *b))?,
                Instr::Mul(a, b) => binary(BinaryOp::Mul, at(&vals, *a), at(&vals, *b))?,
                Instr::Max(a, b) => binary(BinaryOp::Max, at(&vals, *a), at(&vals, *b))?,
                Instr::Neg(a) => negate(at(&vals, *a))?,
                Instr::Tuple(elements) => {
                    Literal::Tuple(elements.iter().map(|e| at(&vals, *e).clone()).collect())
                }
                Instr::GetTupleElement(t, index) => match at(&vals, *t) {
                    Literal::Tuple(elements) => elements[*index as usize].clone(),
                    other => {
                        return Err(ProgramError::ShapeMismatch(format!(
                            "get-tuple-element on {}",
                            other.shape()
                        )))
                    }
                },
                Instr::Reshape(a, dims) => at(&vals, *a).clone().reshape(dims)?,
                Instr::Broadcast(a, dims) => broadcast(at(&vals, *a), dims)?,
            };
            vals.push(value);
        }

        vals.pop().ok_or(ProgramError::InvalidOperand {
            instr: self.root.index(),
            operand: self.root.index(),
        })
    }
}
