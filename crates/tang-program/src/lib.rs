//! tang-program: Serializable tensor programs for the tang runtime.
//!
//! A `Program` is an arena of tensor instructions (parameters, constants,
//! element-wise arithmetic, tuples) in topological order. It is the value a
//! framework hands to the runtime for compilation: the runtime infers its
//! `ProgramShape`, hashes its postcard encoding for identity, and runs it with
//! the reference interpreter on host-backed devices.
//!
//! # Quick start
//!
//! ```
//! use tang_program::{DType, Literal, ProgramBuilder, Shape};
//!
//! let mut b = ProgramBuilder::new();
//! let x = b.parameter(Shape::array(DType::F32, &[2]), "x");
//! let y = b.parameter(Shape::array(DType::F32, &[2]), "y");
//! let sum = b.add(x, y);
//! let program = b.build(sum);
//!
//! let out = program
//!     .evaluate(&[
//!         Literal::from_slice(&[2], &[1.0f32, 2.0]),
//!         Literal::from_slice(&[2], &[3.0f32, 4.0]),
//!     ])
//!     .unwrap();
//! assert_eq!(out.to_vec::<f32>().unwrap(), vec![4.0, 6.0]);
//! ```

pub mod dtype;
pub mod error;
pub mod eval;
pub mod infer;
pub mod literal;
pub mod program;
pub mod shape;

pub use dtype::{DType, NativeType};
pub use error::ProgramError;
pub use infer::ProgramShape;
pub use literal::Literal;
pub use program::{Instr, InstrId, Parameter, Program, ProgramBuilder, PROGRAM_VERSION};
pub use shape::Shape;
