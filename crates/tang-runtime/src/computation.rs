//! Computation handles: program identity, placement and compiled state.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tang_program::{Program, ProgramShape, Shape};

use crate::compile::Executable;
use crate::error::{Result, RuntimeError};
use crate::metrics::{self, MetricsSink, NoopMetrics};
use crate::sync::lock;

/// SHA-256 content hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    /// Hash a sequence of byte strings, each length-prefixed so that
    /// `["ab", "c"]` and `["a", "bc"]` differ.
    pub fn of<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        Self(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..16])
    }
}

/// A program that can be handed to the backend exactly once.
pub struct ProgramCell(Mutex<Option<Arc<Program>>>);

impl ProgramCell {
    fn new(program: Program) -> Self {
        Self(Mutex::new(Some(Arc::new(program))))
    }

    fn get(&self) -> Option<Arc<Program>> {
        lock(&self.0).clone()
    }

    fn take(&self) -> Option<Arc<Program>> {
        lock(&self.0).take()
    }

    /// Put back a program taken by [`Self::take`].
    fn restore(&self, program: Arc<Program>) {
        lock(&self.0).get_or_insert(program);
    }

    fn is_moved(&self) -> bool {
        lock(&self.0).is_none()
    }
}

/// Lifecycle of a computation.
pub enum ComputationState {
    /// Built for a named program; not compiled yet.
    Named(ProgramCell),
    /// Anonymous program with no placement.
    Unbound(ProgramCell),
    Compiled(Arc<Executable>),
}

/// A program together with its identity and target devices.
pub struct Computation {
    name: String,
    hash: ContentHash,
    devices: Vec<String>,
    program_shape: ProgramShape,
    state: ComputationState,
    metrics: Arc<dyn MetricsSink>,
}

/// Shared handle to a computation.
pub type ComputationHandle = Arc<Computation>;

pub(crate) fn content_hash(name: &str, program: &Program) -> Result<ContentHash> {
    let bytes = program.to_bytes()?;
    Ok(ContentHash::of([name.as_bytes(), bytes.as_slice()]))
}

impl Computation {
    /// A named program targeting `devices`. An empty list leaves placement to
    /// execute time.
    pub fn new(name: impl Into<String>, program: Program, devices: Vec<String>) -> Result<Self> {
        let name = name.into();
        let program_shape = program.program_shape()?;
        let hash = content_hash(&name, &program)?;
        Ok(Self {
            name,
            hash,
            devices,
            program_shape,
            state: ComputationState::Named(ProgramCell::new(program)),
            metrics: Arc::new(NoopMetrics),
        })
    }

    /// An anonymous program with no placement.
    pub fn unbound(program: Program) -> Result<Self> {
        let program_shape = program.program_shape()?;
        let hash = content_hash("", &program)?;
        Ok(Self {
            name: String::new(),
            hash,
            devices: Vec::new(),
            program_shape,
            state: ComputationState::Unbound(ProgramCell::new(program)),
            metrics: Arc::new(NoopMetrics),
        })
    }

    pub(crate) fn compiled(
        name: String,
        hash: ContentHash,
        devices: Vec<String>,
        executable: Arc<Executable>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        metrics.counter(metrics::CREATE_COMPILE_HANDLES, 1);
        Self {
            name,
            hash,
            devices,
            program_shape: executable.program_shape().clone(),
            state: ComputationState::Compiled(executable),
            metrics,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hash(&self) -> ContentHash {
        self.hash
    }

    pub fn devices(&self) -> &[String] {
        &self.devices
    }

    pub fn program_shape(&self) -> &ProgramShape {
        &self.program_shape
    }

    pub fn parameters_size(&self) -> usize {
        self.program_shape.parameters_size()
    }

    pub fn parameter_names(&self) -> &[String] {
        &self.program_shape.parameter_names
    }

    pub fn result_shape(&self) -> &Shape {
        &self.program_shape.result
    }

    pub fn state(&self) -> &ComputationState {
        &self.state
    }

    pub fn is_compiled(&self) -> bool {
        matches!(self.state, ComputationState::Compiled(_))
    }

    /// Whether the program has been handed to the backend.
    pub fn is_moved(&self) -> bool {
        match &self.state {
            ComputationState::Named(cell) | ComputationState::Unbound(cell) => cell.is_moved(),
            ComputationState::Compiled(_) => true,
        }
    }

    /// The single target device.
    pub fn device(&self) -> Result<&str> {
        match self.devices.as_slice() {
            [device] => Ok(device),
            other => Err(RuntimeError::ShardConfiguration(format!(
                "computation {:?} targets {} devices, not one",
                self.name,
                other.len()
            ))),
        }
    }

    /// The program, until it has been moved into the backend.
    pub fn program(&self) -> Result<Arc<Program>> {
        match &self.state {
            ComputationState::Named(cell) | ComputationState::Unbound(cell) => cell
                .get()
                .ok_or_else(|| RuntimeError::MovedProgramAccess(self.name.clone())),
            ComputationState::Compiled(_) => Err(RuntimeError::MovedProgramAccess(self.name.clone())),
        }
    }

    /// Take the program out. Every later read fails with
    /// [`RuntimeError::MovedProgramAccess`].
    pub fn move_program(&self) -> Result<Arc<Program>> {
        match &self.state {
            ComputationState::Named(cell) | ComputationState::Unbound(cell) => cell
                .take()
                .ok_or_else(|| RuntimeError::MovedProgramAccess(self.name.clone())),
            ComputationState::Compiled(_) => Err(RuntimeError::MovedProgramAccess(self.name.clone())),
        }
    }

    /// Undo a [`Self::move_program`] whose compile did not go through.
    pub(crate) fn restore_program(&self, program: Arc<Program>) {
        if let ComputationState::Named(cell) | ComputationState::Unbound(cell) = &self.state {
            cell.restore(program);
        }
    }

    pub fn executable(&self) -> Result<&Arc<Executable>> {
        match &self.state {
            ComputationState::Compiled(exec) => Ok(exec),
            _ => Err(RuntimeError::NotCompiled(self.name.clone())),
        }
    }
}

impl Drop for Computation {
    fn drop(&mut self) {
        if self.is_compiled() {
            self.metrics.counter(metrics::DESTROY_COMPILE_HANDLES, 1);
        }
    }
}

impl fmt::Display for Computation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            ComputationState::Named(_) => "named",
            ComputationState::Unbound(_) => "unbound",
            ComputationState::Compiled(_) => "compiled",
        };
        write!(f, "Computation({:?}, {state}, hash={}, params=(", self.name, self.hash)?;
        for (i, shape) in self.program_shape.parameters.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{shape}")?;
        }
        write!(f, ") -> {}, devices={:?})", self.program_shape.result, self.devices)
    }
}

impl fmt::Debug for Computation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// One entry of a compile batch.
#[derive(Clone, Debug)]
pub struct CompileInstance {
    pub computation: ComputationHandle,
    pub compilation_device: String,
    /// Every device the executable runs on; more than one means replicated
    /// or partitioned.
    pub devices: Vec<String>,
    /// Expected result shape, checked against the program when set.
    pub output_shape: Option<Shape>,
    /// Arguments arrive packed in the program's single tuple parameter.
    pub parameter_is_tupled_arguments: bool,
    pub is_sharded: bool,
    pub allow_spmd_sharding_propagation_to_output: bool,
}

impl CompileInstance {
    pub fn new(
        computation: ComputationHandle,
        compilation_device: impl Into<String>,
        devices: Vec<String>,
    ) -> Self {
        Self {
            computation,
            compilation_device: compilation_device.into(),
            devices,
            output_shape: None,
            parameter_is_tupled_arguments: false,
            is_sharded: false,
            allow_spmd_sharding_propagation_to_output: true,
        }
    }

    pub fn with_output_shape(mut self, shape: Shape) -> Self {
        self.output_shape = Some(shape);
        self
    }

    pub fn with_tupled_arguments(mut self, tupled: bool) -> Self {
        self.parameter_is_tupled_arguments = tupled;
        self
    }

    pub fn with_sharding(mut self, is_sharded: bool) -> Self {
        self.is_sharded = is_sharded;
        self
    }

    pub fn with_output_sharding_propagation(mut self, allow: bool) -> Self {
        self.allow_spmd_sharding_propagation_to_output = allow;
        self
    }
}

/// Per-call execution options.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Split a tuple result into one handle per element.
    pub explode_tuple: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self { explode_tuple: true }
    }
}
