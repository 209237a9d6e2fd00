//! Batch compilation and executable serialization.
//!
//! A batch is validated in full before any program is moved into the backend,
//! so a failing instance leaves every computation in the batch untouched.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tang_program::{Literal, Program, ProgramError, ProgramShape, Shape};
use tracing::{debug, info};

use crate::computation::{content_hash, CompileInstance, Computation, ComputationHandle, ContentHash};
use crate::device::{device_ordinal, DeviceRegistry, SPMD_DEVICE};
use crate::env::CompilationEnv;
use crate::error::{Result, RuntimeError};
use crate::metrics::{self, MetricsSink};

/// Leading bytes of a serialized computation.
pub const SERIALIZED_MAGIC: [u8; 4] = *b"TNGX";
/// Current serialized computation format.
pub const SERIALIZED_FORMAT_VERSION: u32 = 1;

/// Options an executable was compiled with.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileOptions {
    pub compilation_device: String,
    pub parameter_is_tupled_arguments: bool,
    pub is_sharded: bool,
    pub allow_spmd_sharding_propagation_to_output: bool,
}

impl CompileOptions {
    fn from_instance(instance: &CompileInstance) -> Self {
        Self {
            compilation_device: instance.compilation_device.clone(),
            parameter_is_tupled_arguments: instance.parameter_is_tupled_arguments,
            is_sharded: instance.is_sharded,
            allow_spmd_sharding_propagation_to_output: instance
                .allow_spmd_sharding_propagation_to_output,
        }
    }
}

/// A program accepted by the backend.
#[derive(Debug)]
pub struct Executable {
    program: Arc<Program>,
    program_shape: ProgramShape,
    argument_shapes: Vec<Shape>,
    options: CompileOptions,
}

impl Executable {
    fn new(program: Arc<Program>, options: CompileOptions) -> std::result::Result<Self, String> {
        let program_shape = program.program_shape().map_err(|e| e.to_string())?;
        let argument_shapes = if options.parameter_is_tupled_arguments {
            match program_shape.parameters.as_slice() {
                [Shape::Tuple(elements)] => elements.clone(),
                other => {
                    return Err(format!(
                        "tupled arguments need exactly one tuple parameter, found {} parameters",
                        other.len()
                    ))
                }
            }
        } else {
            program_shape.parameters.clone()
        };
        Ok(Self { program, program_shape, argument_shapes, options })
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn program_shape(&self) -> &ProgramShape {
        &self.program_shape
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    /// Shapes of the arguments passed at execute time.
    pub fn argument_shapes(&self) -> &[Shape] {
        &self.argument_shapes
    }

    pub fn result_shape(&self) -> &Shape {
        &self.program_shape.result
    }

    pub(crate) fn run(&self, args: Vec<Literal>) -> std::result::Result<Literal, ProgramError> {
        if self.options.parameter_is_tupled_arguments {
            self.program.evaluate(&[Literal::tuple(args)])
        } else {
            self.program.evaluate(&args)
        }
    }
}

#[derive(Serialize, Deserialize)]
struct SerializedComputation {
    name: String,
    devices: Vec<String>,
    options: CompileOptions,
    program: Program,
}

/// Move every program of a batch into the backend, or none of them.
///
/// Another batch may have taken one of the programs since validation; the
/// ones already taken here are put back and the batch fails at that index.
fn take_programs(instances: &[CompileInstance]) -> Result<()> {
    let mut taken = Vec::with_capacity(instances.len());
    for (index, instance) in instances.iter().enumerate() {
        match instance.computation.move_program() {
            Ok(program) => taken.push(program),
            Err(e) => {
                for (earlier, program) in instances.iter().zip(taken) {
                    earlier.computation.restore_program(program);
                }
                return Err(RuntimeError::Compilation { index, message: e.to_string() });
            }
        }
    }
    Ok(())
}

/// Turns programs into compiled computations for this client's topology.
pub struct CompileService {
    registry: Arc<DeviceRegistry>,
    env: Arc<CompilationEnv>,
    metrics: Arc<dyn MetricsSink>,
}

impl CompileService {
    pub(crate) fn new(
        registry: Arc<DeviceRegistry>,
        env: Arc<CompilationEnv>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self { registry, env, metrics }
    }

    /// Compile a batch. Results are in input order; the first invalid
    /// instance fails the whole batch and nothing is consumed.
    pub fn compile(&self, instances: Vec<CompileInstance>) -> Result<Vec<ComputationHandle>> {
        let start = Instant::now();
        let mut seen = HashSet::new();
        let mut prepared = Vec::with_capacity(instances.len());
        for (index, instance) in instances.iter().enumerate() {
            let computation = &instance.computation;
            if !seen.insert(Arc::as_ptr(computation) as usize) {
                return Err(RuntimeError::Compilation {
                    index,
                    message: format!("computation {:?} appears twice in the batch", computation.name()),
                });
            }
            let executable = self
                .prepare(instance)
                .map_err(|message| RuntimeError::Compilation { index, message })?;
            prepared.push(executable);
        }

        take_programs(&instances)?;
        let mut compiled = Vec::with_capacity(prepared.len());
        for (instance, executable) in instances.iter().zip(prepared) {
            let source = &instance.computation;
            let devices = self
                .registry
                .compilation_devices(&instance.compilation_device, &instance.devices);
            compiled.push(Arc::new(Computation::compiled(
                source.name().to_string(),
                source.hash(),
                devices,
                Arc::new(executable),
                Arc::clone(&self.metrics),
            )));
        }

        self.metrics.timing(metrics::COMPILE, start.elapsed());
        info!(
            count = compiled.len(),
            env = %self.env.hash(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "compiled batch"
        );
        Ok(compiled)
    }

    fn prepare(&self, instance: &CompileInstance) -> std::result::Result<Executable, String> {
        let computation = &instance.computation;
        if computation.is_compiled() {
            return Err(format!("computation {:?} is already compiled", computation.name()));
        }
        let program = computation.program().map_err(|e| e.to_string())?;

        let spmd = instance.is_sharded && instance.compilation_device == SPMD_DEVICE;
        if !spmd {
            self.check_device(&instance.compilation_device)?;
        }
        for device in &instance.devices {
            self.check_device(device)?;
        }
        if instance.is_sharded && instance.devices.is_empty() {
            return Err("sharded computation needs target devices".into());
        }

        let executable = Executable::new(program, CompileOptions::from_instance(instance))?;
        if let Some(expected) = &instance.output_shape {
            if expected != executable.result_shape() {
                return Err(format!(
                    "output shape {} does not match expected {expected}",
                    executable.result_shape()
                ));
            }
        }
        Ok(executable)
    }

    fn check_device(&self, device: &str) -> std::result::Result<(), String> {
        device_ordinal(device).map_err(|e| e.to_string())?;
        if !self.registry.contains(device) {
            return Err(RuntimeError::UnknownDevice(device.to_string()).to_string());
        }
        Ok(())
    }

    /// Fingerprint of everything that makes executables incompatible.
    pub fn hash_compilation_env(&self) -> ContentHash {
        self.env.hash()
    }

    /// Encode a compiled computation as magic, little-endian format version,
    /// then a postcard payload.
    pub fn serialize(&self, computation: &Computation) -> Result<Vec<u8>> {
        let executable = computation.executable()?;
        let payload = SerializedComputation {
            name: computation.name().to_string(),
            devices: computation.devices().to_vec(),
            options: executable.options().clone(),
            program: executable.program().clone(),
        };
        let mut bytes = Vec::from(SERIALIZED_MAGIC);
        bytes.extend_from_slice(&SERIALIZED_FORMAT_VERSION.to_le_bytes());
        postcard::to_extend(&payload, bytes).map_err(RuntimeError::from)
    }

    /// Decode a serialized computation.
    ///
    /// Returns `Ok(None)` for a well-formed blob of another format version.
    pub fn deserialize(&self, bytes: &[u8]) -> Result<Option<ComputationHandle>> {
        let malformed = |message: String| RuntimeError::Compilation { index: 0, message };
        let (magic, rest) = bytes
            .split_first_chunk::<4>()
            .ok_or_else(|| malformed("serialized computation is truncated".into()))?;
        if *magic != SERIALIZED_MAGIC {
            return Err(malformed("not a serialized computation".into()));
        }
        let (version, payload) = rest
            .split_first_chunk::<4>()
            .ok_or_else(|| malformed("serialized computation is truncated".into()))?;
        let version = u32::from_le_bytes(*version);
        if version != SERIALIZED_FORMAT_VERSION {
            debug!(version, expected = SERIALIZED_FORMAT_VERSION, "skipping serialized computation");
            return Ok(None);
        }

        let decoded: SerializedComputation = postcard::from_bytes(payload)
            .map_err(|e| malformed(format!("corrupt payload: {e}")))?;
        for device in &decoded.devices {
            self.check_device(device).map_err(malformed)?;
        }
        let hash = content_hash(&decoded.name, &decoded.program)?;
        let executable = Executable::new(Arc::new(decoded.program), decoded.options).map_err(malformed)?;
        Ok(Some(Arc::new(Computation::compiled(
            decoded.name,
            hash,
            decoded.devices,
            Arc::new(executable),
            Arc::clone(&self.metrics),
        ))))
    }
}
