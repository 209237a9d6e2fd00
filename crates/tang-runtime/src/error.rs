//! Error types for tang-runtime.

use std::fmt;

use tang_program::{ProgramError, Shape};

/// Errors that can occur in client operations.
///
/// `Clone` so that one failed producer can poison every handle it feeds.
#[derive(Clone, Debug, PartialEq)]
pub enum RuntimeError {
    /// Device string without a numeric ordinal after the final `:`.
    InvalidDeviceString(String),
    /// Device not present in the registry.
    UnknownDevice(String),
    /// Device belongs to another process and cannot be driven from here.
    NotAddressable(String),
    /// Number of shards disagrees with the sharding spec or device list.
    ShardCountMismatch { expected: usize, got: usize },
    /// Shards cannot be assembled into (or split from) a sharded value.
    ShardConfiguration(String),
    /// Argument resident on a different device than the execution target.
    DeviceMismatch { expected: String, got: String },
    /// Wrong number of arguments for a computation.
    ArgumentCount { expected: usize, got: usize },
    /// Argument shape differs from the declared parameter shape.
    ArgumentShape { index: usize, expected: Shape, got: Shape },
    /// Host data source is malformed (size, tuple shape, ...).
    InvalidSource(String),
    /// Program failed structural validation.
    InvalidProgram(ProgramError),
    /// A compile batch failed at `index`.
    Compilation { index: usize, message: String },
    /// Operation needs a compiled computation.
    NotCompiled(String),
    /// One or more replicas failed to launch; nothing from the call survives.
    ReplicatedExecution { devices: Vec<String>, message: String },
    /// Program failed while running on a device.
    Execution { device: String, message: String },
    /// Moving bytes to, from or between devices failed.
    Transport { device: String, message: String },
    /// Coordinator used before `initialize`.
    CoordinatorNotInitialized,
    /// `initialize` called twice.
    CoordinatorAlreadyInitialized,
    /// Coordinator RPC or connection failure.
    Rendezvous(String),
    /// Handle was released before this read.
    UseAfterRelease(String),
    /// Program already moved into the backend.
    MovedProgramAccess(String),
    /// Backend kind with no implementation.
    UnsupportedBackend(String),
    /// Invalid configuration.
    Config(String),
    /// Serialization/deserialization error.
    Serde(String),
    /// IO error.
    Io(String),
}

impl RuntimeError {
    /// Synchronous argument validation failures. These are never retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidDeviceString(_)
                | Self::UnknownDevice(_)
                | Self::NotAddressable(_)
                | Self::ShardCountMismatch { .. }
                | Self::ShardConfiguration(_)
                | Self::DeviceMismatch { .. }
                | Self::ArgumentCount { .. }
                | Self::ArgumentShape { .. }
                | Self::InvalidSource(_)
        )
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidDeviceString(d) => write!(f, "invalid device string: {d:?}"),
            Self::UnknownDevice(d) => write!(f, "unknown device {d}"),
            Self::NotAddressable(d) => write!(f, "device {d} is not addressable from this process"),
            Self::ShardCountMismatch { expected, got } => {
                write!(f, "shard count mismatch: expected {expected}, got {got}")
            }
            Self::ShardConfiguration(msg) => write!(f, "invalid shard configuration: {msg}"),
            Self::DeviceMismatch { expected, got } => {
                write!(f, "device mismatch: expected {expected}, got {got}")
            }
            Self::ArgumentCount { expected, got } => {
                write!(f, "expected {expected} arguments, got {got}")
            }
            Self::ArgumentShape { index, expected, got } => {
                write!(f, "argument {index}: expected {expected}, got {got}")
            }
            Self::InvalidSource(msg) => write!(f, "invalid tensor source: {msg}"),
            Self::InvalidProgram(e) => write!(f, "invalid program: {e}"),
            Self::Compilation { index, message } => {
                write!(f, "compilation failed for instance {index}: {message}")
            }
            Self::NotCompiled(name) => write!(f, "computation {name:?} is not compiled"),
            Self::ReplicatedExecution { devices, message } => {
                write!(f, "replicated execution failed on {}: {message}", devices.join(", "))
            }
            Self::Execution { device, message } => {
                write!(f, "execution failed on {device}: {message}")
            }
            Self::Transport { device, message } => {
                write!(f, "transport error on {device}: {message}")
            }
            Self::CoordinatorNotInitialized => write!(f, "coordinator is not initialized"),
            Self::CoordinatorAlreadyInitialized => write!(f, "coordinator is already initialized"),
            Self::Rendezvous(msg) => write!(f, "rendezvous error: {msg}"),
            Self::UseAfterRelease(what) => write!(f, "use of released data: {what}"),
            Self::MovedProgramAccess(name) => {
                write!(f, "program of computation {name:?} has been moved")
            }
            Self::UnsupportedBackend(msg) => write!(f, "unsupported backend: {msg}"),
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::Serde(msg) => write!(f, "serialization error: {msg}"),
            Self::Io(msg) => write!(f, "io error: {msg}"),
        }
    }
}

impl std::error::Error for RuntimeError {}

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

impl From<ProgramError> for RuntimeError {
    fn from(e: ProgramError) -> Self {
        Self::InvalidProgram(e)
    }
}

impl From<postcard::Error> for RuntimeError {
    fn from(e: postcard::Error) -> Self {
        Self::Serde(e.to_string())
    }
}

impl From<std::io::Error> for RuntimeError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<toml::de::Error> for RuntimeError {
    fn from(e: toml::de::Error) -> Self {
        Self::Config(e.to_string())
    }
}

impl From<tarpc::client::RpcError> for RuntimeError {
    fn from(e: tarpc::client::RpcError) -> Self {
        Self::Rendezvous(e.to_string())
    }
}
