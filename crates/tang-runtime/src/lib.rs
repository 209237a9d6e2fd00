//! tang-runtime: Distributed accelerator execution client.
//!
//! Moves tensors between host and devices, compiles `tang_program` programs
//! into executables, and runs them on one device or replicated across many.
//! Work is asynchronous: each device owns a stream, every buffer is a handle
//! that completes when its producer finishes, and callers observe results or
//! failures at `transfer_from_server` and `wait_device_ops`. Multi-process
//! jobs rendezvous through a coordinator that also carries cross-host copies.
//!
//! # Architecture
//!
//! ```text
//!              ComputationClient (CpuClient)
//!   ┌──────────────┬───────────────┬────────────────┐
//!   │ Transfer     │ Compile       │ Execution      │
//!   │ Service      │ Service       │ Engine         │
//!   └──────┬───────┴───────┬───────┴────────┬───────┘
//!          │   DeviceRegistry / CompilationEnv│
//!   ┌──────▼──────────────────────────────────▼──────┐
//!   │ DeviceStream per local device (tokio task)     │
//!   └──────────────────────┬─────────────────────────┘
//!                          │ cross-host payloads
//!                  CoordinatorFacade ── tarpc/TCP ── rank 0
//! ```
//!
//! # Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use tang_runtime::{create_client, ClientConfig, Computation, ExecuteOptions, LiteralSource};
//!
//! let client = create_client(&ClientConfig::local(2))?;
//! let comp = client.compile_one(Arc::new(Computation::new("f", program, vec![])?), "CPU:0", vec![])?;
//! let x = LiteralSource::new(value, "CPU:0")?;
//! let args = client.transfer_to_server(&[&x])?;
//! let out = client.execute_computation(&comp, &args, "CPU:0", &ExecuteOptions::default())?;
//! let values = client.transfer_from_server(&out).await?;
//! ```

pub mod client;
pub mod compile;
pub mod computation;
pub mod config;
pub mod coordinator;
pub mod data;
pub mod device;
pub mod env;
pub mod error;
pub mod execute;
pub mod logging;
pub mod metrics;
pub mod plugin;
pub mod sharding;
pub mod source;
pub mod stream;
mod sync;
pub mod transfer;
pub mod transport;

// Re-exports
pub use client::{create_client, ComputationClient, CpuClient};
pub use compile::{CompileOptions, CompileService, Executable, SERIALIZED_FORMAT_VERSION};
pub use computation::{
    CompileInstance, Computation, ComputationHandle, ComputationState, ContentHash, ExecuteOptions,
};
pub use config::ClientConfig;
pub use coordinator::{CoordinatorClient, CoordinatorFacade, CoordinatorServer};
pub use data::{DataHandle, DataState};
pub use device::{device_ordinal, DeviceAttribute, DeviceInfo, DeviceRegistry, SPMD_DEVICE};
pub use env::CompilationEnv;
pub use error::{Result, RuntimeError};
pub use execute::ExecutionEngine;
pub use logging::init_logging;
pub use metrics::{MetricsSink, NoopMetrics};
pub use plugin::{lookup_backend_path, register_external_backend, PluginRegistry};
pub use sharding::ShardingSpec;
pub use source::{LiteralSource, TensorSource};
pub use stream::MemoryInfo;
pub use transfer::TransferService;

pub use tang_program;
