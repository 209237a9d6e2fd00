//! The computation client interface and its in-tree CPU backend.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tang_program::{Literal, Shape};
use tokio::runtime::Handle;
use tracing::info;

use crate::compile::CompileService;
use crate::computation::{CompileInstance, Computation, ComputationHandle, ContentHash, ExecuteOptions};
use crate::config::ClientConfig;
use crate::coordinator::CoordinatorFacade;
use crate::data::DataHandle;
use crate::device::{DeviceAttribute, DeviceRegistry};
use crate::env::CompilationEnv;
use crate::error::{Result, RuntimeError};
use crate::execute::ExecutionEngine;
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::plugin::lookup_backend_path;
use crate::sharding::ShardingSpec;
use crate::source::TensorSource;
use crate::stream::{MemoryInfo, StreamSet};
use crate::sync::{read, write};
use crate::transfer::TransferService;

/// Backend-neutral device client.
///
/// Transfers, compiles and executions return as soon as their work is queued.
/// Only [`Self::transfer_from_server`], [`Self::wait_device_ops`] and
/// [`Self::initialize_coordinator`] suspend.
pub trait ComputationClient: Send + Sync {
    // Data.

    fn create_data_placeholder(&self, device: &str, shape: Shape) -> Result<DataHandle>;

    fn populate_placeholder(&self, handle: &DataHandle, source: &dyn TensorSource) -> Result<()>;

    fn transfer_to_server(&self, sources: &[&dyn TensorSource]) -> Result<Vec<DataHandle>>;

    fn transfer_shards_to_server(
        &self,
        shards: &[&dyn TensorSource],
        device: &str,
        shape: Shape,
        sharding: ShardingSpec,
    ) -> Result<DataHandle>;

    fn transfer_from_server<'a>(&'a self, handles: &'a [DataHandle]) -> BoxFuture<'a, Result<Vec<Literal>>>;

    fn copy_to_device(&self, handle: &DataHandle, dst: &str) -> Result<DataHandle>;

    /// Copy shard `j` of a sharded handle to `devices[j]`, keeping its sharding.
    fn copy_shards_to_devices(&self, handle: &DataHandle, devices: &[String]) -> Result<DataHandle>;

    /// Receive the value a peer process published under `key` by copying to
    /// one of this process's devices.
    fn import_remote(&self, key: &str, device: &str, shape: Shape) -> Result<DataHandle>;

    fn get_data_shards(&self, handle: &DataHandle) -> Vec<DataHandle>;

    fn get_data_shard(&self, handle: &DataHandle, index: usize) -> Result<DataHandle>;

    fn get_data_sharding(&self, handle: &DataHandle) -> Option<ShardingSpec>;

    fn wrap_data_shards(
        &self,
        shards: Vec<DataHandle>,
        device: &str,
        shape: Shape,
        sharding: ShardingSpec,
    ) -> Result<DataHandle>;

    // Compilation.

    fn compile(&self, instances: Vec<CompileInstance>) -> Result<Vec<ComputationHandle>>;

    /// Compile a single computation for `device` (and `devices` when replicated).
    fn compile_one(
        &self,
        computation: ComputationHandle,
        device: &str,
        devices: Vec<String>,
    ) -> Result<ComputationHandle> {
        let mut compiled = self.compile(vec![CompileInstance::new(computation, device, devices)])?;
        compiled
            .pop()
            .ok_or_else(|| RuntimeError::Compilation { index: 0, message: "empty result".into() })
    }

    fn hash_compilation_env(&self) -> ContentHash;

    fn serialize_computation(&self, computation: &Computation) -> Result<Vec<u8>>;

    fn deserialize_computation(&self, bytes: &[u8]) -> Result<Option<ComputationHandle>>;

    // Execution.

    fn execute_computation(
        &self,
        computation: &Computation,
        arguments: &[DataHandle],
        device: &str,
        options: &ExecuteOptions,
    ) -> Result<Vec<DataHandle>>;

    fn execute_replicated(
        &self,
        computation: &Computation,
        arguments: &[DataHandle],
        devices: &[String],
        options: &ExecuteOptions,
    ) -> Result<Vec<Vec<DataHandle>>>;

    fn wait_device_ops<'a>(&'a self, devices: &'a [String]) -> BoxFuture<'a, Result<()>>;

    // Topology.

    fn get_device_ordinal(&self, device: &str) -> Result<i64> {
        crate::device::device_ordinal(device)
    }

    fn get_device_attributes(&self, device: &str) -> Result<HashMap<String, DeviceAttribute>>;

    fn get_local_devices(&self) -> Vec<String>;

    fn get_all_devices(&self) -> Vec<String>;

    fn get_default_device(&self) -> String;

    fn get_num_devices(&self) -> usize;

    fn get_compilation_devices(&self, device: &str, devices: &[String]) -> Vec<String>;

    fn process_index(&self) -> usize;

    fn num_processes(&self) -> usize;

    fn get_memory_info(&self, device: &str) -> Result<MemoryInfo>;

    fn set_replication_devices(&self, devices: Vec<String>) -> Result<()>;

    fn get_replication_devices(&self) -> Vec<String>;

    // Coordination.

    fn initialize_coordinator<'a>(
        &'a self,
        global_rank: u32,
        world_size: u32,
        master_address: &'a str,
        port: u16,
    ) -> BoxFuture<'a, Result<()>>;

    fn is_coordinator_initialized(&self) -> bool;
}

/// Host-memory backend: each device is a stream task on the current tokio
/// runtime with a simulated memory budget.
pub struct CpuClient {
    registry: Arc<DeviceRegistry>,
    streams: Arc<StreamSet>,
    env: Arc<CompilationEnv>,
    coordinator: Arc<CoordinatorFacade>,
    transfer: TransferService,
    compiler: CompileService,
    engine: ExecutionEngine,
    replication_devices: RwLock<Vec<String>>,
}

impl CpuClient {
    /// Must be called from within a tokio runtime; device streams run on it.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        Self::with_metrics(config, Arc::new(NoopMetrics))
    }

    pub fn with_metrics(config: &ClientConfig, metrics: Arc<dyn MetricsSink>) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| RuntimeError::Config(format!("CPU client needs a tokio runtime: {e}")))?;
        let registry = Arc::new(DeviceRegistry::from_config(config)?);
        let streams = Arc::new(StreamSet::new(
            registry.local_devices(),
            config.device_memory_bytes,
            &runtime,
        ));
        let env = Arc::new(CompilationEnv::from_config(config));
        let timeout = Duration::from_millis(config.coordinator_connect_timeout_ms);
        let coordinator = Arc::new(CoordinatorFacade::new(timeout));

        let transfer = TransferService::new(
            Arc::clone(&registry),
            Arc::clone(&streams),
            Arc::clone(&coordinator),
            Arc::clone(&metrics),
            timeout,
        );
        let compiler = CompileService::new(Arc::clone(&registry), Arc::clone(&env), Arc::clone(&metrics));
        let engine = ExecutionEngine::new(Arc::clone(&registry), Arc::clone(&streams), metrics);

        info!(
            backend = %config.backend,
            process = config.process_index,
            num_processes = config.num_processes,
            local_devices = registry.local_devices().len(),
            num_devices = registry.num_devices(),
            "created computation client"
        );
        Ok(Self {
            registry,
            streams,
            env,
            coordinator,
            transfer,
            compiler,
            engine,
            replication_devices: RwLock::new(Vec::new()),
        })
    }

    /// Make every launch on `device` fail with `reason` until cleared.
    pub fn inject_fault(&self, device: &str, reason: impl Into<String>) -> Result<()> {
        self.streams.get(device)?.inject_fault(reason);
        Ok(())
    }

    pub fn clear_fault(&self, device: &str) -> Result<()> {
        self.streams.get(device)?.clear_fault();
        Ok(())
    }

    /// Buffers currently holding device memory on `device`.
    pub fn live_buffers(&self, device: &str) -> Result<usize> {
        Ok(self.streams.get(device)?.memory().live_buffers())
    }

    pub fn compilation_env(&self) -> &Arc<CompilationEnv> {
        &self.env
    }

    pub fn coordinator(&self) -> &Arc<CoordinatorFacade> {
        &self.coordinator
    }
}

impl ComputationClient for CpuClient {
    fn create_data_placeholder(&self, device: &str, shape: Shape) -> Result<DataHandle> {
        self.transfer.create_placeholder(device, shape)
    }

    fn populate_placeholder(&self, handle: &DataHandle, source: &dyn TensorSource) -> Result<()> {
        self.transfer.populate_placeholder(handle, source)
    }

    fn transfer_to_server(&self, sources: &[&dyn TensorSource]) -> Result<Vec<DataHandle>> {
        self.transfer.transfer_to_server(sources)
    }

    fn transfer_shards_to_server(
        &self,
        shards: &[&dyn TensorSource],
        device: &str,
        shape: Shape,
        sharding: ShardingSpec,
    ) -> Result<DataHandle> {
        self.transfer.transfer_shards_to_server(shards, device, shape, sharding)
    }

    fn transfer_from_server<'a>(&'a self, handles: &'a [DataHandle]) -> BoxFuture<'a, Result<Vec<Literal>>> {
        self.transfer.transfer_from_server(handles).boxed()
    }

    fn copy_to_device(&self, handle: &DataHandle, dst: &str) -> Result<DataHandle> {
        self.transfer.copy_to_device(handle, dst)
    }

    fn copy_shards_to_devices(&self, handle: &DataHandle, devices: &[String]) -> Result<DataHandle> {
        self.transfer.copy_shards_to_devices(handle, devices)
    }

    fn import_remote(&self, key: &str, device: &str, shape: Shape) -> Result<DataHandle> {
        self.transfer.import_remote(key, device, shape)
    }

    fn get_data_shards(&self, handle: &DataHandle) -> Vec<DataHandle> {
        self.transfer.get_data_shards(handle)
    }

    fn get_data_shard(&self, handle: &DataHandle, index: usize) -> Result<DataHandle> {
        self.transfer.get_data_shard(handle, index)
    }

    fn get_data_sharding(&self, handle: &DataHandle) -> Option<ShardingSpec> {
        self.transfer.get_data_sharding(handle)
    }

    fn wrap_data_shards(
        &self,
        shards: Vec<DataHandle>,
        device: &str,
        shape: Shape,
        sharding: ShardingSpec,
    ) -> Result<DataHandle> {
        self.transfer.wrap_data_shards(shards, device, shape, sharding)
    }

    fn compile(&self, instances: Vec<CompileInstance>) -> Result<Vec<ComputationHandle>> {
        self.compiler.compile(instances)
    }

    fn hash_compilation_env(&self) -> ContentHash {
        self.compiler.hash_compilation_env()
    }

    fn serialize_computation(&self, computation: &Computation) -> Result<Vec<u8>> {
        self.compiler.serialize(computation)
    }

    fn deserialize_computation(&self, bytes: &[u8]) -> Result<Option<ComputationHandle>> {
        self.compiler.deserialize(bytes)
    }

    fn execute_computation(
        &self,
        computation: &Computation,
        arguments: &[DataHandle],
        device: &str,
        options: &ExecuteOptions,
    ) -> Result<Vec<DataHandle>> {
        self.engine.execute_computation(computation, arguments, device, options)
    }

    fn execute_replicated(
        &self,
        computation: &Computation,
        arguments: &[DataHandle],
        devices: &[String],
        options: &ExecuteOptions,
    ) -> Result<Vec<Vec<DataHandle>>> {
        self.engine.execute_replicated(computation, arguments, devices, options)
    }

    fn wait_device_ops<'a>(&'a self, devices: &'a [String]) -> BoxFuture<'a, Result<()>> {
        self.engine.wait_device_ops(devices).boxed()
    }

    fn get_device_attributes(&self, device: &str) -> Result<HashMap<String, DeviceAttribute>> {
        self.registry.attributes(device).cloned()
    }

    fn get_local_devices(&self) -> Vec<String> {
        self.registry.local_devices().to_vec()
    }

    fn get_all_devices(&self) -> Vec<String> {
        self.registry.all_devices().to_vec()
    }

    fn get_default_device(&self) -> String {
        self.registry.default_device().to_string()
    }

    fn get_num_devices(&self) -> usize {
        self.registry.local_devices().len()
    }

    fn get_compilation_devices(&self, device: &str, devices: &[String]) -> Vec<String> {
        self.registry.compilation_devices(device, devices)
    }

    fn process_index(&self) -> usize {
        self.registry.process_index()
    }

    fn num_processes(&self) -> usize {
        self.registry.num_processes()
    }

    fn get_memory_info(&self, device: &str) -> Result<MemoryInfo> {
        self.registry.check_local(device)?;
        Ok(self.streams.get(device)?.memory().info())
    }

    fn set_replication_devices(&self, devices: Vec<String>) -> Result<()> {
        for device in &devices {
            self.registry.device_ordinal(device)?;
            if !self.registry.contains(device) {
                return Err(RuntimeError::UnknownDevice(device.clone()));
            }
        }
        *write(&self.replication_devices) = devices;
        Ok(())
    }

    fn get_replication_devices(&self) -> Vec<String> {
        read(&self.replication_devices).clone()
    }

    fn initialize_coordinator<'a>(
        &'a self,
        global_rank: u32,
        world_size: u32,
        master_address: &'a str,
        port: u16,
    ) -> BoxFuture<'a, Result<()>> {
        self.coordinator
            .initialize(global_rank, world_size, master_address, port)
            .boxed()
    }

    fn is_coordinator_initialized(&self) -> bool {
        self.coordinator.is_initialized()
    }
}

/// Build the client for `config.backend`.
///
/// `CPU` is built in. Other kinds must be registered with
/// [`crate::plugin::register_external_backend`]; this build cannot load them
/// and reports [`RuntimeError::UnsupportedBackend`].
pub fn create_client(config: &ClientConfig) -> Result<Arc<dyn ComputationClient>> {
    config.validate()?;
    if config.backend.eq_ignore_ascii_case("CPU") {
        return Ok(Arc::new(CpuClient::new(config)?));
    }
    match lookup_backend_path(&config.backend) {
        Some(path) => Err(RuntimeError::UnsupportedBackend(format!(
            "{} (plugin at {} cannot be loaded by this build)",
            config.backend,
            path.display()
        ))),
        None => Err(RuntimeError::UnsupportedBackend(config.backend.clone())),
    }
}
