//! Client configuration.
//!
//! Loaded from a TOML file, from `TANG_*` environment variables, or built in
//! code. Every source goes through [`ClientConfig::validate`] before a client
//! is created.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};

/// Backend kind, e.g. `CPU`.
pub const ENV_DEVICE: &str = "TANG_DEVICE";
/// Devices owned by each process.
pub const ENV_NUM_DEVICES: &str = "TANG_NUM_DEVICES";
/// This process's index in the job.
pub const ENV_PROCESS_INDEX: &str = "TANG_PROCESS_INDEX";
/// Number of processes in the job.
pub const ENV_NUM_PROCESSES: &str = "TANG_NUM_PROCESSES";
/// Simulated memory per device in bytes.
pub const ENV_DEVICE_MEMORY: &str = "TANG_DEVICE_MEMORY";
/// Compile flags as `k=v,k=v`.
pub const ENV_FLAGS: &str = "TANG_FLAGS";

/// Configuration for a computation client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Backend kind. Device names are `{backend}:{ordinal}`.
    pub backend: String,
    /// Number of devices each process owns.
    pub devices_per_process: usize,
    /// Index of this process, `0..num_processes`.
    pub process_index: usize,
    /// Number of processes in the job.
    pub num_processes: usize,
    /// Simulated capacity of every device.
    pub device_memory_bytes: u64,
    /// Flags that feed the compilation environment hash.
    pub compile_flags: BTreeMap<String, String>,
    /// How long non-zero ranks retry connecting to the coordinator.
    pub coordinator_connect_timeout_ms: u64,
    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backend: "CPU".to_string(),
            devices_per_process: 4,
            process_index: 0,
            num_processes: 1,
            device_memory_bytes: 1 << 30,
            compile_flags: BTreeMap::new(),
            coordinator_connect_timeout_ms: 10_000,
            log_level: "info".to_string(),
        }
    }
}

impl ClientConfig {
    /// Single-process config with `n` devices.
    pub fn local(n: usize) -> Self {
        Self {
            devices_per_process: n,
            ..Self::default()
        }
    }

    /// Config for process `index` of a `count`-process job.
    pub fn process(index: usize, count: usize, devices_per_process: usize) -> Self {
        Self {
            process_index: index,
            num_processes: count,
            devices_per_process,
            ..Self::default()
        }
    }

    pub fn with_device_memory(mut self, bytes: u64) -> Self {
        self.device_memory_bytes = bytes;
        self
    }

    pub fn with_flag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.compile_flags.insert(key.into(), value.into());
        self
    }

    /// Parse a TOML document.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| RuntimeError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    /// Defaults overridden by `TANG_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `TANG_*` key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = lookup(ENV_DEVICE) {
            config.backend = v.trim().to_uppercase();
        }
        if let Some(v) = lookup(ENV_NUM_DEVICES) {
            config.devices_per_process = parse_number(ENV_NUM_DEVICES, &v)?;
        }
        if let Some(v) = lookup(ENV_PROCESS_INDEX) {
            config.process_index = parse_number(ENV_PROCESS_INDEX, &v)?;
        }
        if let Some(v) = lookup(ENV_NUM_PROCESSES) {
            config.num_processes = parse_number(ENV_NUM_PROCESSES, &v)?;
        }
        if let Some(v) = lookup(ENV_DEVICE_MEMORY) {
            config.device_memory_bytes = parse_number(ENV_DEVICE_MEMORY, &v)?;
        }
        if let Some(v) = lookup(ENV_FLAGS) {
            config.compile_flags = parse_flags(&v)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.backend.is_empty() || self.backend.contains(':') {
            return Err(RuntimeError::Config(format!(
                "backend must be a non-empty name without ':', got {:?}",
                self.backend
            )));
        }
        if self.devices_per_process == 0 {
            return Err(RuntimeError::Config(
                "devices_per_process must be at least 1".into(),
            ));
        }
        if self.num_processes == 0 {
            return Err(RuntimeError::Config("num_processes must be at least 1".into()));
        }
        if self.process_index >= self.num_processes {
            return Err(RuntimeError::Config(format!(
                "process_index {} out of range for {} processes",
                self.process_index, self.num_processes
            )));
        }
        if self.device_memory_bytes == 0 {
            return Err(RuntimeError::Config("device_memory_bytes must be positive".into()));
        }
        tracing_subscriber::EnvFilter::try_new(&self.log_level).map_err(|e| {
            RuntimeError::Config(format!("log_level {:?}: {e}", self.log_level))
        })?;
        Ok(())
    }

    /// Global ordinal of this process's `i`-th device.
    pub fn global_ordinal(&self, process: usize, i: usize) -> i64 {
        (process * self.devices_per_process + i) as i64
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| RuntimeError::Config(format!("{key}: expected a number, got {value:?}")))
}

/// Parse `k=v,k=v`. Empty entries are skipped.
pub fn parse_flags(text: &str) -> Result<BTreeMap<String, String>> {
    let mut flags = BTreeMap::new();
    for entry in text.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (k, v) = entry
            .split_once('=')
            .ok_or_else(|| RuntimeError::Config(format!("malformed flag {entry:?}, expected k=v")))?;
        flags.insert(k.trim().to_string(), v.trim().to_string());
    }
    Ok(flags)
}
