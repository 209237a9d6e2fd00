//! Device naming, topology and attributes.
//!
//! Devices are named `"<kind>:<ordinal>"`. Ordinals are global across the
//! job: process `p` owns ordinals `p * devices_per_process ..` of the next
//! `devices_per_process`. Only devices of this process are addressable.

use std::collections::{BTreeMap, HashMap};

use crate::config::ClientConfig;
use crate::error::{Result, RuntimeError};

/// Virtual device that owns sharded handles.
pub const SPMD_DEVICE: &str = "SPMD:0";

/// Parse the decimal digits after the final `:` of a device string. Signs
/// are rejected.
pub fn device_ordinal(device: &str) -> Result<i64> {
    let invalid = || RuntimeError::InvalidDeviceString(device.to_string());
    let (_, ordinal) = device.rsplit_once(':').ok_or_else(invalid)?;
    if ordinal.is_empty() || !ordinal.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    ordinal.parse().map_err(|_| invalid())
}

/// The part of a device string before the final `:`.
pub fn device_kind(device: &str) -> Result<&str> {
    device_ordinal(device)?;
    Ok(device.rsplit_once(':').map(|(kind, _)| kind).unwrap_or_default())
}

/// Value of a device attribute.
#[derive(Clone, Debug, PartialEq)]
pub enum DeviceAttribute {
    Str(String),
    Bool(bool),
    Int(i64),
    IntList(Vec<i64>),
    Float(f32),
}

/// One device in the job topology.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub name: String,
    pub ordinal: i64,
    pub process_index: usize,
    pub attributes: HashMap<String, DeviceAttribute>,
}

impl DeviceInfo {
    pub fn new(name: impl Into<String>, process_index: usize) -> Result<Self> {
        let name = name.into();
        let ordinal = device_ordinal(&name)?;
        let kind = device_kind(&name)?.to_string();
        let attributes = HashMap::from([
            ("kind".to_string(), DeviceAttribute::Str(kind)),
            ("ordinal".to_string(), DeviceAttribute::Int(ordinal)),
            ("process_index".to_string(), DeviceAttribute::Int(process_index as i64)),
            ("coords".to_string(), DeviceAttribute::IntList(vec![ordinal, 0, 0])),
        ]);
        Ok(Self { name, ordinal, process_index, attributes })
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: DeviceAttribute) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

/// Immutable view of every device in the job and which ones this process owns.
#[derive(Debug)]
pub struct DeviceRegistry {
    devices: BTreeMap<String, DeviceInfo>,
    local: Vec<String>,
    all: Vec<String>,
    process_index: usize,
    num_processes: usize,
}

impl DeviceRegistry {
    /// Build from an explicit device list. Duplicate names keep the first entry.
    pub fn new(devices: Vec<DeviceInfo>, process_index: usize, num_processes: usize) -> Result<Self> {
        if process_index >= num_processes {
            return Err(RuntimeError::Config(format!(
                "process_index {process_index} out of range for {num_processes} processes"
            )));
        }
        let mut by_name = BTreeMap::new();
        for mut info in devices {
            device_ordinal(&info.name)?;
            info.attributes.insert(
                "is_addressable".to_string(),
                DeviceAttribute::Bool(info.process_index == process_index),
            );
            by_name.entry(info.name.clone()).or_insert(info);
        }

        let mut all: Vec<&DeviceInfo> = by_name.values().collect();
        all.sort_by(|a, b| a.ordinal.cmp(&b.ordinal).then_with(|| a.name.cmp(&b.name)));
        let local: Vec<String> = all
            .iter()
            .filter(|d| d.process_index == process_index)
            .map(|d| d.name.clone())
            .collect();
        if local.is_empty() {
            return Err(RuntimeError::Config(format!(
                "process {process_index} owns no devices"
            )));
        }
        let all = all.iter().map(|d| d.name.clone()).collect();

        Ok(Self { devices: by_name, local, all, process_index, num_processes })
    }

    /// Topology described by a client config.
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        config.validate()?;
        let mut devices = Vec::with_capacity(config.num_processes * config.devices_per_process);
        for process in 0..config.num_processes {
            for i in 0..config.devices_per_process {
                let name = format!("{}:{}", config.backend, config.global_ordinal(process, i));
                let info = DeviceInfo::new(name, process)?.with_attribute(
                    "memory_bytes",
                    DeviceAttribute::Int(config.device_memory_bytes as i64),
                );
                devices.push(info);
            }
        }
        Self::new(devices, config.process_index, config.num_processes)
    }

    pub fn device_ordinal(&self, device: &str) -> Result<i64> {
        device_ordinal(device)
    }

    pub fn attributes(&self, device: &str) -> Result<&HashMap<String, DeviceAttribute>> {
        Ok(&self.info(device)?.attributes)
    }

    fn info(&self, device: &str) -> Result<&DeviceInfo> {
        device_ordinal(device)?;
        self.devices
            .get(device)
            .ok_or_else(|| RuntimeError::UnknownDevice(device.to_string()))
    }

    /// Devices owned by this process, by ordinal.
    pub fn local_devices(&self) -> &[String] {
        &self.local
    }

    /// Every device in the job, by ordinal.
    pub fn all_devices(&self) -> &[String] {
        &self.all
    }

    pub fn default_device(&self) -> &str {
        &self.local[0]
    }

    pub fn process_index(&self) -> usize {
        self.process_index
    }

    pub fn num_processes(&self) -> usize {
        self.num_processes
    }

    /// Number of addressable devices.
    pub fn num_devices(&self) -> usize {
        self.local.len()
    }

    pub fn contains(&self, device: &str) -> bool {
        self.devices.contains_key(device)
    }

    pub fn is_local(&self, device: &str) -> bool {
        self.devices
            .get(device)
            .is_some_and(|d| d.process_index == self.process_index)
    }

    /// Owning process of a known device.
    pub fn process_of(&self, device: &str) -> Result<usize> {
        Ok(self.info(device)?.process_index)
    }

    /// Parse, look up and require the device to be addressable, in that order.
    pub fn check_local(&self, device: &str) -> Result<()> {
        if self.info(device)?.process_index != self.process_index {
            return Err(RuntimeError::NotAddressable(device.to_string()));
        }
        Ok(())
    }

    /// Devices a computation for `device` is compiled for: `devices`, or just
    /// `device` when the list is empty.
    pub fn compilation_devices(&self, device: &str, devices: &[String]) -> Vec<String> {
        if devices.is_empty() {
            vec![device.to_string()]
        } else {
            devices.to_vec()
        }
    }
}
