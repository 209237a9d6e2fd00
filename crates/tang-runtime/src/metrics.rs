//! Counter and timing hooks.
//!
//! The client reports through a [`MetricsSink`]; collection and export are up
//! to the embedder.

use std::time::Duration;

pub const TRANSFER_TO_SERVER: &str = "TransferToServer";
pub const TRANSFER_FROM_SERVER: &str = "TransferFromServer";
pub const COMPILE: &str = "Compile";
pub const EXECUTE: &str = "Execute";
pub const EXECUTE_REPLICATED: &str = "ExecuteReplicated";
pub const CREATE_DATA_HANDLES: &str = "CreateDataHandles";
pub const RELEASE_DATA_HANDLES: &str = "ReleaseDataHandles";
pub const DESTROY_DATA_HANDLES: &str = "DestroyDataHandles";
pub const CREATE_COMPILE_HANDLES: &str = "CreateCompileHandles";
pub const DESTROY_COMPILE_HANDLES: &str = "DestroyCompileHandles";
pub const INBOUND_DATA: &str = "InboundData";
pub const OUTBOUND_DATA: &str = "OutboundData";

/// Receiver for client metrics.
pub trait MetricsSink: Send + Sync {
    fn counter(&self, name: &'static str, delta: u64);
    fn timing(&self, name: &'static str, elapsed: Duration);
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn counter(&self, _name: &'static str, _delta: u64) {}
    fn timing(&self, _name: &'static str, _elapsed: Duration) {}
}
