//! Per-device execution streams and memory accounting.
//!
//! Every addressable device owns one [`DeviceStream`]: a FIFO of jobs run one
//! at a time on a dedicated tokio task. Work on one device completes in issue
//! order; ordering across devices only comes from waiting on data handles.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::error::{Result, RuntimeError};
use crate::sync::lock;

/// Free and total memory of a device, in KiB.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryInfo {
    pub kb_free: u64,
    pub kb_total: u64,
}

/// Byte budget of one device.
#[derive(Debug)]
pub(crate) struct MemoryTracker {
    capacity: u64,
    used: AtomicU64,
    buffers: AtomicUsize,
}

impl MemoryTracker {
    pub(crate) fn new(capacity: u64) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            used: AtomicU64::new(0),
            buffers: AtomicUsize::new(0),
        })
    }

    /// Reserve `bytes`, or `None` if that would exceed capacity.
    pub(crate) fn allocate(self: &Arc<Self>, bytes: u64) -> Option<Allocation> {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|&total| total <= self.capacity)
            })
            .ok()?;
        self.buffers.fetch_add(1, Ordering::AcqRel);
        Some(Allocation {
            tracker: Arc::clone(self),
            bytes,
        })
    }

    pub(crate) fn live_buffers(&self) -> usize {
        self.buffers.load(Ordering::Acquire)
    }

    pub(crate) fn info(&self) -> MemoryInfo {
        let used = self.used.load(Ordering::Acquire);
        MemoryInfo {
            kb_free: self.capacity.saturating_sub(used) / 1024,
            kb_total: self.capacity / 1024,
        }
    }
}

/// A reservation against a [`MemoryTracker`], returned on drop.
#[derive(Debug)]
pub(crate) struct Allocation {
    tracker: Arc<MemoryTracker>,
    bytes: u64,
}

impl Drop for Allocation {
    fn drop(&mut self) {
        self.tracker.used.fetch_sub(self.bytes, Ordering::AcqRel);
        self.tracker.buffers.fetch_sub(1, Ordering::AcqRel);
    }
}

type Job = BoxFuture<'static, ()>;

/// FIFO of asynchronous work for one device.
pub(crate) struct DeviceStream {
    device: String,
    jobs: mpsc::UnboundedSender<Job>,
    pending: Arc<watch::Sender<usize>>,
    errors: Mutex<Vec<RuntimeError>>,
    fault: Mutex<Option<String>>,
    memory: Arc<MemoryTracker>,
}

impl DeviceStream {
    /// Start the stream's worker task on `runtime`.
    pub(crate) fn spawn(device: impl Into<String>, capacity: u64, runtime: &Handle) -> Arc<Self> {
        let device = device.into();
        let (jobs, mut rx) = mpsc::unbounded_channel::<Job>();
        let pending = Arc::new(watch::Sender::new(0usize));

        let counter = Arc::clone(&pending);
        let name = device.clone();
        runtime.spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
                counter.send_modify(|n| *n = n.saturating_sub(1));
            }
            debug!(device = %name, "device stream closed");
        });

        Arc::new(Self {
            device,
            jobs,
            pending,
            errors: Mutex::new(Vec::new()),
            fault: Mutex::new(None),
            memory: MemoryTracker::new(capacity),
        })
    }

    pub(crate) fn device(&self) -> &str {
        &self.device
    }

    pub(crate) fn memory(&self) -> &Arc<MemoryTracker> {
        &self.memory
    }

    /// Append a job. Returns once queued.
    pub(crate) fn enqueue(&self, job: Job) -> Result<()> {
        self.pending.send_modify(|n| *n += 1);
        if self.jobs.send(job).is_err() {
            self.pending.send_modify(|n| *n = n.saturating_sub(1));
            return Err(RuntimeError::Transport {
                device: self.device.clone(),
                message: "device stream is closed".into(),
            });
        }
        Ok(())
    }

    /// Remember an asynchronous failure for the next [`Self::drain`].
    pub(crate) fn record_error(&self, error: RuntimeError) {
        warn!(device = %self.device, %error, "device operation failed");
        lock(&self.errors).push(error);
    }

    /// Wait until every queued job has finished, then report the first
    /// failure recorded since the previous drain.
    pub(crate) async fn drain(&self) -> Result<()> {
        let mut rx = self.pending.subscribe();
        rx.wait_for(|n| *n == 0).await.map_err(|_| RuntimeError::Transport {
            device: self.device.clone(),
            message: "device stream terminated".into(),
        })?;
        let mut errors = lock(&self.errors);
        if errors.is_empty() {
            return Ok(());
        }
        let first = errors.remove(0);
        errors.clear();
        Err(first)
    }

    pub(crate) fn inject_fault(&self, reason: impl Into<String>) {
        *lock(&self.fault) = Some(reason.into());
    }

    pub(crate) fn clear_fault(&self) {
        *lock(&self.fault) = None;
    }

    /// Fails if a fault is injected on this device.
    pub(crate) fn check_fault(&self) -> Result<()> {
        match lock(&self.fault).as_ref() {
            Some(reason) => Err(RuntimeError::Execution {
                device: self.device.clone(),
                message: reason.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// All device streams of one client.
pub(crate) struct StreamSet {
    streams: HashMap<String, Arc<DeviceStream>>,
}

impl StreamSet {
    pub(crate) fn new(devices: &[String], capacity: u64, runtime: &Handle) -> Self {
        let streams = devices
            .iter()
            .map(|d| (d.clone(), DeviceStream::spawn(d.clone(), capacity, runtime)))
            .collect();
        Self { streams }
    }

    /// Stream of a local device. Callers check addressability first.
    pub(crate) fn get(&self, device: &str) -> Result<&Arc<DeviceStream>> {
        self.streams
            .get(device)
            .ok_or_else(|| RuntimeError::NotAddressable(device.to_string()))
    }
}
