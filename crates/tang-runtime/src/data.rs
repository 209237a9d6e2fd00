//! Device data handles.
//!
//! A [`DataHandle`] is a shared promise for a device-resident buffer. It is
//! created as a placeholder when work is enqueued and completed exactly once
//! by that work, either with a buffer or with the error that prevented it.
//! Sharded handles own one non-sharded handle per shard.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tang_program::{Literal, Shape};
use tokio::sync::watch;

use crate::coordinator::PublishedValue;
use crate::error::{Result, RuntimeError};
use crate::metrics::{self, MetricsSink};
use crate::sharding::ShardingSpec;
use crate::stream::Allocation;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Observable lifecycle of a handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataState {
    /// Enqueued work has not produced the value yet.
    Placeholder,
    Populated,
    /// The producing operation failed.
    Failed,
    Released,
}

/// A buffer resident on a local device.
#[derive(Debug)]
pub(crate) struct DeviceBuffer {
    literal: Literal,
    _allocation: Allocation,
}

impl DeviceBuffer {
    pub(crate) fn new(literal: Literal, allocation: Allocation) -> Self {
        Self { literal, _allocation: allocation }
    }

    pub(crate) fn literal(&self) -> &Literal {
        &self.literal
    }
}

/// Where a populated value lives.
#[derive(Debug)]
pub(crate) enum Payload {
    Local(DeviceBuffer),
    /// Held by a remote process, published in the coordinator store.
    Remote(PublishedValue),
}

#[derive(Clone, Debug)]
enum Slot {
    Pending,
    Ready(Arc<Payload>),
    Failed(RuntimeError),
    Released,
}

enum Body {
    Single(watch::Sender<Slot>),
    Sharded {
        sharding: ShardingSpec,
        shards: Vec<DataHandle>,
        released: AtomicBool,
    },
}

struct Inner {
    id: u64,
    device: String,
    shape: Shape,
    body: Body,
    metrics: Arc<dyn MetricsSink>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.metrics.counter(metrics::DESTROY_DATA_HANDLES, 1);
    }
}

/// Reference-counted handle to device data. Clones share state.
#[derive(Clone)]
pub struct DataHandle {
    inner: Arc<Inner>,
}

impl DataHandle {
    pub(crate) fn placeholder(
        device: impl Into<String>,
        shape: Shape,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        metrics.counter(metrics::CREATE_DATA_HANDLES, 1);
        Self {
            inner: Arc::new(Inner {
                id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
                device: device.into(),
                shape,
                body: Body::Single(watch::Sender::new(Slot::Pending)),
                metrics,
            }),
        }
    }

    /// Group shards under one logical handle. Callers validate counts and devices.
    pub(crate) fn sharded(
        device: impl Into<String>,
        shape: Shape,
        sharding: ShardingSpec,
        shards: Vec<DataHandle>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        metrics.counter(metrics::CREATE_DATA_HANDLES, 1);
        Self {
            inner: Arc::new(Inner {
                id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
                device: device.into(),
                shape,
                body: Body::Sharded {
                    sharding,
                    shards,
                    released: AtomicBool::new(false),
                },
                metrics,
            }),
        }
    }

    /// Process-unique id.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn device(&self) -> &str {
        &self.inner.device
    }

    pub fn shape(&self) -> &Shape {
        &self.inner.shape
    }

    pub fn has_sharding(&self) -> bool {
        matches!(self.inner.body, Body::Sharded { .. })
    }

    pub fn sharding(&self) -> Option<&ShardingSpec> {
        match &self.inner.body {
            Body::Sharded { sharding, .. } => Some(sharding),
            Body::Single(_) => None,
        }
    }

    /// Per-shard handles; a non-sharded handle is its own single shard.
    pub fn shards(&self) -> Vec<DataHandle> {
        match &self.inner.body {
            Body::Sharded { shards, .. } => shards.clone(),
            Body::Single(_) => vec![self.clone()],
        }
    }

    pub fn state(&self) -> DataState {
        match &self.inner.body {
            Body::Single(slot) => match &*slot.borrow() {
                Slot::Pending => DataState::Placeholder,
                Slot::Ready(_) => DataState::Populated,
                Slot::Failed(_) => DataState::Failed,
                Slot::Released => DataState::Released,
            },
            Body::Sharded { shards, released, .. } => {
                if released.load(Ordering::Acquire) {
                    return DataState::Released;
                }
                let states: Vec<DataState> = shards.iter().map(DataHandle::state).collect();
                if states.contains(&DataState::Released) {
                    DataState::Released
                } else if states.contains(&DataState::Failed) {
                    DataState::Failed
                } else if states.iter().all(|s| *s == DataState::Populated) {
                    DataState::Populated
                } else {
                    DataState::Placeholder
                }
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state(), DataState::Populated | DataState::Failed)
    }

    /// Drop the device buffer now instead of when the last clone goes away.
    ///
    /// Work already holding the buffer keeps it alive until it finishes.
    /// Later reads fail with [`RuntimeError::UseAfterRelease`].
    pub fn release(&self) {
        match &self.inner.body {
            Body::Single(slot) => {
                let was_live = slot.send_if_modified(|s| {
                    if matches!(s, Slot::Released) {
                        false
                    } else {
                        *s = Slot::Released;
                        true
                    }
                });
                if was_live {
                    self.inner.metrics.counter(metrics::RELEASE_DATA_HANDLES, 1);
                }
            }
            Body::Sharded { shards, released, .. } => {
                if !released.swap(true, Ordering::AcqRel) {
                    self.inner.metrics.counter(metrics::RELEASE_DATA_HANDLES, 1);
                    for shard in shards {
                        shard.release();
                    }
                }
            }
        }
    }

    /// Fail fast if this handle (or any shard) was released.
    pub(crate) fn check_live(&self) -> Result<()> {
        if self.state() == DataState::Released {
            return Err(RuntimeError::UseAfterRelease(self.to_string()));
        }
        Ok(())
    }

    /// Complete a placeholder. Only the first completion wins.
    pub(crate) fn populate(&self, payload: Payload) -> bool {
        match &self.inner.body {
            Body::Single(slot) => slot.send_if_modified(move |s| {
                if matches!(s, Slot::Pending) {
                    *s = Slot::Ready(Arc::new(payload));
                    true
                } else {
                    false
                }
            }),
            Body::Sharded { .. } => false,
        }
    }

    /// Complete a placeholder with an error. Only the first completion wins.
    pub(crate) fn fail(&self, error: RuntimeError) -> bool {
        match &self.inner.body {
            Body::Single(slot) => slot.send_if_modified(move |s| {
                if matches!(s, Slot::Pending) {
                    *s = Slot::Failed(error);
                    true
                } else {
                    false
                }
            }),
            Body::Sharded { shards, .. } => {
                let mut any = false;
                for shard in shards {
                    any |= shard.fail(error.clone());
                }
                any
            }
        }
    }

    /// Wait for a non-sharded handle to complete.
    pub(crate) async fn payload(&self) -> Result<Arc<Payload>> {
        let Body::Single(slot) = &self.inner.body else {
            return Err(RuntimeError::ShardConfiguration(format!(
                "{self} is sharded; read its shards instead"
            )));
        };
        let mut rx = slot.subscribe();
        let settled = {
            let guard = rx
                .wait_for(|s| !matches!(s, Slot::Pending))
                .await
                .map_err(|_| RuntimeError::UseAfterRelease(self.to_string()))?;
            guard.clone()
        };
        match settled {
            Slot::Ready(payload) => Ok(payload),
            Slot::Failed(error) => Err(error),
            Slot::Released | Slot::Pending => Err(RuntimeError::UseAfterRelease(self.to_string())),
        }
    }

    /// Wait for a locally resident value and clone it out.
    pub(crate) async fn local_literal(&self) -> Result<Literal> {
        match &*self.payload().await? {
            Payload::Local(buffer) => Ok(buffer.literal().clone()),
            Payload::Remote(_) => Err(RuntimeError::NotAddressable(self.device().to_string())),
        }
    }

    /// Coordinator key under which this handle's value was published for
    /// another process, once the publishing copy has finished.
    pub fn remote_key(&self) -> Option<String> {
        let Body::Single(slot) = &self.inner.body else {
            return None;
        };
        let slot = slot.borrow();
        match &*slot {
            Slot::Ready(payload) => match &**payload {
                Payload::Remote(published) => Some(published.key().to_string()),
                Payload::Local(_) => None,
            },
            _ => None,
        }
    }

    /// Whether both are clones of the same handle.
    pub fn ptr_eq(&self, other: &DataHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Display for DataHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Data(id={}, device={}, shape={}, state={:?}",
            self.inner.id,
            self.inner.device,
            self.inner.shape,
            self.state()
        )?;
        if let Some(sharding) = self.sharding() {
            write!(f, ", sharding={sharding:?}")?;
        }
        write!(f, ")")
    }
}

impl fmt::Debug for DataHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
