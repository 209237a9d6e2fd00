//! Host to device, device to host and device to device movement.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use tang_program::{Literal, Shape};

use crate::coordinator::{CoordinatorClient, CoordinatorFacade, PublishedValue};
use crate::data::{DataHandle, DataState, DeviceBuffer, Payload};
use crate::device::{device_ordinal, DeviceRegistry};
use crate::error::{Result, RuntimeError};
use crate::metrics::{self, MetricsSink};
use crate::sharding::ShardingSpec;
use crate::source::TensorSource;
use crate::stream::{Allocation, DeviceStream, StreamSet};

/// Reserve `bytes` on `stream`'s device.
pub(crate) fn allocate(stream: &DeviceStream, bytes: u64) -> Result<Allocation> {
    stream.memory().allocate(bytes).ok_or_else(|| RuntimeError::Transport {
        device: stream.device().to_string(),
        message: format!(
            "out of device memory: {bytes} bytes requested, {} KiB free",
            stream.memory().info().kb_free
        ),
    })
}

/// Store `literal` on `stream`'s device and complete `handle` with it.
///
/// Exceeding the device budget fails the handle and is reported by the next
/// drain of the stream.
pub(crate) fn commit(stream: &DeviceStream, handle: &DataHandle, literal: Literal) {
    match allocate(stream, literal.byte_size() as u64) {
        Ok(allocation) => {
            handle.populate(Payload::Local(DeviceBuffer::new(literal, allocation)));
        }
        Err(error) => {
            handle.fail(error.clone());
            stream.record_error(error);
        }
    }
}

/// Read a settled payload, pulling remote values from the coordinator store.
/// Pull failures are transport errors on `handle`'s device.
async fn pull(handle: &DataHandle, payload: &Payload, timeout: Duration) -> Result<Literal> {
    match payload {
        Payload::Local(buffer) => Ok(buffer.literal().clone()),
        Payload::Remote(published) => {
            let key = published.key();
            let pulled = async {
                let bytes = published.client().wait_at_key(key, timeout).await?;
                Ok::<Literal, RuntimeError>(postcard::from_bytes(&bytes)?)
            }
            .await;
            pulled.map_err(|e| RuntimeError::Transport {
                device: handle.device().to_string(),
                message: format!("pulling remote value {key:?}: {e}"),
            })
        }
    }
}

/// Wait for a non-sharded handle and read its value.
async fn fetch(handle: &DataHandle, timeout: Duration) -> Result<Literal> {
    let payload = handle.payload().await?;
    pull(handle, &payload, timeout).await
}

/// A validated single-buffer copy, ready to queue.
enum CopyPlan {
    /// Into a local device, on the destination's stream.
    Local { src: DataHandle, dst: String, stream: Arc<DeviceStream> },
    /// Out to another process, on the source's stream.
    Publish {
        src: DataHandle,
        dst: String,
        stream: Arc<DeviceStream>,
        client: Arc<CoordinatorClient>,
    },
}

fn distinct_devices<'a>(devices: impl IntoIterator<Item = &'a str>) -> Result<()> {
    let mut seen = HashSet::new();
    for device in devices {
        if !seen.insert(device) {
            return Err(RuntimeError::ShardConfiguration(format!(
                "device {device} holds more than one shard"
            )));
        }
    }
    Ok(())
}

/// Moves data between the host and this client's devices.
pub struct TransferService {
    registry: Arc<DeviceRegistry>,
    streams: Arc<StreamSet>,
    coordinator: Arc<CoordinatorFacade>,
    metrics: Arc<dyn MetricsSink>,
    remote_timeout: Duration,
}

impl TransferService {
    pub(crate) fn new(
        registry: Arc<DeviceRegistry>,
        streams: Arc<StreamSet>,
        coordinator: Arc<CoordinatorFacade>,
        metrics: Arc<dyn MetricsSink>,
        remote_timeout: Duration,
    ) -> Self {
        Self { registry, streams, coordinator, metrics, remote_timeout }
    }

    /// An empty handle on a local device, populated later by
    /// [`Self::populate_placeholder`].
    pub fn create_placeholder(&self, device: &str, shape: Shape) -> Result<DataHandle> {
        self.registry.check_local(device)?;
        Ok(DataHandle::placeholder(device, shape, Arc::clone(&self.metrics)))
    }

    /// Upload `source` into a handle from [`Self::create_placeholder`].
    pub fn populate_placeholder(&self, handle: &DataHandle, source: &dyn TensorSource) -> Result<()> {
        if handle.has_sharding() {
            return Err(RuntimeError::ShardConfiguration(
                "populate the shards of a sharded handle individually".into(),
            ));
        }
        match handle.state() {
            DataState::Placeholder => {}
            DataState::Released => return Err(RuntimeError::UseAfterRelease(handle.to_string())),
            _ => {
                return Err(RuntimeError::InvalidSource(format!("{handle} is already populated")))
            }
        }
        if source.device() != handle.device() {
            return Err(RuntimeError::DeviceMismatch {
                expected: handle.device().to_string(),
                got: source.device().to_string(),
            });
        }
        if source.shape() != handle.shape() {
            return Err(RuntimeError::InvalidSource(format!(
                "source shape {} does not match {}",
                source.shape(),
                handle.shape()
            )));
        }
        let literal = self.stage(source)?;
        let stream = self.streams.get(handle.device())?;
        self.metrics.counter(metrics::INBOUND_DATA, literal.byte_size() as u64);
        // Committed inline: queued runs on this stream may already be
        // waiting for this handle.
        commit(stream, handle, literal);
        Ok(())
    }

    /// Validate a source and copy its bytes off the caller's buffer.
    fn stage(&self, source: &dyn TensorSource) -> Result<Literal> {
        self.registry.check_local(source.device())?;
        let shape = source.shape();
        if shape.is_tuple() {
            return Err(RuntimeError::InvalidSource(format!(
                "tuple shape {shape} cannot be uploaded as one buffer"
            )));
        }
        let data = source.data();
        if data.len() != shape.byte_size() {
            return Err(RuntimeError::InvalidSource(format!(
                "{shape} needs {} bytes, source has {}",
                shape.byte_size(),
                data.len()
            )));
        }
        Literal::from_raw(shape, data.to_vec()).map_err(|e| RuntimeError::InvalidSource(e.to_string()))
    }

    /// Upload host buffers. Handles are returned once the uploads are
    /// queued, in source order. Every source is validated before any upload
    /// is queued.
    pub fn transfer_to_server(&self, sources: &[&dyn TensorSource]) -> Result<Vec<DataHandle>> {
        let start = Instant::now();
        let mut staged = Vec::with_capacity(sources.len());
        for source in sources {
            let literal = self.stage(*source)?;
            let stream = Arc::clone(self.streams.get(source.device())?);
            staged.push((source.device().to_string(), literal, stream));
        }

        let mut handles = Vec::with_capacity(staged.len());
        let mut bytes = 0u64;
        for (device, literal, stream) in staged {
            bytes += literal.byte_size() as u64;
            let handle = DataHandle::placeholder(device, literal.shape(), Arc::clone(&self.metrics));
            let out = handle.clone();
            let worker = Arc::clone(&stream);
            stream.enqueue(
                async move {
                    commit(&worker, &out, literal);
                }
                .boxed(),
            )?;
            handles.push(handle);
        }

        self.metrics.counter(metrics::INBOUND_DATA, bytes);
        self.metrics.timing(metrics::TRANSFER_TO_SERVER, start.elapsed());
        Ok(handles)
    }

    /// Upload per-shard host buffers as one sharded handle owned by `device`.
    pub fn transfer_shards_to_server(
        &self,
        shards: &[&dyn TensorSource],
        device: &str,
        shape: Shape,
        sharding: ShardingSpec,
    ) -> Result<DataHandle> {
        sharding.check_shard_count(shards.len())?;
        device_ordinal(device)?;
        distinct_devices(shards.iter().map(|s| s.device()))?;
        let shard_shape = sharding.shard_shape(&shape)?;
        for (i, shard) in shards.iter().enumerate() {
            if *shard.shape() != shard_shape {
                return Err(RuntimeError::ShardConfiguration(format!(
                    "shard {i} has shape {}, expected {shard_shape}",
                    shard.shape()
                )));
            }
        }
        let handles = self.transfer_to_server(shards)?;
        Ok(DataHandle::sharded(device, shape, sharding, handles, Arc::clone(&self.metrics)))
    }

    /// Read values back to the host, waiting for pending work. Sharded
    /// handles are assembled into their logical value.
    pub async fn transfer_from_server(&self, handles: &[DataHandle]) -> Result<Vec<Literal>> {
        let start = Instant::now();
        for handle in handles {
            handle.check_live()?;
        }
        let mut literals = Vec::with_capacity(handles.len());
        for handle in handles {
            let literal = match handle.sharding() {
                Some(sharding) => {
                    let mut parts = Vec::new();
                    for shard in handle.shards() {
                        parts.push(fetch(&shard, self.remote_timeout).await?);
                    }
                    sharding.assemble(handle.shape(), parts)?
                }
                None => fetch(handle, self.remote_timeout).await?,
            };
            literals.push(literal);
        }

        let bytes: usize = literals.iter().map(Literal::byte_size).sum();
        self.metrics.counter(metrics::OUTBOUND_DATA, bytes as u64);
        self.metrics.timing(metrics::TRANSFER_FROM_SERVER, start.elapsed());
        Ok(literals)
    }

    /// Copy a handle to `dst`.
    ///
    /// Copies between processes go through the coordinator store: pushing to
    /// a remote device publishes the value, pulling from a remote handle reads
    /// it back. A sharded handle is copied shard by shard onto the same
    /// devices and keeps its sharding; `dst` then names the owning virtual
    /// device and must not be a single physical device.
    pub fn copy_to_device(&self, handle: &DataHandle, dst: &str) -> Result<DataHandle> {
        handle.check_live()?;
        if handle.has_sharding() {
            device_ordinal(dst)?;
            if self.registry.contains(dst) {
                return Err(RuntimeError::ShardConfiguration(format!(
                    "sharded {handle} cannot be copied onto the single device {dst}"
                )));
            }
            let devices: Vec<String> = handle.shards().iter().map(|s| s.device().to_string()).collect();
            return self.copy_shards(handle, &devices, dst);
        }
        let plan = self.plan_copy(handle, dst)?;
        self.issue_copy(plan)
    }

    /// Copy shard `j` of a sharded handle to `devices[j]` and wrap the
    /// copies with the same sharding and owner. Every shard copy is validated
    /// before any is queued.
    pub fn copy_shards_to_devices(&self, handle: &DataHandle, devices: &[String]) -> Result<DataHandle> {
        handle.check_live()?;
        self.copy_shards(handle, devices, handle.device())
    }

    fn copy_shards(&self, handle: &DataHandle, devices: &[String], owner: &str) -> Result<DataHandle> {
        let sharding = handle
            .sharding()
            .cloned()
            .ok_or_else(|| RuntimeError::ShardConfiguration(format!("{handle} is not sharded")))?;
        let shards = handle.shards();
        if devices.len() != shards.len() {
            return Err(RuntimeError::ShardCountMismatch {
                expected: shards.len(),
                got: devices.len(),
            });
        }
        distinct_devices(devices.iter().map(String::as_str))?;
        let plans = shards
            .iter()
            .zip(devices)
            .map(|(shard, dst)| self.plan_copy(shard, dst))
            .collect::<Result<Vec<_>>>()?;
        let copies = plans
            .into_iter()
            .map(|plan| self.issue_copy(plan))
            .collect::<Result<Vec<_>>>()?;
        Ok(DataHandle::sharded(
            owner,
            handle.shape().clone(),
            sharding,
            copies,
            Arc::clone(&self.metrics),
        ))
    }

    fn plan_copy(&self, handle: &DataHandle, dst: &str) -> Result<CopyPlan> {
        handle.check_live()?;
        let src_process = self.registry.process_of(handle.device())?;
        let dst_process = self.registry.process_of(dst)?;
        let cross_host = src_process != dst_process;
        let src = handle.clone();
        let dst = dst.to_string();

        if self.registry.is_local(&dst) {
            if cross_host {
                self.coordinator.client()?;
            }
            let stream = Arc::clone(self.streams.get(&dst)?);
            return Ok(CopyPlan::Local { src, dst, stream });
        }
        if !self.registry.is_local(handle.device()) {
            return Err(RuntimeError::NotAddressable(handle.device().to_string()));
        }
        let client = self.coordinator.client()?;
        let stream = Arc::clone(self.streams.get(handle.device())?);
        Ok(CopyPlan::Publish { src, dst, stream, client })
    }

    fn issue_copy(&self, plan: CopyPlan) -> Result<DataHandle> {
        let timeout = self.remote_timeout;
        match plan {
            CopyPlan::Local { src, dst, stream } => {
                let out = DataHandle::placeholder(dst, src.shape().clone(), Arc::clone(&self.metrics));
                let result = out.clone();
                let worker = Arc::clone(&stream);
                stream.enqueue(
                    async move {
                        // A failed source was reported by its producer.
                        let payload = match src.payload().await {
                            Ok(payload) => payload,
                            Err(error) => {
                                result.fail(error);
                                return;
                            }
                        };
                        match pull(&src, &payload, timeout).await {
                            Ok(literal) => commit(&worker, &result, literal),
                            Err(error) => {
                                result.fail(error.clone());
                                worker.record_error(error);
                            }
                        }
                    }
                    .boxed(),
                )?;
                Ok(out)
            }
            CopyPlan::Publish { src, dst, stream, client } => {
                let out = DataHandle::placeholder(dst.clone(), src.shape().clone(), Arc::clone(&self.metrics));
                let key = format!("copy/p{}/{}", self.registry.process_index(), out.id());
                let result = out.clone();
                let worker = Arc::clone(&stream);
                stream.enqueue(
                    async move {
                        let pushed = async {
                            let literal = src.local_literal().await?;
                            let bytes = postcard::to_allocvec(&literal)?;
                            client.key_value_set(&key, bytes).await?;
                            Ok::<_, RuntimeError>(())
                        }
                        .await;
                        match pushed {
                            Ok(()) => {
                                result.populate(Payload::Remote(PublishedValue::new(key, client)));
                            }
                            Err(e) => {
                                let error = RuntimeError::Transport { device: dst, message: e.to_string() };
                                result.fail(error.clone());
                                worker.record_error(error);
                            }
                        }
                    }
                    .boxed(),
                )?;
                Ok(out)
            }
        }
    }

    /// Receive a value another process published with
    /// [`Self::copy_to_device`]. `key` is the publisher's
    /// [`DataHandle::remote_key`]; the returned handle completes once the
    /// value arrives on `device`.
    pub fn import_remote(&self, key: &str, device: &str, shape: Shape) -> Result<DataHandle> {
        self.registry.check_local(device)?;
        let client = self.coordinator.client()?;
        let stream = Arc::clone(self.streams.get(device)?);
        let out = DataHandle::placeholder(device, shape, Arc::clone(&self.metrics));

        let result = out.clone();
        let worker = Arc::clone(&stream);
        let key = key.to_string();
        let timeout = self.remote_timeout;
        stream.enqueue(
            async move {
                let received = async {
                    let bytes = client.wait_at_key(&key, timeout).await?;
                    let literal: Literal = postcard::from_bytes(&bytes)?;
                    if &literal.shape() != result.shape() {
                        return Err(RuntimeError::InvalidSource(format!(
                            "remote value {key:?} has shape {}, expected {}",
                            literal.shape(),
                            result.shape()
                        )));
                    }
                    Ok::<_, RuntimeError>(literal)
                }
                .await;
                match received {
                    Ok(literal) => commit(&worker, &result, literal),
                    Err(e) => {
                        let error = RuntimeError::Transport {
                            device: worker.device().to_string(),
                            message: e.to_string(),
                        };
                        result.fail(error.clone());
                        worker.record_error(error);
                    }
                }
            }
            .boxed(),
        )?;
        Ok(out)
    }

    /// Per-shard handles; a non-sharded handle is its own only shard.
    pub fn get_data_shards(&self, handle: &DataHandle) -> Vec<DataHandle> {
        handle.shards()
    }

    pub fn get_data_shard(&self, handle: &DataHandle, index: usize) -> Result<DataHandle> {
        let shards = handle.shards();
        let count = shards.len();
        shards.into_iter().nth(index).ok_or_else(|| {
            RuntimeError::ShardConfiguration(format!("shard {index} out of range for {count} shards"))
        })
    }

    pub fn get_data_sharding(&self, handle: &DataHandle) -> Option<ShardingSpec> {
        handle.sharding().cloned()
    }

    /// Group existing single-device handles into one sharded handle.
    pub fn wrap_data_shards(
        &self,
        shards: Vec<DataHandle>,
        device: &str,
        shape: Shape,
        sharding: ShardingSpec,
    ) -> Result<DataHandle> {
        if shards.len() != sharding.num_shards() {
            return Err(RuntimeError::ShardConfiguration(format!(
                "{} shards for a spec of {}",
                shards.len(),
                sharding.num_shards()
            )));
        }
        device_ordinal(device)?;
        if let Some(nested) = shards.iter().find(|s| s.has_sharding()) {
            return Err(RuntimeError::ShardConfiguration(format!(
                "{nested} is itself sharded"
            )));
        }
        distinct_devices(shards.iter().map(DataHandle::device))?;
        for shard in &shards {
            shard.check_live()?;
        }
        Ok(DataHandle::sharded(device, shape, sharding, shards, Arc::clone(&self.metrics)))
    }
}

#[cfg(test)]
mod tests {
    use tang_program::DType;
    use tokio::runtime::Handle;

    use super::*;
    use crate::config::ClientConfig;
    use crate::device::SPMD_DEVICE;
    use crate::metrics::NoopMetrics;
    use crate::source::LiteralSource;

    fn service(config: &ClientConfig) -> TransferService {
        service_with(
            config,
            Arc::new(CoordinatorFacade::new(Duration::from_secs(1))),
            Duration::from_secs(1),
        )
    }

    fn service_with(
        config: &ClientConfig,
        coordinator: Arc<CoordinatorFacade>,
        remote_timeout: Duration,
    ) -> TransferService {
        let registry = Arc::new(DeviceRegistry::from_config(config).unwrap());
        let streams = Arc::new(StreamSet::new(
            registry.local_devices(),
            config.device_memory_bytes,
            &Handle::current(),
        ));
        TransferService::new(registry, streams, coordinator, Arc::new(NoopMetrics), remote_timeout)
    }

    fn src(values: &[f32], device: &str) -> LiteralSource {
        LiteralSource::new(Literal::from_slice(&[values.len()], values), device).unwrap()
    }

    #[tokio::test]
    async fn upload_and_read_back() {
        let svc = service(&ClientConfig::local(2));
        assert!(svc.transfer_to_server(&[]).unwrap().is_empty());

        let a = src(&[1.0, 2.0], "CPU:0");
        let b = src(&[3.0], "CPU:1");
        let handles = svc.transfer_to_server(&[&a, &b]).unwrap();
        assert_eq!(handles[0].device(), "CPU:0");
        assert_eq!(handles[1].shape(), &Shape::array(DType::F32, &[1]));

        let back = svc.transfer_from_server(&handles).await.unwrap();
        assert_eq!(back[0], *a.literal());
        assert_eq!(back[1], *b.literal());
        assert!(handles.iter().all(|h| h.state() == DataState::Populated));
    }

    #[tokio::test]
    async fn validation_happens_before_anything_is_queued() {
        let svc = service(&ClientConfig::local(2));
        let ok = src(&[1.0], "CPU:0");
        let bad = src(&[1.0], "CPU:9");
        assert_eq!(
            svc.transfer_to_server(&[&ok, &bad]).unwrap_err(),
            RuntimeError::UnknownDevice("CPU:9".into())
        );
        let garbage = src(&[1.0], "nonsense");
        assert!(matches!(
            svc.transfer_to_server(&[&garbage]),
            Err(RuntimeError::InvalidDeviceString(_))
        ));
        assert_eq!(svc.streams.get("CPU:0").unwrap().memory().live_buffers(), 0);
    }

    #[tokio::test]
    async fn out_of_memory_fails_the_handle() {
        let svc = service(&ClientConfig::local(1).with_device_memory(8));
        let big = src(&[0.0; 4], "CPU:0");
        let handles = svc.transfer_to_server(&[&big]).unwrap();
        let err = svc.transfer_from_server(&handles).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Transport { ref device, .. } if device == "CPU:0"), "{err}");
        assert_eq!(handles[0].state(), DataState::Failed);
        // The same failure is reported once by the stream drain.
        assert!(svc.streams.get("CPU:0").unwrap().drain().await.is_err());
        assert!(svc.streams.get("CPU:0").unwrap().drain().await.is_ok());
    }

    #[tokio::test]
    async fn released_handles_cannot_be_read() {
        let svc = service(&ClientConfig::local(1));
        let a = src(&[1.0], "CPU:0");
        let h = svc.transfer_to_server(&[&a]).unwrap().remove(0);
        h.release();
        assert!(matches!(
            svc.transfer_from_server(&[h.clone()]).await,
            Err(RuntimeError::UseAfterRelease(_))
        ));
        assert!(matches!(svc.copy_to_device(&h, "CPU:0"), Err(RuntimeError::UseAfterRelease(_))));
    }

    #[tokio::test]
    async fn placeholder_then_populate() {
        let svc = Arc::new(service(&ClientConfig::local(2)));
        let shape = Shape::array(DType::F32, &[2]);
        let h = svc.create_placeholder("CPU:1", shape).unwrap();
        assert_eq!(h.state(), DataState::Placeholder);

        let reader = {
            let svc = Arc::clone(&svc);
            let h = h.clone();
            tokio::spawn(async move { svc.transfer_from_server(&[h]).await })
        };

        let wrong_device = src(&[1.0, 2.0], "CPU:0");
        assert!(matches!(
            svc.populate_placeholder(&h, &wrong_device),
            Err(RuntimeError::DeviceMismatch { .. })
        ));
        let wrong_shape = src(&[1.0], "CPU:1");
        assert!(matches!(
            svc.populate_placeholder(&h, &wrong_shape),
            Err(RuntimeError::InvalidSource(_))
        ));

        let value = src(&[5.0, 6.0], "CPU:1");
        svc.populate_placeholder(&h, &value).unwrap();
        let back = reader.await.unwrap().unwrap();
        assert_eq!(back[0], *value.literal());
        assert!(matches!(
            svc.populate_placeholder(&h, &value),
            Err(RuntimeError::InvalidSource(_))
        ));
        assert!(svc.create_placeholder("CPU:5", Shape::scalar(DType::F32)).is_err());
    }

    #[tokio::test]
    async fn local_copy_preserves_value() {
        let svc = service(&ClientConfig::local(2));
        let a = src(&[7.0, 8.0, 9.0], "CPU:0");
        let h = svc.transfer_to_server(&[&a]).unwrap().remove(0);
        let copy = svc.copy_to_device(&h, "CPU:1").unwrap();
        assert_eq!(copy.device(), "CPU:1");
        assert_eq!(copy.shape(), h.shape());
        assert!(!copy.has_sharding());
        let back = svc.transfer_from_server(&[copy]).await.unwrap();
        assert_eq!(back[0], *a.literal());
    }

    #[tokio::test]
    async fn cross_host_copy_needs_coordinator() {
        let svc = service(&ClientConfig::process(0, 2, 2));
        let a = src(&[1.0], "CPU:0");
        let h = svc.transfer_to_server(&[&a]).unwrap().remove(0);
        assert_eq!(svc.copy_to_device(&h, "CPU:2").unwrap_err(), RuntimeError::CoordinatorNotInitialized);
        assert_eq!(svc.copy_to_device(&h, "CPU:9").unwrap_err(), RuntimeError::UnknownDevice("CPU:9".into()));
    }

    #[tokio::test]
    async fn failed_pull_is_reported_as_transport_error() {
        let facade = Arc::new(CoordinatorFacade::new(Duration::from_secs(5)));
        facade.initialize(0, 1, "127.0.0.1", 0).await.unwrap();
        let svc = service_with(
            &ClientConfig::process(0, 2, 2),
            Arc::clone(&facade),
            Duration::from_millis(50),
        );
        // A handle whose value was published by process 1 but never arrived.
        let remote = DataHandle::placeholder("CPU:2", Shape::array(DType::F32, &[1]), Arc::new(NoopMetrics));
        remote.populate(Payload::Remote(PublishedValue::new(
            "copy/p1/404".into(),
            facade.client().unwrap(),
        )));

        let copy = svc.copy_to_device(&remote, "CPU:1").unwrap();
        let err = svc.transfer_from_server(&[copy.clone()]).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Transport { ref device, .. } if device == "CPU:2"), "{err}");
        assert_eq!(copy.state(), DataState::Failed);
        assert!(matches!(
            svc.streams.get("CPU:1").unwrap().drain().await,
            Err(RuntimeError::Transport { .. })
        ));
        assert!(svc.streams.get("CPU:1").unwrap().drain().await.is_ok());
        assert!(matches!(
            svc.transfer_from_server(&[remote]).await,
            Err(RuntimeError::Transport { .. })
        ));
    }

    #[tokio::test]
    async fn copying_a_failed_source_fails_the_copy() {
        let svc = service(&ClientConfig::local(2));
        let h = svc.create_placeholder("CPU:0", Shape::array(DType::F32, &[1])).unwrap();
        let copy = svc.copy_to_device(&h, "CPU:1").unwrap();
        let cause = RuntimeError::Execution { device: "CPU:0".into(), message: "ecc".into() };
        h.fail(cause.clone());
        assert_eq!(svc.transfer_from_server(&[copy]).await.unwrap_err(), cause);
    }

    #[tokio::test]
    async fn sharded_copy_keeps_sharding() {
        let svc = service(&ClientConfig::local(4));
        let value = Literal::from_slice(&[4], &[1.0f32, 2.0, 3.0, 4.0]);
        let spec = ShardingSpec::tiled(&[2], &[0, 1]).unwrap();
        let parts: Vec<LiteralSource> = spec
            .split(&value)
            .unwrap()
            .into_iter()
            .enumerate()
            .map(|(i, l)| LiteralSource::new(l, format!("CPU:{i}")).unwrap())
            .collect();
        let refs: Vec<&dyn TensorSource> = parts.iter().map(|p| p as &dyn TensorSource).collect();
        let sharded = svc
            .transfer_shards_to_server(&refs, SPMD_DEVICE, value.shape(), spec.clone())
            .unwrap();

        let copy = svc.copy_to_device(&sharded, SPMD_DEVICE).unwrap();
        assert_eq!(copy.device(), SPMD_DEVICE);
        assert_eq!(copy.shape(), sharded.shape());
        assert_eq!(copy.sharding(), Some(&spec));
        let (old, new) = (sharded.shards(), copy.shards());
        for (a, b) in old.iter().zip(&new) {
            assert_eq!(a.device(), b.device());
            assert!(!a.ptr_eq(b));
        }

        let moved = svc
            .copy_shards_to_devices(&sharded, &["CPU:2".into(), "CPU:3".into()])
            .unwrap();
        let devices: Vec<String> = moved.shards().iter().map(|s| s.device().to_string()).collect();
        assert_eq!(devices, ["CPU:2", "CPU:3"]);
        assert_eq!(moved.sharding(), Some(&spec));

        let back = svc.transfer_from_server(&[copy, moved]).await.unwrap();
        assert_eq!(back[0], value);
        assert_eq!(back[1], value);

        assert!(matches!(
            svc.copy_to_device(&sharded, "CPU:0"),
            Err(RuntimeError::ShardConfiguration(_))
        ));
        assert_eq!(
            svc.copy_shards_to_devices(&sharded, &["CPU:2".into()]).unwrap_err(),
            RuntimeError::ShardCountMismatch { expected: 2, got: 1 }
        );
        assert!(matches!(
            svc.copy_shards_to_devices(&sharded, &["CPU:2".into(), "CPU:2".into()]),
            Err(RuntimeError::ShardConfiguration(_))
        ));
        let plain = svc.transfer_to_server(&[refs[0]]).unwrap().remove(0);
        assert!(matches!(
            svc.copy_shards_to_devices(&plain, &["CPU:1".into()]),
            Err(RuntimeError::ShardConfiguration(_))
        ));
    }

    #[tokio::test]
    async fn shard_wrap_and_unwrap() {
        let svc = service(&ClientConfig::local(2));
        let value = Literal::from_slice(&[4], &[1.0f32, 2.0, 3.0, 4.0]);
        let spec = ShardingSpec::tiled(&[2], &[0, 1]).unwrap();
        let parts: Vec<LiteralSource> = spec
            .split(&value)
            .unwrap()
            .into_iter()
            .enumerate()
            .map(|(i, l)| LiteralSource::new(l, format!("CPU:{i}")).unwrap())
            .collect();
        let refs: Vec<&dyn TensorSource> = parts.iter().map(|p| p as &dyn TensorSource).collect();

        let sharded = svc
            .transfer_shards_to_server(&refs, SPMD_DEVICE, value.shape(), spec.clone())
            .unwrap();
        assert_eq!(svc.get_data_sharding(&sharded), Some(spec.clone()));
        let shards = svc.get_data_shards(&sharded);
        assert_eq!(shards.len(), 2);
        assert!(shards.iter().all(|s| !s.has_sharding()));
        assert!(svc.get_data_shard(&sharded, 1).unwrap().ptr_eq(&shards[1]));
        assert!(svc.get_data_shard(&sharded, 2).is_err());

        let rewrapped = svc
            .wrap_data_shards(shards.clone(), SPMD_DEVICE, value.shape(), spec.clone())
            .unwrap();
        assert_eq!(rewrapped.shape(), sharded.shape());
        assert_eq!(rewrapped.sharding(), sharded.sharding());
        assert!(svc.get_data_shards(&rewrapped).iter().zip(&shards).all(|(a, b)| a.ptr_eq(b)));

        let back = svc.transfer_from_server(&[sharded, rewrapped]).await.unwrap();
        assert_eq!(back[0], value);
        assert_eq!(back[1], value);

        let plain = svc.transfer_to_server(&[refs[0]]).unwrap().remove(0);
        let alone = svc.get_data_shards(&plain);
        assert_eq!(alone.len(), 1);
        assert!(alone[0].ptr_eq(&plain));
    }

    #[tokio::test]
    async fn shard_validation() {
        let svc = service(&ClientConfig::local(2));
        let spec = ShardingSpec::Replicated { num_devices: 2 };
        let a = src(&[1.0], "CPU:0");
        let also_cpu0 = src(&[1.0], "CPU:0");
        let shape = Shape::array(DType::F32, &[1]);

        assert_eq!(
            svc.transfer_shards_to_server(&[&a], SPMD_DEVICE, shape.clone(), spec.clone())
                .unwrap_err(),
            RuntimeError::ShardCountMismatch { expected: 2, got: 1 }
        );
        assert!(matches!(
            svc.transfer_shards_to_server(&[&a, &also_cpu0], SPMD_DEVICE, shape.clone(), spec.clone()),
            Err(RuntimeError::ShardConfiguration(_))
        ));

        let hs = svc.transfer_to_server(&[&a, &also_cpu0]).unwrap();
        assert!(matches!(
            svc.wrap_data_shards(hs.clone(), SPMD_DEVICE, shape.clone(), spec.clone()),
            Err(RuntimeError::ShardConfiguration(_))
        ));
        assert!(matches!(
            svc.wrap_data_shards(vec![hs[0].clone()], SPMD_DEVICE, shape, spec),
            Err(RuntimeError::ShardConfiguration(_))
        ));
    }
}
