//! Running compiled computations on device streams.
//!
//! Launching is synchronous: arguments are validated and the run is queued on
//! the target stream before the call returns. The run itself waits for its
//! arguments, evaluates, and completes the output handles. Failures after
//! launch land in the output handles and the stream's error log.
//!
//! The replicas of one replicated call meet at a [`ReplicaGate`]. Each replica
//! deposits its result and holds its stream until the last one arrives, which
//! then commits every output or fails them all.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures_util::FutureExt;
use tang_program::{Literal, Shape};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::compile::Executable;
use crate::computation::{Computation, ExecuteOptions};
use crate::data::{DataHandle, DeviceBuffer, Payload};
use crate::device::DeviceRegistry;
use crate::error::{Result, RuntimeError};
use crate::metrics::{self, MetricsSink};
use crate::stream::{DeviceStream, StreamSet};
use crate::sync::lock;
use crate::transfer::{allocate, commit};

/// Why a queued run produced no value.
enum RunFailure {
    /// An argument completed with an error its producer already reported.
    Argument(RuntimeError),
    Device(RuntimeError),
}

impl RunFailure {
    fn into_error(self) -> RuntimeError {
        match self {
            Self::Argument(e) | Self::Device(e) => e,
        }
    }
}

/// Wait for `args`, then evaluate on `worker`'s device.
async fn run(
    exec: &Executable,
    args: Vec<DataHandle>,
    worker: &DeviceStream,
    explode: bool,
) -> std::result::Result<Vec<Literal>, RunFailure> {
    let mut literals = Vec::with_capacity(args.len());
    for arg in &args {
        literals.push(arg.local_literal().await.map_err(RunFailure::Argument)?);
    }
    drop(args);

    worker.check_fault().map_err(RunFailure::Device)?;
    let value = exec.run(literals).map_err(|e| {
        RunFailure::Device(RuntimeError::Execution {
            device: worker.device().to_string(),
            message: e.to_string(),
        })
    })?;
    Ok(if explode && value.is_tuple() {
        value.decompose_tuple()
    } else {
        vec![value]
    })
}

fn fail_all(outputs: &[DataHandle], error: &RuntimeError) {
    for out in outputs {
        out.fail(error.clone());
    }
}

fn replicated_error(failures: &[(String, RuntimeError)]) -> RuntimeError {
    RuntimeError::ReplicatedExecution {
        devices: failures.iter().map(|(d, _)| d.clone()).collect(),
        message: failures
            .iter()
            .map(|(d, e)| format!("{d}: {e}"))
            .collect::<Vec<_>>()
            .join("; "),
    }
}

struct Replica {
    stream: Arc<DeviceStream>,
    outputs: Vec<DataHandle>,
    result: Option<Result<Vec<Literal>>>,
}

struct GateState {
    remaining: usize,
    /// Launch failed and the caller already has the error.
    abandoned: bool,
    replicas: Vec<Replica>,
}

/// Settle point shared by every replica of one replicated call.
struct ReplicaGate {
    computation: String,
    state: Mutex<GateState>,
    settled: watch::Sender<bool>,
}

impl ReplicaGate {
    fn new(computation: &str, replicas: Vec<(Arc<DeviceStream>, Vec<DataHandle>)>) -> Arc<Self> {
        let replicas: Vec<Replica> = replicas
            .into_iter()
            .map(|(stream, outputs)| Replica { stream, outputs, result: None })
            .collect();
        Arc::new(Self {
            computation: computation.to_string(),
            state: Mutex::new(GateState {
                remaining: replicas.len(),
                abandoned: false,
                replicas,
            }),
            settled: watch::Sender::new(false),
        })
    }

    /// Record replica `index`. Returns whether it was the last to arrive.
    fn deposit(&self, index: usize, result: Result<Vec<Literal>>) -> bool {
        let mut state = lock(&self.state);
        state.replicas[index].result = Some(result);
        state.remaining -= 1;
        state.remaining == 0
    }

    /// Deposit, then wait until every replica has settled.
    async fn finish(&self, index: usize, result: Result<Vec<Literal>>) {
        if self.deposit(index, result) {
            self.settle();
        }
        let mut settled = self.settled.subscribe();
        // `self` owns the sender, so the channel stays open.
        let _ = settled.wait_for(|done| *done).await;
    }

    /// Fail replicas `from..` that were never queued.
    fn abandon(&self, from: usize, error: &RuntimeError) {
        let last = {
            let mut state = lock(&self.state);
            state.abandoned = true;
            for index in from..state.replicas.len() {
                state.replicas[index].result = Some(Err(error.clone()));
                state.remaining -= 1;
            }
            state.remaining == 0
        };
        if last {
            self.settle();
        }
    }

    /// Commit every output if every replica succeeded and fits in memory;
    /// otherwise fail every output with one error naming the failed devices.
    fn settle(&self) {
        let (mut replicas, abandoned) = {
            let mut state = lock(&self.state);
            (std::mem::take(&mut state.replicas), state.abandoned)
        };

        let mut failures = Vec::new();
        let mut staged = Vec::new();
        for replica in &mut replicas {
            let device = replica.stream.device().to_string();
            match replica.result.take() {
                Some(Ok(parts)) if failures.is_empty() => {
                    for (out, part) in replica.outputs.iter().zip(parts) {
                        match allocate(&replica.stream, part.byte_size() as u64) {
                            Ok(allocation) => staged.push((out.clone(), part, allocation)),
                            Err(e) => {
                                failures.push((device, e));
                                break;
                            }
                        }
                    }
                }
                Some(Err(e)) => failures.push((device, e)),
                Some(Ok(_)) | None => {}
            }
        }

        if failures.is_empty() {
            for (out, literal, allocation) in staged {
                out.populate(Payload::Local(DeviceBuffer::new(literal, allocation)));
            }
        } else {
            drop(staged);
            let error = replicated_error(&failures);
            warn!(
                computation = %self.computation,
                failed = ?failures.iter().map(|(d, _)| d.as_str()).collect::<Vec<_>>(),
                num_devices = replicas.len(),
                "replicated execution failed"
            );
            for replica in &replicas {
                fail_all(&replica.outputs, &error);
                if !abandoned {
                    replica.stream.record_error(error.clone());
                }
            }
        }
        self.settled.send_replace(true);
    }
}

/// Executes computations on this client's devices.
pub struct ExecutionEngine {
    registry: Arc<DeviceRegistry>,
    streams: Arc<StreamSet>,
    metrics: Arc<dyn MetricsSink>,
    /// Held while queueing replicas so every stream sees replicated calls
    /// in the same order.
    replicated_launch: Mutex<()>,
}

impl ExecutionEngine {
    pub(crate) fn new(
        registry: Arc<DeviceRegistry>,
        streams: Arc<StreamSet>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self { registry, streams, metrics, replicated_launch: Mutex::new(()) }
    }

    /// Run `computation` on one device. Every argument must live on `device`.
    pub fn execute_computation(
        &self,
        computation: &Computation,
        arguments: &[DataHandle],
        device: &str,
        options: &ExecuteOptions,
    ) -> Result<Vec<DataHandle>> {
        let start = Instant::now();
        let executable = computation.executable()?;
        self.registry.check_local(device)?;
        check_argument_count(executable, arguments.len())?;
        for (index, arg) in arguments.iter().enumerate() {
            check_argument(executable, index, arg, device)?;
        }
        let stream = self.streams.get(device)?;
        stream.check_fault()?;

        let outputs = self.output_handles(executable, device, options);
        let exec = Arc::clone(executable);
        let worker = Arc::clone(stream);
        let results = outputs.clone();
        let explode = options.explode_tuple;
        let args = arguments.to_vec();
        stream.enqueue(
            async move {
                match run(&exec, args, &worker, explode).await {
                    Ok(parts) => {
                        for (out, part) in results.iter().zip(parts) {
                            commit(&worker, out, part);
                        }
                    }
                    Err(RunFailure::Argument(error)) => fail_all(&results, &error),
                    Err(RunFailure::Device(error)) => {
                        fail_all(&results, &error);
                        worker.record_error(error);
                    }
                }
            }
            .boxed(),
        )?;

        self.metrics.timing(metrics::EXECUTE, start.elapsed());
        debug!(computation = computation.name(), %device, outputs = outputs.len(), "launched");
        Ok(outputs)
    }

    /// Run `computation` once per device. Argument `i` must be sharded over
    /// `devices` with shard `j` resident on `devices[j]`.
    ///
    /// All or nothing: if any replica fails, at launch or later on its
    /// device, every output of every replica fails with
    /// [`RuntimeError::ReplicatedExecution`] naming the failed devices. Launch
    /// failures are returned directly; later ones surface at the outputs and
    /// at [`Self::wait_device_ops`] once all replicas have settled.
    pub fn execute_replicated(
        &self,
        computation: &Computation,
        arguments: &[DataHandle],
        devices: &[String],
        options: &ExecuteOptions,
    ) -> Result<Vec<Vec<DataHandle>>> {
        let start = Instant::now();
        let executable = computation.executable()?;
        if devices.is_empty() {
            return Err(RuntimeError::ShardConfiguration(
                "replicated execution needs at least one device".into(),
            ));
        }
        let mut seen = HashSet::new();
        for device in devices {
            self.registry.check_local(device)?;
            if !seen.insert(device.as_str()) {
                return Err(RuntimeError::ShardConfiguration(format!(
                    "device {device} listed twice"
                )));
            }
        }
        check_argument_count(executable, arguments.len())?;

        // per_device[j][i] is shard j of argument i.
        let mut per_device: Vec<Vec<DataHandle>> = vec![Vec::with_capacity(arguments.len()); devices.len()];
        for (index, arg) in arguments.iter().enumerate() {
            let shards = arg.shards();
            if shards.len() != devices.len() {
                return Err(RuntimeError::ShardCountMismatch {
                    expected: devices.len(),
                    got: shards.len(),
                });
            }
            for (j, shard) in shards.into_iter().enumerate() {
                check_argument(executable, index, &shard, &devices[j])?;
                per_device[j].push(shard);
            }
        }

        let mut streams = Vec::with_capacity(devices.len());
        let mut failures = Vec::new();
        for device in devices {
            match self.streams.get(device).and_then(|s| s.check_fault().map(|()| s)) {
                Ok(stream) => streams.push(Arc::clone(stream)),
                Err(e) => failures.push((device.clone(), e)),
            }
        }
        if !failures.is_empty() {
            let error = replicated_error(&failures);
            warn!(computation = computation.name(), %error, "replicated launch failed");
            return Err(error);
        }

        let outputs: Vec<Vec<DataHandle>> = devices
            .iter()
            .map(|device| self.output_handles(executable, device, options))
            .collect();
        let gate = ReplicaGate::new(
            computation.name(),
            streams.iter().cloned().zip(outputs.iter().cloned()).collect(),
        );
        let explode = options.explode_tuple;
        {
            let _order = lock(&self.replicated_launch);
            for (index, (stream, args)) in streams.iter().zip(per_device).enumerate() {
                let exec = Arc::clone(executable);
                let worker = Arc::clone(stream);
                let replica_gate = Arc::clone(&gate);
                let queued = stream.enqueue(
                    async move {
                        let result = run(&exec, args, &worker, explode)
                            .await
                            .map_err(RunFailure::into_error);
                        replica_gate.finish(index, result).await;
                    }
                    .boxed(),
                );
                if let Err(e) = queued {
                    gate.abandon(index, &e);
                    for output in outputs.iter().flatten() {
                        output.release();
                    }
                    return Err(replicated_error(&[(devices[index].clone(), e)]));
                }
            }
        }

        self.metrics.timing(metrics::EXECUTE_REPLICATED, start.elapsed());
        debug!(computation = computation.name(), num_devices = devices.len(), "launched replicated");
        Ok(outputs)
    }

    /// Placeholders for one run's outputs on `device`.
    fn output_handles(&self, executable: &Executable, device: &str, options: &ExecuteOptions) -> Vec<DataHandle> {
        let output_shapes: Vec<Shape> = match executable.result_shape() {
            Shape::Tuple(elements) if options.explode_tuple => elements.clone(),
            other => vec![other.clone()],
        };
        output_shapes
            .into_iter()
            .map(|shape| DataHandle::placeholder(device, shape, Arc::clone(&self.metrics)))
            .collect()
    }

    /// Wait for queued work on `devices` (every local device when empty) and
    /// report the first asynchronous failure.
    pub async fn wait_device_ops(&self, devices: &[String]) -> Result<()> {
        let targets: Vec<String> = if devices.is_empty() {
            self.registry.local_devices().to_vec()
        } else {
            for device in devices {
                self.registry.check_local(device)?;
            }
            devices.to_vec()
        };
        let mut first_error = None;
        for device in &targets {
            if let Err(e) = self.streams.get(device)?.drain().await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

fn check_argument_count(executable: &Executable, got: usize) -> Result<()> {
    let expected = executable.argument_shapes().len();
    if expected != got {
        return Err(RuntimeError::ArgumentCount { expected, got });
    }
    Ok(())
}

fn check_argument(executable: &Executable, index: usize, arg: &DataHandle, device: &str) -> Result<()> {
    arg.check_live()?;
    if arg.device() != device {
        return Err(RuntimeError::DeviceMismatch {
            expected: device.to_string(),
            got: arg.device().to_string(),
        });
    }
    let expected = &executable.argument_shapes()[index];
    if arg.shape() != expected {
        return Err(RuntimeError::ArgumentShape {
            index,
            expected: expected.clone(),
            got: arg.shape().clone(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tang_program::{DType, ProgramBuilder};
    use tokio::runtime::Handle;

    use super::*;
    use crate::compile::CompileService;
    use crate::computation::{CompileInstance, ComputationHandle};
    use crate::config::ClientConfig;
    use crate::coordinator::CoordinatorFacade;
    use crate::data::DataState;
    use crate::env::CompilationEnv;
    use crate::metrics::NoopMetrics;
    use crate::source::{LiteralSource, TensorSource};
    use crate::transfer::TransferService;

    struct Fixture {
        streams: Arc<StreamSet>,
        transfer: TransferService,
        compiler: CompileService,
        engine: ExecutionEngine,
    }

    fn fixture(devices: usize) -> Fixture {
        fixture_with(ClientConfig::local(devices))
    }

    fn fixture_with(config: ClientConfig) -> Fixture {
        let registry = Arc::new(DeviceRegistry::from_config(&config).unwrap());
        let streams = Arc::new(StreamSet::new(
            registry.local_devices(),
            config.device_memory_bytes,
            &Handle::current(),
        ));
        let metrics: Arc<dyn MetricsSink> = Arc::new(NoopMetrics);
        Fixture {
            transfer: TransferService::new(
                Arc::clone(&registry),
                Arc::clone(&streams),
                Arc::new(CoordinatorFacade::new(Duration::from_secs(1))),
                Arc::clone(&metrics),
                Duration::from_secs(1),
            ),
            compiler: CompileService::new(
                Arc::clone(&registry),
                Arc::new(CompilationEnv::from_config(&config)),
                Arc::clone(&metrics),
            ),
            engine: ExecutionEngine::new(registry, Arc::clone(&streams), metrics),
            streams,
        }
    }

    /// (x + y, x * y) over f32[2].
    fn sum_and_product(f: &Fixture, devices: Vec<String>) -> ComputationHandle {
        let shape = Shape::array(DType::F32, &[2]);
        let mut b = ProgramBuilder::new();
        let x = b.parameter(shape.clone(), "x");
        let y = b.parameter(shape, "y");
        let s = b.add(x, y);
        let p = b.mul(x, y);
        let t = b.tuple(&[s, p]);
        let c = Arc::new(Computation::new("sum_and_product", b.build(t), vec![]).unwrap());
        f.compiler
            .compile(vec![CompileInstance::new(c, "CPU:0", devices)])
            .unwrap()
            .remove(0)
    }

    fn upload(f: &Fixture, values: &[f32], device: &str) -> DataHandle {
        let src = LiteralSource::new(Literal::from_slice(&[values.len()], values), device).unwrap();
        f.transfer.transfer_to_server(&[&src as &dyn TensorSource]).unwrap().remove(0)
    }

    #[tokio::test]
    async fn single_device_with_tuple_explosion() {
        let f = fixture(2);
        let c = sum_and_product(&f, vec![]);
        let x = upload(&f, &[1.0, 2.0], "CPU:1");
        let y = upload(&f, &[3.0, 4.0], "CPU:1");

        let outs = f
            .engine
            .execute_computation(&c, &[x.clone(), y.clone()], "CPU:1", &ExecuteOptions::default())
            .unwrap();
        assert_eq!(outs.len(), 2);
        let back = f.transfer.transfer_from_server(&outs).await.unwrap();
        assert_eq!(back[0].to_vec::<f32>().unwrap(), vec![4.0, 6.0]);
        assert_eq!(back[1].to_vec::<f32>().unwrap(), vec![3.0, 8.0]);

        let whole = f
            .engine
            .execute_computation(&c, &[x, y], "CPU:1", &ExecuteOptions { explode_tuple: false })
            .unwrap();
        assert_eq!(whole.len(), 1);
        assert!(whole[0].shape().is_tuple());
        let back = f.transfer.transfer_from_server(&whole).await.unwrap().remove(0);
        assert_eq!(back.decompose_tuple().len(), 2);
    }

    #[tokio::test]
    async fn argument_validation() {
        let f = fixture(2);
        let c = sum_and_product(&f, vec![]);
        let x = upload(&f, &[1.0, 2.0], "CPU:0");
        let y = upload(&f, &[3.0, 4.0], "CPU:1");
        let opts = ExecuteOptions::default();

        assert_eq!(
            f.engine.execute_computation(&c, &[x.clone(), y.clone()], "CPU:0", &opts).unwrap_err(),
            RuntimeError::DeviceMismatch { expected: "CPU:0".into(), got: "CPU:1".into() }
        );
        assert_eq!(
            f.engine.execute_computation(&c, &[x.clone()], "CPU:0", &opts).unwrap_err(),
            RuntimeError::ArgumentCount { expected: 2, got: 1 }
        );
        let short = upload(&f, &[1.0], "CPU:0");
        assert!(matches!(
            f.engine.execute_computation(&c, &[x.clone(), short], "CPU:0", &opts),
            Err(RuntimeError::ArgumentShape { index: 1, .. })
        ));
        assert!(matches!(
            f.engine.execute_computation(&c, &[x.clone(), x.clone()], "bad", &opts),
            Err(RuntimeError::InvalidDeviceString(_))
        ));

        let mut b = ProgramBuilder::new();
        let p = b.parameter(Shape::scalar(DType::F32), "p");
        let n = b.neg(p);
        let raw = Computation::new("raw", b.build(n), vec![]).unwrap();
        assert!(matches!(
            f.engine.execute_computation(&raw, &[], "CPU:0", &opts),
            Err(RuntimeError::NotCompiled(_))
        ));
    }

    #[tokio::test]
    async fn failed_argument_poisons_outputs() {
        let f = fixture(1);
        let c = sum_and_product(&f, vec![]);
        let x = f
            .transfer
            .create_placeholder("CPU:0", Shape::array(DType::F32, &[2]))
            .unwrap();
        let y = upload(&f, &[3.0, 4.0], "CPU:0");
        let outs = f
            .engine
            .execute_computation(&c, &[x.clone(), y], "CPU:0", &ExecuteOptions::default())
            .unwrap();

        let cause = RuntimeError::Transport { device: "CPU:0".into(), message: "link down".into() };
        x.fail(cause.clone());
        assert_eq!(f.transfer.transfer_from_server(&outs).await.unwrap_err(), cause);
        assert!(outs.iter().all(|o| o.state() == DataState::Failed));
    }

    #[tokio::test]
    async fn replicated_all_or_nothing() {
        let f = fixture(4);
        let devices: Vec<String> = (0..4).map(|i| format!("CPU:{i}")).collect();
        let c = sum_and_product(&f, devices.clone());
        let spec = crate::sharding::ShardingSpec::Replicated { num_devices: 4 };
        let shard = |values: &[f32]| {
            let shards: Vec<DataHandle> = devices.iter().map(|d| upload(&f, values, d)).collect();
            f.transfer
                .wrap_data_shards(shards, crate::device::SPMD_DEVICE, Shape::array(DType::F32, &[2]), spec.clone())
                .unwrap()
        };
        let x = shard(&[1.0, 1.0]);
        let y = shard(&[2.0, 5.0]);
        f.engine.wait_device_ops(&[]).await.unwrap();
        let baseline: usize = devices
            .iter()
            .map(|d| f.streams.get(d).unwrap().memory().live_buffers())
            .sum();

        f.streams.get("CPU:2").unwrap().inject_fault("device lost");
        let err = f
            .engine
            .execute_replicated(&c, &[x.clone(), y.clone()], &devices, &ExecuteOptions::default())
            .unwrap_err();
        match err {
            RuntimeError::ReplicatedExecution { devices: failed, message } => {
                assert_eq!(failed, vec!["CPU:2".to_string()]);
                assert!(message.contains("device lost"), "{message}");
            }
            other => panic!("unexpected error {other}"),
        }
        f.engine.wait_device_ops(&[]).await.unwrap();
        let after: usize = devices
            .iter()
            .map(|d| f.streams.get(d).unwrap().memory().live_buffers())
            .sum();
        assert_eq!(after, baseline);

        f.streams.get("CPU:2").unwrap().clear_fault();
        let outs = f
            .engine
            .execute_replicated(&c, &[x, y], &devices, &ExecuteOptions::default())
            .unwrap();
        assert_eq!(outs.len(), 4);
        for (device, per_device) in devices.iter().zip(&outs) {
            assert_eq!(per_device.len(), 2);
            assert_eq!(per_device[0].device(), device);
            let back = f.transfer.transfer_from_server(per_device).await.unwrap();
            assert_eq!(back[0].to_vec::<f32>().unwrap(), vec![3.0, 6.0]);
            assert_eq!(back[1].to_vec::<f32>().unwrap(), vec![2.0, 5.0]);
        }
    }

    fn two_devices() -> Vec<String> {
        vec!["CPU:0".into(), "CPU:1".into()]
    }

    fn replicated(f: &Fixture, shards: Vec<DataHandle>) -> DataHandle {
        f.transfer
            .wrap_data_shards(
                shards,
                crate::device::SPMD_DEVICE,
                Shape::array(DType::F32, &[2]),
                crate::sharding::ShardingSpec::Replicated { num_devices: 2 },
            )
            .unwrap()
    }

    fn live_buffers(f: &Fixture, devices: &[String]) -> usize {
        devices
            .iter()
            .map(|d| f.streams.get(d).unwrap().memory().live_buffers())
            .sum()
    }

    fn assert_failed_on(err: &RuntimeError, expected: &[&str], reason: &str) {
        match err {
            RuntimeError::ReplicatedExecution { devices, message } => {
                assert_eq!(devices, expected);
                assert!(message.contains(reason), "{message}");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn replica_fault_after_launch_fails_every_replica() {
        let f = fixture(2);
        let devices = two_devices();
        let c = sum_and_product(&f, devices.clone());
        let late = f
            .transfer
            .create_placeholder("CPU:1", Shape::array(DType::F32, &[2]))
            .unwrap();
        let x = replicated(&f, vec![upload(&f, &[1.0, 2.0], "CPU:0"), late.clone()]);
        let y = replicated(&f, vec![upload(&f, &[3.0, 4.0], "CPU:0"), upload(&f, &[3.0, 4.0], "CPU:1")]);

        let outs = f
            .engine
            .execute_replicated(&c, &[x, y], &devices, &ExecuteOptions::default())
            .unwrap();
        // CPU:0 can run right away; CPU:1 is still waiting for `late`.
        f.streams.get("CPU:1").unwrap().inject_fault("ecc error");
        let src = LiteralSource::new(Literal::from_slice(&[2], &[1.0f32, 2.0]), "CPU:1").unwrap();
        f.transfer.populate_placeholder(&late, &src).unwrap();

        let err = f.transfer.transfer_from_server(&outs[0]).await.unwrap_err();
        assert_failed_on(&err, &["CPU:1"], "ecc error");
        assert!(outs.iter().flatten().all(|o| o.state() == DataState::Failed));

        let err = f.engine.wait_device_ops(&[]).await.unwrap_err();
        assert_failed_on(&err, &["CPU:1"], "ecc error");
        assert!(f.engine.wait_device_ops(&[]).await.is_ok());
        // Only the four argument shards remain.
        assert_eq!(live_buffers(&f, &devices), 4);
    }

    #[tokio::test]
    async fn replica_argument_failure_fails_every_replica() {
        let f = fixture(2);
        let devices = two_devices();
        let c = sum_and_product(&f, devices.clone());
        let late = f
            .transfer
            .create_placeholder("CPU:1", Shape::array(DType::F32, &[2]))
            .unwrap();
        let x = replicated(&f, vec![upload(&f, &[1.0, 2.0], "CPU:0"), late.clone()]);
        let outs = f
            .engine
            .execute_replicated(&c, &[x.clone(), x], &devices, &ExecuteOptions::default())
            .unwrap();

        late.fail(RuntimeError::Transport { device: "CPU:1".into(), message: "link down".into() });
        for per_device in &outs {
            let err = f.transfer.transfer_from_server(per_device).await.unwrap_err();
            assert_failed_on(&err, &["CPU:1"], "link down");
        }
        assert!(f.engine.wait_device_ops(&devices).await.is_err());
    }

    #[tokio::test]
    async fn replica_out_of_memory_discards_peer_results() {
        // 32 bytes per device: CPU:0 fits its two 8-byte arguments and two
        // 8-byte outputs, CPU:1 also holds an extra buffer and does not.
        let f = fixture_with(ClientConfig::local(2).with_device_memory(32));
        let devices = two_devices();
        let c = sum_and_product(&f, devices.clone());
        let _extra = upload(&f, &[0.0, 0.0], "CPU:1");
        let x = replicated(&f, vec![upload(&f, &[1.0, 2.0], "CPU:0"), upload(&f, &[1.0, 2.0], "CPU:1")]);
        let y = replicated(&f, vec![upload(&f, &[3.0, 4.0], "CPU:0"), upload(&f, &[3.0, 4.0], "CPU:1")]);
        f.engine.wait_device_ops(&[]).await.unwrap();

        let outs = f
            .engine
            .execute_replicated(&c, &[x, y], &devices, &ExecuteOptions::default())
            .unwrap();
        let err = f.engine.wait_device_ops(&[]).await.unwrap_err();
        assert_failed_on(&err, &["CPU:1"], "out of device memory");
        assert!(outs.iter().flatten().all(|o| o.state() == DataState::Failed));
        assert_eq!(f.streams.get("CPU:0").unwrap().memory().live_buffers(), 2);
        assert_eq!(f.streams.get("CPU:1").unwrap().memory().live_buffers(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_replicated_calls_complete() {
        let f = Arc::new(fixture(2));
        let devices = two_devices();
        let c = sum_and_product(&f, devices.clone());
        let x = replicated(&f, vec![upload(&f, &[1.0, 2.0], "CPU:0"), upload(&f, &[1.0, 2.0], "CPU:1")]);

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let (f, c, x, devices) = (Arc::clone(&f), Arc::clone(&c), x.clone(), devices.clone());
                tokio::spawn(async move {
                    let outs = f
                        .engine
                        .execute_replicated(&c, &[x.clone(), x], &devices, &ExecuteOptions::default())
                        .unwrap();
                    for per_device in &outs {
                        let back = f.transfer.transfer_from_server(per_device).await.unwrap();
                        assert_eq!(back[0].to_vec::<f32>().unwrap(), vec![2.0, 4.0]);
                    }
                })
            })
            .collect();
        for task in tasks {
            tokio::time::timeout(Duration::from_secs(10), task)
                .await
                .expect("replicated calls stalled")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn replicated_argument_layout() {
        let f = fixture(2);
        let devices: Vec<String> = vec!["CPU:0".into(), "CPU:1".into()];
        let c = sum_and_product(&f, devices.clone());
        let plain = upload(&f, &[1.0, 2.0], "CPU:0");
        let opts = ExecuteOptions::default();

        assert_eq!(
            f.engine
                .execute_replicated(&c, &[plain.clone(), plain.clone()], &devices, &opts)
                .unwrap_err(),
            RuntimeError::ShardCountMismatch { expected: 2, got: 1 }
        );
        let swapped = f
            .transfer
            .wrap_data_shards(
                vec![upload(&f, &[1.0, 2.0], "CPU:1"), upload(&f, &[1.0, 2.0], "CPU:0")],
                crate::device::SPMD_DEVICE,
                Shape::array(DType::F32, &[2]),
                crate::sharding::ShardingSpec::Replicated { num_devices: 2 },
            )
            .unwrap();
        assert!(matches!(
            f.engine.execute_replicated(&c, &[swapped.clone(), swapped], &devices, &opts),
            Err(RuntimeError::DeviceMismatch { .. })
        ));
        assert!(matches!(
            f.engine.execute_replicated(&c, &[], &[], &opts),
            Err(RuntimeError::ShardConfiguration(_))
        ));
    }

    #[tokio::test]
    async fn runtime_fault_surfaces_at_wait() {
        let f = fixture(1);
        let c = sum_and_product(&f, vec![]);
        let x = f
            .transfer
            .create_placeholder("CPU:0", Shape::array(DType::F32, &[2]))
            .unwrap();
        let y = upload(&f, &[1.0, 1.0], "CPU:0");
        let outs = f
            .engine
            .execute_computation(&c, &[x.clone(), y.clone()], "CPU:0", &ExecuteOptions::default())
            .unwrap();
        // Fault arrives after launch but before the run can start.
        f.streams.get("CPU:0").unwrap().inject_fault("ecc error");
        let src = LiteralSource::new(Literal::from_slice(&[2], &[1.0f32, 1.0]), "CPU:0").unwrap();
        f.transfer.populate_placeholder(&x, &src).unwrap();

        let err = f.engine.wait_device_ops(&["CPU:0".to_string()]).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Execution { .. }), "{err}");
        assert!(outs.iter().all(|o| o.state() == DataState::Failed));
        assert!(f.engine.wait_device_ops(&[]).await.is_ok());
    }
}
