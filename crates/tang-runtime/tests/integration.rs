//! End-to-end integration tests for tang-runtime.
//!
//! Drives the public client interface: upload → compile → execute → read
//! back, replicated execution over sharded arguments, serialized
//! executables, and cross-process copies through the coordinator.

use std::sync::Arc;
use std::time::Duration;

use tang_program::{DType, Literal, ProgramBuilder, Shape};
use tang_runtime::{
    create_client, device_ordinal, ClientConfig, CompileInstance, Computation, ComputationClient,
    CpuClient, DataState, ExecuteOptions, LiteralSource, RuntimeError, ShardingSpec, TensorSource,
    SERIALIZED_FORMAT_VERSION, SPMD_DEVICE,
};

fn sources(values: &[LiteralSource]) -> Vec<&dyn TensorSource> {
    values.iter().map(|s| s as &dyn TensorSource).collect()
}

/// f(x, y) = x * 2 + y over f32[n].
fn scale_add(n: usize) -> Arc<Computation> {
    let shape = Shape::array(DType::F32, &[n]);
    let mut b = ProgramBuilder::new();
    let x = b.parameter(shape.clone(), "x");
    let y = b.parameter(shape, "y");
    let two = b.constant(Literal::scalar(2.0f32));
    let two = b.broadcast(two, &[n]);
    let scaled = b.mul(x, two);
    let out = b.add(scaled, y);
    Arc::new(Computation::new("scale_add", b.build(out), vec![]).unwrap())
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn total_live_buffers(client: &CpuClient) -> usize {
    client
        .get_local_devices()
        .iter()
        .map(|d| client.live_buffers(d).unwrap())
        .sum()
}

#[test]
fn device_ordinal_parsing() {
    assert_eq!(device_ordinal("CPU:0").unwrap(), 0);
    assert_eq!(device_ordinal("TPU:12").unwrap(), 12);
    assert_eq!(device_ordinal("SPMD:0").unwrap(), 0);
    assert_eq!(device_ordinal("host:slice:3").unwrap(), 3);
    for bad in ["CPU", "CPU:", "CPU:x", ""] {
        assert!(
            matches!(device_ordinal(bad), Err(RuntimeError::InvalidDeviceString(_))),
            "{bad:?}"
        );
    }
}

#[tokio::test]
async fn host_round_trip_every_dtype() {
    let client = create_client(&ClientConfig::local(2)).unwrap();
    let mut values = Vec::new();
    for (i, dtype) in [DType::Pred, DType::U8, DType::I32, DType::I64, DType::F32, DType::F64]
        .into_iter()
        .enumerate()
    {
        for dims in [vec![], vec![3, 2], vec![0, 4]] {
            let shape = Shape::array(dtype, &dims);
            let bytes: Vec<u8> = (0..shape.byte_size())
                .map(|b| if dtype == DType::Pred { (b % 2) as u8 } else { (b * 7 + i) as u8 })
                .collect();
            let literal = Literal::from_raw(&shape, bytes).unwrap();
            let device = format!("CPU:{}", values.len() % 2);
            values.push(LiteralSource::new(literal, device).unwrap());
        }
    }

    let handles = client.transfer_to_server(&sources(&values)).unwrap();
    assert_eq!(handles.len(), values.len());
    let back = client.transfer_from_server(&handles).await.unwrap();
    for (src, got) in values.iter().zip(&back) {
        assert_eq!(src.literal(), got);
    }
    assert!(client.transfer_to_server(&[]).unwrap().is_empty());
}

#[tokio::test]
async fn shards_wrap_and_unwrap() {
    let client = create_client(&ClientConfig::local(4)).unwrap();
    let shape = Shape::array(DType::I32, &[4, 3]);
    let value = Literal::from_slice(&[4, 3], &(0..12).collect::<Vec<i32>>());
    let spec = ShardingSpec::tiled(&[2, 2], &[0, 1, 2, 3]).unwrap();

    let parts: Vec<LiteralSource> = spec
        .split(&value)
        .unwrap()
        .into_iter()
        .enumerate()
        .map(|(i, lit)| LiteralSource::new(lit, format!("CPU:{i}")).unwrap())
        .collect();
    let sharded = client
        .transfer_shards_to_server(&sources(&parts), SPMD_DEVICE, shape.clone(), spec.clone())
        .unwrap();
    assert_eq!(client.get_data_sharding(&sharded), Some(spec.clone()));

    let shards = client.get_data_shards(&sharded);
    assert_eq!(shards.len(), 4);
    assert_eq!(client.get_data_shard(&sharded, 2).unwrap().device(), "CPU:2");
    let rewrapped = client
        .wrap_data_shards(shards.clone(), SPMD_DEVICE, shape, spec)
        .unwrap();
    let again = client.get_data_shards(&rewrapped);
    assert_eq!(
        again.iter().map(|h| h.id()).collect::<Vec<_>>(),
        shards.iter().map(|h| h.id()).collect::<Vec<_>>()
    );

    let back = client.transfer_from_server(&[sharded, rewrapped]).await.unwrap();
    assert_eq!(back[0], value);
    assert_eq!(back[1], value);

    let plain = client
        .transfer_to_server(&[&LiteralSource::new(Literal::scalar(1i32), "CPU:0").unwrap() as &dyn TensorSource])
        .unwrap()
        .remove(0);
    let own = client.get_data_shards(&plain);
    assert_eq!(own.len(), 1);
    assert_eq!(own[0].id(), plain.id());
    assert_eq!(client.get_data_sharding(&plain), None);
}

#[tokio::test]
async fn compile_execute_and_serialize() {
    let client = create_client(&ClientConfig::local(2)).unwrap();
    let compiled = client.compile_one(scale_add(3), "CPU:0", vec![]).unwrap();
    assert!(compiled.is_compiled());

    let run = |comp: Arc<Computation>, client: Arc<dyn ComputationClient>| async move {
        let inputs = vec![
            LiteralSource::new(Literal::from_slice(&[3], &[1.0f32, 2.0, 3.0]), "CPU:1").unwrap(),
            LiteralSource::new(Literal::from_slice(&[3], &[0.5f32, 0.5, 0.5]), "CPU:1").unwrap(),
        ];
        let args = client.transfer_to_server(&sources(&inputs)).unwrap();
        let out = client
            .execute_computation(&comp, &args, "CPU:1", &ExecuteOptions::default())
            .unwrap();
        client.transfer_from_server(&out).await.unwrap().remove(0)
    };
    let expected = Literal::from_slice(&[3], &[2.5f32, 4.5, 6.5]);
    assert_eq!(run(Arc::clone(&compiled), Arc::clone(&client)).await, expected);

    let bytes = client.serialize_computation(&compiled).unwrap();
    let restored = client.deserialize_computation(&bytes).unwrap().unwrap();
    assert_eq!(restored.name(), compiled.name());
    assert_eq!(restored.hash(), compiled.hash());
    assert_eq!(run(restored, Arc::clone(&client)).await, expected);

    let truncated = &bytes[..bytes.len() / 2];
    assert!(matches!(
        client.deserialize_computation(truncated),
        Err(RuntimeError::Compilation { .. })
    ));
    let mut bad_magic = bytes.clone();
    bad_magic[0] ^= 0xff;
    assert!(matches!(
        client.deserialize_computation(&bad_magic),
        Err(RuntimeError::Compilation { .. })
    ));
    let mut future = bytes.clone();
    future[4..8].copy_from_slice(&(SERIALIZED_FORMAT_VERSION + 1).to_le_bytes());
    assert!(client.deserialize_computation(&future).unwrap().is_none());
}

#[tokio::test]
async fn compile_batch_reports_failing_index() {
    let client = create_client(&ClientConfig::local(2)).unwrap();
    let good = scale_add(2);
    let bad = scale_add(2);
    let err = client
        .compile(vec![
            CompileInstance::new(Arc::clone(&good), "CPU:0", vec![]),
            CompileInstance::new(bad, "CPU:7", vec![]),
        ])
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Compilation { index: 1, .. }), "{err}");
    // Nothing was consumed by the failed batch.
    assert!(!good.is_moved());
    assert!(client.compile_one(good, "CPU:0", vec![]).is_ok());
}

#[tokio::test]
async fn replicated_constant_program() {
    let client = create_client(&ClientConfig::local(4)).unwrap();
    let devices = client.get_local_devices();
    let mut b = ProgramBuilder::new();
    let c = b.constant(Literal::from_slice(&[2], &[7i64, -7]));
    let comp = Arc::new(Computation::new("constant", b.build(c), vec![]).unwrap());
    let compiled = client.compile_one(comp, "CPU:0", devices.clone()).unwrap();
    assert_eq!(compiled.devices(), devices.as_slice());

    let outs = client
        .execute_replicated(&compiled, &[], &devices, &ExecuteOptions::default())
        .unwrap();
    assert_eq!(outs.len(), devices.len());
    for (device, per_device) in devices.iter().zip(&outs) {
        assert_eq!(per_device.len(), 1);
        assert_eq!(per_device[0].device(), device);
    }
    let flat: Vec<_> = outs.into_iter().flatten().collect();
    for value in client.transfer_from_server(&flat).await.unwrap() {
        assert_eq!(value.to_vec::<i64>().unwrap(), vec![7, -7]);
    }
}

#[tokio::test]
async fn replicated_failure_leaves_nothing_behind() {
    let client = CpuClient::new(&ClientConfig::local(4)).unwrap();
    let devices = client.get_local_devices();
    let compiled = client.compile_one(scale_add(2), "CPU:0", devices.clone()).unwrap();
    let spec = ShardingSpec::Replicated { num_devices: 4 };
    let shape = Shape::array(DType::F32, &[2]);
    let replicate = |values: [f32; 2]| {
        let parts: Vec<LiteralSource> = devices
            .iter()
            .map(|d| LiteralSource::new(Literal::from_slice(&[2], &values), d.clone()).unwrap())
            .collect();
        client
            .transfer_shards_to_server(&sources(&parts), SPMD_DEVICE, shape.clone(), spec.clone())
            .unwrap()
    };
    let x = replicate([1.0, 2.0]);
    let y = replicate([10.0, 20.0]);
    client.wait_device_ops(&[]).await.unwrap();
    let baseline = total_live_buffers(&client);
    assert_eq!(baseline, 8);

    client.inject_fault("CPU:1", "link reset").unwrap();
    client.inject_fault("CPU:3", "link reset").unwrap();
    let err = client
        .execute_replicated(&compiled, &[x.clone(), y.clone()], &devices, &ExecuteOptions::default())
        .unwrap_err();
    match &err {
        RuntimeError::ReplicatedExecution { devices: failed, .. } => {
            assert_eq!(failed, &vec!["CPU:1".to_string(), "CPU:3".to_string()]);
        }
        other => panic!("unexpected {other}"),
    }
    client.wait_device_ops(&[]).await.unwrap();
    assert_eq!(total_live_buffers(&client), baseline);

    client.clear_fault("CPU:1").unwrap();
    client.clear_fault("CPU:3").unwrap();
    let outs = client
        .execute_replicated(&compiled, &[x, y], &devices, &ExecuteOptions::default())
        .unwrap();
    let flat: Vec<_> = outs.into_iter().flatten().collect();
    for value in client.transfer_from_server(&flat).await.unwrap() {
        assert_eq!(value.to_vec::<f32>().unwrap(), vec![12.0, 24.0]);
    }
}

#[tokio::test]
async fn compilation_env_hash() {
    let config = ClientConfig::local(2).with_flag("opt_level", "2");
    let a = CpuClient::new(&config).unwrap();
    let b = CpuClient::new(&config).unwrap();
    assert_eq!(a.hash_compilation_env(), a.hash_compilation_env());
    assert_eq!(a.hash_compilation_env(), b.hash_compilation_env());

    let other = CpuClient::new(&ClientConfig::local(2).with_flag("opt_level", "3")).unwrap();
    assert_ne!(a.hash_compilation_env(), other.hash_compilation_env());

    let before = a.hash_compilation_env();
    assert!(a.compilation_env().set("flag.fast_math", "true"));
    assert_ne!(a.hash_compilation_env(), before);
    assert!(a.compilation_env().remove("flag.fast_math"));
    assert_eq!(a.hash_compilation_env(), before);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_pairs_do_not_cross_talk() {
    let client = create_client(&ClientConfig::local(4)).unwrap();
    let compiled = client.compile_one(scale_add(4), "CPU:0", vec![]).unwrap();

    let tasks: Vec<_> = (0..100)
        .map(|i| {
            let client = Arc::clone(&client);
            let compiled = Arc::clone(&compiled);
            tokio::spawn(async move {
                let device = format!("CPU:{}", i % 4);
                let v = i as f32;
                let inputs = vec![
                    LiteralSource::new(Literal::from_slice(&[4], &[v; 4]), device.clone()).unwrap(),
                    LiteralSource::new(Literal::from_slice(&[4], &[1.0f32; 4]), device.clone()).unwrap(),
                ];
                let args = client.transfer_to_server(&sources(&inputs)).unwrap();
                let out = client
                    .execute_computation(&compiled, &args, &device, &ExecuteOptions::default())
                    .unwrap();
                let back = client.transfer_from_server(&out).await.unwrap();
                (i, back[0].to_vec::<f32>().unwrap())
            })
        })
        .collect();

    for task in tasks {
        let (i, values) = task.await.unwrap();
        assert_eq!(values, vec![i as f32 * 2.0 + 1.0; 4], "pair {i}");
    }
    client.wait_device_ops(&[]).await.unwrap();
}

#[tokio::test]
async fn out_of_memory_surfaces_at_wait() {
    let client = CpuClient::new(&ClientConfig::local(1).with_device_memory(1024)).unwrap();
    let big = LiteralSource::new(Literal::zeros(&Shape::array(DType::F64, &[256])), "CPU:0").unwrap();
    let handles = client.transfer_to_server(&[&big as &dyn TensorSource]).unwrap();

    let err = client.wait_device_ops(&["CPU:0".to_string()]).await.unwrap_err();
    assert!(matches!(err, RuntimeError::Transport { ref device, .. } if device == "CPU:0"), "{err}");
    assert_eq!(handles[0].state(), DataState::Failed);
    assert!(matches!(
        client.transfer_from_server(&handles).await,
        Err(RuntimeError::Transport { .. })
    ));
    assert_eq!(client.live_buffers("CPU:0").unwrap(), 0);
}

#[tokio::test]
async fn release_then_read_fails() {
    let client = create_client(&ClientConfig::local(1)).unwrap();
    let src = LiteralSource::new(Literal::scalar(3.0f64), "CPU:0").unwrap();
    let h = client.transfer_to_server(&[&src as &dyn TensorSource]).unwrap().remove(0);
    h.release();
    assert!(matches!(
        client.transfer_from_server(&[h.clone()]).await,
        Err(RuntimeError::UseAfterRelease(_))
    ));
    assert!(matches!(
        client.copy_to_device(&h, "CPU:0"),
        Err(RuntimeError::UseAfterRelease(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cross_host_copy_through_coordinator() {
    let port = free_port();
    let p0 = CpuClient::new(&ClientConfig::process(0, 2, 2)).unwrap();
    let p1 = CpuClient::new(&ClientConfig::process(1, 2, 2)).unwrap();
    assert_eq!(p0.get_all_devices(), p1.get_all_devices());

    let value = LiteralSource::new(Literal::from_slice(&[3], &[1i32, 2, 3]), "CPU:0").unwrap();
    let local = p0.transfer_to_server(&[&value as &dyn TensorSource]).unwrap().remove(0);
    assert!(matches!(
        p0.copy_to_device(&local, "CPU:2"),
        Err(RuntimeError::CoordinatorNotInitialized)
    ));

    let (r0, r1) = tokio::join!(
        p0.initialize_coordinator(0, 2, "127.0.0.1", port),
        p1.initialize_coordinator(1, 2, "127.0.0.1", port),
    );
    r0.unwrap();
    r1.unwrap();

    let remote = p0.copy_to_device(&local, "CPU:2").unwrap();
    assert_eq!(remote.device(), "CPU:2");
    p0.wait_device_ops(&[]).await.unwrap();
    let key = remote.remote_key().unwrap();

    let received = p1
        .import_remote(&key, "CPU:2", Shape::array(DType::I32, &[3]))
        .unwrap();
    let on_p1 = p1.transfer_from_server(&[received.clone()]).await.unwrap();
    assert_eq!(&on_p1[0], value.literal());
    // The publisher can read its remote handle back through the store too.
    let on_p0 = p0.transfer_from_server(&[remote.clone()]).await.unwrap();
    assert_eq!(&on_p0[0], value.literal());

    // Releasing the publishing handle removes the payload from the store.
    remote.release();
    let store = p1.coordinator().client().unwrap();
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while store.key_value_get(&key).await.unwrap().is_some() {
        assert!(std::time::Instant::now() < deadline, "{key} still published");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // A value received on p1 can be moved between p1's own devices.
    let moved = p1.copy_to_device(&received, "CPU:3").unwrap();
    assert_eq!(&p1.transfer_from_server(&[moved]).await.unwrap()[0], value.literal());
}
