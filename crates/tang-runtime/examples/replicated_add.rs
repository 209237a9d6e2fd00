//! Replicated add over every local CPU device.
//!
//! Uploads `x` sharded by rows and `y` replicated, compiles `x + y` for all
//! devices, runs one replica per device, and reads the tiled result back.
//!
//! ```sh
//! cargo run --example replicated_add -p tang-runtime
//! TANG_NUM_DEVICES=8 RUST_LOG=tang_runtime=debug cargo run --example replicated_add -p tang-runtime
//! ```

use std::sync::Arc;

use tang_program::{DType, Literal, ProgramBuilder, Shape};
use tang_runtime::{
    create_client, init_logging, ClientConfig, Computation, ExecuteOptions, LiteralSource,
    ShardingSpec, TensorSource, SPMD_DEVICE,
};

const COLS: usize = 4;

fn refs(parts: &[LiteralSource]) -> Vec<&dyn TensorSource> {
    parts.iter().map(|p| p as &dyn TensorSource).collect()
}

#[tokio::main]
async fn main() -> tang_runtime::Result<()> {
    let config = ClientConfig::from_env()?;
    init_logging(&config.log_level);
    let client = create_client(&config)?;
    let devices = client.get_local_devices();
    let n = devices.len();
    println!("devices: {devices:?}");

    // Each replica adds its own row of x to the shared row y.
    let row = Shape::array(DType::F32, &[1, COLS]);
    let mut b = ProgramBuilder::new();
    let x = b.parameter(row.clone(), "x_row");
    let y = b.parameter(row.clone(), "y");
    let sum = b.add(x, y);
    let add = Arc::new(Computation::new("row_add", b.build(sum), vec![])?);
    let compiled = client.compile_one(add, &devices[0], devices.clone())?;
    println!("compiled {compiled} env={}", client.hash_compilation_env());

    let ordinals: Vec<i64> = devices
        .iter()
        .map(|d| client.get_device_ordinal(d))
        .collect::<Result<_, _>>()?;
    let full_shape = Shape::array(DType::F32, &[n, COLS]);
    let x_value = Literal::from_slice(
        &[n, COLS],
        &(0..n * COLS).map(|i| i as f32).collect::<Vec<_>>(),
    );
    let x_spec = ShardingSpec::tiled(&[n, 1], &ordinals)?;
    let x_parts: Vec<LiteralSource> = x_spec
        .split(&x_value)?
        .into_iter()
        .zip(&devices)
        .map(|(lit, d)| LiteralSource::new(lit, d.clone()))
        .collect::<Result<_, _>>()?;
    let y_parts: Vec<LiteralSource> = devices
        .iter()
        .map(|d| LiteralSource::new(Literal::from_slice(&[1, COLS], &[100.0f32; COLS]), d.clone()))
        .collect::<Result<_, _>>()?;

    let x_handle = client.transfer_shards_to_server(
        &refs(&x_parts),
        SPMD_DEVICE,
        full_shape.clone(),
        x_spec.clone(),
    )?;
    let y_handle = client.transfer_shards_to_server(
        &refs(&y_parts),
        SPMD_DEVICE,
        row,
        ShardingSpec::Replicated { num_devices: n },
    )?;

    let outputs = client.execute_replicated(
        &compiled,
        &[x_handle, y_handle],
        &devices,
        &ExecuteOptions::default(),
    )?;
    let shards: Vec<_> = outputs.into_iter().flatten().collect();
    let result = client.wrap_data_shards(shards, SPMD_DEVICE, full_shape, x_spec)?;
    client.wait_device_ops(&[]).await?;

    let value = client.transfer_from_server(&[result]).await?.remove(0);
    for (i, chunk) in value.to_vec::<f32>()?.chunks(COLS).enumerate() {
        println!("{}: {chunk:?}", devices[i]);
    }
    for device in &devices {
        let mem = client.get_memory_info(device)?;
        println!("{device}: {} KiB free of {}", mem.kb_free, mem.kb_total);
    }
    Ok(())
}
