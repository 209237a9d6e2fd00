//! Sharding annotations and host-side shard assembly.

use serde::{Deserialize, Serialize};
use tang_program::{Literal, Shape};

use crate::error::{Result, RuntimeError};

/// How a logical tensor is laid out over a group of devices.
///
/// The client only checks shard-count consistency; the partitioning itself is
/// opaque except when reading a sharded value back to the host.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShardingSpec {
    /// Every device holds the full value.
    Replicated { num_devices: usize },
    /// A single device holds the full value.
    Maximal { device: i64 },
    /// The value is split into a grid of `tile_dims` tiles, row-major over `devices`.
    Tiled { tile_dims: Vec<usize>, devices: Vec<i64> },
}

impl ShardingSpec {
    /// Tiled spec; the tile grid must cover `devices` exactly.
    pub fn tiled(tile_dims: &[usize], devices: &[i64]) -> Result<Self> {
        let tiles: usize = tile_dims.iter().product();
        if tile_dims.is_empty() || tiles != devices.len() {
            return Err(RuntimeError::ShardConfiguration(format!(
                "tile grid {tile_dims:?} does not cover {} devices",
                devices.len()
            )));
        }
        Ok(Self::Tiled {
            tile_dims: tile_dims.to_vec(),
            devices: devices.to_vec(),
        })
    }

    pub fn num_shards(&self) -> usize {
        match self {
            Self::Replicated { num_devices } => *num_devices,
            Self::Maximal { .. } => 1,
            Self::Tiled { devices, .. } => devices.len(),
        }
    }

    pub fn check_shard_count(&self, got: usize) -> Result<()> {
        let expected = self.num_shards();
        if expected != got {
            return Err(RuntimeError::ShardCountMismatch { expected, got });
        }
        Ok(())
    }

    /// Per-shard shape of a value with logical shape `shape`.
    pub fn shard_shape(&self, shape: &Shape) -> Result<Shape> {
        match self {
            Self::Replicated { .. } | Self::Maximal { .. } => Ok(shape.clone()),
            Self::Tiled { tile_dims, .. } => {
                let (dtype, dims) = array_parts(shape)?;
                check_rank(tile_dims, dims)?;
                let tile: Vec<usize> = dims
                    .iter()
                    .zip(tile_dims)
                    .map(|(&d, &t)| d.div_ceil(t))
                    .collect();
                Ok(Shape::array(dtype, &tile))
            }
        }
    }

    /// Split a host value into shards, zero-padding ragged tiles.
    pub fn split(&self, value: &Literal) -> Result<Vec<Literal>> {
        let shape = value.shape();
        match self {
            Self::Replicated { num_devices } => Ok(vec![value.clone(); *num_devices]),
            Self::Maximal { .. } => Ok(vec![value.clone()]),
            Self::Tiled { tile_dims, .. } => {
                let (_, dims) = array_parts(&shape)?;
                let tile_shape = self.shard_shape(&shape)?;
                let elem = tile_shape.dtype().map_or(0, |d| d.size_bytes());
                let src = value.raw_bytes().map_err(shard_err)?;
                let mut shards = Vec::with_capacity(tile_dims.iter().product());
                for tile in 0..tile_dims.iter().product::<usize>() {
                    let mut bytes = vec![0u8; tile_shape.byte_size()];
                    for_each_element(tile_dims, tile, tile_shape.dims(), dims, |local, global| {
                        bytes[local * elem..(local + 1) * elem]
                            .copy_from_slice(&src[global * elem..(global + 1) * elem]);
                    });
                    shards.push(Literal::from_raw(&tile_shape, bytes).map_err(shard_err)?);
                }
                Ok(shards)
            }
        }
    }

    /// Reassemble the logical value from shards read back from devices.
    ///
    /// Replicated and maximal values come from shard 0. Tiled shards are
    /// placed in row-major tile order and padding is cropped.
    pub fn assemble(&self, shape: &Shape, shards: Vec<Literal>) -> Result<Literal> {
        self.check_shard_count(shards.len())?;
        match self {
            Self::Replicated { .. } | Self::Maximal { .. } => {
                shards.into_iter().next().ok_or_else(|| {
                    RuntimeError::ShardConfiguration("no shards to assemble".into())
                })
            }
            Self::Tiled { tile_dims, .. } => {
                let (dtype, dims) = array_parts(shape)?;
                let tile_shape = self.shard_shape(shape)?;
                let elem = dtype.size_bytes();
                let mut bytes = vec![0u8; shape.byte_size()];
                for (tile, shard) in shards.iter().enumerate() {
                    if shard.shape() != tile_shape {
                        return Err(RuntimeError::ShardConfiguration(format!(
                            "shard {tile} has shape {}, expected {tile_shape}",
                            shard.shape()
                        )));
                    }
                    let src = shard.raw_bytes().map_err(shard_err)?;
                    for_each_element(tile_dims, tile, tile_shape.dims(), dims, |local, global| {
                        bytes[global * elem..(global + 1) * elem]
                            .copy_from_slice(&src[local * elem..(local + 1) * elem]);
                    });
                }
                Literal::from_raw(shape, bytes).map_err(shard_err)
            }
        }
    }
}

fn shard_err(e: tang_program::ProgramError) -> RuntimeError {
    RuntimeError::ShardConfiguration(e.to_string())
}

fn array_parts(shape: &Shape) -> Result<(tang_program::DType, &[usize])> {
    match shape.dtype() {
        Some(dtype) => Ok((dtype, shape.dims())),
        None => Err(RuntimeError::ShardConfiguration(format!(
            "cannot tile tuple shape {shape}"
        ))),
    }
}

fn check_rank(tile_dims: &[usize], dims: &[usize]) -> Result<()> {
    if tile_dims.len() != dims.len() || tile_dims.contains(&0) {
        return Err(RuntimeError::ShardConfiguration(format!(
            "tile grid {tile_dims:?} does not match rank-{} value",
            dims.len()
        )));
    }
    Ok(())
}

/// Visit every in-bounds element of tile `tile` as (offset in tile, offset in
/// the full array), both row-major.
fn for_each_element(
    tile_dims: &[usize],
    tile: usize,
    tile_shape: &[usize],
    full: &[usize],
    mut f: impl FnMut(usize, usize),
) {
    let rank = full.len();
    let coords = unravel(tile, tile_dims);
    let origin: Vec<usize> = coords.iter().zip(tile_shape).map(|(c, s)| c * s).collect();
    let count: usize = tile_shape.iter().product();
    let mut strides = vec![1usize; rank];
    for d in (0..rank.saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * full[d + 1];
    }

    for local in 0..count {
        let idx = unravel(local, tile_shape);
        let mut global = 0;
        let mut in_bounds = true;
        for d in 0..rank {
            let g = origin[d] + idx[d];
            if g >= full[d] {
                in_bounds = false;
                break;
            }
            global += g * strides[d];
        }
        if in_bounds {
            f(local, global);
        }
    }
}

fn unravel(mut flat: usize, dims: &[usize]) -> Vec<usize> {
    let mut idx = vec![0; dims.len()];
    for d in (0..dims.len()).rev() {
        idx[d] = flat % dims[d];
        flat /= dims[d];
    }
    idx
}
