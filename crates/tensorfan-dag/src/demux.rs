use tensorfan_core::{Shape, Tensor};
use tracing::{debug, error};

use crate::error::DagError;

/// Upper bound on dim[0] when discovering the shard count dynamically.
pub const DEMULTIPLEX_LIMIT: usize = 10_000;

/// Split a host tensor along dimension 0 into per-shard fragments.
///
/// Each fragment drops dim 0 and keeps the remaining shape, so the input
/// must be at least rank 3: a batch dimension has to survive the split.
/// Fragments alias the source buffer (refcounted slices, no copy) and stay
/// valid independently of the source tensor value.
///
/// `declared_count` is the node's static shard count; `None` means the
/// count is discovered from dim 0 at runtime.
pub fn demultiplex(tensor: &Tensor, declared_count: Option<u32>) -> Result<Vec<Tensor>, DagError> {
    let dims = tensor.desc.shape.dims();
    if dims.len() < 3 {
        error!(rank = dims.len(), "tensor rank too small to demultiplex");
        return Err(DagError::WrongRankToDemultiplex { rank: dims.len() });
    }
    let count = dims[0];
    if count > DEMULTIPLEX_LIMIT {
        error!(count, limit = DEMULTIPLEX_LIMIT, "dim[0] too large to demultiplex");
        return Err(DagError::TooManyShards(count));
    }
    if let Some(declared) = declared_count {
        if declared as usize != count {
            error!(declared, actual = count, "dim[0] disagrees with the declared shard count");
            return Err(DagError::WrongShardCountToDemultiplex {
                declared,
                actual: count,
            });
        }
    }
    if count == 0 {
        error!("cannot demultiplex a tensor with zero shards");
        return Err(DagError::NoShardsToDemultiplex);
    }
    let Some(bytes) = tensor.host_bytes() else {
        error!("cannot demultiplex a device-memory tensor");
        return Err(DagError::DeviceDemultiplexNotSupported);
    };

    let shard_shape = Shape::from_slice(&dims[1..]);
    let step = tensor.byte_len / count;
    let shards = (0..count)
        .map(|i| {
            Tensor::from_cpu_bytes(
                tensor.desc.dtype,
                shard_shape.clone(),
                bytes.slice(i * step..(i + 1) * step),
            )
        })
        .collect();
    debug!(count, shard_shape = ?shard_shape.dims(), "demultiplexed tensor");
    Ok(shards)
}
