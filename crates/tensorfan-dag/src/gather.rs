use std::collections::HashMap;
use std::sync::Mutex;

use bytes::BytesMut;
use smallvec::SmallVec;
use tensorfan_core::{IOName, Shape, Tensor};
use tracing::{debug, error};

use crate::error::DagError;
use crate::handler::{InputHandler, NodeInputHandler};
use crate::session::CollapseDetails;

/// Fan-in handler: buffers per-shard tensor fragments and, once every
/// producer edge has finished, consolidates each input into one
/// higher-rank tensor.
///
/// One instance serves all branches feeding a gather node; the executor
/// serializes calls. For a self-locking variant see [`SharedGatherHandler`].
#[derive(Debug)]
pub struct GatherNodeInputHandler {
    base: NodeInputHandler,
    collapse: CollapseDetails,
    total_shards: u32,
    shards: HashMap<IOName, HashMap<u32, Tensor>>,
    /// First validation failure; latched so no partial result is ever
    /// exposed and every later call reports the same error.
    failure: Option<DagError>,
}

impl GatherNodeInputHandler {
    pub fn new(missing_dependency_count: u32, collapse: CollapseDetails) -> Self {
        let total_shards = collapse.total_shards();
        Self {
            base: NodeInputHandler::new(missing_dependency_count * total_shards),
            collapse,
            total_shards,
            shards: HashMap::new(),
            failure: None,
        }
    }

    pub fn total_shards(&self) -> u32 {
        self.total_shards
    }

    pub fn collapse_details(&self) -> &CollapseDetails {
        &self.collapse
    }

    /// Move the consolidated tensors out, leaving the handler empty.
    pub fn take_inputs(&mut self) -> HashMap<IOName, Tensor> {
        self.base.take_inputs()
    }

    fn fail(&mut self, err: DagError) -> DagError {
        error!(%err, "gather handler failed");
        self.failure = Some(err.clone());
        err
    }

    fn validate_fragment(
        &self,
        name: &IOName,
        tensor: &Tensor,
        shard_id: u32,
    ) -> Result<(), DagError> {
        if shard_id >= self.total_shards {
            return Err(DagError::ShardIdOutOfRange {
                shard_id,
                total_shards: self.total_shards,
            });
        }
        if tensor.host_bytes().is_none() {
            return Err(DagError::DeviceShardNotSupported(name.clone()));
        }
        let Some(stored) = self.shards.get(name) else {
            return Ok(());
        };
        // All fragments of one input must agree with the first-seen one.
        if let Some(first) = stored.values().next() {
            if first.desc.dtype != tensor.desc.dtype
                || first.desc.shape != tensor.desc.shape
                || first.byte_len != tensor.byte_len
            {
                return Err(DagError::InconsistentShardDimensions {
                    input: name.clone(),
                    shard_id,
                });
            }
        }
        if stored.contains_key(&shard_id) {
            return Err(DagError::DuplicateShard {
                input: name.clone(),
                shard_id,
            });
        }
        Ok(())
    }

    /// Build the consolidated tensor for every input with a full shard map.
    ///
    /// Inputs still missing shards at this point can never complete (all
    /// producer edges have finished) and are dropped; the executor surfaces
    /// them as missing inputs.
    fn consolidate(&mut self) -> Result<(), DagError> {
        let shards = std::mem::take(&mut self.shards);
        for (name, fragments) in &shards {
            if fragments.len() as u32 != self.total_shards {
                debug!(
                    input = %name,
                    have = fragments.len(),
                    want = self.total_shards,
                    "input incomplete at consolidation, dropping its fragments"
                );
                continue;
            }
            let tensor = consolidate_fragments(name, fragments, &self.collapse);
            self.base.insert(name.clone(), tensor)?;
        }
        Ok(())
    }
}

impl InputHandler for GatherNodeInputHandler {
    fn set_input(&mut self, name: IOName, tensor: Tensor, shard_id: u32) -> Result<(), DagError> {
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        if let Err(err) = self.validate_fragment(&name, &tensor, shard_id) {
            return Err(self.fail(err));
        }
        self.shards.entry(name).or_default().insert(shard_id, tensor);
        Ok(())
    }

    fn notify_finished_dependency(&mut self) -> Result<(), DagError> {
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        self.base.decrement();
        if self.base.remaining_dependencies() > 0 {
            return Ok(());
        }
        match self.consolidate() {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail(err)),
        }
    }

    fn is_ready(&self) -> bool {
        self.failure.is_none() && self.base.is_ready()
    }

    fn inputs(&self) -> &HashMap<IOName, Tensor> {
        self.base.inputs()
    }

    fn clear_inputs(&mut self) {
        self.base.clear_inputs();
        self.shards.clear();
    }
}

/// Stack the fragments of one input into a single tensor.
///
/// The result shape is the per-shard shape with one dimension per collapsed
/// level inserted right after the batch dimension, outer levels first; the
/// batch size stays outermost. Shard `i`'s bytes land at offset
/// `i * per_shard_byte_len`, which is the correct dense layout because the
/// mixed-radix shard ids already order the cross product with the innermost
/// level fastest.
fn consolidate_fragments(
    name: &IOName,
    fragments: &HashMap<u32, Tensor>,
    collapse: &CollapseDetails,
) -> Tensor {
    let total = fragments.len() as u32;
    let reference = fragments.get(&0).expect("shard ids are dense");

    let mut dims: SmallVec<[usize; 6]> = reference.desc.shape.0.clone();
    let insert_at = if dims.is_empty() { 0 } else { 1 };
    for (offset, size) in collapse.collapsed_sizes.iter().enumerate() {
        dims.insert(insert_at + offset, *size as usize);
    }

    let mut buf = BytesMut::with_capacity(reference.byte_len * total as usize);
    for shard_id in 0..total {
        let fragment = fragments.get(&shard_id).expect("shard ids are dense");
        let bytes = fragment.host_bytes().expect("fragments validated as host memory");
        buf.extend_from_slice(bytes);
    }

    debug!(input = %name, shape = ?dims, shards = total, "consolidated gathered input");
    Tensor::from_cpu_bytes(reference.desc.dtype, Shape(dims), buf.freeze())
}

/// Thread-safe wrapper around the one [`GatherNodeInputHandler`] shared by
/// every branch feeding a fan-in node.
///
/// Both entry points run entirely under a single mutex, so the zero-count
/// consolidation check-and-run fires exactly once no matter how branches
/// interleave.
#[derive(Debug)]
pub struct SharedGatherHandler {
    inner: Mutex<GatherNodeInputHandler>,
}

impl SharedGatherHandler {
    pub fn new(missing_dependency_count: u32, collapse: CollapseDetails) -> Self {
        Self {
            inner: Mutex::new(GatherNodeInputHandler::new(
                missing_dependency_count,
                collapse,
            )),
        }
    }

    pub fn set_input(&self, name: IOName, tensor: Tensor, shard_id: u32) -> Result<(), DagError> {
        self.inner.lock().unwrap().set_input(name, tensor, shard_id)
    }

    /// Returns `true` when this call was the one that completed the node
    /// and consolidation has run.
    pub fn notify_finished_dependency(&self) -> Result<bool, DagError> {
        let mut inner = self.inner.lock().unwrap();
        inner.notify_finished_dependency()?;
        Ok(inner.is_ready())
    }

    pub fn is_ready(&self) -> bool {
        self.inner.lock().unwrap().is_ready()
    }

    pub fn take_inputs(&self) -> HashMap<IOName, Tensor> {
        self.inner.lock().unwrap().take_inputs()
    }
}
