use std::collections::HashMap;

use tensorfan_core::{IOName, Tensor};
use tracing::error;

use crate::error::DagError;

/// Readiness tracking for one node session.
///
/// The executor feeds tensors in with `set_input` and signals each finished
/// producer edge with `notify_finished_dependency`; the node may run once
/// the handler reports ready.
pub trait InputHandler {
    /// Store one arriving tensor. `shard_id` is ignored by plain nodes;
    /// fan-in handlers use it to slot the fragment.
    fn set_input(&mut self, name: IOName, tensor: Tensor, shard_id: u32) -> Result<(), DagError>;

    /// One producer edge finished. Fan-in handlers consolidate when the
    /// count reaches zero.
    fn notify_finished_dependency(&mut self) -> Result<(), DagError>;

    fn is_ready(&self) -> bool;

    fn inputs(&self) -> &HashMap<IOName, Tensor>;

    /// Drop stored tensors so the session can be reused. The dependency
    /// counter is not reset.
    fn clear_inputs(&mut self);
}

/// Base case: an ordinary node with one producer per edge and no fan-in.
#[derive(Debug)]
pub struct NodeInputHandler {
    remaining_dependencies: u32,
    inputs: HashMap<IOName, Tensor>,
}

impl NodeInputHandler {
    pub fn new(missing_dependency_count: u32) -> Self {
        Self {
            remaining_dependencies: missing_dependency_count,
            inputs: HashMap::new(),
        }
    }

    pub fn remaining_dependencies(&self) -> u32 {
        self.remaining_dependencies
    }

    /// Move the stored tensors out, leaving the handler empty.
    pub fn take_inputs(&mut self) -> HashMap<IOName, Tensor> {
        std::mem::take(&mut self.inputs)
    }

    pub(crate) fn insert(&mut self, name: IOName, tensor: Tensor) -> Result<(), DagError> {
        if self.inputs.contains_key(&name) {
            error!(input = %name, "input already set");
            return Err(DagError::DuplicateInput(name));
        }
        self.inputs.insert(name, tensor);
        Ok(())
    }

    pub(crate) fn decrement(&mut self) {
        // Underflow means the executor and this handler disagree on the edge
        // count; clamping would hide the corruption.
        assert!(
            self.remaining_dependencies > 0,
            "dependency counter underflow"
        );
        self.remaining_dependencies -= 1;
    }
}

impl InputHandler for NodeInputHandler {
    fn set_input(&mut self, name: IOName, tensor: Tensor, _shard_id: u32) -> Result<(), DagError> {
        self.insert(name, tensor)
    }

    fn notify_finished_dependency(&mut self) -> Result<(), DagError> {
        self.decrement();
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.remaining_dependencies == 0
    }

    fn inputs(&self) -> &HashMap<IOName, Tensor> {
        &self.inputs
    }

    fn clear_inputs(&mut self) {
        self.inputs.clear();
    }
}
