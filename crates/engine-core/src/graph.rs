//! Opaque tensor graph descriptors exchanged with graph producers.
//!
//! Tensors are stored in flat arrays and reference each other by id, not by
//! pointer; every id used in `src_ids` or `view_src_id` must resolve inside
//! the same view.

use engine_common::{EngineError, Result};

/// Maximum number of source slots per tensor.
pub const MAX_SOURCES: usize = 4;
/// Maximum tensors in one graph array (nodes or leafs).
pub const MAX_GRAPH_TENSORS: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct TensorDesc {
    pub tensor_id: i32,
    pub alloc_size: i32,
    pub src_ids: [i32; MAX_SOURCES],
    pub is_view: bool,
    pub view_src_id: i32,
    pub is_input: bool,
    pub is_output: bool,
    pub has_external_data: bool,
}

impl Default for TensorDesc {
    fn default() -> Self {
        Self {
            tensor_id: -1,
            alloc_size: 0,
            src_ids: [-1; MAX_SOURCES],
            is_view: false,
            view_src_id: -1,
            is_input: false,
            is_output: false,
            has_external_data: false,
        }
    }
}

impl TensorDesc {
    pub fn leaf(tensor_id: i32, alloc_size: i32) -> Self {
        Self { tensor_id, alloc_size, ..Default::default() }
    }

    pub fn node(tensor_id: i32, alloc_size: i32, srcs: &[i32]) -> Self {
        let mut src_ids = [-1; MAX_SOURCES];
        for (slot, &id) in srcs.iter().take(MAX_SOURCES).enumerate() {
            src_ids[slot] = id;
        }
        Self { tensor_id, alloc_size, src_ids, ..Default::default() }
    }

    pub fn view(tensor_id: i32, view_src_id: i32) -> Self {
        let mut desc = Self::node(tensor_id, 0, &[view_src_id]);
        desc.is_view = true;
        desc.view_src_id = view_src_id;
        desc
    }

    pub fn input(mut self) -> Self {
        self.is_input = true;
        self
    }

    pub fn output(mut self) -> Self {
        self.is_output = true;
        self
    }

    pub fn external(mut self) -> Self {
        self.has_external_data = true;
        self
    }
}

/// Immutable borrow of a producer's graph for the duration of one request.
/// Nodes are in execution order; leafs are the inputs and constants they
/// reference.
#[derive(Debug, Clone, Copy)]
pub struct GraphView<'a> {
    pub nodes: &'a [TensorDesc],
    pub leafs: &'a [TensorDesc],
}

impl<'a> GraphView<'a> {
    pub fn new(nodes: &'a [TensorDesc], leafs: &'a [TensorDesc]) -> Self {
        Self { nodes, leafs }
    }

    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn n_leafs(&self) -> usize {
        self.leafs.len()
    }

    pub fn contains(&self, tensor_id: i32) -> bool {
        self.find(tensor_id).is_some()
    }

    pub fn find(&self, tensor_id: i32) -> Option<&TensorDesc> {
        if tensor_id < 0 {
            return None;
        }
        self.nodes
            .iter()
            .chain(self.leafs.iter())
            .find(|t| t.tensor_id == tensor_id)
    }

    /// Checks size bounds and id consistency: every referenced source and
    /// view source must be a descriptor of this view.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.len() > MAX_GRAPH_TENSORS || self.leafs.len() > MAX_GRAPH_TENSORS {
            return Err(EngineError::InvalidArgument("graph exceeds tensor bound"));
        }
        for t in self.nodes.iter().chain(self.leafs.iter()) {
            if t.tensor_id < 0 {
                return Err(EngineError::InvalidArgument("negative tensor id"));
            }
            if t.alloc_size < 0 {
                return Err(EngineError::InvalidArgument("negative alloc size"));
            }
            for &src in &t.src_ids {
                if src >= 0 && !self.contains(src) {
                    return Err(EngineError::InvalidArgument("unresolved src id"));
                }
            }
            if t.is_view {
                if t.view_src_id < 0 {
                    return Err(EngineError::InvalidArgument("view without source"));
                }
                if !self.contains(t.view_src_id) {
                    return Err(EngineError::InvalidArgument("unresolved view src id"));
                }
            }
        }
        Ok(())
    }
}
