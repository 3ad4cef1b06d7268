//! Reallocation analysis: decides whether a prior reservation snapshot is
//! still valid for a new graph.
//!
//! The analysis is pure over the payload and snapshot; nothing is written on
//! a validation failure.

use engine_common::{EngineError, Result};

use crate::graph::{GraphView, TensorDesc, MAX_SOURCES};

/// Per-tensor allocation metadata captured during reserve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct TensorAlloc {
    pub tensor_id: i32,
    pub buffer_id: i32,
    pub size_max: i32,
    pub alignment: i32,
}

impl Default for TensorAlloc {
    fn default() -> Self {
        Self { tensor_id: -1, buffer_id: -1, size_max: 0, alignment: 0 }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct NodeAlloc {
    pub dst: TensorAlloc,
    pub src: [TensorAlloc; MAX_SOURCES],
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct LeafAlloc {
    pub leaf: TensorAlloc,
}

/// Snapshot captured by the buffer allocator on each reserve.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ReserveSnapshot {
    pub nodes: Vec<NodeAlloc>,
    pub leafs: Vec<LeafAlloc>,
}

fn aligned_size(size: i32, alignment: i32) -> i64 {
    let align = alignment.max(1) as i64;
    let size = size.max(0) as i64;
    (size + align - 1) / align * align
}

/// Size/buffer fitness of one tensor against its snapshot record.
/// External-data and view tensors bypass the check entirely.
fn tensor_fits(desc: &TensorDesc, alloc: &TensorAlloc) -> bool {
    if desc.has_external_data || desc.is_view {
        return true;
    }
    if alloc.buffer_id < 0 {
        return false;
    }
    aligned_size(desc.alloc_size, alloc.alignment) <= alloc.size_max as i64
}

/// Decides whether the snapshot captured at reserve time still covers the
/// graph. Any identity drift (counts, tensor ids, source wiring) or growth
/// beyond the reserved size requires a fresh reserve.
pub fn needs_realloc(graph: &GraphView, snapshot: &ReserveSnapshot) -> Result<bool> {
    graph.validate()?;

    if snapshot.nodes.len() != graph.n_nodes() || snapshot.leafs.len() != graph.n_leafs() {
        return Ok(true);
    }

    for (leaf, alloc) in graph.leafs.iter().zip(snapshot.leafs.iter()) {
        if leaf.tensor_id != alloc.leaf.tensor_id {
            return Ok(true);
        }
        if !tensor_fits(leaf, &alloc.leaf) {
            return Ok(true);
        }
    }

    for (node, alloc) in graph.nodes.iter().zip(snapshot.nodes.iter()) {
        if node.tensor_id != alloc.dst.tensor_id {
            return Ok(true);
        }
        if !tensor_fits(node, &alloc.dst) {
            return Ok(true);
        }
        for slot in 0..MAX_SOURCES {
            let src_id = node.src_ids[slot];
            let src_alloc = &alloc.src[slot];
            if src_id != src_alloc.tensor_id {
                return Ok(true);
            }
            if src_id < 0 {
                continue;
            }
            // Unresolved ids were rejected by validate above.
            let src_desc = graph
                .find(src_id)
                .ok_or(EngineError::InvalidArgument("unresolved src id"))?;
            if !tensor_fits(src_desc, src_alloc) {
                return Ok(true);
            }
        }
    }

    Ok(false)
}
