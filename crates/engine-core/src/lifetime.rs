//! Tensor lifetime analysis over a topologically ordered graph.
//!
//! Simulates execution order and infers, per tensor, the node index at which
//! its storage is first needed and last needed. Views keep their source
//! alive through a view counter; control-dependency views are excluded from
//! that counter but still occupy their own slot.

use std::collections::HashMap;

use engine_common::{EngineError, Result};

use crate::graph::{MAX_GRAPH_TENSORS, MAX_SOURCES};

#[derive(Debug, Clone, Copy)]
pub struct LifetimeDesc {
    pub tensor_id: i32,
    pub src_ids: [i32; MAX_SOURCES],
    pub is_view: bool,
    pub view_src_id: i32,
    pub is_exec_node: bool,
    pub is_control_dep: bool,
}

impl Default for LifetimeDesc {
    fn default() -> Self {
        Self {
            tensor_id: -1,
            src_ids: [-1; MAX_SOURCES],
            is_view: false,
            view_src_id: -1,
            is_exec_node: false,
            is_control_dep: false,
        }
    }
}

impl LifetimeDesc {
    pub fn leaf(tensor_id: i32) -> Self {
        Self { tensor_id, ..Default::default() }
    }

    pub fn exec(tensor_id: i32, srcs: &[i32]) -> Self {
        let mut src_ids = [-1; MAX_SOURCES];
        for (slot, &id) in srcs.iter().take(MAX_SOURCES).enumerate() {
            src_ids[slot] = id;
        }
        Self { tensor_id, src_ids, is_exec_node: true, ..Default::default() }
    }

    pub fn exec_view(tensor_id: i32, view_src_id: i32) -> Self {
        let mut desc = Self::exec(tensor_id, &[view_src_id]);
        desc.is_view = true;
        desc.view_src_id = view_src_id;
        desc
    }

    pub fn control_dep(mut self) -> Self {
        self.is_control_dep = true;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct LifetimeRanges {
    pub first_use: Vec<i32>,
    pub last_use: Vec<i32>,
}

/// Computes first/last use indices for every tensor. Rejects duplicate or
/// negative ids, unresolved references, views without a source, and counter
/// underflow.
pub fn analyze(tensors: &[LifetimeDesc]) -> Result<LifetimeRanges> {
    if tensors.len() > MAX_GRAPH_TENSORS {
        return Err(EngineError::InvalidArgument("tensor count exceeds bound"));
    }

    let n = tensors.len();
    let mut index: HashMap<i32, usize> = HashMap::with_capacity(n);
    let mut first_use = vec![-1i32; n];
    let mut last_use = vec![-1i32; n];
    let mut n_children = vec![0i32; n];
    let mut n_views = vec![0i32; n];
    let mut view_src_indices = vec![-1i32; n];

    for (i, t) in tensors.iter().enumerate() {
        if t.tensor_id < 0 {
            return Err(EngineError::InvalidArgument("negative tensor id"));
        }
        if index.insert(t.tensor_id, i).is_some() {
            return Err(EngineError::InvalidArgument("duplicate tensor id"));
        }
        if t.is_view && t.view_src_id < 0 {
            return Err(EngineError::InvalidArgument("view without source"));
        }
        first_use[i] = i as i32;
        last_use[i] = i as i32;
    }

    // Count children and views contributed by execution nodes.
    for t in tensors.iter() {
        if !t.is_exec_node {
            continue;
        }
        if t.is_view && !t.is_control_dep {
            let vs = *index
                .get(&t.view_src_id)
                .ok_or(EngineError::InvalidArgument("unresolved view src"))?;
            let ti = index[&t.tensor_id];
            view_src_indices[ti] = vs as i32;
            n_views[vs] += 1;
        }
        for &src in &t.src_ids {
            if src < 0 {
                continue;
            }
            let si = *index
                .get(&src)
                .ok_or(EngineError::InvalidArgument("unresolved src id"))?;
            n_children[si] += 1;
        }
    }

    // Simulate execution and infer release points.
    for (i, t) in tensors.iter().enumerate() {
        if !t.is_exec_node {
            continue;
        }
        for &src in &t.src_ids {
            if src < 0 {
                continue;
            }
            let parent = index[&src];
            n_children[parent] -= 1;
            if n_children[parent] < 0 {
                return Err(EngineError::InvalidArgument("child counter underflow"));
            }
            if n_children[parent] == 0 && n_views[parent] == 0 {
                last_use[parent] = i as i32;
                if tensors[parent].is_view && !tensors[parent].is_control_dep {
                    let vs = view_src_indices[parent];
                    if vs < 0 {
                        return Err(EngineError::InvalidArgument("view src not registered"));
                    }
                    let vs = vs as usize;
                    n_views[vs] -= 1;
                    if n_views[vs] < 0 {
                        return Err(EngineError::InvalidArgument("view counter underflow"));
                    }
                    if n_views[vs] == 0 && n_children[vs] == 0 {
                        last_use[vs] = i as i32;
                    }
                }
            }
        }
    }

    Ok(LifetimeRanges { first_use, last_use })
}
