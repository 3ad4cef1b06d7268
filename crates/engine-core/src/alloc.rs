//! Top-level buffer allocator.
//!
//! Owns the planner, the chunk allocator, and the realloc analysis, and
//! orchestrates the reserve/alloc lifecycle:
//! `initialize -> reserve/reserve_n/reserve_n_size -> alloc_graph -> release`.
//!
//! Reserve operations persist a per-tensor assignment snapshot (dst plus up
//! to four sources per node, one record per leaf). `alloc_graph` consults it:
//! a stale snapshot triggers a silent replan in single-buffer mode and a
//! backend error in multi-buffer mode, where the caller must reserve
//! explicitly first.

use engine_common::{EngineError, Result};

use crate::chunk::{ChunkAllocator, UNBOUNDED_CHUNK_SIZE};
use crate::graph::GraphView;
use crate::planner::{
    BufferPlanner, PlanRequest, PlanReport, MAX_BUFFERS, DEFAULT_ALIGNMENT, UNBOUNDED_BUFFER_SIZE,
};
use crate::realloc::{self, LeafAlloc, NodeAlloc, ReserveSnapshot, TensorAlloc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocState {
    Uninitialized,
    Ready,
    Allocated,
    Failed,
}

#[derive(Debug, Clone, Copy)]
struct ChunkBinding {
    chunk: usize,
    offset: u64,
    size: u64,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct AllocSummary {
    pub buffer_count: usize,
    pub committed_sizes: Vec<i32>,
    pub chunk_count: usize,
    pub has_snapshot: bool,
}

pub struct BufferAllocator {
    state: AllocState,
    buffer_count: usize,
    buffer_alignments: Vec<i32>,
    buffer_max_sizes: Vec<i32>,
    committed_sizes: Vec<i32>,
    bindings: Vec<Vec<ChunkBinding>>,
    snapshot: Option<ReserveSnapshot>,
    planner: BufferPlanner,
    chunks: ChunkAllocator,
}

impl Default for BufferAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferAllocator {
    pub fn new() -> Self {
        Self {
            state: AllocState::Uninitialized,
            buffer_count: 0,
            buffer_alignments: Vec::new(),
            buffer_max_sizes: Vec::new(),
            committed_sizes: Vec::new(),
            bindings: Vec::new(),
            snapshot: None,
            planner: BufferPlanner::new(),
            chunks: ChunkAllocator::default(),
        }
    }

    pub fn state(&self) -> AllocState {
        self.state
    }

    pub fn summary(&self) -> AllocSummary {
        AllocSummary {
            buffer_count: self.buffer_count,
            committed_sizes: self.committed_sizes.clone(),
            chunk_count: self.chunks.chunk_count(),
            has_snapshot: self.snapshot.is_some(),
        }
    }

    fn guard(&mut self, allowed: &[AllocState], op: &'static str) -> Result<()> {
        if allowed.contains(&self.state) {
            return Ok(());
        }
        self.state = AllocState::Failed;
        Err(EngineError::Sequencing(op))
    }

    /// Validates per-buffer configuration and brings the machine to ready.
    /// Alignments must be powers of two; max sizes must be zero, the
    /// unbounded sentinel, or a multiple of their buffer's alignment.
    pub fn initialize(
        &mut self,
        buffer_count: usize,
        alignments: Option<&[i32]>,
        max_sizes: Option<&[i32]>,
    ) -> Result<()> {
        self.guard(&[AllocState::Uninitialized], "initialize")?;
        if buffer_count == 0 || buffer_count > MAX_BUFFERS {
            return Err(EngineError::InvalidArgument("buffer count out of range"));
        }

        let mut resolved_align = vec![DEFAULT_ALIGNMENT; buffer_count];
        if let Some(given) = alignments {
            if given.len() < buffer_count {
                return Err(EngineError::InvalidArgument("short buffer alignments"));
            }
            for (slot, &a) in resolved_align.iter_mut().zip(given.iter()) {
                if a <= 0 || (a as u64).count_ones() != 1 {
                    return Err(EngineError::InvalidArgument("alignment must be a power of two"));
                }
                *slot = a;
            }
        }
        let mut resolved_max = vec![0i32; buffer_count];
        if let Some(given) = max_sizes {
            if given.len() < buffer_count {
                return Err(EngineError::InvalidArgument("short buffer max sizes"));
            }
            for (b, (slot, &m)) in resolved_max.iter_mut().zip(given.iter()).enumerate() {
                if m < 0 {
                    return Err(EngineError::InvalidArgument("negative buffer max size"));
                }
                if m != 0 && m != UNBOUNDED_BUFFER_SIZE {
                    let align = resolved_align[b];
                    if m < align || m % align != 0 {
                        return Err(EngineError::InvalidArgument(
                            "buffer max size must be a multiple of its alignment",
                        ));
                    }
                }
                *slot = m;
            }
        }

        // One chunk allocator backs every buffer: configure it with the
        // largest alignment and the largest finite max size.
        let chunk_align = resolved_align.iter().copied().max().unwrap_or(DEFAULT_ALIGNMENT) as u64;
        let chunk_max = resolved_max
            .iter()
            .copied()
            .filter(|&m| m != 0 && m != UNBOUNDED_BUFFER_SIZE)
            .max()
            .map(|m| (m as u64 + chunk_align - 1) / chunk_align * chunk_align)
            .unwrap_or(UNBOUNDED_CHUNK_SIZE);
        self.chunks.configure(chunk_align, chunk_max)?;

        self.buffer_count = buffer_count;
        self.buffer_alignments = resolved_align;
        self.buffer_max_sizes = resolved_max;
        self.committed_sizes = vec![0; buffer_count];
        self.bindings = vec![Vec::new(); buffer_count];
        self.snapshot = None;
        self.state = AllocState::Ready;
        Ok(())
    }

    fn run_planner(
        &mut self,
        graph: GraphView,
        node_buffer_ids: Option<&[i32]>,
        leaf_buffer_ids: Option<&[i32]>,
        size_only: bool,
    ) -> Result<PlanReport> {
        // Alignments and max sizes are the allocator's own configuration.
        let alignments = self.buffer_alignments.clone();
        let max_sizes = self.buffer_max_sizes.clone();
        let req = PlanRequest {
            graph,
            node_buffer_ids,
            leaf_buffer_ids,
            buffer_count: self.buffer_count,
            buffer_alignments: Some(&alignments),
            buffer_max_sizes: Some(&max_sizes),
            size_only,
        };
        self.planner.plan(&req)
    }

    /// Size-only planning; reports the required bytes per buffer without
    /// touching committed chunks or the snapshot.
    pub fn reserve_n_size(
        &mut self,
        graph: GraphView,
        node_buffer_ids: Option<&[i32]>,
        leaf_buffer_ids: Option<&[i32]>,
    ) -> Result<Vec<i32>> {
        self.guard(&[AllocState::Ready, AllocState::Allocated], "reserve_n_size")?;
        let report = self.run_planner(graph, node_buffer_ids, leaf_buffer_ids, true)?;
        self.state = AllocState::Ready;
        Ok(report.bytes_by_buffer)
    }

    /// Full reserve: plans, grows committed chunks to match the planned
    /// per-chunk size vectors, and captures the reservation snapshot.
    pub fn reserve_n(
        &mut self,
        graph: GraphView,
        node_buffer_ids: Option<&[i32]>,
        leaf_buffer_ids: Option<&[i32]>,
    ) -> Result<()> {
        self.guard(&[AllocState::Ready, AllocState::Allocated], "reserve_n")?;
        let report = self.run_planner(graph, node_buffer_ids, leaf_buffer_ids, false)?;
        if let Err(err) = self.commit_chunks(&report) {
            self.state = AllocState::Failed;
            return Err(err);
        }
        self.snapshot = Some(self.build_snapshot(graph));
        self.state = AllocState::Ready;
        Ok(())
    }

    /// Shorthand for `reserve_n` with every tensor assigned to buffer 0.
    pub fn reserve(&mut self, graph: GraphView) -> Result<()> {
        self.reserve_n(graph, None, None)
    }

    /// Marks the graph's tensors allocated against the committed chunks.
    /// A stale snapshot triggers auto-reserve in single-buffer mode and a
    /// backend error otherwise; the machine stays ready so the caller can
    /// reserve explicitly.
    pub fn alloc_graph(&mut self, graph: GraphView) -> Result<()> {
        self.guard(&[AllocState::Ready, AllocState::Allocated], "alloc_graph")?;
        let prior = self.state;
        let needs = match &self.snapshot {
            Some(snapshot) => match realloc::needs_realloc(&graph, snapshot) {
                Ok(needs) => needs,
                Err(err) => {
                    self.state = prior;
                    return Err(err);
                }
            },
            None => true,
        };

        if !needs {
            self.state = AllocState::Allocated;
            return Ok(());
        }

        if self.buffer_count == 1 {
            tracing::debug!(target: "alloc", "graph drift detected, auto-reserving");
            match self.run_planner(graph, None, None, false).and_then(|report| {
                self.commit_chunks(&report)?;
                Ok(())
            }) {
                Ok(()) => {
                    self.snapshot = Some(self.build_snapshot(graph));
                    self.state = AllocState::Allocated;
                    Ok(())
                }
                Err(err) => {
                    self.state = AllocState::Failed;
                    Err(err)
                }
            }
        } else {
            tracing::warn!(target: "alloc", "graph drift with multiple buffers, explicit reserve required");
            self.state = prior;
            Err(EngineError::Backend("reservation stale, explicit reserve required"))
        }
    }

    /// Releases all committed chunk bindings, resets the chunk allocator and
    /// snapshot, and returns to uninitialized.
    pub fn release(&mut self) -> Result<()> {
        for buffer in 0..self.bindings.len() {
            self.bindings[buffer].clear();
        }
        self.chunks.reset();
        self.snapshot = None;
        self.committed_sizes.clear();
        self.buffer_alignments.clear();
        self.buffer_max_sizes.clear();
        self.buffer_count = 0;
        self.state = AllocState::Uninitialized;
        Ok(())
    }

    pub fn get_buffer_size(&self, buffer: usize) -> i32 {
        self.committed_sizes.get(buffer).copied().unwrap_or(0)
    }

    pub fn get_buffer_chunk_id(&self, buffer: usize) -> i32 {
        self.bindings
            .get(buffer)
            .and_then(|b| b.first())
            .map(|b| b.chunk as i32)
            .unwrap_or(-1)
    }

    pub fn get_buffer_chunk_offset(&self, buffer: usize) -> u64 {
        self.bindings
            .get(buffer)
            .and_then(|b| b.first())
            .map(|b| b.offset)
            .unwrap_or(0)
    }

    pub fn get_buffer_alloc_size(&self, buffer: usize) -> u64 {
        self.bindings
            .get(buffer)
            .map(|b| b.iter().map(|binding| binding.size).sum())
            .unwrap_or(0)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.chunk_count()
    }

    /// Grows committed chunk bindings to the planned per-chunk vectors.
    /// Shrinking plans keep their existing bindings.
    fn commit_chunks(&mut self, report: &PlanReport) -> Result<()> {
        for buffer in 0..self.buffer_count {
            let planned = &report.chunk_sizes[buffer];
            let current = &self.bindings[buffer];
            let fits = planned.len() <= current.len()
                && planned
                    .iter()
                    .zip(current.iter())
                    .all(|(&want, have)| want as u64 <= have.size);
            if fits {
                continue;
            }
            let old = std::mem::take(&mut self.bindings[buffer]);
            for binding in old {
                self.chunks.release(binding.chunk, binding.offset, binding.size)?;
            }
            let mut fresh = Vec::with_capacity(planned.len());
            for &size in planned {
                let region = self.chunks.allocate(size as u64)?;
                fresh.push(ChunkBinding {
                    chunk: region.chunk,
                    offset: region.offset,
                    size: region.aligned_size,
                });
            }
            self.bindings[buffer] = fresh;
            self.committed_sizes[buffer] = report.bytes_by_buffer[buffer];
        }
        Ok(())
    }

    fn snapshot_entry(&self, tensor_id: i32) -> TensorAlloc {
        match self.planner.record(tensor_id) {
            Some(record) => {
                let buffer = record.buffer_id.max(0) as usize;
                TensorAlloc {
                    tensor_id: record.tensor_id,
                    buffer_id: record.buffer_id,
                    size_max: record.alloc_reserved,
                    alignment: self.buffer_alignments.get(buffer).copied().unwrap_or(DEFAULT_ALIGNMENT),
                }
            }
            None => TensorAlloc::default(),
        }
    }

    fn build_snapshot(&self, graph: GraphView) -> ReserveSnapshot {
        let mut snapshot = ReserveSnapshot::default();
        for leaf in graph.leafs {
            snapshot.leafs.push(LeafAlloc { leaf: self.snapshot_entry(leaf.tensor_id) });
        }
        for node in graph.nodes {
            let mut alloc = NodeAlloc { dst: self.snapshot_entry(node.tensor_id), ..Default::default() };
            for (slot, &src) in node.src_ids.iter().enumerate() {
                if src >= 0 {
                    alloc.src[slot] = self.snapshot_entry(src);
                }
            }
            snapshot.nodes.push(alloc);
        }
        snapshot
    }
}
