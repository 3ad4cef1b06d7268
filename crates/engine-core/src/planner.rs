//! Phased buffer planner.
//!
//! Given a graph and per-tensor buffer assignments, walks the execution
//! order once and computes final byte requirements per buffer, enforcing
//! tensor offsets inside per-buffer layouts. The pipeline runs
//! `reset -> seed_leafs -> count_references -> alloc_explicit_inputs ->
//! plan_nodes -> release_expired -> finalize -> split_required`; each phase
//! is either the default implementation or a strategy-provided override.

use std::collections::HashMap;

use engine_common::{EngineError, Result};

use crate::graph::GraphView;
use crate::graph::TensorDesc;

pub const MAX_BUFFERS: usize = 16;
pub const MAX_FREE_BLOCKS: usize = 256;
pub const MAX_CHUNKS_PER_BUFFER: usize = 16;
pub const DEFAULT_ALIGNMENT: i32 = 16;
/// Per-buffer max-size sentinel for "no splitting".
pub const UNBOUNDED_BUFFER_SIZE: i32 = i32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanPhase {
    Idle,
    Resetting,
    SeedingLeafs,
    CountingReferences,
    AllocatingExplicitInputs,
    PlanningNodes,
    ReleasingExpired,
    Finalizing,
    SplittingRequired,
    Done,
    Errored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlock {
    pub offset: i32,
    pub size: i32,
}

/// Per-buffer layout state. The high watermark grows only when no free
/// block fits.
#[derive(Debug, Clone, Default)]
pub struct BufferLayout {
    pub free_blocks: Vec<FreeBlock>,
    pub high_watermark: i32,
}

#[derive(Debug, Clone)]
pub struct TensorRecord {
    pub tensor_id: i32,
    pub alloc_size: i32,
    pub buffer_id: i32,
    pub alloc_offset: i32,
    pub alloc_reserved: i32,
    pub n_children: i32,
    pub n_views: i32,
    pub view_src_id: i32,
    pub is_view: bool,
    pub is_input: bool,
    pub is_output: bool,
    pub allocatable: bool,
    pub allocated: bool,
    /// Storage was inherited by an in-place consumer; do not free it when
    /// this record expires.
    pub consumed: bool,
}

impl Default for TensorRecord {
    fn default() -> Self {
        Self {
            tensor_id: -1,
            alloc_size: 0,
            buffer_id: 0,
            alloc_offset: -1,
            alloc_reserved: 0,
            n_children: 0,
            n_views: 0,
            view_src_id: -1,
            is_view: false,
            is_input: false,
            is_output: false,
            allocatable: false,
            allocated: false,
            consumed: false,
        }
    }
}

/// Mutable planning state shared with strategy overrides.
#[derive(Debug, Clone, Default)]
pub struct PlannerContext {
    pub buffer_count: usize,
    pub nodes: Vec<TensorDesc>,
    pub leafs: Vec<TensorDesc>,
    pub node_buffer_ids: Vec<i32>,
    pub leaf_buffer_ids: Vec<i32>,
    pub buffer_alignments: Vec<i32>,
    pub buffer_max_sizes: Vec<i32>,
    pub layouts: Vec<BufferLayout>,
    pub records: Vec<TensorRecord>,
    pub index: HashMap<i32, usize>,
    pub bytes_by_buffer: Vec<i32>,
    pub max_alloc_by_buffer: Vec<i32>,
    pub chunk_sizes: Vec<Vec<i32>>,
    pub total_bytes: i32,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PlanReport {
    pub bytes_by_buffer: Vec<i32>,
    pub max_alloc_by_buffer: Vec<i32>,
    pub chunk_sizes: Vec<Vec<i32>>,
    pub total_bytes: i32,
    pub multi_chunk: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct PlanRequest<'a> {
    pub graph: GraphView<'a>,
    pub node_buffer_ids: Option<&'a [i32]>,
    pub leaf_buffer_ids: Option<&'a [i32]>,
    pub buffer_count: usize,
    pub buffer_alignments: Option<&'a [i32]>,
    pub buffer_max_sizes: Option<&'a [i32]>,
    pub size_only: bool,
}

impl<'a> PlanRequest<'a> {
    pub fn new(graph: GraphView<'a>) -> Self {
        Self {
            graph,
            node_buffer_ids: None,
            leaf_buffer_ids: None,
            buffer_count: 1,
            buffer_alignments: None,
            buffer_max_sizes: None,
            size_only: false,
        }
    }
}

/// Strategy bundle: any phase may be overridden; the rest fall back to the
/// defaults below. An override returning an error terminates the pipeline.
pub trait PlanStrategy {
    fn seed_leafs(&self, ctx: &mut PlannerContext) -> Result<()> {
        defaults::seed_leafs(ctx)
    }
    fn count_references(&self, ctx: &mut PlannerContext) -> Result<()> {
        defaults::count_references(ctx)
    }
    fn alloc_explicit_inputs(&self, ctx: &mut PlannerContext) -> Result<()> {
        defaults::alloc_explicit_inputs(ctx)
    }
    fn plan_nodes(&self, ctx: &mut PlannerContext) -> Result<()> {
        defaults::plan_nodes(ctx)
    }
    fn release_expired(&self, ctx: &mut PlannerContext) -> Result<()> {
        defaults::release_expired(ctx)
    }
    fn finalize(&self, ctx: &mut PlannerContext) -> Result<()> {
        defaults::finalize(ctx)
    }
}

/// The default phase set matching ggml's graph-allocator behavior.
pub struct GallocrParity;

impl PlanStrategy for GallocrParity {}

/// Terminal outcome delivery to an owner. A missing observer degrades to
/// plain error returns.
pub trait PlanObserver {
    fn on_plan_done(&mut self, _report: &PlanReport) {}
    fn on_plan_error(&mut self, _err: &EngineError) {}
}

pub struct NoopObserver;

impl PlanObserver for NoopObserver {}

fn align_up(size: i32, alignment: i32) -> Result<i32> {
    let align = alignment.max(1) as i64;
    let aligned = (size.max(0) as i64 + align - 1) / align * align;
    if aligned > i32::MAX as i64 {
        return Err(EngineError::Backend("aligned size overflows"));
    }
    Ok(aligned as i32)
}

pub mod defaults {
    use super::*;

    pub fn seed_leafs(ctx: &mut PlannerContext) -> Result<()> {
        for (i, leaf) in ctx.leafs.iter().enumerate() {
            let record = TensorRecord {
                tensor_id: leaf.tensor_id,
                alloc_size: leaf.alloc_size,
                buffer_id: ctx.leaf_buffer_ids.get(i).copied().unwrap_or(0),
                is_input: leaf.is_input,
                is_output: leaf.is_output,
                allocatable: !leaf.has_external_data,
                ..Default::default()
            };
            if ctx.index.insert(leaf.tensor_id, ctx.records.len()).is_some() {
                return Err(EngineError::InvalidArgument("duplicate tensor id"));
            }
            ctx.records.push(record);
        }
        Ok(())
    }

    pub fn count_references(ctx: &mut PlannerContext) -> Result<()> {
        for (i, node) in ctx.nodes.iter().enumerate() {
            let record = TensorRecord {
                tensor_id: node.tensor_id,
                alloc_size: node.alloc_size,
                buffer_id: ctx.node_buffer_ids.get(i).copied().unwrap_or(0),
                view_src_id: node.view_src_id,
                is_view: node.is_view,
                is_input: node.is_input,
                is_output: node.is_output,
                allocatable: !node.has_external_data && !node.is_view,
                ..Default::default()
            };
            if ctx.index.insert(node.tensor_id, ctx.records.len()).is_some() {
                return Err(EngineError::InvalidArgument("duplicate tensor id"));
            }
            ctx.records.push(record);
        }
        let nodes = ctx.nodes.clone();
        for node in &nodes {
            for &src in &node.src_ids {
                if src < 0 {
                    continue;
                }
                let si = *ctx
                    .index
                    .get(&src)
                    .ok_or(EngineError::InvalidArgument("unresolved src id"))?;
                ctx.records[si].n_children += 1;
            }
            if node.is_view {
                let vi = *ctx
                    .index
                    .get(&node.view_src_id)
                    .ok_or(EngineError::InvalidArgument("unresolved view src id"))?;
                ctx.records[vi].n_views += 1;
            }
        }
        Ok(())
    }

    pub fn alloc_explicit_inputs(ctx: &mut PlannerContext) -> Result<()> {
        for i in 0..ctx.leafs.len() {
            let ri = ctx.index[&ctx.leafs[i].tensor_id];
            if !ctx.records[ri].allocatable || ctx.records[ri].allocated {
                continue;
            }
            allocate_record(ctx, ri)?;
        }
        Ok(())
    }

    pub fn plan_nodes(ctx: &mut PlannerContext) -> Result<()> {
        for i in 0..ctx.nodes.len() {
            let node = ctx.nodes[i];
            let di = ctx.index[&node.tensor_id];

            if !ctx.records[di].is_view
                && ctx.records[di].allocatable
                && !ctx.records[di].allocated
            {
                let aligned = align_up(
                    ctx.records[di].alloc_size,
                    ctx.buffer_alignments[ctx.records[di].buffer_id as usize],
                )?;
                match find_inplace_source(ctx, di, &node, aligned) {
                    Some(pi) => {
                        ctx.records[pi].consumed = true;
                        let (offset, reserved) =
                            (ctx.records[pi].alloc_offset, ctx.records[pi].alloc_reserved);
                        let dst = &mut ctx.records[di];
                        dst.alloc_offset = offset;
                        dst.alloc_reserved = reserved;
                        dst.allocated = true;
                        tracing::debug!(
                            target: "planner",
                            node = node.tensor_id,
                            reused = ctx.records[pi].tensor_id,
                            "in-place reuse"
                        );
                    }
                    None => allocate_record(ctx, di)?,
                }
            }

            release_node_sources(ctx, i)?;
        }
        Ok(())
    }

    pub fn release_expired(ctx: &mut PlannerContext) -> Result<()> {
        // Lifetime decrements run inline while nodes are planned so freed
        // blocks are reusable by later nodes; this phase settles whatever
        // outlived the walk and checks counter consistency.
        let mut outstanding = 0i64;
        for r in &ctx.records {
            if r.n_children < 0 || r.n_views < 0 {
                return Err(EngineError::InvalidArgument("reference counter underflow"));
            }
            if r.allocated && !r.consumed {
                outstanding += r.alloc_reserved as i64;
            }
        }
        tracing::debug!(target: "planner", outstanding, "live bytes after node walk");
        Ok(())
    }

    pub fn finalize(ctx: &mut PlannerContext) -> Result<()> {
        ctx.bytes_by_buffer = ctx.layouts.iter().map(|l| l.high_watermark).collect();
        ctx.max_alloc_by_buffer = vec![0; ctx.buffer_count];
        for r in &ctx.records {
            let b = r.buffer_id as usize;
            if r.alloc_reserved > ctx.max_alloc_by_buffer[b] {
                ctx.max_alloc_by_buffer[b] = r.alloc_reserved;
            }
        }
        ctx.total_bytes = 0;
        for &bytes in &ctx.bytes_by_buffer {
            ctx.total_bytes = ctx
                .total_bytes
                .checked_add(bytes)
                .ok_or(EngineError::Backend("total bytes overflow"))?;
        }

        ctx.chunk_sizes = vec![Vec::new(); ctx.buffer_count];
        for b in 0..ctx.buffer_count {
            let bytes = ctx.bytes_by_buffer[b];
            if bytes == 0 {
                continue;
            }
            let max = ctx.buffer_max_sizes[b];
            if max > 0 && max != UNBOUNDED_BUFFER_SIZE && bytes > max {
                let full = (bytes / max) as usize;
                let rem = bytes % max;
                let mut sizes = vec![max; full];
                if rem > 0 {
                    sizes.push(align_up(rem, ctx.buffer_alignments[b])?);
                }
                if sizes.len() > MAX_CHUNKS_PER_BUFFER {
                    return Err(EngineError::Backend("chunk plan exceeds per-buffer limit"));
                }
                ctx.chunk_sizes[b] = sizes;
            } else {
                ctx.chunk_sizes[b] = vec![bytes];
            }
        }
        Ok(())
    }

    /// Best-fit placement inside the record's buffer layout, growing the
    /// high watermark when nothing fits.
    pub fn allocate_record(ctx: &mut PlannerContext, ri: usize) -> Result<()> {
        let buffer = ctx.records[ri].buffer_id as usize;
        let aligned = align_up(ctx.records[ri].alloc_size, ctx.buffer_alignments[buffer])?;
        let layout = &mut ctx.layouts[buffer];

        let mut best: Option<usize> = None;
        for (bi, block) in layout.free_blocks.iter().enumerate() {
            if block.size < aligned {
                continue;
            }
            match best {
                Some(prev) if layout.free_blocks[prev].size <= block.size => {}
                _ => best = Some(bi),
            }
        }

        let offset = match best {
            Some(bi) => {
                let offset = layout.free_blocks[bi].offset;
                if layout.free_blocks[bi].size == aligned {
                    layout.free_blocks.remove(bi);
                } else {
                    layout.free_blocks[bi].offset += aligned;
                    layout.free_blocks[bi].size -= aligned;
                }
                offset
            }
            None => {
                let offset = align_up(layout.high_watermark, ctx.buffer_alignments[buffer])?;
                layout.high_watermark = offset
                    .checked_add(aligned)
                    .ok_or(EngineError::Backend("buffer watermark overflow"))?;
                offset
            }
        };

        let record = &mut ctx.records[ri];
        record.alloc_offset = offset;
        record.alloc_reserved = aligned;
        record.allocated = true;
        Ok(())
    }

    /// In-place candidate search for a node about to be planned. A source
    /// qualifies when this node is its only remaining consumer and its
    /// reservation covers the destination; a view source is looked through
    /// to its storage owner.
    fn find_inplace_source(
        ctx: &PlannerContext,
        di: usize,
        node: &TensorDesc,
        aligned: i32,
    ) -> Option<usize> {
        let dst_buffer = ctx.records[di].buffer_id;
        for &src in &node.src_ids {
            if src < 0 {
                continue;
            }
            let pi = *ctx.index.get(&src)?;
            let p = &ctx.records[pi];
            if p.n_children != 1 || p.n_views != 0 || p.is_output {
                continue;
            }
            if p.is_view {
                let vi = match ctx.index.get(&p.view_src_id) {
                    Some(&vi) => vi,
                    None => continue,
                };
                let vs = &ctx.records[vi];
                if vs.n_views == 1
                    && vs.n_children == 0
                    && !vs.is_view
                    && !vs.is_output
                    && !vs.consumed
                    && vs.allocated
                    && vs.buffer_id == dst_buffer
                    && vs.alloc_reserved >= aligned
                {
                    return Some(vi);
                }
            } else if p.allocated
                && !p.consumed
                && p.buffer_id == dst_buffer
                && p.alloc_reserved >= aligned
            {
                return Some(pi);
            }
        }
        None
    }

    /// Applies the lifetime decrement rules for node `i` and returns expired
    /// regions to their layout's free list.
    fn release_node_sources(ctx: &mut PlannerContext, i: usize) -> Result<()> {
        let node = ctx.nodes[i];
        for &src in &node.src_ids {
            if src < 0 {
                continue;
            }
            let pi = ctx.index[&src];
            ctx.records[pi].n_children -= 1;
            if ctx.records[pi].n_children < 0 {
                return Err(EngineError::InvalidArgument("child counter underflow"));
            }
            if ctx.records[pi].n_children == 0 && ctx.records[pi].n_views == 0 {
                expire_record(ctx, pi)?;
            }
        }
        Ok(())
    }

    fn expire_record(ctx: &mut PlannerContext, ri: usize) -> Result<()> {
        if ctx.records[ri].is_view {
            let vi = *ctx
                .index
                .get(&ctx.records[ri].view_src_id)
                .ok_or(EngineError::InvalidArgument("unresolved view src id"))?;
            ctx.records[vi].n_views -= 1;
            if ctx.records[vi].n_views < 0 {
                return Err(EngineError::InvalidArgument("view counter underflow"));
            }
            if ctx.records[vi].n_views == 0 && ctx.records[vi].n_children == 0 {
                expire_record(ctx, vi)?;
            }
            return Ok(());
        }
        let r = &ctx.records[ri];
        if !r.allocated || r.consumed || r.is_output {
            return Ok(());
        }
        free_region(ctx, r.buffer_id as usize, r.alloc_offset, r.alloc_reserved)
    }

    fn free_region(ctx: &mut PlannerContext, buffer: usize, offset: i32, size: i32) -> Result<()> {
        if size <= 0 {
            return Ok(());
        }
        let layout = &mut ctx.layouts[buffer];
        let end = offset + size;
        let at = layout.free_blocks.partition_point(|b| b.offset < offset);
        let merges_prev = at > 0
            && layout.free_blocks[at - 1].offset + layout.free_blocks[at - 1].size == offset;
        let merges_next = at < layout.free_blocks.len() && layout.free_blocks[at].offset == end;
        match (merges_prev, merges_next) {
            (true, true) => {
                layout.free_blocks[at - 1].size += size + layout.free_blocks[at].size;
                layout.free_blocks.remove(at);
            }
            (true, false) => layout.free_blocks[at - 1].size += size,
            (false, true) => {
                layout.free_blocks[at].offset = offset;
                layout.free_blocks[at].size += size;
            }
            (false, false) => {
                if layout.free_blocks.len() >= MAX_FREE_BLOCKS {
                    return Err(EngineError::Backend("free block table full"));
                }
                layout.free_blocks.insert(at, FreeBlock { offset, size });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct BufferPlanner {
    phase: PlanPhase,
    ctx: PlannerContext,
    report: PlanReport,
}

impl Default for PlanPhase {
    fn default() -> Self {
        PlanPhase::Idle
    }
}

impl BufferPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> PlanPhase {
        self.phase
    }

    pub fn total_bytes(&self) -> i32 {
        self.ctx.total_bytes
    }

    pub fn records(&self) -> &[TensorRecord] {
        &self.ctx.records
    }

    pub fn record(&self, tensor_id: i32) -> Option<&TensorRecord> {
        self.ctx.index.get(&tensor_id).map(|&i| &self.ctx.records[i])
    }

    pub fn buffer_alignment(&self, buffer: usize) -> i32 {
        self.ctx.buffer_alignments.get(buffer).copied().unwrap_or(DEFAULT_ALIGNMENT)
    }

    pub fn last_report(&self) -> &PlanReport {
        &self.report
    }

    /// Runs the full pipeline with the gallocr-parity defaults.
    pub fn plan(&mut self, req: &PlanRequest) -> Result<PlanReport> {
        self.plan_with(req, &GallocrParity, &mut NoopObserver)
    }

    /// Runs the full pipeline with a strategy bundle and terminal-outcome
    /// observer. A fresh request resets the machine regardless of the prior
    /// terminal state.
    pub fn plan_with(
        &mut self,
        req: &PlanRequest,
        strategy: &dyn PlanStrategy,
        observer: &mut dyn PlanObserver,
    ) -> Result<PlanReport> {
        match self.run_pipeline(req, strategy) {
            Ok(report) => {
                self.phase = PlanPhase::Done;
                self.report = report.clone();
                observer.on_plan_done(&report);
                Ok(report)
            }
            Err(err) => {
                self.phase = PlanPhase::Errored;
                observer.on_plan_error(&err);
                Err(err)
            }
        }
    }

    fn run_pipeline(&mut self, req: &PlanRequest, strategy: &dyn PlanStrategy) -> Result<PlanReport> {
        self.phase = PlanPhase::Resetting;
        self.reset(req)?;

        self.phase = PlanPhase::SeedingLeafs;
        strategy.seed_leafs(&mut self.ctx)?;

        self.phase = PlanPhase::CountingReferences;
        strategy.count_references(&mut self.ctx)?;

        self.phase = PlanPhase::AllocatingExplicitInputs;
        strategy.alloc_explicit_inputs(&mut self.ctx)?;

        self.phase = PlanPhase::PlanningNodes;
        strategy.plan_nodes(&mut self.ctx)?;

        self.phase = PlanPhase::ReleasingExpired;
        strategy.release_expired(&mut self.ctx)?;

        self.phase = PlanPhase::Finalizing;
        strategy.finalize(&mut self.ctx)?;

        self.phase = PlanPhase::SplittingRequired;
        let multi_chunk = self.ctx.chunk_sizes.iter().any(|sizes| sizes.len() > 1);
        Ok(PlanReport {
            bytes_by_buffer: self.ctx.bytes_by_buffer.clone(),
            max_alloc_by_buffer: self.ctx.max_alloc_by_buffer.clone(),
            chunk_sizes: self.ctx.chunk_sizes.clone(),
            total_bytes: self.ctx.total_bytes,
            multi_chunk,
        })
    }

    fn reset(&mut self, req: &PlanRequest) -> Result<()> {
        if req.buffer_count == 0 || req.buffer_count > MAX_BUFFERS {
            return Err(EngineError::InvalidArgument("buffer count out of range"));
        }
        req.graph.validate()?;

        let n_nodes = req.graph.n_nodes();
        let n_leafs = req.graph.n_leafs();
        if req.buffer_count > 1 {
            if n_nodes > 0 && req.node_buffer_ids.is_none() {
                return Err(EngineError::InvalidArgument("missing node buffer ids"));
            }
            if n_leafs > 0 && req.leaf_buffer_ids.is_none() {
                return Err(EngineError::InvalidArgument("missing leaf buffer ids"));
            }
        }
        if let Some(ids) = req.node_buffer_ids {
            if ids.len() < n_nodes {
                return Err(EngineError::InvalidArgument("short node buffer ids"));
            }
            if ids[..n_nodes].iter().any(|&b| b < 0 || b as usize >= req.buffer_count) {
                return Err(EngineError::InvalidArgument("node buffer id out of range"));
            }
        }
        if let Some(ids) = req.leaf_buffer_ids {
            if ids.len() < n_leafs {
                return Err(EngineError::InvalidArgument("short leaf buffer ids"));
            }
            if ids[..n_leafs].iter().any(|&b| b < 0 || b as usize >= req.buffer_count) {
                return Err(EngineError::InvalidArgument("leaf buffer id out of range"));
            }
        }

        let mut alignments = vec![DEFAULT_ALIGNMENT; req.buffer_count];
        if let Some(given) = req.buffer_alignments {
            if given.len() < req.buffer_count {
                return Err(EngineError::InvalidArgument("short buffer alignments"));
            }
            for (slot, &a) in alignments.iter_mut().zip(given.iter()) {
                if a <= 0 || (a as u64).count_ones() != 1 {
                    return Err(EngineError::InvalidArgument("alignment must be a power of two"));
                }
                *slot = a;
            }
        }
        let mut max_sizes = vec![0; req.buffer_count];
        if let Some(given) = req.buffer_max_sizes {
            if given.len() < req.buffer_count {
                return Err(EngineError::InvalidArgument("short buffer max sizes"));
            }
            for (slot, &m) in max_sizes.iter_mut().zip(given.iter()) {
                if m < 0 {
                    return Err(EngineError::InvalidArgument("negative buffer max size"));
                }
                *slot = m;
            }
        }

        self.ctx = PlannerContext {
            buffer_count: req.buffer_count,
            nodes: req.graph.nodes.to_vec(),
            leafs: req.graph.leafs.to_vec(),
            node_buffer_ids: req.node_buffer_ids.map(|s| s[..n_nodes].to_vec()).unwrap_or_default(),
            leaf_buffer_ids: req.leaf_buffer_ids.map(|s| s[..n_leafs].to_vec()).unwrap_or_default(),
            buffer_alignments: alignments,
            buffer_max_sizes: max_sizes,
            layouts: vec![BufferLayout::default(); req.buffer_count],
            ..Default::default()
        };
        Ok(())
    }
}
