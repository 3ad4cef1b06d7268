//! KV cache: a bounded cell arena split into per-stream sub-arenas.
//!
//! `prepare` plans one contiguous slot per micro-batch, `apply_ubatch`
//! commits them strictly in order, and `rollback` restores earlier applies
//! exactly from per-slot snapshots. Sequence operations run between batches
//! and rewrite cell metadata in place; cross-stream copies and position
//! shifts are recorded for the external compute executor to realize.

use engine_common::{EngineError, Result};

use crate::seqmask::{SeqMask, MAX_SEQ};

pub const MAX_UBATCHES: usize = 4096;
pub const MAX_KV_CELLS: usize = 32768;
pub const MAX_STREAMS: usize = MAX_SEQ;
pub const POS_NONE: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cell {
    pub pos: i32,
    pub shift: i32,
    pub ext_x: i32,
    pub ext_y: i32,
    pub seq: SeqMask,
}

impl Default for Cell {
    fn default() -> Self {
        Self { pos: POS_NONE, shift: 0, ext_x: 0, ext_y: 0, seq: SeqMask::empty() }
    }
}

impl Cell {
    fn is_free(&self) -> bool {
        self.pos == POS_NONE
    }

    fn clear(&mut self) {
        *self = Cell::default();
    }
}

#[derive(Debug, Clone)]
struct StreamState {
    head: i32,
    used_count: i32,
    used_max_p1: i32,
    has_shift: bool,
    cells: Vec<Cell>,
}

impl StreamState {
    fn new(kv_size: usize) -> Self {
        Self {
            head: 0,
            used_count: 0,
            used_max_p1: 0,
            has_shift: false,
            cells: vec![Cell::default(); kv_size],
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PlannedSlot {
    offset: i32,
    stream: usize,
    size: i32,
    seq_id: i32,
}

#[derive(Debug, Clone)]
struct SlotSnapshot {
    stream: usize,
    offset: i32,
    cells: Vec<Cell>,
    head: i32,
    used_count: i32,
    used_max_p1: i32,
    has_shift: bool,
    prev_kv_tokens: i32,
}

#[derive(Debug, Clone, Copy)]
pub struct PrepareRequest<'a> {
    pub ubatch_sizes: &'a [i32],
    pub requested_capacity: i32,
    /// Primary sequence id per micro-batch; pins each slot to the stream the
    /// sequence is mapped to. Without it, the least-loaded stream is chosen.
    pub ubatch_seq_ids: Option<&'a [i32]>,
}

impl<'a> PrepareRequest<'a> {
    pub fn new(ubatch_sizes: &'a [i32], requested_capacity: i32) -> Self {
        Self { ubatch_sizes, requested_capacity, ubatch_seq_ids: None }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PreparedPlan {
    pub slot_offsets: Vec<i32>,
    pub slot_streams: Vec<i32>,
}

/// Per-token metadata for one apply. `positions` holds either one position
/// per token or the planar triple layout (`size` primaries, then `size`
/// extended-x, then `size` extended-y values).
#[derive(Debug, Clone, Copy)]
pub struct UbatchTokens<'a> {
    pub positions: &'a [i32],
    pub seq_masks: &'a [SeqMask],
}

/// Pending work for the external executor, drained between batches.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PendingUpdates {
    pub stream_copies: Vec<(i32, i32)>,
    pub shifted_streams: Vec<usize>,
}

pub struct KvCache {
    kv_size: i32,
    n_stream: usize,
    n_pad: i32,
    streams: Vec<StreamState>,
    seq_to_stream: Vec<i32>,
    planned: Vec<PlannedSlot>,
    snapshots: Vec<SlotSnapshot>,
    applied: usize,
    pending_copies: Vec<(i32, i32)>,
    kv_tokens: i32,
}

impl KvCache {
    pub fn new(kv_size: i32, n_stream: usize, n_pad: i32) -> Result<Self> {
        if kv_size <= 0 || kv_size as usize > MAX_KV_CELLS {
            return Err(EngineError::InvalidArgument("kv size out of range"));
        }
        if n_stream == 0 || n_stream > MAX_STREAMS {
            return Err(EngineError::InvalidArgument("stream count out of range"));
        }
        if n_pad <= 0 {
            return Err(EngineError::InvalidArgument("pad must be positive"));
        }
        Ok(Self {
            kv_size,
            n_stream,
            n_pad,
            streams: (0..n_stream).map(|_| StreamState::new(kv_size as usize)).collect(),
            seq_to_stream: (0..MAX_SEQ).map(|s| (s % n_stream) as i32).collect(),
            planned: Vec::new(),
            snapshots: Vec::new(),
            applied: 0,
            pending_copies: Vec::new(),
            kv_tokens: 0,
        })
    }

    pub fn kv_size(&self) -> i32 {
        self.kv_size
    }

    pub fn n_stream(&self) -> usize {
        self.n_stream
    }

    pub fn kv_tokens(&self) -> i32 {
        self.kv_tokens
    }

    pub fn applied_ubatches(&self) -> usize {
        self.applied
    }

    pub fn planned_ubatches(&self) -> usize {
        self.planned.len()
    }

    pub fn cell_pos(&self, stream: usize, index: usize) -> i32 {
        self.streams
            .get(stream)
            .and_then(|s| s.cells.get(index))
            .map(|c| c.pos)
            .unwrap_or(POS_NONE)
    }

    pub fn used_count(&self, stream: usize) -> i32 {
        self.streams.get(stream).map(|s| s.used_count).unwrap_or(0)
    }

    /// True when every cell in every stream is free.
    pub fn is_pristine(&self) -> bool {
        self.streams.iter().all(|s| s.cells.iter().all(|c| c.is_free()))
    }

    fn between_batches(&self) -> bool {
        self.applied == self.planned.len() || self.applied == 0
    }

    /// Plans one contiguous, pad-aligned slot per micro-batch. Slots of one
    /// plan never overlap; scanning starts at the stream head and wraps
    /// once.
    pub fn prepare(&mut self, req: &PrepareRequest) -> Result<PreparedPlan> {
        if !self.between_batches() {
            return Err(EngineError::Sequencing("prepare during partial apply"));
        }
        let sizes = req.ubatch_sizes;
        if sizes.is_empty() || sizes.len() > MAX_UBATCHES {
            return Err(EngineError::InvalidArgument("ubatch count out of range"));
        }
        if sizes.iter().any(|&s| s <= 0) {
            return Err(EngineError::InvalidArgument("ubatch size must be positive"));
        }
        if req.requested_capacity <= 0 || req.requested_capacity > self.kv_size {
            return Err(EngineError::InvalidArgument("requested capacity out of range"));
        }
        if let Some(seq_ids) = req.ubatch_seq_ids {
            if seq_ids.len() < sizes.len() {
                return Err(EngineError::InvalidArgument("short ubatch seq ids"));
            }
            if seq_ids[..sizes.len()].iter().any(|&s| s < 0 || s as usize >= MAX_SEQ) {
                return Err(EngineError::InvalidArgument("ubatch seq id out of range"));
            }
        }
        let capacity = req.requested_capacity;
        let total: i64 = sizes.iter().map(|&s| s as i64).sum();
        if total > capacity as i64 * self.n_stream as i64 {
            return Err(EngineError::InvalidArgument("batch exceeds kv capacity"));
        }

        let mut planned_heads: Vec<i32> = self.streams.iter().map(|s| s.head).collect();
        let mut planned_max: Vec<i32> = self.streams.iter().map(|s| s.used_max_p1).collect();
        let mut occupied: Vec<Vec<bool>> =
            (0..self.n_stream).map(|_| vec![false; capacity as usize]).collect();

        let mut plan = Vec::with_capacity(sizes.len());
        for (k, &size) in sizes.iter().enumerate() {
            let stream = match req.ubatch_seq_ids {
                Some(seq_ids) => self.seq_to_stream[seq_ids[k] as usize] as usize,
                None => {
                    // Least-loaded stream under the planned watermark.
                    (0..self.n_stream)
                        .min_by_key(|&s| planned_max[s] + size)
                        .unwrap_or(0)
                }
            };
            let offset = self
                .find_slot(stream, size, capacity, planned_heads[stream], &occupied[stream])
                .ok_or(EngineError::InvalidArgument("no contiguous slot fits"))?;
            for cell in &mut occupied[stream][offset as usize..(offset + size) as usize] {
                *cell = true;
            }
            planned_heads[stream] = (offset + size) % capacity;
            planned_max[stream] = planned_max[stream].max(offset + size);
            let seq_id = req.ubatch_seq_ids.map(|ids| ids[k]).unwrap_or(0);
            plan.push(PlannedSlot { offset, stream, size, seq_id });
            tracing::debug!(target: "kv", ubatch = k, stream, offset, size, "slot planned");
        }

        self.planned = plan;
        self.snapshots.clear();
        self.applied = 0;
        Ok(PreparedPlan {
            slot_offsets: self.planned.iter().map(|p| p.offset).collect(),
            slot_streams: self.planned.iter().map(|p| p.stream as i32).collect(),
        })
    }

    fn find_slot(
        &self,
        stream: usize,
        size: i32,
        capacity: i32,
        start: i32,
        occupied: &[bool],
    ) -> Option<i32> {
        let cells = &self.streams[stream].cells;
        let pad = self.n_pad;
        let feasible = |offset: i32| -> bool {
            if offset + size > capacity {
                return false;
            }
            (offset..offset + size).all(|i| {
                cells[i as usize].is_free() && !occupied[i as usize]
            })
        };
        let align = |v: i32| (v + pad - 1) / pad * pad;

        let mut offset = align(start);
        while offset + size <= capacity {
            if feasible(offset) {
                return Some(offset);
            }
            offset += pad;
        }
        // Wrap once.
        offset = 0;
        while offset < start && offset + size <= capacity {
            if feasible(offset) {
                return Some(offset);
            }
            offset += pad;
        }
        None
    }

    /// Commits planned slot `k`. Applies are strictly sequential; the prior
    /// cell contents are snapshotted so rollback is exact.
    pub fn apply_ubatch(&mut self, k: usize, tokens: Option<&UbatchTokens>) -> Result<i32> {
        if k != self.applied {
            return Err(EngineError::InvalidArgument("out-of-order apply"));
        }
        let slot = *self
            .planned
            .get(k)
            .ok_or(EngineError::InvalidArgument("apply index out of plan"))?;
        let size = slot.size as usize;
        let offset = slot.offset as usize;
        if slot.offset + slot.size > self.kv_size {
            return Err(EngineError::Backend("slot out of arena"));
        }
        if let Some(t) = tokens {
            if t.positions.len() != size && t.positions.len() != size * 3 {
                return Err(EngineError::InvalidArgument("position count mismatch"));
            }
            if t.seq_masks.len() != size {
                return Err(EngineError::InvalidArgument("seq mask count mismatch"));
            }
            if t.seq_masks.iter().any(|m| m.is_empty()) {
                return Err(EngineError::InvalidArgument("empty seq mask"));
            }
        }
        {
            let stream = &self.streams[slot.stream];
            if stream.cells[offset..offset + size].iter().any(|c| !c.is_free()) {
                return Err(EngineError::Backend("slot cells already occupied"));
            }
        }

        let stream = &mut self.streams[slot.stream];
        self.snapshots.push(SlotSnapshot {
            stream: slot.stream,
            offset: slot.offset,
            cells: stream.cells[offset..offset + size].to_vec(),
            head: stream.head,
            used_count: stream.used_count,
            used_max_p1: stream.used_max_p1,
            has_shift: stream.has_shift,
            prev_kv_tokens: self.kv_tokens,
        });

        let triple = tokens.map(|t| t.positions.len() == size * 3).unwrap_or(false);
        for i in 0..size {
            let cell = &mut stream.cells[offset + i];
            cell.shift = 0;
            match tokens {
                Some(t) => {
                    cell.pos = t.positions[i];
                    cell.ext_x = if triple { t.positions[size + i] } else { 0 };
                    cell.ext_y = if triple { t.positions[2 * size + i] } else { 0 };
                    cell.seq = t.seq_masks[i];
                }
                None => {
                    cell.pos = self.kv_tokens + i as i32;
                    cell.ext_x = 0;
                    cell.ext_y = 0;
                    cell.seq = SeqMask::single(slot.seq_id.max(0) as usize);
                }
            }
        }
        stream.used_count += slot.size;
        stream.used_max_p1 = stream.used_max_p1.max(slot.offset + slot.size);
        stream.head = (slot.offset + slot.size) % self.kv_size;
        self.kv_tokens += slot.size;
        self.applied += 1;
        tracing::debug!(
            target: "kv",
            ubatch = k,
            kv_tokens = self.kv_tokens,
            "ubatch applied"
        );
        Ok(self.kv_tokens)
    }

    /// Restores applied micro-batches `[from, applied)` in reverse order.
    pub fn rollback(&mut self, from: usize) -> Result<()> {
        if from > self.applied {
            return Err(EngineError::InvalidArgument("rollback past applied count"));
        }
        while self.applied > from {
            let snap = self
                .snapshots
                .pop()
                .ok_or(EngineError::Backend("missing slot snapshot"))?;
            let stream = &mut self.streams[snap.stream];
            let offset = snap.offset as usize;
            stream.cells[offset..offset + snap.cells.len()].copy_from_slice(&snap.cells);
            stream.head = snap.head;
            stream.used_count = snap.used_count;
            stream.used_max_p1 = snap.used_max_p1;
            stream.has_shift = snap.has_shift;
            self.kv_tokens = snap.prev_kv_tokens;
            self.applied -= 1;
        }
        Ok(())
    }

    fn seq_guard(&self, seq_id: i32, op: &'static str) -> Result<usize> {
        if !self.between_batches() {
            return Err(EngineError::Sequencing(op));
        }
        if seq_id < 0 || seq_id as usize >= MAX_SEQ {
            return Err(EngineError::InvalidArgument("sequence id out of range"));
        }
        Ok(self.seq_to_stream[seq_id as usize] as usize)
    }

    fn refresh_counters(&mut self, stream: usize) {
        let s = &mut self.streams[stream];
        s.used_count = s.cells.iter().filter(|c| !c.is_free()).count() as i32;
        s.used_max_p1 = s
            .cells
            .iter()
            .enumerate()
            .rev()
            .find(|(_, c)| !c.is_free())
            .map(|(i, _)| i as i32 + 1)
            .unwrap_or(0);
    }

    fn refresh_tokens(&mut self) {
        self.kv_tokens = self.streams.iter().map(|s| s.used_count).sum();
    }

    /// Removes a sequence from cells in `[p0, p1)`; `p1 < 0` means no upper
    /// bound, `seq_id < 0` removes every sequence in the range.
    pub fn seq_remove(&mut self, seq_id: i32, p0: i32, p1: i32) -> Result<()> {
        if !self.between_batches() {
            return Err(EngineError::Sequencing("seq_remove during partial apply"));
        }
        if seq_id >= MAX_SEQ as i32 {
            return Err(EngineError::InvalidArgument("sequence id out of range"));
        }
        let hi = if p1 < 0 { i32::MAX } else { p1 };
        let touched: Vec<usize> = if seq_id < 0 {
            (0..self.n_stream).collect()
        } else {
            vec![self.seq_to_stream[seq_id as usize] as usize]
        };
        for &si in &touched {
            let stream = &mut self.streams[si];
            for cell in &mut stream.cells {
                if cell.is_free() || cell.pos < p0 || cell.pos >= hi {
                    continue;
                }
                if seq_id < 0 {
                    cell.clear();
                } else if cell.seq.has(seq_id as usize) {
                    cell.seq.clear(seq_id as usize);
                    if cell.seq.is_empty() {
                        cell.clear();
                    }
                }
            }
        }
        for si in touched {
            self.refresh_counters(si);
        }
        self.refresh_tokens();
        Ok(())
    }

    /// Tags cells of `src` in `[p0, p1)` with `dst`. When the sequences live
    /// on different streams, the destination stream is rebuilt from the
    /// source's cells and the copy is queued for the executor.
    pub fn seq_copy(&mut self, src: i32, dst: i32, p0: i32, p1: i32) -> Result<()> {
        let src_stream = self.seq_guard(src, "seq_copy")?;
        let dst_stream = self.seq_guard(dst, "seq_copy")?;
        if src == dst {
            return Ok(());
        }
        let hi = if p1 < 0 { i32::MAX } else { p1 };

        if src_stream == dst_stream {
            let stream = &mut self.streams[src_stream];
            for cell in &mut stream.cells {
                if !cell.is_free()
                    && cell.seq.has(src as usize)
                    && cell.pos >= p0
                    && cell.pos < hi
                {
                    cell.seq.set(dst as usize);
                }
            }
            self.refresh_counters(src_stream);
            self.refresh_tokens();
            return Ok(());
        }

        if self.pending_copies.len() >= MAX_STREAMS {
            return Err(EngineError::Backend("pending copy list full"));
        }
        let source_cells = self.streams[src_stream].cells.clone();
        let source_head = self.streams[src_stream].head;
        let target = &mut self.streams[dst_stream];
        for (i, cell) in target.cells.iter_mut().enumerate() {
            let from = &source_cells[i];
            if !from.is_free() && from.seq.has(src as usize) && from.pos >= p0 && from.pos < hi {
                *cell = Cell { seq: SeqMask::single(dst as usize), ..*from };
            } else {
                cell.clear();
            }
        }
        target.head = source_head;
        self.pending_copies.push((src_stream as i32, dst_stream as i32));
        self.refresh_counters(dst_stream);
        self.refresh_tokens();
        Ok(())
    }

    /// Drops every sequence except `seq_id`.
    pub fn seq_keep(&mut self, seq_id: i32) -> Result<()> {
        let keep_stream = self.seq_guard(seq_id, "seq_keep")?;
        for si in 0..self.n_stream {
            let stream = &mut self.streams[si];
            for cell in &mut stream.cells {
                if cell.is_free() {
                    continue;
                }
                if si == keep_stream && cell.seq.has(seq_id as usize) {
                    cell.seq = SeqMask::single(seq_id as usize);
                } else {
                    cell.clear();
                }
            }
        }
        for si in 0..self.n_stream {
            self.refresh_counters(si);
        }
        self.refresh_tokens();
        Ok(())
    }

    /// Shifts positions of `seq_id` cells in `[p0, p1)` by `delta`,
    /// accumulating the shift for the executor. Cells shifted below zero are
    /// evicted from the sequence.
    pub fn seq_add(&mut self, seq_id: i32, p0: i32, p1: i32, delta: i32) -> Result<()> {
        let si = self.seq_guard(seq_id, "seq_add")?;
        if delta == 0 {
            return Ok(());
        }
        let hi = if p1 < 0 { i32::MAX } else { p1 };
        let stream = &mut self.streams[si];
        let mut shifted = false;
        for cell in &mut stream.cells {
            if cell.is_free() || !cell.seq.has(seq_id as usize) || cell.pos < p0 || cell.pos >= hi {
                continue;
            }
            let new_pos = cell.pos + delta;
            if new_pos < 0 {
                cell.seq.clear(seq_id as usize);
                if cell.seq.is_empty() {
                    cell.clear();
                }
                continue;
            }
            cell.pos = new_pos;
            cell.shift += delta;
            shifted = true;
        }
        if shifted {
            stream.has_shift = true;
        }
        self.refresh_counters(si);
        self.refresh_tokens();
        Ok(())
    }

    /// Divides positions of `seq_id` cells in `[p0, p1)` by `divisor`.
    pub fn seq_div(&mut self, seq_id: i32, p0: i32, p1: i32, divisor: i32) -> Result<()> {
        let si = self.seq_guard(seq_id, "seq_div")?;
        if divisor <= 0 {
            return Err(EngineError::InvalidArgument("divisor must be positive"));
        }
        if divisor == 1 {
            return Ok(());
        }
        let hi = if p1 < 0 { i32::MAX } else { p1 };
        let stream = &mut self.streams[si];
        let mut shifted = false;
        for cell in &mut stream.cells {
            if cell.is_free() || !cell.seq.has(seq_id as usize) || cell.pos < p0 || cell.pos >= hi {
                continue;
            }
            let new_pos = cell.pos / divisor;
            cell.shift += new_pos - cell.pos;
            cell.pos = new_pos;
            shifted = true;
        }
        if shifted {
            stream.has_shift = true;
        }
        Ok(())
    }

    /// Smallest position held by the sequence, or `POS_NONE`.
    pub fn seq_pos_min(&self, seq_id: i32) -> i32 {
        self.seq_positions(seq_id).map(|(min, _)| min).unwrap_or(POS_NONE)
    }

    /// Largest position held by the sequence, or `POS_NONE`.
    pub fn seq_pos_max(&self, seq_id: i32) -> i32 {
        self.seq_positions(seq_id).map(|(_, max)| max).unwrap_or(POS_NONE)
    }

    fn seq_positions(&self, seq_id: i32) -> Option<(i32, i32)> {
        if seq_id < 0 || seq_id as usize >= MAX_SEQ {
            return None;
        }
        let stream = &self.streams[self.seq_to_stream[seq_id as usize] as usize];
        let mut bounds: Option<(i32, i32)> = None;
        for cell in &stream.cells {
            if cell.is_free() || !cell.seq.has(seq_id as usize) {
                continue;
            }
            bounds = Some(match bounds {
                Some((min, max)) => (min.min(cell.pos), max.max(cell.pos)),
                None => (cell.pos, cell.pos),
            });
        }
        bounds
    }

    /// Hands pending shift/copy work to the executor and clears it.
    pub fn take_pending_updates(&mut self) -> PendingUpdates {
        let mut shifted = Vec::new();
        for (si, stream) in self.streams.iter_mut().enumerate() {
            if stream.has_shift {
                shifted.push(si);
                stream.has_shift = false;
                for cell in &mut stream.cells {
                    cell.shift = 0;
                }
            }
        }
        PendingUpdates {
            stream_copies: std::mem::take(&mut self.pending_copies),
            shifted_streams: shifted,
        }
    }
}
