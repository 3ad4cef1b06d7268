//! Batch splitter: partitions sanitized tokens into micro-batches.
//!
//! Three policies:
//! - simple: input order, up to `n_ubatch` tokens per micro-batch;
//! - equal: balanced chunk sizes, or lockstep per-sequence rounds when
//!   primary ids are available;
//! - seq: one sequence-set micro-batch at a time via subset expansion,
//!   reordering tokens so each micro-batch holds a closed set.
//!
//! Every mode reports reordered token indices plus prefix-sum offsets whose
//! final entry equals the token count.

use engine_common::{EngineError, Result};

use crate::seqmask::{SeqMask, SEQ_WORDS};

pub const MAX_TOKENS: usize = 4096;
pub const MAX_UBATCHES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum SplitMode {
    Simple,
    Equal,
    Seq,
}

impl SplitMode {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "simple" => Some(SplitMode::Simple),
            "equal" => Some(SplitMode::Equal),
            "seq" => Some(SplitMode::Seq),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SplitRequest<'a> {
    pub token_ids: &'a [i32],
    pub n_ubatch: i32,
    pub mode: SplitMode,
    /// Flat mask words, `seq_mask_words` per token.
    pub seq_masks: Option<&'a [u64]>,
    pub seq_mask_words: usize,
    pub seq_primary_ids: Option<&'a [i32]>,
    pub equal_sequential: bool,
    pub output_mask: Option<&'a [i8]>,
    pub output_all: bool,
}

impl<'a> SplitRequest<'a> {
    pub fn new(token_ids: &'a [i32], n_ubatch: i32, mode: SplitMode) -> Self {
        Self {
            token_ids,
            n_ubatch,
            mode,
            seq_masks: None,
            seq_mask_words: 1,
            seq_primary_ids: None,
            equal_sequential: true,
            output_mask: None,
            output_all: true,
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SplitReport {
    pub ubatch_sizes: Vec<i32>,
    /// Token positions in micro-batch order; a permutation of `0..n_tokens`.
    pub token_indices: Vec<i32>,
    /// Prefix sums; `token_offsets[ubatch_count] == n_tokens`.
    pub token_offsets: Vec<i32>,
    pub total_outputs: i32,
}

impl SplitReport {
    pub fn ubatch_count(&self) -> usize {
        self.ubatch_sizes.len()
    }

    /// Token positions belonging to micro-batch `k`.
    pub fn ubatch_tokens(&self, k: usize) -> &[i32] {
        let lo = self.token_offsets[k] as usize;
        let hi = self.token_offsets[k + 1] as usize;
        &self.token_indices[lo..hi]
    }
}

fn mask_of(req: &SplitRequest, words: usize, token: usize) -> SeqMask {
    if let Some(masks) = req.seq_masks {
        SeqMask::from_words(&masks[token * words..(token + 1) * words])
    } else if let Some(ids) = req.seq_primary_ids {
        SeqMask::single(ids[token].max(0) as usize)
    } else {
        SeqMask::single(0)
    }
}

pub fn split(req: &SplitRequest) -> Result<SplitReport> {
    let n = req.token_ids.len();
    if n == 0 {
        return Ok(SplitReport { token_offsets: vec![0], ..Default::default() });
    }
    if req.n_ubatch <= 0 {
        return Err(EngineError::InvalidArgument("ubatch size must be positive"));
    }
    if n > MAX_TOKENS {
        return Err(EngineError::InvalidArgument("token count exceeds bound"));
    }
    if n as i64 > MAX_UBATCHES as i64 * req.n_ubatch as i64 {
        return Err(EngineError::InvalidArgument("batch exceeds ubatch bound"));
    }

    let words = if req.seq_masks.is_some() { req.seq_mask_words } else { 1 };
    if words == 0 || words > SEQ_WORDS {
        return Err(EngineError::InvalidArgument("mask width out of range"));
    }
    if let Some(masks) = req.seq_masks {
        if masks.len() < n * words {
            return Err(EngineError::InvalidArgument("short seq mask array"));
        }
    }
    if let Some(ids) = req.seq_primary_ids {
        if ids.len() < n {
            return Err(EngineError::InvalidArgument("short primary id array"));
        }
        let max_seq = words as i32 * 64;
        if ids[..n].iter().any(|&id| id < 0 || id >= max_seq) {
            return Err(EngineError::InvalidArgument("primary id out of range"));
        }
    }
    if let Some(mask) = req.output_mask {
        if mask.len() < n {
            return Err(EngineError::InvalidArgument("short output mask"));
        }
    }
    if req.seq_masks.is_some() {
        for i in 0..n {
            if mask_of(req, words, i).is_empty() {
                return Err(EngineError::InvalidArgument("empty seq mask"));
            }
        }
    }
    if req.mode == SplitMode::Equal && req.equal_sequential {
        if req.seq_masks.is_some() && req.seq_primary_ids.is_none() {
            return Err(EngineError::InvalidArgument(
                "sequential equal split requires primary ids",
            ));
        }
        if req.seq_primary_ids.is_some() {
            for i in 0..n {
                if mask_of(req, words, i).count() > 1 {
                    return Err(EngineError::InvalidArgument(
                        "sequential equal split rejects coupled sequences",
                    ));
                }
            }
        }
    }

    tracing::debug!(target: "split", n_tokens = n, mode = ?req.mode, "splitting batch");
    let (sizes, indices) = match req.mode {
        SplitMode::Simple => split_simple(n, req.n_ubatch),
        SplitMode::Equal => split_equal(req, words, n)?,
        SplitMode::Seq => split_seq(req, words, n)?,
    };

    debug_assert_eq!(indices.len(), n);
    let mut offsets = Vec::with_capacity(sizes.len() + 1);
    let mut total = 0i32;
    offsets.push(0);
    for &s in &sizes {
        total += s;
        offsets.push(total);
    }
    if sizes.len() > MAX_UBATCHES || total as usize != n {
        return Err(EngineError::Backend("split bookkeeping mismatch"));
    }

    let total_outputs = if req.output_all {
        n as i32
    } else if let Some(mask) = req.output_mask {
        mask[..n].iter().filter(|&&v| v != 0).count() as i32
    } else {
        1
    };

    Ok(SplitReport {
        ubatch_sizes: sizes,
        token_indices: indices,
        token_offsets: offsets,
        total_outputs,
    })
}

fn split_simple(n: usize, n_ubatch: i32) -> (Vec<i32>, Vec<i32>) {
    let step = n_ubatch as usize;
    let mut sizes = Vec::new();
    let mut start = 0;
    while start < n {
        let take = step.min(n - start);
        sizes.push(take as i32);
        start += take;
    }
    (sizes, (0..n as i32).collect())
}

/// Balanced sizes without sequence information; lockstep per-sequence rounds
/// when primary ids are present (or derivable from the masks).
fn split_equal(req: &SplitRequest, words: usize, n: usize) -> Result<(Vec<i32>, Vec<i32>)> {
    let has_seq_info = req.seq_primary_ids.is_some() || req.seq_masks.is_some();
    if !has_seq_info {
        let n_chunks = (n + req.n_ubatch as usize - 1) / req.n_ubatch as usize;
        let base = n / n_chunks;
        let rem = n % n_chunks;
        let sizes = (0..n_chunks)
            .map(|i| if i < rem { base as i32 + 1 } else { base as i32 })
            .collect();
        return Ok((sizes, (0..n as i32).collect()));
    }

    // Group tokens by primary id, keeping order inside each sequence and
    // first-appearance order across sequences.
    let mut order: Vec<i32> = Vec::new();
    let mut queues: Vec<std::collections::VecDeque<usize>> = Vec::new();
    for i in 0..n {
        let primary = match req.seq_primary_ids {
            Some(ids) => ids[i],
            None => mask_of(req, words, i)
                .primary_id()
                .ok_or(EngineError::InvalidArgument("empty seq mask"))? as i32,
        };
        match order.iter().position(|&s| s == primary) {
            Some(slot) => queues[slot].push_back(i),
            None => {
                order.push(primary);
                queues.push(std::collections::VecDeque::from([i]));
            }
        }
    }

    let n_ubatch = req.n_ubatch as usize;
    let mut sizes = Vec::new();
    let mut indices = Vec::with_capacity(n);
    loop {
        let n_active = queues.iter().filter(|q| !q.is_empty()).count();
        if n_active == 0 {
            break;
        }
        let per_seq = (n_ubatch / n_active).max(1);
        let mut taken = 0usize;
        for queue in queues.iter_mut() {
            let mut quota = per_seq;
            while quota > 0 && taken < n_ubatch {
                match queue.pop_front() {
                    Some(i) => {
                        indices.push(i as i32);
                        taken += 1;
                        quota -= 1;
                    }
                    None => break,
                }
            }
            if taken >= n_ubatch {
                break;
            }
        }
        if taken == 0 {
            break;
        }
        sizes.push(taken as i32);
    }
    Ok((sizes, indices))
}

/// One sequence-set micro-batch at a time. Starting from the next
/// unassigned token, collect later tokens whose masks are subsets of the
/// active set; a partially overlapping mask is a contract violation.
fn split_seq(req: &SplitRequest, words: usize, n: usize) -> Result<(Vec<i32>, Vec<i32>)> {
    let n_ubatch = req.n_ubatch as usize;
    let mut assigned = vec![false; n];
    let mut sizes = Vec::new();
    let mut indices = Vec::with_capacity(n);
    let mut remaining = n;

    while remaining > 0 {
        let first = match (0..n).find(|&i| !assigned[i]) {
            Some(i) => i,
            None => break,
        };
        let mut active = mask_of(req, words, first);
        assigned[first] = true;
        indices.push(first as i32);
        let mut size = 1usize;

        for j in first + 1..n {
            if size == n_ubatch {
                break;
            }
            if assigned[j] {
                continue;
            }
            let mask = mask_of(req, words, j);
            if mask.is_subset_of(&active) {
                assigned[j] = true;
                indices.push(j as i32);
                active = active.union(&mask);
                size += 1;
            } else if mask.intersects(&active) {
                return Err(EngineError::InvalidArgument(
                    "partially overlapping sequence sets",
                ));
            }
        }
        sizes.push(size as i32);
        remaining -= size;
    }
    Ok((sizes, indices))
}
