//! Decode batch sanitizer.
//!
//! Normalizes a raw decode request into the invariants the splitter and KV
//! cache rely on: every token carries a non-empty sequence mask whose
//! primary id is its lowest set bit, positions are present (copied or
//! synthesized), and the output mask is well formed. Validation failures
//! reject the whole request; there is no partial success.

use engine_common::{EngineError, Result};

use crate::seqmask::{SeqMask, MAX_SEQ, SEQ_WORDS};

pub const MAX_TOKENS: usize = 4096;

#[derive(Debug, Clone, Copy)]
pub struct SanitizeRequest<'a> {
    pub token_ids: &'a [i32],
    /// Flat mask words, `seq_mask_words` per token.
    pub seq_masks: Option<&'a [u64]>,
    pub seq_mask_words: usize,
    pub seq_primary_ids: Option<&'a [i32]>,
    /// Either one position per token, or the planar triple layout
    /// (`n` primary positions, then `n` extended-x, then `n` extended-y).
    pub positions: Option<&'a [i32]>,
    pub output_mask: Option<&'a [i8]>,
    pub output_all: bool,
    pub enforce_single_output_per_seq: bool,
}

impl<'a> SanitizeRequest<'a> {
    pub fn new(token_ids: &'a [i32]) -> Self {
        Self {
            token_ids,
            seq_masks: None,
            seq_mask_words: 1,
            seq_primary_ids: None,
            positions: None,
            output_mask: None,
            output_all: false,
            enforce_single_output_per_seq: false,
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SanitizedBatch {
    pub n_tokens: usize,
    pub seq_mask_words: usize,
    /// Flat normalized masks, `seq_mask_words` per token.
    pub seq_masks: Vec<u64>,
    pub primary_ids: Vec<i32>,
    pub positions: Vec<i32>,
    /// 1 for absolute positions, 3 for the planar triple layout.
    pub position_stride: usize,
    pub output_mask: Vec<i8>,
    pub outputs_total: i32,
}

impl SanitizedBatch {
    pub fn mask_of(&self, token: usize) -> SeqMask {
        let words = self.seq_mask_words;
        SeqMask::from_words(&self.seq_masks[token * words..(token + 1) * words])
    }
}

pub fn sanitize_decode(req: &SanitizeRequest) -> Result<SanitizedBatch> {
    let n_tokens = req.token_ids.len();
    if n_tokens == 0 {
        return Err(EngineError::InvalidArgument("empty token batch"));
    }
    if n_tokens > MAX_TOKENS {
        return Err(EngineError::InvalidArgument("token count exceeds bound"));
    }

    let mask_words = match req.seq_masks {
        Some(masks) => {
            if req.seq_mask_words == 0 || req.seq_mask_words > SEQ_WORDS {
                return Err(EngineError::InvalidArgument("mask width out of range"));
            }
            if masks.len() < n_tokens * req.seq_mask_words {
                return Err(EngineError::InvalidArgument("short seq mask array"));
            }
            req.seq_mask_words
        }
        None => 1,
    };
    if let Some(ids) = req.seq_primary_ids {
        if ids.len() < n_tokens {
            return Err(EngineError::InvalidArgument("short primary id array"));
        }
    }

    let position_stride = match req.positions {
        Some(p) if p.len() >= n_tokens * 3 => 3,
        Some(p) if p.len() >= n_tokens => 1,
        Some(_) => return Err(EngineError::InvalidArgument("short position array")),
        None => 1,
    };

    // Normalize sequence masks and primary ids.
    let mut seq_masks = vec![0u64; n_tokens * mask_words];
    let mut primary_ids = vec![0i32; n_tokens];
    for i in 0..n_tokens {
        let out = &mut seq_masks[i * mask_words..(i + 1) * mask_words];
        if let Some(masks) = req.seq_masks {
            out.copy_from_slice(&masks[i * mask_words..(i + 1) * mask_words]);
        } else if let Some(ids) = req.seq_primary_ids {
            let seq_id = ids[i];
            if seq_id < 0 || seq_id as usize >= mask_words * 64 {
                return Err(EngineError::InvalidArgument("primary id out of range"));
            }
            out[seq_id as usize / 64] |= 1u64 << (seq_id as usize % 64);
        } else {
            out[0] |= 1;
        }

        let mask = SeqMask::from_words(out);
        let primary = mask
            .primary_id()
            .ok_or(EngineError::InvalidArgument("empty seq mask"))?;
        if req.seq_masks.is_some() {
            if let Some(ids) = req.seq_primary_ids {
                if !mask.has(ids[i].max(0) as usize) || ids[i] < 0 {
                    return Err(EngineError::InvalidArgument("primary id not in mask"));
                }
            }
        }
        primary_ids[i] = primary as i32;
    }

    // Copy or synthesize positions.
    let mut positions = vec![0i32; n_tokens * position_stride];
    match req.positions {
        Some(given) => {
            positions.copy_from_slice(&given[..n_tokens * position_stride]);
        }
        None => {
            let mut next_pos = [0i32; MAX_SEQ];
            for i in 0..n_tokens {
                let mask = SeqMask::from_words(&seq_masks[i * mask_words..(i + 1) * mask_words]);
                let pos = next_pos[primary_ids[i] as usize];
                positions[i] = pos;
                for seq_id in mask.iter_ids() {
                    next_pos[seq_id] = pos + 1;
                }
            }
        }
    }

    // Output selection.
    let mut output_mask = vec![0i8; n_tokens];
    if req.output_all {
        output_mask.fill(1);
    } else if let Some(given) = req.output_mask {
        if given.len() < n_tokens {
            return Err(EngineError::InvalidArgument("short output mask"));
        }
        output_mask.copy_from_slice(&given[..n_tokens]);
    } else {
        output_mask[n_tokens - 1] = 1;
    }
    if req.output_all && req.output_mask.map(|m| m.iter().any(|&v| v == 0)).unwrap_or(false) {
        tracing::warn!(target: "sanitize", "output_all overrides partial output mask");
        output_mask.fill(1);
    }
    let outputs_total = output_mask.iter().filter(|&&v| v != 0).count() as i32;

    if req.enforce_single_output_per_seq {
        let mut seq_output_count = [0i32; MAX_SEQ];
        for i in 0..n_tokens {
            if output_mask[i] == 0 {
                continue;
            }
            let mask = SeqMask::from_words(&seq_masks[i * mask_words..(i + 1) * mask_words]);
            for seq_id in mask.iter_ids() {
                seq_output_count[seq_id] += 1;
                if seq_output_count[seq_id] > 1 {
                    return Err(EngineError::InvalidArgument(
                        "sequence has multiple outputs",
                    ));
                }
            }
        }
    }

    // Continuity and mask-monotonicity checks. Positions in a sequence must
    // be non-decreasing, distinct positions must be gap-free when they are
    // synthesized or absolute, and the running mask intersection per
    // sequence must stay non-empty.
    let mut seq_last_pos = [-1i32; MAX_SEQ];
    let mut seq_pos_min = [i32::MAX; MAX_SEQ];
    let mut seq_pos_max = [i32::MIN; MAX_SEQ];
    let mut seq_pos_count = [0i32; MAX_SEQ];
    let mut cur_seq_set = vec![SeqMask([u64::MAX; SEQ_WORDS]); MAX_SEQ];

    for i in 0..n_tokens {
        let pos = positions[i];
        let mask = SeqMask::from_words(&seq_masks[i * mask_words..(i + 1) * mask_words]);
        for seq_id in mask.iter_ids() {
            let last = seq_last_pos[seq_id];
            if last >= 0 && pos < last {
                return Err(EngineError::InvalidArgument("decreasing position in sequence"));
            }
            if pos != last {
                seq_pos_count[seq_id] += 1;
            }
            seq_last_pos[seq_id] = pos;
            seq_pos_min[seq_id] = seq_pos_min[seq_id].min(pos);
            seq_pos_max[seq_id] = seq_pos_max[seq_id].max(pos);

            cur_seq_set[seq_id] = cur_seq_set[seq_id].intersect(&mask);
            if cur_seq_set[seq_id].is_empty() {
                return Err(EngineError::InvalidArgument("sequence set jumped"));
            }
        }
    }

    if position_stride <= 1 {
        for s in 0..MAX_SEQ {
            if seq_pos_count[s] == 0 {
                continue;
            }
            if seq_pos_max[s] - seq_pos_min[s] + 1 > seq_pos_count[s] {
                return Err(EngineError::InvalidArgument("position gap in sequence"));
            }
        }
    }

    Ok(SanitizedBatch {
        n_tokens,
        seq_mask_words: mask_words,
        seq_masks,
        primary_ids,
        positions,
        position_stride,
        output_mask,
        outputs_total,
    })
}
