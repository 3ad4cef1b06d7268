//! Decode pipeline plumbing.
//!
//! Wires the decode data flow: a decode request is sanitized, split into
//! micro-batches, and for each micro-batch a KV slot is prepared, the graph
//! is allocated, and the external compute executor runs before the slot is
//! committed. Any failure rolls back every applied micro-batch.

use engine_common::config::EngineConfig;
use engine_common::Result;

use crate::alloc::BufferAllocator;
use crate::graph::GraphView;
use crate::kv::{KvCache, PrepareRequest, UbatchTokens};
use crate::sanitize::{sanitize_decode, SanitizeRequest};
use crate::seqmask::SeqMask;
use crate::split::{split, SplitMode, SplitRequest};

/// External compute executor; invoked once per micro-batch.
pub trait ComputeExecutor {
    fn execute(&mut self, ubatch: &UbatchView) -> Result<()>;
}

/// Borrowed view of one micro-batch handed to the executor.
#[derive(Debug, Clone, Copy)]
pub struct UbatchView<'a> {
    pub index: usize,
    /// Positions into the full batch, in micro-batch order.
    pub token_indices: &'a [i32],
    /// Full-batch token ids; index through `token_indices`.
    pub token_ids: &'a [i32],
    /// Per-token primary positions for this micro-batch.
    pub positions: &'a [i32],
    pub slot_offset: i32,
    pub slot_stream: i32,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DecodeReport {
    pub n_tokens: usize,
    pub ubatch_sizes: Vec<i32>,
    pub outputs_total: i32,
    pub kv_tokens: i32,
}

#[derive(Debug, Clone, Copy)]
pub struct DecodePipeline {
    pub n_ubatch: i32,
    pub split_mode: SplitMode,
}

impl DecodePipeline {
    pub fn new(n_ubatch: i32, split_mode: SplitMode) -> Self {
        Self { n_ubatch, split_mode }
    }

    pub fn from_config(cfg: &EngineConfig) -> Self {
        let split_mode = cfg
            .split_mode
            .as_deref()
            .and_then(SplitMode::parse)
            .unwrap_or(SplitMode::Simple);
        Self { n_ubatch: cfg.n_ubatch as i32, split_mode }
    }

    /// Runs one decode request through sanitize, split, KV slot planning,
    /// per-micro-batch graph allocation and compute, and sequential apply.
    /// On failure the KV cache is rolled back to its pre-request state.
    pub fn decode(
        &self,
        request: &SanitizeRequest,
        kv: &mut KvCache,
        mut graph_alloc: Option<(GraphView, &mut BufferAllocator)>,
        executor: &mut dyn ComputeExecutor,
    ) -> Result<DecodeReport> {
        let batch = sanitize_decode(request)?;

        let split_report = split(&SplitRequest {
            token_ids: request.token_ids,
            n_ubatch: self.n_ubatch,
            mode: self.split_mode,
            seq_masks: Some(&batch.seq_masks),
            seq_mask_words: batch.seq_mask_words,
            seq_primary_ids: Some(&batch.primary_ids),
            equal_sequential: false,
            output_mask: Some(&batch.output_mask),
            output_all: false,
        })?;

        // Pin each micro-batch to its first token's sequence stream when
        // streams are in play.
        let ubatch_seq_ids: Option<Vec<i32>> = (kv.n_stream() > 1).then(|| {
            (0..split_report.ubatch_count())
                .map(|k| {
                    let first = split_report.ubatch_tokens(k)[0] as usize;
                    batch.primary_ids[first]
                })
                .collect()
        });
        let plan = kv.prepare(&PrepareRequest {
            ubatch_sizes: &split_report.ubatch_sizes,
            requested_capacity: kv.kv_size(),
            ubatch_seq_ids: ubatch_seq_ids.as_deref(),
        })?;

        tracing::debug!(
            target: "decode",
            n_tokens = batch.n_tokens,
            ubatches = split_report.ubatch_count(),
            "decode request planned"
        );

        for k in 0..split_report.ubatch_count() {
            let token_indices = split_report.ubatch_tokens(k);
            let positions: Vec<i32> = token_indices
                .iter()
                .map(|&i| batch.positions[i as usize])
                .collect();
            let seq_masks: Vec<SeqMask> = token_indices
                .iter()
                .map(|&i| batch.mask_of(i as usize))
                .collect();
            let view = UbatchView {
                index: k,
                token_indices,
                token_ids: request.token_ids,
                positions: &positions,
                slot_offset: plan.slot_offsets[k],
                slot_stream: plan.slot_streams[k],
            };

            let step = (|| -> Result<()> {
                if let Some((graph, alloc)) = graph_alloc.as_mut() {
                    alloc.alloc_graph(*graph)?;
                }
                executor.execute(&view)?;
                kv.apply_ubatch(k, Some(&UbatchTokens { positions: &positions, seq_masks: &seq_masks }))?;
                Ok(())
            })();
            if let Err(err) = step {
                tracing::warn!(target: "decode", ubatch = k, %err, "decode failed, rolling back");
                kv.rollback(0)?;
                return Err(err);
            }
        }

        Ok(DecodeReport {
            n_tokens: batch.n_tokens,
            ubatch_sizes: split_report.ubatch_sizes.clone(),
            outputs_total: split_report.total_outputs,
            kv_tokens: kv.kv_tokens(),
        })
    }
}
