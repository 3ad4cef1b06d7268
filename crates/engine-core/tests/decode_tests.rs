use engine_common::config::EngineConfig;
use engine_common::EngineError;
use engine_core::alloc::{AllocState, BufferAllocator};
use engine_core::decode::{ComputeExecutor, DecodePipeline, UbatchView};
use engine_core::graph::{GraphView, TensorDesc};
use engine_core::kv::KvCache;
use engine_core::sanitize::SanitizeRequest;
use engine_core::split::SplitMode;

#[derive(Default)]
struct RecordingExecutor {
    calls: Vec<usize>,
    fail_at: Option<usize>,
}

impl ComputeExecutor for RecordingExecutor {
    fn execute(&mut self, ubatch: &UbatchView) -> engine_common::Result<()> {
        self.calls.push(ubatch.index);
        if self.fail_at == Some(ubatch.index) {
            return Err(EngineError::Backend("injected compute failure"));
        }
        Ok(())
    }
}

#[test]
fn decode_runs_every_ubatch_and_applies_in_order() {
    let pipeline = DecodePipeline::new(2, SplitMode::Simple);
    let mut kv = KvCache::new(16, 1, 1).expect("kv");
    let mut executor = RecordingExecutor::default();
    let tokens = [10, 11, 12, 13, 14];

    let report = pipeline
        .decode(&SanitizeRequest::new(&tokens), &mut kv, None, &mut executor)
        .expect("decode");

    assert_eq!(report.n_tokens, 5);
    assert_eq!(report.ubatch_sizes, vec![2, 2, 1]);
    assert_eq!(report.outputs_total, 1);
    assert_eq!(report.kv_tokens, 5);
    assert_eq!(executor.calls, vec![0, 1, 2]);
    assert_eq!(kv.kv_tokens(), 5);
}

#[test]
fn decode_failure_rolls_back_every_applied_ubatch() {
    let pipeline = DecodePipeline::new(2, SplitMode::Simple);
    let mut kv = KvCache::new(16, 1, 1).expect("kv");
    let mut executor = RecordingExecutor { fail_at: Some(1), ..Default::default() };
    let tokens = [10, 11, 12, 13, 14];

    let err = pipeline
        .decode(&SanitizeRequest::new(&tokens), &mut kv, None, &mut executor)
        .unwrap_err();
    assert_eq!(err.code(), engine_common::ERR_BACKEND);
    assert_eq!(kv.kv_tokens(), 0);
    assert!(kv.is_pristine());
}

#[test]
fn decode_allocates_the_graph_for_each_ubatch() {
    let pipeline = DecodePipeline::new(2, SplitMode::Simple);
    let mut kv = KvCache::new(16, 1, 1).expect("kv");
    let mut executor = RecordingExecutor::default();
    let tokens = [1, 2, 3];

    let leafs = [TensorDesc::leaf(1, 64).input()];
    let nodes = [TensorDesc::node(2, 128, &[1]).output()];
    let graph = GraphView::new(&nodes, &leafs);
    let mut alloc = BufferAllocator::new();
    alloc.initialize(1, None, None).expect("initialize");
    alloc.reserve(graph).expect("reserve");

    pipeline
        .decode(
            &SanitizeRequest::new(&tokens),
            &mut kv,
            Some((graph, &mut alloc)),
            &mut executor,
        )
        .expect("decode");
    assert_eq!(alloc.state(), AllocState::Allocated);
    assert_eq!(executor.calls.len(), 2);
}

#[test]
fn consecutive_decodes_accumulate_kv_tokens() {
    let pipeline = DecodePipeline::new(4, SplitMode::Simple);
    let mut kv = KvCache::new(32, 1, 1).expect("kv");
    let mut executor = RecordingExecutor::default();

    let first = [1, 2, 3];
    pipeline
        .decode(&SanitizeRequest::new(&first), &mut kv, None, &mut executor)
        .expect("first decode");
    let second = [4, 5];
    let report = pipeline
        .decode(&SanitizeRequest::new(&second), &mut kv, None, &mut executor)
        .expect("second decode");
    assert_eq!(report.kv_tokens, 5);
}

#[test]
fn decode_routes_interleaved_sequences_through_seq_mode() {
    let pipeline = DecodePipeline::new(3, SplitMode::Seq);
    let mut kv = KvCache::new(16, 1, 1).expect("kv");
    let mut executor = RecordingExecutor::default();

    let tokens = [1, 2, 3, 4, 5, 6];
    let primaries = [0, 1, 0, 1, 0, 1];
    let mut req = SanitizeRequest::new(&tokens);
    req.seq_primary_ids = Some(&primaries);

    let report = pipeline.decode(&req, &mut kv, None, &mut executor).expect("decode");
    assert_eq!(report.ubatch_sizes, vec![3, 3]);
    assert_eq!(kv.seq_pos_max(0), 2);
    assert_eq!(kv.seq_pos_max(1), 2);
}

#[test]
fn pipeline_reads_configuration() {
    let mut cfg = EngineConfig::default();
    cfg.n_ubatch = 7;
    cfg.split_mode = Some("equal".to_string());
    let pipeline = DecodePipeline::from_config(&cfg);
    assert_eq!(pipeline.n_ubatch, 7);
    assert_eq!(pipeline.split_mode, SplitMode::Equal);

    cfg.split_mode = None;
    assert_eq!(DecodePipeline::from_config(&cfg).split_mode, SplitMode::Simple);
}
