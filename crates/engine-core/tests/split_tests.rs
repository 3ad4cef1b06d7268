use engine_core::split::{split, SplitMode, SplitRequest};

#[test]
fn simple_mode_chunks_in_order() {
    let tokens = [1, 2, 3, 4, 5];
    let report = split(&SplitRequest::new(&tokens, 2, SplitMode::Simple)).expect("split");
    assert_eq!(report.ubatch_count(), 3);
    assert_eq!(report.ubatch_sizes, vec![2, 2, 1]);
    assert_eq!(report.token_offsets, vec![0, 2, 4, 5]);
    assert_eq!(report.token_indices, vec![0, 1, 2, 3, 4]);
    assert_eq!(report.total_outputs, 5);
}

#[test]
fn single_ubatch_when_sizes_match() {
    let tokens = [1, 2, 3];
    let report = split(&SplitRequest::new(&tokens, 3, SplitMode::Simple)).expect("split");
    assert_eq!(report.ubatch_sizes, vec![3]);
}

#[test]
fn empty_batch_produces_no_ubatches() {
    let tokens: [i32; 0] = [];
    let report = split(&SplitRequest::new(&tokens, 4, SplitMode::Simple)).expect("split");
    assert_eq!(report.ubatch_count(), 0);
    assert_eq!(report.token_offsets, vec![0]);
    assert_eq!(report.total_outputs, 0);
}

#[test]
fn equal_mode_balances_chunk_sizes() {
    let tokens = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10];
    let report = split(&SplitRequest::new(&tokens, 4, SplitMode::Equal)).expect("split");
    assert_eq!(report.ubatch_sizes, vec![4, 3, 3]);
}

#[test]
fn equal_mode_interleaves_sequences_in_lockstep() {
    let tokens = [1, 2, 3, 4, 5, 6];
    let seq_masks = [1u64, 2, 1, 2, 1, 2];
    let seq_primary_ids = [0, 1, 0, 1, 0, 1];
    let mut req = SplitRequest::new(&tokens, 4, SplitMode::Equal);
    req.seq_masks = Some(&seq_masks);
    req.seq_mask_words = 1;
    req.seq_primary_ids = Some(&seq_primary_ids);
    let report = split(&req).expect("split");
    assert_eq!(report.ubatch_sizes, vec![4, 2]);
    assert_eq!(report.total_outputs, 6);
    // Two tokens of each sequence per round, sequence order preserved.
    assert_eq!(report.ubatch_tokens(0), &[0, 2, 1, 3]);
    assert_eq!(report.ubatch_tokens(1), &[4, 5]);
}

#[test]
fn equal_sequential_rejects_coupled_sequences() {
    let tokens = [1, 2];
    let seq_masks = [0b11u64, 0b01];
    let seq_primary_ids = [0, 0];
    let mut req = SplitRequest::new(&tokens, 2, SplitMode::Equal);
    req.seq_masks = Some(&seq_masks);
    req.seq_mask_words = 1;
    req.seq_primary_ids = Some(&seq_primary_ids);
    assert!(split(&req).is_err());

    // Masks without primary ids cannot run the sequential contract.
    let mut req = SplitRequest::new(&tokens, 2, SplitMode::Equal);
    req.seq_masks = Some(&[0b01u64, 0b01]);
    req.seq_mask_words = 1;
    assert!(split(&req).is_err());
}

#[test]
fn seq_mode_chunks_single_sequence_sequentially() {
    let tokens = [1, 2, 3, 4, 5, 6, 7];
    let report = split(&SplitRequest::new(&tokens, 3, SplitMode::Seq)).expect("split");
    assert_eq!(report.ubatch_sizes, vec![3, 3, 1]);
}

#[test]
fn seq_mode_separates_interleaved_sequences() {
    let tokens = [1, 2, 3, 4, 5, 6];
    let seq_masks = [1u64, 2, 1, 2, 1, 2];
    let mut req = SplitRequest::new(&tokens, 3, SplitMode::Seq);
    req.seq_masks = Some(&seq_masks);
    req.seq_mask_words = 1;
    let report = split(&req).expect("split");
    assert_eq!(report.ubatch_sizes, vec![3, 3]);
    assert_eq!(report.ubatch_tokens(0), &[0, 2, 4]);
    assert_eq!(report.ubatch_tokens(1), &[1, 3, 5]);
}

#[test]
fn seq_mode_collects_subset_tokens_into_the_active_set() {
    let tokens = [1, 2, 3, 4];
    let seq_masks = [0b11u64, 0b01, 0b10, 0b01];
    let mut req = SplitRequest::new(&tokens, 3, SplitMode::Seq);
    req.seq_masks = Some(&seq_masks);
    req.seq_mask_words = 1;
    let report = split(&req).expect("split");
    assert_eq!(report.ubatch_sizes, vec![3, 1]);
    assert_eq!(report.total_outputs, 4);
}

#[test]
fn seq_mode_rejects_partial_overlap() {
    let tokens = [1, 2];
    let seq_masks = [0b01u64, 0b11];
    let mut req = SplitRequest::new(&tokens, 4, SplitMode::Seq);
    req.seq_masks = Some(&seq_masks);
    req.seq_mask_words = 1;
    assert!(split(&req).is_err());
}

#[test]
fn output_mask_restricts_total_outputs() {
    let tokens = [1, 2, 3];
    let output_mask = [0i8, 1, 1];
    let mut req = SplitRequest::new(&tokens, 2, SplitMode::Simple);
    req.output_all = false;
    req.output_mask = Some(&output_mask);
    let report = split(&req).expect("split");
    assert_eq!(report.total_outputs, 2);

    let mut req = SplitRequest::new(&tokens, 2, SplitMode::Simple);
    req.output_all = false;
    let report = split(&req).expect("split");
    assert_eq!(report.total_outputs, 1);
}

#[test]
fn invalid_requests_are_rejected() {
    let tokens = [1, 2, 3];
    assert!(split(&SplitRequest::new(&tokens, 0, SplitMode::Simple)).is_err());

    let mut req = SplitRequest::new(&tokens, 2, SplitMode::Simple);
    req.seq_masks = Some(&[1u64, 1, 1]);
    req.seq_mask_words = 9;
    assert!(split(&req).is_err());

    let mut req = SplitRequest::new(&tokens, 2, SplitMode::Simple);
    req.seq_masks = Some(&[1u64]);
    req.seq_mask_words = 1;
    assert!(split(&req).is_err());

    let mut req = SplitRequest::new(&tokens, 2, SplitMode::Simple);
    let bad_primaries = [0, -1, 0];
    req.seq_primary_ids = Some(&bad_primaries);
    assert!(split(&req).is_err());

    let mut req = SplitRequest::new(&tokens, 2, SplitMode::Simple);
    req.seq_masks = Some(&[1u64, 0, 1]);
    req.seq_mask_words = 1;
    assert!(split(&req).is_err());
}

#[test]
fn split_mode_parses_config_names() {
    assert_eq!(SplitMode::parse("simple"), Some(SplitMode::Simple));
    assert_eq!(SplitMode::parse("equal"), Some(SplitMode::Equal));
    assert_eq!(SplitMode::parse("seq"), Some(SplitMode::Seq));
    assert_eq!(SplitMode::parse("bogus"), None);
}
