use engine_core::chunk::{ChunkAllocator, CHUNK_SIZE_CEILING, MAX_CHUNKS, UNBOUNDED_CHUNK_SIZE};

fn configured(alignment: u64, max_chunk_size: u64) -> ChunkAllocator {
    let mut chunks = ChunkAllocator::default();
    chunks.configure(alignment, max_chunk_size).expect("configure");
    chunks
}

#[test]
fn configure_rejects_bad_arguments() {
    let mut chunks = ChunkAllocator::default();
    assert!(chunks.configure(0, 64).is_err());
    assert!(chunks.configure(3, 64).is_err());
    assert!(chunks.configure(16, 0).is_err());
    assert!(chunks.configure(16, 65).is_err());
    assert!(chunks.configure(16, 64).is_ok());
}

#[test]
fn configure_clamps_unbounded_sentinel() {
    let chunks = configured(16, UNBOUNDED_CHUNK_SIZE);
    assert!(chunks.max_chunk_size() <= CHUNK_SIZE_CEILING);
    assert_eq!(chunks.max_chunk_size() % 16, 0);
}

#[test]
fn allocate_zero_is_invalid() {
    let mut chunks = configured(16, 64);
    assert!(chunks.allocate(0).is_err());
}

#[test]
fn allocate_full_chunk_succeeds_in_fresh_allocator() {
    let mut chunks = configured(16, 64);
    let region = chunks.allocate(64).expect("allocate");
    assert_eq!(region.chunk, 0);
    assert_eq!(region.offset, 0);
    assert_eq!(region.aligned_size, 64);
    assert_eq!(chunks.chunk_count(), 1);
}

#[test]
fn oversized_request_creates_chunk_of_requested_size() {
    let mut chunks = configured(16, 64);
    let region = chunks.allocate(65).expect("allocate");
    assert_eq!(region.aligned_size, 80);
    assert_eq!(chunks.chunk_max_size(region.chunk), 80);
}

#[test]
fn allocation_splits_block_and_keeps_suffix_free() {
    let mut chunks = configured(16, 64);
    let a = chunks.allocate(16).expect("allocate");
    let b = chunks.allocate(16).expect("allocate");
    assert_eq!(a.chunk, b.chunk);
    assert_eq!(a.offset, 0);
    assert_eq!(b.offset, 16);
    assert_eq!(chunks.free_bytes(0), 32);
}

#[test]
fn chunk_limit_reports_backend() {
    let mut chunks = configured(16, 64);
    for _ in 0..MAX_CHUNKS {
        chunks.allocate(64).expect("allocate");
    }
    let err = chunks.allocate(64).unwrap_err();
    assert_eq!(err.code(), engine_common::ERR_BACKEND);
}

#[test]
fn release_round_trip_matches_reset() {
    let mut chunks = configured(16, 256);
    let a = chunks.allocate(64).expect("a");
    let b = chunks.allocate(32).expect("b");
    let c = chunks.allocate(128).expect("c");

    chunks.release(b.chunk, b.offset, b.aligned_size).expect("release b");
    chunks.release(a.chunk, a.offset, a.aligned_size).expect("release a");
    chunks.release(c.chunk, c.offset, c.aligned_size).expect("release c");

    assert_eq!(chunks.free_blocks(0).len(), 1);
    assert_eq!(chunks.free_bytes(0), 256);

    let mut fresh = configured(16, 256);
    fresh.allocate(16).expect("seed");
    fresh.reset();
    assert_eq!(fresh.free_blocks(0), chunks.free_blocks(0));
}

#[test]
fn release_validates_range_and_overlap() {
    let mut chunks = configured(16, 64);
    let region = chunks.allocate(32).expect("allocate");
    assert!(chunks.release(5, 0, 16).is_err());
    assert!(chunks.release(region.chunk, 48, 32).is_err());
    // Overlaps the free suffix [32, 64).
    assert!(chunks.release(region.chunk, 16, 32).is_err());
    assert!(chunks.release(region.chunk, region.offset, region.aligned_size).is_ok());
}

#[test]
fn reset_keeps_chunk_count() {
    let mut chunks = configured(16, 64);
    chunks.allocate(64).expect("a");
    chunks.allocate(64).expect("b");
    assert_eq!(chunks.chunk_count(), 2);
    chunks.reset();
    assert_eq!(chunks.chunk_count(), 2);
    assert_eq!(chunks.free_bytes(0), 64);
    assert_eq!(chunks.free_bytes(1), 64);
}

#[test]
fn randomized_allocate_release_round_trip() {
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    let mut chunks = configured(16, 4096);
    let mut regions = Vec::new();
    for _ in 0..64 {
        let size = rng.gen_range(1..256u64);
        regions.push(chunks.allocate(size).expect("allocate"));
    }
    regions.shuffle(&mut rng);
    for region in regions {
        chunks.release(region.chunk, region.offset, region.aligned_size).expect("release");
    }
    for chunk in 0..chunks.chunk_count() {
        assert_eq!(chunks.free_blocks(chunk).len(), 1);
        assert_eq!(chunks.free_bytes(chunk), chunks.chunk_max_size(chunk));
    }
}
