use engine_core::alloc::{AllocState, BufferAllocator};
use engine_core::graph::{GraphView, TensorDesc};

struct Graph {
    nodes: Vec<TensorDesc>,
    leafs: Vec<TensorDesc>,
}

impl Graph {
    fn view(&self) -> GraphView<'_> {
        GraphView::new(&self.nodes, &self.leafs)
    }
}

fn single_buffer_graph(node_size: i32) -> Graph {
    Graph {
        leafs: vec![TensorDesc::leaf(1, 64).input()],
        nodes: vec![
            TensorDesc::node(2, 128, &[1]),
            TensorDesc::node(3, node_size, &[2]).output(),
        ],
    }
}

fn two_buffer_graph(node_size: i32) -> Graph {
    Graph {
        leafs: vec![TensorDesc::leaf(1, 64).input()],
        nodes: vec![TensorDesc::node(2, node_size, &[1]).output()],
    }
}

#[test]
fn initialize_validates_configuration() {
    let mut alloc = BufferAllocator::new();
    assert!(alloc.initialize(0, None, None).is_err());
    assert!(alloc.initialize(17, None, None).is_err());
    assert!(alloc.initialize(1, Some(&[3]), None).is_err());
    assert!(alloc.initialize(1, Some(&[16]), Some(&[10])).is_err());
    assert!(alloc.initialize(1, Some(&[16]), Some(&[-1])).is_err());
    assert_eq!(alloc.state(), AllocState::Uninitialized);

    assert!(alloc.initialize(1, Some(&[16]), Some(&[0])).is_ok());
    assert_eq!(alloc.state(), AllocState::Ready);
}

#[test]
fn reserve_commits_chunks_and_exposes_buffer_metadata() {
    let mut alloc = BufferAllocator::new();
    alloc.initialize(1, None, None).expect("initialize");
    let g = single_buffer_graph(512);
    alloc.reserve(g.view()).expect("reserve");

    assert!(alloc.get_buffer_size(0) > 0);
    assert_eq!(alloc.get_buffer_chunk_id(0), 0);
    assert_eq!(alloc.get_buffer_chunk_offset(0), 0);
    assert!(alloc.get_buffer_alloc_size(0) >= alloc.get_buffer_size(0) as u64);
    assert!(alloc.chunk_count() >= 1);
    assert!(alloc.summary().has_snapshot);
}

#[test]
fn reserve_n_size_reports_without_committing() {
    let mut alloc = BufferAllocator::new();
    alloc.initialize(1, None, None).expect("initialize");
    let g = single_buffer_graph(512);
    let sizes = alloc.reserve_n_size(g.view(), None, None).expect("reserve_n_size");
    assert_eq!(sizes.len(), 1);
    assert!(sizes[0] > 0);
    assert_eq!(alloc.chunk_count(), 0);
    assert!(!alloc.summary().has_snapshot);
}

#[test]
fn alloc_graph_with_matching_snapshot_succeeds() {
    let mut alloc = BufferAllocator::new();
    alloc.initialize(1, None, None).expect("initialize");
    let g = single_buffer_graph(512);
    alloc.reserve(g.view()).expect("reserve");
    let committed = alloc.get_buffer_size(0);

    alloc.alloc_graph(g.view()).expect("alloc_graph");
    assert_eq!(alloc.state(), AllocState::Allocated);
    assert_eq!(alloc.get_buffer_size(0), committed);
}

#[test]
fn single_buffer_auto_reserves_on_graph_drift() {
    let mut alloc = BufferAllocator::new();
    alloc.initialize(1, None, None).expect("initialize");
    alloc.reserve(single_buffer_graph(512).view()).expect("reserve");
    let before = alloc.get_buffer_size(0);

    let grown = single_buffer_graph(2048);
    alloc.alloc_graph(grown.view()).expect("auto reserve");
    assert_eq!(alloc.state(), AllocState::Allocated);
    assert!(alloc.get_buffer_size(0) > before);
}

#[test]
fn multi_buffer_drift_requires_explicit_reserve() {
    let mut alloc = BufferAllocator::new();
    alloc.initialize(2, None, None).expect("initialize");
    let node_ids = [1i32];
    let leaf_ids = [0i32];
    let g = two_buffer_graph(128);
    alloc
        .reserve_n(g.view(), Some(&node_ids), Some(&leaf_ids))
        .expect("reserve_n");
    alloc.alloc_graph(g.view()).expect("alloc_graph");

    let grown = two_buffer_graph(4096);
    let err = alloc.alloc_graph(grown.view()).unwrap_err();
    assert_eq!(err.code(), engine_common::ERR_BACKEND);
    // The machine stays usable for the mandated explicit reserve.
    alloc
        .reserve_n(grown.view(), Some(&node_ids), Some(&leaf_ids))
        .expect("explicit reserve");
    alloc.alloc_graph(grown.view()).expect("alloc after reserve");
    assert_eq!(alloc.state(), AllocState::Allocated);
}

#[test]
fn sequencing_violation_fails_the_machine() {
    let mut alloc = BufferAllocator::new();
    let g = single_buffer_graph(128);
    let err = alloc.reserve(g.view()).unwrap_err();
    assert!(matches!(err, engine_common::EngineError::Sequencing(_)));
    assert_eq!(alloc.state(), AllocState::Failed);

    // A failed machine only accepts release.
    assert!(alloc.alloc_graph(g.view()).is_err());
    alloc.release().expect("release");
    assert_eq!(alloc.state(), AllocState::Uninitialized);
    alloc.initialize(1, None, None).expect("initialize after release");
}

#[test]
fn release_returns_to_uninitialized_and_clears_state() {
    let mut alloc = BufferAllocator::new();
    alloc.initialize(1, None, None).expect("initialize");
    alloc.reserve(single_buffer_graph(256).view()).expect("reserve");
    assert!(alloc.get_buffer_size(0) > 0);

    alloc.release().expect("release");
    assert_eq!(alloc.state(), AllocState::Uninitialized);
    assert_eq!(alloc.get_buffer_size(0), 0);
    assert_eq!(alloc.get_buffer_chunk_id(0), -1);
    assert!(!alloc.summary().has_snapshot);
}

#[test]
fn alloc_graph_without_snapshot_auto_reserves_single_buffer() {
    let mut alloc = BufferAllocator::new();
    alloc.initialize(1, None, None).expect("initialize");
    let g = single_buffer_graph(256);
    alloc.alloc_graph(g.view()).expect("alloc without reserve");
    assert_eq!(alloc.state(), AllocState::Allocated);
    assert!(alloc.get_buffer_size(0) > 0);
}
