//! Zero-allocation law, end to end.
//!
//! This binary installs the tracking allocator globally and runs the whole
//! workload in a single test so no sibling test thread can allocate while
//! the tracker is armed.

mod common;

use common::*;
use vixen_core::alloc::TrackingAllocator;
use vixen_core::{ConnectionKind, CoreContext, GraphConfig, RenderGraph};

#[global_allocator]
static ALLOC: TrackingAllocator = TrackingAllocator;

fn tracked_graph() -> RenderGraph {
    let mut config = GraphConfig::default();
    config.allocation_tracking = true;
    RenderGraph::new(
        CoreContext::new(config),
        Box::new(common::TestGpu::new()),
    )
}

#[test]
fn execute_never_touches_the_heap() {
    // Linear chain: source -> filter -> sink.
    let mut linear = tracked_graph();
    let a = linear
        .add_node("a", Box::new(ImageSource { raw: 100 }))
        .unwrap();
    let b = linear
        .add_node("b", Box::new(ImageFilter { raw: 200 }))
        .unwrap();
    let c = linear
        .add_node("c", Box::new(ImageSink { last_seen: 0 }))
        .unwrap();
    linear.connect(a, 0, b, 0, None).unwrap();
    linear.connect(b, 0, c, 0, None).unwrap();
    linear.build().unwrap();
    linear.compile().unwrap();

    for frame in 0..1_000 {
        let report = linear.execute().unwrap();
        assert_eq!(
            report.allocations.count, 0,
            "linear graph allocated on frame {} ({} bytes, largest {})",
            frame, report.allocations.bytes, report.allocations.largest
        );
    }
    linear.cleanup().unwrap();

    // Variadic gather: three producers into one sequence input.
    let mut gather_graph = tracked_graph();
    let p1 = gather_graph
        .add_node("p1", Box::new(ViewSource { raw: 1 }))
        .unwrap();
    let p2 = gather_graph
        .add_node("p2", Box::new(ViewSource { raw: 2 }))
        .unwrap();
    let p3 = gather_graph
        .add_node("p3", Box::new(ViewSource { raw: 3 }))
        .unwrap();
    let gather = gather_graph
        .add_node("gather", Box::new(ViewGather::new()))
        .unwrap();
    for &p in &[p1, p2, p3] {
        gather_graph
            .connect(p, 0, gather, 0, Some(ConnectionKind::Accumulation))
            .unwrap();
    }
    gather_graph.build().unwrap();
    gather_graph.compile().unwrap();

    for frame in 0..1_000 {
        let report = gather_graph.execute().unwrap();
        assert_eq!(
            report.allocations.count, 0,
            "gather graph allocated on frame {}",
            frame
        );
    }
    let node = gather_graph.node_impl::<ViewGather>(gather).unwrap();
    assert_eq!(&node.seen[..node.seen_len], &[1, 2, 3]);
    gather_graph.cleanup().unwrap();
}
