//! DAG bookkeeping: adjacency, cycle detection, deterministic ordering.
//!
//! The ordering is Kahn's algorithm with the ready set keyed by node
//! insertion sequence, so equal-rank nodes always come out in the order the
//! user created them and compiled plans are reproducible run to run.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use fxhash::FxHashMap;
use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableDiGraph};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use petgraph::Direction;

use crate::error::{GraphError, Result};
use crate::graph::connection::ConnectionKind;
use crate::node::NodeHandle;

/// Edge payload: which slots this connection joins.
#[derive(Copy, Clone, Debug)]
pub struct EdgeLabel {
    pub src_slot: usize,
    pub dst_slot: usize,
    pub kind: ConnectionKind,
}

pub struct GraphTopology {
    graph: StableDiGraph<NodeHandle, EdgeLabel, u32>,
    index: FxHashMap<NodeHandle, NodeIndex<u32>>,
    seq: FxHashMap<NodeHandle, u64>,
}

impl GraphTopology {
    pub fn new() -> GraphTopology {
        GraphTopology {
            graph: StableDiGraph::default(),
            index: FxHashMap::default(),
            seq: FxHashMap::default(),
        }
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn add_node(&mut self, handle: NodeHandle, insertion_seq: u64) {
        let idx = self.graph.add_node(handle);
        self.index.insert(handle, idx);
        self.seq.insert(handle, insertion_seq);
    }

    pub fn remove_node(&mut self, handle: NodeHandle) {
        if let Some(idx) = self.index.remove(&handle) {
            self.graph.remove_node(idx);
            self.seq.remove(&handle);
        }
    }

    pub fn connect(
        &mut self,
        src: NodeHandle,
        dst: NodeHandle,
        label: EdgeLabel,
    ) -> Option<EdgeIndex<u32>> {
        let (src, dst) = (self.index.get(&src)?, self.index.get(&dst)?);
        Some(self.graph.add_edge(*src, *dst, label))
    }

    /// Removes the edge feeding `dst`'s `dst_slot` from `src`, if present.
    pub fn disconnect(&mut self, src: NodeHandle, dst: NodeHandle, dst_slot: usize) -> bool {
        let (src, dst) = match (self.index.get(&src), self.index.get(&dst)) {
            (Some(s), Some(d)) => (*s, *d),
            _ => return false,
        };
        let edge = self
            .graph
            .edges_directed(dst, Direction::Incoming)
            .find(|e| e.source() == src && e.weight().dst_slot == dst_slot)
            .map(|e| e.id());
        match edge {
            Some(id) => {
                self.graph.remove_edge(id);
                true
            }
            None => false,
        }
    }

    fn sorted_by_seq(&self, mut handles: Vec<NodeHandle>) -> Vec<NodeHandle> {
        handles.sort_by_key(|h| self.seq[h]);
        handles
    }

    /// Deterministic topological order: Kahn's algorithm, ready set ordered
    /// by insertion sequence. Fails with the offending cycle path.
    pub fn topological_order(&self) -> Result<Vec<NodeHandle>> {
        let mut indegree: FxHashMap<NodeIndex<u32>, usize> = FxHashMap::default();
        for idx in self.graph.node_indices() {
            indegree.insert(
                idx,
                self.graph.edges_directed(idx, Direction::Incoming).count(),
            );
        }

        let mut ready: BinaryHeap<Reverse<(u64, u32)>> = BinaryHeap::new();
        for (&idx, &deg) in &indegree {
            if deg == 0 {
                ready.push(Reverse((self.seq[&self.graph[idx]], idx.index() as u32)));
            }
        }

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(Reverse((_, raw))) = ready.pop() {
            let idx = NodeIndex::new(raw as usize);
            order.push(self.graph[idx]);
            for edge in self.graph.edges_directed(idx, Direction::Outgoing) {
                let succ = edge.target();
                let deg = indegree.get_mut(&succ).expect("edge to unknown node");
                *deg -= 1;
                if *deg == 0 {
                    ready.push(Reverse((self.seq[&self.graph[succ]], succ.index() as u32)));
                }
            }
        }

        if order.len() != self.graph.node_count() {
            let path = self.find_cycle().unwrap_or_default();
            return Err(GraphError::CyclicGraph { path });
        }
        Ok(order)
    }

    /// Returns one cycle as a closed path `[A, B, .., A]`, or `None` when
    /// the graph is acyclic.
    pub fn cycle_check(&self) -> Option<Vec<NodeHandle>> {
        self.find_cycle()
    }

    fn find_cycle(&self) -> Option<Vec<NodeHandle>> {
        // Iterative DFS with an on-stack marker; the first back edge found
        // closes the reported cycle.
        #[derive(Copy, Clone, PartialEq)]
        enum Mark {
            New,
            OnStack,
            Done,
        }

        let mut marks: FxHashMap<NodeIndex<u32>, Mark> = self
            .graph
            .node_indices()
            .map(|i| (i, Mark::New))
            .collect();

        let mut starts: Vec<NodeIndex<u32>> = self.graph.node_indices().collect();
        starts.sort_by_key(|i| self.seq[&self.graph[*i]]);

        for start in starts {
            if marks[&start] != Mark::New {
                continue;
            }
            // Stack of (node, successor iterator position).
            let mut stack: Vec<(NodeIndex<u32>, Vec<NodeIndex<u32>>, usize)> = Vec::new();
            let succs = |idx: NodeIndex<u32>| {
                let mut s: Vec<NodeIndex<u32>> = self
                    .graph
                    .neighbors_directed(idx, Direction::Outgoing)
                    .collect();
                s.sort_by_key(|i| self.seq[&self.graph[*i]]);
                s
            };
            marks.insert(start, Mark::OnStack);
            stack.push((start, succs(start), 0));

            while !stack.is_empty() {
                // Advance the top frame; the borrow must end before the
                // stack is mutated below.
                let step = {
                    let (node, children, cursor) = stack.last_mut().unwrap();
                    if *cursor >= children.len() {
                        Err(*node)
                    } else {
                        let next = children[*cursor];
                        *cursor += 1;
                        Ok(next)
                    }
                };
                let next = match step {
                    Err(done) => {
                        marks.insert(done, Mark::Done);
                        stack.pop();
                        continue;
                    }
                    Ok(next) => next,
                };
                match marks[&next] {
                    Mark::OnStack => {
                        // Close the cycle: from `next`'s position on the
                        // stack down to the current node, then back.
                        let from = stack.iter().position(|(n, _, _)| *n == next).unwrap();
                        let mut path: Vec<NodeHandle> =
                            stack[from..].iter().map(|(n, _, _)| self.graph[*n]).collect();
                        path.push(self.graph[next]);
                        return Some(path);
                    }
                    Mark::New => {
                        marks.insert(next, Mark::OnStack);
                        let grand = succs(next);
                        stack.push((next, grand, 0));
                    }
                    Mark::Done => {}
                }
            }
        }
        None
    }

    /// Direct dependencies (producers) of `handle`, in insertion order.
    pub fn direct_deps(&self, handle: NodeHandle) -> Vec<NodeHandle> {
        let idx = match self.index.get(&handle) {
            Some(i) => *i,
            None => return Vec::new(),
        };
        let deps: Vec<NodeHandle> = self
            .graph
            .neighbors_directed(idx, Direction::Incoming)
            .map(|i| self.graph[i])
            .collect();
        self.sorted_by_seq(dedup(deps))
    }

    /// Direct dependents (consumers) of `handle`, in insertion order.
    pub fn direct_dependents(&self, handle: NodeHandle) -> Vec<NodeHandle> {
        let idx = match self.index.get(&handle) {
            Some(i) => *i,
            None => return Vec::new(),
        };
        let deps: Vec<NodeHandle> = self
            .graph
            .neighbors_directed(idx, Direction::Outgoing)
            .map(|i| self.graph[i])
            .collect();
        self.sorted_by_seq(dedup(deps))
    }

    /// All transitive dependencies of `handle`.
    pub fn transitive_deps(&self, handle: NodeHandle) -> Vec<NodeHandle> {
        self.walk(handle, Direction::Incoming)
    }

    /// All transitive dependents of `handle`; the invalidation cascade set.
    pub fn transitive_dependents(&self, handle: NodeHandle) -> Vec<NodeHandle> {
        self.walk(handle, Direction::Outgoing)
    }

    fn walk(&self, handle: NodeHandle, direction: Direction) -> Vec<NodeHandle> {
        let start = match self.index.get(&handle) {
            Some(i) => *i,
            None => return Vec::new(),
        };
        let mut seen: FxHashMap<NodeIndex<u32>, ()> = FxHashMap::default();
        let mut stack = vec![start];
        let mut out = Vec::new();
        while let Some(idx) = stack.pop() {
            for next in self.graph.neighbors_directed(idx, direction) {
                if seen.insert(next, ()).is_none() {
                    out.push(self.graph[next]);
                    stack.push(next);
                }
            }
        }
        self.sorted_by_seq(out)
    }

    /// Nodes with no dependencies.
    pub fn roots(&self) -> Vec<NodeHandle> {
        let roots: Vec<NodeHandle> = self
            .graph
            .externals(Direction::Incoming)
            .map(|i| self.graph[i])
            .collect();
        self.sorted_by_seq(roots)
    }

    /// Nodes nothing depends on.
    pub fn leaves(&self) -> Vec<NodeHandle> {
        let leaves: Vec<NodeHandle> = self
            .graph
            .externals(Direction::Outgoing)
            .map(|i| self.graph[i])
            .collect();
        self.sorted_by_seq(leaves)
    }

    /// Every edge, for introspection and graphviz dumps.
    pub fn edges(&self) -> impl Iterator<Item = (NodeHandle, NodeHandle, EdgeLabel)> + '_ {
        self.graph
            .edge_references()
            .map(move |e| (self.graph[e.source()], self.graph[e.target()], *e.weight()))
    }
}

fn dedup(mut handles: Vec<NodeHandle>) -> Vec<NodeHandle> {
    handles.sort();
    handles.dedup();
    handles
}

impl Default for GraphTopology {
    fn default() -> GraphTopology {
        GraphTopology::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn label() -> EdgeLabel {
        EdgeLabel {
            src_slot: 0,
            dst_slot: 0,
            kind: ConnectionKind::Direct,
        }
    }

    fn build(n: usize) -> (GraphTopology, Vec<NodeHandle>) {
        let mut map: SlotMap<NodeHandle, ()> = SlotMap::with_key();
        let handles: Vec<NodeHandle> = (0..n).map(|_| map.insert(())).collect();
        let mut topo = GraphTopology::new();
        for (i, &h) in handles.iter().enumerate() {
            topo.add_node(h, i as u64);
        }
        (topo, handles)
    }

    #[test]
    fn linear_chain_orders_in_insertion_order() {
        let (mut topo, h) = build(3);
        topo.connect(h[0], h[1], label());
        topo.connect(h[1], h[2], label());
        assert_eq!(topo.topological_order().unwrap(), vec![h[0], h[1], h[2]]);
    }

    #[test]
    fn tie_break_is_insertion_order() {
        // Diamond: 0 -> {2, 1} -> 3. Both 1 and 2 become ready together;
        // 1 must come first because it was inserted first.
        let (mut topo, h) = build(4);
        topo.connect(h[0], h[2], label());
        topo.connect(h[0], h[1], label());
        topo.connect(h[1], h[3], label());
        topo.connect(h[2], h[3], label());
        assert_eq!(topo.topological_order().unwrap(), vec![h[0], h[1], h[2], h[3]]);
    }

    #[test]
    fn cycle_is_reported_as_closed_path() {
        let (mut topo, h) = build(3);
        topo.connect(h[0], h[1], label());
        topo.connect(h[1], h[2], label());
        topo.connect(h[2], h[0], label());

        match topo.topological_order() {
            Err(GraphError::CyclicGraph { path }) => {
                assert_eq!(path, vec![h[0], h[1], h[2], h[0]]);
            }
            other => panic!("expected cycle, got {:?}", other.map(|_| ())),
        }
        assert!(topo.cycle_check().is_some());
    }

    #[test]
    fn order_length_equals_node_count_without_repeats() {
        let (mut topo, h) = build(5);
        topo.connect(h[0], h[2], label());
        topo.connect(h[1], h[2], label());
        topo.connect(h[2], h[3], label());
        topo.connect(h[2], h[4], label());
        let order = topo.topological_order().unwrap();
        assert_eq!(order.len(), 5);
        let mut unique = order.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 5);
    }

    #[test]
    fn consumers_follow_producers() {
        let (mut topo, h) = build(4);
        topo.connect(h[3], h[0], label());
        topo.connect(h[0], h[1], label());
        let order = topo.topological_order().unwrap();
        let pos = |x: NodeHandle| order.iter().position(|&o| o == x).unwrap();
        assert!(pos(h[3]) < pos(h[0]));
        assert!(pos(h[0]) < pos(h[1]));
    }

    #[test]
    fn deps_and_dependents() {
        let (mut topo, h) = build(4);
        topo.connect(h[0], h[1], label());
        topo.connect(h[1], h[2], label());
        topo.connect(h[1], h[3], label());

        assert_eq!(topo.direct_deps(h[1]), vec![h[0]]);
        assert_eq!(topo.direct_dependents(h[1]), vec![h[2], h[3]]);
        assert_eq!(topo.transitive_deps(h[2]), vec![h[0], h[1]]);
        assert_eq!(topo.transitive_dependents(h[0]), vec![h[1], h[2], h[3]]);
        assert_eq!(topo.roots(), vec![h[0]]);
        assert_eq!(topo.leaves(), vec![h[2], h[3]]);
    }

    #[test]
    fn disconnect_removes_the_slot_edge() {
        let (mut topo, h) = build(2);
        topo.connect(
            h[0],
            h[1],
            EdgeLabel {
                src_slot: 0,
                dst_slot: 1,
                kind: ConnectionKind::Direct,
            },
        );
        assert!(!topo.disconnect(h[0], h[1], 0));
        assert!(topo.disconnect(h[0], h[1], 1));
        assert!(topo.direct_deps(h[1]).is_empty());
    }
}
