//! Graphviz dump of the compiled graph.

use std::io::{self, Write};

use crate::graph::connection::ConnectionKind;
use crate::graph::RenderGraph;

impl RenderGraph {
    /// Writes the graph as a `dot` digraph: one record per node with its
    /// state and device mask, one edge per connection labeled with the
    /// slots it joins. Dashed edges are accumulations.
    pub fn dump_graphviz<W: Write>(&self, w: &mut W) -> io::Result<()> {
        writeln!(w, "digraph render_graph {{")?;
        writeln!(w, "  rankdir=LR;")?;
        writeln!(w, "  node [shape=record, fontsize=10];")?;

        for (handle, instance) in self.nodes.iter() {
            let position = self
                .order
                .iter()
                .position(|&h| h == handle)
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".into());
            writeln!(
                w,
                "  n{} [label=\"{{{} | {} | {:?} | order {} | devices {:#06b}}}\"];",
                instance.insertion_seq,
                instance.name,
                instance.type_name(),
                instance.state,
                position,
                instance.device_mask.bits(),
            )?;
        }

        for (src, dst, label) in self.topology.edges() {
            let (src_seq, dst_seq) = (
                self.nodes[src].insertion_seq,
                self.nodes[dst].insertion_seq,
            );
            let style = match label.kind {
                ConnectionKind::Direct => "solid",
                ConnectionKind::Variadic => "bold",
                ConnectionKind::Accumulation => "dashed",
            };
            writeln!(
                w,
                "  n{} -> n{} [label=\"{}:{}\", style={}];",
                src_seq, dst_seq, label.src_slot, label.dst_slot, style
            )?;
        }

        writeln!(w, "}}")
    }
}
