//! Nodes: the units of work in a render graph.
//!
//! A node implementation is a capability set ([RenderNode]) over a slot
//! signature; the graph wraps each one in a [NodeInstance] that owns the
//! lifecycle state, slot bindings, parameters and counters. Dispatch is by
//! trait object, with `downcast-rs` available for concrete-type recovery.

mod context;

pub use self::context::{CleanupContext, CompileContext, ExecuteContext};

use downcast_rs::{impl_downcast, Downcast};
use fxhash::FxHashMap;
use smallvec::SmallVec;

use crate::descriptor::DescriptorDeclaration;
use crate::error::{GraphError, Result};
use crate::event::{Event, EventKind, EventMask, EventPayload};
use crate::handle::DeviceMask;
use crate::inject::InjectionRequest;
use crate::resource::ResourceId;
use crate::slot::NodeSignature;

slotmap::new_key_type! {
    /// Stable generational key of a node owned by a graph.
    pub struct NodeHandle;
}

/// Lifecycle state.
///
/// ```text
/// Created -> Ready -> Compiled <-> Dirty
///                     Compiled -> Executing -> Complete -> Compiled
///                     any -> Error (terminal until reset)
/// ```
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NodeState {
    Created,
    Ready,
    Compiled,
    Dirty,
    Executing,
    Complete,
    Error,
}

impl NodeState {
    pub fn name(self) -> &'static str {
        match self {
            NodeState::Created => "Created",
            NodeState::Ready => "Ready",
            NodeState::Compiled => "Compiled",
            NodeState::Dirty => "Dirty",
            NodeState::Executing => "Executing",
            NodeState::Complete => "Complete",
            NodeState::Error => "Error",
        }
    }

    /// The lifecycle transition table. `Error` is reachable from anywhere
    /// and only leaves through an explicit reset (`Error -> Ready`).
    pub fn can_transition(self, to: NodeState) -> bool {
        use self::NodeState::*;
        if to == Error {
            return true;
        }
        match (self, to) {
            (Created, Ready) => true,
            (Ready, Compiled) => true,
            (Compiled, Dirty) | (Dirty, Compiled) => true,
            (Dirty, Dirty) => true,
            (Compiled, Executing) => true,
            (Executing, Complete) => true,
            (Complete, Compiled) => true,
            (Complete, Dirty) => true,
            (Error, Ready) => true,
            _ => false,
        }
    }
}

/// Bounded parameter value, keyed by names the node declares it understands.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Extent(u32, u32),
}

/// What a node wants done after observing an event.
#[derive(Copy, Clone, Debug, Default)]
pub struct EventResponse {
    /// Invalidate this node (and, by cascade, its dependents).
    pub dirty: bool,
    /// A follow-up event to publish, observed within the same
    /// `process_events` pass.
    pub emit: Option<(EventKind, EventPayload)>,
}

impl EventResponse {
    pub fn ignored() -> EventResponse {
        EventResponse::default()
    }

    pub fn mark_dirty() -> EventResponse {
        EventResponse {
            dirty: true,
            emit: None,
        }
    }

    pub fn emit(kind: EventKind, payload: EventPayload) -> EventResponse {
        EventResponse {
            dirty: false,
            emit: Some((kind, payload)),
        }
    }
}

/// The node capability set.
///
/// `compile` may only produce Persistent or Transient outputs and may not
/// read Execute-role inputs; `execute` may not touch the heap and mutates
/// only its pre-allocated slots. Both rules are enforced by the contexts.
pub trait RenderNode: Downcast + Send {
    /// Stable type identifier, used in logs and graphviz dumps.
    fn type_name(&self) -> &'static str;

    /// The node type's slot configuration. Called once when the node is
    /// added to a graph.
    fn signature(&self) -> Result<NodeSignature>;

    /// Events this node's `on_event` wants to observe.
    fn event_filter(&self) -> EventMask {
        EventMask::empty()
    }

    /// Pins the node to an explicit device set instead of inheriting the
    /// join of its inputs' affinities.
    fn device_override(&self) -> Option<DeviceMask> {
        None
    }

    fn compile(&mut self, ctx: &mut CompileContext) -> Result<()>;

    fn execute(&mut self, ctx: &mut ExecuteContext) -> Result<()>;

    fn cleanup(&mut self, _ctx: &mut CleanupContext) {}

    /// Shader-reflection metadata for descriptor pre-allocation.
    fn declare_descriptors(&self) -> Option<DescriptorDeclaration> {
        None
    }

    /// How many frames of history this node samples (0 for none). The
    /// graph's ring is sized to the deepest request, floor of 4.
    fn history_depth(&self) -> usize {
        0
    }

    fn on_event(&mut self, _event: &Event) -> EventResponse {
        EventResponse::ignored()
    }

    /// Delivery point for worker-injected requests, between frames.
    fn on_inject(&mut self, _request: &InjectionRequest) -> EventResponse {
        EventResponse::ignored()
    }
}

impl_downcast!(RenderNode);

/// Per-direction slot bindings. An input slot holds one resource per
/// connection (variadic and accumulation slots hold several, in
/// registration order); an output slot holds the resource the graph created
/// for it.
#[derive(Clone, Debug, Default)]
pub struct NodeSlots {
    pub(crate) inputs: Vec<SmallVec<[ResourceId; 1]>>,
    pub(crate) outputs: Vec<Option<ResourceId>>,
}

impl NodeSlots {
    pub(crate) fn for_signature(signature: &NodeSignature) -> NodeSlots {
        NodeSlots {
            inputs: vec![SmallVec::new(); signature.inputs().len()],
            outputs: vec![None; signature.outputs().len()],
        }
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct NodeCounters {
    pub executions: u64,
    pub compiles: u64,
    pub last_execute_ns: u64,
}

/// One node in a graph: implementation object plus the graph-side record.
pub struct NodeInstance {
    pub(crate) name: String,
    pub(crate) node: Box<dyn RenderNode>,
    pub(crate) signature: NodeSignature,
    pub(crate) slots: NodeSlots,
    pub(crate) state: NodeState,
    pub(crate) params: FxHashMap<String, ParamValue>,
    pub(crate) device_mask: DeviceMask,
    pub(crate) event_mask: EventMask,
    /// Monotonic insertion sequence; the topological tie-break.
    pub(crate) insertion_seq: u64,
    pub(crate) counters: NodeCounters,
}

impl NodeInstance {
    pub(crate) fn new(
        name: String,
        node: Box<dyn RenderNode>,
        insertion_seq: u64,
    ) -> Result<NodeInstance> {
        let signature = node.signature()?;
        let slots = NodeSlots::for_signature(&signature);
        let event_mask = node.event_filter();
        Ok(NodeInstance {
            name,
            node,
            signature,
            slots,
            state: NodeState::Created,
            params: FxHashMap::default(),
            device_mask: DeviceMask::DEVICE_0,
            event_mask,
            insertion_seq,
            counters: NodeCounters::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_name(&self) -> &'static str {
        self.node.type_name()
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn signature(&self) -> &NodeSignature {
        &self.signature
    }

    pub fn counters(&self) -> NodeCounters {
        self.counters
    }

    pub fn device_mask(&self) -> DeviceMask {
        self.device_mask
    }

    /// Checked lifecycle transition.
    pub(crate) fn transition(&mut self, handle: NodeHandle, to: NodeState) -> Result<()> {
        if !self.state.can_transition(to) {
            return Err(GraphError::InvalidTransition {
                node: handle,
                from: self.state.name(),
                to: to.name(),
            });
        }
        self.state = to;
        Ok(())
    }

    /// Downcasts the implementation object.
    pub fn implementation<T: RenderNode>(&self) -> Option<&T> {
        self.node.downcast_ref::<T>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_table() {
        use self::NodeState::*;
        assert!(Created.can_transition(Ready));
        assert!(Ready.can_transition(Compiled));
        assert!(Compiled.can_transition(Dirty));
        assert!(Dirty.can_transition(Compiled));
        assert!(Compiled.can_transition(Executing));
        assert!(Executing.can_transition(Complete));
        assert!(Complete.can_transition(Compiled));
        assert!(Executing.can_transition(Error));

        assert!(!Created.can_transition(Compiled));
        assert!(!Executing.can_transition(Compiled));
        assert!(!Error.can_transition(Executing));
        assert!(Error.can_transition(Ready));
    }
}
