//! Error type.
//!
//! This is the shared error type for the whole crate. Every fallible core
//! operation returns one of these; panics are reserved for broken invariants
//! (a tag mismatch in a path where static checks were claimed).

use crate::handle::DeviceId;
use crate::node::NodeHandle;
use crate::typedesc::TypeTag;
use thiserror::Error;

/// Identifies the subsystem an error originated from.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Component {
    TypeRegistry,
    Resource,
    EventBus,
    Budget,
    Staging,
    DescriptorCache,
    Node,
    Connection,
    Topology,
    Graph,
    FrameSync,
    History,
    Injection,
    Instrumentation,
}

#[derive(Clone, Debug, Error)]
pub enum GraphError {
    #[error("type mismatch in {component:?}: expected {expected:?}, found {found:?}")]
    TypeMismatch {
        component: Component,
        expected: TypeTag,
        found: TypeTag,
        node: Option<NodeHandle>,
    },

    #[error("slot arity violation on node {node:?}: slot {slot} accepts at most {max} connections")]
    SlotArityViolation {
        node: NodeHandle,
        slot: usize,
        max: usize,
    },

    #[error("role mismatch: execute-only output cannot feed a dependency input (node {node:?}, slot {slot})")]
    RoleMismatch { node: NodeHandle, slot: usize },

    #[error("graph contains a cycle: {path:?}")]
    CyclicGraph { path: Vec<NodeHandle> },

    #[error("{component:?} budget exhausted: requested {requested} bytes, {available} available")]
    BudgetExhausted {
        component: Component,
        requested: u64,
        available: u64,
    },

    #[error("{component:?} queue full (capacity {capacity})")]
    QueueFull { component: Component, capacity: usize },

    #[error("device {device:?} lost")]
    DeviceLost { device: DeviceId },

    #[error("swapchain out of date")]
    SwapchainOutOfDate,

    #[error("compile failed at node {node:?}: {reason}")]
    CompileFailed { node: Option<NodeHandle>, reason: String },

    #[error("allocation tracker violated during execute: {count} allocations ({bytes} bytes)")]
    AllocationViolated { count: u64, bytes: u64 },

    #[error("{component:?} operation timed out after {millis} ms")]
    Timeout { component: Component, millis: u64 },

    #[error("invalid lifecycle transition for node {node:?}: {from} -> {to}")]
    InvalidTransition {
        node: NodeHandle,
        from: &'static str,
        to: &'static str,
    },

    #[error("slot {slot} of node {node:?} is required but unbound")]
    MissingInput { node: NodeHandle, slot: usize },

    #[error("unknown parameter {name:?} on node {node:?}")]
    UnknownParameter { node: NodeHandle, name: String },

    #[error("configuration error: {0}")]
    Config(String),
}

impl GraphError {
    /// Process exit code reserved for this error class, per the embedding
    /// contract. `None` means the error is recoverable and has no fatal code.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            GraphError::Config(_) => Some(2),
            GraphError::CompileFailed { .. } => Some(3),
            GraphError::DeviceLost { .. } => Some(4),
            GraphError::AllocationViolated { .. } => Some(5),
            _ => None,
        }
    }

    /// Transient errors clear on their own (the graph recompiles next frame).
    pub fn is_transient(&self) -> bool {
        matches!(self, GraphError::SwapchainOutOfDate)
    }
}

pub type Result<T> = ::std::result::Result<T, GraphError>;
