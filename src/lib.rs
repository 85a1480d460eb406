//! VIXEN core: a typed, data-driven render-graph engine.
//!
//! User code declares nodes and connects their typed slots; the graph
//! compiles them into a deterministic GPU command plan and executes it
//! frame after frame without touching the heap. The pieces:
//!
//! * a closed slot type registry with tag-checked, type-erased payloads,
//! * graph-owned resources with lifetimes, refcounts and deferred
//!   destruction,
//! * a fixed-capacity event bus cascading invalidations between frames,
//! * pre-allocation subsystems (budgets, staging, descriptor pools, frame
//!   history, injection queue) sized at setup,
//! * an orchestrator driving Setup, Compile, Execute and Cleanup with
//!   frame-in-flight synchronization,
//! * debug-build instrumentation asserting the zero-allocation execute.
//!
//! The GPU itself sits behind [traits::GpuBackend]; this crate never talks
//! to a graphics API directly.

pub mod alloc;
pub mod budget;
pub mod command;
pub mod descriptor;
pub mod error;
pub mod event;
pub mod graph;
pub mod handle;
pub mod history;
pub mod inject;
pub mod node;
pub mod resource;
pub mod slot;
pub mod staging;
pub mod sync;
#[cfg(test)]
pub(crate) mod test_support;
pub mod traits;
pub mod typedesc;

pub use crate::budget::{BudgetLimits, MemoryKind};
pub use crate::error::{Component, GraphError, Result};
pub use crate::event::{Event, EventKind, EventMask, EventPayload, OverflowPolicy};
pub use crate::graph::connection::ConnectionKind;
pub use crate::graph::{FrameReport, GraphStats, RenderGraph};
pub use crate::handle::{DeviceId, DeviceMask};
pub use crate::node::{
    CompileContext, EventResponse, ExecuteContext, NodeHandle, NodeState, ParamValue, RenderNode,
};
pub use crate::resource::{ResourceId, ResourceLifetime};
pub use crate::slot::{NodeSignature, SlotArity, SlotDescriptor, SlotRole};
pub use crate::typedesc::{BaseType, SlotValue, TypeTag};

use crate::error::GraphError as Error;

/// Tunables resolved at context creation. Defaults are overridable through
/// the `config` layer (file or `VIXEN_`-prefixed environment).
#[derive(Clone, Debug)]
pub struct GraphConfig {
    pub frames_in_flight: usize,
    pub history_depth: usize,
    /// Explicit event ring capacity; `None` applies the node-count rule.
    pub event_capacity: Option<usize>,
    pub overflow_policy: OverflowPolicy,
    pub uploader_count: usize,
    pub concurrent_uploads: usize,
    pub max_transfers_per_frame: usize,
    pub staging_buffer_size: u64,
    pub injection_capacity: usize,
    pub fence_timeout_ms: u64,
    pub device_local_budget: BudgetLimits,
    pub host_visible_budget: BudgetLimits,
    pub staging_budget: BudgetLimits,
    pub overdraft_pct: u64,
    pub surface_extent: (u32, u32),
    pub allocation_tracking: bool,
}

impl Default for GraphConfig {
    fn default() -> GraphConfig {
        GraphConfig {
            frames_in_flight: 2,
            history_depth: 4,
            event_capacity: None,
            overflow_policy: OverflowPolicy::Strict,
            uploader_count: 2,
            concurrent_uploads: 4,
            max_transfers_per_frame: 8,
            staging_buffer_size: 4 << 20,
            injection_capacity: 256,
            fence_timeout_ms: 1_000,
            device_local_budget: BudgetLimits::default(),
            host_visible_budget: BudgetLimits::default(),
            staging_budget: BudgetLimits::default(),
            overdraft_pct: 10,
            surface_extent: (1280, 720),
            allocation_tracking: false,
        }
    }
}

impl GraphConfig {
    /// Loads overrides from the environment (`VIXEN_*` keys) on top of the
    /// defaults. `ENABLE_ALLOCATION_TRACKING` is honored as a bare toggle
    /// for builds that compile the tracker in.
    pub fn load() -> Result<GraphConfig> {
        let source = config::Config::builder()
            .add_source(config::Environment::with_prefix("VIXEN"))
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        let mut cfg = GraphConfig::default();
        if let Ok(v) = source.get_int("frames_in_flight") {
            cfg.frames_in_flight = v as usize;
        }
        if let Ok(v) = source.get_int("history_depth") {
            cfg.history_depth = v as usize;
        }
        if let Ok(v) = source.get_int("event_capacity") {
            cfg.event_capacity = Some(v as usize);
        }
        if let Ok(v) = source.get_string("overflow_policy") {
            cfg.overflow_policy = match v.as_str() {
                "strict" => OverflowPolicy::Strict,
                "fallback" => OverflowPolicy::Fallback,
                "discard" => OverflowPolicy::Discard,
                other => {
                    return Err(Error::Config(format!(
                        "unknown overflow policy {:?}",
                        other
                    )))
                }
            };
        }
        if let Ok(v) = source.get_int("staging_buffer_size") {
            cfg.staging_buffer_size = v as u64;
        }
        if let Ok(v) = source.get_int("injection_capacity") {
            cfg.injection_capacity = v as usize;
        }
        if let Ok(v) = source.get_int("fence_timeout_ms") {
            cfg.fence_timeout_ms = v as u64;
        }
        if let Ok(v) = source.get_int("overdraft_pct") {
            cfg.overdraft_pct = v as u64;
        }
        if let Ok(v) = source.get_bool("allocation_tracking") {
            cfg.allocation_tracking = v;
        }
        if std::env::var_os("ENABLE_ALLOCATION_TRACKING").is_some() {
            cfg.allocation_tracking = true;
        }
        Ok(cfg)
    }
}

/// Process-wide context handed to every graph. Replaces the global
/// registries and loggers of older engines: nothing in the core reaches for
/// hidden global state besides the allocator hook.
#[derive(Clone, Debug)]
pub struct CoreContext {
    pub config: GraphConfig,
}

impl CoreContext {
    pub fn new(config: GraphConfig) -> CoreContext {
        CoreContext { config }
    }

    /// Context with environment overrides applied.
    pub fn from_env() -> Result<CoreContext> {
        Ok(CoreContext {
            config: GraphConfig::load()?,
        })
    }
}

impl Default for CoreContext {
    fn default() -> CoreContext {
        CoreContext::new(GraphConfig::default())
    }
}
