//! The render-graph orchestrator.
//!
//! Owns every node and resource, and drives the four phases:
//!
//! * **Setup** — nodes are added and connected; `build` validates the DAG
//!   and pre-sizes every runtime structure.
//! * **Compile** — device affinity propagates, the topological order is
//!   fixed, nodes produce their outputs and declare descriptor estimates,
//!   pools fill up. Idempotent per invalidation; failures roll back to the
//!   previous plan.
//! * **Execute** — one frame: wait, drain injections, process events,
//!   recompile what went dirty, then walk the order recording commands with
//!   the allocation tracker armed.
//! * **Cleanup** — teardown in reverse topological order, deferred
//!   destructions last.

pub mod connection;
mod dump;
pub mod topology;

use std::time::{Duration, Instant};

use fxhash::FxHashSet;
use log::{debug, info, warn};
use slotmap::SlotMap;

use crate::alloc::{AllocationReport, AllocationTracker};
use crate::budget::{BudgetManager, MemoryKind};
use crate::command::CommandStream;
use crate::descriptor::DescriptorCache;
use crate::error::{GraphError, Result};
use crate::event::{Event, EventBus, EventKind, EventPayload, EventMask};
use crate::graph::connection::{ConnectionKind, ConnectionRegistry};
use crate::graph::topology::{EdgeLabel, GraphTopology};
use crate::handle::{DeviceId, DeviceMask};
use crate::history::TimelineHistory;
use crate::inject::{InjectionQueue, InjectionRequest, InjectionStats};
use crate::node::{
    CleanupContext, CompileContext, ExecuteContext, NodeCounters, NodeHandle, NodeInstance,
    NodeState, ParamValue, RenderNode,
};
use crate::resource::{
    DeferredDestroyQueue, Resource, ResourceId, ResourceLifetime,
};
use crate::slot::Nullability;
use crate::staging::StagingPool;
use crate::traits::GpuBackend;
use crate::CoreContext;

/// Minimum event ring capacity; the sizing rule is `max(64, 2 * 3 * nodes)`.
const MIN_EVENT_CAPACITY: usize = 64;

/// Upper bound on cascade passes within one `process_events` call.
const MAX_EVENT_PASSES: usize = 4;

/// Baseline command slots reserved per node on top of declared estimates.
const BASE_COMMANDS_PER_NODE: usize = 4;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum GraphState {
    Building,
    Ready,
    Error,
    Destroyed,
}

/// Outcome of one executed frame.
#[derive(Copy, Clone, Debug)]
pub struct FrameReport {
    pub frame: u64,
    /// False when the frame was skipped (swapchain out of date).
    pub presented: bool,
    pub image_index: u32,
    pub allocations: AllocationReport,
}

#[derive(Clone, Debug)]
pub struct NodeStats {
    pub handle: NodeHandle,
    pub name: String,
    pub state: NodeState,
    pub counters: NodeCounters,
}

#[derive(Clone, Debug)]
pub struct GraphStats {
    pub frame: u64,
    pub plan_id: u64,
    pub event_queue_depth: usize,
    pub budget: Vec<(MemoryKind, u64, u64, u64)>,
    pub injection: InjectionStats,
    pub staging_emergencies: u64,
    pub last_allocations: AllocationReport,
    pub nodes: Vec<NodeStats>,
}

pub struct RenderGraph {
    ctx: CoreContext,
    backend: Box<dyn GpuBackend>,
    state: GraphState,

    nodes: SlotMap<NodeHandle, NodeInstance>,
    resources: SlotMap<ResourceId, Resource>,
    topology: GraphTopology,
    rules: ConnectionRegistry,
    insertion_counter: u64,

    /// The compiled plan: topological order and its identifier.
    order: Vec<NodeHandle>,
    prev_order: Vec<NodeHandle>,
    plan_id: u64,
    dirty: FxHashSet<NodeHandle>,

    events: EventBus,
    budget: BudgetManager,
    staging: StagingPool,
    descriptors: DescriptorCache,
    history: TimelineHistory,
    sync: Option<crate::sync::FrameSync>,
    injection: InjectionQueue,
    tracker: AllocationTracker,
    last_allocations: AllocationReport,

    deferred: DeferredDestroyQueue,
    /// Per frame-slot destroy lists; a list is flushed once its slot's
    /// fence has retired.
    destroy_ring: Vec<Vec<ResourceId>>,

    commands: CommandStream,
    // Pre-sized execute-path scratch.
    event_scratch: Vec<Event>,
    response_scratch: Vec<(EventKind, EventPayload)>,
    dirty_scratch: Vec<NodeHandle>,
    inject_scratch: Vec<InjectionRequest>,
    evicted_scratch: Vec<ResourceId>,
    destroy_scratch: Vec<ResourceId>,

    frame: u64,
}

impl RenderGraph {
    pub fn new(ctx: CoreContext, backend: Box<dyn GpuBackend>) -> RenderGraph {
        let cfg = &ctx.config;
        let budget = BudgetManager::new(
            cfg.device_local_budget,
            cfg.host_visible_budget,
            cfg.staging_budget,
            cfg.overdraft_pct,
        );
        let tracker = AllocationTracker::new(cfg.allocation_tracking);
        let injection = InjectionQueue::with_capacity(cfg.injection_capacity);
        let history = TimelineHistory::new(cfg.history_depth, 1);
        RenderGraph {
            backend,
            state: GraphState::Building,
            nodes: SlotMap::with_key(),
            resources: SlotMap::with_key(),
            topology: GraphTopology::new(),
            rules: ConnectionRegistry::new(),
            insertion_counter: 0,
            order: Vec::new(),
            prev_order: Vec::new(),
            plan_id: 0,
            dirty: FxHashSet::default(),
            events: EventBus::with_capacity(MIN_EVENT_CAPACITY, cfg.overflow_policy),
            budget,
            staging: StagingPool::new(),
            descriptors: DescriptorCache::new(),
            history,
            sync: None,
            injection,
            tracker,
            last_allocations: AllocationReport::default(),
            deferred: DeferredDestroyQueue::with_capacity(64),
            destroy_ring: Vec::new(),
            commands: CommandStream::with_capacity(0),
            event_scratch: Vec::new(),
            response_scratch: Vec::new(),
            dirty_scratch: Vec::new(),
            inject_scratch: Vec::new(),
            evicted_scratch: Vec::new(),
            destroy_scratch: Vec::new(),
            frame: 0,
            ctx,
        }
    }

    // --- setup -----------------------------------------------------------

    /// Adds a node. Its signature is validated and one resource per output
    /// slot is created with the declared type tag.
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        node: Box<dyn RenderNode>,
    ) -> Result<NodeHandle> {
        self.expect_state(GraphState::Building)?;
        let seq = self.insertion_counter;
        self.insertion_counter += 1;
        let mut instance = NodeInstance::new(name.into(), node, seq)?;

        for desc in instance.signature.outputs() {
            let resource = Resource::create(desc.ty)?;
            let id = self.resources.insert(resource);
            instance.slots.outputs[desc.index] = Some(id);
        }

        let handle = self.nodes.insert(instance);
        self.topology.add_node(handle, seq);
        debug!(
            "added node {:?} ({})",
            handle,
            self.nodes[handle].type_name()
        );
        Ok(handle)
    }

    /// Connects an output slot to an input slot. `kind` defaults to Direct.
    pub fn connect(
        &mut self,
        src: NodeHandle,
        src_slot: usize,
        dst: NodeHandle,
        dst_slot: usize,
        kind: Option<ConnectionKind>,
    ) -> Result<()> {
        self.expect_state(GraphState::Building)?;
        let kind = kind.unwrap_or(ConnectionKind::Direct);

        let src_desc = *self
            .nodes
            .get(src)
            .and_then(|n| n.signature.outputs().get(src_slot))
            .ok_or(GraphError::MissingInput {
                node: src,
                slot: src_slot,
            })?;
        let dst_desc = *self
            .nodes
            .get(dst)
            .and_then(|n| n.signature.inputs().get(dst_slot))
            .ok_or(GraphError::MissingInput {
                node: dst,
                slot: dst_slot,
            })?;

        let bound = self.nodes[dst].slots.inputs[dst_slot].len();
        self.rules
            .validate(dst, &src_desc, &dst_desc, kind, bound)?;

        let resource = self.nodes[src].slots.outputs[src_slot]
            .expect("output resource created at add_node");
        self.nodes[dst].slots.inputs[dst_slot].push(resource);
        let _ = self.topology.connect(
            src,
            dst,
            EdgeLabel {
                src_slot,
                dst_slot,
                kind,
            },
        );
        Ok(())
    }

    pub fn set_parameter(
        &mut self,
        handle: NodeHandle,
        name: impl Into<String>,
        value: ParamValue,
    ) -> Result<()> {
        let name = name.into();
        let instance = self.nodes.get_mut(handle).ok_or(GraphError::UnknownParameter {
            node: handle,
            name: name.clone(),
        })?;
        instance.params.insert(name, value);
        Ok(())
    }

    /// Registers extra connection rules or conversions. Setup only.
    pub fn connection_rules_mut(&mut self) -> &mut ConnectionRegistry {
        &mut self.rules
    }

    /// Subscribes an external callback to bus events.
    pub fn subscribe(
        &mut self,
        mask: EventMask,
        callback: Box<dyn FnMut(&Event) + Send>,
    ) -> usize {
        self.events.subscribe(mask, callback)
    }

    pub fn emit(&self, kind: EventKind, payload: EventPayload) -> Result<u64> {
        self.events.emit(kind, payload)
    }

    pub fn on_window_resize(&self, width: u32, height: u32) {
        let _ = self
            .events
            .emit(EventKind::WindowResize, EventPayload::Extent { width, height });
    }

    /// External notification that a device was lost. The affected subgraph
    /// is isolated at the next execute.
    pub fn on_device_lost(&self, device: DeviceId) {
        let _ = self
            .events
            .emit(EventKind::DeviceLost, EventPayload::Device(device));
    }

    /// Shared handle for worker threads feeding the graph.
    pub fn injection_queue(&self) -> &InjectionQueue {
        &self.injection
    }

    /// Validates the graph and pre-sizes every runtime structure. Fails
    /// fast on cycles and leaves the graph unchanged when it does.
    pub fn build(&mut self) -> Result<()> {
        self.expect_state(GraphState::Building)?;

        if let Some(path) = self.topology.cycle_check() {
            return Err(GraphError::CyclicGraph { path });
        }
        self.check_required_inputs()?;

        let node_count = self.nodes.len();
        let cfg = &self.ctx.config;

        // Event ring: three event classes, two bursts each, per node.
        let capacity = cfg
            .event_capacity
            .unwrap_or_else(|| MIN_EVENT_CAPACITY.max(2 * 3 * node_count));
        self.events.resize(capacity);
        self.event_scratch = Vec::with_capacity(capacity);
        self.response_scratch = Vec::with_capacity(capacity);
        self.dirty_scratch = Vec::with_capacity(node_count);

        // Staging: one pre-warmed buffer per uploader per concurrent
        // upload; multi-device transfers double the demand.
        let mut staging_count = cfg.uploader_count * cfg.concurrent_uploads;
        if self.backend.device_count() > 1 {
            staging_count += 2 * cfg.max_transfers_per_frame;
        }
        let staging_size = cfg.staging_buffer_size;
        if let Err(err) = self.staging.pre_warm(
            self.backend.as_ref(),
            &self.budget,
            staging_count,
            staging_size,
        ) {
            // Unlike connection/cycle errors, a failed pre-allocation is
            // not recoverable by editing the graph.
            self.state = GraphState::Error;
            return Err(err);
        }

        // History: deepest request across nodes, floor of 4.
        let depth = self
            .nodes
            .values()
            .map(|n| n.node.history_depth())
            .max()
            .unwrap_or(0)
            .max(cfg.history_depth);
        let output_count: usize = self
            .nodes
            .values()
            .map(|n| n.slots.outputs.len())
            .sum::<usize>()
            .max(1);
        self.history = TimelineHistory::new(depth, output_count);

        self.sync = Some(crate::sync::FrameSync::new(
            self.backend.as_ref(),
            cfg.frames_in_flight,
            self.backend.swapchain_image_count(),
        ));
        let in_flight = self.sync.as_ref().unwrap().frames_in_flight();
        self.destroy_ring = (0..in_flight)
            .map(|_| Vec::with_capacity(self.resources.len() + output_count))
            .collect();

        let destroy_capacity = self.resources.len() + output_count * depth;
        self.deferred.ensure_capacity(destroy_capacity);
        self.evicted_scratch = Vec::with_capacity(output_count * depth);
        self.destroy_scratch = Vec::with_capacity(destroy_capacity);
        self.inject_scratch = Vec::with_capacity(cfg.injection_capacity);

        for (handle, instance) in self.nodes.iter_mut() {
            instance.transition(handle, NodeState::Ready)?;
        }

        info!(
            "graph built: {} nodes, event capacity {}, {} staging buffers, history depth {}",
            node_count, capacity, staging_count, depth
        );
        self.state = GraphState::Ready;
        Ok(())
    }

    fn check_required_inputs(&self) -> Result<()> {
        for (handle, instance) in self.nodes.iter() {
            for desc in instance.signature.inputs() {
                if desc.nullability == Nullability::Required
                    && instance.slots.inputs[desc.index].is_empty()
                {
                    return Err(GraphError::MissingInput {
                        node: handle,
                        slot: desc.index,
                    });
                }
            }
        }
        Ok(())
    }

    fn expect_state(&self, expected: GraphState) -> Result<()> {
        if self.state != expected {
            return Err(GraphError::Config(format!(
                "operation requires {:?} graph, current state is {:?}",
                expected, self.state
            )));
        }
        Ok(())
    }

    // --- compile ---------------------------------------------------------

    /// Compiles the graph. Idempotent: with nothing dirty and a plan in
    /// hand, returns the current plan id without touching any node.
    pub fn compile(&mut self) -> Result<u64> {
        self.expect_state(GraphState::Ready)?;

        let full = self.order.is_empty();
        if !full && self.dirty.is_empty() {
            return Ok(self.plan_id);
        }

        let order = match self.topology.topological_order() {
            Ok(order) => order,
            Err(err) => {
                self.emit_compile_failed(None);
                return Err(err);
            }
        };

        self.propagate_affinity(&order);
        self.descriptors.reset_estimates();

        let mut cmd_estimate = 0usize;
        for (position, &handle) in order.iter().enumerate() {
            if self.nodes[handle].state == NodeState::Error {
                continue;
            }
            let needs_compile = full || self.dirty.contains(&handle);
            if !needs_compile {
                // Account for retained nodes when sizing the stream.
                cmd_estimate += BASE_COMMANDS_PER_NODE;
                continue;
            }
            match self.compile_node(handle) {
                Ok(estimate) => cmd_estimate += BASE_COMMANDS_PER_NODE + estimate,
                Err(err) => {
                    // Roll back to the previous successful plan.
                    self.order = self.prev_order.clone();
                    if let Some(instance) = self.nodes.get_mut(handle) {
                        instance.state = NodeState::Error;
                    }
                    self.emit_compile_failed(Some(handle));
                    warn!("compile failed at {:?} (position {}): {}", handle, position, err);
                    return Err(err);
                }
            }
        }

        self.compute_live_intervals(&order);
        self.descriptors.build_pools(self.backend.as_ref());
        self.commands.ensure_capacity(cmd_estimate);

        self.prev_order = order.clone();
        self.order = order;
        self.dirty.clear();
        self.plan_id += 1;
        debug!(
            "compiled plan {} ({} nodes, {} command slots)",
            self.plan_id,
            self.order.len(),
            cmd_estimate
        );
        Ok(self.plan_id)
    }

    /// A node's affinity is its explicit override, or the join of its
    /// producers' affinities; roots default to device 0.
    fn propagate_affinity(&mut self, order: &[NodeHandle]) {
        for &handle in order {
            let explicit = self.nodes[handle].node.device_override();
            let mask = match explicit {
                Some(mask) => mask,
                None => {
                    let mut mask = DeviceMask::empty();
                    for dep in self.topology.direct_deps(handle) {
                        mask |= self.nodes[dep].device_mask;
                    }
                    if mask.is_empty() {
                        mask = DeviceMask::DEVICE_0;
                    }
                    mask
                }
            };
            self.nodes[handle].device_mask = mask;
        }
    }

    fn compile_node(&mut self, handle: NodeHandle) -> Result<usize> {
        let surface_extent = self.ctx.config.surface_extent;
        let RenderGraph {
            nodes,
            resources,
            backend,
            budget,
            descriptors,
            staging,
            ..
        } = self;
        let instance = nodes.get_mut(handle).expect("compiling unknown node");

        let declaration = instance.node.declare_descriptors();
        if let Some(declaration) = &declaration {
            if let Some((hash, _)) = descriptors.request_layout(backend.as_ref(), &declaration.bindings)
            {
                descriptors.declare_estimate(hash, declaration.estimated_set_count);
            }
        }

        let mut ctx = CompileContext {
            handle,
            signature: &instance.signature,
            slots: &mut instance.slots,
            resources,
            backend: backend.as_ref(),
            budget,
            descriptors,
            staging,
            params: &instance.params,
            surface_extent,
            cmd_estimate: 0,
        };
        instance.node.compile(&mut ctx)?;
        let estimate = ctx.cmd_estimate;

        instance.counters.compiles += 1;
        if instance.state == NodeState::Ready {
            instance.transition(handle, NodeState::Compiled)?;
        } else if instance.state == NodeState::Dirty {
            instance.transition(handle, NodeState::Compiled)?;
        }
        Ok(estimate)
    }

    /// Live interval of each resource over the order: producer position to
    /// last consumer position. Drives transient aliasing legality.
    fn compute_live_intervals(&mut self, order: &[NodeHandle]) {
        for (position, &handle) in order.iter().enumerate() {
            let position = position as u32;
            let instance = &self.nodes[handle];
            for id in instance.slots.outputs.iter().flatten() {
                if let Some(resource) = self.resources.get_mut(*id) {
                    let live = resource.live_interval();
                    resource.set_live_interval(position..(live.end.max(position + 1)));
                }
            }
            for binding in &instance.slots.inputs {
                for id in binding {
                    if let Some(resource) = self.resources.get_mut(*id) {
                        let live = resource.live_interval();
                        resource.set_live_interval(live.start..(position + 1));
                    }
                }
            }
        }
    }

    fn emit_compile_failed(&self, node: Option<NodeHandle>) {
        let payload = node.map_or(EventPayload::None, EventPayload::Node);
        let _ = self.events.emit(EventKind::CompileFailed, payload);
    }

    // --- execute ---------------------------------------------------------

    /// Runs one frame. Ordering per frame: wait on the frame-slot fence,
    /// flush destroys that fence released, drain worker injections, process
    /// events (cascading invalidations), recompile if anything went dirty,
    /// acquire, walk the order with the tracker armed, submit, present,
    /// advance.
    pub fn execute(&mut self) -> Result<FrameReport> {
        self.expect_state(GraphState::Ready)?;
        if self.order.is_empty() {
            self.compile()?;
        }

        let timeout = Duration::from_millis(self.ctx.config.fence_timeout_ms);
        let slot = {
            let sync = self.sync.as_ref().expect("built graph has frame sync");
            sync.wait_for_frame(self.backend.as_ref(), timeout)?;
            sync.slot()
        };
        self.flush_destroy_slot(slot);

        self.drain_injections();
        self.process_events();
        if !self.dirty.is_empty() {
            self.compile()?;
        }

        let image_available = self
            .sync
            .as_ref()
            .expect("built graph has frame sync")
            .image_available();
        let image_index = match self.backend.acquire_image(image_available) {
            Ok(index) => index,
            Err(GraphError::SwapchainOutOfDate) => {
                // Transient: invalidate everything, recompile next frame.
                self.invalidate_all();
                let _ = self
                    .events
                    .emit(EventKind::SwapchainInvalidated, EventPayload::None);
                return Ok(FrameReport {
                    frame: self.frame,
                    presented: false,
                    image_index: 0,
                    allocations: AllocationReport::default(),
                });
            }
            Err(other) => return Err(other),
        };

        self.commands.clear();
        self.tracker.arm();
        let walk = self.walk_order(image_index);
        let report = self.tracker.check_zero();
        walk?;
        self.last_allocations = report?;

        self.commands.sort();
        let (wait_sem, signal_sem, frame_fence) = {
            let sync = self.sync.as_ref().unwrap();
            (
                sync.image_available(),
                sync.render_complete(image_index),
                sync.frame_fence(),
            )
        };
        self.backend.reset_fence(frame_fence);
        let submit = self.backend.submit(
            DeviceId(0),
            self.commands.as_slice(),
            Some(wait_sem),
            Some(signal_sem),
            frame_fence,
        );
        if let Err(GraphError::DeviceLost { device }) = submit {
            self.isolate_device(device);
            return Err(GraphError::DeviceLost { device });
        }
        submit?;

        match self.backend.present(image_index, signal_sem) {
            Ok(()) | Err(GraphError::SwapchainOutOfDate) => {}
            Err(other) => return Err(other),
        }

        // Cycle node states back and advance the timeline.
        for i in 0..self.order.len() {
            let handle = self.order[i];
            let instance = &mut self.nodes[handle];
            if instance.state == NodeState::Complete {
                instance.transition(handle, NodeState::Compiled)?;
            }
        }

        let _ = self
            .events
            .emit(EventKind::FrameComplete, EventPayload::Scalar(self.frame));

        self.evicted_scratch.clear();
        self.history
            .advance(self.frame + 1, &mut self.evicted_scratch);
        for i in 0..self.evicted_scratch.len() {
            let id = self.evicted_scratch[i];
            crate::resource::release_deferred(&self.resources, &self.deferred, id);
        }

        let slot = self.sync.as_ref().unwrap().slot();
        self.queue_destroys_for_slot(slot);

        let frame = self.frame;
        self.frame += 1;
        self.sync.as_mut().unwrap().advance();

        Ok(FrameReport {
            frame,
            presented: true,
            image_index,
            allocations: self.last_allocations,
        })
    }

    fn walk_order(&mut self, image_index: u32) -> Result<()> {
        for position in 0..self.order.len() {
            let handle = self.order[position];
            let frame = self.frame;
            let failure: Option<GraphError> = {
                let RenderGraph {
                    nodes,
                    resources,
                    descriptors,
                    history,
                    commands,
                    ..
                } = &mut *self;
                let instance = nodes.get_mut(handle).expect("executing unknown node");
                if instance.state == NodeState::Error || instance.device_mask.is_empty() {
                    // Isolated or failed; its subgraph was marked with it.
                    continue;
                }
                instance.transition(handle, NodeState::Executing)?;

                let started = Instant::now();
                let mut ctx = ExecuteContext {
                    handle,
                    slots: &instance.slots,
                    resources,
                    descriptors,
                    history,
                    commands,
                    sortkey: (position as u64) << 16,
                    frame,
                    image_index,
                };
                let result = instance.node.execute(&mut ctx);
                instance.counters.last_execute_ns = started.elapsed().as_nanos() as u64;
                instance.counters.executions += 1;

                match result {
                    Ok(()) => {
                        instance.transition(handle, NodeState::Complete)?;
                        None
                    }
                    Err(err) => {
                        instance.state = NodeState::Error;
                        Some(err)
                    }
                }
            };

            if let Some(err) = failure {
                match err {
                    GraphError::DeviceLost { device } => {
                        // Recoverable: isolate that device's subgraph, the
                        // rest of the graph keeps going.
                        self.isolate_device(device);
                        let _ = self
                            .events
                            .emit(EventKind::DeviceLost, EventPayload::Device(device));
                    }
                    fatal => return Err(fatal),
                }
            }
        }
        Ok(())
    }

    /// Removes `device` from every node's affinity; nodes left with no
    /// device are parked in Error until reset.
    fn isolate_device(&mut self, device: DeviceId) {
        let lost = DeviceMask::single(device);
        for (_, instance) in self.nodes.iter_mut() {
            instance.device_mask.remove(lost);
            if instance.device_mask.is_empty() {
                instance.state = NodeState::Error;
            }
        }
        warn!("device {:?} isolated from the graph", device);
    }

    fn invalidate_all(&mut self) {
        self.dirty_scratch.clear();
        for (handle, _) in self.nodes.iter() {
            self.dirty_scratch.push(handle);
        }
        for i in 0..self.dirty_scratch.len() {
            self.mark_dirty(self.dirty_scratch[i]);
        }
    }

    /// Marks a node dirty and cascades along dependency edges.
    pub fn mark_dirty(&mut self, handle: NodeHandle) {
        self.mark_dirty_one(handle);
        for dependent in self.topology.transitive_dependents(handle) {
            self.mark_dirty_one(dependent);
        }
    }

    fn mark_dirty_one(&mut self, handle: NodeHandle) {
        if let Some(instance) = self.nodes.get_mut(handle) {
            if matches!(instance.state, NodeState::Compiled | NodeState::Complete) {
                instance.state = NodeState::Dirty;
            }
            self.dirty.insert(handle);
        }
    }

    fn drain_injections(&mut self) {
        self.inject_scratch.clear();
        self.injection
            .drain_batch(self.ctx.config.injection_capacity, &mut self.inject_scratch);
        if self.inject_scratch.is_empty() {
            return;
        }
        self.dirty_scratch.clear();
        for i in 0..self.inject_scratch.len() {
            let target = self.inject_scratch[i].target;
            let request = &self.inject_scratch[i];
            if let Some(instance) = self.nodes.get_mut(target) {
                let response = instance.node.on_inject(request);
                if response.dirty {
                    self.dirty_scratch.push(target);
                }
                if let Some((kind, payload)) = response.emit {
                    let _ = self.events.emit(kind, payload);
                }
            }
        }
        for i in 0..self.dirty_scratch.len() {
            self.mark_dirty(self.dirty_scratch[i]);
        }
    }

    /// Drains the bus, routing events to subscribing nodes. A response may
    /// emit follow-up events; those are observed within the same call, up
    /// to a bounded number of cascade passes.
    fn process_events(&mut self) {
        for _ in 0..MAX_EVENT_PASSES {
            if self.events.depth() == 0 {
                break;
            }
            let mut scratch = std::mem::take(&mut self.event_scratch);
            scratch.clear();
            self.events.process_events(|ev| scratch.push(*ev));

            self.response_scratch.clear();
            self.dirty_scratch.clear();
            for event in &scratch {
                for i in 0..self.order.len() {
                    let handle = self.order[i];
                    let instance = self.nodes.get_mut(handle).expect("routing to unknown node");
                    if !instance.event_mask.contains(event.kind.mask()) {
                        continue;
                    }
                    let response = instance.node.on_event(event);
                    if response.dirty {
                        self.dirty_scratch.push(handle);
                    }
                    if let Some(follow_up) = response.emit {
                        self.response_scratch.push(follow_up);
                    }
                }
            }
            self.event_scratch = scratch;

            for i in 0..self.dirty_scratch.len() {
                let handle = self.dirty_scratch[i];
                self.mark_dirty(handle);
            }
            for i in 0..self.response_scratch.len() {
                let (kind, payload) = self.response_scratch[i];
                let _ = self.events.emit(kind, payload);
            }
        }
    }

    // --- deferred destruction --------------------------------------------

    /// Moves everything released this frame behind the current slot's
    /// fence; it is destroyed once that fence retires.
    fn queue_destroys_for_slot(&mut self, slot: usize) {
        self.destroy_scratch.clear();
        self.deferred.drain_into(&mut self.destroy_scratch);
        let ring = &mut self.destroy_ring[slot];
        for i in 0..self.destroy_scratch.len() {
            ring.push(self.destroy_scratch[i]);
        }
    }

    fn flush_destroy_slot(&mut self, slot: usize) {
        if self.destroy_ring.is_empty() {
            return;
        }
        self.destroy_scratch.clear();
        self.destroy_scratch.append(&mut self.destroy_ring[slot]);
        for i in 0..self.destroy_scratch.len() {
            self.destroy_resource(self.destroy_scratch[i]);
        }
        self.destroy_scratch.clear();
    }

    fn destroy_resource(&mut self, id: ResourceId) {
        if let Some(mut resource) = self.resources.remove(id) {
            if let Some(reservation) = resource.take_reservation() {
                self.budget.release(reservation);
            }
            if resource.lifetime() != ResourceLifetime::Imported {
                if let Some(value) = resource.value() {
                    self.backend.destroy_value(value);
                }
            }
        }
    }

    // --- cleanup ---------------------------------------------------------

    /// Tears the graph down: nodes in reverse topological order, then
    /// resources, queued deferred destructions last. Subscriptions are
    /// released and caches flushed.
    pub fn cleanup(&mut self) -> Result<()> {
        if self.state == GraphState::Destroyed {
            return Ok(());
        }

        let order = if self.order.is_empty() {
            self.topology.topological_order().unwrap_or_default()
        } else {
            self.order.clone()
        };
        for &handle in order.iter().rev() {
            let RenderGraph { nodes, backend, .. } = self;
            if let Some(instance) = nodes.get_mut(handle) {
                let mut ctx = CleanupContext {
                    backend: backend.as_ref(),
                };
                instance.node.cleanup(&mut ctx);
            }
        }

        // Release history retentions, then every graph-owned resource.
        self.evicted_scratch.clear();
        let mut evicted = std::mem::take(&mut self.evicted_scratch);
        self.history.drain(&mut evicted);
        for &id in &evicted {
            crate::resource::release_deferred(&self.resources, &self.deferred, id);
        }
        self.evicted_scratch = evicted;

        let ids: Vec<ResourceId> = self.resources.keys().collect();
        for id in ids {
            self.destroy_resource(id);
        }
        for slot in 0..self.destroy_ring.len() {
            self.flush_destroy_slot(slot);
        }
        self.destroy_scratch.clear();
        self.deferred.drain_into(&mut self.destroy_scratch);

        self.staging.drain(self.backend.as_ref(), &self.budget);
        self.descriptors.flush(self.backend.as_ref());
        if let Some(mut sync) = self.sync.take() {
            sync.destroy(self.backend.as_ref());
        }
        self.events.release_subscriptions();

        info!("graph cleaned up after {} frames", self.frame);
        self.state = GraphState::Destroyed;
        Ok(())
    }

    // --- introspection ---------------------------------------------------

    /// The compiled topological order.
    pub fn topology(&self) -> &[NodeHandle] {
        &self.order
    }

    /// The underlying DAG, for dependency queries (roots, leaves, direct
    /// and transitive deps).
    pub fn dag(&self) -> &GraphTopology {
        &self.topology
    }

    pub fn node_state(&self, handle: NodeHandle) -> Option<NodeState> {
        self.nodes.get(handle).map(|n| n.state)
    }

    /// Clears a node's terminal Error state; the next compile retries it.
    pub fn reset_node(&mut self, handle: NodeHandle) -> Result<()> {
        let instance = self
            .nodes
            .get_mut(handle)
            .ok_or_else(|| GraphError::Config("reset of unknown node".into()))?;
        instance.transition(handle, NodeState::Ready)?;
        instance.device_mask = DeviceMask::DEVICE_0;
        self.dirty.insert(handle);
        Ok(())
    }

    pub fn node_device_mask(&self, handle: NodeHandle) -> Option<DeviceMask> {
        self.nodes.get(handle).map(|n| n.device_mask)
    }

    pub fn plan_id(&self) -> u64 {
        self.plan_id
    }

    pub fn frame_index(&self) -> u64 {
        self.frame
    }

    /// Downcast access to a node implementation, mostly for tests and
    /// tooling.
    pub fn node_impl<T: RenderNode>(&self, handle: NodeHandle) -> Option<&T> {
        self.nodes.get(handle).and_then(|n| n.implementation::<T>())
    }

    pub fn stats(&self) -> GraphStats {
        GraphStats {
            frame: self.frame,
            plan_id: self.plan_id,
            event_queue_depth: self.events.depth(),
            budget: [
                MemoryKind::DeviceLocal,
                MemoryKind::HostVisible,
                MemoryKind::Staging,
            ]
            .iter()
            .map(|&kind| {
                let (used, soft, hard) = self.budget.utilization(kind);
                (kind, used, soft, hard)
            })
            .collect(),
            injection: self.injection.stats(),
            staging_emergencies: self.staging.emergency_allocations(),
            last_allocations: self.last_allocations,
            nodes: self
                .nodes
                .iter()
                .map(|(handle, n)| NodeStats {
                    handle,
                    name: n.name.clone(),
                    state: n.state,
                    counters: n.counters,
                })
                .collect(),
        }
    }
}
