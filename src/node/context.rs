//! Typed slot access for node callbacks.
//!
//! Contexts are the only way a node touches graph state; each one exposes
//! exactly what its phase permits. `CompileContext` can create outputs and
//! talk to the pre-allocation subsystems; `ExecuteContext` can only read
//! inputs, overwrite payloads produced at compile, and record commands.

use fxhash::FxHashMap;
use slotmap::SlotMap;

use crate::budget::{BudgetManager, Reservation};
use crate::command::{CommandStream, GpuCommand};
use crate::descriptor::{DescriptorBinding, DescriptorCache, LayoutHash};
use crate::error::{Component, GraphError, Result};
use crate::handle::{DescriptorSetHandle, DescriptorSetLayoutHandle};
use crate::history::TimelineHistory;
use crate::node::{NodeHandle, NodeSlots, ParamValue};
use crate::resource::{AliasGroupId, Resource, ResourceId, ResourceLifetime};
use crate::slot::{NodeSignature, SlotRole};
use crate::staging::{StagingLease, StagingPool};
use crate::traits::GpuBackend;
use crate::typedesc::{SlotValue, TypedValue};

fn read_typed<T: TypedValue>(
    resources: &SlotMap<ResourceId, Resource>,
    node: NodeHandle,
    id: ResourceId,
) -> Result<T> {
    let resource = resources.get(id).ok_or_else(|| GraphError::CompileFailed {
        node: Some(node),
        reason: "slot references a destroyed resource".into(),
    })?;
    resource.get_handle::<T>().map_err(|e| match e {
        GraphError::TypeMismatch {
            component,
            expected,
            found,
            ..
        } => GraphError::TypeMismatch {
            component,
            expected,
            found,
            node: Some(node),
        },
        other => other,
    })
}

/// Passed to [RenderNode::compile](crate::node::RenderNode::compile).
pub struct CompileContext<'a> {
    pub(crate) handle: NodeHandle,
    pub(crate) signature: &'a NodeSignature,
    pub(crate) slots: &'a mut NodeSlots,
    pub(crate) resources: &'a mut SlotMap<ResourceId, Resource>,
    pub(crate) backend: &'a dyn GpuBackend,
    pub(crate) budget: &'a BudgetManager,
    pub(crate) descriptors: &'a mut DescriptorCache,
    pub(crate) staging: &'a mut StagingPool,
    pub(crate) params: &'a FxHashMap<String, ParamValue>,
    pub(crate) surface_extent: (u32, u32),
    /// Execute-command estimate accumulated by the node; sizes the stream.
    pub(crate) cmd_estimate: usize,
}

impl<'a> CompileContext<'a> {
    pub fn node(&self) -> NodeHandle {
        self.handle
    }

    pub fn param(&self, name: &str) -> Option<ParamValue> {
        self.params.get(name).copied()
    }

    pub fn surface_extent(&self) -> (u32, u32) {
        self.surface_extent
    }

    /// Number of resources bound to an input slot (variadic and
    /// accumulation slots may hold several).
    pub fn input_count(&self, slot: usize) -> usize {
        self.slots.inputs.get(slot).map_or(0, |b| b.len())
    }

    /// Reads a required dependency input. Execute-role inputs are not
    /// acquirable at compile time.
    pub fn input<T: TypedValue>(&self, slot: usize) -> Result<T> {
        self.check_dependency_role(slot)?;
        let id = self
            .slots
            .inputs
            .get(slot)
            .and_then(|b| b.first().copied())
            .ok_or(GraphError::MissingInput {
                node: self.handle,
                slot,
            })?;
        read_typed(self.resources, self.handle, id)
    }

    /// Reads an optional dependency input; `Ok(None)` when unbound.
    pub fn input_opt<T: TypedValue>(&self, slot: usize) -> Result<Option<T>> {
        self.check_dependency_role(slot)?;
        match self.slots.inputs.get(slot).and_then(|b| b.first().copied()) {
            Some(id) => read_typed(self.resources, self.handle, id).map(Some),
            None => Ok(None),
        }
    }

    fn check_dependency_role(&self, slot: usize) -> Result<()> {
        let desc = self
            .signature
            .inputs()
            .get(slot)
            .ok_or(GraphError::MissingInput {
                node: self.handle,
                slot,
            })?;
        if desc.role != SlotRole::Dependency {
            return Err(GraphError::CompileFailed {
                node: Some(self.handle),
                reason: format!(
                    "input slot {:?} is execute-role and cannot be read at compile",
                    desc.name
                ),
            });
        }
        Ok(())
    }

    /// Writes an output produced by this compile. Only Persistent and
    /// Transient lifetimes may be produced here.
    pub fn output<T: TypedValue>(
        &mut self,
        slot: usize,
        value: T,
        lifetime: ResourceLifetime,
    ) -> Result<ResourceId> {
        if !matches!(
            lifetime,
            ResourceLifetime::Persistent | ResourceLifetime::Transient
        ) {
            return Err(GraphError::CompileFailed {
                node: Some(self.handle),
                reason: format!("compile may not produce {:?} outputs", lifetime),
            });
        }
        let id = self
            .slots
            .outputs
            .get(slot)
            .copied()
            .flatten()
            .ok_or_else(|| GraphError::CompileFailed {
                node: Some(self.handle),
                reason: format!("output slot {} does not exist", slot),
            })?;
        let node = self.handle;
        let resource = self
            .resources
            .get_mut(id)
            .expect("output resource missing from graph");
        resource.set_lifetime(lifetime);
        resource.set_value(value.into_value()).map_err(|e| match e {
            GraphError::TypeMismatch {
                component,
                expected,
                found,
                ..
            } => GraphError::TypeMismatch {
                component,
                expected,
                found,
                node: Some(node),
            },
            other => other,
        })?;
        Ok(id)
    }

    /// Writes a pre-built sequence payload into an output slot.
    pub fn output_value(
        &mut self,
        slot: usize,
        value: SlotValue,
        lifetime: ResourceLifetime,
    ) -> Result<ResourceId> {
        if !matches!(
            lifetime,
            ResourceLifetime::Persistent | ResourceLifetime::Transient
        ) {
            return Err(GraphError::CompileFailed {
                node: Some(self.handle),
                reason: format!("compile may not produce {:?} outputs", lifetime),
            });
        }
        let id = self
            .slots
            .outputs
            .get(slot)
            .copied()
            .flatten()
            .ok_or_else(|| GraphError::CompileFailed {
                node: Some(self.handle),
                reason: format!("output slot {} does not exist", slot),
            })?;
        let resource = self
            .resources
            .get_mut(id)
            .expect("output resource missing from graph");
        resource.set_lifetime(lifetime);
        resource.set_value(value)?;
        Ok(id)
    }

    /// Assigns a transient output to an alias group.
    pub fn mark_alias(&mut self, slot: usize, group: AliasGroupId) -> Result<()> {
        let id = self
            .slots
            .outputs
            .get(slot)
            .copied()
            .flatten()
            .ok_or_else(|| GraphError::CompileFailed {
                node: Some(self.handle),
                reason: format!("output slot {} does not exist", slot),
            })?;
        let resource = self.resources.get_mut(id).expect("output resource missing");
        if resource.lifetime() != ResourceLifetime::Transient {
            return Err(GraphError::CompileFailed {
                node: Some(self.handle),
                reason: "only transient outputs can join an alias group".into(),
            });
        }
        resource.mark_alias_group(group);
        Ok(())
    }

    /// Declares how many commands this node will record per execute.
    pub fn reserve_commands(&mut self, count: usize) {
        self.cmd_estimate += count;
    }

    /// Canonicalizes `bindings` against the descriptor cache, returning the
    /// shared layout. `None` means the binding list was malformed.
    pub fn request_layout(
        &mut self,
        bindings: &[DescriptorBinding],
    ) -> Option<(LayoutHash, DescriptorSetLayoutHandle)> {
        self.descriptors.request_layout(self.backend, bindings)
    }

    /// Registers this node's set-count estimate for pool sizing.
    pub fn declare_sets(&mut self, layout: LayoutHash, count: u32) {
        self.descriptors.declare_estimate(layout, count);
    }

    pub fn budget(&self) -> &BudgetManager {
        self.budget
    }

    /// Attaches a budget reservation to an output's resource so it is
    /// returned when the resource is destroyed.
    pub fn attach_reservation(&mut self, slot: usize, reservation: Reservation) -> Result<()> {
        let id = self
            .slots
            .outputs
            .get(slot)
            .copied()
            .flatten()
            .ok_or_else(|| GraphError::CompileFailed {
                node: Some(self.handle),
                reason: format!("output slot {} does not exist", slot),
            })?;
        self.resources
            .get_mut(id)
            .expect("output resource missing")
            .set_reservation(reservation);
        Ok(())
    }

    /// Borrows a pre-warmed staging buffer.
    pub fn acquire_staging(&mut self) -> StagingLease {
        self.staging.acquire(self.backend)
    }
}

/// Passed to [RenderNode::execute](crate::node::RenderNode::execute).
/// Everything here reads pre-allocated state; nothing allocates.
pub struct ExecuteContext<'a> {
    pub(crate) handle: NodeHandle,
    pub(crate) slots: &'a NodeSlots,
    pub(crate) resources: &'a mut SlotMap<ResourceId, Resource>,
    pub(crate) descriptors: &'a mut DescriptorCache,
    pub(crate) history: &'a mut TimelineHistory,
    pub(crate) commands: &'a mut CommandStream,
    pub(crate) sortkey: u64,
    pub(crate) frame: u64,
    pub(crate) image_index: u32,
}

impl<'a> ExecuteContext<'a> {
    pub fn node(&self) -> NodeHandle {
        self.handle
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn image_index(&self) -> u32 {
        self.image_index
    }

    pub fn input_count(&self, slot: usize) -> usize {
        self.slots.inputs.get(slot).map_or(0, |b| b.len())
    }

    /// Reads a required input (any role; execute samples per frame).
    pub fn input<T: TypedValue>(&self, slot: usize) -> Result<T> {
        self.input_at(slot, 0)
    }

    /// Reads the `index`-th binding of a variadic or accumulation slot, in
    /// registration order.
    pub fn input_at<T: TypedValue>(&self, slot: usize, index: usize) -> Result<T> {
        let id = self
            .slots
            .inputs
            .get(slot)
            .and_then(|b| b.get(index).copied())
            .ok_or(GraphError::MissingInput {
                node: self.handle,
                slot,
            })?;
        read_typed(self.resources, self.handle, id)
    }

    pub fn input_opt<T: TypedValue>(&self, slot: usize) -> Result<Option<T>> {
        match self.slots.inputs.get(slot).and_then(|b| b.first().copied()) {
            Some(id) => read_typed(self.resources, self.handle, id).map(Some),
            None => Ok(None),
        }
    }

    /// Overwrites the payload of an output produced at compile. The
    /// resource itself must already exist; execute never creates one.
    pub fn output<T: TypedValue>(&mut self, slot: usize, value: T) -> Result<()> {
        let id = self
            .slots
            .outputs
            .get(slot)
            .copied()
            .flatten()
            .ok_or_else(|| GraphError::CompileFailed {
                node: Some(self.handle),
                reason: format!("output slot {} was not produced at compile", slot),
            })?;
        let node = self.handle;
        self.resources
            .get_mut(id)
            .expect("output resource missing from graph")
            .set_value(value.into_value())
            .map_err(|e| match e {
                GraphError::TypeMismatch {
                    component,
                    expected,
                    found,
                    ..
                } => GraphError::TypeMismatch {
                    component,
                    expected,
                    found,
                    node: Some(node),
                },
                other => other,
            })
    }

    pub fn output_id(&self, slot: usize) -> Option<ResourceId> {
        self.slots.outputs.get(slot).copied().flatten()
    }

    /// Records a command under this node's plan sort key.
    pub fn push(&mut self, cmd: GpuCommand) {
        self.commands.push(self.sortkey, cmd);
    }

    /// Pops one pre-allocated descriptor set. Exhausting the pool means the
    /// compile-time estimate was wrong; no allocation happens here.
    pub fn take_descriptor_set(&mut self, layout: LayoutHash) -> Result<DescriptorSetHandle> {
        self.descriptors
            .take_set(layout)
            .ok_or(GraphError::BudgetExhausted {
                component: Component::DescriptorCache,
                requested: 1,
                available: 0,
            })
    }

    /// Snapshots an output into the current frame's history slot, retaining
    /// the resource until the slot is overwritten D frames later.
    pub fn store_history(&mut self, slot: usize) -> Result<()> {
        let id = self.output_id(slot).ok_or_else(|| GraphError::CompileFailed {
            node: Some(self.handle),
            reason: format!("output slot {} was not produced at compile", slot),
        })?;
        let resource = self.resources.get(id).expect("output resource missing");
        let value = resource.value().ok_or(GraphError::MissingInput {
            node: self.handle,
            slot,
        })?;
        self.history.store(id, value)?;
        resource.retain();
        Ok(())
    }

    /// Reads a snapshot stored `frames_ago` frames back.
    pub fn previous(&self, frames_ago: usize, id: ResourceId) -> Option<&SlotValue> {
        self.history.previous(frames_ago, id)
    }
}

/// Passed to [RenderNode::cleanup](crate::node::RenderNode::cleanup).
pub struct CleanupContext<'a> {
    pub(crate) backend: &'a dyn GpuBackend,
}

impl<'a> CleanupContext<'a> {
    pub fn backend(&self) -> &dyn GpuBackend {
        self.backend
    }
}
