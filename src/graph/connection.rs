//! Connection rules.
//!
//! Every `connect` call resolves against this registry before touching the
//! topology. Structural rules (identity types, element-into-sequence) are
//! built in; implicit conversions and extra rules can be registered by the
//! embedding layer at setup.

use fxhash::FxHashSet;

use crate::error::{GraphError, Result};
use crate::node::NodeHandle;
use crate::slot::{SlotArity, SlotDescriptor, SlotRole};
use crate::typedesc::{ContainerKind, TypeTag};

/// How a connection binds to the consumer slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ConnectionKind {
    /// One producer output to one consumer input.
    Direct,
    /// Appends a sub-slot at the next free variadic index.
    Variadic,
    /// Many compatible producers into one `Sequence<T>` input, in
    /// registration order.
    Accumulation,
}

pub struct ConnectionRegistry {
    rules: FxHashSet<(TypeTag, TypeTag, ConnectionKind)>,
    conversions: FxHashSet<(TypeTag, TypeTag)>,
}

impl ConnectionRegistry {
    pub fn new() -> ConnectionRegistry {
        ConnectionRegistry {
            rules: FxHashSet::default(),
            conversions: FxHashSet::default(),
        }
    }

    /// Registers an extra rule keyed by (src, dst, kind).
    pub fn register_rule(&mut self, src: TypeTag, dst: TypeTag, kind: ConnectionKind) {
        self.rules.insert((src, dst, kind));
    }

    /// Registers an implicit conversion usable by Direct and Variadic
    /// connections. The consuming node must read the converted type.
    pub fn register_conversion(&mut self, src: TypeTag, dst: TypeTag) {
        self.conversions.insert((src, dst));
    }

    fn types_flow(&self, src: TypeTag, dst: TypeTag, kind: ConnectionKind) -> bool {
        if self.rules.contains(&(src, dst, kind)) {
            return true;
        }
        match kind {
            ConnectionKind::Direct | ConnectionKind::Variadic => {
                src == dst || self.conversions.contains(&(src, dst))
            }
            ConnectionKind::Accumulation => {
                // Element of T accumulates into Sequence<T>.
                dst.container == ContainerKind::Vector
                    && src.container == ContainerKind::None
                    && src.base == dst.base
            }
        }
    }

    /// Full connection check: role, type rule, kind/arity coherence, and
    /// remaining capacity of the consumer slot.
    pub fn validate(
        &self,
        dst_node: NodeHandle,
        src_desc: &SlotDescriptor,
        dst_desc: &SlotDescriptor,
        kind: ConnectionKind,
        bound_already: usize,
    ) -> Result<()> {
        // Execute-only outputs carry no compile-time value; a dependency
        // input could never be satisfied by one.
        if src_desc.role == SlotRole::Execute && dst_desc.role == SlotRole::Dependency {
            return Err(GraphError::RoleMismatch {
                node: dst_node,
                slot: dst_desc.index,
            });
        }

        if !self.types_flow(src_desc.ty, dst_desc.ty, kind) {
            return Err(GraphError::TypeMismatch {
                component: crate::error::Component::Connection,
                expected: dst_desc.ty,
                found: src_desc.ty,
                node: Some(dst_node),
            });
        }

        let max = match (kind, dst_desc.arity) {
            (ConnectionKind::Variadic, SlotArity::Variadic) => usize::MAX,
            (ConnectionKind::Accumulation, _) => {
                // Accumulation capacity is bounded only by declared arity.
                dst_desc.arity.max_connections()
            }
            (ConnectionKind::Direct, SlotArity::Single) => 1,
            (ConnectionKind::Direct, SlotArity::Array(n)) => n as usize,
            // Kind does not fit the slot's declared arity.
            _ => 0,
        };
        if bound_already >= max {
            return Err(GraphError::SlotArityViolation {
                node: dst_node,
                slot: dst_desc.index,
                max,
            });
        }
        Ok(())
    }
}

impl Default for ConnectionRegistry {
    fn default() -> ConnectionRegistry {
        ConnectionRegistry::new()
    }
}
