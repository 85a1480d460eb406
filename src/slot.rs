//! Slot descriptors.
//!
//! A slot is one port of a node type. Descriptors are declared by node
//! implementations and validated once when the node's signature is built;
//! connection-time checks then only compare tags and roles.

use crate::error::{Component, GraphError, Result};
use crate::typedesc::TypeTag;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SlotDirection {
    Input,
    Output,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Nullability {
    Required,
    Optional,
}

/// When the slot's value is needed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SlotRole {
    /// Needed to compile the consumer; establishes a hard dependency edge.
    Dependency,
    /// Sampled each frame during execute.
    Execute,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SlotMutability {
    ReadOnly,
    WriteOnly,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SlotScope {
    NodeLevel,
    GraphLevel,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SlotArity {
    Single,
    /// Fixed number of connections.
    Array(u32),
    /// Appends a new sub-slot per connection, unbounded.
    Variadic,
}

impl SlotArity {
    pub fn max_connections(self) -> usize {
        match self {
            SlotArity::Single => 1,
            SlotArity::Array(n) => n as usize,
            SlotArity::Variadic => usize::MAX,
        }
    }
}

/// Describes one input or output port of a node type.
#[derive(Copy, Clone, Debug)]
pub struct SlotDescriptor {
    /// Dense index within the node's slots for this direction.
    pub index: usize,
    pub name: &'static str,
    pub ty: TypeTag,
    pub nullability: Nullability,
    pub role: SlotRole,
    pub mutability: SlotMutability,
    pub scope: SlotScope,
    pub arity: SlotArity,
}

impl SlotDescriptor {
    /// Shorthand for the common case: a required, read-only, per-frame input.
    pub fn input(index: usize, name: &'static str, ty: TypeTag) -> SlotDescriptor {
        SlotDescriptor {
            index,
            name,
            ty,
            nullability: Nullability::Required,
            role: SlotRole::Execute,
            mutability: SlotMutability::ReadOnly,
            scope: SlotScope::NodeLevel,
            arity: SlotArity::Single,
        }
    }

    /// Shorthand for a write-only per-frame output.
    pub fn output(index: usize, name: &'static str, ty: TypeTag) -> SlotDescriptor {
        SlotDescriptor {
            index,
            name,
            ty,
            nullability: Nullability::Required,
            role: SlotRole::Execute,
            mutability: SlotMutability::WriteOnly,
            scope: SlotScope::NodeLevel,
            arity: SlotArity::Single,
        }
    }

    pub fn with_role(mut self, role: SlotRole) -> SlotDescriptor {
        self.role = role;
        self
    }

    pub fn with_nullability(mut self, nullability: Nullability) -> SlotDescriptor {
        self.nullability = nullability;
        self
    }

    pub fn with_arity(mut self, arity: SlotArity) -> SlotDescriptor {
        self.arity = arity;
        self
    }

    pub fn with_scope(mut self, scope: SlotScope) -> SlotDescriptor {
        self.scope = scope;
        self
    }

    /// Checks the descriptor against the legal role/nullability/direction
    /// combinations:
    ///
    /// | role       | nullability | directions    |
    /// |------------|-------------|---------------|
    /// | Dependency | Required    | input         |
    /// | Dependency | Optional    | input         |
    /// | Execute    | Required    | input, output |
    /// | Execute    | Optional    | input         |
    pub fn validate(&self, direction: SlotDirection) -> Result<()> {
        if !self.ty.is_registered() {
            return Err(GraphError::TypeMismatch {
                component: Component::TypeRegistry,
                expected: self.ty,
                found: self.ty,
                node: None,
            });
        }

        let legal = match (self.role, self.nullability) {
            (SlotRole::Dependency, _) => direction == SlotDirection::Input,
            (SlotRole::Execute, Nullability::Required) => true,
            (SlotRole::Execute, Nullability::Optional) => direction == SlotDirection::Input,
        };
        if !legal {
            return Err(GraphError::Config(format!(
                "slot {:?}: {:?}/{:?} is not legal for {:?}",
                self.name, self.role, self.nullability, direction
            )));
        }

        // A required input that is write-only can never be satisfied.
        if direction == SlotDirection::Input
            && self.mutability == SlotMutability::WriteOnly
            && self.nullability == Nullability::Required
        {
            return Err(GraphError::Config(format!(
                "slot {:?}: required inputs cannot be write-only",
                self.name
            )));
        }
        Ok(())
    }
}

/// A node type's full slot configuration. Indices must be dense `[0..N)` per
/// direction; this is checked once at construction.
#[derive(Clone, Debug, Default)]
pub struct NodeSignature {
    inputs: Vec<SlotDescriptor>,
    outputs: Vec<SlotDescriptor>,
}

impl NodeSignature {
    pub fn new(inputs: Vec<SlotDescriptor>, outputs: Vec<SlotDescriptor>) -> Result<NodeSignature> {
        for (i, desc) in inputs.iter().enumerate() {
            desc.validate(SlotDirection::Input)?;
            if desc.index != i {
                return Err(GraphError::Config(format!(
                    "input slot {:?} declared at index {} but stored at {}",
                    desc.name, desc.index, i
                )));
            }
        }
        for (i, desc) in outputs.iter().enumerate() {
            desc.validate(SlotDirection::Output)?;
            if desc.index != i {
                return Err(GraphError::Config(format!(
                    "output slot {:?} declared at index {} but stored at {}",
                    desc.name, desc.index, i
                )));
            }
        }
        Ok(NodeSignature { inputs, outputs })
    }

    pub fn inputs(&self) -> &[SlotDescriptor] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[SlotDescriptor] {
        &self.outputs
    }

    pub fn descriptor(&self, direction: SlotDirection, index: usize) -> Option<&SlotDescriptor> {
        match direction {
            SlotDirection::Input => self.inputs.get(index),
            SlotDirection::Output => self.outputs.get(index),
        }
    }
}
