//! GPU command stream.
//!
//! Nodes record commands tagged with a `u64` sort key; before submission the
//! stream is sorted stably, so commands with equal keys keep their recording
//! order. The compiled plan assigns each node a key derived from its
//! topological index, which makes the submitted stream reproducible.

use crate::handle::{
    BufferHandle, DescriptorSetHandle, ImageHandle, PipelineHandle,
};

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum GpuCommand {
    BeginPass {
        target: ImageHandle,
    },
    EndPass,
    BindPipeline(PipelineHandle),
    BindDescriptorSet {
        index: u32,
        set: DescriptorSetHandle,
    },
    BindVertexBuffer {
        binding: u32,
        buffer: BufferHandle,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    CopyBuffer {
        src: BufferHandle,
        dst: BufferHandle,
        bytes: u64,
    },
    CopyBufferToImage {
        src: BufferHandle,
        dst: ImageHandle,
    },
    ClearImage {
        image: ImageHandle,
        color: [f32; 4],
    },
    /// Execution barrier between the producer and consumers of an image.
    Barrier {
        image: ImageHandle,
    },
}

#[derive(Copy, Clone, Debug)]
pub struct Command {
    pub sortkey: u64,
    pub cmd: GpuCommand,
}

/// Pre-sized command recording buffer.
///
/// Capacity is fixed during compile; recording during execute must stay
/// within it, which keeps the execute path off the heap.
pub struct CommandStream {
    commands: Vec<Command>,
}

impl CommandStream {
    pub fn with_capacity(capacity: usize) -> CommandStream {
        CommandStream {
            commands: Vec::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.commands.capacity()
    }

    /// Grows capacity; compile-time only.
    pub fn ensure_capacity(&mut self, capacity: usize) {
        if self.commands.capacity() < capacity {
            self.commands.reserve(capacity - self.commands.capacity());
        }
    }

    pub fn clear(&mut self) {
        self.commands.clear();
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn push(&mut self, sortkey: u64, cmd: GpuCommand) {
        debug_assert!(
            self.commands.len() < self.commands.capacity(),
            "command stream capacity exceeded during execute"
        );
        self.commands.push(Command { sortkey, cmd });
    }

    /// Stable sort by key: equal keys keep recording order.
    pub fn sort(&mut self) {
        self.commands.sort_by_key(|c| c.sortkey);
    }

    pub fn as_slice(&self) -> &[Command] {
        &self.commands
    }
}
