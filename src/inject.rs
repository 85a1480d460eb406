//! Injection queue for external worker threads.
//!
//! Workers (voxel pagers, streaming loaders) push creation requests from any
//! thread; the graph drains them between frames, never during execute.
//! The ring is bounded and non-blocking: a full queue rejects and the worker
//! retries next frame.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_queue::ArrayQueue;

use crate::node::NodeHandle;

/// Payload of one creation request. Bulk data travels as bytes the target
/// node interprets; anything structured goes through parameters instead.
#[derive(Clone, Debug)]
pub enum RequestPayload {
    /// Upload a batch of raw data (e.g. a voxel brick) to the target.
    Upload(Vec<u8>),
    /// Ask the target to (re)create an output of the given dimensions.
    Recreate { width: u32, height: u32 },
    /// Opaque request code understood by the target.
    Signal(u64),
}

#[derive(Clone, Debug)]
pub struct InjectionRequest {
    pub target: NodeHandle,
    pub payload: RequestPayload,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct InjectionStats {
    pub submitted: u64,
    pub rejected: u64,
    pub drained: u64,
}

pub struct InjectionQueue {
    queue: ArrayQueue<InjectionRequest>,
    submitted: AtomicU64,
    rejected: AtomicU64,
    drained: AtomicU64,
}

impl InjectionQueue {
    pub fn with_capacity(capacity: usize) -> InjectionQueue {
        InjectionQueue {
            queue: ArrayQueue::new(capacity.max(1)),
            submitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            drained: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Non-blocking enqueue from any thread. `false` means the queue was
    /// full and the request was dropped.
    pub fn enqueue(&self, request: InjectionRequest) -> bool {
        match self.queue.push(request) {
            Ok(()) => {
                self.submitted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Pops up to `max` requests into `out`, grouped by target node so
    /// consumers can batch per-target work. Owning thread, between frames.
    pub fn drain_batch(&self, max: usize, out: &mut Vec<InjectionRequest>) {
        let start = out.len();
        while out.len() - start < max {
            match self.queue.pop() {
                Some(request) => out.push(request),
                None => break,
            }
        }
        let drained = (out.len() - start) as u64;
        if drained > 0 {
            self.drained.fetch_add(drained, Ordering::Relaxed);
            // Group by target; the sort is stable so per-target FIFO holds.
            out[start..].sort_by_key(|r| r.target);
        }
    }

    pub fn stats(&self) -> InjectionStats {
        InjectionStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            drained: self.drained.load(Ordering::Relaxed),
        }
    }
}
