//! Event bus driving invalidation cascades.
//!
//! A fixed-capacity multi-producer ring: any thread may `emit`, the owning
//! thread drains exactly once per frame. Capacity is chosen at setup so the
//! steady state never touches the heap; the Fallback policy tolerates one
//! sizing mistake by doubling exactly once (and logging it).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bitflags::bitflags;
use crossbeam_queue::ArrayQueue;
use log::warn;
use parking_lot::{Mutex, RwLock};

use crate::error::{Component, GraphError, Result};
use crate::handle::DeviceId;
use crate::node::NodeHandle;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EventKind {
    WindowResize,
    SwapchainInvalidated,
    NodeDirty,
    CompileFailed,
    DeviceLost,
    FrameComplete,
}

bitflags! {
    /// Subscription filter over event kinds.
    pub struct EventMask: u32 {
        const WINDOW_RESIZE = 1 << 0;
        const SWAPCHAIN_INVALIDATED = 1 << 1;
        const NODE_DIRTY = 1 << 2;
        const COMPILE_FAILED = 1 << 3;
        const DEVICE_LOST = 1 << 4;
        const FRAME_COMPLETE = 1 << 5;
    }
}

impl EventKind {
    pub fn mask(self) -> EventMask {
        match self {
            EventKind::WindowResize => EventMask::WINDOW_RESIZE,
            EventKind::SwapchainInvalidated => EventMask::SWAPCHAIN_INVALIDATED,
            EventKind::NodeDirty => EventMask::NODE_DIRTY,
            EventKind::CompileFailed => EventMask::COMPILE_FAILED,
            EventKind::DeviceLost => EventMask::DEVICE_LOST,
            EventKind::FrameComplete => EventMask::FRAME_COMPLETE,
        }
    }
}

/// Bounded payload; anything bigger travels as a resource, not an event.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EventPayload {
    None,
    Extent { width: u32, height: u32 },
    Node(NodeHandle),
    Device(DeviceId),
    Scalar(u64),
}

#[derive(Copy, Clone, Debug)]
pub struct Event {
    /// Monotonic per-bus serial, assigned at emit.
    pub serial: u64,
    pub kind: EventKind,
    pub payload: EventPayload,
}

/// What `emit` does when the ring is full.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OverflowPolicy {
    /// Emit fails with QueueFull.
    Strict,
    /// Capacity doubles exactly once, then behaves like Strict.
    Fallback,
    /// The oldest queued event is dropped.
    Discard,
}

pub type SubscriptionId = usize;

struct Subscriber {
    mask: EventMask,
    callback: Box<dyn FnMut(&Event) + Send>,
    active: bool,
}

pub struct EventBus {
    queue: RwLock<ArrayQueue<Event>>,
    serial: AtomicU64,
    policy: OverflowPolicy,
    doubled: AtomicBool,
    // Only touched on the owning thread; the lock exists so producer
    // threads can hold an `&EventBus` for `emit`.
    subscribers: Mutex<Vec<Subscriber>>,
    // Drain scratch, pre-sized to capacity so process_events never allocates.
    scratch: Vec<Event>,
}

impl EventBus {
    pub fn with_capacity(capacity: usize, policy: OverflowPolicy) -> EventBus {
        assert!(capacity > 0, "event bus capacity must be non-zero");
        EventBus {
            queue: RwLock::new(ArrayQueue::new(capacity)),
            serial: AtomicU64::new(0),
            policy,
            doubled: AtomicBool::new(false),
            subscribers: Mutex::new(Vec::new()),
            scratch: Vec::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.queue.read().capacity()
    }

    /// Number of queued, not-yet-processed events.
    pub fn depth(&self) -> usize {
        self.queue.read().len()
    }

    /// Queues an event. Safe to call from producer threads. Returns the
    /// event's serial.
    pub fn emit(&self, kind: EventKind, payload: EventPayload) -> Result<u64> {
        let serial = self.serial.fetch_add(1, Ordering::Relaxed);
        let event = Event {
            serial,
            kind,
            payload,
        };

        {
            let queue = self.queue.read();
            match self.policy {
                OverflowPolicy::Discard => {
                    // force_push drops the oldest entry when full.
                    queue.force_push(event);
                    return Ok(serial);
                }
                _ => {
                    if queue.push(event).is_ok() {
                        return Ok(serial);
                    }
                }
            }
        }

        // Full. Strict fails; Fallback grows once, then fails like Strict.
        if self.policy == OverflowPolicy::Strict || self.doubled.swap(true, Ordering::AcqRel) {
            return Err(GraphError::QueueFull {
                component: Component::EventBus,
                capacity: self.capacity(),
            });
        }

        let mut queue = self.queue.write();
        let grown = ArrayQueue::new(queue.capacity() * 2);
        while let Some(ev) = queue.pop() {
            let _ = grown.push(ev);
        }
        warn!(
            "event bus overflow: capacity doubled once, {} -> {}",
            queue.capacity(),
            grown.capacity()
        );
        let _ = grown.push(event);
        *queue = grown;
        Ok(serial)
    }

    /// Replaces the ring with one of `capacity`, carrying queued events
    /// over. Setup-phase only; subscribers are kept.
    pub fn resize(&mut self, capacity: usize) {
        assert!(capacity > 0, "event bus capacity must be non-zero");
        let queue = self.queue.get_mut();
        if queue.capacity() == capacity {
            return;
        }
        let grown = ArrayQueue::new(capacity);
        while let Some(ev) = queue.pop() {
            let _ = grown.push(ev);
        }
        *queue = grown;
        self.doubled.store(false, Ordering::Release);
        self.scratch = Vec::with_capacity(capacity);
    }

    /// Registers a subscriber. Subscribers observe events in enqueue order,
    /// filtered by `mask`. Registration happens at setup only.
    pub fn subscribe(
        &mut self,
        mask: EventMask,
        callback: Box<dyn FnMut(&Event) + Send>,
    ) -> SubscriptionId {
        let subscribers = self.subscribers.get_mut();
        subscribers.push(Subscriber {
            mask,
            callback,
            active: true,
        });
        subscribers.len() - 1
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) {
        if let Some(sub) = self.subscribers.get_mut().get_mut(id) {
            sub.active = false;
        }
    }

    /// Drops every subscription; part of graph cleanup.
    pub fn release_subscriptions(&mut self) {
        self.subscribers.get_mut().clear();
    }

    /// Drains the ring in FIFO order, invoking registered subscribers and
    /// then `sink` for each event. Called exactly once per frame, on the
    /// owning thread, between compile and execute.
    pub fn process_events(&mut self, mut sink: impl FnMut(&Event)) {
        self.scratch.clear();
        if self.scratch.capacity() < self.capacity() {
            // Only reachable once, after a Fallback doubling.
            self.scratch.reserve(self.capacity() - self.scratch.capacity());
        }
        {
            let queue = self.queue.read();
            while let Some(ev) = queue.pop() {
                self.scratch.push(ev);
            }
        }
        let subscribers = self.subscribers.get_mut();
        for event in &self.scratch {
            for sub in subscribers.iter_mut() {
                if sub.active && sub.mask.contains(event.kind.mask()) {
                    (sub.callback)(event);
                }
            }
            sink(event);
        }
        self.scratch.clear();
    }
}
