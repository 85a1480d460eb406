//! Resources: the values flowing between nodes.
//!
//! The graph exclusively owns every resource; nodes read and write through
//! typed slot accessors. Refcounts only exist for deferred destruction — a
//! release that drops the count to zero queues the resource on the graph's
//! end-of-cleanup list instead of destroying it synchronously (the GPU may
//! still be reading it).

use std::ops::Range;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::budget::Reservation;
use crate::error::{Component, GraphError, Result};
use crate::typedesc::{SlotValue, TypeTag, TypedValue};

slotmap::new_key_type! {
    /// Stable generational key of a resource owned by a graph.
    pub struct ResourceId;
}

/// Lifetime classification, driving aliasing and destruction.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ResourceLifetime {
    /// Live only for a sub-range of the topological order; may alias.
    Transient,
    /// Survives across frames, destroyed at cleanup.
    Persistent,
    /// Externally owned; the graph never destroys the payload.
    Imported,
    /// Immutable after creation.
    Static,
}

/// How the payload is held.
///
/// `ByValue` stores the tagged union inline. Shared storage covers both
/// by-reference and by-pointer semantics of the design: the payload stays
/// valid for as long as anything holds the `Arc`, which together with the
/// refcount satisfies the "valid until refcount reaches zero" rule.
#[derive(Clone, Debug)]
pub enum ResourceStorage {
    Empty,
    Value(SlotValue),
    Shared(Arc<SlotValue>),
}

/// Identifier of a group of transients that may share memory.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct AliasGroupId(pub u32);

pub struct Resource {
    tag: TypeTag,
    storage: ResourceStorage,
    lifetime: ResourceLifetime,
    reservation: Option<Reservation>,
    refs: AtomicU32,
    alias_group: Option<AliasGroupId>,
    /// Positions in the topological order between first and last use,
    /// computed during compile. Empty until then.
    live: Range<u32>,
}

impl Resource {
    /// Creates an empty resource with a fixed type tag.
    pub fn create(tag: TypeTag) -> Result<Resource> {
        if !tag.is_registered() {
            return Err(GraphError::TypeMismatch {
                component: Component::TypeRegistry,
                expected: tag,
                found: tag,
                node: None,
            });
        }
        Ok(Resource {
            tag,
            storage: ResourceStorage::Empty,
            lifetime: ResourceLifetime::Transient,
            reservation: None,
            refs: AtomicU32::new(1),
            alias_group: None,
            live: 0..0,
        })
    }

    pub fn tag(&self) -> TypeTag {
        self.tag
    }

    pub fn lifetime(&self) -> ResourceLifetime {
        self.lifetime
    }

    pub fn set_lifetime(&mut self, lifetime: ResourceLifetime) {
        self.lifetime = lifetime;
    }

    pub fn storage(&self) -> &ResourceStorage {
        &self.storage
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.storage, ResourceStorage::Empty)
    }

    /// Stores a typed payload inline. The tag is fixed at creation: writing a
    /// value of any other type fails, even when the resource is still empty.
    pub fn set_handle<T: TypedValue>(&mut self, value: T) -> Result<()> {
        self.set_value(value.into_value())
    }

    /// Tag-checked type-erased write.
    pub fn set_value(&mut self, value: SlotValue) -> Result<()> {
        let found = value.tag();
        if found != self.tag {
            return Err(GraphError::TypeMismatch {
                component: Component::Resource,
                expected: self.tag,
                found,
                node: None,
            });
        }
        if self.lifetime == ResourceLifetime::Static && !self.is_empty() {
            return Err(GraphError::Config(
                "static resources are immutable after first set".into(),
            ));
        }
        self.storage = ResourceStorage::Value(value);
        Ok(())
    }

    /// Stores a shared payload; same tag rules as [set_value](Self::set_value).
    pub fn set_shared(&mut self, value: Arc<SlotValue>) -> Result<()> {
        let found = value.tag();
        if found != self.tag {
            return Err(GraphError::TypeMismatch {
                component: Component::Resource,
                expected: self.tag,
                found,
                node: None,
            });
        }
        self.storage = ResourceStorage::Shared(value);
        Ok(())
    }

    pub fn value(&self) -> Option<&SlotValue> {
        match &self.storage {
            ResourceStorage::Empty => None,
            ResourceStorage::Value(v) => Some(v),
            ResourceStorage::Shared(v) => Some(v),
        }
    }

    /// Typed read. Succeeds iff the most recent write stored a `T`.
    pub fn get_handle<T: TypedValue>(&self) -> Result<T> {
        let value = self.value().ok_or(GraphError::TypeMismatch {
            component: Component::Resource,
            expected: T::TAG,
            found: self.tag,
            node: None,
        })?;
        T::from_value(value).ok_or(GraphError::TypeMismatch {
            component: Component::Resource,
            expected: T::TAG,
            found: value.tag(),
            node: None,
        })
    }

    pub fn retain(&self) -> u32 {
        self.refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrements the refcount; returns the new count. At zero the caller
    /// (always the owning graph) must queue the resource for deferred
    /// destruction — nothing is destroyed here.
    pub fn release(&self) -> u32 {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "release of resource with zero refcount");
        prev - 1
    }

    pub fn refcount(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    pub fn mark_alias_group(&mut self, group: AliasGroupId) {
        debug_assert_eq!(self.lifetime, ResourceLifetime::Transient);
        self.alias_group = Some(group);
    }

    pub fn alias_group(&self) -> Option<AliasGroupId> {
        self.alias_group
    }

    pub fn set_live_interval(&mut self, live: Range<u32>) {
        self.live = live;
    }

    pub fn live_interval(&self) -> Range<u32> {
        self.live.clone()
    }

    /// Two transients in the same alias group may share memory iff their
    /// live intervals do not overlap.
    pub fn may_alias_with(&self, other: &Resource) -> bool {
        match (self.alias_group, other.alias_group) {
            (Some(a), Some(b)) if a == b => {
                self.live.end <= other.live.start || other.live.end <= self.live.start
            }
            _ => false,
        }
    }

    pub fn set_reservation(&mut self, reservation: Reservation) {
        self.reservation = Some(reservation);
    }

    pub fn take_reservation(&mut self) -> Option<Reservation> {
        self.reservation.take()
    }
}

/// Resources whose refcount reached zero, waiting for the end-of-cleanup
/// drain. Pre-sized at setup so pushes during execute stay off the heap.
pub struct DeferredDestroyQueue {
    queue: parking_lot::Mutex<Vec<ResourceId>>,
}

impl DeferredDestroyQueue {
    pub fn with_capacity(capacity: usize) -> DeferredDestroyQueue {
        DeferredDestroyQueue {
            queue: parking_lot::Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    pub fn push(&self, id: ResourceId) {
        let mut queue = self.queue.lock();
        debug_assert!(
            queue.len() < queue.capacity(),
            "deferred destroy queue outgrew its pre-sized capacity"
        );
        queue.push(id);
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Moves the queued ids into `out`. Owning thread only.
    pub fn drain_into(&self, out: &mut Vec<ResourceId>) {
        out.append(&mut self.queue.lock());
    }

    /// Grows capacity; setup/compile only.
    pub fn ensure_capacity(&self, capacity: usize) {
        let mut queue = self.queue.lock();
        if queue.capacity() < capacity {
            let add = capacity - queue.capacity();
            queue.reserve(add);
        }
    }
}

/// Drops one reference; queues the resource for deferred destruction when
/// the count reaches zero. Destruction never happens synchronously here.
pub(crate) fn release_deferred(
    resources: &slotmap::SlotMap<ResourceId, Resource>,
    deferred: &DeferredDestroyQueue,
    id: ResourceId,
) {
    if let Some(resource) = resources.get(id) {
        if resource.release() == 0 {
            deferred.push(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{BufferHandle, ImageHandle};
    use crate::typedesc::BaseType;

    fn image_resource() -> Resource {
        Resource::create(TypeTag::scalar(BaseType::Image)).unwrap()
    }

    #[test]
    fn tag_is_fixed_at_creation() {
        let mut r = image_resource();
        assert!(r.set_handle(ImageHandle::from_raw(1)).is_ok());
        // A different type never goes in, even though the storage is re-settable.
        assert!(r.set_handle(BufferHandle::from_raw(2)).is_err());
        assert_eq!(r.get_handle::<ImageHandle>().unwrap(), ImageHandle::from_raw(1));
    }

    #[test]
    fn get_reflects_most_recent_write() {
        let mut r = image_resource();
        r.set_handle(ImageHandle::from_raw(1)).unwrap();
        r.set_handle(ImageHandle::from_raw(9)).unwrap();
        assert_eq!(r.get_handle::<ImageHandle>().unwrap(), ImageHandle::from_raw(9));
        assert!(r.get_handle::<BufferHandle>().is_err());
    }

    #[test]
    fn empty_resource_reads_fail() {
        let r = image_resource();
        assert!(r.get_handle::<ImageHandle>().is_err());
    }

    #[test]
    fn static_resources_are_immutable() {
        let mut r = image_resource();
        r.set_lifetime(ResourceLifetime::Static);
        r.set_handle(ImageHandle::from_raw(1)).unwrap();
        assert!(r.set_handle(ImageHandle::from_raw(2)).is_err());
    }

    #[test]
    fn refcount_is_monotonic_within_ops() {
        let r = image_resource();
        assert_eq!(r.refcount(), 1);
        assert_eq!(r.retain(), 2);
        assert_eq!(r.release(), 1);
        assert_eq!(r.release(), 0);
    }

    #[test]
    fn aliasing_requires_disjoint_intervals() {
        let mut a = image_resource();
        let mut b = image_resource();
        a.mark_alias_group(AliasGroupId(1));
        b.mark_alias_group(AliasGroupId(1));
        a.set_live_interval(0..3);
        b.set_live_interval(3..5);
        assert!(a.may_alias_with(&b));
        b.set_live_interval(2..5);
        assert!(!a.may_alias_with(&b));
    }

    #[test]
    fn shared_storage_checks_tags() {
        let mut r = image_resource();
        let shared = Arc::new(SlotValue::Image(ImageHandle::from_raw(5)));
        r.set_shared(shared).unwrap();
        assert_eq!(r.get_handle::<ImageHandle>().unwrap(), ImageHandle::from_raw(5));
        assert!(r.set_shared(Arc::new(SlotValue::UInt(1))).is_err());
    }
}
