//! Frame-history ring for temporal effects.
//!
//! A ring of `D >= 4` frame slots, each mapping resource ids to the payload
//! snapshot produced that frame. Maps are pre-sized at setup so inserts
//! never rehash; the ring advances modulo `D` at the end of each frame.
//! Slots hold strong retentions: the graph retains a resource when it is
//! stored and releases it when the slot is overwritten `D` frames later,
//! which keeps temporal reads from racing a drop.

use fxhash::FxHashMap;
use log::debug;

use crate::error::{GraphError, Result};
use crate::resource::ResourceId;
use crate::typedesc::{ContainerKind, SlotValue};

pub const MIN_HISTORY_DEPTH: usize = 4;

struct FrameSlot {
    /// Frame index this slot currently holds, `u64::MAX` when unused.
    frame: u64,
    entries: FxHashMap<ResourceId, SlotValue>,
}

pub struct TimelineHistory {
    slots: Vec<FrameSlot>,
    current: usize,
    current_frame: u64,
    entry_capacity: usize,
}

impl TimelineHistory {
    /// Creates a ring of `depth` slots (clamped up to the minimum), each
    /// pre-sized for `entry_capacity` snapshots.
    pub fn new(depth: usize, entry_capacity: usize) -> TimelineHistory {
        let depth = depth.max(MIN_HISTORY_DEPTH);
        let mut slots = Vec::with_capacity(depth);
        for _ in 0..depth {
            slots.push(FrameSlot {
                frame: u64::MAX,
                entries: FxHashMap::with_capacity_and_hasher(
                    entry_capacity.max(1),
                    Default::default(),
                ),
            });
        }
        debug!(
            "timeline history: {} slots x {} entries pre-sized",
            depth, entry_capacity
        );
        TimelineHistory {
            slots,
            current: 0,
            current_frame: 0,
            entry_capacity: entry_capacity.max(1),
        }
    }

    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    /// Snapshots `value` under `id` in the current frame's slot. The caller
    /// retains the resource; the matching release happens when the slot is
    /// evicted. Sequence payloads are not snapshotted (their copies touch
    /// the heap); temporal nodes pass scalar payloads.
    pub fn store(&mut self, id: ResourceId, value: &SlotValue) -> Result<()> {
        if value.tag().container != ContainerKind::None
            && value.tag().container != ContainerKind::Variant
        {
            return Err(GraphError::Config(
                "history snapshots are limited to scalar payloads".into(),
            ));
        }
        let slot = &mut self.slots[self.current];
        debug_assert!(
            slot.entries.len() < self.entry_capacity,
            "history slot outgrew its pre-sized capacity"
        );
        slot.frame = self.current_frame;
        slot.entries.insert(id, value.clone());
        Ok(())
    }

    /// Reads the snapshot of `id` taken `frames_ago` frames back.
    /// `frames_ago` must be in `1..depth`.
    pub fn previous(&self, frames_ago: usize, id: ResourceId) -> Option<&SlotValue> {
        if frames_ago == 0 || frames_ago >= self.slots.len() {
            return None;
        }
        if self.current_frame < frames_ago as u64 {
            return None;
        }
        let depth = self.slots.len();
        let slot = &self.slots[(self.current + depth - frames_ago) % depth];
        if slot.frame != self.current_frame - frames_ago as u64 {
            return None;
        }
        slot.entries.get(&id)
    }

    /// Advances to `frame`, reusing the oldest slot. The ids the reused
    /// slot retained are appended to `evicted`; the caller must release
    /// each one.
    pub fn advance(&mut self, frame: u64, evicted: &mut Vec<ResourceId>) {
        self.current = (self.current + 1) % self.slots.len();
        self.current_frame = frame;
        let slot = &mut self.slots[self.current];
        evicted.extend(slot.entries.keys().copied());
        // clear() keeps the pre-sized capacity.
        slot.entries.clear();
        slot.frame = u64::MAX;
    }

    /// Empties every slot, returning all retained ids. Cleanup only.
    pub fn drain(&mut self, evicted: &mut Vec<ResourceId>) {
        for slot in &mut self.slots {
            evicted.extend(slot.entries.keys().copied());
            slot.entries.clear();
            slot.frame = u64::MAX;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    use crate::resource::Resource;
    use crate::typedesc::{BaseType, TypeTag};
    use crate::handle::ImageHandle;

    fn id_pool(n: usize) -> Vec<ResourceId> {
        let mut map: SlotMap<ResourceId, Resource> = SlotMap::with_key();
        (0..n)
            .map(|_| map.insert(Resource::create(TypeTag::scalar(BaseType::Image)).unwrap()))
            .collect()
    }

    #[test]
    fn depth_is_clamped_to_minimum() {
        let h = TimelineHistory::new(2, 4);
        assert_eq!(h.depth(), MIN_HISTORY_DEPTH);
    }

    #[test]
    fn previous_reads_the_right_frame() {
        let ids = id_pool(1);
        let mut h = TimelineHistory::new(4, 4);
        let mut evicted = Vec::new();

        for frame in 0..3u64 {
            h.store(ids[0], &SlotValue::Image(ImageHandle::from_raw(frame + 10)))
                .unwrap();
            h.advance(frame + 1, &mut evicted);
        }

        assert_eq!(
            h.previous(1, ids[0]),
            Some(&SlotValue::Image(ImageHandle::from_raw(12)))
        );
        assert_eq!(
            h.previous(3, ids[0]),
            Some(&SlotValue::Image(ImageHandle::from_raw(10)))
        );
        assert_eq!(h.previous(0, ids[0]), None);
        assert_eq!(h.previous(4, ids[0]), None);
    }

    #[test]
    fn overwritten_slots_report_evictions() {
        let ids = id_pool(1);
        let mut h = TimelineHistory::new(4, 4);
        let mut evicted = Vec::new();

        for frame in 0..4u64 {
            h.store(ids[0], &SlotValue::Image(ImageHandle::from_raw(frame)))
                .unwrap();
            h.advance(frame + 1, &mut evicted);
        }
        // Ring wrapped once: the first frame's retention came back.
        assert_eq!(evicted, vec![ids[0]]);
    }

    #[test]
    fn sequences_are_rejected() {
        let ids = id_pool(1);
        let mut h = TimelineHistory::new(4, 4);
        let seq = SlotValue::Sequence(crate::typedesc::SequenceValue::with_capacity(
            BaseType::Image,
            1,
        ));
        assert!(h.store(ids[0], &seq).is_err());
    }
}
