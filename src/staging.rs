//! Pre-warmed staging buffer pool.
//!
//! Upload-heavy nodes borrow fixed-size host-visible buffers from here
//! instead of allocating per frame. A buffer is not handed out again while
//! its last submission's fence is unsignaled. Exhaustion falls through to an
//! emergency allocation with a warning counter, so a mis-sized pool degrades
//! instead of failing.

use log::{debug, warn};

use crate::budget::{BudgetManager, MemoryKind, Reservation};
use crate::error::Result;
use crate::handle::{BufferHandle, FenceHandle};
use crate::traits::GpuBackend;

struct StagingBuffer {
    buffer: BufferHandle,
    /// Fence of the submission that last used this buffer, if any.
    in_flight: Option<FenceHandle>,
    reservation: Option<Reservation>,
}

/// A borrowed staging buffer. Return it with [StagingPool::submit_used] once
/// recorded, passing the frame fence.
#[derive(Copy, Clone, Debug)]
pub struct StagingLease {
    pub buffer: BufferHandle,
    index: usize,
}

pub struct StagingPool {
    buffers: Vec<StagingBuffer>,
    buffer_size: u64,
    emergency_allocations: u64,
}

impl StagingPool {
    pub fn new() -> StagingPool {
        StagingPool {
            buffers: Vec::new(),
            buffer_size: 0,
            emergency_allocations: 0,
        }
    }

    pub fn buffer_size(&self) -> u64 {
        self.buffer_size
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn emergency_allocations(&self) -> u64 {
        self.emergency_allocations
    }

    /// Creates `count` buffers of `size` bytes up front, reserving staging
    /// budget for each. Setup-phase only.
    pub fn pre_warm(
        &mut self,
        backend: &dyn GpuBackend,
        budget: &BudgetManager,
        count: usize,
        size: u64,
    ) -> Result<()> {
        self.buffer_size = size;
        self.buffers.reserve(count);
        for _ in 0..count {
            let reservation = budget.reserve(MemoryKind::Staging, size)?;
            self.buffers.push(StagingBuffer {
                buffer: backend.create_staging_buffer(size),
                in_flight: None,
                reservation: Some(reservation),
            });
        }
        debug!("staging pool pre-warmed: {} x {} bytes", count, size);
        Ok(())
    }

    /// Hands out a buffer that is not in flight. When every pre-warmed
    /// buffer is busy, allocates an emergency buffer and counts it.
    pub fn acquire(&mut self, backend: &dyn GpuBackend) -> StagingLease {
        for (index, slot) in self.buffers.iter_mut().enumerate() {
            let free = match slot.in_flight {
                None => true,
                Some(fence) => {
                    if backend.fence_status(fence) {
                        slot.in_flight = None;
                        true
                    } else {
                        false
                    }
                }
            };
            if free {
                return StagingLease {
                    buffer: slot.buffer,
                    index,
                };
            }
        }

        self.emergency_allocations += 1;
        warn!(
            "staging pool exhausted ({} buffers in flight), emergency allocation #{}",
            self.buffers.len(),
            self.emergency_allocations
        );
        self.buffers.push(StagingBuffer {
            buffer: backend.create_staging_buffer(self.buffer_size),
            in_flight: None,
            reservation: None,
        });
        StagingLease {
            buffer: self.buffers.last().unwrap().buffer,
            index: self.buffers.len() - 1,
        }
    }

    /// Marks the lease's buffer as in flight behind `fence`.
    pub fn submit_used(&mut self, lease: StagingLease, fence: FenceHandle) {
        if let Some(slot) = self.buffers.get_mut(lease.index) {
            slot.in_flight = Some(fence);
        }
    }

    /// Destroys every buffer and returns their reservations to the budget.
    pub fn drain(&mut self, backend: &dyn GpuBackend, budget: &BudgetManager) {
        for mut slot in self.buffers.drain(..) {
            backend.destroy_value(&crate::typedesc::SlotValue::Buffer(slot.buffer));
            if let Some(reservation) = slot.reservation.take() {
                budget.release(reservation);
            }
        }
    }
}

impl Default for StagingPool {
    fn default() -> StagingPool {
        StagingPool::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::BudgetLimits;
    use crate::test_support::MockGpu;

    fn budget() -> BudgetManager {
        let l = BudgetLimits {
            soft: 1 << 20,
            hard: 2 << 20,
        };
        BudgetManager::new(l, l, l, 0)
    }

    #[test]
    fn pre_warm_reserves_budget() {
        let gpu = MockGpu::new();
        let budget = budget();
        let mut pool = StagingPool::new();
        pool.pre_warm(&gpu, &budget, 4, 1024).unwrap();
        assert_eq!(pool.len(), 4);
        assert_eq!(budget.used(MemoryKind::Staging), 4 * 1024);
        assert_eq!(gpu.staging_buffers_created(), 4);

        pool.drain(&gpu, &budget);
        assert_eq!(budget.used(MemoryKind::Staging), 0);
    }

    #[test]
    fn in_flight_buffers_are_not_reused() {
        let gpu = MockGpu::new();
        let budget = budget();
        let mut pool = StagingPool::new();
        pool.pre_warm(&gpu, &budget, 2, 256).unwrap();

        let a = pool.acquire(&gpu);
        let fence = gpu.create_fence(false);
        pool.submit_used(a, fence);

        let b = pool.acquire(&gpu);
        assert_ne!(a.buffer, b.buffer);

        // Once the fence signals the first buffer recycles.
        gpu.signal_fence(fence);
        pool.submit_used(b, gpu.create_fence(false));
        let c = pool.acquire(&gpu);
        assert_eq!(c.buffer, a.buffer);
        assert_eq!(pool.emergency_allocations(), 0);
    }

    #[test]
    fn exhaustion_falls_through_with_warning_counter() {
        let gpu = MockGpu::new();
        let budget = budget();
        let mut pool = StagingPool::new();
        pool.pre_warm(&gpu, &budget, 1, 256).unwrap();

        let a = pool.acquire(&gpu);
        pool.submit_used(a, gpu.create_fence(false));
        let b = pool.acquire(&gpu);
        assert_ne!(a.buffer, b.buffer);
        assert_eq!(pool.emergency_allocations(), 1);
        assert_eq!(pool.len(), 2);
    }
}
