//! In-process GPU stub for unit tests. Hands out monotonically numbered
//! handles and retires every submission immediately.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use fxhash::FxHashSet;
use parking_lot::Mutex;

use crate::command::Command;
use crate::descriptor::{DescriptorBinding, DescriptorType};
use crate::error::{GraphError, Result};
use crate::handle::{
    BufferHandle, DescriptorPoolHandle, DescriptorSetHandle, DescriptorSetLayoutHandle, DeviceId,
    FenceHandle, SemaphoreHandle,
};
use crate::traits::GpuBackend;
use crate::typedesc::SlotValue;

pub(crate) struct MockGpu {
    next_handle: AtomicU64,
    layouts: AtomicU64,
    pools: AtomicU64,
    staging_buffers: AtomicU64,
    destroyed: AtomicU64,
    submits: AtomicU64,
    presents: AtomicU64,
    signaled: Mutex<FxHashSet<u64>>,
    fail_next_acquire: AtomicBool,
    next_image: AtomicU32,
    swapchain_images: u32,
}

impl MockGpu {
    pub fn new() -> MockGpu {
        MockGpu::with_swapchain_images(3)
    }

    pub fn with_swapchain_images(count: u32) -> MockGpu {
        MockGpu {
            next_handle: AtomicU64::new(1),
            layouts: AtomicU64::new(0),
            pools: AtomicU64::new(0),
            staging_buffers: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            submits: AtomicU64::new(0),
            presents: AtomicU64::new(0),
            signaled: Mutex::new(FxHashSet::default()),
            fail_next_acquire: AtomicBool::new(false),
            next_image: AtomicU32::new(0),
            swapchain_images: count,
        }
    }

    fn mint(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    pub fn layouts_created(&self) -> u64 {
        self.layouts.load(Ordering::Relaxed)
    }

    pub fn pools_created(&self) -> u64 {
        self.pools.load(Ordering::Relaxed)
    }

    pub fn staging_buffers_created(&self) -> u64 {
        self.staging_buffers.load(Ordering::Relaxed)
    }

    pub fn signal_fence(&self, fence: FenceHandle) {
        self.signaled.lock().insert(fence.raw());
    }
}

impl GpuBackend for MockGpu {
    fn swapchain_image_count(&self) -> u32 {
        self.swapchain_images
    }

    fn create_fence(&self, signaled: bool) -> FenceHandle {
        let fence = FenceHandle::from_raw(self.mint());
        if signaled {
            self.signaled.lock().insert(fence.raw());
        }
        fence
    }

    fn destroy_fence(&self, _fence: FenceHandle) {}

    fn fence_status(&self, fence: FenceHandle) -> bool {
        self.signaled.lock().contains(&fence.raw())
    }

    fn reset_fence(&self, fence: FenceHandle) {
        self.signaled.lock().remove(&fence.raw());
    }

    fn wait_fence(&self, fence: FenceHandle, _timeout: Duration) -> Result<()> {
        // The mock GPU retires work instantly.
        self.signaled.lock().insert(fence.raw());
        Ok(())
    }

    fn create_semaphore(&self) -> SemaphoreHandle {
        SemaphoreHandle::from_raw(self.mint())
    }

    fn destroy_semaphore(&self, _semaphore: SemaphoreHandle) {}

    fn acquire_image(&self, _signal: SemaphoreHandle) -> Result<u32> {
        if self.fail_next_acquire.swap(false, Ordering::Relaxed) {
            return Err(GraphError::SwapchainOutOfDate);
        }
        let index = self.next_image.fetch_add(1, Ordering::Relaxed);
        Ok(index % self.swapchain_images)
    }

    fn present(&self, _image_index: u32, _wait: SemaphoreHandle) -> Result<()> {
        self.presents.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn create_staging_buffer(&self, _size: u64) -> BufferHandle {
        self.staging_buffers.fetch_add(1, Ordering::Relaxed);
        BufferHandle::from_raw(self.mint())
    }

    fn destroy_value(&self, _value: &SlotValue) {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
    }

    fn create_descriptor_set_layout(
        &self,
        _bindings: &[DescriptorBinding],
    ) -> DescriptorSetLayoutHandle {
        self.layouts.fetch_add(1, Ordering::Relaxed);
        DescriptorSetLayoutHandle::from_raw(self.mint())
    }

    fn create_descriptor_pool(
        &self,
        _sizes: &[(DescriptorType, u32)],
        _max_sets: u32,
    ) -> DescriptorPoolHandle {
        self.pools.fetch_add(1, Ordering::Relaxed);
        DescriptorPoolHandle::from_raw(self.mint())
    }

    fn destroy_descriptor_pool(&self, _pool: DescriptorPoolHandle) {}

    fn allocate_descriptor_sets(
        &self,
        _pool: DescriptorPoolHandle,
        _layout: DescriptorSetLayoutHandle,
        count: u32,
        out: &mut Vec<DescriptorSetHandle>,
    ) {
        for _ in 0..count {
            out.push(DescriptorSetHandle::from_raw(self.mint()));
        }
    }

    fn submit(
        &self,
        _device: DeviceId,
        _commands: &[Command],
        _wait: Option<SemaphoreHandle>,
        _signal: Option<SemaphoreHandle>,
        fence: FenceHandle,
    ) -> Result<()> {
        self.submits.fetch_add(1, Ordering::Relaxed);
        self.signaled.lock().insert(fence.raw());
        Ok(())
    }
}
