//! The backend boundary.
//!
//! The core orchestrates; a [GpuBackend] implementation talks to the actual
//! graphics API. The graph owns one backend as a trait object and threads it
//! through compile, execute and cleanup. Everything the core needs from a
//! GPU — sync objects, swapchain acquire/present, descriptor plumbing and
//! command submission — is expressed here, so the core itself never touches
//! an API-specific type.

use std::time::Duration;

use crate::command::Command;
use crate::descriptor::{DescriptorBinding, DescriptorType};
use crate::error::Result;
use crate::handle::{
    BufferHandle, DescriptorPoolHandle, DescriptorSetHandle, DescriptorSetLayoutHandle, DeviceId,
    FenceHandle, SemaphoreHandle,
};
use crate::typedesc::SlotValue;

/// Interface to one (or more) GPUs.
///
/// Implementations are expected to be internally synchronized: `&self`
/// methods may be called from the owning graph thread at any point of the
/// frame.
pub trait GpuBackend: Send {
    /// Number of physical devices driven by this backend.
    fn device_count(&self) -> u32 {
        1
    }

    /// Number of swapchain images; render-complete semaphores are indexed
    /// by this.
    fn swapchain_image_count(&self) -> u32;

    // --- sync objects ----------------------------------------------------

    fn create_fence(&self, signaled: bool) -> FenceHandle;
    fn destroy_fence(&self, fence: FenceHandle);
    /// True if the fence is signaled. Never blocks.
    fn fence_status(&self, fence: FenceHandle) -> bool;
    fn reset_fence(&self, fence: FenceHandle);
    /// Blocks until the fence signals or `timeout` elapses.
    fn wait_fence(&self, fence: FenceHandle, timeout: Duration) -> Result<()>;

    fn create_semaphore(&self) -> SemaphoreHandle;
    fn destroy_semaphore(&self, semaphore: SemaphoreHandle);

    // --- swapchain -------------------------------------------------------

    /// Acquires the next swapchain image, signaling `signal` when it is
    /// usable. Fails with `SwapchainOutOfDate` after a resize.
    fn acquire_image(&self, signal: SemaphoreHandle) -> Result<u32>;

    /// Presents `image_index` after `wait` signals.
    fn present(&self, image_index: u32, wait: SemaphoreHandle) -> Result<()>;

    // --- memory ----------------------------------------------------------

    /// Allocates a host-visible transfer buffer.
    fn create_staging_buffer(&self, size: u64) -> BufferHandle;

    /// Destruction sink for deferred destruction: called once per payload
    /// when its refcount has reached zero and the frame that used it has
    /// retired. Imported payloads are never passed here.
    fn destroy_value(&self, value: &SlotValue);

    // --- descriptors -----------------------------------------------------

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> DescriptorSetLayoutHandle;

    fn create_descriptor_pool(
        &self,
        sizes: &[(DescriptorType, u32)],
        max_sets: u32,
    ) -> DescriptorPoolHandle;

    fn destroy_descriptor_pool(&self, pool: DescriptorPoolHandle);

    /// Allocates `count` sets of `layout` from `pool` into `out`.
    /// `out` has been reserved by the caller.
    fn allocate_descriptor_sets(
        &self,
        pool: DescriptorPoolHandle,
        layout: DescriptorSetLayoutHandle,
        count: u32,
        out: &mut Vec<DescriptorSetHandle>,
    );

    // --- submission ------------------------------------------------------

    /// Submits a sorted command stream for `device`. `wait`/`signal` carry
    /// the per-frame acquire and render-complete semaphores; `fence` signals
    /// when the submission retires.
    fn submit(
        &self,
        device: DeviceId,
        commands: &[Command],
        wait: Option<SemaphoreHandle>,
        signal: Option<SemaphoreHandle>,
        fence: FenceHandle,
    ) -> Result<()>;
}

// Shared-handle delegation so callers can hand out `Arc<dyn GpuBackend>` (or
// `Arc<ConcreteBackend>`) clones while the graph holds its own.
impl<T: GpuBackend + Sync + ?Sized> GpuBackend for std::sync::Arc<T> {
    fn device_count(&self) -> u32 {
        T::device_count(self)
    }

    fn swapchain_image_count(&self) -> u32 {
        T::swapchain_image_count(self)
    }

    fn create_fence(&self, signaled: bool) -> FenceHandle {
        T::create_fence(self, signaled)
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        T::destroy_fence(self, fence)
    }

    fn fence_status(&self, fence: FenceHandle) -> bool {
        T::fence_status(self, fence)
    }

    fn reset_fence(&self, fence: FenceHandle) {
        T::reset_fence(self, fence)
    }

    fn wait_fence(&self, fence: FenceHandle, timeout: Duration) -> Result<()> {
        T::wait_fence(self, fence, timeout)
    }

    fn create_semaphore(&self) -> SemaphoreHandle {
        T::create_semaphore(self)
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreHandle) {
        T::destroy_semaphore(self, semaphore)
    }

    fn acquire_image(&self, signal: SemaphoreHandle) -> Result<u32> {
        T::acquire_image(self, signal)
    }

    fn present(&self, image_index: u32, wait: SemaphoreHandle) -> Result<()> {
        T::present(self, image_index, wait)
    }

    fn create_staging_buffer(&self, size: u64) -> BufferHandle {
        T::create_staging_buffer(self, size)
    }

    fn destroy_value(&self, value: &SlotValue) {
        T::destroy_value(self, value)
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> DescriptorSetLayoutHandle {
        T::create_descriptor_set_layout(self, bindings)
    }

    fn create_descriptor_pool(
        &self,
        sizes: &[(DescriptorType, u32)],
        max_sets: u32,
    ) -> DescriptorPoolHandle {
        T::create_descriptor_pool(self, sizes, max_sets)
    }

    fn destroy_descriptor_pool(&self, pool: DescriptorPoolHandle) {
        T::destroy_descriptor_pool(self, pool)
    }

    fn allocate_descriptor_sets(
        &self,
        pool: DescriptorPoolHandle,
        layout: DescriptorSetLayoutHandle,
        count: u32,
        out: &mut Vec<DescriptorSetHandle>,
    ) {
        T::allocate_descriptor_sets(self, pool, layout, count, out)
    }

    fn submit(
        &self,
        device: DeviceId,
        commands: &[Command],
        wait: Option<SemaphoreHandle>,
        signal: Option<SemaphoreHandle>,
        fence: FenceHandle,
    ) -> Result<()> {
        T::submit(self, device, commands, wait, signal, fence)
    }
}
