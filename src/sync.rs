//! Frame-in-flight synchronization.
//!
//! One fence and one image-available semaphore per frame in flight, and one
//! render-complete semaphore per swapchain image. The per-image indexing of
//! render-complete is load-bearing: indexing those by frame-in-flight can
//! hand the presentation engine a semaphore that is still in flight.

use std::time::Duration;

use log::debug;

use crate::error::{Component, GraphError, Result};
use crate::handle::{FenceHandle, SemaphoreHandle};
use crate::traits::GpuBackend;

pub const MIN_FRAMES_IN_FLIGHT: usize = 2;
pub const MAX_FRAMES_IN_FLIGHT: usize = 4;

pub struct FrameSync {
    in_flight: Vec<FenceHandle>,
    image_available: Vec<SemaphoreHandle>,
    render_complete: Vec<SemaphoreHandle>,
    frame_index: u64,
}

impl FrameSync {
    /// Creates sync objects for `frames_in_flight` frames (clamped to
    /// `2..=4`) and `swapchain_image_count` swapchain images. Fences start
    /// signaled so the first frames do not wait.
    pub fn new(
        backend: &dyn GpuBackend,
        frames_in_flight: usize,
        swapchain_image_count: u32,
    ) -> FrameSync {
        let frames = frames_in_flight.clamp(MIN_FRAMES_IN_FLIGHT, MAX_FRAMES_IN_FLIGHT);
        debug!(
            "frame sync: {} frames in flight, {} swapchain images",
            frames, swapchain_image_count
        );
        FrameSync {
            in_flight: (0..frames).map(|_| backend.create_fence(true)).collect(),
            image_available: (0..frames).map(|_| backend.create_semaphore()).collect(),
            render_complete: (0..swapchain_image_count)
                .map(|_| backend.create_semaphore())
                .collect(),
            frame_index: 0,
        }
    }

    pub fn frames_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    /// Index of the current frame slot.
    pub fn slot(&self) -> usize {
        (self.frame_index % self.in_flight.len() as u64) as usize
    }

    /// Blocks until frame `N - frames_in_flight` has retired. The fence is
    /// reset separately, right before the submission that will signal it;
    /// a skipped frame must leave it signaled.
    pub fn wait_for_frame(&self, backend: &dyn GpuBackend, timeout: Duration) -> Result<()> {
        let fence = self.in_flight[self.slot()];
        backend
            .wait_fence(fence, timeout)
            .map_err(|_| GraphError::Timeout {
                component: Component::FrameSync,
                millis: timeout.as_millis() as u64,
            })
    }

    /// Fence the current frame's submission must signal.
    pub fn frame_fence(&self) -> FenceHandle {
        self.in_flight[self.slot()]
    }

    /// Semaphore signaled once the acquired image is usable this frame.
    pub fn image_available(&self) -> SemaphoreHandle {
        self.image_available[self.slot()]
    }

    /// Semaphore presentation waits on, indexed by swapchain image.
    pub fn render_complete(&self, image_index: u32) -> SemaphoreHandle {
        self.render_complete[image_index as usize]
    }

    pub fn advance(&mut self) {
        self.frame_index += 1;
    }

    /// Destroys every sync object. Cleanup only.
    pub fn destroy(&mut self, backend: &dyn GpuBackend) {
        for fence in self.in_flight.drain(..) {
            backend.destroy_fence(fence);
        }
        for semaphore in self
            .image_available
            .drain(..)
            .chain(self.render_complete.drain(..))
        {
            backend.destroy_semaphore(semaphore);
        }
    }
}
