//! Opaque handles to GPU objects owned by the backend.
//!
//! The core never dereferences these; they are tokens minted by a
//! [GpuBackend](crate::traits::GpuBackend) and threaded through resources,
//! commands and sync objects.

use bitflags::bitflags;

macro_rules! gpu_handle {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[repr(transparent)]
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
        pub struct $name(u64);

        impl $name {
            pub fn from_raw(raw: u64) -> $name {
                $name(raw)
            }

            pub fn raw(self) -> u64 {
                self.0
            }
        }
    };
}

gpu_handle!(
    /// Backend image object.
    ImageHandle
);
gpu_handle!(
    /// Backend buffer object.
    BufferHandle
);
gpu_handle!(
    /// Backend image view object.
    ImageViewHandle
);
gpu_handle!(
    /// Backend sampler object.
    SamplerHandle
);
gpu_handle!(
    /// Backend pipeline object (graphics or compute).
    PipelineHandle
);
gpu_handle!(
    /// Backend descriptor set layout object.
    DescriptorSetLayoutHandle
);
gpu_handle!(
    /// Backend descriptor set object.
    DescriptorSetHandle
);
gpu_handle!(
    /// Backend descriptor pool object.
    DescriptorPoolHandle
);
gpu_handle!(
    /// Backend semaphore (GPU-GPU sync).
    SemaphoreHandle
);
gpu_handle!(
    /// Backend fence (CPU-GPU sync).
    FenceHandle
);

/// Index of one physical GPU. Single-device graphs only ever see device 0.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u32);

bitflags! {
    /// Set of devices a node's work may run on. Affinity propagates along
    /// dependency edges during compile; the empty mask means "isolated"
    /// (every device the node could use was lost).
    pub struct DeviceMask: u32 {
        const DEVICE_0 = 1 << 0;
        const DEVICE_1 = 1 << 1;
        const DEVICE_2 = 1 << 2;
        const DEVICE_3 = 1 << 3;
    }
}

impl DeviceMask {
    pub fn single(device: DeviceId) -> DeviceMask {
        DeviceMask::from_bits_truncate(1 << device.0)
    }

    pub fn contains_device(self, device: DeviceId) -> bool {
        self.intersects(DeviceMask::single(device))
    }
}

bitflags! {
    /// Shader stages that observe a descriptor binding.
    pub struct ShaderStageFlags: u32 {
        const VERTEX = 1 << 0;
        const TESS_CONTROL = 1 << 1;
        const TESS_EVAL = 1 << 2;
        const GEOMETRY = 1 << 3;
        const FRAGMENT = 1 << 4;
        const COMPUTE = 1 << 5;
        const ALL_GRAPHICS = Self::VERTEX.bits | Self::TESS_CONTROL.bits
            | Self::TESS_EVAL.bits | Self::GEOMETRY.bits | Self::FRAGMENT.bits;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_mask_roundtrip() {
        let m = DeviceMask::single(DeviceId(2));
        assert!(m.contains_device(DeviceId(2)));
        assert!(!m.contains_device(DeviceId(0)));
    }

    #[test]
    fn handles_compare_by_raw_value() {
        assert_eq!(ImageHandle::from_raw(7), ImageHandle::from_raw(7));
        assert_ne!(FenceHandle::from_raw(1), FenceHandle::from_raw(2));
    }
}
