//! Shared fixture: an instant-retire GPU stub plus a small zoo of nodes
//! exercising the public node contract.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use std::collections::HashSet;

use vixen_core::command::Command;
use vixen_core::descriptor::{DescriptorBinding, DescriptorDeclaration, DescriptorType};
use vixen_core::error::{GraphError, Result};
use vixen_core::event::{Event, EventKind, EventMask, EventPayload};
use vixen_core::handle::{
    BufferHandle, DescriptorPoolHandle, DescriptorSetHandle, DescriptorSetLayoutHandle, DeviceId,
    FenceHandle, ImageHandle, ImageViewHandle, SemaphoreHandle, ShaderStageFlags,
};
use vixen_core::node::{CompileContext, EventResponse, ExecuteContext, RenderNode};
use vixen_core::slot::{NodeSignature, SlotArity, SlotDescriptor};
use vixen_core::traits::GpuBackend;
use vixen_core::typedesc::{BaseType, SlotValue, TypeTag};
use vixen_core::ResourceLifetime;

// --- backend stub --------------------------------------------------------

pub struct TestGpu {
    next_handle: AtomicU64,
    signaled: Mutex<HashSet<u64>>,
    submits: AtomicU64,
    presents: AtomicU64,
    fail_next_acquire: AtomicBool,
    next_image: AtomicU32,
    swapchain_images: u32,
}

impl TestGpu {
    pub fn new() -> TestGpu {
        TestGpu {
            next_handle: AtomicU64::new(1),
            signaled: Mutex::new(HashSet::new()),
            submits: AtomicU64::new(0),
            presents: AtomicU64::new(0),
            fail_next_acquire: AtomicBool::new(false),
            next_image: AtomicU32::new(0),
            swapchain_images: 3,
        }
    }

    fn mint(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    pub fn submits(&self) -> u64 {
        self.submits.load(Ordering::Relaxed)
    }

    pub fn presents(&self) -> u64 {
        self.presents.load(Ordering::Relaxed)
    }

    pub fn fail_next_acquire(&self) {
        self.fail_next_acquire.store(true, Ordering::Relaxed);
    }
}

impl GpuBackend for TestGpu {
    fn swapchain_image_count(&self) -> u32 {
        self.swapchain_images
    }

    fn create_fence(&self, signaled: bool) -> FenceHandle {
        let fence = FenceHandle::from_raw(self.mint());
        if signaled {
            self.signaled.lock().unwrap().insert(fence.raw());
        }
        fence
    }

    fn destroy_fence(&self, _fence: FenceHandle) {}

    fn fence_status(&self, fence: FenceHandle) -> bool {
        self.signaled.lock().unwrap().contains(&fence.raw())
    }

    fn reset_fence(&self, fence: FenceHandle) {
        self.signaled.lock().unwrap().remove(&fence.raw());
    }

    fn wait_fence(&self, fence: FenceHandle, _timeout: Duration) -> Result<()> {
        self.signaled.lock().unwrap().insert(fence.raw());
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
        Ok(self.next_image.fetch_add(1, Ordering::Relaxed) % self.swapchain_images)
    }

    fn present(&self, _image_index: u32, _wait: SemaphoreHandle) -> Result<()> {
        self.presents.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn create_staging_buffer(&self, _size: u64) -> BufferHandle {
        BufferHandle::from_raw(self.mint())
    }

    fn destroy_value(&self, _value: &SlotValue) {}

    fn create_descriptor_set_layout(
        &self,
        _bindings: &[DescriptorBinding],
    ) -> DescriptorSetLayoutHandle {
        DescriptorSetLayoutHandle::from_raw(self.mint())
    }

    fn create_descriptor_pool(
        &self,
        _sizes: &[(DescriptorType, u32)],
        _max_sets: u32,
    ) -> DescriptorPoolHandle {
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
        self.signaled.lock().unwrap().insert(fence.raw());
        Ok(())
    }
}

// --- test nodes ----------------------------------------------------------

/// Source node: produces one image at compile, clears it per frame.
pub struct ImageSource {
    pub raw: u64,
}

impl RenderNode for ImageSource {
    fn type_name(&self) -> &'static str {
        "image_source"
    }

    fn signature(&self) -> Result<NodeSignature> {
        NodeSignature::new(
            vec![],
            vec![SlotDescriptor::output(
                0,
                "image",
                TypeTag::scalar(BaseType::Image),
            )],
        )
    }

    fn compile(&mut self, ctx: &mut CompileContext) -> Result<()> {
        ctx.output(0, ImageHandle::from_raw(self.raw), ResourceLifetime::Persistent)?;
        ctx.reserve_commands(1);
        Ok(())
    }

    fn execute(&mut self, ctx: &mut ExecuteContext) -> Result<()> {
        ctx.push(vixen_core::command::GpuCommand::ClearImage {
            image: ImageHandle::from_raw(self.raw),
            color: [0.0; 4],
        });
        Ok(())
    }
}

/// Pass-through node: one image in, one image out.
pub struct ImageFilter {
    pub raw: u64,
}

impl RenderNode for ImageFilter {
    fn type_name(&self) -> &'static str {
        "image_filter"
    }

    fn signature(&self) -> Result<NodeSignature> {
        NodeSignature::new(
            vec![SlotDescriptor::input(
                0,
                "input",
                TypeTag::scalar(BaseType::Image),
            )],
            vec![SlotDescriptor::output(
                0,
                "output",
                TypeTag::scalar(BaseType::Image),
            )],
        )
    }

    fn compile(&mut self, ctx: &mut CompileContext) -> Result<()> {
        ctx.output(0, ImageHandle::from_raw(self.raw), ResourceLifetime::Transient)?;
        ctx.reserve_commands(1);
        Ok(())
    }

    fn execute(&mut self, ctx: &mut ExecuteContext) -> Result<()> {
        let src: ImageHandle = ctx.input(0)?;
        ctx.push(vixen_core::command::GpuCommand::Barrier { image: src });
        ctx.output(0, ImageHandle::from_raw(self.raw))?;
        Ok(())
    }
}

/// Sink node: consumes an image, remembers the last handle it saw.
pub struct ImageSink {
    pub last_seen: u64,
}

impl RenderNode for ImageSink {
    fn type_name(&self) -> &'static str {
        "image_sink"
    }

    fn signature(&self) -> Result<NodeSignature> {
        NodeSignature::new(
            vec![SlotDescriptor::input(
                0,
                "input",
                TypeTag::scalar(BaseType::Image),
            )],
            vec![],
        )
    }

    fn compile(&mut self, _ctx: &mut CompileContext) -> Result<()> {
        Ok(())
    }

    fn execute(&mut self, ctx: &mut ExecuteContext) -> Result<()> {
        let image: ImageHandle = ctx.input(0)?;
        self.last_seen = image.raw();
        Ok(())
    }
}

/// Produces one image view.
pub struct ViewSource {
    pub raw: u64,
}

impl RenderNode for ViewSource {
    fn type_name(&self) -> &'static str {
        "view_source"
    }

    fn signature(&self) -> Result<NodeSignature> {
        NodeSignature::new(
            vec![],
            vec![SlotDescriptor::output(
                0,
                "view",
                TypeTag::scalar(BaseType::ImageView),
            )],
        )
    }

    fn compile(&mut self, ctx: &mut CompileContext) -> Result<()> {
        ctx.output(
            0,
            ImageViewHandle::from_raw(self.raw),
            ResourceLifetime::Persistent,
        )?;
        Ok(())
    }

    fn execute(&mut self, _ctx: &mut ExecuteContext) -> Result<()> {
        Ok(())
    }
}

/// Accumulation consumer: observes every bound view per frame, in
/// registration order. Fixed-size record keeps execute off the heap.
pub struct ViewGather {
    pub seen: [u64; 8],
    pub seen_len: usize,
}

impl ViewGather {
    pub fn new() -> ViewGather {
        ViewGather {
            seen: [0; 8],
            seen_len: 0,
        }
    }
}

impl RenderNode for ViewGather {
    fn type_name(&self) -> &'static str {
        "view_gather"
    }

    fn signature(&self) -> Result<NodeSignature> {
        NodeSignature::new(
            vec![SlotDescriptor::input(
                0,
                "views",
                TypeTag::sequence(BaseType::ImageView),
            )
            .with_arity(SlotArity::Variadic)],
            vec![],
        )
    }

    fn compile(&mut self, _ctx: &mut CompileContext) -> Result<()> {
        Ok(())
    }

    fn execute(&mut self, ctx: &mut ExecuteContext) -> Result<()> {
        self.seen_len = 0;
        for i in 0..ctx.input_count(0).min(self.seen.len()) {
            let view: ImageViewHandle = ctx.input_at(0, i)?;
            self.seen[self.seen_len] = view.raw();
            self.seen_len += 1;
        }
        Ok(())
    }
}

// --- resize-cascade nodes ------------------------------------------------

/// Window surface provider.
pub struct WindowNode;

impl RenderNode for WindowNode {
    fn type_name(&self) -> &'static str {
        "window"
    }

    fn signature(&self) -> Result<NodeSignature> {
        NodeSignature::new(
            vec![],
            vec![SlotDescriptor::output(
                0,
                "surface",
                TypeTag::scalar(BaseType::Image),
            )],
        )
    }

    fn compile(&mut self, ctx: &mut CompileContext) -> Result<()> {
        ctx.output(0, ImageHandle::from_raw(1), ResourceLifetime::Persistent)?;
        Ok(())
    }

    fn execute(&mut self, _ctx: &mut ExecuteContext) -> Result<()> {
        Ok(())
    }
}

/// Reacts to window resizes by recreating internally and invalidating its
/// consumers; the node itself does not recompile.
pub struct SwapchainNode {
    pub extent: (u32, u32),
}

impl RenderNode for SwapchainNode {
    fn type_name(&self) -> &'static str {
        "swapchain"
    }

    fn signature(&self) -> Result<NodeSignature> {
        NodeSignature::new(
            vec![SlotDescriptor::input(
                0,
                "surface",
                TypeTag::scalar(BaseType::Image),
            )],
            vec![SlotDescriptor::output(
                0,
                "backbuffer",
                TypeTag::scalar(BaseType::Image),
            )],
        )
    }

    fn event_filter(&self) -> EventMask {
        EventMask::WINDOW_RESIZE
    }

    fn on_event(&mut self, event: &Event) -> EventResponse {
        if let EventPayload::Extent { width, height } = event.payload {
            self.extent = (width, height);
        }
        EventResponse::emit(EventKind::SwapchainInvalidated, EventPayload::None)
    }

    fn compile(&mut self, ctx: &mut CompileContext) -> Result<()> {
        ctx.output(0, ImageHandle::from_raw(2), ResourceLifetime::Persistent)?;
        Ok(())
    }

    fn execute(&mut self, _ctx: &mut ExecuteContext) -> Result<()> {
        Ok(())
    }
}

/// Goes dirty whenever the swapchain reports invalidation.
pub struct FramebufferNode;

impl RenderNode for FramebufferNode {
    fn type_name(&self) -> &'static str {
        "framebuffer"
    }

    fn signature(&self) -> Result<NodeSignature> {
        NodeSignature::new(
            vec![SlotDescriptor::input(
                0,
                "backbuffer",
                TypeTag::scalar(BaseType::Image),
            )],
            vec![SlotDescriptor::output(
                0,
                "target",
                TypeTag::scalar(BaseType::Image),
            )],
        )
    }

    fn event_filter(&self) -> EventMask {
        EventMask::SWAPCHAIN_INVALIDATED
    }

    fn on_event(&mut self, _event: &Event) -> EventResponse {
        EventResponse::mark_dirty()
    }

    fn compile(&mut self, ctx: &mut CompileContext) -> Result<()> {
        ctx.output(0, ImageHandle::from_raw(3), ResourceLifetime::Persistent)?;
        Ok(())
    }

    fn execute(&mut self, _ctx: &mut ExecuteContext) -> Result<()> {
        Ok(())
    }
}

pub struct RenderPassNode;

impl RenderNode for RenderPassNode {
    fn type_name(&self) -> &'static str {
        "render_pass"
    }

    fn signature(&self) -> Result<NodeSignature> {
        NodeSignature::new(
            vec![SlotDescriptor::input(
                0,
                "target",
                TypeTag::scalar(BaseType::Image),
            )],
            vec![],
        )
    }

    fn event_filter(&self) -> EventMask {
        EventMask::SWAPCHAIN_INVALIDATED
    }

    fn on_event(&mut self, _event: &Event) -> EventResponse {
        EventResponse::mark_dirty()
    }

    fn compile(&mut self, ctx: &mut CompileContext) -> Result<()> {
        ctx.reserve_commands(2);
        Ok(())
    }

    fn execute(&mut self, ctx: &mut ExecuteContext) -> Result<()> {
        let target: ImageHandle = ctx.input(0)?;
        ctx.push(vixen_core::command::GpuCommand::BeginPass { target });
        ctx.push(vixen_core::command::GpuCommand::EndPass);
        Ok(())
    }
}

// --- descriptor-declaring node -------------------------------------------

/// Declares a layout with an estimate of 4 sets and takes them all during
/// its first execute.
pub struct DescriptorUser {
    pub sets_taken: usize,
    layout: Option<vixen_core::descriptor::LayoutHash>,
}

impl DescriptorUser {
    pub fn new() -> DescriptorUser {
        DescriptorUser {
            sets_taken: 0,
            layout: None,
        }
    }

    fn bindings() -> [DescriptorBinding; 2] {
        [
            DescriptorBinding {
                binding: 0,
                descriptor_type: DescriptorType::UniformBuffer,
                stage_flags: ShaderStageFlags::FRAGMENT,
                count: 1,
            },
            DescriptorBinding {
                binding: 1,
                descriptor_type: DescriptorType::SampledImage,
                stage_flags: ShaderStageFlags::FRAGMENT,
                count: 1,
            },
        ]
    }
}

impl RenderNode for DescriptorUser {
    fn type_name(&self) -> &'static str {
        "descriptor_user"
    }

    fn signature(&self) -> Result<NodeSignature> {
        NodeSignature::new(
            vec![],
            vec![SlotDescriptor::output(
                0,
                "image",
                TypeTag::scalar(BaseType::Image),
            )],
        )
    }

    fn declare_descriptors(&self) -> Option<DescriptorDeclaration> {
        Some(DescriptorDeclaration {
            bindings: Self::bindings().to_vec(),
            estimated_set_count: 4,
        })
    }

    fn compile(&mut self, ctx: &mut CompileContext) -> Result<()> {
        ctx.output(0, ImageHandle::from_raw(9), ResourceLifetime::Persistent)?;
        let (hash, _) = ctx.request_layout(&Self::bindings()).expect("valid layout");
        self.layout = Some(hash);
        Ok(())
    }

    fn execute(&mut self, ctx: &mut ExecuteContext) -> Result<()> {
        if self.sets_taken == 0 {
            let layout = self.layout.expect("layout cached at compile");
            while self.sets_taken < 4 && ctx.take_descriptor_set(layout).is_ok() {
                self.sets_taken += 1;
            }
        }
        Ok(())
    }
}

/// Source whose compile fails while the "fail" parameter is set.
pub struct FlakySource;

impl RenderNode for FlakySource {
    fn type_name(&self) -> &'static str {
        "flaky_source"
    }

    fn signature(&self) -> Result<NodeSignature> {
        NodeSignature::new(
            vec![],
            vec![SlotDescriptor::output(
                0,
                "image",
                TypeTag::scalar(BaseType::Image),
            )],
        )
    }

    fn compile(&mut self, ctx: &mut CompileContext) -> Result<()> {
        if let Some(vixen_core::ParamValue::Bool(true)) = ctx.param("fail") {
            return Err(GraphError::CompileFailed {
                node: Some(ctx.node()),
                reason: "requested failure".into(),
            });
        }
        ctx.output(0, ImageHandle::from_raw(4), ResourceLifetime::Persistent)?;
        Ok(())
    }

    fn execute(&mut self, _ctx: &mut ExecuteContext) -> Result<()> {
        Ok(())
    }
}

/// Consumer with a dependency-role input, for role-mismatch checks.
pub struct DependencySink;

impl RenderNode for DependencySink {
    fn type_name(&self) -> &'static str {
        "dependency_sink"
    }

    fn signature(&self) -> Result<NodeSignature> {
        NodeSignature::new(
            vec![SlotDescriptor::input(
                0,
                "input",
                TypeTag::scalar(BaseType::Image),
            )
            .with_role(vixen_core::SlotRole::Dependency)
            .with_nullability(vixen_core::slot::Nullability::Optional)],
            vec![],
        )
    }

    fn compile(&mut self, _ctx: &mut CompileContext) -> Result<()> {
        Ok(())
    }

    fn execute(&mut self, _ctx: &mut ExecuteContext) -> Result<()> {
        Ok(())
    }
}

/// Fails its execute with a device loss, once.
pub struct FaultyNode {
    pub fail_once: bool,
}

impl RenderNode for FaultyNode {
    fn type_name(&self) -> &'static str {
        "faulty"
    }

    fn signature(&self) -> Result<NodeSignature> {
        NodeSignature::new(
            vec![],
            vec![SlotDescriptor::output(
                0,
                "image",
                TypeTag::scalar(BaseType::Image),
            )],
        )
    }

    fn device_override(&self) -> Option<vixen_core::DeviceMask> {
        Some(vixen_core::DeviceMask::DEVICE_1)
    }

    fn compile(&mut self, ctx: &mut CompileContext) -> Result<()> {
        ctx.output(0, ImageHandle::from_raw(7), ResourceLifetime::Persistent)?;
        Ok(())
    }

    fn execute(&mut self, _ctx: &mut ExecuteContext) -> Result<()> {
        if self.fail_once {
            self.fail_once = false;
            return Err(GraphError::DeviceLost {
                device: DeviceId(1),
            });
        }
        Ok(())
    }
}
