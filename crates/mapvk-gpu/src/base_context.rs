//! Per-frame rendering and presentation state machine.
//!
//! A frame moves through `Idle -> Acquiring -> Recording -> Submitted ->
//! Presenting -> Idle`. [`BaseContext::begin_rendering`] waits for the slot's
//! previous submission, recycles everything that submission kept alive and
//! acquires a swapchain image. Transient presentation failures skip the
//! frame instead of surfacing an error.

use crate::attachment::AttachmentImage;
use crate::capabilities::GpuCapabilities;
use crate::command::{CommandPool, FrameCommandBuffers};
use crate::config::ContextConfig;
use crate::descriptors::ParamDescriptor;
use crate::device::VulkanDevice;
use crate::error::{GpuError, Result};
use crate::framebuffer::{
    create_framebuffer, AttachmentDesc, AttachmentsOperations, ClearBits, FramebufferCache,
    FramebufferData, FramebufferId, OffscreenFramebuffer, RenderPassDesc,
};
use crate::object::{ObjectManager, ThreadType, VulkanObject};
use crate::pipeline::{
    BindingInfo, PipelineCache, PipelineKey, ProgramLayout, StencilAction, StencilFace,
    TestFunction,
};
use crate::sampler::SamplerKey;
use crate::staging::StagingBuffer;
use crate::swapchain::{SurfaceDescription, Swapchain};
use crate::sync::FrameSyncSet;
use crate::MAX_INFLIGHT_FRAMES;
use ash::vk;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Points in the frame at which registered handlers run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerType {
    /// Before the frame is submitted.
    PrePresent = 0,
    /// After the slot's previous submission completed.
    PostPresent = 1,
    /// After a new frame was assigned to a slot.
    UpdateInflightFrame = 2,
}

impl HandlerType {
    const COUNT: usize = 3;
}

/// Callback receiving the in-flight slot index.
pub type ContextHandler = Box<dyn FnMut(usize) + Send>;

/// Where the context is in its frame cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Acquiring,
    Recording,
    Submitted,
    Presenting,
}

/// Owns the swapchain, the per-slot command buffers, synchronization and
/// staging buffers, and the render pass cache, and drives frames through
/// them.
pub struct BaseContext {
    device: Arc<dyn VulkanDevice>,
    capabilities: GpuCapabilities,
    config: ContextConfig,
    object_manager: Arc<ObjectManager>,
    queue: vk::Queue,

    command_pool: CommandPool,
    command_buffers: Vec<FrameCommandBuffers>,
    sync: Option<FrameSyncSet>,
    staging_buffers: Vec<StagingBuffer>,

    surface: Option<SurfaceDescription>,
    swapchain: Option<Swapchain>,
    depth_texture: Option<AttachmentImage>,

    framebuffers_data: FramebufferCache,
    offscreen_framebuffers: BTreeMap<FramebufferId, OffscreenFramebuffer>,
    next_framebuffer_id: u32,
    current_framebuffer: Option<FramebufferId>,

    pipeline_cache: Option<Box<dyn PipelineCache>>,
    pipeline_key: PipelineKey,
    param_descriptors: Vec<ParamDescriptor>,
    stencil_reference: u32,
    clear_color: [f32; 4],
    clear_bits: ClearBits,
    store_bits: ClearBits,

    handlers: [Vec<(u32, ContextHandler)>; HandlerType::COUNT],
    next_handler_id: u32,

    state: FrameState,
    inflight_frame_index: usize,
    generation: u64,
    image_index: u32,
    is_active_render_pass: bool,
    present_available: bool,
    need_present: bool,
}

impl BaseContext {
    /// Create the context on the calling thread, which becomes the frontend
    /// thread of the object manager.
    pub fn new(
        device: Arc<dyn VulkanDevice>,
        capabilities: GpuCapabilities,
        queue: vk::Queue,
        queue_family_index: u32,
        config: ContextConfig,
    ) -> Result<Self> {
        let object_manager = Arc::new(ObjectManager::new(
            device.clone(),
            &capabilities,
            &config,
        ));
        object_manager.register_thread(ThreadType::Frontend);

        let command_pool = CommandPool::new(device.as_ref(), queue_family_index)?;
        let mut staging_buffers = Vec::with_capacity(MAX_INFLIGHT_FRAMES);
        for _ in 0..MAX_INFLIGHT_FRAMES {
            match StagingBuffer::new(object_manager.clone(), config.staging_buffer_size) {
                Ok(buffer) => staging_buffers.push(buffer),
                Err(e) => {
                    drop(staging_buffers);
                    command_pool.destroy(device.as_ref());
                    return Err(e);
                }
            }
        }

        tracing::info!(
            renderer = capabilities.renderer_name(),
            version = %capabilities.renderer_version(),
            "Created frame context"
        );

        Ok(Self {
            device,
            capabilities,
            config,
            object_manager,
            queue,
            command_pool,
            command_buffers: Vec::new(),
            sync: None,
            staging_buffers,
            surface: None,
            swapchain: None,
            depth_texture: None,
            framebuffers_data: FramebufferCache::new(),
            offscreen_framebuffers: BTreeMap::new(),
            next_framebuffer_id: 0,
            current_framebuffer: None,
            pipeline_cache: None,
            pipeline_key: PipelineKey::default(),
            param_descriptors: Vec::new(),
            stencil_reference: 1,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            clear_bits: ClearBits::empty(),
            store_bits: ClearBits::empty(),
            handlers: Default::default(),
            next_handler_id: 0,
            state: FrameState::Idle,
            inflight_frame_index: 0,
            generation: 0,
            image_index: 0,
            is_active_render_pass: false,
            present_available: true,
            need_present: true,
        })
    }

    pub fn renderer_name(&self) -> &str {
        self.capabilities.renderer_name()
    }

    pub fn renderer_version(&self) -> String {
        self.capabilities.renderer_version()
    }

    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn object_manager(&self) -> &Arc<ObjectManager> {
        &self.object_manager
    }

    pub fn frame_state(&self) -> FrameState {
        self.state
    }

    pub fn inflight_frame_index(&self) -> usize {
        self.inflight_frame_index
    }

    /// Swapchain image acquired for the current frame.
    pub fn image_index(&self) -> u32 {
        self.image_index
    }

    pub fn is_render_pass_active(&self) -> bool {
        self.is_active_render_pass
    }

    /// Extent of the surface, and of every render target.
    pub fn extent(&self) -> vk::Extent2D {
        self.surface
            .as_ref()
            .map_or_else(vk::Extent2D::default, |s| s.capabilities.current_extent)
    }

    pub fn swapchain(&self) -> Option<&Swapchain> {
        self.swapchain.as_ref()
    }

    /// Install the renderer's pipeline cache.
    pub fn set_pipeline_cache(&mut self, cache: Box<dyn PipelineCache>) {
        if let Some(mut old) = self.pipeline_cache.replace(cache) {
            old.destroy();
        }
    }

    /// When unavailable, [`begin_rendering`](Self::begin_rendering) skips
    /// every frame.
    pub fn set_present_available(&mut self, available: bool) {
        self.present_available = available;
    }

    // Surface and swapchain.

    /// Attach a surface and build the swapchain and its dependencies.
    pub fn set_surface(&mut self, surface: SurfaceDescription) -> Result<()> {
        if self.sync.is_some() {
            self.device.device_wait_idle()?;
        }
        self.surface = Some(surface);
        self.create_sync_primitives()?;
        self.recreate_swapchain_and_dependencies()
    }

    /// Detach the surface, releasing everything built on it.
    pub fn reset_surface(&mut self, allow_pipeline_dump: bool) -> Result<()> {
        self.device.device_wait_idle()?;
        self.destroy_sync_primitives();
        self.reset_swapchain_and_dependencies()?;
        self.surface = None;

        if allow_pipeline_dump {
            if let Some(cache) = self.pipeline_cache.as_mut() {
                cache.dump();
            }
        }
        tracing::info!("Surface reset");
        Ok(())
    }

    /// Rebuild the swapchain at a new extent. Nothing happens if the extent
    /// is unchanged and a swapchain exists.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        let extent = vk::Extent2D { width, height };
        let Some(surface) = self.surface.as_mut() else {
            return Err(GpuError::InvalidState(
                "Cannot resize without a surface".into(),
            ));
        };
        if self.swapchain.is_some() && surface.capabilities.current_extent == extent {
            return Ok(());
        }
        surface.capabilities.current_extent = extent;
        tracing::debug!(width, height, "Resizing swapchain");
        self.recreate_swapchain_and_dependencies()
    }

    fn recreate_swapchain_and_dependencies(&mut self) -> Result<()> {
        self.device.device_wait_idle()?;
        self.reset_swapchain_and_dependencies()?;
        self.create_command_buffers()?;
        self.recreate_depth_texture()?;
        self.recreate_swapchain()?;
        self.device.device_wait_idle()?;
        Ok(())
    }

    fn reset_swapchain_and_dependencies(&mut self) -> Result<()> {
        self.destroy_render_passes_and_framebuffers()?;
        self.depth_texture = None;
        self.destroy_command_buffers();
        self.destroy_swapchain();
        Ok(())
    }

    fn recreate_swapchain(&mut self) -> Result<()> {
        let surface = self
            .surface
            .ok_or_else(|| GpuError::InvalidState("No surface to build a swapchain on".into()))?;
        self.destroy_swapchain();
        self.swapchain = Some(Swapchain::new(self.device.as_ref(), &surface, None)?);
        Ok(())
    }

    fn destroy_swapchain(&mut self) {
        if let Some(swapchain) = self.swapchain.take() {
            swapchain.destroy(self.device.as_ref());
        }
    }

    fn recreate_depth_texture(&mut self) -> Result<()> {
        self.depth_texture = None;
        self.depth_texture = Some(AttachmentImage::depth_stencil(
            self.object_manager.clone(),
            self.config.depth_format,
            self.extent(),
        )?);
        Ok(())
    }

    fn create_command_buffers(&mut self) -> Result<()> {
        for _ in 0..MAX_INFLIGHT_FRAMES {
            let buffers = FrameCommandBuffers::allocate(self.device.as_ref(), &self.command_pool)?;
            self.command_buffers.push(buffers);
        }
        Ok(())
    }

    fn destroy_command_buffers(&mut self) {
        for buffers in self.command_buffers.drain(..) {
            buffers.free(self.device.as_ref(), &self.command_pool);
        }
    }

    fn create_sync_primitives(&mut self) -> Result<()> {
        self.destroy_sync_primitives();
        self.sync = Some(FrameSyncSet::new(self.device.as_ref())?);
        Ok(())
    }

    fn destroy_sync_primitives(&mut self) {
        if let Some(sync) = self.sync.take() {
            sync.destroy(self.device.as_ref());
        }
    }

    fn recreate_sync_primitives(&mut self) -> Result<()> {
        self.destroy_sync_primitives();
        self.create_sync_primitives()
    }

    // Frame cycle.

    /// Start a frame. Returns `false` when the frame must be skipped.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn begin_rendering(&mut self) -> Result<bool> {
        assert_eq!(
            self.state,
            FrameState::Idle,
            "begin_rendering called in the middle of a frame"
        );
        if !self.present_available {
            return Ok(false);
        }
        let (Some(sync), Some(swapchain)) = (self.sync.as_ref(), self.swapchain.as_ref()) else {
            return Ok(false);
        };
        let slot = self.inflight_frame_index;
        let frame = *sync.get(slot);
        let swapchain = swapchain.swapchain;

        match self
            .device
            .wait_for_fence(frame.in_flight, self.config.fence_timeout_ns())
        {
            Ok(()) | Err(vk::Result::ERROR_DEVICE_LOST) => {}
            Err(vk::Result::TIMEOUT) => {
                tracing::warn!(slot, "In-flight fence wait timed out, skipping frame");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }
        self.device.reset_fence(frame.in_flight)?;
        self.state = FrameState::Acquiring;

        // Everything the slot's previous submission used is free now.
        self.run_handlers(HandlerType::PostPresent, slot);
        self.staging_buffers[slot].reset();
        self.object_manager.collect_descriptor_set_groups(slot)?;
        self.object_manager.collect_objects(slot);

        self.generation += 1;

        match self
            .device
            .acquire_next_image(swapchain, u64::MAX, frame.image_acquired)
        {
            Ok((index, false)) => self.image_index = index,
            Ok((_, true)) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                tracing::debug!(slot, "Swapchain out of date, skipping frame");
                self.state = FrameState::Idle;
                self.recreate_swapchain_and_dependencies()?;
                self.recreate_sync_primitives()?;
                return Ok(false);
            }
            Err(e @ (vk::Result::TIMEOUT | vk::Result::ERROR_SURFACE_LOST_KHR)) => {
                tracing::debug!(slot, "Image acquisition failed ({e}), skipping frame");
                self.state = FrameState::Idle;
                self.device.device_wait_idle()?;
                self.recreate_sync_primitives()?;
                return Ok(false);
            }
            Err(e) => {
                self.state = FrameState::Idle;
                return Err(e.into());
            }
        }

        self.object_manager
            .set_current_inflight_frame(slot, self.generation);
        self.run_handlers(HandlerType::UpdateInflightFrame, slot);

        self.command_buffers[slot].begin(self.device.as_ref())?;
        self.state = FrameState::Recording;
        Ok(true)
    }

    /// Finish recording and submit the frame.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn end_rendering(&mut self) -> Result<()> {
        assert_eq!(
            self.state,
            FrameState::Recording,
            "end_rendering called outside of a frame"
        );
        let slot = self.inflight_frame_index;

        // Uploads must be visible before the copies execute.
        self.staging_buffers[slot].flush()?;
        self.run_handlers(HandlerType::PrePresent, slot);

        assert!(self.is_active_render_pass, "No active render pass to end");
        self.is_active_render_pass = false;
        let buffers = &self.command_buffers[slot];
        self.device.cmd_end_render_pass(buffers.rendering);
        buffers.end(self.device.as_ref())?;

        let sync = self
            .sync
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("No sync primitives".into()))?;
        let frame = sync.get(slot);
        let result = self.device.queue_submit(
            self.queue,
            &buffers.submission_order(),
            &[frame.image_acquired],
            &[vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
            &[frame.render_finished],
            frame.in_flight,
        );
        match result {
            Ok(()) => self.need_present = true,
            Err(vk::Result::ERROR_DEVICE_LOST) => {
                tracing::warn!(slot, "Device lost on submit, frame will not be presented");
                self.need_present = false;
            }
            Err(e) => return Err(e.into()),
        }
        self.state = FrameState::Submitted;
        Ok(())
    }

    /// Present the submitted frame and move to the next slot.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn present(&mut self) -> Result<()> {
        assert_eq!(
            self.state,
            FrameState::Submitted,
            "present called before end_rendering"
        );
        self.state = FrameState::Presenting;
        let slot = self.inflight_frame_index;

        let mut result = Ok(());
        if self.need_present {
            if let (Some(swapchain), Some(sync)) = (self.swapchain.as_ref(), self.sync.as_ref()) {
                match self.device.queue_present(
                    self.queue,
                    swapchain.swapchain,
                    self.image_index,
                    sync.get(slot).render_finished,
                ) {
                    Ok(_) => {}
                    Err(
                        e @ (vk::Result::ERROR_OUT_OF_DATE_KHR
                        | vk::Result::ERROR_SURFACE_LOST_KHR
                        | vk::Result::ERROR_DEVICE_LOST),
                    ) => {
                        tracing::debug!(slot, "Present failed ({e})");
                    }
                    Err(e) => result = Err(e.into()),
                }
            }
        }

        // The slot advances even when presentation failed.
        self.inflight_frame_index = (slot + 1) % MAX_INFLIGHT_FRAMES;
        self.pipeline_key = PipelineKey::default();
        self.stencil_reference = 1;
        self.clear_param_descriptors();
        self.state = FrameState::Idle;
        result
    }

    // Handlers.

    /// Register a callback; ids start at 1.
    pub fn register_handler(
        &mut self,
        handler_type: HandlerType,
        handler: impl FnMut(usize) + Send + 'static,
    ) -> u32 {
        assert!(self.next_handler_id < u32::MAX, "Handler ids exhausted");
        self.next_handler_id += 1;
        let id = self.next_handler_id;
        self.handlers[handler_type as usize].push((id, Box::new(handler)));
        id
    }

    pub fn unregister_handler(&mut self, id: u32) {
        for handlers in &mut self.handlers {
            handlers.retain(|(handler_id, _)| *handler_id != id);
        }
    }

    fn run_handlers(&mut self, handler_type: HandlerType, slot: usize) {
        for (_, handler) in &mut self.handlers[handler_type as usize] {
            handler(slot);
        }
    }

    // Render targets.

    /// Register an offscreen render target. Its images are created at the
    /// surface extent the first time it is applied.
    pub fn create_offscreen_framebuffer(
        &mut self,
        color_format: vk::Format,
        depth_format: Option<vk::Format>,
    ) -> FramebufferId {
        let id = FramebufferId(self.next_framebuffer_id);
        self.next_framebuffer_id += 1;
        self.offscreen_framebuffers
            .insert(id, OffscreenFramebuffer::new(color_format, depth_format));
        id
    }

    pub fn offscreen_framebuffer(&self, id: FramebufferId) -> Option<&OffscreenFramebuffer> {
        self.offscreen_framebuffers.get(&id)
    }

    /// Forget and release an offscreen render target.
    pub fn destroy_offscreen_framebuffer(&mut self, id: FramebufferId) -> Result<()> {
        assert_ne!(
            self.current_framebuffer,
            Some(id),
            "Cannot destroy the bound framebuffer"
        );
        self.forget_framebuffer(Some(id))?;
        self.offscreen_framebuffers.remove(&id);
        Ok(())
    }

    /// Select the render target of the following passes; `None` is the
    /// swapchain. Ends the active render pass.
    pub fn set_framebuffer(&mut self, framebuffer: Option<FramebufferId>) {
        if let Some(id) = framebuffer {
            assert!(
                self.offscreen_framebuffers.contains_key(&id),
                "Unknown framebuffer {id:?}"
            );
        }

        if self.is_active_render_pass {
            let command_buffer = self.current_rendering_command_buffer();
            self.device.cmd_end_render_pass(command_buffer);
            self.is_active_render_pass = false;

            // The finished target can be sampled by the next pass.
            if let Some(color) = self
                .current_framebuffer
                .and_then(|id| self.offscreen_framebuffers.get_mut(&id))
                .and_then(|fb| fb.color.as_mut())
            {
                color.make_layout_transition(
                    self.device.as_ref(),
                    command_buffer,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                    vk::PipelineStageFlags::FRAGMENT_SHADER,
                );
            }
        }

        self.current_framebuffer = framebuffer;
    }

    /// Drop the cached render pass and framebuffers of a target.
    pub fn forget_framebuffer(&mut self, framebuffer: Option<FramebufferId>) -> Result<()> {
        if !self.framebuffers_data.contains_key(&framebuffer) {
            return Ok(());
        }
        self.device.device_wait_idle()?;
        self.destroy_render_pass_and_framebuffer(framebuffer);
        Ok(())
    }

    /// Begin a render pass on the current target.
    pub fn apply_framebuffer(&mut self, label: &str) -> Result<()> {
        assert_eq!(
            self.state,
            FrameState::Recording,
            "apply_framebuffer called outside of a frame"
        );
        let command_buffer = self.current_rendering_command_buffer();
        self.device
            .cmd_set_stencil_reference(command_buffer, self.stencil_reference);

        let key = self.current_framebuffer;
        let mut operations = AttachmentsOperations::from_bits(self.clear_bits, self.store_bits);
        self.clear_bits = ClearBits::empty();
        self.store_bits = ClearBits::empty();
        if key.is_none() {
            operations = operations.for_swapchain();
        }
        let packed = operations.pack();

        if self
            .framebuffers_data
            .get(&key)
            .is_some_and(|data| data.packed_operations != packed)
        {
            self.device.device_wait_idle()?;
            self.destroy_render_pass_and_framebuffer(key);
        }

        if !self.framebuffers_data.contains_key(&key) {
            let render_pass = self.render_pass_desc(key, operations)?.create(self.device.as_ref())?;
            tracing::debug!(label, packed, "Created render pass");
            self.framebuffers_data.insert(
                key,
                FramebufferData {
                    render_pass,
                    framebuffers: Vec::new(),
                    packed_operations: packed,
                },
            );
        }

        let extent = self.extent();
        let (render_pass, has_framebuffers) = self
            .framebuffers_data
            .get(&key)
            .map_or((vk::RenderPass::null(), false), |data| {
                (data.render_pass, !data.framebuffers.is_empty())
            });
        if !has_framebuffers {
            let framebuffers = self.create_framebuffers(key, render_pass, extent)?;
            tracing::debug!(label, count = framebuffers.len(), "Created framebuffers");
            if let Some(data) = self.framebuffers_data.get_mut(&key) {
                data.framebuffers = framebuffers;
            }
        }

        self.transition_attachments(key, command_buffer)?;
        self.pipeline_key.render_pass = render_pass;

        let framebuffer_index = if key.is_none() {
            self.image_index as usize
        } else {
            0
        };
        let framebuffer = self
            .framebuffers_data
            .get(&key)
            .and_then(|data| data.framebuffers.get(framebuffer_index).copied())
            .ok_or_else(|| GpuError::InvalidState(format!("No framebuffer for {label}")))?;

        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.clear_color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent,
            })
            .clear_values(&clear_values);

        self.is_active_render_pass = true;
        self.device.cmd_begin_render_pass(command_buffer, &begin_info);
        Ok(())
    }

    fn render_pass_desc(
        &self,
        key: Option<FramebufferId>,
        operations: AttachmentsOperations,
    ) -> Result<RenderPassDesc> {
        match key {
            None => {
                let surface = self
                    .surface
                    .as_ref()
                    .ok_or_else(|| GpuError::InvalidState("No surface".into()))?;
                Ok(RenderPassDesc {
                    operations,
                    color: AttachmentDesc {
                        format: surface.format.format,
                        initial_layout: vk::ImageLayout::UNDEFINED,
                        final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
                    },
                    depth: Some(AttachmentDesc {
                        format: self.config.depth_format,
                        initial_layout: vk::ImageLayout::UNDEFINED,
                        final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                    }),
                })
            }
            // Offscreen attachments are transitioned before the pass begins,
            // so their contents survive a LOAD.
            Some(id) => {
                let framebuffer = self.offscreen_framebuffer_ref(id)?;
                Ok(RenderPassDesc {
                    operations,
                    color: AttachmentDesc {
                        format: framebuffer.color_format(),
                        initial_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                        final_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    },
                    depth: framebuffer.depth_format().map(|format| AttachmentDesc {
                        format,
                        initial_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                        final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                    }),
                })
            }
        }
    }

    fn offscreen_framebuffer_ref(&self, id: FramebufferId) -> Result<&OffscreenFramebuffer> {
        self.offscreen_framebuffers
            .get(&id)
            .ok_or_else(|| GpuError::InvalidState(format!("Unknown framebuffer {id:?}")))
    }

    fn create_framebuffers(
        &mut self,
        key: Option<FramebufferId>,
        render_pass: vk::RenderPass,
        extent: vk::Extent2D,
    ) -> Result<Vec<vk::Framebuffer>> {
        let device = self.device.as_ref();
        match key {
            None => {
                let swapchain = self
                    .swapchain
                    .as_ref()
                    .ok_or_else(|| GpuError::InvalidState("No swapchain".into()))?;
                // The depth attachment is shared by every swapchain framebuffer.
                let depth_view = self
                    .depth_texture
                    .as_ref()
                    .map(AttachmentImage::image_view)
                    .ok_or_else(|| GpuError::InvalidState("No depth texture".into()))?;

                let mut framebuffers = Vec::with_capacity(swapchain.image_views.len());
                for &view in &swapchain.image_views {
                    match create_framebuffer(device, render_pass, &[view, depth_view], extent) {
                        Ok(framebuffer) => framebuffers.push(framebuffer),
                        Err(e) => {
                            for framebuffer in framebuffers {
                                device.destroy_framebuffer(framebuffer);
                            }
                            return Err(e);
                        }
                    }
                }
                Ok(framebuffers)
            }
            Some(id) => {
                let framebuffer = self
                    .offscreen_framebuffers
                    .get_mut(&id)
                    .ok_or_else(|| GpuError::InvalidState(format!("Unknown framebuffer {id:?}")))?;
                framebuffer.set_size(&self.object_manager, extent)?;
                let views = framebuffer.attachment_views();
                Ok(vec![create_framebuffer(device, render_pass, &views, extent)?])
            }
        }
    }

    fn transition_attachments(
        &mut self,
        key: Option<FramebufferId>,
        command_buffer: vk::CommandBuffer,
    ) -> Result<()> {
        let device = self.device.as_ref();
        let depth_src = vk::PipelineStageFlags::LATE_FRAGMENT_TESTS
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
        let depth_dst =
            vk::PipelineStageFlags::TOP_OF_PIPE | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;

        let depth = match key {
            Some(id) => {
                let framebuffer = self
                    .offscreen_framebuffers
                    .get_mut(&id)
                    .ok_or_else(|| GpuError::InvalidState(format!("Unknown framebuffer {id:?}")))?;
                if let Some(color) = framebuffer.color.as_mut() {
                    color.make_layout_transition(
                        device,
                        command_buffer,
                        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                        vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                        vk::PipelineStageFlags::FRAGMENT_SHADER,
                    );
                }
                framebuffer.depth.as_mut()
            }
            None => {
                let image = self
                    .swapchain
                    .as_ref()
                    .and_then(|s| s.images.get(self.image_index as usize).copied())
                    .ok_or_else(|| GpuError::InvalidState("No acquired swapchain image".into()))?;
                let barrier = vk::ImageMemoryBarrier::default()
                    .src_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
                    .dst_access_mask(
                        vk::AccessFlags::SHADER_READ | vk::AccessFlags::INPUT_ATTACHMENT_READ,
                    )
                    .old_layout(vk::ImageLayout::UNDEFINED)
                    .new_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(image)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: vk::REMAINING_MIP_LEVELS,
                        base_array_layer: 0,
                        layer_count: vk::REMAINING_ARRAY_LAYERS,
                    });
                device.cmd_pipeline_barrier(
                    command_buffer,
                    vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                    vk::PipelineStageFlags::FRAGMENT_SHADER,
                    &[],
                    std::slice::from_ref(&barrier),
                );
                self.depth_texture.as_mut()
            }
        };

        if let Some(depth) = depth {
            depth.make_layout_transition(
                device,
                command_buffer,
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                depth_src,
                depth_dst,
            );
        }
        Ok(())
    }

    fn destroy_render_pass_and_framebuffer(&mut self, key: Option<FramebufferId>) {
        let Some(data) = self.framebuffers_data.remove(&key) else {
            return;
        };
        if data.render_pass != vk::RenderPass::null() {
            if let Some(cache) = self.pipeline_cache.as_mut() {
                cache.reset_cache_for_render_pass(data.render_pass);
            }
        }
        data.destroy(self.device.as_ref());
    }

    fn destroy_render_passes_and_framebuffers(&mut self) -> Result<()> {
        self.reset_pipeline_cache()?;
        for (_, data) in self.framebuffers_data.drain() {
            data.destroy(self.device.as_ref());
        }
        Ok(())
    }

    /// Wait for the device and drop every cached pipeline.
    pub fn reset_pipeline_cache(&mut self) -> Result<()> {
        self.device.device_wait_idle()?;
        if let Some(cache) = self.pipeline_cache.as_mut() {
            cache.reset_cache();
        }
        Ok(())
    }

    // Clearing and dynamic state.

    pub fn set_clear_color(&mut self, color: [f32; 4]) {
        self.clear_color = color;
    }

    /// Clear attachments now if a render pass is active, otherwise fold the
    /// request into the load/store operations of the next render pass.
    pub fn clear(&mut self, clear_bits: ClearBits, store_bits: ClearBits) {
        if !self.is_active_render_pass {
            self.clear_bits |= clear_bits;
            self.store_bits |= store_bits;
            return;
        }

        let mut attachments = Vec::with_capacity(2);
        if clear_bits.contains(ClearBits::COLOR) {
            attachments.push(vk::ClearAttachment {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                color_attachment: 0,
                clear_value: vk::ClearValue {
                    color: vk::ClearColorValue {
                        float32: self.clear_color,
                    },
                },
            });
        }
        if clear_bits.intersects(ClearBits::DEPTH | ClearBits::STENCIL) {
            let mut aspect_mask = vk::ImageAspectFlags::empty();
            if clear_bits.contains(ClearBits::DEPTH) {
                aspect_mask |= vk::ImageAspectFlags::DEPTH;
            }
            if clear_bits.contains(ClearBits::STENCIL) {
                aspect_mask |= vk::ImageAspectFlags::STENCIL;
            }
            attachments.push(vk::ClearAttachment {
                aspect_mask,
                color_attachment: 0,
                clear_value: vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: 1.0,
                        stencil: 0,
                    },
                },
            });
        }
        if attachments.is_empty() {
            return;
        }

        let rect = vk::ClearRect {
            rect: vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: self.extent(),
            },
            base_array_layer: 0,
            layer_count: 1,
        };
        self.device
            .cmd_clear_attachments(self.current_rendering_command_buffer(), &attachments, &rect);
    }

    /// Set the viewport and a matching scissor.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_viewport(&mut self, x: u32, y: u32, width: u32, height: u32) {
        let viewport = vk::Viewport {
            x: x as f32,
            y: y as f32,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        self.device
            .cmd_set_viewport(self.current_rendering_command_buffer(), &viewport);
        self.set_scissor(x, y, width, height);
    }

    #[allow(clippy::cast_possible_wrap)]
    pub fn set_scissor(&mut self, x: u32, y: u32, width: u32, height: u32) {
        let scissor = vk::Rect2D {
            offset: vk::Offset2D {
                x: x as i32,
                y: y as i32,
            },
            extent: vk::Extent2D { width, height },
        };
        self.device
            .cmd_set_scissor(self.current_rendering_command_buffer(), &scissor);
    }

    // Pipeline state.

    pub fn set_depth_test_enabled(&mut self, enabled: bool) {
        self.pipeline_key.depth_stencil.set_depth_test_enabled(enabled);
    }

    pub fn set_depth_test_function(&mut self, function: TestFunction) {
        self.pipeline_key.depth_stencil.set_depth_test_function(function);
    }

    pub fn set_stencil_test_enabled(&mut self, enabled: bool) {
        self.pipeline_key.depth_stencil.set_stencil_test_enabled(enabled);
    }

    pub fn set_stencil_function(&mut self, face: StencilFace, function: TestFunction) {
        self.pipeline_key
            .depth_stencil
            .set_stencil_function(face, function);
    }

    pub fn set_stencil_actions(
        &mut self,
        face: StencilFace,
        stencil_fail: StencilAction,
        depth_fail: StencilAction,
        pass: StencilAction,
    ) {
        self.pipeline_key
            .depth_stencil
            .set_stencil_actions(face, stencil_fail, depth_fail, pass);
    }

    /// Applied by the next [`apply_framebuffer`](Self::apply_framebuffer).
    pub fn set_stencil_reference_value(&mut self, value: u32) {
        self.stencil_reference = value;
    }

    pub fn set_culling_enabled(&mut self, enabled: bool) {
        self.pipeline_key.culling_enabled = enabled;
    }

    pub fn set_primitive_topology(&mut self, topology: vk::PrimitiveTopology) {
        self.pipeline_key.primitive_topology = topology;
    }

    pub fn set_binding_info(&mut self, binding_info: Vec<BindingInfo>) {
        self.pipeline_key.binding_info = binding_info;
    }

    pub fn set_program(&mut self, program: ProgramLayout) {
        self.pipeline_key.program = Some(program);
    }

    pub fn set_blending_enabled(&mut self, enabled: bool) {
        self.pipeline_key.blending_enabled = enabled;
    }

    pub fn pipeline_key(&self) -> &PipelineKey {
        &self.pipeline_key
    }

    /// Pipeline matching the current state.
    pub fn current_pipeline(&mut self) -> Result<vk::Pipeline> {
        let cache = self
            .pipeline_cache
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("No pipeline cache installed".into()))?;
        cache.get_pipeline(&self.pipeline_key)
    }

    /// # Panics
    /// If no program is set.
    pub fn current_pipeline_layout(&self) -> vk::PipelineLayout {
        self.pipeline_key
            .program
            .as_ref()
            .map(|program| program.pipeline_layout)
            .unwrap_or_else(|| panic!("No program is set"))
    }

    // Program parameters.

    /// Bind a parameter for the next draw. A dynamic uniform buffer replaces
    /// the one already bound.
    pub fn apply_param_descriptor(&mut self, descriptor: ParamDescriptor) {
        if descriptor.is_dynamic_uniform_buffer() {
            if let Some(bound) = self
                .param_descriptors
                .iter_mut()
                .find(|d| d.is_dynamic_uniform_buffer())
            {
                *bound = descriptor;
                return;
            }
        }
        self.param_descriptors.push(descriptor);
    }

    pub fn clear_param_descriptors(&mut self) {
        self.param_descriptors.clear();
    }

    /// # Panics
    /// If no program or no parameters are set.
    pub fn current_param_descriptors(&self) -> &[ParamDescriptor] {
        assert!(self.pipeline_key.program.is_some(), "No program is set");
        assert!(
            !self.param_descriptors.is_empty(),
            "Shader parameters are not set"
        );
        &self.param_descriptors
    }

    /// # Panics
    /// If no dynamic uniform buffer is bound.
    pub fn current_dynamic_buffer_offset(&self) -> u32 {
        self.param_descriptors
            .iter()
            .find_map(|d| match *d {
                ParamDescriptor::DynamicUniformBuffer { dynamic_offset, .. } => {
                    Some(dynamic_offset)
                }
                ParamDescriptor::Texture { .. } => None,
            })
            .unwrap_or_else(|| panic!("Shader parameters are not set"))
    }

    pub fn get_sampler(&self, key: SamplerKey) -> Result<vk::Sampler> {
        self.object_manager.get_sampler(key)
    }

    // Per-slot resources.

    pub fn current_memory_command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffers
            .get(self.inflight_frame_index)
            .map_or(vk::CommandBuffer::null(), |buffers| buffers.memory)
    }

    pub fn current_rendering_command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffers
            .get(self.inflight_frame_index)
            .map_or(vk::CommandBuffer::null(), |buffers| buffers.rendering)
    }

    pub fn default_staging_buffer(&mut self) -> &mut StagingBuffer {
        &mut self.staging_buffers[self.inflight_frame_index]
    }

    /// Copy `bytes` into `dst` at `dst_offset` as part of the current frame.
    ///
    /// The data goes through the slot's staging buffer, or through a
    /// temporary one when it does not fit. The copy is recorded into the
    /// memory command buffer and followed by a barrier making it visible to
    /// vertex input and shaders.
    pub fn upload_buffer_data(
        &mut self,
        dst: &VulkanObject,
        dst_offset: vk::DeviceSize,
        bytes: &[u8],
    ) -> Result<()> {
        assert_eq!(
            self.state,
            FrameState::Recording,
            "Uploads must be recorded inside a frame"
        );
        if bytes.is_empty() {
            return Ok(());
        }
        let size = u32::try_from(bytes.len())
            .map_err(|_| GpuError::Other(format!("Upload of {} bytes is too large", bytes.len())))?;
        let command_buffer = self.current_memory_command_buffer();

        let staging = &mut self.staging_buffers[self.inflight_frame_index];
        let (src, src_offset) = if staging.has_enough_space(size) {
            let data = staging.reserve(size);
            staging.write(&data, bytes);
            (data.staging_buffer, data.offset)
        } else {
            tracing::debug!(
                size = %crate::pretty::PrettySize(u64::from(size)),
                "Upload does not fit the staging buffer, using a temporary one"
            );
            // Released through the deferred path, so the buffer outlives the
            // submission of this frame.
            let mut temporary = StagingBuffer::new(self.object_manager.clone(), size)?;
            let data = temporary.reserve(size);
            temporary.write(&data, bytes);
            temporary.flush()?;
            (data.staging_buffer, data.offset)
        };

        let size = vk::DeviceSize::from(size);
        self.device.cmd_copy_buffer(
            command_buffer,
            src,
            dst.buffer,
            &[vk::BufferCopy {
                src_offset: vk::DeviceSize::from(src_offset),
                dst_offset,
                size,
            }],
        );

        let barrier = vk::BufferMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(
                vk::AccessFlags::VERTEX_ATTRIBUTE_READ
                    | vk::AccessFlags::INDEX_READ
                    | vk::AccessFlags::UNIFORM_READ,
            )
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(dst.buffer)
            .offset(dst_offset)
            .size(size);
        self.device.cmd_pipeline_barrier(
            command_buffer,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::VERTEX_INPUT
                | vk::PipelineStageFlags::VERTEX_SHADER
                | vk::PipelineStageFlags::FRAGMENT_SHADER,
            std::slice::from_ref(&barrier),
            &[],
        );
        Ok(())
    }

    /// Typed [`upload_buffer_data`](Self::upload_buffer_data).
    pub fn upload_buffer<T: bytemuck::Pod>(
        &mut self,
        dst: &VulkanObject,
        dst_offset: vk::DeviceSize,
        data: &[T],
    ) -> Result<()> {
        self.upload_buffer_data(dst, dst_offset, bytemuck::cast_slice(data))
    }
}

impl Drop for BaseContext {
    fn drop(&mut self) {
        if let Err(e) = self.device.device_wait_idle() {
            tracing::error!("Failed to wait for device idle: {e}");
        }

        if let Some(mut cache) = self.pipeline_cache.take() {
            cache.destroy();
        }
        self.staging_buffers.clear();

        for (_, data) in self.framebuffers_data.drain() {
            data.destroy(self.device.as_ref());
        }
        self.offscreen_framebuffers.clear();
        self.depth_texture = None;
        self.destroy_swapchain();
        self.destroy_sync_primitives();
        self.destroy_command_buffers();
        self.command_pool.destroy(self.device.as_ref());
        tracing::debug!("Frame context destroyed");
    }
}
