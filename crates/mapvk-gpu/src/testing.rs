//! In-memory [`VulkanDevice`] used by the unit tests.
//!
//! Device memory is backed by host bytes so mapping and buffer copies work,
//! fences are signaled when a submit completes, swapchain results can be
//! scripted, and every interesting call is appended to an ordered log.

use crate::capabilities::GpuCapabilities;
use crate::device::VulkanDevice;
use crate::error::Result;
use crate::pipeline::{PipelineCache, PipelineKey};
use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::ffi::c_char;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub(crate) const BUFFER_ALIGNMENT: vk::DeviceSize = 16;
pub(crate) const IMAGE_ALIGNMENT: vk::DeviceSize = 1024;
pub(crate) const ATOM_SIZE: vk::DeviceSize = 64;
pub(crate) const MAP_ALIGNMENT: usize = 64;
pub(crate) const UNIFORM_ALIGNMENT: vk::DeviceSize = 256;

/// Recorded device call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    AllocateMemory {
        memory: vk::DeviceMemory,
        size: vk::DeviceSize,
        type_index: u32,
    },
    FreeMemory(vk::DeviceMemory),
    MapMemory(vk::DeviceMemory),
    UnmapMemory(vk::DeviceMemory),
    FlushMappedRange(vk::DeviceMemory),
    DestroyBuffer(vk::Buffer),
    DestroyImage(vk::Image),
    DestroyImageView(vk::ImageView),
    CreateSampler(vk::Sampler),
    DestroySampler(vk::Sampler),
    CreateDescriptorPool(vk::DescriptorPool),
    FreeDescriptorSet(vk::DescriptorSet),
    UpdateDescriptorSets(usize),
    CreateFence(vk::Fence),
    DestroyFence(vk::Fence),
    WaitFence(vk::Fence),
    ResetFence(vk::Fence),
    WaitIdle,
    BeginCommandBuffer(vk::CommandBuffer),
    EndCommandBuffer(vk::CommandBuffer),
    Submit {
        command_buffers: Vec<vk::CommandBuffer>,
        fence: vk::Fence,
    },
    CreateRenderPass {
        render_pass: vk::RenderPass,
        attachment_count: u32,
        dependency_count: u32,
        color_load_op: vk::AttachmentLoadOp,
        color_store_op: vk::AttachmentStoreOp,
    },
    DestroyRenderPass(vk::RenderPass),
    CreateFramebuffer {
        framebuffer: vk::Framebuffer,
        width: u32,
        height: u32,
    },
    DestroyFramebuffer(vk::Framebuffer),
    BeginRenderPass {
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
    },
    EndRenderPass,
    PipelineBarrier {
        buffers: usize,
        images: usize,
    },
    SetViewport,
    SetScissor,
    SetStencilReference(u32),
    ClearAttachments(usize),
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        size: vk::DeviceSize,
    },
    CreateSwapchain {
        swapchain: vk::SwapchainKHR,
        width: u32,
        height: u32,
    },
    DestroySwapchain(vk::SwapchainKHR),
    Acquire(vk::Semaphore),
    Present {
        image_index: u32,
    },
}

struct FakeBuffer {
    size: vk::DeviceSize,
    binding: Option<(vk::DeviceMemory, vk::DeviceSize)>,
}

struct PendingCopy {
    src: vk::Buffer,
    dst: vk::Buffer,
    region: vk::BufferCopy,
}

#[derive(Default)]
struct FakeState {
    memory: HashMap<vk::DeviceMemory, Box<[u8]>>,
    buffers: HashMap<vk::Buffer, FakeBuffer>,
    images: HashMap<vk::Image, vk::Extent3D>,
    fences: HashMap<vk::Fence, bool>,
    descriptor_pools: HashMap<vk::DescriptorPool, (u32, u32)>,
    copies: HashMap<vk::CommandBuffer, Vec<PendingCopy>>,
    swapchain_images: HashMap<vk::SwapchainKHR, Vec<vk::Image>>,
    next_image: u32,
    acquire_results: VecDeque<vk::Result>,
    present_results: VecDeque<vk::Result>,
    submit_results: VecDeque<vk::Result>,
    hold_fences: bool,
    calls: Vec<Call>,
}

/// Fake device; see the module docs.
#[derive(Default)]
pub(crate) struct FakeDevice {
    state: Mutex<FakeState>,
    next_handle: AtomicU64,
}

impl FakeDevice {
    fn handle<H: Handle>(&self) -> H {
        H::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn log(&self, call: Call) {
        self.state.lock().calls.push(call);
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub(crate) fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub(crate) fn count_calls(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| predicate(c)).count()
    }

    /// Number of live `vkAllocateMemory` allocations.
    pub(crate) fn live_memory_count(&self) -> usize {
        self.state.lock().memory.len()
    }

    /// Keep fences unsignaled after submits.
    pub(crate) fn set_hold_fences(&self, hold: bool) {
        self.state.lock().hold_fences = hold;
    }

    pub(crate) fn signal_all_fences(&self) {
        for signaled in self.state.lock().fences.values_mut() {
            *signaled = true;
        }
    }

    pub(crate) fn push_acquire_result(&self, result: vk::Result) {
        self.state.lock().acquire_results.push_back(result);
    }

    pub(crate) fn push_present_result(&self, result: vk::Result) {
        self.state.lock().present_results.push_back(result);
    }

    pub(crate) fn push_submit_result(&self, result: vk::Result) {
        self.state.lock().submit_results.push_back(result);
    }

    /// Read bytes from a buffer through its memory binding.
    pub(crate) fn read_buffer(&self, buffer: vk::Buffer, offset: usize, len: usize) -> Vec<u8> {
        let state = self.state.lock();
        let (memory, base) = state.buffers[&buffer]
            .binding
            .expect("buffer has no memory bound");
        let start = base as usize + offset;
        state.memory[&memory][start..start + len].to_vec()
    }

    fn execute_copies(state: &mut FakeState, command_buffer: vk::CommandBuffer) {
        let Some(copies) = state.copies.remove(&command_buffer) else {
            return;
        };
        for copy in copies {
            let (src_memory, src_base) = state.buffers[&copy.src]
                .binding
                .expect("copy source has no memory bound");
            let (dst_memory, dst_base) = state.buffers[&copy.dst]
                .binding
                .expect("copy destination has no memory bound");
            let size = copy.region.size as usize;
            let src_start = (src_base + copy.region.src_offset) as usize;
            let dst_start = (dst_base + copy.region.dst_offset) as usize;
            let bytes = state.memory[&src_memory][src_start..src_start + size].to_vec();
            let dst = state
                .memory
                .get_mut(&dst_memory)
                .expect("copy destination memory is gone");
            dst[dst_start..dst_start + size].copy_from_slice(&bytes);
        }
    }
}

/// Capabilities of the fake GPU: one device-local type, one host-visible
/// coherent type and one that is both.
pub(crate) fn fake_capabilities() -> GpuCapabilities {
    let mut properties = vk::PhysicalDeviceProperties {
        api_version: vk::make_api_version(0, 1, 3, 0),
        driver_version: vk::make_api_version(0, 1, 2, 3),
        vendor_id: 0x10DE,
        limits: vk::PhysicalDeviceLimits {
            non_coherent_atom_size: ATOM_SIZE,
            min_memory_map_alignment: MAP_ALIGNMENT,
            min_uniform_buffer_offset_alignment: UNIFORM_ALIGNMENT,
            max_memory_allocation_count: 4096,
            ..Default::default()
        },
        ..Default::default()
    };
    for (dst, src) in properties.device_name.iter_mut().zip(b"Fake GPU") {
        *dst = *src as c_char;
    }

    let mut memory = vk::PhysicalDeviceMemoryProperties {
        memory_heap_count: 2,
        memory_type_count: 3,
        ..Default::default()
    };
    memory.memory_heaps[0] = vk::MemoryHeap {
        size: 4 << 30,
        flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
    };
    memory.memory_heaps[1] = vk::MemoryHeap {
        size: 8 << 30,
        flags: vk::MemoryHeapFlags::empty(),
    };
    memory.memory_types[0] = vk::MemoryType {
        property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
        heap_index: 0,
    };
    memory.memory_types[1] = vk::MemoryType {
        property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_COHERENT,
        heap_index: 1,
    };
    memory.memory_types[2] = vk::MemoryType {
        property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL
            | vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_COHERENT,
        heap_index: 0,
    };

    GpuCapabilities::from_properties(&properties, memory)
}

/// Surface capabilities of a fake window with the given extent.
pub(crate) fn fake_surface_capabilities(width: u32, height: u32) -> vk::SurfaceCapabilitiesKHR {
    vk::SurfaceCapabilitiesKHR {
        min_image_count: 2,
        max_image_count: 3,
        current_extent: vk::Extent2D { width, height },
        min_image_extent: vk::Extent2D {
            width: 1,
            height: 1,
        },
        max_image_extent: vk::Extent2D {
            width: 4096,
            height: 4096,
        },
        max_image_array_layers: 1,
        supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
        current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
        supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
        supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT
            | vk::ImageUsageFlags::TRANSFER_DST,
    }
}

impl VulkanDevice for FakeDevice {
    fn allocate_memory(
        &self,
        size: vk::DeviceSize,
        memory_type_index: u32,
    ) -> VkResult<vk::DeviceMemory> {
        let memory = self.handle();
        let mut state = self.state.lock();
        state
            .memory
            .insert(memory, vec![0u8; size as usize].into_boxed_slice());
        state.calls.push(Call::AllocateMemory {
            memory,
            size,
            type_index: memory_type_index,
        });
        Ok(memory)
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.state.lock();
        assert!(
            state.memory.remove(&memory).is_some(),
            "freeing unknown memory {memory:?}"
        );
        state.calls.push(Call::FreeMemory(memory));
    }

    fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<*mut u8> {
        let mut state = self.state.lock();
        state.calls.push(Call::MapMemory(memory));
        let bytes = state
            .memory
            .get_mut(&memory)
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        if offset + size > bytes.len() as u64 {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        // SAFETY: offset is within the allocation checked above.
        Ok(unsafe { bytes.as_mut_ptr().add(offset as usize) })
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        self.log(Call::UnmapMemory(memory));
    }

    fn flush_mapped_range(
        &self,
        memory: vk::DeviceMemory,
        _offset: vk::DeviceSize,
        _size: vk::DeviceSize,
    ) -> VkResult<()> {
        self.log(Call::FlushMappedRange(memory));
        Ok(())
    }

    fn create_buffer(&self, info: &vk::BufferCreateInfo<'_>) -> VkResult<vk::Buffer> {
        let buffer = self.handle();
        self.state.lock().buffers.insert(
            buffer,
            FakeBuffer {
                size: info.size,
                binding: None,
            },
        );
        Ok(buffer)
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.state.lock();
        state.buffers.remove(&buffer);
        state.calls.push(Call::DestroyBuffer(buffer));
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let size = self.state.lock().buffers[&buffer].size;
        vk::MemoryRequirements {
            size,
            alignment: BUFFER_ALIGNMENT,
            memory_type_bits: u32::MAX,
        }
    }

    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()> {
        let mut state = self.state.lock();
        let entry = state
            .buffers
            .get_mut(&buffer)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        entry.binding = Some((memory, offset));
        Ok(())
    }

    fn create_image(&self, info: &vk::ImageCreateInfo<'_>) -> VkResult<vk::Image> {
        let image = self.handle();
        self.state.lock().images.insert(image, info.extent);
        Ok(image)
    }

    fn destroy_image(&self, image: vk::Image) {
        let mut state = self.state.lock();
        state.images.remove(&image);
        state.calls.push(Call::DestroyImage(image));
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        let extent = self.state.lock().images[&image];
        vk::MemoryRequirements {
            size: u64::from(extent.width) * u64::from(extent.height) * 4,
            alignment: IMAGE_ALIGNMENT,
            memory_type_bits: u32::MAX,
        }
    }

    fn bind_image_memory(
        &self,
        _image: vk::Image,
        _memory: vk::DeviceMemory,
        _offset: vk::DeviceSize,
    ) -> VkResult<()> {
        Ok(())
    }

    fn create_image_view(&self, _info: &vk::ImageViewCreateInfo<'_>) -> VkResult<vk::ImageView> {
        Ok(self.handle())
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.log(Call::DestroyImageView(view));
    }

    fn create_sampler(&self, _info: &vk::SamplerCreateInfo<'_>) -> VkResult<vk::Sampler> {
        let sampler = self.handle();
        self.log(Call::CreateSampler(sampler));
        Ok(sampler)
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.log(Call::DestroySampler(sampler));
    }

    fn create_descriptor_pool(
        &self,
        info: &vk::DescriptorPoolCreateInfo<'_>,
    ) -> VkResult<vk::DescriptorPool> {
        let pool = self.handle();
        let mut state = self.state.lock();
        state.descriptor_pools.insert(pool, (info.max_sets, 0));
        state.calls.push(Call::CreateDescriptorPool(pool));
        Ok(pool)
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        self.state.lock().descriptor_pools.remove(&pool);
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        _layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet> {
        let set = self.handle();
        let mut state = self.state.lock();
        let (max_sets, used) = state
            .descriptor_pools
            .get_mut(&pool)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        if *used == *max_sets {
            return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
        }
        *used += 1;
        Ok(set)
    }

    fn free_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        set: vk::DescriptorSet,
    ) -> VkResult<()> {
        let mut state = self.state.lock();
        if let Some((_, used)) = state.descriptor_pools.get_mut(&pool) {
            *used -= 1;
        }
        state.calls.push(Call::FreeDescriptorSet(set));
        Ok(())
    }

    fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]) {
        self.log(Call::UpdateDescriptorSets(writes.len()));
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let fence = self.handle();
        let mut state = self.state.lock();
        state.fences.insert(fence, signaled);
        state.calls.push(Call::CreateFence(fence));
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        state.fences.remove(&fence);
        state.calls.push(Call::DestroyFence(fence));
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout_ns: u64) -> VkResult<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::WaitFence(fence));
        match state.fences.get(&fence) {
            Some(true) => Ok(()),
            Some(false) => Err(vk::Result::TIMEOUT),
            None => Err(vk::Result::ERROR_UNKNOWN),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::ResetFence(fence));
        let signaled = state
            .fences
            .get_mut(&fence)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        *signaled = false;
        Ok(())
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        Ok(self.handle())
    }

    fn destroy_semaphore(&self, _semaphore: vk::Semaphore) {}

    fn device_wait_idle(&self) -> VkResult<()> {
        self.log(Call::WaitIdle);
        Ok(())
    }

    fn create_command_pool(&self, _queue_family_index: u32) -> VkResult<vk::CommandPool> {
        Ok(self.handle())
    }

    fn destroy_command_pool(&self, _pool: vk::CommandPool) {}

    fn allocate_command_buffer(&self, _pool: vk::CommandPool) -> VkResult<vk::CommandBuffer> {
        Ok(self.handle())
    }

    fn free_command_buffer(&self, _pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        self.state.lock().copies.remove(&command_buffer);
    }

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        _flags: vk::CommandBufferUsageFlags,
    ) -> VkResult<()> {
        let mut state = self.state.lock();
        state.copies.remove(&command_buffer);
        state.calls.push(Call::BeginCommandBuffer(command_buffer));
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        self.log(Call::EndCommandBuffer(command_buffer));
        Ok(())
    }

    fn queue_submit(
        &self,
        _queue: vk::Queue,
        command_buffers: &[vk::CommandBuffer],
        _wait_semaphores: &[vk::Semaphore],
        _wait_stages: &[vk::PipelineStageFlags],
        _signal_semaphores: &[vk::Semaphore],
        fence: vk::Fence,
    ) -> VkResult<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::Submit {
            command_buffers: command_buffers.to_vec(),
            fence,
        });
        let result = state
            .submit_results
            .pop_front()
            .unwrap_or(vk::Result::SUCCESS);
        if result != vk::Result::SUCCESS {
            return Err(result);
        }
        for &command_buffer in command_buffers {
            Self::execute_copies(&mut state, command_buffer);
        }
        if !state.hold_fences {
            if let Some(signaled) = state.fences.get_mut(&fence) {
                *signaled = true;
            }
        }
        Ok(())
    }

    fn create_render_pass(&self, info: &vk::RenderPassCreateInfo<'_>) -> VkResult<vk::RenderPass> {
        let render_pass = self.handle();
        // SAFETY: the create info points at `attachment_count` descriptions.
        let attachments = unsafe {
            std::slice::from_raw_parts(info.p_attachments, info.attachment_count as usize)
        };
        self.log(Call::CreateRenderPass {
            render_pass,
            attachment_count: info.attachment_count,
            dependency_count: info.dependency_count,
            color_load_op: attachments[0].load_op,
            color_store_op: attachments[0].store_op,
        });
        Ok(render_pass)
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.log(Call::DestroyRenderPass(render_pass));
    }

    fn create_framebuffer(
        &self,
        info: &vk::FramebufferCreateInfo<'_>,
    ) -> VkResult<vk::Framebuffer> {
        let framebuffer = self.handle();
        self.log(Call::CreateFramebuffer {
            framebuffer,
            width: info.width,
            height: info.height,
        });
        Ok(framebuffer)
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.log(Call::DestroyFramebuffer(framebuffer));
    }

    fn cmd_begin_render_pass(
        &self,
        _command_buffer: vk::CommandBuffer,
        info: &vk::RenderPassBeginInfo<'_>,
    ) {
        self.log(Call::BeginRenderPass {
            render_pass: info.render_pass,
            framebuffer: info.framebuffer,
        });
    }

    fn cmd_end_render_pass(&self, _command_buffer: vk::CommandBuffer) {
        self.log(Call::EndRenderPass);
    }

    fn cmd_pipeline_barrier(
        &self,
        _command_buffer: vk::CommandBuffer,
        _src_stage: vk::PipelineStageFlags,
        _dst_stage: vk::PipelineStageFlags,
        buffer_barriers: &[vk::BufferMemoryBarrier<'_>],
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    ) {
        self.log(Call::PipelineBarrier {
            buffers: buffer_barriers.len(),
            images: image_barriers.len(),
        });
    }

    fn cmd_set_viewport(&self, _command_buffer: vk::CommandBuffer, _viewport: &vk::Viewport) {
        self.log(Call::SetViewport);
    }

    fn cmd_set_scissor(&self, _command_buffer: vk::CommandBuffer, _scissor: &vk::Rect2D) {
        self.log(Call::SetScissor);
    }

    fn cmd_set_stencil_reference(&self, _command_buffer: vk::CommandBuffer, reference: u32) {
        self.log(Call::SetStencilReference(reference));
    }

    fn cmd_clear_attachments(
        &self,
        _command_buffer: vk::CommandBuffer,
        attachments: &[vk::ClearAttachment],
        _rect: &vk::ClearRect,
    ) {
        self.log(Call::ClearAttachments(attachments.len()));
    }

    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        let mut state = self.state.lock();
        for region in regions {
            state.calls.push(Call::CopyBuffer {
                src,
                dst,
                size: region.size,
            });
            state
                .copies
                .entry(command_buffer)
                .or_default()
                .push(PendingCopy {
                    src,
                    dst,
                    region: *region,
                });
        }
    }

    fn create_swapchain(
        &self,
        info: &vk::SwapchainCreateInfoKHR<'_>,
    ) -> VkResult<vk::SwapchainKHR> {
        let swapchain = self.handle();
        let images = (0..info.min_image_count).map(|_| self.handle()).collect();
        let mut state = self.state.lock();
        state.swapchain_images.insert(swapchain, images);
        state.next_image = 0;
        state.calls.push(Call::CreateSwapchain {
            swapchain,
            width: info.image_extent.width,
            height: info.image_extent.height,
        });
        Ok(swapchain)
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.state.lock();
        state.swapchain_images.remove(&swapchain);
        state.calls.push(Call::DestroySwapchain(swapchain));
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        self.state
            .lock()
            .swapchain_images
            .get(&swapchain)
            .cloned()
            .ok_or(vk::Result::ERROR_SURFACE_LOST_KHR)
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        let mut state = self.state.lock();
        state.calls.push(Call::Acquire(semaphore));
        let result = state
            .acquire_results
            .pop_front()
            .unwrap_or(vk::Result::SUCCESS);
        let image_count = state
            .swapchain_images
            .get(&swapchain)
            .map_or(0, |images| images.len() as u32);
        match result {
            vk::Result::SUCCESS | vk::Result::SUBOPTIMAL_KHR if image_count > 0 => {
                let index = state.next_image % image_count;
                state.next_image = index + 1;
                Ok((index, result == vk::Result::SUBOPTIMAL_KHR))
            }
            vk::Result::SUCCESS | vk::Result::SUBOPTIMAL_KHR => {
                Err(vk::Result::ERROR_SURFACE_LOST_KHR)
            }
            error => Err(error),
        }
    }

    fn queue_present(
        &self,
        _queue: vk::Queue,
        _swapchain: vk::SwapchainKHR,
        image_index: u32,
        _wait_semaphore: vk::Semaphore,
    ) -> VkResult<bool> {
        let mut state = self.state.lock();
        state.calls.push(Call::Present { image_index });
        match state
            .present_results
            .pop_front()
            .unwrap_or(vk::Result::SUCCESS)
        {
            vk::Result::SUCCESS => Ok(false),
            vk::Result::SUBOPTIMAL_KHR => Ok(true),
            error => Err(error),
        }
    }
}

/// Recorded pipeline cache call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PipelineCall {
    Get(vk::RenderPass),
    Reset,
    ResetForRenderPass(vk::RenderPass),
    Dump,
    Destroy,
}

/// Pipeline cache handing out fresh handles; its log stays readable after
/// the cache is boxed into a context.
#[derive(Default)]
pub(crate) struct FakePipelineCache {
    calls: Arc<Mutex<Vec<PipelineCall>>>,
    next_pipeline: u64,
}

impl FakePipelineCache {
    pub(crate) fn new() -> (Self, Arc<Mutex<Vec<PipelineCall>>>) {
        let cache = Self::default();
        let calls = cache.calls.clone();
        (cache, calls)
    }
}

impl PipelineCache for FakePipelineCache {
    fn get_pipeline(&mut self, key: &PipelineKey) -> Result<vk::Pipeline> {
        self.calls.lock().push(PipelineCall::Get(key.render_pass));
        self.next_pipeline += 1;
        Ok(vk::Pipeline::from_raw(self.next_pipeline))
    }

    fn reset_cache(&mut self) {
        self.calls.lock().push(PipelineCall::Reset);
    }

    fn reset_cache_for_render_pass(&mut self, render_pass: vk::RenderPass) {
        self.calls
            .lock()
            .push(PipelineCall::ResetForRenderPass(render_pass));
    }

    fn dump(&mut self) {
        self.calls.lock().push(PipelineCall::Dump);
    }

    fn destroy(&mut self) {
        self.calls.lock().push(PipelineCall::Destroy);
    }
}
