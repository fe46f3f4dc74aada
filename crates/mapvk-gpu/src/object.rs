//! GPU object creation and frame-safe destruction.
//!
//! The [`ObjectManager`] is shared between the frontend (render) thread and
//! the backend (upload) thread and is the only cross-thread lock holder.
//! Objects handed to [`ObjectManager::destroy_object`] are kept alive until
//! the slot that recorded the releasing frame has signaled its fence.

use crate::capabilities::GpuCapabilities;
use crate::config::ContextConfig;
use crate::deferred::DeferredQueue;
use crate::descriptors::{DescriptorPoolList, DescriptorSetGroup};
use crate::device::VulkanDevice;
use crate::error::Result;
use crate::memory::{aligned, Allocation, MemoryBlock, MemoryManager, ResourceType};
use crate::pipeline::ProgramLayout;
use crate::sampler::SamplerKey;
use crate::MAX_INFLIGHT_FRAMES;
use ash::vk;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};

/// A buffer or an image with its view, plus the memory backing it.
#[derive(Debug, Default)]
pub struct VulkanObject {
    pub buffer: vk::Buffer,
    pub image: vk::Image,
    pub image_view: vk::ImageView,
    allocation: Option<Allocation>,
}

impl VulkanObject {
    pub fn allocation(&self) -> Option<&Allocation> {
        self.allocation.as_ref()
    }

    /// Device memory the object is bound to.
    pub fn memory(&self) -> vk::DeviceMemory {
        self.allocation
            .as_ref()
            .map_or(vk::DeviceMemory::null(), Allocation::memory)
    }

    /// Offset of the object inside its memory block.
    pub fn aligned_offset(&self) -> vk::DeviceSize {
        self.allocation.as_ref().map_or(0, Allocation::offset)
    }

    pub fn aligned_size(&self) -> vk::DeviceSize {
        self.allocation.as_ref().map_or(0, Allocation::size)
    }

    pub fn is_coherent(&self) -> bool {
        self.allocation
            .as_ref()
            .and_then(Allocation::block)
            .is_some_and(|block| block.is_coherent())
    }

    fn block(&self) -> Arc<MemoryBlock> {
        self.allocation
            .as_ref()
            .and_then(Allocation::block)
            .unwrap_or_else(|| panic!("Object has no live memory: {self:?}"))
    }
}

/// Threads allowed to touch thread-affine parts of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadType {
    /// Records frames and owns descriptor sets.
    Frontend,
    /// Uploads resources.
    Backend,
}

struct Inner {
    memory_manager: MemoryManager,
    objects_to_destroy: DeferredQueue<VulkanObject>,
    descriptors_to_destroy: [Vec<DescriptorSetGroup>; MAX_INFLIGHT_FRAMES],
    descriptor_pools: DescriptorPoolList,
    slot_generations: [u64; MAX_INFLIGHT_FRAMES],
    current_slot: usize,
    current_generation: u64,
}

/// Creates buffers, images, descriptor sets and samplers and destroys them
/// once no in-flight frame can reference them.
pub struct ObjectManager {
    device: Arc<dyn VulkanDevice>,
    non_coherent_atom_size: vk::DeviceSize,
    inner: Mutex<Inner>,
    samplers: Mutex<HashMap<SamplerKey, vk::Sampler>>,
    threads: Mutex<[Option<ThreadId>; 2]>,
}

impl ObjectManager {
    pub fn new(
        device: Arc<dyn VulkanDevice>,
        capabilities: &GpuCapabilities,
        config: &ContextConfig,
    ) -> Self {
        let memory_manager = MemoryManager::new(
            device.clone(),
            capabilities.limits,
            capabilities.memory_properties,
            config.memory_budgets,
        );
        Self {
            device,
            non_coherent_atom_size: capabilities.limits.non_coherent_atom_size.max(1),
            inner: Mutex::new(Inner {
                memory_manager,
                objects_to_destroy: DeferredQueue::new(),
                descriptors_to_destroy: Default::default(),
                descriptor_pools: DescriptorPoolList::new(
                    config.max_uniform_buffers,
                    config.max_image_samplers,
                    config.descriptor_sets_per_pool,
                ),
                slot_generations: [0; MAX_INFLIGHT_FRAMES],
                current_slot: 0,
                current_generation: 0,
            }),
            samplers: Mutex::new(HashMap::new()),
            threads: Mutex::new([None; 2]),
        }
    }

    pub fn device(&self) -> &Arc<dyn VulkanDevice> {
        &self.device
    }

    /// Bind the calling thread to a role. Unregistered roles are not checked.
    pub fn register_thread(&self, thread_type: ThreadType) {
        self.threads.lock()[thread_type as usize] = Some(thread::current().id());
    }

    fn check_thread(&self, thread_type: ThreadType) {
        let registered = self.threads.lock()[thread_type as usize];
        if let Some(expected) = registered {
            assert_eq!(
                thread::current().id(),
                expected,
                "Must be called from the {thread_type:?} thread"
            );
        }
    }

    /// Record that frame `generation` is being recorded into `slot`.
    pub fn set_current_inflight_frame(&self, slot: usize, generation: u64) {
        assert!(slot < MAX_INFLIGHT_FRAMES);
        let mut inner = self.inner.lock();
        debug_assert!(generation >= inner.current_generation);
        inner.current_slot = slot;
        inner.current_generation = generation;
        inner.slot_generations[slot] = generation;
    }

    /// Offset alignment of a memory category.
    pub fn offset_alignment(&self, resource_type: ResourceType) -> vk::DeviceSize {
        self.inner.lock().memory_manager.offset_alignment(resource_type)
    }

    /// Size alignment for a memory requirement.
    pub fn size_alignment(&self, requirements: &vk::MemoryRequirements) -> vk::DeviceSize {
        self.inner.lock().memory_manager.size_alignment(requirements)
    }

    /// Run `f` with the memory manager locked.
    pub fn with_memory_manager<R>(&self, f: impl FnOnce(&MemoryManager) -> R) -> R {
        f(&self.inner.lock().memory_manager)
    }

    /// Number of objects waiting for their frame to complete.
    pub fn pending_object_count(&self) -> usize {
        self.inner.lock().objects_to_destroy.len()
    }

    fn allocate(
        &self,
        resource_type: ResourceType,
        requirements: vk::MemoryRequirements,
        block_hash: u64,
    ) -> Result<Allocation> {
        let mut inner = self.inner.lock();
        inner.memory_manager.begin_deallocation_session();
        let allocation = inner
            .memory_manager
            .allocate(resource_type, requirements, block_hash);
        inner.memory_manager.end_deallocation_session();
        allocation
    }

    /// Create a buffer with memory reserved for it. The caller binds it, see
    /// [`bind_buffer`](Self::bind_buffer).
    ///
    /// # Panics
    /// For [`ResourceType::Image`].
    pub fn create_buffer(
        &self,
        resource_type: ResourceType,
        size_in_bytes: u32,
        batcher_hash: u64,
    ) -> Result<VulkanObject> {
        let usage = match resource_type {
            ResourceType::Geometry => {
                vk::BufferUsageFlags::VERTEX_BUFFER
                    | vk::BufferUsageFlags::INDEX_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_DST
            }
            ResourceType::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
            ResourceType::Staging => vk::BufferUsageFlags::TRANSFER_SRC,
            ResourceType::Image => panic!("Buffers cannot be created in the image category"),
        };

        let create_info = vk::BufferCreateInfo::default()
            .size(vk::DeviceSize::from(size_in_bytes))
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = self.device.create_buffer(&create_info)?;
        let requirements = self.device.buffer_memory_requirements(buffer);

        match self.allocate(resource_type, requirements, batcher_hash) {
            Ok(allocation) => Ok(VulkanObject {
                buffer,
                allocation: Some(allocation),
                ..Default::default()
            }),
            Err(e) => {
                self.device.destroy_buffer(buffer);
                Err(e)
            }
        }
    }

    /// Bind a buffer created by [`create_buffer`](Self::create_buffer) to its
    /// memory.
    pub fn bind_buffer(&self, object: &VulkanObject) -> Result<()> {
        self.device
            .bind_buffer_memory(object.buffer, object.memory(), object.aligned_offset())?;
        Ok(())
    }

    /// Create a 2D single-mip image with bound memory and a view.
    pub fn create_image(
        &self,
        usage: vk::ImageUsageFlags,
        format: vk::Format,
        tiling: vk::ImageTiling,
        aspect: vk::ImageAspectFlags,
        width: u32,
        height: u32,
    ) -> Result<VulkanObject> {
        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(tiling)
            .usage(usage | vk::ImageUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = self.device.create_image(&create_info)?;

        let mut object = VulkanObject {
            image,
            ..Default::default()
        };
        let requirements = self.device.image_memory_requirements(image);
        match self.allocate(ResourceType::Image, requirements, 0) {
            Ok(allocation) => object.allocation = Some(allocation),
            Err(e) => {
                self.destroy_now(object);
                return Err(e);
            }
        }

        if let Err(e) = self
            .device
            .bind_image_memory(image, object.memory(), object.aligned_offset())
        {
            self.destroy_now(object);
            return Err(e.into());
        }

        let components = if usage.contains(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT) {
            vk::ComponentMapping::default()
        } else {
            vk::ComponentMapping {
                r: vk::ComponentSwizzle::R,
                g: vk::ComponentSwizzle::G,
                b: vk::ComponentSwizzle::B,
                a: vk::ComponentSwizzle::A,
            }
        };
        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(components)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        match self.device.create_image_view(&view_info) {
            Ok(view) => object.image_view = view,
            Err(e) => {
                self.destroy_now(object);
                return Err(e.into());
            }
        }

        Ok(object)
    }

    /// Queue an object for destruction once the current frame completes.
    pub fn destroy_object(&self, object: VulkanObject) {
        let mut inner = self.inner.lock();
        let generation = inner.current_generation;
        inner.objects_to_destroy.push(object, generation);
    }

    /// Destroy every object released no later than the frame last recorded
    /// into `inflight_frame_index`. Call after that slot's fence signaled.
    pub fn collect_objects(&self, inflight_frame_index: usize) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let completed = inner.slot_generations[inflight_frame_index];
        let mature = inner.objects_to_destroy.drain_mature(completed);
        if mature.is_empty() {
            return;
        }

        let count = mature.len();
        inner.memory_manager.begin_deallocation_session();
        for object in mature {
            Self::destroy_with(self.device.as_ref(), &mut inner.memory_manager, object);
        }
        inner.memory_manager.end_deallocation_session();
        tracing::trace!(
            count,
            slot = inflight_frame_index,
            generation = completed,
            "Collected objects"
        );
    }

    fn destroy_now(&self, object: VulkanObject) {
        let mut inner = self.inner.lock();
        Self::destroy_with(self.device.as_ref(), &mut inner.memory_manager, object);
    }

    fn destroy_with(
        device: &dyn VulkanDevice,
        memory_manager: &mut MemoryManager,
        object: VulkanObject,
    ) {
        if object.image_view != vk::ImageView::null() {
            device.destroy_image_view(object.image_view);
        }
        if object.image != vk::Image::null() {
            device.destroy_image(object.image);
        }
        if object.buffer != vk::Buffer::null() {
            device.destroy_buffer(object.buffer);
        }
        if let Some(allocation) = object.allocation {
            memory_manager.deallocate(allocation);
        }
    }

    /// Allocate a descriptor set for a program. Frontend thread only.
    pub fn create_descriptor_set_group(
        &self,
        program: &ProgramLayout,
    ) -> Result<DescriptorSetGroup> {
        self.check_thread(ThreadType::Frontend);
        let mut inner = self.inner.lock();
        let (set, pool) = inner
            .descriptor_pools
            .allocate(self.device.as_ref(), program.descriptor_set_layout)?;
        Ok(DescriptorSetGroup::new(set, pool))
    }

    /// Queue a descriptor set for release. Frontend thread only.
    pub fn destroy_descriptor_set_group(&self, group: DescriptorSetGroup) {
        self.check_thread(ThreadType::Frontend);
        let mut inner = self.inner.lock();
        let slot = inner.current_slot;
        inner.descriptors_to_destroy[slot].push(group);
    }

    /// Release descriptor sets queued while `inflight_frame_index` was
    /// recording. Frontend thread only.
    pub fn collect_descriptor_set_groups(&self, inflight_frame_index: usize) -> Result<()> {
        self.check_thread(ThreadType::Frontend);
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        for group in inner.descriptors_to_destroy[inflight_frame_index].drain(..) {
            inner
                .descriptor_pools
                .free(self.device.as_ref(), group.pool, group.set)?;
        }
        Ok(())
    }

    pub fn set_max_uniform_buffers(&self, count: u32) {
        self.inner.lock().descriptor_pools.set_max_uniform_buffers(count);
    }

    pub fn set_max_image_samplers(&self, count: u32) {
        self.inner.lock().descriptor_pools.set_max_image_samplers(count);
    }

    /// Map an object's memory.
    pub fn map(&self, object: &VulkanObject) -> Result<*mut u8> {
        let _guard = self.inner.lock();
        // SAFETY: the manager lock is held.
        unsafe { self.map_unsafe(object) }
    }

    /// Flush a mapped range of an object.
    pub fn flush(
        &self,
        object: &VulkanObject,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<()> {
        let _guard = self.inner.lock();
        // SAFETY: the manager lock is held.
        unsafe { self.flush_unsafe(object, offset, size) }
    }

    pub fn unmap(&self, object: &VulkanObject) {
        let _guard = self.inner.lock();
        // SAFETY: the manager lock is held.
        unsafe { self.unmap_unsafe(object) }
    }

    /// Copy `data` to the start of an object's memory.
    pub fn fill(&self, object: &VulkanObject, data: &[u8]) -> Result<()> {
        assert!(data.len() as vk::DeviceSize <= object.aligned_size());
        let _guard = self.inner.lock();
        // SAFETY: the manager lock is held and the mapping covers the whole
        // allocation, which is at least `data.len()` bytes.
        unsafe {
            let ptr = self.map_unsafe(object)?;
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len());
            let flushed = self.flush_unsafe(object, 0, data.len() as vk::DeviceSize);
            self.unmap_unsafe(object);
            flushed
        }
    }

    /// Zero the first `size` bytes of an object's memory.
    pub fn fill_zeros(&self, object: &VulkanObject, size: vk::DeviceSize) -> Result<()> {
        assert!(size <= object.aligned_size());
        let _guard = self.inner.lock();
        // SAFETY: as in `fill`.
        unsafe {
            let ptr = self.map_unsafe(object)?;
            std::ptr::write_bytes(ptr, 0, size as usize);
            let flushed = self.flush_unsafe(object, 0, size);
            self.unmap_unsafe(object);
            flushed
        }
    }

    /// Map without taking the manager lock. Blocks the memory block against
    /// further sub-allocation until unmapped.
    ///
    /// # Safety
    /// The caller must have exclusive access to the object's memory block.
    ///
    /// # Panics
    /// If the block is already mapped.
    pub unsafe fn map_unsafe(&self, object: &VulkanObject) -> Result<*mut u8> {
        let block = object.block();
        assert!(!block.is_blocked(), "Memory block is already mapped");
        let ptr = self.device.map_memory(
            block.memory(),
            object.aligned_offset(),
            object.aligned_size(),
        )?;
        block.set_blocked(true);
        Ok(ptr)
    }

    /// Flush a range relative to the object's start. No-op on coherent memory.
    ///
    /// # Safety
    /// As for [`map_unsafe`](Self::map_unsafe).
    pub unsafe fn flush_unsafe(
        &self,
        object: &VulkanObject,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<()> {
        let block = object.block();
        if block.is_coherent() {
            return Ok(());
        }
        assert!(block.is_blocked(), "Flushing unmapped memory");

        let atom = self.non_coherent_atom_size;
        let start = (object.aligned_offset() + offset) / atom * atom;
        let end = aligned(object.aligned_offset() + offset + size, atom)
            .min(object.aligned_offset() + object.aligned_size());
        self.device
            .flush_mapped_range(block.memory(), start, end.saturating_sub(start))?;
        Ok(())
    }

    /// # Safety
    /// As for [`map_unsafe`](Self::map_unsafe).
    ///
    /// # Panics
    /// If the block is not mapped.
    pub unsafe fn unmap_unsafe(&self, object: &VulkanObject) {
        let block = object.block();
        assert!(block.is_blocked(), "Unmapping memory that is not mapped");
        self.device.unmap_memory(block.memory());
        block.set_blocked(false);
    }

    /// Get or create the sampler for a key. Samplers live until teardown.
    pub fn get_sampler(&self, key: SamplerKey) -> Result<vk::Sampler> {
        let mut samplers = self.samplers.lock();
        if let Some(&sampler) = samplers.get(&key) {
            return Ok(sampler);
        }
        let sampler = self.device.create_sampler(&key.create_info())?;
        samplers.insert(key, sampler);
        tracing::trace!(key = key.bits(), "Created sampler");
        Ok(sampler)
    }
}

impl Drop for ObjectManager {
    fn drop(&mut self) {
        let device = self.device.clone();
        let inner = self.inner.get_mut();

        for object in inner.objects_to_destroy.drain_all() {
            Self::destroy_with(device.as_ref(), &mut inner.memory_manager, object);
        }
        for queue in &mut inner.descriptors_to_destroy {
            queue.clear();
        }
        inner.descriptor_pools.destroy(device.as_ref());

        for (_, sampler) in self.samplers.get_mut().drain() {
            device.destroy_sampler(sampler);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::{TextureFilter, TextureWrapping};
    use crate::testing::{fake_capabilities, Call, FakeDevice};
    use ash::vk::Handle;

    fn manager() -> (Arc<FakeDevice>, ObjectManager) {
        let fake = Arc::new(FakeDevice::default());
        let manager = ObjectManager::new(
            fake.clone(),
            &fake_capabilities(),
            &ContextConfig::default(),
        );
        (fake, manager)
    }

    fn program() -> ProgramLayout {
        ProgramLayout {
            id: 1,
            descriptor_set_layout: vk::DescriptorSetLayout::from_raw(0xD5),
            pipeline_layout: vk::PipelineLayout::from_raw(0x91),
        }
    }

    #[test]
    fn buffer_fill_round_trip() {
        let (fake, manager) = manager();
        let object = manager
            .create_buffer(ResourceType::Geometry, 100, 3)
            .unwrap();
        manager.bind_buffer(&object).unwrap();
        assert!(object.is_coherent());
        assert_eq!(object.aligned_size(), 128);

        let data: Vec<u8> = (0..100).collect();
        manager.fill(&object, &data).unwrap();
        assert_eq!(fake.read_buffer(object.buffer, 0, 100), data);

        let calls = fake.calls();
        let memory = object.memory();
        assert!(calls.contains(&Call::MapMemory(memory)));
        assert!(calls.contains(&Call::UnmapMemory(memory)));
        assert!(!calls.contains(&Call::FlushMappedRange(memory)));
        assert!(!object.block().is_blocked());

        manager.fill_zeros(&object, 64).unwrap();
        assert_eq!(fake.read_buffer(object.buffer, 0, 64), vec![0; 64]);
        assert_eq!(fake.read_buffer(object.buffer, 64, 1), vec![64]);
    }

    #[test]
    #[should_panic(expected = "image category")]
    fn image_category_buffers_are_rejected() {
        let (_fake, manager) = manager();
        let _ = manager.create_buffer(ResourceType::Image, 64, 0);
    }

    #[test]
    fn mapped_block_is_not_bump_allocated() {
        let (_fake, manager) = manager();
        let first = manager
            .create_buffer(ResourceType::Geometry, 64, 0)
            .unwrap();
        let _ptr = manager.map(&first).unwrap();
        let second = manager
            .create_buffer(ResourceType::Geometry, 64, 0)
            .unwrap();
        assert_ne!(first.memory(), second.memory());
        manager.unmap(&first);

        let third = manager
            .create_buffer(ResourceType::Geometry, 64, 0)
            .unwrap();
        assert_eq!(third.memory(), second.memory());
    }

    #[test]
    #[should_panic(expected = "already mapped")]
    fn double_map_is_fatal() {
        let (_fake, manager) = manager();
        let object = manager
            .create_buffer(ResourceType::Uniform, 64, 0)
            .unwrap();
        let _ = manager.map(&object);
        let _ = manager.map(&object);
    }

    #[test]
    fn non_coherent_memory_is_flushed() {
        let (fake, manager) = manager();
        let image = manager
            .create_image(
                vk::ImageUsageFlags::SAMPLED,
                vk::Format::R8G8B8A8_UNORM,
                vk::ImageTiling::OPTIMAL,
                vk::ImageAspectFlags::COLOR,
                4,
                4,
            )
            .unwrap();
        assert!(!image.is_coherent());
        manager.fill(&image, &[1; 16]).unwrap();
        assert_eq!(
            fake.count_calls(|c| *c == Call::FlushMappedRange(image.memory())),
            1
        );
    }

    #[test]
    fn image_has_view_and_memory() {
        let (fake, manager) = manager();
        let image = manager
            .create_image(
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                vk::Format::D24_UNORM_S8_UINT,
                vk::ImageTiling::OPTIMAL,
                vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
                32,
                32,
            )
            .unwrap();
        assert_ne!(image.image, vk::Image::null());
        assert_ne!(image.image_view, vk::ImageView::null());
        assert_eq!(
            image.allocation().map(Allocation::resource_type),
            Some(ResourceType::Image)
        );

        let (view, handle) = (image.image_view, image.image);
        manager.destroy_object(image);
        manager.collect_objects(0);
        let calls = fake.calls();
        assert!(calls.contains(&Call::DestroyImageView(view)));
        assert!(calls.contains(&Call::DestroyImage(handle)));
    }

    #[test]
    fn destruction_waits_for_the_recording_slot() {
        let (fake, manager) = manager();
        manager.set_current_inflight_frame(0, 1);
        let object = manager
            .create_buffer(ResourceType::Uniform, 256, 0)
            .unwrap();
        let buffer = object.buffer;
        manager.destroy_object(object);

        // Slot 1 has not recorded anything yet.
        manager.collect_objects(1);
        assert_eq!(manager.pending_object_count(), 1);
        assert!(!fake.calls().contains(&Call::DestroyBuffer(buffer)));

        manager.set_current_inflight_frame(1, 2);
        manager.collect_objects(0);
        assert_eq!(manager.pending_object_count(), 0);
        assert!(fake.calls().contains(&Call::DestroyBuffer(buffer)));
        assert_eq!(
            manager.with_memory_manager(|m| m.free_block_count(ResourceType::Uniform)),
            1
        );
    }

    #[test]
    fn descriptor_sets_are_released_per_slot() {
        let (fake, manager) = manager();
        manager.set_current_inflight_frame(1, 1);
        let group = manager.create_descriptor_set_group(&program()).unwrap();
        let set = group.set;
        manager.destroy_descriptor_set_group(group);

        manager.collect_descriptor_set_groups(0).unwrap();
        assert!(!fake.calls().contains(&Call::FreeDescriptorSet(set)));
        manager.collect_descriptor_set_groups(1).unwrap();
        assert!(fake.calls().contains(&Call::FreeDescriptorSet(set)));
    }

    #[test]
    fn frontend_only_calls_check_the_thread() {
        let (_fake, manager) = manager();
        manager.register_thread(ThreadType::Frontend);
        assert!(manager.create_descriptor_set_group(&program()).is_ok());

        let result = thread::scope(|s| {
            s.spawn(|| manager.collect_descriptor_set_groups(0))
                .join()
        });
        assert!(result.is_err());
    }

    #[test]
    fn samplers_are_memoized() {
        let (fake, manager) = manager();
        let linear = SamplerKey::new(
            TextureFilter::Linear,
            TextureWrapping::ClampToEdge,
            TextureWrapping::ClampToEdge,
        );
        let nearest = SamplerKey::new(
            TextureFilter::Nearest,
            TextureWrapping::Repeat,
            TextureWrapping::Repeat,
        );
        let a = manager.get_sampler(linear).unwrap();
        let b = manager.get_sampler(linear).unwrap();
        let c = manager.get_sampler(nearest).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(fake.count_calls(|c| matches!(c, Call::CreateSampler(_))), 2);

        drop(manager);
        assert_eq!(fake.count_calls(|c| matches!(c, Call::DestroySampler(_))), 2);
    }

    #[test]
    fn drop_releases_pending_objects_and_memory() {
        let (fake, manager) = manager();
        let object = manager
            .create_buffer(ResourceType::Staging, 1024, 0)
            .unwrap();
        manager.destroy_object(object);
        drop(manager);
        assert_eq!(fake.live_memory_count(), 0);
    }
}
