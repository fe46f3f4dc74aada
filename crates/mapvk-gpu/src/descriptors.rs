//! Descriptor pools and per-draw descriptor set groups.

use crate::device::VulkanDevice;
use crate::error::Result;
use ash::vk;

/// A value bound to a program parameter for the next draw.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamDescriptor {
    /// Dynamic uniform buffer at binding 0.
    DynamicUniformBuffer {
        id: u64,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
        dynamic_offset: u32,
    },
    /// Combined image sampler at binding `slot`.
    Texture {
        id: u64,
        slot: u32,
        sampler: vk::Sampler,
        image_view: vk::ImageView,
        layout: vk::ImageLayout,
    },
}

impl ParamDescriptor {
    /// Identity of the bound resource, used to skip redundant updates.
    pub fn id(&self) -> u64 {
        match *self {
            Self::DynamicUniformBuffer { id, .. } | Self::Texture { id, .. } => id,
        }
    }

    pub fn is_dynamic_uniform_buffer(&self) -> bool {
        matches!(self, Self::DynamicUniformBuffer { .. })
    }
}

struct DescriptorPoolInfo {
    pool: vk::DescriptorPool,
    available_sets: u32,
}

/// Growable list of `FREE_DESCRIPTOR_SET` pools.
pub struct DescriptorPoolList {
    pools: Vec<DescriptorPoolInfo>,
    max_uniform_buffers: u32,
    max_image_samplers: u32,
    sets_per_pool: u32,
}

impl DescriptorPoolList {
    /// Limits only apply to pools created afterwards.
    pub fn new(max_uniform_buffers: u32, max_image_samplers: u32, sets_per_pool: u32) -> Self {
        Self {
            pools: Vec::new(),
            max_uniform_buffers,
            max_image_samplers,
            sets_per_pool: sets_per_pool.max(1),
        }
    }

    pub fn set_max_uniform_buffers(&mut self, count: u32) {
        self.max_uniform_buffers = count;
    }

    pub fn set_max_image_samplers(&mut self, count: u32) {
        self.max_image_samplers = count;
    }

    /// Number of pools created so far.
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    fn create_pool(&mut self, device: &dyn VulkanDevice) -> Result<usize> {
        let mut pool_sizes = Vec::with_capacity(2);
        if self.max_uniform_buffers > 0 {
            pool_sizes.push(vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                descriptor_count: self.max_uniform_buffers * self.sets_per_pool,
            });
        }
        if self.max_image_samplers > 0 {
            pool_sizes.push(vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: self.max_image_samplers * self.sets_per_pool,
            });
        }

        let create_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(self.sets_per_pool)
            .pool_sizes(&pool_sizes);
        let pool = device.create_descriptor_pool(&create_info)?;
        self.pools.push(DescriptorPoolInfo {
            pool,
            available_sets: self.sets_per_pool,
        });
        tracing::debug!(
            pools = self.pools.len(),
            sets_per_pool = self.sets_per_pool,
            "Created descriptor pool"
        );
        Ok(self.pools.len() - 1)
    }

    /// Allocate one set, growing the list when every pool is exhausted.
    pub fn allocate(
        &mut self,
        device: &dyn VulkanDevice,
        layout: vk::DescriptorSetLayout,
    ) -> Result<(vk::DescriptorSet, vk::DescriptorPool)> {
        loop {
            let (index, fresh) = match self.pools.iter().position(|p| p.available_sets > 0) {
                Some(index) => (index, false),
                None => (self.create_pool(device)?, true),
            };

            let pool = &mut self.pools[index];
            match device.allocate_descriptor_set(pool.pool, layout) {
                Ok(set) => {
                    pool.available_sets -= 1;
                    return Ok((set, pool.pool));
                }
                Err(e @ (vk::Result::ERROR_FRAGMENTED_POOL | vk::Result::ERROR_OUT_OF_POOL_MEMORY))
                    if !fresh =>
                {
                    tracing::debug!("Descriptor pool exhausted ({e}), trying the next one");
                    pool.available_sets = 0;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Return a set to its pool.
    pub fn free(
        &mut self,
        device: &dyn VulkanDevice,
        pool: vk::DescriptorPool,
        set: vk::DescriptorSet,
    ) -> Result<()> {
        device.free_descriptor_set(pool, set)?;
        if let Some(info) = self.pools.iter_mut().find(|p| p.pool == pool) {
            info.available_sets += 1;
        }
        Ok(())
    }

    /// Destroy every pool, implicitly freeing their sets.
    pub fn destroy(&mut self, device: &dyn VulkanDevice) {
        for info in self.pools.drain(..) {
            device.destroy_descriptor_pool(info.pool);
        }
    }
}

/// A descriptor set allocated for one draw.
#[derive(Debug, Default)]
pub struct DescriptorSetGroup {
    pub set: vk::DescriptorSet,
    pub pool: vk::DescriptorPool,
    ids: Vec<u64>,
}

impl DescriptorSetGroup {
    pub(crate) fn new(set: vk::DescriptorSet, pool: vk::DescriptorPool) -> Self {
        Self {
            set,
            pool,
            ids: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.set != vk::DescriptorSet::null() && self.pool != vk::DescriptorPool::null()
    }

    /// Write the descriptors into the set unless the same resources are
    /// already bound.
    pub fn update(&mut self, device: &dyn VulkanDevice, descriptors: &[ParamDescriptor]) {
        let ids: Vec<u64> = descriptors.iter().map(ParamDescriptor::id).collect();
        if ids == self.ids {
            return;
        }
        self.ids = ids;

        let mut buffer_infos = Vec::new();
        let mut image_infos = Vec::new();
        for descriptor in descriptors {
            match *descriptor {
                ParamDescriptor::DynamicUniformBuffer {
                    buffer,
                    offset,
                    range,
                    ..
                } => buffer_infos.push(vk::DescriptorBufferInfo {
                    buffer,
                    offset,
                    range,
                }),
                ParamDescriptor::Texture {
                    slot,
                    sampler,
                    image_view,
                    layout,
                    ..
                } => image_infos.push((
                    slot,
                    vk::DescriptorImageInfo {
                        sampler,
                        image_view,
                        image_layout: layout,
                    },
                )),
            }
        }

        let mut writes = Vec::with_capacity(descriptors.len());
        for info in &buffer_infos {
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(self.set)
                    .dst_binding(0)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
                    .buffer_info(std::slice::from_ref(info)),
            );
        }
        for (slot, info) in &image_infos {
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(self.set)
                    .dst_binding(*slot)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(std::slice::from_ref(info)),
            );
        }

        device.update_descriptor_sets(&writes);
    }
}
