//! Context configuration.

use crate::memory::ResourceType;
use ash::vk;
use std::time::Duration;

const MIB: vk::DeviceSize = 1024 * 1024;

/// Block sizing policy for one resource category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBudget {
    /// Smallest device-memory block allocated for the category.
    pub min_block_size: vk::DeviceSize,
    /// Running total above which drained blocks are freed instead of recycled.
    pub desired_size: vk::DeviceSize,
}

impl MemoryBudget {
    /// Create a budget.
    pub const fn new(min_block_size: vk::DeviceSize, desired_size: vk::DeviceSize) -> Self {
        Self {
            min_block_size,
            desired_size,
        }
    }
}

/// Per-category memory budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBudgets {
    pub geometry: MemoryBudget,
    pub uniform: MemoryBudget,
    pub staging: MemoryBudget,
    pub image: MemoryBudget,
}

impl Default for MemoryBudgets {
    fn default() -> Self {
        Self {
            geometry: MemoryBudget::new(MIB, 80 * MIB),
            uniform: MemoryBudget::new(64 * 1024, vk::DeviceSize::MAX),
            staging: MemoryBudget::new(0, 20 * MIB),
            image: MemoryBudget::new(0, 100 * MIB),
        }
    }
}

impl MemoryBudgets {
    /// Budget of a resource category.
    pub fn get(&self, resource_type: ResourceType) -> MemoryBudget {
        match resource_type {
            ResourceType::Geometry => self.geometry,
            ResourceType::Uniform => self.uniform,
            ResourceType::Staging => self.staging,
            ResourceType::Image => self.image,
        }
    }

    /// Replace the budget of a resource category.
    pub fn with(mut self, resource_type: ResourceType, budget: MemoryBudget) -> Self {
        match resource_type {
            ResourceType::Geometry => self.geometry = budget,
            ResourceType::Uniform => self.uniform = budget,
            ResourceType::Staging => self.staging = budget,
            ResourceType::Image => self.image = budget,
        }
        self
    }
}

/// Configuration of the object manager and the frame context.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Size of each per-frame default staging buffer.
    pub staging_buffer_size: u32,
    /// Longest wait on an in-flight fence before the frame is skipped.
    pub fence_timeout: Duration,
    /// Format of the swapchain depth/stencil attachment.
    pub depth_format: vk::Format,
    /// Dynamic uniform buffers per descriptor set.
    pub max_uniform_buffers: u32,
    /// Combined image samplers per descriptor set.
    pub max_image_samplers: u32,
    /// Descriptor sets per descriptor pool.
    pub descriptor_sets_per_pool: u32,
    /// Memory block budgets.
    pub memory_budgets: MemoryBudgets,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            staging_buffer_size: 3 * 1024 * 1024,
            fence_timeout: Duration::from_secs(2),
            depth_format: vk::Format::D24_UNORM_S8_UINT,
            max_uniform_buffers: 1,
            max_image_samplers: 4,
            descriptor_sets_per_pool: 256,
            memory_budgets: MemoryBudgets::default(),
        }
    }
}

impl ContextConfig {
    /// Set the per-frame staging buffer size.
    pub fn with_staging_buffer_size(mut self, size: u32) -> Self {
        self.staging_buffer_size = size;
        self
    }

    /// Set the fence wait timeout.
    pub fn with_fence_timeout(mut self, timeout: Duration) -> Self {
        self.fence_timeout = timeout;
        self
    }

    /// Set the depth/stencil format.
    pub fn with_depth_format(mut self, format: vk::Format) -> Self {
        self.depth_format = format;
        self
    }

    /// Set descriptor limits per set.
    pub fn with_descriptor_limits(mut self, uniform_buffers: u32, image_samplers: u32) -> Self {
        self.max_uniform_buffers = uniform_buffers;
        self.max_image_samplers = image_samplers;
        self
    }

    /// Set how many descriptor sets a pool holds.
    pub fn with_descriptor_sets_per_pool(mut self, count: u32) -> Self {
        self.descriptor_sets_per_pool = count;
        self
    }

    /// Set the memory budgets.
    pub fn with_memory_budgets(mut self, budgets: MemoryBudgets) -> Self {
        self.memory_budgets = budgets;
        self
    }

    /// Fence timeout in nanoseconds.
    pub fn fence_timeout_ns(&self) -> u64 {
        u64::try_from(self.fence_timeout.as_nanos()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_budgets() {
        let budgets = MemoryBudgets::default();
        assert_eq!(budgets.get(ResourceType::Geometry).min_block_size, MIB);
        assert_eq!(budgets.get(ResourceType::Geometry).desired_size, 80 * MIB);
        assert_eq!(budgets.get(ResourceType::Uniform).min_block_size, 64 * 1024);
        assert_eq!(budgets.get(ResourceType::Staging).desired_size, 20 * MIB);
        assert_eq!(budgets.get(ResourceType::Image).desired_size, 100 * MIB);
    }

    #[test]
    fn builder_overrides() {
        let config = ContextConfig::default()
            .with_staging_buffer_size(1024)
            .with_fence_timeout(Duration::from_millis(5))
            .with_memory_budgets(
                MemoryBudgets::default().with(ResourceType::Staging, MemoryBudget::new(0, 0)),
            );
        assert_eq!(config.staging_buffer_size, 1024);
        assert_eq!(config.fence_timeout_ns(), 5_000_000);
        assert_eq!(config.memory_budgets.staging.desired_size, 0);
        assert_eq!(ContextConfig::default().fence_timeout_ns(), 2_000_000_000);
    }
}
