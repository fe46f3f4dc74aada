//! Command pool and per-slot command buffers.

use crate::device::VulkanDevice;
use crate::error::Result;
use ash::vk;

/// Command pool whose buffers are reset individually on begin.
pub struct CommandPool {
    pool: vk::CommandPool,
    queue_family: u32,
}

impl CommandPool {
    pub fn new(device: &dyn VulkanDevice, queue_family: u32) -> Result<Self> {
        let pool = device.create_command_pool(queue_family)?;
        Ok(Self { pool, queue_family })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Get the queue family index.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Allocate a primary command buffer.
    pub fn allocate(&self, device: &dyn VulkanDevice) -> Result<vk::CommandBuffer> {
        Ok(device.allocate_command_buffer(self.pool)?)
    }

    pub fn free(&self, device: &dyn VulkanDevice, command_buffer: vk::CommandBuffer) {
        device.free_command_buffer(self.pool, command_buffer);
    }

    /// Destroy the pool. None of its buffers may be pending.
    pub fn destroy(&self, device: &dyn VulkanDevice) {
        device.destroy_command_pool(self.pool);
    }
}

/// Command buffers of one in-flight slot. The memory buffer carries uploads
/// and is submitted ahead of the rendering buffer.
#[derive(Debug, Clone, Copy)]
pub struct FrameCommandBuffers {
    pub memory: vk::CommandBuffer,
    pub rendering: vk::CommandBuffer,
}

impl FrameCommandBuffers {
    pub fn allocate(device: &dyn VulkanDevice, pool: &CommandPool) -> Result<Self> {
        let memory = pool.allocate(device)?;
        let rendering = match pool.allocate(device) {
            Ok(rendering) => rendering,
            Err(e) => {
                pool.free(device, memory);
                return Err(e);
            }
        };
        Ok(Self { memory, rendering })
    }

    /// Begin both buffers for one-time submission.
    pub fn begin(&self, device: &dyn VulkanDevice) -> Result<()> {
        let flags = vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT;
        device.begin_command_buffer(self.memory, flags)?;
        device.begin_command_buffer(self.rendering, flags)?;
        Ok(())
    }

    pub fn end(&self, device: &dyn VulkanDevice) -> Result<()> {
        device.end_command_buffer(self.memory)?;
        device.end_command_buffer(self.rendering)?;
        Ok(())
    }

    /// Submission order: memory first, then rendering.
    pub fn submission_order(&self) -> [vk::CommandBuffer; 2] {
        [self.memory, self.rendering]
    }

    pub fn free(&self, device: &dyn VulkanDevice, pool: &CommandPool) {
        pool.free(device, self.memory);
        pool.free(device, self.rendering);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, FakeDevice};

    #[test]
    fn begin_and_end_both_buffers() {
        let fake = FakeDevice::default();
        let pool = CommandPool::new(&fake, 0).unwrap();
        let buffers = FrameCommandBuffers::allocate(&fake, &pool).unwrap();
        assert_ne!(buffers.memory, buffers.rendering);

        buffers.begin(&fake).unwrap();
        buffers.end(&fake).unwrap();
        assert_eq!(
            fake.calls(),
            vec![
                Call::BeginCommandBuffer(buffers.memory),
                Call::BeginCommandBuffer(buffers.rendering),
                Call::EndCommandBuffer(buffers.memory),
                Call::EndCommandBuffer(buffers.rendering),
            ]
        );
        assert_eq!(
            buffers.submission_order(),
            [buffers.memory, buffers.rendering]
        );
        buffers.free(&fake, &pool);
        pool.destroy(&fake);
    }
}
