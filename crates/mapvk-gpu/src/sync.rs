//! Per-slot synchronization primitives.

use crate::device::VulkanDevice;
use crate::error::Result;
use crate::MAX_INFLIGHT_FRAMES;
use ash::vk;

/// Synchronization resources of one in-flight slot.
#[derive(Debug, Clone, Copy)]
pub struct FrameSync {
    /// Signaled when the acquired swapchain image is ready.
    pub image_acquired: vk::Semaphore,
    /// Signaled when rendering is complete; presentation waits on it.
    pub render_finished: vk::Semaphore,
    /// Signaled when the slot's submission has completed.
    pub in_flight: vk::Fence,
}

impl FrameSync {
    /// Create the primitives. The fence starts signaled.
    pub fn new(device: &dyn VulkanDevice) -> Result<Self> {
        Ok(Self {
            image_acquired: device.create_semaphore()?,
            render_finished: device.create_semaphore()?,
            in_flight: device.create_fence(true)?,
        })
    }

    /// Wait for the slot's previous submission.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait(&self, device: &dyn VulkanDevice, timeout_ns: u64) -> Result<()> {
        device.wait_for_fence(self.in_flight, timeout_ns)?;
        Ok(())
    }

    /// Reset the fence before reusing the slot.
    pub fn reset(&self, device: &dyn VulkanDevice) -> Result<()> {
        device.reset_fence(self.in_flight)?;
        Ok(())
    }

    /// Destroy the primitives. They must not be in use.
    pub fn destroy(&self, device: &dyn VulkanDevice) {
        device.destroy_semaphore(self.image_acquired);
        device.destroy_semaphore(self.render_finished);
        device.destroy_fence(self.in_flight);
    }
}

/// One [`FrameSync`] per in-flight slot.
pub struct FrameSyncSet {
    frames: Vec<FrameSync>,
}

impl FrameSyncSet {
    pub fn new(device: &dyn VulkanDevice) -> Result<Self> {
        let mut frames = Vec::with_capacity(MAX_INFLIGHT_FRAMES);
        for _ in 0..MAX_INFLIGHT_FRAMES {
            match FrameSync::new(device) {
                Ok(sync) => frames.push(sync),
                Err(e) => {
                    for sync in &frames {
                        sync.destroy(device);
                    }
                    return Err(e);
                }
            }
        }
        Ok(Self { frames })
    }

    /// Sync resources of a slot.
    pub fn get(&self, slot: usize) -> &FrameSync {
        &self.frames[slot]
    }

    /// Destroy all resources. They must not be in use.
    pub fn destroy(&self, device: &dyn VulkanDevice) {
        for sync in &self.frames {
            sync.destroy(device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, FakeDevice};

    #[test]
    fn fences_start_signaled() {
        let fake = FakeDevice::default();
        let set = FrameSyncSet::new(&fake).unwrap();
        for slot in 0..MAX_INFLIGHT_FRAMES {
            let sync = set.get(slot);
            sync.wait(&fake, 0).unwrap();
            sync.reset(&fake).unwrap();
            assert!(sync.wait(&fake, 0).is_err());
        }
        set.destroy(&fake);
        assert_eq!(
            fake.count_calls(|c| matches!(c, Call::DestroyFence(_))),
            MAX_INFLIGHT_FRAMES
        );
    }
}
