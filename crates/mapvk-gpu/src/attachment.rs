//! Render-target images with tracked layouts.

use crate::device::VulkanDevice;
use crate::error::Result;
use crate::object::{ObjectManager, VulkanObject};
use ash::vk;
use std::sync::Arc;

/// Access mask implied by an image layout.
pub fn access_mask(layout: vk::ImageLayout) -> vk::AccessFlags {
    match layout {
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => vk::AccessFlags::TRANSFER_WRITE,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => vk::AccessFlags::TRANSFER_READ,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => {
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
        }
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => {
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
        }
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => vk::AccessFlags::SHADER_READ,
        _ => vk::AccessFlags::empty(),
    }
}

/// Aspect of a depth or depth/stencil format.
pub fn depth_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::DEPTH,
    }
}

/// A color or depth/stencil image used as a render target.
///
/// The image is released through the deferred path when dropped, so it may
/// still be referenced by in-flight frames.
pub struct AttachmentImage {
    object_manager: Arc<ObjectManager>,
    object: VulkanObject,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
    extent: vk::Extent2D,
    layout: vk::ImageLayout,
}

impl AttachmentImage {
    /// Sampled color target.
    pub fn color(
        object_manager: Arc<ObjectManager>,
        format: vk::Format,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        Self::new(
            object_manager,
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            format,
            vk::ImageAspectFlags::COLOR,
            extent,
        )
    }

    /// Depth/stencil target.
    pub fn depth_stencil(
        object_manager: Arc<ObjectManager>,
        format: vk::Format,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        Self::new(
            object_manager,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            format,
            depth_aspect(format),
            extent,
        )
    }

    fn new(
        object_manager: Arc<ObjectManager>,
        usage: vk::ImageUsageFlags,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let object = object_manager.create_image(
            usage,
            format,
            vk::ImageTiling::OPTIMAL,
            aspect,
            extent.width,
            extent.height,
        )?;
        tracing::debug!(
            width = extent.width,
            height = extent.height,
            ?format,
            "Created attachment image"
        );
        Ok(Self {
            object_manager,
            object,
            format,
            aspect,
            extent,
            layout: vk::ImageLayout::UNDEFINED,
        })
    }

    pub fn image(&self) -> vk::Image {
        self.object.image
    }

    pub fn image_view(&self) -> vk::ImageView {
        self.object.image_view
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn current_layout(&self) -> vk::ImageLayout {
        self.layout
    }

    /// Record a barrier moving the image to `new_layout`. Does nothing if the
    /// image is already there.
    pub fn make_layout_transition(
        &mut self,
        device: &dyn VulkanDevice,
        command_buffer: vk::CommandBuffer,
        new_layout: vk::ImageLayout,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    ) {
        if self.layout == new_layout {
            return;
        }

        let barrier = vk::ImageMemoryBarrier::default()
            .src_access_mask(access_mask(self.layout))
            .dst_access_mask(access_mask(new_layout))
            .old_layout(self.layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.object.image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: self.aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        device.cmd_pipeline_barrier(
            command_buffer,
            src_stage,
            dst_stage,
            &[],
            std::slice::from_ref(&barrier),
        );
        self.layout = new_layout;
    }
}

impl Drop for AttachmentImage {
    fn drop(&mut self) {
        self.object_manager
            .destroy_object(std::mem::take(&mut self.object));
    }
}
