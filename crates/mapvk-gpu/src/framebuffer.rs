//! Render passes, framebuffers and attachment load/store operations.

use crate::attachment::AttachmentImage;
use crate::device::VulkanDevice;
use crate::error::Result;
use crate::object::ObjectManager;
use ash::vk;
use bitflags::bitflags;
use std::collections::HashMap;
use std::sync::Arc;

bitflags! {
    /// Attachments addressed by a clear or store request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ClearBits: u32 {
        const COLOR = 0b001;
        const DEPTH = 0b010;
        const STENCIL = 0b100;
    }
}

/// Load and store operation of one attachment aspect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentOp {
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
}

impl Default for AttachmentOp {
    fn default() -> Self {
        Self {
            load_op: vk::AttachmentLoadOp::DONT_CARE,
            store_op: vk::AttachmentStoreOp::DONT_CARE,
        }
    }
}

impl AttachmentOp {
    /// Clear wins; otherwise contents are loaded only if they are stored
    /// afterwards.
    fn from_bits(bit: ClearBits, clear: ClearBits, store: ClearBits) -> Self {
        let stored = store.contains(bit);
        let load_op = if clear.contains(bit) {
            vk::AttachmentLoadOp::CLEAR
        } else if stored {
            vk::AttachmentLoadOp::LOAD
        } else {
            vk::AttachmentLoadOp::DONT_CARE
        };
        let store_op = if stored {
            vk::AttachmentStoreOp::STORE
        } else {
            vk::AttachmentStoreOp::DONT_CARE
        };
        Self { load_op, store_op }
    }

    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    fn pack(self) -> u16 {
        (self.load_op.as_raw() as u16 & 0b11) | ((self.store_op.as_raw() as u16 & 0b11) << 2)
    }
}

/// Operations for the color, depth and stencil aspects of a render pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttachmentsOperations {
    pub color: AttachmentOp,
    pub depth: AttachmentOp,
    pub stencil: AttachmentOp,
}

impl AttachmentsOperations {
    /// Derive operations from pending clear and store requests.
    pub fn from_bits(clear: ClearBits, store: ClearBits) -> Self {
        Self {
            color: AttachmentOp::from_bits(ClearBits::COLOR, clear, store),
            depth: AttachmentOp::from_bits(ClearBits::DEPTH, clear, store),
            stencil: AttachmentOp::from_bits(ClearBits::STENCIL, clear, store),
        }
    }

    /// The swapchain is always cleared and its stencil never kept.
    #[must_use]
    pub fn for_swapchain(mut self) -> Self {
        self.color.load_op = vk::AttachmentLoadOp::CLEAR;
        self.depth.load_op = vk::AttachmentLoadOp::CLEAR;
        self.stencil = AttachmentOp::default();
        self
    }

    /// 16-bit signature, two bits per operation.
    pub fn pack(&self) -> u16 {
        self.color.pack() | (self.depth.pack() << 4) | (self.stencil.pack() << 8)
    }
}

/// Format and layouts of one render pass attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentDesc {
    pub format: vk::Format,
    pub initial_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
}

/// A single-subpass render pass with a color and an optional depth/stencil
/// attachment.
#[derive(Debug, Clone, Copy)]
pub struct RenderPassDesc {
    pub operations: AttachmentsOperations,
    pub color: AttachmentDesc,
    pub depth: Option<AttachmentDesc>,
}

impl RenderPassDesc {
    pub fn create(&self, device: &dyn VulkanDevice) -> Result<vk::RenderPass> {
        let ops = &self.operations;
        let mut attachments = vec![vk::AttachmentDescription::default()
            .format(self.color.format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(ops.color.load_op)
            .store_op(ops.color.store_op)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(self.color.initial_layout)
            .final_layout(self.color.final_layout)];
        if let Some(depth) = &self.depth {
            attachments.push(
                vk::AttachmentDescription::default()
                    .format(depth.format)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(ops.depth.load_op)
                    .store_op(ops.depth.store_op)
                    .stencil_load_op(ops.stencil.load_op)
                    .stencil_store_op(ops.stencil.store_op)
                    .initial_layout(depth.initial_layout)
                    .final_layout(depth.final_layout),
            );
        }

        let color_reference = [vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }];
        let depth_reference = vk::AttachmentReference {
            attachment: 1,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };
        let mut subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_reference);
        if self.depth.is_some() {
            subpass = subpass.depth_stencil_attachment(&depth_reference);
        }

        let fragment_tests = vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
            | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
        let dependencies = [
            // Depth write-after-write at the start.
            vk::SubpassDependency::default()
                .src_subpass(vk::SUBPASS_EXTERNAL)
                .dst_subpass(0)
                .src_stage_mask(fragment_tests)
                .dst_stage_mask(fragment_tests)
                .dst_access_mask(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE),
            // Color write-after-write at the start.
            vk::SubpassDependency::default()
                .src_subpass(vk::SUBPASS_EXTERNAL)
                .dst_subpass(0)
                .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
                .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
                .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE),
            // Color read/write before anything reads it afterwards.
            vk::SubpassDependency::default()
                .src_subpass(0)
                .dst_subpass(vk::SUBPASS_EXTERNAL)
                .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
                .dst_stage_mask(vk::PipelineStageFlags::BOTTOM_OF_PIPE)
                .src_access_mask(
                    vk::AccessFlags::COLOR_ATTACHMENT_READ
                        | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                )
                .dst_access_mask(vk::AccessFlags::MEMORY_READ)
                .dependency_flags(vk::DependencyFlags::BY_REGION),
            // Depth write-after-write at the end.
            vk::SubpassDependency::default()
                .src_subpass(0)
                .dst_subpass(vk::SUBPASS_EXTERNAL)
                .src_stage_mask(fragment_tests)
                .dst_stage_mask(vk::PipelineStageFlags::BOTTOM_OF_PIPE)
                .src_access_mask(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE),
        ];

        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(std::slice::from_ref(&subpass))
            .dependencies(&dependencies);
        Ok(device.create_render_pass(&create_info)?)
    }
}

/// Create a framebuffer covering `extent` with the given attachment views.
pub fn create_framebuffer(
    device: &dyn VulkanDevice,
    render_pass: vk::RenderPass,
    views: &[vk::ImageView],
    extent: vk::Extent2D,
) -> Result<vk::Framebuffer> {
    let create_info = vk::FramebufferCreateInfo::default()
        .render_pass(render_pass)
        .attachments(views)
        .width(extent.width)
        .height(extent.height)
        .layers(1);
    Ok(device.create_framebuffer(&create_info)?)
}

/// Handle of an offscreen framebuffer owned by the frame context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FramebufferId(pub(crate) u32);

/// Render pass and framebuffers built for one render target.
#[derive(Debug, Default)]
pub struct FramebufferData {
    pub render_pass: vk::RenderPass,
    /// One per swapchain image, or one for an offscreen target.
    pub framebuffers: Vec<vk::Framebuffer>,
    pub packed_operations: u16,
}

impl FramebufferData {
    pub fn destroy(&self, device: &dyn VulkanDevice) {
        for &framebuffer in &self.framebuffers {
            device.destroy_framebuffer(framebuffer);
        }
        if self.render_pass != vk::RenderPass::null() {
            device.destroy_render_pass(self.render_pass);
        }
    }
}

/// Cached render passes keyed by render target (`None` is the swapchain).
pub type FramebufferCache = HashMap<Option<FramebufferId>, FramebufferData>;

/// An offscreen color target with an optional depth/stencil target.
///
/// Images are (re)created lazily at the size of the surface.
pub struct OffscreenFramebuffer {
    color_format: vk::Format,
    depth_format: Option<vk::Format>,
    extent: vk::Extent2D,
    pub(crate) color: Option<AttachmentImage>,
    pub(crate) depth: Option<AttachmentImage>,
}

impl OffscreenFramebuffer {
    pub fn new(color_format: vk::Format, depth_format: Option<vk::Format>) -> Self {
        Self {
            color_format,
            depth_format,
            extent: vk::Extent2D::default(),
            color: None,
            depth: None,
        }
    }

    pub fn color_format(&self) -> vk::Format {
        self.color_format
    }

    pub fn depth_format(&self) -> Option<vk::Format> {
        self.depth_format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn has_depth_stencil(&self) -> bool {
        self.depth_format.is_some()
    }

    /// View of the color target, for sampling it in a later pass.
    pub fn color_view(&self) -> Option<vk::ImageView> {
        self.color.as_ref().map(AttachmentImage::image_view)
    }

    /// Layout the depth target is currently in.
    pub fn depth_layout(&self) -> vk::ImageLayout {
        self.depth
            .as_ref()
            .map_or(vk::ImageLayout::UNDEFINED, AttachmentImage::current_layout)
    }

    /// Views in attachment order.
    pub fn attachment_views(&self) -> Vec<vk::ImageView> {
        self.color
            .iter()
            .chain(self.depth.iter())
            .map(AttachmentImage::image_view)
            .collect()
    }

    /// Make sure the targets exist at `extent`.
    pub fn set_size(
        &mut self,
        object_manager: &Arc<ObjectManager>,
        extent: vk::Extent2D,
    ) -> Result<()> {
        if self.extent == extent && self.color.is_some() {
            return Ok(());
        }
        self.color = Some(AttachmentImage::color(
            object_manager.clone(),
            self.color_format,
            extent,
        )?);
        self.depth = match self.depth_format {
            Some(format) => Some(AttachmentImage::depth_stencil(
                object_manager.clone(),
                format,
                extent,
            )?),
            None => None,
        };
        self.extent = extent;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextConfig;
    use crate::testing::{fake_capabilities, Call, FakeDevice};

    #[test]
    fn operations_follow_clear_and_store_bits() {
        let ops = AttachmentsOperations::from_bits(ClearBits::COLOR, ClearBits::DEPTH);
        assert_eq!(ops.color.load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(ops.color.store_op, vk::AttachmentStoreOp::DONT_CARE);
        assert_eq!(ops.depth.load_op, vk::AttachmentLoadOp::LOAD);
        assert_eq!(ops.depth.store_op, vk::AttachmentStoreOp::STORE);
        assert_eq!(ops.stencil, AttachmentOp::default());

        let swapchain = AttachmentsOperations::from_bits(ClearBits::empty(), ClearBits::all())
            .for_swapchain();
        assert_eq!(swapchain.color.load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(swapchain.depth.load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(swapchain.color.store_op, vk::AttachmentStoreOp::STORE);
        assert_eq!(swapchain.stencil, AttachmentOp::default());
    }

    #[test]
    fn packing_uses_two_bits_per_operation() {
        // LOAD = 0, CLEAR = 1, DONT_CARE = 2; STORE = 0, DONT_CARE = 1.
        let nothing = AttachmentsOperations::default();
        assert_eq!(nothing.pack(), 0b01_10_01_10_01_10);

        let ops = AttachmentsOperations::from_bits(ClearBits::COLOR, ClearBits::STENCIL);
        assert_eq!(ops.pack(), 0b00_00_01_10_01_01);
        assert_ne!(ops.pack(), ops.for_swapchain().pack());
    }

    #[test]
    fn render_pass_attachment_count_follows_depth() {
        let fake = FakeDevice::default();
        let color = AttachmentDesc {
            format: vk::Format::B8G8R8A8_UNORM,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        };
        let depth = AttachmentDesc {
            format: vk::Format::D24_UNORM_S8_UINT,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };
        let operations = AttachmentsOperations::default().for_swapchain();

        let with_depth = RenderPassDesc {
            operations,
            color,
            depth: Some(depth),
        }
        .create(&fake)
        .unwrap();
        let color_only = RenderPassDesc {
            operations,
            color,
            depth: None,
        }
        .create(&fake)
        .unwrap();

        let calls = fake.calls();
        assert!(calls.contains(&Call::CreateRenderPass {
            render_pass: with_depth,
            attachment_count: 2,
            dependency_count: 4,
            color_load_op: vk::AttachmentLoadOp::CLEAR,
            color_store_op: vk::AttachmentStoreOp::DONT_CARE,
        }));
        assert!(calls.iter().any(|c| matches!(
            c,
            Call::CreateRenderPass { render_pass, attachment_count: 1, .. } if *render_pass == color_only
        )));
    }

    #[test]
    fn offscreen_targets_are_rebuilt_on_resize() {
        let fake = Arc::new(FakeDevice::default());
        let manager = Arc::new(ObjectManager::new(
            fake.clone(),
            &fake_capabilities(),
            &ContextConfig::default(),
        ));
        let mut framebuffer = OffscreenFramebuffer::new(
            vk::Format::R8G8B8A8_UNORM,
            Some(vk::Format::D24_UNORM_S8_UINT),
        );
        assert!(framebuffer.color_view().is_none());

        let small = vk::Extent2D {
            width: 128,
            height: 128,
        };
        framebuffer.set_size(&manager, small).unwrap();
        let first_view = framebuffer.color_view();
        assert_eq!(framebuffer.attachment_views().len(), 2);

        framebuffer.set_size(&manager, small).unwrap();
        assert_eq!(framebuffer.color_view(), first_view);
        assert_eq!(manager.pending_object_count(), 0);

        framebuffer
            .set_size(
                &manager,
                vk::Extent2D {
                    width: 256,
                    height: 64,
                },
            )
            .unwrap();
        assert_ne!(framebuffer.color_view(), first_view);
        assert_eq!(framebuffer.extent().width, 256);
        // Old color and depth images wait for their frame.
        assert_eq!(manager.pending_object_count(), 2);
    }
}
