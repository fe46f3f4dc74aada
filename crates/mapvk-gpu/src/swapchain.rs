//! Swapchain management.

use crate::device::VulkanDevice;
use crate::error::{GpuError, Result};
use ash::vk;

/// A surface together with the negotiated format, capabilities and present
/// mode. `capabilities.current_extent` is the extent swapchains are built at.
#[derive(Debug, Clone, Copy)]
pub struct SurfaceDescription {
    pub surface: vk::SurfaceKHR,
    pub format: vk::SurfaceFormatKHR,
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub present_mode: vk::PresentModeKHR,
}

/// Swapchain wrapper.
pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

impl Swapchain {
    /// Create a swapchain at `surface.capabilities.current_extent`.
    pub fn new(
        device: &dyn VulkanDevice,
        surface: &SurfaceDescription,
        old_swapchain: Option<vk::SwapchainKHR>,
    ) -> Result<Self> {
        let capabilities = &surface.capabilities;
        let extent = capabilities.current_extent;

        let mut image_count = capabilities.min_image_count + 1;
        if capabilities.max_image_count > 0 && image_count > capabilities.max_image_count {
            image_count = capabilities.max_image_count;
        }

        let mut usage = vk::ImageUsageFlags::COLOR_ATTACHMENT;
        for extra in [
            vk::ImageUsageFlags::TRANSFER_SRC,
            vk::ImageUsageFlags::TRANSFER_DST,
        ] {
            if capabilities.supported_usage_flags.contains(extra) {
                usage |= extra;
            }
        }

        let composite_alpha = if capabilities
            .supported_composite_alpha
            .contains(vk::CompositeAlphaFlagsKHR::INHERIT)
        {
            vk::CompositeAlphaFlagsKHR::INHERIT
        } else {
            vk::CompositeAlphaFlagsKHR::OPAQUE
        };

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.surface)
            .min_image_count(image_count)
            .image_format(surface.format.format)
            .image_color_space(surface.format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(usage)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(vk::SurfaceTransformFlagsKHR::IDENTITY)
            .composite_alpha(composite_alpha)
            .present_mode(surface.present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain.unwrap_or(vk::SwapchainKHR::null()));

        let swapchain = device
            .create_swapchain(&create_info)
            .map_err(|e| GpuError::SwapchainCreation(e.to_string()))?;

        let images = match device.swapchain_images(swapchain) {
            Ok(images) => images,
            Err(e) => {
                device.destroy_swapchain(swapchain);
                return Err(e.into());
            }
        };

        let mut image_views = Vec::with_capacity(images.len());
        for &image in &images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(surface.format.format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::R,
                    g: vk::ComponentSwizzle::G,
                    b: vk::ComponentSwizzle::B,
                    a: vk::ComponentSwizzle::A,
                })
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            match device.create_image_view(&view_info) {
                Ok(view) => image_views.push(view),
                Err(e) => {
                    for view in image_views {
                        device.destroy_image_view(view);
                    }
                    device.destroy_swapchain(swapchain);
                    return Err(e.into());
                }
            }
        }

        tracing::info!(
            width = extent.width,
            height = extent.height,
            images = images.len(),
            format = ?surface.format.format,
            present_mode = ?surface.present_mode,
            "Created swapchain"
        );

        Ok(Self {
            swapchain,
            images,
            image_views,
            format: surface.format.format,
            extent,
        })
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Destroy the swapchain. It must not be in use.
    pub fn destroy(&self, device: &dyn VulkanDevice) {
        for &view in &self.image_views {
            device.destroy_image_view(view);
        }
        device.destroy_swapchain(self.swapchain);
    }
}

/// Select the surface format, preferring 8-bit UNORM with sRGB non-linear
/// color space.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    const PREFERRED: [vk::Format; 2] = [vk::Format::R8G8B8A8_UNORM, vk::Format::B8G8R8A8_UNORM];

    available
        .iter()
        .find(|format| {
            PREFERRED.contains(&format.format)
                && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| available.first())
        .copied()
}

/// Select the best present mode.
pub fn select_present_mode(available: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        // Prefer FIFO (vsync)
        vk::PresentModeKHR::FIFO
    } else {
        // Prefer mailbox, then immediate
        [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
            .into_iter()
            .find(|mode| available.contains(mode))
            // FIFO is always supported
            .unwrap_or(vk::PresentModeKHR::FIFO)
    }
}

/// Calculate swapchain extent.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_width: u32,
    desired_height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired_width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired_height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}
