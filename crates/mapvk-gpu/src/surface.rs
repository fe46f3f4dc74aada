//! Window surfaces.
//!
//! Hides the raw-window-handle plumbing from applications and turns a window
//! into the [`SurfaceDescription`] a [`BaseContext`](crate::BaseContext)
//! builds its swapchain from.

use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::swapchain::{calculate_extent, select_present_mode, select_surface_format, SurfaceDescription};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

/// A Vulkan surface created for a window.
pub struct SurfaceContext {
    pub surface: vk::SurfaceKHR,
    surface_loader: ash::khr::surface::Instance,
}

impl SurfaceContext {
    /// Create a surface for a window.
    ///
    /// # Safety
    /// The window must outlive the surface.
    pub unsafe fn from_window<W>(gpu: &GpuContext, window: &W) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;
        let window_handle = window
            .window_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get window handle: {e}")))?;

        let surface = ash_window::create_surface(
            gpu.entry(),
            gpu.instance(),
            display.as_raw(),
            window_handle.as_raw(),
            None,
        )
        .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;

        let surface_loader = ash::khr::surface::Instance::new(gpu.entry(), gpu.instance());
        let supported = surface_loader.get_physical_device_surface_support(
            gpu.physical_device(),
            gpu.graphics_queue_family(),
            surface,
        );
        if supported != Ok(true) {
            surface_loader.destroy_surface(surface, None);
            return Err(GpuError::SurfaceCreation(
                "Graphics queue cannot present to this surface".into(),
            ));
        }

        Ok(Self {
            surface,
            surface_loader,
        })
    }

    /// Query surface capabilities.
    pub fn capabilities(&self, gpu: &GpuContext) -> Result<SurfaceCapabilities> {
        let physical_device = gpu.physical_device();
        unsafe {
            let capabilities = self
                .surface_loader
                .get_physical_device_surface_capabilities(physical_device, self.surface)?;
            let formats = self
                .surface_loader
                .get_physical_device_surface_formats(physical_device, self.surface)?;
            let present_modes = self
                .surface_loader
                .get_physical_device_surface_present_modes(physical_device, self.surface)?;

            Ok(SurfaceCapabilities {
                capabilities,
                formats,
                present_modes,
            })
        }
    }

    /// Negotiate format, present mode and extent for a window of
    /// `width`x`height`.
    pub fn describe(
        &self,
        gpu: &GpuContext,
        width: u32,
        height: u32,
        vsync: bool,
    ) -> Result<SurfaceDescription> {
        let caps = self.capabilities(gpu)?;
        let format = caps
            .recommended_format()
            .ok_or_else(|| GpuError::SurfaceCreation("Surface reports no formats".into()))?;

        let mut capabilities = caps.capabilities;
        capabilities.current_extent = calculate_extent(&caps.capabilities, width, height);

        Ok(SurfaceDescription {
            surface: self.surface,
            format,
            capabilities,
            present_mode: caps.recommended_present_mode(vsync),
        })
    }

    /// Destroy the surface.
    ///
    /// # Safety
    /// No swapchain may still be built on the surface.
    pub unsafe fn destroy(&self) {
        self.surface_loader.destroy_surface(self.surface, None);
    }
}

/// Surface capabilities query result.
pub struct SurfaceCapabilities {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceCapabilities {
    /// Get the recommended surface format.
    pub fn recommended_format(&self) -> Option<vk::SurfaceFormatKHR> {
        select_surface_format(&self.formats)
    }

    /// Get the recommended present mode.
    pub fn recommended_present_mode(&self, vsync: bool) -> vk::PresentModeKHR {
        select_present_mode(&self.present_modes, vsync)
    }
}
