//! Instance and logical device bootstrap.

use crate::capabilities::GpuCapabilities;
use crate::device::{AshDevice, VulkanDevice};
use crate::error::{GpuError, Result};
use crate::instance::{create_instance, select_physical_device};
use ash::vk;
use std::ffi::CStr;
use std::sync::Arc;

/// Vulkan instance, physical device and logical device with its graphics
/// queue.
///
/// Must outlive every [`BaseContext`](crate::BaseContext) and
/// [`SurfaceContext`](crate::SurfaceContext) created from it.
pub struct GpuContext {
    // Owns the loaded Vulkan library.
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) device: Arc<AshDevice>,
    pub(crate) capabilities: GpuCapabilities,
    pub(crate) graphics_queue_family: u32,
    pub(crate) graphics_queue: vk::Queue,
}

impl GpuContext {
    /// Device seam handed to the memory, object and frame managers.
    pub fn device(&self) -> Arc<dyn VulkanDevice> {
        self.device.clone()
    }

    /// Get the raw `ash` device.
    pub fn raw_device(&self) -> &ash::Device {
        self.device.raw()
    }

    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    pub fn graphics_queue_family(&self) -> u32 {
        self.graphics_queue_family
    }

    /// Wait for device to be idle.
    pub fn wait_idle(&self) -> Result<()> {
        Ok(self.device.device_wait_idle()?)
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        if Arc::strong_count(&self.device) > 1 {
            tracing::warn!("Destroying the device while it is still referenced");
        }
        unsafe {
            let _ = self.device.raw().device_wait_idle();
            self.device.raw().destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "mapvk".to_string(),
            enable_validation: cfg!(debug_assertions),
        }
    }
}

impl GpuContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    #[must_use]
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    #[must_use]
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Build the GPU context.
    pub fn build(self) -> Result<GpuContext> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        let instance = unsafe { create_instance(&entry, &self.app_name, self.enable_validation) }?;

        let device = unsafe { create_device_for(&instance) };
        let (physical_device, capabilities, graphics_queue_family, device, graphics_queue) =
            match device {
                Ok(parts) => parts,
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            };

        tracing::info!("Selected GPU: {}", capabilities.summary());

        Ok(GpuContext {
            device: Arc::new(AshDevice::new(&instance, device)),
            entry,
            instance,
            physical_device,
            capabilities,
            graphics_queue_family,
            graphics_queue,
        })
    }
}

/// Pick a physical device and create its logical device.
///
/// # Safety
/// The instance must be valid.
unsafe fn create_device_for(
    instance: &ash::Instance,
) -> Result<(vk::PhysicalDevice, GpuCapabilities, u32, ash::Device, vk::Queue)> {
    let physical_device = select_physical_device(instance)?;
    check_device_extensions(instance, physical_device)?;
    let capabilities = GpuCapabilities::query(instance, physical_device);
    let graphics_queue_family = find_graphics_queue_family(instance, physical_device)?;
    let (device, graphics_queue) = create_device(instance, physical_device, graphics_queue_family)?;
    Ok((
        physical_device,
        capabilities,
        graphics_queue_family,
        device,
        graphics_queue,
    ))
}

/// Find the first queue family supporting graphics. Graphics queues also
/// support transfer.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn find_graphics_queue_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<u32> {
    instance
        .get_physical_device_queue_family_properties(physical_device)
        .iter()
        .position(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .and_then(|index| u32::try_from(index).ok())
        .ok_or(GpuError::NoSuitableDevice)
}

/// Required device extensions.
fn required_device_extensions() -> Vec<&'static CStr> {
    vec![
        ash::khr::swapchain::NAME,
        #[cfg(target_os = "macos")]
        ash::khr::portability_subset::NAME,
    ]
}

/// Fail if the device lacks one of [`required_device_extensions`].
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn check_device_extensions(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<()> {
    let available = instance.enumerate_device_extension_properties(physical_device)?;
    for required in required_device_extensions() {
        let found = available
            .iter()
            .any(|props| props.extension_name_as_c_str().is_ok_and(|name| name == required));
        if !found {
            return Err(GpuError::ExtensionNotSupported(
                required.to_string_lossy().into_owned(),
            ));
        }
    }
    Ok(())
}

/// Create the logical device and retrieve the graphics queue.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    graphics_queue_family: u32,
) -> Result<(ash::Device, vk::Queue)> {
    let queue_priority = 1.0_f32;
    let queue_create_info = vk::DeviceQueueCreateInfo::default()
        .queue_family_index(graphics_queue_family)
        .queue_priorities(std::slice::from_ref(&queue_priority));

    let extensions = required_device_extensions();
    let extension_names: Vec<*const std::ffi::c_char> =
        extensions.iter().map(|ext| ext.as_ptr()).collect();

    let features = vk::PhysicalDeviceFeatures::default();
    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(std::slice::from_ref(&queue_create_info))
        .enabled_extension_names(&extension_names)
        .enabled_features(&features);

    let device = instance
        .create_device(physical_device, &device_create_info, None)
        .map_err(GpuError::from)?;
    let graphics_queue = device.get_device_queue(graphics_queue_family, 0);

    Ok((device, graphics_queue))
}
