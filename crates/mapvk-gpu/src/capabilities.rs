//! GPU capability detection.

use ash::vk;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Arm,
    Qualcomm,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            0x13B5 => Self::Arm,
            0x5143 => Self::Qualcomm,
            other => Self::Other(other),
        }
    }
}

/// Physical device properties the managers are configured from.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Vulkan API version
    pub api_version: u32,
    /// Driver version
    pub driver_version: u32,
    /// Device limits (alignments, allocation count).
    pub limits: vk::PhysicalDeviceLimits,
    /// Memory types and heaps.
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);
        Self::from_properties(&properties, memory_properties)
    }

    /// Build from already queried properties.
    pub fn from_properties(
        properties: &vk::PhysicalDeviceProperties,
        memory_properties: vk::PhysicalDeviceMemoryProperties,
    ) -> Self {
        // SAFETY: Vulkan guarantees the name array is NUL-terminated.
        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name,
            api_version: properties.api_version,
            driver_version: properties.driver_version,
            limits: properties.limits,
            memory_properties,
        }
    }

    /// Renderer name reported to the application.
    pub fn renderer_name(&self) -> &str {
        &self.device_name
    }

    /// Renderer version string, `API:x.y.z/Driver:x.y.z`.
    ///
    /// The driver version uses the legacy 10.10.12 packing, so vendors with
    /// majors above 127 decode correctly.
    pub fn renderer_version(&self) -> String {
        format!(
            "API:{}.{}.{}/Driver:{}.{}.{}",
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.driver_version >> 22,
            (self.driver_version >> 12) & 0x3FF,
            self.driver_version & 0xFFF,
        )
    }

    /// Device-local memory in MB.
    pub fn device_local_memory_mb(&self) -> u64 {
        self.memory_properties
            .memory_heaps
            .iter()
            .take(self.memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum()
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - {} - {} MB VRAM - {} allocations max",
            self.device_name,
            self.vendor,
            self.renderer_version(),
            self.device_local_memory_mb(),
            self.limits.max_memory_allocation_count,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x5143), GpuVendor::Qualcomm);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn renderer_version_format() {
        let properties = vk::PhysicalDeviceProperties {
            api_version: vk::make_api_version(0, 1, 3, 250),
            driver_version: vk::make_api_version(0, 535, 12, 4),
            ..Default::default()
        };
        let caps =
            GpuCapabilities::from_properties(&properties, vk::PhysicalDeviceMemoryProperties::default());
        assert_eq!(caps.renderer_version(), "API:1.3.250/Driver:535.12.4");
        assert_eq!(caps.renderer_name(), "");
    }

    #[test]
    fn driver_major_keeps_all_ten_bits() {
        let properties = vk::PhysicalDeviceProperties {
            api_version: vk::make_api_version(0, 1, 2, 0),
            driver_version: (1023 << 22) | (1023 << 12) | 4095,
            ..Default::default()
        };
        let caps =
            GpuCapabilities::from_properties(&properties, vk::PhysicalDeviceMemoryProperties::default());
        assert_eq!(caps.renderer_version(), "API:1.2.0/Driver:1023.1023.4095");
    }
}
