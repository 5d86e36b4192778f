//! What the selected GPU can do.

use ash::vk;
use prism_core::constants::MIB;
use std::ffi::CStr;

/// GPU vendor, from the PCI vendor id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Device extensions needed for hardware ray tracing.
pub const RAY_TRACING_EXTENSIONS: [&CStr; 3] = [
    ash::khr::acceleration_structure::NAME,
    ash::khr::deferred_host_operations::NAME,
    ash::khr::ray_tracing_pipeline::NAME,
];

/// Whether `device` exposes every extension in `required`.
///
/// # Safety
/// The instance and device must be valid.
pub unsafe fn has_extensions(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
    required: &[&CStr],
) -> bool {
    let available = instance
        .enumerate_device_extension_properties(device)
        .unwrap_or_default();
    required.iter().all(|name| {
        available
            .iter()
            .any(|ext| CStr::from_ptr(ext.extension_name.as_ptr()) == *name)
    })
}

/// Acceleration structure and ray tracing pipeline limits.
#[derive(Debug, Clone, Copy, Default)]
pub struct RayTracingCapabilities {
    pub max_geometry_count: u64,
    pub max_instance_count: u64,
    pub max_primitive_count: u64,
    /// Required alignment of scratch buffer device addresses.
    pub min_scratch_offset_alignment: u32,
    pub shader_group_handle_size: u32,
    pub max_ray_recursion_depth: u32,
}

#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    pub vendor: GpuVendor,
    pub device_name: String,
    pub api_version: u32,
    pub device_local_bytes: u64,
    /// `maxMemoryAllocationCount`; the allocator exists to stay far below it.
    pub max_memory_allocation_count: u32,
    /// Spacing between linear and optimal resources sharing one allocation.
    pub buffer_image_granularity: u64,
    /// Present when the ray tracing extensions and features are all there.
    pub ray_tracing: Option<RayTracingCapabilities>,
}

impl GpuCapabilities {
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let memory = instance.get_physical_device_memory_properties(physical_device);

        let ray_tracing = if has_extensions(instance, physical_device, &RAY_TRACING_EXTENSIONS) {
            query_ray_tracing(instance, physical_device)
        } else {
            None
        };

        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name: CStr::from_ptr(properties.device_name.as_ptr())
                .to_string_lossy()
                .into_owned(),
            api_version: properties.api_version,
            device_local_bytes: memory.memory_heaps[..memory.memory_heap_count as usize]
                .iter()
                .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
                .map(|heap| heap.size)
                .sum(),
            max_memory_allocation_count: properties.limits.max_memory_allocation_count,
            buffer_image_granularity: properties.limits.buffer_image_granularity,
            ray_tracing,
        }
    }

    pub fn supports_ray_tracing(&self) -> bool {
        self.ray_tracing.is_some()
    }

    /// Vulkan 1.3 (synchronization2 and buffer device addresses are core
    /// there), plus ray tracing when requested.
    pub fn meets_requirements(&self, require_ray_tracing: bool) -> bool {
        let version = (
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
        );
        version >= (1, 3) && (!require_ray_tracing || self.supports_ray_tracing())
    }

    /// One-line description for logs.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM - ray tracing: {}",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_bytes / MIB,
            if self.supports_ray_tracing() { "yes" } else { "no" },
        )
    }
}

/// `None` when the device lists the extensions but reports the features off.
unsafe fn query_ray_tracing(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Option<RayTracingCapabilities> {
    let mut as_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
    let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .push_next(&mut as_features)
        .push_next(&mut rt_features);
    instance.get_physical_device_features2(physical_device, &mut features2);

    if as_features.acceleration_structure != vk::TRUE
        || rt_features.ray_tracing_pipeline != vk::TRUE
    {
        return None;
    }

    let mut as_props = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
    let mut rt_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
    let mut props2 = vk::PhysicalDeviceProperties2::default()
        .push_next(&mut as_props)
        .push_next(&mut rt_props);
    instance.get_physical_device_properties2(physical_device, &mut props2);

    Some(RayTracingCapabilities {
        max_geometry_count: as_props.max_geometry_count,
        max_instance_count: as_props.max_instance_count,
        max_primitive_count: as_props.max_primitive_count,
        min_scratch_offset_alignment: as_props.min_acceleration_structure_scratch_offset_alignment,
        shader_group_handle_size: rt_props.shader_group_handle_size,
        max_ray_recursion_depth: rt_props.max_ray_recursion_depth,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities(api_version: u32, ray_tracing: bool) -> GpuCapabilities {
        GpuCapabilities {
            vendor: GpuVendor::Nvidia,
            device_name: "Test GPU".to_string(),
            api_version,
            device_local_bytes: 8192 * MIB,
            max_memory_allocation_count: 4096,
            buffer_image_granularity: 1024,
            ray_tracing: ray_tracing.then(RayTracingCapabilities::default),
        }
    }

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn vulkan_1_3_is_required() {
        assert!(capabilities(vk::API_VERSION_1_3, false).meets_requirements(false));
        assert!(!capabilities(vk::API_VERSION_1_2, true).meets_requirements(false));
    }

    #[test]
    fn ray_tracing_is_optional_unless_requested() {
        let caps = capabilities(vk::API_VERSION_1_3, false);
        assert!(!caps.meets_requirements(true));
        assert!(capabilities(vk::API_VERSION_1_3, true).meets_requirements(true));
    }

    #[test]
    fn summary_reports_memory_and_ray_tracing() {
        let summary = capabilities(vk::API_VERSION_1_3, true).summary();
        assert!(summary.starts_with("Test GPU (Nvidia)"));
        assert!(summary.contains("8192 MB VRAM"));
        assert!(summary.ends_with("ray tracing: yes"));
    }
}
