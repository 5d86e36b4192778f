//! Instance creation and physical device selection.

use crate::capabilities::{has_extensions, RAY_TRACING_EXTENSIONS};
use crate::error::{GpuError, Result};
use ash::vk;
use std::ffi::{c_char, CStr, CString};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Instance extensions for a context without a surface.
///
/// Surface extensions belong to whoever owns the window.
pub fn instance_extensions(enable_validation: bool) -> Vec<&'static CStr> {
    let mut extensions = Vec::new();
    if cfg!(target_os = "macos") {
        extensions.push(ash::khr::portability_enumeration::NAME);
    }
    if enable_validation {
        extensions.push(ash::ext::debug_utils::NAME);
    }
    extensions
}

/// Create a Vulkan 1.3 instance.
///
/// A missing validation layer is logged and skipped.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    enable_validation: bool,
) -> Result<ash::Instance> {
    let app_name = CString::new(app_name)
        .map_err(|e| GpuError::InvalidState(format!("Invalid application name: {e}")))?;
    let version = vk::make_api_version(0, 0, 1, 0);
    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(version)
        .engine_name(c"Prism")
        .engine_version(version)
        .api_version(vk::API_VERSION_1_3);

    let layers: Vec<*const c_char> = if enable_validation && validation_layer_present(entry)? {
        vec![VALIDATION_LAYER.as_ptr()]
    } else {
        if enable_validation {
            tracing::warn!("Validation layer {VALIDATION_LAYER:?} not available");
        }
        Vec::new()
    };
    let extensions: Vec<*const c_char> = instance_extensions(enable_validation)
        .iter()
        .map(|ext| ext.as_ptr())
        .collect();

    let flags = if cfg!(target_os = "macos") {
        vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR
    } else {
        vk::InstanceCreateFlags::empty()
    };

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_layer_names(&layers)
        .enabled_extension_names(&extensions)
        .flags(flags);
    Ok(entry.create_instance(&create_info, None)?)
}

unsafe fn validation_layer_present(entry: &ash::Entry) -> Result<bool> {
    Ok(entry
        .enumerate_instance_layer_properties()?
        .iter()
        .any(|props| CStr::from_ptr(props.layer_name.as_ptr()) == VALIDATION_LAYER))
}

/// What device selection looks at for one physical device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceCandidate {
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: u32,
    /// Sum of all device-local heaps.
    pub device_local_bytes: u64,
    /// Whether every ray tracing extension is exposed.
    pub ray_tracing: bool,
}

impl DeviceCandidate {
    /// # Safety
    /// The instance and device must be valid.
    pub unsafe fn query(instance: &ash::Instance, device: vk::PhysicalDevice) -> Self {
        let properties = instance.get_physical_device_properties(device);
        let memory = instance.get_physical_device_memory_properties(device);

        Self {
            device_type: properties.device_type,
            api_version: properties.api_version,
            device_local_bytes: memory.memory_heaps[..memory.memory_heap_count as usize]
                .iter()
                .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
                .map(|heap| heap.size)
                .sum(),
            ray_tracing: has_extensions(instance, device, &RAY_TRACING_EXTENSIONS),
        }
    }

    /// Preference score, or `None` if the device cannot be used.
    ///
    /// Discrete beats integrated beats virtual; ray tracing support and
    /// device-local memory (one point per GiB) break ties.
    pub fn score(&self, require_ray_tracing: bool) -> Option<u64> {
        let version = (
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
        );
        if version < (1, 3) || (require_ray_tracing && !self.ray_tracing) {
            return None;
        }

        let kind = match self.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
            _ => 0,
        };
        let ray_tracing = if self.ray_tracing { 500 } else { 0 };
        Some(1 + kind + ray_tracing + self.device_local_bytes / (1 << 30))
    }
}

/// Pick the highest scoring usable physical device.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn select_physical_device(
    instance: &ash::Instance,
    require_ray_tracing: bool,
) -> Result<vk::PhysicalDevice> {
    instance
        .enumerate_physical_devices()?
        .into_iter()
        .filter_map(|device| {
            DeviceCandidate::query(instance, device)
                .score(require_ray_tracing)
                .map(|score| (score, device))
        })
        .max_by_key(|(score, _)| *score)
        .map(|(_, device)| device)
        .ok_or(GpuError::NoSuitableDevice)
}
