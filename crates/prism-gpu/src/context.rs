//! The Vulkan device plus the allocator and submission objects built on it.

use crate::capabilities::{GpuCapabilities, RAY_TRACING_EXTENSIONS};
use crate::command::{self, CommandPool};
use crate::debug::DebugMessenger;
use crate::error::{GpuError, Result};
use crate::instance::{create_instance, select_physical_device};
use crate::memory::{
    AllocatorConfig, DeviceBackend, GpuAllocator, GpuBuffer, GpuImage, DEFAULT_CHUNK_SIZE,
};
use ash::vk;
use parking_lot::Mutex;
use std::ffi::CStr;
use std::sync::Arc;

/// Owns everything from the loader entry to the allocator. Resources are
/// released in reverse creation order when the context drops.
pub struct GpuContext {
    /// Keeps the loader library mapped.
    _entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) debug_messenger: Option<DebugMessenger>,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) device: Arc<ash::Device>,
    pub(crate) capabilities: GpuCapabilities,
    pub(crate) allocator: Mutex<GpuAllocator>,

    pub(crate) queue_family: u32,
    pub(crate) queue: vk::Queue,
    pub(crate) command_pool: CommandPool,
    pub(crate) pipeline_cache: vk::PipelineCache,

    pub(crate) acceleration_structure: Option<ash::khr::acceleration_structure::Device>,
}

impl GpuContext {
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    /// The chunked allocator behind every buffer and image.
    ///
    /// The lock is not reentrant: release it before calling any other
    /// context method that allocates.
    pub fn allocator(&self) -> &Mutex<GpuAllocator> {
        &self.allocator
    }

    /// The graphics queue, which also handles compute and transfer.
    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    pub fn command_pool(&self) -> &CommandPool {
        &self.command_pool
    }

    /// Shared by all pipelines.
    pub fn pipeline_cache(&self) -> vk::PipelineCache {
        self.pipeline_cache
    }

    /// The acceleration structure loader, when ray tracing was enabled.
    pub fn acceleration_structure(&self) -> Option<&ash::khr::acceleration_structure::Device> {
        self.acceleration_structure.as_ref()
    }

    /// Lowest memory type index allowed by `type_bits` that has all of
    /// `properties`.
    pub fn find_memory_type(
        &self,
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        self.allocator.lock().find_memory_type(type_bits, properties)
    }

    /// Create a buffer bound to memory with `properties`.
    pub fn create_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
        name: &str,
    ) -> Result<GpuBuffer> {
        self.allocator
            .lock()
            .create_buffer(size, usage, properties, name)
    }

    /// Free a buffer created by [`Self::create_buffer`].
    pub fn free_buffer(&self, buffer: GpuBuffer) -> Result<()> {
        self.allocator.lock().free_buffer(buffer)
    }

    /// Create an image bound to memory with `properties`.
    pub fn create_image(
        &self,
        create_info: &vk::ImageCreateInfo,
        properties: vk::MemoryPropertyFlags,
        name: &str,
    ) -> Result<GpuImage> {
        self.allocator
            .lock()
            .create_image(create_info, properties, name)
    }

    /// Free an image created by [`Self::create_image`].
    pub fn free_image(&self, image: GpuImage) -> Result<()> {
        self.allocator.lock().free_image(image)
    }

    /// Record commands with `f`, submit them and block until they finish.
    pub fn execute_single_time_commands<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(vk::CommandBuffer) -> R,
    {
        unsafe {
            command::execute_single_time_commands(&self.device, &self.command_pool, self.queue, f)
        }
    }

    /// Upload `data` into a new device-local buffer through a staging buffer.
    ///
    /// `TRANSFER_DST` is added to `usage`. The staging buffer is freed before
    /// returning.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn upload_buffer<T: bytemuck::Pod>(
        &self,
        data: &[T],
        usage: vk::BufferUsageFlags,
        name: &str,
    ) -> Result<GpuBuffer> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let size = bytes.len() as u64;
        if size == 0 {
            return Err(GpuError::InvalidState(format!(
                "Cannot upload empty buffer '{name}'"
            )));
        }

        let staging = self.create_buffer(
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            &format!("{name} staging"),
        )?;

        let result = staging.write_bytes(0, bytes).and_then(|()| {
            let buffer = self.create_buffer(
                size,
                usage | vk::BufferUsageFlags::TRANSFER_DST,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                name,
            )?;
            let copied = self.execute_single_time_commands(|cmd| {
                let region = vk::BufferCopy::default().size(size);
                unsafe {
                    self.device
                        .cmd_copy_buffer(cmd, staging.buffer, buffer.buffer, &[region]);
                }
            });
            match copied {
                Ok(()) => Ok(buffer),
                Err(e) => {
                    if let Err(free_err) = self.free_buffer(buffer) {
                        tracing::warn!("Failed to free '{name}' after a failed upload: {free_err}");
                    }
                    Err(e)
                }
            }
        });

        let staging_freed = self.free_buffer(staging);
        let buffer = result?;
        if let Err(e) = staging_freed {
            self.free_buffer(buffer)?;
            return Err(e);
        }
        Ok(buffer)
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.map_err(Into::into)
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                tracing::warn!("device_wait_idle failed during teardown: {e}");
            }

            // Chunks must go before the device that owns them.
            self.allocator.lock().cleanup();

            self.device.destroy_pipeline_cache(self.pipeline_cache, None);
            self.command_pool.destroy(&self.device);
            self.device.destroy_device(None);

            if let Some(messenger) = self.debug_messenger.take() {
                messenger.destroy();
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Configures and creates a [`GpuContext`].
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
    enable_ray_tracing: bool,
    default_chunk_size: u64,
    device_address: bool,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "Prism".to_string(),
            enable_validation: cfg!(debug_assertions),
            enable_ray_tracing: true,
            default_chunk_size: DEFAULT_CHUNK_SIZE,
            device_address: true,
        }
    }
}

impl GpuContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = app_name.into();
        self
    }

    /// Khronos validation layer plus the debug messenger.
    pub fn validation(mut self, on: bool) -> Self {
        self.enable_validation = on;
        self
    }

    /// Require hardware ray tracing and enable its extensions.
    pub fn ray_tracing(mut self, on: bool) -> Self {
        self.enable_ray_tracing = on;
        self
    }

    /// Chunk size for memory types on heaps of at least 1 GiB.
    pub fn default_chunk_size(mut self, size: u64) -> Self {
        self.default_chunk_size = size;
        self
    }

    /// Allocate chunks with `DEVICE_ADDRESS` so buffers with
    /// `SHADER_DEVICE_ADDRESS` usage can live in them.
    ///
    /// Ignored when ray tracing is enabled; acceleration structure builds
    /// address their inputs and scratch through device addresses.
    pub fn device_address(mut self, on: bool) -> Self {
        self.device_address = on;
        self
    }

    /// Allocator settings for a device with the given
    /// `bufferImageGranularity`.
    pub fn allocator_config(&self, buffer_image_granularity: u64) -> AllocatorConfig {
        AllocatorConfig {
            default_chunk_size: self.default_chunk_size,
            buffer_image_granularity,
            device_address: self.device_address || self.enable_ray_tracing,
        }
    }

    /// Load Vulkan, pick a device and set up the allocator.
    pub fn build(self) -> Result<GpuContext> {
        let entry = unsafe { ash::Entry::load() }?;

        let instance =
            unsafe { create_instance(&entry, &self.app_name, self.enable_validation) }?;

        let debug_messenger = if self.enable_validation {
            match unsafe { DebugMessenger::new(&entry, &instance) } {
                Ok(messenger) => Some(messenger),
                Err(e) => {
                    tracing::warn!("Debug messenger unavailable: {e}");
                    None
                }
            }
        } else {
            None
        };

        // Past this point a failure must not leak the instance.
        let setup = unsafe { self.create_device_objects(&instance) };
        let parts = match setup {
            Ok(parts) => parts,
            Err(e) => {
                unsafe {
                    if let Some(messenger) = &debug_messenger {
                        messenger.destroy();
                    }
                    instance.destroy_instance(None);
                }
                return Err(e);
            }
        };

        Ok(GpuContext {
            _entry: entry,
            instance,
            debug_messenger,
            physical_device: parts.physical_device,
            device: parts.device,
            capabilities: parts.capabilities,
            allocator: Mutex::new(parts.allocator),
            queue_family: parts.queue_family,
            queue: parts.queue,
            command_pool: parts.command_pool,
            pipeline_cache: parts.pipeline_cache,
            acceleration_structure: parts.acceleration_structure,
        })
    }

    unsafe fn create_device_objects(&self, instance: &ash::Instance) -> Result<DeviceParts> {
        let physical_device = select_physical_device(instance, self.enable_ray_tracing)?;
        let capabilities = GpuCapabilities::query(instance, physical_device);

        if !capabilities.meets_requirements(self.enable_ray_tracing) {
            return Err(GpuError::NoSuitableDevice);
        }

        tracing::info!(gpu = %capabilities.summary(), "Using physical device");

        let queue_family = find_queue_family(instance, physical_device)?;
        let device = Arc::new(create_device(
            instance,
            physical_device,
            queue_family,
            self.enable_ray_tracing,
        )?);
        let queue = device.get_device_queue(queue_family, 0);

        let command_pool = match CommandPool::transient(&device, queue_family) {
            Ok(pool) => pool,
            Err(e) => {
                device.destroy_device(None);
                return Err(e);
            }
        };

        let cache_info = vk::PipelineCacheCreateInfo::default();
        let pipeline_cache = match device.create_pipeline_cache(&cache_info, None) {
            Ok(cache) => cache,
            Err(e) => {
                command_pool.destroy(&device);
                device.destroy_device(None);
                return Err(e.into());
            }
        };

        let config = self.allocator_config(capabilities.buffer_image_granularity);
        let allocator = GpuAllocator::new(
            DeviceBackend::new(device.clone(), config.device_address),
            &instance.get_physical_device_memory_properties(physical_device),
            config,
        );

        let acceleration_structure = self
            .enable_ray_tracing
            .then(|| ash::khr::acceleration_structure::Device::new(instance, &device));

        Ok(DeviceParts {
            physical_device,
            device,
            capabilities,
            allocator,
            queue_family,
            queue,
            command_pool,
            pipeline_cache,
            acceleration_structure,
        })
    }
}

struct DeviceParts {
    physical_device: vk::PhysicalDevice,
    device: Arc<ash::Device>,
    capabilities: GpuCapabilities,
    allocator: GpuAllocator,
    queue_family: u32,
    queue: vk::Queue,
    command_pool: CommandPool,
    pipeline_cache: vk::PipelineCache,
    acceleration_structure: Option<ash::khr::acceleration_structure::Device>,
}

/// Find a queue family supporting graphics, compute and transfer.
///
/// # Safety
/// Both handles must be valid.
unsafe fn find_queue_family(instance: &ash::Instance, gpu: vk::PhysicalDevice) -> Result<u32> {
    // Graphics families implicitly support transfer
    instance
        .get_physical_device_queue_family_properties(gpu)
        .iter()
        .position(|family| {
            family
                .queue_flags
                .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
        })
        .map(|i| i as u32)
        .ok_or(GpuError::NoSuitableDevice)
}

/// Device extensions enabled at device creation.
pub fn required_device_extensions(ray_tracing: bool) -> Vec<&'static CStr> {
    let mut extensions = Vec::new();
    if ray_tracing {
        extensions.extend(RAY_TRACING_EXTENSIONS);
    }
    extensions
}

/// Create the logical device with a single queue.
///
/// # Safety
/// Both handles must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    gpu: vk::PhysicalDevice,
    family: u32,
    ray_tracing: bool,
) -> Result<ash::Device> {
    let priorities = [1.0_f32];
    let queues = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(family)
        .queue_priorities(&priorities)];

    let extensions = required_device_extensions(ray_tracing);
    let extension_names: Vec<*const std::ffi::c_char> =
        extensions.iter().map(|ext| ext.as_ptr()).collect();

    let mut core13 = vk::PhysicalDeviceVulkan13Features::default()
        .synchronization2(true)
        .maintenance4(true);
    // Device addresses feed scratch, instance and geometry inputs of AS builds.
    let mut core12 = vk::PhysicalDeviceVulkan12Features::default()
        .buffer_device_address(true)
        .descriptor_indexing(true)
        .runtime_descriptor_array(true)
        .scalar_block_layout(true);

    let mut as_features =
        vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default().acceleration_structure(true);
    let mut rt_features =
        vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default().ray_tracing_pipeline(true);

    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .features(vk::PhysicalDeviceFeatures::default().shader_int64(true))
        .push_next(&mut core13)
        .push_next(&mut core12);
    if ray_tracing {
        features2 = features2
            .push_next(&mut as_features)
            .push_next(&mut rt_features);
    }

    let info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queues)
        .enabled_extension_names(&extension_names)
        .push_next(&mut features2);
    Ok(instance.create_device(gpu, &info, None)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let builder = GpuContextBuilder::new();
        assert_eq!(builder.app_name, "Prism");
        assert!(builder.enable_ray_tracing);
        assert_eq!(builder.default_chunk_size, DEFAULT_CHUNK_SIZE);
        assert!(builder.allocator_config(1).device_address);
    }

    #[test]
    fn allocator_config_follows_builder() {
        let config = GpuContextBuilder::new()
            .ray_tracing(false)
            .device_address(false)
            .default_chunk_size(32 << 20)
            .allocator_config(4096);
        assert!(!config.device_address);
        assert_eq!(config.default_chunk_size, 32 << 20);
        assert_eq!(config.buffer_image_granularity, 4096);
    }

    #[test]
    fn ray_tracing_keeps_device_addresses() {
        let config = GpuContextBuilder::new()
            .ray_tracing(true)
            .device_address(false)
            .allocator_config(1);
        assert!(config.device_address);
    }

    #[test]
    fn builder_overrides() {
        let builder = GpuContextBuilder::new()
            .app_name("bench")
            .validation(false)
            .ray_tracing(false)
            .default_chunk_size(64 << 20);
        assert_eq!(builder.app_name, "bench");
        assert!(!builder.enable_validation);
        assert!(!builder.enable_ray_tracing);
        assert_eq!(builder.default_chunk_size, 64 << 20);
    }

    #[test]
    fn ray_tracing_extensions_only_when_enabled() {
        assert!(required_device_extensions(false).is_empty());
        let extensions = required_device_extensions(true);
        assert_eq!(extensions.len(), 3);
        assert!(extensions.contains(&ash::khr::acceleration_structure::NAME));
    }
}
