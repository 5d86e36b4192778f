//! Owned acceleration structure objects.

use ash::vk;
use prism_gpu::{GpuBuffer, GpuContext, GpuError, Result};

/// The acceleration structure loader of `ctx`, or an error when the
/// context was created without ray tracing.
pub(crate) fn loader(ctx: &GpuContext) -> Result<&ash::khr::acceleration_structure::Device> {
    ctx.acceleration_structure().ok_or_else(|| {
        GpuError::InvalidState("Ray tracing was not enabled on this context".to_string())
    })
}

/// Required alignment of scratch buffer device addresses.
pub(crate) fn scratch_alignment(ctx: &GpuContext) -> Result<u64> {
    ctx.capabilities()
        .ray_tracing
        .map(|rt| u64::from(rt.min_scratch_offset_alignment.max(1)))
        .ok_or_else(|| GpuError::InvalidState("Device cannot ray trace".to_string()))
}

/// Allocate a device-local scratch buffer of at least `size` usable bytes.
///
/// Returns the buffer and its first address aligned to `alignment`; the
/// buffer is over-allocated by `alignment` to make room for the shift.
pub(crate) fn create_scratch_buffer(
    ctx: &GpuContext,
    size: u64,
    alignment: u64,
    name: &str,
) -> Result<(GpuBuffer, vk::DeviceAddress)> {
    let buffer = ctx.create_buffer(
        crate::plan::scratch_buffer_size(size, alignment),
        vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
        name,
    )?;
    let address = crate::plan::scratch_address(buffer.device_address(ctx.device()), alignment);
    Ok((buffer, address))
}

/// A native acceleration structure with the buffer backing it.
///
/// Release with [`AccelerationStructure::destroy`]. Dropping one without
/// destroying it leaks the native object and the backing buffer logs a
/// leak warning.
pub struct AccelerationStructure {
    pub handle: vk::AccelerationStructureKHR,
    pub buffer: GpuBuffer,
    /// Cached once after creation.
    pub device_address: vk::DeviceAddress,
    pub ty: vk::AccelerationStructureTypeKHR,
}

impl AccelerationStructure {
    /// Create an acceleration structure over a new device-local buffer of
    /// `size` bytes.
    pub fn new(
        ctx: &GpuContext,
        ty: vk::AccelerationStructureTypeKHR,
        size: u64,
        name: &str,
    ) -> Result<Self> {
        let loader = loader(ctx)?;

        let buffer = ctx.create_buffer(
            size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            name,
        )?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(buffer.buffer)
            .offset(0)
            .size(size)
            .ty(ty);

        let handle = match unsafe { loader.create_acceleration_structure(&create_info, None) } {
            Ok(handle) => handle,
            Err(e) => {
                if let Err(free_err) = ctx.free_buffer(buffer) {
                    tracing::warn!("Failed to free buffer after an error: {free_err}");
                }
                return Err(e.into());
            }
        };

        let address_info =
            vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(handle);
        let device_address =
            unsafe { loader.get_acceleration_structure_device_address(&address_info) };

        tracing::debug!(name, ?ty, size, device_address, "Created acceleration structure");

        Ok(Self {
            handle,
            buffer,
            device_address,
            ty,
        })
    }

    /// Size of the backing buffer in bytes.
    pub fn size(&self) -> u64 {
        self.buffer.size
    }

    /// Destroy the native object and free its buffer.
    ///
    /// The structure must not be referenced by pending GPU work.
    pub fn destroy(self, ctx: &GpuContext) -> Result<()> {
        let loader = loader(ctx)?;
        unsafe { loader.destroy_acceleration_structure(self.handle, None) };
        ctx.free_buffer(self.buffer)
    }
}
