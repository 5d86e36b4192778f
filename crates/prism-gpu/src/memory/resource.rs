//! Owned buffers and images bound through the allocator.

use super::allocator::{AllocatorError, BlockAllocation, ChunkAllocator};
use super::backend::DeviceBackend;
use crate::error::{GpuError, Result};
use ash::vk;

/// The allocator used with a real device.
pub type GpuAllocator = ChunkAllocator<DeviceBackend>;

/// A GPU buffer with its memory block.
///
/// Release it with [`GpuAllocator::free_buffer`], which consumes the value,
/// so a buffer cannot be freed twice. Dropping a live buffer leaks it and
/// logs a warning.
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    block: Option<BlockAllocation>,
}

impl GpuBuffer {
    /// The memory block backing this buffer.
    pub fn block(&self) -> Option<&BlockAllocation> {
        self.block.as_ref()
    }

    /// Only meaningful for buffers created with `SHADER_DEVICE_ADDRESS`.
    pub fn device_address(&self, device: &ash::Device) -> vk::DeviceAddress {
        // SAFETY: The buffer is live and bound to memory until it is freed,
        // and `device` is the device that created it.
        unsafe {
            let info = vk::BufferDeviceAddressInfo::default().buffer(self.buffer);
            device.get_buffer_device_address(&info)
        }
    }

    /// Host pointer to the buffer contents, if its memory is host visible.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.block.as_ref().and_then(|b| b.mapped).map(|p| p.as_ptr())
    }

    /// Copy `data` to the start of a host-visible buffer.
    pub fn write<T: bytemuck::Pod>(&self, data: &[T]) -> Result<()> {
        self.write_bytes(0, bytemuck::cast_slice(data))
    }

    /// Copy `data` to `offset` in a host-visible buffer.
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        let Some(ptr) = self.mapped_ptr() else {
            return Err(GpuError::InvalidState(
                "write to a buffer without host-visible memory".into(),
            ));
        };
        match offset.checked_add(data.len() as u64) {
            Some(end) if end <= self.size => {}
            _ => {
                return Err(GpuError::InvalidState(format!(
                    "write of {} bytes at offset {offset} overruns buffer of {} bytes",
                    data.len(),
                    self.size
                )))
            }
        }

        // SAFETY: The range was checked against the buffer size and the block
        // is mapped for as long as the buffer lives.
        unsafe {
            ptr.add(offset as usize)
                .copy_from_nonoverlapping(data.as_ptr(), data.len());
        }
        Ok(())
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        if self.buffer != vk::Buffer::null() {
            tracing::warn!(buffer = ?self.buffer, size = self.size, "GpuBuffer dropped without being freed");
        }
    }
}

/// A GPU image with its memory block.
pub struct GpuImage {
    pub image: vk::Image,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    block: Option<BlockAllocation>,
}

impl GpuImage {
    /// The memory block backing this image.
    pub fn block(&self) -> Option<&BlockAllocation> {
        self.block.as_ref()
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        if self.image != vk::Image::null() {
            tracing::warn!(image = ?self.image, "GpuImage dropped without being freed");
        }
    }
}

impl GpuAllocator {
    fn device(&self) -> &ash::Device {
        self.backend().device()
    }

    /// Create a buffer and bind it to memory with `properties`.
    pub fn create_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
        name: &str,
    ) -> Result<GpuBuffer> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        // SAFETY: The backend's device outlives the allocator.
        let buffer = unsafe { self.device().create_buffer(&buffer_info, None)? };

        let block = match self.allocate(buffer, properties) {
            Ok(block) => block,
            Err(e) => {
                // SAFETY: The buffer was never bound or handed out.
                unsafe { self.device().destroy_buffer(buffer, None) };
                return Err(e.into());
            }
        };

        tracing::trace!(name, size, offset = block.offset, "Created buffer");

        Ok(GpuBuffer {
            buffer,
            size,
            usage,
            block: Some(block),
        })
    }

    /// Free a buffer's block and destroy the buffer.
    pub fn free_buffer(&mut self, mut buffer: GpuBuffer) -> Result<()> {
        let freed = match buffer.block.take() {
            Some(block) => self.free_in_type(buffer.buffer, block.memory_type_index),
            None => Err(AllocatorError::UnknownResource(buffer.buffer.into())),
        };

        // SAFETY: The caller gave up the buffer; its block is already released.
        unsafe { self.device().destroy_buffer(buffer.buffer, None) };
        buffer.buffer = vk::Buffer::null();

        freed.map_err(GpuError::from)
    }

    /// Create an image and bind it to memory with `properties`.
    pub fn create_image(
        &mut self,
        create_info: &vk::ImageCreateInfo,
        properties: vk::MemoryPropertyFlags,
        name: &str,
    ) -> Result<GpuImage> {
        // SAFETY: The backend's device outlives the allocator.
        let image = unsafe { self.device().create_image(create_info, None)? };

        let block = match self.allocate(image, properties) {
            Ok(block) => block,
            Err(e) => {
                // SAFETY: The image was never bound or handed out.
                unsafe { self.device().destroy_image(image, None) };
                return Err(e.into());
            }
        };

        tracing::trace!(name, offset = block.offset, size = block.size, "Created image");

        Ok(GpuImage {
            image,
            format: create_info.format,
            extent: create_info.extent,
            block: Some(block),
        })
    }

    /// Free an image's block and destroy the image.
    pub fn free_image(&mut self, mut image: GpuImage) -> Result<()> {
        let freed = match image.block.take() {
            Some(block) => self.free_in_type(image.image, block.memory_type_index),
            None => Err(AllocatorError::UnknownResource(image.image.into())),
        };

        // SAFETY: The caller gave up the image; its block is already released.
        unsafe { self.device().destroy_image(image.image, None) };
        image.image = vk::Image::null();

        freed.map_err(GpuError::from)
    }
}
