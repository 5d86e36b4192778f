//! Device calls the allocator depends on.

use super::pool::ResourceHandle;
use ash::vk;
use std::ptr::NonNull;
use std::sync::Arc;

/// A freshly allocated chunk of device memory.
#[derive(Clone, Copy, Debug)]
pub struct ChunkMemory {
    pub memory: vk::DeviceMemory,
    /// Host pointer when the chunk was mapped at allocation time.
    pub mapped: Option<NonNull<u8>>,
}

/// The device operations behind [`super::ChunkAllocator`].
///
/// [`DeviceBackend`] forwards to Vulkan; tests substitute an in-memory
/// implementation to exercise placement without a GPU.
pub trait MemoryBackend {
    /// Size, alignment and compatible memory types of a resource.
    fn memory_requirements(&self, resource: ResourceHandle) -> vk::MemoryRequirements;

    /// Allocate one chunk, mapping it persistently when `map` is set.
    fn allocate_chunk(
        &mut self,
        memory_type_index: u32,
        size: u64,
        map: bool,
    ) -> Result<ChunkMemory, vk::Result>;

    /// Release a chunk previously returned by [`Self::allocate_chunk`].
    fn free_chunk(&mut self, chunk: ChunkMemory);

    /// Bind a resource to `memory` at `offset`.
    fn bind(
        &mut self,
        resource: ResourceHandle,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> Result<(), vk::Result>;
}

/// [`MemoryBackend`] backed by a logical device.
pub struct DeviceBackend {
    device: Arc<ash::Device>,
    device_address: bool,
}

impl DeviceBackend {
    /// Wrap a device.
    ///
    /// When `device_address` is set every chunk is allocated with
    /// `VK_MEMORY_ALLOCATE_DEVICE_ADDRESS_BIT` so buffers with
    /// `SHADER_DEVICE_ADDRESS` usage may be bound anywhere.
    ///
    /// # Safety
    /// The device must outlive the backend and every chunk it allocates.
    pub unsafe fn new(device: Arc<ash::Device>, device_address: bool) -> Self {
        Self {
            device,
            device_address,
        }
    }

    /// The logical device.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Whether chunks carry `VK_MEMORY_ALLOCATE_DEVICE_ADDRESS_BIT`.
    pub fn device_address(&self) -> bool {
        self.device_address
    }
}

impl MemoryBackend for DeviceBackend {
    fn memory_requirements(&self, resource: ResourceHandle) -> vk::MemoryRequirements {
        // SAFETY: Handles passed to the allocator are live resources of this device.
        unsafe {
            match resource {
                ResourceHandle::Buffer(buffer) => self.device.get_buffer_memory_requirements(buffer),
                ResourceHandle::Image(image) => self.device.get_image_memory_requirements(image),
            }
        }
    }

    fn allocate_chunk(
        &mut self,
        memory_type_index: u32,
        size: u64,
        map: bool,
    ) -> Result<ChunkMemory, vk::Result> {
        let mut flags_info =
            vk::MemoryAllocateFlagsInfo::default().flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
        let mut alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type_index);
        if self.device_address {
            alloc_info = alloc_info.push_next(&mut flags_info);
        }

        // SAFETY: The device is valid per the constructor contract.
        let memory = unsafe { self.device.allocate_memory(&alloc_info, None)? };

        let mapped = if map {
            // SAFETY: The memory is host visible (caller checked) and not mapped yet.
            let ptr = unsafe {
                self.device
                    .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
            };
            match ptr {
                Ok(ptr) => NonNull::new(ptr.cast::<u8>()),
                Err(e) => {
                    // SAFETY: Nothing is bound to the memory yet.
                    unsafe { self.device.free_memory(memory, None) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        Ok(ChunkMemory { memory, mapped })
    }

    fn free_chunk(&mut self, chunk: ChunkMemory) {
        // SAFETY: The allocator frees a chunk once, after every block is gone
        // or at shutdown after the device went idle.
        unsafe {
            if chunk.mapped.is_some() {
                self.device.unmap_memory(chunk.memory);
            }
            self.device.free_memory(chunk.memory, None);
        }
    }

    fn bind(
        &mut self,
        resource: ResourceHandle,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> Result<(), vk::Result> {
        // SAFETY: The offset comes from the placement search and respects the
        // resource's alignment and size.
        unsafe {
            match resource {
                ResourceHandle::Buffer(buffer) => {
                    self.device.bind_buffer_memory(buffer, memory, offset)
                }
                ResourceHandle::Image(image) => self.device.bind_image_memory(image, memory, offset),
            }
        }
    }
}
