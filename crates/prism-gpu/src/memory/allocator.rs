//! Sub-allocating device memory allocator.

use super::backend::{ChunkMemory, MemoryBackend};
use super::pool::{
    chunk_size_for_heap, BlockRequest, MemoryChunk, MemoryPool, ResourceHandle, DEFAULT_CHUNK_SIZE,
};
use ash::vk;
use std::ptr::NonNull;
use thiserror::Error;

/// Allocator failures.
#[derive(Error, Debug)]
pub enum AllocatorError {
    /// Allocating a fresh chunk failed; the memory type is exhausted.
    #[error("Out of pool memory: chunk of {chunk_size} bytes for memory type {memory_type_index} failed ({source})")]
    OutOfPoolMemory {
        memory_type_index: u32,
        chunk_size: u64,
        source: vk::Result,
    },

    /// The request cannot fit in a chunk of this pool even when empty.
    #[error("Request of {size} bytes exceeds the {chunk_size} byte chunk size of memory type {memory_type_index}")]
    RequestTooLarge {
        size: u64,
        chunk_size: u64,
        memory_type_index: u32,
    },

    /// No memory type satisfies both the resource and the requested properties.
    #[error("No memory type in {type_bits:#b} has properties {required:?}")]
    NoCompatibleMemoryType {
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    },

    /// The resource was never allocated here, or was already freed.
    #[error("Resource {0:?} is not registered with the allocator")]
    UnknownResource(ResourceHandle),

    /// Binding the resource to its block failed.
    #[error("Failed to bind {resource:?}: {source}")]
    Bind {
        resource: ResourceHandle,
        source: vk::Result,
    },
}

/// Allocator settings.
#[derive(Clone, Copy, Debug)]
pub struct AllocatorConfig {
    /// Chunk size for memory types on heaps of at least 1 GiB.
    pub default_chunk_size: u64,
    /// `bufferImageGranularity` of the physical device.
    pub buffer_image_granularity: u64,
    /// Allocate chunks with the device address flag.
    pub device_address: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            default_chunk_size: DEFAULT_CHUNK_SIZE,
            buffer_image_granularity: 1,
            device_address: true,
        }
    }
}

/// Where a resource ended up.
#[derive(Clone, Copy, Debug)]
pub struct BlockAllocation {
    pub memory: vk::DeviceMemory,
    pub offset: u64,
    pub size: u64,
    pub memory_type_index: u32,
    /// Host pointer to the block start for host-visible memory.
    pub mapped: Option<NonNull<u8>>,
}

// SAFETY: See `MemoryChunk`; the pointer is into allocator-owned mapped memory.
unsafe impl Send for BlockAllocation {}

/// Usage of one pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub memory_type_index: u32,
    pub chunk_count: usize,
    pub block_count: usize,
    /// Bytes of device memory held in chunks.
    pub reserved_bytes: u64,
    /// Bytes claimed by blocks.
    pub used_bytes: u64,
}

/// Usage of all pools that hold at least one chunk.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    pub pools: Vec<PoolStats>,
}

impl AllocatorStats {
    /// Device memory held across all pools.
    pub fn reserved_bytes(&self) -> u64 {
        self.pools.iter().map(|p| p.reserved_bytes).sum()
    }

    /// Bytes claimed by blocks across all pools.
    pub fn used_bytes(&self) -> u64 {
        self.pools.iter().map(|p| p.used_bytes).sum()
    }

    /// Real device allocations made.
    pub fn chunk_count(&self) -> usize {
        self.pools.iter().map(|p| p.chunk_count).sum()
    }

    /// Live resources.
    pub fn block_count(&self) -> usize {
        self.pools.iter().map(|p| p.block_count).sum()
    }
}

/// Binds many resources into few device allocations.
///
/// One pool per memory type, chunks allocated on demand, first-fit
/// placement. Freed regions are not coalesced or compacted; resources in
/// this renderer live from scene load to teardown.
pub struct ChunkAllocator<B: MemoryBackend> {
    backend: B,
    pools: Vec<MemoryPool>,
    buffer_image_granularity: u64,
}

impl<B: MemoryBackend> ChunkAllocator<B> {
    /// Create one empty pool per memory type.
    pub fn new(
        backend: B,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        config: AllocatorConfig,
    ) -> Self {
        let pools = memory_properties.memory_types
            [..memory_properties.memory_type_count as usize]
            .iter()
            .enumerate()
            .map(|(index, ty)| {
                let heap = memory_properties.memory_heaps[ty.heap_index as usize];
                MemoryPool::new(
                    index as u32,
                    ty.property_flags,
                    chunk_size_for_heap(heap.size, config.default_chunk_size),
                )
            })
            .collect();

        Self {
            backend,
            pools,
            buffer_image_granularity: config.buffer_image_granularity.max(1),
        }
    }

    /// The backend, for device access.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// All pools, indexed by memory type.
    pub fn pools(&self) -> &[MemoryPool] {
        &self.pools
    }

    /// `bufferImageGranularity` applied to every placement.
    pub fn buffer_image_granularity(&self) -> u64 {
        self.buffer_image_granularity
    }

    /// Lowest memory type index allowed by `type_bits` that has all of
    /// `required`.
    pub fn find_memory_type(&self, type_bits: u32, required: vk::MemoryPropertyFlags) -> Option<u32> {
        self.pools
            .iter()
            .find(|pool| {
                type_bits & (1 << pool.memory_type_index) != 0
                    && pool.property_flags.contains(required)
            })
            .map(|pool| pool.memory_type_index)
    }

    /// Bind `resource` to a block of memory with `required` properties.
    pub fn allocate(
        &mut self,
        resource: impl Into<ResourceHandle>,
        required: vk::MemoryPropertyFlags,
    ) -> Result<BlockAllocation, AllocatorError> {
        let resource = resource.into();
        let requirements = self.backend.memory_requirements(resource);
        let memory_type_index = self
            .find_memory_type(requirements.memory_type_bits, required)
            .ok_or(AllocatorError::NoCompatibleMemoryType {
                type_bits: requirements.memory_type_bits,
                required,
            })?;

        let request = BlockRequest {
            size: requirements.size,
            alignment: requirements.alignment.max(1),
        };
        let granularity = self.buffer_image_granularity;
        let pool = &mut self.pools[memory_type_index as usize];

        let (chunk_index, offset) = match pool.find_fit(&request, granularity) {
            Some(fit) => fit,
            None => {
                if request.size > pool.chunk_size {
                    return Err(AllocatorError::RequestTooLarge {
                        size: request.size,
                        chunk_size: pool.chunk_size,
                        memory_type_index,
                    });
                }
                let map = pool
                    .property_flags
                    .contains(vk::MemoryPropertyFlags::HOST_VISIBLE);
                let ChunkMemory { memory, mapped } = self
                    .backend
                    .allocate_chunk(memory_type_index, pool.chunk_size, map)
                    .map_err(|source| AllocatorError::OutOfPoolMemory {
                        memory_type_index,
                        chunk_size: pool.chunk_size,
                        source,
                    })?;
                tracing::info!(
                    memory_type = memory_type_index,
                    chunk = pool.chunks.len(),
                    size_mb = pool.chunk_size as f64 / (1024.0 * 1024.0),
                    "Allocated memory chunk"
                );
                pool.chunks.push(MemoryChunk::new(memory, pool.chunk_size, mapped));
                (pool.chunks.len() - 1, 0)
            }
        };

        let chunk = &mut pool.chunks[chunk_index];
        self.backend
            .bind(resource, chunk.memory, offset)
            .map_err(|source| AllocatorError::Bind { resource, source })?;
        chunk.insert_block(resource, offset, &request, granularity);

        tracing::debug!(
            ?resource,
            memory_type = memory_type_index,
            chunk = chunk_index,
            offset,
            size = request.size,
            "Allocated block"
        );

        Ok(BlockAllocation {
            memory: chunk.memory,
            offset,
            size: request.size,
            memory_type_index,
            // SAFETY: offset + size lies inside the mapped chunk.
            mapped: chunk
                .mapped
                .map(|ptr| unsafe { NonNull::new_unchecked(ptr.as_ptr().add(offset as usize)) }),
        })
    }

    /// Release the block bound to `resource`.
    ///
    /// With `properties` the owning pool is resolved the same way
    /// [`Self::allocate`] chose it, which requires the resource handle to
    /// still be valid; without them every pool is searched.
    pub fn free(
        &mut self,
        resource: impl Into<ResourceHandle>,
        properties: Option<vk::MemoryPropertyFlags>,
    ) -> Result<(), AllocatorError> {
        let resource = resource.into();
        let memory_type_index = match properties {
            Some(required) => {
                let requirements = self.backend.memory_requirements(resource);
                Some(
                    self.find_memory_type(requirements.memory_type_bits, required)
                        .ok_or(AllocatorError::UnknownResource(resource))?,
                )
            }
            None => None,
        };
        self.free_from(resource, memory_type_index)
    }

    /// Release the block bound to `resource` in a known memory type.
    pub fn free_in_type(
        &mut self,
        resource: impl Into<ResourceHandle>,
        memory_type_index: u32,
    ) -> Result<(), AllocatorError> {
        self.free_from(resource.into(), Some(memory_type_index))
    }

    fn free_from(
        &mut self,
        resource: ResourceHandle,
        memory_type_index: Option<u32>,
    ) -> Result<(), AllocatorError> {
        let removed = match memory_type_index {
            Some(index) => self
                .pools
                .get_mut(index as usize)
                .and_then(|pool| pool.remove_block(resource).map(|(c, b)| (index, c, b))),
            None => self.pools.iter_mut().find_map(|pool| {
                let index = pool.memory_type_index;
                pool.remove_block(resource).map(|(c, b)| (index, c, b))
            }),
        };

        let (memory_type, chunk, block) =
            removed.ok_or(AllocatorError::UnknownResource(resource))?;
        tracing::debug!(
            ?resource,
            memory_type,
            chunk,
            offset = block.offset,
            size = block.size,
            "Freed block"
        );
        Ok(())
    }

    /// Memory type and block of a live resource.
    pub fn block_of(&self, resource: impl Into<ResourceHandle>) -> Option<(u32, super::MemoryBlock)> {
        let resource = resource.into();
        self.pools.iter().find_map(|pool| {
            pool.find_block(resource)
                .map(|(_, block)| (pool.memory_type_index, *block))
        })
    }

    /// Current usage of every pool that holds chunks.
    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            pools: self
                .pools
                .iter()
                .filter(|pool| !pool.chunks.is_empty())
                .map(|pool| PoolStats {
                    memory_type_index: pool.memory_type_index,
                    chunk_count: pool.chunks.len(),
                    block_count: pool.chunks.iter().map(|c| c.blocks.len()).sum(),
                    reserved_bytes: pool.chunks.iter().map(|c| c.size).sum(),
                    used_bytes: pool.chunks.iter().map(|c| c.current_size).sum(),
                })
                .collect(),
        }
    }

    /// Free every chunk of every pool.
    ///
    /// Must run after the device is idle and before it is destroyed. Blocks
    /// still registered are reported as leaks.
    pub fn cleanup(&mut self) {
        for pool in &mut self.pools {
            for chunk in pool.chunks.drain(..) {
                for block in &chunk.blocks {
                    tracing::warn!(
                        resource = ?block.resource,
                        memory_type = pool.memory_type_index,
                        size = block.size,
                        "Leaked block at allocator cleanup"
                    );
                }
                self.backend.free_chunk(ChunkMemory {
                    memory: chunk.memory,
                    mapped: chunk.mapped,
                });
            }
        }
    }
}

impl<B: MemoryBackend> Drop for ChunkAllocator<B> {
    fn drop(&mut self) {
        // No-op when cleanup already ran.
        self.cleanup();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::memory::pool::MemoryBlock;
    use ash::vk::Handle;
    use std::collections::HashMap;

    /// In-memory backend: requirements are registered per handle, chunks are
    /// fake handles, binds are recorded.
    #[derive(Default)]
    pub(crate) struct FakeBackend {
        pub requirements: HashMap<ResourceHandle, vk::MemoryRequirements>,
        pub next_memory: u64,
        pub live_chunks: Vec<vk::DeviceMemory>,
        pub binds: Vec<(ResourceHandle, vk::DeviceMemory, u64)>,
        pub fail_allocations: bool,
    }

    impl MemoryBackend for FakeBackend {
        fn memory_requirements(&self, resource: ResourceHandle) -> vk::MemoryRequirements {
            self.requirements[&resource]
        }

        fn allocate_chunk(&mut self, _: u32, _: u64, _: bool) -> Result<ChunkMemory, vk::Result> {
            if self.fail_allocations {
                return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
            }
            self.next_memory += 1;
            let memory = vk::DeviceMemory::from_raw(self.next_memory);
            self.live_chunks.push(memory);
            Ok(ChunkMemory {
                memory,
                mapped: None,
            })
        }

        fn free_chunk(&mut self, chunk: ChunkMemory) {
            self.live_chunks.retain(|m| *m != chunk.memory);
        }

        fn bind(
            &mut self,
            resource: ResourceHandle,
            memory: vk::DeviceMemory,
            offset: u64,
        ) -> Result<(), vk::Result> {
            self.binds.push((resource, memory, offset));
            Ok(())
        }
    }

    /// Memory layout with a device-local type (0), a host-visible type (1)
    /// and a small device-local heap serving type 2.
    fn memory_properties(large_heap: u64, small_heap: u64) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 3,
            memory_heap_count: 2,
            ..Default::default()
        };
        props.memory_heaps[0] = vk::MemoryHeap {
            size: large_heap,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        props.memory_heaps[1] = vk::MemoryHeap {
            size: small_heap,
            flags: vk::MemoryHeapFlags::empty(),
        };
        props.memory_types[0] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            heap_index: 0,
        };
        props.memory_types[1] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
            heap_index: 1,
        };
        props.memory_types[2] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            heap_index: 1,
        };
        props
    }

    fn allocator(chunk_size: u64, granularity: u64) -> ChunkAllocator<FakeBackend> {
        ChunkAllocator::new(
            FakeBackend::default(),
            &memory_properties(8 << 30, 64 << 20),
            AllocatorConfig {
                default_chunk_size: chunk_size,
                buffer_image_granularity: granularity,
                device_address: false,
            },
        )
    }

    fn register(
        alloc: &mut ChunkAllocator<FakeBackend>,
        raw: u64,
        size: u64,
        alignment: u64,
    ) -> vk::Buffer {
        let buffer = vk::Buffer::from_raw(raw);
        alloc.backend.requirements.insert(
            buffer.into(),
            vk::MemoryRequirements {
                size,
                alignment,
                memory_type_bits: 0b111,
            },
        );
        buffer
    }

    fn blocks(alloc: &ChunkAllocator<FakeBackend>, memory_type: usize) -> Vec<MemoryBlock> {
        alloc.pools[memory_type]
            .chunks
            .iter()
            .flat_map(|c| c.blocks.iter().copied())
            .collect()
    }

    #[test]
    fn pools_follow_heap_sizes() {
        let alloc = allocator(DEFAULT_CHUNK_SIZE, 1);
        assert_eq!(alloc.pools().len(), 3);
        assert_eq!(alloc.pools()[0].chunk_size(), DEFAULT_CHUNK_SIZE);
        assert_eq!(alloc.pools()[1].chunk_size(), 8 << 20);
        assert_eq!(alloc.pools()[2].memory_type_index(), 2);
    }

    #[test]
    fn memory_type_lookup_prefers_lowest_index() {
        let alloc = allocator(DEFAULT_CHUNK_SIZE, 1);
        let local = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        assert_eq!(alloc.find_memory_type(0b111, local), Some(0));
        assert_eq!(alloc.find_memory_type(0b110, local), Some(2));
        assert_eq!(
            alloc.find_memory_type(0b111, vk::MemoryPropertyFlags::HOST_VISIBLE),
            Some(1)
        );
        assert_eq!(alloc.find_memory_type(0b001, vk::MemoryPropertyFlags::HOST_VISIBLE), None);
    }

    #[test]
    fn concrete_three_buffer_scenario() {
        let mut alloc = allocator(4096, 256);
        let local = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        let a = register(&mut alloc, 1, 1024, 256);
        let b = register(&mut alloc, 2, 2048, 256);
        let c = register(&mut alloc, 3, 512, 256);

        let offsets: Vec<u64> = [a, b, c]
            .into_iter()
            .map(|buf| alloc.allocate(buf, local).unwrap().offset)
            .collect();
        assert_eq!(offsets, vec![0, 1024, 3072]);
        assert_eq!(alloc.pools()[0].chunks()[0].current_size(), 3584);
        assert_eq!(alloc.stats().chunk_count(), 1);

        alloc.free(b, Some(local)).unwrap();
        assert_eq!(alloc.pools()[0].chunks()[0].current_size(), 1536);

        let d = register(&mut alloc, 4, 2048, 256);
        let reuse = alloc.allocate(d, local).unwrap();
        assert_eq!(reuse.offset, 1024);
        assert_eq!(alloc.stats().chunk_count(), 1);
    }

    #[test]
    fn new_chunk_when_full() {
        let mut alloc = allocator(4096, 1);
        let local = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        let a = register(&mut alloc, 1, 3000, 256);
        let b = register(&mut alloc, 2, 3000, 256);

        let first = alloc.allocate(a, local).unwrap();
        let second = alloc.allocate(b, local).unwrap();
        assert_ne!(first.memory, second.memory);
        assert_eq!(second.offset, 0);
        assert_eq!(alloc.stats().chunk_count(), 2);
        assert_eq!(alloc.backend().binds.len(), 2);
    }

    #[test]
    fn oversized_request_is_reported() {
        let mut alloc = allocator(4096, 1);
        let big = register(&mut alloc, 1, 8192, 256);
        let err = alloc.allocate(big, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap_err();
        assert!(matches!(err, AllocatorError::RequestTooLarge { size: 8192, .. }));
        assert!(alloc.backend().live_chunks.is_empty());
    }

    #[test]
    fn failed_chunk_allocation_is_out_of_pool_memory() {
        let mut alloc = allocator(4096, 1);
        let a = register(&mut alloc, 1, 100, 4);
        alloc.backend.fail_allocations = true;
        let err = alloc.allocate(a, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap_err();
        assert!(matches!(err, AllocatorError::OutOfPoolMemory { memory_type_index: 0, .. }));
    }

    #[test]
    fn incompatible_properties_are_reported() {
        let mut alloc = allocator(4096, 1);
        let a = register(&mut alloc, 1, 100, 4);
        let err = alloc
            .allocate(a, vk::MemoryPropertyFlags::LAZILY_ALLOCATED)
            .unwrap_err();
        assert!(matches!(err, AllocatorError::NoCompatibleMemoryType { .. }));
    }

    #[test]
    fn freeing_unknown_resource_fails() {
        let mut alloc = allocator(4096, 1);
        let a = register(&mut alloc, 1, 100, 4);
        assert!(matches!(
            alloc.free(a, None),
            Err(AllocatorError::UnknownResource(_))
        ));

        alloc.allocate(a, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap();
        alloc.free(a, None).unwrap();
        // Second free of the same handle is a miss too.
        assert!(matches!(
            alloc.free(a, Some(vk::MemoryPropertyFlags::DEVICE_LOCAL)),
            Err(AllocatorError::UnknownResource(_))
        ));
    }

    #[test]
    fn free_without_properties_scans_all_pools() {
        let mut alloc = allocator(4096, 1);
        let staging = register(&mut alloc, 1, 256, 4);
        alloc
            .allocate(staging, vk::MemoryPropertyFlags::HOST_VISIBLE)
            .unwrap();
        assert_eq!(alloc.block_of(staging).map(|(ty, _)| ty), Some(1));
        alloc.free(staging, None).unwrap();
        assert!(alloc.block_of(staging).is_none());
    }

    #[test]
    fn invariants_hold_across_pools_and_chunks() {
        let mut alloc = allocator(64 * 1024, 4096);
        let local = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        let mut live = Vec::new();

        for raw in 1..=120u64 {
            let size = 512 + (raw * 2741) % 20_000;
            let alignment = 1 << (6 + raw % 7);
            let buf = register(&mut alloc, raw, size, alignment);
            let block = alloc.allocate(buf, local).unwrap();
            assert_eq!(block.offset % alignment, 0);
            live.push(buf);

            if raw % 4 == 0 {
                let victim = live.remove((raw as usize * 13) % live.len());
                alloc.free(victim, Some(local)).unwrap();
            }
        }

        for chunk in alloc.pools()[0].chunks() {
            for pair in chunk.blocks().windows(2) {
                assert!(pair[0].end_location <= pair[1].offset);
            }
            for block in chunk.blocks() {
                assert!(block.offset + block.size <= chunk.size());
                if alloc.buffer_image_granularity() > block.alignment {
                    assert_eq!(block.end_location % 4096, 0);
                }
            }
            let sum: u64 = chunk.blocks().iter().map(|b| b.size).sum();
            assert_eq!(chunk.current_size(), sum);
        }
        assert_eq!(blocks(&alloc, 0).len(), live.len());
    }

    #[test]
    fn cleanup_releases_every_chunk() {
        let mut alloc = allocator(4096, 1);
        let local = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        for raw in 1..=4 {
            let buf = register(&mut alloc, raw, 3000, 256);
            alloc.allocate(buf, local).unwrap();
        }
        assert_eq!(alloc.backend().live_chunks.len(), 4);
        alloc.cleanup();
        assert!(alloc.backend().live_chunks.is_empty());
        assert_eq!(alloc.stats(), AllocatorStats::default());
    }
}
