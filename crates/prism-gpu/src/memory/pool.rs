//! Pool / chunk / block bookkeeping.
//!
//! A [`MemoryPool`] exists per memory type. It owns [`MemoryChunk`]s, each one
//! real device allocation, and every chunk keeps an offset-ordered list of the
//! [`MemoryBlock`]s bound into it. Placement is first-fit over the gaps
//! between blocks; freed gaps are only found again by that scan.

use ash::vk;
use prism_core::constants::{GIB, MIB};
use std::ptr::NonNull;

/// Chunk size used for heaps of at least [`SMALL_HEAP_LIMIT`] bytes.
pub const DEFAULT_CHUNK_SIZE: u64 = 256 * MIB;

/// Heaps smaller than this get `heap_size / 8` sized chunks.
pub const SMALL_HEAP_LIMIT: u64 = GIB;

/// Chunk size for a pool whose memory type lives on a heap of `heap_size`
/// bytes.
pub fn chunk_size_for_heap(heap_size: u64, default_chunk_size: u64) -> u64 {
    if heap_size < SMALL_HEAP_LIMIT {
        heap_size / 8
    } else {
        default_chunk_size
    }
}

/// Round `value` up to a multiple of `alignment`.
#[inline]
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        value
    } else {
        value.div_ceil(alignment) * alignment
    }
}

/// The resource a block is bound to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceHandle {
    Buffer(vk::Buffer),
    Image(vk::Image),
}

impl From<vk::Buffer> for ResourceHandle {
    fn from(buffer: vk::Buffer) -> Self {
        Self::Buffer(buffer)
    }
}

impl From<vk::Image> for ResourceHandle {
    fn from(image: vk::Image) -> Self {
        Self::Image(image)
    }
}

/// Size and alignment of a placement request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockRequest {
    pub size: u64,
    pub alignment: u64,
}

impl BlockRequest {
    /// First legal start at or after `cursor`.
    ///
    /// The start is aligned to the resource, then to the buffer-image
    /// granularity when that is the coarser constraint.
    #[inline]
    pub fn place(&self, cursor: u64, granularity: u64) -> u64 {
        let start = align_up(cursor, self.alignment);
        if granularity > self.alignment {
            align_up(start, granularity)
        } else {
            start
        }
    }

    /// Where the next block may start if this one is placed at `offset`.
    #[inline]
    pub fn end_location(&self, offset: u64, granularity: u64) -> u64 {
        self.place(offset + self.size, granularity)
    }
}

/// One resource's region inside a chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryBlock {
    pub resource: ResourceHandle,
    pub offset: u64,
    pub size: u64,
    pub alignment: u64,
    /// First offset a following block may use.
    pub end_location: u64,
}

/// One device memory allocation carved into blocks.
#[derive(Debug)]
pub struct MemoryChunk {
    pub(crate) memory: vk::DeviceMemory,
    pub(crate) size: u64,
    pub(crate) current_size: u64,
    pub(crate) blocks: Vec<MemoryBlock>,
    pub(crate) mapped: Option<NonNull<u8>>,
}

// SAFETY: `mapped` points into persistently mapped device memory owned by
// this chunk. Device memory has no thread affinity.
unsafe impl Send for MemoryChunk {}

impl MemoryChunk {
    /// Wrap a fresh device allocation.
    pub fn new(memory: vk::DeviceMemory, size: u64, mapped: Option<NonNull<u8>>) -> Self {
        Self {
            memory,
            size,
            current_size: 0,
            blocks: Vec::new(),
            mapped,
        }
    }

    /// The device memory handle.
    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    /// Total bytes of the allocation.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bytes currently claimed by blocks, excluding padding.
    pub fn current_size(&self) -> u64 {
        self.current_size
    }

    /// Blocks in offset order.
    pub fn blocks(&self) -> &[MemoryBlock] {
        &self.blocks
    }

    /// Host pointer of the chunk start, if the memory is host visible.
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.mapped
    }

    /// First-fit search for a free region.
    pub fn find_region(&self, request: &BlockRequest, granularity: u64) -> Option<u64> {
        if self.size - self.current_size < request.size {
            return None;
        }

        let mut cursor = 0;
        for block in &self.blocks {
            let start = request.place(cursor, granularity);
            if request.end_location(start, granularity) <= block.offset {
                return Some(start);
            }
            cursor = block.end_location;
        }

        let start = request.place(cursor, granularity);
        (start + request.size <= self.size).then_some(start)
    }

    /// Record a block at `offset`, keeping offset order.
    pub fn insert_block(
        &mut self,
        resource: ResourceHandle,
        offset: u64,
        request: &BlockRequest,
        granularity: u64,
    ) -> MemoryBlock {
        let block = MemoryBlock {
            resource,
            offset,
            size: request.size,
            alignment: request.alignment,
            end_location: request.end_location(offset, granularity),
        };
        let index = self.blocks.partition_point(|b| b.offset < offset);
        self.blocks.insert(index, block);
        self.current_size += request.size;
        block
    }

    /// Remove the block bound to `resource`, if this chunk holds it.
    pub fn remove_block(&mut self, resource: ResourceHandle) -> Option<MemoryBlock> {
        let index = self.blocks.iter().position(|b| b.resource == resource)?;
        let block = self.blocks.remove(index);
        self.current_size -= block.size;
        Some(block)
    }
}

/// All chunks of one memory type.
#[derive(Debug)]
pub struct MemoryPool {
    pub(crate) memory_type_index: u32,
    pub(crate) property_flags: vk::MemoryPropertyFlags,
    pub(crate) chunk_size: u64,
    pub(crate) chunks: Vec<MemoryChunk>,
}

impl MemoryPool {
    /// Create an empty pool.
    pub fn new(memory_type_index: u32, property_flags: vk::MemoryPropertyFlags, chunk_size: u64) -> Self {
        Self {
            memory_type_index,
            property_flags,
            chunk_size,
            chunks: Vec::new(),
        }
    }

    /// The memory type this pool serves.
    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    /// Property flags of the memory type.
    pub fn property_flags(&self) -> vk::MemoryPropertyFlags {
        self.property_flags
    }

    /// Size of every chunk this pool allocates.
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Chunks in allocation order.
    pub fn chunks(&self) -> &[MemoryChunk] {
        &self.chunks
    }

    /// First chunk, in allocation order, with a gap that fits.
    pub fn find_fit(&self, request: &BlockRequest, granularity: u64) -> Option<(usize, u64)> {
        self.chunks
            .iter()
            .enumerate()
            .find_map(|(i, chunk)| chunk.find_region(request, granularity).map(|offset| (i, offset)))
    }

    /// Locate the chunk and block bound to `resource`.
    pub fn find_block(&self, resource: ResourceHandle) -> Option<(usize, &MemoryBlock)> {
        self.chunks.iter().enumerate().find_map(|(i, chunk)| {
            chunk
                .blocks
                .iter()
                .find(|b| b.resource == resource)
                .map(|b| (i, b))
        })
    }

    /// Remove the block bound to `resource` from whichever chunk holds it.
    pub fn remove_block(&mut self, resource: ResourceHandle) -> Option<(usize, MemoryBlock)> {
        self.chunks
            .iter_mut()
            .enumerate()
            .find_map(|(i, chunk)| chunk.remove_block(resource).map(|b| (i, b)))
    }
}
