//! GPU memory management.
//!
//! Resources are sub-allocated from large device allocations instead of one
//! `vkAllocateMemory` per resource, which would hit
//! `maxMemoryAllocationCount` on real scenes.
//!
//! - [`pool`]: pool / chunk / block bookkeeping and first-fit placement
//! - [`backend`]: the device calls behind the allocator
//! - [`allocator`]: [`ChunkAllocator`] tying the two together
//! - [`resource`]: owned [`GpuBuffer`] and [`GpuImage`] wrappers

pub mod allocator;
pub mod backend;
pub mod pool;
pub mod resource;

pub use allocator::{
    AllocatorConfig, AllocatorError, AllocatorStats, BlockAllocation, ChunkAllocator, PoolStats,
};
pub use backend::{ChunkMemory, DeviceBackend, MemoryBackend};
pub use pool::{
    align_up, chunk_size_for_heap, BlockRequest, MemoryBlock, MemoryChunk, MemoryPool,
    ResourceHandle, DEFAULT_CHUNK_SIZE,
};
pub use resource::{GpuAllocator, GpuBuffer, GpuImage};
