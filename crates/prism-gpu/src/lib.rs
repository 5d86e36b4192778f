//! Vulkan device layer for the Prism renderer.
//!
//! This crate provides:
//! - Vulkan instance and device management, with optional ray tracing
//! - GPU capability detection
//! - Chunked sub-allocation of device memory (see [`memory`])
//! - One-shot command submission and upload helpers
//! - Validation messages routed into `tracing`

pub mod capabilities;
pub mod command;
pub mod context;
pub mod debug;
pub mod error;
pub mod instance;
pub mod memory;
pub mod sync;

pub use capabilities::{GpuCapabilities, GpuVendor, RayTracingCapabilities};
pub use context::{GpuContext, GpuContextBuilder};
pub use error::{GpuError, Result};
pub use memory::{
    AllocatorConfig, AllocatorError, AllocatorStats, GpuAllocator, GpuBuffer, GpuImage,
};
pub use sync::{create_fence, wait_for_fence, BuildBarrier};
