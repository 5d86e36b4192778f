//! Errors of the device layer.

use crate::memory::AllocatorError;
use ash::vk;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GpuError {
    /// A Vulkan call returned an error code.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// The Vulkan loader library could not be opened.
    #[error("Failed to load Vulkan: {0}")]
    Loader(#[from] ash::LoadingError),

    /// No physical device meets the requested feature set.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Device memory sub-allocation failed.
    #[error(transparent)]
    Allocator(#[from] AllocatorError),

    /// An operation was called on an object that cannot perform it, such as
    /// a ray tracing call on a context created without ray tracing.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

pub type Result<T> = std::result::Result<T, GpuError>;
