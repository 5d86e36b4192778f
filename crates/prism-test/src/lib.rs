//! Test harness for the Prism renderer.
//!
//! Provides a headless GPU context and a ray-traced scene fixture. Tests
//! that need a GPU are `#[ignore]`d; run them with `cargo test -- --ignored`.

pub mod harness;

pub use harness::{AccelerationStructureSet, HeadlessContext, RayTracedScene};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestError {
    #[error("GPU error: {0}")]
    Gpu(#[from] prism_gpu::GpuError),
    #[error("Scene error: {0}")]
    Scene(#[from] prism_core::Error),
}

pub type Result<T> = std::result::Result<T, TestError>;
