//! Hardware ray tracing acceleration structures for the Prism renderer.
//!
//! This crate builds on `VK_KHR_acceleration_structure`:
//! - [`geometry`]: device-local mesh buffers and the triangle inputs of a BLAS
//! - [`blas`]: batched bottom-level builds with optional compaction
//! - [`tlas`]: top-level build and in-place update from instance records
//! - [`builder`]: [`RayTracingBuilder`] owning every structure of a scene
//!
//! Errors are [`prism_gpu::GpuError`]; a context created without ray tracing
//! yields `GpuError::InvalidState`.

pub mod acceleration;
pub mod blas;
pub mod builder;
pub mod geometry;
pub mod plan;
pub mod tlas;

pub use acceleration::AccelerationStructure;
pub use blas::{build_blas, BlasBuildConfig, BlasBuildReport};
pub use builder::RayTracingBuilder;
pub use geometry::{upload_scene, BlasInput, GpuMesh, MeshGeometry, TriangleGeometry};
pub use plan::{BuildCommands, DEFAULT_BATCH_BUDGET};
pub use tlas::{InstanceRecord, Tlas, TlasBuildConfig, TlasInstance};
