//! Core types and math for the Prism renderer.
//!
//! This crate provides the data the GPU layers consume:
//! - Flat mesh data (vertices, indices, primitive ranges, materials)
//! - An index-addressed scene graph flattened to world matrices
//! - The [`SceneSource`] seam that scene importers implement
//! - Math helpers shared by the acceleration structure builder

pub mod error;
pub mod math;
pub mod mesh;
pub mod scene;
pub mod source;

pub use error::{Error, Result};
pub use math::{transform_rows_3x4, Aabb};
pub use mesh::{Material, MeshData, MeshId, Primitive, Vertex};
pub use scene::{Node, NodeId, SceneData, SceneGraph, SceneInstance};
pub use source::{grid_cube_nodes, ProceduralGrid, SceneSource};

/// Engine-wide constants
pub mod constants {
    /// Bytes in one mebibyte.
    pub const MIB: u64 = 1024 * 1024;
    /// Bytes in one gibibyte.
    pub const GIB: u64 = 1024 * MIB;
}
