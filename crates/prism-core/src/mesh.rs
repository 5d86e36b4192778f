//! Flat mesh data as produced by scene importers.
//!
//! A mesh is one vertex array, one index array and a list of primitive
//! ranges into them. Each primitive becomes one triangle geometry of the
//! mesh's bottom-level acceleration structure.

use crate::error::{Error, Result};
use crate::math::Aabb;
use glam::Vec3;
use serde::{Deserialize, Serialize};

/// Index of a mesh inside [`crate::SceneData::meshes`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MeshId(pub u32);

/// Interleaved vertex layout shared by the rasterizer and the hit shaders.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

impl Vertex {
    /// Byte stride of one vertex.
    pub const STRIDE: u64 = std::mem::size_of::<Self>() as u64;

    /// Create a vertex.
    pub const fn new(position: [f32; 3], normal: [f32; 3], uv: [f32; 2]) -> Self {
        Self {
            position,
            normal,
            uv,
        }
    }
}

/// A contiguous index range drawn with one material.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Primitive {
    /// First index in the mesh index array.
    pub first_index: u32,
    /// Number of indices; always a multiple of three.
    pub index_count: u32,
    /// Value added to every index of this range.
    pub vertex_offset: u32,
    /// Index into the scene material table.
    pub material_index: u32,
}

impl Primitive {
    /// Number of triangles in this range.
    #[inline]
    pub fn triangle_count(&self) -> u32 {
        self.index_count / 3
    }
}

/// Material parameters, laid out for a storage buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Material {
    pub base_color: [f32; 4],
    pub emissive: [f32; 4],
    pub roughness: f32,
    pub metallic: f32,
    pub _pad: [f32; 2],
}

impl Default for Material {
    fn default() -> Self {
        Self {
            base_color: [0.8, 0.8, 0.8, 1.0],
            emissive: [0.0; 4],
            roughness: 0.5,
            metallic: 0.0,
            _pad: [0.0; 2],
        }
    }
}

impl Material {
    /// A diffuse material with the given color.
    pub fn diffuse(color: [f32; 3]) -> Self {
        Self {
            base_color: [color[0], color[1], color[2], 1.0],
            ..Self::default()
        }
    }
}

/// Raw geometry of one mesh.
#[derive(Clone, Debug, Default)]
pub struct MeshData {
    pub name: String,
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub primitives: Vec<Primitive>,
}

impl MeshData {
    /// Total triangles over all primitives.
    pub fn triangle_count(&self) -> u32 {
        self.primitives.iter().map(Primitive::triangle_count).sum()
    }

    /// Object-space bounds of all vertices.
    pub fn bounds(&self) -> Aabb {
        Aabb::from_points(self.vertices.iter().map(|v| Vec3::from_array(v.position)))
    }

    /// Check that every primitive range addresses existing indices and
    /// vertices. Acceleration structure builds read these ranges on the GPU
    /// without bounds checks.
    pub fn validate(&self) -> Result<()> {
        if self.primitives.is_empty() {
            return Err(Error::InvalidData(format!("mesh '{}' has no primitives", self.name)));
        }
        let vertex_count = self.vertices.len() as u64;
        for (i, prim) in self.primitives.iter().enumerate() {
            if prim.index_count == 0 || prim.index_count % 3 != 0 {
                return Err(Error::InvalidData(format!(
                    "mesh '{}' primitive {i}: index count {} is not a positive multiple of 3",
                    self.name, prim.index_count
                )));
            }
            let end = u64::from(prim.first_index) + u64::from(prim.index_count);
            if end > self.indices.len() as u64 {
                return Err(Error::OutOfBounds(format!(
                    "mesh '{}' primitive {i}: indices {}..{end} exceed {}",
                    self.name,
                    prim.first_index,
                    self.indices.len()
                )));
            }
            let range = prim.first_index as usize..end as usize;
            if let Some(&bad) = self.indices[range]
                .iter()
                .find(|&&idx| u64::from(idx) + u64::from(prim.vertex_offset) >= vertex_count)
            {
                return Err(Error::OutOfBounds(format!(
                    "mesh '{}' primitive {i}: vertex {} exceeds {vertex_count}",
                    self.name,
                    u64::from(bad) + u64::from(prim.vertex_offset)
                )));
            }
        }
        Ok(())
    }

    /// Unit cube centered at the origin, one primitive.
    pub fn cube(name: impl Into<String>, material_index: u32) -> Self {
        const FACES: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
            ([1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, -1.0]),
            ([-1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]),
            ([0.0, 1.0, 0.0], [0.0, 0.0, -1.0], [1.0, 0.0, 0.0]),
            ([0.0, -1.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0, 0.0]),
            ([0.0, 0.0, 1.0], [0.0, 1.0, 0.0], [1.0, 0.0, 0.0]),
            ([0.0, 0.0, -1.0], [0.0, 1.0, 0.0], [-1.0, 0.0, 0.0]),
        ];

        let mut vertices = Vec::with_capacity(24);
        let mut indices = Vec::with_capacity(36);
        for (normal, up, right) in FACES {
            let n = Vec3::from_array(normal);
            let u = Vec3::from_array(up);
            let r = Vec3::from_array(right);
            let base = vertices.len() as u32;
            for (sx, sy, uv) in [
                (-1.0, -1.0, [0.0, 1.0]),
                (1.0, -1.0, [1.0, 1.0]),
                (1.0, 1.0, [1.0, 0.0]),
                (-1.0, 1.0, [0.0, 0.0]),
            ] {
                let p = (n + r * sx + u * sy) * 0.5;
                vertices.push(Vertex::new(p.to_array(), normal, uv));
            }
            indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }

        Self {
            name: name.into(),
            primitives: vec![Primitive {
                first_index: 0,
                index_count: indices.len() as u32,
                vertex_offset: 0,
                material_index,
            }],
            vertices,
            indices,
        }
    }

    /// Square ground plane in XZ with the given half extent, one primitive.
    pub fn plane(name: impl Into<String>, half_extent: f32, material_index: u32) -> Self {
        let h = half_extent;
        let up = [0.0, 1.0, 0.0];
        let vertices = vec![
            Vertex::new([-h, 0.0, -h], up, [0.0, 0.0]),
            Vertex::new([-h, 0.0, h], up, [0.0, 1.0]),
            Vertex::new([h, 0.0, h], up, [1.0, 1.0]),
            Vertex::new([h, 0.0, -h], up, [1.0, 0.0]),
        ];
        let indices = vec![0, 1, 2, 0, 2, 3];
        Self {
            name: name.into(),
            primitives: vec![Primitive {
                first_index: 0,
                index_count: 6,
                vertex_offset: 0,
                material_index,
            }],
            vertices,
            indices,
        }
    }
}
