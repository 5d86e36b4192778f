//! Mesh geometry as consumed by bottom-level builds.

use ash::vk;
use prism_core::{MeshData, Primitive, SceneData, Vertex};
use prism_gpu::{GpuBuffer, GpuContext, Result};

/// Usage shared by vertex and index buffers that feed acceleration structure
/// builds and are read by hit shaders through their device address.
const GEOMETRY_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR.as_raw()
        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS.as_raw()
        | vk::BufferUsageFlags::STORAGE_BUFFER.as_raw(),
);

/// Device addresses and layout of one uploaded mesh.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MeshGeometry {
    pub vertex_address: vk::DeviceAddress,
    pub index_address: vk::DeviceAddress,
    pub vertex_stride: u64,
    pub vertex_count: u32,
}

/// One triangle geometry of a BLAS: a primitive range of a mesh.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TriangleGeometry {
    pub vertex_address: vk::DeviceAddress,
    pub index_address: vk::DeviceAddress,
    pub vertex_stride: u64,
    /// Highest vertex index the build may read.
    pub max_vertex: u32,
    pub primitive_count: u32,
    /// Byte offset of the first index.
    pub primitive_offset: u32,
    /// Added to every index before fetching a vertex.
    pub first_vertex: u32,
}

impl TriangleGeometry {
    /// Geometry covering `primitive` of `mesh`.
    pub fn from_primitive(mesh: &MeshGeometry, primitive: &Primitive) -> Self {
        Self {
            vertex_address: mesh.vertex_address,
            index_address: mesh.index_address,
            vertex_stride: mesh.vertex_stride,
            max_vertex: mesh.vertex_count.saturating_sub(1),
            primitive_count: primitive.triangle_count(),
            primitive_offset: primitive.first_index * std::mem::size_of::<u32>() as u32,
            first_vertex: primitive.vertex_offset,
        }
    }

    /// Opaque triangle geometry with `R32G32B32_SFLOAT` positions and
    /// 32-bit indices.
    pub fn geometry(&self) -> vk::AccelerationStructureGeometryKHR<'static> {
        vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .flags(vk::GeometryFlagsKHR::OPAQUE)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                triangles: vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                    .vertex_format(vk::Format::R32G32B32_SFLOAT)
                    .vertex_data(vk::DeviceOrHostAddressConstKHR {
                        device_address: self.vertex_address,
                    })
                    .vertex_stride(self.vertex_stride)
                    .max_vertex(self.max_vertex)
                    .index_type(vk::IndexType::UINT32)
                    .index_data(vk::DeviceOrHostAddressConstKHR {
                        device_address: self.index_address,
                    }),
            })
    }

    /// Range info matching [`Self::geometry`].
    pub fn build_range(&self) -> vk::AccelerationStructureBuildRangeInfoKHR {
        vk::AccelerationStructureBuildRangeInfoKHR::default()
            .primitive_count(self.primitive_count)
            .primitive_offset(self.primitive_offset)
            .first_vertex(self.first_vertex)
            .transform_offset(0)
    }
}

/// Everything needed to build one BLAS.
#[derive(Clone, Debug, Default)]
pub struct BlasInput {
    pub geometries: Vec<TriangleGeometry>,
    /// Added to the batch flags for this BLAS.
    pub flags: vk::BuildAccelerationStructureFlagsKHR,
}

impl BlasInput {
    /// One geometry per primitive of the mesh.
    pub fn from_mesh(mesh: &MeshGeometry, primitives: &[Primitive]) -> Self {
        Self {
            geometries: primitives
                .iter()
                .map(|primitive| TriangleGeometry::from_primitive(mesh, primitive))
                .collect(),
            flags: vk::BuildAccelerationStructureFlagsKHR::empty(),
        }
    }

    /// Set extra build flags.
    pub fn with_flags(mut self, flags: vk::BuildAccelerationStructureFlagsKHR) -> Self {
        self.flags = flags;
        self
    }

    /// Triangle count per geometry, as passed to the size query.
    pub fn primitive_counts(&self) -> Vec<u32> {
        self.geometries.iter().map(|g| g.primitive_count).collect()
    }

    /// Total triangles across all geometries.
    pub fn triangle_count(&self) -> u64 {
        self.geometries
            .iter()
            .map(|g| u64::from(g.primitive_count))
            .sum()
    }
}

/// A mesh uploaded to device-local memory.
pub struct GpuMesh {
    pub name: String,
    pub vertex_buffer: GpuBuffer,
    pub index_buffer: GpuBuffer,
    pub vertex_count: u32,
    pub index_count: u32,
    pub primitives: Vec<Primitive>,
}

impl GpuMesh {
    /// Upload vertices and indices through staging buffers.
    pub fn upload(ctx: &GpuContext, mesh: &MeshData) -> Result<Self> {
        let vertex_buffer = ctx.upload_buffer(
            &mesh.vertices,
            GEOMETRY_USAGE | vk::BufferUsageFlags::VERTEX_BUFFER,
            &format!("{} vertices", mesh.name),
        )?;
        let index_buffer = match ctx.upload_buffer(
            &mesh.indices,
            GEOMETRY_USAGE | vk::BufferUsageFlags::INDEX_BUFFER,
            &format!("{} indices", mesh.name),
        ) {
            Ok(buffer) => buffer,
            Err(e) => {
                if let Err(free_err) = ctx.free_buffer(vertex_buffer) {
                    tracing::warn!("Failed to free vertex buffer after an error: {free_err}");
                }
                return Err(e);
            }
        };

        Ok(Self {
            name: mesh.name.clone(),
            vertex_buffer,
            index_buffer,
            vertex_count: mesh.vertices.len() as u32,
            index_count: mesh.indices.len() as u32,
            primitives: mesh.primitives.clone(),
        })
    }

    /// Device addresses of the uploaded buffers.
    pub fn geometry(&self, device: &ash::Device) -> MeshGeometry {
        MeshGeometry {
            vertex_address: self.vertex_buffer.device_address(device),
            index_address: self.index_buffer.device_address(device),
            vertex_stride: Vertex::STRIDE,
            vertex_count: self.vertex_count,
        }
    }

    /// BLAS input covering every primitive of this mesh.
    pub fn blas_input(&self, device: &ash::Device) -> BlasInput {
        BlasInput::from_mesh(&self.geometry(device), &self.primitives)
    }

    /// Free both buffers.
    pub fn destroy(self, ctx: &GpuContext) -> Result<()> {
        ctx.free_buffer(self.vertex_buffer)?;
        ctx.free_buffer(self.index_buffer)
    }
}

/// Upload every mesh of a scene, in mesh order.
pub fn upload_scene(ctx: &GpuContext, scene: &SceneData) -> Result<Vec<GpuMesh>> {
    let mut meshes = Vec::with_capacity(scene.meshes.len());
    for mesh in &scene.meshes {
        meshes.push(GpuMesh::upload(ctx, mesh)?);
    }

    tracing::info!(
        meshes = meshes.len(),
        triangles = scene.meshes.iter().map(MeshData::triangle_count).sum::<u32>(),
        "Uploaded scene geometry"
    );
    Ok(meshes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mesh() -> MeshGeometry {
        MeshGeometry {
            vertex_address: 0x1000,
            index_address: 0x8000,
            vertex_stride: Vertex::STRIDE,
            vertex_count: 24,
        }
    }

    #[test]
    fn primitive_range_maps_to_build_range() {
        let primitive = Primitive {
            first_index: 12,
            index_count: 18,
            vertex_offset: 8,
            material_index: 0,
        };
        let geometry = TriangleGeometry::from_primitive(&mesh(), &primitive);

        assert_eq!(geometry.primitive_count, 6);
        assert_eq!(geometry.primitive_offset, 48);
        assert_eq!(geometry.first_vertex, 8);
        assert_eq!(geometry.max_vertex, 23);

        let range = geometry.build_range();
        assert_eq!(range.primitive_count, 6);
        assert_eq!(range.primitive_offset, 48);
        assert_eq!(range.first_vertex, 8);
        assert_eq!(range.transform_offset, 0);
    }

    #[test]
    fn geometry_is_opaque_triangles() {
        let primitive = Primitive {
            first_index: 0,
            index_count: 36,
            vertex_offset: 0,
            material_index: 0,
        };
        let geometry = TriangleGeometry::from_primitive(&mesh(), &primitive).geometry();

        assert_eq!(geometry.geometry_type, vk::GeometryTypeKHR::TRIANGLES);
        assert_eq!(geometry.flags, vk::GeometryFlagsKHR::OPAQUE);
        // SAFETY: The union was written through its `triangles` member.
        let triangles = unsafe { geometry.geometry.triangles };
        assert_eq!(triangles.vertex_stride, 32);
        assert_eq!(triangles.index_type, vk::IndexType::UINT32);
        assert_eq!(unsafe { triangles.vertex_data.device_address }, 0x1000);
        assert_eq!(unsafe { triangles.index_data.device_address }, 0x8000);
    }

    #[test]
    fn blas_input_has_one_geometry_per_primitive() {
        let cube = MeshData::cube("cube", 0);
        let input = BlasInput::from_mesh(&mesh(), &cube.primitives);

        assert_eq!(input.geometries.len(), cube.primitives.len());
        assert_eq!(input.triangle_count(), u64::from(cube.triangle_count()));
        assert_eq!(
            input.primitive_counts(),
            cube.primitives
                .iter()
                .map(Primitive::triangle_count)
                .collect::<Vec<_>>()
        );
        assert!(input.flags.is_empty());
    }

    #[test]
    fn empty_mesh_has_no_vertices_to_read() {
        let geometry = MeshGeometry {
            vertex_count: 0,
            ..mesh()
        };
        let primitive = Primitive {
            first_index: 0,
            index_count: 0,
            vertex_offset: 0,
            material_index: 0,
        };
        let triangle = TriangleGeometry::from_primitive(&geometry, &primitive);
        assert_eq!(triangle.max_vertex, 0);
        assert_eq!(triangle.primitive_count, 0);
    }
}
