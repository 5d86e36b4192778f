//! Headless GPU fixtures.
//!
//! Nothing here opens a window; every test drives the device through
//! single-time command submissions and inspects the results on the CPU.

use ash::vk;
use prism_core::{grid_cube_nodes, ProceduralGrid, SceneData, SceneSource};
use prism_gpu::{GpuContext, GpuContextBuilder};
use prism_rt::{
    upload_scene, BlasBuildConfig, BlasBuildReport, GpuMesh, RayTracingBuilder, TlasBuildConfig,
    TlasInstance,
};

use crate::Result;

/// A GPU context created without a surface.
pub struct HeadlessContext {
    context: GpuContext,
}

impl HeadlessContext {
    /// Create a context with validation and ray tracing enabled.
    pub fn new() -> Result<Self> {
        let context = GpuContextBuilder::new()
            .app_name("prism-test")
            .validation(true)
            .ray_tracing(true)
            .build()?;
        Ok(Self { context })
    }

    pub fn ctx(&self) -> &GpuContext {
        &self.context
    }
}

/// A procedural grid uploaded to the GPU with its acceleration structures.
pub struct RayTracedScene {
    pub grid: ProceduralGrid,
    pub scene: SceneData,
    pub meshes: Vec<GpuMesh>,
    pub builder: RayTracingBuilder,
    pub blas_report: BlasBuildReport,
}

impl RayTracedScene {
    /// Upload `grid`, build one BLAS per mesh and the TLAS over every instance.
    pub fn new(ctx: &GpuContext, grid: ProceduralGrid, blas_config: BlasBuildConfig) -> Result<Self> {
        let scene = grid.load()?;
        let meshes = upload_scene(ctx, &scene)?;
        let inputs: Vec<_> = meshes
            .iter()
            .map(|mesh| mesh.blas_input(ctx.device()))
            .collect();

        let mut builder = RayTracingBuilder::new(blas_config, TlasBuildConfig::default());
        let blas_report = builder.build_blas(ctx, &inputs)?;
        builder.build_tlas(ctx, &Self::tlas_instances(&scene), false)?;

        Ok(Self {
            grid,
            scene,
            meshes,
            builder,
            blas_report,
        })
    }

    fn tlas_instances(scene: &SceneData) -> Vec<TlasInstance> {
        scene
            .instances()
            .iter()
            .map(TlasInstance::from_scene_instance)
            .collect()
    }

    /// Move every cube to its pose at time `t` and refit the TLAS.
    pub fn animate(&mut self, ctx: &GpuContext, t: f32) -> Result<()> {
        let poses: Vec<_> = grid_cube_nodes(&self.grid)
            .map(|(node, x, z)| (node, self.grid.cube_transform(x, z, t)))
            .collect();
        for (node, transform) in poses {
            self.scene.graph.set_local_transform(node, transform)?;
        }
        self.builder
            .build_tlas(ctx, &Self::tlas_instances(&self.scene), true)?;
        Ok(())
    }

    /// Release the acceleration structures, then the geometry.
    pub fn destroy(self, ctx: &GpuContext) -> Result<()> {
        self.builder.destroy(ctx)?;
        for mesh in self.meshes {
            mesh.destroy(ctx)?;
        }
        Ok(())
    }
}

/// Descriptor set with a single acceleration structure binding.
pub struct AccelerationStructureSet {
    pub layout: vk::DescriptorSetLayout,
    pub pool: vk::DescriptorPool,
    pub set: vk::DescriptorSet,
}

impl AccelerationStructureSet {
    /// # Safety
    /// `device` must outlive the returned objects.
    pub unsafe fn new(device: &ash::Device) -> Result<Self> {
        let bindings = [vk::DescriptorSetLayoutBinding::default()
            .binding(0)
            .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::RAYGEN_KHR)];
        let layout = device
            .create_descriptor_set_layout(
                &vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings),
                None,
            )
            .map_err(prism_gpu::GpuError::from)?;

        let sizes = [vk::DescriptorPoolSize::default()
            .ty(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
            .descriptor_count(1)];
        let pool = match device.create_descriptor_pool(
            &vk::DescriptorPoolCreateInfo::default()
                .max_sets(1)
                .pool_sizes(&sizes),
            None,
        ) {
            Ok(pool) => pool,
            Err(e) => {
                device.destroy_descriptor_set_layout(layout, None);
                return Err(prism_gpu::GpuError::from(e).into());
            }
        };

        let layouts = [layout];
        let set = match device.allocate_descriptor_sets(
            &vk::DescriptorSetAllocateInfo::default()
                .descriptor_pool(pool)
                .set_layouts(&layouts),
        ) {
            Ok(sets) => sets[0],
            Err(e) => {
                device.destroy_descriptor_pool(pool, None);
                device.destroy_descriptor_set_layout(layout, None);
                return Err(prism_gpu::GpuError::from(e).into());
            }
        };

        Ok(Self { layout, pool, set })
    }

    /// # Safety
    /// The set must not be in use by the device.
    pub unsafe fn destroy(self, device: &ash::Device) {
        device.destroy_descriptor_pool(self.pool, None);
        device.destroy_descriptor_set_layout(self.layout, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::constants::MIB;
    use prism_gpu::{AllocatorError, GpuError};

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn test_headless_context_creation() {
        let headless = HeadlessContext::new().unwrap();
        let ctx = headless.ctx();
        assert!(ctx.capabilities().ray_tracing.is_some());
        assert!(ctx.acceleration_structure().is_some());
        assert!(ctx.allocator().lock().backend().device_address());
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn test_buffers_share_one_chunk() {
        let headless = HeadlessContext::new().unwrap();
        let ctx = headless.ctx();
        let usage = vk::BufferUsageFlags::STORAGE_BUFFER;
        let props = vk::MemoryPropertyFlags::DEVICE_LOCAL;

        let a = ctx.create_buffer(MIB, usage, props, "a").unwrap();
        let b = ctx.create_buffer(MIB, usage, props, "b").unwrap();
        let stats = ctx.allocator().lock().stats();
        assert_eq!(stats.chunk_count(), 1);
        assert_eq!(stats.block_count(), 2);
        assert!(stats.used_bytes() >= 2 * MIB);

        let first = a.block().unwrap().offset;
        ctx.free_buffer(a).unwrap();

        // First fit reuses the freed hole at the front of the chunk.
        let c = ctx.create_buffer(MIB, usage, props, "c").unwrap();
        assert_eq!(c.block().unwrap().offset, first);

        ctx.free_buffer(b).unwrap();
        ctx.free_buffer(c).unwrap();
        assert_eq!(ctx.allocator().lock().stats().block_count(), 0);
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn test_oversized_request_is_rejected() {
        let headless = HeadlessContext::new().unwrap();
        let ctx = headless.ctx();
        let largest_chunk = ctx
            .allocator()
            .lock()
            .pools()
            .iter()
            .filter(|pool| {
                pool.property_flags()
                    .contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)
            })
            .map(|pool| pool.chunk_size())
            .max()
            .unwrap();

        let result = ctx.create_buffer(
            largest_chunk + 1,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            "too large",
        );
        assert!(matches!(
            result,
            Err(GpuError::Allocator(AllocatorError::RequestTooLarge { size, chunk_size, .. }))
                if size > chunk_size
        ));
        let stats = ctx.allocator().lock().stats();
        assert_eq!(stats.block_count(), 0);
        assert_eq!(stats.chunk_count(), 0);
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn test_upload_buffer_frees_staging() {
        let headless = HeadlessContext::new().unwrap();
        let ctx = headless.ctx();
        let data: Vec<u32> = (0..1024).collect();

        let buffer = ctx
            .upload_buffer(&data, vk::BufferUsageFlags::STORAGE_BUFFER, "upload")
            .unwrap();
        assert_eq!(buffer.size, 4096);
        assert_eq!(ctx.allocator().lock().stats().block_count(), 1);

        ctx.free_buffer(buffer).unwrap();
        assert!(ctx
            .upload_buffer::<u32>(&[], vk::BufferUsageFlags::STORAGE_BUFFER, "empty")
            .is_err());
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn test_compaction_shrinks_blas() {
        let headless = HeadlessContext::new().unwrap();
        let ctx = headless.ctx();
        let scene = RayTracedScene::new(ctx, ProceduralGrid::new(4), BlasBuildConfig::default())
            .unwrap();

        let report = scene.blas_report;
        assert_eq!(report.count, 2);
        assert_eq!(scene.builder.blas().len(), 2);
        let compacted = report.compacted_bytes.unwrap();
        assert!(compacted <= report.uncompacted_bytes);

        scene.destroy(ctx).unwrap();
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn test_blas_without_compaction() {
        let headless = HeadlessContext::new().unwrap();
        let ctx = headless.ctx();
        let scene = RayTracedScene::new(
            ctx,
            ProceduralGrid::new(2),
            BlasBuildConfig::default().without_compaction(),
        )
        .unwrap();

        assert_eq!(scene.blas_report.compacted_bytes, None);
        assert!(scene
            .builder
            .blas()
            .iter()
            .all(|blas| blas.device_address != 0));

        scene.destroy(ctx).unwrap();
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn test_tlas_update_keeps_handle() {
        let headless = HeadlessContext::new().unwrap();
        let ctx = headless.ctx();
        let mut scene =
            RayTracedScene::new(ctx, ProceduralGrid::new(4), BlasBuildConfig::default()).unwrap();

        let tlas = scene.builder.tlas().unwrap();
        let handle = tlas.handle();
        let address = tlas.device_address();
        assert_eq!(tlas.instance_count(), 1 + 4 * 4);

        for frame in 0..4 {
            scene.animate(ctx, frame as f32 / 60.0).unwrap();
        }

        let tlas = scene.builder.tlas().unwrap();
        assert_eq!(tlas.handle(), handle);
        assert_eq!(tlas.device_address(), address);

        scene.destroy(ctx).unwrap();
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn test_tlas_descriptor_write() {
        let headless = HeadlessContext::new().unwrap();
        let ctx = headless.ctx();
        let scene =
            RayTracedScene::new(ctx, ProceduralGrid::new(1), BlasBuildConfig::default()).unwrap();

        unsafe {
            let set = AccelerationStructureSet::new(ctx.device()).unwrap();
            scene
                .builder
                .write_tlas_descriptor(ctx.device(), set.set, 0)
                .unwrap();
            set.destroy(ctx.device());
        }

        scene.destroy(ctx).unwrap();
    }
}
