//! Top-level acceleration structure.

use crate::acceleration::{create_scratch_buffer, loader, scratch_alignment, AccelerationStructure};
use ash::vk;
use glam::Mat4;
use prism_core::{transform_rows_3x4, SceneInstance};
use prism_gpu::sync::BuildBarrier;
use prism_gpu::{GpuBuffer, GpuContext, GpuError, Result};

/// Instance layout consumed by top-level builds
/// (`VkAccelerationStructureInstanceKHR`, 64 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct InstanceRecord {
    /// Row-major 3x4 object-to-world transform.
    pub transform: [f32; 12],
    /// Custom index in the low 24 bits, visibility mask in the high 8.
    pub custom_index_and_mask: u32,
    /// Hit group record offset in the low 24 bits, instance flags in the high 8.
    pub sbt_offset_and_flags: u32,
    /// Device address of the referenced BLAS.
    pub acceleration_structure_reference: u64,
}

const LOW_24: u32 = 0x00FF_FFFF;

impl InstanceRecord {
    /// Custom index visible to hit shaders.
    pub fn custom_index(&self) -> u32 {
        self.custom_index_and_mask & LOW_24
    }

    /// Visibility mask.
    pub fn mask(&self) -> u8 {
        (self.custom_index_and_mask >> 24) as u8
    }

    /// Hit group record offset.
    pub fn sbt_record_offset(&self) -> u32 {
        self.sbt_offset_and_flags & LOW_24
    }

    /// Instance flags.
    pub fn flags(&self) -> vk::GeometryInstanceFlagsKHR {
        vk::GeometryInstanceFlagsKHR::from_raw(self.sbt_offset_and_flags >> 24)
    }
}

/// One instance of a BLAS in the scene.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TlasInstance {
    pub transform: Mat4,
    /// Position of the referenced BLAS in the builder.
    pub blas_index: usize,
    /// Truncated to 24 bits.
    pub custom_index: u32,
    pub mask: u8,
    /// Truncated to 24 bits.
    pub sbt_record_offset: u32,
    pub flags: vk::GeometryInstanceFlagsKHR,
}

impl TlasInstance {
    /// Fully visible instance of `blas_index` with back-face culling off.
    pub fn new(blas_index: usize, transform: Mat4) -> Self {
        Self {
            transform,
            blas_index,
            custom_index: blas_index as u32,
            mask: 0xFF,
            sbt_record_offset: 0,
            flags: vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE,
        }
    }

    /// Instance of a scene node; the BLAS index is the mesh index.
    pub fn from_scene_instance(instance: &SceneInstance) -> Self {
        Self::new(instance.mesh.0 as usize, instance.world)
    }

    /// Set the custom index.
    pub fn with_custom_index(mut self, custom_index: u32) -> Self {
        self.custom_index = custom_index;
        self
    }

    /// Set the visibility mask.
    pub fn with_mask(mut self, mask: u8) -> Self {
        self.mask = mask;
        self
    }

    /// Set the hit group record offset.
    pub fn with_sbt_record_offset(mut self, offset: u32) -> Self {
        self.sbt_record_offset = offset;
        self
    }

    /// Set the instance flags.
    pub fn with_flags(mut self, flags: vk::GeometryInstanceFlagsKHR) -> Self {
        self.flags = flags;
        self
    }

    /// Pack into the device layout, referencing the BLAS at `blas_address`.
    pub fn to_record(&self, blas_address: vk::DeviceAddress) -> InstanceRecord {
        InstanceRecord {
            transform: transform_rows_3x4(self.transform),
            custom_index_and_mask: (self.custom_index & LOW_24) | (u32::from(self.mask) << 24),
            sbt_offset_and_flags: (self.sbt_record_offset & LOW_24)
                | ((self.flags.as_raw() & 0xFF) << 24),
            acceleration_structure_reference: blas_address,
        }
    }
}

/// TLAS build settings.
#[derive(Clone, Copy, Debug)]
pub struct TlasBuildConfig {
    pub flags: vk::BuildAccelerationStructureFlagsKHR,
}

impl Default for TlasBuildConfig {
    fn default() -> Self {
        Self {
            flags: vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
                | vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE,
        }
    }
}

/// The scene's top-level acceleration structure and its instance buffer.
pub struct Tlas {
    acceleration_structure: AccelerationStructure,
    instance_buffer: GpuBuffer,
    instance_count: u32,
    flags: vk::BuildAccelerationStructureFlagsKHR,
}

impl Tlas {
    /// Upload `instances` and build a new TLAS over them.
    pub fn build(
        ctx: &GpuContext,
        instances: &[InstanceRecord],
        config: &TlasBuildConfig,
    ) -> Result<Self> {
        let loader = loader(ctx)?;
        if instances.is_empty() {
            return Err(GpuError::InvalidState(
                "TLAS needs at least one instance".to_string(),
            ));
        }
        let instance_count = instances.len() as u32;

        let instance_buffer = ctx.create_buffer(
            std::mem::size_of_val(instances) as u64,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            "tlas instances",
        )?;

        let geometry = instances_geometry(instance_buffer.device_address(ctx.device()));
        let sizes = query_build_sizes(
            loader,
            &geometry,
            config.flags,
            vk::BuildAccelerationStructureModeKHR::BUILD,
            instance_count,
        );

        let acceleration_structure = match AccelerationStructure::new(
            ctx,
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            sizes.acceleration_structure_size,
            "tlas",
        ) {
            Ok(acceleration_structure) => acceleration_structure,
            Err(e) => {
                if let Err(free_err) = ctx.free_buffer(instance_buffer) {
                    tracing::warn!("Failed to free instance buffer after an error: {free_err}");
                }
                return Err(e);
            }
        };

        let tlas = Self {
            acceleration_structure,
            instance_buffer,
            instance_count,
            flags: config.flags,
        };

        if let Err(e) = tlas.submit(
            ctx,
            instances,
            &geometry,
            sizes.build_scratch_size,
            vk::BuildAccelerationStructureModeKHR::BUILD,
        ) {
            tlas.destroy(ctx)?;
            return Err(e);
        }

        tracing::info!(
            instances = instance_count,
            size = sizes.acceleration_structure_size,
            "Built TLAS"
        );
        Ok(tlas)
    }

    /// Refit the TLAS in place after instance transforms changed.
    ///
    /// The handle and device address stay the same.
    ///
    /// # Panics
    /// If the TLAS was built without `ALLOW_UPDATE` or the instance count
    /// differs from the original build.
    pub fn update(&mut self, ctx: &GpuContext, instances: &[InstanceRecord]) -> Result<()> {
        assert!(
            self.flags
                .contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE),
            "TLAS was built without ALLOW_UPDATE"
        );
        assert_eq!(
            instances.len(),
            self.instance_count as usize,
            "TLAS update must keep the instance count"
        );

        let loader = loader(ctx)?;
        let geometry = instances_geometry(self.instance_buffer.device_address(ctx.device()));
        let sizes = query_build_sizes(
            loader,
            &geometry,
            self.flags,
            vk::BuildAccelerationStructureModeKHR::UPDATE,
            self.instance_count,
        );

        self.submit(
            ctx,
            instances,
            &geometry,
            sizes.update_scratch_size,
            vk::BuildAccelerationStructureModeKHR::UPDATE,
        )?;

        tracing::debug!(instances = self.instance_count, "Updated TLAS");
        Ok(())
    }

    /// Stage `instances`, copy them into the instance buffer and build.
    fn submit(
        &self,
        ctx: &GpuContext,
        instances: &[InstanceRecord],
        geometry: &vk::AccelerationStructureGeometryKHR<'_>,
        scratch_size: u64,
        mode: vk::BuildAccelerationStructureModeKHR,
    ) -> Result<()> {
        let loader = loader(ctx)?;
        let alignment = scratch_alignment(ctx)?;
        let bytes = std::mem::size_of_val(instances) as u64;

        let staging = ctx.create_buffer(
            bytes,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            "tlas instances staging",
        )?;

        let result = staging.write(instances).and_then(|()| {
            let (scratch, scratch_address) =
                create_scratch_buffer(ctx, scratch_size, alignment, "tlas scratch")?;

            let source = if mode == vk::BuildAccelerationStructureModeKHR::UPDATE {
                self.acceleration_structure.handle
            } else {
                vk::AccelerationStructureKHR::null()
            };

            let submitted = ctx.execute_single_time_commands(|cmd| {
                let region = vk::BufferCopy::default().size(bytes);
                unsafe {
                    ctx.device().cmd_copy_buffer(
                        cmd,
                        staging.buffer,
                        self.instance_buffer.buffer,
                        &[region],
                    );
                    BuildBarrier::TransferToBuild.record(ctx.device(), cmd);
                }

                let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
                    .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
                    .flags(self.flags)
                    .mode(mode)
                    .src_acceleration_structure(source)
                    .dst_acceleration_structure(self.acceleration_structure.handle)
                    .geometries(std::slice::from_ref(geometry))
                    .scratch_data(vk::DeviceOrHostAddressKHR {
                        device_address: scratch_address,
                    });
                let range = vk::AccelerationStructureBuildRangeInfoKHR::default()
                    .primitive_count(self.instance_count);

                unsafe {
                    loader.cmd_build_acceleration_structures(
                        cmd,
                        std::slice::from_ref(&build_info),
                        &[std::slice::from_ref(&range)],
                    );
                }
            });

            ctx.free_buffer(scratch)?;
            submitted
        });

        ctx.free_buffer(staging)?;
        result
    }

    /// Native handle.
    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.acceleration_structure.handle
    }

    /// Device address of the TLAS.
    pub fn device_address(&self) -> vk::DeviceAddress {
        self.acceleration_structure.device_address
    }

    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }

    pub fn flags(&self) -> vk::BuildAccelerationStructureFlagsKHR {
        self.flags
    }

    /// The underlying acceleration structure.
    pub fn acceleration_structure(&self) -> &AccelerationStructure {
        &self.acceleration_structure
    }

    /// Write this TLAS into an `ACCELERATION_STRUCTURE_KHR` descriptor.
    ///
    /// # Safety
    /// The device and descriptor set must be valid and the set must not be
    /// in use by pending GPU work.
    pub unsafe fn write_descriptor(
        &self,
        device: &ash::Device,
        dst_set: vk::DescriptorSet,
        binding: u32,
    ) {
        let handles = [self.handle()];
        let mut acceleration_structure_write =
            vk::WriteDescriptorSetAccelerationStructureKHR::default()
                .acceleration_structures(&handles);

        let write = vk::WriteDescriptorSet::default()
            .dst_set(dst_set)
            .dst_binding(binding)
            .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
            .descriptor_count(1)
            .push_next(&mut acceleration_structure_write);

        device.update_descriptor_sets(std::slice::from_ref(&write), &[]);
    }

    /// Destroy the TLAS and free its instance buffer.
    pub fn destroy(self, ctx: &GpuContext) -> Result<()> {
        self.acceleration_structure.destroy(ctx)?;
        ctx.free_buffer(self.instance_buffer)
    }
}

fn instances_geometry(
    instance_address: vk::DeviceAddress,
) -> vk::AccelerationStructureGeometryKHR<'static> {
    vk::AccelerationStructureGeometryKHR::default()
        .geometry_type(vk::GeometryTypeKHR::INSTANCES)
        .flags(vk::GeometryFlagsKHR::OPAQUE)
        .geometry(vk::AccelerationStructureGeometryDataKHR {
            instances: vk::AccelerationStructureGeometryInstancesDataKHR::default()
                .array_of_pointers(false)
                .data(vk::DeviceOrHostAddressConstKHR {
                    device_address: instance_address,
                }),
        })
}

fn query_build_sizes(
    loader: &ash::khr::acceleration_structure::Device,
    geometry: &vk::AccelerationStructureGeometryKHR<'_>,
    flags: vk::BuildAccelerationStructureFlagsKHR,
    mode: vk::BuildAccelerationStructureModeKHR,
    instance_count: u32,
) -> vk::AccelerationStructureBuildSizesInfoKHR<'static> {
    let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
        .flags(flags)
        .mode(mode)
        .geometries(std::slice::from_ref(geometry));

    let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
    unsafe {
        loader.get_acceleration_structure_build_sizes(
            vk::AccelerationStructureBuildTypeKHR::DEVICE,
            &build_info,
            &[instance_count],
            &mut sizes,
        );
    }
    sizes
}
