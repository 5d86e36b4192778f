//! Scene-level owner of every acceleration structure.

use crate::acceleration::AccelerationStructure;
use crate::blas::{build_blas, BlasBuildConfig, BlasBuildReport};
use crate::geometry::BlasInput;
use crate::tlas::{InstanceRecord, Tlas, TlasBuildConfig, TlasInstance};
use ash::vk;
use prism_gpu::{GpuContext, GpuError, Result};

/// Builds and owns the BLAS list and the single TLAS of a scene.
///
/// Instances refer to a BLAS by its position in [`Self::blas`]; the builder
/// resolves those positions to cached device addresses.
#[derive(Default)]
pub struct RayTracingBuilder {
    blas: Vec<AccelerationStructure>,
    tlas: Option<Tlas>,
    blas_config: BlasBuildConfig,
    tlas_config: TlasBuildConfig,
}

impl RayTracingBuilder {
    /// Create a builder with the given settings.
    pub fn new(blas_config: BlasBuildConfig, tlas_config: TlasBuildConfig) -> Self {
        Self {
            blas: Vec::new(),
            tlas: None,
            blas_config,
            tlas_config,
        }
    }

    pub fn blas_config(&self) -> &BlasBuildConfig {
        &self.blas_config
    }

    pub fn tlas_config(&self) -> &TlasBuildConfig {
        &self.tlas_config
    }

    /// Build a batch of BLAS and append them after the existing ones.
    pub fn build_blas(&mut self, ctx: &GpuContext, inputs: &[BlasInput]) -> Result<BlasBuildReport> {
        let (built, report) = build_blas(ctx, inputs, &self.blas_config)?;
        self.blas.extend(built);
        Ok(report)
    }

    /// All BLAS built so far.
    pub fn blas(&self) -> &[AccelerationStructure] {
        &self.blas
    }

    /// Device address of the BLAS at `index`.
    pub fn blas_device_address(&self, index: usize) -> Option<vk::DeviceAddress> {
        self.blas.get(index).map(|blas| blas.device_address)
    }

    /// Pack instances into device records.
    pub fn instance_records(&self, instances: &[TlasInstance]) -> Result<Vec<InstanceRecord>> {
        instances
            .iter()
            .map(|instance| {
                self.blas_device_address(instance.blas_index)
                    .map(|address| instance.to_record(address))
                    .ok_or_else(|| {
                        GpuError::InvalidState(format!(
                            "Instance references BLAS {} of {}",
                            instance.blas_index,
                            self.blas.len()
                        ))
                    })
            })
            .collect()
    }

    /// Build the TLAS, or refit it in place when `update` is set.
    ///
    /// # Panics
    /// On a second build without `update`, on an update before the first
    /// build, or on an update the TLAS cannot accept (see [`Tlas::update`]).
    pub fn build_tlas(
        &mut self,
        ctx: &GpuContext,
        instances: &[TlasInstance],
        update: bool,
    ) -> Result<()> {
        let records = self.instance_records(instances)?;

        if update {
            let Some(tlas) = self.tlas.as_mut() else {
                panic!("TLAS update requested before the first build");
            };
            tlas.update(ctx, &records)
        } else {
            assert!(
                self.tlas.is_none(),
                "TLAS already built; request an update instead"
            );
            self.tlas = Some(Tlas::build(ctx, &records, &self.tlas_config)?);
            Ok(())
        }
    }

    /// The TLAS, once built.
    pub fn tlas(&self) -> Option<&Tlas> {
        self.tlas.as_ref()
    }

    /// Write the TLAS into an acceleration structure descriptor.
    ///
    /// # Safety
    /// See [`Tlas::write_descriptor`].
    pub unsafe fn write_tlas_descriptor(
        &self,
        device: &ash::Device,
        dst_set: vk::DescriptorSet,
        binding: u32,
    ) -> Result<()> {
        let tlas = self
            .tlas
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("TLAS not built".to_string()))?;
        tlas.write_descriptor(device, dst_set, binding);
        Ok(())
    }

    /// Destroy the TLAS, then every BLAS.
    pub fn destroy(self, ctx: &GpuContext) -> Result<()> {
        if let Some(tlas) = self.tlas {
            tlas.destroy(ctx)?;
        }
        for blas in self.blas {
            blas.destroy(ctx)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Mat4;

    #[test]
    fn empty_builder_has_nothing_to_reference() {
        let builder = RayTracingBuilder::default();
        assert!(builder.blas().is_empty());
        assert!(builder.tlas().is_none());
        assert_eq!(builder.blas_device_address(0), None);
    }

    #[test]
    fn dangling_blas_index_is_rejected() {
        let builder = RayTracingBuilder::default();
        let err = builder
            .instance_records(&[TlasInstance::new(3, Mat4::IDENTITY)])
            .unwrap_err();
        assert!(matches!(err, GpuError::InvalidState(msg) if msg.contains("BLAS 3 of 0")));
    }

    #[test]
    fn builder_keeps_its_configs() {
        let builder = RayTracingBuilder::new(
            BlasBuildConfig::default().without_compaction(),
            TlasBuildConfig {
                flags: vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD,
            },
        );
        assert!(!builder
            .blas_config()
            .flags
            .contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION));
        assert_eq!(
            builder.tlas_config().flags,
            vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD
        );
    }

    #[test]
    fn no_instances_pack_to_no_records() {
        let builder = RayTracingBuilder::default();
        assert!(builder.instance_records(&[]).unwrap().is_empty());
    }
}
