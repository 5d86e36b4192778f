//! Batched bottom-level acceleration structure builds.
//!
//! Sizes are queried for the whole batch up front. One scratch buffer sized
//! to the largest build is shared by every build, so builds inside a
//! submission are serialized by barriers. Submissions are split by
//! [`BlasBuildConfig::batch_budget`] and each one is waited on before the
//! next, which bounds peak memory. With `ALLOW_COMPACTION` every sub-batch
//! is copied into right-sized structures as soon as it finishes.

use crate::acceleration::{create_scratch_buffer, loader, scratch_alignment, AccelerationStructure};
use crate::geometry::BlasInput;
use crate::plan::{self, BuildCommands, BuildGuard, DEFAULT_BATCH_BUDGET};
use ash::vk;
use prism_gpu::sync::BuildBarrier;
use prism_gpu::{GpuContext, Result};
use std::ops::Range;

/// BLAS build settings.
#[derive(Clone, Copy, Debug)]
pub struct BlasBuildConfig {
    /// Flags applied to every BLAS of a batch.
    pub flags: vk::BuildAccelerationStructureFlagsKHR,
    /// Declared acceleration structure bytes per submission.
    pub batch_budget: u64,
}

impl Default for BlasBuildConfig {
    fn default() -> Self {
        Self {
            flags: vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
                | vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION,
            batch_budget: DEFAULT_BATCH_BUDGET,
        }
    }
}

impl BlasBuildConfig {
    /// Same settings without compaction.
    pub fn without_compaction(mut self) -> Self {
        self.flags &= !vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION;
        self
    }
}

/// Outcome of one batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlasBuildReport {
    pub count: usize,
    pub sub_batches: usize,
    /// Bytes of the shared scratch buffer.
    pub scratch_size: u64,
    /// Sum of the queried acceleration structure sizes.
    pub uncompacted_bytes: u64,
    /// Sum of the compacted sizes, when compaction ran.
    pub compacted_bytes: Option<u64>,
}

/// Geometry, ranges and queried sizes of one pending build.
struct BuildRecord {
    geometries: Vec<vk::AccelerationStructureGeometryKHR<'static>>,
    ranges: Vec<vk::AccelerationStructureBuildRangeInfoKHR>,
    flags: vk::BuildAccelerationStructureFlagsKHR,
    acceleration_structure_size: u64,
    build_scratch_size: u64,
}

impl BuildRecord {
    fn build_info(&self) -> vk::AccelerationStructureBuildGeometryInfoKHR<'_> {
        vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
            .flags(self.flags)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&self.geometries)
    }
}

/// [`BuildCommands`] recording into a Vulkan command buffer.
struct CommandBufferBuilds<'a> {
    device: &'a ash::Device,
    loader: &'a ash::khr::acceleration_structure::Device,
    cmd: vk::CommandBuffer,
    records: &'a [BuildRecord],
    built: &'a [AccelerationStructure],
    scratch_address: vk::DeviceAddress,
    query_pool: vk::QueryPool,
}

impl BuildCommands for CommandBufferBuilds<'_> {
    fn build(&mut self, index: usize) {
        let record = &self.records[index];
        let build_info = record
            .build_info()
            .dst_acceleration_structure(self.built[index].handle)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: self.scratch_address,
            });

        unsafe {
            self.loader.cmd_build_acceleration_structures(
                self.cmd,
                std::slice::from_ref(&build_info),
                &[record.ranges.as_slice()],
            );
        }
    }

    fn scratch_barrier(&mut self) {
        unsafe { BuildBarrier::BetweenBuilds.record(self.device, self.cmd) };
    }

    fn reset_queries(&mut self, first: u32, count: u32) {
        unsafe {
            self.device
                .cmd_reset_query_pool(self.cmd, self.query_pool, first, count);
        }
    }

    fn build_to_query_barrier(&mut self) {
        unsafe { BuildBarrier::BuildToQuery.record(self.device, self.cmd) };
    }

    fn write_compacted_sizes(&mut self, indices: Range<usize>) {
        let first_query = indices.start as u32;
        let handles: Vec<_> = self.built[indices].iter().map(|a| a.handle).collect();
        unsafe {
            self.loader.cmd_write_acceleration_structures_properties(
                self.cmd,
                &handles,
                vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
                self.query_pool,
                first_query,
            );
        }
    }
}

/// Build one BLAS per input.
///
/// Returns the structures in input order. Every returned structure has its
/// device address cached.
///
/// # Panics
/// If some but not all inputs allow compaction once combined with
/// `config.flags`.
pub fn build_blas(
    ctx: &GpuContext,
    inputs: &[BlasInput],
    config: &BlasBuildConfig,
) -> Result<(Vec<AccelerationStructure>, BlasBuildReport)> {
    if inputs.is_empty() {
        return Ok((Vec::new(), BlasBuildReport::default()));
    }

    let loader = loader(ctx)?;
    let alignment = scratch_alignment(ctx)?;

    let records: Vec<BuildRecord> = inputs
        .iter()
        .map(|input| query_build_sizes(loader, input, config.flags | input.flags))
        .collect();

    let compact = plan::compaction_requested(records.iter().map(|r| r.flags));
    let max_scratch = records
        .iter()
        .map(|r| r.build_scratch_size)
        .max()
        .unwrap_or_default();
    let sizes: Vec<u64> = records
        .iter()
        .map(|r| r.acceleration_structure_size)
        .collect();
    let batches = plan::partition_batches(&sizes, config.batch_budget);

    let (scratch, scratch_address) =
        create_scratch_buffer(ctx, max_scratch, alignment, "blas scratch")?;

    let query_pool = if compact {
        let info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR)
            .query_count(records.len() as u32);
        match unsafe { ctx.device().create_query_pool(&info, None) } {
            Ok(pool) => pool,
            Err(e) => {
                if let Err(free_err) = ctx.free_buffer(scratch) {
                    tracing::warn!("Failed to free scratch after an error: {free_err}");
                }
                return Err(e.into());
            }
        }
    } else {
        vk::QueryPool::null()
    };

    let mut report = BlasBuildReport {
        count: records.len(),
        sub_batches: batches.len(),
        scratch_size: scratch.size,
        uncompacted_bytes: sizes.iter().sum(),
        compacted_bytes: compact.then_some(0),
    };

    tracing::info!(
        count = report.count,
        sub_batches = report.sub_batches,
        scratch_size = report.scratch_size,
        compact,
        "Building BLAS batch"
    );

    let mut built = BuildGuard::new(records.len(), release_on_failure(ctx));
    let result = batches.iter().try_for_each(|batch| -> Result<()> {
        build_sub_batch(
            ctx,
            loader,
            &records,
            &mut built,
            batch.clone(),
            scratch_address,
            query_pool,
            compact,
        )?;
        if compact {
            let compacted = compact_sub_batch(ctx, loader, &mut built, batch.clone(), query_pool)?;
            if let Some(total) = report.compacted_bytes.as_mut() {
                *total += compacted;
            }
        }
        Ok(())
    });

    if compact {
        unsafe { ctx.device().destroy_query_pool(query_pool, None) };
    }
    let scratch_freed = ctx.free_buffer(scratch);
    // The build error wins over a scratch release error.
    result?;
    scratch_freed?;

    if let Some(compacted) = report.compacted_bytes {
        tracing::info!(
            "BLAS compaction reduced from {} to {} bytes ({:.1}% smaller)",
            report.uncompacted_bytes,
            compacted,
            plan::percent_saved(report.uncompacted_bytes, compacted)
        );
    }

    Ok((built.finish(), report))
}

fn release_on_failure(ctx: &GpuContext) -> impl FnMut(AccelerationStructure) + '_ {
    move |blas| {
        if let Err(e) = blas.destroy(ctx) {
            tracing::warn!("Failed to release BLAS of an aborted batch: {e}");
        }
    }
}

fn query_build_sizes(
    loader: &ash::khr::acceleration_structure::Device,
    input: &BlasInput,
    flags: vk::BuildAccelerationStructureFlagsKHR,
) -> BuildRecord {
    let mut record = BuildRecord {
        geometries: input.geometries.iter().map(|g| g.geometry()).collect(),
        ranges: input.geometries.iter().map(|g| g.build_range()).collect(),
        flags,
        acceleration_structure_size: 0,
        build_scratch_size: 0,
    };

    let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
    unsafe {
        loader.get_acceleration_structure_build_sizes(
            vk::AccelerationStructureBuildTypeKHR::DEVICE,
            &record.build_info(),
            &input.primitive_counts(),
            &mut sizes,
        );
    }

    record.acceleration_structure_size = sizes.acceleration_structure_size;
    record.build_scratch_size = sizes.build_scratch_size;
    record
}

#[allow(clippy::too_many_arguments)]
fn build_sub_batch(
    ctx: &GpuContext,
    loader: &ash::khr::acceleration_structure::Device,
    records: &[BuildRecord],
    built: &mut Vec<AccelerationStructure>,
    batch: Range<usize>,
    scratch_address: vk::DeviceAddress,
    query_pool: vk::QueryPool,
    compact: bool,
) -> Result<()> {
    for index in batch.clone() {
        built.push(AccelerationStructure::new(
            ctx,
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            records[index].acceleration_structure_size,
            &format!("blas {index}"),
        )?);
    }

    ctx.execute_single_time_commands(|cmd| {
        let mut commands = CommandBufferBuilds {
            device: ctx.device(),
            loader,
            cmd,
            records,
            built: built.as_slice(),
            scratch_address,
            query_pool,
        };
        plan::record_sub_batch(&mut commands, batch.clone(), compact);
    })?;

    tracing::debug!(first = batch.start, count = batch.len(), "Submitted BLAS sub-batch");
    Ok(())
}

/// Replace the structures of `batch` with compacted copies.
///
/// Returns the compacted bytes of the sub-batch.
fn compact_sub_batch(
    ctx: &GpuContext,
    loader: &ash::khr::acceleration_structure::Device,
    built: &mut [AccelerationStructure],
    batch: Range<usize>,
    query_pool: vk::QueryPool,
) -> Result<u64> {
    let mut compacted_sizes = vec![0u64; batch.len()];
    unsafe {
        ctx.device().get_query_pool_results(
            query_pool,
            batch.start as u32,
            &mut compacted_sizes,
            vk::QueryResultFlags::WAIT | vk::QueryResultFlags::TYPE_64,
        )?;
    }

    let mut compacted = BuildGuard::new(batch.len(), release_on_failure(ctx));
    for (index, &size) in batch.clone().zip(&compacted_sizes) {
        compacted.push(AccelerationStructure::new(
            ctx,
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            size,
            &format!("blas {index} compacted"),
        )?);
    }

    ctx.execute_single_time_commands(|cmd| {
        for (index, target) in batch.clone().zip(compacted.iter()) {
            let copy_info = vk::CopyAccelerationStructureInfoKHR::default()
                .src(built[index].handle)
                .dst(target.handle)
                .mode(vk::CopyAccelerationStructureModeKHR::COMPACT);
            unsafe { loader.cmd_copy_acceleration_structure(cmd, &copy_info) };
        }
    })?;

    // Swap every structure before destroying any original so a failed
    // destroy leaves `built` fully compacted.
    let originals: Vec<_> = batch
        .zip(compacted.finish())
        .map(|(index, target)| std::mem::replace(&mut built[index], target))
        .collect();
    let mut first_error = None;
    for original in originals {
        if let Err(e) = original.destroy(ctx) {
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(compacted_sizes.iter().sum()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_compacts_for_fast_trace() {
        let config = BlasBuildConfig::default();
        assert!(config
            .flags
            .contains(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE));
        assert!(config
            .flags
            .contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION));
        assert_eq!(config.batch_budget, DEFAULT_BATCH_BUDGET);
    }

    #[test]
    fn without_compaction_keeps_other_flags() {
        let config = BlasBuildConfig::default().without_compaction();
        assert_eq!(
            config.flags,
            vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
        );
    }

    #[test]
    fn record_build_info_is_bottom_level_build() {
        let record = BuildRecord {
            geometries: Vec::new(),
            ranges: Vec::new(),
            flags: vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
            acceleration_structure_size: 0,
            build_scratch_size: 0,
        };
        let info = record.build_info();
        assert_eq!(info.ty, vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL);
        assert_eq!(info.mode, vk::BuildAccelerationStructureModeKHR::BUILD);
        assert_eq!(info.geometry_count, 0);
    }
}
