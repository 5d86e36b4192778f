//! Fences and the barriers recorded around acceleration structure builds.

use crate::error::Result;
use ash::vk;

/// Create an unsignaled fence.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_fence(device: &ash::Device) -> Result<vk::Fence> {
    Ok(device.create_fence(&vk::FenceCreateInfo::default(), None)?)
}

/// Block until `fence` signals. There is no timeout.
///
/// # Safety
/// The device and fence must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn wait_for_fence(device: &ash::Device, fence: vk::Fence) -> Result<()> {
    device.wait_for_fences(&[fence], true, u64::MAX)?;
    Ok(())
}

/// Global memory dependencies used while building acceleration structures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildBarrier {
    /// One build after another that shares its scratch buffer.
    BetweenBuilds,
    /// Finished builds before their compacted sizes are queried.
    BuildToQuery,
    /// A transfer write before a build reads it as input.
    TransferToBuild,
}

impl BuildBarrier {
    pub fn memory_barrier(self) -> vk::MemoryBarrier2<'static> {
        let build = vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR;
        let read = vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR;
        let write = vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR;

        let (src_stage, src_access, dst_access) = match self {
            Self::BetweenBuilds => (build, write, read | write),
            Self::BuildToQuery => (build, write, read),
            Self::TransferToBuild => (
                vk::PipelineStageFlags2::COPY,
                vk::AccessFlags2::TRANSFER_WRITE,
                read,
            ),
        };

        vk::MemoryBarrier2::default()
            .src_stage_mask(src_stage)
            .src_access_mask(src_access)
            .dst_stage_mask(build)
            .dst_access_mask(dst_access)
    }

    /// Record the barrier into `cmd`.
    ///
    /// # Safety
    /// The command buffer must be recording.
    pub unsafe fn record(self, device: &ash::Device, cmd: vk::CommandBuffer) {
        let barriers = [self.memory_barrier()];
        let dependency = vk::DependencyInfo::default().memory_barriers(&barriers);
        device.cmd_pipeline_barrier2(cmd, &dependency);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_wait_on_previous_writes() {
        let barrier = BuildBarrier::BetweenBuilds.memory_barrier();
        assert_eq!(
            barrier.src_access_mask,
            vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR
        );
        assert!(barrier
            .dst_access_mask
            .contains(vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR));
    }

    #[test]
    fn instance_upload_is_visible_to_build() {
        let barrier = BuildBarrier::TransferToBuild.memory_barrier();
        assert_eq!(barrier.src_stage_mask, vk::PipelineStageFlags2::COPY);
        assert_eq!(
            barrier.dst_stage_mask,
            vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR
        );
        assert_eq!(
            barrier.dst_access_mask,
            vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR
        );
    }
}
