//! One-shot command submission.
//!
//! Every GPU job in Prism (uploads, acceleration structure builds, compaction
//! copies) is recorded into a throwaway command buffer, submitted alone and
//! waited on before the call returns.

use crate::error::Result;
use crate::sync::{create_fence, wait_for_fence};
use ash::vk;

/// Pool of short-lived primary command buffers for one queue family.
pub struct CommandPool {
    pool: vk::CommandPool,
    queue_family: u32,
}

impl CommandPool {
    /// Create a transient pool whose buffers can be reset individually.
    ///
    /// # Safety
    /// The device must be valid and the queue family must exist.
    pub unsafe fn transient(device: &ash::Device, queue_family: u32) -> Result<Self> {
        let info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(
                vk::CommandPoolCreateFlags::TRANSIENT
                    | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            );
        let pool = device.create_command_pool(&info, None)?;
        Ok(Self { pool, queue_family })
    }

    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// # Safety
    /// The device must be valid and no buffer from this pool may be pending.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_command_pool(self.pool, None);
    }
}

/// A command buffer in the recording state plus the fence its submission
/// signals.
pub struct OneTimeSubmit {
    cmd: vk::CommandBuffer,
    fence: vk::Fence,
}

impl OneTimeSubmit {
    /// Allocate a buffer and fence and start recording.
    ///
    /// # Safety
    /// The device and pool must be valid.
    pub unsafe fn begin(device: &ash::Device, pool: &CommandPool) -> Result<Self> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool.handle())
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = device.allocate_command_buffers(&info)?[0];

        let fence = match create_fence(device) {
            Ok(fence) => fence,
            Err(e) => {
                device.free_command_buffers(pool.handle(), &[cmd]);
                return Err(e);
            }
        };

        let submit = Self { cmd, fence };
        let begin = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        if let Err(e) = device.begin_command_buffer(cmd, &begin) {
            submit.release(device, pool);
            return Err(e.into());
        }
        Ok(submit)
    }

    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.cmd
    }

    /// End recording, submit to `queue` and block until the fence signals.
    ///
    /// # Safety
    /// `queue` must belong to the pool's queue family.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn submit_and_wait(&self, device: &ash::Device, queue: vk::Queue) -> Result<()> {
        device.end_command_buffer(self.cmd)?;

        let cmds = [self.cmd];
        let submit = vk::SubmitInfo::default().command_buffers(&cmds);
        device.queue_submit(queue, &[submit], self.fence)?;
        wait_for_fence(device, self.fence)
    }

    /// Free the command buffer and destroy the fence.
    ///
    /// # Safety
    /// The submission must have completed or never been made.
    pub unsafe fn release(self, device: &ash::Device, pool: &CommandPool) {
        device.destroy_fence(self.fence, None);
        device.free_command_buffers(pool.handle(), &[self.cmd]);
    }
}

/// Record commands with `f`, submit them alone and wait for completion.
///
/// The fence wait has no timeout. The buffer and fence are released whether
/// or not the submission succeeded.
///
/// # Safety
/// All handles must be valid and the pool must belong to the queue's family.
pub unsafe fn execute_single_time_commands<F, R>(
    device: &ash::Device,
    pool: &CommandPool,
    queue: vk::Queue,
    f: F,
) -> Result<R>
where
    F: FnOnce(vk::CommandBuffer) -> R,
{
    let submit = OneTimeSubmit::begin(device, pool)?;
    let value = f(submit.command_buffer());
    let result = submit.submit_and_wait(device, queue);
    submit.release(device, pool);
    result.map(|()| value)
}
