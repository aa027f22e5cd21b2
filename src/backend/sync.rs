// Synchronization primitives
//
// Fences order GPU work against the CPU, semaphores order GPU work
// against other GPU work. Each frame slot owns one FrameSync.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::handle::Owned;
use super::VulkanDevice;

/// Binary semaphore.
#[derive(Debug)]
pub struct Semaphore(Owned<vk::Semaphore>);

impl Semaphore {
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let raw = unsafe { device.device.create_semaphore(&semaphore_info, None) }
            .context("Failed to create semaphore")?;
        Ok(Self(Owned::new(device, raw)))
    }

    pub fn raw(&self) -> vk::Semaphore {
        self.0.raw()
    }
}

/// CPU-visible fence.
#[derive(Debug)]
pub struct Fence(Owned<vk::Fence>);

impl Fence {
    /// `signaled` fences make the first wait of a render loop return at once.
    pub fn new(device: &Arc<VulkanDevice>, signaled: bool) -> Result<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let fence_info = vk::FenceCreateInfo::builder().flags(flags);
        let raw = unsafe { device.device.create_fence(&fence_info, None) }
            .context("Failed to create fence")?;
        Ok(Self(Owned::new(device, raw)))
    }

    pub fn raw(&self) -> vk::Fence {
        self.0.raw()
    }

    /// Block until signaled. There is no recovery from a hang here.
    pub fn wait(&self) -> Result<()> {
        self.wait_timeout(u64::MAX)
    }

    pub fn wait_timeout(&self, timeout_ns: u64) -> Result<()> {
        unsafe {
            self.0
                .device()
                .device
                .wait_for_fences(&[self.raw()], true, timeout_ns)
        }
        .context("Failed to wait for fence")?;
        Ok(())
    }

    /// Non-blocking status query.
    pub fn is_signaled(&self) -> Result<bool> {
        let signaled = unsafe { self.0.device().device.get_fence_status(self.raw()) }
            .context("Failed to query fence status")?;
        Ok(signaled)
    }

    pub fn reset(&self) -> Result<()> {
        unsafe { self.0.device().device.reset_fences(&[self.raw()]) }
            .context("Failed to reset fence")?;
        Ok(())
    }
}

/// Frame synchronization - one per frame in flight
#[derive(Debug)]
pub struct FrameSync {
    pub image_available: Semaphore,
    pub render_finished: Semaphore,
    pub render_finished_fence: Fence,
}

impl FrameSync {
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        Ok(Self {
            image_available: Semaphore::new(device)?,
            render_finished: Semaphore::new(device)?,
            render_finished_fence: Fence::new(device, true)?,
        })
    }
}
