// Graphics context
//
// Owns every long-lived Vulkan object and the per-slot frame data, and
// carries out the GPU side of the frame loop. Fields are declared in
// teardown order: frame data first, the instance last.
//
// Each slot has a fence per queue family: the frame fence for graphics,
// signaled by the submission that feeds presentation, plus one for every
// other family that was submitted to.

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::frame::FrameBackend;
use crate::backend::check::LogOnError;
use crate::backend::command::{CommandBuffer, CommandPool};
use crate::backend::descriptor::{DescriptorPool, DEFAULT_MAX_SETS, DEFAULT_POOL_SIZES};
use crate::backend::query::FrameTimer;
use crate::backend::queue::QueueProperty;
use crate::backend::replica::MAX_FRAMES_IN_FLIGHT;
use crate::backend::sync::{Fence, FrameSync};
use crate::backend::{Instance, Surface, Swapchain, VulkanDevice};
use crate::config::Config;

/// Everything one frame slot owns.
#[derive(Debug)]
pub struct FrameData {
    pub sync: FrameSync,
    /// One pool per queue family in use.
    pub command_pools: BTreeMap<u32, CommandPool>,
    /// Families other than graphics. Created signaled.
    pub queue_fences: BTreeMap<u32, Fence>,
    pub timer: Option<FrameTimer>,
}

impl FrameData {
    fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        let graphics_family = device.queues.graphics().family.index();
        let mut command_pools = BTreeMap::new();
        let mut queue_fences = BTreeMap::new();
        for family_index in device.queues.family_indices_in_use() {
            let queue = device
                .queues
                .by_family(family_index)
                .with_context(|| format!("No queue for family {}", family_index))?;
            command_pools.insert(family_index, CommandPool::new(device, queue.family)?);
            if family_index != graphics_family {
                queue_fences.insert(family_index, Fence::new(device, true)?);
            }
        }
        Ok(Self {
            sync: FrameSync::new(device)?,
            command_pools,
            queue_fences,
            timer: FrameTimer::new(device)?,
        })
    }

    fn command_buffer(&mut self, family_index: u32) -> Result<CommandBuffer> {
        self.command_pools
            .get_mut(&family_index)
            .with_context(|| format!("No command pool for queue family {}", family_index))?
            .command_buffer()
    }
}

pub struct GraphicsContext {
    frame_data: Vec<FrameData>,
    swapchain: Swapchain,
    descriptor_pool: Arc<DescriptorPool>,
    device: Arc<VulkanDevice>,
    surface: Arc<Surface>,
    instance: Arc<Instance>,
    gpu_time_ms: Option<f64>,
}

impl GraphicsContext {
    pub fn new(
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        extent: vk::Extent2D,
        config: &Config,
    ) -> Result<Self> {
        let instance = Instance::new(&config.window.title, display_handle, config.debug.validation_layers)?;
        let surface = Surface::new(&instance, display_handle, window_handle)?;
        let device = VulkanDevice::new(&instance, &surface)?;

        let swapchain = Swapchain::new(
            &device,
            &surface,
            extent,
            config.graphics.vsync,
            config.graphics.clear_color,
        )?;
        let descriptor_pool = DescriptorPool::new(&device, &DEFAULT_POOL_SIZES, DEFAULT_MAX_SETS)?;

        let frame_data = (0..MAX_FRAMES_IN_FLIGHT)
            .map(|_| FrameData::new(&device))
            .collect::<Result<Vec<_>>>()?;

        log::info!(
            "Graphics context ready: {} frames in flight, {} swapchain images",
            MAX_FRAMES_IN_FLIGHT,
            swapchain.image_count()
        );
        if frame_data.iter().any(|frame| frame.timer.is_none()) {
            log::info!("Graphics queue has no timestamp support, GPU frame time unavailable");
        }

        Ok(Self {
            frame_data,
            swapchain,
            descriptor_pool,
            device,
            surface,
            instance,
            gpu_time_ms: None,
        })
    }

    pub fn device(&self) -> &Arc<VulkanDevice> {
        &self.device
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub fn surface(&self) -> &Arc<Surface> {
        &self.surface
    }

    pub fn swapchain(&self) -> &Swapchain {
        &self.swapchain
    }

    pub fn swapchain_mut(&mut self) -> &mut Swapchain {
        &mut self.swapchain
    }

    pub fn descriptor_pool(&self) -> &Arc<DescriptorPool> {
        &self.descriptor_pool
    }

    pub fn frame_data(&self, slot: usize) -> &FrameData {
        &self.frame_data[slot]
    }

    /// Graphics queue time of the most recent frame whose results are in.
    pub fn gpu_time_ms(&self) -> Option<f64> {
        self.gpu_time_ms
    }

    /// Command buffer from the current slot's pool for the queue serving
    /// `property`. Valid until that slot comes around again.
    pub fn command_buffer(&mut self, property: QueueProperty) -> Result<CommandBuffer> {
        let slot = self.device.frames().current();
        let family_index = self.device.queues.get(property).family.index();
        self.frame_data[slot].command_buffer(family_index)
    }
}

impl FrameBackend for GraphicsContext {
    fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
        let frame = &mut self.frame_data[slot];
        frame.sync.render_finished_fence.wait()?;
        for fence in frame.queue_fences.values() {
            fence.wait()?;
        }
        if let Some(timer) = frame.timer.as_mut() {
            if let Some(ms) = timer.read_ms()? {
                self.gpu_time_ms = Some(ms);
            }
        }
        Ok(())
    }

    fn reset_slot_fence(&mut self, slot: usize) -> Result<()> {
        self.frame_data[slot].sync.render_finished_fence.reset()
    }

    fn reset_slot_pools(&mut self, slot: usize) -> Result<()> {
        for pool in self.frame_data[slot].command_pools.values_mut() {
            pool.reset()?;
        }
        Ok(())
    }

    fn acquire_image(&mut self, slot: usize) -> Result<bool> {
        self.swapchain
            .acquire_image(&self.frame_data[slot].sync.image_available)
    }

    fn graphics_family(&self) -> u32 {
        self.device.queues.graphics().family.index()
    }

    fn record_frame_start(&mut self, slot: usize) -> Result<Option<vk::CommandBuffer>> {
        let graphics_family = self.graphics_family();
        let frame = &mut self.frame_data[slot];
        let Some(timer) = frame.timer.as_mut() else {
            return Ok(None);
        };
        let mut cmd = frame
            .command_pools
            .get_mut(&graphics_family)
            .with_context(|| format!("No command pool for queue family {}", graphics_family))?
            .command_buffer()?;
        cmd.begin()?;
        timer.record_start(&mut cmd);
        cmd.end()?;
        Ok(Some(cmd.raw()))
    }

    fn record_frame_end(&mut self, slot: usize, clear_image: bool) -> Result<Option<vk::CommandBuffer>> {
        if !clear_image && self.frame_data[slot].timer.is_none() {
            return Ok(None);
        }
        let graphics_family = self.graphics_family();
        let mut cmd = self.frame_data[slot].command_buffer(graphics_family)?;
        cmd.begin()?;
        if clear_image {
            // The force-clear pass takes the image from UNDEFINED to the
            // present layout.
            let framebuffer = self
                .swapchain
                .current_framebuffer()
                .context("No swapchain image acquired for this frame")?;
            cmd.begin_render_pass(framebuffer, true);
            cmd.end_render_pass();
        }
        if let Some(timer) = self.frame_data[slot].timer.as_mut() {
            timer.record_end(&mut cmd);
        }
        cmd.end()?;
        Ok(Some(cmd.raw()))
    }

    fn submit_to_family(&mut self, slot: usize, family_index: u32, command_buffers: &[vk::CommandBuffer]) -> Result<()> {
        let queue = self
            .device
            .queues
            .by_family(family_index)
            .with_context(|| format!("No queue for family {}", family_index))?
            .handle;
        let fence = self.frame_data[slot]
            .queue_fences
            .get(&family_index)
            .with_context(|| format!("No fence for queue family {}", family_index))?;
        // Already waited on at the start of this slot's frame.
        fence.reset()?;

        let submit_info = vk::SubmitInfo::builder().command_buffers(command_buffers);
        unsafe {
            self.device
                .device
                .queue_submit(queue, &[submit_info.build()], fence.raw())
        }
        .with_context(|| format!("Failed to submit to queue family {}", family_index))?;
        Ok(())
    }

    fn submit(&mut self, slot: usize, command_buffers: &[vk::CommandBuffer], wait_for_image: bool) -> Result<()> {
        let sync = &self.frame_data[slot].sync;
        let wait_semaphores = [sync.image_available.raw()];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [sync.render_finished.raw()];

        let mut submit_info = vk::SubmitInfo::builder().command_buffers(command_buffers);
        if wait_for_image {
            submit_info = submit_info
                .wait_semaphores(&wait_semaphores)
                .wait_dst_stage_mask(&wait_stages)
                .signal_semaphores(&signal_semaphores);
        }

        let queue = self.device.queues.graphics().handle;
        unsafe {
            self.device.device.queue_submit(
                queue,
                &[submit_info.build()],
                sync.render_finished_fence.raw(),
            )
        }
        .context("Failed to submit frame")?;
        Ok(())
    }

    fn present(&mut self, slot: usize) -> Result<()> {
        self.swapchain
            .present_image(&self.frame_data[slot].sync.render_finished)
    }
}

impl Drop for GraphicsContext {
    fn drop(&mut self) {
        log::info!("Destroying graphics context...");
        self.device
            .wait_idle()
            .log_on_error("Failed to wait for device idle on shutdown");
        // Sets still alive elsewhere free themselves later.
        if Arc::strong_count(&self.descriptor_pool) == 1 {
            self.descriptor_pool
                .reset()
                .log_on_error("Failed to reset descriptor pool");
        }
    }
}
