// Swapchain - Window presentation
//
// Owns the presentable images, one framebuffer per image sharing a single
// depth texture, and the default render pass drawing into them. Stale
// swapchains (out of date, suboptimal, resized) are rebuilt wholesale.
//
// The acquire/present bookkeeping lives in ImageCycle and only talks to
// the driver through PresentEngine, so the recovery policy is testable
// without a GPU.

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::prelude::VkResult;
use ash::vk;
use glam::UVec3;
use std::sync::Arc;

use super::framebuffer::Framebuffer;
use super::render_pass::{AttachmentDescription, ClearValue, RenderPass, RenderPassDesc};
use super::surface::{Surface, SurfaceSupport};
use super::sync::Semaphore;
use super::texture::{Texture, TextureFormat, TextureView};
use super::VulkanDevice;
use crate::gfx_assert;

/// Images requested on top of the surface minimum.
pub const PREFERRED_IMAGE_COUNT: u32 = 3;

pub const DEPTH_FORMAT: TextureFormat = TextureFormat::D32;

pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    let preferred = formats.iter().find(|f| {
        (f.format == vk::Format::R8G8B8A8_SRGB || f.format == vk::Format::B8G8R8A8_SRGB)
            && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
    });
    match preferred {
        Some(format) => Some(*format),
        None => {
            let first = formats.first().copied();
            if let Some(format) = first {
                log::warn!(
                    "No sRGB surface format available, using {:?} / {:?}",
                    format.format,
                    format.color_space
                );
            }
            first
        }
    }
}

/// MAILBOX when available. FIFO is always there and is what vsync asks for.
pub fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }
    if modes.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        log::info!("Mailbox present mode not available, using FIFO");
        vk::PresentModeKHR::FIFO
    }
}

/// The surface dictates the extent unless it reports `u32::MAX`.
pub fn choose_extent(capabilities: &vk::SurfaceCapabilitiesKHR, requested: vk::Extent2D) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: requested.width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: requested.height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// A `max_image_count` of 0 means unbounded.
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count.max(PREFERRED_IMAGE_COUNT);
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

/// Everything a rebuild derives from the surface.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainPlan {
    pub extent: vk::Extent2D,
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub image_count: u32,
}

/// `None` while the surface has no area.
pub fn plan_rebuild(support: &SurfaceSupport, requested: vk::Extent2D, vsync: bool) -> Result<Option<SwapchainPlan>> {
    let extent = choose_extent(&support.capabilities, requested);
    if extent.width == 0 || extent.height == 0 {
        return Ok(None);
    }
    Ok(Some(SwapchainPlan {
        extent,
        format: choose_surface_format(&support.formats).context("Surface reports no formats")?,
        present_mode: choose_present_mode(&support.present_modes, vsync),
        image_count: choose_image_count(&support.capabilities),
    }))
}

/// The raw acquire/present/rebuild operations of a swapchain.
pub trait PresentEngine {
    /// Image index and whether the swapchain is suboptimal.
    fn acquire(&mut self, image_available: vk::Semaphore) -> VkResult<(u32, bool)>;
    /// Whether the swapchain is suboptimal.
    fn present(&mut self, image_index: u32, render_finished: vk::Semaphore) -> VkResult<bool>;
    fn recreate(&mut self) -> Result<()>;
}

/// Tracks the acquired image and applies the recovery policy: a failed
/// acquire rebuilds once and retries once, a failed or suboptimal present
/// rebuilds. The index never outlives the swapchain it came from.
#[derive(Debug, Default)]
pub struct ImageCycle {
    current: Option<u32>,
    needs_recreate: bool,
}

impl ImageCycle {
    /// `None` when no image could be had even after a rebuild. The
    /// semaphore is left unsignaled in that case.
    pub fn acquire<E: PresentEngine>(&mut self, engine: &mut E, image_available: vk::Semaphore) -> Result<Option<u32>> {
        gfx_assert!(
            self.current.is_none(),
            "Acquiring a swapchain image with one already acquired, present it first"
        );
        self.current = None;

        let result = match engine.acquire(image_available) {
            Ok(acquired) => Ok(acquired),
            Err(e) => {
                log::info!("Failed to acquire a swapchain image ({}), recreating", e);
                engine.recreate()?;
                self.needs_recreate = false;
                engine.acquire(image_available)
            }
        };

        match result {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    self.needs_recreate = true;
                }
                self.current = Some(index);
                Ok(Some(index))
            }
            Err(e) => {
                log::warn!("Swapchain image unavailable after recreation ({}), skipping frame", e);
                Ok(None)
            }
        }
    }

    pub fn present<E: PresentEngine>(&mut self, engine: &mut E, render_finished: vk::Semaphore) -> Result<()> {
        let Some(index) = self.current.take() else {
            gfx_assert!(false, "Presenting without an acquired swapchain image");
            return Ok(());
        };

        let stale = match engine.present(index, render_finished) {
            Ok(suboptimal) => suboptimal,
            Err(e) => {
                log::info!("Failed to present swapchain image ({}), recreating", e);
                true
            }
        };
        if stale || self.needs_recreate {
            self.needs_recreate = false;
            engine.recreate()?;
        }
        Ok(())
    }

    pub fn current(&self) -> Option<u32> {
        self.current
    }

    pub fn needs_recreate(&self) -> bool {
        self.needs_recreate
    }

    /// Forget the acquired image, the swapchain is about to be rebuilt.
    pub fn invalidate(&mut self) {
        self.current = None;
        self.needs_recreate = false;
    }
}

struct SwapchainImages {
    raw: vk::SwapchainKHR,
    extent: vk::Extent2D,
    framebuffers: Vec<Arc<Framebuffer>>,
}

/// Native swapchain plus the resources rebuilt along with it.
pub struct RawSwapchain {
    loader: khr::Swapchain,
    images: Option<SwapchainImages>,
    render_pass: Arc<RenderPass>,
    format: vk::SurfaceFormatKHR,
    requested_extent: vk::Extent2D,
    vsync: bool,
    clear_color: [f32; 4],
    surface: Arc<Surface>,
    device: Arc<VulkanDevice>,
}

impl RawSwapchain {
    fn new(
        device: &Arc<VulkanDevice>,
        surface: &Arc<Surface>,
        extent: vk::Extent2D,
        vsync: bool,
        clear_color: [f32; 4],
    ) -> Result<Self> {
        let support = surface.support(device.physical_device)?;
        let format = choose_surface_format(&support.formats).context("Surface reports no formats")?;
        let render_pass = default_render_pass(device, TextureFormat::from_vk(format.format), clear_color)?;

        let mut swapchain = Self {
            loader: khr::Swapchain::new(&device.instance.raw, &device.device),
            images: None,
            render_pass,
            format,
            requested_extent: extent,
            vsync,
            clear_color,
            surface: Arc::clone(surface),
            device: Arc::clone(device),
        };
        swapchain.rebuild()?;
        Ok(swapchain)
    }

    fn rebuild(&mut self) -> Result<()> {
        let support = self.surface.support(self.device.physical_device)?;
        let Some(plan) = plan_rebuild(&support, self.requested_extent, self.vsync)? else {
            log::debug!("Surface has a zero extent, swapchain left empty");
            let old = self.images.take();
            self.destroy_images(old);
            return Ok(());
        };
        let SwapchainPlan {
            extent,
            format,
            present_mode,
            image_count,
        } = plan;

        let format_changed =
            format.format != self.format.format || format.color_space != self.format.color_space;
        let render_pass = if format_changed {
            log::info!("Surface format changed to {:?}, rebuilding render pass", format.format);
            Some(default_render_pass(
                &self.device,
                TextureFormat::from_vk(format.format),
                self.clear_color,
            )?)
        } else {
            None
        };

        // Nothing fails between taking the old swapchain and retiring it.
        let old = self.images.take();
        let old_raw = old.as_ref().map_or(vk::SwapchainKHR::null(), |images| images.raw);
        if let Some(render_pass) = render_pass {
            self.format = format;
            self.render_pass = render_pass;
        }

        let queues = &self.device.queues;
        let family_indices = [
            queues.graphics().family.index(),
            queues.present().family.index(),
        ];
        let mut create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface.raw)
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_raw);
        if family_indices[0] != family_indices[1] {
            create_info = create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&family_indices);
        }

        let created = unsafe { self.loader.create_swapchain(&create_info, None) };
        // The old swapchain is retired either way.
        self.destroy_images(old);
        let raw = created.context("Failed to create swapchain")?;

        let images = match self.create_framebuffers(raw, extent, format.format) {
            Ok(framebuffers) => SwapchainImages {
                raw,
                extent,
                framebuffers,
            },
            Err(e) => {
                unsafe { self.loader.destroy_swapchain(raw, None) };
                return Err(e);
            }
        };

        log::info!(
            "Created swapchain: {}x{}, {} images, {:?}, {:?}",
            extent.width,
            extent.height,
            images.framebuffers.len(),
            format.format,
            present_mode
        );
        self.images = Some(images);
        Ok(())
    }

    fn create_framebuffers(
        &self,
        raw: vk::SwapchainKHR,
        extent: vk::Extent2D,
        format: vk::Format,
    ) -> Result<Vec<Arc<Framebuffer>>> {
        let images = unsafe { self.loader.get_swapchain_images(raw) }.context("Failed to get swapchain images")?;

        let depth = Texture::render_target(&self.device, extent.width, extent.height, DEPTH_FORMAT)?;
        let depth_view = TextureView::new(&depth)?;
        let dimensions = UVec3::new(extent.width, extent.height, 1);

        images
            .into_iter()
            .map(|image| {
                let color = Texture::wrap(
                    &self.device,
                    image,
                    extent.width,
                    extent.height,
                    TextureFormat::from_vk(format),
                );
                let color_view = TextureView::new(&color)?;
                Framebuffer::new(
                    &self.device,
                    &self.render_pass,
                    vec![color_view, Arc::clone(&depth_view)],
                    dimensions,
                )
            })
            .collect()
    }

    fn destroy_images(&self, images: Option<SwapchainImages>) {
        if let Some(images) = images {
            let raw = images.raw;
            // Views and framebuffers go before the images they point at.
            drop(images);
            unsafe { self.loader.destroy_swapchain(raw, None) };
        }
    }
}

impl PresentEngine for RawSwapchain {
    fn acquire(&mut self, image_available: vk::Semaphore) -> VkResult<(u32, bool)> {
        let Some(images) = &self.images else {
            return Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
        };
        unsafe {
            self.loader
                .acquire_next_image(images.raw, u64::MAX, image_available, vk::Fence::null())
        }
    }

    fn present(&mut self, image_index: u32, render_finished: vk::Semaphore) -> VkResult<bool> {
        let Some(images) = &self.images else {
            return Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
        };
        let wait_semaphores = [render_finished];
        let swapchains = [images.raw];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        let queue = self.device.queues.present().handle;
        unsafe { self.loader.queue_present(queue, &present_info) }
    }

    fn recreate(&mut self) -> Result<()> {
        self.device.wait_idle()?;
        self.rebuild()
    }
}

impl Drop for RawSwapchain {
    fn drop(&mut self) {
        let images = self.images.take();
        self.destroy_images(images);
    }
}

/// Color pass over the swapchain images. The regular variant loads what
/// earlier passes of the frame drew; the force-clear variant starts fresh.
fn default_render_pass(
    device: &Arc<VulkanDevice>,
    format: TextureFormat,
    clear_color: [f32; 4],
) -> Result<Arc<RenderPass>> {
    let color = AttachmentDescription::color(format)
        .load(vk::AttachmentLoadOp::LOAD)
        .layouts(vk::ImageLayout::PRESENT_SRC_KHR, vk::ImageLayout::PRESENT_SRC_KHR)
        .clear_value(ClearValue::Color(clear_color));
    let depth = AttachmentDescription::depth(DEPTH_FORMAT)
        .load(vk::AttachmentLoadOp::LOAD)
        .store(vk::AttachmentStoreOp::STORE)
        .layouts(
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        );
    RenderPass::new(device, RenderPassDesc::single_subpass(vec![color, depth]))
}

pub struct Swapchain {
    engine: RawSwapchain,
    cycle: ImageCycle,
}

impl Swapchain {
    pub fn new(
        device: &Arc<VulkanDevice>,
        surface: &Arc<Surface>,
        extent: vk::Extent2D,
        vsync: bool,
        clear_color: [f32; 4],
    ) -> Result<Self> {
        Ok(Self {
            engine: RawSwapchain::new(device, surface, extent, vsync, clear_color)?,
            cycle: ImageCycle::default(),
        })
    }

    /// False when the frame has to be skipped.
    pub fn acquire_image(&mut self, image_available: &Semaphore) -> Result<bool> {
        let acquired = self.cycle.acquire(&mut self.engine, image_available.raw())?;
        Ok(acquired.is_some())
    }

    pub fn present_image(&mut self, render_finished: &Semaphore) -> Result<()> {
        self.cycle.present(&mut self.engine, render_finished.raw())
    }

    pub fn recreate(&mut self) -> Result<()> {
        self.cycle.invalidate();
        self.engine.recreate()
    }

    pub fn resize(&mut self, extent: vk::Extent2D) -> Result<()> {
        self.engine.requested_extent = extent;
        self.recreate()
    }

    pub fn current_image_index(&self) -> Option<u32> {
        self.cycle.current()
    }

    pub fn current_framebuffer(&self) -> Option<&Arc<Framebuffer>> {
        let index = self.cycle.current()? as usize;
        self.engine.images.as_ref()?.framebuffers.get(index)
    }

    pub fn render_pass(&self) -> &Arc<RenderPass> {
        &self.engine.render_pass
    }

    /// Zero while the surface has no area.
    pub fn extent(&self) -> vk::Extent2D {
        self.engine
            .images
            .as_ref()
            .map_or(vk::Extent2D::default(), |images| images.extent)
    }

    pub fn format(&self) -> TextureFormat {
        TextureFormat::from_vk(self.engine.format.format)
    }

    pub fn image_count(&self) -> usize {
        self.engine.images.as_ref().map_or(0, |images| images.framebuffers.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct FakeEngine {
        acquires: VecDeque<VkResult<(u32, bool)>>,
        presents: VecDeque<VkResult<bool>>,
        recreations: usize,
    }

    impl PresentEngine for FakeEngine {
        fn acquire(&mut self, _: vk::Semaphore) -> VkResult<(u32, bool)> {
            self.acquires.pop_front().unwrap_or(Ok((0, false)))
        }

        fn present(&mut self, _: u32, _: vk::Semaphore) -> VkResult<bool> {
            self.presents.pop_front().unwrap_or(Ok(false))
        }

        fn recreate(&mut self) -> Result<()> {
            self.recreations += 1;
            Ok(())
        }
    }

    fn semaphore() -> vk::Semaphore {
        vk::Semaphore::null()
    }

    #[test]
    fn healthy_frame_does_not_recreate() {
        let mut engine = FakeEngine::default();
        engine.acquires.push_back(Ok((2, false)));
        let mut cycle = ImageCycle::default();

        assert_eq!(cycle.acquire(&mut engine, semaphore()).unwrap(), Some(2));
        assert_eq!(cycle.current(), Some(2));
        cycle.present(&mut engine, semaphore()).unwrap();
        assert_eq!(cycle.current(), None);
        assert_eq!(engine.recreations, 0);
    }

    #[test]
    fn failed_acquire_recreates_once_and_retries() {
        let mut engine = FakeEngine::default();
        engine.acquires.push_back(Err(vk::Result::ERROR_OUT_OF_DATE_KHR));
        engine.acquires.push_back(Ok((1, false)));
        let mut cycle = ImageCycle::default();

        assert_eq!(cycle.acquire(&mut engine, semaphore()).unwrap(), Some(1));
        assert_eq!(engine.recreations, 1);
        assert_eq!(cycle.current(), Some(1));
    }

    #[test]
    fn second_failure_skips_without_a_stale_index() {
        let mut engine = FakeEngine::default();
        engine.acquires.push_back(Err(vk::Result::ERROR_OUT_OF_DATE_KHR));
        engine.acquires.push_back(Err(vk::Result::ERROR_OUT_OF_DATE_KHR));
        let mut cycle = ImageCycle::default();

        assert_eq!(cycle.acquire(&mut engine, semaphore()).unwrap(), None);
        assert_eq!(engine.recreations, 1);
        assert_eq!(cycle.current(), None);

        // The next frame starts clean.
        assert_eq!(cycle.acquire(&mut engine, semaphore()).unwrap(), Some(0));
    }

    #[test]
    fn suboptimal_acquire_keeps_the_image_and_recreates_after_present() {
        let mut engine = FakeEngine::default();
        engine.acquires.push_back(Ok((0, true)));
        let mut cycle = ImageCycle::default();

        assert_eq!(cycle.acquire(&mut engine, semaphore()).unwrap(), Some(0));
        assert!(cycle.needs_recreate());
        assert_eq!(engine.recreations, 0);

        cycle.present(&mut engine, semaphore()).unwrap();
        assert_eq!(engine.recreations, 1);
        assert!(!cycle.needs_recreate());
    }

    #[test]
    fn failed_present_recreates_and_clears_the_index() {
        let mut engine = FakeEngine::default();
        engine.presents.push_back(Err(vk::Result::ERROR_OUT_OF_DATE_KHR));
        let mut cycle = ImageCycle::default();

        cycle.acquire(&mut engine, semaphore()).unwrap();
        cycle.present(&mut engine, semaphore()).unwrap();
        assert_eq!(engine.recreations, 1);
        assert_eq!(cycle.current(), None);
    }

    #[test]
    #[should_panic(expected = "already acquired")]
    fn double_acquire_is_caught() {
        let mut engine = FakeEngine::default();
        let mut cycle = ImageCycle::default();
        cycle.acquire(&mut engine, semaphore()).unwrap();
        let _ = cycle.acquire(&mut engine, semaphore());
    }

    fn capabilities(current: u32, min_count: u32, max_count: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min_count,
            max_image_count: max_count,
            current_extent: vk::Extent2D {
                width: current,
                height: current,
            },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        }
    }

    #[test]
    fn extent_follows_the_surface_unless_undefined() {
        let requested = vk::Extent2D {
            width: 8000,
            height: 600,
        };
        assert_eq!(choose_extent(&capabilities(512, 2, 8), requested).width, 512);

        let chosen = choose_extent(&capabilities(u32::MAX, 2, 8), requested);
        assert_eq!(chosen, vk::Extent2D { width: 4096, height: 600 });
    }

    #[test]
    fn image_count_prefers_three() {
        assert_eq!(choose_image_count(&capabilities(1, 2, 8)), 3);
        assert_eq!(choose_image_count(&capabilities(1, 4, 8)), 4);
        assert_eq!(choose_image_count(&capabilities(1, 2, 2)), 2);
        assert_eq!(choose_image_count(&capabilities(1, 1, 0)), 3);
    }

    #[test]
    fn surface_format_prefers_srgb() {
        let unorm = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let srgb = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let chosen = |formats: &[vk::SurfaceFormatKHR]| choose_surface_format(formats).map(|f| f.format);
        assert_eq!(chosen(&[unorm, srgb]), Some(vk::Format::B8G8R8A8_SRGB));
        assert_eq!(chosen(&[unorm]), Some(vk::Format::B8G8R8A8_UNORM));
        assert_eq!(chosen(&[]), None);
    }

    fn support(current: u32, formats: Vec<vk::SurfaceFormatKHR>) -> SurfaceSupport {
        SurfaceSupport {
            capabilities: capabilities(current, 2, 8),
            formats,
            present_modes: vec![vk::PresentModeKHR::FIFO],
        }
    }

    #[test]
    fn rebuild_plan_settles_everything_up_front() {
        let requested = vk::Extent2D {
            width: 640,
            height: 480,
        };
        let srgb = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };

        let plan = plan_rebuild(&support(512, vec![srgb]), requested, false)
            .unwrap()
            .unwrap();
        assert_eq!(plan.extent.width, 512);
        assert_eq!(plan.format.format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(plan.present_mode, vk::PresentModeKHR::FIFO);
        assert_eq!(plan.image_count, 3);

        // A surface without formats fails before anything is torn down.
        assert!(plan_rebuild(&support(512, Vec::new()), requested, false).is_err());
        assert!(plan_rebuild(&support(0, Vec::new()), requested, false)
            .unwrap()
            .is_none());
    }

    #[test]
    fn present_mode_selection() {
        let both = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(choose_present_mode(&both, false), vk::PresentModeKHR::MAILBOX);
        assert_eq!(choose_present_mode(&both, true), vk::PresentModeKHR::FIFO);
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO], false),
            vk::PresentModeKHR::FIFO
        );
    }
}
