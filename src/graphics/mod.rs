// Graphics facade
//
// The one object an application holds. It drives the frame loop, hands out
// resources and forwards recording calls to the command buffers of the
// current frame. The backend is picked once, here, from the config.
//
// Usage per redraw:
//     if gfx.begin_frame()? {
//         let cmd = gfx.begin_command_buffer(QueueProperty::Graphics)?;
//         gfx.begin_render_pass(cmd, None)?;
//         ...
//         gfx.end_render_pass(cmd);
//         gfx.end_command_buffer(cmd)?;
//         gfx.end_frame()?;
//     }

pub mod context;
pub mod frame;

use anyhow::{bail, Context, Result};
use ash::vk;
use glam::UVec3;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::backend::buffer::{Buffer, BufferUsage, DataLayout, MemoryType};
use crate::backend::command::CommandBuffer;
use crate::backend::descriptor::{DescriptorSet, DescriptorSetLayout, DescriptorSetLayoutBuilder, ShaderStages};
use crate::backend::framebuffer::Framebuffer;
use crate::backend::pipeline::{PipelineState, PipelineStateData, ScissorRect, Viewport};
use crate::backend::queue::QueueProperty;
use crate::backend::render_pass::{RenderPass, RenderPassDesc};
use crate::backend::shader::ShaderBlob;
use crate::backend::texture::{MipmapPolicy, Sampler, SamplerBuilder, Texture, TextureFormat, TextureView};
use crate::backend::VulkanDevice;
use crate::config::{Config, GraphicsApi};
use crate::gfx_assert;

pub use context::{FrameData, GraphicsContext};
pub use frame::{split_by_family, FrameBackend, FrameLoop, Recorded, SlotState};

/// Handle to a command buffer of the current frame. Stale after `end_frame`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandBufferId(usize);

#[derive(Debug, Clone, Copy, Default)]
pub struct FrameStats {
    pub frames: u64,
    pub skipped_frames: u64,
    /// Of the last submitted frame.
    pub command_buffers: usize,
    pub commands: u32,
    /// Graphics queue time of the latest frame the GPU finished. `None`
    /// without timestamp support.
    pub gpu_time_ms: Option<f64>,
}

pub struct Graphics {
    command_buffers: Vec<CommandBuffer>,
    frame_loop: FrameLoop,
    context: GraphicsContext,
    assets_root: PathBuf,
    frame_active: bool,
    minimized: bool,
    stats: FrameStats,
}

impl Graphics {
    pub fn new(
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        width: u32,
        height: u32,
        config: &Config,
    ) -> Result<Self> {
        match config.graphics.backend {
            GraphicsApi::Vulkan => {}
            other => bail!("Graphics backend {:?} is not supported, only vulkan is available", other),
        }

        let extent = vk::Extent2D { width, height };
        let context = GraphicsContext::new(display_handle, window_handle, extent, config)?;
        let frame_loop = FrameLoop::new(context.device().frames().clone());

        Ok(Self {
            command_buffers: Vec::new(),
            frame_loop,
            context,
            assets_root: config.assets.root.clone(),
            frame_active: false,
            minimized: width == 0 || height == 0,
            stats: FrameStats::default(),
        })
    }

    /// Tear everything down. Waits for the GPU first.
    pub fn destroy(self) {
        log::info!(
            "Shutting down after {} frames ({} skipped)",
            self.stats.frames,
            self.stats.skipped_frames
        );
        drop(self);
    }

    pub fn wait_for_device(&self) -> Result<()> {
        self.context.device().wait_idle()
    }

    /// A zero size minimizes: frames are skipped until the next non-zero resize.
    pub fn on_window_resize(&mut self, width: u32, height: u32) -> Result<()> {
        gfx_assert!(!self.frame_active, "Window resized in the middle of a frame");
        if width == 0 || height == 0 {
            log::debug!("Window minimized, skipping frames");
            self.minimized = true;
            return Ok(());
        }
        self.minimized = false;

        self.wait_for_device()?;
        self.context
            .swapchain_mut()
            .resize(vk::Extent2D { width, height })?;
        self.frame_loop.reset();
        Ok(())
    }

    /// False when nothing should be recorded this frame.
    pub fn begin_frame(&mut self) -> Result<bool> {
        if self.minimized {
            return Ok(false);
        }
        gfx_assert!(!self.frame_active, "begin_frame called twice without end_frame");

        self.command_buffers.clear();
        if !self.frame_loop.begin_frame(&mut self.context)? {
            self.stats.skipped_frames += 1;
            return Ok(false);
        }
        self.frame_active = true;
        self.stats.gpu_time_ms = self.context.gpu_time_ms();
        Ok(true)
    }

    pub fn end_frame(&mut self) -> Result<()> {
        if !self.frame_active {
            return Ok(());
        }
        gfx_assert!(
            self.command_buffers.iter().all(|cmd| !cmd.is_recording()),
            "Every command buffer must be ended before end_frame"
        );

        let recorded: Vec<Recorded> = self
            .command_buffers
            .iter()
            .map(|cmd| Recorded {
                family_index: cmd.family_index(),
                raw: cmd.raw(),
            })
            .collect();
        self.frame_active = false;
        self.frame_loop.end_frame(&mut self.context, &recorded)?;

        self.stats.frames += 1;
        self.stats.command_buffers = recorded.len();
        self.stats.commands = self.command_buffers.iter().map(|cmd| cmd.command_count()).sum();
        log::debug!(
            "Frame {}: {} command buffers, {} commands, GPU {:?} ms",
            self.stats.frames,
            self.stats.command_buffers,
            self.stats.commands,
            self.stats.gpu_time_ms
        );
        self.command_buffers.clear();
        Ok(())
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    pub fn is_minimized(&self) -> bool {
        self.minimized
    }

    pub fn device(&self) -> &Arc<VulkanDevice> {
        self.context.device()
    }

    pub fn swapchain_render_pass(&self) -> &Arc<RenderPass> {
        self.context.swapchain().render_pass()
    }

    pub fn swapchain_extent(&self) -> vk::Extent2D {
        self.context.swapchain().extent()
    }

    pub fn swapchain_format(&self) -> TextureFormat {
        self.context.swapchain().format()
    }

    // Resources

    fn asset_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.assets_root.join(path)
        }
    }

    /// Replicated memory types allocate one copy per frame in flight.
    pub fn create_buffer(
        &self,
        usage: BufferUsage,
        size: u64,
        memory_type: MemoryType,
        layout: Option<DataLayout>,
    ) -> Result<Arc<Buffer>> {
        Buffer::new(self.device(), usage, size, memory_type, layout)
    }

    /// Relative paths resolve against the assets root.
    pub fn create_texture_2d_from_path(
        &self,
        path: impl AsRef<Path>,
        format: TextureFormat,
        mipmaps: MipmapPolicy,
    ) -> Result<Arc<Texture>> {
        Texture::from_path(self.device(), &self.asset_path(path.as_ref()), format, mipmaps)
    }

    pub fn create_texture_2d_from_data(
        &self,
        data: &[u8],
        width: u32,
        height: u32,
        format: TextureFormat,
        mipmaps: MipmapPolicy,
    ) -> Result<Arc<Texture>> {
        Texture::from_data(self.device(), data, width, height, format, mipmaps)
    }

    pub fn create_texture_cube_from_paths(&self, faces: [&Path; 6], format: TextureFormat) -> Result<Arc<Texture>> {
        let faces = faces.map(|face| self.asset_path(face));
        let faces: [&Path; 6] = std::array::from_fn(|i| faces[i].as_path());
        Texture::cube_from_paths(self.device(), faces, format)
    }

    pub fn create_render_target(&self, width: u32, height: u32, format: TextureFormat) -> Result<Arc<Texture>> {
        Texture::render_target(self.device(), width, height, format)
    }

    pub fn create_texture_view(&self, texture: &Arc<Texture>) -> Result<Arc<TextureView>> {
        TextureView::new(texture)
    }

    pub fn create_sampler(&self, builder: SamplerBuilder) -> Result<Arc<Sampler>> {
        builder.build(self.device())
    }

    pub fn create_descriptor_set_layout(&self, builder: DescriptorSetLayoutBuilder) -> Result<Arc<DescriptorSetLayout>> {
        builder.build(self.device())
    }

    pub fn create_descriptor_set(&self, layout: &Arc<DescriptorSetLayout>) -> Result<DescriptorSet> {
        DescriptorSet::new(self.context.descriptor_pool(), layout)
    }

    pub fn create_render_pass(&self, desc: RenderPassDesc) -> Result<Arc<RenderPass>> {
        RenderPass::new(self.device(), desc)
    }

    pub fn create_framebuffer(
        &self,
        render_pass: &Arc<RenderPass>,
        views: Vec<Arc<TextureView>>,
        dimensions: UVec3,
    ) -> Result<Arc<Framebuffer>> {
        Framebuffer::new(self.device(), render_pass, views, dimensions)
    }

    pub fn create_pipeline_state(&self, data: PipelineStateData) -> Result<Arc<PipelineState>> {
        PipelineState::new(self.device(), data)
    }

    /// SPIR-V blob relative to the assets root.
    pub fn load_shader(&self, stage: ShaderStages, path: impl AsRef<Path>) -> Result<ShaderBlob> {
        ShaderBlob::load(stage, &self.asset_path(path.as_ref()))
    }

    // Recording

    fn cmd(&mut self, id: CommandBufferId) -> &mut CommandBuffer {
        gfx_assert!(self.frame_active, "Recording outside of a frame");
        &mut self.command_buffers[id.0]
    }

    /// The buffer goes to the queue serving `queue` at `end_frame`. Buffers
    /// on a family other than graphics are submitted on their own, with no
    /// ordering against the frame's graphics work.
    pub fn begin_command_buffer(&mut self, queue: QueueProperty) -> Result<CommandBufferId> {
        gfx_assert!(self.frame_active, "Command buffers can only be started between begin_frame and end_frame");
        let mut cmd = self.context.command_buffer(queue)?;
        cmd.begin()?;
        self.command_buffers.push(cmd);
        Ok(CommandBufferId(self.command_buffers.len() - 1))
    }

    pub fn end_command_buffer(&mut self, id: CommandBufferId) -> Result<()> {
        self.cmd(id).end()
    }

    /// `None` renders into the acquired swapchain image. The first such pass
    /// of a frame clears it. A frame with no such pass gets its image
    /// cleared at `end_frame`.
    pub fn begin_render_pass(&mut self, id: CommandBufferId, framebuffer: Option<&Framebuffer>) -> Result<()> {
        gfx_assert!(self.frame_active, "Recording outside of a frame");
        match framebuffer {
            Some(framebuffer) => self.command_buffers[id.0].begin_render_pass(framebuffer, false),
            None => {
                let framebuffer = self
                    .context
                    .swapchain()
                    .current_framebuffer()
                    .context("No swapchain image acquired for this frame")?;
                let graphics_family = self.context.device().queues.graphics().family.index();
                gfx_assert!(
                    self.command_buffers[id.0].family_index() == graphics_family,
                    "Swapchain passes must be recorded on a graphics command buffer"
                );
                let force_clear = self.frame_loop.mark_swapchain_pass();
                self.command_buffers[id.0].begin_render_pass(framebuffer, force_clear);
            }
        }
        Ok(())
    }

    pub fn end_render_pass(&mut self, id: CommandBufferId) {
        self.cmd(id).end_render_pass();
    }

    pub fn clear_color_attachments(&mut self, id: CommandBufferId, color: [f32; 4]) {
        self.cmd(id).clear_color_attachments(color);
    }

    pub fn clear_depth_stencil_attachment(&mut self, id: CommandBufferId, depth: f32, stencil: u32) {
        self.cmd(id).clear_depth_stencil_attachment(depth, stencil);
    }

    pub fn bind_pipeline_state(&mut self, id: CommandBufferId, pipeline: &PipelineState) {
        self.cmd(id).bind_pipeline_state(pipeline);
    }

    pub fn bind_descriptor_set(
        &mut self,
        id: CommandBufferId,
        set: &DescriptorSet,
        pipeline: &PipelineState,
        set_index: u32,
        dynamic_offsets: &[u32],
    ) -> Result<()> {
        self.cmd(id)
            .bind_descriptor_set(set, pipeline, set_index, dynamic_offsets)
    }

    pub fn bind_buffer(&mut self, id: CommandBufferId, buffer: &Buffer, offset: u64) {
        self.cmd(id).bind_buffer(buffer, offset);
    }

    pub fn bind_vertex_buffer_at(&mut self, id: CommandBufferId, binding: u32, buffer: &Buffer, offset: u64) {
        self.cmd(id).bind_buffer_at(binding, buffer, offset);
    }

    /// Empty `stages` pushes to every stage declaring the touched range.
    pub fn set_push_constants(
        &mut self,
        id: CommandBufferId,
        pipeline: &PipelineState,
        stages: ShaderStages,
        data: &[u8],
        offset: u32,
    ) {
        self.cmd(id).set_push_constants(pipeline, stages, data, offset);
    }

    pub fn draw(&mut self, id: CommandBufferId, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        self.cmd(id)
            .draw(vertex_count, instance_count, first_vertex, first_instance);
    }

    pub fn draw_indexed(
        &mut self,
        id: CommandBufferId,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        self.cmd(id).draw_indexed(
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        );
    }

    pub fn set_viewports(&mut self, id: CommandBufferId, first: u32, viewports: &[Viewport]) {
        self.cmd(id).set_viewports(first, viewports);
    }

    pub fn set_scissor_rects(&mut self, id: CommandBufferId, first: u32, rects: &[ScissorRect]) {
        self.cmd(id).set_scissor_rects(first, rects);
    }

    pub fn set_depth_bias(&mut self, id: CommandBufferId, constant_factor: f32, clamp: f32, slope_factor: f32) {
        self.cmd(id).set_depth_bias(constant_factor, clamp, slope_factor);
    }

    pub fn pipeline_barrier_texture(&mut self, id: CommandBufferId, texture: &Texture) {
        self.cmd(id).pipeline_barrier_texture(texture);
    }
}
