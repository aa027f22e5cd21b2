// Command pools and command buffers
//
// Each frame slot owns one pool per queue family in use. Buffers are
// handed out from a free list, allocated four at a time, and all return
// to it when the slot's pool is reset at the start of its next frame.
// Recording goes straight to the native buffer.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::buffer::{Buffer, BufferUsage};
use super::descriptor::{DescriptorSet, ShaderStages};
use super::framebuffer::Framebuffer;
use super::handle::Owned;
use super::pipeline::{check_push_constant_range, PipelineState, ScissorRect, Viewport};
use super::query::QueryPool;
use super::queue::QueueFamily;
use super::texture::{image_barrier, Texture, TextureFormat};
use super::VulkanDevice;
use crate::gfx_assert;

/// Command buffers allocated per trip to the driver.
pub const COMMAND_BUFFER_BATCH: u32 = 4;

/// Free list plus in-use list. Nothing is ever released; `recycle` hands
/// every issued item out again.
#[derive(Debug)]
pub struct Recycler<T> {
    free: Vec<T>,
    in_use: Vec<T>,
}

impl<T> Default for Recycler<T> {
    fn default() -> Self {
        Self {
            free: Vec::new(),
            in_use: Vec::new(),
        }
    }
}

impl<T: Copy> Recycler<T> {
    /// Take a free item, refilling the free list with `allocate` when empty.
    pub fn acquire<F>(&mut self, allocate: F) -> Result<T>
    where
        F: FnOnce() -> Result<Vec<T>>,
    {
        if self.free.is_empty() {
            self.free.extend(allocate()?);
        }
        let item = self.free.pop().context("Allocation returned no items")?;
        self.in_use.push(item);
        Ok(item)
    }

    pub fn recycle(&mut self) {
        self.free.append(&mut self.in_use);
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.len()
    }
}

#[derive(Debug)]
pub struct CommandPool {
    raw: Owned<vk::CommandPool>,
    family: QueueFamily,
    buffers: Recycler<vk::CommandBuffer>,
}

impl CommandPool {
    pub fn new(device: &Arc<VulkanDevice>, family: QueueFamily) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(family.index())
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let raw = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;
        Ok(Self {
            raw: Owned::new(device, raw),
            family,
            buffers: Recycler::default(),
        })
    }

    pub fn family(&self) -> QueueFamily {
        self.family
    }

    pub fn in_use_count(&self) -> usize {
        self.buffers.in_use_count()
    }

    /// A fresh primary buffer, valid until this pool's next reset.
    pub fn command_buffer(&mut self) -> Result<CommandBuffer> {
        let device = self.raw.device();
        let pool = self.raw.raw();
        let family_index = self.family.index();
        let raw = self.buffers.acquire(|| {
            let alloc_info = vk::CommandBufferAllocateInfo::builder()
                .command_pool(pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(COMMAND_BUFFER_BATCH);
            let buffers = unsafe { device.device.allocate_command_buffers(&alloc_info) }
                .context("Failed to allocate command buffers")?;
            Ok(buffers)
        })?;
        Ok(CommandBuffer::new(device, raw, family_index))
    }

    /// Only valid once the GPU is done with every buffer of this pool.
    pub fn reset(&mut self) -> Result<()> {
        let device = self.raw.device();
        unsafe {
            device
                .device
                .reset_command_pool(self.raw.raw(), vk::CommandPoolResetFlags::RELEASE_RESOURCES)
        }
        .context("Failed to reset command pool")?;
        self.buffers.recycle();
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct ActivePass {
    extent: vk::Extent2D,
    color_count: u32,
    depth_aspect: Option<vk::ImageAspectFlags>,
}

/// Primary command buffer being recorded for one frame.
pub struct CommandBuffer {
    raw: vk::CommandBuffer,
    family_index: u32,
    device: Arc<VulkanDevice>,
    command_count: u32,
    recording: bool,
    active_pass: Option<ActivePass>,
}

impl CommandBuffer {
    fn new(device: &Arc<VulkanDevice>, raw: vk::CommandBuffer, family_index: u32) -> Self {
        Self {
            raw,
            family_index,
            device: Arc::clone(device),
            command_count: 0,
            recording: false,
            active_pass: None,
        }
    }

    pub fn raw(&self) -> vk::CommandBuffer {
        self.raw
    }

    /// Family of the pool this buffer came from. It may only be submitted
    /// to a queue of that family.
    pub fn family_index(&self) -> u32 {
        self.family_index
    }

    pub fn command_count(&self) -> u32 {
        self.command_count
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    fn vk(&self) -> &ash::Device {
        &self.device.device
    }

    pub fn begin(&mut self) -> Result<()> {
        gfx_assert!(!self.recording, "Command buffer is already recording");
        let begin_info =
            vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.vk().begin_command_buffer(self.raw, &begin_info) }
            .context("Failed to begin command buffer")?;
        self.recording = true;
        self.command_count = 0;
        Ok(())
    }

    pub fn end(&mut self) -> Result<()> {
        gfx_assert!(self.recording, "Command buffer is not recording");
        gfx_assert!(self.active_pass.is_none(), "Ending a command buffer inside a render pass");
        unsafe { self.vk().end_command_buffer(self.raw) }.context("Failed to end command buffer")?;
        self.recording = false;
        Ok(())
    }

    /// `force_clear` uses the pass variant that clears every attachment.
    pub fn begin_render_pass(&mut self, framebuffer: &Framebuffer, force_clear: bool) {
        gfx_assert!(self.recording, "Command buffer is not recording");
        gfx_assert!(self.active_pass.is_none(), "A render pass is already active");

        let render_pass = framebuffer.render_pass();
        let desc = render_pass.desc();
        let clear_values = desc.clear_values(force_clear);
        let extent = framebuffer.extent();

        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(render_pass.handle(force_clear))
            .framebuffer(framebuffer.raw())
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent,
            })
            .clear_values(&clear_values);
        unsafe {
            self.vk()
                .cmd_begin_render_pass(self.raw, &begin_info, vk::SubpassContents::INLINE)
        };

        self.active_pass = Some(ActivePass {
            extent,
            color_count: desc.color_attachment_count() as u32,
            depth_aspect: desc
                .depth_stencil_attachment()
                .map(|attachment| attachment.format.aspect_mask()),
        });
        self.command_count += 1;
    }

    pub fn end_render_pass(&mut self) {
        gfx_assert!(self.active_pass.is_some(), "No render pass is active");
        unsafe { self.vk().cmd_end_render_pass(self.raw) };
        self.active_pass = None;
        self.command_count += 1;
    }

    fn whole_pass_rect(&self) -> Option<(ActivePass, vk::ClearRect)> {
        let pass = self.active_pass?;
        Some((
            pass,
            vk::ClearRect {
                rect: vk::Rect2D {
                    offset: vk::Offset2D::default(),
                    extent: pass.extent,
                },
                base_array_layer: 0,
                layer_count: 1,
            },
        ))
    }

    /// Clear every color attachment of the active pass.
    pub fn clear_color_attachments(&mut self, color: [f32; 4]) {
        let Some((pass, rect)) = self.whole_pass_rect() else {
            gfx_assert!(false, "Clearing attachments outside a render pass");
            return;
        };
        let attachments: Vec<vk::ClearAttachment> = (0..pass.color_count)
            .map(|index| vk::ClearAttachment {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                color_attachment: index,
                clear_value: vk::ClearValue {
                    color: vk::ClearColorValue { float32: color },
                },
            })
            .collect();
        unsafe { self.vk().cmd_clear_attachments(self.raw, &attachments, &[rect]) };
        self.command_count += 1;
    }

    pub fn clear_depth_stencil_attachment(&mut self, depth: f32, stencil: u32) {
        let Some((pass, rect)) = self.whole_pass_rect() else {
            gfx_assert!(false, "Clearing attachments outside a render pass");
            return;
        };
        let Some(aspect_mask) = pass.depth_aspect else {
            gfx_assert!(false, "The active render pass has no depth/stencil attachment");
            return;
        };
        let attachment = vk::ClearAttachment {
            aspect_mask,
            color_attachment: 0,
            clear_value: vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
            },
        };
        unsafe { self.vk().cmd_clear_attachments(self.raw, &[attachment], &[rect]) };
        self.command_count += 1;
    }

    /// Bind a vertex buffer at binding 0 or an index buffer. `offset` is
    /// logical; the current replica base is added for replicated buffers.
    pub fn bind_buffer(&mut self, buffer: &Buffer, offset: u64) {
        self.bind_buffer_at(0, buffer, offset);
    }

    pub fn bind_buffer_at(&mut self, binding: u32, buffer: &Buffer, offset: u64) {
        let usage = buffer.usage();
        gfx_assert!(
            usage.intersects(BufferUsage::VERTEX | BufferUsage::INDEX),
            "Only vertex and index buffers can be bound"
        );
        let offset = buffer.current_base_of_replica() + offset;

        if usage.contains(BufferUsage::VERTEX) {
            unsafe {
                self.vk()
                    .cmd_bind_vertex_buffers(self.raw, binding, &[buffer.raw()], &[offset])
            };
        } else {
            let index_type = buffer
                .layout()
                .and_then(|layout| layout.index_type())
                .unwrap_or(vk::IndexType::UINT32);
            unsafe {
                self.vk()
                    .cmd_bind_index_buffer(self.raw, buffer.raw(), offset, index_type)
            };
        }
        self.command_count += 1;
    }

    pub fn bind_pipeline_state(&mut self, pipeline: &PipelineState) {
        unsafe {
            self.vk()
                .cmd_bind_pipeline(self.raw, vk::PipelineBindPoint::GRAPHICS, pipeline.raw())
        };
        self.command_count += 1;
    }

    /// `user_offsets` are added, in binding order, to the replica offsets
    /// of the set's dynamic buffers.
    pub fn bind_descriptor_set(
        &mut self,
        set: &DescriptorSet,
        pipeline: &PipelineState,
        set_index: u32,
        user_offsets: &[u32],
    ) -> Result<()> {
        let dynamic_offsets = set.dynamic_offsets(user_offsets)?;
        unsafe {
            self.vk().cmd_bind_descriptor_sets(
                self.raw,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline.layout(),
                set_index,
                &[set.native()],
                &dynamic_offsets,
            )
        };
        self.command_count += 1;
        Ok(())
    }

    /// Empty `stages` means every stage whose declared range the update touches.
    pub fn set_push_constants(&mut self, pipeline: &PipelineState, stages: ShaderStages, data: &[u8], offset: u32) {
        let size = data.len() as u32;
        check_push_constant_range(offset, size);
        let stages = if stages.is_empty() {
            pipeline.data().push_constant_stages(offset, size)
        } else {
            stages
        };
        unsafe {
            self.vk()
                .cmd_push_constants(self.raw, pipeline.layout(), stages.to_vk(), offset, data)
        };
        self.command_count += 1;
    }

    pub fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        unsafe {
            self.vk()
                .cmd_draw(self.raw, vertex_count, instance_count, first_vertex, first_instance)
        };
        self.command_count += 1;
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.vk().cmd_draw_indexed(
                self.raw,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        };
        self.command_count += 1;
    }

    pub fn set_viewports(&mut self, first: u32, viewports: &[Viewport]) {
        let viewports: Vec<vk::Viewport> = viewports.iter().map(|v| v.to_vk()).collect();
        unsafe { self.vk().cmd_set_viewport(self.raw, first, &viewports) };
        self.command_count += 1;
    }

    pub fn set_scissor_rects(&mut self, first: u32, rects: &[ScissorRect]) {
        let rects: Vec<vk::Rect2D> = rects.iter().map(|r| r.to_vk()).collect();
        unsafe { self.vk().cmd_set_scissor(self.raw, first, &rects) };
        self.command_count += 1;
    }

    pub fn set_depth_bias(&mut self, constant_factor: f32, clamp: f32, slope_factor: f32) {
        unsafe {
            self.vk()
                .cmd_set_depth_bias(self.raw, constant_factor, clamp, slope_factor)
        };
        self.command_count += 1;
    }

    pub fn reset_queries(&mut self, pool: &QueryPool, first: u32, count: u32) {
        gfx_assert!(self.active_pass.is_none(), "Query resets must be recorded outside a render pass");
        unsafe { self.vk().cmd_reset_query_pool(self.raw, pool.raw(), first, count) };
        self.command_count += 1;
    }

    pub fn write_timestamp(&mut self, pool: &QueryPool, stage: vk::PipelineStageFlags, query: u32) {
        gfx_assert!(query < pool.count(), "Query {} out of range for a pool of {}", query, pool.count());
        unsafe { self.vk().cmd_write_timestamp(self.raw, stage, pool.raw(), query) };
        self.command_count += 1;
    }

    /// Make a texture just rendered as an attachment readable by fragment
    /// shaders.
    pub fn pipeline_barrier_texture(&mut self, texture: &Texture) {
        gfx_assert!(self.active_pass.is_none(), "Texture barriers must be recorded outside a render pass");
        let masks = attachment_read_barrier(texture.format());
        image_barrier(
            self.vk(),
            self.raw,
            texture.raw(),
            texture.subresource_range(0, texture.mip_levels()),
            (masks.old_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
            (masks.src_access, vk::AccessFlags::SHADER_READ),
            (masks.src_stage, vk::PipelineStageFlags::FRAGMENT_SHADER),
        );
        self.command_count += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierSource {
    pub old_layout: vk::ImageLayout,
    pub src_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
}

/// Where an attachment of `format` comes from when it's read after a pass.
pub fn attachment_read_barrier(format: TextureFormat) -> BarrierSource {
    if format.is_color() {
        BarrierSource {
            old_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            src_access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            src_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        }
    } else {
        BarrierSource {
            old_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            src_access: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            src_stage: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn allocates_in_batches() {
        let mut recycler = Recycler::default();
        let next = Cell::new(0u32);
        let calls = Cell::new(0);
        let batch = || {
            calls.set(calls.get() + 1);
            let start = next.get();
            next.set(start + COMMAND_BUFFER_BATCH);
            Ok((start..start + COMMAND_BUFFER_BATCH).collect::<Vec<_>>())
        };

        for _ in 0..COMMAND_BUFFER_BATCH {
            recycler.acquire(batch).unwrap();
        }
        assert_eq!(calls.get(), 1);
        assert_eq!(recycler.free_count(), 0);

        recycler.acquire(batch).unwrap();
        assert_eq!(calls.get(), 2);
        assert_eq!(recycler.in_use_count(), 5);
        assert_eq!(recycler.free_count(), 3);
    }

    #[test]
    fn recycle_reuses_everything_issued() {
        let mut recycler = Recycler::default();
        let mut issued = Vec::new();
        for _ in 0..2 {
            issued.push(recycler.acquire(|| Ok(vec![10u32, 11, 12, 13])).unwrap());
        }
        recycler.recycle();
        assert_eq!(recycler.in_use_count(), 0);
        assert_eq!(recycler.free_count(), 4);

        let never = || -> Result<Vec<u32>> { panic!("no allocation expected after recycle") };
        for _ in 0..4 {
            recycler.acquire(never).unwrap();
        }
        assert_eq!(recycler.in_use_count(), 4);
    }

    #[test]
    fn failed_allocation_propagates() {
        let mut recycler: Recycler<u32> = Recycler::default();
        assert!(recycler.acquire(|| anyhow::bail!("device lost")).is_err());
        assert!(recycler.acquire(|| Ok(Vec::new())).is_err());
        assert_eq!(recycler.in_use_count(), 0);
    }

    #[test]
    fn barrier_source_depends_on_format() {
        let color = attachment_read_barrier(TextureFormat::R8G8B8A8);
        assert_eq!(color.old_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(color.src_stage, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);

        let depth = attachment_read_barrier(TextureFormat::D24S8);
        assert_eq!(depth.old_layout, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
        assert_eq!(depth.src_access, vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE);
        assert!(depth.src_stage.contains(vk::PipelineStageFlags::LATE_FRAGMENT_TESTS));
    }
}
