// Graphics pipeline state
//
// A PipelineState bakes shaders, vertex input, rasterization, depth/stencil
// and blending into one native pipeline plus its layout. Everything is
// described by PipelineStateData and validated before creation.

use anyhow::{Context, Result};
use ash::vk;
use std::ffi::CStr;
use std::sync::Arc;

use super::buffer::DataLayout;
use super::descriptor::{DescriptorSetLayout, ShaderStages};
use super::handle::Owned;
use super::render_pass::RenderPass;
use super::shader::{ShaderBlob, ShaderModule};
use super::VulkanDevice;
use crate::gfx_assert;

/// Guaranteed minimum of `maxPushConstantsSize`.
pub const MAX_PUSH_CONSTANT_SIZE: u32 = 128;

const ENTRY_POINT: &CStr = c"main";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    pub fn covering(extent: vk::Extent2D) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }

    pub fn to_vk(self) -> vk::Viewport {
        vk::Viewport {
            x: self.x,
            y: self.y,
            width: self.width,
            height: self.height,
            min_depth: self.min_depth,
            max_depth: self.max_depth,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScissorRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl ScissorRect {
    pub fn covering(extent: vk::Extent2D) -> Self {
        Self {
            x: 0,
            y: 0,
            width: extent.width,
            height: extent.height,
        }
    }

    pub fn to_vk(self) -> vk::Rect2D {
        vk::Rect2D {
            offset: vk::Offset2D { x: self.x, y: self.y },
            extent: vk::Extent2D {
                width: self.width,
                height: self.height,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrimitiveTopology {
    Points,
    Lines,
    #[default]
    Triangles,
    LineStrip,
    TriangleStrip,
}

impl PrimitiveTopology {
    pub fn to_vk(self) -> vk::PrimitiveTopology {
        match self {
            PrimitiveTopology::Points => vk::PrimitiveTopology::POINT_LIST,
            PrimitiveTopology::Lines => vk::PrimitiveTopology::LINE_LIST,
            PrimitiveTopology::Triangles => vk::PrimitiveTopology::TRIANGLE_LIST,
            PrimitiveTopology::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
            PrimitiveTopology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthBias {
    pub constant_factor: f32,
    pub clamp: f32,
    pub slope_factor: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterizerState {
    pub depth_clamp: bool,
    pub rasterizer_discard: bool,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face_counter_clockwise: bool,
    pub depth_bias: Option<DepthBias>,
    pub line_width: f32,
}

impl Default for RasterizerState {
    fn default() -> Self {
        Self {
            depth_clamp: false,
            rasterizer_discard: false,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::NONE,
            front_face_counter_clockwise: true,
            depth_bias: None,
            line_width: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DepthStencilState {
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: vk::CompareOp,
    pub stencil_test: bool,
    pub front: vk::StencilOpState,
    pub back: vk::StencilOpState,
}

impl DepthStencilState {
    /// Standard less-than depth test with writes.
    pub fn depth_less() -> Self {
        Self {
            depth_test: true,
            depth_write: true,
            depth_compare: vk::CompareOp::LESS,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlendingStateAttachment {
    pub enabled: bool,
    pub src_color: vk::BlendFactor,
    pub dst_color: vk::BlendFactor,
    pub color_op: vk::BlendOp,
    pub src_alpha: vk::BlendFactor,
    pub dst_alpha: vk::BlendFactor,
    pub alpha_op: vk::BlendOp,
    pub write_mask: vk::ColorComponentFlags,
}

impl Default for BlendingStateAttachment {
    fn default() -> Self {
        Self {
            enabled: false,
            src_color: vk::BlendFactor::SRC_ALPHA,
            dst_color: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            color_op: vk::BlendOp::ADD,
            src_alpha: vk::BlendFactor::ONE,
            dst_alpha: vk::BlendFactor::ONE,
            alpha_op: vk::BlendOp::ADD,
            write_mask: vk::ColorComponentFlags::RGBA,
        }
    }
}

impl BlendingStateAttachment {
    pub fn alpha_blended() -> Self {
        Self {
            enabled: true,
            ..Default::default()
        }
    }

    fn to_vk(self) -> vk::PipelineColorBlendAttachmentState {
        vk::PipelineColorBlendAttachmentState {
            blend_enable: self.enabled.into(),
            src_color_blend_factor: self.src_color,
            dst_color_blend_factor: self.dst_color,
            color_blend_op: self.color_op,
            src_alpha_blend_factor: self.src_alpha,
            dst_alpha_blend_factor: self.dst_alpha,
            alpha_blend_op: self.alpha_op,
            color_write_mask: self.write_mask,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BlendingState {
    /// One per color attachment of the subpass.
    pub attachments: Vec<BlendingStateAttachment>,
    pub constants: [f32; 4],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushConstantDesc {
    pub stages: ShaderStages,
    pub offset: u32,
    pub size: u32,
}

impl PushConstantDesc {
    pub fn new(stages: ShaderStages, offset: u32, size: u32) -> Self {
        check_push_constant_range(offset, size);
        Self { stages, offset, size }
    }

    fn overlaps(&self, offset: u32, size: u32) -> bool {
        offset < self.offset + self.size && self.offset < offset + size
    }
}

/// Offset and size must be multiples of 4 and fit in the guaranteed range.
pub fn check_push_constant_range(offset: u32, size: u32) {
    gfx_assert!(size > 0, "Push constant size must be greater than zero");
    gfx_assert!(
        offset % 4 == 0 && size % 4 == 0,
        "Push constant offset {} and size {} must be multiples of 4",
        offset,
        size
    );
    gfx_assert!(
        offset + size <= MAX_PUSH_CONSTANT_SIZE,
        "Push constant range {}..{} exceeds {} bytes",
        offset,
        offset + size,
        MAX_PUSH_CONSTANT_SIZE
    );
}

/// Stages of every declared range the update `offset..offset + size` touches.
pub fn merged_push_constant_stages(descs: &[PushConstantDesc], offset: u32, size: u32) -> ShaderStages {
    descs
        .iter()
        .filter(|desc| desc.overlaps(offset, size))
        .fold(ShaderStages::empty(), |stages, desc| stages | desc.stages)
}

#[derive(Debug, Clone)]
pub struct PipelineStateData {
    pub shaders: Vec<ShaderBlob>,
    /// One vertex buffer binding per layout, attributes at consecutive locations.
    pub vertex_layouts: Vec<DataLayout>,
    pub topology: PrimitiveTopology,
    pub viewports: Vec<Viewport>,
    pub scissor_rects: Vec<ScissorRect>,
    pub rasterizer: RasterizerState,
    pub depth_stencil: DepthStencilState,
    pub blending: BlendingState,
    pub dynamic_states: Vec<vk::DynamicState>,
    pub descriptor_set_layouts: Vec<Arc<DescriptorSetLayout>>,
    pub push_constants: Vec<PushConstantDesc>,
    pub render_pass: Arc<RenderPass>,
    pub subpass_index: u32,
}

impl PipelineStateData {
    /// Triangles, dynamic viewport and scissor, one opaque blend state per
    /// color attachment, no depth test.
    pub fn new(render_pass: &Arc<RenderPass>, shaders: Vec<ShaderBlob>) -> Self {
        let color_count = render_pass.desc().color_attachment_count();
        Self {
            shaders,
            vertex_layouts: Vec::new(),
            topology: PrimitiveTopology::Triangles,
            viewports: Vec::new(),
            scissor_rects: Vec::new(),
            rasterizer: RasterizerState::default(),
            depth_stencil: DepthStencilState::default(),
            blending: BlendingState {
                attachments: vec![BlendingStateAttachment::default(); color_count],
                constants: [0.0; 4],
            },
            dynamic_states: vec![vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR],
            descriptor_set_layouts: Vec::new(),
            push_constants: Vec::new(),
            render_pass: Arc::clone(render_pass),
            subpass_index: 0,
        }
    }

    fn has_dynamic(&self, state: vk::DynamicState) -> bool {
        self.dynamic_states.contains(&state)
    }

    pub fn validate(&self) {
        gfx_assert!(
            self.shaders.iter().any(|blob| blob.stage == ShaderStages::VERTEX),
            "Pipeline state needs a vertex shader"
        );
        let dynamic_viewport = self.has_dynamic(vk::DynamicState::VIEWPORT);
        let dynamic_scissor = self.has_dynamic(vk::DynamicState::SCISSOR);
        gfx_assert!(
            dynamic_viewport || !self.viewports.is_empty(),
            "Pipeline state without a dynamic viewport needs at least one viewport"
        );
        gfx_assert!(
            dynamic_viewport || dynamic_scissor || self.scissor_rects.len() == self.viewports.len(),
            "Static viewports and scissor rects must come in equal numbers"
        );
        gfx_assert!(
            (self.subpass_index as usize) < self.render_pass.desc().subpasses().len(),
            "Subpass {} is out of range",
            self.subpass_index
        );
        let color_count = self.render_pass.desc().subpasses()[self.subpass_index as usize]
            .color_refs
            .len();
        gfx_assert!(
            self.blending.attachments.len() == color_count,
            "{} blending states for {} color attachments",
            self.blending.attachments.len(),
            color_count
        );
        for push_constant in &self.push_constants {
            check_push_constant_range(push_constant.offset, push_constant.size);
        }
    }

    pub fn push_constant_stages(&self, offset: u32, size: u32) -> ShaderStages {
        merged_push_constant_stages(&self.push_constants, offset, size)
    }
}

#[derive(Debug)]
pub struct PipelineState {
    pipeline: Owned<vk::Pipeline>,
    layout: Owned<vk::PipelineLayout>,
    data: PipelineStateData,
}

impl PipelineState {
    pub fn new(device: &Arc<VulkanDevice>, data: PipelineStateData) -> Result<Arc<Self>> {
        data.validate();

        let set_layouts: Vec<vk::DescriptorSetLayout> =
            data.descriptor_set_layouts.iter().map(|layout| layout.raw()).collect();
        let push_constant_ranges: Vec<vk::PushConstantRange> = data
            .push_constants
            .iter()
            .map(|desc| vk::PushConstantRange {
                stage_flags: desc.stages.to_vk(),
                offset: desc.offset,
                size: desc.size,
            })
            .collect();
        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_constant_ranges);
        let layout = unsafe { device.device.create_pipeline_layout(&layout_info, None) }
            .context("Failed to create pipeline layout")?;
        let layout = Owned::new(device, layout);

        let pipeline = create_pipeline(device, &data, layout.raw())?;

        Ok(Arc::new(Self {
            pipeline: Owned::new(device, pipeline),
            layout,
            data,
        }))
    }

    pub fn raw(&self) -> vk::Pipeline {
        self.pipeline.raw()
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout.raw()
    }

    pub fn data(&self) -> &PipelineStateData {
        &self.data
    }
}

fn create_pipeline(
    device: &Arc<VulkanDevice>,
    data: &PipelineStateData,
    layout: vk::PipelineLayout,
) -> Result<vk::Pipeline> {
    // Modules are dropped once the pipeline exists.
    let modules = data
        .shaders
        .iter()
        .map(|blob| ShaderModule::new(device, &blob.code))
        .collect::<Result<Vec<_>>>()?;
    let stages: Vec<vk::PipelineShaderStageCreateInfo> = data
        .shaders
        .iter()
        .zip(&modules)
        .map(|(blob, module)| {
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(blob.stage.to_vk())
                .module(module.raw())
                .name(ENTRY_POINT)
                .build()
        })
        .collect();

    let mut bindings = Vec::with_capacity(data.vertex_layouts.len());
    let mut attributes = Vec::new();
    for (binding, layout) in data.vertex_layouts.iter().enumerate() {
        bindings.push(layout.binding_description(binding as u32));
        attributes.extend(layout.attribute_descriptions(binding as u32, attributes.len() as u32));
    }
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(data.topology.to_vk())
        .primitive_restart_enable(false);

    // Dynamic viewports still need a count.
    let viewports: Vec<vk::Viewport> = data.viewports.iter().map(|v| v.to_vk()).collect();
    let scissors: Vec<vk::Rect2D> = data.scissor_rects.iter().map(|s| s.to_vk()).collect();
    let viewport_count = viewports.len().max(1) as u32;
    let mut viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(viewport_count)
        .scissor_count(viewport_count);
    if !viewports.is_empty() {
        viewport_state = viewport_state.viewports(&viewports);
    }
    if !scissors.is_empty() {
        viewport_state = viewport_state.scissors(&scissors);
    }

    let rasterizer = &data.rasterizer;
    let depth_bias = rasterizer.depth_bias.unwrap_or(DepthBias {
        constant_factor: 0.0,
        clamp: 0.0,
        slope_factor: 0.0,
    });
    let rasterization = vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(rasterizer.depth_clamp)
        .rasterizer_discard_enable(rasterizer.rasterizer_discard)
        .polygon_mode(rasterizer.polygon_mode)
        .cull_mode(rasterizer.cull_mode)
        .front_face(if rasterizer.front_face_counter_clockwise {
            vk::FrontFace::COUNTER_CLOCKWISE
        } else {
            vk::FrontFace::CLOCKWISE
        })
        .depth_bias_enable(rasterizer.depth_bias.is_some() || data.has_dynamic(vk::DynamicState::DEPTH_BIAS))
        .depth_bias_constant_factor(depth_bias.constant_factor)
        .depth_bias_clamp(depth_bias.clamp)
        .depth_bias_slope_factor(depth_bias.slope_factor)
        .line_width(rasterizer.line_width);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(data.depth_stencil.depth_test)
        .depth_write_enable(data.depth_stencil.depth_write)
        .depth_compare_op(data.depth_stencil.depth_compare)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(data.depth_stencil.stencil_test)
        .front(data.depth_stencil.front)
        .back(data.depth_stencil.back);

    let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> =
        data.blending.attachments.iter().map(|a| a.to_vk()).collect();
    let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .attachments(&blend_attachments)
        .blend_constants(data.blending.constants);

    let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&data.dynamic_states);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization)
        .multisample_state(&multisampling)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blending)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .render_pass(data.render_pass.handle(false))
        .subpass(data.subpass_index)
        .build();

    let pipelines = unsafe {
        device
            .device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    }
    .map_err(|(_, e)| e)
    .context("Failed to create graphics pipeline")?;

    pipelines
        .into_iter()
        .next()
        .context("Driver returned no pipeline")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_constant_ranges() {
        check_push_constant_range(0, 128);
        check_push_constant_range(64, 16);
    }

    #[test]
    #[should_panic(expected = "multiples of 4")]
    fn unaligned_push_constants_are_rejected() {
        check_push_constant_range(2, 8);
    }

    #[test]
    #[should_panic(expected = "exceeds 128 bytes")]
    fn oversized_push_constants_are_rejected() {
        check_push_constant_range(64, 80);
    }

    #[test]
    fn overlapping_push_constant_stages_are_merged() {
        let descs = [
            PushConstantDesc::new(ShaderStages::VERTEX, 0, 64),
            PushConstantDesc::new(ShaderStages::FRAGMENT, 64, 16),
        ];
        let stages = |offset, size| merged_push_constant_stages(&descs, offset, size);
        assert_eq!(stages(0, 16), ShaderStages::VERTEX);
        assert_eq!(stages(60, 8), ShaderStages::VERTEX | ShaderStages::FRAGMENT);
        assert_eq!(stages(64, 16), ShaderStages::FRAGMENT);
    }

    #[test]
    fn viewport_covers_extent() {
        let extent = vk::Extent2D { width: 800, height: 600 };
        let viewport = Viewport::covering(extent).to_vk();
        assert_eq!(viewport.width, 800.0);
        assert_eq!(viewport.max_depth, 1.0);
        assert_eq!(ScissorRect::covering(extent).to_vk().extent, extent);
    }

    #[test]
    fn topology_mapping() {
        assert_eq!(PrimitiveTopology::default().to_vk(), vk::PrimitiveTopology::TRIANGLE_LIST);
        assert_eq!(PrimitiveTopology::LineStrip.to_vk(), vk::PrimitiveTopology::LINE_STRIP);
    }
}
