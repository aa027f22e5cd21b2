// Render passes
//
// Each RenderPass owns two native handles: the one described by the caller
// and a "force clear" twin that clears every attachment from UNDEFINED.
// The twin is used for the first pass that touches a swapchain image in a
// frame, when its previous contents are meaningless.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::handle::Owned;
use super::texture::TextureFormat;
use super::VulkanDevice;
use crate::gfx_assert;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

impl ClearValue {
    pub fn to_vk(self) -> vk::ClearValue {
        match self {
            ClearValue::Color(float32) => vk::ClearValue {
                color: vk::ClearColorValue { float32 },
            },
            ClearValue::DepthStencil { depth, stencil } => vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttachmentDescription {
    pub format: TextureFormat,
    pub samples: vk::SampleCountFlags,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub stencil_load_op: vk::AttachmentLoadOp,
    pub stencil_store_op: vk::AttachmentStoreOp,
    pub initial_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
    pub clear_value: ClearValue,
}

impl AttachmentDescription {
    /// Cleared color target that ends up readable by shaders.
    pub fn color(format: TextureFormat) -> Self {
        Self {
            format,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            clear_value: ClearValue::Color([0.0, 0.0, 0.0, 1.0]),
        }
    }

    /// Cleared depth (and stencil, if the format has it) target.
    pub fn depth(format: TextureFormat) -> Self {
        let stencil_load_op = if format.is_stencil() {
            vk::AttachmentLoadOp::CLEAR
        } else {
            vk::AttachmentLoadOp::DONT_CARE
        };
        Self {
            format,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::DONT_CARE,
            stencil_load_op,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            clear_value: ClearValue::DepthStencil { depth: 1.0, stencil: 0 },
        }
    }

    pub fn load(mut self, op: vk::AttachmentLoadOp) -> Self {
        self.load_op = op;
        self
    }

    pub fn store(mut self, op: vk::AttachmentStoreOp) -> Self {
        self.store_op = op;
        self
    }

    pub fn layouts(mut self, initial: vk::ImageLayout, final_layout: vk::ImageLayout) -> Self {
        self.initial_layout = initial;
        self.final_layout = final_layout;
        self
    }

    pub fn clear_value(mut self, value: ClearValue) -> Self {
        self.clear_value = value;
        self
    }

    fn clears(&self) -> bool {
        self.load_op == vk::AttachmentLoadOp::CLEAR || self.stencil_load_op == vk::AttachmentLoadOp::CLEAR
    }

    fn to_vk(self, force_clear: bool) -> vk::AttachmentDescription {
        let (load_op, stencil_load_op, initial_layout) = if force_clear {
            (
                vk::AttachmentLoadOp::CLEAR,
                vk::AttachmentLoadOp::CLEAR,
                vk::ImageLayout::UNDEFINED,
            )
        } else {
            (self.load_op, self.stencil_load_op, self.initial_layout)
        };
        vk::AttachmentDescription {
            flags: vk::AttachmentDescriptionFlags::empty(),
            format: self.format.to_vk(),
            samples: self.samples,
            load_op,
            store_op: self.store_op,
            stencil_load_op,
            stencil_store_op: self.stencil_store_op,
            initial_layout,
            final_layout: self.final_layout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentReference {
    /// Index into the render pass attachment list.
    pub index: u32,
    pub layout: vk::ImageLayout,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubPassDescription {
    /// Order matches the fragment shader outputs.
    pub color_refs: Vec<AttachmentReference>,
    pub depth_stencil_ref: Option<AttachmentReference>,
    pub preserve_indices: Vec<u32>,
}

impl SubPassDescription {
    /// One subpass writing every attachment of `attachments`.
    pub fn writing_all(attachments: &[AttachmentDescription]) -> Self {
        let mut subpass = Self::default();
        for (index, attachment) in attachments.iter().enumerate() {
            if attachment.format.is_color() {
                subpass.color_refs.push(AttachmentReference {
                    index: index as u32,
                    layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                });
            } else {
                subpass.depth_stencil_ref = Some(AttachmentReference {
                    index: index as u32,
                    layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                });
            }
        }
        subpass
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubPassDependency {
    /// Subpass index or `vk::SUBPASS_EXTERNAL`.
    pub src_subpass: u32,
    pub dst_subpass: u32,
    pub src_stage_mask: vk::PipelineStageFlags,
    pub dst_stage_mask: vk::PipelineStageFlags,
    pub src_access_mask: vk::AccessFlags,
    pub dst_access_mask: vk::AccessFlags,
    pub flags: vk::DependencyFlags,
}

impl SubPassDependency {
    /// Wait for the previous user of the attachments before writing them.
    pub fn external_attachment_write() -> Self {
        Self {
            src_subpass: vk::SUBPASS_EXTERNAL,
            dst_subpass: 0,
            src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            src_access_mask: vk::AccessFlags::empty(),
            dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            flags: vk::DependencyFlags::empty(),
        }
    }

    fn to_vk(self) -> vk::SubpassDependency {
        vk::SubpassDependency {
            src_subpass: self.src_subpass,
            dst_subpass: self.dst_subpass,
            src_stage_mask: self.src_stage_mask,
            dst_stage_mask: self.dst_stage_mask,
            src_access_mask: self.src_access_mask,
            dst_access_mask: self.dst_access_mask,
            dependency_flags: self.flags,
        }
    }
}

/// Attachments, subpasses and dependencies, plus the color/depth split.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderPassDesc {
    attachments: Vec<AttachmentDescription>,
    subpasses: Vec<SubPassDescription>,
    dependencies: Vec<SubPassDependency>,
    color_indices: Vec<u32>,
    depth_stencil_index: Option<u32>,
}

impl RenderPassDesc {
    pub fn new(
        attachments: Vec<AttachmentDescription>,
        subpasses: Vec<SubPassDescription>,
        dependencies: Vec<SubPassDependency>,
    ) -> Self {
        gfx_assert!(!attachments.is_empty(), "Render pass has no attachments");
        gfx_assert!(!subpasses.is_empty(), "Render pass has no subpasses");

        let mut color_indices = Vec::new();
        let mut depth_stencil_index = None;
        for (index, attachment) in attachments.iter().enumerate() {
            if attachment.format.is_color() {
                color_indices.push(index as u32);
            } else if attachment.format.is_depth() || attachment.format.is_stencil() {
                gfx_assert!(
                    depth_stencil_index.is_none(),
                    "Render pass has more than one depth/stencil attachment"
                );
                depth_stencil_index = Some(index as u32);
            }
        }

        Self {
            attachments,
            subpasses,
            dependencies,
            color_indices,
            depth_stencil_index,
        }
    }

    /// One subpass writing every attachment.
    pub fn single_subpass(attachments: Vec<AttachmentDescription>) -> Self {
        let subpass = SubPassDescription::writing_all(&attachments);
        Self::new(
            attachments,
            vec![subpass],
            vec![SubPassDependency::external_attachment_write()],
        )
    }

    pub fn attachments(&self) -> &[AttachmentDescription] {
        &self.attachments
    }

    pub fn attachment_count(&self) -> usize {
        self.attachments.len()
    }

    pub fn color_attachment_count(&self) -> usize {
        self.color_indices.len()
    }

    pub fn color_attachment(&self, index: usize) -> &AttachmentDescription {
        gfx_assert!(
            index < self.color_indices.len(),
            "Color attachment {} is out of range",
            index
        );
        &self.attachments[self.color_indices[index] as usize]
    }

    pub fn has_depth_stencil_attachment(&self) -> bool {
        self.depth_stencil_index.is_some()
    }

    pub fn depth_stencil_attachment(&self) -> Option<&AttachmentDescription> {
        self.depth_stencil_index.map(|index| &self.attachments[index as usize])
    }

    pub fn subpasses(&self) -> &[SubPassDescription] {
        &self.subpasses
    }

    /// One value per attachment, by attachment index. Attachments that
    /// don't clear get a zero value the driver ignores.
    pub fn clear_values(&self, force_clear: bool) -> Vec<vk::ClearValue> {
        self.attachments
            .iter()
            .map(|attachment| {
                if force_clear || attachment.clears() {
                    attachment.clear_value.to_vk()
                } else {
                    vk::ClearValue::default()
                }
            })
            .collect()
    }

    /// Framebuffer attachments must match this pass one to one, in count
    /// and in format.
    pub fn validate_attachment_formats(&self, formats: &[TextureFormat]) {
        gfx_assert!(
            formats.len() == self.attachments.len(),
            "Framebuffer attachment count {} doesn't match the render pass attachment count {}",
            formats.len(),
            self.attachments.len()
        );
        for (index, (format, attachment)) in formats.iter().zip(&self.attachments).enumerate() {
            gfx_assert!(
                *format == attachment.format,
                "Framebuffer attachment {} has format {:?}, the render pass expects {:?}",
                index,
                format.to_vk(),
                attachment.format.to_vk()
            );
        }
    }
}

#[derive(Debug)]
pub struct RenderPass {
    desc: RenderPassDesc,
    original: Owned<vk::RenderPass>,
    force_clear: Owned<vk::RenderPass>,
}

impl RenderPass {
    pub fn new(device: &Arc<VulkanDevice>, desc: RenderPassDesc) -> Result<Arc<Self>> {
        let original = create_native(device, &desc, false)?;
        let original = Owned::new(device, original);
        let force_clear = create_native(device, &desc, true)?;
        let force_clear = Owned::new(device, force_clear);
        Ok(Arc::new(Self {
            desc,
            original,
            force_clear,
        }))
    }

    pub fn desc(&self) -> &RenderPassDesc {
        &self.desc
    }

    pub fn handle(&self, force_clear: bool) -> vk::RenderPass {
        if force_clear {
            self.force_clear.raw()
        } else {
            self.original.raw()
        }
    }
}

fn create_native(device: &VulkanDevice, desc: &RenderPassDesc, force_clear: bool) -> Result<vk::RenderPass> {
    let attachments: Vec<vk::AttachmentDescription> = desc
        .attachments
        .iter()
        .map(|attachment| attachment.to_vk(force_clear))
        .collect();

    // Reference arrays must outlive the subpass descriptions that point at them.
    let color_refs: Vec<Vec<vk::AttachmentReference>> = desc
        .subpasses
        .iter()
        .map(|subpass| {
            subpass
                .color_refs
                .iter()
                .map(|r| vk::AttachmentReference {
                    attachment: r.index,
                    layout: r.layout,
                })
                .collect()
        })
        .collect();
    let depth_refs: Vec<Option<vk::AttachmentReference>> = desc
        .subpasses
        .iter()
        .map(|subpass| {
            subpass.depth_stencil_ref.map(|r| vk::AttachmentReference {
                attachment: r.index,
                layout: r.layout,
            })
        })
        .collect();

    let subpasses: Vec<vk::SubpassDescription> = desc
        .subpasses
        .iter()
        .enumerate()
        .map(|(i, subpass)| {
            let mut builder = vk::SubpassDescription::builder()
                .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                .color_attachments(&color_refs[i])
                .preserve_attachments(&subpass.preserve_indices);
            if let Some(depth_ref) = &depth_refs[i] {
                builder = builder.depth_stencil_attachment(depth_ref);
            }
            builder.build()
        })
        .collect();

    let dependencies: Vec<vk::SubpassDependency> = desc.dependencies.iter().map(|d| d.to_vk()).collect();

    let render_pass_info = vk::RenderPassCreateInfo::builder()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    let raw = unsafe { device.device.create_render_pass(&render_pass_info, None) }
        .context("Failed to create render pass")?;
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn color_and_depth() -> RenderPassDesc {
        RenderPassDesc::single_subpass(vec![
            AttachmentDescription::color(TextureFormat::R8G8B8A8)
                .load(vk::AttachmentLoadOp::LOAD)
                .clear_value(ClearValue::Color([0.1, 0.2, 0.3, 1.0])),
            AttachmentDescription::depth(TextureFormat::D32),
        ])
    }

    #[test]
    fn splits_color_and_depth() {
        let desc = color_and_depth();
        assert_eq!(desc.attachment_count(), 2);
        assert_eq!(desc.color_attachment_count(), 1);
        assert!(desc.has_depth_stencil_attachment());
        assert_eq!(desc.depth_stencil_attachment().map(|a| a.format), Some(TextureFormat::D32));

        let subpass = &desc.subpasses()[0];
        assert_eq!(subpass.color_refs.len(), 1);
        assert_eq!(subpass.depth_stencil_ref.map(|r| r.index), Some(1));
    }

    #[test]
    #[should_panic(expected = "more than one depth/stencil")]
    fn rejects_two_depth_attachments() {
        RenderPassDesc::single_subpass(vec![
            AttachmentDescription::depth(TextureFormat::D32),
            AttachmentDescription::depth(TextureFormat::D24S8),
        ]);
    }

    #[test]
    fn force_clear_overrides_load_ops() {
        let desc = color_and_depth();
        let loading = desc.attachments()[0];
        assert_eq!(loading.to_vk(false).load_op, vk::AttachmentLoadOp::LOAD);

        let forced = loading.to_vk(true);
        assert_eq!(forced.load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(forced.initial_layout, vk::ImageLayout::UNDEFINED);
    }

    #[test]
    fn clear_values_follow_attachment_order() {
        let desc = color_and_depth();

        let values = desc.clear_values(true);
        assert_eq!(values.len(), 2);
        unsafe {
            assert_eq!(values[0].color.float32, [0.1, 0.2, 0.3, 1.0]);
            assert_eq!(values[1].depth_stencil.depth, 1.0);
        }

        // The loading color attachment has nothing to clear unless forced.
        let values = desc.clear_values(false);
        unsafe {
            assert_eq!(values[0].color.float32, [0.0; 4]);
            assert_eq!(values[1].depth_stencil.depth, 1.0);
        }
    }

    #[test]
    fn matching_attachments_validate() {
        color_and_depth().validate_attachment_formats(&[TextureFormat::R8G8B8A8, TextureFormat::D32]);
    }
}
