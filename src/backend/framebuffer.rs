// Framebuffers
//
// A set of texture views bound to a render pass. The views are kept alive
// for as long as the framebuffer exists.

use anyhow::{Context, Result};
use ash::vk;
use glam::{UVec2, UVec3};
use std::sync::Arc;

use super::handle::Owned;
use super::render_pass::{RenderPass, RenderPassDesc};
use super::texture::{TextureFormat, TextureView};
use super::VulkanDevice;
use crate::gfx_assert;

#[derive(Debug)]
pub struct Framebuffer {
    raw: Owned<vk::Framebuffer>,
    render_pass: Arc<RenderPass>,
    views: Vec<Arc<TextureView>>,
    /// Width, height and layer count.
    dimensions: UVec3,
}

impl Framebuffer {
    /// `views` in render pass attachment order.
    pub fn new(
        device: &Arc<VulkanDevice>,
        render_pass: &Arc<RenderPass>,
        views: Vec<Arc<TextureView>>,
        dimensions: UVec3,
    ) -> Result<Arc<Self>> {
        let formats: Vec<TextureFormat> = views.iter().map(|view| view.format()).collect();
        check_attachments(render_pass.desc(), &formats);
        for view in &views {
            let size = view.dimensions();
            gfx_assert!(
                size.x >= dimensions.x && size.y >= dimensions.y,
                "Attachment of {}x{} is smaller than the framebuffer {}x{}",
                size.x,
                size.y,
                dimensions.x,
                dimensions.y
            );
        }

        let attachments: Vec<vk::ImageView> = views.iter().map(|view| view.raw()).collect();
        let framebuffer_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass.handle(false))
            .attachments(&attachments)
            .width(dimensions.x)
            .height(dimensions.y)
            .layers(dimensions.z.max(1));

        let raw = unsafe { device.device.create_framebuffer(&framebuffer_info, None) }
            .context("Failed to create framebuffer")?;

        Ok(Arc::new(Self {
            raw: Owned::new(device, raw),
            render_pass: Arc::clone(render_pass),
            views,
            dimensions,
        }))
    }

    pub fn raw(&self) -> vk::Framebuffer {
        self.raw.raw()
    }

    pub fn render_pass(&self) -> &Arc<RenderPass> {
        &self.render_pass
    }

    pub fn views(&self) -> &[Arc<TextureView>] {
        &self.views
    }

    pub fn dimensions(&self) -> UVec3 {
        self.dimensions
    }

    pub fn size(&self) -> UVec2 {
        self.dimensions.truncate()
    }

    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.dimensions.x,
            height: self.dimensions.y,
        }
    }
}

fn check_attachments(desc: &RenderPassDesc, formats: &[TextureFormat]) {
    desc.validate_attachment_formats(formats);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::render_pass::AttachmentDescription;

    fn forward_pass() -> RenderPassDesc {
        RenderPassDesc::single_subpass(vec![
            AttachmentDescription::color(TextureFormat::B8G8R8A8_SRGB),
            AttachmentDescription::depth(TextureFormat::D32),
        ])
    }

    #[test]
    fn matching_views_pass() {
        check_attachments(&forward_pass(), &[TextureFormat::B8G8R8A8_SRGB, TextureFormat::D32]);
    }

    #[test]
    #[should_panic(expected = "attachment count")]
    fn missing_depth_view_is_caught() {
        check_attachments(&forward_pass(), &[TextureFormat::B8G8R8A8_SRGB]);
    }

    #[test]
    #[should_panic(expected = "format")]
    fn wrong_color_format_is_caught() {
        check_attachments(&forward_pass(), &[TextureFormat::R8G8B8A8, TextureFormat::D32]);
    }

    #[test]
    #[should_panic(expected = "format")]
    fn swapped_attachments_are_caught() {
        check_attachments(&forward_pass(), &[TextureFormat::D32, TextureFormat::B8G8R8A8_SRGB]);
    }
}
