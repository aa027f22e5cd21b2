// Owned device handles
//
// Every plain Vulkan object that is destroyed with a single
// `vkDestroy*(device, handle)` call is wrapped in `Owned<H>`. The wrapper
// is move-only and keeps the device alive; share it through `Arc` on the
// owning resource when more than one place needs it.

use ash::vk;
use std::fmt;
use std::sync::Arc;

use super::VulkanDevice;

/// A Vulkan handle type that the device can destroy.
pub trait DeviceObject: Copy + fmt::Debug {
    /// # Safety
    /// `self` must come from `device` and no pending GPU work may use it.
    unsafe fn destroy(self, device: &ash::Device);
}

macro_rules! device_object {
    ($($handle:ty => $destroy:ident),* $(,)?) => {
        $(
            impl DeviceObject for $handle {
                unsafe fn destroy(self, device: &ash::Device) {
                    device.$destroy(self, None);
                }
            }
        )*
    };
}

device_object! {
    vk::Fence => destroy_fence,
    vk::Semaphore => destroy_semaphore,
    vk::Sampler => destroy_sampler,
    vk::ImageView => destroy_image_view,
    vk::Framebuffer => destroy_framebuffer,
    vk::RenderPass => destroy_render_pass,
    vk::Pipeline => destroy_pipeline,
    vk::PipelineLayout => destroy_pipeline_layout,
    vk::DescriptorSetLayout => destroy_descriptor_set_layout,
    vk::DescriptorPool => destroy_descriptor_pool,
    vk::CommandPool => destroy_command_pool,
    vk::ShaderModule => destroy_shader_module,
    vk::QueryPool => destroy_query_pool,
}

/// Move-only owner of a device handle, destroyed on drop.
pub struct Owned<H: DeviceObject> {
    device: Arc<VulkanDevice>,
    raw: H,
}

impl<H: DeviceObject> Owned<H> {
    /// Takes ownership of `raw`, which must have been created from `device`.
    pub fn new(device: &Arc<VulkanDevice>, raw: H) -> Self {
        Self {
            device: Arc::clone(device),
            raw,
        }
    }

    pub fn raw(&self) -> H {
        self.raw
    }

    pub fn device(&self) -> &Arc<VulkanDevice> {
        &self.device
    }
}

impl<H: DeviceObject> fmt::Debug for Owned<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Owned").field(&self.raw).finish()
    }
}

impl<H: DeviceObject> Drop for Owned<H> {
    fn drop(&mut self) {
        // SAFETY: created from this device; owners wait for the GPU before
        // releasing resources that are still referenced by recorded work.
        unsafe { self.raw.destroy(&self.device.device) };
    }
}
