// Backend module - Vulkan abstraction layer
//
// Thin ownership-aware wrappers around ash. Every object that needs the
// device holds an Arc to it, so destruction order follows ownership.

pub mod check;
pub mod handle;
pub mod queue;
pub mod replica;

pub mod device;
pub mod instance;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub mod buffer;
pub mod command;
pub mod descriptor;
pub mod framebuffer;
pub mod pipeline;
pub mod query;
pub mod render_pass;
pub mod shader;
pub mod texture;

pub use buffer::{Buffer, BufferUsage, DataElement, DataLayout, DataType, MappedBuffer, MemoryType};
pub use command::{CommandBuffer, CommandPool};
pub use descriptor::{
    BufferRange, DescriptorPool, DescriptorSet, DescriptorSetLayout, DescriptorType, ShaderStages,
};
pub use device::VulkanDevice;
pub use framebuffer::Framebuffer;
pub use instance::Instance;
pub use pipeline::{PipelineState, PipelineStateData};
pub use query::{FrameTimer, QueryPool};
pub use queue::QueueProperty;
pub use render_pass::{AttachmentDescription, ClearValue, RenderPass, RenderPassDesc};
pub use replica::{FrameCounter, MAX_FRAMES_IN_FLIGHT};
pub use shader::{ShaderBlob, ShaderModule};
pub use surface::Surface;
pub use swapchain::Swapchain;
pub use sync::{Fence, FrameSync, Semaphore};
pub use texture::{Sampler, Texture, TextureFormat, TextureView};
