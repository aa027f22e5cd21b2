// vk-frames
//
// Vulkan resource and frame-synchronization layer: device and queue
// selection, per-frame replicated buffers, textures, descriptor sets,
// command pools per frame slot and swapchain presentation.

pub mod backend;
pub mod config;
pub mod graphics;

pub use config::Config;
pub use graphics::{CommandBufferId, FrameStats, Graphics};
