// =============================================================================
// vk-frames demo
// =============================================================================
//
// Opens a window and drives the graphics facade once per redraw. With the
// quad shaders present under the assets root it draws a spinning,
// checkerboard-textured quad; otherwise it only clears.
//
// FRAME FLOW:
// 1. begin_frame (waits the slot's fence, acquires an image)
// 2. update the per-frame uniform replica
// 3. record one command buffer into the swapchain pass
// 4. end_frame (submit, present, next slot)
//
// =============================================================================

use anyhow::{Context, Result};
use glam::{Mat4, Vec3};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::sync::Arc;
use std::time::Instant;
use vk_frames::backend::buffer::{Buffer, BufferUsage, DataElement, DataLayout, DataType, MemoryType};
use vk_frames::backend::descriptor::{BufferRange, DescriptorSet, DescriptorSetLayout, DescriptorType, ShaderStages};
use vk_frames::backend::pipeline::{PipelineState, PipelineStateData, PushConstantDesc, ScissorRect, Viewport};
use vk_frames::backend::queue::QueueProperty;
use vk_frames::backend::texture::{MipmapPolicy, Sampler, TextureFormat, TextureView};
use vk_frames::{CommandBufferId, Config, Graphics};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() {
    init_logging();

    let config = Config::load();
    log::info!(
        "Window: {}x{} ({}), backend {:?}, vsync {}",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" },
        config.graphics.backend,
        config.graphics.vsync
    );

    if let Err(e) = run(config) {
        log::error!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(config: Config) -> Result<()> {
    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    match app.fatal.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Info by default, `RUST_LOG` wins.
fn init_logging() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();
}

// =============================================================================
// DEMO SCENE
// =============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct Vertex {
    position: [f32; 2],
    uv: [f32; 2],
}

const QUAD_VERTICES: [Vertex; 4] = [
    Vertex { position: [-0.5, -0.5], uv: [0.0, 0.0] },
    Vertex { position: [0.5, -0.5], uv: [1.0, 0.0] },
    Vertex { position: [0.5, 0.5], uv: [1.0, 1.0] },
    Vertex { position: [-0.5, 0.5], uv: [0.0, 1.0] },
];
const QUAD_INDICES: [u16; 6] = [0, 1, 2, 2, 3, 0];

/// One replica per frame slot; 256 covers every uniform offset alignment.
const UNIFORM_SIZE: u64 = 256;
const CHECKER_SIZE: u32 = 64;
const TINT: [f32; 4] = [1.0, 0.9, 0.8, 1.0];

fn checkerboard(size: u32, cell: u32) -> Vec<u8> {
    let mut pixels = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let value = if (x / cell + y / cell) % 2 == 0 { 230 } else { 40 };
            pixels.extend_from_slice(&[value, value, value, 255]);
        }
    }
    pixels
}

struct QuadScene {
    descriptor_set: DescriptorSet,
    pipeline: Arc<PipelineState>,
    vertices: Arc<Buffer>,
    indices: Arc<Buffer>,
    uniforms: Arc<Buffer>,
    _layout: Arc<DescriptorSetLayout>,
    _texture: Arc<TextureView>,
    _sampler: Arc<Sampler>,
    start: Instant,
}

impl QuadScene {
    /// `None` when the shader blobs are missing.
    fn new(gfx: &Graphics) -> Result<Option<Self>> {
        let (vert, frag) = match (
            gfx.load_shader(ShaderStages::VERTEX, "shaders/quad.vert.spv"),
            gfx.load_shader(ShaderStages::FRAGMENT, "shaders/quad.frag.spv"),
        ) {
            (Ok(vert), Ok(frag)) => (vert, frag),
            (Err(e), _) | (_, Err(e)) => {
                log::warn!("Demo shaders unavailable ({:#}), clearing only", e);
                return Ok(None);
            }
        };

        let vertex_layout = DataLayout::new(vec![
            DataElement::new(DataType::Float32, 2),
            DataElement::new(DataType::Float32, 2),
        ]);
        let vertices = gfx.create_buffer(
            BufferUsage::VERTEX,
            std::mem::size_of_val(&QUAD_VERTICES) as u64,
            MemoryType::GpuOnly,
            Some(vertex_layout.clone()),
        )?;
        vertices.set_data(bytemuck::cast_slice(&QUAD_VERTICES), 0)?;

        let indices = gfx.create_buffer(
            BufferUsage::INDEX,
            std::mem::size_of_val(&QUAD_INDICES) as u64,
            MemoryType::GpuOnly,
            Some(DataLayout::new(vec![DataElement::new(DataType::Uint16, 1)])),
        )?;
        indices.set_data(bytemuck::cast_slice(&QUAD_INDICES), 0)?;

        let uniforms = gfx.create_buffer(BufferUsage::CONSTANT, UNIFORM_SIZE, MemoryType::CpuToGpu, None)?;

        let texture = gfx.create_texture_2d_from_data(
            &checkerboard(CHECKER_SIZE, 8),
            CHECKER_SIZE,
            CHECKER_SIZE,
            TextureFormat::R8G8B8A8_SRGB,
            MipmapPolicy::Generate,
        )?;
        let texture = gfx.create_texture_view(&texture)?;
        let sampler = gfx.create_sampler(Sampler::builder().anisotropy(8.0))?;

        let layout = gfx.create_descriptor_set_layout(
            DescriptorSetLayout::builder()
                .add_descriptor_desc(DescriptorType::ConstantBufferDynamic, ShaderStages::VERTEX, 1)
                .add_descriptor_desc(DescriptorType::CombinedTextureSampler, ShaderStages::FRAGMENT, 1),
        )?;
        let mut descriptor_set = gfx.create_descriptor_set(&layout)?;
        descriptor_set.set_constant_buffer(
            0,
            BufferRange {
                buffer: &uniforms,
                offset: 0,
                size: std::mem::size_of::<Mat4>() as u64,
            },
        );
        descriptor_set.set_combined_texture_sampler(1, &texture, &sampler);

        let mut data = PipelineStateData::new(gfx.swapchain_render_pass(), vec![vert, frag]);
        data.vertex_layouts = vec![vertex_layout];
        data.descriptor_set_layouts = vec![Arc::clone(&layout)];
        data.push_constants = vec![PushConstantDesc::new(ShaderStages::FRAGMENT, 0, 16)];
        let pipeline = gfx.create_pipeline_state(data)?;

        log::info!("Demo quad ready");
        Ok(Some(Self {
            descriptor_set,
            pipeline,
            vertices,
            indices,
            uniforms,
            _layout: layout,
            _texture: texture,
            _sampler: sampler,
            start: Instant::now(),
        }))
    }

    fn record(&self, gfx: &mut Graphics, cmd: CommandBufferId) -> Result<()> {
        let extent = gfx.swapchain_extent();
        let aspect = extent.height as f32 / extent.width.max(1) as f32;
        let transform = Mat4::from_scale(Vec3::new(aspect, 1.0, 1.0))
            * Mat4::from_rotation_z(self.start.elapsed().as_secs_f32());
        // Lands in this frame's replica only.
        self.uniforms
            .set_data(bytemuck::bytes_of(&transform), 0)
            .context("Failed to update transform")?;

        gfx.set_viewports(cmd, 0, &[Viewport::covering(extent)]);
        gfx.set_scissor_rects(cmd, 0, &[ScissorRect::covering(extent)]);
        gfx.bind_pipeline_state(cmd, &self.pipeline);
        gfx.bind_descriptor_set(cmd, &self.descriptor_set, &self.pipeline, 0, &[])?;
        gfx.bind_buffer(cmd, &self.vertices, 0);
        gfx.bind_buffer(cmd, &self.indices, 0);
        gfx.set_push_constants(cmd, &self.pipeline, ShaderStages::empty(), bytemuck::bytes_of(&TINT), 0);
        gfx.draw_indexed(cmd, QUAD_INDICES.len() as u32, 1, 0, 0, 0);
        Ok(())
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

struct App {
    config: Config,
    // Scene resources go before the facade that waits for the GPU.
    scene: Option<QuadScene>,
    graphics: Option<Graphics>,
    window: Option<Arc<Window>>,
    fatal: Option<anyhow::Error>,
    is_fullscreen: bool,

    last_frame_time: Instant,
    last_fps_update: Instant,
    frame_count: u32,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        Self {
            config,
            scene: None,
            graphics: None,
            window: None,
            fatal: None,
            is_fullscreen,
            last_frame_time: Instant::now(),
            last_fps_update: Instant::now(),
            frame_count: 0,
        }
    }

    fn init_graphics(&mut self, window: &Window) -> Result<()> {
        let size = window.inner_size();
        let graphics = Graphics::new(
            window.raw_display_handle(),
            window.raw_window_handle(),
            size.width,
            size.height,
            &self.config,
        )?;
        self.scene = QuadScene::new(&graphics)?;
        self.graphics = Some(graphics);
        Ok(())
    }

    fn render_frame(&mut self) -> Result<bool> {
        let Some(gfx) = self.graphics.as_mut() else {
            return Ok(false);
        };
        if !gfx.begin_frame()? {
            return Ok(false);
        }

        let cmd = gfx.begin_command_buffer(QueueProperty::Graphics)?;
        gfx.begin_render_pass(cmd, None)?;
        if let Some(scene) = &self.scene {
            scene.record(gfx, cmd)?;
        }
        gfx.end_render_pass(cmd);
        gfx.end_command_buffer(cmd)?;
        gfx.end_frame()?;
        Ok(true)
    }

    fn shutdown(&mut self) {
        if let Some(gfx) = &self.graphics {
            if let Err(e) = gfx.wait_for_device() {
                log::warn!("Failed to wait for device on shutdown: {:#}", e);
            }
        }
        self.scene = None;
        if let Some(gfx) = self.graphics.take() {
            gfx.destroy();
        }
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{:#}", error);
        self.fatal = Some(error);
        event_loop.exit();
    }

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;
            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
        }
    }

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;
            let gpu = match self.graphics.as_ref().and_then(|gfx| gfx.stats().gpu_time_ms) {
                Some(ms) => format!(", GPU {:.2}ms", ms),
                None => String::new(),
            };
            if let Some(ref window) = self.window {
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms{})",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                    gpu
                ));
            }
            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));
        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(window) => Arc::new(window),
            Err(e) => {
                self.fail(event_loop, anyhow::anyhow!("Failed to create window: {}", e));
                return;
            }
        };

        if let Err(e) = self.init_graphics(&window) {
            self.fail(event_loop, e.context("Failed to initialize graphics"));
            return;
        }
        self.window = Some(window);
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: winit::window::WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(gfx) = self.graphics.as_mut() {
                    if let Err(e) = gfx.on_window_resize(size.width, size.height) {
                        self.fail(event_loop, e.context("Failed to resize swapchain"));
                    }
                }
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(true) => self.update_fps(),
                Ok(false) => {}
                Err(e) => self.fail(event_loop, e),
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                event_loop.exit();
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    /// Redraw continuously.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.shutdown();
    }
}

impl Drop for App {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkerboard_alternates_cells() {
        let pixels = checkerboard(16, 8);
        assert_eq!(pixels.len(), 16 * 16 * 4);
        assert_eq!(pixels[0], 230);
        // First pixel of the second cell on the first row.
        assert_eq!(pixels[8 * 4], 40);
        assert_eq!(pixels[3], 255);
    }
}
