// Textures, views and samplers
//
// Images are allocated through gpu-allocator and filled with a staging
// buffer on the graphics queue, since uploads also transition layouts.
// Swapchain images are wrapped without ownership.

use anyhow::{bail, Context, Result};
use ash::vk;
use glam::UVec3;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::path::Path;
use std::sync::Arc;

use super::buffer::{Buffer, BufferUsage, MemoryType};
use super::handle::Owned;
use super::queue::QueueProperty;
use super::VulkanDevice;
use crate::gfx_assert;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureFormat(vk::Format);

impl TextureFormat {
    pub const UNDEFINED: Self = Self(vk::Format::UNDEFINED);
    pub const R8: Self = Self(vk::Format::R8_UNORM);
    pub const R8_SRGB: Self = Self(vk::Format::R8_SRGB);
    pub const R8G8: Self = Self(vk::Format::R8G8_UNORM);
    pub const R8G8_SRGB: Self = Self(vk::Format::R8G8_SRGB);
    pub const R8G8B8A8: Self = Self(vk::Format::R8G8B8A8_UNORM);
    pub const R8G8B8A8_SRGB: Self = Self(vk::Format::R8G8B8A8_SRGB);
    pub const B8G8R8A8: Self = Self(vk::Format::B8G8R8A8_UNORM);
    pub const B8G8R8A8_SRGB: Self = Self(vk::Format::B8G8R8A8_SRGB);
    pub const R16G16B16A16_SFLOAT: Self = Self(vk::Format::R16G16B16A16_SFLOAT);
    pub const D32: Self = Self(vk::Format::D32_SFLOAT);
    pub const D16S8: Self = Self(vk::Format::D16_UNORM_S8_UINT);
    pub const D24S8: Self = Self(vk::Format::D24_UNORM_S8_UINT);
    pub const D32S8: Self = Self(vk::Format::D32_SFLOAT_S8_UINT);

    pub fn from_vk(format: vk::Format) -> Self {
        Self(format)
    }

    pub fn to_vk(self) -> vk::Format {
        self.0
    }

    pub fn is_color(self) -> bool {
        self != Self::UNDEFINED && !self.is_depth() && !self.is_stencil()
    }

    pub fn is_depth(self) -> bool {
        matches!(
            self.0,
            vk::Format::D16_UNORM
                | vk::Format::D32_SFLOAT
                | vk::Format::X8_D24_UNORM_PACK32
                | vk::Format::D16_UNORM_S8_UINT
                | vk::Format::D24_UNORM_S8_UINT
                | vk::Format::D32_SFLOAT_S8_UINT
        )
    }

    pub fn is_stencil(self) -> bool {
        matches!(
            self.0,
            vk::Format::S8_UINT
                | vk::Format::D16_UNORM_S8_UINT
                | vk::Format::D24_UNORM_S8_UINT
                | vk::Format::D32_SFLOAT_S8_UINT
        )
    }

    pub fn is_depth_stencil(self) -> bool {
        self.is_depth() && self.is_stencil()
    }

    pub fn is_depth_only(self) -> bool {
        self.is_depth() && !self.is_stencil()
    }

    pub fn is_srgb(self) -> bool {
        matches!(
            self.0,
            vk::Format::R8_SRGB | vk::Format::R8G8_SRGB | vk::Format::R8G8B8A8_SRGB | vk::Format::B8G8R8A8_SRGB
        )
    }

    /// Blue in the first byte of each pixel.
    pub fn is_bgra(self) -> bool {
        matches!(self.0, vk::Format::B8G8R8A8_UNORM | vk::Format::B8G8R8A8_SRGB)
    }

    pub fn aspect_mask(self) -> vk::ImageAspectFlags {
        let mut aspect = vk::ImageAspectFlags::empty();
        if self.is_color() {
            aspect |= vk::ImageAspectFlags::COLOR;
        }
        if self.is_depth() {
            aspect |= vk::ImageAspectFlags::DEPTH;
        }
        if self.is_stencil() {
            aspect |= vk::ImageAspectFlags::STENCIL;
        }
        aspect
    }

    pub fn bytes_per_pixel(self) -> u32 {
        match self.0 {
            vk::Format::R8_UNORM | vk::Format::R8_SRGB | vk::Format::S8_UINT => 1,
            vk::Format::R8G8_UNORM | vk::Format::R8G8_SRGB | vk::Format::D16_UNORM => 2,
            vk::Format::D16_UNORM_S8_UINT => 3,
            vk::Format::R16G16B16A16_SFLOAT => 8,
            vk::Format::D32_SFLOAT_S8_UINT => 5,
            _ => 4,
        }
    }
}

/// Number of levels of a full mip chain down to 1x1.
pub fn full_mip_levels(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MipmapPolicy {
    #[default]
    None,
    /// Blit the chain down from level 0 at upload time.
    Generate,
}

struct ImageDesc {
    format: TextureFormat,
    width: u32,
    height: u32,
    mip_levels: u32,
    layers: u32,
    usage: vk::ImageUsageFlags,
    cube: bool,
}

pub struct Texture {
    raw: vk::Image,
    allocation: Option<Allocation>,
    format: TextureFormat,
    dimensions: UVec3,
    mip_levels: u32,
    layers: u32,
    cube: bool,
    device: Arc<VulkanDevice>,
}

impl Texture {
    /// Load an image file, converting it to the channel count of `format`.
    pub fn from_path(
        device: &Arc<VulkanDevice>,
        path: &Path,
        format: TextureFormat,
        mipmaps: MipmapPolicy,
    ) -> Result<Arc<Self>> {
        let (pixels, width, height) = load_pixels(path, format)?;
        log::debug!("Loaded texture {:?} ({}x{})", path, width, height);
        Self::from_data(device, &pixels, width, height, format, mipmaps)
    }

    /// Tightly packed pixel rows of `format`.
    pub fn from_data(
        device: &Arc<VulkanDevice>,
        data: &[u8],
        width: u32,
        height: u32,
        format: TextureFormat,
        mipmaps: MipmapPolicy,
    ) -> Result<Arc<Self>> {
        gfx_assert!(format.is_color(), "Uploaded textures must have a color format");
        gfx_assert!(
            data.len() as u64 == width as u64 * height as u64 * format.bytes_per_pixel() as u64,
            "Texture data is {} bytes, expected {}x{} pixels of {} bytes",
            data.len(),
            width,
            height,
            format.bytes_per_pixel()
        );

        let mip_levels = match mipmaps {
            MipmapPolicy::Generate if supports_linear_blit(device, format) => full_mip_levels(width, height),
            MipmapPolicy::Generate => {
                log::warn!(
                    "Format {:?} can't be blitted with linear filtering, skipping mipmap generation",
                    format.to_vk()
                );
                1
            }
            MipmapPolicy::None => 1,
        };

        let mut usage = vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED;
        if mip_levels > 1 {
            usage |= vk::ImageUsageFlags::TRANSFER_SRC;
        }

        let texture = Self::allocate(
            device,
            ImageDesc {
                format,
                width,
                height,
                mip_levels,
                layers: 1,
                usage,
                cube: false,
            },
        )?;
        texture.upload(data)?;
        Ok(Arc::new(texture))
    }

    /// Six faces in +X, -X, +Y, -Y, +Z, -Z order, all the same size.
    pub fn cube_from_paths(device: &Arc<VulkanDevice>, faces: [&Path; 6], format: TextureFormat) -> Result<Arc<Self>> {
        let mut data = Vec::new();
        let mut size = None;
        for face in faces {
            let (pixels, width, height) = load_pixels(face, format)?;
            match size {
                None => size = Some((width, height)),
                Some(expected) if expected != (width, height) => {
                    bail!("Cube face {:?} is {}x{}, expected {}x{}", face, width, height, expected.0, expected.1)
                }
                Some(_) => {}
            }
            data.extend_from_slice(&pixels);
        }
        let (width, height) = size.unwrap_or_default();

        let texture = Self::allocate(
            device,
            ImageDesc {
                format,
                width,
                height,
                mip_levels: 1,
                layers: 6,
                usage: vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
                cube: true,
            },
        )?;
        texture.upload(&data)?;
        Ok(Arc::new(texture))
    }

    /// Attachment that can also be sampled by a later pass.
    pub fn render_target(device: &Arc<VulkanDevice>, width: u32, height: u32, format: TextureFormat) -> Result<Arc<Self>> {
        let attachment = if format.is_color() {
            vk::ImageUsageFlags::COLOR_ATTACHMENT
        } else {
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
        };
        let texture = Self::allocate(
            device,
            ImageDesc {
                format,
                width,
                height,
                mip_levels: 1,
                layers: 1,
                usage: attachment | vk::ImageUsageFlags::SAMPLED,
                cube: false,
            },
        )?;
        Ok(Arc::new(texture))
    }

    /// Wrap an image owned by someone else (swapchain images).
    pub fn wrap(device: &Arc<VulkanDevice>, image: vk::Image, width: u32, height: u32, format: TextureFormat) -> Arc<Self> {
        gfx_assert!(image != vk::Image::null(), "Can't wrap a null image");
        Arc::new(Self {
            raw: image,
            allocation: None,
            format,
            dimensions: UVec3::new(width, height, 1),
            mip_levels: 1,
            layers: 1,
            cube: false,
            device: Arc::clone(device),
        })
    }

    fn allocate(device: &Arc<VulkanDevice>, desc: ImageDesc) -> Result<Self> {
        gfx_assert!(desc.width > 0 && desc.height > 0, "Texture dimensions must be non-zero");

        let image_info = vk::ImageCreateInfo::builder()
            .flags(if desc.cube {
                vk::ImageCreateFlags::CUBE_COMPATIBLE
            } else {
                vk::ImageCreateFlags::empty()
            })
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format.to_vk())
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(desc.layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let raw = unsafe { device.device.create_image(&image_info, None) }.context("Failed to create image")?;
        let requirements = unsafe { device.device.get_image_memory_requirements(raw) };

        let allocation = device.allocator().lock().allocate(&AllocationCreateDesc {
            name: "texture",
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_image(raw, None) };
                return Err(e).context("Failed to allocate image memory");
            }
        };

        // From here on Drop cleans up.
        let texture = Self {
            raw,
            allocation: Some(allocation),
            format: desc.format,
            dimensions: UVec3::new(desc.width, desc.height, 1),
            mip_levels: desc.mip_levels,
            layers: desc.layers,
            cube: desc.cube,
            device: Arc::clone(device),
        };
        if let Some(allocation) = &texture.allocation {
            unsafe {
                device
                    .device
                    .bind_image_memory(raw, allocation.memory(), allocation.offset())
            }
            .context("Failed to bind image memory")?;
        }
        Ok(texture)
    }

    fn upload(&self, data: &[u8]) -> Result<()> {
        let staging = Buffer::new(
            &self.device,
            BufferUsage::TRANSFER_SRC,
            data.len() as u64,
            MemoryType::Staging,
            None,
        )?;
        staging.set_data(data, 0)?;

        self.device.one_time_submit(QueueProperty::Graphics, |device, cmd| {
            let range = self.subresource_range(0, self.mip_levels);
            image_barrier(
                device,
                cmd,
                self.raw,
                range,
                (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL),
                (vk::AccessFlags::empty(), vk::AccessFlags::TRANSFER_WRITE),
                (vk::PipelineStageFlags::TOP_OF_PIPE, vk::PipelineStageFlags::TRANSFER),
            );

            let region = vk::BufferImageCopy {
                buffer_offset: 0,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: self.layers,
                },
                image_offset: vk::Offset3D::default(),
                image_extent: vk::Extent3D {
                    width: self.width(),
                    height: self.height(),
                    depth: 1,
                },
            };
            unsafe {
                device.cmd_copy_buffer_to_image(
                    cmd,
                    staging.raw(),
                    self.raw,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                )
            };

            if self.mip_levels > 1 {
                self.record_mip_chain(device, cmd);
            } else {
                image_barrier(
                    device,
                    cmd,
                    self.raw,
                    range,
                    (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
                    (vk::AccessFlags::TRANSFER_WRITE, vk::AccessFlags::SHADER_READ),
                    (vk::PipelineStageFlags::TRANSFER, vk::PipelineStageFlags::FRAGMENT_SHADER),
                );
            }
            Ok(())
        })
    }

    // Each level is blitted from the previous one, which is then moved to
    // shader-read. The last level never becomes a blit source.
    fn record_mip_chain(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        let mut width = self.width() as i32;
        let mut height = self.height() as i32;

        for level in 1..self.mip_levels {
            let src = self.subresource_range(level - 1, 1);
            image_barrier(
                device,
                cmd,
                self.raw,
                src,
                (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::TRANSFER_SRC_OPTIMAL),
                (vk::AccessFlags::TRANSFER_WRITE, vk::AccessFlags::TRANSFER_READ),
                (vk::PipelineStageFlags::TRANSFER, vk::PipelineStageFlags::TRANSFER),
            );

            let next_width = (width / 2).max(1);
            let next_height = (height / 2).max(1);
            let blit = vk::ImageBlit {
                src_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: level - 1,
                    base_array_layer: 0,
                    layer_count: self.layers,
                },
                src_offsets: [vk::Offset3D::default(), vk::Offset3D { x: width, y: height, z: 1 }],
                dst_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: level,
                    base_array_layer: 0,
                    layer_count: self.layers,
                },
                dst_offsets: [
                    vk::Offset3D::default(),
                    vk::Offset3D {
                        x: next_width,
                        y: next_height,
                        z: 1,
                    },
                ],
            };
            unsafe {
                device.cmd_blit_image(
                    cmd,
                    self.raw,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    self.raw,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[blit],
                    vk::Filter::LINEAR,
                )
            };

            image_barrier(
                device,
                cmd,
                self.raw,
                src,
                (vk::ImageLayout::TRANSFER_SRC_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
                (vk::AccessFlags::TRANSFER_READ, vk::AccessFlags::SHADER_READ),
                (vk::PipelineStageFlags::TRANSFER, vk::PipelineStageFlags::FRAGMENT_SHADER),
            );

            width = next_width;
            height = next_height;
        }

        image_barrier(
            device,
            cmd,
            self.raw,
            self.subresource_range(self.mip_levels - 1, 1),
            (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
            (vk::AccessFlags::TRANSFER_WRITE, vk::AccessFlags::SHADER_READ),
            (vk::PipelineStageFlags::TRANSFER, vk::PipelineStageFlags::FRAGMENT_SHADER),
        );
    }

    pub fn subresource_range(&self, base_mip_level: u32, level_count: u32) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.format.aspect_mask(),
            base_mip_level,
            level_count,
            base_array_layer: 0,
            layer_count: self.layers,
        }
    }

    pub fn raw(&self) -> vk::Image {
        self.raw
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    pub fn dimensions(&self) -> UVec3 {
        self.dimensions
    }

    pub fn width(&self) -> u32 {
        self.dimensions.x
    }

    pub fn height(&self) -> u32 {
        self.dimensions.y
    }

    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    pub fn layers(&self) -> u32 {
        self.layers
    }

    pub fn is_cube(&self) -> bool {
        self.cube
    }

    pub fn is_wrapping(&self) -> bool {
        self.allocation.is_none()
    }

    pub fn device(&self) -> &Arc<VulkanDevice> {
        &self.device
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        // Wrapped images belong to the swapchain.
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.device.allocator().lock().free(allocation) {
                log::warn!("Failed to free image memory: {}", e);
            }
            unsafe { self.device.device.destroy_image(self.raw, None) };
        }
    }
}

fn load_pixels(path: &Path, format: TextureFormat) -> Result<(Vec<u8>, u32, u32)> {
    let image = image::open(path).with_context(|| format!("Failed to load image {:?}", path))?;
    let (width, height) = (image.width(), image.height());
    let pixels =
        decode_pixels(&image, format).with_context(|| format!("Can't load {:?}", path))?;
    Ok((pixels, width, height))
}

/// Tightly packed pixels of `image` in the channel order of `format`.
fn decode_pixels(image: &image::DynamicImage, format: TextureFormat) -> Result<Vec<u8>> {
    let pixels = match format.bytes_per_pixel() {
        1 => image.to_luma8().into_raw(),
        2 => image.to_luma_alpha8().into_raw(),
        4 if format.is_bgra() => {
            let mut pixels = image.to_rgba8().into_raw();
            for pixel in pixels.chunks_exact_mut(4) {
                pixel.swap(0, 2);
            }
            pixels
        }
        4 => image.to_rgba8().into_raw(),
        _ => bail!("Unsupported format {:?} for image data", format.to_vk()),
    };
    Ok(pixels)
}

fn supports_linear_blit(device: &VulkanDevice, format: TextureFormat) -> bool {
    let properties = unsafe {
        device
            .instance
            .raw
            .get_physical_device_format_properties(device.physical_device, format.to_vk())
    };
    properties
        .optimal_tiling_features
        .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR)
}

pub(crate) fn image_barrier(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    range: vk::ImageSubresourceRange,
    layouts: (vk::ImageLayout, vk::ImageLayout),
    access: (vk::AccessFlags, vk::AccessFlags),
    stages: (vk::PipelineStageFlags, vk::PipelineStageFlags),
) {
    let barrier = vk::ImageMemoryBarrier::builder()
        .old_layout(layouts.0)
        .new_layout(layouts.1)
        .src_access_mask(access.0)
        .dst_access_mask(access.1)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(range)
        .build();
    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            stages.0,
            stages.1,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        )
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewKind {
    D2,
    D2Array,
    Cube,
}

impl ViewKind {
    fn to_vk(self) -> vk::ImageViewType {
        match self {
            ViewKind::D2 => vk::ImageViewType::TYPE_2D,
            ViewKind::D2Array => vk::ImageViewType::TYPE_2D_ARRAY,
            ViewKind::Cube => vk::ImageViewType::CUBE,
        }
    }
}

#[derive(Debug)]
pub struct TextureView {
    raw: Owned<vk::ImageView>,
    texture: Arc<Texture>,
    kind: ViewKind,
}

impl TextureView {
    /// View over every mip and layer, typed after the texture.
    pub fn new(texture: &Arc<Texture>) -> Result<Arc<Self>> {
        let kind = if texture.is_cube() {
            ViewKind::Cube
        } else if texture.layers() > 1 {
            ViewKind::D2Array
        } else {
            ViewKind::D2
        };
        Self::with_kind(texture, kind)
    }

    pub fn with_kind(texture: &Arc<Texture>, kind: ViewKind) -> Result<Arc<Self>> {
        gfx_assert!(
            kind != ViewKind::Cube || texture.is_cube(),
            "Cube views need a cube compatible texture"
        );
        gfx_assert!(
            kind != ViewKind::D2 || texture.layers() == 1,
            "2D views need a single layer texture"
        );

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(texture.raw())
            .view_type(kind.to_vk())
            .format(texture.format().to_vk())
            .components(vk::ComponentMapping::default())
            .subresource_range(texture.subresource_range(0, texture.mip_levels()));

        let device = texture.device();
        let raw = unsafe { device.device.create_image_view(&view_info, None) }
            .context("Failed to create image view")?;

        Ok(Arc::new(Self {
            raw: Owned::new(device, raw),
            texture: Arc::clone(texture),
            kind,
        }))
    }

    pub fn raw(&self) -> vk::ImageView {
        self.raw.raw()
    }

    pub fn texture(&self) -> &Arc<Texture> {
        &self.texture
    }

    pub fn kind(&self) -> ViewKind {
        self.kind
    }

    pub fn format(&self) -> TextureFormat {
        self.texture.format()
    }

    pub fn dimensions(&self) -> UVec3 {
        self.texture.dimensions()
    }
}

impl std::fmt::Debug for Texture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Texture")
            .field("raw", &self.raw)
            .field("format", &self.format)
            .field("dimensions", &self.dimensions)
            .field("mip_levels", &self.mip_levels)
            .field("layers", &self.layers)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    Nearest,
    Linear,
}

impl FilterMode {
    fn to_vk(self) -> vk::Filter {
        match self {
            FilterMode::Nearest => vk::Filter::NEAREST,
            FilterMode::Linear => vk::Filter::LINEAR,
        }
    }

    fn to_vk_mipmap(self) -> vk::SamplerMipmapMode {
        match self {
            FilterMode::Nearest => vk::SamplerMipmapMode::NEAREST,
            FilterMode::Linear => vk::SamplerMipmapMode::LINEAR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMode {
    Repeat,
    MirroredRepeat,
    ClampToEdge,
    ClampToBorder,
}

impl AddressMode {
    fn to_vk(self) -> vk::SamplerAddressMode {
        match self {
            AddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
            AddressMode::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
            AddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
            AddressMode::ClampToBorder => vk::SamplerAddressMode::CLAMP_TO_BORDER,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerBuilder {
    pub min_filter: FilterMode,
    pub mag_filter: FilterMode,
    pub mip_filter: FilterMode,
    pub address_mode: [AddressMode; 3],
    pub min_lod: f32,
    pub max_lod: f32,
    pub max_anisotropy: Option<f32>,
    pub unnormalized_coordinates: bool,
}

impl Default for SamplerBuilder {
    fn default() -> Self {
        Self {
            min_filter: FilterMode::Linear,
            mag_filter: FilterMode::Linear,
            mip_filter: FilterMode::Linear,
            address_mode: [AddressMode::Repeat; 3],
            min_lod: 0.0,
            max_lod: vk::LOD_CLAMP_NONE,
            max_anisotropy: None,
            unnormalized_coordinates: false,
        }
    }
}

impl SamplerBuilder {
    pub fn filters(mut self, min: FilterMode, mag: FilterMode) -> Self {
        self.min_filter = min;
        self.mag_filter = mag;
        self
    }

    pub fn mip_filter(mut self, mode: FilterMode) -> Self {
        self.mip_filter = mode;
        self
    }

    pub fn address_mode_all(mut self, mode: AddressMode) -> Self {
        self.address_mode = [mode; 3];
        self
    }

    pub fn address_mode_uvw(mut self, u: AddressMode, v: AddressMode, w: AddressMode) -> Self {
        self.address_mode = [u, v, w];
        self
    }

    pub fn lod_range(mut self, min: f32, max: f32) -> Self {
        self.min_lod = min;
        self.max_lod = max;
        self
    }

    pub fn anisotropy(mut self, max: f32) -> Self {
        self.max_anisotropy = Some(max);
        self
    }

    pub fn unnormalized_coordinates(mut self) -> Self {
        self.unnormalized_coordinates = true;
        self
    }

    /// Unnormalized lookups come with a list of restrictions; check them
    /// before the driver does.
    pub fn validate(&self) {
        gfx_assert!(self.min_lod <= self.max_lod, "Sampler min lod is above max lod");
        if self.unnormalized_coordinates {
            gfx_assert!(
                self.min_filter == self.mag_filter,
                "Unnormalized samplers need equal min and mag filters"
            );
            gfx_assert!(
                self.mip_filter == FilterMode::Nearest,
                "Unnormalized samplers need nearest mip filtering"
            );
            gfx_assert!(
                self.min_lod == 0.0 && self.max_lod == 0.0,
                "Unnormalized samplers need a zero lod range"
            );
            gfx_assert!(
                self.address_mode[..2]
                    .iter()
                    .all(|mode| matches!(mode, AddressMode::ClampToEdge | AddressMode::ClampToBorder)),
                "Unnormalized samplers need clamped addressing"
            );
            gfx_assert!(
                self.max_anisotropy.is_none(),
                "Unnormalized samplers can't use anisotropy"
            );
        }
    }

    pub fn build(self, device: &Arc<VulkanDevice>) -> Result<Arc<Sampler>> {
        self.validate();

        let anisotropy = self
            .max_anisotropy
            .map(|requested| clamp_anisotropy(requested, device.limits().max_sampler_anisotropy));

        let sampler_info = vk::SamplerCreateInfo::builder()
            .min_filter(self.min_filter.to_vk())
            .mag_filter(self.mag_filter.to_vk())
            .mipmap_mode(self.mip_filter.to_vk_mipmap())
            .address_mode_u(self.address_mode[0].to_vk())
            .address_mode_v(self.address_mode[1].to_vk())
            .address_mode_w(self.address_mode[2].to_vk())
            .mip_lod_bias(0.0)
            .anisotropy_enable(anisotropy.is_some())
            .max_anisotropy(anisotropy.unwrap_or(1.0))
            .compare_enable(false)
            .min_lod(self.min_lod)
            .max_lod(self.max_lod)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_BLACK)
            .unnormalized_coordinates(self.unnormalized_coordinates);

        let raw = unsafe { device.device.create_sampler(&sampler_info, None) }
            .context("Failed to create sampler")?;
        Ok(Arc::new(Sampler {
            raw: Owned::new(device, raw),
            desc: self,
        }))
    }
}

pub fn clamp_anisotropy(requested: f32, device_max: f32) -> f32 {
    requested.clamp(1.0, device_max.max(1.0))
}

#[derive(Debug)]
pub struct Sampler {
    raw: Owned<vk::Sampler>,
    desc: SamplerBuilder,
}

impl Sampler {
    pub fn builder() -> SamplerBuilder {
        SamplerBuilder::default()
    }

    pub fn raw(&self) -> vk::Sampler {
        self.raw.raw()
    }

    pub fn desc(&self) -> &SamplerBuilder {
        &self.desc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_queries() {
        assert!(TextureFormat::R8G8B8A8_SRGB.is_color());
        assert!(TextureFormat::R8G8B8A8_SRGB.is_srgb());
        assert!(!TextureFormat::R8G8B8A8.is_srgb());

        assert!(TextureFormat::D32.is_depth_only());
        assert!(!TextureFormat::D32.is_color());
        assert!(TextureFormat::D24S8.is_depth_stencil());
        assert!(TextureFormat::D24S8.is_stencil());
        assert!(!TextureFormat::UNDEFINED.is_color());

        assert_eq!(
            TextureFormat::D24S8.aspect_mask(),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(TextureFormat::B8G8R8A8.aspect_mask(), vk::ImageAspectFlags::COLOR);
    }

    #[test]
    fn bytes_per_pixel() {
        assert_eq!(TextureFormat::R8.bytes_per_pixel(), 1);
        assert_eq!(TextureFormat::R8G8_SRGB.bytes_per_pixel(), 2);
        assert_eq!(TextureFormat::R8G8B8A8.bytes_per_pixel(), 4);
        assert_eq!(TextureFormat::R16G16B16A16_SFLOAT.bytes_per_pixel(), 8);
    }

    #[test]
    fn bgra_targets_get_swizzled_pixels() {
        let rgba = image::RgbaImage::from_raw(2, 1, vec![10, 20, 30, 40, 1, 2, 3, 4]).unwrap();
        let image = image::DynamicImage::ImageRgba8(rgba);

        assert!(TextureFormat::B8G8R8A8_SRGB.is_bgra());
        assert!(!TextureFormat::R8G8B8A8_SRGB.is_bgra());
        assert_eq!(
            decode_pixels(&image, TextureFormat::B8G8R8A8).unwrap(),
            vec![30, 20, 10, 40, 3, 2, 1, 4]
        );
        assert_eq!(
            decode_pixels(&image, TextureFormat::R8G8B8A8_SRGB).unwrap(),
            vec![10, 20, 30, 40, 1, 2, 3, 4]
        );
        assert!(decode_pixels(&image, TextureFormat::R16G16B16A16_SFLOAT).is_err());
    }

    #[test]
    fn mip_chain_length() {
        assert_eq!(full_mip_levels(1, 1), 1);
        assert_eq!(full_mip_levels(256, 256), 9);
        assert_eq!(full_mip_levels(256, 100), 9);
        assert_eq!(full_mip_levels(300, 20), 9);
        assert_eq!(full_mip_levels(0, 0), 1);
    }

    #[test]
    fn anisotropy_is_clamped_to_the_device() {
        assert_eq!(clamp_anisotropy(16.0, 8.0), 8.0);
        assert_eq!(clamp_anisotropy(4.0, 16.0), 4.0);
        assert_eq!(clamp_anisotropy(0.5, 16.0), 1.0);
    }

    #[test]
    fn default_sampler_is_valid() {
        Sampler::builder().anisotropy(8.0).validate();
        Sampler::builder()
            .filters(FilterMode::Nearest, FilterMode::Nearest)
            .mip_filter(FilterMode::Nearest)
            .lod_range(0.0, 0.0)
            .address_mode_all(AddressMode::ClampToEdge)
            .unnormalized_coordinates()
            .validate();
    }

    #[test]
    #[should_panic(expected = "nearest mip filtering")]
    fn unnormalized_sampler_rejects_linear_mips() {
        Sampler::builder()
            .lod_range(0.0, 0.0)
            .address_mode_all(AddressMode::ClampToEdge)
            .unnormalized_coordinates()
            .validate();
    }
}
