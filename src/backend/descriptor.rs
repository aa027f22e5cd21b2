// Descriptor pool, layouts and sets
//
// Layouts are built once and never change. Sets are long-lived: callers
// create them outside the frame loop and free them by dropping.
//
// Replicated buffers reach shaders in two ways:
// - dynamic buffer bindings: one native set, the replica base is added to
//   the dynamic offset at bind time (see `resolve_dynamic_offsets`)
// - plain buffer bindings: one native set per frame slot, each written
//   with its own replica's range

use anyhow::{Context, Result};
use ash::vk;
use bitflags::bitflags;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::buffer::Buffer;
use super::handle::Owned;
use super::replica::{FrameCounter, Replicas, MAX_FRAMES_IN_FLIGHT};
use super::texture::{Sampler, TextureView};
use super::VulkanDevice;
use crate::gfx_assert;

/// Kind of resource a binding holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorType {
    Sampler,
    CombinedTextureSampler,
    SampledTexture,
    StorageTexture,
    ConstantTexelBuffer,
    StorageTexelBuffer,
    ConstantBuffer,
    StorageBuffer,
    ConstantBufferDynamic,
    StorageBufferDynamic,
    InputAttachment,
}

impl DescriptorType {
    pub fn to_vk(self) -> vk::DescriptorType {
        match self {
            DescriptorType::Sampler => vk::DescriptorType::SAMPLER,
            DescriptorType::CombinedTextureSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            DescriptorType::SampledTexture => vk::DescriptorType::SAMPLED_IMAGE,
            DescriptorType::StorageTexture => vk::DescriptorType::STORAGE_IMAGE,
            DescriptorType::ConstantTexelBuffer => vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
            DescriptorType::StorageTexelBuffer => vk::DescriptorType::STORAGE_TEXEL_BUFFER,
            DescriptorType::ConstantBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            DescriptorType::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            DescriptorType::ConstantBufferDynamic => vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            DescriptorType::StorageBufferDynamic => vk::DescriptorType::STORAGE_BUFFER_DYNAMIC,
            DescriptorType::InputAttachment => vk::DescriptorType::INPUT_ATTACHMENT,
        }
    }

    pub fn is_dynamic_buffer(self) -> bool {
        matches!(
            self,
            DescriptorType::ConstantBufferDynamic | DescriptorType::StorageBufferDynamic
        )
    }

    /// Plain (non-dynamic) buffer binding.
    pub fn is_static_buffer(self) -> bool {
        matches!(self, DescriptorType::ConstantBuffer | DescriptorType::StorageBuffer)
    }
}

bitflags! {
    /// Shader stages a binding is visible to. Bit values match Vulkan's.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShaderStages: u32 {
        const VERTEX = 1;
        const TESSELLATION_CONTROL = 2;
        const TESSELLATION_EVALUATION = 4;
        const GEOMETRY = 8;
        const FRAGMENT = 16;
        const COMPUTE = 32;
        const GRAPHICS_ALL = Self::VERTEX.bits()
            | Self::TESSELLATION_CONTROL.bits()
            | Self::TESSELLATION_EVALUATION.bits()
            | Self::GEOMETRY.bits()
            | Self::FRAGMENT.bits();
        const ALL = Self::GRAPHICS_ALL.bits() | Self::COMPUTE.bits();
    }
}

impl ShaderStages {
    pub fn to_vk(self) -> vk::ShaderStageFlags {
        vk::ShaderStageFlags::from_raw(self.bits())
    }
}

/// One binding of a layout. The binding number is its position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorDesc {
    pub ty: DescriptorType,
    pub stages: ShaderStages,
    pub array_count: u32,
}

/// Ordered bindings of a layout, without any device object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorLayoutDesc {
    descs: Vec<DescriptorDesc>,
}

impl DescriptorLayoutDesc {
    pub fn descriptor_descs(&self) -> &[DescriptorDesc] {
        &self.descs
    }

    pub fn desc(&self, binding: u32) -> &DescriptorDesc {
        gfx_assert!(
            (binding as usize) < self.descs.len(),
            "Binding {} out of range, layout has {} bindings",
            binding,
            self.descs.len()
        );
        &self.descs[binding as usize]
    }

    /// Number of offsets `vkCmdBindDescriptorSets` expects.
    pub fn dynamic_offset_count(&self) -> usize {
        self.descs
            .iter()
            .filter(|d| d.ty.is_dynamic_buffer())
            .map(|d| d.array_count as usize)
            .sum()
    }

    /// Plain buffer bindings may point at replicated buffers, which needs
    /// one native set per frame slot.
    pub fn needs_per_frame_sets(&self) -> bool {
        self.descs.iter().any(|d| d.ty.is_static_buffer())
    }
}

#[derive(Debug, Default, Clone)]
pub struct DescriptorSetLayoutBuilder {
    descs: Vec<DescriptorDesc>,
}

impl DescriptorSetLayoutBuilder {
    pub fn add_descriptor_desc(mut self, ty: DescriptorType, stages: ShaderStages, array_count: u32) -> Self {
        gfx_assert!(array_count > 0, "Descriptor array count must be greater than zero");
        self.descs.push(DescriptorDesc {
            ty,
            stages,
            array_count,
        });
        self
    }

    pub fn finish(self) -> DescriptorLayoutDesc {
        gfx_assert!(!self.descs.is_empty(), "A descriptor set layout needs at least one binding");
        DescriptorLayoutDesc { descs: self.descs }
    }

    pub fn build(self, device: &Arc<VulkanDevice>) -> Result<Arc<DescriptorSetLayout>> {
        DescriptorSetLayout::new(device, self.finish())
    }
}

/// Immutable binding shape a set must match.
#[derive(Debug)]
pub struct DescriptorSetLayout {
    raw: Owned<vk::DescriptorSetLayout>,
    desc: DescriptorLayoutDesc,
}

impl DescriptorSetLayout {
    pub fn builder() -> DescriptorSetLayoutBuilder {
        DescriptorSetLayoutBuilder::default()
    }

    pub fn new(device: &Arc<VulkanDevice>, desc: DescriptorLayoutDesc) -> Result<Arc<Self>> {
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = desc
            .descs
            .iter()
            .enumerate()
            .map(|(binding, d)| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(binding as u32)
                    .descriptor_type(d.ty.to_vk())
                    .descriptor_count(d.array_count)
                    .stage_flags(d.stages.to_vk())
                    .build()
            })
            .collect();

        let create_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        let raw = unsafe { device.device.create_descriptor_set_layout(&create_info, None) }
            .context("Failed to create descriptor set layout")?;

        Ok(Arc::new(Self {
            raw: Owned::new(device, raw),
            desc,
        }))
    }

    pub fn raw(&self) -> vk::DescriptorSetLayout {
        self.raw.raw()
    }

    pub fn desc(&self) -> &DescriptorLayoutDesc {
        &self.desc
    }

    pub fn descriptor_descs(&self) -> &[DescriptorDesc] {
        self.desc.descriptor_descs()
    }
}

/// Pool sizes used by the graphics context.
pub const DEFAULT_POOL_SIZES: [(DescriptorType, u32); 6] = [
    (DescriptorType::ConstantBuffer, 64),
    (DescriptorType::ConstantBufferDynamic, 64),
    (DescriptorType::StorageBufferDynamic, 16),
    (DescriptorType::CombinedTextureSampler, 64),
    (DescriptorType::Sampler, 64),
    (DescriptorType::SampledTexture, 64),
];
pub const DEFAULT_MAX_SETS: u32 = 128;

/// Global pool. Sets return their descriptors when dropped.
#[derive(Debug)]
pub struct DescriptorPool {
    raw: Owned<vk::DescriptorPool>,
}

impl DescriptorPool {
    pub fn new(device: &Arc<VulkanDevice>, sizes: &[(DescriptorType, u32)], max_sets: u32) -> Result<Arc<Self>> {
        let pool_sizes: Vec<vk::DescriptorPoolSize> = sizes
            .iter()
            .map(|&(ty, count)| vk::DescriptorPoolSize {
                ty: ty.to_vk(),
                descriptor_count: count,
            })
            .collect();

        let create_info = vk::DescriptorPoolCreateInfo::builder()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .pool_sizes(&pool_sizes)
            .max_sets(max_sets);
        let raw = unsafe { device.device.create_descriptor_pool(&create_info, None) }
            .context("Failed to create descriptor pool")?;

        Ok(Arc::new(Self {
            raw: Owned::new(device, raw),
        }))
    }

    pub fn raw(&self) -> vk::DescriptorPool {
        self.raw.raw()
    }

    /// Return every set to the pool. Sets still alive after this point are
    /// dangling, so only call it once nothing else holds the pool.
    pub fn reset(&self) -> Result<()> {
        unsafe {
            self.device()
                .device
                .reset_descriptor_pool(self.raw(), vk::DescriptorPoolResetFlags::empty())
        }
        .context("Failed to reset descriptor pool")?;
        Ok(())
    }

    fn device(&self) -> &Arc<VulkanDevice> {
        self.raw.device()
    }
}

/// Replica layout of the buffers written into dynamic bindings, per array
/// element. Unwritten elements stay `None`.
#[derive(Debug, Default, Clone)]
pub struct DynamicBufferTable {
    bindings: BTreeMap<u32, Vec<Option<Replicas>>>,
}

impl DynamicBufferTable {
    pub fn set(&mut self, binding: u32, array_count: u32, dst_array_offset: u32, replicas: &[Replicas]) {
        let elements = self
            .bindings
            .entry(binding)
            .or_insert_with(|| vec![None; array_count as usize]);
        for (i, r) in replicas.iter().enumerate() {
            elements[dst_array_offset as usize + i] = Some(*r);
        }
    }

    pub fn get(&self, binding: u32) -> Option<&[Option<Replicas>]> {
        self.bindings.get(&binding).map(Vec::as_slice)
    }
}

/// Offsets for `vkCmdBindDescriptorSets`, one per dynamic array element in
/// binding order: the element's replica base for `frame` plus the matching
/// caller offset. Missing caller offsets count as zero.
pub fn resolve_dynamic_offsets(
    layout: &DescriptorLayoutDesc,
    table: &DynamicBufferTable,
    frame: usize,
    user_offsets: &[u32],
) -> Result<Vec<u32>> {
    let expected = layout.dynamic_offset_count();
    gfx_assert!(
        user_offsets.len() <= expected,
        "Got {} dynamic offsets but the set only has {} dynamic buffers",
        user_offsets.len(),
        expected
    );
    if !user_offsets.is_empty() && user_offsets.len() < expected {
        log::warn!(
            "bind_descriptor_set: {} dynamic buffers but only {} offsets, the rest use 0",
            expected,
            user_offsets.len()
        );
    }

    let mut user = user_offsets.iter().copied();
    let mut offsets = Vec::with_capacity(expected);
    for (binding, desc) in layout.descriptor_descs().iter().enumerate() {
        if !desc.ty.is_dynamic_buffer() {
            continue;
        }
        let elements = table.get(binding as u32);
        for element in 0..desc.array_count as usize {
            let replicas = elements.and_then(|e| e[element]);
            gfx_assert!(
                replicas.is_some(),
                "Dynamic buffer binding {} element {} was never set",
                binding,
                element
            );
            let base = replicas.map_or(0, |r| r.base_of_replica(frame));
            let offset = base
                .checked_add(u64::from(user.next().unwrap_or(0)))
                .and_then(|offset| u32::try_from(offset).ok())
                .with_context(|| {
                    format!(
                        "Dynamic offset of binding {} element {} does not fit in 32 bits",
                        binding, element
                    )
                })?;
            offsets.push(offset);
        }
    }
    Ok(offsets)
}

/// A buffer range written into a buffer binding.
#[derive(Clone, Copy)]
pub struct BufferRange<'a> {
    pub buffer: &'a Buffer,
    pub offset: u64,
    pub size: u64,
}

impl<'a> BufferRange<'a> {
    /// The whole logical buffer.
    pub fn whole(buffer: &'a Buffer) -> Self {
        Self {
            buffer,
            offset: 0,
            size: buffer.size(),
        }
    }
}

/// Table of bindings conforming to one layout.
///
/// Callers see one set; under the hood there may be one native set per
/// frame slot (see the module notes). `native()` returns the one for the
/// current frame.
pub struct DescriptorSet {
    sets: Vec<vk::DescriptorSet>,
    dynamic_buffers: DynamicBufferTable,
    frames: FrameCounter,
    layout: Arc<DescriptorSetLayout>,
    pool: Arc<DescriptorPool>,
}

impl DescriptorSet {
    pub fn new(pool: &Arc<DescriptorPool>, layout: &Arc<DescriptorSetLayout>) -> Result<Self> {
        let count = if layout.desc().needs_per_frame_sets() {
            MAX_FRAMES_IN_FLIGHT
        } else {
            1
        };
        let set_layouts = vec![layout.raw(); count];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool.raw())
            .set_layouts(&set_layouts);
        let sets = unsafe { pool.device().device.allocate_descriptor_sets(&alloc_info) }
            .context("Failed to allocate descriptor sets")?;

        Ok(Self {
            sets,
            dynamic_buffers: DynamicBufferTable::default(),
            frames: pool.device().frames().clone(),
            layout: Arc::clone(layout),
            pool: Arc::clone(pool),
        })
    }

    pub fn layout(&self) -> &Arc<DescriptorSetLayout> {
        &self.layout
    }

    /// Native set for the current frame slot.
    pub fn native(&self) -> vk::DescriptorSet {
        self.sets[self.frames.current() % self.sets.len()]
    }

    pub fn native_count(&self) -> usize {
        self.sets.len()
    }

    pub fn dynamic_buffers(&self) -> &DynamicBufferTable {
        &self.dynamic_buffers
    }

    pub fn dynamic_offsets(&self, user_offsets: &[u32]) -> Result<Vec<u32>> {
        resolve_dynamic_offsets(self.layout.desc(), &self.dynamic_buffers, self.frames.current(), user_offsets)
    }

    pub fn set_constant_buffer(&mut self, binding: u32, range: BufferRange<'_>) {
        self.set_constant_buffers(binding, 0, &[range]);
    }

    /// Write `ranges` into array elements starting at `dst_array_offset`;
    /// other elements are left untouched.
    pub fn set_constant_buffers(&mut self, binding: u32, dst_array_offset: u32, ranges: &[BufferRange<'_>]) {
        let desc = *self.layout.desc().desc(binding);
        gfx_assert!(
            matches!(
                desc.ty,
                DescriptorType::ConstantBuffer | DescriptorType::ConstantBufferDynamic
            ),
            "Binding {} is {:?}, not a constant buffer",
            binding,
            desc.ty
        );
        self.write_buffers(binding, desc, dst_array_offset, ranges);
    }

    pub fn set_storage_buffer(&mut self, binding: u32, range: BufferRange<'_>) {
        let desc = *self.layout.desc().desc(binding);
        gfx_assert!(
            matches!(
                desc.ty,
                DescriptorType::StorageBuffer | DescriptorType::StorageBufferDynamic
            ),
            "Binding {} is {:?}, not a storage buffer",
            binding,
            desc.ty
        );
        self.write_buffers(binding, desc, 0, &[range]);
    }

    pub fn set_combined_texture_sampler(&mut self, binding: u32, view: &TextureView, sampler: &Sampler) {
        self.set_combined_texture_samplers(binding, 0, &[(view, sampler)]);
    }

    pub fn set_combined_texture_samplers(
        &mut self,
        binding: u32,
        dst_array_offset: u32,
        pairs: &[(&TextureView, &Sampler)],
    ) {
        let infos: Vec<vk::DescriptorImageInfo> = pairs
            .iter()
            .map(|(view, sampler)| vk::DescriptorImageInfo {
                sampler: sampler.raw(),
                image_view: view.raw(),
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            })
            .collect();
        self.write_images(binding, DescriptorType::CombinedTextureSampler, dst_array_offset, &infos);
    }

    pub fn set_sampled_texture(&mut self, binding: u32, view: &TextureView) {
        self.set_sampled_textures(binding, 0, &[view]);
    }

    pub fn set_sampled_textures(&mut self, binding: u32, dst_array_offset: u32, views: &[&TextureView]) {
        let infos: Vec<vk::DescriptorImageInfo> = views
            .iter()
            .map(|view| vk::DescriptorImageInfo {
                sampler: vk::Sampler::null(),
                image_view: view.raw(),
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            })
            .collect();
        self.write_images(binding, DescriptorType::SampledTexture, dst_array_offset, &infos);
    }

    pub fn set_sampler(&mut self, binding: u32, sampler: &Sampler) {
        self.set_samplers(binding, 0, &[sampler]);
    }

    pub fn set_samplers(&mut self, binding: u32, dst_array_offset: u32, samplers: &[&Sampler]) {
        let infos: Vec<vk::DescriptorImageInfo> = samplers
            .iter()
            .map(|sampler| vk::DescriptorImageInfo {
                sampler: sampler.raw(),
                image_view: vk::ImageView::null(),
                image_layout: vk::ImageLayout::UNDEFINED,
            })
            .collect();
        self.write_images(binding, DescriptorType::Sampler, dst_array_offset, &infos);
    }

    fn check_array_range(binding: u32, desc: &DescriptorDesc, dst_array_offset: u32, count: usize) {
        gfx_assert!(count > 0, "Nothing to write into binding {}", binding);
        gfx_assert!(
            dst_array_offset as usize + count <= desc.array_count as usize,
            "Writing {} elements at offset {} overflows binding {} with array count {}",
            count,
            dst_array_offset,
            binding,
            desc.array_count
        );
    }

    fn write_buffers(&mut self, binding: u32, desc: DescriptorDesc, dst_array_offset: u32, ranges: &[BufferRange<'_>]) {
        Self::check_array_range(binding, &desc, dst_array_offset, ranges.len());

        if desc.ty.is_dynamic_buffer() {
            let replicas: Vec<Replicas> = ranges.iter().map(|r| r.buffer.replicas()).collect();
            self.dynamic_buffers
                .set(binding, desc.array_count, dst_array_offset, &replicas);
        }

        let device = Arc::clone(self.pool.device());
        for (slot, &set) in self.sets.iter().enumerate() {
            let infos: Vec<vk::DescriptorBufferInfo> = ranges
                .iter()
                .map(|r| {
                    // Dynamic bindings get the replica base as a dynamic offset instead
                    let base = if desc.ty.is_dynamic_buffer() {
                        0
                    } else {
                        r.buffer.replicas().base_of_replica(slot)
                    };
                    vk::DescriptorBufferInfo {
                        buffer: r.buffer.raw(),
                        offset: base + r.offset,
                        range: r.size,
                    }
                })
                .collect();

            let write = vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(binding)
                .dst_array_element(dst_array_offset)
                .descriptor_type(desc.ty.to_vk())
                .buffer_info(&infos)
                .build();
            unsafe { device.device.update_descriptor_sets(&[write], &[]) };
        }
    }

    fn write_images(
        &mut self,
        binding: u32,
        expected: DescriptorType,
        dst_array_offset: u32,
        infos: &[vk::DescriptorImageInfo],
    ) {
        let desc = *self.layout.desc().desc(binding);
        gfx_assert!(
            desc.ty == expected,
            "Binding {} is {:?}, expected {:?}",
            binding,
            desc.ty,
            expected
        );
        Self::check_array_range(binding, &desc, dst_array_offset, infos.len());

        let device = Arc::clone(self.pool.device());
        let writes: Vec<vk::WriteDescriptorSet> = self
            .sets
            .iter()
            .map(|&set| {
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(binding)
                    .dst_array_element(dst_array_offset)
                    .descriptor_type(desc.ty.to_vk())
                    .image_info(infos)
                    .build()
            })
            .collect();
        unsafe { device.device.update_descriptor_sets(&writes, &[]) };
    }
}

impl Drop for DescriptorSet {
    fn drop(&mut self) {
        let result = unsafe {
            self.pool
                .device()
                .device
                .free_descriptor_sets(self.pool.raw(), &self.sets)
        };
        if let Err(e) = result {
            log::warn!("Failed to free descriptor sets: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(descs: &[(DescriptorType, u32)]) -> DescriptorLayoutDesc {
        descs
            .iter()
            .fold(DescriptorSetLayout::builder(), |builder, &(ty, count)| {
                builder.add_descriptor_desc(ty, ShaderStages::GRAPHICS_ALL, count)
            })
            .finish()
    }

    #[test]
    fn binding_order_and_array_counts_are_preserved() {
        let desc = DescriptorSetLayout::builder()
            .add_descriptor_desc(DescriptorType::ConstantBufferDynamic, ShaderStages::VERTEX, 1)
            .add_descriptor_desc(DescriptorType::CombinedTextureSampler, ShaderStages::FRAGMENT, 8)
            .add_descriptor_desc(DescriptorType::Sampler, ShaderStages::FRAGMENT, 2)
            .finish();

        let descs = desc.descriptor_descs();
        assert_eq!(descs.len(), 3);
        assert_eq!(descs[0].ty, DescriptorType::ConstantBufferDynamic);
        assert_eq!(descs[0].array_count, 1);
        assert_eq!(descs[1].ty, DescriptorType::CombinedTextureSampler);
        assert_eq!(descs[1].array_count, 8);
        assert_eq!(descs[1].stages, ShaderStages::FRAGMENT);
        assert_eq!(descs[2].ty, DescriptorType::Sampler);
        assert_eq!(descs[2].array_count, 2);
    }

    #[test]
    #[should_panic(expected = "array count must be greater than zero")]
    fn zero_sized_binding_is_rejected() {
        DescriptorSetLayout::builder().add_descriptor_desc(DescriptorType::Sampler, ShaderStages::ALL, 0);
    }

    #[test]
    #[should_panic(expected = "at least one binding")]
    fn empty_layout_is_rejected() {
        DescriptorSetLayout::builder().finish();
    }

    #[test]
    fn per_frame_sets_only_for_plain_buffer_bindings() {
        assert!(layout(&[(DescriptorType::ConstantBuffer, 1)]).needs_per_frame_sets());
        assert!(!layout(&[
            (DescriptorType::ConstantBufferDynamic, 1),
            (DescriptorType::CombinedTextureSampler, 4)
        ])
        .needs_per_frame_sets());
    }

    #[test]
    fn dynamic_offsets_add_replica_base_and_user_offsets() {
        let desc = layout(&[
            (DescriptorType::ConstantBufferDynamic, 1),
            (DescriptorType::CombinedTextureSampler, 1),
            (DescriptorType::StorageBufferDynamic, 2),
        ]);
        assert_eq!(desc.dynamic_offset_count(), 3);

        let mut table = DynamicBufferTable::default();
        table.set(0, 1, 0, &[Replicas::new(256, true)]);
        table.set(2, 2, 0, &[Replicas::new(512, true), Replicas::new(1024, false)]);

        let offsets = resolve_dynamic_offsets(&desc, &table, 2, &[16, 32, 64]).unwrap();
        assert_eq!(offsets, vec![2 * 256 + 16, 2 * 512 + 32, 64]);

        let offsets = resolve_dynamic_offsets(&desc, &table, 1, &[]).unwrap();
        assert_eq!(offsets, vec![256, 512, 0]);
    }

    #[test]
    fn partial_array_writes_keep_other_elements() {
        let mut table = DynamicBufferTable::default();
        table.set(0, 4, 1, &[Replicas::new(64, true)]);
        table.set(0, 4, 3, &[Replicas::new(128, true)]);

        let elements = table.get(0).unwrap();
        assert_eq!(elements.len(), 4);
        assert!(elements[0].is_none());
        assert_eq!(elements[1].unwrap().size(), 64);
        assert!(elements[2].is_none());
        assert_eq!(elements[3].unwrap().size(), 128);
    }

    #[test]
    #[should_panic(expected = "was never set")]
    fn unset_dynamic_binding_is_caught() {
        let desc = layout(&[(DescriptorType::ConstantBufferDynamic, 1)]);
        let _ = resolve_dynamic_offsets(&desc, &DynamicBufferTable::default(), 0, &[]);
    }

    #[test]
    #[should_panic(expected = "dynamic offsets")]
    fn too_many_user_offsets_are_caught() {
        let desc = layout(&[(DescriptorType::ConstantBufferDynamic, 1)]);
        let mut table = DynamicBufferTable::default();
        table.set(0, 1, 0, &[Replicas::new(256, true)]);
        let _ = resolve_dynamic_offsets(&desc, &table, 0, &[0, 0]);
    }

    #[test]
    fn offsets_past_four_gib_are_rejected() {
        let desc = layout(&[(DescriptorType::StorageBufferDynamic, 1)]);
        let mut table = DynamicBufferTable::default();
        table.set(0, 1, 0, &[Replicas::new(3 << 30, true)]);

        assert_eq!(resolve_dynamic_offsets(&desc, &table, 1, &[]).unwrap(), vec![3 << 30]);
        assert!(resolve_dynamic_offsets(&desc, &table, 2, &[]).is_err());
        assert!(resolve_dynamic_offsets(&desc, &table, 1, &[u32::MAX]).is_err());
    }

    #[test]
    fn shader_stage_bits_match_vulkan() {
        assert_eq!(ShaderStages::VERTEX.to_vk(), vk::ShaderStageFlags::VERTEX);
        assert_eq!(ShaderStages::FRAGMENT.to_vk(), vk::ShaderStageFlags::FRAGMENT);
        assert_eq!(ShaderStages::COMPUTE.to_vk(), vk::ShaderStageFlags::COMPUTE);
        assert_eq!(ShaderStages::GRAPHICS_ALL.to_vk(), vk::ShaderStageFlags::ALL_GRAPHICS);
    }
}
