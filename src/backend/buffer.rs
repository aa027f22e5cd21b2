// GPU buffers
//
// Vertex, index, constant and storage buffers allocated through
// gpu-allocator. CpuToGpu and GpuToCpu buffers are replicated once per
// frame slot (see replica.rs); every logical offset a caller passes is
// shifted into the current frame's replica.

use anyhow::{Context, Result};
use ash::vk;
use bitflags::bitflags;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

use super::queue::QueueProperty;
use super::replica::{FrameCounter, Replicas};
use super::VulkanDevice;
use crate::gfx_assert;

/// Where a buffer lives and who writes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    /// Device local; filled through a staging copy.
    GpuOnly,
    /// Host visible, written by the CPU every frame. Replicated.
    CpuToGpu,
    /// Host visible, read back by the CPU. Replicated.
    GpuToCpu,
    /// One-shot upload scratch space. Not replicated.
    Staging,
}

impl MemoryType {
    pub fn is_replicated(self) -> bool {
        matches!(self, MemoryType::CpuToGpu | MemoryType::GpuToCpu)
    }

    pub fn location(self) -> MemoryLocation {
        match self {
            MemoryType::GpuOnly => MemoryLocation::GpuOnly,
            MemoryType::CpuToGpu | MemoryType::Staging => MemoryLocation::CpuToGpu,
            MemoryType::GpuToCpu => MemoryLocation::GpuToCpu,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const CONSTANT = 1 << 2;
        const STORAGE = 1 << 3;
        const TRANSFER_SRC = 1 << 4;
        const TRANSFER_DST = 1 << 5;
    }
}

impl BufferUsage {
    pub fn to_vk(self) -> vk::BufferUsageFlags {
        let mut flags = vk::BufferUsageFlags::empty();
        if self.contains(BufferUsage::VERTEX) {
            flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
        }
        if self.contains(BufferUsage::INDEX) {
            flags |= vk::BufferUsageFlags::INDEX_BUFFER;
        }
        if self.contains(BufferUsage::CONSTANT) {
            flags |= vk::BufferUsageFlags::UNIFORM_BUFFER;
        }
        if self.contains(BufferUsage::STORAGE) {
            flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
        }
        if self.contains(BufferUsage::TRANSFER_SRC) {
            flags |= vk::BufferUsageFlags::TRANSFER_SRC;
        }
        if self.contains(BufferUsage::TRANSFER_DST) {
            flags |= vk::BufferUsageFlags::TRANSFER_DST;
        }
        flags
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Float32,
    Int32,
    Uint32,
    Int16,
    Uint16,
    Int8,
    Uint8,
}

impl DataType {
    pub fn size(self) -> u32 {
        match self {
            DataType::Float32 | DataType::Int32 | DataType::Uint32 => 4,
            DataType::Int16 | DataType::Uint16 => 2,
            DataType::Int8 | DataType::Uint8 => 1,
        }
    }
}

/// One attribute of a vertex (or the single element of an index buffer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataElement {
    pub data_type: DataType,
    pub count: u32,
    pub normalized: bool,
}

impl DataElement {
    pub fn new(data_type: DataType, count: u32) -> Self {
        gfx_assert!((1..=4).contains(&count), "Element count must be 1 to 4, got {}", count);
        Self {
            data_type,
            count,
            normalized: false,
        }
    }

    pub fn normalized(mut self) -> Self {
        self.normalized = true;
        self
    }

    pub fn size(&self) -> u32 {
        self.data_type.size() * self.count
    }

    pub fn to_vk_format(&self) -> vk::Format {
        use DataType::*;
        match (self.data_type, self.count, self.normalized) {
            (Float32, 1, _) => vk::Format::R32_SFLOAT,
            (Float32, 2, _) => vk::Format::R32G32_SFLOAT,
            (Float32, 3, _) => vk::Format::R32G32B32_SFLOAT,
            (Float32, _, _) => vk::Format::R32G32B32A32_SFLOAT,
            (Int32, 1, _) => vk::Format::R32_SINT,
            (Int32, 2, _) => vk::Format::R32G32_SINT,
            (Int32, 3, _) => vk::Format::R32G32B32_SINT,
            (Int32, _, _) => vk::Format::R32G32B32A32_SINT,
            (Uint32, 1, _) => vk::Format::R32_UINT,
            (Uint32, 2, _) => vk::Format::R32G32_UINT,
            (Uint32, 3, _) => vk::Format::R32G32B32_UINT,
            (Uint32, _, _) => vk::Format::R32G32B32A32_UINT,
            (Int16, 1, false) => vk::Format::R16_SINT,
            (Int16, 2, false) => vk::Format::R16G16_SINT,
            (Int16, 3, false) => vk::Format::R16G16B16_SINT,
            (Int16, _, false) => vk::Format::R16G16B16A16_SINT,
            (Int16, 1, true) => vk::Format::R16_SNORM,
            (Int16, 2, true) => vk::Format::R16G16_SNORM,
            (Int16, 3, true) => vk::Format::R16G16B16_SNORM,
            (Int16, _, true) => vk::Format::R16G16B16A16_SNORM,
            (Uint16, 1, false) => vk::Format::R16_UINT,
            (Uint16, 2, false) => vk::Format::R16G16_UINT,
            (Uint16, 3, false) => vk::Format::R16G16B16_UINT,
            (Uint16, _, false) => vk::Format::R16G16B16A16_UINT,
            (Uint16, 1, true) => vk::Format::R16_UNORM,
            (Uint16, 2, true) => vk::Format::R16G16_UNORM,
            (Uint16, 3, true) => vk::Format::R16G16B16_UNORM,
            (Uint16, _, true) => vk::Format::R16G16B16A16_UNORM,
            (Int8, 1, false) => vk::Format::R8_SINT,
            (Int8, 2, false) => vk::Format::R8G8_SINT,
            (Int8, 3, false) => vk::Format::R8G8B8_SINT,
            (Int8, _, false) => vk::Format::R8G8B8A8_SINT,
            (Int8, 1, true) => vk::Format::R8_SNORM,
            (Int8, 2, true) => vk::Format::R8G8_SNORM,
            (Int8, 3, true) => vk::Format::R8G8B8_SNORM,
            (Int8, _, true) => vk::Format::R8G8B8A8_SNORM,
            (Uint8, 1, false) => vk::Format::R8_UINT,
            (Uint8, 2, false) => vk::Format::R8G8_UINT,
            (Uint8, 3, false) => vk::Format::R8G8B8_UINT,
            (Uint8, _, false) => vk::Format::R8G8B8A8_UINT,
            (Uint8, 1, true) => vk::Format::R8_UNORM,
            (Uint8, 2, true) => vk::Format::R8G8_UNORM,
            (Uint8, 3, true) => vk::Format::R8G8B8_UNORM,
            (Uint8, _, true) => vk::Format::R8G8B8A8_UNORM,
        }
    }
}

/// Interleaved element layout with computed offsets and stride.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    elements: Vec<DataElement>,
    offsets: Vec<u32>,
    stride: u32,
    per_instance: bool,
}

impl DataLayout {
    pub fn new(elements: Vec<DataElement>) -> Self {
        let mut offsets = Vec::with_capacity(elements.len());
        let mut stride = 0;
        for element in &elements {
            offsets.push(stride);
            stride += element.size();
        }
        Self {
            elements,
            offsets,
            stride,
            per_instance: false,
        }
    }

    /// Advance once per instance instead of once per vertex.
    pub fn per_instance(mut self) -> Self {
        self.per_instance = true;
        self
    }

    pub fn elements(&self) -> &[DataElement] {
        &self.elements
    }

    pub fn offsets(&self) -> &[u32] {
        &self.offsets
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Index type, if this layout describes an index buffer.
    pub fn index_type(&self) -> Option<vk::IndexType> {
        match self.elements.as_slice() {
            [DataElement {
                data_type: DataType::Uint16,
                count: 1,
                ..
            }] => Some(vk::IndexType::UINT16),
            [DataElement {
                data_type: DataType::Uint32,
                count: 1,
                ..
            }] => Some(vk::IndexType::UINT32),
            _ => None,
        }
    }

    pub fn binding_description(&self, binding: u32) -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding,
            stride: self.stride,
            input_rate: if self.per_instance {
                vk::VertexInputRate::INSTANCE
            } else {
                vk::VertexInputRate::VERTEX
            },
        }
    }

    /// Attributes at consecutive shader locations starting at `first_location`.
    pub fn attribute_descriptions(&self, binding: u32, first_location: u32) -> Vec<vk::VertexInputAttributeDescription> {
        self.elements
            .iter()
            .zip(&self.offsets)
            .enumerate()
            .map(|(i, (element, &offset))| vk::VertexInputAttributeDescription {
                location: first_location + i as u32,
                binding,
                format: element.to_vk_format(),
                offset,
            })
            .collect()
    }
}

/// A GPU buffer.
///
/// `size()` is what the caller asked for. Replicated buffers allocate
/// `MAX_FRAMES_IN_FLIGHT` times that and route every access to the current
/// frame's replica.
pub struct Buffer {
    raw: vk::Buffer,
    allocation: Mutex<Option<Allocation>>,
    usage: BufferUsage,
    memory_type: MemoryType,
    replicas: Replicas,
    layout: Option<DataLayout>,
    frames: FrameCounter,
    device: Arc<VulkanDevice>,
}

impl Buffer {
    pub fn new(
        device: &Arc<VulkanDevice>,
        usage: BufferUsage,
        size: u64,
        memory_type: MemoryType,
        layout: Option<DataLayout>,
    ) -> Result<Arc<Self>> {
        gfx_assert!(size > 0, "Buffer size must be greater than zero");
        if usage.contains(BufferUsage::INDEX) {
            gfx_assert!(
                layout.as_ref().and_then(DataLayout::index_type).is_some(),
                "Index buffers need a single Uint16 or Uint32 element layout"
            );
        }

        let replicas = Replicas::new(size, memory_type.is_replicated());
        if replicas.is_dynamic() {
            let limits = device.limits();
            let alignment = if usage.contains(BufferUsage::STORAGE) {
                limits.min_storage_buffer_offset_alignment
            } else {
                limits.min_uniform_buffer_offset_alignment
            };
            gfx_assert!(
                alignment == 0 || size % alignment == 0,
                "Replicated buffer size {} must be a multiple of the offset alignment {}",
                size,
                alignment
            );
        }

        let mut vk_usage = usage.to_vk();
        match memory_type {
            MemoryType::GpuOnly => vk_usage |= vk::BufferUsageFlags::TRANSFER_DST,
            MemoryType::Staging => vk_usage |= vk::BufferUsageFlags::TRANSFER_SRC,
            _ => {}
        }

        // Device-local buffers are filled from the transfer queue and read on
        // the graphics queue, so share them when those families differ.
        let graphics_family = device.queues.get(QueueProperty::Graphics).family.index();
        let transfer_family = device.queues.get(QueueProperty::Transfer).family.index();
        let families = [graphics_family, transfer_family];
        let mut buffer_info = vk::BufferCreateInfo::builder()
            .size(replicas.real_size())
            .usage(vk_usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        if memory_type == MemoryType::GpuOnly && graphics_family != transfer_family {
            buffer_info = buffer_info
                .sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&families);
        }

        let raw = unsafe { device.device.create_buffer(&buffer_info, None) }
            .context("Failed to create buffer")?;
        let requirements = unsafe { device.device.get_buffer_memory_requirements(raw) };

        let allocation = device.allocator().lock().allocate(&AllocationCreateDesc {
            name: "buffer",
            requirements,
            location: memory_type.location(),
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_buffer(raw, None) };
                return Err(e).context("Failed to allocate buffer memory");
            }
        };

        unsafe {
            device
                .device
                .bind_buffer_memory(raw, allocation.memory(), allocation.offset())
        }
        .context("Failed to bind buffer memory")?;

        Ok(Arc::new(Self {
            raw,
            allocation: Mutex::new(Some(allocation)),
            usage,
            memory_type,
            replicas,
            layout,
            frames: device.frames().clone(),
            device: Arc::clone(device),
        }))
    }

    pub fn raw(&self) -> vk::Buffer {
        self.raw
    }

    pub fn size(&self) -> u64 {
        self.replicas.size()
    }

    /// Allocated size, `size()` times the replica count.
    pub fn real_size(&self) -> u64 {
        self.replicas.real_size()
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    pub fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    pub fn is_dynamic(&self) -> bool {
        self.replicas.is_dynamic()
    }

    pub fn replicas(&self) -> Replicas {
        self.replicas
    }

    pub fn layout(&self) -> Option<&DataLayout> {
        self.layout.as_ref()
    }

    /// Byte offset of the current frame's replica, 0 for unreplicated buffers.
    pub fn current_base_of_replica(&self) -> u64 {
        self.replicas.base_of_replica(self.frames.current())
    }

    /// Copy `data` to logical `offset` of the current replica.
    ///
    /// GpuOnly buffers go through a staging buffer and a blocking transfer,
    /// so keep those calls out of the frame loop.
    pub fn set_data(&self, data: &[u8], offset: u64) -> Result<()> {
        gfx_assert!(
            self.memory_type != MemoryType::GpuToCpu,
            "Can't set data on a GpuToCpu buffer"
        );
        gfx_assert!(!data.is_empty(), "set_data called with no data");

        if self.memory_type == MemoryType::GpuOnly {
            return self.upload_through_staging(data, offset);
        }

        let mut allocation = self.lock_allocation()?;
        let memory = mapped_bytes_mut(&mut allocation)?;
        self.replicas.write(memory, self.frames.current(), offset, data)
    }

    /// Copy from logical `offset` of the current replica into `out`.
    pub fn read_data(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        gfx_assert!(
            self.memory_type != MemoryType::GpuOnly,
            "Can't read back a GpuOnly buffer"
        );

        let mut allocation = self.lock_allocation()?;
        let memory = mapped_bytes_mut(&mut allocation)?;
        self.replicas.read(memory, self.frames.current(), offset, out)
    }

    /// Map the buffer. Accesses through the guard follow the frame counter,
    /// so a mapping may be kept across frames. Unmapped when dropped.
    pub fn map(&self) -> Result<MappedBuffer<'_>> {
        gfx_assert!(self.is_dynamic(), "Only replicated buffers can be mapped");
        let guard = self.lock_allocation()?;
        Ok(MappedBuffer {
            guard,
            replicas: self.replicas,
            frames: &self.frames,
        })
    }

    fn lock_allocation(&self) -> Result<MutexGuard<'_, Option<Allocation>>> {
        match self.allocation.try_lock() {
            Some(guard) => Ok(guard),
            None => {
                gfx_assert!(false, "Buffer is currently mapped");
                anyhow::bail!("Buffer is currently mapped")
            }
        }
    }

    fn upload_through_staging(&self, data: &[u8], offset: u64) -> Result<()> {
        let range = self.replicas.absolute(0, offset, data.len() as u64)?;

        let staging = Buffer::new(
            &self.device,
            BufferUsage::TRANSFER_SRC,
            data.len() as u64,
            MemoryType::Staging,
            None,
        )?;
        staging.set_data(data, 0)?;

        self.device.one_time_submit(QueueProperty::Transfer, |device, cmd| {
            let region = vk::BufferCopy {
                src_offset: 0,
                dst_offset: range.start as u64,
                size: data.len() as u64,
            };
            unsafe { device.cmd_copy_buffer(cmd, staging.raw(), self.raw, &[region]) };
            Ok(())
        })
    }
}

fn mapped_bytes_mut(allocation: &mut Option<Allocation>) -> Result<&mut [u8]> {
    allocation
        .as_mut()
        .and_then(Allocation::mapped_slice_mut)
        .context("Buffer memory is not host visible")
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.get_mut().take() {
            if let Err(e) = self.device.allocator().lock().free(allocation) {
                log::warn!("Failed to free buffer memory: {}", e);
            }
        }
        unsafe { self.device.device.destroy_buffer(self.raw, None) };
    }
}

/// Mapped view of a replicated buffer. Offsets are logical; the current
/// frame's replica base is added on every access.
pub struct MappedBuffer<'a> {
    guard: MutexGuard<'a, Option<Allocation>>,
    replicas: Replicas,
    frames: &'a FrameCounter,
}

impl MappedBuffer<'_> {
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let frame = self.frames.current();
        let replicas = self.replicas;
        replicas.write(mapped_bytes_mut(&mut self.guard)?, frame, offset, data)
    }

    pub fn read(&mut self, offset: u64, out: &mut [u8]) -> Result<()> {
        let frame = self.frames.current();
        let replicas = self.replicas;
        replicas.read(mapped_bytes_mut(&mut self.guard)?, frame, offset, out)
    }

    /// The current replica as a byte slice.
    pub fn current_bytes_mut(&mut self) -> Result<&mut [u8]> {
        let range = self
            .replicas
            .absolute(self.frames.current(), 0, self.replicas.size())?;
        Ok(&mut mapped_bytes_mut(&mut self.guard)?[range])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_host_written_types_are_replicated() {
        assert!(MemoryType::CpuToGpu.is_replicated());
        assert!(MemoryType::GpuToCpu.is_replicated());
        assert!(!MemoryType::GpuOnly.is_replicated());
        assert!(!MemoryType::Staging.is_replicated());
        assert_eq!(MemoryType::Staging.location(), MemoryLocation::CpuToGpu);
    }

    #[test]
    fn layout_offsets_and_stride() {
        let layout = DataLayout::new(vec![
            DataElement::new(DataType::Float32, 3),
            DataElement::new(DataType::Float32, 2),
            DataElement::new(DataType::Uint8, 4).normalized(),
        ]);
        assert_eq!(layout.offsets(), &[0, 12, 20]);
        assert_eq!(layout.stride(), 24);

        let attributes = layout.attribute_descriptions(0, 0);
        assert_eq!(attributes[0].format, vk::Format::R32G32B32_SFLOAT);
        assert_eq!(attributes[1].location, 1);
        assert_eq!(attributes[2].format, vk::Format::R8G8B8A8_UNORM);
        assert_eq!(attributes[2].offset, 20);
        assert_eq!(layout.binding_description(0).input_rate, vk::VertexInputRate::VERTEX);
    }

    #[test]
    fn index_layouts() {
        let u16_layout = DataLayout::new(vec![DataElement::new(DataType::Uint16, 1)]);
        let u32_layout = DataLayout::new(vec![DataElement::new(DataType::Uint32, 1)]);
        let vertex_layout = DataLayout::new(vec![DataElement::new(DataType::Float32, 3)]);
        assert_eq!(u16_layout.index_type(), Some(vk::IndexType::UINT16));
        assert_eq!(u32_layout.index_type(), Some(vk::IndexType::UINT32));
        assert_eq!(vertex_layout.index_type(), None);
    }

    #[test]
    fn usage_maps_to_vulkan_flags() {
        let flags = (BufferUsage::VERTEX | BufferUsage::CONSTANT).to_vk();
        assert!(flags.contains(vk::BufferUsageFlags::VERTEX_BUFFER));
        assert!(flags.contains(vk::BufferUsageFlags::UNIFORM_BUFFER));
        assert!(!flags.contains(vk::BufferUsageFlags::INDEX_BUFFER));
    }
}
