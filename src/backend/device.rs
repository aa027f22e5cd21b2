// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Physical device selection (discrete GPU with every queue role)
// - Logical device + one queue per distinct family
// - Memory allocator setup
// - One-shot upload submissions

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::ffi::CStr;
use std::mem::ManuallyDrop;
use std::sync::Arc;

use super::check::LogOnError;
use super::queue::{Queue, QueueContainer, QueueFamily, QueueFamilyContainer, QueueProperty};
use super::replica::FrameCounter;
use super::surface::{Surface, SurfaceSupport};
use super::Instance;

/// Features the renderer relies on (shadow bias, anisotropic sampling)
const REQUIRED_DEVICE_FEATURES: vk::PhysicalDeviceFeatures = vk::PhysicalDeviceFeatures {
    sampler_anisotropy: vk::TRUE,
    depth_clamp: vk::TRUE,
    depth_bias_clamp: vk::TRUE,
    ..unsafe { std::mem::zeroed() }
};

fn required_extensions() -> [&'static CStr; 1] {
    [ash::extensions::khr::Swapchain::name()]
}

fn supports_required_features(features: &vk::PhysicalDeviceFeatures) -> bool {
    features.sampler_anisotropy == vk::TRUE
        && features.depth_clamp == vk::TRUE
        && features.depth_bias_clamp == vk::TRUE
}

/// Everything device selection needs to know about one adapter.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub handle: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub features: vk::PhysicalDeviceFeatures,
    pub families: QueueFamilyContainer,
    pub surface_support: SurfaceSupport,
    pub has_required_extensions: bool,
}

impl AdapterInfo {
    fn query(instance: &ash::Instance, surface: &Surface, handle: vk::PhysicalDevice) -> Result<Self> {
        let properties = unsafe { instance.get_physical_device_properties(handle) };
        let features = unsafe { instance.get_physical_device_features(handle) };

        let mut families = QueueFamilyContainer::new();
        let family_properties = unsafe { instance.get_physical_device_queue_family_properties(handle) };
        for (index, props) in family_properties.iter().enumerate() {
            if props.queue_count == 0 {
                continue;
            }
            let index = index as u32;
            let can_present = surface.supports_present(handle, index)?;
            families.add_family(QueueFamily::from_vk(index, props, can_present));
        }

        let available = unsafe { instance.enumerate_device_extension_properties(handle) }
            .context("Failed to enumerate device extensions")?;
        let has_required_extensions = required_extensions().iter().all(|required| {
            available.iter().any(|ext| {
                let name = unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) };
                name == *required
            })
        });

        let surface_support = surface.support(handle)?;

        Ok(Self {
            handle,
            properties,
            features,
            families,
            surface_support,
            has_required_extensions,
        })
    }

    pub fn name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }

    /// Discrete GPU, all four queue roles covered, swapchain extension,
    /// required features, and at least one surface format and present mode.
    pub fn is_suitable(&self) -> bool {
        self.properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU
            && self.families.has_all_properties()
            && self.has_required_extensions
            && supports_required_features(&self.features)
            && self.surface_support.is_adequate()
    }
}

/// Logical device, queues and memory allocator.
pub struct VulkanDevice {
    // Dropped by hand before the device is destroyed
    allocator: ManuallyDrop<Mutex<Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: Arc<Instance>,

    pub queues: QueueContainer,
    pub properties: vk::PhysicalDeviceProperties,
    pub families: QueueFamilyContainer,

    frames: FrameCounter,
    upload_pools: Mutex<BTreeMap<u32, vk::CommandPool>>,
}

impl VulkanDevice {
    /// Pick an adapter that can present to `surface` and create the device.
    ///
    /// Fails when no adapter qualifies; that is not something a retry fixes.
    pub fn new(instance: &Arc<Instance>, surface: &Surface) -> Result<Arc<Self>> {
        let adapter = Self::pick_physical_device(&instance.raw, surface)?;

        let (device, queues) = Self::create_logical_device(&instance.raw, &adapter)?;

        let props = &adapter.properties;
        log::info!("Selected GPU: {} ({:?})", adapter.name(), props.device_type);
        log::info!(
            "API Version: {}.{}.{}, driver {:#x}",
            vk::api_version_major(props.api_version),
            vk::api_version_minor(props.api_version),
            vk::api_version_patch(props.api_version),
            props.driver_version
        );
        for property in QueueProperty::ALL {
            log::info!("{:?} queue family: {}", property, queues.get(property).family.index());
        }

        let allocator = Self::create_allocator(&instance.raw, adapter.handle, &device)?;

        Ok(Arc::new(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            device,
            physical_device: adapter.handle,
            instance: Arc::clone(instance),
            queues,
            properties: adapter.properties,
            families: adapter.families,
            frames: FrameCounter::new(),
            upload_pools: Mutex::new(BTreeMap::new()),
        }))
    }

    fn pick_physical_device(instance: &ash::Instance, surface: &Surface) -> Result<AdapterInfo> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .context("Failed to enumerate physical devices")?;

        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        for handle in devices {
            let adapter = AdapterInfo::query(instance, surface, handle)?;
            if adapter.is_suitable() {
                return Ok(adapter);
            }
            log::info!("Skipping unsuitable GPU: {}", adapter.name());
        }

        anyhow::bail!(
            "No suitable GPU found: need a discrete GPU with graphics, compute, transfer and \
             present queues, swapchain support and the required features"
        )
    }

    fn create_logical_device(
        instance: &ash::Instance,
        adapter: &AdapterInfo,
    ) -> Result<(ash::Device, QueueContainer)> {
        let selection = adapter
            .families
            .select()
            .context("Adapter does not cover every queue role")?;

        // One queue per distinct family; roles on the same family share it
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = selection
            .unique_family_indices()
            .into_iter()
            .map(|index| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(index)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let extensions: Vec<_> = required_extensions().iter().map(|name| name.as_ptr()).collect();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&REQUIRED_DEVICE_FEATURES);

        let device = unsafe { instance.create_device(adapter.handle, &create_info, None) }
            .context("Failed to create logical device")?;

        let queue = |property: QueueProperty| -> Result<Queue> {
            let index = selection.family_for(property);
            let family = *adapter
                .families
                .family(index)
                .with_context(|| format!("Queue family {} vanished", index))?;
            let handle = unsafe { device.get_device_queue(index, 0) };
            Ok(Queue { handle, family })
        };

        let queues = QueueContainer::new(
            queue(QueueProperty::Graphics)?,
            queue(QueueProperty::Compute)?,
            queue(QueueProperty::Transfer)?,
            queue(QueueProperty::Present)?,
        );

        Ok((device, queues))
    }

    fn create_allocator(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> Result<Allocator> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create GPU memory allocator")?;

        Ok(allocator)
    }

    pub fn allocator(&self) -> &Mutex<Allocator> {
        &self.allocator
    }

    /// Current frame slot, shared with the frame loop.
    pub fn frames(&self) -> &FrameCounter {
        &self.frames
    }

    pub fn limits(&self) -> &vk::PhysicalDeviceLimits {
        &self.properties.limits
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("Failed to wait for device idle")?;
        Ok(())
    }

    pub fn wait_queue(&self, property: QueueProperty) -> Result<()> {
        let queue = self.queues.get(property).handle;
        unsafe { self.device.queue_wait_idle(queue) }.context("Failed to wait for queue idle")?;
        Ok(())
    }

    /// Record a command buffer, submit it to the `property` queue and block
    /// until it finishes. Used for uploads at resource creation time.
    pub fn one_time_submit<F>(&self, property: QueueProperty, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer) -> Result<()>,
    {
        let queue = *self.queues.get(property);
        let mut pools = self.upload_pools.lock();

        let family_index = queue.family.index();
        let pool = match pools.get(&family_index) {
            Some(&pool) => pool,
            None => {
                let pool_info = vk::CommandPoolCreateInfo::builder()
                    .queue_family_index(family_index)
                    .flags(vk::CommandPoolCreateFlags::TRANSIENT);
                let pool = unsafe { self.device.create_command_pool(&pool_info, None) }
                    .context("Failed to create upload command pool")?;
                pools.insert(family_index, pool);
                pool
            }
        };

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate upload command buffer")?[0];

        let result = self.record_and_wait(queue.handle, cmd, record);

        unsafe { self.device.free_command_buffers(pool, &[cmd]) };
        result
    }

    fn record_and_wait<F>(&self, queue: vk::Queue, cmd: vk::CommandBuffer, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer) -> Result<()>,
    {
        let begin_info =
            vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(cmd, &begin_info) }?;

        record(&self.device, cmd)?;

        unsafe {
            self.device.end_command_buffer(cmd)?;

            let command_buffers = [cmd];
            let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
            self.device
                .queue_submit(queue, &[submit_info.build()], vk::Fence::null())
                .context("Failed to submit upload")?;
            self.device.queue_wait_idle(queue).context("Failed to wait for upload")?;
        }
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        self.wait_idle().log_on_error("Device wait before destruction failed");

        unsafe {
            for (_, pool) in std::mem::take(&mut *self.upload_pools.lock()) {
                self.device.destroy_command_pool(pool, None);
            }

            // Allocator frees its memory blocks through the device
            ManuallyDrop::drop(&mut self.allocator);

            self.device.destroy_device(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::queue::QueueProperties;

    fn adapter(device_type: vk::PhysicalDeviceType) -> AdapterInfo {
        let mut families = QueueFamilyContainer::new();
        families.add_family(QueueFamily::new(
            0,
            1,
            64,
            QueueProperties::GRAPHICS | QueueProperties::COMPUTE | QueueProperties::TRANSFER,
        ));
        families.add_family(QueueFamily::new(1, 1, 64, QueueProperties::PRESENT));

        AdapterInfo {
            handle: vk::PhysicalDevice::null(),
            properties: vk::PhysicalDeviceProperties {
                device_type,
                ..Default::default()
            },
            features: REQUIRED_DEVICE_FEATURES,
            families,
            surface_support: SurfaceSupport {
                capabilities: Default::default(),
                formats: vec![vk::SurfaceFormatKHR::default()],
                present_modes: vec![vk::PresentModeKHR::FIFO],
            },
            has_required_extensions: true,
        }
    }

    #[test]
    fn discrete_gpu_with_everything_is_suitable() {
        let adapter = adapter(vk::PhysicalDeviceType::DISCRETE_GPU);
        assert!(adapter.is_suitable());
        assert_eq!(adapter.families.select().unwrap().unique_family_indices().len(), 2);
    }

    #[test]
    fn integrated_gpu_is_rejected() {
        assert!(!adapter(vk::PhysicalDeviceType::INTEGRATED_GPU).is_suitable());
    }

    #[test]
    fn each_missing_requirement_rejects_the_adapter() {
        let mut no_extension = adapter(vk::PhysicalDeviceType::DISCRETE_GPU);
        no_extension.has_required_extensions = false;
        assert!(!no_extension.is_suitable());

        let mut no_modes = adapter(vk::PhysicalDeviceType::DISCRETE_GPU);
        no_modes.surface_support.present_modes.clear();
        assert!(!no_modes.is_suitable());

        let mut no_formats = adapter(vk::PhysicalDeviceType::DISCRETE_GPU);
        no_formats.surface_support.formats.clear();
        assert!(!no_formats.is_suitable());

        let mut no_anisotropy = adapter(vk::PhysicalDeviceType::DISCRETE_GPU);
        no_anisotropy.features.sampler_anisotropy = vk::FALSE;
        assert!(!no_anisotropy.is_suitable());

        let mut no_present = adapter(vk::PhysicalDeviceType::DISCRETE_GPU);
        no_present.families = QueueFamilyContainer::new();
        no_present
            .families
            .add_family(QueueFamily::new(0, 1, 64, QueueProperties::all() - QueueProperties::PRESENT));
        assert!(!no_present.is_suitable());
    }
}
