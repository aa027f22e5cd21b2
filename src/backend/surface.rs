// Presentation surface
//
// Created from the window's raw handles through ash-window. Destroyed
// before the instance because it holds an Arc to it.

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::sync::Arc;

use super::Instance;

/// What a physical device can do with this surface.
#[derive(Debug, Clone, Default)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    /// A swapchain can be built: at least one format and one present mode.
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

pub struct Surface {
    pub raw: vk::SurfaceKHR,
    pub loader: khr::Surface,
    instance: Arc<Instance>,
}

impl Surface {
    pub fn new(
        instance: &Arc<Instance>,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
    ) -> Result<Arc<Self>> {
        let loader = khr::Surface::new(&instance.entry, &instance.raw);

        let raw = unsafe {
            ash_window::create_surface(
                &instance.entry,
                &instance.raw,
                display_handle,
                window_handle,
                None,
            )
        }
        .context("Failed to create window surface")?;

        Ok(Arc::new(Self {
            raw,
            loader,
            instance: Arc::clone(instance),
        }))
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub fn supports_present(&self, physical_device: vk::PhysicalDevice, family_index: u32) -> Result<bool> {
        let supported = unsafe {
            self.loader
                .get_physical_device_surface_support(physical_device, family_index, self.raw)
        }
        .context("Failed to query surface present support")?;
        Ok(supported)
    }

    /// Query capabilities, formats and present modes. Called at device
    /// selection and again on every swapchain rebuild since the extent moves.
    pub fn support(&self, physical_device: vk::PhysicalDevice) -> Result<SurfaceSupport> {
        unsafe {
            let capabilities = self
                .loader
                .get_physical_device_surface_capabilities(physical_device, self.raw)
                .context("Failed to get surface capabilities")?;
            let formats = self
                .loader
                .get_physical_device_surface_formats(physical_device, self.raw)
                .context("Failed to get surface formats")?;
            let present_modes = self
                .loader
                .get_physical_device_surface_present_modes(physical_device, self.raw)
                .context("Failed to get surface present modes")?;

            Ok(SurfaceSupport {
                capabilities,
                formats,
                present_modes,
            })
        }
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe { self.loader.destroy_surface(self.raw, None) };
    }
}
