// Shader modules
//
// SPIR-V blobs are compiled offline (see build.rs) and read from the
// assets root at runtime. Modules only need to live until the pipelines
// using them are created.

use anyhow::{Context, Result};
use ash::vk;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use super::descriptor::ShaderStages;
use super::handle::Owned;
use super::VulkanDevice;
use crate::gfx_assert;

/// SPIR-V code of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderBlob {
    pub stage: ShaderStages,
    pub code: Vec<u32>,
}

impl ShaderBlob {
    pub fn new(stage: ShaderStages, code: Vec<u32>) -> Self {
        gfx_assert!(stage.bits().count_ones() == 1, "A shader blob belongs to exactly one stage");
        Self { stage, code }
    }

    pub fn load(stage: ShaderStages, path: &Path) -> Result<Self> {
        Ok(Self::new(stage, load_spirv(path)?))
    }

    /// Parse SPIR-V from bytes. Checks the magic number and word alignment.
    pub fn from_bytes(stage: ShaderStages, bytes: &[u8]) -> Result<Self> {
        let code = ash::util::read_spv(&mut std::io::Cursor::new(bytes)).context("Invalid SPIR-V blob")?;
        Ok(Self::new(stage, code))
    }
}

pub fn load_spirv(path: &Path) -> Result<Vec<u32>> {
    let mut file = File::open(path).with_context(|| format!("Failed to open shader {:?}", path))?;
    let code = ash::util::read_spv(&mut file).with_context(|| format!("Invalid SPIR-V in {:?}", path))?;
    Ok(code)
}

#[derive(Debug)]
pub struct ShaderModule(Owned<vk::ShaderModule>);

impl ShaderModule {
    pub fn new(device: &Arc<VulkanDevice>, code: &[u32]) -> Result<Self> {
        let create_info = vk::ShaderModuleCreateInfo::builder().code(code);
        let raw = unsafe { device.device.create_shader_module(&create_info, None) }
            .context("Failed to create shader module")?;
        Ok(Self(Owned::new(device, raw)))
    }

    pub fn raw(&self) -> vk::ShaderModule {
        self.0.raw()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    #[test]
    fn parses_word_aligned_spirv() {
        let words = [SPIRV_MAGIC, 0x0001_0000, 0, 1, 0];
        let bytes: &[u8] = bytemuck::cast_slice(&words);
        let blob = ShaderBlob::from_bytes(ShaderStages::VERTEX, bytes).unwrap();
        assert_eq!(blob.code, words);
        assert_eq!(blob.stage, ShaderStages::VERTEX);
    }

    #[test]
    fn rejects_truncated_blobs() {
        let words = [SPIRV_MAGIC, 0x0001_0000];
        let bytes: &[u8] = bytemuck::cast_slice(&words);
        assert!(ShaderBlob::from_bytes(ShaderStages::FRAGMENT, &bytes[..7]).is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(load_spirv(Path::new("does/not/exist.spv")).is_err());
    }
}
