//! Kernel source specialization and SPIR-V translation.

use std::path::Path;

use hailstone_core::{ElementLayout, MemoryPlan};
use naga::back::spv;
use naga::valid::{Capabilities, ValidationFlags, Validator};
use tracing::{debug, info};

use crate::error::{Result, VulkanError};

const COMMON: &str = include_str!("../shaders/collatz.wgsl");
const COMPACT16: &str = include_str!("../shaders/compact16.wgsl");
const WIDE64: &str = include_str!("../shaders/wide64.wgsl");

/// SPIR-V magic number.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Specializes the WGSL kernel for a plan.
pub fn shader_source(plan: &MemoryPlan) -> String {
    let entry = match plan.layout {
        ElementLayout::Compact16 => COMPACT16,
        ElementLayout::Wide64 => WIDE64,
    };
    let mut source = String::with_capacity(COMMON.len() + entry.len() + 1);
    source.push_str(COMMON);
    source.push('\n');
    source.push_str(entry);
    source
        .replace("__WORKGROUP_SIZE__", &plan.workgroup_size.to_string())
        .replace("__INVOCATIONS__", &plan.invocations.to_string())
}

/// Translates WGSL into SPIR-V words.
pub fn compile_wgsl(source: &str) -> Result<Vec<u32>> {
    let module = naga::front::wgsl::parse_str(source)
        .map_err(|e| VulkanError::Shader(e.emit_to_string(source)))?;
    let info = Validator::new(ValidationFlags::all(), Capabilities::empty())
        .validate(&module)
        .map_err(|e| VulkanError::Shader(e.emit_to_string(source)))?;
    spv::write_vec(&module, &info, &spv::Options::default(), None)
        .map_err(|e| VulkanError::Shader(e.to_string()))
}

/// Reads a precompiled SPIR-V module.
pub fn load_spirv(path: &Path) -> Result<Vec<u32>> {
    let mut file = std::fs::File::open(path).map_err(|e| {
        VulkanError::Shader(format!("cannot open {}: {}", path.display(), e))
    })?;
    ash::util::read_spv(&mut file)
        .map_err(|e| VulkanError::Shader(format!("invalid SPIR-V in {}: {}", path.display(), e)))
}

/// Produces the kernel for a plan, from `override_path` when given.
///
/// A precompiled module must declare a `main` entry point with the same
/// bindings and output layout as the built-in kernel.
pub fn build_shader(plan: &MemoryPlan, override_path: Option<&Path>) -> Result<Vec<u32>> {
    let words = match override_path {
        Some(path) => {
            info!(path = %path.display(), "loading precompiled kernel");
            load_spirv(path)?
        }
        None => compile_wgsl(&shader_source(plan))?,
    };
    if words.first() != Some(&SPIRV_MAGIC) {
        return Err(VulkanError::Shader("module does not start with the SPIR-V magic".into()));
    }
    debug!(
        words = words.len(),
        layout = ?plan.layout,
        workgroup_size = plan.workgroup_size,
        "kernel ready"
    );
    Ok(words)
}
