//! Descriptor sets and the compute pipeline.

use std::path::{Path, PathBuf};

use ash::vk;
use hailstone_core::protocol::{Memory, Role};
use hailstone_core::MemoryPlan;
use tracing::{debug, warn};

use crate::cache::{self, CacheIdentity};
use crate::device::VulkanDevice;
use crate::error::Result;
use crate::memory::SlotMemory;

/// Descriptor layout, pool and one set per slot.
pub struct Descriptors {
    device: ash::Device,
    set_layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    sets: Vec<vk::DescriptorSet>,
}

impl Descriptors {
    /// Set layout shared by every slot.
    pub fn set_layout(&self) -> vk::DescriptorSetLayout {
        self.set_layout
    }

    /// Descriptor set of a slot.
    pub fn set(&self, slot: usize) -> vk::DescriptorSet {
        self.sets[slot]
    }
}

impl Drop for Descriptors {
    fn drop(&mut self) {
        unsafe {
            // Freeing the pool frees its sets.
            self.device.destroy_descriptor_pool(self.pool, None);
            self.device.destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}

/// Creates descriptor sets binding each slot's device-local regions.
///
/// Binding 0 is the input region and binding 1 the output region. Under the
/// combined binding style both point into one buffer at different offsets.
pub fn create_descriptors(
    device: &VulkanDevice,
    plan: &MemoryPlan,
    memory: &SlotMemory,
) -> Result<Descriptors> {
    let raw = device.raw();
    let slots = plan.slot_count;

    let bindings = [0u32, 1].map(|binding| {
        vk::DescriptorSetLayoutBinding::default()
            .binding(binding)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
    });
    let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
    let set_layout = unsafe { raw.create_descriptor_set_layout(&layout_info, None)? };

    let pool_sizes = [vk::DescriptorPoolSize {
        ty: vk::DescriptorType::STORAGE_BUFFER,
        descriptor_count: 2 * slots,
    }];
    let pool_info = vk::DescriptorPoolCreateInfo::default()
        .max_sets(slots)
        .pool_sizes(&pool_sizes);
    let pool = match unsafe { raw.create_descriptor_pool(&pool_info, None) } {
        Ok(pool) => pool,
        Err(e) => {
            unsafe { raw.destroy_descriptor_set_layout(set_layout, None) };
            return Err(e.into());
        }
    };

    let mut descriptors = Descriptors {
        device: raw.clone(),
        set_layout,
        pool,
        sets: Vec::new(),
    };

    let layouts = vec![set_layout; slots as usize];
    let alloc_info = vk::DescriptorSetAllocateInfo::default()
        .descriptor_pool(pool)
        .set_layouts(&layouts);
    descriptors.sets = unsafe { raw.allocate_descriptor_sets(&alloc_info)? };

    for (slot, &set) in descriptors.sets.iter().enumerate() {
        let infos = [Role::Input, Role::Output].map(|role| {
            let (buffer, offset) = memory.buffer_region(Memory::Device, role, slot);
            [vk::DescriptorBufferInfo {
                buffer,
                offset,
                range: memory.descriptor_range(role),
            }]
        });
        let writes = [
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .buffer_info(&infos[0]),
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(1)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .buffer_info(&infos[1]),
        ];
        unsafe { raw.update_descriptor_sets(&writes, &[]) };
    }

    debug!(sets = slots, style = ?plan.binding_style, "descriptor sets written");
    Ok(descriptors)
}

/// Compute pipeline and its persisted cache.
pub struct ComputePipeline {
    device: ash::Device,
    layout: vk::PipelineLayout,
    cache: vk::PipelineCache,
    pipeline: vk::Pipeline,
    cache_path: Option<PathBuf>,
}

impl ComputePipeline {
    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub fn pipeline(&self) -> vk::Pipeline {
        self.pipeline
    }

    /// Writes the current cache contents to the configured path.
    pub fn save_cache(&self) -> hailstone_core::Result<()> {
        let Some(path) = &self.cache_path else {
            return Ok(());
        };
        let blob = unsafe { self.device.get_pipeline_cache_data(self.cache) }
            .map_err(|e| hailstone_core::Error::device(format!("pipeline cache readback: {}", e)))?;
        cache::store_blob(path, &blob)
    }
}

impl Drop for ComputePipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
            self.device.destroy_pipeline_cache(self.cache, None);
            self.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

fn create_cache(
    device: &ash::Device,
    identity: &CacheIdentity,
    path: Option<&Path>,
) -> Result<vk::PipelineCache> {
    let blob = path.and_then(|p| cache::load_blob(p, identity));
    if let Some(blob) = &blob {
        let info = vk::PipelineCacheCreateInfo::default().initial_data(blob);
        match unsafe { device.create_pipeline_cache(&info, None) } {
            Ok(cache) => return Ok(cache),
            Err(e) => warn!(error = %e, "driver rejected pipeline cache, starting empty"),
        }
    }
    let info = vk::PipelineCacheCreateInfo::default();
    Ok(unsafe { device.create_pipeline_cache(&info, None)? })
}

/// Builds the compute pipeline from SPIR-V words.
pub fn create_pipeline(
    device: &VulkanDevice,
    descriptors: &Descriptors,
    spirv: &[u32],
    cache_path: Option<&Path>,
) -> Result<ComputePipeline> {
    let raw = device.raw();

    let set_layouts = [descriptors.set_layout()];
    let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
    let layout = unsafe { raw.create_pipeline_layout(&layout_info, None)? };

    let mut pipeline = ComputePipeline {
        device: raw.clone(),
        layout,
        cache: vk::PipelineCache::null(),
        pipeline: vk::Pipeline::null(),
        cache_path: cache_path.map(Path::to_path_buf),
    };
    pipeline.cache = create_cache(raw, &device.cache_identity(), cache_path)?;

    let module_info = vk::ShaderModuleCreateInfo::default().code(spirv);
    let module = unsafe { raw.create_shader_module(&module_info, None)? };

    let stage = vk::PipelineShaderStageCreateInfo::default()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(module)
        .name(c"main");
    let create_info = vk::ComputePipelineCreateInfo::default()
        .stage(stage)
        .layout(layout);
    let created =
        unsafe { raw.create_compute_pipelines(pipeline.cache, &[create_info], None) };
    unsafe { raw.destroy_shader_module(module, None) };

    pipeline.pipeline = created.map_err(|(_, e)| e)?[0];
    debug!("compute pipeline created");
    Ok(pipeline)
}
