//! GPU context: bootstrap, slot backend and teardown.

use std::time::Duration;

use ash::vk;
use hailstone_core::slot::{DrainingSlot, FillingSlot, InFlightSlot, ReadySlot};
use hailstone_core::{manage_memory, Error, MemoryPlan, PlanRequest, SearchConfig, SlotBackend};
use tracing::{info, warn};

use crate::commands::{create_commands, CommandSet};
use crate::device::{VulkanDevice, VulkanInstance};
use crate::error::Result as VkResult;
use crate::memory::{create_buffers, SlotMemory};
use crate::pipeline::{create_descriptors, create_pipeline, ComputePipeline, Descriptors};
use crate::shader::build_shader;

/// Runs the setup submission and drains the device if it fails.
///
/// The setup work may still be pending when its wait fails, and the objects
/// it uses are released as soon as the error propagates.
fn run_setup_or_drain(
    setup: impl FnOnce() -> VkResult<()>,
    drain: impl FnOnce() -> std::result::Result<(), vk::Result>,
) -> VkResult<()> {
    setup().inspect_err(|_| {
        if let Err(e) = drain() {
            warn!(error = %e, "device did not drain after failed setup");
        }
    })
}

/// Every GPU object the search needs.
///
/// Fields drop in declaration order, so everything created from the device
/// is released before the device itself.
pub struct GpuContext {
    commands: CommandSet,
    pipeline: ComputePipeline,
    _descriptors: Descriptors,
    memory: SlotMemory,
    device: VulkanDevice,
    plan: MemoryPlan,
    torn_down: bool,
}

impl GpuContext {
    /// Probes the device, plans memory and builds every GPU object.
    ///
    /// Planning runs before the logical device exists, so an undersized
    /// budget fails without touching the GPU beyond the probe.
    pub fn create(config: &SearchConfig) -> hailstone_core::Result<Self> {
        let instance = VulkanInstance::create(config.device_index)?;
        let limits = instance.probe();
        let plan = manage_memory(&limits, &PlanRequest::from(config))?;
        info!(device = %limits.device_name, %plan, "memory plan");

        let device = instance.open_device()?;
        let memory = create_buffers(&device, &plan)?;
        let descriptors = create_descriptors(&device, &plan, &memory)?;
        let spirv = build_shader(&plan, config.shader_path.as_deref())?;
        let pipeline = create_pipeline(
            &device,
            &descriptors,
            &spirv,
            config.pipeline_cache_path.as_deref(),
        )?;
        let commands = create_commands(&device, &plan, &memory, &pipeline, &descriptors)?;
        run_setup_or_drain(
            || commands.run_setup(),
            || unsafe { device.raw().device_wait_idle() },
        )?;

        Ok(Self {
            commands,
            pipeline,
            _descriptors: descriptors,
            memory,
            device,
            plan,
            torn_down: false,
        })
    }

    /// The plan the context was built from.
    pub fn plan(&self) -> &MemoryPlan {
        &self.plan
    }

    /// Name of the device in use.
    pub fn device_name(&self) -> String {
        self.device.instance().name()
    }

    /// Waits for the device and persists the pipeline cache.
    ///
    /// Safe to call more than once; objects themselves are released on drop.
    pub fn destroy_gpu(&mut self) -> hailstone_core::Result<()> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;
        self.wait_idle()?;
        self.pipeline.save_cache()
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        if let Err(e) = self.destroy_gpu() {
            warn!(error = %e, "GPU teardown incomplete");
        }
    }
}

impl SlotBackend for GpuContext {
    fn slot_count(&self) -> usize {
        self.plan.slot_count as usize
    }

    fn input_mut(&mut self, slot: &FillingSlot) -> hailstone_core::Result<&mut [u8]> {
        Ok(self.memory.host_input(slot.id())?)
    }

    fn submit_dispatch(&mut self, slot: &FillingSlot) -> hailstone_core::Result<()> {
        let id = slot.id();
        self.memory
            .flush_input(id)
            .and_then(|()| self.commands.submit_dispatch(id))
            .map_err(|e| Error::submission(id, e))
    }

    fn submit_readback(&mut self, slot: &InFlightSlot) -> hailstone_core::Result<()> {
        let id = slot.id();
        self.commands
            .submit_readback(id)
            .map_err(|e| Error::submission(id, e))
    }

    fn wait(&mut self, slot: &DrainingSlot, timeout: Duration) -> hailstone_core::Result<bool> {
        let id = slot.id();
        self.commands.wait(id, timeout).map_err(|e| Error::wait(id, e))
    }

    fn output(&mut self, slot: &ReadySlot) -> hailstone_core::Result<&[u8]> {
        let id = slot.id();
        self.memory.invalidate_output(id)?;
        Ok(self.memory.host_output(id)?)
    }

    fn wait_idle(&mut self) -> hailstone_core::Result<()> {
        unsafe { self.device.raw().device_wait_idle() }
            .map_err(|e| Error::device(format!("wait idle: {}", e)))
    }
}
