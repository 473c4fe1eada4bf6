//! Command buffers, synchronization objects and submission.
//!
//! Every slot owns three pre-recorded command buffers replaying its
//! [`SlotScript`], two binary semaphores chaining them across queues, and a
//! fence the host waits on once the readback completes.

use std::time::Duration;

use ash::vk;
use hailstone_core::protocol::{
    self, Access, Barrier, BufferRegion, Command, Ownership, QueueFamilies, SlotScript, Stage,
};
use hailstone_core::MemoryPlan;
use tracing::debug;

use crate::device::VulkanDevice;
use crate::error::Result;
use crate::memory::SlotMemory;
use crate::pipeline::{ComputePipeline, Descriptors};

fn stage_flags(stage: Stage) -> vk::PipelineStageFlags {
    match stage {
        Stage::TopOfPipe => vk::PipelineStageFlags::TOP_OF_PIPE,
        Stage::Transfer => vk::PipelineStageFlags::TRANSFER,
        Stage::ComputeShader => vk::PipelineStageFlags::COMPUTE_SHADER,
        Stage::Host => vk::PipelineStageFlags::HOST,
        Stage::BottomOfPipe => vk::PipelineStageFlags::BOTTOM_OF_PIPE,
    }
}

fn access_flags(access: Access) -> vk::AccessFlags {
    match access {
        Access::None => vk::AccessFlags::empty(),
        Access::TransferRead => vk::AccessFlags::TRANSFER_READ,
        Access::TransferWrite => vk::AccessFlags::TRANSFER_WRITE,
        Access::ShaderRead => vk::AccessFlags::SHADER_READ,
        Access::ShaderWrite => vk::AccessFlags::SHADER_WRITE,
        Access::HostRead => vk::AccessFlags::HOST_READ,
    }
}

/// Source and destination family indices of a barrier.
fn family_indices(ownership: Option<Ownership>) -> (u32, u32) {
    match ownership {
        Some(Ownership::Release { from, to }) | Some(Ownership::Acquire { from, to }) => (from, to),
        None => (vk::QUEUE_FAMILY_IGNORED, vk::QUEUE_FAMILY_IGNORED),
    }
}

/// Everything the encoder needs to resolve a script for one slot.
struct Encoder<'a> {
    device: &'a ash::Device,
    memory: &'a SlotMemory,
    pipeline: &'a ComputePipeline,
    descriptors: &'a Descriptors,
    slot: usize,
}

impl Encoder<'_> {
    fn resolve(&self, target: &BufferRegion) -> (vk::Buffer, u64, u64) {
        let (buffer, offset) = self.memory.buffer_region(target.memory, target.role, self.slot);
        (buffer, offset, target.region.size)
    }

    fn barrier(&self, cb: vk::CommandBuffer, barrier: &Barrier) {
        let (buffer, offset, size) = self.resolve(&barrier.target);
        let (src_family, dst_family) = family_indices(barrier.ownership);
        let memory_barrier = vk::BufferMemoryBarrier::default()
            .src_access_mask(access_flags(barrier.src_access))
            .dst_access_mask(access_flags(barrier.dst_access))
            .src_queue_family_index(src_family)
            .dst_queue_family_index(dst_family)
            .buffer(buffer)
            .offset(offset)
            .size(size);
        unsafe {
            self.device.cmd_pipeline_barrier(
                cb,
                stage_flags(barrier.src_stage),
                stage_flags(barrier.dst_stage),
                vk::DependencyFlags::empty(),
                &[],
                &[memory_barrier],
                &[],
            );
        }
    }

    fn record(&self, cb: vk::CommandBuffer, commands: &[Command]) -> Result<()> {
        let begin = vk::CommandBufferBeginInfo::default();
        unsafe { self.device.begin_command_buffer(cb, &begin)? };
        for command in commands {
            self.encode(cb, command);
        }
        unsafe { self.device.end_command_buffer(cb)? };
        Ok(())
    }

    fn encode(&self, cb: vk::CommandBuffer, command: &Command) {
        let device = self.device;
        match command {
            Command::Copy { src, dst } => {
                let (src_buffer, src_offset, size) = self.resolve(src);
                let (dst_buffer, dst_offset, _) = self.resolve(dst);
                let region = vk::BufferCopy {
                    src_offset,
                    dst_offset,
                    size,
                };
                unsafe { device.cmd_copy_buffer(cb, src_buffer, dst_buffer, &[region]) };
            }
            Command::Fill { dst, value } => {
                let (buffer, offset, size) = self.resolve(dst);
                unsafe { device.cmd_fill_buffer(cb, buffer, offset, size, *value) };
            }
            Command::Barrier(barrier) => self.barrier(cb, barrier),
            Command::BindPipeline => unsafe {
                device.cmd_bind_pipeline(cb, vk::PipelineBindPoint::COMPUTE, self.pipeline.pipeline());
                device.cmd_bind_descriptor_sets(
                    cb,
                    vk::PipelineBindPoint::COMPUTE,
                    self.pipeline.layout(),
                    0,
                    &[self.descriptors.set(self.slot)],
                    &[],
                );
            },
            Command::Dispatch { workgroups } => unsafe {
                device.cmd_dispatch(cb, *workgroups, 1, 1);
            },
        }
    }
}

/// Per-slot command buffers and synchronization.
struct SlotCommands {
    upload: vk::CommandBuffer,
    compute: vk::CommandBuffer,
    readback: vk::CommandBuffer,
    upload_done: vk::Semaphore,
    compute_done: vk::Semaphore,
    fence: vk::Fence,
}

/// Command pools and every slot's recorded work.
pub struct CommandSet {
    device: ash::Device,
    transfer_queue: vk::Queue,
    compute_queue: vk::Queue,
    transfer_pool: vk::CommandPool,
    compute_pool: vk::CommandPool,
    slots: Vec<SlotCommands>,
    setup: vk::CommandBuffer,
    setup_fence: vk::Fence,
}

impl CommandSet {
    fn new(device: &VulkanDevice, families: QueueFamilies) -> Result<Self> {
        let raw = device.raw();
        let mut set = Self {
            device: raw.clone(),
            transfer_queue: device.transfer_queue(),
            compute_queue: device.compute_queue(),
            transfer_pool: vk::CommandPool::null(),
            compute_pool: vk::CommandPool::null(),
            slots: Vec::new(),
            setup: vk::CommandBuffer::null(),
            setup_fence: vk::Fence::null(),
        };
        let pool_info = |family| vk::CommandPoolCreateInfo::default().queue_family_index(family);
        set.transfer_pool = unsafe { raw.create_command_pool(&pool_info(families.transfer), None)? };
        set.compute_pool = unsafe { raw.create_command_pool(&pool_info(families.compute), None)? };
        set.setup_fence = unsafe { raw.create_fence(&vk::FenceCreateInfo::default(), None)? };
        Ok(set)
    }

    fn allocate(&self, pool: vk::CommandPool, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        Ok(unsafe { self.device.allocate_command_buffers(&info)? })
    }

    /// Submits upload and dispatch for a slot.
    ///
    /// The upload signals `upload_done`; the dispatch waits on it at the
    /// compute stage and signals `compute_done`.
    pub fn submit_dispatch(&self, slot: usize) -> Result<()> {
        let s = &self.slots[slot];

        let upload_cbs = [s.upload];
        let upload_signal = [s.upload_done];
        let upload = vk::SubmitInfo::default()
            .command_buffers(&upload_cbs)
            .signal_semaphores(&upload_signal);
        unsafe {
            self.device
                .queue_submit(self.transfer_queue, &[upload], vk::Fence::null())?
        };

        let compute_cbs = [s.compute];
        let compute_wait = [s.upload_done];
        let compute_stage = [vk::PipelineStageFlags::COMPUTE_SHADER];
        let compute_signal = [s.compute_done];
        let compute = vk::SubmitInfo::default()
            .wait_semaphores(&compute_wait)
            .wait_dst_stage_mask(&compute_stage)
            .command_buffers(&compute_cbs)
            .signal_semaphores(&compute_signal);
        unsafe {
            self.device
                .queue_submit(self.compute_queue, &[compute], vk::Fence::null())?
        };
        Ok(())
    }

    /// Submits the readback for a slot, signalling its fence.
    pub fn submit_readback(&self, slot: usize) -> Result<()> {
        let s = &self.slots[slot];
        unsafe { self.device.reset_fences(&[s.fence])? };

        let cbs = [s.readback];
        let wait = [s.compute_done];
        let stage = [vk::PipelineStageFlags::TRANSFER];
        let submit = vk::SubmitInfo::default()
            .wait_semaphores(&wait)
            .wait_dst_stage_mask(&stage)
            .command_buffers(&cbs);
        unsafe { self.device.queue_submit(self.transfer_queue, &[submit], s.fence)? };
        Ok(())
    }

    /// Waits for a slot's readback. `false` on timeout.
    pub fn wait(&self, slot: usize, timeout: Duration) -> Result<bool> {
        let nanos = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        match unsafe { self.device.wait_for_fences(&[self.slots[slot].fence], true, nanos) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Runs the recorded setup sequence and waits for it.
    pub fn run_setup(&self) -> Result<()> {
        let cbs = [self.setup];
        let submit = vk::SubmitInfo::default().command_buffers(&cbs);
        unsafe {
            self.device
                .queue_submit(self.transfer_queue, &[submit], self.setup_fence)?;
            self.device.wait_for_fences(&[self.setup_fence], true, u64::MAX)?;
        }
        debug!(slots = self.slots.len(), "device regions zero-filled");
        Ok(())
    }
}

impl Drop for CommandSet {
    fn drop(&mut self) {
        unsafe {
            for s in self.slots.drain(..) {
                self.device.destroy_semaphore(s.upload_done, None);
                self.device.destroy_semaphore(s.compute_done, None);
                self.device.destroy_fence(s.fence, None);
            }
            self.device.destroy_fence(self.setup_fence, None);
            // Destroying a pool frees its command buffers.
            self.device.destroy_command_pool(self.transfer_pool, None);
            self.device.destroy_command_pool(self.compute_pool, None);
        }
    }
}

/// Records every slot's scripts and the setup sequence.
pub fn create_commands(
    device: &VulkanDevice,
    plan: &MemoryPlan,
    memory: &SlotMemory,
    pipeline: &ComputePipeline,
    descriptors: &Descriptors,
) -> Result<CommandSet> {
    let families = device.families();
    let raw = device.raw();
    let mut set = CommandSet::new(device, families)?;

    let slots = plan.slot_count;
    let transfer_cbs = set.allocate(set.transfer_pool, 2 * slots + 1)?;
    let compute_cbs = set.allocate(set.compute_pool, slots)?;
    set.setup = transfer_cbs[2 * slots as usize];

    let script: SlotScript = protocol::record_slot(plan, families);
    let setup_script = protocol::record_setup(plan);

    let begin = vk::CommandBufferBeginInfo::default();
    unsafe { raw.begin_command_buffer(set.setup, &begin)? };

    for slot in 0..slots as usize {
        let encoder = Encoder {
            device: raw,
            memory,
            pipeline,
            descriptors,
            slot,
        };
        // Pushed with null handles first so a failed create is still cleaned up.
        set.slots.push(SlotCommands {
            upload: transfer_cbs[2 * slot],
            readback: transfer_cbs[2 * slot + 1],
            compute: compute_cbs[slot],
            upload_done: vk::Semaphore::null(),
            compute_done: vk::Semaphore::null(),
            fence: vk::Fence::null(),
        });
        let semaphore = vk::SemaphoreCreateInfo::default();
        let entry = &mut set.slots[slot];
        entry.upload_done = unsafe { raw.create_semaphore(&semaphore, None)? };
        entry.compute_done = unsafe { raw.create_semaphore(&semaphore, None)? };
        entry.fence = unsafe { raw.create_fence(&vk::FenceCreateInfo::default(), None)? };
        encoder.record(entry.upload, &script.upload)?;
        encoder.record(entry.compute, &script.compute)?;
        encoder.record(entry.readback, &script.readback)?;

        for command in &setup_script {
            encoder.encode(set.setup, command);
        }
    }

    unsafe { raw.end_command_buffer(set.setup)? };
    debug!(
        slots,
        shared_family = families.is_shared(),
        "slot command buffers recorded"
    );
    Ok(set)
}
