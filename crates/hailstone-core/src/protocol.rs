//! Queue ownership-transfer protocol.
//!
//! Each slot replays three recorded command sequences. The sequences are
//! built here as backend-neutral scripts and encoded into real command
//! buffers by the GPU backend.
//!
//! ```text
//!  transfer queue            compute queue             transfer queue
//! ┌──────────────────┐      ┌────────────────────┐    ┌──────────────────┐
//! │ copy host→device │      │ acquire input      │    │ acquire output   │
//! │ release input    │─sem─▶│ bind + dispatch    │─sem▶│ copy device→host │
//! │ (transfer→comp.) │  A   │ release output     │ B  │ host barrier     │──▶ fence
//! └──────────────────┘      └────────────────────┘    └──────────────────┘
//!       upload                    compute                   readback
//! ```
//!
//! When both roles map to one queue family the ownership halves collapse
//! into plain execution and memory barriers.

use crate::plan::{MemoryPlan, Region};

/// Queue family indices for the two roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub transfer: u32,
    pub compute: u32,
}

impl QueueFamilies {
    /// Both roles resolve to one family.
    pub fn is_shared(&self) -> bool {
        self.transfer == self.compute
    }
}

/// Which side of a slot a buffer lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Memory {
    /// Host-visible staging.
    Host,
    /// Device-local working memory.
    Device,
}

/// A region of one of a slot's buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRegion {
    pub memory: Memory,
    /// Input or output half of the slot.
    pub role: Role,
    /// Byte range relative to the slot base.
    pub region: Region,
}

/// Input or output half of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Input,
    Output,
}

/// Pipeline stage scopes used by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    TopOfPipe,
    Transfer,
    ComputeShader,
    Host,
    BottomOfPipe,
}

/// Access scopes used by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    None,
    TransferRead,
    TransferWrite,
    ShaderRead,
    ShaderWrite,
    HostRead,
}

/// Half of a queue-family ownership transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Executed on the source queue.
    Release { from: u32, to: u32 },
    /// Executed on the destination queue.
    Acquire { from: u32, to: u32 },
}

/// A buffer memory barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Barrier {
    pub target: BufferRegion,
    pub src_stage: Stage,
    pub src_access: Access,
    pub dst_stage: Stage,
    pub dst_access: Access,
    pub ownership: Option<Ownership>,
}

/// One recorded command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Buffer-to-buffer copy of equal-sized regions.
    Copy { src: BufferRegion, dst: BufferRegion },
    /// Fill a region with a 32-bit pattern.
    Fill { dst: BufferRegion, value: u32 },
    /// Buffer memory barrier.
    Barrier(Barrier),
    /// Bind the compute pipeline and the slot's descriptor set.
    BindPipeline,
    /// Dispatch workgroups in X.
    Dispatch { workgroups: u32 },
}

/// The three sequences replayed per slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotScript {
    /// Transfer queue: host input to device, release to compute.
    pub upload: Vec<Command>,
    /// Compute queue: acquire, dispatch, release to transfer.
    pub compute: Vec<Command>,
    /// Transfer queue: acquire, device output to host.
    pub readback: Vec<Command>,
}

fn region(memory: Memory, role: Role, plan: &MemoryPlan) -> BufferRegion {
    BufferRegion {
        memory,
        role,
        region: match role {
            Role::Input => plan.input_region(),
            Role::Output => plan.output_region(),
        },
    }
}

/// Builds the hand-off of `target` from `from` to `to`.
///
/// Distinct families produce a release barrier for the source queue and an
/// acquire barrier for the destination queue. A shared family produces a
/// single plain barrier on the source side and nothing on the destination.
fn hand_off(
    target: BufferRegion,
    families: QueueFamilies,
    from: u32,
    to: u32,
    src: (Stage, Access),
    dst: (Stage, Access),
) -> (Barrier, Option<Barrier>) {
    if families.is_shared() {
        let plain = Barrier {
            target,
            src_stage: src.0,
            src_access: src.1,
            dst_stage: dst.0,
            dst_access: dst.1,
            ownership: None,
        };
        return (plain, None);
    }

    let release = Barrier {
        target,
        src_stage: src.0,
        src_access: src.1,
        dst_stage: Stage::BottomOfPipe,
        dst_access: Access::None,
        ownership: Some(Ownership::Release { from, to }),
    };
    let acquire = Barrier {
        target,
        src_stage: Stage::TopOfPipe,
        src_access: Access::None,
        dst_stage: dst.0,
        dst_access: dst.1,
        ownership: Some(Ownership::Acquire { from, to }),
    };
    (release, Some(acquire))
}

/// Records the per-slot command scripts.
pub fn record_slot(plan: &MemoryPlan, families: QueueFamilies) -> SlotScript {
    let host_in = region(Memory::Host, Role::Input, plan);
    let device_in = region(Memory::Device, Role::Input, plan);
    let device_out = region(Memory::Device, Role::Output, plan);
    let host_out = region(Memory::Host, Role::Output, plan);

    let (input_release, input_acquire) = hand_off(
        device_in,
        families,
        families.transfer,
        families.compute,
        (Stage::Transfer, Access::TransferWrite),
        (Stage::ComputeShader, Access::ShaderRead),
    );
    let (output_release, output_acquire) = hand_off(
        device_out,
        families,
        families.compute,
        families.transfer,
        (Stage::ComputeShader, Access::ShaderWrite),
        (Stage::Transfer, Access::TransferRead),
    );

    // The release barrier also makes the copy's writes available.
    let upload = vec![
        Command::Copy {
            src: host_in,
            dst: device_in,
        },
        Command::Barrier(input_release),
    ];

    let mut compute = Vec::with_capacity(4);
    if let Some(acquire) = input_acquire {
        compute.push(Command::Barrier(acquire));
    }
    compute.push(Command::BindPipeline);
    compute.push(Command::Dispatch {
        workgroups: plan.workgroup_count,
    });
    compute.push(Command::Barrier(output_release));

    let mut readback = Vec::with_capacity(3);
    if let Some(acquire) = output_acquire {
        readback.push(Command::Barrier(acquire));
    }
    readback.push(Command::Copy {
        src: device_out,
        dst: host_out,
    });
    readback.push(Command::Barrier(Barrier {
        target: host_out,
        src_stage: Stage::Transfer,
        src_access: Access::TransferWrite,
        dst_stage: Stage::Host,
        dst_access: Access::HostRead,
        ownership: None,
    }));

    SlotScript {
        upload,
        compute,
        readback,
    }
}

/// Records the one-time setup sequence for a slot.
///
/// Zero-fills both device-local regions on the transfer queue. The fill is
/// hygiene only: no later command reads a device region before overwriting
/// it. With a shared family the zeroes are what the compute queue sees
/// first. With distinct families the compute queue uses `device_out`
/// without acquiring it, which discards its contents; the dispatch writes
/// every element before the release to transfer, so nothing depends on the
/// fill. No ownership is transferred here.
pub fn record_setup(plan: &MemoryPlan) -> Vec<Command> {
    let mut commands = Vec::with_capacity(4);
    for role in [Role::Input, Role::Output] {
        let target = region(Memory::Device, role, plan);
        commands.push(Command::Fill { dst: target, value: 0 });
        commands.push(Command::Barrier(Barrier {
            target,
            src_stage: Stage::Transfer,
            src_access: Access::TransferWrite,
            dst_stage: Stage::Transfer,
            dst_access: Access::TransferWrite,
            ownership: None,
        }));
    }
    commands
}
