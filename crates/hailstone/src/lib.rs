//! # Hailstone
//!
//! Resumable search for Collatz step-count records over odd 128-bit
//! integers, driven by a Vulkan compute device or the host.
//!
//! [`run_search`] wires the pieces together: it validates the configuration,
//! resumes from the checkpoint file, builds the selected backend, runs the
//! scheduler until the termination condition holds and tears the backend
//! down again.

use serde::Serialize;
use tracing::{info, warn};

pub use hailstone_core::{
    BackendKind, CancelToken, Checkpoint, Error, Result, RunReport, SearchConfig, Termination,
};
use hailstone_core::{
    manage_memory, CheckpointWriter, DeviceLimits, HostBackend, MemoryPlan, PlanRequest,
    Scheduler, SchedulerOptions, SlotBackend,
};
use hailstone_vulkan::GpuContext;

/// Memory the host backend pretends to have when planning.
const HOST_HEAP_BYTES: u64 = 1 << 30;

/// What a finished run reports.
#[derive(Debug, Clone, Serialize)]
pub struct SearchOutcome {
    pub backend: BackendKind,
    pub device: String,
    pub slots: u32,
    pub iter_size: u32,
    #[serde(flatten)]
    pub report: RunReport,
}

/// Plans memory for the host backend.
pub fn host_plan(config: &SearchConfig) -> Result<MemoryPlan> {
    manage_memory(
        &DeviceLimits::unified(HOST_HEAP_BYTES),
        &PlanRequest::from(config),
    )
}

fn open_writer(config: &SearchConfig) -> Result<CheckpointWriter> {
    if config.background_checkpoints {
        CheckpointWriter::background(&config.checkpoint_path)
    } else {
        Ok(CheckpointWriter::inline(&config.checkpoint_path))
    }
}

fn drive<B: SlotBackend + ?Sized>(
    backend: &mut B,
    plan: &MemoryPlan,
    config: &SearchConfig,
    checkpoint: &Checkpoint,
    cancel: CancelToken,
) -> Result<RunReport> {
    let writer = open_writer(config)?;
    Scheduler::new(
        backend,
        plan.layout,
        plan.iter_size,
        checkpoint,
        writer,
        cancel,
        SchedulerOptions::from(config),
    )
    .submit_commands()
}

/// Runs a search to completion or cancellation.
pub fn run_search(config: &SearchConfig, cancel: CancelToken) -> Result<SearchOutcome> {
    config.validate()?;
    let checkpoint = Checkpoint::load_or_fresh(&config.checkpoint_path, config.restart);
    info!(
        cursor = %checkpoint.cursor,
        best = %checkpoint.record,
        backend = ?config.backend,
        "starting search"
    );

    match config.backend {
        BackendKind::Host => {
            let plan = host_plan(config)?;
            let mut host = HostBackend::new(plan.layout, plan.iter_size, plan.slot_count as usize);
            let report = drive(&mut host, &plan, config, &checkpoint, cancel)?;
            Ok(SearchOutcome {
                backend: BackendKind::Host,
                device: "host".to_string(),
                slots: plan.slot_count,
                iter_size: plan.iter_size,
                report,
            })
        }
        BackendKind::Vulkan => {
            let mut gpu = GpuContext::create(config)?;
            let plan = gpu.plan().clone();
            let result = drive(&mut gpu, &plan, config, &checkpoint, cancel);

            if let Err(e) = gpu.destroy_gpu() {
                if e.is_fatal() && result.is_ok() {
                    return Err(e);
                }
                warn!(error = %e, "teardown reported an error");
            }
            Ok(SearchOutcome {
                backend: BackendKind::Vulkan,
                device: gpu.device_name(),
                slots: plan.slot_count,
                iter_size: plan.iter_size,
                report: result?,
            })
        }
    }
}
