//! Vulkan Compute Backend for Hailstone
//!
//! Runs the step-count kernel on a Vulkan device using one transfer queue
//! and one compute queue, with explicit queue-family ownership transfers
//! between them.
//!
//! # Architecture
//!
//! ```text
//! VulkanInstance::create ──▶ probe() ──▶ manage_memory ──▶ MemoryPlan
//!         │                                                    │
//!         ▼                                                    ▼
//!   open_device ──▶ create_buffers ──▶ create_descriptors ──▶ build_shader
//!                                                              │
//!                       run_setup ◀── create_commands ◀── create_pipeline
//!
//! Per slot:  upload (transfer) ─sem─▶ compute ─sem─▶ readback (transfer) ─▶ fence
//! ```
//!
//! # Key Features
//!
//! - **Planned memory**: allocations follow the slot layout computed up front
//! - **Two binding styles**: separate buffers or one buffer per slot bound twice
//! - **Pipeline cache**: validated against the device and persisted atomically
//! - **WGSL kernel**: specialized per plan and translated to SPIR-V with naga
//!
//! # Example
//!
//! ```ignore
//! use hailstone_core::prelude::*;
//! use hailstone_vulkan::GpuContext;
//!
//! let config = SearchConfig::default();
//! let mut gpu = GpuContext::create(&config)?;
//! let plan = gpu.plan().clone();
//! let report = Scheduler::new(
//!     &mut gpu,
//!     plan.layout,
//!     plan.iter_size,
//!     &Checkpoint::fresh(),
//!     CheckpointWriter::inline(&config.checkpoint_path),
//!     CancelToken::new(),
//!     SchedulerOptions::from(&config),
//! )
//! .submit_commands()?;
//! gpu.destroy_gpu()?;
//! ```

pub mod cache;
pub mod commands;
pub mod context;
pub mod device;
pub mod error;
pub mod memory;
pub mod pipeline;
pub mod shader;

pub use cache::CacheIdentity;
pub use commands::{create_commands, CommandSet};
pub use context::GpuContext;
pub use device::{select_queue_families, VulkanDevice, VulkanInstance};
pub use error::{Result, VulkanError};
pub use memory::{create_buffers, SlotMemory};
pub use pipeline::{create_descriptors, create_pipeline, ComputePipeline, Descriptors};
pub use shader::{build_shader, compile_wgsl, shader_source};

/// Probes the limits of a device without creating a logical device.
pub fn probe_device(device_index: Option<usize>) -> Result<hailstone_core::DeviceLimits> {
    Ok(VulkanInstance::create(device_index)?.probe())
}
