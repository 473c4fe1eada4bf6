//! # Hailstone Core
//!
//! Backend-independent machinery for a resumable GPU search of Collatz
//! step-count records over 128-bit odd integers.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Hailstone Core                           │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  DeviceLimits ──▶ manage_memory ──▶ MemoryPlan                   │
//! │                                        │                          │
//! │                                        ▼                          │
//! │  protocol::record_slot ──▶ SlotScript (encoded by the backend)   │
//! │                                                                   │
//! │  Scheduler ──▶ SlotRing ──▶ SlotBackend (Vulkan or host)          │
//! │      │                                                            │
//! │      ├──▶ RecordTracker                                           │
//! │      └──▶ CheckpointWriter ──▶ checkpoint.json                    │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use hailstone_core::prelude::*;
//!
//! let dir = std::env::temp_dir().join("hailstone-doc");
//! std::fs::create_dir_all(&dir).unwrap();
//!
//! let limits = DeviceLimits::discrete(256 << 20, 256 << 20);
//! let plan = manage_memory(&limits, &PlanRequest::default()).unwrap();
//! let mut backend = HostBackend::new(plan.layout, plan.iter_size, plan.slot_count as usize);
//!
//! let options = SchedulerOptions {
//!     termination: Termination::Batches { limit: 4 },
//!     ..Default::default()
//! };
//! let report = Scheduler::new(
//!     &mut backend,
//!     plan.layout,
//!     plan.iter_size,
//!     &Checkpoint::fresh(),
//!     CheckpointWriter::inline(dir.join("checkpoint.json")),
//!     CancelToken::new(),
//!     options,
//! )
//! .submit_commands()
//! .unwrap();
//! assert_eq!(report.batches_retired, 4);
//! ```

pub mod checkpoint;
pub mod collatz;
pub mod config;
pub mod error;
pub mod host;
pub mod layout;
pub mod plan;
pub mod protocol;
pub mod record;
pub mod scheduler;
pub mod slot;
pub mod types;

pub use checkpoint::{Checkpoint, CheckpointWriter};
pub use config::{BackendKind, SearchConfig, Termination};
pub use error::{Error, IoKind, Result};
pub use host::HostBackend;
pub use layout::{BindingStyle, ElementLayout, ValueLayout};
pub use plan::{manage_memory, DeviceLimits, MemoryPlan, PlanRequest};
pub use record::{RecordState, RecordTracker};
pub use scheduler::{CancelToken, RunReport, Scheduler, SchedulerOptions, StopReason};
pub use slot::{SlotBackend, SlotRing, SlotState};
pub use types::{Batch, BatchCursor, StepCount, TestValue, MIN_TEST_VALUE, STEP_OVERFLOW};

/// Prelude for common imports.
pub mod prelude {
    pub use crate::checkpoint::{Checkpoint, CheckpointWriter};
    pub use crate::config::{SearchConfig, Termination};
    pub use crate::error::{Error, Result};
    pub use crate::host::HostBackend;
    pub use crate::layout::{BindingStyle, ElementLayout};
    pub use crate::plan::{manage_memory, DeviceLimits, MemoryPlan, PlanRequest};
    pub use crate::scheduler::{CancelToken, RunReport, Scheduler, SchedulerOptions};
    pub use crate::slot::SlotBackend;
}
