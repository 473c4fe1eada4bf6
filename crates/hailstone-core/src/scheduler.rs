//! Dispatch scheduler.
//!
//! Keeps every slot busy: idle slots are filled with the next batch and
//! submitted, the oldest draining slot is waited on and harvested, records
//! and checkpoints are updated, and termination is decided once per retired
//! batch.
//!
//! ```text
//!   cursor ──▶ Idle ──fill──▶ Filling ──submit──▶ InFlight ──drain──▶ Draining
//!               ▲                                                      │
//!               └──────────── harvest (record, checkpoint) ◀── wait ───┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{Checkpoint, CheckpointWriter};
use crate::collatz;
use crate::config::{SearchConfig, Termination};
use crate::layout::{ElementLayout, ValueLayout};
use crate::record::{RecordState, RecordTracker};
use crate::slot::{ReadySlot, SlotBackend, SlotRing};
use crate::types::{u128_string, BatchCursor, StepCount, TestValue};
use crate::{Error, Result};

/// Cooperative cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates an unset token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns true once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub termination: Termination,
    /// Retired batches between checkpoints.
    pub checkpoint_interval: u64,
    /// Time between checkpoints.
    pub checkpoint_period: Duration,
    /// Leading batches cross-checked on the host.
    pub validate_batches: u64,
    /// Per-wait timeout before a stall is logged.
    pub wait_timeout: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self::from(&SearchConfig::default())
    }
}

impl From<&SearchConfig> for SchedulerOptions {
    fn from(config: &SearchConfig) -> Self {
        Self {
            termination: config.termination,
            checkpoint_interval: config.checkpoint_interval,
            checkpoint_period: config.checkpoint_period(),
            validate_batches: config.validate_batches,
            wait_timeout: config.wait_timeout(),
        }
    }
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Cancellation was requested.
    Interrupted,
    /// The configured batch count was retired.
    BatchLimit,
    /// A record above the starting one was found.
    NewRecord,
    /// The cursor reached the end of 128-bit range.
    Exhausted,
}

/// Summary of a completed run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// First value of this run.
    #[serde(with = "u128_string")]
    pub start: TestValue,
    /// First value not yet retired.
    #[serde(with = "u128_string")]
    pub frontier: TestValue,
    /// Batches retired in this run.
    pub batches_retired: u64,
    /// Values checked in this run.
    pub values_tested: u64,
    /// Records found in this run, in discovery order.
    pub records: Vec<RecordState>,
    /// Record at the end of the run.
    pub best: RecordState,
    /// Values whose trajectories overflowed.
    pub overflows: u64,
    /// Why the run ended.
    pub stop_reason: StopReason,
    /// Wall-clock duration.
    pub elapsed_seconds: f64,
    /// Throughput.
    pub values_per_second: f64,
    /// Checkpoints that reached the disk, including the final one.
    pub checkpoints_written: u64,
}

/// Drives slots through the dispatch loop.
pub struct Scheduler<'a, B: SlotBackend + ?Sized> {
    backend: &'a mut B,
    layout: &'static dyn ValueLayout,
    options: SchedulerOptions,
    ring: SlotRing,
    cursor: BatchCursor,
    start: TestValue,
    frontier: TestValue,
    tracker: RecordTracker,
    writer: Option<CheckpointWriter>,
    cancel: CancelToken,
    batches_before: u64,
    submitted: u64,
    retired: u64,
    values_tested: u64,
    overflows: u64,
    scratch: Vec<StepCount>,
}

impl<'a, B: SlotBackend + ?Sized> Scheduler<'a, B> {
    /// Creates a scheduler resuming from `checkpoint`.
    pub fn new(
        backend: &'a mut B,
        layout: ElementLayout,
        iter_size: u32,
        checkpoint: &Checkpoint,
        writer: CheckpointWriter,
        cancel: CancelToken,
        options: SchedulerOptions,
    ) -> Self {
        let ring = SlotRing::new(backend.slot_count());
        let cursor = BatchCursor::new(checkpoint.cursor, iter_size);
        let start = cursor.position();
        Self {
            backend,
            layout: layout.strategy(),
            options,
            ring,
            cursor,
            start,
            frontier: start,
            tracker: RecordTracker::new(checkpoint.record),
            writer: Some(writer),
            cancel,
            batches_before: checkpoint.batches_retired,
            submitted: 0,
            retired: 0,
            values_tested: 0,
            overflows: 0,
            scratch: Vec::with_capacity(iter_size as usize),
        }
    }

    /// Runs the dispatch loop until termination.
    ///
    /// On success the final checkpoint is written after all in-flight work
    /// has drained. On failure a best-effort checkpoint of the retired
    /// frontier is written before the error propagates.
    pub fn submit_commands(mut self) -> Result<RunReport> {
        let started = Instant::now();
        info!(
            start = %self.start,
            slots = self.ring.len(),
            record = %self.tracker.current(),
            "search starting"
        );

        let outcome = self.run_loop();
        let checkpoint = self.checkpoint();
        let mut checkpoints_written = 0;
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.finish(&checkpoint) {
                warn!(error = %e, "final checkpoint failed");
            }
            checkpoints_written = writer.written();
        }

        let stop_reason = match outcome {
            Ok(reason) => reason,
            Err(e) => {
                error!(error = %e, frontier = %self.frontier, "search aborted");
                return Err(e);
            }
        };

        let elapsed = started.elapsed().as_secs_f64();
        let report = RunReport {
            start: self.start,
            frontier: self.frontier,
            batches_retired: self.retired,
            values_tested: self.values_tested,
            records: self.tracker.history().to_vec(),
            best: self.tracker.current(),
            overflows: self.overflows,
            stop_reason,
            elapsed_seconds: elapsed,
            values_per_second: if elapsed > 0.0 {
                self.values_tested as f64 / elapsed
            } else {
                0.0
            },
            checkpoints_written,
        };
        info!(
            reason = ?report.stop_reason,
            frontier = %report.frontier,
            batches = report.batches_retired,
            best = %report.best,
            "search finished"
        );
        Ok(report)
    }

    fn run_loop(&mut self) -> Result<StopReason> {
        let mut stopping: Option<StopReason> = None;
        let mut since_checkpoint = 0u64;
        let mut last_checkpoint = Instant::now();
        let mut last_progress = (Instant::now(), 0u64);

        loop {
            while stopping.is_none() && self.ring.has_idle() && self.may_submit() {
                let batch = match self.cursor.peek() {
                    Ok(batch) => batch,
                    Err(Error::Exhausted(at)) => {
                        warn!(cursor = %at, "search space exhausted");
                        stopping = Some(StopReason::Exhausted);
                        break;
                    }
                    Err(e) => return Err(e),
                };
                let Some(filling) = self.ring.begin_fill(batch) else {
                    break;
                };
                self.cursor.next_batch()?;

                let input = self.backend.input_mut(&filling)?;
                self.layout.encode_inputs(filling.batch(), input);
                let in_flight = self.ring.submit(filling, &mut *self.backend)?;
                self.ring.drain(in_flight, &mut *self.backend)?;
                self.submitted += 1;
            }

            let ready = match self
                .ring
                .retire_next(&mut *self.backend, self.options.wait_timeout)?
            {
                None => break,
                Some(Err(slot)) => {
                    warn!(
                        slot,
                        timeout_ms = self.options.wait_timeout.as_millis() as u64,
                        "slot still in flight"
                    );
                    continue;
                }
                Some(Ok(ready)) => ready,
            };
            self.harvest(&ready)?;
            self.ring.release(ready);

            since_checkpoint += 1;
            if since_checkpoint >= self.options.checkpoint_interval
                || last_checkpoint.elapsed() >= self.options.checkpoint_period
            {
                let checkpoint = self.checkpoint();
                if let Some(writer) = self.writer.as_mut() {
                    writer.request(checkpoint);
                }
                self.log_progress(&mut last_progress);
                since_checkpoint = 0;
                last_checkpoint = Instant::now();
            }

            if stopping.is_none() {
                stopping = self.termination_reason();
                if let Some(reason) = stopping {
                    info!(
                        ?reason,
                        in_flight = self.ring.in_flight(),
                        "stopping, draining in-flight slots"
                    );
                }
            }
        }

        Ok(stopping.unwrap_or(StopReason::BatchLimit))
    }

    fn may_submit(&self) -> bool {
        match self.options.termination {
            Termination::Batches { limit } => self.submitted < limit,
            Termination::Unbounded | Termination::NewRecord => true,
        }
    }

    fn termination_reason(&self) -> Option<StopReason> {
        if self.cancel.is_cancelled() {
            return Some(StopReason::Interrupted);
        }
        match self.options.termination {
            Termination::Batches { limit } if self.retired >= limit => Some(StopReason::BatchLimit),
            Termination::NewRecord if self.tracker.beat_baseline() => Some(StopReason::NewRecord),
            _ => None,
        }
    }

    fn harvest(&mut self, ready: &ReadySlot) -> Result<()> {
        let batch = *ready.batch();
        let output = self.backend.output(ready)?;
        self.layout
            .decode_outputs(output, batch.len as usize, &mut self.scratch);
        if self.scratch.len() != batch.len as usize {
            return Err(Error::device(format!(
                "slot {} returned {} step counts for {} values",
                ready.id(),
                self.scratch.len(),
                batch.len
            )));
        }

        if self.retired < self.options.validate_batches {
            for (value, &device) in batch.values().zip(&self.scratch) {
                let host = collatz::step_count(value);
                if host != device {
                    return Err(Error::Validation {
                        value,
                        device,
                        host,
                    });
                }
            }
            debug!(batch = batch.index, "batch matches host reference");
        }

        let scan = self.tracker.scan(&batch, &self.scratch);
        for value in &scan.overflows {
            warn!(value = %value, "trajectory overflowed, value excluded from records");
        }
        self.overflows += scan.overflows.len() as u64;
        if let Some(record) = scan.record {
            info!(value = %record.best_value, steps = record.best_steps, "new record");
        }

        self.frontier = batch.end();
        self.retired += 1;
        self.values_tested += u64::from(batch.len);
        Ok(())
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint::at(
            self.frontier,
            self.tracker.current(),
            self.batches_before + self.retired,
        )
    }

    fn log_progress(&self, last: &mut (Instant, u64)) {
        let elapsed = last.0.elapsed().as_secs_f64();
        let values = self.values_tested - last.1;
        let rate = if elapsed > 0.0 {
            values as f64 / elapsed
        } else {
            0.0
        };
        info!(
            frontier = %self.frontier,
            retired = self.retired,
            values_per_second = rate as u64,
            record = %self.tracker.current(),
            "progress"
        );
        *last = (Instant::now(), self.values_tested);
    }
}
