//! Property-based tests for planning and the dispatch loop.
//!
//! These tests verify that search properties hold across a wide range of
//! device shapes and completion timings:
//! - Plans stay within budget and always provide at least two slots
//! - Every odd value is dispatched exactly once, in order, without gaps
//! - The host never touches a slot the device owns
//! - Records only grow, and a resumed run reproduces an uninterrupted one
//!
//! Run with: cargo test -p hailstone-core --test proptest_search

use std::collections::VecDeque;
use std::time::Duration;

use proptest::prelude::*;
use tempfile::tempdir;

use hailstone_core::collatz;
use hailstone_core::layout::decode_input;
use hailstone_core::slot::{DrainingSlot, FillingSlot, InFlightSlot, ReadySlot};
use hailstone_core::{
    manage_memory, BindingStyle, CancelToken, Checkpoint, CheckpointWriter, DeviceLimits,
    ElementLayout, Error, HostBackend, PlanRequest, RecordState, Result, Scheduler,
    SchedulerOptions, SlotBackend, Termination, MIN_TEST_VALUE,
};

/// Host backend that models device ownership and random completion delays.
struct OwnershipModel {
    inner: HostBackend,
    iter_size: usize,
    device_owned: Vec<bool>,
    delays: VecDeque<u8>,
    pending: Vec<u8>,
    violations: usize,
    dispatched: Vec<u128>,
}

impl OwnershipModel {
    fn new(layout: ElementLayout, iter_size: u32, slots: usize, delays: Vec<u8>) -> Self {
        Self {
            inner: HostBackend::new(layout, iter_size, slots),
            iter_size: iter_size as usize,
            device_owned: vec![false; slots],
            delays: delays.into(),
            pending: vec![0; slots],
            violations: 0,
            dispatched: Vec::new(),
        }
    }
}

impl SlotBackend for OwnershipModel {
    fn slot_count(&self) -> usize {
        self.inner.slot_count()
    }

    fn input_mut(&mut self, slot: &FillingSlot) -> Result<&mut [u8]> {
        if self.device_owned[slot.id()] {
            self.violations += 1;
        }
        self.inner.input_mut(slot)
    }

    fn submit_dispatch(&mut self, slot: &FillingSlot) -> Result<()> {
        self.device_owned[slot.id()] = true;
        let input = self.inner.input(slot.id());
        for i in 0..self.iter_size {
            self.dispatched.push(decode_input(input, i));
        }
        self.inner.submit_dispatch(slot)
    }

    fn submit_readback(&mut self, slot: &InFlightSlot) -> Result<()> {
        let delay = self.delays.pop_front().unwrap_or(0);
        self.delays.push_back(delay);
        self.pending[slot.id()] = delay;
        self.inner.submit_readback(slot)
    }

    fn wait(&mut self, slot: &DrainingSlot, timeout: Duration) -> Result<bool> {
        let id = slot.id();
        if self.pending[id] > 0 {
            self.pending[id] -= 1;
            return Ok(false);
        }
        self.device_owned[id] = false;
        self.inner.wait(slot, timeout)
    }

    fn output(&mut self, slot: &ReadySlot) -> Result<&[u8]> {
        if self.device_owned[slot.id()] {
            self.violations += 1;
        }
        self.inner.output(slot)
    }

    fn wait_idle(&mut self) -> Result<()> {
        Ok(())
    }
}

fn options(termination: Termination, checkpoint_interval: u64) -> SchedulerOptions {
    SchedulerOptions {
        termination,
        checkpoint_interval,
        checkpoint_period: Duration::from_secs(3600),
        validate_batches: 1,
        wait_timeout: Duration::ZERO,
    }
}

fn run(
    backend: &mut dyn SlotBackend,
    layout: ElementLayout,
    iter_size: u32,
    checkpoint: &Checkpoint,
    path: &std::path::Path,
    termination: Termination,
) -> hailstone_core::RunReport {
    Scheduler::new(
        backend,
        layout,
        iter_size,
        checkpoint,
        CheckpointWriter::inline(path),
        CancelToken::new(),
        options(termination, 3),
    )
    .submit_commands()
    .unwrap()
}

/// Strategy for heap sizes between 64 KiB and 1 GiB.
fn heap_strategy() -> impl Strategy<Value = u64> {
    (16u32..30).prop_map(|shift| 1u64 << shift)
}

/// Strategy for element layouts.
fn layout_strategy() -> impl Strategy<Value = ElementLayout> {
    prop_oneof![Just(ElementLayout::Compact16), Just(ElementLayout::Wide64)]
}

/// Strategy for binding styles.
fn binding_strategy() -> impl Strategy<Value = BindingStyle> {
    prop_oneof![Just(BindingStyle::Separate), Just(BindingStyle::Combined)]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        max_shrink_iters: 100,
        ..ProptestConfig::default()
    })]

    /// Property: a successful plan respects the budget on every heap.
    #[test]
    fn prop_plan_within_budget(
        device_heap in heap_strategy(),
        host_heap in heap_strategy(),
        unified in any::<bool>(),
        budget in 0.05f64..=1.0,
        half_iter in 1u32..2048,
        max_slots in 2u32..64,
        layout in layout_strategy(),
        binding_style in binding_strategy(),
    ) {
        let limits = if unified {
            DeviceLimits::unified(device_heap)
        } else {
            DeviceLimits::discrete(device_heap, host_heap)
        };
        let request = PlanRequest {
            budget_fraction: budget,
            iter_size: half_iter * 2,
            layout,
            binding_style,
            max_slots,
            preferred_workgroup_size: 64,
        };

        match manage_memory(&limits, &request) {
            Ok(plan) => {
                prop_assert!(plan.slot_count >= 2);
                prop_assert!(plan.slot_count <= max_slots);
                prop_assert_eq!(plan.iter_size, request.iter_size);

                let used = plan.bytes_per_batch * u64::from(plan.slot_count);
                prop_assert!(used as f64 <= budget * plan.device.heap_size as f64);
                prop_assert!(used as f64 <= budget * plan.host.heap_size as f64);
                if plan.shared_heap {
                    prop_assert!(2 * plan.side_bytes() <= plan.device.budget);
                } else {
                    prop_assert!(plan.side_bytes() <= plan.device.budget);
                    prop_assert!(plan.side_bytes() <= plan.host.budget);
                }

                prop_assert_eq!(plan.output_offset % plan.alignment, 0);
                prop_assert_eq!(plan.slot_stride % plan.alignment, 0);
                prop_assert!(plan.workgroup_size.is_power_of_two());
                prop_assert!(plan.workgroup_size * plan.workgroup_count >= plan.invocations);
            }
            Err(Error::InsufficientSlots { available }) => {
                prop_assert!(available < 2);
            }
            Err(other) => {
                prop_assert!(false, "unexpected error: {}", other);
            }
        }
    }

    /// Property: every odd value is dispatched exactly once, in order, and
    /// the device-owned slots are never touched by the host.
    #[test]
    fn prop_coverage_and_exclusivity(
        slots in 2usize..6,
        half_iter in 1u32..8,
        batches in 1u64..24,
        delays in prop::collection::vec(0u8..4, 1..8),
        layout in layout_strategy(),
    ) {
        let iter_size = half_iter * 2;
        let dir = tempdir().unwrap();
        let mut model = OwnershipModel::new(layout, iter_size, slots, delays);

        let report = run(
            &mut model,
            layout,
            iter_size,
            &Checkpoint::fresh(),
            &dir.path().join("cp.json"),
            Termination::Batches { limit: batches },
        );

        prop_assert_eq!(model.violations, 0);
        prop_assert_eq!(report.batches_retired, batches);

        let expected: Vec<u128> = (0..batches * u64::from(iter_size))
            .map(|i| MIN_TEST_VALUE + 2 * u128::from(i))
            .collect();
        prop_assert_eq!(&model.dispatched, &expected);
        prop_assert_eq!(report.frontier, MIN_TEST_VALUE + 2 * expected.len() as u128);
    }

    /// Property: records are strictly increasing in step count and each was
    /// found at a lower value than the next.
    #[test]
    fn prop_records_monotone(batches in 1u64..40, half_iter in 1u32..16) {
        let iter_size = half_iter * 2;
        let dir = tempdir().unwrap();
        let mut backend = HostBackend::new(ElementLayout::Compact16, iter_size, 3);
        let report = run(
            &mut backend,
            ElementLayout::Compact16,
            iter_size,
            &Checkpoint::fresh(),
            &dir.path().join("cp.json"),
            Termination::Batches { limit: batches },
        );

        for pair in report.records.windows(2) {
            prop_assert!(pair[0].best_steps < pair[1].best_steps);
            prop_assert!(pair[0].best_value < pair[1].best_value);
        }
        if let Some(last) = report.records.last() {
            prop_assert_eq!(*last, report.best);
        }
    }

    /// Property: stopping and resuming from the checkpoint reproduces the
    /// record trajectory of an uninterrupted run.
    #[test]
    fn prop_resume_is_idempotent(first in 1u64..12, second in 1u64..12) {
        let iter_size = 8;
        let dir = tempdir().unwrap();
        let path = dir.path().join("cp.json");

        let mut straight = HostBackend::new(ElementLayout::Compact16, iter_size, 2);
        let full = run(
            &mut straight,
            ElementLayout::Compact16,
            iter_size,
            &Checkpoint::fresh(),
            &dir.path().join("straight.json"),
            Termination::Batches { limit: first + second },
        );

        let mut backend = HostBackend::new(ElementLayout::Compact16, iter_size, 2);
        let a = run(
            &mut backend,
            ElementLayout::Compact16,
            iter_size,
            &Checkpoint::fresh(),
            &path,
            Termination::Batches { limit: first },
        );
        let resumed = Checkpoint::load_or_fresh(&path, false);
        prop_assert_eq!(resumed.cursor, a.frontier);
        prop_assert_eq!(resumed.batches_retired, first);

        let b = run(
            &mut backend,
            ElementLayout::Compact16,
            iter_size,
            &resumed,
            &path,
            Termination::Batches { limit: second },
        );

        let mut trajectory: Vec<RecordState> = a.records.clone();
        trajectory.extend(b.records.iter().copied());
        prop_assert_eq!(trajectory, full.records);
        prop_assert_eq!(b.best, full.best);
        prop_assert_eq!(b.frontier, full.frontier);
    }
}

#[test]
fn new_record_mode_ignores_resumed_record() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cp.json");

    // 27 holds the record (111 steps) below 29.
    let expected = (29u128..)
        .step_by(2)
        .map(|v| (v, collatz::step_count(v)))
        .find(|&(_, steps)| steps > 111)
        .map(|(best_value, best_steps)| RecordState {
            best_value,
            best_steps,
        })
        .unwrap();
    let resumed = Checkpoint::at(
        29,
        RecordState {
            best_value: 27,
            best_steps: 111,
        },
        0,
    );
    let mut backend = HostBackend::new(ElementLayout::Compact16, 4, 2);
    let report = run(
        &mut backend,
        ElementLayout::Compact16,
        4,
        &resumed,
        &path,
        Termination::NewRecord,
    );

    assert_eq!(report.stop_reason, hailstone_core::StopReason::NewRecord);
    // The resumed record is the baseline, never a find of this run.
    assert_eq!(report.records[0], expected);
    assert!(report.records.iter().all(|r| r.best_steps > 111));
    let saved = Checkpoint::load(&path).unwrap();
    assert!(saved.record.best_steps >= expected.best_steps);
    assert!(saved.cursor > expected.best_value);
}

#[test]
fn reference_scenario_first_batch() {
    let limits = DeviceLimits::discrete(256 << 20, 256 << 20);
    let plan = manage_memory(&limits, &PlanRequest::default()).unwrap();
    assert!(plan.slot_count >= 2);

    let dir = tempdir().unwrap();
    let mut model = OwnershipModel::new(plan.layout, plan.iter_size, plan.slot_count as usize, vec![1]);
    let report = run(
        &mut model,
        plan.layout,
        plan.iter_size,
        &Checkpoint::fresh(),
        &dir.path().join("cp.json"),
        Termination::Batches { limit: 1 },
    );

    assert_eq!(model.dispatched.len(), 128);
    assert_eq!(model.dispatched[0], 3);
    assert_eq!(report.values_tested, 128);
    assert_eq!(report.records[0], RecordState { best_value: 3, best_steps: 7 });
}
