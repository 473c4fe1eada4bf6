//! Device tests. They need a Vulkan driver and are ignored by default:
//! `cargo test -p hailstone-vulkan -- --ignored`.

use std::time::Duration;

use hailstone_core::collatz;
use hailstone_core::prelude::*;
use hailstone_core::slot::SlotRing;
use hailstone_core::{Batch, BackendKind};
use hailstone_vulkan::GpuContext;
use tempfile::TempDir;

fn config(dir: &TempDir, layout: ElementLayout, binding: BindingStyle) -> SearchConfig {
    SearchConfig {
        memory_budget: 0.05,
        iter_size: 4096,
        element_layout: layout,
        binding_style: binding,
        termination: Termination::Batches { limit: 8 },
        checkpoint_path: dir.path().join("checkpoint.json"),
        pipeline_cache_path: Some(dir.path().join("pipeline.cache")),
        backend: BackendKind::Vulkan,
        max_slots: 4,
        ..Default::default()
    }
}

#[test]
#[ignore = "requires a Vulkan device"]
fn test_device_matches_host_reference() {
    let dir = TempDir::new().unwrap();
    for layout in [ElementLayout::Compact16, ElementLayout::Wide64] {
        for binding in [BindingStyle::Separate, BindingStyle::Combined] {
            let mut gpu = GpuContext::create(&config(&dir, layout, binding)).unwrap();
            let plan = gpu.plan().clone();
            let strategy = layout.strategy();
            let mut ring = SlotRing::new(gpu.slot_count());
            let batch = Batch {
                index: 0,
                first: 3,
                len: plan.iter_size,
            };

            let filling = ring.begin_fill(batch).unwrap();
            strategy.encode_inputs(&batch, gpu.input_mut(&filling).unwrap());
            let in_flight = ring.submit(filling, &mut gpu).unwrap();
            ring.drain(in_flight, &mut gpu).unwrap();
            let ready = ring
                .retire_next(&mut gpu, Duration::from_secs(10))
                .unwrap()
                .unwrap()
                .unwrap();

            let mut steps = Vec::new();
            strategy.decode_outputs(gpu.output(&ready).unwrap(), batch.len as usize, &mut steps);
            for (i, &s) in steps.iter().enumerate() {
                assert_eq!(s, collatz::step_count(batch.value(i as u32)), "{layout:?}/{binding:?} #{i}");
            }
            ring.release(ready);
            gpu.destroy_gpu().unwrap();
        }
    }
    assert!(dir.path().join("pipeline.cache").exists());
}

#[test]
#[ignore = "requires a Vulkan device"]
fn test_scheduler_runs_on_device() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, ElementLayout::Compact16, BindingStyle::Separate);
    let mut gpu = GpuContext::create(&config).unwrap();
    let plan = gpu.plan().clone();
    let mut options = SchedulerOptions::from(&config);
    options.validate_batches = 8;

    let report = Scheduler::new(
        &mut gpu,
        plan.layout,
        plan.iter_size,
        &Checkpoint::fresh(),
        CheckpointWriter::inline(&config.checkpoint_path),
        CancelToken::new(),
        options,
    )
    .submit_commands()
    .unwrap();

    assert_eq!(report.batches_retired, 8);
    assert_eq!(report.frontier, 3 + 2 * 8 * u128::from(plan.iter_size));
    let saved = Checkpoint::load(&config.checkpoint_path).unwrap();
    assert_eq!(saved.cursor, report.frontier);
}
