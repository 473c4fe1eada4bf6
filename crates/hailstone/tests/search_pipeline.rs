//! End-to-end runs on the host backend.

use hailstone::{run_search, BackendKind, CancelToken, Checkpoint, SearchConfig, Termination};
use hailstone_core::collatz;
use hailstone_core::StopReason;
use tempfile::TempDir;

fn host_config(dir: &TempDir, termination: Termination) -> SearchConfig {
    SearchConfig {
        backend: BackendKind::Host,
        iter_size: 128,
        max_slots: 4,
        termination,
        checkpoint_path: dir.path().join("checkpoint.json"),
        pipeline_cache_path: None,
        validate_batches: 2,
        ..Default::default()
    }
}

/// Best (value, steps) among odd values in `[from, to)`, earliest on ties.
fn best_in(from: u128, to: u128) -> (u128, u16) {
    (from..to)
        .step_by(2)
        .map(|n| (n, collatz::step_count(n)))
        .fold((1, 0), |best, cur| if cur.1 > best.1 { cur } else { best })
}

#[test]
fn test_batch_limited_run_checkpoints_frontier() {
    let dir = TempDir::new().unwrap();
    let config = host_config(&dir, Termination::Batches { limit: 5 });

    let outcome = run_search(&config, CancelToken::new()).unwrap();
    let report = &outcome.report;
    assert_eq!(outcome.device, "host");
    assert_eq!(report.stop_reason, StopReason::BatchLimit);
    assert_eq!(report.batches_retired, 5);
    assert_eq!(report.values_tested, 5 * 128);
    assert_eq!(report.frontier, 3 + 2 * 5 * 128);

    let (value, steps) = best_in(3, report.frontier);
    assert_eq!(report.best.best_value, value);
    assert_eq!(report.best.best_steps, steps);

    let saved = Checkpoint::load(&config.checkpoint_path).unwrap();
    assert_eq!(saved.cursor, report.frontier);
    assert_eq!(saved.record, report.best);
    assert_eq!(saved.batches_retired, 5);
}

#[test]
fn test_resume_continues_where_the_last_run_stopped() {
    let dir = TempDir::new().unwrap();
    let config = host_config(&dir, Termination::Batches { limit: 3 });

    let first = run_search(&config, CancelToken::new()).unwrap().report;
    let second = run_search(&config, CancelToken::new()).unwrap().report;

    assert_eq!(second.start, first.frontier);
    assert_eq!(second.frontier, 3 + 2 * 6 * 128);
    let (value, steps) = best_in(3, second.frontier);
    assert_eq!(second.best.best_value, value);
    assert_eq!(second.best.best_steps, steps);

    let saved = Checkpoint::load(&config.checkpoint_path).unwrap();
    assert_eq!(saved.batches_retired, 6);
}

#[test]
fn test_restart_ignores_existing_checkpoint() {
    let dir = TempDir::new().unwrap();
    let mut config = host_config(&dir, Termination::Batches { limit: 2 });
    run_search(&config, CancelToken::new()).unwrap();

    config.restart = true;
    let report = run_search(&config, CancelToken::new()).unwrap().report;
    assert_eq!(report.start, 3);
    assert_eq!(report.frontier, 3 + 2 * 2 * 128);
}

#[test]
fn test_new_record_mode_stops_after_beating_resumed_record() {
    let dir = TempDir::new().unwrap();
    let mut config = host_config(&dir, Termination::Batches { limit: 1 });
    let baseline = run_search(&config, CancelToken::new()).unwrap().report;

    config.termination = Termination::NewRecord;
    let report = run_search(&config, CancelToken::new()).unwrap().report;
    assert_eq!(report.stop_reason, StopReason::NewRecord);
    assert!(report.best.best_steps > baseline.best.best_steps);

    // The first find is the first value past the old frontier that beats it;
    // slots still in flight may improve on it while draining.
    let expected = (baseline.frontier..)
        .step_by(2)
        .find(|&n| collatz::step_count(n) > baseline.best.best_steps)
        .unwrap();
    assert_eq!(report.records.first().map(|r| r.best_value), Some(expected));
    assert!(report.best.best_steps >= collatz::step_count(expected));
}

#[test]
fn test_cancelled_run_still_checkpoints() {
    let dir = TempDir::new().unwrap();
    let config = host_config(&dir, Termination::Unbounded);
    let cancel = CancelToken::new();
    cancel.cancel();

    let report = run_search(&config, cancel).unwrap().report;
    assert_eq!(report.stop_reason, StopReason::Interrupted);
    let saved = Checkpoint::load(&config.checkpoint_path).unwrap();
    assert_eq!(saved.cursor, report.frontier);
}

#[test]
fn test_corrupt_checkpoint_starts_fresh() {
    let dir = TempDir::new().unwrap();
    let config = host_config(&dir, Termination::Batches { limit: 1 });
    std::fs::write(&config.checkpoint_path, b"{ not json").unwrap();

    let report = run_search(&config, CancelToken::new()).unwrap().report;
    assert_eq!(report.start, 3);
}

#[test]
fn test_report_serializes_wide_values_as_strings() {
    let dir = TempDir::new().unwrap();
    let config = host_config(&dir, Termination::Batches { limit: 1 });
    let outcome = run_search(&config, CancelToken::new()).unwrap();

    let json: serde_json::Value = serde_json::to_value(&outcome).unwrap();
    assert_eq!(json["backend"], "host");
    assert_eq!(json["frontier"], (3 + 2 * 128).to_string());
    assert_eq!(json["stop_reason"], "batch_limit");
}
