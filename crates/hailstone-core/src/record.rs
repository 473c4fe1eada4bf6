//! Record tracking.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{u128_string, Batch, StepCount, TestValue, STEP_OVERFLOW};

/// Best value found so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordState {
    /// Value with the highest step count.
    #[serde(with = "u128_string")]
    pub best_value: TestValue,
    /// Its step count.
    pub best_steps: StepCount,
}

impl Default for RecordState {
    fn default() -> Self {
        Self {
            best_value: 1,
            best_steps: 0,
        }
    }
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} steps)", self.best_value, self.best_steps)
    }
}

/// Outcome of scanning one batch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchScan {
    /// New record set by this batch, if any.
    pub record: Option<RecordState>,
    /// Values whose trajectories overflowed.
    pub overflows: Vec<TestValue>,
}

/// Compare-and-replace record tracker.
///
/// Only a strictly greater step count replaces the record, so among equal
/// step counts the earliest value wins.
#[derive(Debug, Clone)]
pub struct RecordTracker {
    current: RecordState,
    baseline: RecordState,
    history: Vec<RecordState>,
}

impl RecordTracker {
    /// Starts tracking from a known record.
    pub fn new(initial: RecordState) -> Self {
        Self {
            current: initial,
            baseline: initial,
            history: Vec::new(),
        }
    }

    /// Current record.
    pub fn current(&self) -> RecordState {
        self.current
    }

    /// Records found since tracking started, in discovery order.
    pub fn history(&self) -> &[RecordState] {
        &self.history
    }

    /// Returns true once a record above the starting one has been found.
    pub fn beat_baseline(&self) -> bool {
        self.current.best_steps > self.baseline.best_steps
    }

    /// Offers a single value.
    pub fn offer(&mut self, value: TestValue, steps: StepCount) -> bool {
        if steps == STEP_OVERFLOW || steps <= self.current.best_steps {
            return false;
        }
        self.current = RecordState {
            best_value: value,
            best_steps: steps,
        };
        self.history.push(self.current);
        true
    }

    /// Scans a batch's step counts in ascending value order.
    pub fn scan(&mut self, batch: &Batch, steps: &[StepCount]) -> BatchScan {
        let mut scan = BatchScan::default();
        for (value, &s) in batch.values().zip(steps) {
            if s == STEP_OVERFLOW {
                scan.overflows.push(value);
            } else if self.offer(value, s) {
                scan.record = Some(self.current);
            }
        }
        scan
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ties_keep_earlier_value() {
        let mut tracker = RecordTracker::new(RecordState::default());
        assert!(tracker.offer(7, 16));
        assert!(!tracker.offer(9, 16));
        assert_eq!(tracker.current().best_value, 7);
    }

    #[test]
    fn test_scan_skips_overflow() {
        let mut tracker = RecordTracker::new(RecordState::default());
        let batch = Batch {
            index: 0,
            first: 3,
            len: 4,
        };
        let scan = tracker.scan(&batch, &[7, STEP_OVERFLOW, 16, 3]);

        assert_eq!(scan.overflows, vec![5]);
        assert_eq!(
            scan.record,
            Some(RecordState {
                best_value: 7,
                best_steps: 16
            })
        );
        assert_eq!(tracker.history().len(), 2);
    }

    #[test]
    fn test_baseline_from_resume_is_not_new() {
        let resumed = RecordState {
            best_value: 27,
            best_steps: 111,
        };
        let mut tracker = RecordTracker::new(resumed);
        assert!(!tracker.beat_baseline());
        assert!(!tracker.offer(31, 106));
        assert!(!tracker.beat_baseline());
        assert!(tracker.offer(97, 118));
        assert!(tracker.beat_baseline());
    }

    #[test]
    fn test_record_serializes_value_as_string() {
        let record = RecordState {
            best_value: u128::MAX - 2,
            best_steps: 5,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"340282366920938463463374607431768211453\""));
        let back: RecordState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
