//! Host reference for the step-count kernel.
//!
//! Shares the overflow contract of the compute shader: a trajectory that
//! leaves 128-bit range, or that needs more than [`MAX_STEPS`] iterations,
//! reports [`STEP_OVERFLOW`].

use crate::types::{StepCount, TestValue, MAX_STEPS, STEP_OVERFLOW};

/// Counts Collatz iterations until `n` reaches 1.
pub fn step_count(n: TestValue) -> StepCount {
    if n == 0 {
        return STEP_OVERFLOW;
    }

    let mut n = n;
    let mut steps: u32 = 0;
    while n != 1 {
        if n & 1 == 0 {
            let shift = n.trailing_zeros();
            n >>= shift;
            steps += shift;
        } else {
            n = match n.checked_mul(3).and_then(|m| m.checked_add(1)) {
                Some(next) => next,
                None => return STEP_OVERFLOW,
            };
            steps += 1;
        }
        if steps > u32::from(MAX_STEPS) {
            return STEP_OVERFLOW;
        }
    }
    steps as StepCount
}

/// Fills `out` with the step counts of `values`.
pub fn step_counts(values: impl IntoIterator<Item = TestValue>, out: &mut Vec<StepCount>) {
    out.clear();
    out.extend(values.into_iter().map(step_count));
}
