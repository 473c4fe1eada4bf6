//! Search domain types.

use crate::{Error, Result};

/// A candidate starting value. Only odd values are ever dispatched.
pub type TestValue = u128;

/// Number of Collatz iterations needed to reach 1.
pub type StepCount = u16;

/// First value of a fresh search.
pub const MIN_TEST_VALUE: TestValue = 3;

/// Sentinel written when a trajectory leaves 128-bit range or runs too long.
pub const STEP_OVERFLOW: StepCount = StepCount::MAX;

/// Largest step count representable without colliding with the sentinel.
pub const MAX_STEPS: StepCount = STEP_OVERFLOW - 1;

/// Distance between consecutive test values.
pub const VALUE_STRIDE: TestValue = 2;

/// A contiguous run of odd test values dispatched as one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Batch {
    /// Sequence number within the run.
    pub index: u64,
    /// First (odd) value.
    pub first: TestValue,
    /// Number of values.
    pub len: u32,
}

impl Batch {
    /// Returns the `i`-th value of the batch.
    #[inline]
    pub fn value(&self, i: u32) -> TestValue {
        self.first + VALUE_STRIDE * TestValue::from(i)
    }

    /// Iterates the batch's values in ascending order.
    pub fn values(&self) -> impl Iterator<Item = TestValue> + '_ {
        (0..self.len).map(move |i| self.value(i))
    }

    /// The first value after this batch.
    pub fn end(&self) -> TestValue {
        self.value(self.len)
    }

    /// Last value of the batch.
    pub fn last(&self) -> TestValue {
        self.value(self.len.saturating_sub(1))
    }
}

/// Hands out batches in strictly increasing order.
#[derive(Debug, Clone)]
pub struct BatchCursor {
    next: TestValue,
    iter_size: u32,
    issued: u64,
}

impl BatchCursor {
    /// Creates a cursor. Even starting values are rounded up to the next odd.
    pub fn new(start: TestValue, iter_size: u32) -> Self {
        let start = start.max(MIN_TEST_VALUE);
        let next = if start % 2 == 0 { start + 1 } else { start };
        Self {
            next,
            iter_size,
            issued: 0,
        }
    }

    /// The first value of the next batch to be issued.
    pub fn position(&self) -> TestValue {
        self.next
    }

    /// Number of batches issued so far.
    pub fn issued(&self) -> u64 {
        self.issued
    }

    /// The batch [`next_batch`](Self::next_batch) would issue.
    pub fn peek(&self) -> Result<Batch> {
        let span = VALUE_STRIDE * TestValue::from(self.iter_size);
        self.next
            .checked_add(span)
            .ok_or(Error::Exhausted(self.next))?;
        Ok(Batch {
            index: self.issued,
            first: self.next,
            len: self.iter_size,
        })
    }

    /// Issues the next batch.
    pub fn next_batch(&mut self) -> Result<Batch> {
        let batch = self.peek()?;
        self.next = batch.end();
        self.issued += 1;
        Ok(batch)
    }
}

/// Serializes 128-bit integers as decimal strings.
pub mod u128_string {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &u128, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u128, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        text.trim().parse::<u128>().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_sequence() {
        let mut cursor = BatchCursor::new(MIN_TEST_VALUE, 4);
        let a = cursor.next_batch().unwrap();
        let b = cursor.next_batch().unwrap();

        assert_eq!(a.values().collect::<Vec<_>>(), vec![3, 5, 7, 9]);
        assert_eq!(a.end(), b.first);
        assert_eq!(b.index, 1);
        assert_eq!(b.last(), 17);
        assert_eq!(cursor.position(), 19);
    }

    #[test]
    fn test_cursor_rounds_to_odd() {
        let cursor = BatchCursor::new(10, 8);
        assert_eq!(cursor.position(), 11);
        let cursor = BatchCursor::new(0, 8);
        assert_eq!(cursor.position(), MIN_TEST_VALUE);
    }

    #[test]
    fn test_cursor_exhaustion() {
        let mut cursor = BatchCursor::new(u128::MAX - 5, 4);
        assert!(matches!(cursor.next_batch(), Err(Error::Exhausted(_))));
    }
}
