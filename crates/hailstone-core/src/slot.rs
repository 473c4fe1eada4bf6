//! Slot lifecycle.
//!
//! A slot cycles `Idle → Filling → InFlight → Draining → Idle`. Each state
//! is a move-only token; only [`SlotRing`] mints them, and a backend can hand
//! out host views of slot memory only against the token of a state that
//! permits host access:
//!
//! - [`FillingSlot`] grants the input region,
//! - [`ReadySlot`] (a draining slot whose fence has signaled) grants the
//!   output region.
//!
//! In-flight and waiting slots carry no host view, so the host cannot touch
//! memory the GPU owns.

use std::collections::VecDeque;
use std::time::Duration;

use crate::types::Batch;
use crate::Result;

/// Observable slot state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Free for the next batch.
    Idle,
    /// Host is writing inputs.
    Filling,
    /// Upload and compute submitted.
    InFlight,
    /// Readback submitted; host waits on the fence.
    Draining,
}

macro_rules! slot_token {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug)]
        pub struct $name {
            id: usize,
            batch: Batch,
        }

        impl $name {
            /// Slot index.
            pub fn id(&self) -> usize {
                self.id
            }

            /// Batch owned by the slot.
            pub fn batch(&self) -> &Batch {
                &self.batch
            }
        }
    };
}

slot_token!(
    /// A slot whose input region the host may write.
    FillingSlot
);
slot_token!(
    /// A slot whose upload and compute work has been submitted.
    InFlightSlot
);
slot_token!(
    /// A slot whose readback has been submitted.
    DrainingSlot
);
slot_token!(
    /// A draining slot whose completion has been observed.
    ReadySlot
);

/// Executes slot command sequences.
///
/// Implementations own the slot buffers; the token arguments prove which
/// state the caller holds.
pub trait SlotBackend {
    /// Number of slots the backend was built with.
    fn slot_count(&self) -> usize;

    /// Host view of the slot's input region.
    fn input_mut(&mut self, slot: &FillingSlot) -> Result<&mut [u8]>;

    /// Submits the upload and compute sequences.
    fn submit_dispatch(&mut self, slot: &FillingSlot) -> Result<()>;

    /// Submits the readback sequence.
    fn submit_readback(&mut self, slot: &InFlightSlot) -> Result<()>;

    /// Waits up to `timeout` for the readback to finish. Returns `false` on
    /// timeout.
    fn wait(&mut self, slot: &DrainingSlot, timeout: Duration) -> Result<bool>;

    /// Host view of the slot's output region.
    fn output(&mut self, slot: &ReadySlot) -> Result<&[u8]>;

    /// Blocks until the device is idle.
    fn wait_idle(&mut self) -> Result<()>;
}

/// Tracks slot states and hands out tokens.
#[derive(Debug)]
pub struct SlotRing {
    states: Vec<SlotState>,
    idle: VecDeque<usize>,
    draining: VecDeque<DrainingSlot>,
}

impl SlotRing {
    /// Creates a ring of idle slots.
    pub fn new(slot_count: usize) -> Self {
        Self {
            states: vec![SlotState::Idle; slot_count],
            idle: (0..slot_count).collect(),
            draining: VecDeque::with_capacity(slot_count),
        }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Returns true if the ring has no slots.
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Current state of a slot.
    pub fn state(&self, id: usize) -> SlotState {
        self.states[id]
    }

    /// Slots waiting on the device.
    pub fn in_flight(&self) -> usize {
        self.draining.len()
    }

    /// Returns true if an idle slot is available.
    pub fn has_idle(&self) -> bool {
        !self.idle.is_empty()
    }

    /// Takes the next idle slot for `batch`.
    pub fn begin_fill(&mut self, batch: Batch) -> Option<FillingSlot> {
        let id = self.idle.pop_front()?;
        self.states[id] = SlotState::Filling;
        Some(FillingSlot { id, batch })
    }

    /// Submits upload and compute for a filled slot.
    pub fn submit<B: SlotBackend + ?Sized>(
        &mut self,
        slot: FillingSlot,
        backend: &mut B,
    ) -> Result<InFlightSlot> {
        backend.submit_dispatch(&slot)?;
        self.states[slot.id] = SlotState::InFlight;
        Ok(InFlightSlot {
            id: slot.id,
            batch: slot.batch,
        })
    }

    /// Submits readback and queues the slot for retirement.
    pub fn drain<B: SlotBackend + ?Sized>(
        &mut self,
        slot: InFlightSlot,
        backend: &mut B,
    ) -> Result<()> {
        backend.submit_readback(&slot)?;
        self.states[slot.id] = SlotState::Draining;
        self.draining.push_back(DrainingSlot {
            id: slot.id,
            batch: slot.batch,
        });
        Ok(())
    }

    /// Waits for the oldest draining slot.
    ///
    /// Returns `Ok(None)` when nothing is in flight. A wait that exceeds
    /// `timeout` keeps the slot queued and is reported as `Ok(Some(Err(id)))`.
    pub fn retire_next<B: SlotBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        timeout: Duration,
    ) -> Result<Option<std::result::Result<ReadySlot, usize>>> {
        let Some(oldest) = self.draining.front() else {
            return Ok(None);
        };
        if !backend.wait(oldest, timeout)? {
            return Ok(Some(Err(oldest.id)));
        }
        let Some(done) = self.draining.pop_front() else {
            return Ok(None);
        };
        Ok(Some(Ok(ReadySlot {
            id: done.id,
            batch: done.batch,
        })))
    }

    /// Returns a harvested slot to the idle pool.
    pub fn release(&mut self, slot: ReadySlot) {
        self.states[slot.id] = SlotState::Idle;
        self.idle.push_back(slot.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        buf: Vec<u8>,
        events: Vec<(&'static str, usize)>,
        pending_waits: usize,
    }

    impl SlotBackend for Recorder {
        fn slot_count(&self) -> usize {
            2
        }

        fn input_mut(&mut self, slot: &FillingSlot) -> Result<&mut [u8]> {
            self.events.push(("input", slot.id()));
            Ok(&mut self.buf)
        }

        fn submit_dispatch(&mut self, slot: &FillingSlot) -> Result<()> {
            self.events.push(("dispatch", slot.id()));
            Ok(())
        }

        fn submit_readback(&mut self, slot: &InFlightSlot) -> Result<()> {
            self.events.push(("readback", slot.id()));
            Ok(())
        }

        fn wait(&mut self, slot: &DrainingSlot, _timeout: Duration) -> Result<bool> {
            self.events.push(("wait", slot.id()));
            if self.pending_waits > 0 {
                self.pending_waits -= 1;
                return Ok(false);
            }
            Ok(true)
        }

        fn output(&mut self, slot: &ReadySlot) -> Result<&[u8]> {
            self.events.push(("output", slot.id()));
            Ok(&self.buf)
        }

        fn wait_idle(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn batch(index: u64) -> Batch {
        Batch {
            index,
            first: 3 + 8 * u128::from(index),
            len: 4,
        }
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut ring = SlotRing::new(2);
        let mut backend = Recorder::default();

        let filling = ring.begin_fill(batch(0)).unwrap();
        assert_eq!(ring.state(0), SlotState::Filling);

        let in_flight = ring.submit(filling, &mut backend).unwrap();
        assert_eq!(ring.state(0), SlotState::InFlight);

        ring.drain(in_flight, &mut backend).unwrap();
        assert_eq!(ring.state(0), SlotState::Draining);
        assert_eq!(ring.in_flight(), 1);

        let ready = ring
            .retire_next(&mut backend, Duration::from_millis(1))
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(ready.batch().index, 0);
        assert_eq!(ring.state(0), SlotState::Draining);

        ring.release(ready);
        assert_eq!(ring.state(0), SlotState::Idle);
    }

    #[test]
    fn test_retires_in_submission_order() {
        let mut ring = SlotRing::new(2);
        let mut backend = Recorder::default();

        for i in 0..2 {
            let filling = ring.begin_fill(batch(i)).unwrap();
            let in_flight = ring.submit(filling, &mut backend).unwrap();
            ring.drain(in_flight, &mut backend).unwrap();
        }
        assert!(ring.begin_fill(batch(2)).is_none());

        let first = ring
            .retire_next(&mut backend, Duration::ZERO)
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(first.id(), 0);
        ring.release(first);

        // Slot 0 comes back after slot 1 was queued.
        let filling = ring.begin_fill(batch(2)).unwrap();
        assert_eq!(filling.id(), 0);
    }

    #[test]
    fn test_wait_timeout_keeps_slot_queued() {
        let mut ring = SlotRing::new(2);
        let mut backend = Recorder {
            pending_waits: 1,
            ..Default::default()
        };

        let filling = ring.begin_fill(batch(0)).unwrap();
        let in_flight = ring.submit(filling, &mut backend).unwrap();
        ring.drain(in_flight, &mut backend).unwrap();

        let timed_out = ring.retire_next(&mut backend, Duration::ZERO).unwrap();
        assert!(matches!(timed_out, Some(Err(0))));
        assert_eq!(ring.in_flight(), 1);

        let ready = ring.retire_next(&mut backend, Duration::ZERO).unwrap();
        assert!(matches!(ready, Some(Ok(_))));
    }

    #[test]
    fn test_empty_ring_retires_nothing() {
        let mut ring = SlotRing::new(2);
        let mut backend = Recorder::default();
        assert!(ring
            .retire_next(&mut backend, Duration::ZERO)
            .unwrap()
            .is_none());
        assert!(backend.events.is_empty());
    }
}
