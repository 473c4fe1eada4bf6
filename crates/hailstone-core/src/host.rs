//! CPU slot backend.
//!
//! Mirrors the device contract on the host: each slot owns a staging input,
//! a working output and a staging output region; dispatch computes step
//! counts in parallel with rayon, readback copies the working output into
//! staging. Used when no GPU is wanted and by tests.

use std::time::Duration;

use rayon::prelude::*;

use crate::collatz;
use crate::layout::{decode_input, ElementLayout, ValueLayout, INPUT_ELEMENT_BYTES};
use crate::slot::{DrainingSlot, FillingSlot, InFlightSlot, ReadySlot, SlotBackend};
use crate::types::StepCount;
use crate::{Error, Result};

struct HostSlot {
    input: Vec<u8>,
    working: Vec<u8>,
    output: Vec<u8>,
    done: bool,
}

/// Slot backend running the reference kernel on the CPU.
pub struct HostBackend {
    layout: &'static dyn ValueLayout,
    iter_size: usize,
    slots: Vec<HostSlot>,
    steps: Vec<StepCount>,
}

impl HostBackend {
    /// Creates a backend with `slot_count` slots of `iter_size` values.
    pub fn new(layout: ElementLayout, iter_size: u32, slot_count: usize) -> Self {
        let layout = layout.strategy();
        let iter_size = iter_size as usize;
        let input_bytes = iter_size * INPUT_ELEMENT_BYTES as usize;
        let output_bytes = iter_size * layout.output_element_bytes() as usize;
        let slots = (0..slot_count)
            .map(|_| HostSlot {
                input: vec![0; input_bytes],
                working: vec![0; output_bytes],
                output: vec![0; output_bytes],
                done: false,
            })
            .collect();
        Self {
            layout,
            iter_size,
            slots,
            steps: Vec::with_capacity(iter_size),
        }
    }

    /// Staging input of a slot as last written.
    pub fn input(&self, slot: usize) -> &[u8] {
        &self.slots[slot].input
    }

    #[cfg(test)]
    pub(crate) fn output_mut(&mut self, slot: usize) -> &mut [u8] {
        &mut self.slots[slot].output
    }

    fn slot(&mut self, id: usize) -> Result<&mut HostSlot> {
        self.slots
            .get_mut(id)
            .ok_or_else(|| Error::device(format!("slot {} out of range", id)))
    }
}

impl SlotBackend for HostBackend {
    fn slot_count(&self) -> usize {
        self.slots.len()
    }

    fn input_mut(&mut self, slot: &FillingSlot) -> Result<&mut [u8]> {
        let entry = self.slot(slot.id())?;
        entry.done = false;
        Ok(&mut entry.input)
    }

    fn submit_dispatch(&mut self, slot: &FillingSlot) -> Result<()> {
        let count = (slot.batch().len as usize).min(self.iter_size);
        let layout = self.layout;
        let mut steps = std::mem::take(&mut self.steps);
        let entry = self.slot(slot.id())?;

        let input = &entry.input;
        (0..count)
            .into_par_iter()
            .map(|i| collatz::step_count(decode_input(input, i)))
            .collect_into_vec(&mut steps);
        layout.encode_outputs(&steps, &mut entry.working);

        self.steps = steps;
        Ok(())
    }

    fn submit_readback(&mut self, slot: &InFlightSlot) -> Result<()> {
        let entry = self.slot(slot.id())?;
        entry.output.copy_from_slice(&entry.working);
        entry.done = true;
        Ok(())
    }

    fn wait(&mut self, slot: &DrainingSlot, _timeout: Duration) -> Result<bool> {
        let id = slot.id();
        let entry = self.slot(id)?;
        if !entry.done {
            return Err(Error::wait(id, "readback was never submitted"));
        }
        Ok(true)
    }

    fn output(&mut self, slot: &ReadySlot) -> Result<&[u8]> {
        let entry = self.slot(slot.id())?;
        Ok(&entry.output)
    }

    fn wait_idle(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::SlotRing;
    use crate::types::Batch;

    #[test]
    fn test_dispatch_computes_reference_steps() {
        let mut backend = HostBackend::new(ElementLayout::Compact16, 128, 2);
        let mut ring = SlotRing::new(2);
        let layout = ElementLayout::Compact16.strategy();
        let batch = Batch {
            index: 0,
            first: 3,
            len: 128,
        };

        let filling = ring.begin_fill(batch).unwrap();
        layout.encode_inputs(&batch, backend.input_mut(&filling).unwrap());
        let in_flight = ring.submit(filling, &mut backend).unwrap();
        ring.drain(in_flight, &mut backend).unwrap();
        let ready = ring
            .retire_next(&mut backend, Duration::ZERO)
            .unwrap()
            .unwrap()
            .unwrap();

        let mut steps = Vec::new();
        layout.decode_outputs(backend.output(&ready).unwrap(), 128, &mut steps);
        assert_eq!(steps.len(), 128);
        assert_eq!(steps[0], 7);
        assert_eq!(steps[2], 16); // 7
        assert_eq!(steps[12], 111); // 27
    }
}
