//! Element layouts and buffer binding styles.
//!
//! Every value is uploaded as four little-endian `u32` limbs (16 bytes).
//! The layouts differ in how step counts come back:
//!
//! ```text
//! Compact16: one u32 word per invocation, two step counts packed lo|hi
//!            ┌────────┬────────┐
//!            │ s[2i]  │ s[2i+1]│   2 bytes per value
//!            └────────┴────────┘
//! Wide64:    one vec2<u32> per invocation, step count in .x
//!            ┌────────────────┬────────────────┐
//!            │ s[i]           │ 0              │   8 bytes per value
//!            └────────────────┴────────────────┘
//! ```
//!
//! The layout is picked once from configuration and resolved to a
//! [`ValueLayout`] strategy used by both the planner and the scheduler.

use serde::{Deserialize, Serialize};

use crate::types::{Batch, StepCount};

/// Bytes used to upload one test value.
pub const INPUT_ELEMENT_BYTES: u64 = 16;

/// Output element layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementLayout {
    /// Packed 16-bit step counts.
    #[default]
    Compact16,
    /// One 64-bit slot per step count.
    Wide64,
}

impl ElementLayout {
    /// Resolves the layout strategy.
    pub fn strategy(self) -> &'static dyn ValueLayout {
        match self {
            ElementLayout::Compact16 => &Compact16,
            ElementLayout::Wide64 => &Wide64,
        }
    }
}

/// How a slot's input and output regions are exposed to the shader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingStyle {
    /// Separate input and output buffers.
    #[default]
    Separate,
    /// One buffer per slot, bound twice at aligned offsets.
    Combined,
}

/// Encoding strategy for one element layout.
pub trait ValueLayout: Send + Sync {
    /// Layout identifier.
    fn kind(&self) -> ElementLayout;

    /// Bytes of output per value.
    fn output_element_bytes(&self) -> u64;

    /// Values handled by one shader invocation.
    fn values_per_invocation(&self) -> u32;

    /// Writes the batch's values into an input region.
    fn encode_inputs(&self, batch: &Batch, input: &mut [u8]) {
        for (i, chunk) in input
            .chunks_exact_mut(INPUT_ELEMENT_BYTES as usize)
            .take(batch.len as usize)
            .enumerate()
        {
            chunk.copy_from_slice(&batch.value(i as u32).to_le_bytes());
        }
    }

    /// Reads `count` step counts from an output region.
    fn decode_outputs(&self, output: &[u8], count: usize, steps: &mut Vec<StepCount>);

    /// Writes step counts into an output region, as the shader would.
    fn encode_outputs(&self, steps: &[StepCount], output: &mut [u8]);
}

/// Decodes one uploaded value.
pub fn decode_input(input: &[u8], index: usize) -> u128 {
    let start = index * INPUT_ELEMENT_BYTES as usize;
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&input[start..start + INPUT_ELEMENT_BYTES as usize]);
    u128::from_le_bytes(bytes)
}

/// Packed 16-bit layout.
#[derive(Debug, Clone, Copy)]
pub struct Compact16;

impl ValueLayout for Compact16 {
    fn kind(&self) -> ElementLayout {
        ElementLayout::Compact16
    }

    fn output_element_bytes(&self) -> u64 {
        2
    }

    fn values_per_invocation(&self) -> u32 {
        2
    }

    fn decode_outputs(&self, output: &[u8], count: usize, steps: &mut Vec<StepCount>) {
        steps.clear();
        steps.extend(
            output
                .chunks_exact(2)
                .take(count)
                .map(|b| u16::from_le_bytes([b[0], b[1]])),
        );
    }

    fn encode_outputs(&self, steps: &[StepCount], output: &mut [u8]) {
        for (chunk, s) in output.chunks_exact_mut(2).zip(steps) {
            chunk.copy_from_slice(&s.to_le_bytes());
        }
    }
}

/// Wide 64-bit layout.
#[derive(Debug, Clone, Copy)]
pub struct Wide64;

impl ValueLayout for Wide64 {
    fn kind(&self) -> ElementLayout {
        ElementLayout::Wide64
    }

    fn output_element_bytes(&self) -> u64 {
        8
    }

    fn values_per_invocation(&self) -> u32 {
        1
    }

    fn decode_outputs(&self, output: &[u8], count: usize, steps: &mut Vec<StepCount>) {
        steps.clear();
        steps.extend(
            output
                .chunks_exact(8)
                .take(count)
                .map(|b| u16::from_le_bytes([b[0], b[1]])),
        );
    }

    fn encode_outputs(&self, steps: &[StepCount], output: &mut [u8]) {
        for (chunk, s) in output.chunks_exact_mut(8).zip(steps) {
            chunk.fill(0);
            chunk[..2].copy_from_slice(&s.to_le_bytes());
        }
    }
}
