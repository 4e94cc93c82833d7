//! Sequencer/arpeggiator step contract.

use crate::held_keys::HeldKeys;

/// One step of generated material.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// Silence for this step.
    Rest,
    /// Keep the previous note sounding through this step.
    Tie,
    /// Play a note. `slid` requests a legato transition from the previous
    /// step's pitch.
    Note { pitch: u8, velocity: u8, slid: bool },
}

/// Produces the note stream for a part in arpeggiator or sequencer mode.
///
/// The generator is a pure function of the tick index, the arp-facing held
/// keys, and its own pattern state; the engine only consumes steps.
pub trait StepSource {
    /// Produce the step for `tick` and advance internal pattern state.
    fn next(&mut self, tick: u32, keys: &HeldKeys) -> Step;

    /// Inspect the step `next` would return without advancing state.
    fn peek(&self, tick: u32, keys: &HeldKeys) -> Step;
}
