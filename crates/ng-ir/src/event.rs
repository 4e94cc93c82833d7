//! Input events consumed by the conductor.

/// A channel-level MIDI event, already parsed from the transport layer.
///
/// Transport framing (running status, sysex, clock bytes) is out of scope;
/// the conductor receives decoded events and routes them to parts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MidiEvent {
    /// Key pressed.
    NoteOn { channel: u8, pitch: u8, velocity: u8 },
    /// Key released.
    NoteOff { channel: u8, pitch: u8 },
    /// Continuous controller change.
    ControlChange { channel: u8, controller: u8, value: u8 },
}

impl MidiEvent {
    /// The channel this event addresses.
    pub fn channel(&self) -> u8 {
        match *self {
            MidiEvent::NoteOn { channel, .. } => channel,
            MidiEvent::NoteOff { channel, .. } => channel,
            MidiEvent::ControlChange { channel, .. } => channel,
        }
    }
}
