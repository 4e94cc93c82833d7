//! Note entry type shared by the containers and the engine.

/// Middle C.
pub const C4: u8 = 60;

/// Highest valid MIDI note number.
pub const MIDI_NOTE_MAX: u8 = 127;

/// Top bit of a stored velocity marks the note as sustained: the key has
/// been released but the sustain logic is keeping it sounding.
pub const SUSTAIN_FLAG: u8 = 0x80;

/// A held note as stored in a [`crate::NoteStack`] slot.
///
/// The velocity field doubles as storage for the sustain flag (top bit);
/// the playable velocity is always the low 7 bits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NoteEntry {
    /// MIDI pitch (0-127).
    pub pitch: u8,
    /// 7 bits of velocity plus the sustain flag in the top bit.
    pub velocity: u8,
}

impl NoteEntry {
    /// Create an entry with the sustain flag cleared.
    pub fn new(pitch: u8, velocity: u8) -> Self {
        Self { pitch, velocity: velocity & !SUSTAIN_FLAG }
    }

    /// Velocity with the sustain flag stripped.
    pub fn velocity_7bit(&self) -> u8 {
        self.velocity & !SUSTAIN_FLAG
    }

    /// Is the sustain flag set?
    pub fn is_sustained(&self) -> bool {
        self.velocity & SUSTAIN_FLAG != 0
    }
}
