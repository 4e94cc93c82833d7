//! Held-key tracking with sustain semantics.
//!
//! Wraps a priority note stack and layers pedal behavior on top: a note
//! whose key has been released may stay in the stack with its sustain flag
//! set, and is only removed when the sustain is later lifted. The pedal
//! state machine itself (which pedal edge does what, per mode) lives on the
//! part; this type provides the primitives it composes.

use heapless::Vec;
use ng_ir::{NoteStack, SlotId, SUSTAIN_FLAG};

/// Capacity of each held-key stack.
pub const MAX_HELD_KEYS: usize = 12;

/// Per-part sustain pedal behavior.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SustainMode {
    /// Pedal ignored.
    Off,
    /// Pedal-down sustains everything, pedal-up releases.
    #[default]
    Normal,
    /// Only keys down at pedal-press are sustained.
    Sostenuto,
    /// Pedal-down latches; only the next pedal-down unlatches.
    Latch,
    /// Latch that pedal-up immediately undoes.
    MomentaryLatch,
    /// One-time stamp of the held chord; pedal-up arms release on the next
    /// key press.
    Clutch,
    /// Pedal-down freezes the sustained chord and swallows new key input.
    Filter,
}

impl SustainMode {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0 => SustainMode::Off,
            2 => SustainMode::Sostenuto,
            3 => SustainMode::Latch,
            4 => SustainMode::MomentaryLatch,
            5 => SustainMode::Clutch,
            6 => SustainMode::Filter,
            _ => SustainMode::Normal,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            SustainMode::Off => 0,
            SustainMode::Normal => 1,
            SustainMode::Sostenuto => 2,
            SustainMode::Latch => 3,
            SustainMode::MomentaryLatch => 4,
            SustainMode::Clutch => 5,
            SustainMode::Filter => 6,
        }
    }
}

/// A note stack plus sustain bookkeeping.
///
/// Invariant: a note's sustain flag is only ever set while the note is in
/// the stack, and only explicit release logic clears it. A key release
/// never silently drops a sustained note.
#[derive(Clone, Debug, Default)]
pub struct HeldKeys {
    stack: NoteStack<MAX_HELD_KEYS>,
    /// Every current and future note is sustainable (pedal down / latched).
    pub universally_sustainable: bool,
    /// Release all sustained notes when the next key is pressed.
    pub stop_sustained_on_next_note_on: bool,
    individually_sustainable: [bool; MAX_HELD_KEYS],
}

impl HeldKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stack(&self) -> &NoteStack<MAX_HELD_KEYS> {
        &self.stack
    }

    /// Record a key press.
    pub fn note_on(&mut self, pitch: u8, velocity: u8) -> SlotId {
        let slot = self.stack.note_on(pitch, velocity);
        // The slot may be recycled; a stale stamp must not sustain it.
        self.individually_sustainable[slot.index()] = false;
        slot
    }

    /// Record a key release. If the note is currently sustainable it stays
    /// in the stack with its sustain flag set and this returns `false`;
    /// otherwise the note is removed and this returns `true`.
    pub fn sustainable_note_off(&mut self, pitch: u8) -> bool {
        match self.stack.find(pitch) {
            Some(slot) if self.is_sustainable(slot) => {
                self.set_sustain(slot, true);
                false
            }
            Some(_) => {
                self.stack.note_off(pitch);
                true
            }
            None => false,
        }
    }

    /// Remove a note regardless of sustain state.
    pub fn release(&mut self, pitch: u8) -> Option<SlotId> {
        if let Some(slot) = self.stack.find(pitch) {
            self.individually_sustainable[slot.index()] = false;
        }
        self.stack.note_off(pitch)
    }

    /// Set or clear the sustain flag on a held note.
    pub fn set_sustain(&mut self, slot: SlotId, sustained: bool) {
        let velocity = &mut self.stack.note_mut(slot).velocity;
        if sustained {
            *velocity |= SUSTAIN_FLAG;
        } else {
            *velocity &= !SUSTAIN_FLAG;
        }
    }

    pub fn is_sustained(&self, slot: SlotId) -> bool {
        self.stack.note(slot).is_sustained()
    }

    fn is_sustainable(&self, slot: SlotId) -> bool {
        self.universally_sustainable || self.individually_sustainable[slot.index()]
    }

    /// Mark every currently-held key individually sustainable (sostenuto
    /// and clutch pedal-down).
    pub fn stamp_sustainable(&mut self) {
        for slot in self.stack.slots() {
            self.individually_sustainable[slot.index()] = true;
        }
    }

    /// Drop all individual sustainable stamps.
    pub fn clear_stamps(&mut self) {
        self.individually_sustainable = [false; MAX_HELD_KEYS];
    }

    /// Is any note currently flagged as sustained?
    pub fn any_sustained(&self) -> bool {
        self.stack.slots().any(|s| self.is_sustained(s))
    }

    /// Remove every sustained note from the stack, invoking `released` with
    /// each pitch so the caller can emit the matching NoteOffs.
    pub fn release_sustained(&mut self, mut released: impl FnMut(u8)) {
        let pitches: Vec<u8, MAX_HELD_KEYS> = self
            .stack
            .slots()
            .filter(|&s| self.is_sustained(s))
            .map(|s| self.stack.note(s).pitch)
            .collect();
        for pitch in pitches {
            self.release(pitch);
            released(pitch);
        }
    }

    /// Forget all keys and sustain state.
    pub fn clear(&mut self) {
        self.stack.clear();
        self.individually_sustainable = [false; MAX_HELD_KEYS];
        self.universally_sustainable = false;
        self.stop_sustained_on_next_note_on = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_note_off_releases() {
        let mut keys = HeldKeys::new();
        keys.note_on(60, 100);
        assert!(keys.sustainable_note_off(60));
        assert!(keys.stack().is_empty());
    }

    #[test]
    fn pedal_down_holds_released_key() {
        let mut keys = HeldKeys::new();
        keys.note_on(60, 100);
        keys.universally_sustainable = true;
        assert!(!keys.sustainable_note_off(60));
        assert_eq!(keys.stack().size(), 1);
        let slot = keys.stack().find(60).unwrap();
        assert!(keys.is_sustained(slot));
    }

    #[test]
    fn latch_scenario_release_only_on_pedal() {
        // Latch: key released under sustain stays until the pedal event
        // explicitly releases the sustained set.
        let mut keys = HeldKeys::new();
        keys.note_on(60, 100);
        keys.universally_sustainable = true;
        assert!(!keys.sustainable_note_off(60));
        let slot = keys.stack().find(60).unwrap();
        assert!(keys.is_sustained(slot));

        keys.universally_sustainable = false;
        let mut released = [0u8; 4];
        let mut n = 0;
        keys.release_sustained(|p| {
            released[n] = p;
            n += 1;
        });
        assert_eq!((n, released[0]), (1, 60));
        assert!(keys.stack().is_empty());
    }

    #[test]
    fn sostenuto_stamp_only_covers_prior_keys() {
        let mut keys = HeldKeys::new();
        keys.note_on(60, 100);
        keys.stamp_sustainable();
        keys.note_on(64, 100);
        assert!(!keys.sustainable_note_off(60));
        assert!(keys.sustainable_note_off(64));
        assert_eq!(keys.stack().size(), 1);
    }

    #[test]
    fn recycled_slot_does_not_inherit_stamp() {
        let mut keys = HeldKeys::new();
        keys.note_on(60, 100);
        keys.stamp_sustainable();
        keys.release(60);
        // New key may land in the freed slot; it must not be sustainable.
        keys.note_on(62, 100);
        assert!(keys.sustainable_note_off(62));
    }

    #[test]
    fn release_sustained_leaves_plain_keys() {
        let mut keys = HeldKeys::new();
        keys.note_on(60, 100);
        keys.universally_sustainable = true;
        keys.sustainable_note_off(60);
        keys.universally_sustainable = false;
        keys.note_on(64, 100);
        keys.release_sustained(|_| {});
        assert_eq!(keys.stack().size(), 1);
        assert!(keys.stack().find(64).is_some());
    }

    #[test]
    fn clear_resets_flags() {
        let mut keys = HeldKeys::new();
        keys.note_on(60, 100);
        keys.universally_sustainable = true;
        keys.stop_sustained_on_next_note_on = true;
        keys.clear();
        assert!(keys.stack().is_empty());
        assert!(!keys.universally_sustainable);
        assert!(!keys.stop_sustained_on_next_note_on);
    }
}
