//! Performance-note engine for notegrid.
//!
//! Decides which logical voice plays which pitch, tracks held and
//! sustained keys, and records/replays note loops against a cyclic
//! position counter.

#![cfg_attr(not(feature = "std"), no_std)]

mod held_keys;
mod looper;
mod part;
mod step;
mod synced_lfo;
mod voice;

pub use held_keys::{HeldKeys, SustainMode, MAX_HELD_KEYS};
pub use looper::{Deck, DeckEvent, NoteIndex, RecordMode, MAX_DECK_NOTES};
pub use part::{
    AllocationMode, LegatoMode, MidiSettings, Part, PlayMode, VoicingSettings, MAX_PART_VOICES,
    OMNI_CHANNEL,
};
pub use step::{Step, StepSource};
pub use synced_lfo::SyncedLfo;
pub use voice::{EnvelopeParams, Voice, VoiceNote};
