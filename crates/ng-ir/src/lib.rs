//! Core types for the notegrid performance-note engine.
//!
//! This crate defines the note/event data model and the two generic
//! containers the engine is built on: a priority-ordered note stack and a
//! voice assignment pool. The engine crate consumes these through their
//! public contracts only.
//!
//! Designed to be `no_std` compatible.

#![cfg_attr(not(feature = "std"), no_std)]

mod event;
mod note;
mod note_stack;
mod voice_pool;

pub use event::MidiEvent;
pub use note::{NoteEntry, C4, MIDI_NOTE_MAX, SUSTAIN_FLAG};
pub use note_stack::{NotePriority, NoteStack, SlotId};
pub use voice_pool::VoicePool;
