//! Voice sink contract.
//!
//! The engine decides which pitch a voice plays and when it triggers; the
//! sink renders it. Anything implementing [`Voice`] can sit on the other
//! side, from a synthesis voice to a MIDI output lane to a test probe.

/// Envelope settings forwarded with every note-on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EnvelopeParams {
    pub attack: u8,
    pub decay: u8,
    pub sustain: u8,
    pub release: u8,
}

/// One note-on request as dispatched to a voice.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VoiceNote {
    pub pitch: u8,
    pub velocity: u8,
    /// Glide amount from the previous pitch, 0 = instant.
    pub portamento: u8,
    /// Restart the envelope. Legato transitions pass `false`.
    pub trigger: bool,
    pub envelope: EnvelopeParams,
    /// Timbre modulation target, forwarded untouched.
    pub timbre: u8,
}

/// A logical sound-producing unit.
pub trait Voice {
    fn note_on(&mut self, note: VoiceNote);
    fn note_off(&mut self);
    /// Is the voice currently sounding (gate open)?
    fn gate(&self) -> bool;
}
