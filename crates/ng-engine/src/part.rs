//! Note arbitration engine.
//!
//! A part owns everything between raw key events and voice calls: input
//! filtering, held-key tracking with sustain, the voice allocation policy,
//! and the loop recorder. All note sources reach the voices through the
//! same internal entry points, so loop playback and generated notes obey
//! the same arbitration rules as live keys.

use heapless::Vec;
use ng_ir::{NoteEntry, NotePriority, NoteStack, SlotId, VoicePool};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::held_keys::{HeldKeys, SustainMode, MAX_HELD_KEYS};
use crate::looper::{Deck, DeckEvent, NoteIndex, RecordMode, MAX_DECK_NOTES};
use crate::step::{Step, StepSource};
use crate::voice::{EnvelopeParams, Voice, VoiceNote};

/// Ceiling on voices a single part can drive.
pub const MAX_PART_VOICES: usize = 4;

/// Omni value for the MIDI channel filter.
pub const OMNI_CHANNEL: u8 = 16;

/// Voice allocation policy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AllocationMode {
    /// All voices play the single priority note.
    #[default]
    Mono,
    /// Steal the voice of the note pushed out of the priority window;
    /// releasing leaves the freed voice silent.
    StealReleaseSilent,
    /// Same stealing, but a freed voice picks up the best unvoiced note.
    StealReleaseReassign,
    /// Steal the voice of the previous top-priority note.
    StealHighestPriority,
    /// Steal the top-priority note's voice, reassign on release.
    StealHighestPriorityReleaseReassign,
    /// Round-robin voice choice, ignoring voice contents.
    Cyclic,
    /// Random voice choice.
    Random,
    /// Voice chosen by velocity bucket.
    Velocity,
    /// Continuous stable re-dispatch of the priority window.
    Sorted,
    /// All voices used, notes distributed evenly; re-dispatch on release.
    UnisonReleaseReassign,
    /// Unison that leaves freed voices silent while notes fit the window.
    UnisonReleaseSilent,
}

impl AllocationMode {
    pub fn from_byte(b: u8) -> Self {
        match b {
            1 => AllocationMode::StealReleaseSilent,
            2 => AllocationMode::StealReleaseReassign,
            3 => AllocationMode::StealHighestPriority,
            4 => AllocationMode::StealHighestPriorityReleaseReassign,
            5 => AllocationMode::Cyclic,
            6 => AllocationMode::Random,
            7 => AllocationMode::Velocity,
            8 => AllocationMode::Sorted,
            9 => AllocationMode::UnisonReleaseReassign,
            10 => AllocationMode::UnisonReleaseSilent,
            _ => AllocationMode::Mono,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            AllocationMode::Mono => 0,
            AllocationMode::StealReleaseSilent => 1,
            AllocationMode::StealReleaseReassign => 2,
            AllocationMode::StealHighestPriority => 3,
            AllocationMode::StealHighestPriorityReleaseReassign => 4,
            AllocationMode::Cyclic => 5,
            AllocationMode::Random => 6,
            AllocationMode::Velocity => 7,
            AllocationMode::Sorted => 8,
            AllocationMode::UnisonReleaseReassign => 9,
            AllocationMode::UnisonReleaseSilent => 10,
        }
    }

    fn is_steal(self) -> bool {
        matches!(
            self,
            AllocationMode::StealReleaseSilent
                | AllocationMode::StealReleaseReassign
                | AllocationMode::StealHighestPriority
                | AllocationMode::StealHighestPriorityReleaseReassign
        )
    }

    fn is_sorted(self) -> bool {
        matches!(
            self,
            AllocationMode::Sorted
                | AllocationMode::UnisonReleaseReassign
                | AllocationMode::UnisonReleaseSilent
        )
    }

    fn reassigns_on_release(self) -> bool {
        matches!(
            self,
            AllocationMode::StealReleaseReassign
                | AllocationMode::StealHighestPriorityReleaseReassign
        )
    }
}

/// Where live key input is routed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PlayMode {
    /// Keys play voices directly.
    #[default]
    Manual,
    /// Keys feed the arpeggiator; a step source produces the notes.
    Arpeggiator,
    /// Keys feed the sequencer input stack.
    Sequencer,
}

impl PlayMode {
    pub fn from_byte(b: u8) -> Self {
        match b {
            1 => PlayMode::Arpeggiator,
            2 => PlayMode::Sequencer,
            _ => PlayMode::Manual,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            PlayMode::Manual => 0,
            PlayMode::Arpeggiator => 1,
            PlayMode::Sequencer => 2,
        }
    }
}

/// Mono-mode retrigger behavior.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LegatoMode {
    /// Every note retriggers.
    #[default]
    Off,
    /// Legato transitions also suppress portamento on the first note.
    AutoPortamento,
    /// Overlapping notes never retrigger.
    On,
}

impl LegatoMode {
    pub fn from_byte(b: u8) -> Self {
        match b {
            1 => LegatoMode::AutoPortamento,
            2 => LegatoMode::On,
            _ => LegatoMode::Off,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            LegatoMode::Off => 0,
            LegatoMode::AutoPortamento => 1,
            LegatoMode::On => 2,
        }
    }
}

/// Input-side MIDI filters and routing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MidiSettings {
    /// Receive channel; [`OMNI_CHANNEL`] accepts everything.
    pub channel: u8,
    pub min_note: u8,
    pub max_note: u8,
    pub min_velocity: u8,
    pub max_velocity: u8,
    pub sustain_mode: SustainMode,
    pub transpose_octaves: i8,
    pub play_mode: PlayMode,
}

impl Default for MidiSettings {
    fn default() -> Self {
        Self {
            channel: 0,
            min_note: 0,
            max_note: 127,
            min_velocity: 0,
            max_velocity: 127,
            sustain_mode: SustainMode::default(),
            transpose_octaves: 0,
            play_mode: PlayMode::default(),
        }
    }
}

/// Output-side voicing configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VoicingSettings {
    pub allocation_mode: AllocationMode,
    pub allocation_priority: NotePriority,
    pub portamento: u8,
    pub legato_mode: LegatoMode,
    pub envelope: EnvelopeParams,
    pub timbre: u8,
}

/// Which held-key tracker a key event lands in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum KeySet {
    Manual,
    Arp,
}

/// One independently configurable instrument slice.
pub struct Part {
    midi: MidiSettings,
    voicing: VoicingSettings,

    manual_keys: HeldKeys,
    arp_keys: HeldKeys,
    /// Pitches currently sounding on behalf of the generator or loop.
    generated_notes: NoteStack<MAX_HELD_KEYS>,

    mono_allocator: NoteStack<MAX_HELD_KEYS>,
    poly_allocator: VoicePool<MAX_PART_VOICES>,
    active_note: [Option<u8>; MAX_PART_VOICES],
    num_voices: usize,
    cyclic_counter: usize,
    rng: SmallRng,

    deck: Deck,
    recording: bool,
    pedal_down: bool,
    arp_tick: u32,
    /// Deck slot being recorded for each held-key slot.
    looper_note_for_key: [Option<NoteIndex>; MAX_HELD_KEYS],
    /// Pitch currently sounding for each deck slot during playback.
    output_pitch_for_looper_note: [Option<u8>; MAX_DECK_NOTES],
}

impl Default for Part {
    fn default() -> Self {
        Self::new()
    }
}

impl Part {
    pub fn new() -> Self {
        Self {
            midi: MidiSettings::default(),
            voicing: VoicingSettings::default(),
            manual_keys: HeldKeys::new(),
            arp_keys: HeldKeys::new(),
            generated_notes: NoteStack::new(),
            mono_allocator: NoteStack::new(),
            poly_allocator: VoicePool::new(),
            active_note: [None; MAX_PART_VOICES],
            num_voices: 0,
            cyclic_counter: 0,
            rng: SmallRng::seed_from_u64(0x6e67_7061_7274),
            deck: Deck::new(),
            recording: false,
            pedal_down: false,
            arp_tick: 0,
            looper_note_for_key: [None; MAX_HELD_KEYS],
            output_pitch_for_looper_note: [None; MAX_DECK_NOTES],
        }
    }

    pub fn midi(&self) -> &MidiSettings {
        &self.midi
    }

    pub fn midi_mut(&mut self) -> &mut MidiSettings {
        &mut self.midi
    }

    pub fn voicing(&self) -> &VoicingSettings {
        &self.voicing
    }

    pub fn voicing_mut(&mut self) -> &mut VoicingSettings {
        &mut self.voicing
    }

    pub fn deck(&self) -> &Deck {
        &self.deck
    }

    pub fn deck_mut(&mut self) -> &mut Deck {
        &mut self.deck
    }

    pub fn num_voices(&self) -> usize {
        self.num_voices
    }

    /// Pitch sounding on a voice slot, if any.
    pub fn active_note(&self, voice: usize) -> Option<u8> {
        self.active_note.get(voice).copied().flatten()
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Claim `n` voices for this part and reset allocation state. The
    /// caller is expected to silence the voices first.
    pub fn allocate_voices(&mut self, n: usize) {
        self.num_voices = n.min(MAX_PART_VOICES);
        self.poly_allocator.set_size(self.num_voices);
        self.active_note = [None; MAX_PART_VOICES];
        self.mono_allocator.clear();
        self.cyclic_counter = 0;
    }

    /// Channel/key/velocity input filter. Key range wraps: with
    /// `min_note > max_note` the accepted window crosses the top of the
    /// keyboard.
    pub fn accepts(&self, channel: u8, note: u8, velocity: u8) -> bool {
        if self.midi.channel != OMNI_CHANNEL && self.midi.channel != channel {
            return false;
        }
        let in_range = if self.midi.min_note <= self.midi.max_note {
            note >= self.midi.min_note && note <= self.midi.max_note
        } else {
            note >= self.midi.min_note || note <= self.midi.max_note
        };
        in_range && velocity >= self.midi.min_velocity && velocity <= self.midi.max_velocity
    }

    /// Handle an accepted key press.
    pub fn note_on<V: Voice>(&mut self, voices: &mut [V], pitch: u8, velocity: u8) {
        let velocity = self.rescale_velocity(velocity);
        let pitch = self.transpose(pitch);
        let set = self.input_key_set();

        if self.keys(set).stop_sustained_on_next_note_on {
            // Flush the previous sustained chord, then restore the flags so
            // a still-latched tracker keeps replacing chords on every press.
            let still_latched = self.keys(set).universally_sustainable;
            self.keys_mut(set).universally_sustainable = false;
            self.release_sustained_keys(voices, set);
            let keys = self.keys_mut(set);
            keys.universally_sustainable = still_latched;
            keys.stop_sustained_on_next_note_on = still_latched;
        }

        let slot = self.keys_mut(set).note_on(pitch, velocity);
        self.looper_note_for_key[slot.index()] = None;

        if self.midi.sustain_mode == SustainMode::Filter
            && self.pedal_down
            && self.keys(set).universally_sustainable
        {
            // Swallowed: tracked in the stack but never voiced or recorded.
            return;
        }

        if self.recording {
            if self.deck.mode() == RecordMode::EraseOnNextInput {
                self.erase_deck(voices);
            }
            let mut events: Vec<DeckEvent, 8> = Vec::new();
            let index = self.deck.record_note_on(pitch, velocity, |e| {
                let _ = events.push(e);
            });
            for event in events {
                self.on_deck_event(voices, &mut None, event);
            }
            self.looper_note_for_key[slot.index()] = Some(index);
        }

        if set == KeySet::Manual {
            self.internal_note_on(voices, pitch, velocity);
        }
    }

    /// Handle an accepted key release.
    pub fn note_off<V: Voice>(&mut self, voices: &mut [V], pitch: u8) {
        let pitch = self.transpose(pitch);
        let set = self.input_key_set();
        let slot = self.keys(set).stack().find(pitch);
        if self.keys_mut(set).sustainable_note_off(pitch) {
            self.key_released(voices, set, pitch, slot);
        }
    }

    /// Sustain pedal edge, dispatched per the part's sustain mode.
    pub fn set_sustain_pedal<V: Voice>(&mut self, voices: &mut [V], down: bool) {
        self.pedal_down = down;
        let set = self.input_key_set();
        match self.midi.sustain_mode {
            SustainMode::Off => {}
            SustainMode::Normal => {
                if down {
                    self.keys_mut(set).universally_sustainable = true;
                } else {
                    self.keys_mut(set).universally_sustainable = false;
                    self.release_sustained_keys(voices, set);
                }
            }
            SustainMode::Sostenuto => {
                if down {
                    self.keys_mut(set).stamp_sustainable();
                } else {
                    self.keys_mut(set).clear_stamps();
                    self.release_sustained_keys(voices, set);
                }
            }
            SustainMode::Latch => {
                // Sticky: pedal-up does nothing, the second pedal-down
                // unlatches and flushes.
                if down {
                    if self.keys(set).universally_sustainable {
                        let keys = self.keys_mut(set);
                        keys.universally_sustainable = false;
                        keys.stop_sustained_on_next_note_on = false;
                        self.release_sustained_keys(voices, set);
                    } else {
                        self.keys_mut(set).universally_sustainable = true;
                    }
                }
            }
            SustainMode::MomentaryLatch => {
                if down {
                    self.keys_mut(set).universally_sustainable = true;
                } else {
                    self.keys_mut(set).universally_sustainable = false;
                    self.release_sustained_keys(voices, set);
                }
            }
            SustainMode::Clutch => {
                if down {
                    self.keys_mut(set).stamp_sustainable();
                } else {
                    let keys = self.keys_mut(set);
                    keys.clear_stamps();
                    keys.stop_sustained_on_next_note_on = true;
                }
            }
            SustainMode::Filter => {
                if down {
                    self.keys_mut(set).universally_sustainable = true;
                } else {
                    self.keys_mut(set).universally_sustainable = false;
                    self.release_sustained_keys(voices, set);
                }
            }
        }
    }

    /// CC dispatch for the controllers this engine owns.
    pub fn control_change<V: Voice>(&mut self, voices: &mut [V], controller: u8, value: u8) {
        match controller {
            64 => self.set_sustain_pedal(voices, value >= 64),
            110 => self.set_recording(value >= 64),
            111 => self.delete_recording(voices),
            120 | 123 => self.all_notes_off(voices),
            _ => {}
        }
    }

    pub fn set_recording(&mut self, recording: bool) {
        self.recording = recording;
    }

    /// Arm the deck to wipe itself when the next note is recorded.
    pub fn arm_erase_on_next_input(&mut self) {
        self.deck.set_mode(RecordMode::EraseOnNextInput);
    }

    /// Silence everything and forget all input state.
    pub fn all_notes_off<V: Voice>(&mut self, voices: &mut [V]) {
        for voice in voices.iter_mut().take(self.num_voices) {
            voice.note_off();
        }
        self.active_note = [None; MAX_PART_VOICES];
        self.poly_allocator.clear_notes();
        self.mono_allocator.clear();
        self.generated_notes.clear();
        self.manual_keys.clear();
        self.arp_keys.clear();
        self.looper_note_for_key = [None; MAX_HELD_KEYS];
        self.output_pitch_for_looper_note = [None; MAX_DECK_NOTES];
        self.pedal_down = false;
    }

    /// Stop every note sounding on behalf of the generator or the loop,
    /// leaving live keys alone.
    pub fn stop_sequencer_arpeggiator_notes<V: Voice>(&mut self, voices: &mut [V]) {
        loop {
            let pitch = match self.generated_notes.most_recent() {
                Some(slot) => self.generated_notes.note(slot).pitch,
                None => break,
            };
            self.generated_notes.note_off(pitch);
            self.internal_note_off(voices, pitch);
        }
        self.output_pitch_for_looper_note = [None; MAX_DECK_NOTES];
    }

    /// Wipe the recording. Every note the loop is sounding gets its
    /// NoteOff before state is cleared; a stuck note here is a bug.
    pub fn delete_recording<V: Voice>(&mut self, voices: &mut [V]) {
        self.erase_deck(voices);
        self.looper_note_for_key = [None; MAX_HELD_KEYS];
    }

    /// Advance the loop cursor, feeding playback events back through
    /// arbitration. `step` is consulted in arpeggiator play mode, where
    /// recorded notes trigger generated steps instead of their own pitch.
    pub fn advance_deck<V: Voice>(
        &mut self,
        voices: &mut [V],
        mut step: Option<&mut dyn StepSource>,
        new_pos: u16,
        play: bool,
    ) {
        let mut events: Vec<DeckEvent, 64> = Vec::new();
        self.deck.advance(new_pos, play, |e| {
            let _ = events.push(e);
        });
        for event in events {
            self.on_deck_event(voices, &mut step, event);
        }
    }

    /// One generator step driven directly by the clock, used when no loop
    /// exists to drive the generator.
    pub fn clock_step<V: Voice>(
        &mut self,
        voices: &mut [V],
        source: &mut dyn StepSource,
        tick: u32,
    ) {
        if self.midi.play_mode == PlayMode::Manual || !self.deck.is_empty() {
            return;
        }
        let step = source.next(tick, &self.arp_keys);
        self.arp_tick = tick.wrapping_add(1);
        match step {
            Step::Rest => self.stop_generated(voices, None),
            Step::Tie => {}
            Step::Note { pitch, velocity, slid } => {
                if slid {
                    self.internal_note_on(voices, pitch, velocity);
                    self.stop_generated(voices, Some(pitch));
                    self.generated_notes.note_on(pitch, velocity);
                } else {
                    self.stop_generated(voices, None);
                    self.internal_note_on(voices, pitch, velocity);
                    self.generated_notes.note_on(pitch, velocity);
                }
            }
        }
    }

    fn stop_generated<V: Voice>(&mut self, voices: &mut [V], except: Option<u8>) {
        loop {
            let pitch = match self
                .generated_notes
                .slots()
                .map(|s| self.generated_notes.note(s).pitch)
                .find(|&p| Some(p) != except)
            {
                Some(p) => p,
                None => break,
            };
            self.generated_notes.note_off(pitch);
            self.internal_note_off(voices, pitch);
        }
    }

    fn erase_deck<V: Voice>(&mut self, voices: &mut [V]) {
        self.stop_sequencer_arpeggiator_notes(voices);
        let mut events: Vec<DeckEvent, { MAX_DECK_NOTES }> = Vec::new();
        self.deck.remove_all(|e| {
            let _ = events.push(e);
        });
        for event in events {
            self.on_deck_event(voices, &mut None, event);
        }
    }

    fn on_deck_event<V: Voice>(
        &mut self,
        voices: &mut [V],
        step: &mut Option<&mut dyn StepSource>,
        event: DeckEvent,
    ) {
        match event {
            DeckEvent::NoteOn { index, pitch, velocity } => {
                self.looper_note_on(voices, step, index, pitch, velocity)
            }
            DeckEvent::NoteOff { index, .. } => self.looper_note_off(voices, step, index),
        }
    }

    fn looper_note_on<V: Voice>(
        &mut self,
        voices: &mut [V],
        step: &mut Option<&mut dyn StepSource>,
        index: NoteIndex,
        pitch: u8,
        velocity: u8,
    ) {
        if self.midi.play_mode == PlayMode::Arpeggiator {
            if let Some(source) = step {
                let produced = source.next(self.arp_tick, &self.arp_keys);
                self.arp_tick = self.arp_tick.wrapping_add(1);
                match produced {
                    Step::Note { pitch: p, velocity: v, slid } => {
                        let previous = self.current_looper_pitch(index);
                        self.internal_note_on(voices, p, v);
                        self.generated_notes.note_on(p, v);
                        self.output_pitch_for_looper_note[index.index()] = Some(p);
                        if slid {
                            if let Some(prev) = previous.filter(|&prev| prev != p) {
                                self.release_generated(voices, prev);
                            }
                        }
                    }
                    Step::Tie => {
                        // Extended by the off-time guard; nothing new
                        // sounds. A tie with no ringing note degrades to a
                        // rest.
                    }
                    Step::Rest => {}
                }
                return;
            }
        }
        self.internal_note_on(voices, pitch, velocity);
        self.generated_notes.note_on(pitch, velocity);
        self.output_pitch_for_looper_note[index.index()] = Some(pitch);
    }

    fn looper_note_off<V: Voice>(
        &mut self,
        voices: &mut [V],
        step: &mut Option<&mut dyn StepSource>,
        index: NoteIndex,
    ) {
        let pitch = match self.output_pitch_for_looper_note[index.index()].take() {
            Some(p) => p,
            // Tie transfer or a kill for a silent note; nothing sounds.
            None => return,
        };
        if self.midi.play_mode == PlayMode::Arpeggiator {
            if let (Some(source), Some(next_on)) = (step.as_deref(), self.deck.peek_next_on()) {
                if source.peek(self.arp_tick, &self.arp_keys) == Step::Tie {
                    // The upcoming step extends this note: hand the ringing
                    // pitch to the next loop slot instead of releasing it.
                    self.output_pitch_for_looper_note[next_on.index()] = Some(pitch);
                    return;
                }
            }
        }
        self.release_generated(voices, pitch);
    }

    fn current_looper_pitch(&self, _index: NoteIndex) -> Option<u8> {
        self.generated_notes
            .most_recent()
            .map(|s| self.generated_notes.note(s).pitch)
    }

    fn release_generated<V: Voice>(&mut self, voices: &mut [V], pitch: u8) {
        if self.generated_notes.note_off(pitch).is_some() {
            self.internal_note_off(voices, pitch);
        }
    }

    fn key_released<V: Voice>(
        &mut self,
        voices: &mut [V],
        set: KeySet,
        pitch: u8,
        slot: Option<SlotId>,
    ) {
        if let Some(slot) = slot {
            if let Some(index) = self.looper_note_for_key[slot.index()].take() {
                if self.recording {
                    self.deck.record_note_off(index);
                }
            }
        }
        if set == KeySet::Manual {
            self.internal_note_off(voices, pitch);
        }
    }

    fn release_sustained_keys<V: Voice>(&mut self, voices: &mut [V], set: KeySet) {
        loop {
            let keys = self.keys(set);
            let next = keys
                .stack()
                .slots()
                .find(|&s| keys.is_sustained(s))
                .map(|s| (keys.stack().note(s).pitch, s));
            let (pitch, slot) = match next {
                Some(found) => found,
                None => break,
            };
            self.keys_mut(set).release(pitch);
            self.key_released(voices, set, pitch, Some(slot));
        }
    }

    fn input_key_set(&self) -> KeySet {
        match self.midi.play_mode {
            PlayMode::Manual => KeySet::Manual,
            PlayMode::Arpeggiator | PlayMode::Sequencer => KeySet::Arp,
        }
    }

    fn keys(&self, set: KeySet) -> &HeldKeys {
        match set {
            KeySet::Manual => &self.manual_keys,
            KeySet::Arp => &self.arp_keys,
        }
    }

    fn keys_mut(&mut self, set: KeySet) -> &mut HeldKeys {
        match set {
            KeySet::Manual => &mut self.manual_keys,
            KeySet::Arp => &mut self.arp_keys,
        }
    }

    /// Spread input velocity over the full range so downstream velocity
    /// processing is not squeezed by the input filter window.
    fn rescale_velocity(&self, velocity: u8) -> u8 {
        // A decoded record may carry an inverted window; saturate rather
        // than trusting min <= max.
        let min = self.midi.min_velocity;
        let max = self.midi.max_velocity.max(min);
        let v = u16::from(velocity.clamp(min, max));
        let (min, max) = (u16::from(min), u16::from(max));
        ((128 * (v - min)) / (max - min + 1)).min(127) as u8
    }

    fn transpose(&self, pitch: u8) -> u8 {
        let p = i16::from(pitch);
        let octaves =
            i16::from(self.midi.transpose_octaves).clamp(-(p / 12), (127 - p) / 12);
        (p + 12 * octaves) as u8
    }

    fn internal_note_on<V: Voice>(&mut self, voices: &mut [V], pitch: u8, velocity: u8) {
        let rule = self.voicing.allocation_priority;
        let mode = self.voicing.allocation_mode;
        if mode == AllocationMode::Mono {
            let before = self.priority_pitch();
            self.mono_allocator.note_on(pitch, velocity);
            let after = match self.mono_allocator.note_by_priority(rule, 0) {
                Some(e) => e,
                None => return,
            };
            if before != Some(after.pitch) {
                let legato = self.mono_allocator.size() > 1;
                let portamento =
                    if self.voicing.legato_mode == LegatoMode::AutoPortamento && !legato {
                        0
                    } else {
                        self.voicing.portamento
                    };
                let trigger = self.voicing.legato_mode == LegatoMode::Off || !legato;
                for v in 0..self.num_voices {
                    self.voice_on(
                        voices,
                        v,
                        after.pitch,
                        after.velocity_7bit(),
                        portamento,
                        trigger,
                    );
                    self.active_note[v] = Some(after.pitch);
                }
            }
        } else if mode.is_sorted() {
            self.mono_allocator.note_on(pitch, velocity);
            self.dispatch_sorted_notes(voices, mode != AllocationMode::Sorted);
        } else if mode.is_steal() {
            let previous_top = self.priority_pitch();
            self.mono_allocator.note_on(pitch, velocity);
            let rank = match self.mono_allocator.priority_for_note(rule, pitch) {
                Some(r) => r,
                None => return,
            };
            if rank >= self.num_voices {
                // Outside the priority window: tracked, unvoiced.
                return;
            }
            let victim = match mode {
                AllocationMode::StealHighestPriority
                | AllocationMode::StealHighestPriorityReleaseReassign => previous_top,
                _ => self
                    .mono_allocator
                    .note_by_priority(rule, self.num_voices)
                    .map(|e| e.pitch),
            };
            let hint = victim.and_then(|p| self.poly_allocator.find(p));
            if let Some(v) = self.poly_allocator.note_on(pitch, hint) {
                self.active_note[v] = Some(pitch);
                self.voice_on(voices, v, pitch, velocity, self.voicing.portamento, true);
            }
            // Allocation failure leaves the note unvoiced.
        } else {
            let v = match mode {
                AllocationMode::Cyclic => {
                    if self.cyclic_counter >= self.num_voices {
                        self.cyclic_counter = 0;
                    }
                    let v = self.cyclic_counter;
                    self.cyclic_counter += 1;
                    v
                }
                AllocationMode::Random => {
                    if self.num_voices == 0 {
                        return;
                    }
                    self.rng.gen_range(0..self.num_voices)
                }
                _ => (usize::from(velocity) * self.num_voices) >> 7,
            };
            if v >= self.num_voices {
                return;
            }
            self.kill_all_instances(voices, pitch);
            // Stealing a busy voice glides instead of retriggering.
            let trigger = self.active_note[v].is_none();
            self.voice_on(voices, v, pitch, velocity, self.voicing.portamento, trigger);
            self.active_note[v] = Some(pitch);
        }
    }

    fn internal_note_off<V: Voice>(&mut self, voices: &mut [V], pitch: u8) {
        let rule = self.voicing.allocation_priority;
        let mode = self.voicing.allocation_mode;
        if mode == AllocationMode::Mono {
            let before = self.priority_pitch();
            self.mono_allocator.note_off(pitch);
            match self.mono_allocator.note_by_priority(rule, 0) {
                None => {
                    for v in 0..self.num_voices {
                        if let Some(voice) = voices.get_mut(v) {
                            voice.note_off();
                        }
                        self.active_note[v] = None;
                    }
                }
                Some(after) if before != Some(after.pitch) => {
                    // Priority moved to a still-held note: slide to it, or
                    // retrigger when legato is off.
                    let trigger = self.voicing.legato_mode == LegatoMode::Off;
                    for v in 0..self.num_voices {
                        self.voice_on(
                            voices,
                            v,
                            after.pitch,
                            after.velocity_7bit(),
                            self.voicing.portamento,
                            trigger,
                        );
                        self.active_note[v] = Some(after.pitch);
                    }
                }
                Some(_) => {}
            }
        } else if mode.is_sorted() {
            self.mono_allocator.note_off(pitch);
            self.kill_all_instances(voices, pitch);
            if mode == AllocationMode::UnisonReleaseReassign
                || self.mono_allocator.size() >= self.num_voices
            {
                self.dispatch_sorted_notes(voices, mode != AllocationMode::Sorted);
            }
        } else if mode.is_steal() {
            self.mono_allocator.note_off(pitch);
            if let Some(v) = self.poly_allocator.note_off(pitch) {
                if let Some(voice) = voices.get_mut(v) {
                    voice.note_off();
                }
                self.active_note[v] = None;
                if mode.reassigns_on_release() {
                    self.reassign_freed_voice(voices, v);
                }
            }
        } else {
            self.mono_allocator.note_off(pitch);
            if let Some(v) = (0..self.num_voices).find(|&v| self.active_note[v] == Some(pitch)) {
                if let Some(voice) = voices.get_mut(v) {
                    voice.note_off();
                }
                self.active_note[v] = None;
            }
        }
    }

    /// Give a freed voice to the best note currently without one.
    fn reassign_freed_voice<V: Voice>(&mut self, voices: &mut [V], freed: usize) {
        let rule = self.voicing.allocation_priority;
        for rank in 0..self.mono_allocator.size() {
            let entry = match self.mono_allocator.note_by_priority(rule, rank) {
                Some(e) => e,
                None => break,
            };
            if self.poly_allocator.find(entry.pitch).is_some() {
                continue;
            }
            if self.poly_allocator.note_on(entry.pitch, Some(freed)).is_some() {
                self.active_note[freed] = Some(entry.pitch);
                self.voice_on(
                    voices,
                    freed,
                    entry.pitch,
                    entry.velocity_7bit(),
                    self.voicing.portamento,
                    true,
                );
            }
            return;
        }
    }

    /// Stable two-pass reassignment for the sorted and unison modes. A
    /// voice already sounding its dispatch pitch never retriggers, even
    /// when its priority rank moved.
    fn dispatch_sorted_notes<V: Voice>(&mut self, voices: &mut [V], unison: bool) {
        let rule = self.voicing.allocation_priority;
        let n = self.mono_allocator.size();
        let num = self.num_voices;

        let mut wanted: [Option<NoteEntry>; MAX_PART_VOICES] = [None; MAX_PART_VOICES];
        for (i, slot) in wanted.iter_mut().enumerate().take(num) {
            let rank = if unison {
                if n == 0 {
                    None
                } else if n < num {
                    // Distribute the extra voices evenly among the notes.
                    Some(i * n / num)
                } else {
                    Some(i)
                }
            } else if i < n {
                Some(i)
            } else {
                None
            };
            *slot = rank.and_then(|r| self.mono_allocator.note_by_priority(rule, r));
        }

        let mut claimed = [false; MAX_PART_VOICES];
        let mut intact = [false; MAX_PART_VOICES];
        for v in 0..num {
            if let Some(current) = self.active_note[v] {
                for j in 0..num {
                    if !claimed[j] && wanted[j].map(|e| e.pitch) == Some(current) {
                        claimed[j] = true;
                        intact[v] = true;
                        break;
                    }
                }
            }
        }

        let mut j = 0;
        for v in 0..num {
            if intact[v] {
                continue;
            }
            let mut assigned = None;
            while j < num {
                if !claimed[j] {
                    if let Some(entry) = wanted[j] {
                        claimed[j] = true;
                        assigned = Some(entry);
                        j += 1;
                        break;
                    }
                }
                j += 1;
            }
            match assigned {
                Some(entry) => {
                    self.voice_on(
                        voices,
                        v,
                        entry.pitch,
                        entry.velocity_7bit(),
                        self.voicing.portamento,
                        true,
                    );
                    self.active_note[v] = Some(entry.pitch);
                }
                None => {
                    if let Some(voice) = voices.get_mut(v) {
                        voice.note_off();
                    }
                    self.active_note[v] = None;
                }
            }
        }
    }

    /// No two voices may hold the same pitch; silence every holder before
    /// a duplicate-permitting mode assigns it again.
    fn kill_all_instances<V: Voice>(&mut self, voices: &mut [V], pitch: u8) {
        self.poly_allocator.note_off(pitch);
        while let Some(v) = (0..self.num_voices).find(|&v| self.active_note[v] == Some(pitch)) {
            if let Some(voice) = voices.get_mut(v) {
                voice.note_off();
            }
            self.active_note[v] = None;
        }
    }

    fn priority_pitch(&self) -> Option<u8> {
        self.mono_allocator
            .note_by_priority(self.voicing.allocation_priority, 0)
            .map(|e| e.pitch)
    }

    fn voice_on<V: Voice>(
        &self,
        voices: &mut [V],
        v: usize,
        pitch: u8,
        velocity: u8,
        portamento: u8,
        trigger: bool,
    ) {
        if let Some(voice) = voices.get_mut(v) {
            voice.note_on(VoiceNote {
                pitch,
                velocity,
                portamento,
                trigger,
                envelope: self.voicing.envelope,
                timbre: self.voicing.timbre,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct TestVoice {
        pitch: Option<u8>,
        triggers: usize,
        ons: usize,
        offs: usize,
    }

    impl Voice for TestVoice {
        fn note_on(&mut self, note: VoiceNote) {
            self.pitch = Some(note.pitch);
            self.ons += 1;
            if note.trigger {
                self.triggers += 1;
            }
        }

        fn note_off(&mut self) {
            self.pitch = None;
            self.offs += 1;
        }

        fn gate(&self) -> bool {
            self.pitch.is_some()
        }
    }

    fn part(mode: AllocationMode, voices: usize) -> (Part, std::vec::Vec<TestVoice>) {
        let mut p = Part::new();
        p.voicing_mut().allocation_mode = mode;
        p.allocate_voices(voices);
        let bank = (0..voices).map(|_| TestVoice::default()).collect();
        (p, bank)
    }

    #[test]
    fn mono_retriggers_on_priority_change() {
        let (mut p, mut v) = part(AllocationMode::Mono, 1);
        p.note_on(&mut v, 60, 100);
        assert_eq!(v[0].pitch, Some(60));
        assert_eq!(v[0].triggers, 1);
        // Last-played priority: the new note takes over.
        p.note_on(&mut v, 64, 100);
        assert_eq!(v[0].pitch, Some(64));
        // Releasing it falls back to the held note.
        p.note_off(&mut v, 64);
        assert_eq!(v[0].pitch, Some(60));
        p.note_off(&mut v, 60);
        assert_eq!(v[0].pitch, None);
    }

    #[test]
    fn cyclic_assigns_round_robin() {
        let (mut p, mut v) = part(AllocationMode::Cyclic, 2);
        p.note_on(&mut v, 60, 100);
        p.note_on(&mut v, 64, 100);
        p.note_on(&mut v, 67, 100);
        assert_eq!(p.active_note(0), Some(67));
        assert_eq!(p.active_note(1), Some(64));
    }

    #[test]
    fn duplicate_pitch_never_on_two_voices() {
        let (mut p, mut v) = part(AllocationMode::Cyclic, 2);
        p.note_on(&mut v, 60, 100);
        p.note_on(&mut v, 60, 100);
        let holders = (0..2).filter(|&i| p.active_note(i) == Some(60)).count();
        assert_eq!(holders, 1);
    }

    #[test]
    fn velocity_mode_buckets_by_velocity() {
        let (mut p, mut v) = part(AllocationMode::Velocity, 2);
        p.note_on(&mut v, 60, 10);
        assert_eq!(p.active_note(0), Some(60));
        p.note_on(&mut v, 64, 120);
        assert_eq!(p.active_note(1), Some(64));
    }

    #[test]
    fn inverted_velocity_window_saturates() {
        let (mut p, mut v) = part(AllocationMode::Mono, 1);
        p.midi_mut().min_velocity = 100;
        p.midi_mut().max_velocity = 20;
        // A decoded record can carry min > max; input must still sound.
        p.note_on(&mut v, 60, 64);
        assert_eq!(v[0].pitch, Some(60));
    }

    #[test]
    fn steal_release_reassign_recovers_unvoiced_note() {
        let (mut p, mut v) = part(AllocationMode::StealReleaseReassign, 2);
        p.note_on(&mut v, 60, 100);
        p.note_on(&mut v, 64, 100);
        // Third note steals the voice of the note pushed out of the
        // window (60, the oldest under last-played priority).
        p.note_on(&mut v, 67, 100);
        assert_eq!(p.active_note(0), Some(67));
        assert_eq!(p.active_note(1), Some(64));
        // Releasing 67 frees its voice; the unvoiced 60 comes back.
        p.note_off(&mut v, 67);
        assert_eq!(p.active_note(0), Some(60));
    }

    #[test]
    fn steal_silent_leaves_freed_voice_empty() {
        let (mut p, mut v) = part(AllocationMode::StealReleaseSilent, 2);
        p.note_on(&mut v, 60, 100);
        p.note_on(&mut v, 64, 100);
        p.note_on(&mut v, 67, 100);
        p.note_off(&mut v, 67);
        assert_eq!(p.active_note(0), None);
        assert_eq!(p.active_note(1), Some(64));
    }

    #[test]
    fn sorted_dispatch_does_not_retrigger_matching_voices() {
        let (mut p, mut v) = part(AllocationMode::Sorted, 2);
        p.note_on(&mut v, 60, 100);
        assert_eq!(v[0].ons, 1);
        // 64 arrives: priority ranks are now {64, 60} but voice 0 already
        // sounds 60, so only voice 1 receives a note-on.
        p.note_on(&mut v, 64, 100);
        assert_eq!(v[0].ons, 1);
        assert_eq!(v[1].ons, 1);
        assert_eq!(v[1].pitch, Some(64));
    }

    #[test]
    fn unison_distributes_notes_over_voices() {
        let (mut p, mut v) = part(AllocationMode::UnisonReleaseReassign, 4);
        p.note_on(&mut v, 60, 100);
        for i in 0..4 {
            assert_eq!(p.active_note(i), Some(60));
        }
        p.note_on(&mut v, 64, 100);
        let holding_64 = (0..4).filter(|&i| p.active_note(i) == Some(64)).count();
        let holding_60 = (0..4).filter(|&i| p.active_note(i) == Some(60)).count();
        assert_eq!(holding_64 + holding_60, 4);
        assert!(holding_60 > 0 && holding_64 > 0);
    }

    #[test]
    fn all_notes_off_clears_every_voice() {
        for mode in [
            AllocationMode::Mono,
            AllocationMode::StealReleaseReassign,
            AllocationMode::Cyclic,
            AllocationMode::Sorted,
        ] {
            let (mut p, mut v) = part(mode, 2);
            p.note_on(&mut v, 60, 100);
            p.note_on(&mut v, 64, 100);
            p.note_on(&mut v, 67, 100);
            p.all_notes_off(&mut v);
            for i in 0..2 {
                assert_eq!(p.active_note(i), None, "mode {mode:?}");
                assert!(!v[i].gate());
            }
        }
    }

    #[test]
    fn latch_holds_note_until_second_pedal_press() {
        let (mut p, mut v) = part(AllocationMode::Mono, 1);
        p.midi_mut().sustain_mode = SustainMode::Latch;
        p.note_on(&mut v, 60, 100);
        p.control_change(&mut v, 64, 127);
        p.note_off(&mut v, 60);
        // Key released, note latched.
        assert_eq!(v[0].pitch, Some(60));
        // Pedal-up does nothing.
        p.control_change(&mut v, 64, 0);
        assert_eq!(v[0].pitch, Some(60));
        // Second pedal-down unlatches and flushes.
        p.control_change(&mut v, 64, 127);
        assert_eq!(v[0].pitch, None);
    }

    #[test]
    fn momentary_latch_releases_on_pedal_up() {
        let (mut p, mut v) = part(AllocationMode::Mono, 1);
        p.midi_mut().sustain_mode = SustainMode::MomentaryLatch;
        p.note_on(&mut v, 60, 100);
        p.control_change(&mut v, 64, 127);
        p.note_off(&mut v, 60);
        assert_eq!(v[0].pitch, Some(60));
        p.control_change(&mut v, 64, 0);
        assert_eq!(v[0].pitch, None);
    }

    #[test]
    fn clutch_releases_on_next_key_press() {
        let (mut p, mut v) = part(AllocationMode::Mono, 1);
        p.midi_mut().sustain_mode = SustainMode::Clutch;
        p.note_on(&mut v, 60, 100);
        p.control_change(&mut v, 64, 127);
        p.note_off(&mut v, 60);
        assert_eq!(v[0].pitch, Some(60));
        p.control_change(&mut v, 64, 0);
        // Still ringing until the next press flushes it.
        assert_eq!(v[0].pitch, Some(60));
        p.note_on(&mut v, 64, 100);
        assert_eq!(v[0].pitch, Some(64));
        p.note_off(&mut v, 64);
        assert_eq!(v[0].pitch, None);
    }

    #[test]
    fn filter_swallows_keys_while_pedal_down() {
        let (mut p, mut v) = part(AllocationMode::Mono, 1);
        p.midi_mut().sustain_mode = SustainMode::Filter;
        p.note_on(&mut v, 60, 100);
        p.control_change(&mut v, 64, 127);
        // New key is tracked but silent.
        p.note_on(&mut v, 72, 100);
        assert_eq!(v[0].pitch, Some(60));
        p.note_off(&mut v, 72);
        assert_eq!(v[0].pitch, Some(60));
        p.control_change(&mut v, 64, 0);
        p.note_off(&mut v, 60);
        assert_eq!(v[0].pitch, None);
    }

    #[test]
    fn accepts_applies_channel_and_ranges() {
        let mut p = Part::new();
        p.midi_mut().channel = 2;
        p.midi_mut().min_note = 48;
        p.midi_mut().max_note = 72;
        p.midi_mut().min_velocity = 10;
        assert!(p.accepts(2, 60, 100));
        assert!(!p.accepts(1, 60, 100));
        assert!(!p.accepts(2, 80, 100));
        assert!(!p.accepts(2, 60, 5));
        p.midi_mut().channel = OMNI_CHANNEL;
        assert!(p.accepts(9, 60, 100));
    }

    #[test]
    fn wrapped_note_range_accepts_outside_span() {
        let mut p = Part::new();
        p.midi_mut().min_note = 100;
        p.midi_mut().max_note = 20;
        assert!(p.accepts(0, 110, 100));
        assert!(p.accepts(0, 10, 100));
        assert!(!p.accepts(0, 60, 100));
    }

    #[test]
    fn transpose_shifts_octaves_within_midi_range() {
        let mut p = Part::new();
        p.midi_mut().transpose_octaves = 2;
        assert_eq!(p.transpose(60), 84);
        // Clamped so the result stays a valid note.
        assert_eq!(p.transpose(120), 120);
    }

    #[test]
    fn recorded_keys_land_in_the_deck() {
        let (mut p, mut v) = part(AllocationMode::Mono, 1);
        p.set_recording(true);
        p.note_on(&mut v, 60, 100);
        p.advance_deck(&mut v, None, 1000, true);
        p.note_off(&mut v, 60);
        assert_eq!(p.deck().len(), 1);
        let idx = p.deck().notes_by_age()[0];
        assert_eq!(p.deck().note_span(idx), (0, 1000));
        assert_eq!(p.deck().note_pitch(idx), 60);
    }

    #[test]
    fn loop_playback_reenters_arbitration() {
        let (mut p, mut v) = part(AllocationMode::Mono, 1);
        p.set_recording(true);
        p.note_on(&mut v, 60, 100);
        p.advance_deck(&mut v, None, 1000, true);
        p.note_off(&mut v, 60);
        p.set_recording(false);
        assert_eq!(v[0].pitch, None);

        // Wrap to the loop start: the recorded note replays.
        p.advance_deck(&mut v, None, 0, true);
        assert_eq!(v[0].pitch, Some(60));
        p.advance_deck(&mut v, None, 1000, true);
        assert_eq!(v[0].pitch, None);
    }

    #[test]
    fn delete_recording_silences_loop_notes() {
        let (mut p, mut v) = part(AllocationMode::Mono, 1);
        p.set_recording(true);
        p.note_on(&mut v, 60, 100);
        p.advance_deck(&mut v, None, 1000, true);
        p.note_off(&mut v, 60);
        p.set_recording(false);
        p.advance_deck(&mut v, None, 0, true);
        assert_eq!(v[0].pitch, Some(60));

        p.control_change(&mut v, 111, 127);
        assert_eq!(v[0].pitch, None);
        assert!(p.deck().is_empty());
    }

    #[test]
    fn velocity_rescaling_spreads_filter_window() {
        let mut p = Part::new();
        p.midi_mut().min_velocity = 64;
        p.midi_mut().max_velocity = 127;
        assert_eq!(p.rescale_velocity(64), 0);
        assert!(p.rescale_velocity(127) >= 120);
    }
}
