//! Conductor for the notegrid engine.
//!
//! Owns the parts and the voice bank, routes incoming MIDI events to the
//! parts that accept them, and drives the clocks: the internal tempo clock
//! produces ticks, each tick taps the per-part loop oscillators, and every
//! control-rate refresh advances the loop decks to the present.

mod internal_clock;

pub use internal_clock::{phase_increment_for_tempo, InternalClock};
pub use ng_formats::{pack_part, unpack_part, FormatError};

use log::{info, warn};
use ng_engine::{Part, StepSource, SyncedLfo, Voice};
use ng_ir::MidiEvent;

/// Default loop length in clock ticks: one bar of 4/4 at 24 PPQN.
pub const DEFAULT_PERIOD_TICKS: u16 = 96;

struct PartSlot {
    part: Part,
    /// First voice index and voice count in the shared bank.
    voice_range: (usize, usize),
    lfo: SyncedLfo,
    period_ticks: u16,
    step_source: Option<Box<dyn StepSource>>,
}

/// The whole instrument: a voice bank shared by a set of parts.
pub struct Multi<V: Voice> {
    slots: Vec<PartSlot>,
    voices: Vec<V>,
    clock: InternalClock,
    control_rate_hz: u32,
    tempo_bpm: u16,
    tick: u32,
    running: bool,
}

impl<V: Voice> Multi<V> {
    /// Create a conductor over the given voice bank.
    pub fn new(voices: Vec<V>, control_rate_hz: u32) -> Self {
        Self {
            slots: Vec::new(),
            voices,
            clock: InternalClock::new(),
            control_rate_hz,
            tempo_bpm: 120,
            tick: 0,
            running: false,
        }
    }

    /// Add a part claiming the next `num_voices` voices from the bank.
    /// Returns the part index, or `None` when the bank is exhausted.
    pub fn add_part(&mut self, mut part: Part, num_voices: usize) -> Option<usize> {
        let start = self
            .slots
            .last()
            .map(|s| s.voice_range.0 + s.voice_range.1)
            .unwrap_or(0);
        if start + num_voices > self.voices.len() {
            warn!(
                "voice bank exhausted: {} requested at offset {}",
                num_voices, start
            );
            return None;
        }
        part.allocate_voices(num_voices);
        self.slots.push(PartSlot {
            part,
            voice_range: (start, num_voices),
            lfo: SyncedLfo::new(),
            period_ticks: DEFAULT_PERIOD_TICKS,
            step_source: None,
        });
        Some(self.slots.len() - 1)
    }

    pub fn num_parts(&self) -> usize {
        self.slots.len()
    }

    pub fn part(&self, index: usize) -> Option<&Part> {
        self.slots.get(index).map(|s| &s.part)
    }

    pub fn part_mut(&mut self, index: usize) -> Option<&mut Part> {
        self.slots.get_mut(index).map(|s| &mut s.part)
    }

    pub fn voices(&self) -> &[V] {
        &self.voices
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn tempo(&self) -> u16 {
        self.tempo_bpm
    }

    pub fn set_tempo(&mut self, bpm: u16) {
        self.tempo_bpm = bpm;
        self.clock
            .set_phase_increment(phase_increment_for_tempo(bpm, self.control_rate_hz));
    }

    /// Attach the generator feeding a part in arpeggiator/sequencer mode.
    pub fn set_step_source(&mut self, index: usize, source: Box<dyn StepSource>) {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.step_source = Some(source);
        }
    }

    /// Loop length for a part's deck, in clock ticks.
    pub fn set_loop_length(&mut self, index: usize, period_ticks: u16) {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.period_ticks = period_ticks.max(1);
        }
    }

    /// Route one MIDI event to every accepting part.
    pub fn handle(&mut self, event: MidiEvent) {
        let Multi { slots, voices, .. } = self;
        for slot in slots.iter_mut() {
            let bank = Self::bank(voices, slot.voice_range);
            match event {
                MidiEvent::NoteOn { channel, pitch, velocity } => {
                    if velocity == 0 {
                        // Running-status release; the velocity filter must
                        // never block it.
                        if slot.part.accepts(channel, pitch, slot.part.midi().min_velocity) {
                            slot.part.note_off(bank, pitch);
                        }
                    } else if slot.part.accepts(channel, pitch, velocity) {
                        slot.part.note_on(bank, pitch, velocity);
                    }
                }
                MidiEvent::NoteOff { channel, pitch } => {
                    // Velocity filters never block a release.
                    if slot.part.accepts(channel, pitch, slot.part.midi().min_velocity) {
                        slot.part.note_off(bank, pitch);
                    }
                }
                MidiEvent::ControlChange { channel, controller, value } => {
                    if slot.part.midi().channel == channel
                        || slot.part.midi().channel == ng_engine::OMNI_CHANNEL
                    {
                        slot.part.control_change(bank, controller, value);
                    }
                }
            }
        }
    }

    /// Start the transport from the top of the loop.
    pub fn start(&mut self) {
        info!("transport start at {} bpm", self.tempo_bpm);
        self.tick = 0;
        self.clock
            .start(phase_increment_for_tempo(self.tempo_bpm, self.control_rate_hz));
        let Multi { slots, voices, .. } = self;
        for slot in slots.iter_mut() {
            slot.lfo = SyncedLfo::new();
            // Rewind without sounding anything.
            let bank = Self::bank(voices, slot.voice_range);
            slot.part.advance_deck(bank, None, 0, false);
        }
        self.running = true;
    }

    /// Stop the transport. Every sounding note gets its NoteOff before
    /// state is cleared; a stuck note here is a bug, not best-effort.
    pub fn stop(&mut self) {
        info!("transport stop");
        self.running = false;
        let Multi { slots, voices, .. } = self;
        for slot in slots.iter_mut() {
            let bank = Self::bank(voices, slot.voice_range);
            slot.part.all_notes_off(bank);
        }
    }

    /// One control-rate step: advance the tempo clock, tap loop
    /// oscillators on ticks, then bring every deck up to the present.
    pub fn refresh(&mut self) {
        if self.running && self.clock.process() {
            self.tick = self.tick.wrapping_add(1);
            self.on_tick();
        }
        let play = self.running;
        let Multi { slots, voices, .. } = self;
        for slot in slots.iter_mut() {
            if !play {
                continue;
            }
            slot.lfo.refresh();
            let new_pos = slot.lfo.position();
            if new_pos != slot.part.deck().pos() || (slot.lfo.phase_increment() >> 16) > 0 {
                let bank = Self::bank(voices, slot.voice_range);
                let source = slot
                    .step_source
                    .as_deref_mut()
                    .map(|s| s as &mut dyn StepSource);
                slot.part.advance_deck(bank, source, new_pos, true);
            }
        }
    }

    fn on_tick(&mut self) {
        let tick = self.tick;
        let Multi { slots, voices, .. } = self;
        for slot in slots.iter_mut() {
            slot.lfo.tap(tick, slot.period_ticks);
            if let Some(source) = slot.step_source.as_deref_mut() {
                let bank = Self::bank(voices, slot.voice_range);
                slot.part.clock_step(bank, source, tick);
            }
        }
    }

    /// Begin mirroring a part's key input into its loop deck.
    pub fn start_recording(&mut self, index: usize) {
        info!("record arm part {index}");
        if let Some(slot) = self.slots.get_mut(index) {
            slot.part.set_recording(true);
        }
    }

    pub fn stop_recording(&mut self, index: usize) {
        info!("record disarm part {index}");
        if let Some(slot) = self.slots.get_mut(index) {
            slot.part.set_recording(false);
        }
    }

    /// Wipe a part's recording, silencing its loop notes first.
    pub fn delete_recording(&mut self, index: usize) {
        info!("delete recording on part {index}");
        let Multi { slots, voices, .. } = self;
        if let Some(slot) = slots.get_mut(index) {
            let bank = Self::bank(voices, slot.voice_range);
            slot.part.delete_recording(bank);
        }
    }

    fn bank(voices: &mut [V], (start, count): (usize, usize)) -> &mut [V] {
        &mut voices[start..start + count]
    }
}
