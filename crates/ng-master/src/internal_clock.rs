//! Control-rate tempo clock.

/// Phase-accumulator clock producing 24 PPQN ticks at control rate.
///
/// Each [`InternalClock::process`] call adds the increment; the tick fires
/// on accumulator wraparound.
#[derive(Clone, Copy, Debug, Default)]
pub struct InternalClock {
    phase: u32,
    phase_increment: u32,
}

impl InternalClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset the phase and start ticking at the given increment.
    pub fn start(&mut self, phase_increment: u32) {
        self.phase = 0;
        self.phase_increment = phase_increment;
    }

    pub fn set_phase_increment(&mut self, phase_increment: u32) {
        self.phase_increment = phase_increment;
    }

    pub fn phase_increment(&self) -> u32 {
        self.phase_increment
    }

    /// Advance one control-rate step. Returns `true` when a tick fires.
    pub fn process(&mut self) -> bool {
        self.phase = self.phase.wrapping_add(self.phase_increment);
        self.phase < self.phase_increment
    }
}

/// Accumulator increment for `tempo` BPM at 24 PPQN, given the control
/// rate in Hz.
pub fn phase_increment_for_tempo(tempo_bpm: u16, control_rate_hz: u32) -> u32 {
    if control_rate_hz == 0 {
        return 0;
    }
    let ticks_per_minute = u64::from(tempo_bpm) * 24;
    ((ticks_per_minute << 32) / (60 * u64::from(control_rate_hz))) as u32
}
