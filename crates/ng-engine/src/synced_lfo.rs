//! Phase-locked cyclic position source.
//!
//! A 32-bit phase accumulator nudged toward an externally tapped tempo.
//! Each clock tick calls [`SyncedLfo::tap`] with the tick counter and the
//! period in ticks; each control-rate refresh advances the phase by the
//! current increment. The correction is proportional plus derivative, so
//! the phase converges on the tapped grid without stepping discontinuously.

/// Phase-locked oscillator driven by clock taps.
#[derive(Clone, Copy, Debug, Default)]
pub struct SyncedLfo {
    phase: u32,
    phase_increment: u32,
    previous_phase: u32,
    previous_target_phase: u32,
}

impl SyncedLfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current phase, full 32-bit resolution.
    pub fn phase(&self) -> u32 {
        self.phase
    }

    /// Phase truncated to the 16-bit cyclic position the deck consumes.
    pub fn position(&self) -> u16 {
        (self.phase >> 16) as u16
    }

    pub fn phase_increment(&self) -> u32 {
        self.phase_increment
    }

    /// Jump the phase directly, bypassing correction.
    pub fn set_phase(&mut self, phase: u32) {
        self.phase = phase;
    }

    /// Advance by the current increment. Returns the new phase.
    pub fn refresh(&mut self) -> u32 {
        self.phase = self.phase.wrapping_add(self.phase_increment);
        self.phase
    }

    /// Register one clock tick. `tick_counter` counts ticks since the loop
    /// started; `period_ticks` is the loop length in ticks.
    pub fn tap(&mut self, tick_counter: u32, period_ticks: u16) {
        if period_ticks == 0 {
            return;
        }
        let period = u32::from(period_ticks);
        let target_phase = ((tick_counter % period) * 65536 / period) << 16;
        let target_increment = target_phase.wrapping_sub(self.previous_target_phase);

        let d_error =
            target_increment.wrapping_sub(self.phase.wrapping_sub(self.previous_phase)) as i32;
        let p_error = target_phase.wrapping_sub(self.phase) as i32;
        let error = (d_error + (p_error >> 1)) >> 13;

        if error < 0 && error.unsigned_abs() > self.phase_increment {
            self.phase_increment = 0;
        } else if error > 0 && (u32::MAX - error as u32) < self.phase_increment {
            self.phase_increment = u32::MAX;
        } else {
            self.phase_increment = self.phase_increment.wrapping_add(error as u32);
        }

        self.previous_phase = self.phase;
        self.previous_target_phase = target_phase;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converges_on_tapped_period() {
        let mut lfo = SyncedLfo::new();
        // 24 ticks per cycle, 8 refreshes per tick. The correction gain is
        // gentle, so convergence takes on the order of 10k ticks.
        let mut tick = 0u32;
        for _ in 0..16_000 {
            lfo.tap(tick, 24);
            tick += 1;
            for _ in 0..8 {
                lfo.refresh();
            }
        }
        // One cycle spans 24 * 8 refreshes, so the increment should settle
        // near 2^32 / 192.
        let expected = (1u64 << 32) / 192;
        let got = u64::from(lfo.phase_increment());
        let err = got.abs_diff(expected);
        assert!(err < expected / 50, "increment {got} far from {expected}");
    }

    #[test]
    fn zero_period_tap_is_ignored() {
        let mut lfo = SyncedLfo::new();
        lfo.tap(5, 0);
        assert_eq!(lfo.phase_increment(), 0);
    }

    #[test]
    fn position_is_top_16_bits() {
        let mut lfo = SyncedLfo::new();
        lfo.set_phase(0x1234_8000);
        assert_eq!(lfo.position(), 0x1234);
    }
}
