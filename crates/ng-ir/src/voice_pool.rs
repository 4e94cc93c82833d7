//! Voice assignment pool.
//!
//! Maps sounding pitches to voice indices with a least-recently-used
//! replacement order. The pool only tracks which pitch occupies which
//! voice; deciding *whether* to steal, and from whom, is the caller's
//! job, expressed through the steal hint.

use arrayvec::ArrayVec;

/// Fixed-capacity pitch-to-voice map with LRU replacement.
///
/// `M` is the compile-time ceiling; the active voice count is set at
/// runtime with [`VoicePool::set_size`] and may be lower.
#[derive(Clone, Debug)]
pub struct VoicePool<const M: usize> {
    size: usize,
    notes: [Option<u8>; M],
    /// Replacement order, least recently used first.
    lru: ArrayVec<u8, M>,
}

impl<const M: usize> Default for VoicePool<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const M: usize> VoicePool<M> {
    pub fn new() -> Self {
        Self {
            size: 0,
            notes: [None; M],
            lru: ArrayVec::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Set the active voice count and reset all assignments.
    pub fn set_size(&mut self, size: usize) {
        self.size = size.min(M);
        self.notes = [None; M];
        self.lru.clear();
        for v in 0..self.size {
            self.lru.push(v as u8);
        }
    }

    /// Drop all assignments, keeping the size and replacement order.
    pub fn clear_notes(&mut self) {
        self.notes = [None; M];
    }

    /// The pitch currently sounding on `voice`, if any.
    pub fn note(&self, voice: usize) -> Option<u8> {
        self.notes.get(voice).copied().flatten()
    }

    /// The voice currently sounding `pitch`, if any.
    pub fn find(&self, pitch: u8) -> Option<usize> {
        self.notes[..self.size]
            .iter()
            .position(|&n| n == Some(pitch))
    }

    /// Assign a voice to `pitch`.
    ///
    /// A pitch already sounding keeps its voice. Otherwise a free voice is
    /// chosen (the hint when it is free, else the least recently used free
    /// voice). When every voice is busy, the hint is stolen; with no valid
    /// hint the request fails and the note stays unvoiced.
    pub fn note_on(&mut self, pitch: u8, steal_hint: Option<usize>) -> Option<usize> {
        if let Some(v) = self.find(pitch) {
            self.touch(v);
            return Some(v);
        }
        let free = match steal_hint {
            Some(h) if h < self.size && self.notes[h].is_none() => Some(h),
            _ => self
                .lru
                .iter()
                .map(|&v| v as usize)
                .find(|&v| self.notes[v].is_none()),
        };
        let voice = match free {
            Some(v) => v,
            None => match steal_hint {
                Some(h) if h < self.size => h,
                _ => return None,
            },
        };
        self.notes[voice] = Some(pitch);
        self.touch(voice);
        Some(voice)
    }

    /// Release the voice sounding `pitch` and make it the first candidate
    /// for reuse. Returns the freed voice.
    pub fn note_off(&mut self, pitch: u8) -> Option<usize> {
        let voice = self.find(pitch)?;
        self.notes[voice] = None;
        self.lru.retain(|&mut v| v as usize != voice);
        self.lru.insert(0, voice as u8);
        Some(voice)
    }

    fn touch(&mut self, voice: usize) {
        self.lru.retain(|&mut v| v as usize != voice);
        self.lru.push(voice as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(size: usize) -> VoicePool<8> {
        let mut p = VoicePool::new();
        p.set_size(size);
        p
    }

    #[test]
    fn assigns_free_voices_in_order() {
        let mut p = pool(3);
        assert_eq!(p.note_on(60, None), Some(0));
        assert_eq!(p.note_on(64, None), Some(1));
        assert_eq!(p.note_on(67, None), Some(2));
        assert_eq!(p.note(1), Some(64));
    }

    #[test]
    fn repeated_pitch_keeps_its_voice() {
        let mut p = pool(3);
        p.note_on(60, None);
        assert_eq!(p.note_on(60, None), Some(0));
        assert_eq!(p.find(60), Some(0));
    }

    #[test]
    fn freed_voice_is_reused_first() {
        let mut p = pool(3);
        p.note_on(60, None);
        p.note_on(64, None);
        assert_eq!(p.note_off(60), Some(0));
        assert_eq!(p.note_on(67, None), Some(0));
    }

    #[test]
    fn full_pool_steals_the_hint() {
        let mut p = pool(2);
        p.note_on(60, None);
        p.note_on(64, None);
        assert_eq!(p.note_on(67, Some(1)), Some(1));
        assert_eq!(p.note(1), Some(67));
        assert_eq!(p.find(64), None);
    }

    #[test]
    fn full_pool_without_hint_fails() {
        let mut p = pool(2);
        p.note_on(60, None);
        p.note_on(64, None);
        assert_eq!(p.note_on(67, None), None);
        assert_eq!(p.find(60), Some(0));
        assert_eq!(p.find(64), Some(1));
    }

    #[test]
    fn free_hint_is_preferred_over_lru() {
        let mut p = pool(3);
        p.note_on(60, None);
        assert_eq!(p.note_on(64, Some(2)), Some(2));
    }

    #[test]
    fn hint_beyond_size_is_ignored() {
        let mut p = pool(2);
        p.note_on(60, None);
        p.note_on(64, None);
        assert_eq!(p.note_on(67, Some(5)), None);
    }
}
