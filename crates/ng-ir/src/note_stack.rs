//! Priority-ordered note stack.
//!
//! Fixed-capacity store of currently-held notes. Slots are stable for the
//! lifetime of a note (callers key per-slot metadata off [`SlotId`]), and a
//! singly-linked recency chain over the slots answers the ordering queries:
//! most/least recent, lowest/highest pitch, and rank lookups in either
//! direction.

use crate::note::NoteEntry;

/// Tie-break order over held notes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NotePriority {
    /// Most recently pressed key wins.
    #[default]
    LastPlayed,
    /// Oldest held key wins.
    FirstPlayed,
    /// Lowest pitch wins.
    LowestNote,
    /// Highest pitch wins.
    HighestNote,
}

impl NotePriority {
    /// Decode from a stored settings byte, defaulting to last-played.
    pub fn from_byte(b: u8) -> Self {
        match b {
            1 => NotePriority::FirstPlayed,
            2 => NotePriority::LowestNote,
            3 => NotePriority::HighestNote,
            _ => NotePriority::LastPlayed,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            NotePriority::LastPlayed => 0,
            NotePriority::FirstPlayed => 1,
            NotePriority::LowestNote => 2,
            NotePriority::HighestNote => 3,
        }
    }
}

/// Stable handle to an occupied stack slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotId(u8);

impl SlotId {
    /// Slot position, usable to index caller-side per-slot arrays.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Fixed-capacity note stack with a recency chain.
///
/// Pressing a pitch that is already held re-inserts it at the top of the
/// recency order. When full, the least recently played note is evicted.
#[derive(Clone, Debug)]
pub struct NoteStack<const N: usize> {
    entries: [NoteEntry; N],
    occupied: [bool; N],
    /// Recency chain: `next[i]` is the slot played just before slot `i`.
    next: [Option<u8>; N],
    /// Most recently played slot.
    head: Option<u8>,
    size: u8,
}

impl<const N: usize> Default for NoteStack<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> NoteStack<N> {
    pub fn new() -> Self {
        Self {
            entries: [NoteEntry::default(); N],
            occupied: [false; N],
            next: [None; N],
            head: None,
            size: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.size as usize
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn capacity(&self) -> usize {
        N
    }

    /// Forget all held notes.
    pub fn clear(&mut self) {
        self.occupied = [false; N];
        self.next = [None; N];
        self.head = None;
        self.size = 0;
    }

    /// Record a key press. Returns the slot now holding the note.
    ///
    /// A pitch already in the stack is moved to the top of the recency
    /// order (its old slot is released first, so per-slot metadata must be
    /// re-derived by the caller). A full stack evicts its least recent
    /// note rather than rejecting input.
    pub fn note_on(&mut self, pitch: u8, velocity: u8) -> SlotId {
        self.note_off(pitch);
        if self.size as usize == N {
            if let Some(oldest) = self.least_recent() {
                let evicted = self.entries[oldest.index()].pitch;
                self.note_off(evicted);
            }
        }
        // Occupancy search can't fail: an eviction just guaranteed a hole.
        let slot = self
            .occupied
            .iter()
            .position(|o| !o)
            .unwrap_or(0) as u8;
        self.entries[slot as usize] = NoteEntry::new(pitch, velocity);
        self.occupied[slot as usize] = true;
        self.next[slot as usize] = self.head;
        self.head = Some(slot);
        self.size += 1;
        SlotId(slot)
    }

    /// Record a key release. Returns the slot the note occupied, or `None`
    /// if the pitch was not held (double NoteOff is a no-op).
    pub fn note_off(&mut self, pitch: u8) -> Option<SlotId> {
        let slot = self.find(pitch)?;
        let i = slot.0;
        // Unlink from the recency chain.
        if self.head == Some(i) {
            self.head = self.next[i as usize];
        } else {
            let mut cur = self.head;
            while let Some(c) = cur {
                if self.next[c as usize] == Some(i) {
                    self.next[c as usize] = self.next[i as usize];
                    break;
                }
                cur = self.next[c as usize];
            }
        }
        self.next[i as usize] = None;
        self.occupied[i as usize] = false;
        self.size -= 1;
        Some(slot)
    }

    /// Locate the slot holding `pitch`.
    pub fn find(&self, pitch: u8) -> Option<SlotId> {
        (0..N as u8)
            .find(|&i| self.occupied[i as usize] && self.entries[i as usize].pitch == pitch)
            .map(SlotId)
    }

    pub fn note(&self, slot: SlotId) -> &NoteEntry {
        &self.entries[slot.index()]
    }

    pub fn note_mut(&mut self, slot: SlotId) -> &mut NoteEntry {
        &mut self.entries[slot.index()]
    }

    /// The slot of the most recently played note.
    pub fn most_recent(&self) -> Option<SlotId> {
        self.head.map(SlotId)
    }

    /// The slot of the least recently played note.
    pub fn least_recent(&self) -> Option<SlotId> {
        let mut cur = self.head?;
        while let Some(n) = self.next[cur as usize] {
            cur = n;
        }
        Some(SlotId(cur))
    }

    /// The note at `rank` under the given priority rule (rank 0 is the
    /// priority note). `None` once `rank >= size()`.
    pub fn note_by_priority(&self, rule: NotePriority, rank: usize) -> Option<NoteEntry> {
        self.slot_by_priority(rule, rank)
            .map(|s| self.entries[s.index()])
    }

    /// The slot at `rank` under the given priority rule.
    pub fn slot_by_priority(&self, rule: NotePriority, rank: usize) -> Option<SlotId> {
        if rank >= self.size() {
            return None;
        }
        match rule {
            NotePriority::LastPlayed => self.nth_recent(rank),
            NotePriority::FirstPlayed => self.nth_recent(self.size() - 1 - rank),
            NotePriority::LowestNote => self.nth_by_pitch(rank, true),
            NotePriority::HighestNote => self.nth_by_pitch(rank, false),
        }
    }

    /// Rank of `pitch` under the given priority rule (0 = priority note),
    /// or `None` if the pitch is not held.
    pub fn priority_for_note(&self, rule: NotePriority, pitch: u8) -> Option<usize> {
        self.find(pitch)?;
        (0..self.size()).find(|&rank| {
            self.note_by_priority(rule, rank)
                .is_some_and(|e| e.pitch == pitch)
        })
    }

    /// Occupied slots in recency order (most recent first).
    pub fn slots(&self) -> impl Iterator<Item = SlotId> + '_ {
        let mut cur = self.head;
        core::iter::from_fn(move || {
            let slot = cur?;
            cur = self.next[slot as usize];
            Some(SlotId(slot))
        })
    }

    fn nth_recent(&self, rank: usize) -> Option<SlotId> {
        self.slots().nth(rank)
    }

    /// Selection scan for the rank-th lowest (or highest) pitch. Pitches
    /// are unique within the stack (note_on dedupes), so a strictly
    /// increasing walk is sufficient.
    fn nth_by_pitch(&self, rank: usize, ascending: bool) -> Option<SlotId> {
        let mut prev: Option<u8> = None;
        let mut found = None;
        for _ in 0..=rank {
            found = None;
            let mut best: Option<u8> = None;
            for s in self.slots() {
                let p = self.entries[s.index()].pitch;
                let beyond_prev = match (prev, ascending) {
                    (Some(pp), true) => p > pp,
                    (Some(pp), false) => p < pp,
                    (None, _) => true,
                };
                let better = match (best, ascending) {
                    (Some(b), true) => p < b,
                    (Some(b), false) => p > b,
                    (None, _) => true,
                };
                if beyond_prev && better {
                    best = Some(p);
                    found = Some(s);
                }
            }
            prev = best;
            best?;
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn note_on_off_roundtrip() {
        let mut stack: NoteStack<4> = NoteStack::new();
        let slot = stack.note_on(60, 100);
        assert_eq!(stack.size(), 1);
        assert_eq!(stack.note(slot).pitch, 60);
        assert_eq!(stack.note_off(60), Some(slot));
        assert!(stack.is_empty());
    }

    #[test]
    fn double_note_off_is_noop() {
        let mut stack: NoteStack<4> = NoteStack::new();
        stack.note_on(60, 100);
        assert!(stack.note_off(60).is_some());
        assert!(stack.note_off(60).is_none());
        assert!(stack.note_off(72).is_none());
    }

    #[test]
    fn recency_order() {
        let mut stack: NoteStack<4> = NoteStack::new();
        stack.note_on(60, 1);
        stack.note_on(64, 2);
        stack.note_on(67, 3);
        let most = stack.most_recent().unwrap();
        assert_eq!(stack.note(most).pitch, 67);
        let least = stack.least_recent().unwrap();
        assert_eq!(stack.note(least).pitch, 60);
    }

    #[test]
    fn replay_moves_note_to_top() {
        let mut stack: NoteStack<4> = NoteStack::new();
        stack.note_on(60, 1);
        stack.note_on(64, 2);
        stack.note_on(60, 3);
        assert_eq!(stack.size(), 2);
        let most = stack.most_recent().unwrap();
        assert_eq!(stack.note(most).pitch, 60);
    }

    #[test]
    fn full_stack_evicts_least_recent() {
        let mut stack: NoteStack<3> = NoteStack::new();
        stack.note_on(60, 1);
        stack.note_on(62, 1);
        stack.note_on(64, 1);
        stack.note_on(65, 1);
        assert_eq!(stack.size(), 3);
        assert!(stack.find(60).is_none());
        assert!(stack.find(65).is_some());
    }

    #[test]
    fn priority_last_and_first() {
        let mut stack: NoteStack<4> = NoteStack::new();
        stack.note_on(60, 1);
        stack.note_on(67, 1);
        stack.note_on(64, 1);
        let last = |r| stack.note_by_priority(NotePriority::LastPlayed, r).unwrap().pitch;
        assert_eq!(last(0), 64);
        assert_eq!(last(1), 67);
        assert_eq!(last(2), 60);
        let first = |r| stack.note_by_priority(NotePriority::FirstPlayed, r).unwrap().pitch;
        assert_eq!(first(0), 60);
        assert_eq!(first(2), 64);
    }

    #[test]
    fn priority_by_pitch() {
        let mut stack: NoteStack<4> = NoteStack::new();
        stack.note_on(64, 1);
        stack.note_on(60, 1);
        stack.note_on(67, 1);
        let low = |r| stack.note_by_priority(NotePriority::LowestNote, r).unwrap().pitch;
        assert_eq!((low(0), low(1), low(2)), (60, 64, 67));
        let high = |r| stack.note_by_priority(NotePriority::HighestNote, r).unwrap().pitch;
        assert_eq!((high(0), high(1), high(2)), (67, 64, 60));
    }

    #[test]
    fn rank_out_of_range_is_none() {
        let mut stack: NoteStack<4> = NoteStack::new();
        stack.note_on(60, 1);
        assert!(stack.note_by_priority(NotePriority::LastPlayed, 1).is_none());
    }

    #[test]
    fn priority_for_note_inverts_rank() {
        let mut stack: NoteStack<4> = NoteStack::new();
        stack.note_on(60, 1);
        stack.note_on(67, 1);
        stack.note_on(64, 1);
        for rule in [
            NotePriority::LastPlayed,
            NotePriority::FirstPlayed,
            NotePriority::LowestNote,
            NotePriority::HighestNote,
        ] {
            for rank in 0..3 {
                let pitch = stack.note_by_priority(rule, rank).unwrap().pitch;
                assert_eq!(stack.priority_for_note(rule, pitch), Some(rank));
            }
        }
        assert_eq!(stack.priority_for_note(NotePriority::LastPlayed, 99), None);
    }

    #[test]
    fn slots_are_stable_across_other_removals() {
        let mut stack: NoteStack<4> = NoteStack::new();
        let s60 = stack.note_on(60, 1);
        let s64 = stack.note_on(64, 1);
        stack.note_off(60);
        assert_eq!(stack.find(64), Some(s64));
        // The freed slot is reused by the next press.
        let s67 = stack.note_on(67, 1);
        assert_eq!(s67.index(), s60.index());
    }
}
