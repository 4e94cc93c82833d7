//! Loop recorder.
//!
//! A fixed pool of 30 note slots threaded by two independent circular
//! intrusive lists: one ordered by onset position, one by offset position.
//! Each list's head is the slot whose event the playback cursor has most
//! recently passed, so the next upcoming event is the head's successor.
//! Positions live on a 16-bit cyclic ring; one loop period maps onto the
//! full ring and [`passed`] is the single wraparound-safety predicate.
//!
//! Recording and playback are concurrent: once the first note exists the
//! deck keeps replaying it while new input is overdubbed on top.

use heapless::Vec;

/// Slot capacity of a deck.
pub const MAX_DECK_NOTES: usize = 30;

/// Stable handle to a deck note slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NoteIndex(u8);

impl NoteIndex {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// What happens to recorded material when new input arrives.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RecordMode {
    /// New notes stack on top of the existing loop.
    #[default]
    Overdub,
    /// The next recorded note first wipes the loop.
    EraseOnNextInput,
}

/// Playback callbacks produced by [`Deck::advance`] and the removal
/// operations. The part re-enters its arbitration path with these exactly
/// as it would for a live key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeckEvent {
    NoteOn {
        index: NoteIndex,
        pitch: u8,
        velocity: u8,
    },
    NoteOff {
        index: NoteIndex,
        pitch: u8,
    },
}

#[derive(Clone, Copy, Debug, Default)]
struct Note {
    on_pos: u16,
    off_pos: u16,
    pitch: u8,
    velocity: u8,
    /// Rank by recording order; 0 is the oldest live note.
    age: u8,
}

/// Has `target` been crossed while moving from `before` to `after` on the
/// 16-bit ring? Exact in both the straight and the wrapped case; this is
/// the only wraparound reasoning in the recorder.
fn passed(target: u16, before: u16, after: u16) -> bool {
    if before < after {
        target > before && target <= after
    } else {
        target > before || target <= after
    }
}

/// Fixed-capacity note loop with concurrent record and playback.
#[derive(Clone, Debug)]
pub struct Deck {
    notes: [Note; MAX_DECK_NOTES],
    /// Circular successor links, `None` while the slot is not in the chain.
    /// Every live note is in the on-chain; a note still being recorded has
    /// no off-chain link yet.
    next_on: [Option<NoteIndex>; MAX_DECK_NOTES],
    next_off: [Option<NoteIndex>; MAX_DECK_NOTES],
    /// Last-passed slot of each chain, `None` when the chain is empty.
    head_on: Option<NoteIndex>,
    head_off: Option<NoteIndex>,
    /// Slot recycling.
    next_free: [Option<NoteIndex>; MAX_DECK_NOTES],
    free_head: Option<NoteIndex>,
    pos: u16,
    size: u8,
    mode: RecordMode,
}

impl Default for Deck {
    fn default() -> Self {
        Self::new()
    }
}

impl Deck {
    pub fn new() -> Self {
        let mut deck = Self {
            notes: [Note::default(); MAX_DECK_NOTES],
            next_on: [None; MAX_DECK_NOTES],
            next_off: [None; MAX_DECK_NOTES],
            head_on: None,
            head_off: None,
            next_free: [None; MAX_DECK_NOTES],
            free_head: None,
            pos: 0,
            size: 0,
            mode: RecordMode::Overdub,
        };
        deck.rebuild_free_list();
        deck
    }

    pub fn len(&self) -> usize {
        self.size as usize
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn pos(&self) -> u16 {
        self.pos
    }

    pub fn mode(&self) -> RecordMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: RecordMode) {
        self.mode = mode;
    }

    /// Is the slot holding a live note?
    pub fn is_live(&self, index: NoteIndex) -> bool {
        self.next_on[index.index()].is_some()
    }

    /// Pitch of a live note.
    pub fn note_pitch(&self, index: NoteIndex) -> u8 {
        self.notes[index.index()].pitch
    }

    /// Recording-order rank of a live note.
    pub fn note_age(&self, index: NoteIndex) -> u8 {
        self.notes[index.index()].age
    }

    /// Onset and offset positions of a live note.
    pub fn note_span(&self, index: NoteIndex) -> (u16, u16) {
        let n = &self.notes[index.index()];
        (n.on_pos, n.off_pos)
    }

    pub fn note_velocity(&self, index: NoteIndex) -> u8 {
        self.notes[index.index()].velocity
    }

    /// The next upcoming onset, if any note exists.
    pub fn peek_next_on(&self) -> Option<NoteIndex> {
        self.next_on[self.head_on?.index()]
    }

    /// Open a new note at the current position. A full deck evicts its
    /// oldest note first; recording never rejects input.
    pub fn record_note_on(
        &mut self,
        pitch: u8,
        velocity: u8,
        mut emit: impl FnMut(DeckEvent),
    ) -> NoteIndex {
        if self.size as usize == MAX_DECK_NOTES {
            self.remove_oldest(&mut emit);
        }
        // Eviction guaranteed a free slot.
        let index = match self.alloc_slot() {
            Some(i) => i,
            None => NoteIndex(0),
        };
        self.notes[index.index()] = Note {
            on_pos: self.pos,
            off_pos: self.pos,
            pitch,
            velocity,
            age: self.size,
        };
        Self::link(&mut self.next_on, &mut self.head_on, index);
        self.next_off[index.index()] = None;
        self.size += 1;
        index
    }

    /// Close a note at the current position. Returns `false` if the note
    /// was already removed or already closed, so double NoteOff is a no-op.
    pub fn record_note_off(&mut self, index: NoteIndex) -> bool {
        if self.next_on[index.index()].is_none() || self.next_off[index.index()].is_some() {
            return false;
        }
        self.notes[index.index()].off_pos = self.pos;
        Self::link(&mut self.next_off, &mut self.head_off, index);
        true
    }

    /// Advance the cursor to `new_pos`, emitting events for every note
    /// boundary crossed. Offsets are walked before onsets so a note ending
    /// where another begins never overlaps it. An onset whose note is
    /// still open after a full loop is force-closed in place, with its
    /// NoteOff emitted before the NoteOn.
    pub fn advance(&mut self, new_pos: u16, play: bool, mut emit: impl FnMut(DeckEvent)) {
        if let Some(mut head) = self.head_off {
            let mut first_seen = None;
            loop {
                let next = match self.next_off[head.index()] {
                    Some(n) => n,
                    None => break,
                };
                if first_seen == Some(next) {
                    break;
                }
                first_seen.get_or_insert(next);
                if !passed(self.notes[next.index()].off_pos, self.pos, new_pos) {
                    break;
                }
                head = next;
                self.head_off = Some(head);
                if play {
                    emit(DeckEvent::NoteOff {
                        index: next,
                        pitch: self.notes[next.index()].pitch,
                    });
                }
            }
        }

        if let Some(mut head) = self.head_on {
            let mut first_seen = None;
            loop {
                let next = match self.next_on[head.index()] {
                    Some(n) => n,
                    None => break,
                };
                if first_seen == Some(next) {
                    break;
                }
                first_seen.get_or_insert(next);
                if !passed(self.notes[next.index()].on_pos, self.pos, new_pos) {
                    break;
                }
                head = next;
                self.head_on = Some(head);
                let note = self.notes[next.index()];
                if self.next_off[next.index()].is_none() {
                    // Held for an entire loop without a NoteOff; close it
                    // here so it retriggers instead of dangling.
                    self.record_note_off(next);
                    if play {
                        emit(DeckEvent::NoteOff {
                            index: next,
                            pitch: note.pitch,
                        });
                    }
                }
                if play {
                    emit(DeckEvent::NoteOn {
                        index: next,
                        pitch: note.pitch,
                        velocity: note.velocity,
                    });
                }
            }
        }

        self.pos = new_pos;
    }

    /// Remove the note with the given age ordinal, closing the age gap.
    /// Emits a NoteOff so a currently-sounding instance is not left stuck;
    /// the receiving part ignores it when the note is silent.
    pub fn remove_by_age(&mut self, age: u8, mut emit: impl FnMut(DeckEvent)) -> bool {
        let target = match self.find_by_age(age) {
            Some(i) => i,
            None => return false,
        };
        emit(DeckEvent::NoteOff {
            index: target,
            pitch: self.notes[target.index()].pitch,
        });
        Self::unlink(&mut self.next_on, &mut self.head_on, target);
        Self::unlink(&mut self.next_off, &mut self.head_off, target);
        for i in 0..MAX_DECK_NOTES {
            let idx = NoteIndex(i as u8);
            if self.is_live(idx) && self.notes[i].age > age {
                self.notes[i].age -= 1;
            }
        }
        self.next_on[target.index()] = None;
        self.next_off[target.index()] = None;
        self.free_slot(target);
        self.size -= 1;
        true
    }

    pub fn remove_oldest(&mut self, emit: impl FnMut(DeckEvent)) -> bool {
        self.remove_by_age(0, emit)
    }

    pub fn remove_newest(&mut self, emit: impl FnMut(DeckEvent)) -> bool {
        if self.size == 0 {
            return false;
        }
        self.remove_by_age(self.size - 1, emit)
    }

    /// Delete the whole recording, emitting a NoteOff per live note first.
    pub fn remove_all(&mut self, mut emit: impl FnMut(DeckEvent)) {
        while self.size > 0 {
            self.remove_oldest(&mut emit);
        }
        self.head_on = None;
        self.head_off = None;
        self.next_on = [None; MAX_DECK_NOTES];
        self.next_off = [None; MAX_DECK_NOTES];
        self.rebuild_free_list();
        self.mode = RecordMode::Overdub;
    }

    /// Re-enter a note as if it were being recorded live: seek to its
    /// onset, open it, seek to its offset, close it. Persistence restores
    /// a deck by replaying this for every note in age order.
    pub fn restore_note(&mut self, pitch: u8, velocity: u8, on_pos: u16, off_pos: u16) {
        self.advance(on_pos, false, |_| {});
        let index = self.record_note_on(pitch, velocity, |_| {});
        self.advance(off_pos, false, |_| {});
        self.record_note_off(index);
    }

    /// Live notes in age order, oldest first.
    pub fn notes_by_age(&self) -> Vec<NoteIndex, MAX_DECK_NOTES> {
        let mut out = Vec::new();
        for age in 0..self.size {
            if let Some(idx) = self.find_by_age(age) {
                let _ = out.push(idx);
            }
        }
        out
    }

    fn find_by_age(&self, age: u8) -> Option<NoteIndex> {
        (0..MAX_DECK_NOTES as u8)
            .map(NoteIndex)
            .find(|&i| self.is_live(i) && self.notes[i.index()].age == age)
    }

    /// Insert `index` after the chain head and make it the new head. The
    /// inserted event sits exactly at the cursor, so it counts as already
    /// passed for this cycle.
    fn link(
        next: &mut [Option<NoteIndex>; MAX_DECK_NOTES],
        head: &mut Option<NoteIndex>,
        index: NoteIndex,
    ) {
        match *head {
            Some(h) => {
                next[index.index()] = next[h.index()];
                next[h.index()] = Some(index);
            }
            None => {
                next[index.index()] = Some(index);
            }
        }
        *head = Some(index);
    }

    /// Unlink `index` from a circular chain by walking to its predecessor.
    /// No-op if the slot is not in this chain.
    fn unlink(
        next: &mut [Option<NoteIndex>; MAX_DECK_NOTES],
        head: &mut Option<NoteIndex>,
        index: NoteIndex,
    ) {
        if next[index.index()].is_none() {
            return;
        }
        let mut pred = index;
        while next[pred.index()] != Some(index) {
            pred = match next[pred.index()] {
                Some(p) => p,
                None => return,
            };
        }
        if pred == index {
            // Sole member; the chain becomes empty.
            *head = None;
        } else {
            next[pred.index()] = next[index.index()];
            if *head == Some(index) {
                *head = Some(pred);
            }
        }
        next[index.index()] = None;
    }

    fn alloc_slot(&mut self) -> Option<NoteIndex> {
        let index = self.free_head?;
        self.free_head = self.next_free[index.index()];
        self.next_free[index.index()] = None;
        Some(index)
    }

    fn free_slot(&mut self, index: NoteIndex) {
        self.next_free[index.index()] = self.free_head;
        self.free_head = Some(index);
    }

    fn rebuild_free_list(&mut self) {
        self.free_head = Some(NoteIndex(0));
        for i in 0..MAX_DECK_NOTES {
            self.next_free[i] = if i + 1 < MAX_DECK_NOTES {
                Some(NoteIndex(i as u8 + 1))
            } else {
                None
            };
        }
    }
}
