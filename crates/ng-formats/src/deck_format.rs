//! Loop deck record.
//!
//! Layout: `NGLP` magic, version, note count, then one 5-byte packed
//! record per note in age order. Positions are stored right-shifted from
//! 16 to 13 bits; pitch and velocity take 7 bits each:
//!
//! ```text
//! bits  0..13   on_pos  >> 3
//! bits 13..26   off_pos >> 3
//! bits 26..33   pitch
//! bits 33..40   velocity
//! ```
//!
//! Decoding replays the recording protocol per note (seek to onset, open,
//! seek to offset, close), so the rebuilt chains are exactly what live
//! recording would have produced.

use std::io::{Cursor, Read, Write};

use binrw::{binrw, BinRead, BinWrite};
use ng_engine::Deck;

use crate::FormatError;

const DECK_VERSION: u8 = 1;
/// 16-bit ring positions keep their top 13 bits.
const POS_SHIFT: u8 = 3;

#[binrw]
#[brw(little, magic = b"NGLP")]
struct DeckHeader {
    version: u8,
    count: u8,
}

fn pack_note(pitch: u8, velocity: u8, on_pos: u16, off_pos: u16) -> [u8; 5] {
    let packed = u64::from(on_pos >> POS_SHIFT)
        | u64::from(off_pos >> POS_SHIFT) << 13
        | u64::from(pitch & 0x7f) << 26
        | u64::from(velocity & 0x7f) << 33;
    let bytes = packed.to_le_bytes();
    [bytes[0], bytes[1], bytes[2], bytes[3], bytes[4]]
}

fn unpack_note(bytes: [u8; 5]) -> (u8, u8, u16, u16) {
    let mut full = [0u8; 8];
    full[..5].copy_from_slice(&bytes);
    let packed = u64::from_le_bytes(full);
    let on_pos = ((packed & 0x1fff) as u16) << POS_SHIFT;
    let off_pos = (((packed >> 13) & 0x1fff) as u16) << POS_SHIFT;
    let pitch = ((packed >> 26) & 0x7f) as u8;
    let velocity = ((packed >> 33) & 0x7f) as u8;
    (pitch, velocity, on_pos, off_pos)
}

pub(crate) fn write_deck(deck: &Deck, cursor: &mut Cursor<Vec<u8>>) -> Result<(), FormatError> {
    DeckHeader {
        version: DECK_VERSION,
        count: deck.len() as u8,
    }
    .write(cursor)?;
    for index in deck.notes_by_age() {
        let (on_pos, off_pos) = deck.note_span(index);
        let note = pack_note(
            deck.note_pitch(index),
            deck.note_velocity(index),
            on_pos,
            off_pos,
        );
        cursor
            .write_all(&note)
            .map_err(|_| FormatError::UnexpectedEof)?;
    }
    Ok(())
}

pub(crate) fn read_deck(cursor: &mut Cursor<&[u8]>) -> Result<Deck, FormatError> {
    let header = DeckHeader::read(cursor)?;
    if header.version != DECK_VERSION {
        return Err(FormatError::UnsupportedVersion);
    }
    let mut deck = Deck::new();
    for _ in 0..header.count {
        let mut raw = [0u8; 5];
        cursor
            .read_exact(&mut raw)
            .map_err(|_| FormatError::UnexpectedEof)?;
        let (pitch, velocity, on_pos, off_pos) = unpack_note(raw);
        deck.restore_note(pitch, velocity, on_pos, off_pos);
    }
    // Rewind to the loop start so playback resumes from position 0.
    deck.advance(0, false, |_| {});
    Ok(deck)
}

/// Serialize a deck into a standalone record.
pub fn pack_deck(deck: &Deck) -> Result<Vec<u8>, FormatError> {
    let mut cursor = Cursor::new(Vec::new());
    write_deck(deck, &mut cursor)?;
    Ok(cursor.into_inner())
}

/// Rebuild a deck from a record produced by [`pack_deck`].
pub fn unpack_deck(bytes: &[u8]) -> Result<Deck, FormatError> {
    read_deck(&mut Cursor::new(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn note_packing_preserves_aligned_positions() {
        let packed = pack_note(60, 100, 0, 1000);
        assert_eq!(unpack_note(packed), (60, 100, 0, 1000));
    }

    #[test]
    fn note_packing_truncates_to_13_bits() {
        let packed = pack_note(60, 100, 5, 1003);
        // Low 3 bits of each position are dropped.
        assert_eq!(unpack_note(packed), (60, 100, 0, 1000));
    }

    #[test]
    fn deck_roundtrip() {
        let mut deck = Deck::new();
        deck.restore_note(60, 100, 0, 1000);
        let bytes = pack_deck(&deck).unwrap();
        let restored = unpack_deck(&bytes).unwrap();
        assert_eq!(restored.len(), 1);
        let idx = restored.notes_by_age()[0];
        assert_eq!(restored.note_pitch(idx), 60);
        assert_eq!(restored.note_velocity(idx), 100);
        assert_eq!(restored.note_span(idx), (0, 1000));
    }

    #[test]
    fn deck_roundtrip_many_notes_keeps_age_order() {
        let mut deck = Deck::new();
        deck.restore_note(60, 100, 0, 800);
        deck.restore_note(64, 90, 1000, 1800);
        deck.restore_note(67, 80, 2000, 2800);
        let restored = unpack_deck(&pack_deck(&deck).unwrap()).unwrap();
        let pitches: Vec<u8> = restored
            .notes_by_age()
            .iter()
            .map(|&i| restored.note_pitch(i))
            .collect();
        assert_eq!(pitches, vec![60, 64, 67]);
    }

    #[test]
    fn restored_deck_replays() {
        let mut deck = Deck::new();
        deck.restore_note(60, 100, 1000, 2000);
        let mut restored = unpack_deck(&pack_deck(&deck).unwrap()).unwrap();
        let mut events = vec![];
        restored.advance(1500, true, |e| events.push(e));
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            ng_engine::DeckEvent::NoteOn { pitch: 60, .. }
        ));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = pack_deck(&Deck::new()).unwrap();
        bytes[0] = b'X';
        assert!(matches!(
            unpack_deck(&bytes),
            Err(FormatError::InvalidHeader)
        ));
    }

    #[test]
    fn truncated_record_is_rejected() {
        let mut deck = Deck::new();
        deck.restore_note(60, 100, 0, 1000);
        let bytes = pack_deck(&deck).unwrap();
        assert!(matches!(
            unpack_deck(&bytes[..bytes.len() - 2]),
            Err(FormatError::UnexpectedEof)
        ));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut bytes = pack_deck(&Deck::new()).unwrap();
        bytes[4] = 99;
        assert!(matches!(
            unpack_deck(&bytes),
            Err(FormatError::UnsupportedVersion)
        ));
    }
}
