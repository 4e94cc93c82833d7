//! Part record.
//!
//! Layout: `NGPT` magic, version, one byte per setting, then the part's
//! deck record embedded verbatim. Settings enums travel as their stable
//! byte values; unknown bytes decode to the respective defaults so a
//! record from a newer build degrades instead of failing.

use std::io::Cursor;

use binrw::{binrw, BinRead, BinWrite};
use ng_engine::{AllocationMode, EnvelopeParams, LegatoMode, Part, PlayMode, SustainMode};
use ng_ir::NotePriority;

use crate::deck_format::{read_deck, write_deck};
use crate::FormatError;

const PART_VERSION: u8 = 1;

#[binrw]
#[brw(little, magic = b"NGPT")]
struct PartHeader {
    version: u8,
    channel: u8,
    min_note: u8,
    max_note: u8,
    min_velocity: u8,
    max_velocity: u8,
    sustain_mode: u8,
    transpose_octaves: i8,
    play_mode: u8,
    allocation_mode: u8,
    allocation_priority: u8,
    portamento: u8,
    legato_mode: u8,
    attack: u8,
    decay: u8,
    sustain: u8,
    release: u8,
    timbre: u8,
}

/// Serialize a part's settings and recording.
pub fn pack_part(part: &Part) -> Result<Vec<u8>, FormatError> {
    let midi = part.midi();
    let voicing = part.voicing();
    let mut cursor = Cursor::new(Vec::new());
    PartHeader {
        version: PART_VERSION,
        channel: midi.channel,
        min_note: midi.min_note,
        max_note: midi.max_note,
        min_velocity: midi.min_velocity,
        max_velocity: midi.max_velocity,
        sustain_mode: midi.sustain_mode.as_byte(),
        transpose_octaves: midi.transpose_octaves,
        play_mode: midi.play_mode.as_byte(),
        allocation_mode: voicing.allocation_mode.as_byte(),
        allocation_priority: voicing.allocation_priority.as_byte(),
        portamento: voicing.portamento,
        legato_mode: voicing.legato_mode.as_byte(),
        attack: voicing.envelope.attack,
        decay: voicing.envelope.decay,
        sustain: voicing.envelope.sustain,
        release: voicing.envelope.release,
        timbre: voicing.timbre,
    }
    .write(&mut cursor)?;
    write_deck(part.deck(), &mut cursor)?;
    Ok(cursor.into_inner())
}

/// Rebuild a part from a record produced by [`pack_part`].
pub fn unpack_part(bytes: &[u8]) -> Result<Part, FormatError> {
    let mut cursor = Cursor::new(bytes);
    let header = PartHeader::read(&mut cursor)?;
    if header.version != PART_VERSION {
        return Err(FormatError::UnsupportedVersion);
    }
    let mut part = Part::new();
    {
        let midi = part.midi_mut();
        midi.channel = header.channel;
        midi.min_note = header.min_note;
        midi.max_note = header.max_note;
        midi.min_velocity = header.min_velocity;
        midi.max_velocity = header.max_velocity;
        midi.sustain_mode = SustainMode::from_byte(header.sustain_mode);
        midi.transpose_octaves = header.transpose_octaves;
        midi.play_mode = PlayMode::from_byte(header.play_mode);
    }
    {
        let voicing = part.voicing_mut();
        voicing.allocation_mode = AllocationMode::from_byte(header.allocation_mode);
        voicing.allocation_priority = NotePriority::from_byte(header.allocation_priority);
        voicing.portamento = header.portamento;
        voicing.legato_mode = LegatoMode::from_byte(header.legato_mode);
        voicing.envelope = EnvelopeParams {
            attack: header.attack,
            decay: header.decay,
            sustain: header.sustain,
            release: header.release,
        };
        voicing.timbre = header.timbre;
    }
    *part.deck_mut() = read_deck(&mut cursor)?;
    Ok(part)
}
