//! Persistence codecs for notegrid.
//!
//! Parts and loop decks are stored as small framed binary records. The
//! codec is deliberately separate from the live structures: a deck is
//! restored by replaying its recording protocol, never by serializing
//! chain pointers.

mod deck_format;
mod part_format;

pub use deck_format::{pack_deck, unpack_deck};
pub use part_format::{pack_part, unpack_part};

/// Error type for record decoding.
#[derive(Debug, PartialEq, Eq)]
pub enum FormatError {
    /// Invalid record magic bytes
    InvalidHeader,
    /// Record shorter than its header claims
    UnexpectedEof,
    /// Unsupported record version
    UnsupportedVersion,
}

impl core::fmt::Display for FormatError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FormatError::InvalidHeader => write!(f, "invalid record header"),
            FormatError::UnexpectedEof => write!(f, "unexpected end of record"),
            FormatError::UnsupportedVersion => write!(f, "unsupported record version"),
        }
    }
}

impl std::error::Error for FormatError {}

impl From<binrw::Error> for FormatError {
    fn from(err: binrw::Error) -> Self {
        // Mid-struct failures arrive wrapped in a backtrace; classify by
        // the innermost cause.
        match err.root_cause() {
            binrw::Error::Io(_) => FormatError::UnexpectedEof,
            _ => FormatError::InvalidHeader,
        }
    }
}
