//! Framing-level error taxonomy.
//!
//! Everything here is structural: malformed lengths, bad magic numbers,
//! truncated buffers, unknown type tags. Crypto and session errors live one
//! layer up, in `packet-core`, since this crate has no cipher.

use thiserror::Error;

/// Errors produced while parsing or encoding wire structures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer shorter than the structure being parsed requires.
    #[error("buffer too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// `FrameHeader.ciphertext_length` outside `(0, MAX_CIPHERTEXT_LENGTH]`.
    #[error("ciphertext length {length} out of bounds (0, {max}]")]
    CiphertextLengthOutOfBounds {
        /// Length claimed by the header.
        length: u32,
        /// `MAX_CIPHERTEXT_LENGTH` in effect.
        max: u32,
    },

    /// `PlaintextHeader.random_length` outside `[1, 100]`.
    #[error("random padding length {length} out of bounds [1, {max}]")]
    RandomLengthOutOfBounds {
        /// Length read from the header.
        length: u8,
        /// `MAX_RANDOM_LENGTH` in effect.
        max: u8,
    },

    /// `SerializableHeader.magic` did not match the library-wide constant.
    #[error("invalid magic: got {got:#010x}, expected {expected:#010x}")]
    InvalidMagic {
        /// Magic value read from the wire.
        got: u32,
        /// Expected magic constant.
        expected: u32,
    },

    /// No registered constructor for this type tag.
    #[error("unknown message type {0:?}")]
    UnknownType(String),

    /// Type tag was not valid UTF-8, or a length prefix overflowed.
    #[error("malformed variable-length field: {0}")]
    Malformed(&'static str),

    /// A frame's reported ciphertext length exceeds what the buffer held.
    #[error("frame truncated: expected {expected} more bytes, found {actual}")]
    FrameTruncated {
        /// Bytes the header claimed.
        expected: usize,
        /// Bytes actually present.
        actual: usize,
    },
}

/// Convenience result alias used throughout this crate.
pub type Result<T> = std::result::Result<T, ProtocolError>;
