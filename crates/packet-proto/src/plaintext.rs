//! `PlaintextHeader`: the first two bytes revealed once a frame decrypts.
//!
//! Carries the random padding length and a flag byte. The normative shape
//! here (`{random_length, flags}`) is the latest of several definitions the
//! original carried across snapshots; an older `{random_length,
//! type_discriminant}` shape is historical and intentionally not
//! implemented.

use bytes::BufMut;

use crate::errors::{ProtocolError, Result};

/// Indicates a [`crate::SessionHeader`] immediately follows the padding.
pub const SESSION_HEADER: u8 = 0b0000_0001;
/// Indicates the payload past the (optional) session header is compressed.
pub const COMPRESSED: u8 = 0b0000_0010;

/// Smallest legal random padding length. Padding is never empty.
pub const MIN_RANDOM_LENGTH: u8 = 1;
/// Largest legal random padding length.
pub const MAX_RANDOM_LENGTH: u8 = 100;

/// `{ random_length: u8, flags: u8 }`, 2 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaintextHeader {
    random_length: u8,
    flags: u8,
}

impl PlaintextHeader {
    /// Size of the serialized header.
    pub const SIZE: usize = 2;

    /// Builds a header, validating `random_length` against
    /// `[MIN_RANDOM_LENGTH, MAX_RANDOM_LENGTH]`.
    pub fn new(random_length: u8, flags: u8) -> Result<Self> {
        if !(MIN_RANDOM_LENGTH..=MAX_RANDOM_LENGTH).contains(&random_length) {
            return Err(ProtocolError::RandomLengthOutOfBounds {
                length: random_length,
                max: MAX_RANDOM_LENGTH,
            });
        }
        Ok(Self { random_length, flags })
    }

    /// Parses a header from the front of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; Self::SIZE] = bytes
            .get(..Self::SIZE)
            .ok_or(ProtocolError::TooShort { expected: Self::SIZE, actual: bytes.len() })?
            .try_into()
            .unwrap_or_else(|_| unreachable!("slice length checked above"));
        Self::new(arr[0], arr[1])
    }

    /// Serializes the header.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(self.random_length);
        dst.put_u8(self.flags);
    }

    /// Number of random padding bytes that follow this header.
    #[must_use]
    pub fn random_length(&self) -> u8 {
        self.random_length
    }

    /// Whether a [`crate::SessionHeader`] follows the padding.
    #[must_use]
    pub fn has_session_header(&self) -> bool {
        self.flags & SESSION_HEADER != 0
    }

    /// Whether the payload is deflate-compressed.
    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.flags & COMPRESSED != 0
    }

    /// Builds the flag byte from the two booleans.
    #[must_use]
    pub fn flags_for(session_header: bool, compressed: bool) -> u8 {
        let mut flags = 0;
        if session_header {
            flags |= SESSION_HEADER;
        }
        if compressed {
            flags |= COMPRESSED;
        }
        flags
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        #[test]
        fn round_trip(random_length in MIN_RANDOM_LENGTH..=MAX_RANDOM_LENGTH, flags in any::<u8>()) {
            let header = PlaintextHeader::new(random_length, flags).expect("valid");
            let mut buf = Vec::new();
            header.encode(&mut buf);
            let parsed = PlaintextHeader::from_bytes(&buf).expect("should parse");
            prop_assert_eq!(header, parsed);
        }
    }

    #[test]
    fn rejects_zero_padding() {
        assert!(PlaintextHeader::new(0, 0).is_err());
    }

    #[test]
    fn rejects_padding_above_max() {
        assert!(PlaintextHeader::new(101, 0).is_err());
    }

    #[test]
    fn flag_helpers_round_trip() {
        let flags = PlaintextHeader::flags_for(true, true);
        let header = PlaintextHeader::new(5, flags).expect("valid");
        assert!(header.has_session_header());
        assert!(header.is_compressed());
    }
}
