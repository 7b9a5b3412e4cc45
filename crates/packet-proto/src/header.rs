//! Fixed 36-byte frame header with zero-copy parsing.
//!
//! `FrameHeader` is the only plaintext a frame exposes on the wire: a key-id
//! naming the cipher to decrypt the trailing ciphertext with, and the
//! ciphertext's length. Everything past these 36 bytes is opaque until
//! decrypted.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::errors::{ProtocolError, Result};

/// 32-byte opaque identifier naming a symmetric cipher in the key-ring.
pub type KeyId = [u8; 32];

/// Fixed 36-byte frame header (big-endian on the wire).
///
/// Layout: `key_id(32) || ciphertext_length(4)`. Stored as raw byte arrays
/// (not native integers) so the struct can be cast directly from untrusted
/// network bytes without alignment concerns.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FrameHeader {
    key_id: KeyId,
    ciphertext_length: [u8; 4],
}

impl FrameHeader {
    /// Size of the serialized header.
    pub const SIZE: usize = 36;

    /// Default maximum accepted ciphertext length (2 MiB).
    pub const DEFAULT_MAX_CIPHERTEXT_LENGTH: u32 = 2 * 1024 * 1024;

    /// Construct a header for a frame whose ciphertext is `ciphertext_length`
    /// bytes long, keyed by `key_id`.
    #[must_use]
    pub fn new(key_id: KeyId, ciphertext_length: u32) -> Self {
        Self { key_id, ciphertext_length: ciphertext_length.to_be_bytes() }
    }

    /// Parses a header from the front of `bytes`, validating the ciphertext
    /// length against `max_ciphertext_length`.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::TooShort`] if fewer than [`Self::SIZE`] bytes are
    ///   available.
    /// - [`ProtocolError::CiphertextLengthOutOfBounds`] if the claimed length
    ///   is zero or exceeds `max_ciphertext_length`.
    pub fn from_bytes(bytes: &[u8], max_ciphertext_length: u32) -> Result<Self> {
        let header = Self::ref_from_prefix(bytes)
            .map_err(|_| ProtocolError::TooShort { expected: Self::SIZE, actual: bytes.len() })?
            .0;

        let length = u32::from_be_bytes(header.ciphertext_length);
        if length == 0 || length > max_ciphertext_length {
            return Err(ProtocolError::CiphertextLengthOutOfBounds {
                length,
                max: max_ciphertext_length,
            });
        }

        Ok(*header)
    }

    /// Serializes the header to its 36-byte wire form.
    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let bytes = IntoBytes::as_bytes(&self);
        let mut arr = [0u8; Self::SIZE];
        arr.copy_from_slice(bytes);
        arr
    }

    /// The key-id naming the cipher this frame was encrypted under.
    #[must_use]
    pub fn key_id(&self) -> KeyId {
        self.key_id
    }

    /// Length in bytes of the ciphertext that follows this header.
    #[must_use]
    pub fn ciphertext_length(&self) -> u32 {
        u32::from_be_bytes(self.ciphertext_length)
    }
}

impl std::fmt::Debug for FrameHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameHeader")
            .field("key_id", &hex_preview(&self.key_id))
            .field("ciphertext_length", &self.ciphertext_length())
            .finish()
    }
}

impl PartialEq for FrameHeader {
    fn eq(&self, other: &Self) -> bool {
        self.key_id == other.key_id && self.ciphertext_length == other.ciphertext_length
    }
}

impl Eq for FrameHeader {}

fn hex_preview(bytes: &[u8]) -> String {
    bytes.iter().take(8).map(|b| format!("{b:02x}")).collect::<String>() + ".."
}
