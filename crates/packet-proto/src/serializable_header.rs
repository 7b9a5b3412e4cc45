//! `SerializableHeader`: the payload-type wrapper inside decrypted plaintext.
//!
//! Tags the bytes that follow with a textual type, a version, and a size, so
//! the message catalog (see [`crate::message`]) can dispatch to the right
//! constructor without a fixed, closed opcode space.

use bytes::BufMut;

use crate::{
    errors::{ProtocolError, Result},
    varint,
};

/// Library-wide magic constant. Fixed regardless of message type or version.
pub const MAGIC: u32 = 0xFACE_0001;

/// `{ magic: u32, type: varint-len UTF-8 string, version: u16, size: varint }`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializableHeader {
    type_tag: String,
    version: u16,
    size: u64,
}

impl SerializableHeader {
    /// Builds a header for a body of `size` bytes tagged `type_tag`.
    #[must_use]
    pub fn new(type_tag: impl Into<String>, version: u16, size: u64) -> Self {
        Self { type_tag: type_tag.into(), version, size }
    }

    /// Parses a header from the front of `bytes`.
    ///
    /// Returns the header and the number of bytes consumed (the header is
    /// variable-length because of the type string).
    ///
    /// # Errors
    ///
    /// [`ProtocolError::InvalidMagic`] if the magic constant does not match;
    /// [`ProtocolError::TooShort`]/[`ProtocolError::Malformed`] on truncated
    /// or non-UTF-8 input.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        if bytes.len() < 4 {
            return Err(ProtocolError::TooShort { expected: 4, actual: bytes.len() });
        }
        let magic = u32::from_be_bytes(bytes[0..4].try_into().unwrap_or_else(|_| unreachable!()));
        if magic != MAGIC {
            return Err(ProtocolError::InvalidMagic { got: magic, expected: MAGIC });
        }
        let mut offset = 4;

        let (type_len, consumed) = varint::decode(&bytes[offset..])?;
        offset += consumed;

        let type_len = usize::try_from(type_len)
            .map_err(|_| ProtocolError::Malformed("type length overflows usize"))?;
        let type_bytes = bytes
            .get(offset..offset + type_len)
            .ok_or(ProtocolError::TooShort { expected: offset + type_len, actual: bytes.len() })?;
        let type_tag = std::str::from_utf8(type_bytes)
            .map_err(|_| ProtocolError::Malformed("type tag is not valid UTF-8"))?
            .to_owned();
        offset += type_len;

        let version_bytes = bytes
            .get(offset..offset + 2)
            .ok_or(ProtocolError::TooShort { expected: offset + 2, actual: bytes.len() })?;
        let version = u16::from_be_bytes(version_bytes.try_into().unwrap_or_else(|_| unreachable!()));
        offset += 2;

        let (size, consumed) = varint::decode(&bytes[offset..])?;
        offset += consumed;

        Ok((Self { type_tag, version, size }, offset))
    }

    /// Serializes the header.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u32(MAGIC);
        varint::encode(self.type_tag.len() as u64, dst);
        dst.put_slice(self.type_tag.as_bytes());
        dst.put_u16(self.version);
        varint::encode(self.size, dst);
    }

    /// Textual message type tag.
    #[must_use]
    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    /// Wire-format version of the body that follows.
    #[must_use]
    pub fn version(&self) -> u16 {
        self.version
    }

    /// Size in bytes of the body that follows this header.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        #[test]
        fn round_trip(
            type_tag in "[A-Za-z]{1,32}",
            version in any::<u16>(),
            size in any::<u64>(),
        ) {
            let header = SerializableHeader::new(type_tag, version, size);
            let mut buf = Vec::new();
            header.encode(&mut buf);
            let (parsed, consumed) = SerializableHeader::decode(&buf).expect("should decode");
            prop_assert_eq!(parsed, header);
            prop_assert_eq!(consumed, buf.len());
        }
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = vec![0u8, 0, 0, 0];
        buf.extend_from_slice(&[0, 1, 2, 3]);
        assert!(matches!(
            SerializableHeader::decode(&buf),
            Err(ProtocolError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn rejects_truncated_type_string() {
        let mut buf = Vec::new();
        buf.put_u32(MAGIC);
        varint::encode(100, &mut buf); // claims 100-byte type, none present
        assert!(matches!(SerializableHeader::decode(&buf), Err(ProtocolError::TooShort { .. })));
    }
}
