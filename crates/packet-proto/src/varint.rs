//! Variable-length unsigned integer encoding (LEB128-style, 7 bits per byte).
//!
//! Used for `SerializableHeader`'s type-string length and body size, and for
//! `FragmentPacket`'s fragment number/count. Keeping one encoding for every
//! "size" field in the wire format means `ValueParser`-style incremental
//! readers only need one primitive.

use bytes::BufMut;

use crate::errors::{ProtocolError, Result};

/// Maximum encoded length of a `u64` varint (ceil(64 / 7)).
pub const MAX_VARINT_BYTES: usize = 10;

/// Writes `value` to `dst` as an unsigned varint.
pub fn encode(mut value: u64, dst: &mut impl BufMut) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            dst.put_u8(byte);
            return;
        }
        dst.put_u8(byte | 0x80);
    }
}

/// Decodes an unsigned varint from the front of `bytes`.
///
/// Returns the decoded value and the number of bytes consumed.
pub fn decode(bytes: &[u8]) -> Result<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, &byte) in bytes.iter().enumerate().take(MAX_VARINT_BYTES) {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    if bytes.len() < MAX_VARINT_BYTES {
        return Err(ProtocolError::TooShort { expected: bytes.len() + 1, actual: bytes.len() });
    }
    Err(ProtocolError::Malformed("varint exceeds 10 bytes"))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        #[test]
        fn round_trip(value in any::<u64>()) {
            let mut buf = Vec::new();
            encode(value, &mut buf);
            let (decoded, consumed) = decode(&buf).expect("should decode");
            prop_assert_eq!(decoded, value);
            prop_assert_eq!(consumed, buf.len());
        }
    }

    #[test]
    fn zero_is_one_byte() {
        let mut buf = Vec::new();
        encode(0, &mut buf);
        assert_eq!(buf, vec![0x00]);
    }

    #[test]
    fn rejects_unterminated_varint() {
        let buf = [0x80u8; 11];
        assert!(decode(&buf).is_err());
    }
}
