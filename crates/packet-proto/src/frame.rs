//! Raw frame encoding: concatenating a [`FrameHeader`] with its ciphertext.
//!
//! The decode side lives in [`crate::parser`], which has to handle partial
//! reads; encoding a frame to send is comparatively trivial, so it stays a
//! free function rather than its own type.

use bytes::{BufMut, Bytes, BytesMut};

use crate::header::{FrameHeader, KeyId};

/// Concatenates a header for `ciphertext` (keyed by `key_id`) with the
/// ciphertext itself, ready to write to a socket.
#[must_use]
pub fn encode_frame(key_id: KeyId, ciphertext: &[u8]) -> Bytes {
    let header = FrameHeader::new(key_id, ciphertext.len() as u32);
    let mut out = BytesMut::with_capacity(FrameHeader::SIZE + ciphertext.len());
    out.put_slice(&header.to_bytes());
    out.put_slice(ciphertext);
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_frame_concatenates_header_and_body() {
        let encoded = encode_frame([1u8; 32], b"ciphertext-bytes");
        assert_eq!(encoded.len(), FrameHeader::SIZE + b"ciphertext-bytes".len());
        let header = FrameHeader::from_bytes(&encoded, FrameHeader::DEFAULT_MAX_CIPHERTEXT_LENGTH)
            .expect("should parse");
        assert_eq!(header.key_id(), [1u8; 32]);
        assert_eq!(&encoded[FrameHeader::SIZE..], b"ciphertext-bytes");
    }
}
