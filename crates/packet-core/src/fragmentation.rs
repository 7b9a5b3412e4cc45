//! Fragmentation filter pair (§4.4): splits oversized serialized messages
//! into numbered [`FragmentPacket`] carriers on send, and reassembles them
//! on receive. Transparent to application code on both ends — only a
//! [`FragmentPacket`] ever crosses the wire as its own type; a reassembled
//! message is indistinguishable from one that was never split.

use bytes::{Bytes, BytesMut};
use packet_proto::{FragmentPacket, Message, MessageCatalog, PlaintextHeader, SessionHeader, decode_tagged, encode_tagged};

use crate::error::TunnelError;

/// Bytes of framing overhead a message incurs beyond its own serialized
/// body: the cipher's IV+MAC, the plaintext header, the maximum padding,
/// and (conservatively) a session header and a `SerializableHeader` for
/// `type_tag`.
///
/// Conservative in that it always reserves `SessionHeader::SIZE` and worst-
/// case varint widths, even for messages that end up omitting the session
/// header or needing fewer varint bytes — the true overhead is never
/// larger than this estimate, so fragments built against it never overflow
/// `max_ciphertext_length`.
#[must_use]
pub fn framing_overhead(type_tag: &str) -> usize {
    let serializable_header = 4 // magic
        + packet_proto::varint::MAX_VARINT_BYTES // type length varint
        + type_tag.len()
        + 2 // version
        + packet_proto::varint::MAX_VARINT_BYTES; // body size varint

    PlaintextHeader::SIZE
        + packet_proto::plaintext::MAX_RANDOM_LENGTH as usize
        + SessionHeader::SIZE
        + serializable_header
}

/// Largest serialized-message size that fits in one frame, given the
/// cipher's per-frame overhead and the eventual message's type tag.
#[must_use]
pub fn max_fragment_payload(max_ciphertext_length: u32, cipher_overhead: usize, type_tag: &str) -> usize {
    (max_ciphertext_length as usize).saturating_sub(cipher_overhead + framing_overhead(type_tag))
}

/// Splits `message` into [`FragmentPacket`] carriers if its serialized form
/// exceeds `max_fragment_payload`; otherwise returns it unchanged as the
/// sole element.
#[must_use]
pub fn fragment_message(message: &Message, max_fragment_payload: usize) -> Vec<Message> {
    let serialized = encode_tagged(message, 1);
    if serialized.len() <= max_fragment_payload || max_fragment_payload == 0 {
        return vec![message.clone()];
    }

    let fragment_count = serialized.len().div_ceil(max_fragment_payload);
    serialized
        .chunks(max_fragment_payload)
        .enumerate()
        .map(|(i, chunk)| {
            FragmentPacket {
                fragment_number: (i + 1) as u32,
                fragment_count: fragment_count as u32,
                bytes: Bytes::copy_from_slice(chunk),
            }
            .into()
        })
        .collect()
}

/// Per-tunnel reassembly state for incoming fragments.
#[derive(Debug, Default)]
pub struct ReassemblyBuffer {
    expected_count: Option<u32>,
    next_index: u32,
    buf: BytesMut,
}

impl ReassemblyBuffer {
    /// A buffer with no fragments accumulated yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn reset(&mut self) {
        self.expected_count = None;
        self.next_index = 0;
        self.buf.clear();
    }

    /// Feeds one incoming message through the reassembly filter.
    ///
    /// Non-[`Message::Fragment`] messages pass through unchanged. A
    /// [`Message::Fragment`] accumulates into the buffer; once the final
    /// fragment of a run arrives, the reassembled bytes are decoded via
    /// `catalog` and the original message is returned.
    ///
    /// # Errors
    ///
    /// [`TunnelError::Protocol`] if a fragment's index or count is
    /// inconsistent with the fragments accumulated so far (out-of-order
    /// delivery on a stream transport is a protocol violation, not
    /// something to tolerate); the buffer is reset before returning.
    pub fn feed(
        &mut self,
        message: Message,
        catalog: &MessageCatalog,
    ) -> Result<Option<Message>, TunnelError> {
        let Message::Fragment(fragment) = message else {
            return Ok(Some(message));
        };

        if fragment.fragment_count <= 1 {
            // A degenerate single-fragment carrier; treat its body as a
            // complete message with no reassembly required.
            let decoded = decode_tagged(&fragment.bytes, catalog)?;
            return Ok(Some(decoded));
        }

        if fragment.fragment_number == 1 {
            self.reset();
            self.expected_count = Some(fragment.fragment_count);
            self.next_index = 1;
        }

        let consistent = self.expected_count == Some(fragment.fragment_count)
            && fragment.fragment_number == self.next_index;

        if !consistent {
            self.reset();
            return Err(TunnelError::Protocol {
                state: crate::tunnel::TunnelState::WaitData,
                detail: format!(
                    "out-of-order or inconsistent fragment {}/{}",
                    fragment.fragment_number, fragment.fragment_count
                ),
            });
        }

        self.buf.extend_from_slice(&fragment.bytes);
        self.next_index += 1;

        if fragment.fragment_number == fragment.fragment_count {
            let complete = self.buf.split().freeze();
            self.reset();
            let decoded = decode_tagged(&complete, catalog)?;
            return Ok(Some(decoded));
        }

        Ok(None)
    }
}
