//! Composes the structural pieces of a decrypted frame body the way a
//! `Cipher` collaborator would: plaintext header, random padding, an
//! optional session header, then a tagged message.
//!
//! No cipher is involved here — this is exactly what remains once a
//! ciphertext has already been decrypted, which is as far as this crate's
//! responsibility extends.

use bytes::{BufMut, BytesMut};
use packet_proto::{
    DataPacket, Message, MessageCatalog, PlaintextHeader, SessionHeader, decode_tagged,
    encode_tagged,
};
use proptest::prelude::*;

fn build_envelope(
    random_padding: &[u8],
    session: Option<SessionHeader>,
    message: &Message,
) -> BytesMut {
    let flags = PlaintextHeader::flags_for(session.is_some(), false);
    let header = PlaintextHeader::new(random_padding.len() as u8, flags).expect("valid header");

    let mut out = BytesMut::new();
    header.encode(&mut out);
    out.put_slice(random_padding);
    if let Some(session) = session {
        session.encode(&mut out);
    }
    out.extend_from_slice(&encode_tagged(message, 1));
    out
}

fn parse_envelope(bytes: &[u8], catalog: &MessageCatalog) -> (PlaintextHeader, Option<SessionHeader>, Message) {
    let header = PlaintextHeader::from_bytes(bytes).expect("should parse plaintext header");
    let mut offset = PlaintextHeader::SIZE + header.random_length() as usize;

    let session = if header.has_session_header() {
        let session = SessionHeader::from_bytes(&bytes[offset..]).expect("should parse session header");
        offset += SessionHeader::SIZE;
        Some(session)
    } else {
        None
    };

    let message = decode_tagged(&bytes[offset..], catalog).expect("should decode tagged message");
    (header, session, message)
}

#[test]
fn envelope_with_session_header_round_trips() {
    let catalog = MessageCatalog::with_defaults();
    let message: Message = DataPacket {
        host_id: "host-a".into(),
        chunk_index: 1,
        chunk_count: 1,
        bytes: bytes::Bytes::from_static(&[0x01, 0x02, 0x03]),
    }
    .into();
    let session = SessionHeader::new([0x42u8; 16], 7);

    let envelope = build_envelope(b"padding!", Some(session), &message);
    let (header, parsed_session, parsed_message) = parse_envelope(&envelope, &catalog);

    assert!(header.has_session_header());
    assert_eq!(parsed_session, Some(session));
    assert_eq!(parsed_message, message);
}

#[test]
fn envelope_without_session_header_has_no_session() {
    let catalog = MessageCatalog::with_defaults();
    let message: Message = packet_proto::HeartbeatPacket { last_recv_time_seen: 10, now: 12 }.into();

    let envelope = build_envelope(b"x", None, &message);
    let (header, parsed_session, parsed_message) = parse_envelope(&envelope, &catalog);

    assert!(!header.has_session_header());
    assert_eq!(parsed_session, None);
    assert_eq!(parsed_message, message);
}

proptest! {
    #[test]
    fn envelope_round_trips_for_arbitrary_padding_and_payload(
        padding in prop::collection::vec(any::<u8>(), 1..=100),
        host_id in "[a-z]{1,12}",
        payload in prop::collection::vec(any::<u8>(), 0..=64),
    ) {
        let catalog = MessageCatalog::with_defaults();
        let message: Message = DataPacket {
            host_id,
            chunk_index: 1,
            chunk_count: 1,
            bytes: bytes::Bytes::from(payload),
        }
        .into();
        let session = SessionHeader::new([0x11u8; 16], 3);

        let envelope = build_envelope(&padding, Some(session), &message);
        let (_, parsed_session, parsed_message) = parse_envelope(&envelope, &catalog);

        prop_assert_eq!(parsed_session, Some(session));
        prop_assert_eq!(parsed_message, message);
    }
}
