//! Message shapes for the broadcast-discovery protocol (§4.7), framed the
//! same way as `packet-proto`'s `Message` catalog (a `SerializableHeader`
//! followed by a type-specific body) but kept in a separate closed enum
//! since discovery runs over UDP with a fixed, tiny message set of its own.

use bytes::{BufMut, BytesMut};
use packet_proto::{ProtocolError, Result, SerializableHeader};

fn encode_str(s: &str, dst: &mut impl BufMut) {
    packet_proto::varint::encode(s.len() as u64, dst);
    dst.put_slice(s.as_bytes());
}

fn decode_str(bytes: &[u8]) -> Result<(String, usize)> {
    let (len, mut offset) = packet_proto::varint::decode(bytes)?;
    let len = usize::try_from(len).map_err(|_| ProtocolError::Malformed("string length overflow"))?;
    let body = bytes
        .get(offset..offset + len)
        .ok_or(ProtocolError::TooShort { expected: offset + len, actual: bytes.len() })?;
    let s =
        std::str::from_utf8(body).map_err(|_| ProtocolError::Malformed("expected UTF-8 string"))?.to_owned();
    offset += len;
    Ok((s, offset))
}

/// `InitiateDiscovery { host_id }` — broadcast by a peer that wants to find
/// everyone else on the sub-net.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitiateDiscovery {
    /// Host-id of the broadcaster.
    pub host_id: String,
}

/// `Beacon { host_id }` — broadcast in reply to an `InitiateDiscovery`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Beacon {
    /// Host-id of the replying peer.
    pub host_id: String,
}

/// `Ping { host_id, listening_tcp_port }` — unicast reply to a `Beacon`,
/// telling its recipient where to connect back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    /// Port the sender's `ConnectionMgr` is listening on for TCP connects.
    pub listening_tcp_port: u16,
}

macro_rules! discovery_message_enum {
    ($($variant:ident($ty:ty) = $tag:expr),+ $(,)?) => {
        /// Tagged union of discovery messages.
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub enum DiscoveryMessage {
            $(
                #[allow(missing_docs)]
                $variant($ty),
            )+
        }

        impl DiscoveryMessage {
            /// The wire type tag for this message's variant.
            #[must_use]
            pub fn type_tag(&self) -> &'static str {
                match self {
                    $(Self::$variant(_) => $tag,)+
                }
            }
        }

        $(
            impl From<$ty> for DiscoveryMessage {
                fn from(inner: $ty) -> Self {
                    Self::$variant(inner)
                }
            }
        )+
    };
}

discovery_message_enum! {
    InitiateDiscovery(InitiateDiscovery) = "InitiateDiscovery",
    Beacon(Beacon) = "Beacon",
    Ping(Ping) = "Ping",
}

impl Ping {
    /// Builds a `Ping` advertising `listening_tcp_port`. The sender's
    /// host-id is carried separately by [`encode_tagged`]/[`decode_tagged`],
    /// same as for [`InitiateDiscovery`] and [`Beacon`].
    #[must_use]
    pub fn new(listening_tcp_port: u16) -> Self {
        Self { listening_tcp_port }
    }
}

fn encode_body(message: &DiscoveryMessage, dst: &mut impl BufMut) {
    match message {
        DiscoveryMessage::InitiateDiscovery(m) => encode_str(&m.host_id, dst),
        DiscoveryMessage::Beacon(m) => encode_str(&m.host_id, dst),
        DiscoveryMessage::Ping(m) => dst.put_u16(m.listening_tcp_port),
    }
}

/// Encodes `message` with `host_id` prefixed, matching the wire shape every
/// discovery message shares: `{ host_id, type-specific fields }`.
#[must_use]
pub fn encode_tagged(host_id: &str, message: &DiscoveryMessage, version: u16) -> bytes::Bytes {
    let mut body = BytesMut::new();
    encode_str(host_id, &mut body);
    encode_body(message, &mut body);
    let header = SerializableHeader::new(message.type_tag(), version, body.len() as u64);
    let mut out = BytesMut::new();
    header.encode(&mut out);
    out.extend_from_slice(&body);
    out.freeze()
}

/// Decodes a tagged discovery message, returning the sender's host-id
/// alongside the typed message.
pub fn decode_tagged(bytes: &[u8]) -> Result<(String, DiscoveryMessage)> {
    let (header, offset) = SerializableHeader::decode(bytes)?;
    let size = usize::try_from(header.size()).map_err(|_| ProtocolError::Malformed("body size overflows usize"))?;
    let body = bytes
        .get(offset..offset + size)
        .ok_or(ProtocolError::TooShort { expected: offset + size, actual: bytes.len() })?;

    let (host_id, mut field_offset) = decode_str(body)?;
    let message = match header.type_tag() {
        "InitiateDiscovery" => InitiateDiscovery { host_id: host_id.clone() }.into(),
        "Beacon" => Beacon { host_id: host_id.clone() }.into(),
        "Ping" => {
            let slice = body
                .get(field_offset..field_offset + 2)
                .ok_or(ProtocolError::TooShort { expected: field_offset + 2, actual: body.len() })?;
            field_offset += 2;
            let listening_tcp_port = u16::from_be_bytes(slice.try_into().unwrap_or_else(|_| unreachable!()));
            Ping { listening_tcp_port }.into()
        }
        other => return Err(ProtocolError::UnknownType(other.to_owned())),
    };
    let _ = field_offset;
    Ok((host_id, message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initiate_discovery_round_trips() {
        let message: DiscoveryMessage = InitiateDiscovery { host_id: "A".into() }.into();
        let encoded = encode_tagged("A", &message, 1);
        let (host_id, decoded) = decode_tagged(&encoded).expect("should decode");
        assert_eq!(host_id, "A");
        assert_eq!(decoded, message);
    }

    #[test]
    fn beacon_round_trips() {
        let message: DiscoveryMessage = Beacon { host_id: "B".into() }.into();
        let encoded = encode_tagged("B", &message, 1);
        let (host_id, decoded) = decode_tagged(&encoded).expect("should decode");
        assert_eq!(host_id, "B");
        assert_eq!(decoded, message);
    }

    #[test]
    fn ping_round_trips() {
        let message: DiscoveryMessage = Ping::new(8000).into();
        let encoded = encode_tagged("A", &message, 1);
        let (host_id, decoded) = decode_tagged(&encoded).expect("should decode");
        assert_eq!(host_id, "A");
        assert_eq!(decoded, message);
    }

    #[test]
    fn unknown_type_tag_is_rejected() {
        let mut out = BytesMut::new();
        SerializableHeader::new("NotRegistered", 1, 0).encode(&mut out);
        assert!(matches!(decode_tagged(&out), Err(ProtocolError::UnknownType(_))));
    }
}
