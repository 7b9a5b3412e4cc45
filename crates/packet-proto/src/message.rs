//! Message shapes and the type-tag catalog that constructs them.
//!
//! Each concrete message knows its own type tag, its own encoder, and its
//! own decoder. The [`MessageCatalog`] is a runtime-built registry from tag
//! to constructor — built explicitly at startup via [`MessageCatalog::with_defaults`],
//! not a closed compile-time match, so new message types can register
//! themselves without editing a central dispatch table.

use bytes::{Bytes, BytesMut, BufMut};

use crate::{
    errors::{ProtocolError, Result},
    session::Session,
    varint,
};

fn encode_str(s: &str, dst: &mut impl BufMut) {
    varint::encode(s.len() as u64, dst);
    dst.put_slice(s.as_bytes());
}

fn decode_str(bytes: &[u8]) -> Result<(String, usize)> {
    let (len, mut offset) = varint::decode(bytes)?;
    let len = usize::try_from(len).map_err(|_| ProtocolError::Malformed("string length overflow"))?;
    let body = bytes
        .get(offset..offset + len)
        .ok_or(ProtocolError::TooShort { expected: offset + len, actual: bytes.len() })?;
    let s = std::str::from_utf8(body)
        .map_err(|_| ProtocolError::Malformed("expected UTF-8 string"))?
        .to_owned();
    offset += len;
    Ok((s, offset))
}

fn encode_bytes(b: &[u8], dst: &mut impl BufMut) {
    varint::encode(b.len() as u64, dst);
    dst.put_slice(b);
}

fn decode_bytes(bytes: &[u8]) -> Result<(Bytes, usize)> {
    let (len, mut offset) = varint::decode(bytes)?;
    let len = usize::try_from(len).map_err(|_| ProtocolError::Malformed("buffer length overflow"))?;
    let body = bytes
        .get(offset..offset + len)
        .ok_or(ProtocolError::TooShort { expected: offset + len, actual: bytes.len() })?;
    let out = Bytes::copy_from_slice(body);
    offset += len;
    Ok((out, offset))
}

/// `ClientHello { host_id, cipher_suite, kex_params }` — sent by the
/// connection initiator under the pre-shared device cipher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    /// Stable identifier of the connecting host.
    pub host_id: String,
    /// Cipher suite the initiator proposes.
    pub cipher_suite: u16,
    /// Opaque key-exchange parameters (the initiator's half).
    pub kex_params: Bytes,
}

/// `ServerHello { host_id, session, cipher_suite, kex_params }` — the
/// acceptor's reply, carrying the session the initiator should adopt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    /// Stable identifier of the accepting host.
    pub host_id: String,
    /// The acceptor's own session state — id plus its independently-random
    /// inbound/outbound sequence numbers — which the initiator adopts
    /// swapped (§4.5: what was the acceptor's outbound stream becomes the
    /// initiator's inbound stream, and vice versa).
    pub session: Session,
    /// Cipher suite the acceptor selected.
    pub cipher_suite: u16,
    /// Opaque key-exchange parameters (the acceptor's half).
    pub kex_params: Bytes,
}

/// `PromoteConnection { host_id }` — proves possession of the newly derived
/// key by arriving encrypted under it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromoteConnection {
    /// Host-id of the sender, checked against the peer's expectation.
    pub host_id: String,
}

/// `ClientKeyExchange { cipher_suite, kex_params }` — requests key rotation
/// mid-session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientKeyExchange {
    /// Proposed cipher suite for the rotated key.
    pub cipher_suite: u16,
    /// Opaque key-exchange parameters.
    pub kex_params: Bytes,
}

/// `ServerKeyExchange { cipher_suite, kex_params }` — responds to a
/// [`ClientKeyExchange`] with the peer's half.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerKeyExchange {
    /// Cipher suite selected for the rotated key.
    pub cipher_suite: u16,
    /// Opaque key-exchange parameters.
    pub kex_params: Bytes,
}

/// `HeartbeatPacket { last_recv_time_seen, now }` — liveness probe sent by
/// the connection manager when a tunnel has been idle past its threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatPacket {
    /// Sender's view of when it last heard from the peer (unix seconds).
    pub last_recv_time_seen: u64,
    /// Sender's current time (unix seconds).
    pub now: u64,
}

/// `DataPacket { host_id, chunk_index, chunk_count, bytes }` — application
/// payload. `chunk_index`/`chunk_count` describe the fragment this carries
/// when the fragmentation filter has split a larger message; `1/1` for an
/// unfragmented message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    /// Host-id of the sender.
    pub host_id: String,
    /// 1-based index of this chunk.
    pub chunk_index: u32,
    /// Total chunks in the message this chunk belongs to.
    pub chunk_count: u32,
    /// Application payload bytes.
    pub bytes: Bytes,
}

/// `FragmentPacket { fragment_number, fragment_count, bytes }` — carrier
/// message produced by the outgoing fragmentation filter; transparent to
/// application code, which only ever sees the reassembled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentPacket {
    /// 1-based position of this fragment.
    pub fragment_number: u32,
    /// Total fragments the reassembled message was split into.
    pub fragment_count: u32,
    /// This fragment's slice of the serialized message.
    pub bytes: Bytes,
}

/// `ErrorPacket { code, message }` — carries a taxonomy code (see the
/// error-handling design) plus a human-readable string, sent before a tunnel
/// tears itself down in response to a protocol violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPacket {
    /// Numeric error code.
    pub code: u16,
    /// Human-readable description.
    pub message: String,
}

macro_rules! message_enum {
    ($($variant:ident($ty:ty) = $tag:expr),+ $(,)?) => {
        /// Tagged union of every message shape this crate knows how to
        /// frame. The [`MessageCatalog`] maps wire type tags to the
        /// constructors that build these variants.
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub enum Message {
            $(
                #[allow(missing_docs)]
                $variant($ty),
            )+
        }

        impl Message {
            /// The wire type tag for this message's variant.
            #[must_use]
            pub fn type_tag(&self) -> &'static str {
                match self {
                    $(Self::$variant(_) => $tag,)+
                }
            }

            /// Encodes this message's body (the bytes a [`SerializableHeader`]
            /// would wrap).
            ///
            /// [`SerializableHeader`]: crate::SerializableHeader
            pub fn encode_body(&self, dst: &mut impl BufMut) {
                match self {
                    $(Self::$variant(inner) => inner.encode_body(dst),)+
                }
            }
        }

        $(
            impl From<$ty> for Message {
                fn from(inner: $ty) -> Self {
                    Self::$variant(inner)
                }
            }
        )+
    };
}

message_enum! {
    ClientHello(ClientHello) = "ClientHello",
    ServerHello(ServerHello) = "ServerHello",
    PromoteConnection(PromoteConnection) = "PromoteConnection",
    ClientKeyExchange(ClientKeyExchange) = "ClientKeyExchange",
    ServerKeyExchange(ServerKeyExchange) = "ServerKeyExchange",
    Heartbeat(HeartbeatPacket) = "Heartbeat",
    Data(DataPacket) = "Data",
    Fragment(FragmentPacket) = "Fragment",
    Error(ErrorPacket) = "Error",
}

trait Body: Sized {
    fn encode_body(&self, dst: &mut impl BufMut);
    fn decode_body(bytes: &[u8]) -> Result<Self>;
}

impl Body for ClientHello {
    fn encode_body(&self, dst: &mut impl BufMut) {
        encode_str(&self.host_id, dst);
        dst.put_u16(self.cipher_suite);
        encode_bytes(&self.kex_params, dst);
    }

    fn decode_body(bytes: &[u8]) -> Result<Self> {
        let (host_id, mut offset) = decode_str(bytes)?;
        let cipher_suite = read_u16(bytes, &mut offset)?;
        let (kex_params, _) = decode_bytes(&bytes[offset..])?;
        Ok(Self { host_id, cipher_suite, kex_params })
    }
}

impl Body for ServerHello {
    fn encode_body(&self, dst: &mut impl BufMut) {
        encode_str(&self.host_id, dst);
        self.session.encode(dst);
        dst.put_u16(self.cipher_suite);
        encode_bytes(&self.kex_params, dst);
    }

    fn decode_body(bytes: &[u8]) -> Result<Self> {
        let (host_id, mut offset) = decode_str(bytes)?;
        let session = Session::from_bytes(&bytes[offset..])?;
        offset += Session::SIZE;
        let cipher_suite = read_u16(bytes, &mut offset)?;
        let (kex_params, _) = decode_bytes(&bytes[offset..])?;
        Ok(Self { host_id, session, cipher_suite, kex_params })
    }
}

impl Body for PromoteConnection {
    fn encode_body(&self, dst: &mut impl BufMut) {
        encode_str(&self.host_id, dst);
    }

    fn decode_body(bytes: &[u8]) -> Result<Self> {
        let (host_id, _) = decode_str(bytes)?;
        Ok(Self { host_id })
    }
}

impl Body for ClientKeyExchange {
    fn encode_body(&self, dst: &mut impl BufMut) {
        dst.put_u16(self.cipher_suite);
        encode_bytes(&self.kex_params, dst);
    }

    fn decode_body(bytes: &[u8]) -> Result<Self> {
        let mut offset = 0;
        let cipher_suite = read_u16(bytes, &mut offset)?;
        let (kex_params, _) = decode_bytes(&bytes[offset..])?;
        Ok(Self { cipher_suite, kex_params })
    }
}

impl Body for ServerKeyExchange {
    fn encode_body(&self, dst: &mut impl BufMut) {
        dst.put_u16(self.cipher_suite);
        encode_bytes(&self.kex_params, dst);
    }

    fn decode_body(bytes: &[u8]) -> Result<Self> {
        let mut offset = 0;
        let cipher_suite = read_u16(bytes, &mut offset)?;
        let (kex_params, _) = decode_bytes(&bytes[offset..])?;
        Ok(Self { cipher_suite, kex_params })
    }
}

impl Body for HeartbeatPacket {
    fn encode_body(&self, dst: &mut impl BufMut) {
        dst.put_u64(self.last_recv_time_seen);
        dst.put_u64(self.now);
    }

    fn decode_body(bytes: &[u8]) -> Result<Self> {
        let mut offset = 0;
        let last_recv_time_seen = read_u64(bytes, &mut offset)?;
        let now = read_u64(bytes, &mut offset)?;
        Ok(Self { last_recv_time_seen, now })
    }
}

impl Body for DataPacket {
    fn encode_body(&self, dst: &mut impl BufMut) {
        encode_str(&self.host_id, dst);
        dst.put_u32(self.chunk_index);
        dst.put_u32(self.chunk_count);
        encode_bytes(&self.bytes, dst);
    }

    fn decode_body(bytes: &[u8]) -> Result<Self> {
        let (host_id, mut offset) = decode_str(bytes)?;
        let chunk_index = read_u32(bytes, &mut offset)?;
        let chunk_count = read_u32(bytes, &mut offset)?;
        let (data, _) = decode_bytes(&bytes[offset..])?;
        Ok(Self { host_id, chunk_index, chunk_count, bytes: data })
    }
}

impl Body for FragmentPacket {
    fn encode_body(&self, dst: &mut impl BufMut) {
        varint::encode(u64::from(self.fragment_number), dst);
        varint::encode(u64::from(self.fragment_count), dst);
        encode_bytes(&self.bytes, dst);
    }

    fn decode_body(bytes: &[u8]) -> Result<Self> {
        let (fragment_number, mut offset) = varint::decode(bytes)?;
        let (fragment_count, consumed) = varint::decode(&bytes[offset..])?;
        offset += consumed;
        let (data, _) = decode_bytes(&bytes[offset..])?;
        let fragment_number = u32::try_from(fragment_number)
            .map_err(|_| ProtocolError::Malformed("fragment_number overflows u32"))?;
        let fragment_count = u32::try_from(fragment_count)
            .map_err(|_| ProtocolError::Malformed("fragment_count overflows u32"))?;
        Ok(Self { fragment_number, fragment_count, bytes: data })
    }
}

impl Body for ErrorPacket {
    fn encode_body(&self, dst: &mut impl BufMut) {
        dst.put_u16(self.code);
        encode_str(&self.message, dst);
    }

    fn decode_body(bytes: &[u8]) -> Result<Self> {
        let mut offset = 0;
        let code = read_u16(bytes, &mut offset)?;
        let (message, _) = decode_str(&bytes[offset..])?;
        Ok(Self { code, message })
    }
}

fn read_u16(bytes: &[u8], offset: &mut usize) -> Result<u16> {
    let slice = bytes
        .get(*offset..*offset + 2)
        .ok_or(ProtocolError::TooShort { expected: *offset + 2, actual: bytes.len() })?;
    *offset += 2;
    Ok(u16::from_be_bytes(slice.try_into().unwrap_or_else(|_| unreachable!())))
}

fn read_u32(bytes: &[u8], offset: &mut usize) -> Result<u32> {
    let slice = bytes
        .get(*offset..*offset + 4)
        .ok_or(ProtocolError::TooShort { expected: *offset + 4, actual: bytes.len() })?;
    *offset += 4;
    Ok(u32::from_be_bytes(slice.try_into().unwrap_or_else(|_| unreachable!())))
}

fn read_u64(bytes: &[u8], offset: &mut usize) -> Result<u64> {
    let slice = bytes
        .get(*offset..*offset + 8)
        .ok_or(ProtocolError::TooShort { expected: *offset + 8, actual: bytes.len() })?;
    *offset += 8;
    Ok(u64::from_be_bytes(slice.try_into().unwrap_or_else(|_| unreachable!())))
}

/// A constructor registered in the [`MessageCatalog`]: decodes a message
/// body into the tagged [`Message`] enum.
pub type Constructor = fn(&[u8]) -> Result<Message>;

/// Runtime registry mapping a wire type tag to the constructor that
/// deserializes bytes into the matching [`Message`] variant.
///
/// Built explicitly (see [`Self::with_defaults`]) rather than resolved
/// implicitly by a compiled-in match, so additional message types — e.g.
/// the discovery messages in a sibling crate — can extend the same catalog
/// without this crate knowing about them in advance.
pub struct MessageCatalog {
    constructors: std::collections::HashMap<&'static str, Constructor>,
}

impl MessageCatalog {
    /// An empty catalog with no registered types.
    #[must_use]
    pub fn new() -> Self {
        Self { constructors: std::collections::HashMap::new() }
    }

    /// A catalog with every message type this crate defines registered.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut catalog = Self::new();
        catalog.register("ClientHello", |b| Ok(ClientHello::decode_body(b)?.into()));
        catalog.register("ServerHello", |b| Ok(ServerHello::decode_body(b)?.into()));
        catalog.register("PromoteConnection", |b| Ok(PromoteConnection::decode_body(b)?.into()));
        catalog.register("ClientKeyExchange", |b| Ok(ClientKeyExchange::decode_body(b)?.into()));
        catalog.register("ServerKeyExchange", |b| Ok(ServerKeyExchange::decode_body(b)?.into()));
        catalog.register("Heartbeat", |b| Ok(HeartbeatPacket::decode_body(b)?.into()));
        catalog.register("Data", |b| Ok(DataPacket::decode_body(b)?.into()));
        catalog.register("Fragment", |b| Ok(FragmentPacket::decode_body(b)?.into()));
        catalog.register("Error", |b| Ok(ErrorPacket::decode_body(b)?.into()));
        catalog
    }

    /// Registers a constructor for `type_tag`. A later registration for the
    /// same tag replaces the earlier one.
    pub fn register(&mut self, type_tag: &'static str, constructor: Constructor) {
        self.constructors.insert(type_tag, constructor);
    }

    /// Decodes `body` using the constructor registered for `type_tag`.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::UnknownType`] if no constructor is registered.
    pub fn construct(&self, type_tag: &str, body: &[u8]) -> Result<Message> {
        let constructor = self
            .constructors
            .get(type_tag)
            .ok_or_else(|| ProtocolError::UnknownType(type_tag.to_owned()))?;
        constructor(body)
    }
}

impl Default for MessageCatalog {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Encodes `message` as a `SerializableHeader` followed by its body.
#[must_use]
pub fn encode_tagged(message: &Message, version: u16) -> Bytes {
    let mut body = BytesMut::new();
    message.encode_body(&mut body);
    let header = crate::SerializableHeader::new(message.type_tag(), version, body.len() as u64);
    let mut out = BytesMut::new();
    header.encode(&mut out);
    out.extend_from_slice(&body);
    out.freeze()
}

/// Decodes a `SerializableHeader` plus body from `bytes` using `catalog`.
pub fn decode_tagged(bytes: &[u8], catalog: &MessageCatalog) -> Result<Message> {
    let (header, offset) = crate::SerializableHeader::decode(bytes)?;
    let size = usize::try_from(header.size())
        .map_err(|_| ProtocolError::Malformed("body size overflows usize"))?;
    let body = bytes
        .get(offset..offset + size)
        .ok_or(ProtocolError::TooShort { expected: offset + size, actual: bytes.len() })?;
    catalog.construct(header.type_tag(), body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> MessageCatalog {
        MessageCatalog::with_defaults()
    }

    fn round_trip(message: Message) {
        let encoded = encode_tagged(&message, 1);
        let decoded = decode_tagged(&encoded, &catalog()).expect("should decode");
        assert_eq!(decoded, message);
    }

    #[test]
    fn client_hello_round_trips() {
        round_trip(
            ClientHello {
                host_id: "host-a".into(),
                cipher_suite: 7,
                kex_params: Bytes::from_static(b"params"),
            }
            .into(),
        );
    }

    #[test]
    fn server_hello_round_trips() {
        round_trip(
            ServerHello {
                host_id: "host-b".into(),
                session: Session::from_parts([9u8; 16], 42, 99),
                cipher_suite: 3,
                kex_params: Bytes::from_static(b"srv-params"),
            }
            .into(),
        );
    }

    #[test]
    fn data_packet_round_trips() {
        round_trip(
            DataPacket {
                host_id: "host-a".into(),
                chunk_index: 1,
                chunk_count: 1,
                bytes: Bytes::from_static(&[0x01, 0x02, 0x03]),
            }
            .into(),
        );
    }

    #[test]
    fn fragment_packet_round_trips() {
        round_trip(
            FragmentPacket { fragment_number: 2, fragment_count: 5, bytes: Bytes::from_static(b"chunk") }
                .into(),
        );
    }

    #[test]
    fn error_packet_round_trips() {
        round_trip(ErrorPacket { code: 4, message: "bad state".into() }.into());
    }

    #[test]
    fn unknown_type_tag_is_rejected() {
        let mut out = BytesMut::new();
        crate::SerializableHeader::new("NotRegistered", 1, 0).encode(&mut out);
        let err = decode_tagged(&out, &catalog());
        assert!(matches!(err, Err(ProtocolError::UnknownType(_))));
    }
}
