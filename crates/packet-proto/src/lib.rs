//! Wire-format types for the packet protocol: fixed headers, the plaintext
//! envelope, session replay-protection state, the tagged message catalog,
//! and the incremental frame parser.
//!
//! This crate has no cipher and no async runtime dependency. Everything
//! here operates on bytes that are already plaintext (or are opaque
//! ciphertext blobs this crate never looks inside); combining these pieces
//! with an actual `Cipher` is `packet-core`'s job.

#![deny(missing_docs)]

pub mod errors;
pub mod frame;
pub mod header;
pub mod message;
pub mod parser;
pub mod plaintext;
pub mod serializable_header;
pub mod session;
pub mod varint;

pub use errors::{ProtocolError, Result};
pub use frame::encode_frame;
pub use header::{FrameHeader, KeyId};
pub use message::{
    ClientHello, ClientKeyExchange, DataPacket, ErrorPacket, FragmentPacket, HeartbeatPacket,
    Message, MessageCatalog, PromoteConnection, ServerHello, ServerKeyExchange, decode_tagged,
    encode_tagged,
};
pub use parser::{FrameHandler, FrameParser, ValueParser};
pub use plaintext::PlaintextHeader;
pub use serializable_header::SerializableHeader;
pub use session::{RandomSource, Session, SessionHeader, SessionId};
