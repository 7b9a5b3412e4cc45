//! Error taxonomy for the broadcast-discovery state machine.
//!
//! Per §4.7 every malformed or undecryptable datagram is dropped silently
//! at the protocol level — a stranger on the sub-net broadcasting garbage,
//! or replaying an old discovery datagram, must never be able to wedge a
//! peer's discovery loop. `DiscoveryMgr::handle_datagram` still returns
//! `Err` for these cases so a caller can log them at `debug` level; nothing
//! upstream of that caller is allowed to treat them as fatal.

use thiserror::Error;

/// Errors surfaced while decoding or decrypting a discovery datagram.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    /// The datagram was not a validly framed discovery message.
    #[error("malformed discovery datagram: {0}")]
    Malformed(#[from] packet_proto::ProtocolError),

    /// The datagram did not decrypt under the pre-shared cipher.
    #[error("discovery datagram failed to decrypt")]
    DecryptFailed,
}
