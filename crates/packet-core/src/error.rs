//! Error taxonomy for the tunnel and connection-manager layers (§7).
//!
//! Framing and crypto errors carry the underlying collaborator's error;
//! everything past that point (session, protocol, resource, transport) is
//! this crate's own judgment about what went wrong and what it means for
//! the tunnel's lifecycle. Every `TunnelError` is fatal to the tunnel that
//! raised it — the protocol has no notion of a recoverable mid-handshake
//! error (§4.5: "All socket errors, unexpected messages given state, and
//! session violations are fatal to the tunnel").

use std::io;

use packet_proto::ProtocolError;
use thiserror::Error;

use crate::{cipher::CipherError, tunnel::TunnelState};

/// Errors raised while running a single tunnel's state machine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TunnelError {
    /// Wire-format error from the frame/plaintext/message layer.
    #[error("framing error: {0}")]
    Framing(#[from] ProtocolError),

    /// AEAD or key-exchange failure.
    #[error("crypto error: {0}")]
    Crypto(#[from] CipherError),

    /// Session sequence or id mismatch, or a session header was expected
    /// but absent.
    #[error("session error: {0}")]
    Session(String),

    /// A message arrived that is not valid for the tunnel's current state,
    /// or a handshake field (host-id, kex-id) did not match expectation.
    #[error("protocol error in state {state:?}: {detail}")]
    Protocol {
        /// State the tunnel was in when the violation was observed.
        state: TunnelState,
        /// Human-readable description.
        detail: String,
    },

    /// Reassembly buffer or other allocation would exceed configured limits.
    #[error("resource error: {0}")]
    Resource(String),

    /// The underlying socket failed or disconnected.
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<io::Error> for TunnelError {
    fn from(err: io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Errors raised by [`crate::connection_mgr::ConnectionMgr`] operations that
/// are not simply a tunnel's own [`TunnelError`] bubbling up.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionMgrError {
    /// No tunnel (pending or active) exists for the given host-id.
    #[error("no tunnel for host-id {0:?}")]
    UnknownHost(String),

    /// The requested host-id already has a pending or active tunnel.
    #[error("host-id {0:?} already has a connection in progress")]
    AlreadyConnecting(String),

    /// Failed to create or bind the outbound socket.
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<io::Error> for ConnectionMgrError {
    fn from(err: io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
