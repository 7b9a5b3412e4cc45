//! Node-level error types: everything that can go wrong wiring sockets to
//! the pure state machines in `packet-core`/`packet-discovery`.

use thiserror::Error;

/// Errors surfaced by the socket layer.
#[derive(Debug, Error)]
pub enum NetError {
    /// Invalid bind address, or a config value out of range.
    #[error("configuration error: {0}")]
    Config(String),

    /// TCP/UDP setup or I/O failure.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Error propagated from `ConnectionMgr` (duplicate host-id, unknown
    /// connection, or a transport setup failure it reported itself).
    #[error("connection manager error: {0}")]
    ConnectionMgr(#[from] packet_core::ConnectionMgrError),

    /// Error propagated while decoding/decrypting a discovery datagram.
    #[error("discovery error: {0}")]
    Discovery(#[from] packet_discovery::DiscoveryError),
}
