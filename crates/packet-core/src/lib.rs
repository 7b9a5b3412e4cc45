//! Packet Core
//!
//! Action-based, Sans-IO tunnel and connection-manager state machines for the
//! authenticated, encrypted P2P message-framing protocol. Pure state
//! machines with no socket and no stored clock: callers pass `now` and, where
//! randomness or wall-clock time are needed, an [`env::Environment`]
//! explicitly. This enables deterministic simulation testing with the same
//! code that runs in production.
//!
//! # Components
//!
//! - [`tunnel::Tunnel`]: per-connection handshake and session state machine
//! - [`connection_mgr::ConnectionMgr`]: owns every tunnel for a node, keyed
//!   by peer host-id, and drives their timer-based liveness checks
//! - [`cipher`]: AEAD cipher, key-exchange, and key-ring collaborator
//!   contracts, plus a ChaCha20-Poly1305/X25519 reference implementation
//! - [`fragmentation`]: splits oversized messages for the wire and
//!   reassembles them on receive
//! - [`env::Environment`]: time, randomness, and async primitives, abstracted
//!   for deterministic testing

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod cipher;
pub mod connection_mgr;
pub mod env;
pub mod error;
pub mod fragmentation;
pub mod tunnel;

pub use connection_mgr::{ConnectionId, ConnectionMgr, ConnectionMgrAction, ConnectionMgrConfig};
pub use env::Environment;
pub use error::{ConnectionMgrError, TunnelError};
pub use tunnel::{Role, Tunnel, TunnelAction, TunnelConfig, TunnelState};
