//! Broadcast peer discovery (§4.7): a three-message UDP protocol a host
//! uses to find other hosts sharing its pre-provisioned device cipher on
//! the same sub-net, without any central directory.
//!
//! Like `packet-core`, this crate is a pure state machine: nothing here
//! owns a socket. `handle_datagram`/`initiate_discovery` return
//! [`discovery_mgr::DiscoveryAction`]s describing the bytes to send; a
//! driver crate owns the actual `UdpSocket`.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod discovery_mgr;
pub mod error;
pub mod message;

pub use discovery_mgr::{DISCOVERY_WIRE_VERSION, DiscoveryAction, DiscoveryMgr, should_initiate};
pub use error::DiscoveryError;
pub use message::{Beacon, DiscoveryMessage, InitiateDiscovery, Ping};
