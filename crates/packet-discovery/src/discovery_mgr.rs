//! `DiscoveryMgr`: the broadcast-discovery state machine (§4.7).
//!
//! Mirrors `ConnectionMgr`'s action-pattern shape: every method takes the
//! bytes or tick it is reacting to and returns the `DiscoveryAction`s a
//! driver crate must carry out (send a datagram, hand a discovered peer
//! up to the connection layer). Nothing here touches a socket.

use std::{collections::HashSet, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use packet_core::cipher::Cipher;
use packet_proto::{FrameHeader, encode_frame};

use crate::{
    error::DiscoveryError,
    message::{Beacon, DiscoveryMessage, InitiateDiscovery, Ping, decode_tagged, encode_tagged},
};

/// Wire-format version stamped on every discovery message.
pub const DISCOVERY_WIRE_VERSION: u16 = 1;

/// Side effect a [`DiscoveryMgr`] asks its driver to carry out.
#[derive(Debug, Clone)]
pub enum DiscoveryAction {
    /// Broadcast `bytes` to the sub-net's broadcast address.
    Broadcast(Bytes),
    /// Send `bytes` directly to `to`.
    Unicast {
        /// Destination address.
        to: SocketAddr,
        /// Framed, encrypted datagram.
        bytes: Bytes,
    },
    /// A peer has been discovered and can now be handed to `ConnectionMgr`.
    PeerDiscovered {
        /// The discovered peer's stable host-id.
        host_id: String,
        /// TCP port the peer is listening for connects on.
        listening_tcp_port: u16,
        /// Address the `Ping` that revealed this peer arrived from.
        from: SocketAddr,
    },
}

/// Whether the local host should be the one to initiate a connection to
/// `peer_host_id`, breaking the symmetry of "both sides beacon, both sides
/// want to connect" with a total order on host-ids. Exactly one side of any
/// pair satisfies this, so only one `Ping` (and downstream connect) happens
/// per discovered pair.
#[must_use]
pub fn should_initiate(local_host_id: &str, peer_host_id: &str) -> bool {
    local_host_id < peer_host_id
}

/// Broadcast-discovery state machine for one local host.
pub struct DiscoveryMgr {
    local_host_id: String,
    listening_tcp_port: u16,
    cipher: Arc<dyn Cipher>,
    /// Host-ids already pinged, so a duplicate `Beacon` for the same peer
    /// (sub-nets can deliver broadcasts more than once) doesn't re-`Ping`.
    pinged: HashSet<String>,
}

impl DiscoveryMgr {
    /// Builds a discovery manager for `local_host_id`, advertising
    /// `listening_tcp_port` to peers it pings, and using `cipher` (shared,
    /// pre-provisioned out of band — §4.7 assumes every device on the
    /// sub-net already holds it) to protect discovery datagrams.
    #[must_use]
    pub fn new(local_host_id: impl Into<String>, listening_tcp_port: u16, cipher: Arc<dyn Cipher>) -> Self {
        Self { local_host_id: local_host_id.into(), listening_tcp_port, cipher, pinged: HashSet::new() }
    }

    /// This host's stable identifier.
    #[must_use]
    pub fn local_host_id(&self) -> &str {
        &self.local_host_id
    }

    fn seal(&self, message: &DiscoveryMessage) -> Bytes {
        let plaintext = encode_tagged(&self.local_host_id, message, DISCOVERY_WIRE_VERSION);
        let ciphertext = self.cipher.encrypt_and_frame(&plaintext);
        encode_frame(self.cipher.key_id(), &ciphertext)
    }

    fn open(&self, bytes: &[u8]) -> Result<(String, DiscoveryMessage), DiscoveryError> {
        let _header = FrameHeader::from_bytes(bytes, FrameHeader::DEFAULT_MAX_CIPHERTEXT_LENGTH)?;
        let ciphertext = &bytes[FrameHeader::SIZE..];
        let plaintext =
            self.cipher.decrypt(ciphertext).map_err(|_| DiscoveryError::DecryptFailed)?;
        Ok(decode_tagged(&plaintext)?)
    }

    /// Broadcasts an `InitiateDiscovery`, announcing this host wants to find
    /// every peer on the sub-net.
    #[must_use]
    pub fn initiate_discovery(&self) -> Vec<DiscoveryAction> {
        let message: DiscoveryMessage = InitiateDiscovery { host_id: self.local_host_id.clone() }.into();
        vec![DiscoveryAction::Broadcast(self.seal(&message))]
    }

    /// Handles one inbound discovery datagram from `from`.
    ///
    /// Unrecognized or undecryptable datagrams, and a peer's own broadcast
    /// echoing back to itself, are the only two things distinguished here;
    /// per §4.7 the caller is expected to treat both as non-fatal.
    ///
    /// # Errors
    ///
    /// [`DiscoveryError`] if the datagram does not decode or decrypt.
    pub fn handle_datagram(
        &mut self,
        from: SocketAddr,
        bytes: &[u8],
    ) -> Result<Vec<DiscoveryAction>, DiscoveryError> {
        let (peer_host_id, message) = self.open(bytes)?;
        if peer_host_id == self.local_host_id {
            return Ok(Vec::new());
        }

        match message {
            DiscoveryMessage::InitiateDiscovery(InitiateDiscovery { .. }) => {
                let reply: DiscoveryMessage = Beacon { host_id: self.local_host_id.clone() }.into();
                Ok(vec![DiscoveryAction::Broadcast(self.seal(&reply))])
            }
            DiscoveryMessage::Beacon(Beacon { .. }) => {
                if !should_initiate(&self.local_host_id, &peer_host_id) || !self.pinged.insert(peer_host_id)
                {
                    // Already the higher host-id, or a duplicate `Beacon` for
                    // a peer already pinged (sub-nets can deliver broadcasts
                    // more than once).
                    return Ok(Vec::new());
                }
                let reply: DiscoveryMessage = Ping::new(self.listening_tcp_port).into();
                Ok(vec![DiscoveryAction::Unicast { to: from, bytes: self.seal(&reply) }])
            }
            DiscoveryMessage::Ping(Ping { listening_tcp_port }) => {
                Ok(vec![DiscoveryAction::PeerDiscovered { host_id: peer_host_id, listening_tcp_port, from }])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use packet_core::cipher::{ChaChaCipher, SymmetricKey};

    use super::*;

    fn pre_shared_cipher() -> Arc<dyn Cipher> {
        Arc::new(ChaChaCipher::new([7u8; 32], &SymmetricKey([9u8; 32])))
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    #[test]
    fn full_three_message_round_trip_discovers_peer() {
        let cipher = pre_shared_cipher();
        let mut low = DiscoveryMgr::new("A", 9001, cipher.clone());
        let mut high = DiscoveryMgr::new("B", 9002, cipher);

        let initiate = low.initiate_discovery();
        let DiscoveryAction::Broadcast(initiate_bytes) = &initiate[0] else {
            unreachable!("initiate_discovery always broadcasts")
        };

        let beacon_actions = high.handle_datagram(addr(9001), initiate_bytes).expect("should decode");
        let DiscoveryAction::Broadcast(beacon_bytes) = &beacon_actions[0] else {
            unreachable!("InitiateDiscovery always replies with a broadcast Beacon")
        };

        let ping_actions = low.handle_datagram(addr(9002), beacon_bytes).expect("should decode");
        assert_eq!(ping_actions.len(), 1);
        let DiscoveryAction::Unicast { to, bytes: ping_bytes } = &ping_actions[0] else {
            unreachable!("lower host-id unicasts a Ping back")
        };
        assert_eq!(*to, addr(9002));

        let discovered = high.handle_datagram(addr(9001), ping_bytes).expect("should decode");
        assert_eq!(discovered.len(), 1);
        match &discovered[0] {
            DiscoveryAction::PeerDiscovered { host_id, listening_tcp_port, from } => {
                assert_eq!(host_id, "A");
                assert_eq!(*listening_tcp_port, 9001);
                assert_eq!(*from, addr(9001));
            }
            other => unreachable!("expected PeerDiscovered, got {other:?}"),
        }
    }

    #[test]
    fn higher_host_id_does_not_ping_back() {
        let cipher = pre_shared_cipher();
        let low = DiscoveryMgr::new("A", 9001, cipher.clone());
        let mut high = DiscoveryMgr::new("B", 9002, cipher);

        let initiate = low.initiate_discovery();
        let DiscoveryAction::Broadcast(initiate_bytes) = &initiate[0] else { unreachable!() };
        let beacon_actions = high.handle_datagram(addr(9001), initiate_bytes).expect("should decode");
        let DiscoveryAction::Broadcast(beacon_bytes) = &beacon_actions[0] else { unreachable!() };

        // `high` now sees its own reply reflected back by the sub-net
        // broadcast and must not also try to ping `low`.
        let actions = high.handle_datagram(addr(9001), beacon_bytes).expect("should decode");
        assert!(actions.is_empty());
    }

    #[test]
    fn malformed_datagram_is_rejected_not_panicking() {
        let cipher = pre_shared_cipher();
        let mut mgr = DiscoveryMgr::new("A", 9001, cipher);
        let err = mgr.handle_datagram(addr(9002), b"garbage").unwrap_err();
        assert!(matches!(err, DiscoveryError::Malformed(_)));
    }

    #[test]
    fn own_broadcast_echo_is_ignored() {
        let cipher = pre_shared_cipher();
        let mut mgr = DiscoveryMgr::new("A", 9001, cipher);
        let initiate = mgr.initiate_discovery();
        let DiscoveryAction::Broadcast(bytes) = &initiate[0] else { unreachable!() };
        let actions = mgr.handle_datagram(addr(9001), bytes).expect("should decode");
        assert!(actions.is_empty());
    }

    #[test]
    fn should_initiate_is_antisymmetric() {
        assert!(should_initiate("A", "B"));
        assert!(!should_initiate("B", "A"));
        assert!(!should_initiate("A", "A"));
    }
}
