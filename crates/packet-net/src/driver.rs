//! Node driver.
//!
//! Ties `ConnectionMgr` (tunnel lifecycle) and `DiscoveryMgr` (broadcast
//! peer-finding) into one Sans-IO orchestrator. Every method takes the
//! event it is reacting to and returns the [`NodeAction`]s a socket-layer
//! caller must carry out; nothing in this module touches a socket.

use std::{net::SocketAddr, sync::Arc};

use bytes::Bytes;
use packet_core::{
    ConnectionId, ConnectionMgr, ConnectionMgrAction, ConnectionMgrConfig, ConnectionMgrError,
    Environment, cipher::{Cipher, KeyRing},
};
use packet_discovery::{DiscoveryAction, DiscoveryError, DiscoveryMgr};
use packet_proto::MessageCatalog;

/// Side effect a [`NodeDriver`] asks its socket-layer caller to carry out.
#[derive(Debug, Clone)]
pub enum NodeAction {
    /// Write `bytes` to the TCP connection identified by `connection`.
    SendTcp {
        /// Raw connection to write to.
        connection: ConnectionId,
        /// Frame bytes.
        bytes: Bytes,
    },
    /// Close the TCP connection identified by `connection`.
    CloseTcp {
        /// Raw connection to close.
        connection: ConnectionId,
        /// Human-readable reason, for logging.
        reason: String,
    },
    /// An application payload arrived from `host_id`.
    Deliver {
        /// Sending peer's host-id.
        host_id: String,
        /// Payload bytes.
        bytes: Bytes,
    },
    /// A tunnel was promoted to active.
    ConnectionEstablished {
        /// The peer's host-id.
        host_id: String,
        /// Whether the local side initiated the connection.
        initiator: bool,
    },
    /// A tunnel (pending or active) was removed.
    ConnectionTerminated {
        /// The peer's host-id, if known.
        host_id: Option<String>,
    },
    /// Broadcast `bytes` as a UDP discovery datagram.
    BroadcastUdp(Bytes),
    /// Send `bytes` as a UDP discovery datagram directly to `to`.
    UnicastUdp {
        /// Destination address.
        to: SocketAddr,
        /// Framed, encrypted datagram.
        bytes: Bytes,
    },
    /// A peer was discovered; the socket layer should open a TCP connection
    /// to it and report the result via [`NodeDriver::register_connect`].
    ConnectTcp {
        /// The discovered peer's host-id.
        host_id: String,
        /// Address to dial (the discovered peer's advertised TCP port, at
        /// the address its `Ping` arrived from).
        addr: SocketAddr,
    },
}

fn convert_mgr_actions(actions: Vec<ConnectionMgrAction>) -> Vec<NodeAction> {
    actions
        .into_iter()
        .map(|action| match action {
            ConnectionMgrAction::Send { connection, bytes } => NodeAction::SendTcp { connection, bytes },
            ConnectionMgrAction::Close { connection, reason } => NodeAction::CloseTcp { connection, reason },
            ConnectionMgrAction::Deliver { host_id, bytes } => NodeAction::Deliver { host_id, bytes },
            ConnectionMgrAction::ConnectionEstablished { host_id, initiator } => {
                NodeAction::ConnectionEstablished { host_id, initiator }
            }
            ConnectionMgrAction::ConnectionTerminated { host_id } => {
                NodeAction::ConnectionTerminated { host_id }
            }
        })
        .collect()
}

fn convert_discovery_actions(actions: Vec<DiscoveryAction>) -> Vec<NodeAction> {
    actions
        .into_iter()
        .map(|action| match action {
            DiscoveryAction::Broadcast(bytes) => NodeAction::BroadcastUdp(bytes),
            DiscoveryAction::Unicast { to, bytes } => NodeAction::UnicastUdp { to, bytes },
            DiscoveryAction::PeerDiscovered { host_id, listening_tcp_port, from } => {
                NodeAction::ConnectTcp { host_id, addr: SocketAddr::new(from.ip(), listening_tcp_port) }
            }
        })
        .collect()
}

/// Orchestrates a node's tunnels and its broadcast-discovery loop.
pub struct NodeDriver<I> {
    connections: ConnectionMgr<I>,
    discovery: DiscoveryMgr,
}

impl<I> NodeDriver<I>
where
    I: Copy + Ord + Send + Sync + std::ops::Sub<Output = std::time::Duration>,
{
    /// Builds a driver for `local_host_id`, listening for TCP connects on
    /// `listening_tcp_port` (advertised to discovered peers) and protecting
    /// both the tunnel handshake and discovery datagrams with
    /// `pre_shared_cipher`.
    #[must_use]
    pub fn new(
        local_host_id: impl Into<String>,
        listening_tcp_port: u16,
        pre_shared_cipher: Arc<dyn Cipher>,
        catalog: Arc<MessageCatalog>,
        new_key_ring: Arc<dyn Fn() -> Arc<dyn KeyRing> + Send + Sync>,
        connection_config: ConnectionMgrConfig,
    ) -> Self {
        let local_host_id = local_host_id.into();
        let connections =
            ConnectionMgr::new(local_host_id.clone(), pre_shared_cipher.clone(), catalog, new_key_ring, connection_config);
        let discovery = DiscoveryMgr::new(local_host_id, listening_tcp_port, pre_shared_cipher);
        Self { connections, discovery }
    }

    /// The active tunnel for `host_id`, if one exists.
    #[must_use]
    pub fn get_tunnel(&self, host_id: &str) -> Option<&packet_core::Tunnel<I>> {
        self.connections.get(host_id)
    }

    /// Number of active tunnels.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.connections.active_count()
    }

    /// Broadcasts an `InitiateDiscovery`, looking for peers on the sub-net.
    #[must_use]
    pub fn initiate_discovery(&self) -> Vec<NodeAction> {
        convert_discovery_actions(self.discovery.initiate_discovery())
    }

    /// Handles one inbound UDP discovery datagram.
    ///
    /// # Errors
    ///
    /// [`DiscoveryError`] if the datagram is malformed or undecryptable;
    /// per §4.7 the caller should log this and otherwise ignore it.
    pub fn on_discovery_datagram(
        &mut self,
        from: SocketAddr,
        bytes: &[u8],
    ) -> Result<Vec<NodeAction>, DiscoveryError> {
        Ok(convert_discovery_actions(self.discovery.handle_datagram(from, bytes)?))
    }

    /// Registers the local side's intent to connect to `host_id` once the
    /// socket layer has assigned `connection_id`/`local_addr` for the
    /// outbound TCP connect in flight.
    #[must_use]
    pub fn register_connect(
        &mut self,
        now: I,
        host_id: impl Into<String>,
        connection_id: ConnectionId,
        local_addr: Option<SocketAddr>,
    ) -> Vec<NodeAction> {
        convert_mgr_actions(self.connections.connect(now, host_id, connection_id, local_addr))
    }

    /// Registers a freshly accepted raw TCP connection.
    pub fn on_tcp_accepted(&mut self, now: I, connection_id: ConnectionId, local_addr: Option<SocketAddr>) {
        self.connections.on_accepted(now, connection_id, local_addr);
    }

    /// Call once an outbound TCP connect for `host_id` completes.
    ///
    /// # Errors
    ///
    /// [`ConnectionMgrError::UnknownHost`] if `register_connect` was never
    /// called for `host_id`.
    pub fn on_tcp_connected(
        &mut self,
        env: &impl Environment<Instant = I>,
        now: I,
        host_id: &str,
    ) -> Result<Vec<NodeAction>, ConnectionMgrError> {
        Ok(convert_mgr_actions(self.connections.on_connected(env, now, host_id)?))
    }

    /// Feeds bytes read from `connection_id`'s TCP socket through its tunnel.
    ///
    /// # Errors
    ///
    /// [`ConnectionMgrError::UnknownHost`] if `connection_id` names no
    /// tunnel this driver is tracking.
    pub fn on_tcp_bytes(
        &mut self,
        env: &impl Environment<Instant = I>,
        now: I,
        connection_id: ConnectionId,
        bytes: &[u8],
    ) -> Result<Vec<NodeAction>, ConnectionMgrError> {
        Ok(convert_mgr_actions(self.connections.feed_bytes(env, now, connection_id, bytes)?))
    }

    /// Sends an application payload to `host_id`'s active tunnel.
    ///
    /// # Errors
    ///
    /// [`ConnectionMgrError::UnknownHost`] if no active tunnel exists for
    /// `host_id`.
    pub fn send_data(
        &mut self,
        env: &impl Environment<Instant = I>,
        now: I,
        host_id: &str,
        bytes: Bytes,
        compress: bool,
    ) -> Result<Vec<NodeAction>, ConnectionMgrError> {
        Ok(convert_mgr_actions(self.connections.send_data(env, now, host_id, bytes, compress)?))
    }

    /// Closes and removes whatever tunnel exists for `host_id`.
    #[must_use]
    pub fn disconnect(&mut self, host_id: &str) -> Vec<NodeAction> {
        convert_mgr_actions(self.connections.disconnect(host_id))
    }

    /// Periodic liveness pass: reaps stale pending/dead tunnels, sends
    /// heartbeats on idle active ones. Call roughly every
    /// [`ConnectionMgrConfig::tick_period`].
    #[must_use]
    pub fn tick(&mut self, env: &impl Environment<Instant = I>, now: I) -> Vec<NodeAction> {
        convert_mgr_actions(self.connections.tick(env, now))
    }

    /// Reaps any pending/active tunnel bound to a network adapter that
    /// disappeared (its `local_addr` is in `departing`).
    #[must_use]
    pub fn adapter_removed(&mut self, departing: &[SocketAddr]) -> Vec<NodeAction> {
        convert_mgr_actions(self.connections.adapter_removed(departing))
    }
}
