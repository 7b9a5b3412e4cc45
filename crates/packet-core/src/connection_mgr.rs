//! Connection lifecycle manager (§4.6): owns every [`Tunnel`] for this node,
//! keyed by peer host-id once known, and drives their timer-based liveness
//! checks. Like [`crate::tunnel`], this is a pure state machine — it never
//! opens a socket itself. The driver (packet-net, or the simulation harness)
//! assigns each raw connection a [`ConnectionId`], calls `connect`/
//! `on_connected`/`on_accepted`/`feed_bytes` as the socket reports events, and
//! executes the [`ConnectionMgrAction`]s returned.
//!
//! A host-id names at most one tunnel across the three collections this type
//! tracks: connections the local side initiated and is still waiting on
//! (`pending_by_host`), connections accepted but not yet carrying a
//! `ClientHello` (`pending_list`, keyed by `ConnectionId` since the host-id
//! isn't known yet), and fully established connections (`active`).

use std::{
    collections::HashMap,
    net::SocketAddr,
    ops::Sub,
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use packet_proto::MessageCatalog;

use crate::{
    cipher::{Cipher, KeyRing},
    env::Environment,
    error::ConnectionMgrError,
    tunnel::{Role, Tunnel, TunnelAction, TunnelConfig, TunnelError},
};

/// Default periodic tick interval (§4.6).
pub const DEFAULT_TICK_PERIOD: Duration = Duration::from_secs(5);
/// Default age at which an unpromoted (pending) tunnel is reaped.
pub const DEFAULT_MAX_PENDING_AGE: Duration = Duration::from_secs(25);
/// Default idle threshold: exceeding it on the send side triggers a
/// heartbeat; exceeding twice that on the receive side means the peer is
/// presumed dead.
pub const DEFAULT_MAX_IDLE_AGE: Duration = Duration::from_secs(10);

/// Opaque handle a driver assigns to a raw connection (TCP accept or
/// connect-in-progress) before a host-id is known.
pub type ConnectionId = u64;

/// Timer and age-out configuration (§4.6 defaults).
#[derive(Debug, Clone)]
pub struct ConnectionMgrConfig {
    /// How often [`ConnectionMgr::tick`] is expected to be called.
    pub tick_period: Duration,
    /// Age at which a pending (not yet established) tunnel is reaped.
    pub max_pending_age: Duration,
    /// Idle threshold for heartbeats and dead-peer detection.
    pub max_idle_age: Duration,
}

impl Default for ConnectionMgrConfig {
    fn default() -> Self {
        Self {
            tick_period: DEFAULT_TICK_PERIOD,
            max_pending_age: DEFAULT_MAX_PENDING_AGE,
            max_idle_age: DEFAULT_MAX_IDLE_AGE,
        }
    }
}

/// Actions a driver must execute on behalf of a [`ConnectionMgr`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionMgrAction {
    /// Write these bytes to the given raw connection's socket.
    Send {
        /// Which raw connection to write to.
        connection: ConnectionId,
        /// Frame bytes.
        bytes: Bytes,
    },
    /// Deliver an application payload upward.
    Deliver {
        /// Host-id the payload was received from.
        host_id: String,
        /// Payload bytes.
        bytes: Bytes,
    },
    /// Close a raw connection's socket.
    Close {
        /// Which raw connection to close.
        connection: ConnectionId,
        /// Human-readable reason.
        reason: String,
    },
    /// A tunnel completed its handshake and was promoted to active.
    ConnectionEstablished {
        /// The peer's host-id.
        host_id: String,
        /// Whether the local side initiated the connection.
        initiator: bool,
    },
    /// A tunnel (pending or active) was removed.
    ConnectionTerminated {
        /// The peer's host-id, if it was known (absent for a pending
        /// acceptor-side connection that never received `ClientHello`).
        host_id: Option<String>,
    },
}

fn convert(connection_id: ConnectionId, actions: Vec<TunnelAction>) -> Vec<ConnectionMgrAction> {
    actions
        .into_iter()
        .map(|action| match action {
            TunnelAction::Send(bytes) => ConnectionMgrAction::Send { connection: connection_id, bytes },
            TunnelAction::Deliver(data) => {
                ConnectionMgrAction::Deliver { host_id: data.host_id, bytes: data.bytes }
            }
            TunnelAction::Close { reason } => {
                ConnectionMgrAction::Close { connection: connection_id, reason }
            }
            TunnelAction::ConnectionEstablished { initiator } => {
                // Placeholder; the caller replaces this with the real
                // host-id once the tunnel is promoted (it isn't known to
                // this free function).
                ConnectionMgrAction::ConnectionEstablished { host_id: String::new(), initiator }
            }
        })
        .collect()
}

struct Slot<I> {
    connection_id: ConnectionId,
    tunnel: Tunnel<I>,
    created_at: I,
    local_addr: Option<SocketAddr>,
    last_recv_wall_clock: u64,
}

/// Owns every tunnel for this node and drives their shared timers.
pub struct ConnectionMgr<I>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    config: ConnectionMgrConfig,
    local_host_id: String,
    pre_shared_cipher: Arc<dyn Cipher>,
    catalog: Arc<MessageCatalog>,
    new_key_ring: Arc<dyn Fn() -> Arc<dyn KeyRing> + Send + Sync>,
    pending_by_host: HashMap<String, Slot<I>>,
    pending_list: HashMap<ConnectionId, Slot<I>>,
    active: HashMap<String, Slot<I>>,
    /// Reverse index from a raw connection back to the host-id it is filed
    /// under in `pending_by_host` or `active`. A connection in
    /// `pending_list` has no entry here (its host-id isn't known yet).
    host_by_connection: HashMap<ConnectionId, String>,
}

impl<I> ConnectionMgr<I>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    /// Builds an empty manager.
    pub fn new(
        local_host_id: impl Into<String>,
        pre_shared_cipher: Arc<dyn Cipher>,
        catalog: Arc<MessageCatalog>,
        new_key_ring: Arc<dyn Fn() -> Arc<dyn KeyRing> + Send + Sync>,
        config: ConnectionMgrConfig,
    ) -> Self {
        Self {
            config,
            local_host_id: local_host_id.into(),
            pre_shared_cipher,
            catalog,
            new_key_ring,
            pending_by_host: HashMap::new(),
            pending_list: HashMap::new(),
            active: HashMap::new(),
            host_by_connection: HashMap::new(),
        }
    }

    /// The active tunnel for `host_id`, if one exists.
    #[must_use]
    pub fn get(&self, host_id: &str) -> Option<&Tunnel<I>> {
        self.active.get(host_id).map(|slot| &slot.tunnel)
    }

    /// Number of active (fully established) tunnels.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Number of pending (not yet established) tunnels, both initiator- and
    /// acceptor-side.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending_by_host.len() + self.pending_list.len()
    }

    /// Registers the local side's intent to connect to `host_id`. Idempotent:
    /// a no-op if a pending or active tunnel for `host_id` already exists.
    /// Does not itself send anything — the driver calls `on_connected` once
    /// the underlying socket finishes connecting.
    pub fn connect(
        &mut self,
        now: I,
        host_id: impl Into<String>,
        connection_id: ConnectionId,
        local_addr: Option<SocketAddr>,
    ) -> Vec<ConnectionMgrAction> {
        let host_id = host_id.into();
        if self.pending_by_host.contains_key(&host_id) || self.active.contains_key(&host_id) {
            return vec![];
        }

        let tunnel = Tunnel::new_initiator(
            now,
            TunnelConfig::new(self.local_host_id.clone(), Some(host_id.clone())),
            self.pre_shared_cipher.clone(),
            (self.new_key_ring)(),
            self.catalog.clone(),
        );
        self.host_by_connection.insert(connection_id, host_id.clone());
        self.pending_by_host.insert(
            host_id,
            Slot { connection_id, tunnel, created_at: now, local_addr, last_recv_wall_clock: 0 },
        );
        vec![]
    }

    /// Registers a freshly accepted raw connection, host-id unknown until
    /// `ClientHello` arrives.
    pub fn on_accepted(&mut self, now: I, connection_id: ConnectionId, local_addr: Option<SocketAddr>) {
        let mut tunnel = Tunnel::new_acceptor(
            now,
            TunnelConfig::new(self.local_host_id.clone(), None),
            self.pre_shared_cipher.clone(),
            (self.new_key_ring)(),
            self.catalog.clone(),
        );
        tunnel.on_accepted(now);
        self.pending_list.insert(
            connection_id,
            Slot { connection_id, tunnel, created_at: now, local_addr, last_recv_wall_clock: 0 },
        );
    }

    /// Call once the local side's TCP connect for `host_id` completes.
    ///
    /// # Errors
    ///
    /// [`ConnectionMgrError::UnknownHost`] if `connect` was never called (or
    /// the tunnel has already been reaped) for `host_id`.
    pub fn on_connected(
        &mut self,
        env: &impl Environment<Instant = I>,
        now: I,
        host_id: &str,
    ) -> Result<Vec<ConnectionMgrAction>, ConnectionMgrError> {
        let Some(mut slot) = self.pending_by_host.remove(host_id) else {
            return Err(ConnectionMgrError::UnknownHost(host_id.to_string()));
        };
        let connection_id = slot.connection_id;
        let result = slot.tunnel.on_connected(env, now);
        Ok(self.finish_pending_call(connection_id, slot, result, Some(host_id.to_string())))
    }

    /// Feeds raw transport bytes for `connection_id` through whichever
    /// tunnel it's filed under, promoting it to active if the handshake
    /// just completed.
    ///
    /// # Errors
    ///
    /// [`ConnectionMgrError::UnknownHost`] if `connection_id` names no
    /// tunnel this manager is tracking.
    pub fn feed_bytes(
        &mut self,
        env: &impl Environment<Instant = I>,
        now: I,
        connection_id: ConnectionId,
        bytes: &[u8],
    ) -> Result<Vec<ConnectionMgrAction>, ConnectionMgrError> {
        if let Some(mut slot) = self.pending_list.remove(&connection_id) {
            let result = slot.tunnel.feed_bytes(env, now, bytes);
            if result.is_ok() {
                slot.last_recv_wall_clock = env.wall_clock_secs();
            }
            return Ok(self.finish_pending_call(connection_id, slot, result, None));
        }

        let Some(host_id) = self.host_by_connection.get(&connection_id).cloned() else {
            return Err(ConnectionMgrError::UnknownHost(format!("connection {connection_id}")));
        };

        if let Some(mut slot) = self.pending_by_host.remove(&host_id) {
            let result = slot.tunnel.feed_bytes(env, now, bytes);
            if result.is_ok() {
                slot.last_recv_wall_clock = env.wall_clock_secs();
            }
            return Ok(self.finish_pending_call(connection_id, slot, result, Some(host_id)));
        }

        if let Some(mut slot) = self.active.remove(&host_id) {
            let result = slot.tunnel.feed_bytes(env, now, bytes);
            if result.is_ok() {
                slot.last_recv_wall_clock = env.wall_clock_secs();
            }
            return Ok(self.finish_active_call(connection_id, host_id, slot, result));
        }

        Err(ConnectionMgrError::UnknownHost(format!("connection {connection_id}")))
    }

    /// Sends an application payload to the active tunnel for `host_id`.
    /// `compress` is forwarded to [`Tunnel::send_data`].
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
    ) -> Result<Vec<ConnectionMgrAction>, ConnectionMgrError> {
        let Some(mut slot) = self.active.remove(host_id) else {
            return Err(ConnectionMgrError::UnknownHost(host_id.to_string()));
        };
        let connection_id = slot.connection_id;
        let result = slot.tunnel.send_data(env, now, bytes, compress);
        Ok(self.finish_active_call(connection_id, host_id.to_string(), slot, result))
    }

    /// Closes and removes whatever tunnel (pending or active) exists for
    /// `host_id`.
    pub fn disconnect(&mut self, host_id: &str) -> Vec<ConnectionMgrAction> {
        if let Some(mut slot) = self.active.remove(host_id) {
            self.host_by_connection.remove(&slot.connection_id);
            slot.tunnel.close();
            return vec![
                ConnectionMgrAction::Close { connection: slot.connection_id, reason: "disconnect requested".into() },
                ConnectionMgrAction::ConnectionTerminated { host_id: Some(host_id.to_string()) },
            ];
        }
        if let Some(mut slot) = self.pending_by_host.remove(host_id) {
            self.host_by_connection.remove(&slot.connection_id);
            slot.tunnel.close();
            return vec![
                ConnectionMgrAction::Close { connection: slot.connection_id, reason: "disconnect requested".into() },
                ConnectionMgrAction::ConnectionTerminated { host_id: Some(host_id.to_string()) },
            ];
        }
        vec![]
    }

    /// Periodic tick (§4.6): reaps pending tunnels older than
    /// `max_pending_age`, reaps active tunnels that haven't received
    /// anything in `2 * max_idle_age`, and sends a heartbeat on active
    /// tunnels idle (on the send side) for more than `max_idle_age`.
    pub fn tick(&mut self, env: &impl Environment<Instant = I>, now: I) -> Vec<ConnectionMgrAction> {
        let mut actions = Vec::new();

        let expired_by_host: Vec<String> = self
            .pending_by_host
            .iter()
            .filter(|(_, slot)| now - slot.created_at > self.config.max_pending_age)
            .map(|(host_id, _)| host_id.clone())
            .collect();
        for host_id in expired_by_host {
            if let Some(slot) = self.pending_by_host.remove(&host_id) {
                self.host_by_connection.remove(&slot.connection_id);
                actions.push(ConnectionMgrAction::Close {
                    connection: slot.connection_id,
                    reason: "pending connection timed out".into(),
                });
                actions.push(ConnectionMgrAction::ConnectionTerminated { host_id: Some(host_id) });
            }
        }

        let expired_unidentified: Vec<ConnectionId> = self
            .pending_list
            .iter()
            .filter(|(_, slot)| now - slot.created_at > self.config.max_pending_age)
            .map(|(connection_id, _)| *connection_id)
            .collect();
        for connection_id in expired_unidentified {
            if self.pending_list.remove(&connection_id).is_some() {
                actions.push(ConnectionMgrAction::Close {
                    connection: connection_id,
                    reason: "pending connection timed out".into(),
                });
                actions.push(ConnectionMgrAction::ConnectionTerminated { host_id: None });
            }
        }

        let dead_threshold = self.config.max_idle_age.saturating_mul(2);
        let dead: Vec<String> = self
            .active
            .iter()
            .filter(|(_, slot)| now - slot.tunnel.last_recv_time() > dead_threshold)
            .map(|(host_id, _)| host_id.clone())
            .collect();
        for host_id in dead {
            if let Some(mut slot) = self.active.remove(&host_id) {
                self.host_by_connection.remove(&slot.connection_id);
                slot.tunnel.close();
                actions.push(ConnectionMgrAction::Close {
                    connection: slot.connection_id,
                    reason: "peer presumed dead (no traffic received)".into(),
                });
                actions.push(ConnectionMgrAction::ConnectionTerminated { host_id: Some(host_id) });
            }
        }

        let needs_heartbeat: Vec<String> = self
            .active
            .iter()
            .filter(|(_, slot)| now - slot.tunnel.last_sent_time() > self.config.max_idle_age)
            .map(|(host_id, _)| host_id.clone())
            .collect();
        for host_id in needs_heartbeat {
            if let Some(mut slot) = self.active.remove(&host_id) {
                let connection_id = slot.connection_id;
                let wall_clock_now = env.wall_clock_secs();
                let last_recv_wall_clock = slot.last_recv_wall_clock;
                let result = slot.tunnel.send_heartbeat(env, now, wall_clock_now, last_recv_wall_clock);
                actions.extend(self.finish_active_call(connection_id, host_id, slot, result));
            }
        }

        actions
    }

    /// Handles the outcome of a fallible call on a not-yet-active tunnel
    /// (`on_connected`/`feed_bytes`): on success, promotes to `active` if
    /// `ConnectionEstablished` fired, else reinserts the slot back into
    /// whichever pending collection it came from; on error, drops the slot.
    fn finish_pending_call(
        &mut self,
        connection_id: ConnectionId,
        mut slot: Slot<I>,
        result: Result<Vec<TunnelAction>, TunnelError>,
        pending_host_key: Option<String>,
    ) -> Vec<ConnectionMgrAction> {
        match result {
            Ok(tunnel_actions) => {
                let established =
                    tunnel_actions.iter().any(|a| matches!(a, TunnelAction::ConnectionEstablished { .. }));
                let mut actions = convert(connection_id, tunnel_actions);

                if established {
                    let host_id = slot.tunnel.peer_host_id().map(str::to_string).unwrap_or_default();
                    for action in &mut actions {
                        if let ConnectionMgrAction::ConnectionEstablished { host_id: h, .. } = action {
                            *h = host_id.clone();
                        }
                    }
                    self.host_by_connection.insert(connection_id, host_id.clone());
                    self.active.insert(host_id, slot);
                } else if let Some(host_id) = pending_host_key {
                    self.pending_by_host.insert(host_id, slot);
                } else {
                    self.pending_list.insert(connection_id, slot);
                }

                actions
            }
            Err(_) => {
                let host_id = slot.tunnel.peer_host_id().map(str::to_string).or(pending_host_key);
                self.host_by_connection.remove(&connection_id);
                vec![
                    ConnectionMgrAction::Close {
                        connection: connection_id,
                        reason: "tunnel closed on handshake error".into(),
                    },
                    ConnectionMgrAction::ConnectionTerminated { host_id },
                ]
            }
        }
    }

    /// Handles the outcome of a fallible call on an already-active tunnel
    /// (`feed_bytes`/`send_data`/`send_heartbeat`): on success, reinserts;
    /// on error, drops the slot and reports termination.
    fn finish_active_call(
        &mut self,
        connection_id: ConnectionId,
        host_id: String,
        slot: Slot<I>,
        result: Result<Vec<TunnelAction>, TunnelError>,
    ) -> Vec<ConnectionMgrAction> {
        match result {
            Ok(tunnel_actions) => {
                let actions = convert(connection_id, tunnel_actions);
                self.active.insert(host_id, slot);
                actions
            }
            Err(_) => {
                self.host_by_connection.remove(&connection_id);
                vec![
                    ConnectionMgrAction::Close { connection: connection_id, reason: "tunnel closed on error".into() },
                    ConnectionMgrAction::ConnectionTerminated { host_id: Some(host_id) },
                ]
            }
        }
    }

    /// Adapter-change handling (§4.6): shuts down any tunnel whose recorded
    /// local address belongs to the departing adapter set. `adapter_added`
    /// has no reaping behavior and isn't modeled here — the driver logs it.
    pub fn adapter_removed(&mut self, departing: &[SocketAddr]) -> Vec<ConnectionMgrAction> {
        let mut actions = Vec::new();

        let stale_pending: Vec<String> = self
            .pending_by_host
            .iter()
            .filter(|(_, slot)| slot.local_addr.is_some_and(|addr| departing.contains(&addr)))
            .map(|(host_id, _)| host_id.clone())
            .collect();
        for host_id in stale_pending {
            actions.extend(self.disconnect(&host_id));
        }

        let stale_unidentified: Vec<ConnectionId> = self
            .pending_list
            .iter()
            .filter(|(_, slot)| slot.local_addr.is_some_and(|addr| departing.contains(&addr)))
            .map(|(connection_id, _)| *connection_id)
            .collect();
        for connection_id in stale_unidentified {
            if self.pending_list.remove(&connection_id).is_some() {
                actions.push(ConnectionMgrAction::Close {
                    connection: connection_id,
                    reason: "local adapter went stale".into(),
                });
                actions.push(ConnectionMgrAction::ConnectionTerminated { host_id: None });
            }
        }

        let stale_active: Vec<String> = self
            .active
            .iter()
            .filter(|(_, slot)| slot.local_addr.is_some_and(|addr| departing.contains(&addr)))
            .map(|(host_id, _)| host_id.clone())
            .collect();
        for host_id in stale_active {
            actions.extend(self.disconnect(&host_id));
        }

        actions
    }
}
