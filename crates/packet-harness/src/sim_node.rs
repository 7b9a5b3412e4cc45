//! Turmoil-backed tunnel node for deterministic end-to-end simulation.
//!
//! `SimNode` wraps [`packet_net::driver::NodeDriver`] with turmoil's
//! deterministic TCP implementation, so the tunnel handshake, fragmentation,
//! replay, and idle-heartbeat scenarios of §8 can be driven under a virtual
//! clock instead of real sockets. A scenario owns each connection's read half
//! directly and calls [`SimNode::feed_bytes`] as bytes arrive; `SimNode`
//! itself only holds what it needs to execute [`NodeAction`]s (write-halves).

use std::{collections::HashMap, io, sync::Arc};

use bytes::Bytes;
use packet_core::{ConnectionId, ConnectionMgrConfig, cipher::Cipher};
use packet_net::driver::{NodeAction, NodeDriver};
use packet_proto::MessageCatalog;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use turmoil::net::{TcpListener, TcpStream};

use crate::SimEnv;

/// A payload delivered to the simulated node's application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    /// Sending peer's host-id.
    pub host_id: String,
    /// Payload bytes.
    pub bytes: Bytes,
}

/// Turmoil-backed node: a [`NodeDriver`] plus a TCP listener and a table of
/// live write-halves, matching `packet_net::Node`'s shape but against
/// `turmoil::net` instead of `tokio::net` so it runs inside a
/// [`turmoil::Sim`].
pub struct SimNode {
    driver: NodeDriver<tokio::time::Instant>,
    env: SimEnv,
    listener: TcpListener,
    writers: HashMap<ConnectionId, WriteHalf<TcpStream>>,
    next_connection_id: ConnectionId,
    delivered: Vec<Delivered>,
    last_sent: HashMap<ConnectionId, Bytes>,
}

impl SimNode {
    /// Binds a node listening on `address` inside the current turmoil host.
    ///
    /// # Errors
    ///
    /// Propagates the underlying bind failure.
    pub async fn bind(
        address: &str,
        host_id: impl Into<String>,
        listening_tcp_port: u16,
        pre_shared_cipher: Arc<dyn Cipher>,
        env: SimEnv,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        let driver = NodeDriver::new(
            host_id,
            listening_tcp_port,
            pre_shared_cipher,
            Arc::new(MessageCatalog::with_defaults()),
            Arc::new(|| Arc::new(packet_core::cipher::InMemoryKeyRing::new()) as Arc<dyn packet_core::cipher::KeyRing>),
            ConnectionMgrConfig::default(),
        );
        Ok(Self {
            driver,
            env,
            listener,
            writers: HashMap::new(),
            next_connection_id: 1,
            delivered: Vec::new(),
            last_sent: HashMap::new(),
        })
    }

    fn next_id(&mut self) -> ConnectionId {
        let id = self.next_connection_id;
        self.next_connection_id += 1;
        id
    }

    /// Accepts the next inbound connection, registers it with the driver, and
    /// returns its id plus the read half the caller should pump into
    /// [`Self::feed_bytes`].
    ///
    /// # Errors
    ///
    /// Propagates the underlying accept failure.
    pub async fn accept(&mut self) -> io::Result<(ConnectionId, ReadHalf<TcpStream>)> {
        let (stream, _addr) = self.listener.accept().await?;
        let connection_id = self.next_id();
        let (read, write) = tokio::io::split(stream);
        self.writers.insert(connection_id, write);
        let now = self.env.now();
        self.driver.on_tcp_accepted(now, connection_id, None);
        Ok((connection_id, read))
    }

    /// Opens an outbound connection to `address`, registers `host_id` as the
    /// peer, drives the handshake's first flight, and returns the new
    /// connection's id plus its read half.
    ///
    /// # Errors
    ///
    /// Propagates the underlying connect failure, or a
    /// [`packet_core::ConnectionMgrError`] (wrapped as [`io::Error`]) if the
    /// driver rejects the connect.
    pub async fn connect(
        &mut self,
        address: &str,
        host_id: impl Into<String>,
    ) -> io::Result<(ConnectionId, ReadHalf<TcpStream>)> {
        let host_id = host_id.into();
        let stream = TcpStream::connect(address).await?;
        let connection_id = self.next_id();
        let (read, write) = tokio::io::split(stream);
        self.writers.insert(connection_id, write);

        let now = self.env.now();
        let connect_actions = self.driver.register_connect(now, host_id.clone(), connection_id, None);
        self.execute(connect_actions).await?;

        let connected_actions =
            self.driver.on_tcp_connected(&self.env, now, &host_id).map_err(io::Error::other)?;
        self.execute(connected_actions).await?;

        Ok((connection_id, read))
    }

    /// Feeds raw bytes read from `connection_id` through the driver.
    ///
    /// # Errors
    ///
    /// Propagates a [`packet_core::ConnectionMgrError`] (wrapped as
    /// [`io::Error`]) if the tunnel rejects the bytes.
    pub async fn feed_bytes(&mut self, connection_id: ConnectionId, bytes: &[u8]) -> io::Result<()> {
        let now = self.env.now();
        let actions =
            self.driver.on_tcp_bytes(&self.env, now, connection_id, bytes).map_err(io::Error::other)?;
        self.execute(actions).await
    }

    /// Sends an application payload to `host_id`'s active tunnel.
    ///
    /// # Errors
    ///
    /// Propagates a [`packet_core::ConnectionMgrError`] (wrapped as
    /// [`io::Error`]) if no active tunnel exists for `host_id`.
    pub async fn send_data(&mut self, host_id: &str, bytes: Bytes, compress: bool) -> io::Result<()> {
        let now = self.env.now();
        let actions =
            self.driver.send_data(&self.env, now, host_id, bytes, compress).map_err(io::Error::other)?;
        self.execute(actions).await
    }

    /// Runs one liveness tick (heartbeats, pending/idle reaps).
    pub async fn tick(&mut self) -> io::Result<()> {
        let now = self.env.now();
        let actions = self.driver.tick(&self.env, now);
        self.execute(actions).await
    }

    /// Payloads delivered to the application layer so far, oldest first.
    #[must_use]
    pub fn delivered(&self) -> &[Delivered] {
        &self.delivered
    }

    /// The underlying driver, for asserting tunnel/connection state directly.
    #[must_use]
    pub fn driver(&self) -> &NodeDriver<tokio::time::Instant> {
        &self.driver
    }

    /// Re-transmits the most recent frame sent on `connection_id`, verbatim
    /// and without going through the driver, simulating an on-path attacker
    /// who captured and replayed it.
    ///
    /// # Errors
    ///
    /// Propagates the underlying write failure. A no-op if nothing has been
    /// sent on `connection_id` yet.
    pub async fn resend_last_frame(&mut self, connection_id: ConnectionId) -> io::Result<()> {
        let Some(bytes) = self.last_sent.get(&connection_id).cloned() else {
            return Ok(());
        };
        if let Some(writer) = self.writers.get_mut(&connection_id) {
            writer.write_all(&bytes).await?;
        }
        Ok(())
    }

    async fn execute(&mut self, actions: Vec<NodeAction>) -> io::Result<()> {
        for action in actions {
            match action {
                NodeAction::SendTcp { connection, bytes } => {
                    if let Some(writer) = self.writers.get_mut(&connection) {
                        writer.write_all(&bytes).await?;
                    }
                    self.last_sent.insert(connection, bytes);
                }
                NodeAction::CloseTcp { connection, .. } => {
                    if let Some(mut writer) = self.writers.remove(&connection) {
                        let _ = writer.shutdown().await;
                    }
                }
                NodeAction::Deliver { host_id, bytes } => {
                    self.delivered.push(Delivered { host_id, bytes });
                }
                NodeAction::ConnectionEstablished { host_id, initiator } => {
                    tracing::debug!(host_id, initiator, "sim tunnel established");
                }
                NodeAction::ConnectionTerminated { host_id } => {
                    tracing::debug!(?host_id, "sim tunnel terminated");
                }
                NodeAction::BroadcastUdp(_) | NodeAction::UnicastUdp { .. } | NodeAction::ConnectTcp { .. } => {
                    // Discovery is exercised directly against `DiscoveryMgr`
                    // (see `scenarios::discovery_finds_peer`), not through
                    // this TCP-only simulated node.
                }
            }
        }
        Ok(())
    }
}
