//! Socket-layer glue for the packet protocol.
//!
//! Production node implementation using raw TCP for tunnels, raw UDP for
//! broadcast discovery, Tokio for async I/O, and system time with
//! cryptographic RNG.
//!
//! # Architecture
//!
//! This crate wraps [`packet_core`]'s and [`packet_discovery`]'s
//! action-based state machines with real sockets. [`driver::NodeDriver`]
//! follows the same Sans-IO pattern those crates do (no socket touches it
//! directly); [`Node`] drives real [`tokio::net::TcpStream`]s and a
//! [`tokio::net::UdpSocket`], executing the actions the driver returns.
//!
//! # Components
//!
//! - [`driver::NodeDriver`]: action-based orchestrator (pure logic, no I/O)
//! - [`Node`]: production runtime that executes `NodeDriver` actions
//! - [`transport`]: raw TCP listener/connect and UDP broadcast socket
//! - [`SystemEnv`]: production environment (real time, crypto RNG)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod driver;
mod error;
mod system_env;
pub mod transport;

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use bytes::Bytes;
pub use driver::{NodeAction, NodeDriver};
pub use error::NetError;
use packet_core::{ConnectionId, ConnectionMgrConfig, Environment, cipher::Cipher};
use packet_proto::MessageCatalog;
pub use system_env::SystemEnv;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::tcp::OwnedWriteHalf,
    sync::{Mutex, mpsc},
};
pub use transport::{TcpTransport, UdpBroadcastSocket};

/// Node configuration for the production runtime.
#[derive(Clone)]
pub struct NodeConfig {
    /// This node's stable identifier.
    pub host_id: String,
    /// Address to listen for inbound tunnel connects on.
    pub tcp_bind: SocketAddr,
    /// Address to bind the discovery UDP socket to.
    pub udp_bind: SocketAddr,
    /// Address discovery datagrams are broadcast to.
    pub udp_broadcast: SocketAddr,
    /// Pre-shared device cipher protecting handshakes and discovery.
    pub pre_shared_cipher: Arc<dyn Cipher>,
    /// Message catalog tunnels use to decode application messages.
    pub catalog: Arc<MessageCatalog>,
    /// Factory for each tunnel's own key-ring.
    pub new_key_ring: Arc<dyn Fn() -> Arc<dyn packet_core::cipher::KeyRing> + Send + Sync>,
    /// Tunnel/connection-manager timing configuration.
    pub connection: ConnectionMgrConfig,
}

/// Production packet node.
///
/// Wraps [`NodeDriver`] with raw TCP/UDP transport and [`SystemEnv`].
pub struct Node {
    config: NodeConfig,
    env: SystemEnv,
    driver: Arc<Mutex<NodeDriver<Instant>>>,
    writers: Arc<Mutex<HashMap<ConnectionId, OwnedWriteHalf>>>,
    next_connection_id: AtomicU64,
}

impl Node {
    /// Builds a node driver for `config`. Does not bind any socket yet —
    /// see [`Self::run`].
    #[must_use]
    pub fn new(config: NodeConfig) -> Self {
        let driver = NodeDriver::new(
            config.host_id.clone(),
            config.tcp_bind.port(),
            config.pre_shared_cipher.clone(),
            config.catalog.clone(),
            config.new_key_ring.clone(),
            config.connection,
        );
        Self {
            config,
            env: SystemEnv::new(),
            driver: Arc::new(Mutex::new(driver)),
            writers: Arc::new(Mutex::new(HashMap::new())),
            next_connection_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> ConnectionId {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Runs the node until an unrecoverable transport error occurs: binds
    /// TCP and UDP, then spawns the accept loop, the discovery loop, and the
    /// liveness tick loop. Delivered application payloads are sent on the
    /// returned channel.
    ///
    /// # Errors
    ///
    /// [`NetError::Transport`] if the TCP listener or UDP socket cannot be
    /// bound.
    pub async fn run(self) -> Result<mpsc::UnboundedReceiver<(String, Bytes)>, NetError> {
        let tcp = TcpTransport::bind(self.config.tcp_bind).await?;
        let udp = Arc::new(UdpBroadcastSocket::bind(self.config.udp_bind, self.config.udp_broadcast).await?);
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

        let node = Arc::new(self);
        let handles = RuntimeHandles { udp, inbox: inbox_tx };

        tokio::spawn(accept_loop(Arc::clone(&node), tcp, handles.clone()));
        tokio::spawn(discovery_loop(Arc::clone(&node), handles.clone()));
        tokio::spawn(tick_loop(Arc::clone(&node), handles));

        Ok(inbox_rx)
    }

    /// Executes `actions`, recursing through whatever further actions they
    /// themselves cause (a `ConnectTcp` spawns a task that eventually
    /// produces more `NodeAction`s of its own, fed back through `handles`).
    async fn execute(self: &Arc<Self>, handles: &RuntimeHandles, actions: Vec<NodeAction>) {
        for action in actions {
            match action {
                NodeAction::SendTcp { connection, bytes } => {
                    let mut writers = self.writers.lock().await;
                    if let Some(writer) = writers.get_mut(&connection) {
                        if let Err(err) = writer.write_all(&bytes).await {
                            tracing::warn!(connection, %err, "tcp write failed");
                        }
                    }
                }
                NodeAction::CloseTcp { connection, reason } => {
                    tracing::debug!(connection, %reason, "closing tcp connection");
                    let mut writers = self.writers.lock().await;
                    if let Some(mut writer) = writers.remove(&connection) {
                        let _ = writer.shutdown().await;
                    }
                }
                NodeAction::Deliver { host_id, bytes } => {
                    let _ = handles.inbox.send((host_id, bytes));
                }
                NodeAction::ConnectionEstablished { host_id, initiator } => {
                    tracing::info!(host_id, initiator, "tunnel established");
                }
                NodeAction::ConnectionTerminated { host_id } => {
                    tracing::info!(?host_id, "tunnel terminated");
                }
                NodeAction::BroadcastUdp(bytes) => {
                    if let Err(err) = handles.udp.send_broadcast(&bytes).await {
                        tracing::warn!(%err, "discovery broadcast failed");
                    }
                }
                NodeAction::UnicastUdp { to, bytes } => {
                    if let Err(err) = handles.udp.send_to(&bytes, to).await {
                        tracing::warn!(%to, %err, "discovery unicast failed");
                    }
                }
                NodeAction::ConnectTcp { host_id, addr } => {
                    tokio::spawn(connect_to_peer(Arc::clone(self), handles.clone(), host_id, addr));
                }
            }
        }
    }
}

/// Shared handles every spawned task needs to execute [`NodeAction`]s:
/// the discovery socket and the channel delivered application payloads
/// are sent on.
#[derive(Clone)]
struct RuntimeHandles {
    udp: Arc<UdpBroadcastSocket>,
    inbox: mpsc::UnboundedSender<(String, Bytes)>,
}

async fn accept_loop(node: Arc<Node>, tcp: TcpTransport, handles: RuntimeHandles) {
    loop {
        match tcp.accept().await {
            Ok((stream, peer_addr)) => {
                let connection_id = node.next_id();
                let (read_half, write_half) = stream.into_split();
                node.writers.lock().await.insert(connection_id, write_half);

                let now = node.env.now();
                node.driver.lock().await.on_tcp_accepted(now, connection_id, Some(peer_addr));

                tokio::spawn(read_loop(Arc::clone(&node), handles.clone(), connection_id, read_half));
            }
            Err(err) => {
                tracing::error!(%err, "tcp accept failed");
            }
        }
    }
}

async fn read_loop(
    node: Arc<Node>,
    handles: RuntimeHandles,
    connection_id: ConnectionId,
    mut read_half: tokio::net::tcp::OwnedReadHalf,
) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };

        let now = node.env.now();
        let result = {
            let mut driver = node.driver.lock().await;
            driver.on_tcp_bytes(&node.env, now, connection_id, &buf[..n])
        };
        match result {
            Ok(actions) => node.execute(&handles, actions).await,
            Err(err) => {
                tracing::warn!(connection_id, %err, "tunnel rejected bytes, closing connection");
                break;
            }
        }
    }
    node.writers.lock().await.remove(&connection_id);
}

async fn connect_to_peer(node: Arc<Node>, handles: RuntimeHandles, host_id: String, addr: SocketAddr) {
    let stream = match transport::connect(addr).await {
        Ok(stream) => stream,
        Err(err) => {
            tracing::warn!(host_id, %addr, %err, "outbound connect failed");
            return;
        }
    };
    let connection_id = node.next_id();
    let local_addr = stream.local_addr().ok();
    let (mut read_half, write_half) = stream.into_split();
    node.writers.lock().await.insert(connection_id, write_half);

    let now = node.env.now();
    {
        let mut driver = node.driver.lock().await;
        let connect_actions = driver.register_connect(now, host_id.clone(), connection_id, local_addr);
        drop(driver);
        node.execute(&handles, connect_actions).await;
    }
    let connected_actions = {
        let mut driver = node.driver.lock().await;
        driver.on_tcp_connected(&node.env, now, &host_id)
    };
    match connected_actions {
        Ok(actions) => node.execute(&handles, actions).await,
        Err(err) => {
            tracing::warn!(host_id, %err, "on_tcp_connected failed");
            node.writers.lock().await.remove(&connection_id);
            return;
        }
    }

    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let now = node.env.now();
        let result = {
            let mut driver = node.driver.lock().await;
            driver.on_tcp_bytes(&node.env, now, connection_id, &buf[..n])
        };
        match result {
            Ok(actions) => node.execute(&handles, actions).await,
            Err(err) => {
                tracing::warn!(host_id, %err, "tunnel rejected bytes, closing connection");
                break;
            }
        }
    }
    node.writers.lock().await.remove(&connection_id);
}

async fn discovery_loop(node: Arc<Node>, handles: RuntimeHandles) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
    let mut buf = vec![0u8; 2048];
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let actions = {
                    let driver = node.driver.lock().await;
                    driver.initiate_discovery()
                };
                node.execute(&handles, actions).await;
            }
            received = handles.udp.recv(&mut buf) => {
                match received {
                    Ok((n, from)) => {
                        let actions = {
                            let mut driver = node.driver.lock().await;
                            driver.on_discovery_datagram(from, &buf[..n])
                        };
                        match actions {
                            Ok(actions) => node.execute(&handles, actions).await,
                            Err(err) => tracing::debug!(%from, %err, "dropping malformed discovery datagram"),
                        }
                    }
                    Err(err) => tracing::warn!(%err, "udp recv failed"),
                }
            }
        }
    }
}

async fn tick_loop(node: Arc<Node>, handles: RuntimeHandles) {
    let mut interval = tokio::time::interval(node.config.connection.tick_period);
    loop {
        interval.tick().await;
        let now = node.env.now();
        let actions = {
            let mut driver = node.driver.lock().await;
            driver.tick(&node.env, now)
        };
        node.execute(&handles, actions).await;
    }
}
