//! Raw TCP and UDP transport.
//!
//! Tunnels run one per [`tokio::net::TcpStream`]; discovery runs over one
//! shared broadcast-enabled [`tokio::net::UdpSocket`] per node (§4.7). This
//! module owns no protocol state — it is pure socket plumbing the
//! [`crate::driver::NodeDriver`] never has to see.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream, UdpSocket};

use crate::error::NetError;

/// A bound TCP listener accepting inbound tunnel connections.
pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    /// Binds a listener to `addr`.
    ///
    /// # Errors
    ///
    /// [`NetError::Transport`] if the address cannot be bound.
    pub async fn bind(addr: SocketAddr) -> Result<Self, NetError> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(%addr, "TCP transport bound");
        Ok(Self { listener })
    }

    /// Accepts the next inbound connection.
    ///
    /// # Errors
    ///
    /// [`NetError::Transport`] if the accept fails.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), NetError> {
        let (stream, peer_addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream, peer_addr))
    }

    /// Address this transport is actually bound to (resolves port 0).
    ///
    /// # Errors
    ///
    /// [`NetError::Transport`] if the OS cannot report the bound address.
    pub fn local_addr(&self) -> Result<SocketAddr, NetError> {
        Ok(self.listener.local_addr()?)
    }
}

/// Opens an outbound TCP connection to `addr`.
///
/// # Errors
///
/// [`NetError::Transport`] if the connect fails.
pub async fn connect(addr: SocketAddr) -> Result<TcpStream, NetError> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// A broadcast-enabled UDP socket for the discovery protocol.
pub struct UdpBroadcastSocket {
    socket: UdpSocket,
    broadcast_addr: SocketAddr,
}

impl UdpBroadcastSocket {
    /// Binds a UDP socket on `bind_addr`, enabling `SO_BROADCAST`, and
    /// remembers `broadcast_addr` (typically the sub-net's limited- or
    /// directed-broadcast address on the same port) for
    /// [`Self::send_broadcast`].
    ///
    /// # Errors
    ///
    /// [`NetError::Transport`] if the socket cannot be bound or configured.
    pub async fn bind(bind_addr: SocketAddr, broadcast_addr: SocketAddr) -> Result<Self, NetError> {
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.set_broadcast(true)?;
        tracing::info!(%bind_addr, %broadcast_addr, "UDP discovery socket bound");
        Ok(Self { socket, broadcast_addr })
    }

    /// Broadcasts `bytes` to the sub-net.
    ///
    /// # Errors
    ///
    /// [`NetError::Transport`] if the send fails.
    pub async fn send_broadcast(&self, bytes: &[u8]) -> Result<(), NetError> {
        self.socket.send_to(bytes, self.broadcast_addr).await?;
        Ok(())
    }

    /// Sends `bytes` directly to `to`.
    ///
    /// # Errors
    ///
    /// [`NetError::Transport`] if the send fails.
    pub async fn send_to(&self, bytes: &[u8], to: SocketAddr) -> Result<(), NetError> {
        self.socket.send_to(bytes, to).await?;
        Ok(())
    }

    /// Receives the next datagram into `buf`, returning its length and the
    /// sender's address.
    ///
    /// # Errors
    ///
    /// [`NetError::Transport`] if the receive fails.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), NetError> {
        Ok(self.socket.recv_from(buf).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tcp_transport_binds_and_accepts() {
        let transport = TcpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = transport.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        let client = tokio::spawn(async move { connect(addr).await });
        let (_, peer_addr) = transport.accept().await.unwrap();
        let client_stream = client.await.unwrap().unwrap();
        assert_eq!(peer_addr.ip(), client_stream.local_addr().unwrap().ip());
    }

    #[tokio::test]
    async fn udp_broadcast_socket_binds() {
        let socket =
            UdpBroadcastSocket::bind("127.0.0.1:0".parse().unwrap(), "127.0.0.1:9".parse().unwrap())
                .await
                .unwrap();
        assert!(socket.send_to(b"ping", "127.0.0.1:9".parse().unwrap()).await.is_ok());
    }
}
