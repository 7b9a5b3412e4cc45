//! Packet node binary.
//!
//! # Usage
//!
//! ```bash
//! packet-node --host-id node-a --tcp-bind 0.0.0.0:7700 --udp-bind 0.0.0.0:7701 \
//!     --udp-broadcast 255.255.255.255:7701 --psk 6f6f.. (64 hex chars)
//! ```

use std::sync::Arc;

use clap::Parser;
use packet_core::{
    ConnectionMgrConfig,
    cipher::{ChaChaCipher, InMemoryKeyRing, KeyRing, SymmetricKey},
};
use packet_net::{Node, NodeConfig};
use packet_proto::MessageCatalog;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Packet protocol node
#[derive(Parser, Debug)]
#[command(name = "packet-node")]
#[command(about = "Packet protocol node: tunnels over TCP, peer discovery over UDP broadcast")]
#[command(version)]
struct Args {
    /// This node's stable identifier
    #[arg(long)]
    host_id: String,

    /// Address to listen for inbound tunnel connections on
    #[arg(long, default_value = "0.0.0.0:7700")]
    tcp_bind: String,

    /// Address to bind the discovery UDP socket to
    #[arg(long, default_value = "0.0.0.0:7701")]
    udp_bind: String,

    /// Address discovery datagrams are broadcast to
    #[arg(long, default_value = "255.255.255.255:7701")]
    udp_broadcast: String,

    /// Pre-shared device key, 64 hex characters (32 bytes), shared by every
    /// node allowed to join this network
    #[arg(long)]
    psk: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_psk(hex: &str) -> Result<SymmetricKey, Box<dyn std::error::Error>> {
    if hex.len() != 64 {
        return Err("psk must be exactly 32 bytes (64 hex chars)".into());
    }
    let mut array = [0u8; 32];
    for (i, byte) in array.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)?;
    }
    Ok(SymmetricKey(array))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!(host_id = %args.host_id, "packet node starting");

    let psk = parse_psk(&args.psk)?;
    let pre_shared_cipher = Arc::new(ChaChaCipher::new([0u8; 32], &psk));

    let config = NodeConfig {
        host_id: args.host_id,
        tcp_bind: args.tcp_bind.parse()?,
        udp_bind: args.udp_bind.parse()?,
        udp_broadcast: args.udp_broadcast.parse()?,
        pre_shared_cipher,
        catalog: Arc::new(MessageCatalog::with_defaults()),
        new_key_ring: Arc::new(|| Arc::new(InMemoryKeyRing::new()) as Arc<dyn KeyRing>),
        connection: ConnectionMgrConfig::default(),
    };

    let node = Node::new(config);
    let mut inbox = node.run().await?;

    while let Some((host_id, bytes)) = inbox.recv().await {
        tracing::info!(host_id, bytes = bytes.len(), "delivered application payload");
    }

    Ok(())
}
