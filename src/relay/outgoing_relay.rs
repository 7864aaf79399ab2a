use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::net::UdpSocket;
use tracing::{debug, info, trace};

use crate::messaging::message::{Message, MAX_PACKET_LEN};
use crate::messaging::sockets::poll_recv;
use crate::node::node_config::NodeConfig;

/// The node-facing half of a node's relay pair: everything the node drops
///  into its relay inbox port is re-broadcast to the fabric, unconditionally.
///  All filtering happens on the receiving side, so retransmissions pass
///  through here as often as the retry scheduler produces them.
pub struct OutgoingRelay {
    config: Arc<NodeConfig>,
    inbox_socket: UdpSocket,
    fabric_socket: UdpSocket,
    fabric_addr: SocketAddr,
    active: Arc<AtomicBool>,
}

impl OutgoingRelay {
    pub fn new(
        config: Arc<NodeConfig>,
        inbox_socket: UdpSocket,
        fabric_socket: UdpSocket,
        active: Arc<AtomicBool>,
    ) -> OutgoingRelay {
        let fabric_addr = SocketAddr::from((config.fabric_group, config.fabric_port));
        OutgoingRelay {
            config,
            inbox_socket,
            fabric_socket,
            fabric_addr,
            active,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            node = %self.config.node_name,
            "outgoing relay up, broadcasting to {}", self.fabric_addr,
        );

        let mut buf = BytesMut::with_capacity(MAX_PACKET_LEN);

        while self.active.load(Ordering::Acquire) {
            buf.clear();
            match poll_recv(&self.inbox_socket, self.config.poll_interval, &mut buf).await {
                None => continue,
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(_)) => {}
            }

            // decode-then-re-encode normalizes whatever the node handed us
            let msg = match Message::decode_datagram(&buf) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!(node = %self.config.node_name, "skipping undecodable outbound packet: {}", e);
                    continue;
                }
            };

            self.fabric_socket
                .send_to(msg.encode().as_bytes(), self.fabric_addr)
                .await?;
            trace!(node = %self.config.node_name, "broadcast {:?}", msg);
        }

        info!(node = %self.config.node_name, "outgoing relay stopped");
        Ok(())
    }
}
