use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

use crate::messaging::duplicate_archive::DuplicateArchive;
use crate::messaging::message::{Message, MessageKind, ALL, MAX_PACKET_LEN};
use crate::messaging::sockets::poll_recv;
use crate::node::node_config::NodeConfig;
use crate::util::clock::epoch_millis;

/// Why the admission filter dropped a fabric message.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DropReason {
    Expired,
    NotForThisNode,
    Duplicate,
}

/// The fabric-facing half of a node's relay pair: listens on the shared
///  multicast port, filters what arrives, and forwards admitted messages to
///  the node's forward port over loopback. This is the only place where
///  freshness, addressing and duplicate suppression are enforced - the node
///  behind it trusts everything it is handed.
pub struct IncomingRelay {
    config: Arc<NodeConfig>,
    fabric_socket: UdpSocket,
    forward_socket: UdpSocket,
    forward_addr: SocketAddr,
    archive: DuplicateArchive,
    active: Arc<AtomicBool>,
}

impl IncomingRelay {
    pub fn new(
        config: Arc<NodeConfig>,
        fabric_socket: UdpSocket,
        forward_socket: UdpSocket,
        forward_port: u16,
        active: Arc<AtomicBool>,
    ) -> IncomingRelay {
        IncomingRelay {
            config,
            fabric_socket,
            forward_socket,
            forward_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, forward_port)),
            archive: DuplicateArchive::new(),
            active,
        }
    }

    /// Runs until deactivated or until the fabric socket fails. The group is
    ///  left on every exit path; the sockets close when the relay drops.
    pub async fn run(mut self) -> anyhow::Result<()> {
        info!(
            node = %self.config.node_name,
            "incoming relay up, fabric {}:{} -> {}",
            self.config.fabric_group, self.config.fabric_port, self.forward_addr,
        );

        let result = self.relay_loop().await;

        if let Err(e) = self
            .fabric_socket
            .leave_multicast_v4(self.config.fabric_group, self.config.multicast_interface)
        {
            warn!(node = %self.config.node_name, "cannot leave multicast group: {}", e);
        }
        info!(node = %self.config.node_name, "incoming relay stopped");
        result
    }

    async fn relay_loop(&mut self) -> anyhow::Result<()> {
        let mut buf = BytesMut::with_capacity(MAX_PACKET_LEN);

        while self.active.load(Ordering::Acquire) {
            buf.clear();
            let n = match poll_recv(&self.fabric_socket, self.config.poll_interval, &mut buf).await {
                None => continue,
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(n)) => n,
            };
            trace!(node = %self.config.node_name, "fabric datagram, len {}", n);

            let msg = match Message::decode_datagram(&buf) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!(node = %self.config.node_name, "dropping undecodable fabric packet: {}", e);
                    continue;
                }
            };

            match admission(
                &msg,
                &self.config.node_name,
                &self.archive,
                epoch_millis(),
                self.config.message_ttl,
            ) {
                Some(reason) => {
                    trace!(node = %self.config.node_name, ?reason, "dropping {:?}", msg);
                }
                None => {
                    if msg.kind == MessageKind::Data {
                        self.archive.record(&msg.source, msg.id);
                    }
                    self.forward_socket
                        .send_to(msg.encode().as_bytes(), self.forward_addr)
                        .await?;
                    trace!(node = %self.config.node_name, "forwarded {:?}", msg);
                }
            }
        }
        Ok(())
    }
}

/// The admission filter in its fixed order: freshness window first, then
///  addressing, then duplicate suppression (DATA only - acknowledgements and
///  commands pass however often they arrive). `None` admits the message.
fn admission(
    msg: &Message,
    node_name: &str,
    archive: &DuplicateArchive,
    now_millis: u64,
    ttl: Duration,
) -> Option<DropReason> {
    if msg.is_expired(now_millis, ttl) {
        return Some(DropReason::Expired);
    }
    if msg.destination != ALL && msg.destination != node_name {
        return Some(DropReason::NotForThisNode);
    }
    if msg.kind == MessageKind::Data && archive.seen(&msg.source, msg.id) {
        return Some(DropReason::Duplicate);
    }
    None
}
