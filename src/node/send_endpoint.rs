use std::fmt::{Debug, Formatter};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tracing::trace;

use crate::messaging::message::{Message, MessageKind};
use crate::messaging::sockets::bind_local_sender;
use crate::node::delivery_tracker::DeliveryTracker;
use crate::node::node_config::NodeConfig;

/// The transmit seam: fresh user messages, paced replies and retry resends
///  all go out through this.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageSender: Debug + Send + Sync + 'static {
    async fn send(&self, message: Message) -> anyhow::Result<()>;
}

/// Transmits by dropping encoded messages onto the node's own outgoing relay
///  inbox over loopback. Constructing the endpoint immediately broadcasts
///  the node's SYNC announcement - that is the whole join ceremony.
pub struct SendEndpoint {
    config: Arc<NodeConfig>,
    tracker: Arc<RwLock<DeliveryTracker>>,
    socket: UdpSocket,
    relay_inbox_addr: SocketAddr,
}

impl Debug for SendEndpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SendEndpoint({})", self.config.node_name)
    }
}

impl SendEndpoint {
    pub async fn start(
        config: Arc<NodeConfig>,
        relay_inbox_port: u16,
        tracker: Arc<RwLock<DeliveryTracker>>,
    ) -> anyhow::Result<SendEndpoint> {
        let endpoint = SendEndpoint {
            config,
            tracker,
            socket: bind_local_sender().await?,
            relay_inbox_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, relay_inbox_port)),
        };

        endpoint
            .send(Message::sync_announcement(&endpoint.config.node_name))
            .await?;
        Ok(endpoint)
    }
}

#[async_trait]
impl MessageSender for SendEndpoint {
    /// DATA becomes retry-eligible before it is handed to the relay, so a
    ///  message cannot be on the wire without being tracked. Send stamps are
    ///  the caller's business: constructors stamp fresh, the retry sweep
    ///  resurrects, replies echo.
    async fn send(&self, message: Message) -> anyhow::Result<()> {
        if message.kind == MessageKind::Data {
            self.tracker.write().await.add_message(message.clone());
        }

        self.socket
            .send_to(message.encode().as_bytes(), self.relay_inbox_addr)
            .await?;
        trace!(node = %self.config.node_name, "sent {:?}", message);
        Ok(())
    }
}
