use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

use crate::messaging::message::{Message, MessageKind, MAX_PACKET_LEN, SYNC};
use crate::messaging::sockets::poll_recv;
use crate::node::delivery_tracker::{DeliveryTracker, PeerLiveness};
use crate::node::node_config::NodeConfig;
use crate::node::node_events::{
    MessageAcknowledgedData, MessageReceivedData, NodeEvent, NodeEventNotifier, PeerBackOnlineData,
    PeerDiscoveredData,
};
use crate::node::send_endpoint::MessageSender;

/// The node-facing half behind the incoming relay: owns the forward port and
///  dispatches everything the relay admits. Freshness, addressing and
///  duplicate suppression have already happened by the time a message
///  arrives here.
///
/// Replies (acknowledgements, SYNC reflections) are paced by the configured
///  delays and go out through the send seam on their own tasks, so the
///  receive loop never blocks on a reply.
pub struct ReceiveEndpoint {
    config: Arc<NodeConfig>,
    socket: UdpSocket,
    tracker: Arc<RwLock<DeliveryTracker>>,
    sender: Arc<dyn MessageSender>,
    notifier: Arc<NodeEventNotifier>,
    active: Arc<AtomicBool>,
}

impl ReceiveEndpoint {
    pub fn new(
        config: Arc<NodeConfig>,
        forward_socket: UdpSocket,
        tracker: Arc<RwLock<DeliveryTracker>>,
        sender: Arc<dyn MessageSender>,
        notifier: Arc<NodeEventNotifier>,
        active: Arc<AtomicBool>,
    ) -> ReceiveEndpoint {
        ReceiveEndpoint {
            config,
            socket: forward_socket,
            tracker,
            sender,
            notifier,
            active,
        }
    }

    /// Runs until deactivated or until the forward socket fails.
    pub async fn run(self) -> anyhow::Result<()> {
        info!(node = %self.config.node_name, "receive endpoint up");
        let result = self.receive_loop().await;
        info!(node = %self.config.node_name, "receive endpoint stopped");
        result
    }

    async fn receive_loop(&self) -> anyhow::Result<()> {
        let mut buf = BytesMut::with_capacity(MAX_PACKET_LEN);

        while self.active.load(Ordering::Acquire) {
            buf.clear();
            match poll_recv(&self.socket, self.config.poll_interval, &mut buf).await {
                None => continue,
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(_)) => {}
            }

            match Message::decode_datagram(&buf) {
                Ok(msg) => self.dispatch(msg).await,
                Err(e) => {
                    debug!(node = %self.config.node_name, "dropping undecodable forwarded packet: {}", e);
                }
            }
        }
        Ok(())
    }

    async fn dispatch(&self, msg: Message) {
        trace!(node = %self.config.node_name, "dispatching {:?}", msg);
        match msg.kind {
            MessageKind::Data => self.on_data(msg).await,
            MessageKind::Acknowledge => self.on_acknowledge(msg).await,
            MessageKind::Command => self.on_command(msg).await,
        }
    }

    /// Every admitted DATA message is surfaced as a [NodeEvent], the node's
    ///  own fabric echoes included (seeing one's own message come back is
    ///  the confirmation it was actually broadcast). Everyone else's
    ///  messages are acknowledged after [NodeConfig::ack_delay].
    async fn on_data(&self, msg: Message) {
        self.notifier.send_event(NodeEvent::MessageReceived(MessageReceivedData {
            message: msg.clone(),
        }));

        if msg.source == self.config.node_name {
            trace!(node = %self.config.node_name, "own message {} echoed back, not acknowledging", msg.id);
            return;
        }
        let reply = msg.ack_reply(&self.config.node_name);
        self.spawn_paced_reply(self.config.ack_delay, reply);
    }

    /// A peer confirms one of our DATA messages: the id is cleared from its
    ///  missed set and its retry counter starts over, in one tracker update.
    ///  Hearing from the peer at all proves it is alive.
    async fn on_acknowledge(&self, msg: Message) {
        if msg.source == self.config.node_name {
            trace!(node = %self.config.node_name, "own acknowledgement echoed back");
            return;
        }

        {
            let mut tracker = self.tracker.write().await;
            tracker.acknowledge(&msg.source, msg.id);
            tracker.reset_tries(&msg.source);
        }
        debug!(node = %self.config.node_name, "{} acknowledged message {}", msg.source, msg.id);
        self.notifier.send_event(NodeEvent::MessageAcknowledged(MessageAcknowledgedData {
            peer: msg.source,
            id: msg.id,
        }));
    }

    /// SYNC is the only command. It registers the sender (or revives it if
    ///  it was believed offline) and is reflected back after
    ///  [NodeConfig::sync_reply_delay]. The reflection keeps the original
    ///  stamps, so the back-and-forth between two nodes dies down once the
    ///  announcement ages out of the relays' freshness window.
    async fn on_command(&self, msg: Message) {
        if msg.source == self.config.node_name {
            trace!(node = %self.config.node_name, "own announcement echoed back");
            return;
        }
        if msg.content != SYNC {
            debug!(node = %self.config.node_name, "unknown command {:?} from {} - dropped", msg.content, msg.source);
            return;
        }

        let reply = msg.sync_reflection(&self.config.node_name);

        let (newly_discovered, revived) = {
            let mut tracker = self.tracker.write().await;
            if tracker.add_peer(&msg.source) {
                (true, false)
            } else {
                let revived = tracker.liveness(&msg.source, self.config.max_tries)
                    == Some(PeerLiveness::Offline);
                tracker.reset_tries(&msg.source);
                (false, revived)
            }
        };

        if newly_discovered {
            info!(node = %self.config.node_name, "now knows peer {}", msg.source);
            self.notifier.send_event(NodeEvent::PeerDiscovered(PeerDiscoveredData {
                peer: msg.source,
            }));
        } else if revived {
            info!(node = %self.config.node_name, "peer {} is up again", msg.source);
            self.notifier.send_event(NodeEvent::PeerBackOnline(PeerBackOnlineData {
                peer: msg.source,
            }));
        }

        self.spawn_paced_reply(self.config.sync_reply_delay, reply);
    }

    fn spawn_paced_reply(&self, delay: Duration, reply: Message) {
        let sender = self.sender.clone();
        let node_name = self.config.node_name.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            if let Err(e) = sender.send(reply).await {
                warn!(node = %node_name, "cannot send reply: {}", e);
            }
        });
    }
}
