use tokio::sync::broadcast;
use tracing::trace;

use crate::messaging::message::Message;

/// What a node reports to its embedder. `MessageReceived` is the display
///  feed: every admitted DATA message in arrival order (the node's own
///  messages included, since they echo back through the fabric). Arrival
///  order is not creation order, consumers that care must sort.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NodeEvent {
    MessageReceived(MessageReceivedData),
    MessageAcknowledged(MessageAcknowledgedData),
    PeerDiscovered(PeerDiscoveredData),
    PeerBackOnline(PeerBackOnlineData),
    PeerSuspectedOffline(PeerSuspectedOfflineData),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MessageReceivedData {
    pub message: Message,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MessageAcknowledgedData {
    pub peer: String,
    pub id: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PeerDiscoveredData {
    pub peer: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PeerBackOnlineData {
    pub peer: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PeerSuspectedOfflineData {
    pub peer: String,
}


pub struct NodeEventNotifier {
    sender: broadcast::Sender<NodeEvent>,
}
impl NodeEventNotifier {
    pub fn new() -> NodeEventNotifier {
        let (sender, _) = broadcast::channel(128);

        NodeEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: NodeEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}
