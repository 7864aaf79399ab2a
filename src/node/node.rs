use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::bail;
use tokio::sync::{broadcast, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::messaging::message::{Message, ALL};
use crate::messaging::sockets::{
    bind_first_free_local_port, bind_local_sender, bind_multicast_listener, bind_multicast_sender,
};
use crate::node::delivery_tracker::{DeliveryTracker, PeerLiveness};
use crate::node::node_config::NodeConfig;
use crate::node::node_events::{NodeEvent, NodeEventNotifier};
use crate::node::receive_endpoint::ReceiveEndpoint;
use crate::node::retry_driver::run_retry_driver;
use crate::node::send_endpoint::{MessageSender, SendEndpoint};
use crate::relay::incoming_relay::IncomingRelay;
use crate::relay::outgoing_relay::OutgoingRelay;

/// A running node: relay pair, both endpoints and the retry driver, wired up
///  and spawned. Starting a node announces it to the group; the handle is
///  the embedder's API for sending text, watching events and shutting the
///  node down again (dropping the handle does not stop the tasks).
pub struct Node {
    config: Arc<NodeConfig>,
    tracker: Arc<RwLock<DeliveryTracker>>,
    send_endpoint: Arc<SendEndpoint>,
    notifier: Arc<NodeEventNotifier>,
    active: Arc<AtomicBool>,
    driver_shutdown: Arc<Notify>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Brings up a complete node. Any failure leaves nothing running: name
    ///  validation, port binding, joining the multicast group and the
    ///  announcement all happen before the first task is spawned.
    pub async fn start(config: NodeConfig) -> anyhow::Result<Node> {
        validate_node_name(&config.node_name)?;
        let config = Arc::new(config);

        let tracker = match &config.state_dir {
            Some(dir) => DeliveryTracker::load_or_default(dir, &config.node_name),
            None => DeliveryTracker::new(),
        };
        let tracker = Arc::new(RwLock::new(tracker));
        let notifier = Arc::new(NodeEventNotifier::new());
        let active = Arc::new(AtomicBool::new(true));
        let driver_shutdown = Arc::new(Notify::new());

        // forward port first, relay inbox next free port above it
        let (forward_socket, forward_port) =
            bind_first_free_local_port(config.local_port_base).await?;
        let (relay_inbox_socket, relay_inbox_port) =
            bind_first_free_local_port(forward_port + 1).await?;
        debug!(
            node = %config.node_name,
            "local ports: forward {}, relay inbox {}", forward_port, relay_inbox_port,
        );

        let fabric_listener = bind_multicast_listener(
            config.fabric_group,
            config.fabric_port,
            config.multicast_interface,
        )?;
        let incoming_relay = IncomingRelay::new(
            config.clone(),
            fabric_listener,
            bind_local_sender().await?,
            forward_port,
            active.clone(),
        );
        let outgoing_relay = OutgoingRelay::new(
            config.clone(),
            relay_inbox_socket,
            bind_multicast_sender(config.multicast_interface)?,
            active.clone(),
        );

        // announces this node to the group; the datagram waits in the bound
        //  inbox socket until the outgoing relay task starts draining it
        let send_endpoint =
            Arc::new(SendEndpoint::start(config.clone(), relay_inbox_port, tracker.clone()).await?);

        let receive_endpoint = ReceiveEndpoint::new(
            config.clone(),
            forward_socket,
            tracker.clone(),
            send_endpoint.clone(),
            notifier.clone(),
            active.clone(),
        );

        let tasks = vec![
            spawn_logged(&config.node_name, "incoming relay", incoming_relay.run()),
            spawn_logged(&config.node_name, "outgoing relay", outgoing_relay.run()),
            spawn_logged(&config.node_name, "receive endpoint", receive_endpoint.run()),
            tokio::spawn(run_retry_driver(
                config.clone(),
                tracker.clone(),
                send_endpoint.clone(),
                notifier.clone(),
                active.clone(),
                driver_shutdown.clone(),
            )),
        ];

        info!(node = %config.node_name, "node started");
        Ok(Node {
            config,
            tracker,
            send_endpoint,
            notifier,
            active,
            driver_shutdown,
            tasks,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.node_name
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.notifier.subscribe()
    }

    /// Broadcasts a text message to the group. Blank input is ignored
    ///  without consuming an id.
    pub async fn send_text(&self, text: &str) -> anyhow::Result<()> {
        let text = text.trim();
        if text.is_empty() {
            debug!(node = %self.config.node_name, "ignoring blank input");
            return Ok(());
        }

        let id = self.tracker.write().await.allocate_id();
        self.send_endpoint
            .send(Message::data(id, &self.config.node_name, text))
            .await
    }

    pub async fn known_peers(&self) -> Vec<String> {
        self.tracker.read().await.peer_names()
    }

    pub async fn peer_liveness(&self, peer: &str) -> Option<PeerLiveness> {
        self.tracker.read().await.liveness(peer, self.config.max_tries)
    }

    /// Stops all tasks and waits for them, then saves the tracker snapshot
    ///  (if persistence is configured). A failed save is logged, not raised:
    ///  the node is already down at that point.
    pub async fn shutdown(self) {
        info!(node = %self.config.node_name, "shutting down");
        self.active.store(false, Ordering::Release);
        self.driver_shutdown.notify_one();

        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(node = %self.config.node_name, "task ended abnormally: {}", e);
            }
        }

        if let Some(dir) = &self.config.state_dir {
            if let Err(e) = self.tracker.read().await.save(dir, &self.config.node_name) {
                warn!(node = %self.config.node_name, "cannot save delivery state: {}", e);
            }
        }
        info!(node = %self.config.node_name, "node stopped");
    }
}

/// Names travel in the colon-delimited wire format and `ALL` is the
///  broadcast destination, so neither works as a node name.
fn validate_node_name(name: &str) -> anyhow::Result<()> {
    if name.is_empty() {
        bail!("node name must not be empty");
    }
    if name.contains(':') {
        bail!("node name {:?} must not contain ':'", name);
    }
    if name == ALL {
        bail!("node name {:?} is reserved for addressing the whole group", ALL);
    }
    Ok(())
}

fn spawn_logged(
    node_name: &str,
    task: &'static str,
    work: impl Future<Output = anyhow::Result<()>> + Send + 'static,
) -> JoinHandle<()> {
    let node_name = node_name.to_string();
    tokio::spawn(async move {
        if let Err(e) = work.await {
            error!(node = %node_name, "{} failed: {}", task, e);
        }
    })
}
