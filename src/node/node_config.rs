use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

/// All tunables of a node. [NodeConfig::new] fills in the protocol defaults,
///  tests mostly shrink the timing.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// unique name of this node in the group; validated at startup
    pub node_name: String,

    /// shared multicast group all outgoing relays broadcast to
    pub fabric_group: Ipv4Addr,
    /// shared fabric port; every node's incoming relay binds it (with
    ///  `SO_REUSEADDR`, so many nodes fit on one host)
    pub fabric_port: u16,
    /// interface used both for joining the group and as multicast egress.
    ///  Loopback by default, which keeps a multi-node session self-contained
    ///  on a single host.
    pub multicast_interface: Ipv4Addr,
    /// probing base for the node's two loopback ports (forward port and
    ///  relay inbox port, first two free ports at or above this)
    pub local_port_base: u16,

    /// admission window, measured against a message's send stamp
    pub message_ttl: Duration,
    /// bounded receive poll, so loops observe deactivation promptly
    pub poll_interval: Duration,
    /// pacing before an acknowledgement reply goes out
    pub ack_delay: Duration,
    /// pacing before a SYNC reflection goes out
    pub sync_reply_delay: Duration,
    /// sleep between two resends within one retry sweep
    pub resend_pacing: Duration,
    /// multiplied by the number of known peers to get the sweep period
    pub retry_base_period: Duration,
    /// resend rounds for a peer before it is suspected offline
    pub max_tries: u32,

    /// directory for the delivery tracker snapshot; `None` disables
    ///  persistence
    pub state_dir: Option<PathBuf>,
}

impl NodeConfig {
    pub fn new(node_name: &str) -> NodeConfig {
        NodeConfig {
            node_name: node_name.to_string(),
            fabric_group: Ipv4Addr::new(225, 0, 0, 1),
            fabric_port: 41024,
            multicast_interface: Ipv4Addr::LOCALHOST,
            local_port_base: 41025,
            message_ttl: Duration::from_millis(3_000),
            poll_interval: Duration::from_millis(20),
            ack_delay: Duration::from_millis(200),
            sync_reply_delay: Duration::from_millis(100),
            resend_pacing: Duration::from_millis(200),
            retry_base_period: Duration::from_millis(3_000),
            max_tries: 3,
            state_dir: None,
        }
    }
}
