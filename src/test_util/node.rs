use std::path::PathBuf;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::time::Duration;

use crate::node::node_config::NodeConfig;

static NEXT_FABRIC_PORT: AtomicU16 = AtomicU16::new(25000);
static NEXT_LOCAL_PORT_BASE: AtomicU16 = AtomicU16::new(26000);
static NEXT_STATE_DIR: AtomicUsize = AtomicUsize::new(0);

/// Node config with shrunk timing and a fabric port no other test uses, so
///  tests can run concurrently without hearing each other's traffic.
pub fn test_node_config(node_name: &str) -> NodeConfig {
    let mut config = NodeConfig::new(node_name);
    config.fabric_port = NEXT_FABRIC_PORT.fetch_add(1, Ordering::SeqCst);
    config.local_port_base = NEXT_LOCAL_PORT_BASE.fetch_add(8, Ordering::SeqCst);
    config.poll_interval = Duration::from_millis(10);
    config.ack_delay = Duration::from_millis(20);
    config.sync_reply_delay = Duration::from_millis(10);
    config.resend_pacing = Duration::from_millis(10);
    config.retry_base_period = Duration::from_millis(150);
    config
}

/// Config for a further node in the same test session: own local ports, but
///  the session's shared fabric port.
pub fn test_peer_config(node_name: &str, session: &NodeConfig) -> NodeConfig {
    let mut config = test_node_config(node_name);
    config.fabric_port = session.fabric_port;
    config
}

/// A directory path under the system temp dir that no other test uses. Not
///  created; callers that write to it clean it up themselves.
pub fn temp_state_dir() -> PathBuf {
    let n = NEXT_STATE_DIR.fetch_add(1, Ordering::SeqCst);
    std::env::temp_dir().join(format!("groupcast-test-{}-{}", std::process::id(), n))
}
