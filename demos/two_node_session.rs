use std::time::Duration;

use clap::Parser;
use clap_derive::Parser;
use groupcast::node::node::Node;
use groupcast::node::node_config::NodeConfig;
use groupcast::node::node_events::NodeEvent;
use tokio::time::sleep;
use tracing::{info, Level};

/// Scripted session: two nodes in one process share the fabric port,
///  discover each other and exchange a few messages, with the whole
///  handshake and acknowledgement traffic visible in the log.
#[derive(Parser)]
struct Args {
    #[clap(long, default_value_t = 41024)]
    fabric_port: u16,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::TRACE } else { Level::DEBUG })
        .try_init()
        .ok();

    let mut config_a = NodeConfig::new("alice");
    config_a.fabric_port = args.fabric_port;
    let mut config_b = NodeConfig::new("bob");
    config_b.fabric_port = args.fabric_port;

    let alice = Node::start(config_a).await?;
    let bob = Node::start(config_b).await?;
    watch_events(&alice);
    watch_events(&bob);

    // give the discovery handshake a moment to cross the fabric
    sleep(Duration::from_millis(500)).await;
    info!("alice knows {:?}", alice.known_peers().await);
    info!("bob knows {:?}", bob.known_peers().await);

    alice.send_text("hello bob").await?;
    bob.send_text("hello alice").await?;
    alice.send_text("nice to hear from you").await?;

    // long enough for delivery and the acknowledgement round trip
    sleep(Duration::from_secs(1)).await;

    alice.shutdown().await;
    bob.shutdown().await;
    Ok(())
}

fn watch_events(node: &Node) {
    let name = node.name().to_string();
    let mut events = node.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                NodeEvent::MessageReceived(data) => {
                    info!("{} sees - {}: {}", name, data.message.source, data.message.content);
                }
                NodeEvent::MessageAcknowledged(data) => {
                    info!("{} knows that {} received message {}", name, data.peer, data.id);
                }
                other => info!("{} observed {:?}", name, other),
            }
        }
    });
}
