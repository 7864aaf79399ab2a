use std::path::PathBuf;

use clap::Parser;
use clap_derive::Parser;
use groupcast::node::node::Node;
use groupcast::node::node_config::NodeConfig;
use groupcast::node::node_events::NodeEvent;
use tokio::io::AsyncBufReadExt;
use tokio::select;
use tracing::Level;

/// Interactive group member: every line typed on stdin is broadcast, every
///  message from the group is printed. Run several of these (with distinct
///  names) on one host and they find each other.
#[derive(Parser)]
struct Args {
    /// unique name of this node in the group
    name: String,

    #[clap(long)]
    fabric_port: Option<u16>,

    /// directory for delivery state, making the node resumable
    #[clap(long)]
    state_dir: Option<PathBuf>,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::WARN,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let mut config = NodeConfig::new(&args.name);
    if let Some(port) = args.fabric_port {
        config.fabric_port = port;
    }
    config.state_dir = args.state_dir;

    let node = Node::start(config).await?;
    let mut events = node.subscribe();
    println!("{} is in the group - type a line to broadcast it, Ctrl-D to leave", node.name());

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) => node.send_text(&line).await?,
                    None => break,
                }
            }
            event = events.recv() => {
                if let Ok(event) = event {
                    print_event(&node, event);
                }
            }
        }
    }

    node.shutdown().await;
    Ok(())
}

fn print_event(node: &Node, event: NodeEvent) {
    match event {
        NodeEvent::MessageReceived(data) => {
            let you = if data.message.source == node.name() { " (you)" } else { "" };
            println!("{}{}: {}", data.message.source, you, data.message.content);
        }
        NodeEvent::MessageAcknowledged(data) => {
            println!("  [{} received message {}]", data.peer, data.id);
        }
        NodeEvent::PeerDiscovered(data) => println!("  [{} joined the group]", data.peer),
        NodeEvent::PeerBackOnline(data) => println!("  [{} is back online]", data.peer),
        NodeEvent::PeerSuspectedOffline(data) => println!("  [{} appears to be offline]", data.peer),
    }
}
