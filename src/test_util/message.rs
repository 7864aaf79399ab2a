use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::{sleep, Instant};

use crate::messaging::message::{Message, MessageKind};
use crate::node::send_endpoint::MessageSender;

/// Message with both stamps pinned, for tests that exercise freshness
///  windows or creation order.
pub fn stamped_message(
    id: u64,
    source: &str,
    destination: &str,
    kind: MessageKind,
    content: &str,
    stamp: u64,
) -> Message {
    Message {
        id,
        source: source.to_string(),
        destination: destination.to_string(),
        kind,
        content: content.to_string(),
        created_at: stamp,
        sent_at: stamp,
    }
}

/// DATA message with pinned stamps and content derived from the id.
pub fn stamped_data(id: u64, source: &str, destination: &str, stamp: u64) -> Message {
    stamped_message(
        id,
        source,
        destination,
        MessageKind::Data,
        &format!("message {}", id),
        stamp,
    )
}

/// A [MessageSender] that transmits nothing and records everything, for
///  asserting on what a component tried to send.
#[derive(Debug, Default)]
pub struct TrackingMockMessageSender {
    sent: Arc<RwLock<Vec<Message>>>,
}

impl TrackingMockMessageSender {
    pub fn new() -> TrackingMockMessageSender {
        Default::default()
    }

    /// Removes and returns everything sent so far, in send order.
    pub async fn take_sent(&self) -> Vec<Message> {
        std::mem::take(&mut *self.sent.write().await)
    }

    /// Waits for the next sent message (components pace their replies) and
    ///  removes it. Panics when nothing shows up in time.
    pub async fn next_sent(&self, max_wait: Duration) -> Message {
        let deadline = Instant::now() + max_wait;
        loop {
            {
                let mut sent = self.sent.write().await;
                if !sent.is_empty() {
                    return sent.remove(0);
                }
            }
            if Instant::now() >= deadline {
                panic!("no message was sent within {:?}", max_wait);
            }
            sleep(Duration::from_millis(5)).await;
        }
    }

    pub async fn assert_nothing_sent(&self) {
        let sent = self.sent.read().await;
        assert!(sent.is_empty(), "unexpected sends: {:?}", *sent);
    }
}

#[async_trait]
impl MessageSender for TrackingMockMessageSender {
    async fn send(&self, message: Message) -> anyhow::Result<()> {
        self.sent.write().await.push(message);
        Ok(())
    }
}
