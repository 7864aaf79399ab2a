use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::select;
use tokio::sync::{Notify, RwLock};
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

use crate::messaging::message::Message;
use crate::node::delivery_tracker::{DeliveryTracker, PeerLiveness};
use crate::node::node_config::NodeConfig;
use crate::node::node_events::{NodeEvent, NodeEventNotifier, PeerSuspectedOfflineData};
use crate::node::send_endpoint::MessageSender;

/// One retry tick: visits every known peer in sorted name order.
///
/// A peer that has exhausted its tries is announced offline exactly once
///  (the announcement bumps it into the offline band, where sweeps skip it
///  until a SYNC or an ack revives it). An active peer gets its missed
///  messages resent, oldest creation first, and its retry counter bumped -
///  but only if something was actually resent, so a peer with nothing
///  outstanding never drifts towards offline.
///
/// A free function rather than a method so tests can drive ticks directly,
///  without the periodic loop around them.
pub async fn retry_sweep(
    config: &NodeConfig,
    tracker: &RwLock<DeliveryTracker>,
    sender: &dyn MessageSender,
    notifier: &NodeEventNotifier,
) {
    let peer_names = tracker.read().await.peer_names();

    for peer in peer_names {
        let mut guard = tracker.write().await;
        match guard.liveness(&peer, config.max_tries) {
            None => {}
            Some(PeerLiveness::Offline) => {
                trace!(node = %config.node_name, "peer {} is offline, skipping", peer);
            }
            Some(PeerLiveness::SuspectedOffline) => {
                guard.increase_tries(&peer);
                info!(node = %config.node_name, "now believes peer {} is offline", peer);
                notifier.send_event(NodeEvent::PeerSuspectedOffline(PeerSuspectedOfflineData {
                    peer,
                }));
            }
            Some(PeerLiveness::Active) => {
                let missed = guard.missed_messages(&peer);
                // not held while pacing through the resends
                drop(guard);
                if missed.is_empty() {
                    continue;
                }
                debug!(node = %config.node_name, "resending {} missed message(s) to {}", missed.len(), peer);
                let resent = resend_missed(config, sender, missed).await;
                if resent > 0 {
                    tracker.write().await.increase_tries(&peer);
                }
            }
        }
    }
}

/// Resends one peer's batch: refresh the send stamp so the message passes
///  the relays' freshness window again, hand it to the sender, pace. A
///  message whose id repeats the one just sent is skipped (suppression of
///  immediate repeats only, a later recurrence of the same id goes out
///  again). A failed send is logged and the batch continues. Returns how
///  many messages went out.
async fn resend_missed(
    config: &NodeConfig,
    sender: &dyn MessageSender,
    missed: Vec<Message>,
) -> usize {
    let mut resent = 0;
    let mut prev_id = None;

    for mut msg in missed {
        if prev_id == Some(msg.id) {
            continue;
        }
        prev_id = Some(msg.id);

        msg.resurrect();
        let id = msg.id;
        match sender.send(msg).await {
            Ok(()) => resent += 1,
            Err(e) => warn!(node = %config.node_name, "cannot resend message {}: {}", id, e),
        }
        sleep(config.resend_pacing).await;
    }
    resent
}

/// The periodic loop around [retry_sweep]. The pause comes *after* each
///  sweep and is recomputed from the current peer count, so ticks never
///  overlap and a growing group stretches its retry cadence. `shutdown`
///  cuts a pending pause short; the loop then observes the cleared active
///  flag and ends.
pub async fn run_retry_driver(
    config: Arc<NodeConfig>,
    tracker: Arc<RwLock<DeliveryTracker>>,
    sender: Arc<dyn MessageSender>,
    notifier: Arc<NodeEventNotifier>,
    active: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
) {
    info!(node = %config.node_name, "retry driver up");

    while active.load(Ordering::Acquire) {
        retry_sweep(&config, &tracker, sender.as_ref(), &notifier).await;

        let peer_count = tracker.read().await.peer_count().max(1);
        let period = config.retry_base_period * (peer_count as u32);
        select! {
            _ = sleep(period) => {}
            _ = shutdown.notified() => {}
        }
    }
    info!(node = %config.node_name, "retry driver stopped");
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::message::ALL;
    use crate::node::send_endpoint::MockMessageSender;
    use crate::test_util::message::{stamped_data, TrackingMockMessageSender};
    use crate::test_util::node::test_node_config;
    use anyhow::anyhow;
    use std::time::Duration;
    use tokio::time::{timeout, Instant};

    struct SweepFixture {
        config: NodeConfig,
        tracker: RwLock<DeliveryTracker>,
        sender: TrackingMockMessageSender,
        notifier: NodeEventNotifier,
    }

    fn sweep_fixture(node_name: &str) -> SweepFixture {
        SweepFixture {
            config: test_node_config(node_name),
            tracker: RwLock::new(DeliveryTracker::new()),
            sender: TrackingMockMessageSender::new(),
            notifier: NodeEventNotifier::new(),
        }
    }

    impl SweepFixture {
        async fn sweep(&self) {
            retry_sweep(&self.config, &self.tracker, &self.sender, &self.notifier).await;
        }

        async fn tries(&self, peer: &str) -> Option<u32> {
            self.tracker.read().await.tries(peer)
        }
    }

    #[tokio::test]
    async fn test_sweep_resends_in_creation_order_readdressed_and_resurrected() {
        let fixture = sweep_fixture("alice");
        {
            let mut tracker = fixture.tracker.write().await;
            tracker.add_peer("bob");
            // inserted out of creation order on purpose
            tracker.add_message(stamped_data(2, "alice", ALL, 5_000));
            tracker.add_message(stamped_data(1, "alice", ALL, 1_000));
            tracker.add_message(stamped_data(3, "alice", ALL, 9_000));
        }

        fixture.sweep().await;

        let sent = fixture.sender.take_sent().await;
        assert_eq!(sent.iter().map(|m| m.id).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(sent.iter().all(|m| m.destination == "bob"));
        // creation stamps survive the resend, send stamps are refreshed
        assert_eq!(sent.iter().map(|m| m.created_at).collect::<Vec<_>>(), vec![1_000, 5_000, 9_000]);
        assert!(sent.iter().all(|m| m.sent_at > 9_000));

        assert_eq!(fixture.tries("bob").await, Some(1));
    }

    #[tokio::test]
    async fn test_sweep_with_nothing_outstanding_leaves_tries_alone() {
        let fixture = sweep_fixture("alice");
        fixture.tracker.write().await.add_peer("bob");

        fixture.sweep().await;
        fixture.sweep().await;

        fixture.sender.assert_nothing_sent().await;
        // an idle peer must never drift towards offline
        assert_eq!(fixture.tries("bob").await, Some(0));
    }

    #[tokio::test]
    async fn test_sweeps_escalate_an_unresponsive_peer_to_offline_once() {
        let fixture = sweep_fixture("alice");
        {
            let mut tracker = fixture.tracker.write().await;
            tracker.add_peer("bob");
            tracker.add_message(stamped_data(1, "alice", ALL, 1_000));
        }
        let mut events = fixture.notifier.subscribe();

        // three resend rounds while active (max_tries is 3)
        for round in 1..=3 {
            fixture.sweep().await;
            assert_eq!(fixture.sender.take_sent().await.len(), 1);
            assert_eq!(fixture.tries("bob").await, Some(round));
        }

        // the fourth sweep announces the peer offline instead of resending
        fixture.sweep().await;
        fixture.sender.assert_nothing_sent().await;
        assert_eq!(fixture.tries("bob").await, Some(4));
        assert_eq!(
            timeout(Duration::from_millis(500), events.recv()).await.unwrap().unwrap(),
            NodeEvent::PeerSuspectedOffline(PeerSuspectedOfflineData { peer: "bob".to_string() })
        );

        // offline peers are skipped, and the announcement is not repeated
        fixture.sweep().await;
        fixture.sender.assert_nothing_sent().await;
        assert_eq!(fixture.tries("bob").await, Some(4));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_acknowledgement_between_sweeps_stops_the_escalation() {
        let fixture = sweep_fixture("alice");
        {
            let mut tracker = fixture.tracker.write().await;
            tracker.add_peer("bob");
            tracker.add_message(stamped_data(1, "alice", ALL, 1_000));
        }

        fixture.sweep().await;
        assert_eq!(fixture.sender.take_sent().await.len(), 1);
        assert_eq!(fixture.tries("bob").await, Some(1));

        // what the receive endpoint does when bob's ack arrives
        {
            let mut tracker = fixture.tracker.write().await;
            tracker.acknowledge("bob", 1);
            tracker.reset_tries("bob");
        }

        fixture.sweep().await;
        fixture.sender.assert_nothing_sent().await;
        assert_eq!(fixture.tries("bob").await, Some(0));
    }

    #[tokio::test]
    async fn test_resend_skips_immediate_repeats_only() {
        let config = test_node_config("alice");
        let sender = TrackingMockMessageSender::new();

        let batch = vec![
            stamped_data(7, "alice", "bob", 1_000),
            stamped_data(7, "alice", "bob", 1_000),
            stamped_data(9, "alice", "bob", 2_000),
            stamped_data(7, "alice", "bob", 1_000),
        ];
        let resent = resend_missed(&config, &sender, batch).await;

        assert_eq!(resent, 3);
        let sent_ids: Vec<u64> = sender.take_sent().await.iter().map(|m| m.id).collect();
        assert_eq!(sent_ids, vec![7, 9, 7]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resend_paces_between_sends() {
        let config = test_node_config("alice");
        let sender = TrackingMockMessageSender::new();
        let batch = vec![
            stamped_data(1, "alice", "bob", 1_000),
            stamped_data(2, "alice", "bob", 2_000),
        ];

        let before = Instant::now();
        resend_missed(&config, &sender, batch).await;

        assert!(before.elapsed() >= config.resend_pacing * 2);
        assert_eq!(sender.take_sent().await.len(), 2);
    }

    #[tokio::test]
    async fn test_send_failures_are_survived_and_do_not_escalate_tries() {
        let config = test_node_config("alice");
        let tracker = RwLock::new(DeliveryTracker::new());
        {
            let mut guard = tracker.write().await;
            guard.add_peer("bob");
            guard.add_message(stamped_data(1, "alice", ALL, 1_000));
            guard.add_message(stamped_data(2, "alice", ALL, 2_000));
        }
        let notifier = NodeEventNotifier::new();

        let mut sender = MockMessageSender::new();
        sender
            .expect_send()
            .times(2)
            .returning(|_| Err(anyhow!("wire is down")));

        retry_sweep(&config, &tracker, &sender, &notifier).await;

        // nothing went out, so the peer is not pushed towards offline
        assert_eq!(tracker.read().await.tries("bob"), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_sweeps_periodically_until_shut_down() {
        let config = Arc::new(test_node_config("alice"));
        let tracker = Arc::new(RwLock::new(DeliveryTracker::new()));
        {
            let mut guard = tracker.write().await;
            guard.add_peer("bob");
            guard.add_message(stamped_data(1, "alice", ALL, 1_000));
        }
        let sender = Arc::new(TrackingMockMessageSender::new());
        let notifier = Arc::new(NodeEventNotifier::new());
        let active = Arc::new(AtomicBool::new(true));
        let shutdown = Arc::new(Notify::new());

        let handle = tokio::spawn(run_retry_driver(
            config,
            tracker,
            sender.clone(),
            notifier,
            active.clone(),
            shutdown.clone(),
        ));

        // one resend per sweep; seeing two proves the loop came around
        assert_eq!(sender.next_sent(Duration::from_secs(5)).await.id, 1);
        assert_eq!(sender.next_sent(Duration::from_secs(5)).await.id, 1);

        active.store(false, Ordering::Release);
        shutdown.notify_one();
        handle.await.unwrap();

        // stopped means stopped: no further resend shows up
        tokio::time::sleep(Duration::from_secs(10)).await;
        sender.take_sent().await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        sender.assert_nothing_sent().await;
    }
}
