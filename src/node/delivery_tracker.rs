use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::messaging::message::{Message, MessageKind};

/// Liveness band derived from a peer's retry counter.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PeerLiveness {
    Active,
    /// the counter has hit the limit; the next retry sweep announces the
    ///  peer as offline instead of resending
    SuspectedOffline,
    /// skipped by retry sweeps, but kept registered so a SYNC or an ack can
    ///  revive it
    Offline,
}

/// Delivery bookkeeping for one peer.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    tries: u32,
    missed: BTreeSet<u64>,
}

/// The node's delivery ledger: which peers exist, which of this node's own
///  DATA messages each of them has not acknowledged yet, and how many retry
///  rounds each peer has been through.
///
/// All mutation goes through `&mut self` methods, so each operation is
///  atomic under the owner's lock; the node keeps the tracker behind one
///  `RwLock` and holds the write guard across compound updates (such as
///  acknowledge-and-reset).
#[derive(Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct DeliveryTracker {
    peers: FxHashMap<String, PeerRecord>,
    sent_messages: FxHashMap<u64, Message>,
    last_id: u64,
}

impl DeliveryTracker {
    pub fn new() -> DeliveryTracker {
        Default::default()
    }

    /// Ids start at 1; the discovery announcement uses the fixed id 0.
    pub fn allocate_id(&mut self) -> u64 {
        self.last_id += 1;
        self.last_id
    }

    /// Registers a peer, idempotently. Returns true if it was new.
    pub fn add_peer(&mut self, name: &str) -> bool {
        if self.peers.contains_key(name) {
            return false;
        }
        self.peers.insert(name.to_string(), PeerRecord::default());
        true
    }

    pub fn known_peer(&self, name: &str) -> bool {
        self.peers.contains_key(name)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Peer names in sorted order, so sweeps visit peers deterministically.
    pub fn peer_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.peers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn tries(&self, name: &str) -> Option<u32> {
        self.peers.get(name).map(|record| record.tries)
    }

    pub fn liveness(&self, name: &str, max_tries: u32) -> Option<PeerLiveness> {
        let tries = self.tries(name)?;
        let liveness = if tries < max_tries {
            PeerLiveness::Active
        } else if tries == max_tries {
            PeerLiveness::SuspectedOffline
        } else {
            PeerLiveness::Offline
        };
        Some(liveness)
    }

    /// Records one of this node's own DATA messages. On first insertion the
    ///  id is marked missed for every peer known *right now* - peers joining
    ///  later start with a clean slate. Re-recording the same id (the retry
    ///  path sends through the same code) changes nothing.
    pub fn add_message(&mut self, msg: Message) {
        if msg.kind != MessageKind::Data {
            debug!("not tracking {:?} - only DATA is retried", msg.kind);
            return;
        }
        if self.sent_messages.contains_key(&msg.id) {
            return;
        }
        for record in self.peers.values_mut() {
            record.missed.insert(msg.id);
        }
        self.sent_messages.insert(msg.id, msg);
    }

    /// A peer has confirmed one of our messages. Acks can arrive from peers
    ///  we never completed a handshake with; those are registered on the
    ///  spot.
    pub fn acknowledge(&mut self, peer: &str, id: u64) {
        if self.add_peer(peer) {
            debug!("ack from unknown peer {} - registering it", peer);
        }
        if let Some(record) = self.peers.get_mut(peer) {
            record.missed.remove(&id);
        }
    }

    pub fn reset_tries(&mut self, peer: &str) {
        match self.peers.get_mut(peer) {
            Some(record) => record.tries = 0,
            None => debug!("reset_tries for unknown peer {}", peer),
        }
    }

    pub fn increase_tries(&mut self, peer: &str) {
        match self.peers.get_mut(peer) {
            Some(record) => record.tries += 1,
            None => debug!("increase_tries for unknown peer {}", peer),
        }
    }

    /// The retry sweep's work list for one peer: every one of our own
    ///  messages the peer has not acknowledged, oldest creation first, each
    ///  with the destination rewritten to address the peer directly (callers
    ///  rely on that for the resend).
    pub fn missed_messages(&self, peer: &str) -> Vec<Message> {
        let record = match self.peers.get(peer) {
            Some(record) => record,
            None => return Vec::new(),
        };

        let mut result: Vec<Message> = record
            .missed
            .iter()
            .filter_map(|id| self.sent_messages.get(id))
            .cloned()
            .collect();
        result.sort_by(|a, b| a.cmp_by_creation(b));
        for msg in &mut result {
            msg.destination = peer.to_string();
        }
        result
    }

    fn snapshot_path(dir: &Path, node_name: &str) -> PathBuf {
        dir.join(format!("{}.groupcast.json", node_name))
    }

    /// Restores the node's snapshot. A missing file is a normal fresh start;
    ///  a file that cannot be read or parsed is warned about and ignored.
    pub fn load_or_default(dir: &Path, node_name: &str) -> DeliveryTracker {
        let path = Self::snapshot_path(dir, node_name);
        if !path.exists() {
            return DeliveryTracker::new();
        }
        match read_snapshot(&path) {
            Ok(tracker) => {
                debug!("restored delivery state from {:?}", path);
                tracker
            }
            Err(e) => {
                warn!("cannot restore delivery state from {:?}: {} - starting empty", path, e);
                DeliveryTracker::new()
            }
        }
    }

    pub fn save(&self, dir: &Path, node_name: &str) -> anyhow::Result<()> {
        fs::create_dir_all(dir)?;
        let path = Self::snapshot_path(dir, node_name);
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        debug!("saved delivery state to {:?}", path);
        Ok(())
    }
}

fn read_snapshot(path: &Path) -> anyhow::Result<DeliveryTracker> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::message::stamped_data;
    use crate::test_util::node::temp_state_dir;
    use rstest::rstest;

    const MAX_TRIES: u32 = 3;

    #[test]
    fn test_add_peer() {
        let mut tracker = DeliveryTracker::new();

        assert!(tracker.add_peer("bob"));
        assert!(!tracker.add_peer("bob"));
        assert!(tracker.known_peer("bob"));
        assert!(!tracker.known_peer("carol"));
        assert_eq!(tracker.peer_count(), 1);
        assert_eq!(tracker.tries("bob"), Some(0));
    }

    #[test]
    fn test_peer_names_are_sorted() {
        let mut tracker = DeliveryTracker::new();
        tracker.add_peer("carol");
        tracker.add_peer("alice");
        tracker.add_peer("bob");

        assert_eq!(tracker.peer_names(), vec!["alice", "bob", "carol"]);
    }

    #[test]
    fn test_allocate_id_starts_past_the_announcement_id() {
        let mut tracker = DeliveryTracker::new();
        assert_eq!(tracker.allocate_id(), 1);
        assert_eq!(tracker.allocate_id(), 2);
    }

    #[test]
    fn test_add_message_marks_missed_for_currently_known_peers() {
        let mut tracker = DeliveryTracker::new();
        tracker.add_peer("bob");
        tracker.add_message(stamped_data(1, "alice", "ALL", 1_000));

        // whoever joins later does not owe us an ack for older messages
        tracker.add_peer("carol");

        assert_eq!(tracker.missed_messages("bob").len(), 1);
        assert!(tracker.missed_messages("carol").is_empty());
    }

    #[test]
    fn test_add_message_is_first_insertion_wins() {
        let mut tracker = DeliveryTracker::new();
        tracker.add_peer("bob");
        tracker.add_message(stamped_data(1, "alice", "ALL", 1_000));
        tracker.acknowledge("bob", 1);

        // the retry path records the message again on resend - that must
        //  not resurrect the cleared entry
        tracker.add_message(stamped_data(1, "alice", "bob", 2_000));
        assert!(tracker.missed_messages("bob").is_empty());
    }

    #[test]
    fn test_add_message_tracks_data_only() {
        let mut tracker = DeliveryTracker::new();
        tracker.add_peer("bob");

        let sync = Message::sync_announcement("alice");
        tracker.add_message(sync);
        assert!(tracker.missed_messages("bob").is_empty());

        let ack = stamped_data(5, "carol", "alice", 1_000).ack_reply("alice");
        tracker.add_message(ack);
        assert!(tracker.missed_messages("bob").is_empty());
    }

    #[test]
    fn test_acknowledge_clears_the_id() {
        let mut tracker = DeliveryTracker::new();
        tracker.add_peer("bob");
        tracker.add_message(stamped_data(1, "alice", "ALL", 1_000));
        tracker.add_message(stamped_data(2, "alice", "ALL", 2_000));

        tracker.acknowledge("bob", 1);

        let still_missed = tracker.missed_messages("bob");
        assert_eq!(still_missed.len(), 1);
        assert_eq!(still_missed[0].id, 2);
    }

    #[test]
    fn test_acknowledge_registers_unknown_peers() {
        let mut tracker = DeliveryTracker::new();
        tracker.acknowledge("bob", 17);

        assert!(tracker.known_peer("bob"));
        assert_eq!(tracker.tries("bob"), Some(0));
    }

    #[test]
    fn test_acknowledge_unknown_id_is_a_no_op() {
        let mut tracker = DeliveryTracker::new();
        tracker.add_peer("bob");
        tracker.acknowledge("bob", 999);

        assert!(tracker.missed_messages("bob").is_empty());
    }

    #[test]
    fn test_tries_accounting() {
        let mut tracker = DeliveryTracker::new();
        tracker.add_peer("bob");

        tracker.increase_tries("bob");
        tracker.increase_tries("bob");
        assert_eq!(tracker.tries("bob"), Some(2));

        tracker.reset_tries("bob");
        assert_eq!(tracker.tries("bob"), Some(0));

        // unknown peers must not be invented by the counters
        tracker.increase_tries("carol");
        tracker.reset_tries("carol");
        assert!(!tracker.known_peer("carol"));
    }

    #[rstest]
    #[case::fresh(0, PeerLiveness::Active)]
    #[case::still_active(2, PeerLiveness::Active)]
    #[case::at_the_limit(3, PeerLiveness::SuspectedOffline)]
    #[case::beyond_the_limit(4, PeerLiveness::Offline)]
    fn test_liveness_bands(#[case] tries: u32, #[case] expected: PeerLiveness) {
        let mut tracker = DeliveryTracker::new();
        tracker.add_peer("bob");
        for _ in 0..tries {
            tracker.increase_tries("bob");
        }

        assert_eq!(tracker.liveness("bob", MAX_TRIES), Some(expected));
        assert_eq!(tracker.liveness("carol", MAX_TRIES), None);
    }

    #[test]
    fn test_missed_messages_rewrites_destination_and_orders_by_creation() {
        let mut tracker = DeliveryTracker::new();
        tracker.add_peer("bob");
        // inserted out of creation order on purpose
        tracker.add_message(stamped_data(2, "alice", "ALL", 5_000));
        tracker.add_message(stamped_data(1, "alice", "ALL", 1_000));
        tracker.add_message(stamped_data(3, "alice", "ALL", 9_000));

        let missed = tracker.missed_messages("bob");

        assert_eq!(missed.iter().map(|m| m.id).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(missed.iter().all(|m| m.destination == "bob"));
    }

    #[test]
    fn test_missed_messages_for_unknown_peer_is_empty() {
        let tracker = DeliveryTracker::new();
        assert!(tracker.missed_messages("nobody").is_empty());
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = temp_state_dir();
        let mut tracker = DeliveryTracker::new();
        tracker.add_peer("bob");
        tracker.add_message(stamped_data(1, "alice", "ALL", 1_000));
        tracker.increase_tries("bob");
        let _ = tracker.allocate_id();

        tracker.save(&dir, "alice").unwrap();
        let restored = DeliveryTracker::load_or_default(&dir, "alice");

        assert_eq!(restored, tracker);
        // and the id sequence continues instead of restarting
        assert_eq!(restored.last_id, tracker.last_id);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_load_without_snapshot_starts_empty() {
        let dir = temp_state_dir();
        let tracker = DeliveryTracker::load_or_default(&dir, "nobody");

        assert_eq!(tracker, DeliveryTracker::new());
    }

    #[test]
    fn test_load_with_corrupt_snapshot_starts_empty() {
        let dir = temp_state_dir();
        fs::create_dir_all(&dir).unwrap();
        fs::write(DeliveryTracker::snapshot_path(&dir, "alice"), "{ not json").unwrap();

        let tracker = DeliveryTracker::load_or_default(&dir, "alice");
        assert_eq!(tracker, DeliveryTracker::new());

        std::fs::remove_dir_all(&dir).ok();
    }
}
