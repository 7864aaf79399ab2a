use rustc_hash::{FxHashMap, FxHashSet};

/// Per-relay record of the (source, id) pairs of all DATA messages that were
///  admitted so far. Retransmissions of an already delivered message are
///  dropped based on this. There is no eviction - the archive lives and
///  grows for as long as its relay does.
#[derive(Debug, Default)]
pub struct DuplicateArchive {
    seen: FxHashMap<String, FxHashSet<u64>>,
}

impl DuplicateArchive {
    pub fn new() -> DuplicateArchive {
        Default::default()
    }

    /// Idempotent: recording the same pair twice is a no-op.
    pub fn record(&mut self, source: &str, id: u64) {
        self.seen.entry(source.to_string()).or_default().insert(id);
    }

    pub fn seen(&self, source: &str, id: u64) -> bool {
        self.seen.get(source).map_or(false, |ids| ids.contains(&id))
    }
}
