//! Generation vector bookkeeping and outbound message selection.
//!
//! For each peer two counters are kept:
//!
//! - **acked**: the generation of *our* data the peer reports having
//!   installed (absent until we hear from the peer at all);
//! - **installed**: the generation of the *peer's* data we installed.
//!
//! Local diffs are retained in generation order until every peer that
//! acknowledged anything has moved past them.

use std::collections::BTreeMap;

use tracing::debug;

use crate::tree::{Delta, Diff};

/// Diffs kept for lagging peers before they are forced into a full resync.
pub const MAX_RETAINED_DIFFS: usize = 1024;

/// Which kind of message to send next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// Presence announcement, no bulk state.
    Ping,
    /// Whole local dataset.
    Full,
    /// Every retained diff with a generation above `since`.
    Patch { since: u64 },
}

#[derive(Debug, Default)]
pub struct GenerationTracker {
    local_gen: u64,
    acked: BTreeMap<String, u64>,
    installed: BTreeMap<String, u64>,
    diffs: BTreeMap<u64, Vec<Delta>>,
}

impl GenerationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generation of the local dataset.
    pub fn local_gen(&self) -> u64 {
        self.local_gen
    }

    /// Retain a freshly popped local diff.
    pub fn record_local(&mut self, diff: Diff) {
        self.local_gen = diff.generation;
        self.diffs.insert(diff.generation, diff.deltas);
        self.prune();
    }

    /// Our generation the peer reports having installed.
    pub fn acked_by(&self, peer: &str) -> Option<u64> {
        self.acked.get(peer).copied()
    }

    pub fn set_acked(&mut self, peer: &str, generation: u64) {
        self.acked.insert(peer.to_string(), generation);
        self.prune();
    }

    /// Generation of the peer's data we hold, 0 when none.
    pub fn installed(&self, peer: &str) -> u64 {
        self.installed.get(peer).copied().unwrap_or(0)
    }

    pub fn set_installed(&mut self, peer: &str, generation: u64) {
        self.installed.insert(peer.to_string(), generation);
    }

    /// Drop everything known about a peer.
    pub fn forget(&mut self, peer: &str) {
        self.acked.remove(peer);
        self.installed.remove(peer);
        self.prune();
    }

    /// Pick the cheapest valid message for one peer.
    pub fn select(&self, peer: &str) -> Selection {
        match self.acked_by(peer) {
            None => Selection::Ping,
            Some(0) => Selection::Full,
            Some(ack) if ack > self.local_gen => Selection::Full,
            Some(ack) if self.can_patch_from(ack) => Selection::Patch { since: ack },
            Some(_) => Selection::Full,
        }
    }

    /// Pick one message valid for every peer of a broadcast transport.
    pub fn select_broadcast<S: AsRef<str>>(&self, peers: &[S]) -> Selection {
        let mut since: Option<u64> = None;
        for peer in peers {
            match self.select(peer.as_ref()) {
                Selection::Full => return Selection::Full,
                Selection::Patch { since: ack } => {
                    since = Some(since.map_or(ack, |s| s.min(ack)));
                }
                Selection::Ping => {}
            }
        }
        match since {
            Some(since) => Selection::Patch { since },
            None => Selection::Ping,
        }
    }

    /// The generation vector we publish: our own generation plus what we
    /// installed from each peer.
    pub fn gen_vector<S: AsRef<str>>(&self, local: &str, peers: &[S]) -> BTreeMap<String, u64> {
        let mut gens = BTreeMap::new();
        gens.insert(local.to_string(), self.local_gen);
        for peer in peers {
            let peer = peer.as_ref();
            if peer != local {
                gens.insert(peer.to_string(), self.installed(peer));
            }
        }
        gens
    }

    /// Retained diffs strictly newer than `since`.
    pub fn deltas_since(&self, since: u64) -> BTreeMap<u64, Vec<Delta>> {
        self.diffs
            .range(since + 1..)
            .map(|(generation, deltas)| (*generation, deltas.clone()))
            .collect()
    }

    /// Whether every generation in `since+1..=local_gen` is still retained.
    pub fn can_patch_from(&self, since: u64) -> bool {
        if since > self.local_gen {
            return false;
        }
        if since == self.local_gen {
            return true;
        }
        self.diffs
            .keys()
            .next()
            .is_some_and(|first| *first <= since + 1)
    }

    fn prune(&mut self) {
        if let Some(floor) = self.acked.values().min().copied() {
            let keep = self.diffs.split_off(&(floor + 1));
            let dropped = self.diffs.len();
            self.diffs = keep;
            if dropped > 0 {
                debug!(floor, dropped, "pruned acknowledged diffs");
            }
        }
        while self.diffs.len() > MAX_RETAINED_DIFFS {
            self.diffs.pop_first();
        }
    }

    #[cfg(test)]
    pub(crate) fn retained(&self) -> usize {
        self.diffs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn diff(generation: u64) -> Diff {
        Diff {
            generation,
            deltas: vec![Delta::set(&["k"], json!(generation))],
        }
    }

    #[test]
    fn unknown_peer_gets_ping() {
        let tracker = GenerationTracker::new();
        assert_eq!(tracker.select("n2"), Selection::Ping);
    }

    #[test]
    fn zero_ack_gets_full() {
        let mut tracker = GenerationTracker::new();
        tracker.record_local(diff(1));
        tracker.set_acked("n2", 0);
        assert_eq!(tracker.select("n2"), Selection::Full);
    }

    #[test]
    fn ack_ahead_of_us_gets_full() {
        let mut tracker = GenerationTracker::new();
        tracker.record_local(diff(1));
        tracker.set_acked("n2", 9);
        assert_eq!(tracker.select("n2"), Selection::Full);
    }

    #[test]
    fn up_to_date_peer_gets_patch() {
        let mut tracker = GenerationTracker::new();
        for g in 1..=3 {
            tracker.record_local(diff(g));
        }
        tracker.set_acked("n2", 1);
        assert_eq!(tracker.select("n2"), Selection::Patch { since: 1 });
        let deltas = tracker.deltas_since(1);
        assert_eq!(deltas.keys().copied().collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn pruned_history_forces_full() {
        let mut tracker = GenerationTracker::new();
        for g in 1..=4 {
            tracker.record_local(diff(g));
        }
        tracker.set_acked("n2", 3);
        tracker.set_acked("n3", 3);
        assert_eq!(tracker.retained(), 1);

        // n3 restarted and reports an old generation we no longer hold.
        tracker.set_acked("n3", 1);
        assert_eq!(tracker.select("n3"), Selection::Full);
        assert_eq!(tracker.select("n2"), Selection::Patch { since: 3 });
    }

    #[test]
    fn broadcast_takes_most_demanding() {
        let mut tracker = GenerationTracker::new();
        for g in 1..=3 {
            tracker.record_local(diff(g));
        }
        tracker.set_acked("n3", 1);
        tracker.set_acked("n2", 2);
        assert_eq!(
            tracker.select_broadcast(&["n2", "n3", "n4"]),
            Selection::Patch { since: 1 }
        );

        tracker.set_acked("n4", 0);
        assert_eq!(tracker.select_broadcast(&["n2", "n3", "n4"]), Selection::Full);
        assert_eq!(tracker.select_broadcast(&["n5"]), Selection::Ping);
    }

    #[test]
    fn gen_vector_lists_installed() {
        let mut tracker = GenerationTracker::new();
        tracker.record_local(diff(1));
        tracker.set_installed("n2", 7);
        let gens = tracker.gen_vector("n1", &["n1", "n2", "n3"]);
        assert_eq!(gens.get("n1"), Some(&1));
        assert_eq!(gens.get("n2"), Some(&7));
        assert_eq!(gens.get("n3"), Some(&0));
    }
}
