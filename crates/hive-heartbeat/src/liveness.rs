//! Per-link liveness trackers.
//!
//! [`PeerLiveness`] decides whether each peer is beating on one link from
//! the time of its last successful exchange. [`TxHealth`] follows the
//! success of outbound sends. Both return transitions only, so callers log
//! once per state change instead of once per failure.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

use hive_state::NodeName;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Beating,
    Stale,
}

/// Receive-side liveness of the peers seen on one link.
#[derive(Debug)]
pub struct PeerLiveness {
    timeout: Duration,
    last_seen: HashMap<NodeName, Instant>,
    beating: HashMap<NodeName, bool>,
}

impl PeerLiveness {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_seen: HashMap::new(),
            beating: HashMap::new(),
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Record a successful exchange with `peer`.
    pub fn record(&mut self, peer: &str, now: Instant) -> Option<Transition> {
        self.last_seen.insert(peer.to_string(), now);
        let was = self.beating.insert(peer.to_string(), true).unwrap_or(false);
        (!was).then_some(Transition::Beating)
    }

    /// Mark peers silent for longer than the timeout as stale.
    pub fn sweep(&mut self, now: Instant) -> Vec<NodeName> {
        let mut stale = Vec::new();
        for (peer, beating) in self.beating.iter_mut() {
            if !*beating {
                continue;
            }
            let silent = self
                .last_seen
                .get(peer)
                .is_none_or(|seen| now.saturating_duration_since(*seen) >= self.timeout);
            if silent {
                *beating = false;
                stale.push(peer.clone());
            }
        }
        stale.sort();
        stale
    }

    pub fn is_beating(&self, peer: &str) -> bool {
        self.beating.get(peer).copied().unwrap_or(false)
    }

    /// Peers currently beating, sorted.
    pub fn beating(&self) -> Vec<NodeName> {
        let mut peers: Vec<NodeName> = self
            .beating
            .iter()
            .filter(|(_, b)| **b)
            .map(|(p, _)| p.clone())
            .collect();
        peers.sort();
        peers
    }
}

/// Send-side health of one link, per destination.
#[derive(Debug, Default)]
pub struct TxHealth {
    ok: HashMap<String, bool>,
    consecutive_failures: HashMap<String, u32>,
}

impl TxHealth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a send outcome for `dest`. Returns the new state when it
    /// changed; the first outcome for a destination counts as a change only
    /// when it is a failure.
    pub fn record(&mut self, dest: &str, ok: bool) -> Option<bool> {
        let failures = self.consecutive_failures.entry(dest.to_string()).or_insert(0);
        if ok {
            *failures = 0;
        } else {
            *failures += 1;
            debug!(%dest, failures = *failures, "send failed");
        }
        let previous = self.ok.insert(dest.to_string(), ok);
        match previous {
            Some(prev) if prev != ok => Some(ok),
            None if !ok => Some(false),
            _ => None,
        }
    }

    pub fn consecutive_failures(&self, dest: &str) -> u32 {
        self.consecutive_failures.get(dest).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_exchange_starts_beating() {
        let mut live = PeerLiveness::new(Duration::from_secs(10));
        let t0 = Instant::now();
        assert_eq!(live.record("n2", t0), Some(Transition::Beating));
        assert_eq!(live.record("n2", t0 + Duration::from_secs(1)), None);
        assert!(live.is_beating("n2"));
    }

    #[test]
    fn silence_past_timeout_goes_stale_once() {
        let mut live = PeerLiveness::new(Duration::from_secs(10));
        let t0 = Instant::now();
        live.record("n2", t0);
        live.record("n3", t0 + Duration::from_secs(8));

        assert!(live.sweep(t0 + Duration::from_secs(9)).is_empty());
        assert_eq!(live.sweep(t0 + Duration::from_secs(10)), vec!["n2".to_string()]);
        assert!(live.sweep(t0 + Duration::from_secs(11)).is_empty());
        assert_eq!(live.beating(), vec!["n3".to_string()]);

        assert_eq!(live.record("n2", t0 + Duration::from_secs(12)), Some(Transition::Beating));
    }

    #[test]
    fn tx_health_reports_transitions_only() {
        let mut tx = TxHealth::new();
        assert_eq!(tx.record("n2", true), None);
        assert_eq!(tx.record("n2", false), Some(false));
        assert_eq!(tx.record("n2", false), None);
        assert_eq!(tx.consecutive_failures("n2"), 2);
        assert_eq!(tx.record("n2", true), Some(true));
        assert_eq!(tx.consecutive_failures("n2"), 0);
    }

    #[test]
    fn tx_first_failure_is_a_transition() {
        let mut tx = TxHealth::new();
        assert_eq!(tx.record("*", false), Some(false));
    }
}
