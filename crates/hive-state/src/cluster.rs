//! ClusterState — the node's view of the whole cluster.
//!
//! Holds the local [`StateTree`], the installed copies of every peer's
//! dataset, the [`GenerationTracker`] and the per-link liveness registry.
//! Peer datasets are only mutated by the heartbeat merger; everything else
//! reads them through the typed accessors.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::{Mutex, MutexGuard, RwLock};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::generation::GenerationTracker;
use crate::tree::StateTree;
use crate::types::{NodeName, NodeState};

/// Shared cluster view. Wrap in an `Arc` to share across tasks.
pub struct ClusterState {
    local: NodeName,
    nodes: RwLock<Vec<NodeName>>,
    tree: StateTree,
    peers: RwLock<BTreeMap<NodeName, Value>>,
    gens: Mutex<GenerationTracker>,
    /// peer → links on which the peer is currently beating.
    beating: RwLock<BTreeMap<NodeName, BTreeSet<String>>>,
}

impl ClusterState {
    /// Create the view for `local`, member of the cluster `nodes`.
    pub fn new(local: &str, nodes: &[NodeName]) -> Self {
        let mut nodes: Vec<NodeName> = nodes.to_vec();
        if !nodes.iter().any(|n| n == local) {
            nodes.push(local.to_string());
        }
        Self {
            local: local.to_string(),
            nodes: RwLock::new(nodes),
            tree: StateTree::new(),
            peers: RwLock::new(BTreeMap::new()),
            gens: Mutex::new(GenerationTracker::new()),
            beating: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn local_name(&self) -> &str {
        &self.local
    }

    /// Configured cluster nodes, local node included, in configuration order.
    pub fn nodes(&self) -> Vec<NodeName> {
        self.nodes.read().clone()
    }

    /// Configured cluster nodes other than the local one.
    pub fn peer_names(&self) -> Vec<NodeName> {
        self.nodes
            .read()
            .iter()
            .filter(|n| **n != self.local)
            .cloned()
            .collect()
    }

    pub fn is_member(&self, node: &str) -> bool {
        self.nodes.read().iter().any(|n| n == node)
    }

    /// Replace the configured node list. Data of removed peers is dropped.
    pub fn set_nodes(&self, nodes: &[NodeName]) {
        let mut list: Vec<NodeName> = nodes.to_vec();
        if !list.iter().any(|n| *n == self.local) {
            list.push(self.local.clone());
        }
        let removed: Vec<NodeName> = self
            .nodes
            .read()
            .iter()
            .filter(|n| !list.contains(n))
            .cloned()
            .collect();
        *self.nodes.write() = list;
        for peer in removed {
            self.forget_peer(&peer);
        }
    }

    // ── Local dataset ──────────────────────────────────────────────

    pub fn local_tree(&self) -> &StateTree {
        &self.tree
    }

    /// Move pending local changes into a new generation. Returns the new
    /// generation when something changed.
    pub fn commit_local(&self) -> Option<u64> {
        let diff = self.tree.pop_diff()?;
        let generation = diff.generation;
        self.gens.lock().record_local(diff);
        debug!(generation, "local dataset committed");
        Some(generation)
    }

    pub fn generations(&self) -> MutexGuard<'_, GenerationTracker> {
        self.gens.lock()
    }

    // ── Peer datasets ──────────────────────────────────────────────

    pub fn peer_data(&self, peer: &str) -> Option<Value> {
        self.peers.read().get(peer).cloned()
    }

    pub fn has_peer_data(&self, peer: &str) -> bool {
        self.peers.read().contains_key(peer)
    }

    /// Replace a peer's whole dataset.
    pub fn install_peer(&self, peer: &str, data: Value) {
        self.peers.write().insert(peer.to_string(), data);
    }

    /// Mutate a peer's dataset in place, creating an empty one if absent.
    pub fn update_peer<R>(&self, peer: &str, f: impl FnOnce(&mut Value) -> R) -> R {
        let mut peers = self.peers.write();
        let data = peers
            .entry(peer.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
        f(data)
    }

    /// Drop a peer's dataset and generation counters.
    pub fn forget_peer(&self, peer: &str) {
        self.peers.write().remove(peer);
        self.gens.lock().forget(peer);
        self.beating.write().remove(peer);
        debug!(%peer, "peer forgotten");
    }

    // ── Typed views ────────────────────────────────────────────────

    /// Typed state of any node, local included.
    pub fn node_state(&self, node: &str) -> Option<NodeState> {
        let value = if node == self.local {
            self.tree.snapshot()
        } else {
            self.peer_data(node)?
        };
        match serde_json::from_value(value) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(%node, error = %e, "undecodable node dataset");
                None
            }
        }
    }

    pub fn local_state(&self) -> StateResult<NodeState> {
        serde_json::from_value(self.tree.snapshot())
            .map_err(|e| StateError::Deserialize(e.to_string()))
    }

    /// Typed states of every node we hold data for.
    pub fn snapshot(&self) -> BTreeMap<NodeName, NodeState> {
        let mut out = BTreeMap::new();
        if let Some(local) = self.node_state(&self.local) {
            out.insert(self.local.clone(), local);
        }
        let peers: Vec<(NodeName, Value)> = self
            .peers
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (node, value) in peers {
            match serde_json::from_value::<NodeState>(value) {
                Ok(state) => {
                    out.insert(node, state);
                }
                Err(e) => warn!(%node, error = %e, "undecodable node dataset"),
            }
        }
        out
    }

    // ── Liveness ───────────────────────────────────────────────────

    /// Record whether `peer` beats on `link`. Returns true when the peer's
    /// overall beating state changed.
    pub fn set_beating(&self, link: &str, peer: &str, beating: bool) -> bool {
        let mut map = self.beating.write();
        let was = map.get(peer).is_some_and(|links| !links.is_empty());
        let links = map.entry(peer.to_string()).or_default();
        if beating {
            links.insert(link.to_string());
        } else {
            links.remove(link);
        }
        let now = !links.is_empty();
        was != now
    }

    /// Drop every liveness record of a link (link stopped).
    pub fn forget_link(&self, link: &str) {
        for links in self.beating.write().values_mut() {
            links.remove(link);
        }
    }

    pub fn is_beating(&self, peer: &str) -> bool {
        self.beating
            .read()
            .get(peer)
            .is_some_and(|links| !links.is_empty())
    }

    /// Peers beating on at least one link.
    pub fn beating_peers(&self) -> BTreeSet<NodeName> {
        self.beating
            .read()
            .iter()
            .filter(|(_, links)| !links.is_empty())
            .map(|(peer, _)| peer.clone())
            .collect()
    }

    /// Beating peers we have never installed a full dataset from.
    pub fn peers_missing_dataset(&self) -> Vec<NodeName> {
        let gens = self.gens.lock();
        self.beating_peers()
            .into_iter()
            .filter(|peer| gens.installed(peer) == 0)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeMonitorStatus;
    use serde_json::json;

    fn cluster() -> ClusterState {
        ClusterState::new("n1", &["n1".into(), "n2".into(), "n3".into()])
    }

    #[test]
    fn peer_names_exclude_local() {
        let c = cluster();
        assert_eq!(c.peer_names(), vec!["n2".to_string(), "n3".to_string()]);
        assert!(c.is_member("n3"));
        assert!(!c.is_member("n9"));
    }

    #[test]
    fn commit_local_feeds_tracker() {
        let c = cluster();
        assert!(c.commit_local().is_none());
        c.local_tree()
            .set(&["monitor", "status"], json!("idle"))
            .unwrap();
        assert_eq!(c.commit_local(), Some(1));
        assert_eq!(c.generations().local_gen(), 1);
        assert_eq!(c.generations().deltas_since(0).len(), 1);
    }

    #[test]
    fn typed_snapshot_includes_local_and_peers() {
        let c = cluster();
        c.local_tree()
            .set(&["monitor", "status"], json!("idle"))
            .unwrap();
        c.install_peer("n2", json!({"monitor": {"status": "rejoin"}}));

        let snap = c.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap["n1"].monitor.status, NodeMonitorStatus::Idle);
        assert_eq!(snap["n2"].monitor.status, NodeMonitorStatus::Rejoin);
    }

    #[test]
    fn beating_is_union_of_links() {
        let c = cluster();
        assert!(c.set_beating("hb#1", "n2", true));
        assert!(!c.set_beating("hb#2", "n2", true));
        assert!(!c.set_beating("hb#1", "n2", false));
        assert!(c.is_beating("n2"));
        assert!(c.set_beating("hb#2", "n2", false));
        assert!(!c.is_beating("n2"));
    }

    #[test]
    fn missing_dataset_tracks_installed_generation() {
        let c = cluster();
        c.set_beating("hb#1", "n2", true);
        c.set_beating("hb#1", "n3", true);
        c.generations().set_installed("n2", 4);
        assert_eq!(c.peers_missing_dataset(), vec!["n3".to_string()]);
    }

    #[test]
    fn set_nodes_forgets_removed_peers() {
        let c = cluster();
        c.install_peer("n3", json!({}));
        c.set_nodes(&["n1".into(), "n2".into()]);
        assert!(!c.has_peer_data("n3"));
        assert_eq!(c.peer_names(), vec!["n2".to_string()]);
    }
}
