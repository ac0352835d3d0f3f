//! What one node knows about one object during one pass.

use std::collections::{BTreeMap, BTreeSet};

use hive_placement::{CandidateFilter, RankedNode, ScoringWeights, candidates_from_snapshot, rank};
use hive_state::{InstanceMonitor, InstanceStatus, MonitorStatus, NodeName, NodeState, ObjectPath};

use crate::aggregate::{Aggregate, aggregate};
use crate::config::ObjectConfig;

/// A live peer's records for the object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeerInstance {
    pub smon: InstanceMonitor,
    pub instance: Option<InstanceStatus>,
}

impl PeerInstance {
    pub fn is_up(&self) -> bool {
        self.instance.as_ref().is_some_and(|i| i.avail.is_up())
    }
}

#[derive(Debug, Clone)]
pub struct ObjectView {
    pub path: ObjectPath,
    pub config: ObjectConfig,
    pub local: NodeName,
    /// Local smon, as the handlers see it this pass.
    pub smon: InstanceMonitor,
    pub instance: Option<InstanceStatus>,
    pub node_frozen: bool,
    pub agg: Aggregate,
    pub ranked: Vec<RankedNode>,
    pub leader: Option<NodeName>,
    /// Leader among provisioned and unprovisioned candidates alike.
    pub provision_leader: Option<NodeName>,
    pub peers: BTreeMap<NodeName, PeerInstance>,
    /// Aggregates of the parents and children.
    pub related: BTreeMap<ObjectPath, Aggregate>,
    pub overloaded: BTreeSet<NodeName>,
}

impl ObjectView {
    /// Build the view of `config.path` from the states of the live nodes,
    /// the local one included.
    pub fn build(
        config: ObjectConfig,
        local: &str,
        live: &BTreeMap<NodeName, NodeState>,
        related: BTreeMap<ObjectPath, Aggregate>,
    ) -> Self {
        let path = config.path.clone();
        let instances = instances_of(&path, live);
        let candidates = candidates_from_snapshot(&path, &config.nodes, live);
        let weights = ScoringWeights::default();
        let ranked = rank(&path, config.placement, &candidates, &CandidateFilter::default(), &weights);
        let provision_leader = hive_placement::leader(
            &path,
            config.placement,
            &candidates,
            &CandidateFilter::default()
                .with_unprovisioned(false)
                .with_start_failed(false),
            &weights,
        );
        let leader = if config.is_scaler() {
            // Scalers have no instances to rank: first live configured node.
            config.nodes.iter().find(|n| live.contains_key(*n)).cloned()
        } else {
            ranked.first().map(|r| r.node.clone())
        };
        let agg = aggregate(&config, &instances, &ranked);

        let local_state = live.get(local);
        let smon = local_state
            .and_then(|s| s.smon(&path))
            .cloned()
            .unwrap_or_default();
        let instance = local_state.and_then(|s| s.instance(&path)).cloned();
        let node_frozen = local_state.is_some_and(|s| s.is_frozen());

        let peers = live
            .iter()
            .filter(|(node, _)| node.as_str() != local)
            .filter(|(_, state)| state.smon(&path).is_some() || state.instance(&path).is_some())
            .map(|(node, state)| {
                let peer = PeerInstance {
                    smon: state.smon(&path).cloned().unwrap_or_default(),
                    instance: state.instance(&path).cloned(),
                };
                (node.clone(), peer)
            })
            .collect();
        let overloaded = live
            .iter()
            .filter(|(_, state)| state.stats.is_overloaded())
            .map(|(node, _)| node.clone())
            .collect();

        Self {
            path,
            config,
            local: local.to_string(),
            smon,
            instance,
            node_frozen,
            agg,
            ranked,
            leader,
            provision_leader,
            peers,
            related,
            overloaded,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.leader.as_deref() == Some(self.local.as_str())
    }

    pub fn is_provision_leader(&self) -> bool {
        self.provision_leader.as_deref() == Some(self.local.as_str())
    }

    pub fn rank_of(&self, node: &str) -> Option<usize> {
        self.ranked.iter().find(|r| r.node == node).map(|r| r.rank)
    }

    pub fn local_up(&self) -> bool {
        self.instance.as_ref().is_some_and(|i| i.avail.is_up())
    }

    pub fn local_frozen(&self) -> bool {
        self.instance.as_ref().is_some_and(|i| i.is_frozen())
    }

    pub fn peer(&self, node: &str) -> Option<&PeerInstance> {
        self.peers.get(node)
    }

    pub fn peers_in(&self, status: MonitorStatus) -> Vec<&str> {
        self.peers
            .iter()
            .filter(|(_, p)| p.smon.status == status)
            .map(|(n, _)| n.as_str())
            .collect()
    }

    pub fn peers_transitioning(&self) -> Vec<&str> {
        self.peers
            .iter()
            .filter(|(_, p)| p.smon.status.is_transitional())
            .map(|(n, _)| n.as_str())
            .collect()
    }

    /// Parents whose aggregate is not up. Unknown parents count as down.
    pub fn parents_down(&self) -> Vec<&str> {
        self.config
            .parents
            .iter()
            .filter(|p| !self.related.get(*p).is_some_and(|agg| agg.is_up()))
            .map(String::as_str)
            .collect()
    }

    /// Children with at least one instance up.
    pub fn children_up(&self) -> Vec<&str> {
        self.config
            .children
            .iter()
            .filter(|c| self.related.get(*c).is_some_and(|agg| !agg.is_down()))
            .map(String::as_str)
            .collect()
    }

    /// Nodes with an instance up or about to be: up, starting or ready.
    pub fn active_nodes(&self) -> BTreeSet<NodeName> {
        let mut nodes = self.agg.up.clone();
        let busy = |s: MonitorStatus| matches!(s, MonitorStatus::Starting | MonitorStatus::Ready);
        if busy(self.smon.status) {
            nodes.insert(self.local.clone());
        }
        for (node, peer) in &self.peers {
            if busy(peer.smon.status) {
                nodes.insert(node.clone());
            }
        }
        nodes
    }

    /// Whether the local node is among the best-ranked candidates needed to
    /// bring a flex object up to its target. Other active nodes count
    /// toward the target; the local node does not.
    pub fn among_best_inactive(&self) -> bool {
        let mut active = self.active_nodes();
        active.remove(&self.local);
        let target = self.config.flex_target().max(1) as usize;
        if active.len() >= target {
            return false;
        }
        self.ranked
            .iter()
            .filter(|r| !active.contains(&r.node))
            .take(target - active.len())
            .any(|r| r.node == self.local)
    }
}

/// Instance statuses published for `path` by the given nodes.
pub fn instances_of(path: &str, live: &BTreeMap<NodeName, NodeState>) -> BTreeMap<NodeName, InstanceStatus> {
    live.iter()
        .filter_map(|(node, state)| state.instance(path).map(|i| (node.clone(), i.clone())))
        .collect()
}

/// Aggregate of an object that may not be configured here: its topology is
/// taken from the published instances.
pub fn aggregate_path(path: &str, config: Option<ObjectConfig>, live: &BTreeMap<NodeName, NodeState>) -> Aggregate {
    let instances = instances_of(path, live);
    let config = config.unwrap_or_else(|| {
        let topology = instances.values().next().map(|i| i.topology).unwrap_or_default();
        ObjectConfig::new(path, &[]).with_topology(topology)
    });
    aggregate(&config, &instances, &[])
}
