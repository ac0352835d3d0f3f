//! Engine tunables and per-object configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use hive_placement::PlacementPolicy;
use hive_state::{NodeName, ObjectPath, Orchestrate, Topology};

/// Engine loop tunables.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    /// Idle interval between two passes.
    pub interval: Duration,
    /// How long a failover leader holds `ready` before starting.
    pub ready_period: Duration,
    /// How long a rejoining node waits for its peers before giving up and
    /// freezing itself.
    pub rejoin_grace: Duration,
    /// Ceiling on concurrently running actions.
    pub max_parallel: usize,
    /// Restart budget for resources that do not carry their own.
    pub default_restart: u32,
    /// Ceiling on concurrently created scaler slaves.
    pub scaler_throttle: usize,
    /// How long the scaler waits for a slave config to reach every peer.
    pub consensus_timeout: Duration,
    /// How long shutdown mode waits for local instances to settle.
    pub shutdown_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            ready_period: Duration::from_secs(5),
            rejoin_grace: Duration::from_secs(90),
            max_parallel: 10,
            default_restart: 0,
            scaler_throttle: 2,
            consensus_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl MonitorConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_ready_period(mut self, period: Duration) -> Self {
        self.ready_period = period;
        self
    }

    pub fn with_rejoin_grace(mut self, grace: Duration) -> Self {
        self.rejoin_grace = grace;
        self
    }

    pub fn with_max_parallel(mut self, max: usize) -> Self {
        self.max_parallel = max.max(1);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Definition of one object, as this node sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectConfig {
    pub path: ObjectPath,
    #[serde(default)]
    pub topology: Topology,
    /// Nodes the object may run on, in preference order.
    #[serde(default)]
    pub nodes: Vec<NodeName>,
    #[serde(default)]
    pub placement: PlacementPolicy,
    #[serde(default)]
    pub orchestrate: Orchestrate,
    #[serde(default)]
    pub flex_min: u32,
    #[serde(default)]
    pub flex_max: Option<u32>,
    #[serde(default)]
    pub flex_target: Option<u32>,
    #[serde(default)]
    pub parents: Vec<ObjectPath>,
    #[serde(default)]
    pub children: Vec<ObjectPath>,
    /// Set on scalers: desired number of slave instances.
    #[serde(default)]
    pub scale: Option<u32>,
    /// Instances per scaler slave.
    #[serde(default = "default_slave_size")]
    pub slave_size: u32,
    /// Fence a node whose restart budget ran out before taking over.
    #[serde(default)]
    pub stonith: bool,
}

fn default_slave_size() -> u32 {
    1
}

impl ObjectConfig {
    pub fn new(path: impl Into<ObjectPath>, nodes: &[&str]) -> Self {
        Self {
            path: path.into(),
            topology: Topology::Failover,
            nodes: nodes.iter().map(|n| n.to_string()).collect(),
            placement: PlacementPolicy::NodesOrder,
            orchestrate: Orchestrate::Ha,
            flex_min: 0,
            flex_max: None,
            flex_target: None,
            parents: Vec::new(),
            children: Vec::new(),
            scale: None,
            slave_size: 1,
            stonith: false,
        }
    }

    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    pub fn with_orchestrate(mut self, orchestrate: Orchestrate) -> Self {
        self.orchestrate = orchestrate;
        self
    }

    pub fn with_flex(mut self, min: u32, max: u32, target: u32) -> Self {
        self.topology = Topology::Flex;
        self.flex_min = min;
        self.flex_max = Some(max);
        self.flex_target = Some(target);
        self
    }

    pub fn with_parents(mut self, parents: &[&str]) -> Self {
        self.parents = parents.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_children(mut self, children: &[&str]) -> Self {
        self.children = children.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_scale(mut self, scale: u32, slave_size: u32) -> Self {
        self.scale = Some(scale);
        self.slave_size = slave_size.max(1);
        self
    }

    pub fn with_stonith(mut self, stonith: bool) -> Self {
        self.stonith = stonith;
        self
    }

    pub fn is_scaler(&self) -> bool {
        self.scale.is_some()
    }

    /// Upper bound of the flex window; the node count when unset.
    pub fn flex_max(&self) -> u32 {
        self.flex_max.unwrap_or(self.nodes.len() as u32)
    }

    /// Number of instances a flex object aims for.
    pub fn flex_target(&self) -> u32 {
        self.flex_target
            .unwrap_or(self.flex_min)
            .clamp(self.flex_min, self.flex_max().max(self.flex_min))
    }

    /// Checksum published in `services.config`, compared across nodes.
    pub fn csum(&self) -> String {
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&encoded))
    }
}
