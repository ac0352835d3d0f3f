//! Typed schema of a published node state.
//!
//! These records are what the orchestrator reads and writes. They are
//! stored as JSON inside the node's [`StateTree`](crate::StateTree) at the
//! paths given by the `*_path` helpers below.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Cluster node name.
pub type NodeName = String;

/// Object path (`namespace/kind/name`).
pub type ObjectPath = String;

// ── Node ──────────────────────────────────────────────────────────

/// The whole document one node publishes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeState {
    /// Protocol compatibility version of the publisher.
    #[serde(default)]
    pub compat: u32,
    /// Unix timestamp since which the node is frozen, 0 when thawed.
    #[serde(default)]
    pub frozen: f64,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Checksum of the node configuration.
    #[serde(default)]
    pub config_csum: String,
    #[serde(default)]
    pub monitor: NodeMonitor,
    #[serde(default)]
    pub services: Services,
    #[serde(default)]
    pub stats: NodeStats,
    #[serde(default)]
    pub locks: BTreeMap<String, Lock>,
}

impl NodeState {
    pub fn is_frozen(&self) -> bool {
        self.frozen > 0.0
    }

    pub fn instance(&self, path: &str) -> Option<&InstanceStatus> {
        self.services.status.get(path)
    }

    pub fn smon(&self, path: &str) -> Option<&InstanceMonitor> {
        self.monitor.services.get(path)
    }
}

/// Per-object records published by a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Services {
    #[serde(default)]
    pub status: BTreeMap<ObjectPath, InstanceStatus>,
    #[serde(default)]
    pub config: BTreeMap<ObjectPath, InstanceConfig>,
}

/// Load figures used for placement scoring and overload detection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeStats {
    pub load_15m: f64,
    /// Available memory, percent.
    pub mem_avail: f64,
    /// Available swap, percent.
    pub swap_avail: f64,
    pub mem_total_mb: u64,
    /// Below this memory percent the node is overloaded.
    #[serde(default = "default_min_avail_mem")]
    pub min_avail_mem: f64,
    /// Below this swap percent the node is overloaded.
    #[serde(default = "default_min_avail_swap")]
    pub min_avail_swap: f64,
}

fn default_min_avail_mem() -> f64 {
    2.0
}

fn default_min_avail_swap() -> f64 {
    10.0
}

impl Default for NodeStats {
    fn default() -> Self {
        Self {
            load_15m: 0.0,
            mem_avail: 100.0,
            swap_avail: 100.0,
            mem_total_mb: 0,
            min_avail_mem: default_min_avail_mem(),
            min_avail_swap: default_min_avail_swap(),
        }
    }
}

impl NodeStats {
    pub fn is_overloaded(&self) -> bool {
        self.mem_avail < self.min_avail_mem || self.swap_avail < self.min_avail_swap
    }
}

// ── Node monitor ──────────────────────────────────────────────────

/// Per-node orchestration record (nmon).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeMonitor {
    #[serde(default)]
    pub status: NodeMonitorStatus,
    #[serde(default)]
    pub status_updated: f64,
    #[serde(default)]
    pub global_expect: Option<NodeGlobalExpect>,
    #[serde(default)]
    pub global_expect_updated: f64,
    /// Instance monitors of the objects this node has an instance of.
    #[serde(default)]
    pub services: BTreeMap<ObjectPath, InstanceMonitor>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeMonitorStatus {
    #[default]
    Init,
    Rejoin,
    Idle,
    Shutting,
    Draining,
    Maintenance,
    Upgrade,
}

impl NodeMonitorStatus {
    /// States during which a peer's instance data is expected to be partial.
    pub fn preserves_instances(self) -> bool {
        matches!(self, Self::Init | Self::Maintenance | Self::Upgrade)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeGlobalExpect {
    Frozen,
    Thawed,
}

// ── Instance monitor ──────────────────────────────────────────────

/// Per (object, node) orchestration record (smon).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InstanceMonitor {
    #[serde(default)]
    pub status: MonitorStatus,
    #[serde(default)]
    pub status_updated: f64,
    #[serde(default)]
    pub local_expect: LocalExpect,
    #[serde(default)]
    pub global_expect: Option<GlobalExpect>,
    #[serde(default)]
    pub global_expect_updated: f64,
    /// Restart attempts per resource id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub restart: BTreeMap<String, u32>,
    /// Peer whose instance must be fenced before takeover.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stonith: Option<NodeName>,
}

impl InstanceMonitor {
    pub fn set_status(&mut self, status: MonitorStatus) {
        if self.status != status {
            self.status = status;
            self.status_updated = unix_now();
        }
    }

    pub fn set_global_expect(&mut self, expect: Option<GlobalExpect>) {
        if self.global_expect != expect {
            self.global_expect = expect;
            self.global_expect_updated = unix_now();
        }
    }
}

/// Orchestration status of an instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MonitorStatus {
    #[default]
    #[serde(rename = "idle")]
    Idle,
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "starting")]
    Starting,
    #[serde(rename = "stopping")]
    Stopping,
    #[serde(rename = "restarting")]
    Restarting,
    #[serde(rename = "freezing")]
    Freezing,
    #[serde(rename = "thawing")]
    Thawing,
    #[serde(rename = "provisioning")]
    Provisioning,
    #[serde(rename = "unprovisioning")]
    Unprovisioning,
    #[serde(rename = "deleting")]
    Deleting,
    #[serde(rename = "purging")]
    Purging,
    #[serde(rename = "shutting")]
    Shutting,
    #[serde(rename = "tocing")]
    Tocing,
    #[serde(rename = "scaling")]
    Scaling,
    #[serde(rename = "wait children")]
    WaitChildren,
    #[serde(rename = "wait parents")]
    WaitParents,
    #[serde(rename = "wait leader")]
    WaitLeader,
    #[serde(rename = "wait non-leader")]
    WaitNonLeader,
    #[serde(rename = "wait sync")]
    WaitSync,
    #[serde(rename = "start failed")]
    StartFailed,
    #[serde(rename = "stop failed")]
    StopFailed,
    #[serde(rename = "restart failed")]
    RestartFailed,
    #[serde(rename = "freeze failed")]
    FreezeFailed,
    #[serde(rename = "thaw failed")]
    ThawFailed,
    #[serde(rename = "provision failed")]
    ProvisionFailed,
    #[serde(rename = "unprovision failed")]
    UnprovisionFailed,
    #[serde(rename = "delete failed")]
    DeleteFailed,
    #[serde(rename = "purge failed")]
    PurgeFailed,
    #[serde(rename = "shutdown failed")]
    ShutdownFailed,
    #[serde(rename = "place failed")]
    PlaceFailed,
    #[serde(rename = "toc failed")]
    TocFailed,
}

impl MonitorStatus {
    /// An action is in flight for this instance.
    pub fn is_transitional(self) -> bool {
        use MonitorStatus::*;
        matches!(
            self,
            Starting
                | Stopping
                | Restarting
                | Freezing
                | Thawing
                | Provisioning
                | Unprovisioning
                | Deleting
                | Purging
                | Shutting
                | Tocing
                | Scaling
        )
    }

    pub fn is_failed(self) -> bool {
        use MonitorStatus::*;
        matches!(
            self,
            StartFailed
                | StopFailed
                | RestartFailed
                | FreezeFailed
                | ThawFailed
                | ProvisionFailed
                | UnprovisionFailed
                | DeleteFailed
                | PurgeFailed
                | ShutdownFailed
                | PlaceFailed
                | TocFailed
        )
    }

    pub fn is_waiting(self) -> bool {
        use MonitorStatus::*;
        matches!(self, WaitChildren | WaitParents | WaitLeader | WaitNonLeader | WaitSync)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LocalExpect {
    #[default]
    Unset,
    Started,
    Shutdown,
}

/// Cluster-wide desired state of an object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum GlobalExpect {
    Started,
    Stopped,
    Frozen,
    Thawed,
    Provisioned,
    Unprovisioned,
    Placed,
    /// Placed on an explicit ordered node list.
    PlacedAt(Vec<NodeName>),
    Purged,
    Deleted,
    Aborted,
    Shutdown,
}

impl fmt::Display for GlobalExpect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GlobalExpect::Started => "started",
            GlobalExpect::Stopped => "stopped",
            GlobalExpect::Frozen => "frozen",
            GlobalExpect::Thawed => "thawed",
            GlobalExpect::Provisioned => "provisioned",
            GlobalExpect::Unprovisioned => "unprovisioned",
            GlobalExpect::Placed => "placed",
            GlobalExpect::PlacedAt(nodes) => return write!(f, "placed@{}", nodes.join(",")),
            GlobalExpect::Purged => "purged",
            GlobalExpect::Deleted => "deleted",
            GlobalExpect::Aborted => "aborted",
            GlobalExpect::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

impl FromStr for GlobalExpect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(nodes) = s.strip_prefix("placed@") {
            let nodes: Vec<NodeName> = nodes
                .split(',')
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .collect();
            if nodes.is_empty() {
                return Err(format!("no destination in global expect {s:?}"));
            }
            return Ok(GlobalExpect::PlacedAt(nodes));
        }
        Ok(match s {
            "started" => GlobalExpect::Started,
            "stopped" => GlobalExpect::Stopped,
            "frozen" => GlobalExpect::Frozen,
            "thawed" => GlobalExpect::Thawed,
            "provisioned" => GlobalExpect::Provisioned,
            "unprovisioned" => GlobalExpect::Unprovisioned,
            "placed" => GlobalExpect::Placed,
            "purged" => GlobalExpect::Purged,
            "deleted" => GlobalExpect::Deleted,
            "aborted" => GlobalExpect::Aborted,
            "shutdown" => GlobalExpect::Shutdown,
            other => return Err(format!("unknown global expect {other:?}")),
        })
    }
}

impl TryFrom<String> for GlobalExpect {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<GlobalExpect> for String {
    fn from(value: GlobalExpect) -> Self {
        value.to_string()
    }
}

// ── Instance status ───────────────────────────────────────────────

/// Availability of an instance, or of an object once aggregated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Avail {
    #[serde(rename = "up")]
    Up,
    #[serde(rename = "down")]
    Down,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "stdby up")]
    StdbyUp,
    #[serde(rename = "stdby down")]
    StdbyDown,
    #[serde(rename = "mixed")]
    Mixed,
    #[default]
    #[serde(rename = "n/a")]
    NotApplicable,
}

impl Avail {
    pub fn is_up(self) -> bool {
        matches!(self, Avail::Up | Avail::Warn)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Provisioned {
    #[serde(rename = "true")]
    True,
    #[serde(rename = "false")]
    False,
    #[serde(rename = "mixed")]
    Mixed,
    #[default]
    #[serde(rename = "n/a")]
    NotApplicable,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topology {
    #[default]
    Failover,
    Flex,
    Span,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Orchestrate {
    /// Never start automatically.
    #[default]
    No,
    /// Start once on daemon start, no takeover.
    Start,
    /// Full high-availability orchestration.
    Ha,
}

/// Observed status of one resource of an instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceStatus {
    pub status: Avail,
    /// Restart budget for this resource.
    #[serde(default)]
    pub restart: u32,
    /// Whether a failure of this resource triggers monitor action.
    #[serde(default)]
    pub monitor: bool,
    #[serde(default)]
    pub optional: bool,
}

/// Observed status of one instance, as refreshed by the local node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceStatus {
    #[serde(default)]
    pub avail: Avail,
    #[serde(default)]
    pub overall: Avail,
    /// Unix timestamp since which the instance is frozen, 0 when thawed.
    #[serde(default)]
    pub frozen: f64,
    #[serde(default)]
    pub provisioned: Provisioned,
    #[serde(default)]
    pub topology: Topology,
    #[serde(default)]
    pub orchestrate: Orchestrate,
    /// False when placement constraints exclude this node.
    #[serde(default = "default_true")]
    pub constraints: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub slaves: Vec<ObjectPath>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<ObjectPath>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ObjectPath>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resources: BTreeMap<String, ResourceStatus>,
    #[serde(default)]
    pub updated: f64,
    /// Kept from a previous view while the publisher is booting.
    #[serde(default, skip_serializing_if = "is_false")]
    pub preserved: bool,
}

impl Default for InstanceStatus {
    fn default() -> Self {
        Self {
            avail: Avail::default(),
            overall: Avail::default(),
            frozen: 0.0,
            provisioned: Provisioned::default(),
            topology: Topology::default(),
            orchestrate: Orchestrate::default(),
            constraints: true,
            scale: None,
            slaves: Vec::new(),
            parents: Vec::new(),
            children: Vec::new(),
            resources: BTreeMap::new(),
            updated: 0.0,
            preserved: false,
        }
    }
}

impl InstanceStatus {
    pub fn is_frozen(&self) -> bool {
        self.frozen > 0.0
    }
}

fn default_true() -> bool {
    true
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Identity of the configuration an instance runs with.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InstanceConfig {
    pub csum: String,
    #[serde(default)]
    pub updated: f64,
    /// Nodes the object is configured on.
    #[serde(default)]
    pub scope: Vec<NodeName>,
}

// ── Locks ─────────────────────────────────────────────────────────

/// A named cluster-wide advisory lock request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lock {
    pub requester: NodeName,
    pub id: String,
    pub requested_at: f64,
}

// ── Tree paths ────────────────────────────────────────────────────

pub fn smon_path(path: &str) -> [&str; 3] {
    ["monitor", "services", path]
}

pub fn instance_status_path(path: &str) -> [&str; 3] {
    ["services", "status", path]
}

pub fn instance_config_path(path: &str) -> [&str; 3] {
    ["services", "config", path]
}

pub fn lock_path(name: &str) -> [&str; 2] {
    ["locks", name]
}

/// Current Unix time in fractional seconds.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn global_expect_string_forms() {
        let cases = [
            ("started", GlobalExpect::Started),
            ("unprovisioned", GlobalExpect::Unprovisioned),
            (
                "placed@n2,n1",
                GlobalExpect::PlacedAt(vec!["n2".into(), "n1".into()]),
            ),
        ];
        for (s, expect) in cases {
            assert_eq!(s.parse::<GlobalExpect>().unwrap(), expect);
            assert_eq!(expect.to_string(), s);
        }
        assert!("placed@".parse::<GlobalExpect>().is_err());
        assert!("bogus".parse::<GlobalExpect>().is_err());
    }

    #[test]
    fn smon_serializes_with_string_statuses() {
        let smon = InstanceMonitor {
            status: MonitorStatus::StartFailed,
            global_expect: Some(GlobalExpect::Placed),
            ..Default::default()
        };
        let v = serde_json::to_value(&smon).unwrap();
        assert_eq!(v["status"], json!("start failed"));
        assert_eq!(v["global_expect"], json!("placed"));
        assert_eq!(v["local_expect"], json!("unset"));
    }

    #[test]
    fn node_state_tolerates_missing_sections() {
        let state: NodeState = serde_json::from_value(json!({
            "monitor": {"status": "rejoin"},
            "services": {"status": {"ns/svc/a": {"avail": "up"}}}
        }))
        .unwrap();
        assert_eq!(state.monitor.status, NodeMonitorStatus::Rejoin);
        let inst = state.instance("ns/svc/a").unwrap();
        assert_eq!(inst.avail, Avail::Up);
        assert!(inst.constraints);
        assert!(!state.is_frozen());
    }

    #[test]
    fn status_classes() {
        assert!(MonitorStatus::Starting.is_transitional());
        assert!(!MonitorStatus::Ready.is_transitional());
        assert!(MonitorStatus::StartFailed.is_failed());
        assert!(MonitorStatus::WaitLeader.is_waiting());
    }

    #[test]
    fn overload_thresholds() {
        let mut stats = NodeStats::default();
        assert!(!stats.is_overloaded());
        stats.mem_avail = 1.0;
        assert!(stats.is_overloaded());
    }
}
