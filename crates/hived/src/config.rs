//! hived.toml configuration.
//!
//! ```toml
//! [node]
//! name = "n1"
//! cluster_name = "prod"
//! nodes = ["n1", "n2"]
//!
//! [monitor]
//! interval = "5s"
//! command = ["/usr/libexec/hive/hive-action"]
//!
//! [[heartbeat]]
//! name = "hb#1"
//! type = "unicast"
//! nodes = { n2 = "10.0.0.2:10000" }
//!
//! [[object]]
//! path = "ns/svc/web"
//! nodes = ["n1", "n2"]
//! orchestrate = "ha"
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use hive_heartbeat::{DiskConfig, LinkConfig, MulticastConfig, RelayConfig, TransportConfig, UnicastConfig};
use hive_monitor::{MonitorConfig, ObjectConfig};
use hive_state::NodeName;

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    pub node: NodeSection,
    #[serde(default)]
    pub monitor: MonitorSection,
    #[serde(default)]
    pub heartbeat: Vec<HeartbeatSection>,
    #[serde(default)]
    pub object: Vec<ObjectConfig>,
    /// Checksum of the file this was read from.
    #[serde(skip)]
    pub csum: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeSection {
    pub name: NodeName,
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,
    #[serde(default)]
    pub cluster_id: String,
    /// Cluster members. Defaults to this node alone.
    #[serde(default)]
    pub nodes: Vec<NodeName>,
    #[serde(default = "default_compat")]
    pub compat: u32,
    #[serde(default = "default_var_dir")]
    pub var_dir: PathBuf,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MonitorSection {
    pub interval: Option<String>,
    pub ready_period: Option<String>,
    pub rejoin_grace: Option<String>,
    pub shutdown_timeout: Option<String>,
    pub consensus_timeout: Option<String>,
    pub max_parallel: Option<usize>,
    pub default_restart: Option<u32>,
    pub scaler_throttle: Option<usize>,
    /// Action command and its leading arguments.
    #[serde(default = "default_command")]
    pub command: Vec<String>,
    pub action_timeout: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatSection {
    pub name: String,
    pub interval: Option<String>,
    pub timeout: Option<String>,
    #[serde(flatten)]
    pub transport: TransportSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportSection {
    Multicast {
        addr: Option<Ipv4Addr>,
        port: Option<u16>,
        intf: Option<Ipv4Addr>,
    },
    Unicast {
        addr: Option<IpAddr>,
        port: Option<u16>,
        #[serde(default)]
        nodes: BTreeMap<NodeName, String>,
    },
    Disk {
        dev: PathBuf,
    },
    Relay {
        relay: String,
    },
}

fn default_cluster_name() -> String {
    "default".into()
}

fn default_compat() -> u32 {
    1
}

fn default_var_dir() -> PathBuf {
    PathBuf::from("/var/lib/hive")
}

fn default_command() -> Vec<String> {
    vec!["/usr/libexec/hive/hive-action".into()]
}

const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(300);

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("load {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let mut config: DaemonConfig = toml::from_str(content)?;
        config.csum = hex::encode(Sha256::digest(content.as_bytes()));
        if config.node.nodes.is_empty() {
            config.node.nodes = vec![config.node.name.clone()];
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.node.name.is_empty() {
            bail!("node.name is empty");
        }
        if !self.node.nodes.contains(&self.node.name) {
            bail!("node {} is not in node.nodes", self.node.name);
        }
        if self.monitor.command.is_empty() {
            bail!("monitor.command is empty");
        }
        let mut links = BTreeSet::new();
        for link in &self.heartbeat {
            if !links.insert(link.name.as_str()) {
                bail!("duplicate heartbeat {}", link.name);
            }
        }
        let mut paths = BTreeSet::new();
        for object in &self.object {
            if object.path.split('/').count() != 3 {
                bail!("object path {} is not namespace/kind/name", object.path);
            }
            if !paths.insert(object.path.as_str()) {
                bail!("duplicate object {}", object.path);
            }
            if let Some(node) = object.nodes.iter().find(|n| !self.node.nodes.contains(n)) {
                bail!("object {} runs on {node}, which is not a cluster node", object.path);
            }
        }
        self.monitor_config()?;
        self.links()?;
        Ok(())
    }

    pub fn monitor_config(&self) -> anyhow::Result<MonitorConfig> {
        let m = &self.monitor;
        let mut config = MonitorConfig::default();
        config.interval = duration("monitor.interval", &m.interval, config.interval)?;
        config.ready_period = duration("monitor.ready_period", &m.ready_period, config.ready_period)?;
        config.rejoin_grace = duration("monitor.rejoin_grace", &m.rejoin_grace, config.rejoin_grace)?;
        config.shutdown_timeout = duration("monitor.shutdown_timeout", &m.shutdown_timeout, config.shutdown_timeout)?;
        config.consensus_timeout =
            duration("monitor.consensus_timeout", &m.consensus_timeout, config.consensus_timeout)?;
        if let Some(max) = m.max_parallel {
            config = config.with_max_parallel(max);
        }
        if let Some(restart) = m.default_restart {
            config.default_restart = restart;
        }
        if let Some(throttle) = m.scaler_throttle {
            config.scaler_throttle = throttle.max(1);
        }
        Ok(config)
    }

    pub fn action_timeout(&self) -> anyhow::Result<Duration> {
        duration("monitor.action_timeout", &self.monitor.action_timeout, DEFAULT_ACTION_TIMEOUT)
    }

    /// Link configurations, validated.
    pub fn links(&self) -> anyhow::Result<Vec<LinkConfig>> {
        self.heartbeat
            .iter()
            .map(|section| {
                let link = section.to_link()?;
                link.validate()?;
                Ok(link)
            })
            .collect()
    }
}

impl HeartbeatSection {
    fn to_link(&self) -> anyhow::Result<LinkConfig> {
        let transport = match &self.transport {
            TransportSection::Multicast { addr, port, intf } => {
                let defaults = MulticastConfig::default();
                TransportConfig::Multicast(MulticastConfig {
                    addr: addr.unwrap_or(defaults.addr),
                    port: port.unwrap_or(defaults.port),
                    intf: *intf,
                })
            }
            TransportSection::Unicast { addr, port, nodes } => {
                let defaults = UnicastConfig::default();
                TransportConfig::Unicast(UnicastConfig {
                    addr: addr.unwrap_or(defaults.addr),
                    port: port.unwrap_or(defaults.port),
                    nodes: nodes.clone(),
                })
            }
            TransportSection::Disk { dev } => TransportConfig::Disk(DiskConfig { dev: dev.clone() }),
            TransportSection::Relay { relay } => TransportConfig::Relay(RelayConfig {
                relay: relay.clone(),
            }),
        };
        let link = LinkConfig::new(self.name.clone(), transport);
        let interval = duration(&format!("{}.interval", self.name), &self.interval, link.interval)?;
        let timeout = duration(&format!("{}.timeout", self.name), &self.timeout, link.timeout)?;
        Ok(link.with_interval(interval).with_timeout(timeout))
    }
}

fn duration(field: &str, value: &Option<String>, default: Duration) -> anyhow::Result<Duration> {
    match value {
        None => Ok(default),
        Some(s) => parse_duration(s).with_context(|| format!("{field}: invalid duration {s:?}")),
    }
}

/// Parse a duration string like "5s", "500ms", "2m". A bare number is
/// seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.parse::<u64>().ok().map(|h| Duration::from_secs(h * 3600))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
