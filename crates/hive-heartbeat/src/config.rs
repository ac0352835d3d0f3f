//! Link configuration.
//!
//! Links receive their configuration through a `watch` channel and re-read
//! it at the top of every iteration, so a reload reaches running links
//! without restarting them.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use hive_state::NodeName;

use crate::error::{HeartbeatError, HeartbeatResult};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(224, 3, 29, 71);
pub const DEFAULT_PORT: u16 = 10000;

/// One configured heartbeat link. tx and rx of a link share it.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkConfig {
    pub name: String,
    pub interval: Duration,
    /// A peer silent for longer than this is no longer beating.
    pub timeout: Duration,
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportConfig {
    Multicast(MulticastConfig),
    Unicast(UnicastConfig),
    Disk(DiskConfig),
    Relay(RelayConfig),
}

impl TransportConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            TransportConfig::Multicast(_) => "multicast",
            TransportConfig::Unicast(_) => "unicast",
            TransportConfig::Disk(_) => "disk",
            TransportConfig::Relay(_) => "relay",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MulticastConfig {
    pub addr: Ipv4Addr,
    pub port: u16,
    /// Interface address to join the group on.
    pub intf: Option<Ipv4Addr>,
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_MULTICAST_ADDR,
            port: DEFAULT_PORT,
            intf: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnicastConfig {
    /// Listen address.
    pub addr: IpAddr,
    pub port: u16,
    /// Peer name → `host:port`. Peers missing here are reached at
    /// `<name>:<port>`.
    pub nodes: BTreeMap<NodeName, String>,
}

impl Default for UnicastConfig {
    fn default() -> Self {
        Self {
            addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            nodes: BTreeMap::new(),
        }
    }
}

impl UnicastConfig {
    pub fn peer_addr(&self, peer: &str) -> String {
        self.nodes
            .get(peer)
            .cloned()
            .unwrap_or_else(|| format!("{peer}:{}", self.port))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiskConfig {
    /// Shared block device, or a plain file for tests.
    pub dev: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    /// Relay service `host:port`.
    pub relay: String,
}

impl LinkConfig {
    pub fn new(name: impl Into<String>, transport: TransportConfig) -> Self {
        Self {
            name: name.into(),
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            transport,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Reject configurations no transport could run with.
    pub fn validate(&self) -> HeartbeatResult<()> {
        if self.name.is_empty() {
            return Err(HeartbeatError::Config("link name is empty".into()));
        }
        if self.interval.is_zero() {
            return Err(HeartbeatError::Config(format!("{}: interval is zero", self.name)));
        }
        if self.timeout <= self.interval {
            return Err(HeartbeatError::Config(format!(
                "{}: timeout {:?} must exceed interval {:?}",
                self.name, self.timeout, self.interval
            )));
        }
        match &self.transport {
            TransportConfig::Multicast(m) if !m.addr.is_multicast() => Err(HeartbeatError::Config(
                format!("{}: {} is not a multicast address", self.name, m.addr),
            )),
            TransportConfig::Disk(d) if d.dev.as_os_str().is_empty() => {
                Err(HeartbeatError::Config(format!("{}: dev is not set", self.name)))
            }
            TransportConfig::Relay(r) if r.relay.is_empty() => {
                Err(HeartbeatError::Config(format!("{}: relay is not set", self.name)))
            }
            _ => Ok(()),
        }
    }

    /// How long one receive may block before the loop checks for shutdown.
    pub fn receive_budget(&self) -> Duration {
        self.timeout.clamp(Duration::from_secs(1), Duration::from_secs(5))
    }
}
