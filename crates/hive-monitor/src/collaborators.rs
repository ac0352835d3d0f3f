//! Boundaries to the rest of the agent.
//!
//! The engine decides; these collaborators act. Resource drivers sit behind
//! [`ActionRunner`], freeze flags behind [`Freezer`], object definitions
//! behind [`ConfigProvider`] and the local instance status refresh behind
//! [`StatusProvider`].

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use hive_state::{InstanceStatus, MonitorStatus, NodeName, ObjectPath};

use crate::config::ObjectConfig;
use crate::error::MonitorResult;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A local action on one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Start,
    Stop { force: bool },
    /// Restart the listed resources.
    Restart { resources: Vec<String> },
    Freeze,
    Thaw { slaves: bool },
    Provision { leader: bool },
    Unprovision { leader: bool },
    Delete,
    /// Unprovision then delete.
    Purge,
    Shutdown,
    /// Fence `node` before taking over its instance.
    Stonith { node: NodeName },
}

impl Action {
    /// Status published while the action runs.
    pub fn transitional_status(&self) -> MonitorStatus {
        match self {
            Action::Start => MonitorStatus::Starting,
            Action::Stop { .. } => MonitorStatus::Stopping,
            Action::Restart { .. } => MonitorStatus::Restarting,
            Action::Freeze => MonitorStatus::Freezing,
            Action::Thaw { .. } => MonitorStatus::Thawing,
            Action::Provision { .. } => MonitorStatus::Provisioning,
            Action::Unprovision { .. } => MonitorStatus::Unprovisioning,
            Action::Delete => MonitorStatus::Deleting,
            Action::Purge => MonitorStatus::Purging,
            Action::Shutdown => MonitorStatus::Shutting,
            Action::Stonith { .. } => MonitorStatus::Tocing,
        }
    }

    /// Status published when the action fails.
    pub fn failed_status(&self) -> MonitorStatus {
        match self {
            Action::Start => MonitorStatus::StartFailed,
            Action::Stop { .. } => MonitorStatus::StopFailed,
            Action::Restart { .. } => MonitorStatus::RestartFailed,
            Action::Freeze => MonitorStatus::FreezeFailed,
            Action::Thaw { .. } => MonitorStatus::ThawFailed,
            Action::Provision { .. } => MonitorStatus::ProvisionFailed,
            Action::Unprovision { .. } => MonitorStatus::UnprovisionFailed,
            Action::Delete => MonitorStatus::DeleteFailed,
            Action::Purge => MonitorStatus::PurgeFailed,
            Action::Shutdown => MonitorStatus::ShutdownFailed,
            Action::Stonith { .. } => MonitorStatus::TocFailed,
        }
    }

    /// Command word, as passed to external drivers.
    pub fn name(&self) -> &'static str {
        match self {
            Action::Start => "start",
            Action::Stop { .. } => "stop",
            Action::Restart { .. } => "restart",
            Action::Freeze => "freeze",
            Action::Thaw { .. } => "thaw",
            Action::Provision { .. } => "provision",
            Action::Unprovision { .. } => "unprovision",
            Action::Delete => "delete",
            Action::Purge => "purge",
            Action::Shutdown => "shutdown",
            Action::Stonith { .. } => "stonith",
        }
    }

    /// Extra command-line flags for external drivers.
    pub fn flags(&self) -> Vec<String> {
        match self {
            Action::Stop { force: true } => vec!["--force".into()],
            Action::Restart { resources } if !resources.is_empty() => {
                vec!["--rid".into(), resources.join(",")]
            }
            Action::Thaw { slaves: true } => vec!["--slaves".into()],
            Action::Provision { leader: true } | Action::Unprovision { leader: true } => {
                vec!["--leader".into()]
            }
            Action::Stonith { node } => vec!["--node".into(), node.clone()],
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())?;
        for flag in self.flags() {
            write!(f, " {flag}")?;
        }
        Ok(())
    }
}

/// Launches local actions. The returned future resolves when the action
/// finished; an `Err` becomes the action's failed status.
pub trait ActionRunner: Send + Sync {
    fn run(&self, path: &str, action: Action) -> BoxFuture<MonitorResult<()>>;
}

/// Per-node and per-instance freeze flags.
pub trait Freezer: Send + Sync {
    fn is_frozen(&self, path: &str) -> bool;
    fn freeze(&self, path: &str) -> MonitorResult<()>;
    fn thaw(&self, path: &str) -> MonitorResult<()>;

    fn node_frozen(&self) -> bool;
    fn freeze_node(&self) -> MonitorResult<()>;
    fn thaw_node(&self) -> MonitorResult<()>;
}

/// Object definitions visible to this node.
pub trait ConfigProvider: Send + Sync {
    /// Every configured object, sorted.
    fn objects(&self) -> Vec<ObjectPath>;

    fn object(&self, path: &str) -> Option<ObjectConfig>;

    /// Create or resize a scaler slave of `width` instances.
    fn create_slave(&self, scaler: &str, slave: &str, width: u32) -> MonitorResult<()>;
}

/// Refreshes the observed status of a local instance.
pub trait StatusProvider: Send + Sync {
    fn instance_status(&self, path: &str) -> BoxFuture<MonitorResult<InstanceStatus>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_pair_up() {
        let actions = [
            Action::Start,
            Action::Stop { force: false },
            Action::Provision { leader: true },
            Action::Purge,
            Action::Shutdown,
        ];
        for action in actions {
            assert!(action.transitional_status().is_transitional(), "{action}");
            assert!(action.failed_status().is_failed(), "{action}");
        }
    }

    #[test]
    fn display_carries_flags() {
        assert_eq!(Action::Stop { force: true }.to_string(), "stop --force");
        assert_eq!(
            Action::Restart {
                resources: vec!["app#1".into(), "fs#2".into()]
            }
            .to_string(),
            "restart --rid app#1,fs#2"
        );
        assert_eq!(Action::Start.to_string(), "start");
    }
}
