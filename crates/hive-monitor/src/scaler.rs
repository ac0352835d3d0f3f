//! Scaler objects: converge numbered slave objects on a target capacity.
//!
//! A scaler `ns/kind/name` with `scale = N` and `slave_size = S` owns the
//! slaves `ns/kind/0.name`, `ns/kind/1.name`, … each a flex object of at
//! most `S` instances, `ceil(N / S)` of them. The scaler leader plans the
//! difference and hands it to a background job; the job creates or resizes
//! slaves under a shared throttle and waits until every beating peer in
//! scope publishes the same slave config checksum before reporting the
//! slave ready. The engine then promotes ready slaves and deletes the
//! surplus through global expects.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use hive_state::{ClusterState, NodeName, ObjectPath, Topology};

use crate::collaborators::ConfigProvider;
use crate::error::{MonitorError, MonitorResult};

const CONSENSUS_POLL: Duration = Duration::from_millis(250);

/// Path of slave `index` of `scaler`.
pub fn slave_path(scaler: &str, index: u32) -> ObjectPath {
    match scaler.rsplit_once('/') {
        Some((prefix, name)) => format!("{prefix}/{index}.{name}"),
        None => format!("{index}.{scaler}"),
    }
}

/// Index of `path` if it is a slave of `scaler`.
pub fn slave_index(scaler: &str, path: &str) -> Option<u32> {
    let (prefix, name) = match scaler.rsplit_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, scaler),
    };
    let rest = match prefix {
        Some(prefix) => path.strip_prefix(prefix)?.strip_prefix('/')?,
        None => path,
    };
    let (index, slave_name) = rest.split_once('.')?;
    if slave_name != name {
        return None;
    }
    index.parse().ok()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScalerPlan {
    pub create: Vec<(ObjectPath, u32)>,
    pub resize: Vec<(ObjectPath, u32)>,
    pub delete: Vec<ObjectPath>,
}

impl ScalerPlan {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.resize.is_empty() && self.delete.is_empty()
    }
}

/// Difference between the `existing` slaves (path → width) and the slaves
/// needed for `target` instances.
pub fn plan(scaler: &str, target: u32, slave_size: u32, existing: &BTreeMap<ObjectPath, u32>) -> ScalerPlan {
    let size = slave_size.max(1);
    let count = target.div_ceil(size);
    let mut plan = ScalerPlan::default();
    for index in 0..count {
        let width = if index + 1 == count { target - size * index } else { size };
        let path = slave_path(scaler, index);
        match existing.get(&path) {
            None => plan.create.push((path, width)),
            Some(current) if *current != width => plan.resize.push((path, width)),
            Some(_) => {}
        }
    }
    plan.delete = existing
        .keys()
        .filter(|p| slave_index(scaler, p).is_some_and(|i| i >= count))
        .cloned()
        .collect();
    plan
}

/// Configured slaves of `scaler` and their width.
pub fn existing_slaves(objects: &dyn ConfigProvider, scaler: &str) -> BTreeMap<ObjectPath, u32> {
    objects
        .objects()
        .into_iter()
        .filter(|p| slave_index(scaler, p).is_some())
        .filter_map(|p| {
            let cfg = objects.object(&p)?;
            let width = match cfg.topology {
                Topology::Flex => cfg.flex_target(),
                _ => 1,
            };
            Some((p, width))
        })
        .collect()
}

/// Result of one scaler job, reported to the engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScalerOutcome {
    pub scaler: ObjectPath,
    /// Slaves whose config reached every peer in scope.
    pub ready: Vec<ObjectPath>,
    pub failed: Vec<(ObjectPath, String)>,
    /// Surplus slaves to delete.
    pub delete: Vec<ObjectPath>,
}

pub struct ScalerJob {
    pub scaler: ObjectPath,
    pub plan: ScalerPlan,
    pub objects: Arc<dyn ConfigProvider>,
    pub cluster: Arc<ClusterState>,
    pub throttle: Arc<Semaphore>,
    pub consensus_timeout: Duration,
}

impl ScalerJob {
    /// Run the job and report its outcome.
    pub async fn run(self, report: mpsc::Sender<ScalerOutcome>) {
        let scaler = self.scaler.clone();
        let outcome = self.execute().await;
        info!(
            path = %scaler,
            ready = outcome.ready.len(),
            failed = outcome.failed.len(),
            delete = outcome.delete.len(),
            "scaler job done"
        );
        if report.send(outcome).await.is_err() {
            debug!(path = %scaler, "engine gone, scaler outcome dropped");
        }
    }

    async fn execute(self) -> ScalerOutcome {
        let mut outcome = ScalerOutcome {
            scaler: self.scaler.clone(),
            delete: self.plan.delete.clone(),
            ..Default::default()
        };
        let mut jobs = JoinSet::new();
        for (slave, width) in self.plan.create.iter().chain(self.plan.resize.iter()) {
            let slave = slave.clone();
            let width = *width;
            let scaler = self.scaler.clone();
            let objects = self.objects.clone();
            let cluster = self.cluster.clone();
            let throttle = self.throttle.clone();
            let timeout = self.consensus_timeout;
            jobs.spawn(async move {
                let result = match throttle.acquire_owned().await {
                    Ok(_permit) => provision_slave(&*objects, &cluster, &scaler, &slave, width, timeout).await,
                    Err(_) => Err(MonitorError::Config("scaler throttle closed".into())),
                };
                (slave, result)
            });
        }
        while let Some(joined) = jobs.join_next().await {
            match joined {
                Ok((slave, Ok(()))) => outcome.ready.push(slave),
                Ok((slave, Err(e))) => {
                    warn!(path = %slave, error = %e, "slave not ready");
                    outcome.failed.push((slave, e.to_string()));
                }
                Err(e) => warn!(path = %self.scaler, error = %e, "slave task panicked"),
            }
        }
        outcome.ready.sort();
        outcome
    }
}

async fn provision_slave(
    objects: &dyn ConfigProvider,
    cluster: &ClusterState,
    scaler: &str,
    slave: &str,
    width: u32,
    timeout: Duration,
) -> MonitorResult<()> {
    objects.create_slave(scaler, slave, width)?;
    let config = objects
        .object(slave)
        .ok_or_else(|| MonitorError::ObjectNotFound(slave.to_string()))?;
    debug!(path = %slave, width, "slave config written");
    wait_consensus(cluster, slave, &config.csum(), &config.nodes, timeout).await
}

/// Wait until every beating peer of `scope` publishes `csum` for `path`.
pub async fn wait_consensus(
    cluster: &ClusterState,
    path: &str,
    csum: &str,
    scope: &[NodeName],
    timeout: Duration,
) -> MonitorResult<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let lagging: Vec<NodeName> = cluster
            .beating_peers()
            .into_iter()
            .filter(|peer| scope.contains(peer))
            .filter(|peer| {
                !cluster
                    .node_state(peer)
                    .and_then(|s| s.services.config.get(path).map(|c| c.csum == csum))
                    .unwrap_or(false)
            })
            .collect();
        if lagging.is_empty() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(MonitorError::Config(format!(
                "no config consensus on {path}: {} lagging",
                lagging.join(",")
            )));
        }
        tokio::time::sleep(CONSENSUS_POLL).await;
    }
}
