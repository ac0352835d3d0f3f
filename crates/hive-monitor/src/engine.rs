//! Monitor — the orchestration loop.
//!
//! One pass refreshes the local records, then takes one decision per
//! object. Actions run in the background; their completion is reported
//! back over a channel and folded into the instance monitor on the next
//! pass.
//!
//! ```text
//! loop
//!   ├── fold action reports and scaler outcomes
//!   ├── node: frozen flag, node global expect
//!   ├── instances: refresh status, publish config checksums
//!   ├── gate: init → rejoin → idle, peers' datasets installed
//!   ├── per object
//!   │     adopt newer peer global expect
//!   │     drop a satisfied global expect
//!   │     abort on a terminal failure
//!   │     restart budget
//!   │     manual handler | auto policy | scaler
//!   ├── commit the local dataset, wake the heartbeat tx
//!   └── sleep until interval, merge wake, report or deadline
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore, mpsc, watch};
use tracing::{debug, info, warn};

use hive_state::{
    ClusterState, GlobalExpect, InstanceConfig, InstanceMonitor, InstanceStatus, LocalExpect, MonitorStatus,
    NodeGlobalExpect, NodeMonitorStatus, NodeName, NodeState, ObjectPath, Topology, instance_config_path,
    instance_status_path, smon_path, unix_now,
};

use crate::auto::{self, AutoContext, ObjectMemory, RestartPlan};
use crate::collaborators::{Action, ActionRunner, ConfigProvider, Freezer, StatusProvider};
use crate::config::{MonitorConfig, ObjectConfig};
use crate::error::MonitorResult;
use crate::manual;
use crate::require;
use crate::scaler::{self, ScalerJob, ScalerOutcome};
use crate::step::{Decision, Defer, Step};
use crate::view::{ObjectView, aggregate_path};

const REPORT_CAPACITY: usize = 256;

/// Completion of a background action.
#[derive(Debug, Clone)]
pub struct ActionReport {
    pub path: ObjectPath,
    pub action: Action,
    pub result: Result<(), String>,
}

/// Called after every local commit that produced a new generation.
pub type CommitHook = Arc<dyn Fn() + Send + Sync>;

/// Cheap handle to a running monitor.
#[derive(Clone)]
pub struct MonitorHandle {
    deferrals: Arc<Mutex<BTreeMap<ObjectPath, String>>>,
    wake: Arc<Notify>,
    drain: Arc<Notify>,
}

impl MonitorHandle {
    /// Last deferral reason per object.
    pub fn deferrals(&self) -> BTreeMap<ObjectPath, String> {
        self.deferrals.lock().clone()
    }

    /// Run a pass now.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Stop every local instance and stop orchestrating, without exiting.
    pub fn drain(&self) {
        self.drain.notify_one();
    }
}

pub struct Monitor {
    cluster: Arc<ClusterState>,
    config: MonitorConfig,
    runner: Arc<dyn ActionRunner>,
    freezer: Arc<dyn Freezer>,
    objects: Arc<dyn ConfigProvider>,
    status: Arc<dyn StatusProvider>,
    wake: Arc<Notify>,
    drain: Arc<Notify>,
    on_commit: Option<CommitHook>,
    reports_tx: mpsc::Sender<ActionReport>,
    reports_rx: mpsc::Receiver<ActionReport>,
    scaler_tx: mpsc::Sender<ScalerOutcome>,
    scaler_rx: mpsc::Receiver<ScalerOutcome>,
    throttle: Arc<Semaphore>,
    in_flight: HashMap<ObjectPath, Action>,
    scaling: HashSet<ObjectPath>,
    memory: HashMap<ObjectPath, ObjectMemory>,
    deferrals: Arc<Mutex<BTreeMap<ObjectPath, String>>>,
    pass_deferral: Option<String>,
    started_at: Instant,
    sooner: Option<Instant>,
}

impl Monitor {
    pub fn new(
        cluster: Arc<ClusterState>,
        runner: Arc<dyn ActionRunner>,
        freezer: Arc<dyn Freezer>,
        objects: Arc<dyn ConfigProvider>,
        status: Arc<dyn StatusProvider>,
    ) -> Self {
        let config = MonitorConfig::default();
        let (reports_tx, reports_rx) = mpsc::channel(REPORT_CAPACITY);
        let (scaler_tx, scaler_rx) = mpsc::channel(REPORT_CAPACITY);
        Self {
            cluster,
            throttle: Arc::new(Semaphore::new(config.scaler_throttle.max(1))),
            config,
            runner,
            freezer,
            objects,
            status,
            wake: Arc::new(Notify::new()),
            drain: Arc::new(Notify::new()),
            on_commit: None,
            reports_tx,
            reports_rx,
            scaler_tx,
            scaler_rx,
            in_flight: HashMap::new(),
            scaling: HashSet::new(),
            memory: HashMap::new(),
            deferrals: Arc::new(Mutex::new(BTreeMap::new())),
            pass_deferral: None,
            started_at: Instant::now(),
            sooner: None,
        }
    }

    pub fn with_config(mut self, config: MonitorConfig) -> Self {
        self.throttle = Arc::new(Semaphore::new(config.scaler_throttle.max(1)));
        self.config = config;
        self
    }

    /// Share the signal raised by the state merger on peer changes.
    pub fn with_wake(mut self, wake: Arc<Notify>) -> Self {
        self.wake = wake;
        self
    }

    pub fn with_commit_hook(mut self, hook: CommitHook) -> Self {
        self.on_commit = Some(hook);
        self
    }

    pub fn handle(&self) -> MonitorHandle {
        MonitorHandle {
            deferrals: self.deferrals.clone(),
            wake: self.wake.clone(),
            drain: self.drain.clone(),
        }
    }

    /// Number of actions currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Run until `shutdown` flips, then shut local instances down.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.config.interval, max_parallel = self.config.max_parallel, "monitor started");
        loop {
            if let Err(e) = self.run_pass().await {
                warn!(error = %e, "monitor pass failed");
            }
            let pause = self.next_pause();
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = self.wake.notified() => {}
                Some(report) = self.reports_rx.recv() => self.on_report(report),
                Some(outcome) = self.scaler_rx.recv() => self.on_scaler(outcome),
                _ = self.drain.notified() => {
                    self.stop_local(NodeMonitorStatus::Draining).await;
                }
                _ = shutdown.changed() => {
                    self.stop_local(NodeMonitorStatus::Shutting).await;
                    break;
                }
            }
        }
        info!("monitor stopped");
    }

    fn next_pause(&mut self) -> Duration {
        let interval = self.config.interval;
        match self.sooner.take() {
            Some(at) => at.saturating_duration_since(Instant::now()).min(interval),
            None => interval,
        }
    }

    fn run_sooner(&mut self, at: Instant) {
        self.sooner = Some(self.sooner.map_or(at, |s| s.min(at)));
    }

    /// One full pass. Public so tests can drive the engine step by step.
    pub async fn run_pass(&mut self) -> MonitorResult<()> {
        self.collect_reports();
        self.refresh_node()?;
        let configs = self.refresh_instances().await?;
        if self.gate()? {
            self.orchestrate(&configs)?;
        }
        self.commit();
        Ok(())
    }

    fn collect_reports(&mut self) {
        while let Ok(report) = self.reports_rx.try_recv() {
            self.on_report(report);
        }
        while let Ok(outcome) = self.scaler_rx.try_recv() {
            self.on_scaler(outcome);
        }
    }

    fn commit(&self) {
        if self.cluster.commit_local().is_some() {
            if let Some(hook) = &self.on_commit {
                hook();
            }
        }
    }

    // ── Local records ──────────────────────────────────────────────

    fn read_smon(&self, path: &str) -> InstanceMonitor {
        self.cluster
            .local_tree()
            .get_as::<InstanceMonitor, _>(&smon_path(path))
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    fn write_smon(&self, path: &str, smon: &InstanceMonitor) -> MonitorResult<()> {
        let current = self
            .cluster
            .local_tree()
            .get_as::<InstanceMonitor, _>(&smon_path(path))
            .ok()
            .flatten();
        if current.as_ref() != Some(smon) {
            self.cluster.local_tree().set_as(&smon_path(path), smon)?;
        }
        Ok(())
    }

    fn nmon_status(&self) -> NodeMonitorStatus {
        self.cluster
            .local_tree()
            .get_as::<NodeMonitorStatus, _>(&["monitor", "status"])
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    fn set_nmon_status(&self, status: NodeMonitorStatus) -> MonitorResult<()> {
        let tree = self.cluster.local_tree();
        if tree.get(&["monitor", "status"]).is_some() && self.nmon_status() == status {
            return Ok(());
        }
        info!(?status, "node monitor status");
        tree.set_as(&["monitor", "status"], &status)?;
        tree.set_as(&["monitor", "status_updated"], &unix_now())?;
        Ok(())
    }

    fn set_instance_frozen(&self, path: &str, frozen: bool) -> MonitorResult<()> {
        let tree = self.cluster.local_tree();
        let key = instance_status_path(path);
        if let Some(mut status) = tree.get_as::<InstanceStatus, _>(&key)? {
            status.frozen = if frozen { unix_now() } else { 0.0 };
            tree.set_as(&key, &status)?;
        }
        Ok(())
    }

    // ── Node ───────────────────────────────────────────────────────

    fn refresh_node(&mut self) -> MonitorResult<()> {
        self.adopt_node_global_expect()?;
        let tree = self.cluster.local_tree();
        let expect = tree
            .get_as::<Option<NodeGlobalExpect>, _>(&["monitor", "global_expect"])?
            .flatten();
        match expect {
            Some(NodeGlobalExpect::Frozen) => {
                if !self.freezer.node_frozen() {
                    info!("freezing node");
                    self.freezer.freeze_node()?;
                }
                tree.set_as(&["monitor", "global_expect"], &None::<NodeGlobalExpect>)?;
            }
            Some(NodeGlobalExpect::Thawed) => {
                if self.freezer.node_frozen() {
                    info!("thawing node");
                    self.freezer.thaw_node()?;
                }
                tree.set_as(&["monitor", "global_expect"], &None::<NodeGlobalExpect>)?;
            }
            None => {}
        }
        self.publish_node_frozen()
    }

    fn publish_node_frozen(&self) -> MonitorResult<()> {
        let tree = self.cluster.local_tree();
        let published = tree.get_as::<f64, _>(&["frozen"])?.unwrap_or(0.0);
        let frozen = self.freezer.node_frozen();
        if frozen && published <= 0.0 {
            tree.set_as(&["frozen"], &unix_now())?;
        } else if !frozen && (published > 0.0 || tree.get(&["frozen"]).is_none()) {
            tree.set_as(&["frozen"], &0.0)?;
        }
        Ok(())
    }

    /// Copy a peer's node global expect when it is newer than ours.
    fn adopt_node_global_expect(&self) -> MonitorResult<()> {
        let tree = self.cluster.local_tree();
        let ours = tree.get_as::<f64, _>(&["monitor", "global_expect_updated"])?.unwrap_or(0.0);
        let newest = self
            .cluster
            .beating_peers()
            .into_iter()
            .filter_map(|peer| self.cluster.node_state(&peer).map(|s| (peer, s.monitor)))
            .filter(|(_, nmon)| nmon.global_expect.is_some())
            .max_by(|a, b| a.1.global_expect_updated.total_cmp(&b.1.global_expect_updated));
        if let Some((peer, nmon)) = newest {
            if nmon.global_expect_updated > ours {
                debug!(%peer, expect = ?nmon.global_expect, "adopting node global expect");
                tree.set_as(&["monitor", "global_expect"], &nmon.global_expect)?;
                tree.set_as(&["monitor", "global_expect_updated"], &nmon.global_expect_updated)?;
            }
        }
        Ok(())
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Refresh the local instance records of every configured object and
    /// drop the records of objects no longer configured.
    async fn refresh_instances(&mut self) -> MonitorResult<Vec<ObjectConfig>> {
        let local = self.cluster.local_name().to_string();
        let configs: Vec<ObjectConfig> = self
            .objects
            .objects()
            .into_iter()
            .filter_map(|path| self.objects.object(&path))
            .collect();
        let tree = self.cluster.local_tree();

        for cfg in &configs {
            let path = cfg.path.as_str();
            let csum = cfg.csum();
            let published = tree.get_as::<InstanceConfig, _>(&instance_config_path(path))?;
            if published.as_ref().is_none_or(|p| p.csum != csum || p.scope != cfg.nodes) {
                let record = InstanceConfig {
                    csum,
                    updated: unix_now(),
                    scope: cfg.nodes.clone(),
                };
                tree.set_as(&instance_config_path(path), &record)?;
            }
            if tree.get(&smon_path(path)).is_none() {
                tree.set_as(&smon_path(path), &InstanceMonitor::default())?;
            }
            if cfg.is_scaler() || !cfg.nodes.contains(&local) {
                tree.unset(&instance_status_path(path))?;
                continue;
            }
            match self.status.instance_status(path).await {
                Ok(status) => self.publish_instance(cfg, status)?,
                Err(e) => debug!(%path, error = %e, "instance status refresh failed"),
            }
        }

        let configured: BTreeSet<&str> = configs.iter().map(|c| c.path.as_str()).collect();
        let state = self.cluster.local_state()?;
        let stale: BTreeSet<ObjectPath> = state
            .services
            .status
            .keys()
            .chain(state.services.config.keys())
            .chain(state.monitor.services.keys())
            .filter(|p| !configured.contains(p.as_str()))
            .cloned()
            .collect();
        for path in stale {
            debug!(%path, "object gone, dropping its records");
            tree.unset(&instance_status_path(&path))?;
            tree.unset(&instance_config_path(&path))?;
            tree.unset(&smon_path(&path))?;
            self.memory.remove(&path);
            self.deferrals.lock().remove(&path);
        }
        Ok(configs)
    }

    /// Overlay the configured fields on a refreshed status and publish it
    /// when something other than its timestamp changed.
    fn publish_instance(&self, cfg: &ObjectConfig, mut status: InstanceStatus) -> MonitorResult<()> {
        let tree = self.cluster.local_tree();
        let key = instance_status_path(&cfg.path);
        let previous = tree.get_as::<InstanceStatus, _>(&key)?;

        status.topology = cfg.topology;
        status.orchestrate = cfg.orchestrate;
        status.parents = cfg.parents.clone();
        status.children = cfg.children.clone();
        status.scale = cfg.scale;
        status.preserved = false;
        let was_frozen = previous.as_ref().map_or(0.0, |p| p.frozen);
        status.frozen = match self.freezer.is_frozen(&cfg.path) {
            true if was_frozen > 0.0 => was_frozen,
            true => unix_now(),
            false => 0.0,
        };
        status.updated = previous.as_ref().map_or(0.0, |p| p.updated);
        if previous.as_ref() != Some(&status) {
            status.updated = unix_now();
            tree.set_as(&key, &status)?;
        }
        Ok(())
    }

    // ── Gate ───────────────────────────────────────────────────────

    /// Whether this pass may take decisions.
    fn gate(&mut self) -> MonitorResult<bool> {
        let reason = match self.nmon_status() {
            NodeMonitorStatus::Init => {
                self.set_nmon_status(NodeMonitorStatus::Rejoin)?;
                Some("node rejoining".to_string())
            }
            NodeMonitorStatus::Rejoin => self.rejoin()?,
            NodeMonitorStatus::Idle => None,
            other => Some(format!("node monitor {other:?}")),
        };
        let reason = reason.or_else(|| {
            let missing = self.cluster.peers_missing_dataset();
            (!missing.is_empty()).then(|| format!("no dataset yet from {}", missing.join(",")))
        });
        if self.pass_deferral != reason {
            if let Some(reason) = &reason {
                debug!(%reason, "pass deferred");
            }
            self.pass_deferral = reason.clone();
        }
        Ok(reason.is_none())
    }

    /// Leave rejoin once every peer is up and past init, or once the grace
    /// period expired, freezing the node so nothing is taken over blindly.
    fn rejoin(&mut self) -> MonitorResult<Option<String>> {
        let peers = self.cluster.peer_names();
        let waiting: Vec<NodeName> = peers
            .iter()
            .filter(|peer| {
                !self.cluster.is_beating(peer)
                    || self
                        .cluster
                        .node_state(peer)
                        .is_none_or(|s| s.monitor.status == NodeMonitorStatus::Init)
            })
            .cloned()
            .collect();
        if waiting.is_empty() {
            self.set_nmon_status(NodeMonitorStatus::Idle)?;
            return Ok(None);
        }
        if self.started_at.elapsed() >= self.config.rejoin_grace {
            warn!(waiting = %waiting.join(","), "rejoin grace period expired, freezing node");
            self.freezer.freeze_node()?;
            self.publish_node_frozen()?;
            self.set_nmon_status(NodeMonitorStatus::Idle)?;
            return Ok(None);
        }
        Ok(Some(format!("rejoin: waiting for {}", waiting.join(","))))
    }

    // ── Objects ────────────────────────────────────────────────────

    fn live_snapshot(&self) -> BTreeMap<NodeName, NodeState> {
        let beating = self.cluster.beating_peers();
        let local = self.cluster.local_name();
        self.cluster
            .snapshot()
            .into_iter()
            .filter(|(node, _)| node == local || beating.contains(node))
            .collect()
    }

    fn orchestrate(&mut self, configs: &[ObjectConfig]) -> MonitorResult<()> {
        let live = self.live_snapshot();
        let local = self.cluster.local_name().to_string();
        let now = Instant::now();
        for cfg in configs {
            if cfg.topology == Topology::Span && !cfg.is_scaler() {
                continue;
            }
            let related = cfg
                .parents
                .iter()
                .chain(cfg.children.iter())
                .map(|p| (p.clone(), aggregate_path(p, self.objects.object(p), &live)))
                .collect();
            let mut view = ObjectView::build(cfg.clone(), &local, &live, related);
            let outcome = self.step_object(&mut view, now);
            if let Err(defer) = &outcome {
                match defer.status {
                    Some(status) if !view.smon.status.is_transitional() => view.smon.set_status(status),
                    None if view.smon.status.is_waiting() => view.smon.set_status(MonitorStatus::Idle),
                    _ => {}
                }
            }
            if view.smon.status != MonitorStatus::Ready {
                if let Some(memory) = self.memory.get_mut(&view.path) {
                    memory.ready_since = None;
                }
            }
            self.write_smon(&view.path, &view.smon)?;
            self.record_deferral(&view.path, outcome.err());
        }
        Ok(())
    }

    fn record_deferral(&self, path: &str, defer: Option<Defer>) {
        let mut deferrals = self.deferrals.lock();
        match defer {
            Some(defer) => {
                if deferrals.get(path).map(String::as_str) != Some(&*defer.reason) {
                    debug!(%path, reason = %defer.reason, "deferred");
                    deferrals.insert(path.to_string(), defer.reason.into_owned());
                }
            }
            None => {
                deferrals.remove(path);
            }
        }
    }

    fn step_object(&mut self, view: &mut ObjectView, now: Instant) -> Step<()> {
        if let Some(action) = self.in_flight.get(&view.path) {
            return Err(Defer::new(format!("{} in progress", action.name())));
        }
        require!(!self.scaling.contains(&view.path), "scaling in progress");

        adopt_global_expect(view);
        if manual::set_smon_g_expect_from_status(view) {
            info!(path = %view.path, "global expect reached");
        }
        if let Some(expect) = view.smon.global_expect.clone() {
            if manual::should_abort(view.smon.status, &expect, view.is_leader()) {
                info!(path = %view.path, %expect, status = ?view.smon.status, "global expect aborted");
                view.smon.set_global_expect(None);
                return Ok(());
            }
        }

        if view.smon.global_expect.is_none() {
            if let Some(plan) = auto::restart_plan(view, self.config.default_restart) {
                return self.apply_restart(view, plan);
            }
        }

        let decision = match view.smon.global_expect.clone() {
            Some(GlobalExpect::Aborted) => Decision::ClearGlobalExpect,
            Some(_) if view.config.is_scaler() => Decision::Nothing,
            Some(expect) => manual::handle(view, &expect)?,
            None if view.config.is_scaler() => return self.scale(view),
            None => {
                let memory = self.memory.entry(view.path.clone()).or_default();
                if view.smon.status == MonitorStatus::Ready && memory.ready_since.is_none() {
                    memory.ready_since = Some(now);
                }
                let ctx = AutoContext {
                    memory,
                    now,
                    ready_period: self.config.ready_period,
                };
                auto::handle(view, &ctx)?
            }
        };
        self.apply(view, decision, now)
    }

    fn apply(&mut self, view: &mut ObjectView, decision: Decision, now: Instant) -> Step<()> {
        match decision {
            Decision::Nothing => {
                if view.smon.status.is_waiting() {
                    view.smon.set_status(MonitorStatus::Idle);
                }
            }
            Decision::SetStatus(status) => {
                if status == MonitorStatus::Ready && view.smon.status != MonitorStatus::Ready {
                    self.memory.entry(view.path.clone()).or_default().ready_since = Some(now);
                    self.run_sooner(now + self.config.ready_period);
                }
                view.smon.set_status(status);
            }
            Decision::ClearGlobalExpect => {
                info!(path = %view.path, "global expect cleared");
                view.smon.set_global_expect(None);
                if view.smon.status.is_waiting() {
                    view.smon.set_status(MonitorStatus::Idle);
                }
            }
            Decision::Act { action, status } => {
                self.launch(&view.path, &mut view.smon, action, status)?;
            }
        }
        Ok(())
    }

    fn apply_restart(&mut self, view: &mut ObjectView, plan: RestartPlan) -> Step<()> {
        match plan {
            RestartPlan::Reset(resources) => {
                debug!(path = %view.path, resources = %resources.join(","), "resources back up");
                for rid in &resources {
                    view.smon.restart.remove(rid);
                }
            }
            RestartPlan::Restart(resources) => {
                let action = Action::Restart {
                    resources: resources.clone(),
                };
                let status = action.transitional_status();
                self.launch(&view.path, &mut view.smon, action, status)?;
                for rid in resources {
                    *view.smon.restart.entry(rid).or_insert(0) += 1;
                }
            }
            RestartPlan::Exhausted(resources) => {
                warn!(path = %view.path, resources = %resources.join(","), "restart budget exhausted");
                let action = Action::Stop { force: true };
                self.launch(&view.path, &mut view.smon, action, MonitorStatus::RestartFailed)?;
                view.smon.local_expect = LocalExpect::Unset;
                if view.config.stonith {
                    view.smon.stonith = Some(view.local.clone());
                }
            }
        }
        Ok(())
    }

    /// Start `action` on the local instance of `path`. Freeze and thaw are
    /// flag flips done in place through the freezer; everything else goes
    /// to the action runner and reports back when done.
    fn launch(&mut self, path: &str, smon: &mut InstanceMonitor, action: Action, status: MonitorStatus) -> Step<()> {
        match action {
            Action::Freeze => {
                match self.freezer.freeze(path) {
                    Ok(()) => {
                        info!(%path, "frozen");
                        if let Err(e) = self.set_instance_frozen(path, true) {
                            warn!(%path, error = %e, "cannot publish frozen flag");
                        }
                    }
                    Err(e) => {
                        warn!(%path, error = %e, "freeze failed");
                        smon.set_status(MonitorStatus::FreezeFailed);
                    }
                }
                return Ok(());
            }
            Action::Thaw { slaves } => {
                let mut paths = vec![path.to_string()];
                if slaves {
                    let instance = self
                        .cluster
                        .local_tree()
                        .get_as::<InstanceStatus, _>(&instance_status_path(path))
                        .ok()
                        .flatten();
                    paths.extend(instance.map(|i| i.slaves).unwrap_or_default());
                }
                for p in &paths {
                    if let Err(e) = self.freezer.thaw(p) {
                        warn!(path = %p, error = %e, "thaw failed");
                        smon.set_status(MonitorStatus::ThawFailed);
                        return Ok(());
                    }
                }
                info!(%path, "thawed");
                if let Err(e) = self.set_instance_frozen(path, false) {
                    warn!(%path, error = %e, "cannot publish frozen flag");
                }
                return Ok(());
            }
            _ => {}
        }

        require!(self.in_flight.len() < self.config.max_parallel, "max parallel actions reached");
        info!(%path, %action, "launching action");
        smon.set_status(status);
        self.in_flight.insert(path.to_string(), action.clone());

        let future = self.runner.run(path, action.clone());
        let reports = self.reports_tx.clone();
        let path = path.to_string();
        tokio::spawn(async move {
            let result = future.await.map_err(|e| e.to_string());
            if reports.send(ActionReport { path, action, result }).await.is_err() {
                debug!("monitor gone, action report dropped");
            }
        });
        Ok(())
    }

    fn on_report(&mut self, report: ActionReport) {
        let ActionReport { path, action, result } = report;
        self.in_flight.remove(&path);
        let mut smon = self.read_smon(&path);
        let transitional = action.transitional_status();
        match result {
            Ok(()) => {
                info!(%path, %action, "action done");
                if smon.status == transitional {
                    smon.set_status(MonitorStatus::Idle);
                }
                let memory = self.memory.entry(path.clone()).or_default();
                match &action {
                    Action::Start => {
                        smon.local_expect = LocalExpect::Started;
                        memory.auto_started = true;
                    }
                    Action::Stop { .. } | Action::Delete | Action::Purge => {
                        smon.local_expect = LocalExpect::Unset;
                    }
                    Action::Shutdown => smon.local_expect = LocalExpect::Shutdown,
                    Action::Stonith { node } => {
                        memory.fenced.insert(node.clone());
                    }
                    _ => {}
                }
            }
            Err(message) => {
                warn!(%path, %action, error = %message, "action failed");
                if smon.status == transitional {
                    smon.set_status(action.failed_status());
                }
            }
        }
        if let Err(e) = self.write_smon(&path, &smon) {
            warn!(%path, error = %e, "cannot record action outcome");
        }
        self.run_sooner(Instant::now());
    }

    // ── Scalers ────────────────────────────────────────────────────

    fn scale(&mut self, view: &mut ObjectView) -> Step<()> {
        require!(view.is_leader(), "not scaler leader");
        let Some(target) = view.config.scale else {
            return Ok(());
        };
        let existing = scaler::existing_slaves(&*self.objects, &view.path);
        let mut plan = scaler::plan(&view.path, target, view.config.slave_size, &existing);
        plan.delete
            .retain(|slave| self.read_smon(slave).global_expect != Some(GlobalExpect::Deleted));
        if plan.is_empty() {
            if view.smon.status == MonitorStatus::Scaling {
                view.smon.set_status(MonitorStatus::Idle);
            }
            return Ok(());
        }
        info!(
            path = %view.path,
            create = plan.create.len(),
            resize = plan.resize.len(),
            delete = plan.delete.len(),
            "scaling"
        );
        view.smon.set_status(MonitorStatus::Scaling);
        self.scaling.insert(view.path.clone());
        let job = ScalerJob {
            scaler: view.path.clone(),
            plan,
            objects: self.objects.clone(),
            cluster: self.cluster.clone(),
            throttle: self.throttle.clone(),
            consensus_timeout: self.config.consensus_timeout,
        };
        tokio::spawn(job.run(self.scaler_tx.clone()));
        Ok(())
    }

    fn on_scaler(&mut self, outcome: ScalerOutcome) {
        self.scaling.remove(&outcome.scaler);
        let promote = outcome.ready.iter().map(|p| (p, GlobalExpect::Started));
        let delete = outcome.delete.iter().map(|p| (p, GlobalExpect::Deleted));
        for (slave, expect) in promote.chain(delete) {
            let mut smon = self.read_smon(slave);
            debug!(path = %slave, %expect, "slave global expect");
            smon.set_global_expect(Some(expect));
            if let Err(e) = self.write_smon(slave, &smon) {
                warn!(path = %slave, error = %e, "cannot set slave global expect");
            }
        }
        let mut smon = self.read_smon(&outcome.scaler);
        if smon.status == MonitorStatus::Scaling {
            smon.set_status(MonitorStatus::Idle);
            if let Err(e) = self.write_smon(&outcome.scaler, &smon) {
                warn!(path = %outcome.scaler, error = %e, "cannot record scaler status");
            }
        }
        self.run_sooner(Instant::now());
    }

    // ── Shutdown ───────────────────────────────────────────────────

    /// Shut every local instance down and wait, bounded by the shutdown
    /// timeout, until none is up or transitioning.
    async fn stop_local(&mut self, mode: NodeMonitorStatus) {
        info!(?mode, "stopping local instances");
        if let Err(e) = self.set_nmon_status(mode) {
            warn!(error = %e, "cannot publish node monitor status");
        }
        self.commit();
        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            self.collect_reports();
            if let Err(e) = self.refresh_instances().await {
                warn!(error = %e, "instance refresh failed");
            }
            let up = self.local_up();
            for path in &up {
                let mut smon = self.read_smon(path);
                if self.in_flight.contains_key(path)
                    || smon.local_expect == LocalExpect::Shutdown
                    || smon.status.is_failed()
                {
                    continue;
                }
                let status = Action::Shutdown.transitional_status();
                if let Err(defer) = self.launch(path, &mut smon, Action::Shutdown, status) {
                    debug!(%path, reason = %defer, "shutdown deferred");
                }
                if let Err(e) = self.write_smon(path, &smon) {
                    warn!(%path, error = %e, "cannot record shutdown");
                }
            }
            self.commit();
            if up.is_empty() && self.in_flight.is_empty() {
                info!(?mode, "local instances down");
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(?mode, remaining = up.len(), running = self.in_flight.len(), "shutdown timeout");
                return;
            }
            tokio::select! {
                Some(report) = self.reports_rx.recv() => self.on_report(report),
                _ = tokio::time::sleep_until(deadline) => {}
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }
    }

    /// Local instances currently up.
    fn local_up(&self) -> Vec<ObjectPath> {
        match self.cluster.local_state() {
            Ok(state) => state
                .services
                .status
                .iter()
                .filter(|(_, status)| status.avail.is_up())
                .map(|(path, _)| path.clone())
                .collect(),
            Err(e) => {
                warn!(error = %e, "undecodable local dataset");
                Vec::new()
            }
        }
    }
}

/// Copy the newest peer global expect when it is newer than ours.
fn adopt_global_expect(view: &mut ObjectView) {
    let newest = view
        .peers
        .iter()
        .filter(|(_, p)| p.smon.global_expect.is_some())
        .max_by(|a, b| a.1.smon.global_expect_updated.total_cmp(&b.1.smon.global_expect_updated));
    let Some((peer, p)) = newest else {
        return;
    };
    if p.smon.global_expect_updated > view.smon.global_expect_updated && p.smon.global_expect != view.smon.global_expect {
        debug!(path = %view.path, %peer, expect = ?p.smon.global_expect, "adopting peer global expect");
        view.smon.global_expect = p.smon.global_expect.clone();
        view.smon.global_expect_updated = p.smon.global_expect_updated;
    }
}
