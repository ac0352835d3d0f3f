//! Engine scenarios over in-memory collaborators: the cluster state is
//! real, peers are installed datasets, actions are recorded.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::watch;

use hive_monitor::testing::{MemoryFreezer, RecordingRunner, StaticConfig, StaticStatus};
use hive_monitor::{Action, Freezer, Monitor, MonitorConfig, ObjectConfig};
use hive_state::{
    Avail, ClusterState, GlobalExpect, InstanceMonitor, InstanceStatus, LocalExpect, MonitorStatus,
    NodeMonitorStatus, Provisioned, smon_path, unix_now,
};

const WEB: &str = "ns/svc/web";

struct Harness {
    cluster: Arc<ClusterState>,
    runner: Arc<RecordingRunner>,
    freezer: Arc<MemoryFreezer>,
    objects: Arc<StaticConfig>,
    status: Arc<StaticStatus>,
    monitor: Monitor,
}

fn harness(local: &str, nodes: &[&str], objects: Vec<ObjectConfig>, runner: RecordingRunner) -> Harness {
    harness_with(local, nodes, objects, runner, fast_config())
}

fn harness_with(
    local: &str,
    nodes: &[&str],
    objects: Vec<ObjectConfig>,
    runner: RecordingRunner,
    config: MonitorConfig,
) -> Harness {
    let names: Vec<String> = nodes.iter().map(|n| n.to_string()).collect();
    let cluster = Arc::new(ClusterState::new(local, &names));
    let runner = Arc::new(runner);
    let freezer = Arc::new(MemoryFreezer::new());
    let objects = Arc::new(StaticConfig::new(objects));
    let status = Arc::new(StaticStatus::new());
    let monitor = Monitor::new(
        cluster.clone(),
        runner.clone(),
        freezer.clone(),
        objects.clone(),
        status.clone(),
    )
    .with_config(config);
    Harness {
        cluster,
        runner,
        freezer,
        objects,
        status,
        monitor,
    }
}

fn fast_config() -> MonitorConfig {
    MonitorConfig::default()
        .with_interval(Duration::from_millis(50))
        .with_ready_period(Duration::ZERO)
}

fn instance(avail: Avail) -> InstanceStatus {
    InstanceStatus {
        avail,
        overall: avail,
        provisioned: Provisioned::True,
        ..InstanceStatus::default()
    }
}

/// Install a beating peer whose dataset was received.
fn peer(h: &Harness, name: &str, data: Value) {
    h.cluster.install_peer(name, data);
    h.cluster.set_beating("hb#1", name, true);
    h.cluster.generations().set_installed(name, 1);
}

fn peer_web(smon: Value, avail: &str) -> Value {
    json!({
        "monitor": {"status": "idle", "services": {WEB: smon}},
        "services": {"status": {WEB: {"avail": avail, "provisioned": "true"}}},
    })
}

fn smon(h: &Harness, path: &str) -> InstanceMonitor {
    h.cluster
        .local_tree()
        .get_as::<InstanceMonitor, _>(&smon_path(path))
        .unwrap()
        .unwrap_or_default()
}

fn set_global_expect(h: &Harness, path: &str, expect: GlobalExpect) {
    let smon = InstanceMonitor {
        global_expect: Some(expect),
        global_expect_updated: unix_now(),
        ..InstanceMonitor::default()
    };
    h.cluster.local_tree().set_as(&smon_path(path), &smon).unwrap();
}

fn nmon_status(h: &Harness) -> NodeMonitorStatus {
    h.cluster.local_state().unwrap().monitor.status
}

/// Init → rejoin → idle takes two passes when every peer is already known.
async fn join(h: &mut Harness) {
    h.monitor.run_pass().await.unwrap();
    h.monitor.run_pass().await.unwrap();
    assert_eq!(nmon_status(h), NodeMonitorStatus::Idle);
}

async fn settle_actions() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

// ── Failover ─────────────────────────────────────────────────────

#[tokio::test]
async fn only_the_leader_goes_ready_and_starts() {
    let web = ObjectConfig::new(WEB, &["a", "b"]);
    let mut a = harness("a", &["a", "b"], vec![web.clone()], RecordingRunner::new());
    a.status.set(WEB, instance(Avail::Down));
    peer(&a, "b", peer_web(json!({"status": "idle"}), "down"));

    let mut b = harness("b", &["a", "b"], vec![web], RecordingRunner::new());
    b.status.set(WEB, instance(Avail::Down));
    peer(&b, "a", peer_web(json!({"status": "idle"}), "down"));

    join(&mut a).await;
    join(&mut b).await;

    assert_eq!(smon(&a, WEB).status, MonitorStatus::Ready);
    assert_eq!(smon(&b, WEB).status, MonitorStatus::Idle);
    assert_eq!(b.monitor.handle().deferrals().get(WEB).map(String::as_str), Some("not leader"));

    a.monitor.run_pass().await.unwrap();
    assert_eq!(a.runner.calls(), vec![(WEB.to_string(), Action::Start)]);
    assert_eq!(smon(&a, WEB).status, MonitorStatus::Starting);
    assert!(b.runner.calls().is_empty());

    a.status.set(WEB, instance(Avail::Up));
    settle_actions().await;
    a.monitor.run_pass().await.unwrap();
    let after = smon(&a, WEB);
    assert_eq!(after.status, MonitorStatus::Idle);
    assert_eq!(after.local_expect, LocalExpect::Started);
    assert_eq!(a.runner.calls().len(), 1);
}

#[tokio::test]
async fn ready_leader_reverts_when_a_peer_is_ready() {
    let mut a = harness("a", &["a", "b"], vec![ObjectConfig::new(WEB, &["a", "b"])], RecordingRunner::new());
    a.status.set(WEB, instance(Avail::Down));
    peer(&a, "b", peer_web(json!({"status": "idle"}), "down"));
    join(&mut a).await;
    assert_eq!(smon(&a, WEB).status, MonitorStatus::Ready);

    peer(&a, "b", peer_web(json!({"status": "ready"}), "down"));
    a.monitor.run_pass().await.unwrap();
    assert_eq!(smon(&a, WEB).status, MonitorStatus::Idle);
    assert_eq!(
        a.monitor.handle().deferrals().get(WEB).map(String::as_str),
        Some("peer ready: b")
    );
    assert!(a.runner.calls().is_empty());

    // Back to ready, then start once settled.
    peer(&a, "b", peer_web(json!({"status": "idle"}), "down"));
    a.monitor.run_pass().await.unwrap();
    assert_eq!(smon(&a, WEB).status, MonitorStatus::Ready);
    a.monitor.run_pass().await.unwrap();
    assert_eq!(a.runner.calls(), vec![(WEB.to_string(), Action::Start)]);
}

#[tokio::test]
async fn ready_period_delays_the_start() {
    let config = fast_config().with_ready_period(Duration::from_secs(60));
    let mut a = harness_with("a", &["a"], vec![ObjectConfig::new(WEB, &["a"])], RecordingRunner::new(), config);
    a.status.set(WEB, instance(Avail::Down));
    join(&mut a).await;
    a.monitor.run_pass().await.unwrap();
    assert_eq!(smon(&a, WEB).status, MonitorStatus::Ready);
    assert_eq!(
        a.monitor.handle().deferrals().get(WEB).map(String::as_str),
        Some("ready, settling")
    );
    assert!(a.runner.calls().is_empty());
}

// ── Global expects ───────────────────────────────────────────────

#[tokio::test]
async fn start_failure_aborts_the_started_expect() {
    let runner = RecordingRunner::new();
    runner.fail(WEB);
    let mut a = harness("a", &["a"], vec![ObjectConfig::new(WEB, &["a"])], runner);
    a.status.set(WEB, instance(Avail::Down));
    set_global_expect(&a, WEB, GlobalExpect::Started);

    join(&mut a).await;
    assert_eq!(a.runner.calls(), vec![(WEB.to_string(), Action::Start)]);

    settle_actions().await;
    a.monitor.run_pass().await.unwrap();
    let after = smon(&a, WEB);
    assert_eq!(after.status, MonitorStatus::StartFailed);
    assert_eq!(after.global_expect, None);
    assert_eq!(a.runner.calls().len(), 1);
}

#[tokio::test]
async fn peer_global_expect_is_adopted_and_freezes_first() {
    let mut a = harness("a", &["a", "b"], vec![ObjectConfig::new(WEB, &["a", "b"])], RecordingRunner::new());
    a.status.set(WEB, instance(Avail::Up));
    peer(
        &a,
        "b",
        peer_web(
            json!({"status": "idle", "global_expect": "stopped", "global_expect_updated": 100.0}),
            "down",
        ),
    );

    join(&mut a).await;
    assert_eq!(smon(&a, WEB).global_expect, Some(GlobalExpect::Stopped));
    assert!(a.freezer.is_frozen(WEB));
    assert!(a.runner.calls().is_empty());

    a.monitor.run_pass().await.unwrap();
    assert_eq!(a.runner.calls(), vec![(WEB.to_string(), Action::Stop { force: false })]);

    a.status.set(WEB, instance(Avail::Down));
    settle_actions().await;
    a.monitor.run_pass().await.unwrap();
    a.monitor.run_pass().await.unwrap();
    let after = smon(&a, WEB);
    assert_eq!(after.global_expect, None, "satisfied expect is dropped");
    assert_eq!(after.local_expect, LocalExpect::Unset);
}

#[tokio::test]
async fn max_parallel_caps_running_actions() {
    let objects = ["ns/svc/a", "ns/svc/b", "ns/svc/c"];
    let config = fast_config().with_max_parallel(2);
    let mut h = harness_with(
        "a",
        &["a"],
        objects.iter().map(|p| ObjectConfig::new(*p, &["a"])).collect(),
        RecordingRunner::holding(),
        config,
    );
    for path in objects {
        h.status.set(path, instance(Avail::Down));
        set_global_expect(&h, path, GlobalExpect::Started);
    }

    join(&mut h).await;
    assert_eq!(h.runner.calls().len(), 2);
    assert_eq!(h.monitor.in_flight(), 2);
    assert_eq!(
        h.monitor.handle().deferrals().get("ns/svc/c").map(String::as_str),
        Some("max parallel actions reached")
    );

    h.runner.release();
    h.status.set("ns/svc/a", instance(Avail::Up));
    h.status.set("ns/svc/b", instance(Avail::Up));
    settle_actions().await;
    h.monitor.run_pass().await.unwrap();
    let calls = h.runner.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[2], ("ns/svc/c".to_string(), Action::Start));
}

// ── Restart budget ───────────────────────────────────────────────

#[tokio::test]
async fn failed_resource_is_restarted_within_budget() {
    let mut h = harness("a", &["a"], vec![ObjectConfig::new(WEB, &["a"])], RecordingRunner::new());
    let mut status = instance(Avail::Warn);
    status.resources.insert(
        "app#1".into(),
        serde_json::from_value(json!({"status": "down", "restart": 1, "monitor": true})).unwrap(),
    );
    h.status.set(WEB, status);
    let started = InstanceMonitor {
        local_expect: LocalExpect::Started,
        ..InstanceMonitor::default()
    };
    h.cluster.local_tree().set_as(&smon_path(WEB), &started).unwrap();

    join(&mut h).await;
    assert_eq!(
        h.runner.calls(),
        vec![(WEB.to_string(), Action::Restart { resources: vec!["app#1".into()] })]
    );
    assert_eq!(smon(&h, WEB).restart.get("app#1"), Some(&1));

    settle_actions().await;
    h.monitor.run_pass().await.unwrap();
    let calls = h.runner.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1], (WEB.to_string(), Action::Stop { force: true }));
    let after = smon(&h, WEB);
    assert_eq!(after.status, MonitorStatus::RestartFailed);
    assert_eq!(after.local_expect, LocalExpect::Unset);
}

// ── Rejoin ───────────────────────────────────────────────────────

#[tokio::test]
async fn rejoin_waits_for_silent_peers() {
    let mut h = harness("a", &["a", "b"], vec![ObjectConfig::new(WEB, &["a", "b"])], RecordingRunner::new());
    h.status.set(WEB, instance(Avail::Down));
    h.monitor.run_pass().await.unwrap();
    h.monitor.run_pass().await.unwrap();
    assert_eq!(nmon_status(&h), NodeMonitorStatus::Rejoin);
    assert_eq!(smon(&h, WEB).status, MonitorStatus::Idle);
    assert!(!h.freezer.node_frozen());
}

#[tokio::test]
async fn rejoin_grace_expiry_freezes_the_node() {
    let config = fast_config().with_rejoin_grace(Duration::ZERO);
    let mut h = harness_with("a", &["a", "b"], vec![ObjectConfig::new(WEB, &["a", "b"])], RecordingRunner::new(), config);
    h.status.set(WEB, instance(Avail::Down));
    join(&mut h).await;
    assert!(h.freezer.node_frozen());
    assert!(h.cluster.local_state().unwrap().is_frozen());

    // A frozen node does not take over on its own.
    h.monitor.run_pass().await.unwrap();
    assert_eq!(smon(&h, WEB).status, MonitorStatus::Idle);
    assert!(h.runner.calls().is_empty());
}

// ── Object lifecycle ─────────────────────────────────────────────

#[tokio::test]
async fn removed_object_records_are_dropped() {
    let mut h = harness("a", &["a"], vec![ObjectConfig::new(WEB, &["a"])], RecordingRunner::new());
    h.status.set(WEB, instance(Avail::Up));
    join(&mut h).await;
    let state = h.cluster.local_state().unwrap();
    assert!(state.services.config.contains_key(WEB));
    assert!(state.instance(WEB).is_some());

    h.objects.remove(WEB);
    h.monitor.run_pass().await.unwrap();
    let state = h.cluster.local_state().unwrap();
    assert!(state.services.config.is_empty());
    assert!(state.instance(WEB).is_none());
    assert!(state.smon(WEB).is_none());
}

#[tokio::test]
async fn scaler_creates_slaves_and_starts_them() {
    let pool = ObjectConfig::new("ns/svc/pool", &["a"]).with_scale(3, 2);
    let mut h = harness("a", &["a"], vec![pool], RecordingRunner::new());
    join(&mut h).await;
    assert_eq!(smon(&h, "ns/svc/pool").status, MonitorStatus::Scaling);

    settle_actions().await;
    h.monitor.run_pass().await.unwrap();
    assert_eq!(smon(&h, "ns/svc/pool").status, MonitorStatus::Idle);
    for slave in ["ns/svc/0.pool", "ns/svc/1.pool"] {
        assert_eq!(smon(&h, slave).global_expect, Some(GlobalExpect::Started), "{slave}");
    }
    let widths: Vec<u32> = ["ns/svc/0.pool", "ns/svc/1.pool"]
        .iter()
        .map(|p| hive_monitor::ConfigProvider::object(&*h.objects, p).unwrap().flex_target())
        .collect();
    assert_eq!(widths, vec![2, 1]);
}

// ── Drain and shutdown ───────────────────────────────────────────

#[tokio::test]
async fn drain_then_shutdown_stops_local_instances_once() {
    let config = fast_config().with_shutdown_timeout(Duration::from_millis(200));
    let h = harness_with("a", &["a"], vec![ObjectConfig::new(WEB, &["a"])], RecordingRunner::new(), config);
    h.status.set(WEB, instance(Avail::Up));
    let handle = h.monitor.handle();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(h.monitor.run(shutdown_rx));

    tokio::time::sleep(Duration::from_millis(150)).await;
    handle.drain();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(nmon_status_of(&h.cluster), NodeMonitorStatus::Draining);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();

    let shutdowns = h
        .runner
        .calls()
        .into_iter()
        .filter(|(_, action)| *action == Action::Shutdown)
        .count();
    assert_eq!(shutdowns, 1);
    assert_eq!(nmon_status_of(&h.cluster), NodeMonitorStatus::Shutting);
    assert_eq!(
        h.cluster.local_state().unwrap().smon(WEB).map(|s| s.local_expect),
        Some(LocalExpect::Shutdown)
    );
}

fn nmon_status_of(cluster: &ClusterState) -> NodeMonitorStatus {
    cluster.local_state().unwrap().monitor.status
}
