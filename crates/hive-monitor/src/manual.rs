//! Handlers for objects carrying a global expect.
//!
//! Each handler is a short sequence of guarded steps over the object view.
//! A step that cannot be satisfied yet defers; the first satisfiable one
//! returns the decision for this pass.
//!
//! ```text
//! expect          ordering enforced
//! ─────────────   ──────────────────────────────────────────────
//! started         thaw first, parents up, failover: leader only,
//!                 flex: best-ranked inactive nodes up to the target
//! stopped         freeze first, children down
//! shutdown        children down
//! provisioned     leader first, others wait for it
//! unprovisioned   others first, leader waits for them
//! purged          same order as unprovisioned
//! placed[@nodes]  others stop first, then the destination starts
//! ```

use hive_state::{GlobalExpect, MonitorStatus, NodeName, Provisioned, Topology};

use crate::aggregate::{FrozenAgg, PlacementAgg};
use crate::collaborators::Action;
use crate::require;
use crate::step::{Decision, Defer, Step};
use crate::view::ObjectView;

/// Whether a failed local status ends `expect`: the failure is terminal
/// for the operation the expect asked for.
pub fn should_abort(status: MonitorStatus, expect: &GlobalExpect, is_leader: bool) -> bool {
    use MonitorStatus::*;
    let placing = matches!(expect, GlobalExpect::Placed | GlobalExpect::PlacedAt(_));
    match status {
        StartFailed => *expect == GlobalExpect::Started || placing && is_leader,
        StopFailed => *expect == GlobalExpect::Stopped || placing,
        ProvisionFailed => *expect == GlobalExpect::Provisioned,
        UnprovisionFailed => *expect == GlobalExpect::Unprovisioned,
        DeleteFailed => *expect == GlobalExpect::Deleted,
        PurgeFailed => *expect == GlobalExpect::Purged,
        ShutdownFailed => *expect == GlobalExpect::Shutdown,
        FreezeFailed => *expect == GlobalExpect::Frozen,
        ThawFailed => *expect == GlobalExpect::Thawed,
        PlaceFailed => placing,
        _ => false,
    }
}

/// Whether the aggregated status already satisfies `expect`.
pub fn is_satisfied(view: &ObjectView, expect: &GlobalExpect) -> bool {
    let agg = &view.agg;
    match expect {
        GlobalExpect::Started => match view.config.topology {
            Topology::Flex => agg.up.len() as u32 >= view.config.flex_target().max(1),
            Topology::Span => agg.avail == hive_state::Avail::Up,
            Topology::Failover => !agg.is_down(),
        },
        GlobalExpect::Stopped | GlobalExpect::Shutdown => agg.is_down(),
        GlobalExpect::Frozen => matches!(agg.frozen, FrozenAgg::Frozen | FrozenAgg::NotApplicable),
        GlobalExpect::Thawed => matches!(agg.frozen, FrozenAgg::Thawed | FrozenAgg::NotApplicable),
        GlobalExpect::Provisioned => agg.provisioned == Provisioned::True,
        GlobalExpect::Unprovisioned => agg.provisioned == Provisioned::False,
        GlobalExpect::Purged | GlobalExpect::Deleted => !agg.exists(),
        GlobalExpect::Placed => agg.placement == PlacementAgg::Optimal,
        GlobalExpect::PlacedAt(_) => {
            let destinations = destinations(view, expect);
            !destinations.is_empty()
                && agg.up.len() == destinations.len()
                && destinations.iter().all(|d| agg.up.contains(d))
        }
        GlobalExpect::Aborted => false,
    }
}

/// Drop a global expect the aggregate already satisfies, and release the
/// waiting statuses it caused. Returns true when the smon changed; once
/// converged, calling it again is a no-op.
pub fn set_smon_g_expect_from_status(view: &mut ObjectView) -> bool {
    let Some(expect) = view.smon.global_expect.clone() else {
        return false;
    };
    if !is_satisfied(view, &expect) {
        return false;
    }
    view.smon.set_global_expect(None);
    if view.smon.status.is_waiting() {
        view.smon.set_status(MonitorStatus::Idle);
    }
    true
}

/// Nodes meant to run the object under a placement expect, best first.
pub fn destinations(view: &ObjectView, expect: &GlobalExpect) -> Vec<NodeName> {
    let wanted = match view.config.topology {
        Topology::Flex => view.config.flex_target().max(1) as usize,
        _ => 1,
    };
    match expect {
        GlobalExpect::PlacedAt(nodes) => nodes
            .iter()
            .filter(|n| view.rank_of(n).is_some())
            .take(wanted)
            .cloned()
            .collect(),
        _ => view.ranked.iter().take(wanted).map(|r| r.node.clone()).collect(),
    }
}

/// Decision for an object whose local smon carries `expect`.
pub fn handle(view: &ObjectView, expect: &GlobalExpect) -> Step {
    match expect {
        GlobalExpect::Frozen => frozen(view),
        GlobalExpect::Thawed => thawed(view),
        GlobalExpect::Started => started(view),
        GlobalExpect::Stopped => stopped(view),
        GlobalExpect::Shutdown => shutdown(view),
        GlobalExpect::Provisioned => provisioned(view),
        GlobalExpect::Unprovisioned => unprovisioned(view, Action::Unprovision { leader: false }),
        GlobalExpect::Purged => unprovisioned(view, Action::Purge),
        GlobalExpect::Deleted => deleted(view),
        GlobalExpect::Aborted => Ok(Decision::ClearGlobalExpect),
        GlobalExpect::Placed | GlobalExpect::PlacedAt(_) => placed(view, expect),
    }
}

fn frozen(view: &ObjectView) -> Step {
    if view.instance.is_none() || view.local_frozen() {
        return Ok(Decision::Nothing);
    }
    Ok(Decision::act(Action::Freeze))
}

fn thawed(view: &ObjectView) -> Step {
    if !view.local_frozen() {
        return Ok(Decision::Nothing);
    }
    Ok(Decision::act(Action::Thaw { slaves: false }))
}

fn started(view: &ObjectView) -> Step {
    if view.instance.is_none() {
        return Ok(Decision::Nothing);
    }
    if view.local_frozen() {
        return Ok(Decision::act(Action::Thaw { slaves: false }));
    }
    if view.local_up() {
        return Ok(Decision::Nothing);
    }
    let parents = view.parents_down();
    require!(parents.is_empty(), MonitorStatus::WaitParents, "wait parents {}", parents.join(","));
    match view.config.topology {
        Topology::Failover => {
            if !view.agg.is_down() {
                return Ok(Decision::Nothing);
            }
            require!(view.is_leader(), "not leader");
            let busy = view.peers_transitioning();
            if !busy.is_empty() {
                return Err(Defer::new(format!("peers transitioning: {}", busy.join(","))));
            }
        }
        Topology::Flex => {
            if is_satisfied(view, &GlobalExpect::Started) {
                return Ok(Decision::Nothing);
            }
            require!(view.rank_of(&view.local).is_some(), "not a placement candidate");
            require!(view.among_best_inactive(), "not among the best inactive candidates");
        }
        Topology::Span => {}
    }
    Ok(Decision::act(Action::Start))
}

fn stopped(view: &ObjectView) -> Step {
    if view.instance.is_none() {
        return Ok(Decision::Nothing);
    }
    if !view.local_frozen() {
        return Ok(Decision::act(Action::Freeze));
    }
    let children = view.children_up();
    require!(children.is_empty(), MonitorStatus::WaitChildren, "wait children {}", children.join(","));
    if !view.local_up() {
        return Ok(Decision::Nothing);
    }
    Ok(Decision::act(Action::Stop { force: false }))
}

fn shutdown(view: &ObjectView) -> Step {
    let children = view.children_up();
    require!(children.is_empty(), MonitorStatus::WaitChildren, "wait children {}", children.join(","));
    if !view.local_up() {
        return Ok(Decision::Nothing);
    }
    Ok(Decision::act(Action::Shutdown))
}

fn provisioned(view: &ObjectView) -> Step {
    let Some(instance) = &view.instance else {
        return Ok(Decision::Nothing);
    };
    if instance.provisioned == Provisioned::True {
        return Ok(Decision::Nothing);
    }
    if view.is_provision_leader() {
        return Ok(Decision::act(Action::Provision { leader: true }));
    }
    let leader = view.provision_leader.as_deref().unwrap_or_default();
    let leader_done = view
        .peer(leader)
        .and_then(|p| p.instance.as_ref())
        .is_some_and(|i| i.provisioned == Provisioned::True);
    require!(leader_done, MonitorStatus::WaitLeader, "wait leader {leader} provisioned");
    Ok(Decision::act(Action::Provision { leader: false }))
}

/// Unprovision or purge: non-leaders first, the leader last.
fn unprovisioned(view: &ObjectView, action: Action) -> Step {
    let Some(instance) = &view.instance else {
        return Ok(Decision::Nothing);
    };
    if action != Action::Purge && instance.provisioned == Provisioned::False {
        return Ok(Decision::Nothing);
    }
    if !view.is_provision_leader() {
        return Ok(Decision::act(action));
    }
    let pending: Vec<&str> = view
        .peers
        .iter()
        .filter(|(_, p)| {
            p.instance.as_ref().is_some_and(|i| match action {
                Action::Purge => true,
                _ => i.provisioned != Provisioned::False,
            })
        })
        .map(|(n, _)| n.as_str())
        .collect();
    require!(pending.is_empty(), MonitorStatus::WaitNonLeader, "wait non-leaders {}", pending.join(","));
    let action = match action {
        Action::Unprovision { .. } => Action::Unprovision { leader: true },
        other => other,
    };
    Ok(Decision::act(action))
}

fn deleted(view: &ObjectView) -> Step {
    if view.instance.is_none() {
        return Ok(Decision::Nothing);
    }
    Ok(Decision::act(Action::Delete))
}

fn placed(view: &ObjectView, expect: &GlobalExpect) -> Step {
    if view.instance.is_none() {
        return Ok(Decision::Nothing);
    }
    let destinations = destinations(view, expect);
    if destinations.is_empty() {
        return Ok(Decision::SetStatus(MonitorStatus::PlaceFailed));
    }
    if !destinations.contains(&view.local) {
        if view.local_up() {
            return Ok(Decision::act(Action::Stop { force: false }));
        }
        return Ok(Decision::Nothing);
    }
    if view.local_frozen() {
        return Ok(Decision::act(Action::Thaw { slaves: false }));
    }
    if view.local_up() {
        return Ok(Decision::Nothing);
    }
    let elsewhere: Vec<&str> = view
        .agg
        .up
        .iter()
        .filter(|n| !destinations.contains(*n))
        .map(String::as_str)
        .collect();
    require!(elsewhere.is_empty(), MonitorStatus::WaitNonLeader, "wait {} stopped", elsewhere.join(","));
    let parents = view.parents_down();
    require!(parents.is_empty(), MonitorStatus::WaitParents, "wait parents {}", parents.join(","));
    Ok(Decision::act(Action::Start))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use hive_state::{NodeName, NodeState};
    use serde_json::{Value, json};

    use super::*;
    use crate::config::ObjectConfig;
    use crate::view::aggregate_path;

    const WEB: &str = "ns/svc/web";

    /// Two nodes, n1 local, each publishing `web` with the given records.
    fn view(n1: Value, n2: Value, cfg: ObjectConfig) -> ObjectView {
        view_of(vec![("n1", n1), ("n2", n2)], cfg)
    }

    /// Any number of nodes, n1 local.
    fn view_of(nodes: Vec<(&str, Value)>, cfg: ObjectConfig) -> ObjectView {
        let mut live: BTreeMap<NodeName, NodeState> = BTreeMap::new();
        for (node, records) in nodes {
            let state = json!({
                "services": {"status": {WEB: records["instance"].clone()}},
                "monitor": {"services": {WEB: records.get("smon").cloned().unwrap_or(json!({}))}},
            });
            live.insert(node.to_string(), serde_json::from_value(state).unwrap());
        }
        let related = cfg
            .parents
            .iter()
            .chain(cfg.children.iter())
            .map(|p| (p.clone(), aggregate_path(p, None, &live)))
            .collect();
        ObjectView::build(cfg, "n1", &live, related)
    }

    fn down() -> Value {
        json!({"instance": {"avail": "down", "provisioned": "true"}})
    }

    fn up() -> Value {
        json!({"instance": {"avail": "up", "provisioned": "true"}})
    }

    fn web() -> ObjectConfig {
        ObjectConfig::new(WEB, &["n1", "n2"])
    }

    #[test]
    fn abort_table() {
        use MonitorStatus::*;
        assert!(should_abort(StartFailed, &GlobalExpect::Started, false));
        assert!(should_abort(StartFailed, &GlobalExpect::Placed, true));
        assert!(!should_abort(StartFailed, &GlobalExpect::Placed, false));
        assert!(should_abort(StopFailed, &GlobalExpect::PlacedAt(vec!["n2".into()]), false));
        assert!(should_abort(PlaceFailed, &GlobalExpect::Placed, false));
        assert!(!should_abort(StartFailed, &GlobalExpect::Stopped, true));
        assert!(!should_abort(Idle, &GlobalExpect::Started, true));
    }

    #[test]
    fn started_runs_on_the_leader_only() {
        let leader = view(down(), down(), web());
        assert_eq!(handle(&leader, &GlobalExpect::Started), Ok(Decision::act(Action::Start)));

        let mut cfg = web();
        cfg.nodes = vec!["n2".into(), "n1".into()];
        let other = view(down(), down(), cfg);
        let defer = handle(&other, &GlobalExpect::Started).unwrap_err();
        assert_eq!(defer.reason, "not leader");
    }

    #[test]
    fn started_thaws_first_then_waits_for_parents() {
        let frozen = json!({"instance": {"avail": "down", "frozen": 5.0}});
        let v = view(frozen, down(), web());
        assert_eq!(
            handle(&v, &GlobalExpect::Started),
            Ok(Decision::act(Action::Thaw { slaves: false }))
        );

        let v = view(down(), down(), web().with_parents(&["ns/svc/db"]));
        let defer = handle(&v, &GlobalExpect::Started).unwrap_err();
        assert_eq!(defer.status, Some(MonitorStatus::WaitParents));
        assert_eq!(defer.reason, "wait parents ns/svc/db");
    }

    #[test]
    fn flex_start_is_limited_to_the_missing_count() {
        let cfg = ObjectConfig::new(WEB, &["n2", "n3", "n1"]).with_flex(1, 3, 2);
        let all_down = |cfg: ObjectConfig| view_of(vec![("n1", down()), ("n2", down()), ("n3", down())], cfg);

        let v = all_down(cfg.clone());
        assert_eq!(v.rank_of("n1"), Some(2));
        let deferred = handle(&v, &GlobalExpect::Started).unwrap_err();
        assert_eq!(deferred.reason, "not among the best inactive candidates");

        let mut best = cfg.clone();
        best.nodes = vec!["n1".into(), "n2".into(), "n3".into()];
        assert_eq!(handle(&all_down(best), &GlobalExpect::Started), Ok(Decision::act(Action::Start)));

        // One better-ranked node already up leaves one slot, still not ours.
        let v = view_of(vec![("n1", down()), ("n2", up()), ("n3", down())], cfg);
        assert!(handle(&v, &GlobalExpect::Started).is_err());
    }

    #[test]
    fn stopped_freezes_before_stopping() {
        let v = view(up(), down(), web());
        assert_eq!(handle(&v, &GlobalExpect::Stopped), Ok(Decision::act(Action::Freeze)));
        let frozen_up = json!({"instance": {"avail": "up", "frozen": 5.0}});
        let v = view(frozen_up, down(), web());
        assert_eq!(
            handle(&v, &GlobalExpect::Stopped),
            Ok(Decision::act(Action::Stop { force: false }))
        );
    }

    #[test]
    fn provision_leader_goes_first() {
        let unprov = json!({"instance": {"avail": "down", "provisioned": "false"}});
        let v = view(unprov.clone(), unprov.clone(), web());
        assert_eq!(
            handle(&v, &GlobalExpect::Provisioned),
            Ok(Decision::act(Action::Provision { leader: true }))
        );

        let mut cfg = web();
        cfg.nodes = vec!["n2".into(), "n1".into()];
        let v = view(unprov.clone(), unprov, cfg.clone());
        let defer = handle(&v, &GlobalExpect::Provisioned).unwrap_err();
        assert_eq!(defer.status, Some(MonitorStatus::WaitLeader));

        let v = view(json!({"instance": {"avail": "down", "provisioned": "false"}}), down(), cfg);
        assert_eq!(
            handle(&v, &GlobalExpect::Provisioned),
            Ok(Decision::act(Action::Provision { leader: false }))
        );
    }

    #[test]
    fn unprovision_leader_goes_last() {
        let v = view(down(), down(), web());
        let defer = handle(&v, &GlobalExpect::Unprovisioned).unwrap_err();
        assert_eq!(defer.status, Some(MonitorStatus::WaitNonLeader));

        let unprov = json!({"instance": {"avail": "down", "provisioned": "false"}});
        let v = view(down(), unprov, web());
        assert_eq!(
            handle(&v, &GlobalExpect::Unprovisioned),
            Ok(Decision::act(Action::Unprovision { leader: true }))
        );
    }

    #[test]
    fn placement_moves_after_the_source_stops() {
        let target = GlobalExpect::PlacedAt(vec!["n1".into()]);
        let v = view(down(), up(), web());
        let defer = handle(&v, &target).unwrap_err();
        assert_eq!(defer.status, Some(MonitorStatus::WaitNonLeader));

        let v = view(down(), down(), web());
        assert_eq!(handle(&v, &target), Ok(Decision::act(Action::Start)));

        let away = GlobalExpect::PlacedAt(vec!["n2".into()]);
        let v = view(up(), down(), web());
        assert_eq!(handle(&v, &away), Ok(Decision::act(Action::Stop { force: false })));
    }

    #[test]
    fn reconciliation_clears_satisfied_expect_once() {
        let smon = json!({"status": "wait parents", "global_expect": "started"});
        let mut v = view(json!({"instance": {"avail": "up"}, "smon": smon}), down(), web());
        assert!(set_smon_g_expect_from_status(&mut v));
        assert_eq!(v.smon.global_expect, None);
        assert_eq!(v.smon.status, MonitorStatus::Idle);
        let converged = v.smon.clone();
        assert!(!set_smon_g_expect_from_status(&mut v));
        assert_eq!(v.smon, converged);
    }

    #[test]
    fn unsatisfied_expect_is_kept() {
        let smon = json!({"global_expect": "stopped"});
        let mut v = view(json!({"instance": {"avail": "up"}, "smon": smon}), down(), web());
        assert!(!set_smon_g_expect_from_status(&mut v));
        assert_eq!(v.smon.global_expect, Some(GlobalExpect::Stopped));
    }
}
