//! Leader agreement tests.
//!
//! Two nodes holding the same cluster view must compute the same ranking,
//! whichever node computes it and in whatever order the snapshot was built.

use std::collections::BTreeMap;

use hive_placement::{
    CandidateFilter, PlacementPolicy, ScoringWeights, candidates_from_snapshot, leader, rank,
};
use hive_state::NodeState;
use serde_json::json;

fn node(load: f64, mem: f64, frozen: bool) -> NodeState {
    serde_json::from_value(json!({
        "frozen": if frozen { 100.0 } else { 0.0 },
        "stats": {"load_15m": load, "mem_avail": mem, "swap_avail": 90.0},
        "services": {"status": {"svc/db": {"avail": "down", "provisioned": "true"}}},
    }))
    .unwrap()
}

fn view(order: &[&str]) -> BTreeMap<String, NodeState> {
    let mut states = BTreeMap::new();
    for name in order {
        let state = match *name {
            "n1" => node(2.0, 60.0, false),
            "n2" => node(0.2, 80.0, false),
            "n3" => node(0.1, 90.0, true),
            _ => node(1.0, 50.0, false),
        };
        states.insert(name.to_string(), state);
    }
    states
}

const NODES: [&str; 4] = ["n1", "n2", "n3", "n4"];

fn configured() -> Vec<String> {
    NODES.iter().map(|n| n.to_string()).collect()
}

#[test]
fn identical_views_rank_identically() {
    let view_a = view(&["n1", "n2", "n3", "n4"]);
    let view_b = view(&["n4", "n3", "n2", "n1"]);
    let filter = CandidateFilter::default();
    let weights = ScoringWeights::default();

    for policy in [
        PlacementPolicy::NodesOrder,
        PlacementPolicy::LoadAvg,
        PlacementPolicy::Shift,
        PlacementPolicy::Spread,
        PlacementPolicy::Score,
    ] {
        let a = rank(
            "svc/db",
            policy,
            &candidates_from_snapshot("svc/db", &configured(), &view_a),
            &filter,
            &weights,
        );
        let b = rank(
            "svc/db",
            policy,
            &candidates_from_snapshot("svc/db", &configured(), &view_b),
            &filter,
            &weights,
        );
        assert_eq!(a, b, "{policy} ranking differs between hosts");
        assert!(a.iter().all(|r| r.node != "n3"), "frozen node ranked by {policy}");
    }
}

#[test]
fn load_avg_leader_is_least_loaded_unfrozen_node() {
    let snapshot = view(&NODES);
    let candidates = candidates_from_snapshot("svc/db", &configured(), &snapshot);
    let filter = CandidateFilter::default();
    let weights = ScoringWeights::default();

    assert_eq!(
        leader("svc/db", PlacementPolicy::LoadAvg, &candidates, &filter, &weights).as_deref(),
        Some("n2")
    );

    // Letting frozen nodes compete hands leadership to n3.
    let permissive = filter.with_frozen(false);
    assert_eq!(
        leader("svc/db", PlacementPolicy::LoadAvg, &candidates, &permissive, &weights).as_deref(),
        Some("n3")
    );
}

#[test]
fn silent_nodes_never_lead() {
    let snapshot = view(&["n2", "n4"]);
    let candidates = candidates_from_snapshot("svc/db", &configured(), &snapshot);
    let ranked = rank(
        "svc/db",
        PlacementPolicy::NodesOrder,
        &candidates,
        &CandidateFilter::default(),
        &ScoringWeights::default(),
    );
    let names: Vec<&str> = ranked.iter().map(|r| r.node.as_str()).collect();
    assert_eq!(names, vec!["n2", "n4"]);
}
