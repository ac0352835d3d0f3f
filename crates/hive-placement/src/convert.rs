//! Building placement candidates from the cluster snapshot.
//!
//! Bridges `hive_state::NodeState` to the placement engine's [`Candidate`].

use std::collections::BTreeMap;

use hive_state::{MonitorStatus, NodeName, NodeState, Provisioned};

use crate::candidate::Candidate;

/// Candidates for object `path` among its configured `nodes`.
///
/// Only nodes we hold a dataset for and that publish an instance of the
/// object are candidates; a silent node cannot be placed on.
pub fn candidates_from_snapshot(
    path: &str,
    nodes: &[NodeName],
    snapshot: &BTreeMap<NodeName, NodeState>,
) -> Vec<Candidate> {
    nodes
        .iter()
        .enumerate()
        .filter_map(|(order, node)| {
            let state = snapshot.get(node)?;
            let instance = state.instance(path)?;
            let start_failed = state
                .smon(path)
                .is_some_and(|smon| {
                    matches!(smon.status, MonitorStatus::StartFailed | MonitorStatus::RestartFailed)
                });
            Some(Candidate {
                node: node.clone(),
                order,
                frozen: state.is_frozen() || instance.is_frozen(),
                overloaded: state.stats.is_overloaded(),
                provisioned: instance.provisioned != Provisioned::False,
                constraints_ok: instance.constraints,
                start_failed,
                load_15m: state.stats.load_15m,
                mem_avail: state.stats.mem_avail,
                swap_avail: state.stats.swap_avail,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(value: serde_json::Value) -> NodeState {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn maps_node_and_instance_flags() {
        let mut snapshot = BTreeMap::new();
        snapshot.insert(
            "n1".to_string(),
            state(json!({
                "frozen": 12.0,
                "stats": {"load_15m": 1.5, "mem_avail": 50.0, "swap_avail": 80.0, "mem_total_mb": 1024},
                "services": {"status": {"svc/web": {"avail": "down", "provisioned": "false"}}},
            })),
        );
        snapshot.insert(
            "n2".to_string(),
            state(json!({
                "services": {"status": {"svc/web": {"avail": "down", "constraints": false}}},
                "monitor": {"services": {"svc/web": {"status": "start failed"}}},
            })),
        );

        let nodes = vec!["n1".to_string(), "n2".to_string(), "n3".to_string()];
        let c = candidates_from_snapshot("svc/web", &nodes, &snapshot);
        assert_eq!(c.len(), 2);

        assert_eq!(c[0].node, "n1");
        assert!(c[0].frozen);
        assert!(!c[0].provisioned);
        assert_eq!(c[0].load_15m, 1.5);

        assert_eq!(c[1].order, 1);
        assert!(!c[1].constraints_ok);
        assert!(c[1].start_failed);
        assert!(!c[1].frozen);
    }

    #[test]
    fn nodes_without_instance_are_skipped() {
        let mut snapshot = BTreeMap::new();
        snapshot.insert("n1".to_string(), state(json!({})));
        let c = candidates_from_snapshot("svc/web", &["n1".to_string()], &snapshot);
        assert!(c.is_empty());
    }
}
