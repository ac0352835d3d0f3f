//! Cluster-wide aggregated status of one object.
//!
//! Derived on every pass from the instance statuses published by the live
//! nodes; never stored. The topology decides how instance availabilities
//! fold into the object availability:
//!
//! ```text
//! failover   0 up → down    1 up → up    >1 up → warn
//! flex       0 up → down    up outside [min, max] → warn    otherwise up
//! span       all up → up    none up → down    otherwise mixed
//! ```

use std::collections::{BTreeMap, BTreeSet};

use hive_placement::RankedNode;
use hive_state::{Avail, InstanceStatus, NodeName, Provisioned, Topology};

use crate::config::ObjectConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FrozenAgg {
    Frozen,
    Thawed,
    Mixed,
    #[default]
    NotApplicable,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PlacementAgg {
    Optimal,
    NonOptimal,
    #[default]
    NotApplicable,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Aggregate {
    pub avail: Avail,
    pub overall: Avail,
    pub frozen: FrozenAgg,
    pub placement: PlacementAgg,
    pub provisioned: Provisioned,
    /// Nodes publishing an instance of the object.
    pub instances: BTreeSet<NodeName>,
    /// Nodes whose instance is up.
    pub up: BTreeSet<NodeName>,
}

impl Aggregate {
    pub fn is_up(&self) -> bool {
        self.avail.is_up()
    }

    /// No instance up anywhere.
    pub fn is_down(&self) -> bool {
        self.up.is_empty()
    }

    pub fn exists(&self) -> bool {
        !self.instances.is_empty()
    }
}

/// Aggregate the `instances` published for one object.
pub fn aggregate(
    config: &ObjectConfig,
    instances: &BTreeMap<NodeName, InstanceStatus>,
    ranked: &[RankedNode],
) -> Aggregate {
    let mut agg = Aggregate::default();
    if instances.is_empty() {
        return agg;
    }
    agg.instances = instances.keys().cloned().collect();
    agg.up = instances
        .iter()
        .filter(|(_, inst)| inst.avail.is_up())
        .map(|(node, _)| node.clone())
        .collect();

    agg.avail = fold_avail(config, instances, agg.up.len());
    agg.overall = if agg.avail == Avail::Warn || instances.values().any(|i| i.overall == Avail::Warn) {
        Avail::Warn
    } else {
        agg.avail
    };
    agg.frozen = fold_frozen(instances);
    agg.provisioned = fold_provisioned(instances);
    agg.placement = placement(config, &agg.up, ranked);
    agg
}

fn fold_avail(config: &ObjectConfig, instances: &BTreeMap<NodeName, InstanceStatus>, up: usize) -> Avail {
    if instances.values().all(|i| i.avail == Avail::NotApplicable) {
        return Avail::NotApplicable;
    }
    match config.topology {
        Topology::Failover => match up {
            0 => Avail::Down,
            1 => Avail::Up,
            _ => Avail::Warn,
        },
        Topology::Flex => {
            let up = up as u32;
            if up == 0 {
                Avail::Down
            } else if up < config.flex_min || up > config.flex_max() {
                Avail::Warn
            } else {
                Avail::Up
            }
        }
        Topology::Span => {
            let applicable = instances.values().filter(|i| i.avail != Avail::NotApplicable).count();
            if up == 0 {
                Avail::Down
            } else if up == applicable {
                Avail::Up
            } else {
                Avail::Mixed
            }
        }
    }
}

fn fold_frozen(instances: &BTreeMap<NodeName, InstanceStatus>) -> FrozenAgg {
    let frozen = instances.values().filter(|i| i.is_frozen()).count();
    if frozen == 0 {
        FrozenAgg::Thawed
    } else if frozen == instances.len() {
        FrozenAgg::Frozen
    } else {
        FrozenAgg::Mixed
    }
}

fn fold_provisioned(instances: &BTreeMap<NodeName, InstanceStatus>) -> Provisioned {
    let mut seen = instances
        .values()
        .map(|i| i.provisioned)
        .filter(|p| *p != Provisioned::NotApplicable);
    let Some(first) = seen.next() else {
        return Provisioned::NotApplicable;
    };
    if seen.all(|p| p == first) { first } else { Provisioned::Mixed }
}

/// Optimal when the up instances sit on the best-ranked nodes.
fn placement(config: &ObjectConfig, up: &BTreeSet<NodeName>, ranked: &[RankedNode]) -> PlacementAgg {
    if up.is_empty() || ranked.is_empty() {
        return PlacementAgg::NotApplicable;
    }
    let wanted = match config.topology {
        Topology::Failover => 1,
        Topology::Flex => config.flex_target().max(1) as usize,
        Topology::Span => return PlacementAgg::NotApplicable,
    };
    let best: BTreeSet<&NodeName> = ranked.iter().take(wanted).map(|r| &r.node).collect();
    if up.iter().all(|n| best.contains(n)) && up.len() >= best.len() {
        PlacementAgg::Optimal
    } else {
        PlacementAgg::NonOptimal
    }
}
