//! Deterministic placement ranking.
//!
//! `rank` filters the candidates, then orders the survivors by the object's
//! placement policy. Every comparison ends with a node-name tie-break, so
//! the result never depends on the order the candidates were supplied in.
//! The leader of an object is rank 0.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::trace;

use hive_state::NodeName;

use crate::candidate::{Candidate, CandidateFilter};
use crate::scorer::{ScoringWeights, score_candidate};

/// How the candidates of an object are ordered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlacementPolicy {
    /// Configured node order.
    #[default]
    #[serde(rename = "nodes order")]
    NodesOrder,
    /// Lowest 15-minute load average first.
    #[serde(rename = "load avg")]
    LoadAvg,
    /// Configured node order, rotated by an offset derived from the path,
    /// so objects sharing a node list start on different nodes.
    #[serde(rename = "shift")]
    Shift,
    /// Pseudo-random but stable order derived from hashing path and node.
    #[serde(rename = "spread")]
    Spread,
    /// Highest weighted score first.
    #[serde(rename = "score")]
    Score,
}

impl fmt::Display for PlacementPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlacementPolicy::NodesOrder => "nodes order",
            PlacementPolicy::LoadAvg => "load avg",
            PlacementPolicy::Shift => "shift",
            PlacementPolicy::Spread => "spread",
            PlacementPolicy::Score => "score",
        };
        f.write_str(s)
    }
}

impl FromStr for PlacementPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "nodes order" | "nodes_order" | "nodes-order" => Ok(PlacementPolicy::NodesOrder),
            "load avg" | "load_avg" | "load-avg" => Ok(PlacementPolicy::LoadAvg),
            "shift" => Ok(PlacementPolicy::Shift),
            "spread" => Ok(PlacementPolicy::Spread),
            "score" => Ok(PlacementPolicy::Score),
            other => Err(format!("unknown placement policy '{other}'")),
        }
    }
}

/// One entry of a ranking.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedNode {
    pub node: NodeName,
    pub rank: usize,
    pub score: f64,
}

/// Filter and order the candidates of object `path`.
pub fn rank(
    path: &str,
    policy: PlacementPolicy,
    candidates: &[Candidate],
    filter: &CandidateFilter,
    weights: &ScoringWeights,
) -> Vec<RankedNode> {
    let mut kept: Vec<(&Candidate, f64)> = filter
        .apply(candidates)
        .into_iter()
        .map(|c| (c, score_candidate(c, weights)))
        .collect();

    match policy {
        PlacementPolicy::NodesOrder | PlacementPolicy::Shift => {
            kept.sort_by(|(a, _), (b, _)| by_order(a, b));
            if policy == PlacementPolicy::Shift && !kept.is_empty() {
                let offset = (path_hash(path) % kept.len() as u64) as usize;
                kept.rotate_left(offset);
            }
        }
        PlacementPolicy::LoadAvg => {
            kept.sort_by(|(a, _), (b, _)| a.load_15m.total_cmp(&b.load_15m).then_with(|| by_order(a, b)));
        }
        PlacementPolicy::Spread => {
            kept.sort_by_cached_key(|(c, _)| (spread_key(path, &c.node), c.node.clone()));
        }
        PlacementPolicy::Score => {
            kept.sort_by(|(a, sa), (b, sb)| sb.total_cmp(sa).then_with(|| by_order(a, b)));
        }
    }

    let ranked: Vec<RankedNode> = kept
        .into_iter()
        .enumerate()
        .map(|(rank, (c, score))| RankedNode {
            node: c.node.clone(),
            rank,
            score,
        })
        .collect();
    trace!(path, %policy, ranked = ?ranked.iter().map(|r| r.node.as_str()).collect::<Vec<_>>(), "placement ranking");
    ranked
}

/// The rank-0 node, if any candidate survives the filter.
pub fn leader(
    path: &str,
    policy: PlacementPolicy,
    candidates: &[Candidate],
    filter: &CandidateFilter,
    weights: &ScoringWeights,
) -> Option<NodeName> {
    rank(path, policy, candidates, filter, weights)
        .into_iter()
        .next()
        .map(|r| r.node)
}

pub fn is_leader(
    node: &str,
    path: &str,
    policy: PlacementPolicy,
    candidates: &[Candidate],
    filter: &CandidateFilter,
    weights: &ScoringWeights,
) -> bool {
    leader(path, policy, candidates, filter, weights).is_some_and(|l| l == node)
}

fn by_order(a: &Candidate, b: &Candidate) -> Ordering {
    a.order.cmp(&b.order).then_with(|| a.node.cmp(&b.node))
}

fn path_hash(path: &str) -> u64 {
    let digest = Sha256::digest(path.as_bytes());
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(buf)
}

fn spread_key(path: &str, node: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update(node.as_bytes());
    hex::encode(hasher.finalize())
}
