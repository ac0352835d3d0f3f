//! hive placement — candidate filtering, node scoring, leader ranking.
//!
//! Every node ranks the candidates of an object on its own, from its own
//! copy of the cluster state. There is no election round: coordination
//! relies on the ranking being a pure function of its inputs, so two nodes
//! holding the same view always agree on the leader.
//!
//! # Components
//!
//! - **`candidate`**: Per-node placement inputs and the discard filter
//! - **`scorer`**: Weighted node score (load, memory, swap)
//! - **`ranker`**: Policies and the deterministic ordering
//! - **`convert`**: Building candidates from the cluster snapshot

pub mod candidate;
pub mod convert;
pub mod ranker;
pub mod scorer;

pub use candidate::{Candidate, CandidateFilter};
pub use convert::candidates_from_snapshot;
pub use ranker::{PlacementPolicy, RankedNode, is_leader, leader, rank};
pub use scorer::{ScoringWeights, score_candidate};
