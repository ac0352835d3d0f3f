//! hive-state — the per-node cluster state model.
//!
//! Every node publishes one [`NodeState`] document. Locally it lives in a
//! [`StateTree`] that records every mutation as a path-keyed [`Delta`], so
//! the heartbeat layer can ship incremental patches instead of full
//! snapshots. Peer documents are installed into the [`ClusterState`] by the
//! merger and read back through typed accessors.
//!
//! # Architecture
//!
//! ```text
//! ClusterState
//!   ├── StateTree (local NodeState, diff capture)
//!   ├── peers: nodename → serde_json::Value (installed peer NodeState)
//!   ├── GenerationTracker (acked / installed generation vector, diff log)
//!   └── liveness: peer → links currently beating
//! ```
//!
//! The generic `serde_json::Value` tree is only used at the outer layer.
//! Schema-known records (`InstanceMonitor`, `NodeMonitor`, `InstanceStatus`,
//! `Lock`) are typed and converted at the accessor boundary.

pub mod cluster;
pub mod error;
pub mod generation;
pub mod locks;
pub mod tree;
pub mod types;

pub use cluster::ClusterState;
pub use error::{StateError, StateResult};
pub use generation::{GenerationTracker, Selection};
pub use tree::{Delta, Diff, StateTree};
pub use types::*;
