//! hive-monitor — per-object orchestration from the merged cluster state.
//!
//! Every node runs the same engine over its own copy of the cluster state.
//! For each object the engine decides, on its own, whether the local
//! instance must act: a manual handler when an operator set a global
//! expect, an automatic policy otherwise. Ties are broken by the placement
//! ranking, which every node computes identically.
//!
//! # Architecture
//!
//! ```text
//! Monitor
//!   ├── ObjectView (local smon + instance, live peers, ranking, aggregate)
//!   ├── manual    (global expect → guarded steps → Decision)
//!   ├── auto      (failover / flex policies, restart budget)
//!   ├── scaler    (slave planning, config consensus, background job)
//!   └── collaborators
//!         ├── ActionRunner   start, stop, provision, …
//!         ├── Freezer        node and instance freeze flags
//!         ├── ConfigProvider object definitions
//!         └── StatusProvider local instance status refresh
//! ```
//!
//! A handler is a chain of guarded steps returning [`Step`]: the first
//! unmet guard defers the object with a reason, which is kept per object
//! and logged once when it changes.

pub mod aggregate;
pub mod auto;
pub mod collaborators;
pub mod config;
pub mod engine;
pub mod error;
pub mod manual;
pub mod scaler;
pub mod step;
#[doc(hidden)]
pub mod testing;
pub mod view;

pub use aggregate::{Aggregate, FrozenAgg, PlacementAgg, aggregate};
pub use collaborators::{Action, ActionRunner, BoxFuture, ConfigProvider, Freezer, StatusProvider};
pub use config::{MonitorConfig, ObjectConfig};
pub use engine::{ActionReport, CommitHook, Monitor, MonitorHandle};
pub use error::{MonitorError, MonitorResult};
pub use step::{Decision, Defer, Step};
pub use view::{ObjectView, PeerInstance};
