//! hive-heartbeat — cluster state dissemination and peer liveness.
//!
//! Each node periodically sends its state to its peers over one or more
//! links, and merges what it receives into the shared [`ClusterState`].
//! Only what a peer is missing goes on the wire: peers are tracked in a
//! generation vector, and a peer that acknowledged the previous generation
//! gets a patch instead of the full dataset.
//!
//! # Architecture
//!
//! ```text
//! HeartbeatService
//!   ├── Publisher (select ping / patch / full per peer, seal, cache full)
//!   ├── link × N
//!   │   ├── tx task: Transmit (multicast | unicast | disk | relay)
//!   │   └── rx task: Receive → Cipher → Message → PeerLiveness
//!   │                                      │
//!   │                                      ▼
//!   └── StateMerger ◀──────────── bounded inbound queue
//!         ├── install full / apply patch / record ping
//!         ├── request resync on generation gaps
//!         └── wake the orchestration engine
//! ```
//!
//! # Links
//!
//! - **multicast**: UDP group, payloads fragmented to fit a datagram
//! - **unicast**: one TCP connection per peer and interval
//! - **disk**: one slot per node on a shared block device
//! - **relay**: an HTTP relay service, for nodes with no shared medium
//!
//! A peer is beating while at least one link heard from it within that
//! link's timeout.

pub mod cipher;
pub mod config;
pub mod disk;
pub mod error;
pub mod events;
pub mod link;
pub mod liveness;
pub mod merger;
pub mod message;
pub mod multicast;
pub mod publisher;
pub mod relay;
pub mod service;
pub mod unicast;

pub use cipher::{Cipher, ClearCipher, Decrypted};
pub use config::{DiskConfig, LinkConfig, MulticastConfig, RelayConfig, TransportConfig, UnicastConfig};
pub use error::{HeartbeatError, HeartbeatResult};
pub use events::ClusterEvent;
pub use link::{Datagram, Receive, Transmit, TxMode};
pub use merger::{MergeOutcome, StateMerger};
pub use message::{Inbound, Message, MessageKind};
pub use publisher::{ClusterIdentity, Publisher};
pub use service::HeartbeatService;

pub use hive_state::ClusterState;
