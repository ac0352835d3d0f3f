//! StateMerger — the single writer of peer datasets.
//!
//! Every rx link pushes decoded messages into one bounded queue; the merger
//! drains it and applies messages one at a time, so merges never run
//! concurrently with each other.
//!
//! # Per-sender rules
//!
//! ```text
//! any    dropped unless updated > last accepted updated[sender]
//!        acked[sender] = gen[local]
//! ping   installed[sender] = 0, install the node monitor summary only
//! full   accepted when gen[sender] > installed[sender]; replaces the
//!        dataset, preserving instances while the sender boots
//! patch  dropped when installed[sender] == 0; generations already
//!        installed are skipped, the rest must continue installed+1
//!        without gaps, otherwise installed[sender] = 0 (resync)
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::{Notify, broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use hive_state::tree::apply_deltas;
use hive_state::{ClusterState, NodeMonitorStatus, NodeName};

use crate::events::ClusterEvent;
use crate::message::{Inbound, Message, MessageKind};

/// What applying one message did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    pub accepted: bool,
    pub changed: bool,
    pub resync_requested: bool,
    pub topology_changed: bool,
}

impl MergeOutcome {
    fn dropped() -> Self {
        Self::default()
    }

    fn resync() -> Self {
        Self {
            resync_requested: true,
            ..Self::default()
        }
    }
}

pub struct StateMerger {
    cluster: Arc<ClusterState>,
    compat: u32,
    events: broadcast::Sender<ClusterEvent>,
    wake: Arc<Notify>,
    /// Last warning logged per sender, to log each condition once.
    warned: HashMap<NodeName, String>,
    /// Send time of the newest message accepted per sender. Anything not
    /// newer is a replay or arrived late through a slower link.
    last_updated: HashMap<NodeName, f64>,
}

impl StateMerger {
    pub fn new(
        cluster: Arc<ClusterState>,
        compat: u32,
        events: broadcast::Sender<ClusterEvent>,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            cluster,
            compat,
            events,
            wake,
            warned: HashMap::new(),
            last_updated: HashMap::new(),
        }
    }

    /// Apply one inbound message.
    pub fn apply(&mut self, inbound: &Inbound) -> MergeOutcome {
        let sender = inbound.sender.as_str();
        if sender == self.cluster.local_name() {
            return MergeOutcome::dropped();
        }
        if !self.cluster.is_member(sender) {
            self.warn_once(sender, "sender is not a cluster member".to_string());
            return MergeOutcome::dropped();
        }
        if inbound.message.compat != self.compat {
            self.warn_once(
                sender,
                format!(
                    "incompatible protocol version {} (local {})",
                    inbound.message.compat, self.compat
                ),
            );
            return MergeOutcome::dropped();
        }
        self.warned.remove(sender);

        let updated = inbound.message.updated;
        if let Some(last) = self.last_updated.get(sender).filter(|last| updated <= **last) {
            debug!(peer = %sender, updated, last, kind = ?inbound.message.kind, "replayed or reordered message dropped");
            return MergeOutcome::dropped();
        }
        self.last_updated.insert(sender.to_string(), updated);

        // The vector carries what the sender installed from us, whatever
        // becomes of the rest of the message.
        self.cluster
            .generations()
            .set_acked(sender, inbound.message.generation_of(self.cluster.local_name()));

        let outcome = match inbound.message.kind {
            MessageKind::Ping => self.apply_ping(sender, &inbound.message),
            MessageKind::Full => self.apply_full(sender, &inbound.message),
            MessageKind::Patch => self.apply_patch(sender, &inbound.message),
        };
        if outcome.changed {
            self.wake.notify_one();
        }
        outcome
    }

    fn apply_ping(&mut self, sender: &str, msg: &Message) -> MergeOutcome {
        self.cluster.generations().set_installed(sender, 0);
        let summary = match &msg.monitor {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        };
        let changed = self.cluster.update_peer(sender, |data| {
            let Some(monitor) = ensure_map(data, &["monitor"]) else {
                return false;
            };
            let mut changed = false;
            for (key, value) in summary {
                if key == "services" {
                    continue;
                }
                if monitor.get(&key) != Some(&value) {
                    monitor.insert(key, value);
                    changed = true;
                }
            }
            changed
        });
        debug!(peer = %sender, changed, "ping merged");
        MergeOutcome {
            accepted: true,
            changed,
            ..MergeOutcome::default()
        }
    }

    fn apply_full(&mut self, sender: &str, msg: &Message) -> MergeOutcome {
        let their = msg.generation_of(sender);
        let installed = self.cluster.generations().installed(sender);
        if their <= installed {
            debug!(peer = %sender, generation = their, installed, "stale full dataset dropped");
            return MergeOutcome::dropped();
        }
        let Some(mut data) = msg.data.clone().filter(Value::is_object) else {
            warn!(peer = %sender, "full message without a dataset");
            return MergeOutcome::dropped();
        };

        let booting = data
            .pointer("/monitor/status")
            .cloned()
            .and_then(|v| serde_json::from_value::<NodeMonitorStatus>(v).ok())
            .unwrap_or_default();
        if booting.preserves_instances() {
            if let Some(previous) = self.cluster.peer_data(sender) {
                let kept = preserve_instances(&previous, &mut data);
                if kept > 0 {
                    debug!(peer = %sender, kept, status = ?booting, "instances preserved");
                }
            }
        }

        self.cluster.install_peer(sender, data);
        self.cluster.generations().set_installed(sender, their);
        info!(peer = %sender, generation = their, "full dataset installed");
        let _ = self.events.send(ClusterEvent::TopologyChanged {
            peer: sender.to_string(),
        });
        MergeOutcome {
            accepted: true,
            changed: true,
            resync_requested: false,
            topology_changed: true,
        }
    }

    fn apply_patch(&mut self, sender: &str, msg: &Message) -> MergeOutcome {
        let installed = self.cluster.generations().installed(sender);
        if installed == 0 {
            debug!(peer = %sender, "patch before any full dataset dropped");
            return MergeOutcome::dropped();
        }
        let Some(deltas) = msg.deltas.as_ref() else {
            return MergeOutcome::dropped();
        };

        let pending: Vec<_> = deltas.range(installed + 1..).collect();
        if pending.is_empty() {
            return MergeOutcome {
                accepted: true,
                ..MergeOutcome::default()
            };
        }

        let mut data = self
            .cluster
            .peer_data(sender)
            .unwrap_or_else(|| Value::Object(Map::new()));
        let mut expected = installed + 1;
        let mut changed = false;
        for (generation, deltas) in pending {
            if *generation != expected {
                let reason = format!("expected generation {expected}, got {generation}");
                return self.request_resync(sender, installed, reason);
            }
            if let Err(e) = apply_deltas(&mut data, deltas) {
                return self.request_resync(sender, installed, e.to_string());
            }
            changed |= !deltas.is_empty();
            expected += 1;
        }
        let applied = expected - 1;

        self.cluster.install_peer(sender, data);
        self.cluster.generations().set_installed(sender, applied);
        debug!(peer = %sender, from = installed, to = applied, "patch applied");
        MergeOutcome {
            accepted: true,
            changed,
            ..MergeOutcome::default()
        }
    }

    fn request_resync(&mut self, sender: &str, installed: u64, reason: String) -> MergeOutcome {
        self.cluster.generations().set_installed(sender, 0);
        info!(peer = %sender, installed, %reason, "patch rejected, full resync requested");
        MergeOutcome::resync()
    }

    fn warn_once(&mut self, sender: &str, reason: String) {
        if self.warned.get(sender) != Some(&reason) {
            warn!(peer = %sender, %reason, "message dropped");
            self.warned.insert(sender.to_string(), reason);
        }
    }

    /// Drain the inbound queue until it closes or shutdown is signalled.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<Inbound>, mut shutdown: watch::Receiver<bool>) {
        info!("state merger started");
        loop {
            tokio::select! {
                msg = inbound.recv() => match msg {
                    Some(msg) => {
                        self.apply(&msg);
                    }
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        info!("state merger stopped");
    }
}

/// Borrow the map at `path` under `value`, creating missing maps. Returns
/// `None` when something on the way is not a map.
fn ensure_map<'a>(value: &'a mut Value, path: &[&str]) -> Option<&'a mut Map<String, Value>> {
    let mut node = value;
    for key in path {
        node = node
            .as_object_mut()?
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    node.as_object_mut()
}

/// Copy instances (and their monitors) present in `previous` but missing
/// from `next` into `next`, flagged `preserved`. Returns how many were kept.
fn preserve_instances(previous: &Value, next: &mut Value) -> usize {
    let Some(old_status) = previous.pointer("/services/status").and_then(Value::as_object) else {
        return 0;
    };
    let old_smon = previous.pointer("/monitor/services").and_then(Value::as_object);

    let mut kept = 0;
    for (path, status) in old_status {
        let Some(new_status) = ensure_map(next, &["services", "status"]) else {
            break;
        };
        if new_status.contains_key(path) {
            continue;
        }
        let mut status = status.clone();
        if let Some(map) = status.as_object_mut() {
            map.insert("preserved".into(), Value::Bool(true));
        }
        new_status.insert(path.clone(), status);
        kept += 1;

        if let Some(smon) = old_smon.and_then(|m| m.get(path)) {
            if let Some(services) = ensure_map(next, &["monitor", "services"]) {
                services.entry(path.clone()).or_insert_with(|| smon.clone());
            }
        }
    }
    kept
}
