//! Publisher — builds the outbound payload for a peer or a broadcast.
//!
//! Message selection is delegated to the [`GenerationTracker`]
//! (`hive_state::generation`). Full datasets are the expensive case: the
//! sealed payload is cached and reused across peers and links until the
//! local generation, or the generation vector it carries, changes. The
//! cache also expires after [`FULL_CACHE_TTL`]: receivers drop messages not
//! newer than the last one they accepted from us, so a full sealed long ago
//! would never install.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::trace;

use hive_state::{ClusterState, Selection, unix_now};

use crate::cipher::Cipher;
use crate::error::HeartbeatResult;
use crate::message::{Message, MessageKind};

/// Cluster identity stamped on every outbound payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterIdentity {
    pub name: String,
    pub id: String,
    pub compat: u32,
}

/// How long a sealed full dataset may be reused.
pub const FULL_CACHE_TTL: Duration = Duration::from_secs(1);

struct FullCache {
    key: Vec<u64>,
    sealed_at: Instant,
    payload: Bytes,
}

pub struct Publisher {
    cluster: Arc<ClusterState>,
    identity: ClusterIdentity,
    cipher: Arc<dyn Cipher>,
    full: Mutex<Option<FullCache>>,
    full_ttl: Duration,
}

impl Publisher {
    pub fn new(cluster: Arc<ClusterState>, identity: ClusterIdentity, cipher: Arc<dyn Cipher>) -> Self {
        Self {
            cluster,
            identity,
            cipher,
            full: Mutex::new(None),
            full_ttl: FULL_CACHE_TTL,
        }
    }

    pub fn with_full_cache_ttl(mut self, ttl: Duration) -> Self {
        self.full_ttl = ttl;
        self
    }

    pub fn identity(&self) -> &ClusterIdentity {
        &self.identity
    }

    pub fn cluster(&self) -> &Arc<ClusterState> {
        &self.cluster
    }

    /// Selection for one peer, or for every peer when `peer` is `None`.
    pub fn select(&self, peer: Option<&str>) -> Selection {
        let gens = self.cluster.generations();
        match peer {
            Some(peer) => gens.select(peer),
            None => gens.select_broadcast(&self.cluster.peer_names()),
        }
    }

    /// Build the plaintext message for a selection.
    pub fn message(&self, selection: Selection) -> Message {
        let nodes = self.cluster.nodes();
        let generations = self
            .cluster
            .generations()
            .gen_vector(self.cluster.local_name(), &nodes);
        let mut msg = Message {
            kind: MessageKind::Ping,
            compat: self.identity.compat,
            generations,
            updated: unix_now(),
            deltas: None,
            monitor: None,
            data: None,
        };
        match selection {
            Selection::Ping => {
                msg.monitor = Some(self.monitor_summary());
            }
            Selection::Full => {
                msg.kind = MessageKind::Full;
                msg.data = Some(self.cluster.local_tree().snapshot());
            }
            Selection::Patch { since } => {
                msg.kind = MessageKind::Patch;
                msg.deltas = Some(self.cluster.generations().deltas_since(since));
            }
        }
        msg
    }

    /// The sealed payload to send to `peer` (or to everyone).
    pub fn payload(&self, peer: Option<&str>) -> HeartbeatResult<Bytes> {
        let selection = self.select(peer);
        if selection == Selection::Full {
            return self.full_payload();
        }
        let msg = self.message(selection);
        trace!(peer = peer.unwrap_or("*"), kind = ?msg.kind, "payload built");
        self.seal(&msg)
    }

    fn full_payload(&self) -> HeartbeatResult<Bytes> {
        let msg = self.message(Selection::Full);
        let key: Vec<u64> = msg.generations.values().copied().collect();
        let mut cache = self.full.lock();
        let fresh = |c: &&FullCache| c.key == key && c.sealed_at.elapsed() < self.full_ttl;
        if let Some(cached) = cache.as_ref().filter(fresh) {
            return Ok(cached.payload.clone());
        }
        let payload = self.seal(&msg)?;
        *cache = Some(FullCache {
            key,
            sealed_at: Instant::now(),
            payload: payload.clone(),
        });
        trace!(size = payload.len(), "full payload cached");
        Ok(payload)
    }

    fn seal(&self, msg: &Message) -> HeartbeatResult<Bytes> {
        let plaintext = msg.encode()?;
        let sealed = self.cipher.encrypt(&self.identity.name, &plaintext)?;
        Ok(Bytes::from(sealed))
    }

    /// Node monitor without its per-instance records.
    fn monitor_summary(&self) -> Value {
        let mut monitor = self
            .cluster
            .local_tree()
            .get(&["monitor"])
            .unwrap_or_else(|| Value::Object(Default::default()));
        if let Some(map) = monitor.as_object_mut() {
            map.remove("services");
        }
        monitor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::ClearCipher;
    use serde_json::json;

    fn publisher() -> Publisher {
        let cluster = Arc::new(ClusterState::new("n1", &["n1".into(), "n2".into()]));
        let identity = ClusterIdentity {
            name: "prod".into(),
            id: "c0ffee".into(),
            compat: 12,
        };
        Publisher::new(cluster, identity, Arc::new(ClearCipher::new("n1", "prod")))
    }

    fn open(payload: &Bytes) -> Message {
        let opened = ClearCipher::new("n2", "prod").decrypt(payload).unwrap();
        Message::decode(&opened.plaintext).unwrap()
    }

    #[test]
    fn silent_peer_gets_ping_with_monitor_summary() {
        let p = publisher();
        let tree = p.cluster().local_tree();
        tree.set(&["monitor", "status"], json!("idle")).unwrap();
        tree.set(&["monitor", "services", "svc/web", "status"], json!("idle"))
            .unwrap();
        p.cluster().commit_local();

        let msg = open(&p.payload(Some("n2")).unwrap());
        assert_eq!(msg.kind, MessageKind::Ping);
        assert_eq!(msg.compat, 12);
        assert_eq!(msg.generation_of("n1"), 1);
        assert_eq!(msg.monitor, Some(json!({"status": "idle"})));
    }

    #[test]
    fn acknowledged_peer_gets_patch() {
        let p = publisher();
        let tree = p.cluster().local_tree();
        tree.set(&["labels", "az"], json!("a")).unwrap();
        p.cluster().commit_local();
        p.cluster().generations().set_acked("n2", 1);
        tree.set(&["labels", "az"], json!("b")).unwrap();
        p.cluster().commit_local();

        let msg = open(&p.payload(Some("n2")).unwrap());
        assert_eq!(msg.kind, MessageKind::Patch);
        let deltas = msg.deltas.unwrap();
        assert_eq!(deltas.keys().copied().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn full_payload_is_cached_until_local_change() {
        let p = publisher();
        p.cluster().local_tree().set(&["labels", "az"], json!("a")).unwrap();
        p.cluster().commit_local();
        p.cluster().generations().set_acked("n2", 0);

        let first = p.payload(Some("n2")).unwrap();
        let second = p.payload(None).unwrap();
        assert_eq!(first.as_ptr(), second.as_ptr());

        p.cluster().local_tree().set(&["labels", "az"], json!("b")).unwrap();
        p.cluster().commit_local();
        let third = p.payload(Some("n2")).unwrap();
        assert_ne!(first, third);
        let msg = open(&third);
        assert_eq!(msg.kind, MessageKind::Full);
        assert_eq!(msg.data.unwrap()["labels"]["az"], json!("b"));
    }

    #[test]
    fn expired_full_payload_is_resealed_with_a_newer_send_time() {
        let p = publisher().with_full_cache_ttl(Duration::ZERO);
        p.cluster().local_tree().set(&["labels", "az"], json!("a")).unwrap();
        p.cluster().commit_local();
        p.cluster().generations().set_acked("n2", 0);

        let first = open(&p.payload(Some("n2")).unwrap());
        std::thread::sleep(Duration::from_millis(2));
        let second = open(&p.payload(Some("n2")).unwrap());
        assert_eq!(second.kind, MessageKind::Full);
        assert!(second.updated > first.updated);
    }
}
