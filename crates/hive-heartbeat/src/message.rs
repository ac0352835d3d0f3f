//! The wire envelope shared by every transport, before encryption.
//!
//! ```text
//! { "kind": "ping" | "patch" | "full",
//!   "compat": 12,
//!   "gen": { "<nodename>": <int>, ... },
//!   "updated": <unix float>,
//!   "deltas":  { "<gen>": [[path, value], ...] },   // patch only
//!   "monitor": { ... },                              // ping only
//!   "data":    { ... } }                             // full only
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use hive_state::{Delta, NodeName};

use crate::error::HeartbeatResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Ping,
    Patch,
    Full,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    #[serde(default)]
    pub compat: u32,
    /// Sender's generation plus the generation it installed from each peer.
    #[serde(rename = "gen", default)]
    pub generations: BTreeMap<NodeName, u64>,
    #[serde(default)]
    pub updated: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deltas: Option<BTreeMap<u64, Vec<Delta>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Message {
    /// Generation the message reports for `node`, 0 when absent.
    pub fn generation_of(&self, node: &str) -> u64 {
        self.generations.get(node).copied().unwrap_or(0)
    }

    pub fn encode(&self) -> HeartbeatResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> HeartbeatResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// A decoded message together with where it came from.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub sender: NodeName,
    pub link: String,
    pub message: Message,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn patch_wire_format() {
        let mut deltas = BTreeMap::new();
        deltas.insert(3, vec![Delta::set(&["monitor", "status"], json!("idle"))]);
        let msg = Message {
            kind: MessageKind::Patch,
            compat: 12,
            generations: BTreeMap::from([("n1".to_string(), 3), ("n2".to_string(), 8)]),
            updated: 1.5,
            deltas: Some(deltas),
            monitor: None,
            data: None,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "kind": "patch",
                "compat": 12,
                "gen": {"n1": 3, "n2": 8},
                "updated": 1.5,
                "deltas": {"3": [[["monitor", "status"], "idle"]]},
            })
        );
        assert_eq!(Message::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn missing_generation_reads_zero() {
        let msg = Message::decode(br#"{"kind":"ping","gen":{"n1":4}}"#).unwrap();
        assert_eq!(msg.kind, MessageKind::Ping);
        assert_eq!(msg.generation_of("n1"), 4);
        assert_eq!(msg.generation_of("n2"), 0);
    }

    #[test]
    fn rejects_unknown_kind() {
        assert!(Message::decode(br#"{"kind":"bogus"}"#).is_err());
    }
}
