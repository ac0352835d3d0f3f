//! Payload encryption boundary.
//!
//! Transports only ever see ciphertext. The [`Cipher`] implementation owns
//! the framing that carries the sender identity and the cluster name, so
//! the receive path learns who sent a payload only after decryption.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use hive_state::NodeName;

use crate::error::{HeartbeatError, HeartbeatResult};

/// A decrypted payload and its claimed origin.
#[derive(Debug, Clone, PartialEq)]
pub struct Decrypted {
    pub sender: NodeName,
    pub cluster: String,
    pub plaintext: Vec<u8>,
}

pub trait Cipher: Send + Sync {
    /// Seal `plaintext` for the members of `cluster`.
    fn encrypt(&self, cluster: &str, plaintext: &[u8]) -> HeartbeatResult<Vec<u8>>;

    /// Open a payload. Payloads addressed to another cluster are rejected.
    fn decrypt(&self, ciphertext: &[u8]) -> HeartbeatResult<Decrypted>;
}

#[derive(Serialize, Deserialize)]
struct ClearFrame {
    clustername: String,
    nodename: NodeName,
    data: String,
}

/// Unencrypted framing, for trusted networks and tests.
#[derive(Debug, Clone)]
pub struct ClearCipher {
    nodename: NodeName,
    cluster: String,
}

impl ClearCipher {
    pub fn new(nodename: impl Into<NodeName>, cluster: impl Into<String>) -> Self {
        Self {
            nodename: nodename.into(),
            cluster: cluster.into(),
        }
    }
}

impl Cipher for ClearCipher {
    fn encrypt(&self, cluster: &str, plaintext: &[u8]) -> HeartbeatResult<Vec<u8>> {
        let frame = ClearFrame {
            clustername: cluster.to_string(),
            nodename: self.nodename.clone(),
            data: STANDARD.encode(plaintext),
        };
        serde_json::to_vec(&frame).map_err(|e| HeartbeatError::Cipher(e.to_string()))
    }

    fn decrypt(&self, ciphertext: &[u8]) -> HeartbeatResult<Decrypted> {
        let frame: ClearFrame =
            serde_json::from_slice(ciphertext).map_err(|e| HeartbeatError::Cipher(e.to_string()))?;
        if frame.clustername != self.cluster {
            return Err(HeartbeatError::Decode(format!(
                "message for cluster '{}' from {}",
                frame.clustername, frame.nodename
            )));
        }
        let plaintext = STANDARD.decode(frame.data.as_bytes())?;
        Ok(Decrypted {
            sender: frame.nodename,
            cluster: frame.clustername,
            plaintext,
        })
    }
}
