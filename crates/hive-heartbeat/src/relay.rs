//! Relay transport.
//!
//! Nodes that share neither a network segment nor a disk exchange
//! heartbeats through a relay service. Each node posts its sealed payload
//! to `/relay_tx`; the relay keeps the latest payload per node and returns
//! it on `/relay_rx`:
//!
//! ```text
//! POST /relay_tx {"cluster_name", "cluster_id", "nodename", "msg": <base64>}
//!             →  {"status": 0}
//! POST /relay_rx {"cluster_id", "slot": <nodename>}
//!             →  {"status": 0, "updated": <unix secs>, "data": <base64>}
//! ```
//!
//! A non-zero `status` is a relay-side failure.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use hive_state::{ClusterState, NodeName, unix_now};

use crate::config::{LinkConfig, RelayConfig, TransportConfig};
use crate::error::{HeartbeatError, HeartbeatResult};
use crate::link::{Datagram, Receive, Transmit, TxMode};
use crate::publisher::ClusterIdentity;

#[derive(Debug, Serialize, Deserialize)]
pub struct RelayTxRequest {
    pub cluster_name: String,
    pub cluster_id: String,
    pub nodename: NodeName,
    pub msg: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RelayRxRequest {
    pub cluster_id: String,
    pub slot: NodeName,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RelayResponse {
    pub status: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

fn relay_config(config: &LinkConfig) -> HeartbeatResult<RelayConfig> {
    match &config.transport {
        TransportConfig::Relay(r) => Ok(r.clone()),
        other => Err(HeartbeatError::Config(format!(
            "{}: expected relay transport, got {}",
            config.name,
            other.kind()
        ))),
    }
}

/// POST `body` as JSON to `http://{address}{path}` and decode the reply.
pub async fn post_json<B: Serialize, R: DeserializeOwned>(
    address: &str,
    path: &str,
    body: &B,
    timeout: Duration,
) -> HeartbeatResult<R> {
    let uri = format!("http://{address}{path}");
    let payload = Bytes::from(serde_json::to_vec(body)?);

    let exchange = async {
        let stream = tokio::net::TcpStream::connect(address).await?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| HeartbeatError::Http(e.to_string()))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method("POST")
            .uri(&uri)
            .header("host", address)
            .header("content-type", "application/json")
            .header("user-agent", "hive-heartbeat/0.1")
            .body(Full::new(payload))
            .map_err(|e| HeartbeatError::Http(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| HeartbeatError::Http(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(HeartbeatError::Http(format!("{uri}: {}", resp.status())));
        }
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| HeartbeatError::Http(e.to_string()))?
            .to_bytes();
        Ok(serde_json::from_slice(&body)?)
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => Err(HeartbeatError::Timeout(uri)),
    }
}

fn check_status(resp: &RelayResponse) -> HeartbeatResult<()> {
    if resp.status != 0 {
        return Err(HeartbeatError::Relay {
            status: resp.status,
            message: resp.error.clone().unwrap_or_default(),
        });
    }
    Ok(())
}

pub struct RelayTx {
    relay: String,
    timeout: Duration,
    identity: ClusterIdentity,
    local: NodeName,
}

impl RelayTx {
    pub fn new(config: &LinkConfig, identity: ClusterIdentity, local: impl Into<NodeName>) -> HeartbeatResult<Self> {
        Ok(Self {
            relay: relay_config(config)?.relay,
            timeout: config.receive_budget(),
            identity,
            local: local.into(),
        })
    }
}

impl Transmit for RelayTx {
    fn mode(&self) -> TxMode {
        TxMode::Broadcast
    }

    async fn transmit(&mut self, _peer: Option<&str>, payload: Bytes) -> HeartbeatResult<()> {
        let request = RelayTxRequest {
            cluster_name: self.identity.name.clone(),
            cluster_id: self.identity.id.clone(),
            nodename: self.local.clone(),
            msg: STANDARD.encode(&payload),
        };
        let resp: RelayResponse = post_json(&self.relay, "/relay_tx", &request, self.timeout).await?;
        check_status(&resp)
    }

    fn reconfigure(&mut self, config: &LinkConfig) -> HeartbeatResult<()> {
        self.relay = relay_config(config)?.relay;
        self.timeout = config.receive_budget();
        Ok(())
    }
}

pub struct RelayRx {
    relay: String,
    timeout: Duration,
    max_age: Duration,
    cluster_id: String,
    cluster: Arc<ClusterState>,
    last_updated: HashMap<NodeName, f64>,
}

impl RelayRx {
    pub fn new(config: &LinkConfig, cluster_id: impl Into<String>, cluster: Arc<ClusterState>) -> HeartbeatResult<Self> {
        Ok(Self {
            relay: relay_config(config)?.relay,
            timeout: config.receive_budget(),
            max_age: config.timeout,
            cluster_id: cluster_id.into(),
            cluster,
            last_updated: HashMap::new(),
        })
    }

    async fn fetch(&self, peer: &str) -> HeartbeatResult<RelayResponse> {
        let request = RelayRxRequest {
            cluster_id: self.cluster_id.clone(),
            slot: peer.to_string(),
        };
        let resp: RelayResponse = post_json(&self.relay, "/relay_rx", &request, self.timeout).await?;
        check_status(&resp)?;
        Ok(resp)
    }
}

impl Receive for RelayRx {
    fn polling(&self) -> bool {
        true
    }

    async fn receive(&mut self) -> HeartbeatResult<Vec<Datagram>> {
        let mut datagrams = Vec::new();
        let mut failures = 0;
        let peers = self.cluster.peer_names();
        for peer in &peers {
            let resp = match self.fetch(peer).await {
                Ok(resp) => resp,
                Err(e) => {
                    debug!(relay = %self.relay, %peer, error = %e, "relay fetch failed");
                    failures += 1;
                    continue;
                }
            };
            let (Some(updated), Some(data)) = (resp.updated, resp.data) else {
                continue;
            };
            if self.last_updated.get(peer) == Some(&updated) {
                continue;
            }
            self.last_updated.insert(peer.clone(), updated);
            if unix_now() - updated > self.max_age.as_secs_f64() {
                debug!(%peer, "stale relay data ignored");
                continue;
            }
            match STANDARD.decode(data.as_bytes()) {
                Ok(payload) => datagrams.push(Datagram {
                    payload: Bytes::from(payload),
                    origin: format!("{}/{peer}", self.relay),
                }),
                Err(e) => debug!(%peer, error = %e, "undecodable relay data"),
            }
        }
        // Only a relay unreachable for every peer is a link failure.
        if !peers.is_empty() && failures == peers.len() {
            return Err(HeartbeatError::Http(format!("relay {} unreachable", self.relay)));
        }
        Ok(datagrams)
    }

    fn reconfigure(&mut self, config: &LinkConfig) -> HeartbeatResult<()> {
        self.relay = relay_config(config)?.relay;
        self.timeout = config.receive_budget();
        self.max_age = config.timeout;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_response_tolerates_missing_fields() {
        let resp: RelayResponse = serde_json::from_str(r#"{"status": 0}"#).unwrap();
        assert!(check_status(&resp).is_ok());
        assert!(resp.data.is_none());
    }

    #[test]
    fn nonzero_status_is_an_error() {
        let resp: RelayResponse =
            serde_json::from_str(r#"{"status": 2, "error": "unknown cluster"}"#).unwrap();
        match check_status(&resp) {
            Err(HeartbeatError::Relay { status, message }) => {
                assert_eq!(status, 2);
                assert_eq!(message, "unknown cluster");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn post_to_closed_port_fails() {
        let result: HeartbeatResult<RelayResponse> = post_json(
            "127.0.0.1:1",
            "/relay_rx",
            &RelayRxRequest {
                cluster_id: "c".into(),
                slot: "n2".into(),
            },
            Duration::from_millis(200),
        )
        .await;
        assert!(result.is_err());
    }
}
