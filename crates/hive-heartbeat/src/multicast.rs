//! UDP multicast transport.
//!
//! Payloads larger than one datagram are split into fragments:
//!
//! ```text
//! { "id": "<random message id>", "i": <index>, "n": <total>, "chunk": "<base64>" }
//! ```
//!
//! The receiver reassembles per (sender address, message id). Memory is
//! bounded by caps on senders tracked, on messages tracked per sender and
//! on fragments per message. A new sender past the first cap evicts the
//! sender with the stalest partial messages; a new message past the second
//! purges that sender's oldest partial message. A
//! datagram that is not a fragment envelope is a legacy unfragmented
//! payload and is passed through as is.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::{Bytes, BytesMut};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::config::{LinkConfig, MulticastConfig, TransportConfig};
use crate::error::{HeartbeatError, HeartbeatResult};
use crate::link::{Datagram, Receive, Transmit, TxMode};

/// Raw bytes per fragment. Base64 and the envelope keep the datagram under
/// a 1500-byte MTU.
pub const CHUNK_SIZE: usize = 1000;
/// Senders with partial messages tracked at once.
pub const MAX_ORIGINS: usize = 64;
/// Partial messages tracked per sender before the oldest is purged.
pub const MAX_MESSAGES_PER_SENDER: usize = 10;
/// Largest fragment count accepted for one message.
pub const MAX_FRAGMENTS: usize = 1000;

const RECV_BUFFER: usize = 65536;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    pub id: String,
    pub i: usize,
    pub n: usize,
    pub chunk: String,
}

/// Split `payload` into fragment datagrams sharing one random id.
pub fn fragment(payload: &[u8]) -> HeartbeatResult<Vec<Vec<u8>>> {
    let id = format!("{:016x}", rand::thread_rng().r#gen::<u64>());
    let chunks: Vec<&[u8]> = if payload.is_empty() {
        vec![payload]
    } else {
        payload.chunks(CHUNK_SIZE).collect()
    };
    let n = chunks.len();
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            let frag = Fragment {
                id: id.clone(),
                i,
                n,
                chunk: STANDARD.encode(chunk),
            };
            Ok(serde_json::to_vec(&frag)?)
        })
        .collect()
}

struct Partial {
    n: usize,
    chunks: HashMap<usize, Bytes>,
    /// Arrival order of the first fragment.
    seq: u64,
}

/// Bounded fragment reassembly.
#[derive(Default)]
pub struct Reassembler {
    partial: HashMap<String, HashMap<String, Partial>>,
    seq: u64,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one datagram from `origin`. Returns a payload once complete.
    pub fn push(&mut self, origin: &str, datagram: &[u8]) -> Option<Bytes> {
        let Ok(frag) = serde_json::from_slice::<Fragment>(datagram) else {
            return Some(Bytes::copy_from_slice(datagram));
        };
        if frag.n == 0 || frag.n > MAX_FRAGMENTS || frag.i >= frag.n {
            debug!(%origin, id = %frag.id, i = frag.i, n = frag.n, "invalid fragment dropped");
            return None;
        }
        let chunk = match STANDARD.decode(frag.chunk.as_bytes()) {
            Ok(chunk) => Bytes::from(chunk),
            Err(e) => {
                debug!(%origin, error = %e, "undecodable fragment dropped");
                return None;
            }
        };
        if frag.n == 1 {
            return Some(chunk);
        }

        if !self.partial.contains_key(origin) && self.partial.len() >= MAX_ORIGINS {
            self.evict_stalest_origin();
        }
        let messages = self.partial.entry(origin.to_string()).or_default();
        if !messages.contains_key(&frag.id) && messages.len() >= MAX_MESSAGES_PER_SENDER {
            if let Some(oldest) = messages
                .iter()
                .min_by_key(|(_, p)| p.seq)
                .map(|(id, _)| id.clone())
            {
                messages.remove(&oldest);
                debug!(%origin, id = %oldest, "oldest partial message purged");
            }
        }
        self.seq += 1;
        let seq = self.seq;
        let partial = messages.entry(frag.id.clone()).or_insert_with(|| Partial {
            n: frag.n,
            chunks: HashMap::new(),
            seq,
        });
        if partial.n != frag.n {
            debug!(%origin, id = %frag.id, "fragment count mismatch, message dropped");
            messages.remove(&frag.id);
            return None;
        }
        partial.chunks.insert(frag.i, chunk);
        if partial.chunks.len() < partial.n {
            return None;
        }

        let partial = messages.remove(&frag.id)?;
        if messages.is_empty() {
            self.partial.remove(origin);
        }
        let mut out = BytesMut::new();
        for i in 0..partial.n {
            out.extend_from_slice(partial.chunks.get(&i)?);
        }
        Some(out.freeze())
    }

    /// Drop every partial message of the sender that was heard from least
    /// recently.
    fn evict_stalest_origin(&mut self) {
        let stalest = self
            .partial
            .iter()
            .min_by_key(|(_, messages)| messages.values().map(|p| p.seq).max().unwrap_or(0))
            .map(|(origin, _)| origin.clone());
        if let Some(origin) = stalest {
            self.partial.remove(&origin);
            debug!(%origin, "partial messages of the stalest sender purged");
        }
    }

    /// Senders with partial messages tracked.
    pub fn origins(&self) -> usize {
        self.partial.len()
    }

    /// Partial messages currently tracked for `origin`.
    pub fn pending(&self, origin: &str) -> usize {
        self.partial.get(origin).map_or(0, HashMap::len)
    }
}

fn multicast_config(config: &LinkConfig) -> HeartbeatResult<MulticastConfig> {
    match &config.transport {
        TransportConfig::Multicast(m) => Ok(m.clone()),
        other => Err(HeartbeatError::Config(format!(
            "{}: expected multicast transport, got {}",
            config.name,
            other.kind()
        ))),
    }
}

pub struct MulticastTx {
    socket: UdpSocket,
    group: SocketAddr,
}

impl MulticastTx {
    pub async fn bind(config: &LinkConfig) -> HeartbeatResult<Self> {
        let m = multicast_config(config)?;
        let local = SocketAddrV4::new(m.intf.unwrap_or(Ipv4Addr::UNSPECIFIED), 0);
        let socket = UdpSocket::bind(local).await?;
        socket.set_multicast_ttl_v4(32)?;
        socket.set_multicast_loop_v4(true)?;
        Ok(Self {
            socket,
            group: SocketAddr::V4(SocketAddrV4::new(m.addr, m.port)),
        })
    }
}

impl Transmit for MulticastTx {
    fn mode(&self) -> TxMode {
        TxMode::Broadcast
    }

    async fn transmit(&mut self, _peer: Option<&str>, payload: Bytes) -> HeartbeatResult<()> {
        for datagram in fragment(&payload)? {
            self.socket.send_to(&datagram, self.group).await?;
        }
        Ok(())
    }

    fn reconfigure(&mut self, config: &LinkConfig) -> HeartbeatResult<()> {
        let m = multicast_config(config)?;
        self.group = SocketAddr::V4(SocketAddrV4::new(m.addr, m.port));
        Ok(())
    }
}

pub struct MulticastRx {
    socket: UdpSocket,
    joined: MulticastConfig,
    reassembler: Reassembler,
    buf: Vec<u8>,
}

impl MulticastRx {
    pub async fn bind(config: &LinkConfig) -> HeartbeatResult<Self> {
        let m = multicast_config(config)?;
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, m.port)).await?;
        socket.join_multicast_v4(m.addr, m.intf.unwrap_or(Ipv4Addr::UNSPECIFIED))?;
        Ok(Self {
            socket,
            joined: m,
            reassembler: Reassembler::new(),
            buf: vec![0u8; RECV_BUFFER],
        })
    }
}

impl Receive for MulticastRx {
    async fn receive(&mut self) -> HeartbeatResult<Vec<Datagram>> {
        let (len, from) = self.socket.recv_from(&mut self.buf).await?;
        let origin = from.to_string();
        Ok(self
            .reassembler
            .push(&origin, &self.buf[..len])
            .map(|payload| Datagram { payload, origin })
            .into_iter()
            .collect())
    }

    fn reconfigure(&mut self, config: &LinkConfig) -> HeartbeatResult<()> {
        let m = multicast_config(config)?;
        if m.port != self.joined.port {
            warn!(link = %config.name, "multicast port change needs a link restart");
        }
        if m.addr != self.joined.addr || m.intf != self.joined.intf {
            let intf = self.joined.intf.unwrap_or(Ipv4Addr::UNSPECIFIED);
            self.socket.leave_multicast_v4(self.joined.addr, intf)?;
            self.socket
                .join_multicast_v4(m.addr, m.intf.unwrap_or(Ipv4Addr::UNSPECIFIED))?;
            self.joined.addr = m.addr;
            self.joined.intf = m.intf;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn fragments_fit_a_datagram() {
        let frags = fragment(&payload(4 * CHUNK_SIZE)).unwrap();
        assert_eq!(frags.len(), 4);
        assert!(frags.iter().all(|f| f.len() < 1472));
    }

    #[test]
    fn reassembles_out_of_order() {
        let data = payload(2500);
        let mut frags = fragment(&data).unwrap();
        frags.reverse();
        let mut r = Reassembler::new();
        assert!(r.push("10.0.0.2:1", &frags[0]).is_none());
        assert!(r.push("10.0.0.2:1", &frags[1]).is_none());
        assert_eq!(r.push("10.0.0.2:1", &frags[2]).unwrap(), data);
        assert_eq!(r.pending("10.0.0.2:1"), 0);
    }

    #[test]
    fn legacy_payload_passes_through() {
        let mut r = Reassembler::new();
        assert_eq!(r.push("a", b"not json").unwrap(), Bytes::from_static(b"not json"));
    }

    #[test]
    fn senders_are_reassembled_apart() {
        let data = payload(1500);
        let frags = fragment(&data).unwrap();
        let mut r = Reassembler::new();
        assert!(r.push("a", &frags[0]).is_none());
        assert!(r.push("b", &frags[1]).is_none());
        assert_eq!(r.pending("a"), 1);
        assert_eq!(r.pending("b"), 1);
    }

    #[test]
    fn oldest_partial_is_purged_at_cap() {
        let mut r = Reassembler::new();
        let mut first = None;
        for k in 0..=MAX_MESSAGES_PER_SENDER {
            let frags = fragment(&payload(1500)).unwrap();
            if k == 0 {
                first = Some(frags.clone());
            }
            r.push("a", &frags[0]);
        }
        assert_eq!(r.pending("a"), MAX_MESSAGES_PER_SENDER);
        // The first message was purged, so its last fragment completes nothing.
        let first = first.unwrap();
        assert!(r.push("a", &first[1]).is_none());
    }

    #[test]
    fn stalest_sender_is_evicted_at_origin_cap() {
        let mut r = Reassembler::new();
        let kept = fragment(&payload(1500)).unwrap();
        r.push("10.0.0.1:1", &fragment(&payload(1500)).unwrap()[0]);
        for k in 2..=MAX_ORIGINS {
            r.push(&format!("10.0.0.{k}:1"), &fragment(&payload(1500)).unwrap()[0]);
        }
        r.push("10.0.0.2:1", &kept[0]);
        assert_eq!(r.origins(), MAX_ORIGINS);

        r.push("192.0.2.1:1", &fragment(&payload(1500)).unwrap()[0]);
        assert_eq!(r.origins(), MAX_ORIGINS);
        assert_eq!(r.pending("10.0.0.1:1"), 0);
        assert_eq!(r.pending("192.0.2.1:1"), 1);
        assert_eq!(r.push("10.0.0.2:1", &kept[1]).map(|b| b.len()), Some(1500));
    }

    #[test]
    fn oversized_fragment_count_is_rejected() {
        let frag = Fragment {
            id: "x".into(),
            i: 0,
            n: MAX_FRAGMENTS + 1,
            chunk: STANDARD.encode(b"a"),
        };
        let mut r = Reassembler::new();
        assert!(r.push("a", &serde_json::to_vec(&frag).unwrap()).is_none());
        assert_eq!(r.pending("a"), 0);
    }
}
