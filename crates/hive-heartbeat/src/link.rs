//! Transport traits and the driver loops shared by every link.
//!
//! ```text
//!           ┌──────────── tx task ────────────┐
//! Publisher ─▶ payload(peer|*) ─▶ Transmit ──▶ wire
//!           └─────────────────────────────────┘
//!           ┌──────────── rx task ────────────┐
//! wire ──▶ Receive ─▶ Cipher ─▶ Message ──────┼──▶ merger queue
//!                        └─▶ PeerLiveness ────┼──▶ ClusterState beating
//!           └─────────────────────────────────┘
//! ```
//!
//! tx and rx of a link are independent tasks. Both re-read the link
//! configuration at the top of each iteration and stop on the shared
//! shutdown signal. Transient errors are logged on liveness transitions and
//! never end the loop.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::{Notify, broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use hive_state::{ClusterState, NodeName};

use crate::cipher::Cipher;
use crate::config::LinkConfig;
use crate::error::{HeartbeatError, HeartbeatResult};
use crate::events::ClusterEvent;
use crate::liveness::{PeerLiveness, Transition, TxHealth};
use crate::message::{Inbound, Message};
use crate::publisher::Publisher;

/// Whether a transport sends one payload for everyone or one per peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    Broadcast,
    PerPeer,
}

/// Sending half of a transport.
pub trait Transmit: Send {
    fn mode(&self) -> TxMode;

    /// Send `payload`, to `peer` for per-peer transports.
    fn transmit(&mut self, peer: Option<&str>, payload: Bytes) -> impl Future<Output = HeartbeatResult<()>> + Send;

    /// Apply a configuration reload.
    fn reconfigure(&mut self, _config: &LinkConfig) -> HeartbeatResult<()> {
        Ok(())
    }
}

/// A raw payload as received, before decryption.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub payload: Bytes,
    /// Transport-level origin (socket address, disk slot name, ...).
    pub origin: String,
}

/// Receiving half of a transport.
pub trait Receive: Send {
    /// Polling transports are read once per interval; the others block in
    /// `receive` until data arrives.
    fn polling(&self) -> bool {
        false
    }

    fn receive(&mut self) -> impl Future<Output = HeartbeatResult<Vec<Datagram>>> + Send;

    fn reconfigure(&mut self, _config: &LinkConfig) -> HeartbeatResult<()> {
        Ok(())
    }
}

/// What a tx task needs besides its transport.
pub struct TxContext {
    pub publisher: Arc<Publisher>,
    pub config: watch::Receiver<LinkConfig>,
    /// Notified after a local commit to send sooner than the interval.
    pub wake: Arc<Notify>,
    pub shutdown: watch::Receiver<bool>,
}

/// What an rx task needs besides its transport.
pub struct RxContext {
    pub cluster: Arc<ClusterState>,
    pub cipher: Arc<dyn Cipher>,
    pub config: watch::Receiver<LinkConfig>,
    pub inbound: mpsc::Sender<Inbound>,
    pub events: broadcast::Sender<ClusterEvent>,
    pub shutdown: watch::Receiver<bool>,
}

/// Read the current config, reconfiguring the transport when it changed.
fn current_config(
    rx: &mut watch::Receiver<LinkConfig>,
    apply: impl FnOnce(&LinkConfig) -> HeartbeatResult<()>,
) -> LinkConfig {
    let changed = rx.has_changed().unwrap_or(false);
    let config = rx.borrow_and_update().clone();
    if changed {
        match apply(&config) {
            Ok(()) => info!(link = %config.name, "link configuration reloaded"),
            Err(e) => warn!(link = %config.name, error = %e, "link reconfiguration failed"),
        }
    }
    config
}

/// Drive the sending half of a link until shutdown.
pub async fn run_tx<T: Transmit>(mut tx: T, mut ctx: TxContext) {
    let mut health = TxHealth::new();
    let name = ctx.config.borrow().name.clone();
    info!(link = %name, mode = ?tx.mode(), "heartbeat tx started");

    loop {
        let config = current_config(&mut ctx.config, |c| tx.reconfigure(c));
        if *ctx.shutdown.borrow() {
            break;
        }

        match tx.mode() {
            TxMode::Broadcast => {
                let result = match ctx.publisher.payload(None) {
                    Ok(payload) => tx.transmit(None, payload).await,
                    Err(e) => Err(e),
                };
                report_tx(&mut health, &config.name, "*", result);
            }
            TxMode::PerPeer => {
                for peer in ctx.publisher.cluster().peer_names() {
                    let result = match ctx.publisher.payload(Some(&peer)) {
                        Ok(payload) => tx.transmit(Some(&peer), payload).await,
                        Err(e) => Err(e),
                    };
                    report_tx(&mut health, &config.name, &peer, result);
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(config.interval) => {}
            _ = ctx.wake.notified() => {}
            _ = ctx.shutdown.changed() => break,
        }
    }
    info!(link = %name, "heartbeat tx stopped");
}

fn report_tx(health: &mut TxHealth, link: &str, dest: &str, result: HeartbeatResult<()>) {
    let error = result.as_ref().err().map(ToString::to_string);
    match health.record(dest, result.is_ok()) {
        Some(true) => info!(%link, %dest, "send recovered"),
        Some(false) => warn!(%link, %dest, error = error.as_deref().unwrap_or(""), "send failing"),
        None => {}
    }
}

/// Drive the receiving half of a link until shutdown.
pub async fn run_rx<R: Receive>(mut rx: R, mut ctx: RxContext) {
    let name = ctx.config.borrow().name.clone();
    let mut liveness = PeerLiveness::new(ctx.config.borrow().timeout);
    let mut failing = false;
    info!(link = %name, "heartbeat rx started");

    loop {
        let config = current_config(&mut ctx.config, |c| rx.reconfigure(c));
        liveness.set_timeout(config.timeout);
        if *ctx.shutdown.borrow() {
            break;
        }

        if rx.polling() {
            tokio::select! {
                _ = tokio::time::sleep(config.interval) => {}
                _ = ctx.shutdown.changed() => break,
            }
        }

        let received = tokio::select! {
            r = tokio::time::timeout(config.receive_budget(), rx.receive()) => r,
            _ = ctx.shutdown.changed() => break,
        };
        match received {
            Ok(Ok(datagrams)) => {
                if failing {
                    info!(link = %name, "receive recovered");
                    failing = false;
                }
                for datagram in datagrams {
                    if let Some(sender) = dispatch(&ctx, &name, datagram).await {
                        if liveness.record(&sender, Instant::now()) == Some(Transition::Beating) {
                            mark(&ctx, &name, &sender, true);
                        }
                    }
                }
            }
            Ok(Err(HeartbeatError::Closed)) => {
                warn!(link = %name, "transport closed");
                break;
            }
            Ok(Err(e)) => {
                if !failing {
                    warn!(link = %name, error = %e, "receive failing");
                    failing = true;
                } else {
                    debug!(link = %name, error = %e, "receive failed");
                }
            }
            // Budget elapsed without traffic.
            Err(_) => {}
        }

        for peer in liveness.sweep(Instant::now()) {
            mark(&ctx, &name, &peer, false);
        }
    }

    ctx.cluster.forget_link(&name);
    info!(link = %name, "heartbeat rx stopped");
}

fn mark(ctx: &RxContext, link: &str, peer: &str, beating: bool) {
    ctx.cluster.set_beating(link, peer, beating);
    let event = if beating {
        info!(%link, %peer, "peer beating");
        ClusterEvent::PeerBeating {
            link: link.to_string(),
            peer: peer.to_string(),
        }
    } else {
        warn!(%link, %peer, "peer stale");
        ClusterEvent::PeerStale {
            link: link.to_string(),
            peer: peer.to_string(),
        }
    };
    let _ = ctx.events.send(event);
}

/// Decrypt and decode one datagram and queue it for the merger. Returns
/// the sender when the exchange counts for liveness.
async fn dispatch(ctx: &RxContext, link: &str, datagram: Datagram) -> Option<NodeName> {
    let inbound = match decode(ctx, link, &datagram.payload) {
        Ok(inbound) => inbound,
        Err(e) => {
            debug!(%link, origin = %datagram.origin, error = %e, "undecodable payload dropped");
            return None;
        }
    };
    if inbound.sender == ctx.cluster.local_name() {
        return None;
    }
    let sender = inbound.sender.clone();
    let member = ctx.cluster.is_member(&sender);
    if ctx.inbound.send(inbound).await.is_err() {
        debug!(%link, "merger queue closed");
        return None;
    }
    member.then_some(sender)
}

fn decode(ctx: &RxContext, link: &str, payload: &[u8]) -> HeartbeatResult<Inbound> {
    let opened = ctx.cipher.decrypt(payload)?;
    let message = Message::decode(&opened.plaintext)?;
    Ok(Inbound {
        sender: opened.sender,
        link: link.to_string(),
        message,
    })
}
