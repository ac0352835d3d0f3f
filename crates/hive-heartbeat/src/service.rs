//! Heartbeat service — owns the links and the state merger.
//!
//! Each started link runs a tx task and an rx task built for its transport;
//! the rx tasks of every link feed one bounded queue drained by a single
//! [`StateMerger`]. A link that fails to configure or bind is reported to
//! the caller and leaves the other links running.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, RwLock, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use hive_state::ClusterState;

use crate::cipher::Cipher;
use crate::config::{LinkConfig, TransportConfig};
use crate::disk::{DiskRx, DiskTx};
use crate::error::HeartbeatResult;
use crate::events::{ClusterEvent, EVENT_CAPACITY};
use crate::link::{Receive, RxContext, Transmit, TxContext, run_rx, run_tx};
use crate::merger::StateMerger;
use crate::message::Inbound;
use crate::multicast::{MulticastRx, MulticastTx};
use crate::publisher::{ClusterIdentity, Publisher};
use crate::relay::{RelayRx, RelayTx};
use crate::unicast::{UnicastRx, UnicastTx};

/// Capacity of the queue between the rx tasks and the merger.
pub const INBOUND_CAPACITY: usize = 1024;

/// How long shutdown waits for a task before aborting it.
const STOP_GRACE: Duration = Duration::from_secs(5);

struct LinkSlot {
    config_tx: watch::Sender<LinkConfig>,
    shutdown_tx: watch::Sender<bool>,
    tx: JoinHandle<()>,
    rx: JoinHandle<()>,
}

struct MergerSlot {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct HeartbeatService {
    cluster: Arc<ClusterState>,
    publisher: Arc<Publisher>,
    cipher: Arc<dyn Cipher>,
    inbound_tx: mpsc::Sender<Inbound>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Inbound>>>,
    events: broadcast::Sender<ClusterEvent>,
    /// Notified by the merger when peer data changed.
    monitor_wake: Arc<Notify>,
    /// Notified after a local commit so tx tasks send early.
    tx_wake: Arc<Notify>,
    links: RwLock<HashMap<String, LinkSlot>>,
    merger: Mutex<Option<MergerSlot>>,
}

impl HeartbeatService {
    pub fn new(cluster: Arc<ClusterState>, identity: ClusterIdentity, cipher: Arc<dyn Cipher>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let publisher = Arc::new(Publisher::new(cluster.clone(), identity, cipher.clone()));
        Self {
            cluster,
            publisher,
            cipher,
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            events,
            monitor_wake: Arc::new(Notify::new()),
            tx_wake: Arc::new(Notify::new()),
            links: RwLock::new(HashMap::new()),
            merger: Mutex::new(None),
        }
    }

    pub fn cluster(&self) -> &Arc<ClusterState> {
        &self.cluster
    }

    pub fn publisher(&self) -> &Arc<Publisher> {
        &self.publisher
    }

    /// Subscribe to liveness and topology events.
    pub fn events(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    /// Signal raised whenever a merge changed peer data.
    pub fn monitor_wake(&self) -> Arc<Notify> {
        self.monitor_wake.clone()
    }

    /// Ask every tx task to send now rather than at its next interval.
    pub fn wake_tx(&self) {
        self.tx_wake.notify_waiters();
    }

    /// Start the merger. Calling it again is a no-op.
    pub fn spawn_merger(&self) {
        let Some(inbound) = self.inbound_rx.lock().take() else {
            debug!("state merger already running");
            return;
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let merger = StateMerger::new(
            self.cluster.clone(),
            self.publisher.identity().compat,
            self.events.clone(),
            self.monitor_wake.clone(),
        );
        let handle = tokio::spawn(merger.run(inbound, shutdown_rx));
        *self.merger.lock() = Some(MergerSlot { shutdown_tx, handle });
    }

    /// Start a link, or hand a new configuration to the running link of the
    /// same name. A transport change restarts the link.
    pub async fn start_link(&self, config: LinkConfig) -> HeartbeatResult<()> {
        config.validate()?;
        {
            let links = self.links.read().await;
            if let Some(slot) = links.get(&config.name) {
                let same_kind = slot.config_tx.borrow().transport.kind() == config.transport.kind();
                if same_kind {
                    if *slot.config_tx.borrow() != config {
                        let _ = slot.config_tx.send(config);
                    }
                    return Ok(());
                }
            }
        }
        self.stop_link(&config.name).await;

        let local = self.cluster.local_name().to_string();
        let identity = self.publisher.identity().clone();
        let transport = config.transport.clone();
        match transport {
            TransportConfig::Multicast(_) => {
                let tx = MulticastTx::bind(&config).await?;
                let rx = MulticastRx::bind(&config).await?;
                self.spawn_link(config, tx, rx).await;
            }
            TransportConfig::Unicast(_) => {
                let tx = UnicastTx::new(&config)?;
                let rx = UnicastRx::bind(&config, self.cluster.peer_names().len()).await?;
                self.spawn_link(config, tx, rx).await;
            }
            TransportConfig::Disk(_) => {
                let tx = DiskTx::new(&config, local)?;
                let rx = DiskRx::new(&config, self.cluster.clone())?;
                self.spawn_link(config, tx, rx).await;
            }
            TransportConfig::Relay(_) => {
                let cluster_id = identity.id.clone();
                let tx = RelayTx::new(&config, identity, local)?;
                let rx = RelayRx::new(&config, cluster_id, self.cluster.clone())?;
                self.spawn_link(config, tx, rx).await;
            }
        }
        Ok(())
    }

    async fn spawn_link<T, R>(&self, config: LinkConfig, tx: T, rx: R)
    where
        T: Transmit + 'static,
        R: Receive + 'static,
    {
        let name = config.name.clone();
        let kind = config.transport.kind();
        let (config_tx, config_rx) = watch::channel(config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let tx = tokio::spawn(run_tx(
            tx,
            TxContext {
                publisher: self.publisher.clone(),
                config: config_rx.clone(),
                wake: self.tx_wake.clone(),
                shutdown: shutdown_rx.clone(),
            },
        ));
        let rx = tokio::spawn(run_rx(
            rx,
            RxContext {
                cluster: self.cluster.clone(),
                cipher: self.cipher.clone(),
                config: config_rx,
                inbound: self.inbound_tx.clone(),
                events: self.events.clone(),
                shutdown: shutdown_rx,
            },
        ));

        self.links.write().await.insert(
            name.clone(),
            LinkSlot {
                config_tx,
                shutdown_tx,
                tx,
                rx,
            },
        );
        info!(link = %name, %kind, "heartbeat link started");
    }

    /// Stop one link. Returns whether it was running.
    pub async fn stop_link(&self, name: &str) -> bool {
        let slot = self.links.write().await.remove(name);
        match slot {
            Some(slot) => {
                stop_slot(name, slot).await;
                info!(link = %name, "heartbeat link stopped");
                true
            }
            None => false,
        }
    }

    /// Names of the running links, sorted.
    pub async fn links(&self) -> Vec<String> {
        let mut names: Vec<String> = self.links.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop every link, then the merger.
    pub async fn shutdown(&self) {
        let slots: Vec<(String, LinkSlot)> = self.links.write().await.drain().collect();
        for (name, slot) in slots {
            stop_slot(&name, slot).await;
        }
        let merger = self.merger.lock().take();
        if let Some(merger) = merger {
            let _ = merger.shutdown_tx.send(true);
            join_or_abort("merger", merger.handle).await;
        }
        info!("heartbeat service stopped");
    }
}

async fn stop_slot(name: &str, slot: LinkSlot) {
    let _ = slot.shutdown_tx.send(true);
    join_or_abort(name, slot.tx).await;
    join_or_abort(name, slot.rx).await;
}

async fn join_or_abort(what: &str, handle: JoinHandle<()>) {
    let abort = handle.abort_handle();
    match tokio::time::timeout(STOP_GRACE, handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(task = %what, error = %e, "heartbeat task ended abnormally"),
        Err(_) => {
            warn!(task = %what, "heartbeat task did not stop in time, aborting");
            abort.abort();
        }
    }
}
