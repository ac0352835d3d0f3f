//! TCP unicast transport.
//!
//! One short-lived connection per peer and interval: connect, write the
//! sealed payload followed by a NUL byte, close. The listener hands each
//! accepted connection to its own handler task; handlers run under a
//! semaphore sized to four per peer, and connections beyond that are
//! dropped unread.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{LinkConfig, TransportConfig, UnicastConfig};
use crate::error::{HeartbeatError, HeartbeatResult};
use crate::link::{Datagram, Receive, Transmit, TxMode};

/// Upper bound of one framed payload.
pub const MAX_FRAME: usize = 64 * 1024 * 1024;
/// Concurrent connection handlers allowed per configured peer.
pub const HANDLERS_PER_PEER: usize = 4;

const QUEUE_CAPACITY: usize = 256;

fn unicast_config(config: &LinkConfig) -> HeartbeatResult<UnicastConfig> {
    match &config.transport {
        TransportConfig::Unicast(u) => Ok(u.clone()),
        other => Err(HeartbeatError::Config(format!(
            "{}: expected unicast transport, got {}",
            config.name,
            other.kind()
        ))),
    }
}

pub struct UnicastTx {
    config: UnicastConfig,
    timeout: Duration,
}

impl UnicastTx {
    pub fn new(config: &LinkConfig) -> HeartbeatResult<Self> {
        Ok(Self {
            config: unicast_config(config)?,
            timeout: config.timeout,
        })
    }
}

impl Transmit for UnicastTx {
    fn mode(&self) -> TxMode {
        TxMode::PerPeer
    }

    async fn transmit(&mut self, peer: Option<&str>, payload: Bytes) -> HeartbeatResult<()> {
        let peer = peer.ok_or_else(|| HeartbeatError::Config("unicast send needs a peer".into()))?;
        let addr = self.config.peer_addr(peer);
        let send = async {
            let mut stream = TcpStream::connect(&addr).await?;
            stream.write_all(&payload).await?;
            stream.write_all(&[0]).await?;
            stream.shutdown().await?;
            Ok::<_, std::io::Error>(())
        };
        match tokio::time::timeout(self.timeout, send).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(HeartbeatError::Timeout(format!("send to {peer} at {addr}"))),
        }
    }

    fn reconfigure(&mut self, config: &LinkConfig) -> HeartbeatResult<()> {
        self.config = unicast_config(config)?;
        self.timeout = config.timeout;
        Ok(())
    }
}

pub struct UnicastRx {
    local_addr: SocketAddr,
    queue: mpsc::Receiver<Datagram>,
    acceptor: JoinHandle<()>,
}

impl UnicastRx {
    /// Bind the listener and start accepting. `peers` sizes the handler cap.
    pub async fn bind(config: &LinkConfig, peers: usize) -> HeartbeatResult<Self> {
        let u = unicast_config(config)?;
        let listener = TcpListener::bind(SocketAddr::new(u.addr, u.port)).await?;
        let local_addr = listener.local_addr()?;
        let (tx, queue) = mpsc::channel(QUEUE_CAPACITY);
        let slots = Arc::new(Semaphore::new(HANDLERS_PER_PEER * peers.max(1)));
        let acceptor = tokio::spawn(accept_loop(listener, slots, tx, config.timeout, config.name.clone()));
        Ok(Self {
            local_addr,
            queue,
            acceptor,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for UnicastRx {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

impl Receive for UnicastRx {
    async fn receive(&mut self) -> HeartbeatResult<Vec<Datagram>> {
        match self.queue.recv().await {
            Some(first) => {
                let mut batch = vec![first];
                while let Ok(more) = self.queue.try_recv() {
                    batch.push(more);
                }
                Ok(batch)
            }
            None => Err(HeartbeatError::Closed),
        }
    }

    fn reconfigure(&mut self, config: &LinkConfig) -> HeartbeatResult<()> {
        let u = unicast_config(config)?;
        if SocketAddr::new(u.addr, u.port) != self.local_addr && u.port != 0 {
            warn!(link = %config.name, "unicast listen address change needs a link restart");
        }
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    slots: Arc<Semaphore>,
    queue: mpsc::Sender<Datagram>,
    timeout: Duration,
    link: String,
) {
    loop {
        let (stream, from) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                debug!(%link, error = %e, "accept failed");
                continue;
            }
        };
        let Ok(permit) = slots.clone().try_acquire_owned() else {
            warn!(%link, %from, "too many heartbeat connections, dropping");
            continue;
        };
        let queue = queue.clone();
        let link = link.clone();
        tokio::spawn(async move {
            let _permit = permit;
            match tokio::time::timeout(timeout, read_frame(stream)).await {
                Ok(Ok(payload)) => {
                    let datagram = Datagram {
                        payload,
                        origin: from.to_string(),
                    };
                    let _ = queue.send(datagram).await;
                }
                Ok(Err(e)) => debug!(%link, %from, error = %e, "heartbeat read failed"),
                Err(_) => debug!(%link, %from, "heartbeat read timed out"),
            }
        });
    }
}

/// Read until the NUL terminator or end of stream.
async fn read_frame(mut stream: TcpStream) -> HeartbeatResult<Bytes> {
    let mut buf = BytesMut::with_capacity(8192);
    let mut chunk = [0u8; 8192];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        if let Some(end) = chunk[..n].iter().position(|b| *b == 0) {
            buf.extend_from_slice(&chunk[..end]);
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_FRAME {
            return Err(HeartbeatError::Decode(format!("frame exceeds {MAX_FRAME} bytes")));
        }
    }
    Ok(buf.freeze())
}
