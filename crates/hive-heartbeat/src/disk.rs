//! Shared-disk transport.
//!
//! Layout of the device:
//!
//! ```text
//! 0                4 MiB            4 MiB + 1 MiB     4 MiB + K MiB
//! ┌────────────────┬────────────────┬───── ··· ──────┬────────────────┐
//! │ metadata       │ data slot 0    │                 │ data slot K    │
//! │ 1024 × 4 KiB   │                │                 │                │
//! └────────────────┴────────────────┴───── ··· ──────┴────────────────┘
//! ```
//!
//! Metadata page K holds the name of the node owning data slot K, NUL
//! padded; an all-zero page is free. A node claims the first free page on
//! its first write and keeps it. A data slot holds one JSON record
//! `{"updated": <unix secs>, "msg": "<base64 payload>"}` followed by NUL.
//!
//! I/O is direct and synchronous where the device allows it, through
//! page-aligned buffers, and runs on the blocking pool. The device is
//! reopened every cycle so a replaced device is picked up.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use hive_state::{ClusterState, NodeName, unix_now};

use crate::config::{DiskConfig, LinkConfig, TransportConfig};
use crate::error::{HeartbeatError, HeartbeatResult};
use crate::link::{Datagram, Receive, Transmit, TxMode};

pub const PAGE: usize = 4096;
pub const METADATA_SIZE: u64 = 4 * 1024 * 1024;
pub const MAX_SLOTS: usize = METADATA_SIZE as usize / PAGE;
pub const SLOT_SIZE: usize = 1024 * 1024;

/// Byte offset of data slot `slot`.
pub fn slot_offset(slot: usize) -> u64 {
    METADATA_SIZE + (slot * SLOT_SIZE) as u64
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotRecord {
    pub updated: f64,
    pub msg: String,
}

/// Zeroed buffer whose usable region starts on a page boundary.
struct AlignedBuf {
    raw: Vec<u8>,
    start: usize,
    len: usize,
}

impl AlignedBuf {
    fn zeroed(len: usize) -> Self {
        let len = len.div_ceil(PAGE) * PAGE;
        let raw = vec![0u8; len + PAGE];
        let start = raw.as_ptr().align_offset(PAGE);
        Self { raw, start, len }
    }

    fn as_slice(&self) -> &[u8] {
        &self.raw[self.start..self.start + self.len]
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.raw[self.start..self.start + self.len]
    }
}

/// Open the device for direct synchronous I/O, falling back to synchronous
/// buffered I/O when the filesystem rejects `O_DIRECT`.
pub fn open_device(path: &Path) -> HeartbeatResult<File> {
    #[cfg(target_os = "linux")]
    {
        match OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_DIRECT | libc::O_SYNC)
            .open(path)
        {
            Ok(file) => return Ok(file),
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
                debug!(dev = %path.display(), "direct io unsupported, using synchronous io");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_SYNC)
        .open(path)?)
}

/// Read `len` bytes at `offset`. Bytes past the end of the device read as
/// zero.
fn read_aligned(file: &File, offset: u64, len: usize) -> HeartbeatResult<AlignedBuf> {
    let mut buf = AlignedBuf::zeroed(len);
    let region = buf.as_mut_slice();
    let mut filled = 0;
    while filled < region.len() {
        let n = file.read_at(&mut region[filled..], offset + filled as u64)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(buf)
}

fn write_aligned(file: &File, offset: u64, data: &[u8]) -> HeartbeatResult<()> {
    let mut buf = AlignedBuf::zeroed(data.len());
    buf.as_mut_slice()[..data.len()].copy_from_slice(data);
    file.write_all_at(buf.as_slice(), offset)?;
    Ok(())
}

fn nul_terminated(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    &bytes[..end]
}

/// Slot owners recorded in the metadata area, by slot index.
pub fn slot_owners(file: &File) -> HeartbeatResult<Vec<(usize, NodeName)>> {
    let meta = read_aligned(file, 0, METADATA_SIZE as usize)?;
    Ok(meta
        .as_slice()
        .chunks(PAGE)
        .enumerate()
        .filter_map(|(slot, page)| {
            let name = nul_terminated(page);
            (!name.is_empty()).then(|| (slot, String::from_utf8_lossy(name).into_owned()))
        })
        .collect())
}

pub fn find_slot(file: &File, node: &str) -> HeartbeatResult<Option<usize>> {
    Ok(slot_owners(file)?
        .into_iter()
        .find(|(_, owner)| owner == node)
        .map(|(slot, _)| slot))
}

/// The slot owned by `node`, claiming the first free one when it has none.
pub fn allocate_slot(file: &File, node: &str) -> HeartbeatResult<usize> {
    if node.is_empty() || node.len() >= PAGE {
        return Err(HeartbeatError::Device(format!("invalid node name {node:?}")));
    }
    let owners = slot_owners(file)?;
    if let Some((slot, _)) = owners.iter().find(|(_, owner)| owner == node) {
        return Ok(*slot);
    }
    let used: Vec<usize> = owners.iter().map(|(slot, _)| *slot).collect();
    let slot = (0..MAX_SLOTS)
        .find(|slot| !used.contains(slot))
        .ok_or_else(|| HeartbeatError::Device("no free slot in metadata area".into()))?;
    write_aligned(file, (slot * PAGE) as u64, node.as_bytes())?;
    file.sync_all()?;
    info!(%node, slot, "disk heartbeat slot allocated");
    Ok(slot)
}

pub fn write_slot(file: &File, slot: usize, payload: &[u8], updated: f64) -> HeartbeatResult<()> {
    let record = SlotRecord {
        updated,
        msg: STANDARD.encode(payload),
    };
    let mut frame = serde_json::to_vec(&record)?;
    frame.push(0);
    if frame.len() > SLOT_SIZE {
        return Err(HeartbeatError::Device(format!(
            "payload of {} bytes exceeds the {SLOT_SIZE}-byte slot",
            frame.len()
        )));
    }
    write_aligned(file, slot_offset(slot), &frame)
}

/// The record in `slot`, `None` when the slot was never written.
pub fn read_slot(file: &File, slot: usize) -> HeartbeatResult<Option<SlotRecord>> {
    let buf = read_aligned(file, slot_offset(slot), SLOT_SIZE)?;
    let frame = nul_terminated(buf.as_slice());
    if frame.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(frame)?))
}

fn disk_config(config: &LinkConfig) -> HeartbeatResult<DiskConfig> {
    match &config.transport {
        TransportConfig::Disk(d) => Ok(d.clone()),
        other => Err(HeartbeatError::Config(format!(
            "{}: expected disk transport, got {}",
            config.name,
            other.kind()
        ))),
    }
}

async fn blocking<T: Send + 'static>(
    f: impl FnOnce() -> HeartbeatResult<T> + Send + 'static,
) -> HeartbeatResult<T> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| HeartbeatError::Device(format!("disk task failed: {e}")))?
}

pub struct DiskTx {
    dev: PathBuf,
    local: NodeName,
    slot: Option<usize>,
}

impl DiskTx {
    pub fn new(config: &LinkConfig, local: impl Into<NodeName>) -> HeartbeatResult<Self> {
        Ok(Self {
            dev: disk_config(config)?.dev,
            local: local.into(),
            slot: None,
        })
    }
}

impl Transmit for DiskTx {
    fn mode(&self) -> TxMode {
        TxMode::Broadcast
    }

    async fn transmit(&mut self, _peer: Option<&str>, payload: Bytes) -> HeartbeatResult<()> {
        let dev = self.dev.clone();
        let local = self.local.clone();
        let cached = self.slot;
        let slot = blocking(move || {
            let file = open_device(&dev)?;
            let slot = match cached {
                Some(slot) => slot,
                None => allocate_slot(&file, &local)?,
            };
            write_slot(&file, slot, &payload, unix_now())?;
            Ok(slot)
        })
        .await?;
        self.slot = Some(slot);
        Ok(())
    }

    fn reconfigure(&mut self, config: &LinkConfig) -> HeartbeatResult<()> {
        let dev = disk_config(config)?.dev;
        if dev != self.dev {
            self.dev = dev;
            self.slot = None;
        }
        Ok(())
    }
}

pub struct DiskRx {
    dev: PathBuf,
    timeout: Duration,
    cluster: Arc<ClusterState>,
    last_updated: HashMap<NodeName, f64>,
}

impl DiskRx {
    pub fn new(config: &LinkConfig, cluster: Arc<ClusterState>) -> HeartbeatResult<Self> {
        Ok(Self {
            dev: disk_config(config)?.dev,
            timeout: config.timeout,
            cluster,
            last_updated: HashMap::new(),
        })
    }
}

impl Receive for DiskRx {
    fn polling(&self) -> bool {
        true
    }

    async fn receive(&mut self) -> HeartbeatResult<Vec<Datagram>> {
        let dev = self.dev.clone();
        let peers = self.cluster.peer_names();
        let records = blocking(move || {
            let file = open_device(&dev)?;
            let mut records = Vec::new();
            for (slot, owner) in slot_owners(&file)? {
                if !peers.contains(&owner) {
                    continue;
                }
                match read_slot(&file, slot) {
                    Ok(Some(record)) => records.push((slot, owner, record)),
                    Ok(None) => {}
                    Err(e) => debug!(slot, %owner, error = %e, "unreadable disk slot"),
                }
            }
            Ok(records)
        })
        .await?;

        let now = unix_now();
        let max_age = self.timeout.as_secs_f64();
        let mut datagrams = Vec::new();
        for (slot, owner, record) in records {
            if self.last_updated.get(&owner) == Some(&record.updated) {
                continue;
            }
            self.last_updated.insert(owner.clone(), record.updated);
            if now - record.updated > max_age {
                debug!(slot, %owner, age = now - record.updated, "stale disk slot ignored");
                continue;
            }
            let payload = match STANDARD.decode(record.msg.as_bytes()) {
                Ok(payload) => Bytes::from(payload),
                Err(e) => {
                    debug!(slot, %owner, error = %e, "undecodable disk slot");
                    continue;
                }
            };
            datagrams.push(Datagram {
                payload,
                origin: format!("slot {slot} ({owner})"),
            });
        }
        Ok(datagrams)
    }

    fn reconfigure(&mut self, config: &LinkConfig) -> HeartbeatResult<()> {
        self.dev = disk_config(config)?.dev;
        self.timeout = config.timeout;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> tempfile::NamedTempFile {
        tempfile::NamedTempFile::new().unwrap()
    }

    #[test]
    fn aligned_buffer_starts_on_a_page() {
        let buf = AlignedBuf::zeroed(10);
        assert_eq!(buf.as_slice().as_ptr() as usize % PAGE, 0);
        assert_eq!(buf.as_slice().len(), PAGE);
    }

    #[test]
    fn blank_device_has_no_owners() {
        let dev = device();
        let file = open_device(dev.path()).unwrap();
        assert!(slot_owners(&file).unwrap().is_empty());
        assert_eq!(read_slot(&file, 0).unwrap(), None);
    }

    #[test]
    fn allocation_takes_first_free_slot() {
        let dev = device();
        let file = open_device(dev.path()).unwrap();
        assert_eq!(allocate_slot(&file, "n1").unwrap(), 0);
        assert_eq!(allocate_slot(&file, "n2").unwrap(), 1);
        assert_eq!(allocate_slot(&file, "n1").unwrap(), 0);
        assert_eq!(find_slot(&file, "n2").unwrap(), Some(1));
        assert_eq!(find_slot(&file, "n3").unwrap(), None);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let dev = device();
        let file = open_device(dev.path()).unwrap();
        let payload = vec![7u8; SLOT_SIZE];
        assert!(matches!(
            write_slot(&file, 0, &payload, 1.0),
            Err(HeartbeatError::Device(_))
        ));
    }

    #[tokio::test]
    async fn rx_reads_each_update_once() {
        let dev = device();
        let link = LinkConfig::new(
            "hb#d",
            TransportConfig::Disk(DiskConfig {
                dev: dev.path().to_path_buf(),
            }),
        );
        let cluster = Arc::new(ClusterState::new("n1", &["n1".into(), "n2".into()]));
        let mut tx = DiskTx::new(&link, "n2").unwrap();
        let mut rx = DiskRx::new(&link, cluster).unwrap();

        tx.transmit(None, Bytes::from_static(b"beat")).await.unwrap();
        let first = rx.receive().await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].payload, Bytes::from_static(b"beat"));
        assert!(rx.receive().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rx_ignores_own_and_stale_slots() {
        let dev = device();
        let link = LinkConfig::new(
            "hb#d",
            TransportConfig::Disk(DiskConfig {
                dev: dev.path().to_path_buf(),
            }),
        );
        let cluster = Arc::new(ClusterState::new("n1", &["n1".into(), "n2".into()]));
        {
            let file = open_device(dev.path()).unwrap();
            let own = allocate_slot(&file, "n1").unwrap();
            write_slot(&file, own, b"mine", unix_now()).unwrap();
            let peer = allocate_slot(&file, "n2").unwrap();
            write_slot(&file, peer, b"old", unix_now() - 3600.0).unwrap();
        }
        let mut rx = DiskRx::new(&link, cluster).unwrap();
        assert!(rx.receive().await.unwrap().is_empty());
    }
}
