//! Shared-disk and relay transports against real backing stores: a temp
//! file standing in for the block device, and an in-process HTTP relay.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use parking_lot::Mutex;
use tokio::net::TcpListener;

use hive_heartbeat::config::{DiskConfig, LinkConfig, RelayConfig, TransportConfig};
use hive_heartbeat::disk::{self, DiskRx, DiskTx};
use hive_heartbeat::relay::{RelayResponse, RelayRx, RelayRxRequest, RelayTx, RelayTxRequest};
use hive_heartbeat::{ClusterIdentity, HeartbeatError, Receive, Transmit};
use hive_state::{ClusterState, unix_now};

fn members() -> Vec<String> {
    vec!["n1".into(), "n2".into(), "n3".into()]
}

// ── Disk ─────────────────────────────────────────────────────────

fn disk_link(dev: &std::path::Path) -> LinkConfig {
    LinkConfig::new(
        "hb#disk",
        TransportConfig::Disk(DiskConfig {
            dev: dev.to_path_buf(),
        }),
    )
}

#[test]
fn slot_assignment_survives_reopen() {
    let dev = tempfile::NamedTempFile::new().unwrap();
    {
        let file = disk::open_device(dev.path()).unwrap();
        assert_eq!(disk::allocate_slot(&file, "n3").unwrap(), 0);
        assert_eq!(disk::allocate_slot(&file, "n1").unwrap(), 1);
    }
    let file = disk::open_device(dev.path()).unwrap();
    assert_eq!(disk::find_slot(&file, "n1").unwrap(), Some(1));
    assert_eq!(disk::allocate_slot(&file, "n3").unwrap(), 0);
    assert_eq!(disk::allocate_slot(&file, "n2").unwrap(), 2);
    assert_eq!(
        disk::slot_owners(&file).unwrap(),
        vec![(0, "n3".to_string()), (1, "n1".to_string()), (2, "n2".to_string())]
    );
}

#[test]
fn slot_data_lands_at_its_offset() {
    let dev = tempfile::NamedTempFile::new().unwrap();
    let file = disk::open_device(dev.path()).unwrap();
    disk::write_slot(&file, 3, b"payload", 12.5).unwrap();
    let len = std::fs::metadata(dev.path()).unwrap().len();
    assert!(len > disk::slot_offset(3));
    assert!(len <= disk::slot_offset(4));

    let record = disk::read_slot(&file, 3).unwrap().unwrap();
    assert_eq!(record.updated, 12.5);
    assert_eq!(STANDARD.decode(record.msg).unwrap(), b"payload");
    assert_eq!(disk::read_slot(&file, 2).unwrap(), None);
}

#[tokio::test]
async fn every_writer_is_read_by_the_others() {
    let dev = tempfile::NamedTempFile::new().unwrap();
    let link = disk_link(dev.path());
    let mut tx2 = DiskTx::new(&link, "n2").unwrap();
    let mut tx3 = DiskTx::new(&link, "n3").unwrap();
    tx2.transmit(None, Bytes::from_static(b"from n2")).await.unwrap();
    tx3.transmit(None, Bytes::from_static(b"from n3")).await.unwrap();

    let cluster = Arc::new(ClusterState::new("n1", &members()));
    let mut rx = DiskRx::new(&link, cluster).unwrap();
    assert!(rx.polling());
    let mut got: Vec<Bytes> = rx.receive().await.unwrap().into_iter().map(|d| d.payload).collect();
    got.sort();
    assert_eq!(got, vec![Bytes::from_static(b"from n2"), Bytes::from_static(b"from n3")]);

    // Nothing new until a writer writes again.
    assert!(rx.receive().await.unwrap().is_empty());
    tokio::time::sleep(Duration::from_millis(5)).await;
    tx3.transmit(None, Bytes::from_static(b"again")).await.unwrap();
    let again = rx.receive().await.unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].payload, Bytes::from_static(b"again"));
}

// ── Relay ────────────────────────────────────────────────────────

type Slots = Arc<Mutex<HashMap<String, (f64, String)>>>;

async fn relay_handler(slots: Slots, req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path().to_string();
    let body = req.into_body().collect().await.map(|b| b.to_bytes()).unwrap_or_default();
    let resp = match path.as_str() {
        "/relay_tx" => match serde_json::from_slice::<RelayTxRequest>(&body) {
            Ok(tx) if tx.cluster_id == "c0ffee" => {
                slots.lock().insert(tx.nodename, (unix_now(), tx.msg));
                RelayResponse::default()
            }
            _ => RelayResponse {
                status: 1,
                error: Some("unknown cluster".into()),
                ..Default::default()
            },
        },
        "/relay_rx" => match serde_json::from_slice::<RelayRxRequest>(&body) {
            Ok(rx) => match slots.lock().get(&rx.slot) {
                Some((updated, data)) => RelayResponse {
                    updated: Some(*updated),
                    data: Some(data.clone()),
                    ..Default::default()
                },
                None => RelayResponse::default(),
            },
            Err(_) => RelayResponse {
                status: 1,
                ..Default::default()
            },
        },
        _ => RelayResponse {
            status: 404,
            ..Default::default()
        },
    };
    let body = serde_json::to_vec(&resp).unwrap_or_default();
    Ok(Response::new(Full::new(Bytes::from(body))))
}

async fn spawn_relay() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let slots: Slots = Arc::default();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let slots = slots.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| relay_handler(slots.clone(), req));
                let _ = http1::Builder::new()
                    .serve_connection(hyper_util::rt::TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    addr
}

fn identity(id: &str) -> ClusterIdentity {
    ClusterIdentity {
        name: "prod".into(),
        id: id.into(),
        compat: 1,
    }
}

#[tokio::test]
async fn relay_carries_payloads_between_nodes() {
    let relay = spawn_relay().await;
    let link = LinkConfig::new("hb#relay", TransportConfig::Relay(RelayConfig { relay }));

    let mut tx = RelayTx::new(&link, identity("c0ffee"), "n2").unwrap();
    tx.transmit(None, Bytes::from_static(b"sealed")).await.unwrap();

    let cluster = Arc::new(ClusterState::new("n1", &members()));
    let mut rx = RelayRx::new(&link, "c0ffee", cluster).unwrap();
    let got = rx.receive().await.unwrap();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].payload, Bytes::from_static(b"sealed"));

    // Same relay timestamp: nothing new.
    assert!(rx.receive().await.unwrap().is_empty());
}

#[tokio::test]
async fn relay_status_is_surfaced() {
    let relay = spawn_relay().await;
    let link = LinkConfig::new("hb#relay", TransportConfig::Relay(RelayConfig { relay }));
    let mut tx = RelayTx::new(&link, identity("other"), "n2").unwrap();
    match tx.transmit(None, Bytes::from_static(b"x")).await {
        Err(HeartbeatError::Relay { status, message }) => {
            assert_eq!(status, 1);
            assert_eq!(message, "unknown cluster");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn unreachable_relay_fails_the_receive() {
    let link = LinkConfig::new(
        "hb#relay",
        TransportConfig::Relay(RelayConfig {
            relay: "127.0.0.1:1".into(),
        }),
    );
    let cluster = Arc::new(ClusterState::new("n1", &members()));
    let mut rx = RelayRx::new(&link, "c0ffee", cluster).unwrap();
    assert!(rx.receive().await.is_err());
}
