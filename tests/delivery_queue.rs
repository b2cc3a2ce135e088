use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pixelgw::config::{Config, DataOutputFilter, GatewayConfig};
use pixelgw::queue::broker::{BrokerError, BrokerTransport, ConnectOptions, Endpoint, TransportFactory};
use pixelgw::queue::credentials::{
    CredentialApi, CredentialError, CredentialManager, CredentialStore, LocalCredentialApi, StoredCredential, TokenPair,
};
use pixelgw::queue::payloads::{ChipInfo, ReportedSettings, UploadItem};
use pixelgw::queue::{start_queue, QueueConfig, Uplink};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;

#[derive(Default)]
struct Recorder {
    connects: Mutex<Vec<ConnectOptions>>,
    publishes: Mutex<Vec<(String, Value)>>,
    subscriptions: Mutex<Vec<(String, mpsc::UnboundedSender<Vec<u8>>)>>,
    reject_connects: AtomicUsize,
    fail_publish: AtomicBool,
}

impl Recorder {
    fn data_publishes(&self) -> Vec<Value> {
        self.publishes
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t.starts_with("data/"))
            .map(|(_, v)| v.clone())
            .collect()
    }

    fn connect_count(&self) -> usize {
        self.connects.lock().unwrap().len()
    }
}

struct MockTransport {
    rec: Arc<Recorder>,
    connected: AtomicBool,
}

#[async_trait]
impl BrokerTransport for MockTransport {
    async fn connect(&self, options: &ConnectOptions) -> Result<(), BrokerError> {
        self.rec.connects.lock().unwrap().push(options.clone());
        let rejected = self
            .rec
            .reject_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(BrokerError::NotAuthorized);
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        if self.rec.fail_publish.load(Ordering::SeqCst) {
            return Err(BrokerError::Publish {
                topic: topic.to_string(),
                reason: "broker gone".into(),
            });
        }
        let value: Value = serde_json::from_slice(payload).unwrap();
        self.rec.publishes.lock().unwrap().push((topic.to_string(), value));
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, BrokerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.rec.subscriptions.lock().unwrap().push((topic.to_string(), tx));
        Ok(rx)
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

struct MockFactory(Arc<Recorder>);

impl TransportFactory for MockFactory {
    fn create(&self, _endpoint: &Endpoint) -> Box<dyn BrokerTransport> {
        Box::new(MockTransport {
            rec: Arc::clone(&self.0),
            connected: AtomicBool::new(false),
        })
    }
}

#[derive(Default)]
struct CountingApi {
    refreshes: AtomicUsize,
    registrations: AtomicUsize,
    reject_refresh: AtomicBool,
    /// Exchanges still to fail as unreachable.
    unreachable: AtomicUsize,
}

impl CountingApi {
    fn outage(&self) -> Result<(), CredentialError> {
        let down = self
            .unreachable
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if down {
            return Err(CredentialError::Unreachable("503".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CredentialApi for CountingApi {
    async fn refresh(&self, _refresh_token: &str) -> Result<TokenPair, CredentialError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        self.outage()?;
        if self.reject_refresh.load(Ordering::SeqCst) {
            return Err(CredentialError::Rejected);
        }
        Ok(TokenPair {
            access_token: LocalCredentialApi::issue("acme", 3600),
            refresh_token: Some("r2".into()),
        })
    }

    async fn register(&self, owner_id: &str, _gateway_id: &str) -> Result<TokenPair, CredentialError> {
        self.registrations.fetch_add(1, Ordering::SeqCst);
        self.outage()?;
        Ok(TokenPair {
            access_token: LocalCredentialApi::issue(owner_id, 3600),
            refresh_token: Some("r1".into()),
        })
    }
}

fn gateway(cloud_managed: bool) -> GatewayConfig {
    GatewayConfig {
        owner_id: "acme".into(),
        gateway_id: "GW1".into(),
        cloud_managed,
        ..Config::default().gateway
    }
}

fn queue_cfg(cloud_managed: bool) -> QueueConfig {
    QueueConfig {
        gateway: gateway(cloud_managed),
        tick_ms: 20,
        watchdog_period: Duration::from_secs(3600),
        watchdog_idle: Duration::from_secs(59),
        heartbeat_period: Duration::from_secs(3600),
        settings: ReportedSettings {
            pacing_period_ms: 15_000,
            upstream_enabled: true,
            upload_pixels_traffic: true,
            upload_configuration_traffic: true,
            ble_logs_enabled: false,
            data_mode: DataOutputFilter::BridgesAndPixels,
        },
    }
}

struct Rig {
    rec: Arc<Recorder>,
    api: Arc<CountingApi>,
    uplink: Arc<Uplink>,
}

fn rig_with(stored: Option<StoredCredential>, cloud_managed: bool) -> (Rig, tempfile::TempDir) {
    rig_with_api(stored, cloud_managed, CountingApi::default())
}

fn rig_with_api(stored: Option<StoredCredential>, cloud_managed: bool, api: CountingApi) -> (Rig, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = CredentialStore::new(dir.path().join("creds.json"));
    if let Some(cred) = stored {
        store.save("prod", "acme", &cred).unwrap();
    }
    let rec = Arc::new(Recorder::default());
    let api = Arc::new(api);
    let credentials = Arc::new(CredentialManager::new(api.clone(), Some(store), "prod", "acme", "GW1"));
    let uplink = Arc::new(Uplink::new(
        gateway(cloud_managed),
        "ssl://broker.local:8883",
        None,
        Arc::new(MockFactory(rec.clone())),
        credentials,
    ));
    (Rig { rec, api, uplink }, dir)
}

fn item(seq: u64) -> UploadItem {
    UploadItem {
        payload: format!("1E16C6FC{:02X}", seq),
        sequence_id: seq,
        rssi: -50,
        timestamp: 1_000 + seq as i64,
        alias_bridge_id: None,
        retransmitted: false,
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    timeout(Duration::from_secs(2), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}

#[tokio::test]
async fn flush_sorts_by_sequence_and_runs_terminator() {
    let (rig, _dir) = rig_with(None, false);
    let queue = start_queue(queue_cfg(false), rig.uplink.clone(), None);

    let done = Arc::new(AtomicBool::new(false));
    let flag = done.clone();
    queue.add_data_then(vec![item(3), item(1)], Box::new(move || flag.store(true, Ordering::SeqCst)));
    queue.add_data(vec![item(2)]);

    wait_for("data publish", || !rig.rec.data_publishes().is_empty()).await;
    let envelope = rig.rec.data_publishes().remove(0);
    let seqs: Vec<u64> = envelope["packets"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["sequenceId"].as_u64().unwrap())
        .collect();
    assert_eq!(seqs, vec![1, 2, 3]);
    assert_eq!(envelope["gatewayId"], "GW1");
    wait_for("terminator", || done.load(Ordering::SeqCst)).await;

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(rig.rec.data_publishes().len(), 1, "batch must not be sent twice");
    let stats = queue.snapshot().await.unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.published_items, 3);
    assert!(stats.last_upload > 0);
    queue.shutdown().await;
}

#[tokio::test]
async fn failed_publish_drops_batch_and_skips_terminator() {
    let (rig, _dir) = rig_with(None, false);
    rig.rec.fail_publish.store(true, Ordering::SeqCst);
    let queue = start_queue(queue_cfg(false), rig.uplink.clone(), None);

    let done = Arc::new(AtomicBool::new(false));
    let flag = done.clone();
    queue.add_data_then(vec![item(0)], Box::new(move || flag.store(true, Ordering::SeqCst)));

    timeout(Duration::from_secs(2), async {
        loop {
            let stats = queue.snapshot().await.unwrap();
            if stats.failed_flushes == 1 {
                assert_eq!(stats.pending, 0);
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("flush failure recorded");

    rig.rec.fail_publish.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(rig.rec.data_publishes().is_empty(), "cleared batch is not retried");
    assert!(!done.load(Ordering::SeqCst));
    queue.shutdown().await;
}

#[tokio::test]
async fn valid_stored_token_is_never_exchanged() {
    let token = LocalCredentialApi::issue("acme", 3600);
    let (rig, _dir) = rig_with(
        Some(StoredCredential {
            access_token: Some(token.clone()),
            refresh_token: Some("r0".into()),
        }),
        false,
    );
    let first = rig.uplink.ensure_connected().await.unwrap();
    rig.uplink.release().await;
    let second = rig.uplink.ensure_connected().await.unwrap();

    assert_ne!(first.id, second.id, "every connect gets a fresh id");
    assert_eq!(rig.api.refreshes.load(Ordering::SeqCst), 0);
    assert_eq!(rig.api.registrations.load(Ordering::SeqCst), 0);
    let connects = rig.rec.connects.lock().unwrap().clone();
    assert_eq!(connects.len(), 2);
    assert!(connects.iter().all(|c| c.password == token && c.username == "acme"));
    assert_eq!(connects[0].keep_alive_secs, 60);
    assert_eq!(connects[0].will.as_ref().unwrap().topic, "status/acme/GW1");
    assert_eq!(first.topics.data, "data/acme/GW1");
}

#[tokio::test]
async fn expired_token_is_refreshed_not_registered() {
    let (rig, _dir) = rig_with(
        Some(StoredCredential {
            access_token: Some(LocalCredentialApi::issue("acme", -10)),
            refresh_token: Some("r0".into()),
        }),
        false,
    );
    rig.uplink.ensure_connected().await.unwrap();
    assert_eq!(rig.api.refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(rig.api.registrations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn rejected_refresh_falls_back_to_registration() {
    let api = CountingApi::default();
    api.reject_refresh.store(true, Ordering::SeqCst);
    let (rig, dir) = rig_with_api(
        Some(StoredCredential {
            access_token: Some(LocalCredentialApi::issue("acme", -10)),
            refresh_token: Some("r0".into()),
        }),
        false,
        api,
    );
    rig.uplink.ensure_connected().await.unwrap();
    assert_eq!(rig.api.refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(rig.api.registrations.load(Ordering::SeqCst), 1);

    let stored = CredentialStore::new(dir.path().join("creds.json"))
        .load("prod", "acme")
        .unwrap()
        .unwrap();
    assert_eq!(stored.refresh_token.as_deref(), Some("r1"));
}

#[tokio::test]
async fn unreachable_backend_is_asked_twice_at_most() {
    let api = CountingApi::default();
    api.unreachable.store(1, Ordering::SeqCst);
    let (rig, _dir) = rig_with_api(None, false, api);
    rig.uplink.ensure_connected().await.unwrap();
    assert_eq!(rig.api.registrations.load(Ordering::SeqCst), 2);

    let api = CountingApi::default();
    api.unreachable.store(5, Ordering::SeqCst);
    let (rig, _dir) = rig_with_api(None, false, api);
    assert!(rig.uplink.ensure_connected().await.is_err());
    assert_eq!(rig.api.registrations.load(Ordering::SeqCst), 2);
    assert_eq!(rig.rec.connect_count(), 0);
}

#[tokio::test]
async fn refused_token_is_retried_exactly_once() {
    let (rig, _dir) = rig_with(None, false);
    rig.rec.reject_connects.store(1, Ordering::SeqCst);
    rig.uplink.ensure_connected().await.unwrap();
    assert_eq!(rig.rec.connect_count(), 2);
    // token dropped after the refusal, the held refresh token replaces it
    assert_eq!(rig.api.registrations.load(Ordering::SeqCst), 1);
    assert_eq!(rig.api.refreshes.load(Ordering::SeqCst), 1);

    let (rig, _dir) = rig_with(None, false);
    rig.rec.reject_connects.store(5, Ordering::SeqCst);
    assert!(rig.uplink.ensure_connected().await.is_err());
    assert_eq!(rig.rec.connect_count(), 2);
}

#[tokio::test]
async fn watchdog_releases_idle_connection() {
    let (rig, _dir) = rig_with(None, false);
    let mut cfg = queue_cfg(false);
    cfg.watchdog_period = Duration::from_millis(40);
    cfg.watchdog_idle = Duration::from_millis(30);
    let queue = start_queue(cfg, rig.uplink.clone(), None);

    let mut ids = queue.connection_ids();
    rig.uplink.ensure_connected().await.unwrap();
    assert!(ids.borrow_and_update().is_some());
    timeout(Duration::from_secs(2), ids.wait_for(|id| id.is_none()))
        .await
        .expect("watchdog fired")
        .unwrap();
    queue.shutdown().await;
}

#[tokio::test]
async fn downlink_follows_each_connection() {
    let (rig, _dir) = rig_with(None, true);
    let (down_tx, mut down_rx) = mpsc::unbounded_channel();
    let queue = start_queue(queue_cfg(true), rig.uplink.clone(), Some(down_tx));

    rig.uplink.ensure_connected().await.unwrap();
    wait_for("subscription", || rig.rec.subscriptions.lock().unwrap().len() == 1).await;
    let (topic, tx) = rig.rec.subscriptions.lock().unwrap()[0].clone();
    assert_eq!(topic, "update/acme/GW1");
    tx.send(br#"{"action":3}"#.to_vec()).unwrap();
    let msg = timeout(Duration::from_secs(1), down_rx.recv()).await.unwrap().unwrap();
    assert_eq!(msg, r#"{"action":3}"#);

    rig.uplink.release().await;
    rig.uplink.ensure_connected().await.unwrap();
    wait_for("resubscription", || rig.rec.subscriptions.lock().unwrap().len() == 2).await;
    queue.shutdown().await;
}

#[tokio::test]
async fn capabilities_go_to_status_topic() {
    let (rig, _dir) = rig_with(None, true);
    let queue = start_queue(queue_cfg(true), rig.uplink.clone(), None);
    queue.send_capabilities();
    wait_for("capabilities", || {
        rig.rec
            .publishes
            .lock()
            .unwrap()
            .iter()
            .any(|(t, v)| t == "status/acme/GW1" && v["downlinkSupported"] == true)
    })
    .await;
    queue.shutdown().await;
}

#[tokio::test]
async fn upstream_disabled_drops_batches() {
    let (rig, _dir) = rig_with(None, false);
    let mut cfg = queue_cfg(false);
    cfg.settings.upstream_enabled = false;
    let queue = start_queue(cfg, rig.uplink.clone(), None);

    let done = Arc::new(AtomicBool::new(false));
    let flag = done.clone();
    queue.add_data_then(vec![item(0), item(1)], Box::new(move || flag.store(true, Ordering::SeqCst)));

    timeout(Duration::from_secs(2), async {
        loop {
            let stats = queue.snapshot().await.unwrap();
            if stats.flushes == 1 {
                assert_eq!(stats.pending, 0);
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("batch taken off the queue");

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(rig.rec.data_publishes().is_empty());
    assert!(!done.load(Ordering::SeqCst));
    assert_eq!(rig.rec.connect_count(), 0);
    let stats = queue.snapshot().await.unwrap();
    assert_eq!(stats.published_items, 0);
    assert_eq!(stats.failed_flushes, 0);
    queue.shutdown().await;
}

#[tokio::test]
async fn heartbeat_on_demand_carries_chip_info() {
    let (rig, _dir) = rig_with(None, true);
    let queue = start_queue(queue_cfg(true), rig.uplink.clone(), None);
    queue.set_chip_info(ChipInfo {
        ble_mac: "AA:BB:CC:00:11:22".into(),
        ble_version: "4.1.0".into(),
        interface_version: "1.2.0".into(),
    });
    queue.send_heartbeat();
    wait_for("heartbeat", || {
        rig.rec.publishes.lock().unwrap().iter().any(|(t, v)| {
            t == "status/acme/GW1"
                && v["downlinkSupported"] == true
                && v["gatewayInfo"]["bleChipMacAddress"] == "AABBCC001122"
        })
    })
    .await;
    queue.shutdown().await;
}
