use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pixelgw::config::Config;
use pixelgw::context::{Backends, GatewayContext};
use pixelgw::queue::broker::{BrokerError, BrokerTransport, ConnectOptions, Endpoint, TransportFactory};
use pixelgw::queue::credentials::LocalCredentialApi;
use pixelgw::registry::OfflineResolver;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;

#[derive(Default)]
struct Recorder {
    publishes: Mutex<Vec<(String, Value)>>,
    subscriptions: Mutex<Vec<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl Recorder {
    fn status(&self) -> Vec<Value> {
        self.publishes
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == "status/acme/GW1")
            .map(|(_, v)| v.clone())
            .collect()
    }
}

struct MockTransport {
    rec: Arc<Recorder>,
    connected: AtomicBool,
}

#[async_trait]
impl BrokerTransport for MockTransport {
    async fn connect(&self, _options: &ConnectOptions) -> Result<(), BrokerError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let value: Value = serde_json::from_slice(payload).unwrap();
        self.rec.publishes.lock().unwrap().push((topic.to_string(), value));
        Ok(())
    }

    async fn subscribe(&self, _topic: &str) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, BrokerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.rec.subscriptions.lock().unwrap().push(tx);
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
async fn configuration_downlink_is_answered_with_heartbeat() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.gateway.owner_id = "acme".into();
    config.gateway.gateway_id = "GW1".into();
    config.gateway.cloud_managed = true;
    config.storage.credentials_file = dir.path().join("creds.json").to_string_lossy().into_owned();

    let rec = Arc::new(Recorder::default());
    let ctx = GatewayContext::start(
        config,
        Backends {
            bridge_resolver: Arc::new(OfflineResolver),
            beacon_resolver: Arc::new(OfflineResolver),
            credentials: Arc::new(LocalCredentialApi),
            transport: Arc::new(MockFactory(rec.clone())),
        },
    )
    .unwrap();

    // capabilities go out on start and open the session
    wait_for("capabilities", || !rec.status().is_empty()).await;
    wait_for("subscription", || !rec.subscriptions.lock().unwrap().is_empty()).await;
    assert!(rec.status().iter().all(|v| v.get("gatewayInfo").is_none()));

    let tx = rec.subscriptions.lock().unwrap()[0].clone();
    tx.send(br#"{"gatewayConf":{"additional":{"pacingPeriod":30,"upstreamEnabled":false}}}"#.to_vec())
        .unwrap();

    wait_for("heartbeat", || {
        rec.status().iter().any(|v| {
            v["gatewayInfo"].is_object()
                && v["gatewayConf"]["additional"]["pacingPeriod"] == 30
                && v["gatewayConf"]["additional"]["upstreamEnabled"] == false
        })
    })
    .await;
    ctx.shutdown().await;
}
