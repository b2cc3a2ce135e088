use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::logutil::escape_log;
use crate::packet::bridge_status::Formation;
use crate::packet::{Packet, ScanEvent};
use crate::pipeline::{start_pipeline, Dispatch, PipelineConfig, PipelineHandle, TrafficPolicy};
use crate::queue::broker::TransportFactory;
use crate::queue::credentials::{CredentialApi, CredentialManager, CredentialStore};
use crate::queue::downlink::{is_vbridge_message, ConfigurationMessage, DownlinkMessage};
use crate::queue::payloads::{ChipInfo, ReportedSettings};
use crate::queue::{start_queue, QueueConfig, QueueHandle, Uplink};
use crate::registry::beacons::{start_beacon_registry, BeaconRegistryConfig, BeaconRegistryHandle};
use crate::registry::bridges::{start_bridge_registry, BridgeEvent, BridgeRegistryConfig, BridgeRegistryHandle};
use crate::registry::{BeaconResolver, BridgeResolver};
use crate::vbridge::{start_virtual_bridge, VBridgeConfig, VBridgeHandle};

macro_rules! sec_log {
    ($($arg:tt)*) => { log::warn!(target: "security", $($arg)*); };
}

/// Cloud broker used when `broker.url` is not configured.
pub const DEFAULT_BROKER_URL: &str = "ssl://mqtt.pixelgw.io:8883";

/// External collaborators the gateway talks to.
#[derive(Clone)]
pub struct Backends {
    pub bridge_resolver: Arc<dyn BridgeResolver>,
    pub beacon_resolver: Arc<dyn BeaconResolver>,
    pub credentials: Arc<dyn CredentialApi>,
    pub transport: Arc<dyn TransportFactory>,
}

/// # Gateway Context
///
/// Starts every actor and routes their output to each other:
///
/// ```text
///  scan ──→ Pipeline ──→ BridgeRegistry ──(changed config statuses)──┐
///             ↑   │ ──→ BeaconRegistry                               │
///             │   │ ──→ VirtualBridge ──(echo, hb, interface)──┐     ↓
///             │   └──────────────────────────────────────────→ │ DeliveryQueue ──→ broker
///             └────────────────────────────────────────────────┘     │
///   downlink ←───────────────────────────────────────────────────────┘
/// ```
///
/// Everything the virtual bridge emits goes back through the pipeline, so it is
/// deduplicated, filtered and uploaded exactly like traffic from a physical bridge.
///
/// ## Usage
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use pixelgw::config::Config;
/// use pixelgw::context::{Backends, GatewayContext};
/// use pixelgw::packet::ScanEvent;
/// use pixelgw::queue::broker::LoggingTransportFactory;
/// use pixelgw::queue::credentials::LocalCredentialApi;
/// use pixelgw::registry::OfflineResolver;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = Config::load("config.toml").await?;
///     let ctx = GatewayContext::start(config, Backends {
///         bridge_resolver: Arc::new(OfflineResolver),
///         beacon_resolver: Arc::new(OfflineResolver),
///         credentials: Arc::new(LocalCredentialApi),
///         transport: Arc::new(LoggingTransportFactory),
///     })?;
///     ctx.ingest(ScanEvent::new("AFFD...", "AA:BB:CC:DD:EE:FF", -60, 0));
///     ctx.shutdown().await;
///     Ok(())
/// }
/// ```
pub struct GatewayContext {
    pub pipeline: PipelineHandle,
    pub bridges: BridgeRegistryHandle,
    pub beacons: BeaconRegistryHandle,
    pub queue: QueueHandle,
    pub vbridge: VBridgeHandle,
    router: JoinHandle<()>,
}

/// Settings the cloud may change at runtime.
struct Runtime {
    cloud_managed: bool,
    policy: TrafficPolicy,
    settings: ReportedSettings,
    vbridge_mac: String,
}

impl Runtime {
    /// Fold a configuration message into the current settings.
    fn apply(&mut self, conf: &ConfigurationMessage) {
        let s = &mut self.settings;
        s.pacing_period_ms = conf.pacing_period_ms(s.pacing_period_ms);
        s.upstream_enabled = conf.upstream_enabled(s.upstream_enabled);
        s.upload_pixels_traffic = conf.pixels_traffic_enabled(s.upload_pixels_traffic);
        s.upload_configuration_traffic = conf.edge_traffic_enabled(s.upload_configuration_traffic);
        s.ble_logs_enabled = conf.ble_logs_enabled(s.ble_logs_enabled);
        s.data_mode = conf.data_output_filter(s.data_mode);

        self.policy.enable_data = s.upload_pixels_traffic;
        self.policy.enable_edge = s.upload_configuration_traffic;
        self.policy.filter = s.data_mode;
    }
}

impl GatewayContext {
    /// Start all actors. Must be called inside a Tokio runtime.
    pub fn start(config: Config, backends: Backends) -> Result<Self> {
        config.validate()?;
        let gw = &config.gateway;

        let vb_cfg = VBridgeConfig::from_config(&config);
        let vbridge_mac = vb_cfg.compact_mac();
        let policy = TrafficPolicy::from_config(&config, Some(&vbridge_mac));

        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let pipeline = start_pipeline(PipelineConfig::from_timing(&config.timing), policy.clone(), dispatch_tx);

        let (bridge_tx, bridge_rx) = mpsc::unbounded_channel();
        let bridges = start_bridge_registry(
            BridgeRegistryConfig::from_timing(&gw.owner_id, &config.timing),
            backends.bridge_resolver,
            bridge_tx,
        );
        let beacons = start_beacon_registry(
            BeaconRegistryConfig::from_timing(&gw.owner_id, &config.timing),
            backends.beacon_resolver,
        );

        let credentials = Arc::new(CredentialManager::new(
            backends.credentials,
            Some(CredentialStore::new(&config.storage.credentials_file)),
            &gw.environment,
            &gw.owner_id,
            &gw.gateway_id,
        ));
        let uplink = Arc::new(Uplink::new(
            gw.clone(),
            config.broker.url.as_deref().unwrap_or(DEFAULT_BROKER_URL),
            config.broker.custom.clone(),
            backends.transport,
            credentials,
        ));
        let queue_cfg = QueueConfig::from_config(&config, vb_cfg.pacing_ms);
        let settings = queue_cfg.settings.clone();
        let (downlink_tx, downlink_rx) = mpsc::unbounded_channel();
        let queue = start_queue(queue_cfg, uplink, Some(downlink_tx));

        let (vb_tx, vb_rx) = mpsc::unbounded_channel();
        queue.set_chip_info(ChipInfo {
            ble_mac: vb_cfg.brg_mac.clone(),
            ble_version: gw.app_version.clone(),
            interface_version: gw.app_version.clone(),
        });
        let vbridge = start_virtual_bridge(vb_cfg, vb_tx);

        if gw.cloud_managed {
            queue.send_capabilities();
        }

        let runtime = Runtime {
            cloud_managed: gw.cloud_managed,
            policy,
            settings,
            vbridge_mac,
        };
        let router = spawn_router(
            runtime,
            Routes {
                pipeline: pipeline.clone(),
                bridges: bridges.clone(),
                beacons: beacons.clone(),
                queue: queue.clone(),
                vbridge: vbridge.clone(),
            },
            dispatch_rx,
            bridge_rx,
            vb_rx,
            downlink_rx,
        );
        log::info!("gateway {} started for owner {}", gw.gateway_id, gw.owner_id);

        Ok(Self {
            pipeline,
            bridges,
            beacons,
            queue,
            vbridge,
            router,
        })
    }

    pub fn ingest(&self, event: ScanEvent) {
        self.pipeline.ingest(event);
    }

    /// Stop every actor. Pending state is discarded.
    pub async fn shutdown(self) {
        self.pipeline.shutdown().await;
        self.vbridge.shutdown().await;
        self.bridges.shutdown().await;
        self.beacons.shutdown().await;
        self.queue.shutdown().await;
        self.router.abort();
        log::info!("gateway stopped");
    }
}

struct Routes {
    pipeline: PipelineHandle,
    bridges: BridgeRegistryHandle,
    beacons: BeaconRegistryHandle,
    queue: QueueHandle,
    vbridge: VBridgeHandle,
}

impl Routes {
    fn dispatch(&self, batch: Dispatch) {
        match batch {
            Dispatch::Bridges(statuses) => self.bridges.add_statuses(statuses),
            Dispatch::Heartbeats(packets) => {
                self.queue.upload_edge(&packets);
                self.bridges.presence(packets);
            }
            Dispatch::Modules(packets) => self.queue.upload_edge(&packets),
            Dispatch::EarlyBridges(packets) => self.bridges.add_early(packets),
            Dispatch::Acks(lines) => self.queue.send_logs(lines),
            Dispatch::DirectPixels(packets) => self.vbridge.direct(packets),
            Dispatch::Resolve(packets) => self.beacons.observe(packets),
            Dispatch::Upload(packets) => self.queue.upload_packets(&packets),
        }
    }

    fn bridge_event(&self, event: BridgeEvent) {
        match event {
            BridgeEvent::Changed(statuses) => {
                let packets: Vec<Packet> = statuses
                    .into_iter()
                    .filter(|s| s.formation == Formation::FromConfigPkt)
                    .filter_map(|s| s.packet)
                    .collect();
                self.queue.upload_edge(&packets);
            }
            BridgeEvent::Cleared(statuses) => {
                log::debug!("{} bridge(s) pruned", statuses.len());
            }
        }
    }

    fn downlink(&self, runtime: &mut Runtime, raw: String) {
        if is_vbridge_message(&raw, &runtime.vbridge_mac) {
            self.vbridge.downlink(raw);
            return;
        }
        let message = match DownlinkMessage::parse(&raw) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("dropping downlink {}: {}", escape_log(&raw), e);
                return;
            }
        };
        if !message.is_eligible(runtime.cloud_managed) {
            log::info!("ignoring downlink on a gateway that is not cloud managed");
            return;
        }
        match message {
            DownlinkMessage::Configuration(conf) => {
                runtime.apply(&conf);
                log::info!("gateway configuration updated: {:?}", runtime.settings);
                self.pipeline.set_policy(runtime.policy.clone());
                self.vbridge.set_pacer_interval(runtime.settings.pacing_period_ms / 1000);
                self.queue.update_settings(runtime.settings.clone());
                self.queue.send_capabilities();
                self.queue.send_heartbeat();
            }
            DownlinkMessage::CustomBroker(custom) => {
                sec_log!("broker routing changed by downlink, custom={}", custom.custom_broker);
                self.queue.set_custom_broker(Some(custom));
            }
            DownlinkMessage::Action(action) => {
                // bridge actions need a radio; they are acknowledged in the log only
                self.queue
                    .send_logs(vec![format!("WLT_INFO: UnsupportedAction={}", action.action.code())]);
                log::info!("bridge action {:?} for {:?} not supported here", action.action, action.bridge_id);
            }
        }
    }
}

fn spawn_router(
    mut runtime: Runtime,
    routes: Routes,
    mut dispatch_rx: mpsc::UnboundedReceiver<Dispatch>,
    mut bridge_rx: mpsc::UnboundedReceiver<BridgeEvent>,
    mut vbridge_rx: mpsc::UnboundedReceiver<Packet>,
    mut downlink_rx: mpsc::UnboundedReceiver<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                batch = dispatch_rx.recv() => {
                    let Some(batch) = batch else { break };
                    routes.dispatch(batch);
                }
                Some(event) = bridge_rx.recv() => routes.bridge_event(event),
                Some(packet) = vbridge_rx.recv() => routes.pipeline.ingest_packet(packet),
                Some(raw) = downlink_rx.recv() => routes.downlink(&mut runtime, raw),
            }
        }
        log::debug!("router loop terminated");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataOutputFilter;

    #[test]
    fn configuration_updates_policy_and_settings() {
        let mut rt = Runtime {
            cloud_managed: true,
            policy: TrafficPolicy::default(),
            settings: ReportedSettings {
                pacing_period_ms: 15_000,
                upstream_enabled: true,
                upload_pixels_traffic: true,
                upload_configuration_traffic: true,
                ble_logs_enabled: false,
                data_mode: DataOutputFilter::BridgesAndPixels,
            },
            vbridge_mac: "0A1B2C3D4E5F".into(),
        };
        let Ok(DownlinkMessage::Configuration(conf)) = DownlinkMessage::parse(
            r#"{"gatewayConf":{"additional":{"pacingPeriod":30,"uploadConfigurationTraffic":false,"gwDataMode":"BRIDGES_ONLY"}}}"#,
        ) else {
            panic!("not a configuration");
        };
        rt.apply(&conf);
        assert_eq!(rt.settings.pacing_period_ms, 30_000);
        assert!(!rt.policy.enable_edge);
        assert!(rt.policy.enable_data);
        assert_eq!(rt.policy.filter, DataOutputFilter::BridgesOnly);
    }
}
