//! # Delivery Queue
//!
//! Owns the broker connection and everything published on it.
//!
//! [`Uplink`] establishes the connection under a mutex, exchanging the gateway token
//! when needed, and hands out the session topics. Each successful connect publishes a
//! fresh connection id that the downlink subscription follows.
//!
//! The queue actor started by [`start_queue`] collects upload items, and on every tick
//! flushes them sorted by sequence id as one envelope on the data topic. The batch is
//! cleared whether or not the publish succeeds; post-flush callbacks only run on
//! success. Capabilities, heartbeats and logs go to the status topic. Publishing happens
//! off the mailbox so a slow broker never blocks ingestion.

pub mod broker;
pub mod credentials;
pub mod downlink;
pub mod payloads;

use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use uuid::Uuid;

use crate::clock::now_millis;
use crate::config::{Config, CustomBrokerConfig, GatewayConfig};
use crate::metrics;
use crate::packet::Packet;

use broker::{BrokerError, BrokerTransport, ConnectOptions, Endpoint, Topics, TransportFactory, Will, KEEP_ALIVE_SECS};
use credentials::CredentialManager;
use payloads::{ChipInfo, GatewayEnvelope, ReportedSettings, SequenceCounter, UploadItem};

/// Which session topic a message goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Status,
    Data,
}

/// A live broker connection.
#[derive(Clone)]
pub struct Session {
    pub id: Uuid,
    pub topics: Topics,
    transport: Arc<dyn BrokerTransport>,
}

impl Session {
    fn topic(&self, channel: Channel) -> &str {
        match channel {
            Channel::Status => &self.topics.status,
            Channel::Data => &self.topics.data,
        }
    }
}

struct Connection {
    endpoint: Endpoint,
    session: Option<Session>,
}

/// Broker connection manager.
pub struct Uplink {
    gateway: GatewayConfig,
    cloud_url: String,
    factory: Arc<dyn TransportFactory>,
    credentials: Arc<CredentialManager>,
    conn: Mutex<Connection>,
    connection_id: watch::Sender<Option<Uuid>>,
}

impl Uplink {
    pub fn new(
        gateway: GatewayConfig,
        cloud_url: &str,
        custom: Option<CustomBrokerConfig>,
        factory: Arc<dyn TransportFactory>,
        credentials: Arc<CredentialManager>,
    ) -> Self {
        let (connection_id, _) = watch::channel(None);
        let endpoint = Self::endpoint_for(cloud_url, &gateway, custom);
        Self {
            gateway,
            cloud_url: cloud_url.to_string(),
            factory,
            credentials,
            conn: Mutex::new(Connection {
                endpoint,
                session: None,
            }),
            connection_id,
        }
    }

    fn endpoint_for(cloud_url: &str, gateway: &GatewayConfig, custom: Option<CustomBrokerConfig>) -> Endpoint {
        match custom.filter(|c| c.custom_broker) {
            Some(c) => Endpoint::Custom(c),
            None => Endpoint::Cloud {
                url: cloud_url.to_string(),
                environment: gateway.environment.clone(),
            },
        }
    }

    /// Id of the current connection; `None` while disconnected.
    pub fn connection_ids(&self) -> watch::Receiver<Option<Uuid>> {
        self.connection_id.subscribe()
    }

    pub async fn endpoint(&self) -> Endpoint {
        self.conn.lock().await.endpoint.clone()
    }

    async fn connect_options(&self, endpoint: &Endpoint) -> Result<(ConnectOptions, Topics)> {
        let (username, password, owner) = match endpoint {
            Endpoint::Custom(c) => (
                c.username.clone(),
                c.password.clone(),
                c.owner_id().unwrap_or(&self.gateway.owner_id).to_string(),
            ),
            Endpoint::Cloud { .. } => {
                let token = self
                    .credentials
                    .access_token()
                    .await
                    .context("gateway token unavailable")?;
                let owner = self
                    .credentials
                    .token_owner()
                    .await
                    .unwrap_or_else(|| self.gateway.owner_id.clone());
                (owner.clone(), token, owner)
            }
        };
        let topics = Topics::for_endpoint(endpoint, &owner, &self.gateway.gateway_id);
        let options = ConnectOptions {
            client_id: self.gateway.gateway_id.clone(),
            username,
            password,
            keep_alive_secs: KEEP_ALIVE_SECS,
            clean_session: true,
            will: Some(Will {
                topic: topics.status.clone(),
                payload: payloads::will().to_string().into_bytes(),
            }),
        };
        Ok((options, topics))
    }

    /// Current session, connecting first if there is none. A refused token is dropped
    /// and the connect retried once.
    pub async fn ensure_connected(&self) -> Result<Session> {
        let mut conn = self.conn.lock().await;
        if let Some(session) = conn.session.as_ref().filter(|s| s.transport.is_connected()) {
            return Ok(session.clone());
        }
        let endpoint = conn.endpoint.clone();
        let transport: Arc<dyn BrokerTransport> = Arc::from(self.factory.create(&endpoint));
        let mut retried = false;
        loop {
            let (options, topics) = self.connect_options(&endpoint).await?;
            match transport.connect(&options).await {
                Ok(()) => {
                    let session = Session {
                        id: Uuid::new_v4(),
                        topics,
                        transport: Arc::clone(&transport),
                    };
                    log::info!("connected to {} ({})", endpoint.server_uri(), session.id);
                    conn.session = Some(session.clone());
                    self.connection_id.send_replace(Some(session.id));
                    return Ok(session);
                }
                Err(BrokerError::NotAuthorized) if !retried && !endpoint.is_custom() => {
                    log::warn!(target: "security", "broker refused gateway token, exchanging it");
                    self.credentials.invalidate().await;
                    retried = true;
                }
                Err(e) => {
                    return Err(anyhow!(e)).with_context(|| format!("connect to {} failed", endpoint.server_uri()));
                }
            }
        }
    }

    /// Drop the current connection, if any.
    pub async fn release(&self) {
        let mut conn = self.conn.lock().await;
        if let Some(session) = conn.session.take() {
            session.transport.disconnect().await;
            log::info!("released broker connection {}", session.id);
        }
        self.connection_id.send_replace(None);
    }

    /// Switch into or out of custom broker mode. The current connection is torn down;
    /// the next operation connects to the new endpoint.
    pub async fn set_custom_broker(&self, custom: Option<CustomBrokerConfig>) {
        let mut conn = self.conn.lock().await;
        let endpoint = Self::endpoint_for(&self.cloud_url, &self.gateway, custom);
        if endpoint == conn.endpoint {
            return;
        }
        log::info!("broker endpoint now {}", endpoint.server_uri());
        if let Some(session) = conn.session.take() {
            session.transport.disconnect().await;
        }
        conn.endpoint = endpoint;
        self.connection_id.send_replace(None);
    }

    async fn publish_once(&self, channel: Channel, body: &[u8]) -> Result<(), BrokerError> {
        let session = self
            .ensure_connected()
            .await
            .map_err(|e| BrokerError::Connection(format!("{:#}", e)))?;
        session.transport.publish(session.topic(channel), body).await
    }

    pub async fn publish(&self, channel: Channel, payload: &Value) -> Result<()> {
        let body = payload.to_string().into_bytes();
        let mut result = self.publish_once(channel, &body).await;
        if result == Err(BrokerError::NotAuthorized) {
            self.credentials.invalidate().await;
            self.release().await;
            result = self.publish_once(channel, &body).await;
        }
        match result {
            Ok(()) => {
                metrics::inc_publish_ok();
                Ok(())
            }
            Err(e) => {
                metrics::inc_publish_failed();
                self.release().await;
                Err(anyhow!(e)).context("publish failed")
            }
        }
    }

    /// Subscribe to the update topic of the current session.
    pub async fn subscribe_updates(&self) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, BrokerError> {
        let session = {
            let conn = self.conn.lock().await;
            conn.session.clone().ok_or(BrokerError::NotConnected)?
        };
        session.transport.subscribe(&session.topics.update).await
    }
}

/// Follow connection ids and keep one update-topic subscription per connection.
fn spawn_downlink(uplink: Weak<Uplink>, mut ids: watch::Receiver<Option<Uuid>>, downlink: mpsc::UnboundedSender<String>) {
    tokio::spawn(async move {
        loop {
            let current = *ids.borrow_and_update();
            let mut reconnected = false;
            if let (Some(id), Some(up)) = (current, uplink.upgrade()) {
                let subscription = up.subscribe_updates().await;
                drop(up);
                match subscription {
                    Ok(mut rx) => {
                        log::debug!("downlink subscribed on connection {}", id);
                        loop {
                            tokio::select! {
                                msg = rx.recv() => {
                                    let Some(bytes) = msg else { break };
                                    if downlink.send(String::from_utf8_lossy(&bytes).into_owned()).is_err() {
                                        return;
                                    }
                                }
                                changed = ids.changed() => {
                                    if changed.is_err() {
                                        return;
                                    }
                                    reconnected = true;
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => log::warn!("downlink subscribe failed: {}", e),
                }
            }
            if !reconnected && ids.changed().await.is_err() {
                break;
            }
        }
        log::debug!("downlink subscription ended");
    });
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub gateway: GatewayConfig,
    pub tick_ms: u64,
    pub watchdog_period: Duration,
    pub watchdog_idle: Duration,
    pub heartbeat_period: Duration,
    pub settings: ReportedSettings,
}

impl QueueConfig {
    pub fn from_config(config: &Config, pacing_ms: u64) -> Self {
        Self {
            gateway: config.gateway.clone(),
            tick_ms: config.timing.queue_tick_ms(),
            watchdog_period: config.timing.watchdog_period(),
            watchdog_idle: config.timing.watchdog_idle(),
            heartbeat_period: config.timing.gateway_heartbeat(),
            settings: ReportedSettings {
                pacing_period_ms: pacing_ms,
                upstream_enabled: config.traffic.upstream_enabled,
                upload_pixels_traffic: config.traffic.enable_data_traffic,
                upload_configuration_traffic: config.traffic.enable_edge_traffic,
                ble_logs_enabled: config.traffic.ble_logs_enabled,
                data_mode: config.traffic.data_output_filter,
            },
        }
    }
}

/// Callback run after the batch it was queued with has been published.
pub type Terminator = Box<dyn FnOnce() + Send + 'static>;

pub enum QueueCommand {
    AddData {
        items: Vec<UploadItem>,
        terminator: Option<Terminator>,
    },
    Flushed {
        count: usize,
        ok: bool,
    },
    Capabilities,
    Heartbeat,
    Logs(Vec<String>),
    UpdateSettings(ReportedSettings),
    SetChipInfo(ChipInfo),
    SetCustomBroker(Option<CustomBrokerConfig>),
    Snapshot(oneshot::Sender<QueueStats>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub flushes: u64,
    pub published_items: u64,
    pub failed_flushes: u64,
    /// Time of the last non-empty flush, epoch ms. Zero before the first one.
    pub last_upload: i64,
}

#[derive(Clone)]
pub struct QueueHandle {
    tx: mpsc::UnboundedSender<QueueCommand>,
    seq: SequenceCounter,
    uplink: Arc<Uplink>,
}

impl QueueHandle {
    pub fn add_data(&self, items: Vec<UploadItem>) {
        if items.is_empty() {
            return;
        }
        let _ = self.tx.send(QueueCommand::AddData { items, terminator: None });
    }

    pub fn add_data_then(&self, items: Vec<UploadItem>, terminator: Terminator) {
        let _ = self.tx.send(QueueCommand::AddData {
            items,
            terminator: Some(terminator),
        });
    }

    /// Queue pixel traffic; packets the cloud does not take are skipped.
    pub fn upload_packets(&self, packets: &[Packet]) {
        let items: Vec<UploadItem> = packets.iter().filter_map(|p| UploadItem::data(p, &self.seq)).collect();
        self.add_data(items);
    }

    /// Queue bridge management traffic.
    pub fn upload_edge(&self, packets: &[Packet]) {
        let items: Vec<UploadItem> = packets.iter().map(|p| UploadItem::edge(p, &self.seq)).collect();
        self.add_data(items);
    }

    pub fn send_capabilities(&self) {
        let _ = self.tx.send(QueueCommand::Capabilities);
    }

    pub fn send_heartbeat(&self) {
        let _ = self.tx.send(QueueCommand::Heartbeat);
    }

    pub fn send_logs(&self, lines: Vec<String>) {
        if !lines.is_empty() {
            let _ = self.tx.send(QueueCommand::Logs(lines));
        }
    }

    pub fn update_settings(&self, settings: ReportedSettings) {
        let _ = self.tx.send(QueueCommand::UpdateSettings(settings));
    }

    pub fn set_chip_info(&self, chip: ChipInfo) {
        let _ = self.tx.send(QueueCommand::SetChipInfo(chip));
    }

    pub fn set_custom_broker(&self, custom: Option<CustomBrokerConfig>) {
        let _ = self.tx.send(QueueCommand::SetCustomBroker(custom));
    }

    pub fn connection_ids(&self) -> watch::Receiver<Option<Uuid>> {
        self.uplink.connection_ids()
    }

    pub fn uplink(&self) -> &Arc<Uplink> {
        &self.uplink
    }

    pub async fn snapshot(&self) -> Option<QueueStats> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(QueueCommand::Snapshot(tx)).is_ok() {
            rx.await.ok()
        } else {
            None
        }
    }

    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        let _ = self.tx.send(QueueCommand::Shutdown(tx));
        let _ = rx.await;
    }
}

fn spawn_publish(uplink: &Arc<Uplink>, channel: Channel, payload: Value, what: &'static str) {
    let uplink = Arc::clone(uplink);
    tokio::spawn(async move {
        if let Err(e) = uplink.publish(channel, &payload).await {
            log::warn!("{} not sent: {:#}", what, e);
        }
    });
}

pub fn start_queue(
    cfg: QueueConfig,
    uplink: Arc<Uplink>,
    downlink: Option<mpsc::UnboundedSender<String>>,
) -> QueueHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<QueueCommand>();
    let mailbox = tx.downgrade();
    let handle = QueueHandle {
        tx,
        seq: SequenceCounter::default(),
        uplink: Arc::clone(&uplink),
    };
    if let (true, Some(downlink)) = (cfg.gateway.cloud_managed, downlink) {
        spawn_downlink(Arc::downgrade(&uplink), uplink.connection_ids(), downlink);
    }

    tokio::spawn(async move {
        let mut batch: Vec<UploadItem> = Vec::new();
        let mut terminators: Vec<Terminator> = Vec::new();
        let mut settings = cfg.settings.clone();
        let mut chip: Option<ChipInfo> = None;
        let mut stats = QueueStats::default();

        let mut tick = tokio::time::interval(Duration::from_millis(cfg.tick_ms.max(1)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let start = tokio::time::Instant::now();
        let mut watchdog = tokio::time::interval_at(start + cfg.watchdog_period, cfg.watchdog_period);
        let mut heartbeat = tokio::time::interval_at(start + cfg.heartbeat_period, cfg.heartbeat_period);

        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    match cmd {
                        QueueCommand::AddData { items, terminator } => {
                            batch.extend(items);
                            terminators.extend(terminator);
                        }
                        QueueCommand::Flushed { count, ok } => {
                            if ok {
                                stats.published_items += count as u64;
                            } else {
                                stats.failed_flushes += 1;
                            }
                        }
                        QueueCommand::Capabilities => {
                            spawn_publish(&uplink, Channel::Status, payloads::capabilities(&cfg.gateway, &settings), "capabilities");
                        }
                        QueueCommand::Heartbeat => {
                            spawn_publish(&uplink, Channel::Status, payloads::heartbeat(&cfg.gateway, &settings, chip.as_ref()), "heartbeat");
                        }
                        QueueCommand::Logs(lines) => {
                            spawn_publish(&uplink, Channel::Status, payloads::logs(&lines), "gateway logs");
                        }
                        QueueCommand::UpdateSettings(s) => {
                            log::info!("queue settings updated: {:?}", s);
                            settings = s;
                        }
                        QueueCommand::SetChipInfo(c) => chip = Some(c),
                        QueueCommand::SetCustomBroker(custom) => {
                            let uplink = Arc::clone(&uplink);
                            tokio::spawn(async move { uplink.set_custom_broker(custom).await });
                        }
                        QueueCommand::Snapshot(resp) => {
                            let _ = resp.send(QueueStats { pending: batch.len(), ..stats.clone() });
                        }
                        QueueCommand::Shutdown(done) => {
                            let _ = done.send(());
                            break;
                        }
                    }
                }
                _ = tick.tick() => {
                    if batch.is_empty() {
                        continue;
                    }
                    let mut items = std::mem::take(&mut batch);
                    let callbacks = std::mem::take(&mut terminators);
                    items.sort_by_key(|i| i.sequence_id);
                    stats.flushes += 1;
                    stats.last_upload = now_millis();
                    if !settings.upstream_enabled {
                        log::debug!("upstream disabled, dropping {} item(s)", items.len());
                        continue;
                    }
                    let count = items.len();
                    let envelope = GatewayEnvelope::new(&cfg.gateway, items, now_millis());
                    let uplink = Arc::clone(&uplink);
                    let mailbox = mailbox.clone();
                    tokio::spawn(async move {
                        let payload = match serde_json::to_value(&envelope) {
                            Ok(v) => v,
                            Err(e) => {
                                log::error!("could not encode upload: {}", e);
                                return;
                            }
                        };
                        let ok = match uplink.publish(Channel::Data, &payload).await {
                            Ok(()) => {
                                log::debug!("uploaded {} item(s)", count);
                                callbacks.into_iter().for_each(|f| f());
                                true
                            }
                            Err(e) => {
                                log::warn!("upload of {} item(s) failed: {:#}", count, e);
                                false
                            }
                        };
                        if let Some(tx) = mailbox.upgrade() {
                            let _ = tx.send(QueueCommand::Flushed { count, ok });
                        }
                    });
                }
                _ = watchdog.tick() => {
                    if cfg.gateway.cloud_managed {
                        continue;
                    }
                    let idle = now_millis() - stats.last_upload;
                    if idle >= cfg.watchdog_idle.as_millis() as i64 {
                        log::debug!("no upload for {} ms, releasing connection", idle);
                        let uplink = Arc::clone(&uplink);
                        tokio::spawn(async move { uplink.release().await });
                    }
                }
                _ = heartbeat.tick() => {
                    if cfg.gateway.cloud_managed {
                        spawn_publish(&uplink, Channel::Status, payloads::heartbeat(&cfg.gateway, &settings, chip.as_ref()), "heartbeat");
                    }
                }
            }
        }
        log::debug!("delivery queue loop terminated");
    });

    handle
}
