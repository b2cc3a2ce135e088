//! Broker transport seam.
//!
//! The socket itself lives outside this crate. [`BrokerTransport`] is what the delivery
//! queue needs from it; a [`TransportFactory`] builds one for either the cloud broker or a
//! custom broker. [`LoggingTransport`] writes publications to the log and is used by the
//! CLI when no broker is wired in.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::CustomBrokerConfig;
use crate::logutil::escape_log;

pub const KEEP_ALIVE_SECS: u16 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// Credentials refused by the broker. The token is dropped and the operation retried.
    #[error("broker rejected credentials")]
    NotAuthorized,
    #[error("broker operation timed out")]
    Timeout,
    #[error("broker connection failed: {0}")]
    Connection(String),
    #[error("not connected")]
    NotConnected,
    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },
}

/// Where the transport connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Cloud { url: String, environment: String },
    Custom(CustomBrokerConfig),
}

impl Endpoint {
    pub fn server_uri(&self) -> String {
        match self {
            Endpoint::Cloud { url, .. } => url.clone(),
            Endpoint::Custom(c) => c.broker(),
        }
    }

    pub fn is_custom(&self) -> bool {
        matches!(self, Endpoint::Custom(_))
    }
}

/// Last will published by the broker when the gateway drops off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub keep_alive_secs: u16,
    pub clean_session: bool,
    pub will: Option<Will>,
}

/// Status, data and downlink topics for one gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub status: String,
    pub data: String,
    pub update: String,
}

impl Topics {
    pub fn standard(owner_id: &str, gateway_id: &str) -> Self {
        Self {
            status: format!("status/{}/{}", owner_id, gateway_id),
            data: format!("data/{}/{}", owner_id, gateway_id),
            update: format!("update/{}/{}", owner_id, gateway_id),
        }
    }

    pub fn custom(cfg: &CustomBrokerConfig) -> Self {
        Self {
            status: cfg.status_topic.clone(),
            data: cfg.data_topic.clone(),
            update: cfg.update_topic.clone(),
        }
    }

    pub fn for_endpoint(endpoint: &Endpoint, owner_id: &str, gateway_id: &str) -> Self {
        match endpoint {
            Endpoint::Custom(c) => Self::custom(c),
            Endpoint::Cloud { .. } => Self::standard(owner_id, gateway_id),
        }
    }
}

#[async_trait]
pub trait BrokerTransport: Send + Sync {
    async fn connect(&self, options: &ConnectOptions) -> Result<(), BrokerError>;
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BrokerError>;
    /// Messages arriving on `topic`. The stream ends when the connection goes away.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, BrokerError>;
    async fn disconnect(&self);
    fn is_connected(&self) -> bool;
}

pub trait TransportFactory: Send + Sync {
    fn create(&self, endpoint: &Endpoint) -> Box<dyn BrokerTransport>;
}

/// Transport that only logs. Subscriptions never deliver anything.
#[derive(Debug, Default)]
pub struct LoggingTransport {
    connected: AtomicBool,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Vec<u8>>>>,
}

#[async_trait]
impl BrokerTransport for LoggingTransport {
    async fn connect(&self, options: &ConnectOptions) -> Result<(), BrokerError> {
        log::info!("broker connect as {} (client {})", options.username, options.client_id);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        log::info!("publish {} {}", topic, escape_log(&String::from_utf8_lossy(payload)));
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, BrokerError> {
        log::debug!("subscribe {}", topic);
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }
        Ok(rx)
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.clear();
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingTransportFactory;

impl TransportFactory for LoggingTransportFactory {
    fn create(&self, endpoint: &Endpoint) -> Box<dyn BrokerTransport> {
        log::debug!("new logging transport for {}", endpoint.server_uri());
        Box::new(LoggingTransport::default())
    }
}
