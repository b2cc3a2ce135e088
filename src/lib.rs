//! # pixelgw - BLE-to-cloud gateway for pixel tags and bridges
//!
//! pixelgw takes raw BLE advertisements from a scanner, classifies them into typed
//! packets, keeps registries of nearby bridges and beacons, batches traffic towards an
//! MQTT cloud endpoint and, when enabled, plays the part of a bridge for tags heard
//! directly.
//!
//! ## Features
//!
//! - **Packet Codec**: Prefix classification, bit-level field layouts per API version, and
//!   the hex encoders used for echoes, heartbeats and module exchange.
//! - **Ingestion Pipeline**: Windowed deduplication with RSSI-based retention, management
//!   and data windows, and routing to the other components.
//! - **Registries**: Bridge and beacon state with background resolution through pluggable
//!   resolvers, retry backoff and expiry.
//! - **Delivery Queue**: Sequence-ordered batches, credential exchange with a single retry,
//!   connection watchdog, downlink subscription and gateway heartbeats.
//! - **Virtual Bridge**: Echo pacing, module announcements and pacer configuration for
//!   tags no physical bridge reports.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pixelgw::config::Config;
//! use pixelgw::context::{Backends, GatewayContext};
//! use pixelgw::packet::ScanEvent;
//! use pixelgw::queue::broker::LoggingTransportFactory;
//! use pixelgw::queue::credentials::LocalCredentialApi;
//! use pixelgw::registry::OfflineResolver;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let ctx = GatewayContext::start(
//!         config,
//!         Backends {
//!             bridge_resolver: Arc::new(OfflineResolver),
//!             beacon_resolver: Arc::new(OfflineResolver),
//!             credentials: Arc::new(LocalCredentialApi),
//!             transport: Arc::new(LoggingTransportFactory),
//!         },
//!     )?;
//!     ctx.ingest(ScanEvent::new("AFFD0200005EF94AA9F15878AA1A776C7E906AE707158B06966AB6F5B9", "11:22:33:44:55:66", -60, 0));
//!     ctx.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`packet`] - Scan events, classification and payload layouts
//! - [`pipeline`] - Deduplication windows and dispatch
//! - [`registry`] - Bridge and beacon registries plus resolver traits
//! - [`queue`] - Uplink session, credentials, payload builders and the delivery queue
//! - [`vbridge`] - Virtual bridge emulation
//! - [`context`] - Wiring of all components into one running gateway
//! - [`config`] - Configuration management and validation
//!
//! ## Architecture
//!
//! ```text
//! scanner ──► pipeline ──► registries ──┐
//!                │                      ▼
//!                └──► vbridge ──► delivery queue ──► broker
//!                        ▲                 │
//!                        └──── downlink ◄──┘
//! ```

pub mod clock;
pub mod config;
pub mod context;
pub mod logutil;
pub mod metrics;
pub mod packet;
pub mod pipeline;
pub mod queue;
pub mod registry;
pub mod vbridge;
