//! cloudlink - device-to-cloud connectivity core
//!
//! The connectivity layer of a WiFi-connected device: one-time activation
//! against a device backend, a persistent MQTT session for bidirectional
//! messaging, and OTA firmware download with checksum validation.
//!
//! # Overview
//!
//! - [`session::CloudService`] - top-level lifecycle: network wait,
//!   activation, MQTT session supervision
//! - [`engine`] - the MQTT connection engine and its publish handle
//! - [`envelope`] - the binary publish-envelope codec
//! - [`activation`] - backend activation/authorization client
//! - [`ota`] - streaming firmware download into a [`ota::FirmwareSink`]
//! - [`http`] - minimal chunk-aware HTTP response reader used by OTA
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cloudlink::{CloudService, FileStore, NullEvents, ServiceConfig};
//!
//! # async fn run() -> cloudlink::CloudResult<()> {
//! let config = ServiceConfig::load_from_file("cloudlink.toml")?;
//! let store = Arc::new(FileStore::new("device.toml"));
//! let (network_tx, network_rx) = tokio::sync::watch::channel(true);
//!
//! let mut service = CloudService::new(config, store, Arc::new(NullEvents), network_rx)?;
//! service.start()?;
//!
//! // ... later, once connected:
//! service.publish(b"{\"temperature\": 21.5}")?;
//!
//! service.stop().await;
//! # drop(network_tx);
//! # Ok(())
//! # }
//! ```

pub mod activation;
pub mod config;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod events;
pub mod http;
pub mod observability;
pub mod ota;
pub mod session;
pub mod store;
pub mod testing;

pub use activation::{ActivationClient, DeviceCredentials, RomVersionInfo};
pub use config::ServiceConfig;
pub use engine::{EngineHandle, EngineState, MqttEngine};
pub use error::{CloudError, CloudResult};
pub use events::{CloudEvents, NullEvents};
pub use ota::{FirmwareSink, OtaDownloader, OtaOutcome};
pub use session::{CloudService, ServiceStatus, SessionState};
pub use store::{DeviceRecord, DeviceStore, FileStore};
