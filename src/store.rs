//! Persistent device identity store
//!
//! The service does not own storage. Activation results (device id and key)
//! and the installed firmware version are written back through this trait;
//! the storage format is the caller's business. A TOML-backed file store is
//! provided for hosts with a filesystem, and `testing::mocks::MemoryStore`
//! covers tests.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Durable per-device state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Whether this device has completed activation.
    #[serde(default)]
    pub activated: bool,
    /// Backend-assigned device identifier.
    #[serde(default)]
    pub device_id: String,
    /// Backend-assigned device key.
    #[serde(default)]
    pub device_key: String,
    /// Version of the currently installed firmware image.
    #[serde(default)]
    pub rom_version: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store read failed")]
    Read(#[source] std::io::Error),
    #[error("store write failed")]
    Write(#[source] std::io::Error),
    #[error("store contents malformed")]
    Malformed(#[source] toml::de::Error),
    #[error("store serialization failed")]
    Serialize(#[source] toml::ser::Error),
}

/// Read/write access to the device record.
pub trait DeviceStore: Send + Sync + 'static {
    fn load(&self) -> Result<DeviceRecord, StoreError>;
    fn save(&self, record: &DeviceRecord) -> Result<(), StoreError>;
}

/// TOML file-backed device store.
///
/// A missing file loads as the default record, so first boot needs no
/// provisioning step.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl DeviceStore for FileStore {
    fn load(&self) -> Result<DeviceRecord, StoreError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(DeviceRecord::default())
            }
            Err(e) => return Err(StoreError::Read(e)),
        };
        toml::from_str(&contents).map_err(StoreError::Malformed)
    }

    fn save(&self, record: &DeviceRecord) -> Result<(), StoreError> {
        let contents = toml::to_string_pretty(record).map_err(StoreError::Serialize)?;
        std::fs::write(&self.path, contents).map_err(StoreError::Write)
    }
}
