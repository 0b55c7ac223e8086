//! Shared service status
//!
//! One record, one mutex. Everything the application can observe about the
//! session lives here: lifecycle state, activation result, and the last
//! known OTA descriptor. Guards are never held across await points.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::activation::RomVersionInfo;

/// Session lifecycle state. Within one connection attempt the state only
/// moves forward: Stopped → Started → Connected, with Disconnected looping
/// back to Started on recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Stopped,
    Started,
    Connected,
    Disconnected,
}

/// Mutable service record shared across tasks.
#[derive(Debug, Clone)]
pub struct ServiceStatus {
    pub state: SessionState,
    pub activated: bool,
    pub device_id: String,
    pub device_key: String,
    /// Version of the currently installed firmware.
    pub rom_version: String,
    /// Latest firmware advertised by the backend, if queried.
    pub latest_rom: Option<RomVersionInfo>,
    pub last_transition: DateTime<Utc>,
}

impl Default for ServiceStatus {
    fn default() -> Self {
        Self {
            state: SessionState::Stopped,
            activated: false,
            device_id: String::new(),
            device_key: String::new(),
            rom_version: String::new(),
            latest_rom: None,
            last_transition: Utc::now(),
        }
    }
}

/// Clonable handle over the mutex-guarded status record.
#[derive(Debug, Clone, Default)]
pub(crate) struct SharedStatus(Arc<Mutex<ServiceStatus>>);

impl SharedStatus {
    pub(crate) fn new(initial: ServiceStatus) -> Self {
        Self(Arc::new(Mutex::new(initial)))
    }

    pub(crate) fn snapshot(&self) -> ServiceStatus {
        self.lock().clone()
    }

    pub(crate) fn state(&self) -> SessionState {
        self.lock().state
    }

    /// Apply a read-modify-write under the mutex.
    pub(crate) fn update(&self, f: impl FnOnce(&mut ServiceStatus)) {
        f(&mut self.lock());
    }

    /// Set the lifecycle state; returns true when it actually changed.
    pub(crate) fn set_state(&self, state: SessionState) -> bool {
        let mut guard = self.lock();
        if guard.state == state {
            return false;
        }
        guard.state = state;
        guard.last_transition = Utc::now();
        true
    }

    fn lock(&self) -> MutexGuard<'_, ServiceStatus> {
        // A poisoned guard still holds consistent data for this record
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}
