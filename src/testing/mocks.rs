//! Mock implementations for testing
//!
//! In-memory DeviceStore, CloudEvents, and FirmwareSink implementations so
//! the whole service can be exercised without a filesystem, a broker, or
//! flash hardware.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::events::CloudEvents;
use crate::ota::{FirmwareSink, OtaError};
use crate::session::SessionState;
use crate::store::{DeviceRecord, DeviceStore, StoreError};

/// In-memory device store. Counts saves so tests can assert the
/// persist-exactly-once behavior of activation.
#[derive(Debug, Default)]
pub struct MemoryStore {
    record: Mutex<DeviceRecord>,
    save_count: Mutex<u32>,
    fail_saves: bool,
}

impl MemoryStore {
    /// Store that rejects every save.
    pub fn failing() -> Self {
        Self {
            fail_saves: true,
            ..Default::default()
        }
    }

    /// Seed the stored record.
    pub fn put(&self, record: DeviceRecord) {
        *self.record.lock().unwrap() = record;
    }

    pub fn record(&self) -> DeviceRecord {
        self.record.lock().unwrap().clone()
    }

    pub fn save_count(&self) -> u32 {
        *self.save_count.lock().unwrap()
    }
}

impl DeviceStore for MemoryStore {
    fn load(&self) -> Result<DeviceRecord, StoreError> {
        Ok(self.record.lock().unwrap().clone())
    }

    fn save(&self, record: &DeviceRecord) -> Result<(), StoreError> {
        *self.save_count.lock().unwrap() += 1;
        if self.fail_saves {
            return Err(StoreError::Write(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "mock save failure",
            )));
        }
        *self.record.lock().unwrap() = record.clone();
        Ok(())
    }
}

/// Event sink that records every callback.
#[derive(Debug, Default)]
pub struct RecordingEvents {
    states: Arc<Mutex<Vec<SessionState>>>,
    messages: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
}

impl RecordingEvents {
    pub fn states(&self) -> Vec<SessionState> {
        self.states.lock().unwrap().clone()
    }

    pub fn messages(&self) -> Vec<(String, Vec<u8>)> {
        self.messages.lock().unwrap().clone()
    }
}

impl CloudEvents for RecordingEvents {
    fn on_status_changed(&self, state: SessionState) {
        self.states.lock().unwrap().push(state);
    }

    fn on_message(&self, topic: &str, payload: &[u8]) {
        self.messages
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_vec()));
    }
}

/// In-memory firmware sink standing in for a flash partition.
#[derive(Debug, Default)]
pub struct MemorySink {
    written: Vec<u8>,
    committed: Option<(u64, String)>,
    aborted: bool,
    fail_past: Option<usize>,
}

impl MemorySink {
    /// Sink whose writes fail once more than `limit` bytes would land,
    /// simulating a full or bad flash region.
    pub fn failing_after(limit: usize) -> Self {
        Self {
            fail_past: Some(limit),
            ..Default::default()
        }
    }

    pub fn written(&self) -> &[u8] {
        &self.written
    }

    pub fn committed(&self) -> Option<(u64, String)> {
        self.committed.clone()
    }

    pub fn aborted(&self) -> bool {
        self.aborted
    }
}

#[async_trait]
impl FirmwareSink for MemorySink {
    async fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), OtaError> {
        assert_eq!(
            offset,
            self.written.len() as u64,
            "writes must advance contiguously"
        );
        if let Some(limit) = self.fail_past {
            if self.written.len() + data.len() > limit {
                return Err(OtaError::Flash("mock flash write failure".into()));
            }
        }
        self.written.extend_from_slice(data);
        Ok(())
    }

    async fn commit(&mut self, total_len: u64, md5_hex: &str) -> Result<(), OtaError> {
        assert_eq!(total_len, self.written.len() as u64);
        self.committed = Some((total_len, md5_hex.to_string()));
        Ok(())
    }

    async fn abort(&mut self) {
        self.aborted = true;
    }
}
