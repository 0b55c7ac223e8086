//! Application callback seams
//!
//! The service reports connectivity transitions and inbound MQTT messages
//! through this trait. Implementations must be cheap and non-blocking; both
//! callbacks are invoked from the service's background tasks.

use crate::session::SessionState;

/// Callbacks delivered by the cloud service and its MQTT engine.
pub trait CloudEvents: Send + Sync + 'static {
    /// Called once per session state transition.
    fn on_status_changed(&self, state: SessionState);

    /// Called for every message received on the subscribed topic.
    fn on_message(&self, topic: &str, payload: &[u8]);
}

/// Event sink that discards everything. Useful as a default and in tests.
#[derive(Debug, Default)]
pub struct NullEvents;

impl CloudEvents for NullEvents {
    fn on_status_changed(&self, _state: SessionState) {}
    fn on_message(&self, _topic: &str, _payload: &[u8]) {}
}
