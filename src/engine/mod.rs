//! MQTT client engine
//!
//! The engine owns the single broker connection. A supervisor task runs the
//! connect/subscribe/serve loop and retries indefinitely on network failure;
//! callers interact only through [`EngineHandle`], which funnels encoded
//! publish envelopes into the supervisor over a bounded mailbox.

mod client;
mod state;

pub use client::{EngineConfig, EngineHandle, MqttEngine};
pub(crate) use client::join_with_timeout;
pub use state::{
    can_publish, next_state, route_broker_event, BrokerEventRoute, EngineEvent, EngineState,
    RetryPolicy,
};

use thiserror::Error;

use crate::envelope::CodecError;

/// Engine-facing errors. Everything a caller can see is returned
/// synchronously; network failures inside the supervisor are retried, not
/// surfaced.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid engine configuration: {0}")]
    Config(String),
    #[error("engine already started")]
    AlreadyStarted,
    #[error("not connected (state: {state:?})")]
    NotConnected { state: EngineState },
    #[error("publish mailbox full")]
    MailboxFull,
    #[error("engine stopped")]
    Stopped,
    #[error(transparent)]
    Codec(#[from] CodecError),
}
