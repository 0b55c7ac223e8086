//! Observability
//!
//! Structured logging setup for hosts embedding the cloud service. Nothing
//! in the library initializes logging on its own; call
//! [`init_default_logging`] (or [`init_logging`]) once at startup.

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat};
