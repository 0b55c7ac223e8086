//! Crate-wide error type
//!
//! Each subsystem defines its own error enum; this aggregate exists for
//! callers that drive several subsystems and want one `?`-able type.

use thiserror::Error;

use crate::activation::ActivationError;
use crate::config::ConfigError;
use crate::engine::EngineError;
use crate::envelope::CodecError;
use crate::http::HttpError;
use crate::ota::OtaError;
use crate::session::SessionError;
use crate::store::StoreError;

/// Any error the cloud service can produce.
#[derive(Debug, Error)]
pub enum CloudError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("envelope codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("http error: {0}")]
    Http(#[from] HttpError),

    #[error("activation error: {0}")]
    Activation(#[from] ActivationError),

    #[error("ota error: {0}")]
    Ota(#[from] OtaError),

    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub type CloudResult<T> = Result<T, CloudError>;
