//! Backend activation and authorization client
//!
//! One-time device registration (`/v1/device/activate`), re-authorization
//! (`/v1/device/authorize`), and OTA version discovery
//! (`/v1/rom/lastversion`). Requests are plain JSON over HTTP with a short
//! timeout; all failures are returned to the caller, which owns the retry
//! policy.

use std::time::Duration;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Read timeout applied to every backend request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

const ACTIVATE_PATH: &str = "/v1/device/activate";
const AUTHORIZE_PATH: &str = "/v1/device/authorize";
const LAST_VERSION_PATH: &str = "/v1/rom/lastversion";

#[derive(Debug, Error)]
pub enum ActivationError {
    #[error("invalid backend url: {0}")]
    InvalidUrl(String),
    #[error("request failed")]
    Request(#[from] reqwest::Error),
    #[error("backend rejected request with status {status}")]
    Rejected { status: u16 },
    #[error("malformed backend response")]
    Format(#[source] reqwest::Error),
}

/// Request body shared by activate and authorize.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceAuthRequest {
    pub product_id: String,
    pub bssid: String,
    pub device_token: String,
    pub user_token: String,
}

/// Credentials returned by a successful activate/authorize call.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct DeviceCredentials {
    pub device_id: String,
    #[serde(rename = "master_device_key")]
    pub device_key: String,
}

/// Latest firmware descriptor from version discovery.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RomVersionInfo {
    pub version: String,
    /// Download URL (or server-relative path) of the firmware binary.
    pub bin_file: String,
    /// Hex MD5 the downloaded image must match.
    pub bin_md5: String,
    pub bin_file_size: u64,
}

/// Derive the device token sent with auth requests: hex MD5 over the
/// hardware id and the product key.
pub fn derive_device_token(bssid: &str, product_key: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(bssid.as_bytes());
    hasher.update(product_key.as_bytes());
    hex_digest(&hasher.finalize())
}

/// Lowercase hex rendering of a digest.
pub(crate) fn hex_digest(digest: &[u8]) -> String {
    use std::fmt::Write;
    digest.iter().fold(String::with_capacity(digest.len() * 2), |mut out, byte| {
        let _ = write!(out, "{byte:02x}");
        out
    })
}

/// HTTP client for the device backend.
#[derive(Debug, Clone)]
pub struct ActivationClient {
    http: reqwest::Client,
    base_url: Url,
}

impl ActivationClient {
    pub fn new(base_url: &str) -> Result<Self, ActivationError> {
        let base_url =
            Url::parse(base_url).map_err(|_| ActivationError::InvalidUrl(base_url.to_string()))?;
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { http, base_url })
    }

    /// Register the device, yielding its id and master key.
    pub async fn activate(
        &self,
        request: &DeviceAuthRequest,
    ) -> Result<DeviceCredentials, ActivationError> {
        self.post_auth(ACTIVATE_PATH, request).await
    }

    /// Re-authorize an already-activated device.
    pub async fn authorize(
        &self,
        request: &DeviceAuthRequest,
    ) -> Result<DeviceCredentials, ActivationError> {
        self.post_auth(AUTHORIZE_PATH, request).await
    }

    /// Fetch the latest published firmware descriptor.
    pub async fn latest_rom_version(&self) -> Result<RomVersionInfo, ActivationError> {
        let url = self.endpoint(LAST_VERSION_PATH)?;
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(ActivationError::Rejected {
                status: status.as_u16(),
            });
        }
        response.json().await.map_err(ActivationError::Format)
    }

    async fn post_auth(
        &self,
        path: &str,
        request: &DeviceAuthRequest,
    ) -> Result<DeviceCredentials, ActivationError> {
        let url = self.endpoint(path)?;
        tracing::debug!(%url, bssid = %request.bssid, "sending device auth request");
        let response = self.http.post(url).json(request).send().await?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(ActivationError::Rejected {
                status: status.as_u16(),
            });
        }
        response.json().await.map_err(ActivationError::Format)
    }

    fn endpoint(&self, path: &str) -> Result<Url, ActivationError> {
        self.base_url
            .join(path)
            .map_err(|_| ActivationError::InvalidUrl(path.to_string()))
    }
}
