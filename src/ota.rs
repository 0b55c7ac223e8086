//! Over-the-air firmware download
//!
//! Streams a firmware image over HTTP into a [`FirmwareSink`] while folding
//! every piece into a running MD5. The sink only sees monotonically
//! advancing writes; its boot-table commit happens strictly after the full
//! transfer matched the server-declared checksum, so a failed or corrupt
//! download never disturbs the running image.

use std::time::Duration;

use async_trait::async_trait;
use md5::{Digest, Md5};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::net::TcpStream;
use url::Url;

use crate::activation::hex_digest;
use crate::http::{read_response, BodyReader, HttpError};

#[derive(Debug, Error)]
pub enum OtaError {
    #[error("invalid firmware url: {0}")]
    InvalidUrl(String),
    #[error("connect to firmware server failed")]
    Connect(#[source] std::io::Error),
    #[error("i/o error during transfer")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("unexpected response status {status}")]
    UnexpectedStatus { status: u16 },
    #[error("firmware write failed: {0}")]
    Flash(String),
    #[error("checksum mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("boot record commit failed: {0}")]
    Commit(String),
}

/// Destination for a firmware image, normally flash behind a bootloader.
///
/// `write` is called with a strictly advancing offset. `commit` records the
/// new image as bootable and is only invoked after checksum validation;
/// `abort` discards the partial image and must leave the running firmware
/// untouched.
#[async_trait]
pub trait FirmwareSink: Send {
    async fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), OtaError>;
    async fn commit(&mut self, total_len: u64, md5_hex: &str) -> Result<(), OtaError>;
    async fn abort(&mut self);
}

/// Result of a completed download attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtaOutcome {
    /// The server sent a zero-byte body: nothing newer to install.
    UpToDate,
    /// A new image was streamed, validated, and committed.
    Updated { bytes: u64, md5_hex: String },
}

/// Firmware download client.
#[derive(Debug, Clone)]
pub struct OtaDownloader {
    connect_timeout: Duration,
}

impl Default for OtaDownloader {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl OtaDownloader {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Download `url` and stream it into `sink`, validating against
    /// `expected_md5` (hex, case-insensitive).
    pub async fn download(
        &self,
        url: &str,
        expected_md5: &str,
        sink: &mut dyn FirmwareSink,
    ) -> Result<OtaOutcome, OtaError> {
        let url = Url::parse(url).map_err(|_| OtaError::InvalidUrl(url.to_string()))?;
        if url.scheme() != "http" {
            return Err(OtaError::InvalidUrl(format!(
                "unsupported scheme {:?}",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| OtaError::InvalidUrl(url.to_string()))?
            .to_string();
        let port = url.port_or_known_default().unwrap_or(80);

        tracing::info!(%url, "starting firmware download");
        let mut stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((host.as_str(), port)),
        )
        .await
        .map_err(|_| {
            OtaError::Connect(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connect timed out",
            ))
        })?
        .map_err(OtaError::Connect)?;

        stream
            .write_all(build_get_request(&url).as_bytes())
            .await?;

        self.download_from(stream, expected_md5, sink).await
    }

    /// Run the download against an already-established response stream.
    /// Split out so tests can drive arbitrary read boundaries.
    pub async fn download_from<R: AsyncRead + Unpin + Send>(
        &self,
        reader: R,
        expected_md5: &str,
        sink: &mut dyn FirmwareSink,
    ) -> Result<OtaOutcome, OtaError> {
        let (head, mut body) = read_response(reader).await?;
        if head.status != 200 {
            return Err(OtaError::UnexpectedStatus {
                status: head.status,
            });
        }
        stream_to_sink(&mut body, expected_md5, sink).await
    }
}

/// Stream every body chunk to the sink at an advancing offset while
/// computing the digest, then validate and commit.
async fn stream_to_sink<R: AsyncRead + Unpin>(
    body: &mut BodyReader<R>,
    expected_md5: &str,
    sink: &mut dyn FirmwareSink,
) -> Result<OtaOutcome, OtaError> {
    let mut hasher = Md5::new();
    let mut offset = 0u64;

    loop {
        let chunk = match body.next_chunk().await {
            Ok(chunk) => chunk,
            Err(e) => {
                sink.abort().await;
                return Err(e.into());
            }
        };
        let Some(chunk) = chunk else { break };

        if let Err(e) = sink.write(offset, &chunk).await {
            tracing::warn!(offset, error = %e, "firmware write failed; aborting transfer");
            sink.abort().await;
            return Err(e);
        }
        hasher.update(&chunk);
        offset += chunk.len() as u64;
    }

    if offset == 0 {
        tracing::info!("firmware already up to date (empty body)");
        return Ok(OtaOutcome::UpToDate);
    }

    let actual = hex_digest(&hasher.finalize());
    if !actual.eq_ignore_ascii_case(expected_md5) {
        sink.abort().await;
        return Err(OtaError::ChecksumMismatch {
            expected: expected_md5.to_string(),
            actual,
        });
    }

    sink.commit(offset, &actual).await?;
    tracing::info!(bytes = offset, md5 = %actual, "firmware download validated");
    Ok(OtaOutcome::Updated {
        bytes: offset,
        md5_hex: actual,
    })
}

fn build_get_request(url: &Url) -> String {
    let path = match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    };
    let host = url.host_str().unwrap_or_default();
    format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n")
}
