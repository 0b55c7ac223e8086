//! Minimal HTTP/1.1 response reading for OTA transfers
//!
//! Firmware downloads need chunk-level control so each piece can go to
//! flash and into a running digest without buffering the whole image. This
//! module parses a response head and then yields the body incrementally in
//! whichever framing the server chose: fixed Content-Length, chunked
//! transfer encoding, or close-delimited. Everything is generic over
//! [`AsyncRead`], so tests can split the stream at arbitrary byte
//! boundaries.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Cap on the response head (status line plus headers).
pub const MAX_HEAD_BYTES: usize = 8 * 1024;
/// Cap on a close-delimited body; the other modes are bounded by their own
/// framing.
pub const MAX_CLOSE_DELIMITED_BYTES: usize = 1024 * 1024;
/// Cap on a single declared chunk in a chunked body. Each chunk is buffered
/// in full before it is yielded, so the declared size must be bounded even
/// though the body as a whole is not.
pub const MAX_CHUNK_BYTES: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("i/o error")]
    Io(#[from] std::io::Error),
    #[error("malformed status line: {0:?}")]
    BadStatusLine(String),
    #[error("malformed header: {0:?}")]
    BadHeader(String),
    #[error("malformed chunk size line: {0:?}")]
    BadChunkSize(String),
    #[error("chunk framing broken: {0}")]
    BadChunkFraming(&'static str),
    #[error("connection closed mid-body")]
    UnexpectedEof,
    #[error("response head exceeds {MAX_HEAD_BYTES} bytes")]
    HeadTooLarge,
    #[error("close-delimited body exceeds {max} bytes")]
    BodyTooLarge { max: usize },
    #[error("declared chunk size {size} exceeds {max} bytes")]
    ChunkTooLarge { size: usize, max: usize },
}

/// Parsed response head. Created per request, consumed once the body is
/// fully read.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub content_length: Option<u64>,
    pub chunked: bool,
    pub content_type: Option<String>,
}

/// How the body is delimited. Chunked wins over Content-Length, matching
/// what servers actually send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyMode {
    Fixed(u64),
    Chunked,
    UntilClose,
}

impl ResponseHead {
    pub fn body_mode(&self) -> BodyMode {
        if self.chunked {
            BodyMode::Chunked
        } else if let Some(len) = self.content_length {
            BodyMode::Fixed(len)
        } else {
            BodyMode::UntilClose
        }
    }

    /// Parse the head text, status line plus headers (pure function).
    fn parse(head: &str) -> Result<Self, HttpError> {
        let mut lines = head.split("\r\n");
        let status_line = lines.next().unwrap_or_default();
        let mut parts = status_line.split_whitespace();
        let version = parts.next().unwrap_or_default();
        let status = parts
            .next()
            .and_then(|s| s.parse::<u16>().ok())
            .filter(|_| version.starts_with("HTTP/"))
            .ok_or_else(|| HttpError::BadStatusLine(status_line.to_string()))?;

        let mut content_length = None;
        let mut chunked = false;
        let mut content_type = None;
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| HttpError::BadHeader(line.to_string()))?;
            let value = value.trim();
            if name.eq_ignore_ascii_case("content-length") {
                content_length = Some(
                    value
                        .parse::<u64>()
                        .map_err(|_| HttpError::BadHeader(line.to_string()))?,
                );
            } else if name.eq_ignore_ascii_case("transfer-encoding") {
                chunked = value.to_ascii_lowercase().contains("chunked");
            } else if name.eq_ignore_ascii_case("content-type") {
                content_type = Some(value.to_string());
            }
        }

        Ok(Self {
            status,
            content_length,
            chunked,
            content_type,
        })
    }
}

/// Read a response head and hand back a body reader that continues from
/// the same stream. Bytes already read past the head are carried over.
pub async fn read_response<R: AsyncRead + Unpin>(
    mut reader: R,
) -> Result<(ResponseHead, BodyReader<R>), HttpError> {
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if let Some(end) = find_head_end(&buf) {
            let head_bytes = buf.split_to(end + 4);
            let head_str = std::str::from_utf8(&head_bytes)
                .map_err(|_| HttpError::BadStatusLine("non-utf8 head".to_string()))?;
            let head = ResponseHead::parse(head_str)?;
            let body = BodyReader::new(reader, head.body_mode(), buf);
            return Ok((head, body));
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(HttpError::HeadTooLarge);
        }
        if reader.read_buf(&mut buf).await? == 0 {
            return Err(HttpError::UnexpectedEof);
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_chunk_size(line: &str) -> Result<usize, HttpError> {
    // Chunk extensions after ';' are tolerated and ignored
    let size = line.split(';').next().unwrap_or_default().trim();
    usize::from_str_radix(size, 16).map_err(|_| HttpError::BadChunkSize(line.to_string()))
}

/// Streaming body reader. `next_chunk` yields once per socket read or once
/// per chunk, so arbitrarily large bodies never require unbounded
/// buffering.
pub struct BodyReader<R> {
    reader: R,
    buf: BytesMut,
    mode: BodyMode,
    remaining: u64,
    total: u64,
    done: bool,
}

impl<R: AsyncRead + Unpin> BodyReader<R> {
    fn new(reader: R, mode: BodyMode, leftover: BytesMut) -> Self {
        let remaining = match mode {
            BodyMode::Fixed(len) => len,
            _ => 0,
        };
        Self {
            reader,
            buf: leftover,
            mode,
            remaining,
            total: 0,
            done: false,
        }
    }

    /// Total body bytes yielded so far.
    pub fn total_read(&self) -> u64 {
        self.total
    }

    /// Next piece of the body, or `None` once the body is complete. For
    /// chunked bodies, completion is signalled only by the zero-length
    /// terminator chunk.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, HttpError> {
        if self.done {
            return Ok(None);
        }
        let chunk = match self.mode {
            BodyMode::Fixed(_) => self.next_fixed().await?,
            BodyMode::Chunked => self.next_chunked().await?,
            BodyMode::UntilClose => self.next_until_close().await?,
        };
        match &chunk {
            Some(data) => self.total += data.len() as u64,
            None => self.done = true,
        }
        Ok(chunk)
    }

    async fn next_fixed(&mut self) -> Result<Option<Bytes>, HttpError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        if self.buf.is_empty() && self.fill().await? == 0 {
            return Err(HttpError::UnexpectedEof);
        }
        let take = (self.buf.len() as u64).min(self.remaining) as usize;
        self.remaining -= take as u64;
        Ok(Some(self.buf.split_to(take).freeze()))
    }

    async fn next_chunked(&mut self) -> Result<Option<Bytes>, HttpError> {
        let size_line = self.read_line().await?;
        let size = parse_chunk_size(&size_line)?;
        if size > MAX_CHUNK_BYTES {
            return Err(HttpError::ChunkTooLarge {
                size,
                max: MAX_CHUNK_BYTES,
            });
        }
        if size == 0 {
            // Terminator; swallow any trailer lines up to the blank line
            loop {
                if self.read_line().await?.is_empty() {
                    break;
                }
            }
            return Ok(None);
        }
        while self.buf.len() < size {
            if self.fill().await? == 0 {
                return Err(HttpError::UnexpectedEof);
            }
        }
        let chunk = self.buf.split_to(size).freeze();
        self.consume_chunk_crlf().await?;
        Ok(Some(chunk))
    }

    async fn next_until_close(&mut self) -> Result<Option<Bytes>, HttpError> {
        if self.buf.is_empty() && self.fill().await? == 0 {
            return Ok(None);
        }
        if self.total + self.buf.len() as u64 > MAX_CLOSE_DELIMITED_BYTES as u64 {
            return Err(HttpError::BodyTooLarge {
                max: MAX_CLOSE_DELIMITED_BYTES,
            });
        }
        Ok(Some(self.buf.split().freeze()))
    }

    /// Read one CRLF-terminated line, consuming the terminator.
    async fn read_line(&mut self) -> Result<String, HttpError> {
        loop {
            if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
                let line = self.buf.split_to(pos);
                self.buf.advance(2);
                return String::from_utf8(line.to_vec())
                    .map_err(|_| HttpError::BadChunkSize("non-utf8 line".to_string()));
            }
            if self.buf.len() > MAX_HEAD_BYTES {
                return Err(HttpError::BadChunkSize("line too long".to_string()));
            }
            if self.fill().await? == 0 {
                return Err(HttpError::UnexpectedEof);
            }
        }
    }

    async fn consume_chunk_crlf(&mut self) -> Result<(), HttpError> {
        while self.buf.len() < 2 {
            if self.fill().await? == 0 {
                return Err(HttpError::UnexpectedEof);
            }
        }
        if &self.buf[..2] != b"\r\n" {
            return Err(HttpError::BadChunkFraming("chunk data not CRLF-terminated"));
        }
        self.buf.advance(2);
        Ok(())
    }

    async fn fill(&mut self) -> Result<usize, HttpError> {
        Ok(self.reader.read_buf(&mut self.buf).await?)
    }
}
