//! Binary envelope codec for the publish mailbox
//!
//! Publish calls from arbitrary tasks are funneled into the single
//! connection-owning engine task through a bounded mailbox. The mailbox
//! carries encoded envelopes with this layout:
//!
//! ```text
//! [marker:1][total_len:4][topic_len:4][sub_flag:1][topic][payload][checksum:2][terminator:1]
//! ```
//!
//! `total_len` is the combined length of the topic and payload sections.
//! A zero `topic_len` means "use the engine's default publish topic". When
//! `sub_flag` is set, the topic section holds a sub-channel suffix appended
//! to the default topic rather than a full topic.
//!
//! The checksum field is a fixed placeholder carried for wire compatibility
//! and is never validated on decode. Envelopes are unauthenticated.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// First byte of every envelope.
pub const MARKER: u8 = 0x02;
/// Last byte of every envelope.
pub const TERMINATOR: u8 = 0x03;
/// Placeholder checksum, written as-is and ignored on decode.
pub const CHECKSUM_PLACEHOLDER: u16 = 0x5A5A;

/// Maximum topic section length in bytes.
pub const MAX_TOPIC_LEN: usize = 512;
/// Maximum payload section length in bytes.
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024;

/// Fixed framing overhead: marker + two u32 lengths + sub flag + checksum + terminator.
const FRAME_OVERHEAD: usize = 1 + 4 + 4 + 1 + 2 + 1;

/// Codec errors, split between encode-side parameter problems and
/// decode-side format problems.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("payload must not be empty")]
    EmptyPayload,
    #[error("payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("topic too long: {len} bytes (max {max})")]
    TopicTooLong { len: usize, max: usize },
    #[error("bad marker byte: {0:#04x}")]
    BadMarker(u8),
    #[error("bad terminator byte: {0:#04x}")]
    BadTerminator(u8),
    #[error("envelope truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("inconsistent lengths: topic_len {topic_len} exceeds total_len {total_len}")]
    LengthMismatch { topic_len: usize, total_len: usize },
    #[error("topic is not valid UTF-8")]
    TopicNotUtf8,
}

/// A decoded publish request as carried through the mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishEnvelope {
    /// Explicit topic, or sub-channel suffix when `sub_channel` is set.
    /// `None` selects the engine's default publish topic.
    pub topic: Option<String>,
    /// Whether `topic` is a suffix of the default topic.
    pub sub_channel: bool,
    /// Message payload, never empty.
    pub payload: Bytes,
}

/// Encode a publish request into its wire form.
///
/// Fails with a parameter error on an empty or oversized payload and on an
/// oversized topic.
pub fn encode(
    topic: Option<&str>,
    sub_channel: bool,
    payload: &[u8],
) -> Result<Bytes, CodecError> {
    if payload.is_empty() {
        return Err(CodecError::EmptyPayload);
    }
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(CodecError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }
    let topic = topic.unwrap_or("");
    if topic.len() > MAX_TOPIC_LEN {
        return Err(CodecError::TopicTooLong {
            len: topic.len(),
            max: MAX_TOPIC_LEN,
        });
    }

    let total_len = topic.len() + payload.len();
    let mut buf = BytesMut::with_capacity(FRAME_OVERHEAD + total_len);
    buf.put_u8(MARKER);
    buf.put_u32(total_len as u32);
    buf.put_u32(topic.len() as u32);
    buf.put_u8(sub_channel as u8);
    buf.put_slice(topic.as_bytes());
    buf.put_slice(payload);
    buf.put_u16(CHECKSUM_PLACEHOLDER);
    buf.put_u8(TERMINATOR);
    Ok(buf.freeze())
}

/// Decode an envelope produced by [`encode`].
///
/// Fails with a format error on marker/terminator mismatch, truncation, or
/// a topic length exceeding the total length. The checksum field is skipped
/// without inspection.
pub fn decode(frame: &[u8]) -> Result<PublishEnvelope, CodecError> {
    if frame.len() < FRAME_OVERHEAD {
        return Err(CodecError::Truncated {
            need: FRAME_OVERHEAD,
            have: frame.len(),
        });
    }

    let mut buf = frame;
    let marker = buf.get_u8();
    if marker != MARKER {
        return Err(CodecError::BadMarker(marker));
    }
    let total_len = buf.get_u32() as usize;
    let topic_len = buf.get_u32() as usize;
    let sub_channel = buf.get_u8() != 0;

    if topic_len > total_len {
        return Err(CodecError::LengthMismatch {
            topic_len,
            total_len,
        });
    }
    let need = FRAME_OVERHEAD + total_len;
    if frame.len() != need {
        return Err(CodecError::Truncated {
            need,
            have: frame.len(),
        });
    }
    let payload_len = total_len - topic_len;
    if payload_len == 0 {
        return Err(CodecError::EmptyPayload);
    }

    let topic_bytes = &buf[..topic_len];
    let payload = Bytes::copy_from_slice(&buf[topic_len..total_len]);
    buf.advance(total_len);

    let _checksum = buf.get_u16(); // placeholder, not validated
    let terminator = buf.get_u8();
    if terminator != TERMINATOR {
        return Err(CodecError::BadTerminator(terminator));
    }

    let topic = if topic_len == 0 {
        None
    } else {
        Some(
            std::str::from_utf8(topic_bytes)
                .map_err(|_| CodecError::TopicNotUtf8)?
                .to_string(),
        )
    };

    Ok(PublishEnvelope {
        topic,
        sub_channel,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_with_topic() {
        let frame = encode(Some("devices/42/out"), false, b"hello").unwrap();
        let env = decode(&frame).unwrap();
        assert_eq!(env.topic.as_deref(), Some("devices/42/out"));
        assert!(!env.sub_channel);
        assert_eq!(&env.payload[..], b"hello");
    }

    #[test]
    fn roundtrip_default_topic() {
        let frame = encode(None, false, b"x").unwrap();
        let env = decode(&frame).unwrap();
        assert_eq!(env.topic, None);
        assert_eq!(&env.payload[..], b"x");
    }

    #[test]
    fn roundtrip_sub_channel() {
        let frame = encode(Some("temperature"), true, b"21.5").unwrap();
        let env = decode(&frame).unwrap();
        assert_eq!(env.topic.as_deref(), Some("temperature"));
        assert!(env.sub_channel);
    }

    #[test]
    fn empty_payload_rejected() {
        assert_eq!(encode(None, false, b""), Err(CodecError::EmptyPayload));
    }

    #[test]
    fn oversized_payload_rejected() {
        let payload = vec![0u8; MAX_PAYLOAD_LEN + 1];
        assert!(matches!(
            encode(None, false, &payload),
            Err(CodecError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn oversized_topic_rejected() {
        let topic = "t".repeat(MAX_TOPIC_LEN + 1);
        assert!(matches!(
            encode(Some(&topic), false, b"p"),
            Err(CodecError::TopicTooLong { .. })
        ));
    }

    #[test]
    fn bad_marker_rejected() {
        let mut frame = encode(None, false, b"p").unwrap().to_vec();
        frame[0] = 0xFF;
        assert_eq!(decode(&frame), Err(CodecError::BadMarker(0xFF)));
    }

    #[test]
    fn bad_terminator_rejected() {
        let mut frame = encode(None, false, b"p").unwrap().to_vec();
        let last = frame.len() - 1;
        frame[last] = 0x00;
        assert_eq!(decode(&frame), Err(CodecError::BadTerminator(0x00)));
    }

    #[test]
    fn topic_len_out_of_range_rejected() {
        let mut frame = encode(Some("abc"), false, b"p").unwrap().to_vec();
        // Corrupt topic_len to exceed total_len
        frame[5..9].copy_from_slice(&u32::to_be_bytes(1000));
        assert!(matches!(
            decode(&frame),
            Err(CodecError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn truncated_frame_rejected() {
        let frame = encode(Some("abc"), false, b"payload").unwrap();
        assert!(matches!(
            decode(&frame[..frame.len() - 3]),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn checksum_is_not_validated() {
        // Corrupting the checksum bytes must not fail the decode
        let mut frame = encode(Some("abc"), false, b"payload").unwrap().to_vec();
        let n = frame.len();
        frame[n - 3] = 0xDE;
        frame[n - 2] = 0xAD;
        assert!(decode(&frame).is_ok());
    }
}
