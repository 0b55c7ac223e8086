//! Property tests for the publish envelope codec.

use cloudlink::envelope::{decode, encode, CodecError, MAX_PAYLOAD_LEN, MAX_TOPIC_LEN};
use proptest::prelude::*;

proptest! {
    #[test]
    fn any_payload_roundtrips(payload in prop::collection::vec(any::<u8>(), 1..2048)) {
        let frame = encode(None, false, &payload).unwrap();
        let env = decode(&frame).unwrap();
        prop_assert_eq!(env.topic, None);
        prop_assert!(!env.sub_channel);
        prop_assert_eq!(&env.payload[..], &payload[..]);
    }

    #[test]
    fn topic_and_flag_roundtrip(
        topic in "[a-z0-9/_-]{1,64}",
        sub_channel in any::<bool>(),
        payload in prop::collection::vec(any::<u8>(), 1..512),
    ) {
        let frame = encode(Some(&topic), sub_channel, &payload).unwrap();
        let env = decode(&frame).unwrap();
        prop_assert_eq!(env.topic.as_deref(), Some(topic.as_str()));
        prop_assert_eq!(env.sub_channel, sub_channel);
        prop_assert_eq!(&env.payload[..], &payload[..]);
    }

    #[test]
    fn truncation_is_rejected_without_panic(
        payload in prop::collection::vec(any::<u8>(), 1..256),
        cut in 1usize..64,
    ) {
        let frame = encode(Some("some/topic"), false, &payload).unwrap();
        let cut = cut.min(frame.len());
        let result = decode(&frame[..frame.len() - cut]);
        prop_assert!(result.is_err());
    }

    #[test]
    fn corrupt_marker_is_rejected(payload in prop::collection::vec(any::<u8>(), 1..128)) {
        let mut frame = encode(None, false, &payload).unwrap().to_vec();
        frame[0] ^= 0xFF;
        prop_assert!(matches!(decode(&frame), Err(CodecError::BadMarker(_))));
    }

    #[test]
    fn corrupt_terminator_is_rejected(payload in prop::collection::vec(any::<u8>(), 1..128)) {
        let mut frame = encode(None, false, &payload).unwrap().to_vec();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        prop_assert!(matches!(decode(&frame), Err(CodecError::BadTerminator(_))));
    }
}

#[test]
fn limits_are_inclusive() {
    let payload = vec![0x55u8; MAX_PAYLOAD_LEN];
    let topic = "t".repeat(MAX_TOPIC_LEN);
    let frame = encode(Some(&topic), false, &payload).unwrap();
    let env = decode(&frame).unwrap();
    assert_eq!(env.payload.len(), MAX_PAYLOAD_LEN);
    assert_eq!(env.topic.as_deref().map(str::len), Some(MAX_TOPIC_LEN));
}

#[test]
fn one_past_the_limit_is_rejected() {
    let payload = vec![0x55u8; MAX_PAYLOAD_LEN + 1];
    assert!(matches!(
        encode(None, false, &payload),
        Err(CodecError::PayloadTooLarge { .. })
    ));
    let topic = "t".repeat(MAX_TOPIC_LEN + 1);
    assert!(matches!(
        encode(Some(&topic), false, b"p"),
        Err(CodecError::TopicTooLong { .. })
    ));
}
