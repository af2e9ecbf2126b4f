//! Property tests for the message codec.
//!
//! These check signing and framing over generated messages rather than
//! hand-picked examples.

use bytes::Bytes;
use jupyter_session::codec::DELIMITER;
use jupyter_session::{CodecError, JupyterMessage, MessageCodec};
use proptest::prelude::*;
use serde_json::{json, Map, Value};

fn json_leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i64>().prop_map(Value::from),
        any::<bool>().prop_map(Value::from),
        ".{0,24}".prop_map(Value::from),
        Just(Value::Null),
    ]
}

fn json_object(max: usize) -> impl Strategy<Value = Value> {
    proptest::collection::btree_map("[a-z_]{1,10}", json_leaf(), 0..max)
        .prop_map(|entries| Value::Object(entries.into_iter().collect::<Map<String, Value>>()))
}

prop_compose! {
    fn message()(
        msg_type in "[a-z_]{1,20}",
        session in "[a-f0-9-]{1,36}",
        username in "[a-z]{0,12}",
        content in json_object(6),
        metadata in json_object(3),
        buffers in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..32), 0..3),
        is_reply in any::<bool>(),
    ) -> JupyterMessage {
        let mut msg = JupyterMessage::new(&msg_type, content, &session, &username);
        msg.metadata = metadata;
        msg.buffers = buffers;
        if is_reply {
            let parent = JupyterMessage::new("execute_request", json!({}), &session, &username);
            msg.parent_header = serde_json::to_value(&parent.header).unwrap();
        }
        msg
    }
}

fn key() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 1..64)
}

fn scheme() -> impl Strategy<Value = &'static str> {
    prop_oneof![
        Just("hmac-sha224"),
        Just("hmac-sha256"),
        Just("hmac-sha384"),
        Just("hmac-sha512"),
    ]
}

proptest! {
    #[test]
    fn prop_round_trip(msg in message(), key in key(), scheme in scheme()) {
        let codec = MessageCodec::new(scheme, &key).unwrap();
        let frames = codec.encode(&msg).unwrap().into_frames();
        let (identities, decoded) = codec.decode_frames(frames).unwrap();

        prop_assert!(identities.is_empty());
        prop_assert_eq!(decoded, msg);
    }

    #[test]
    fn prop_wrong_key_rejected(msg in message(), k1 in key(), k2 in key(), scheme in scheme()) {
        prop_assume!(k1 != k2);
        let sender = MessageCodec::new(scheme, &k1).unwrap();
        let receiver = MessageCodec::new(scheme, &k2).unwrap();

        let envelope = sender.encode(&msg).unwrap();
        prop_assert!(matches!(receiver.decode(&envelope), Err(CodecError::Authentication)));
    }

    #[test]
    fn prop_empty_key_never_signs_or_verifies(msg in message(), garbage in ".{0,64}") {
        let codec = MessageCodec::new("hmac-sha256", b"").unwrap();
        let mut envelope = codec.encode(&msg).unwrap();
        prop_assert!(envelope.signature.is_empty());

        envelope.signature = Bytes::from(garbage);
        prop_assert_eq!(codec.decode(&envelope).unwrap(), msg);
    }

    #[test]
    fn prop_routing_frames_preserved(
        msg in message(),
        key in key(),
        identities in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 1..16), 0..3),
    ) {
        prop_assume!(identities.iter().all(|id| id.as_slice() != DELIMITER));
        let codec = MessageCodec::new("hmac-sha256", &key).unwrap();

        let mut envelope = codec.encode(&msg).unwrap();
        envelope.identities = identities.iter().cloned().map(Bytes::from).collect();
        let (received, decoded) = codec.decode_frames(envelope.into_frames()).unwrap();

        let received: Vec<Vec<u8>> = received.iter().map(|b| b.to_vec()).collect();
        prop_assert_eq!(received, identities);
        prop_assert_eq!(decoded, msg);
    }
}
