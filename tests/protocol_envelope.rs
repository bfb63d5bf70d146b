//! Request/response envelopes as seen from both ends of the exchange.
mod common;

use common::DIN;
use powergate::error::GatewayError;
use powergate::protocol::{DeviceQuery, PayloadKind, ProtocolCodec, CONFIG_FILE, STATUS_QUERY};

#[test]
fn query_request_carries_text_code_and_marker() {
    let codec = ProtocolCodec::new(DIN);
    let query = DeviceQuery::status(vec![0xde, 0xad, 0xbe, 0xef]);
    let pending = codec.encode_query_request(&query);
    assert_eq!(pending.kind(), PayloadKind::Query);

    let view = ProtocolCodec::decode_request(pending.bytes()).unwrap();
    assert_eq!(view.marker, pending.marker());
    assert_eq!(view.recipient_din.as_deref(), Some(DIN));
    assert_eq!(view.query_text.as_deref(), Some(STATUS_QUERY));
    assert_eq!(view.query_code, Some(vec![0xde, 0xad, 0xbe, 0xef]));
    assert_eq!(view.config_file, None);
}

#[test]
fn query_reply_round_trips_json_text() {
    let codec = ProtocolCodec::new(DIN);
    let pending = codec.encode_query_request(&DeviceQuery::new("query Q { x }"));
    let json = r#"{"control":{"alerts":{"active":["SiteMinOffline"]}}}"#;
    let reply = ProtocolCodec::encode_query_response(DIN, pending.marker(), json);
    assert_eq!(codec.decode_response(&pending, &reply).unwrap(), json);
}

#[test]
fn every_request_gets_a_fresh_marker() {
    let codec = ProtocolCodec::new(DIN);
    let markers: Vec<u32> = (0..5)
        .map(|_| codec.encode_config_request(CONFIG_FILE).marker())
        .collect();
    assert_eq!(markers, vec![1, 2, 3, 4, 5]);
}

#[test]
fn reply_to_an_older_request_is_rejected() {
    let codec = ProtocolCodec::new(DIN);
    let first = codec.encode_query_request(&DeviceQuery::new("q"));
    let second = codec.encode_query_request(&DeviceQuery::new("q"));
    // A late answer to the first request must not satisfy the second.
    let late = ProtocolCodec::encode_query_response(DIN, first.marker(), "{}");
    let err = codec.decode_response(&second, &late).unwrap_err();
    assert!(matches!(err, GatewayError::Protocol(_)));
    assert!(err.to_string().contains("sequence marker mismatch"), "{err}");
    assert!(!err.is_retryable());
}

#[test]
fn reply_from_another_device_is_rejected() {
    let codec = ProtocolCodec::new(DIN);
    let pending = codec.encode_config_request(CONFIG_FILE);
    let reply = ProtocolCodec::encode_config_response(
        "1232100-00-E--TG9999999999",
        pending.marker(),
        CONFIG_FILE,
        "{}",
    );
    let err = codec.decode_response(&pending, &reply).unwrap_err();
    assert!(err.to_string().contains("unexpected device"), "{err}");
}

#[test]
fn config_reply_to_query_is_rejected() {
    let codec = ProtocolCodec::new(DIN);
    let pending = codec.encode_query_request(&DeviceQuery::new("q"));
    let reply = ProtocolCodec::encode_config_response(DIN, pending.marker(), CONFIG_FILE, "{}");
    let err = codec.decode_response(&pending, &reply).unwrap_err();
    assert_eq!(err.kind(), "protocol");
}

#[test]
fn truncated_envelope_is_a_protocol_error() {
    let codec = ProtocolCodec::new(DIN);
    let pending = codec.encode_config_request(CONFIG_FILE);
    let reply =
        ProtocolCodec::encode_config_response(DIN, pending.marker(), CONFIG_FILE, r#"{"a":1}"#);
    let err = codec
        .decode_response(&pending, &reply[..reply.len() / 2])
        .unwrap_err();
    assert_eq!(err.kind(), "protocol");
}
