//! # Device Protocol Codec
//!
//! Builds and parses the binary envelope spoken to the gateway's embedded
//! controller. Two request shapes exist:
//!
//! - **config**: ask for a named file (normally `config.json`); the device answers
//!   with the file text and a signature.
//! - **query**: send a signed status query; the device answers with JSON text.
//!
//! Every request carries a session-scoped sequence marker in the envelope tail and
//! the response must echo it. Responses are also checked for the expected device
//! identity (DIN) and payload variant. The codec is a pure transform: no I/O, no
//! retries.
//!
//! ```rust
//! use powergate::protocol::{DeviceQuery, ProtocolCodec};
//!
//! let codec = ProtocolCodec::new("1232100-00-E--TG123456789");
//! let pending = codec.encode_query_request(&DeviceQuery::new("query { status }"));
//! let reply = ProtocolCodec::encode_query_response(
//!     codec.din(),
//!     pending.marker(),
//!     r#"{"status":"ok"}"#,
//! );
//! let json = codec.decode_response(&pending, &reply).unwrap();
//! assert_eq!(json, r#"{"status":"ok"}"#);
//! ```

pub mod messages;

use crate::error::{GatewayError, Result};
use crate::logutil::hex_snippet;
use bytes::Bytes;
use log::{debug, trace};
use messages::{
    config_payload, participant, ConfigFile, ConfigPayload, ConfigRecv, ConfigSend, Envelope,
    MessageEnvelope, Participant, QueryPayload, QuerySend, QueryText, StringValue, Tail,
};
use prost::Message;
use std::sync::atomic::{AtomicU32, Ordering};

/// Identifier the local client uses for itself in envelopes.
pub const LOCAL_CLIENT_ID: i32 = 1;
/// Delivery channel for requests sent over the local network.
pub const DELIVERY_CHANNEL: i32 = 1;
/// File requested for the site configuration.
pub const CONFIG_FILE: &str = "config.json";

const CONFIG_SEND_NUM: i32 = 1;
const QUERY_SEND_NUM: i32 = 2;
const QUERY_PAYLOAD_VALUE: i32 = 1;
const MAX_MARKER: u32 = i32::MAX as u32;

/// Status query understood by the gateway controller.
pub const STATUS_QUERY: &str = " query DeviceControllerQuery {
  control {
    systemStatus { nominalFullPackEnergyWh nominalEnergyRemainingWh }
    islanding { customerIslandMode contactorClosed microGridOK gridOK }
    meterAggregates { location realPowerW }
    alerts { active }
    siteShutdown { isShutDown reasons }
    batteryBlocks { din disableReasons }
    pvInverters { din disableReasons }
  }
  system {
    time
    sitemanagerStatus { isRunning }
    updateUrgencyCheck { urgency version { version gitHash } timestamp }
  }
}";

/// Payload variant a request expects back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Config,
    Query,
}

/// A signed query for the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceQuery {
    pub text: String,
    /// Signature blob the controller validates the query text against.
    pub code: Vec<u8>,
    /// JSON variables object.
    pub variables: String,
}

impl DeviceQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            code: Vec::new(),
            variables: "{}".to_string(),
        }
    }

    /// The controller status query, signed with `code`.
    pub fn status(code: Vec<u8>) -> Self {
        Self {
            code,
            ..Self::new(STATUS_QUERY)
        }
    }

    pub fn with_variables(mut self, variables: impl Into<String>) -> Self {
        self.variables = variables.into();
        self
    }
}

/// An encoded request together with what its response must look like.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    bytes: Bytes,
    marker: u32,
    kind: PayloadKind,
    /// Requested file name for config requests.
    file: Option<String>,
}

impl PendingRequest {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Cheap clone of the encoded body for an HTTP request.
    pub fn body(&self) -> Bytes {
        self.bytes.clone()
    }

    pub fn marker(&self) -> u32 {
        self.marker
    }

    pub fn kind(&self) -> PayloadKind {
        self.kind
    }
}

/// Decoded view of a request envelope, as the device would see it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestView {
    pub marker: u32,
    pub recipient_din: Option<String>,
    pub config_file: Option<String>,
    pub query_text: Option<String>,
    pub query_code: Option<Vec<u8>>,
}

/// Encoder/decoder bound to one device identity.
#[derive(Debug)]
pub struct ProtocolCodec {
    din: String,
    next_marker: AtomicU32,
}

impl ProtocolCodec {
    pub fn new(din: impl Into<String>) -> Self {
        Self {
            din: din.into(),
            next_marker: AtomicU32::new(1),
        }
    }

    /// Device identity this codec addresses.
    pub fn din(&self) -> &str {
        &self.din
    }

    /// Allocate the next marker; stays in `1..=i32::MAX` so it fits the wire field.
    fn allocate_marker(&self) -> u32 {
        loop {
            let current = self.next_marker.load(Ordering::Relaxed);
            let next = if current >= MAX_MARKER { 1 } else { current + 1 };
            if self
                .next_marker
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return current;
            }
        }
    }

    fn request_envelope(&self) -> MessageEnvelope {
        MessageEnvelope {
            delivery_channel: DELIVERY_CHANNEL,
            sender: Some(local_participant()),
            recipient: Some(din_participant(&self.din)),
            config: None,
            payload: None,
        }
    }

    /// Encode a request for the configuration file `file_name`.
    pub fn encode_config_request(&self, file_name: &str) -> PendingRequest {
        let marker = self.allocate_marker();
        let mut message = self.request_envelope();
        message.config = Some(ConfigPayload {
            config: Some(config_payload::Config::Send(ConfigSend {
                num: CONFIG_SEND_NUM,
                file: file_name.to_string(),
            })),
        });
        let bytes = encode_envelope(message, marker);
        trace!(
            "Encoded config request for {} (marker={}, {} bytes)",
            file_name,
            marker,
            bytes.len()
        );
        PendingRequest {
            bytes,
            marker,
            kind: PayloadKind::Config,
            file: Some(file_name.to_string()),
        }
    }

    /// Encode a signed status/graph query.
    pub fn encode_query_request(&self, query: &DeviceQuery) -> PendingRequest {
        let marker = self.allocate_marker();
        let mut message = self.request_envelope();
        message.payload = Some(QueryPayload {
            send: Some(QuerySend {
                num: Some(QUERY_SEND_NUM),
                payload: Some(QueryText {
                    value: QUERY_PAYLOAD_VALUE,
                    text: query.text.clone(),
                }),
                code: Some(query.code.clone()),
                b: Some(StringValue {
                    value: query.variables.clone(),
                }),
            }),
            recv: None,
        });
        let bytes = encode_envelope(message, marker);
        trace!("Encoded query request (marker={}, {} bytes)", marker, bytes.len());
        PendingRequest {
            bytes,
            marker,
            kind: PayloadKind::Query,
            file: None,
        }
    }

    /// Decode the device's answer to `request`, returning the JSON text it carries.
    pub fn decode_response(&self, request: &PendingRequest, bytes: &[u8]) -> Result<String> {
        let envelope = Envelope::decode(bytes).map_err(|e| {
            debug!(
                "Undecodable response envelope ({} bytes): {}",
                bytes.len(),
                hex_snippet(bytes, 32)
            );
            GatewayError::from(e)
        })?;

        let marker = envelope.tail.as_ref().map(|t| t.value);
        if marker != Some(request.marker as i32) {
            return Err(GatewayError::Protocol(format!(
                "sequence marker mismatch: sent {}, received {}",
                request.marker,
                marker.map_or_else(|| "none".to_string(), |m| m.to_string())
            )));
        }

        let message = envelope
            .message
            .ok_or_else(|| GatewayError::Protocol("response has no message body".into()))?;

        match message.sender.as_ref().and_then(|p| p.id.as_ref()) {
            Some(participant::Id::Din(din)) if din == &self.din => {}
            Some(participant::Id::Din(din)) => {
                return Err(GatewayError::Protocol(format!(
                    "response from unexpected device {din} (expected {})",
                    self.din
                )))
            }
            _ => {
                return Err(GatewayError::Protocol(
                    "response sender is not a device identity".into(),
                ))
            }
        }
        match message.recipient.as_ref().and_then(|p| p.id.as_ref()) {
            Some(participant::Id::Local(_)) => {}
            other => {
                return Err(GatewayError::Protocol(format!(
                    "response addressed to {other:?}, not the local client"
                )))
            }
        }

        let text = match request.kind {
            PayloadKind::Config => {
                let recv = match message.config.and_then(|c| c.config) {
                    Some(config_payload::Config::Recv(recv)) => recv,
                    _ => {
                        return Err(GatewayError::Protocol(
                            "expected a config payload in response".into(),
                        ))
                    }
                };
                let file = recv
                    .file
                    .ok_or_else(|| GatewayError::Protocol("config payload has no file".into()))?;
                if let Some(requested) = &request.file {
                    if !file.name.is_empty() && &file.name != requested {
                        return Err(GatewayError::Protocol(format!(
                            "device returned file '{}' for request '{}'",
                            file.name, requested
                        )));
                    }
                }
                if recv.code.is_empty() {
                    debug!("Config response for marker {} carries no signature", request.marker);
                }
                file.text
            }
            PayloadKind::Query => message
                .payload
                .and_then(|p| p.recv)
                .map(|r| r.text)
                .ok_or_else(|| {
                    GatewayError::Protocol("expected a query payload in response".into())
                })?,
        };

        serde_json::from_str::<serde::de::IgnoredAny>(&text)
            .map_err(|e| GatewayError::Protocol(format!("payload is not valid JSON: {e}")))?;
        Ok(text)
    }

    /// Parse a request envelope (device side of the exchange).
    pub fn decode_request(bytes: &[u8]) -> Result<RequestView> {
        let envelope = Envelope::decode(bytes)?;
        let marker = envelope
            .tail
            .map(|t| t.value)
            .filter(|v| *v > 0)
            .ok_or_else(|| GatewayError::Protocol("request has no sequence marker".into()))?;
        let message = envelope
            .message
            .ok_or_else(|| GatewayError::Protocol("request has no message body".into()))?;
        let recipient_din = match message.recipient.and_then(|p| p.id) {
            Some(participant::Id::Din(din)) => Some(din),
            _ => None,
        };
        let config_file = match message.config.and_then(|c| c.config) {
            Some(config_payload::Config::Send(send)) => Some(send.file),
            _ => None,
        };
        let (query_text, query_code) = match message.payload.and_then(|p| p.send) {
            Some(send) => (send.payload.map(|p| p.text), send.code),
            None => (None, None),
        };
        Ok(RequestView {
            marker: marker as u32,
            recipient_din,
            config_file,
            query_text,
            query_code,
        })
    }

    /// Build a device reply carrying configuration file `text`.
    pub fn encode_config_response(din: &str, marker: u32, file_name: &str, text: &str) -> Vec<u8> {
        let message = MessageEnvelope {
            delivery_channel: DELIVERY_CHANNEL,
            sender: Some(din_participant(din)),
            recipient: Some(local_participant()),
            config: Some(ConfigPayload {
                config: Some(config_payload::Config::Recv(ConfigRecv {
                    file: Some(ConfigFile {
                        name: file_name.to_string(),
                        text: text.to_string(),
                    }),
                    code: Vec::new(),
                })),
            }),
            payload: None,
        };
        encode_envelope(message, marker).to_vec()
    }

    /// Build a device reply carrying query result `json`.
    pub fn encode_query_response(din: &str, marker: u32, json: &str) -> Vec<u8> {
        let message = MessageEnvelope {
            delivery_channel: DELIVERY_CHANNEL,
            sender: Some(din_participant(din)),
            recipient: Some(local_participant()),
            config: None,
            payload: Some(QueryPayload {
                send: None,
                recv: Some(QueryText {
                    value: QUERY_PAYLOAD_VALUE,
                    text: json.to_string(),
                }),
            }),
        };
        encode_envelope(message, marker).to_vec()
    }
}

fn local_participant() -> Participant {
    Participant {
        id: Some(participant::Id::Local(LOCAL_CLIENT_ID)),
    }
}

fn din_participant(din: &str) -> Participant {
    Participant {
        id: Some(participant::Id::Din(din.to_string())),
    }
}

fn encode_envelope(message: MessageEnvelope, marker: u32) -> Bytes {
    let envelope = Envelope {
        message: Some(message),
        tail: Some(Tail {
            value: marker as i32,
        }),
    };
    Bytes::from(envelope.encode_to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIN: &str = "1232100-00-E--TG0000000001";

    #[test]
    fn markers_are_monotonic_per_codec() {
        let codec = ProtocolCodec::new(DIN);
        let a = codec.encode_config_request(CONFIG_FILE);
        let b = codec.encode_query_request(&DeviceQuery::new("q"));
        assert_eq!(a.marker(), 1);
        assert_eq!(b.marker(), 2);
    }

    #[test]
    fn marker_wraps_without_zero() {
        let codec = ProtocolCodec::new(DIN);
        codec.next_marker.store(MAX_MARKER, Ordering::Relaxed);
        assert_eq!(codec.allocate_marker(), MAX_MARKER);
        assert_eq!(codec.allocate_marker(), 1);
    }

    #[test]
    fn config_request_is_addressed_to_device() {
        let codec = ProtocolCodec::new(DIN);
        let pending = codec.encode_config_request(CONFIG_FILE);
        let view = ProtocolCodec::decode_request(pending.bytes()).unwrap();
        assert_eq!(view.recipient_din.as_deref(), Some(DIN));
        assert_eq!(view.config_file.as_deref(), Some(CONFIG_FILE));
        assert_eq!(view.query_text, None);
        assert_eq!(view.marker, pending.marker());
    }

    #[test]
    fn config_round_trip_returns_file_text() {
        let codec = ProtocolCodec::new(DIN);
        let pending = codec.encode_config_request(CONFIG_FILE);
        let reply = ProtocolCodec::encode_config_response(
            DIN,
            pending.marker(),
            CONFIG_FILE,
            r#"{"battery_blocks":[]}"#,
        );
        let text = codec.decode_response(&pending, &reply).unwrap();
        assert_eq!(text, r#"{"battery_blocks":[]}"#);
    }

    #[test]
    fn query_reply_to_config_request_is_rejected() {
        let codec = ProtocolCodec::new(DIN);
        let pending = codec.encode_config_request(CONFIG_FILE);
        let reply = ProtocolCodec::encode_query_response(DIN, pending.marker(), "{}");
        let err = codec.decode_response(&pending, &reply).unwrap_err();
        assert!(matches!(err, GatewayError::Protocol(_)), "{err}");
    }

    #[test]
    fn wrong_file_name_is_rejected() {
        let codec = ProtocolCodec::new(DIN);
        let pending = codec.encode_config_request(CONFIG_FILE);
        let reply =
            ProtocolCodec::encode_config_response(DIN, pending.marker(), "other.json", "{}");
        assert!(codec.decode_response(&pending, &reply).is_err());
    }

    #[test]
    fn non_json_payload_is_rejected() {
        let codec = ProtocolCodec::new(DIN);
        let pending = codec.encode_query_request(&DeviceQuery::status(vec![1, 2, 3]));
        let reply = ProtocolCodec::encode_query_response(DIN, pending.marker(), "{truncated");
        let err = codec.decode_response(&pending, &reply).unwrap_err();
        assert!(err.to_string().contains("not valid JSON"));
    }

    #[test]
    fn garbage_bytes_are_a_protocol_error() {
        let codec = ProtocolCodec::new(DIN);
        let pending = codec.encode_query_request(&DeviceQuery::new("q"));
        let err = codec
            .decode_response(&pending, &[0xff, 0xff, 0xff, 0xff, 0x0f])
            .unwrap_err();
        assert_eq!(err.kind(), "protocol");
    }
}
