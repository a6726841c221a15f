//! The closed message set carried inside frames.
//!
//! Each message body is a flat little-endian record (see [`crate::wire`]).
//! Field order is part of the wire contract and must not change. Decoding
//! rejects truncated payloads; trailing bytes after the last field are
//! ignored so minor-version peers can append fields.

use std::collections::HashMap;

use uuid::Uuid;

use crate::error::ProtocolError;
use crate::frame::{Frame, MessageType};
use crate::wire::{WireReader, WireWriter};

/// Client handshake: credentials plus the desired subdomain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Bearer key, either HMAC-derived or registry-issued.
    pub api_key: String,
    /// Subdomain the client wants; `None` lets the server assign one.
    pub requested_subdomain: Option<String>,
    /// Client software version, informational.
    pub client_version: String,
    /// Protocol capabilities, e.g. `"http/1.1"`.
    pub capabilities: Vec<String>,
}

/// Server reply to a successful handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectResponse {
    /// Server-minted tunnel identifier.
    pub tunnel_id: Uuid,
    /// Subdomain actually granted (normalized).
    pub subdomain: String,
    /// Public URL callers should use.
    pub public_url: String,
    /// When the tunnel registration lapses, milliseconds since the epoch.
    pub expires_at_ms: u64,
}

/// HTTP request forwarded from the gateway to the client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpRequest {
    /// Correlation id; the response must echo it.
    pub request_id: Uuid,
    pub method: String,
    pub path: String,
    /// Ordered header pairs; duplicates are legal in HTTP and preserved.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Original caller address, for client-side logging.
    pub remote_address: String,
}

/// HTTP response returned by the client for a forwarded request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpResponse {
    /// Correlation id copied from the request.
    pub request_id: Uuid,
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Keep-alive probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ping {
    /// Sender clock, milliseconds since the epoch.
    pub timestamp_ms: u64,
}

/// Keep-alive reply; echoes the probe's clock so the sender can compute RTT.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pong {
    pub ping_timestamp_ms: u64,
    pub pong_timestamp_ms: u64,
}

/// Why a peer is tearing the connection down.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    ClientShutdown,
    ServerShutdown,
    Timeout,
    ProtocolError,
    AuthenticationFailed,
    RateLimitExceeded,
    Unknown,
}

impl DisconnectReason {
    /// Wire spelling of this reason.
    pub fn as_str(self) -> &'static str {
        match self {
            DisconnectReason::ClientShutdown => "client_shutdown",
            DisconnectReason::ServerShutdown => "server_shutdown",
            DisconnectReason::Timeout => "timeout",
            DisconnectReason::ProtocolError => "protocol_error",
            DisconnectReason::AuthenticationFailed => "authentication_failed",
            DisconnectReason::RateLimitExceeded => "rate_limit_exceeded",
            DisconnectReason::Unknown => "unknown",
        }
    }

    /// Parse a wire spelling. Values outside the closed set coerce to
    /// `Unknown` so vocabulary skew between versions never kills an
    /// otherwise well-formed teardown frame.
    pub fn from_wire(value: &str) -> Self {
        match value {
            "client_shutdown" => DisconnectReason::ClientShutdown,
            "server_shutdown" => DisconnectReason::ServerShutdown,
            "timeout" => DisconnectReason::Timeout,
            "protocol_error" => DisconnectReason::ProtocolError,
            "authentication_failed" => DisconnectReason::AuthenticationFailed,
            "rate_limit_exceeded" => DisconnectReason::RateLimitExceeded,
            _ => DisconnectReason::Unknown,
        }
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Orderly teardown notice.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Disconnect {
    pub reason: DisconnectReason,
    /// Optional human-readable detail.
    pub message: Option<String>,
}

/// Protocol-level error report.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorMessage {
    /// Numeric code; HTTP-flavored (401 auth, 409 taken, 500 internal).
    pub code: u16,
    pub message: String,
    /// Free-form key/value context.
    pub metadata: HashMap<String, String>,
}

/// Any message from the closed set, tagged with its frame type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    ConnectRequest(ConnectRequest),
    ConnectResponse(ConnectResponse),
    HttpRequest(HttpRequest),
    HttpResponse(HttpResponse),
    Ping(Ping),
    Pong(Pong),
    Disconnect(Disconnect),
    Error(ErrorMessage),
}

impl Message {
    /// The frame type byte this message travels under.
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::ConnectRequest(_) => MessageType::ConnectRequest,
            Message::ConnectResponse(_) => MessageType::ConnectResponse,
            Message::HttpRequest(_) => MessageType::HttpRequest,
            Message::HttpResponse(_) => MessageType::HttpResponse,
            Message::Ping(_) => MessageType::Ping,
            Message::Pong(_) => MessageType::Pong,
            Message::Disconnect(_) => MessageType::Disconnect,
            Message::Error(_) => MessageType::Error,
        }
    }

    /// Serialize the message body (without the frame envelope).
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        match self {
            Message::ConnectRequest(m) => {
                w.put_string(&m.api_key);
                w.put_opt_string(m.requested_subdomain.as_deref());
                w.put_string(&m.client_version);
                w.put_u32(m.capabilities.len() as u32);
                for cap in &m.capabilities {
                    w.put_string(cap);
                }
            }
            Message::ConnectResponse(m) => {
                w.put_uuid(&m.tunnel_id);
                w.put_string(&m.subdomain);
                w.put_string(&m.public_url);
                w.put_date_ms(m.expires_at_ms);
            }
            Message::HttpRequest(m) => {
                w.put_uuid(&m.request_id);
                w.put_string(&m.method);
                w.put_string(&m.path);
                w.put_string_pairs(&m.headers);
                w.put_bytes(&m.body);
                w.put_string(&m.remote_address);
            }
            Message::HttpResponse(m) => {
                w.put_uuid(&m.request_id);
                w.put_u16(m.status_code);
                w.put_string_pairs(&m.headers);
                w.put_bytes(&m.body);
            }
            Message::Ping(m) => {
                w.put_date_ms(m.timestamp_ms);
            }
            Message::Pong(m) => {
                w.put_date_ms(m.ping_timestamp_ms);
                w.put_date_ms(m.pong_timestamp_ms);
            }
            Message::Disconnect(m) => {
                w.put_string(m.reason.as_str());
                w.put_opt_string(m.message.as_deref());
            }
            Message::Error(m) => {
                w.put_u16(m.code);
                w.put_string(&m.message);
                w.put_u32(m.metadata.len() as u32);
                for (key, value) in &m.metadata {
                    w.put_string(key);
                    w.put_string(value);
                }
            }
        }
        w.into_bytes()
    }

    /// Deserialize a message body for the given frame type.
    pub fn decode(message_type: MessageType, payload: &[u8]) -> Result<Message, ProtocolError> {
        let mut r = WireReader::new(payload);
        let message = match message_type {
            MessageType::ConnectRequest => Message::ConnectRequest(ConnectRequest {
                api_key: r.string()?,
                requested_subdomain: r.opt_string()?,
                client_version: r.string()?,
                capabilities: r.string_array()?,
            }),
            MessageType::ConnectResponse => Message::ConnectResponse(ConnectResponse {
                tunnel_id: r.uuid()?,
                subdomain: r.string()?,
                public_url: r.string()?,
                expires_at_ms: r.date_ms()?,
            }),
            MessageType::HttpRequest => Message::HttpRequest(HttpRequest {
                request_id: r.uuid()?,
                method: r.string()?,
                path: r.string()?,
                headers: r.string_pairs()?,
                body: r.bytes()?,
                remote_address: r.string()?,
            }),
            MessageType::HttpResponse => Message::HttpResponse(HttpResponse {
                request_id: r.uuid()?,
                status_code: r.u16()?,
                headers: r.string_pairs()?,
                body: r.bytes()?,
            }),
            MessageType::Ping => Message::Ping(Ping {
                timestamp_ms: r.date_ms()?,
            }),
            MessageType::Pong => Message::Pong(Pong {
                ping_timestamp_ms: r.date_ms()?,
                pong_timestamp_ms: r.date_ms()?,
            }),
            MessageType::Disconnect => Message::Disconnect(Disconnect {
                reason: DisconnectReason::from_wire(&r.string()?),
                message: r.opt_string()?,
            }),
            MessageType::Error => Message::Error(ErrorMessage {
                code: r.u16()?,
                message: r.string()?,
                metadata: r.string_pairs()?.into_iter().collect(),
            }),
        };
        Ok(message)
    }

    /// Encode into a complete frame ready for the wire.
    pub fn into_frame(self) -> Result<Frame, ProtocolError> {
        let payload = self.encode();
        let frame = Frame::new(self.message_type(), payload);
        // Surfaces PayloadTooLarge now instead of at write time.
        frame.encode()?;
        Ok(frame)
    }

    /// Decode the message carried by a frame.
    pub fn from_frame(frame: &Frame) -> Result<Message, ProtocolError> {
        Message::decode(frame.message_type, &frame.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(message: Message) -> Message {
        let payload = message.encode();
        Message::decode(message.message_type(), &payload).unwrap()
    }

    #[test]
    fn connect_request_roundtrip() {
        let msg = Message::ConnectRequest(ConnectRequest {
            api_key: "a".repeat(64),
            requested_subdomain: Some("my-app".to_string()),
            client_version: "0.1.0".to_string(),
            capabilities: vec!["http/1.1".to_string()],
        });
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn connect_request_without_subdomain() {
        let msg = Message::ConnectRequest(ConnectRequest {
            api_key: "key".to_string(),
            requested_subdomain: None,
            client_version: "0.1.0".to_string(),
            capabilities: vec![],
        });
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn connect_response_roundtrip() {
        let msg = Message::ConnectResponse(ConnectResponse {
            tunnel_id: Uuid::new_v4(),
            subdomain: "my-app".to_string(),
            public_url: "https://my-app.localhost".to_string(),
            expires_at_ms: 1_700_000_000_000,
        });
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn http_request_roundtrip() {
        let msg = Message::HttpRequest(HttpRequest {
            request_id: Uuid::new_v4(),
            method: "POST".to_string(),
            path: "/api/items?page=2".to_string(),
            headers: vec![
                ("host".to_string(), "my-app.localhost".to_string()),
                ("content-type".to_string(), "application/json".to_string()),
                // Duplicate names must survive.
                ("set-cookie".to_string(), "a=1".to_string()),
                ("set-cookie".to_string(), "b=2".to_string()),
            ],
            body: br#"{"name":"widget"}"#.to_vec(),
            remote_address: "203.0.113.9:55120".to_string(),
        });
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn http_request_header_order_preserved() {
        let headers = vec![
            ("b".to_string(), "2".to_string()),
            ("a".to_string(), "1".to_string()),
        ];
        let msg = Message::HttpRequest(HttpRequest {
            request_id: Uuid::new_v4(),
            method: "GET".to_string(),
            path: "/".to_string(),
            headers: headers.clone(),
            body: vec![],
            remote_address: String::new(),
        });
        match roundtrip(msg) {
            Message::HttpRequest(decoded) => assert_eq!(decoded.headers, headers),
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn http_response_roundtrip() {
        let msg = Message::HttpResponse(HttpResponse {
            request_id: Uuid::new_v4(),
            status_code: 404,
            headers: vec![("content-length".to_string(), "9".to_string())],
            body: b"not found".to_vec(),
        });
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn ping_pong_roundtrip() {
        let ping = Message::Ping(Ping {
            timestamp_ms: 1_700_000_000_123,
        });
        assert_eq!(roundtrip(ping.clone()), ping);

        let pong = Message::Pong(Pong {
            ping_timestamp_ms: 1_700_000_000_123,
            pong_timestamp_ms: 1_700_000_000_150,
        });
        assert_eq!(roundtrip(pong.clone()), pong);
    }

    #[test]
    fn disconnect_roundtrip() {
        let msg = Message::Disconnect(Disconnect {
            reason: DisconnectReason::ServerShutdown,
            message: Some("draining".to_string()),
        });
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn disconnect_reason_wire_spellings() {
        let reasons = [
            DisconnectReason::ClientShutdown,
            DisconnectReason::ServerShutdown,
            DisconnectReason::Timeout,
            DisconnectReason::ProtocolError,
            DisconnectReason::AuthenticationFailed,
            DisconnectReason::RateLimitExceeded,
            DisconnectReason::Unknown,
        ];
        for reason in reasons {
            assert_eq!(DisconnectReason::from_wire(reason.as_str()), reason);
        }
    }

    #[test]
    fn unknown_disconnect_reason_coerces() {
        let mut w = WireWriter::new();
        w.put_string("cosmic_rays");
        w.put_opt_string(None);
        let decoded = Message::decode(MessageType::Disconnect, &w.into_bytes()).unwrap();
        match decoded {
            Message::Disconnect(d) => assert_eq!(d.reason, DisconnectReason::Unknown),
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn error_message_roundtrip() {
        let mut metadata = HashMap::new();
        metadata.insert("subdomain".to_string(), "my-app".to_string());
        metadata.insert("attempt".to_string(), "3".to_string());
        let msg = Message::Error(ErrorMessage {
            code: 409,
            message: "subdomain already in use".to_string(),
            metadata,
        });
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn truncated_payload_rejected_for_every_type() {
        let samples: Vec<Message> = vec![
            Message::ConnectRequest(ConnectRequest {
                api_key: "key".to_string(),
                requested_subdomain: Some("app".to_string()),
                client_version: "0.1.0".to_string(),
                capabilities: vec!["http/1.1".to_string()],
            }),
            Message::ConnectResponse(ConnectResponse {
                tunnel_id: Uuid::new_v4(),
                subdomain: "app".to_string(),
                public_url: "https://app.localhost".to_string(),
                expires_at_ms: 1,
            }),
            Message::HttpRequest(HttpRequest {
                request_id: Uuid::new_v4(),
                method: "GET".to_string(),
                path: "/".to_string(),
                headers: vec![("a".to_string(), "b".to_string())],
                body: vec![1, 2, 3],
                remote_address: "127.0.0.1:1".to_string(),
            }),
            Message::HttpResponse(HttpResponse {
                request_id: Uuid::new_v4(),
                status_code: 200,
                headers: vec![],
                body: b"ok".to_vec(),
            }),
            Message::Ping(Ping { timestamp_ms: 1 }),
            Message::Pong(Pong {
                ping_timestamp_ms: 1,
                pong_timestamp_ms: 2,
            }),
            Message::Disconnect(Disconnect {
                reason: DisconnectReason::Timeout,
                message: None,
            }),
            Message::Error(ErrorMessage {
                code: 500,
                message: "boom".to_string(),
                metadata: HashMap::new(),
            }),
        ];

        for message in samples {
            let ty = message.message_type();
            let payload = message.encode();
            let truncated = &payload[..payload.len() - 1];
            assert!(
                Message::decode(ty, truncated).is_err(),
                "truncated {:?} decoded",
                ty
            );
        }
    }

    #[test]
    fn trailing_bytes_tolerated() {
        let msg = Message::Ping(Ping {
            timestamp_ms: 42,
        });
        let mut payload = msg.encode();
        payload.extend_from_slice(&[0xaa, 0xbb]);
        assert_eq!(Message::decode(MessageType::Ping, &payload).unwrap(), msg);
    }

    #[test]
    fn frame_roundtrip_through_envelope() {
        let msg = Message::HttpResponse(HttpResponse {
            request_id: Uuid::new_v4(),
            status_code: 200,
            headers: vec![],
            body: b"pong".to_vec(),
        });
        let frame = msg.clone().into_frame().unwrap();
        assert_eq!(frame.message_type, MessageType::HttpResponse);
        assert_eq!(Message::from_frame(&frame).unwrap(), msg);
    }
}
