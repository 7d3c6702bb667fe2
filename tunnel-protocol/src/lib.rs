//! # Tunnel Envelope Protocol
//!
//! Defines the messages exchanged between the tunnel server and an agent
//! over the agent's WebSocket connection. Every envelope travels as one
//! JSON text frame using serde's internally-tagged representation
//! (`"type": "..."` field), so the WebSocket framing is the only message
//! boundary needed.
//!
//! This crate is shared by both sides: any change here changes the wire
//! format for the server and the agent at the same time.

pub mod headers;

mod body;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use headers::{canonical_header_name, is_hop_by_hop, strip_hop_by_hop, HOP_BY_HOP_HEADERS};

/// Header map carried by request and response envelopes.
///
/// Each name maps to every value it had, in the order they appeared.
/// Multi-valued headers (e.g. `Set-Cookie`) are never joined or deduplicated.
pub type Headers = BTreeMap<String, Vec<String>>;

/// Identifier pairing a `Request` with its `Response` on one session.
pub type CorrelationId = u64;

/// All envelopes of the tunnel protocol.
///
/// Serialized as e.g. `{"type":"register","tunnelId":"abc"}`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    // ── Registration ──────────────────────────────────────────────
    /// First message an agent sends on a fresh connection.
    #[serde(rename_all = "camelCase")]
    Register { tunnel_id: String },

    /// The server's single reply to `Register`, carrying the public URL
    /// under which the tunnel is reachable.
    #[serde(rename_all = "camelCase")]
    RegisterAck {
        tunnel_id: String,
        public_url: String,
    },

    // ── Request Multiplexing ──────────────────────────────────────
    /// A public HTTP request relayed to the agent.
    #[serde(rename_all = "camelCase")]
    Request {
        correlation_id: CorrelationId,
        method: String,
        path: String,
        #[serde(default, deserialize_with = "body::null_as_default")]
        headers: Headers,
        #[serde(default, with = "body")]
        body: Vec<u8>,
    },

    /// The agent's answer to exactly one `Request`.
    #[serde(rename_all = "camelCase")]
    Response {
        correlation_id: CorrelationId,
        status: u16,
        #[serde(default, deserialize_with = "body::null_as_default")]
        headers: Headers,
        #[serde(default, with = "body")]
        body: Vec<u8>,
    },
}

impl Envelope {
    pub fn request(correlation_id: CorrelationId, request: HttpRequest) -> Self {
        Envelope::Request {
            correlation_id,
            method: request.method,
            path: request.path,
            headers: request.headers,
            body: request.body,
        }
    }

    pub fn response(correlation_id: CorrelationId, response: HttpResponse) -> Self {
        Envelope::Response {
            correlation_id,
            status: response.status,
            headers: response.headers,
            body: response.body,
        }
    }

    /// Wire name of the envelope kind, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Register { .. } => "register",
            Envelope::RegisterAck { .. } => "register_ack",
            Envelope::Request { .. } => "request",
            Envelope::Response { .. } => "response",
        }
    }

    /// Serialize into the text of a single frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    /// Parse the text of a single frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }
}

/// An HTTP request as relayed through the tunnel, minus its correlation id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    /// Path and query to replay against the local service, always starting with `/`.
    pub path: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

/// An HTTP response as relayed through the tunnel, minus its correlation id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Plain-text response, used for synthesized errors.
    pub fn text(status: u16, message: impl Into<String>) -> Self {
        let mut headers = Headers::new();
        headers.insert(
            "Content-Type".to_string(),
            vec!["text/plain; charset=utf-8".to_string()],
        );
        Self {
            status,
            headers,
            body: message.into().into_bytes(),
        }
    }
}

/// Envelope encode/decode failures.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("malformed envelope: {0}")]
    Decode(#[source] serde_json::Error),
}
