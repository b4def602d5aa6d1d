//! Tunnel protocol types.
//!
//! An [`Envelope`] is the unit exchanged over the tunnel socket: an event
//! kind, the correlation id of the logical HTTP exchange it belongs to, and
//! an optional [`Payload`] snapshot of the request or response. Envelopes
//! are never mutated in place; derived messages are built with [`Envelope::respond`]
//! and [`Envelope::respond_end`], which copy everything they do not override.

use serde::{Deserialize, Serialize};

/// Maximum envelope size on the wire (16 MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Event kinds driving the dispatcher.
///
/// The first three arrive from the server; the last two are only ever
/// produced by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Event {
    /// Liveness reply from the server
    ServerPong,
    /// Encapsulated HTTP request to replay against the local origin
    ServerRequest,
    /// Server acknowledged a fully received response stream
    ServerRequestAck,
    /// One chunk of a response stream
    ClientRespond,
    /// Terminal marker for a response stream
    ClientRespondEnd,
}

/// Snapshot of one HTTP request or response.
///
/// `query_params` and `headers` are multi-valued and keep insertion order;
/// header names match case-insensitively but are stored as received.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Payload {
    pub method: Option<String>,
    /// Path + query, percent-encoded
    pub url: Option<String>,
    pub query_params: Vec<(String, Vec<String>)>,
    pub headers: Vec<(String, Vec<String>)>,
    pub body: Vec<u8>,
    /// Meaningful on responses only
    pub status: Option<u16>,
    /// True only on the terminal chunk of a streamed response
    pub end: bool,
}

impl Payload {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&[String]> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    /// Headers safe to replay against the origin. The `host` header would
    /// misdirect the local HTTP client and is never forwarded.
    pub fn forwardable_headers(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.headers
            .iter()
            .filter(|(k, _)| !k.eq_ignore_ascii_case("host"))
            .map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Response copy of this payload: identity fields kept, response
    /// fields replaced.
    pub fn with_response(&self, status: u16, headers: Vec<(String, Vec<String>)>, body: Vec<u8>) -> Payload {
        Payload {
            status: Some(status),
            headers,
            body,
            ..self.clone()
        }
    }
}

/// Wire-level unit exchanged over the tunnel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub event: Event,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
}

impl Envelope {
    pub fn new(event: Event, request_id: Option<String>, payload: Option<Payload>) -> Self {
        Self { event, request_id, payload }
    }

    /// Response chunk for the same exchange: same `request_id`, event
    /// switched to [`Event::ClientRespond`], payload replaced.
    pub fn respond(&self, payload: Payload) -> Envelope {
        Envelope {
            event: Event::ClientRespond,
            request_id: self.request_id.clone(),
            payload: Some(payload),
        }
    }

    /// Terminal marker for the same exchange. Echoes the original request
    /// payload with `end` set; the peer keys off `end` and `request_id`
    /// only, never the terminal body.
    pub fn respond_end(&self) -> Envelope {
        Envelope {
            event: Event::ClientRespondEnd,
            request_id: self.request_id.clone(),
            payload: self.payload.clone().map(|p| Payload { end: true, ..p }),
        }
    }
}
