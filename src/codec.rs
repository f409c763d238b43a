//! tunnel-proxy/src/codec.rs
//! Frame Codec: a pure, stateless mapping between a `TunnelMessage` and
//! an opaque transport frame.
//!
//! The wire representation is JSON with binary payloads base64-encoded,
//! giving byte-identical round trips for `data` payloads without
//! relying on JSON strings being valid UTF-8. This keeps the codec
//! dependency-light (`serde_json` + `base64`, both already used
//! elsewhere in this crate's ambient stack) while staying wire-
//! compatible with any peer that agrees on the same schema.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ClientId, TunnelId};

/// A fully-formed tunnel message, ready for `encode` or just produced
/// by `decode`. Carries the proxy's `tunnelId` plus one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelMessage {
    #[serde(rename = "tunnelId")]
    pub tunnel_id: TunnelId,
    #[serde(flatten)]
    pub event: TunnelEvent,
}

impl TunnelMessage {
    pub fn new(tunnel_id: impl Into<TunnelId>, event: TunnelEvent) -> Self {
        Self {
            tunnel_id: tunnel_id.into(),
            event,
        }
    }
}

/// The recognised `event` values, both directions.
///
/// Internally tagged on the `event` field so the wire form matches
/// `{"tunnelId": ..., "event": "data", "clientId": ..., "arg": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum TunnelEvent {
    /// out — sent once, exactly when the listener is bound.
    ProxyCreated {
        port: u16,
        #[serde(rename = "useIPv4")]
        use_ipv4: bool,
        #[serde(rename = "remotePort")]
        remote_port: u16,
    },
    /// out — sent when the local listener fails to bind.
    ProxyError {
        port: u16,
        #[serde(rename = "useIPv4")]
        use_ipv4: bool,
        #[serde(rename = "remotePort")]
        remote_port: u16,
        error: String,
    },
    /// out — sent exactly once on `close()`.
    ProxyClosed,
    /// out — sent on each `accept`, before any `data` for that client.
    Connection { client_id: ClientId },
    /// both — socket bytes outbound, or bytes to write inbound.
    Data {
        client_id: ClientId,
        #[serde(with = "base64_bytes")]
        arg: Vec<u8>,
    },
    /// out — forwarded as observed on the local socket.
    End { client_id: ClientId },
    /// out — forwarded as observed on the local socket.
    Close { client_id: ClientId },
    /// out — forwarded as observed on the local socket.
    Timeout { client_id: ClientId },
    /// out — forwarded as observed on the local socket; `arg` is the
    /// error's string rendering.
    Error { client_id: ClientId, arg: String },
}

/// Errors from `decode`. `encode` is a total function and never fails
/// for a well-formed `TunnelMessage`.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed frame: {reason}")]
    MalformedFrame { reason: String },
}

/// Serializes a message to its wire frame. Total: never fails for a
/// well-formed `TunnelMessage`.
pub fn encode(msg: &TunnelMessage) -> Bytes {
    // `TunnelMessage`'s fields are all representable in JSON by
    // construction, so this cannot fail in practice; a panic here
    // would indicate a bug in this module, not bad input.
    Bytes::from(serde_json::to_vec(msg).expect("TunnelMessage is always representable as JSON"))
}

/// Parses a wire frame back into a message. Fails with
/// `CodecError::MalformedFrame` if the frame isn't a valid message;
/// never panics on untrusted input.
pub fn decode(frame: &[u8]) -> Result<TunnelMessage, CodecError> {
    serde_json::from_slice(frame).map_err(|e| CodecError::MalformedFrame {
        reason: e.to_string(),
    })
}

mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        BASE64
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
