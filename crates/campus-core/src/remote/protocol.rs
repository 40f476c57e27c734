//! Realtime wire protocol
//!
//! Frames exchanged with the realtime server, CBOR encoded, one frame per
//! binary WebSocket message.
//!
//! 1. Client sends `join`, server answers `welcome`
//! 2. Client sends `listen` per path; server answers with a full `snapshot`
//!    and sends another one after every change under that path
//! 3. Writes (`set`, `onDisconnect`) carry a request id and are answered
//!    with `ack` or `nack`

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::RemoteError;

/// Protocol version
pub const PROTOCOL_V1: &str = "1";

/// Messages sent to the realtime server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Handshake
    #[serde(rename_all = "camelCase")]
    Join {
        client_id: String,
        supported_protocol_versions: Vec<String>,
    },

    /// Start receiving snapshots of `path`
    #[serde(rename_all = "camelCase")]
    Listen { listen_id: u64, path: String },

    #[serde(rename_all = "camelCase")]
    Unlisten { listen_id: u64 },

    /// Write `value` at `path` (`null` deletes)
    #[serde(rename_all = "camelCase")]
    Set {
        request_id: u64,
        path: String,
        value: Value,
    },

    /// Apply `value` at `path` if this connection drops
    #[serde(rename_all = "camelCase")]
    OnDisconnect {
        request_id: u64,
        path: String,
        value: Value,
    },
}

/// Messages received from the realtime server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Welcome {
        server_id: String,
        selected_protocol_version: String,
    },

    /// Full value at a listened path
    #[serde(rename_all = "camelCase")]
    Snapshot {
        listen_id: u64,
        path: String,
        #[serde(default)]
        value: Option<Value>,
    },

    /// The server stopped a listener (rules changed or never allowed)
    #[serde(rename_all = "camelCase")]
    ListenRevoked { listen_id: u64, message: String },

    #[serde(rename_all = "camelCase")]
    Ack { request_id: u64 },

    #[serde(rename_all = "camelCase")]
    Nack {
        request_id: u64,
        message: String,
        #[serde(default)]
        denied: bool,
    },

    Error { message: String },
}

fn to_cbor<T: Serialize>(message: &T) -> Result<Vec<u8>, RemoteError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(message, &mut bytes)
        .map_err(|e| RemoteError::Protocol(format!("CBOR encoding failed: {}", e)))?;
    Ok(bytes)
}

fn from_cbor<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, RemoteError> {
    ciborium::from_reader(bytes)
        .map_err(|e| RemoteError::Protocol(format!("CBOR decoding failed: {}", e)))
}

impl ClientMessage {
    pub fn join(client_id: &str) -> Self {
        ClientMessage::Join {
            client_id: client_id.to_string(),
            supported_protocol_versions: vec![PROTOCOL_V1.to_string()],
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, RemoteError> {
        to_cbor(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RemoteError> {
        from_cbor(bytes)
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, RemoteError> {
        to_cbor(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RemoteError> {
        from_cbor(bytes)
    }
}
