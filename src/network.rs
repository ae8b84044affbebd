// =============================================================================
// MESH CORE :: network.rs
// Wire model and codec
// =============================================================================
//
// Every TCP frame is a 4-byte big-endian length followed by a JSON body:
//
//   { "type": string, "contents": object, "route": [string, ...] }
//
// except the very first frame in each direction, the handshake:
//
//   { "type": "info", "address": string, "listeningPort": number, "name": string }
//
// route[0] is the originator, route[last] the final recipient.
// =============================================================================

use crate::constants::{MAX_FRAME_SIZE, MSG_INFO};
use crate::error::{MeshError, Result};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::LengthDelimitedCodec;

// -----------------------------------------------------------------------------
// Message
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub contents: Value,
    pub route: Vec<String>,
}

impl Message {
    pub fn new(kind: &str, contents: Value, route: Vec<String>) -> Self {
        Message {
            kind: kind.to_string(),
            contents,
            route,
        }
    }

    /// One-hop message between two adjacent nodes.
    pub fn direct(kind: &str, contents: Value, from: &str, to: &str) -> Self {
        Self::new(kind, contents, vec![from.to_string(), to.to_string()])
    }

    pub fn origin(&self) -> Option<&str> {
        self.route.first().map(String::as_str)
    }

    pub fn recipient(&self) -> Option<&str> {
        self.route.last().map(String::as_str)
    }

    pub fn is_addressed_to(&self, name: &str) -> bool {
        self.recipient() == Some(name)
    }

    pub fn is_direct(&self) -> bool {
        self.route.len() == 2
    }

    /// The name that follows `name` on the route.
    pub fn next_hop(&self, name: &str) -> Option<&str> {
        let position = self.route.iter().position(|n| n == name)?;
        self.route.get(position + 1).map(String::as_str)
    }

    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.contents.clone())?)
    }
}

// -----------------------------------------------------------------------------
// Handshake
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub address: String,
    pub listening_port: u16,
    pub name: String,
}

impl HandshakeInfo {
    pub fn new(name: &str, address: &str, listening_port: u16) -> Self {
        HandshakeInfo {
            kind: MSG_INFO.to_string(),
            address: address.to_string(),
            listening_port,
            name: name.to_string(),
        }
    }
}

// -----------------------------------------------------------------------------
// System payloads
// -----------------------------------------------------------------------------

/// `ping` carries only the origin timestamp, `pong` carries both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingPayload {
    pub ping: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pong: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnownPeer {
    pub peer_name: String,
    pub current_ping: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendConnectionsPayload {
    pub connections: Vec<KnownPeer>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestConnectionsPayload {
    pub names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerAddress {
    pub name: String,
    pub address: String,
    pub listening_port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseConnectionsPayload {
    pub connections: Vec<PeerAddress>,
}

/// One hop of a probe: the node reached and the ping of the link into it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hop {
    pub name: String,
    pub ping: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizeRoutePayload {
    pub destination: String,
    pub probe_id: String,
    pub accumulated_path: Vec<Hop>,
    /// Origin's routing generation when the probe left
    #[serde(default)]
    pub generation: u64,
    /// Origin's current optimum; copies that reach it are not forwarded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizedRoutePayload {
    pub destination: String,
    pub probe_id: String,
    pub final_ping: u64,
    /// Forward path, origin first
    pub path: Vec<String>,
    #[serde(default)]
    pub generation: u64,
}

pub fn to_contents<T: Serialize>(payload: &T) -> Result<Value> {
    Ok(serde_json::to_value(payload)?)
}

// -----------------------------------------------------------------------------
// Codec
// -----------------------------------------------------------------------------

pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_SIZE)
        .new_codec()
}

pub fn encode_message(message: &Message) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

pub fn decode_message(frame: &[u8]) -> Result<Message> {
    let message: Message = serde_json::from_slice(frame)?;
    if message.route.is_empty() {
        return Err(MeshError::Protocol(format!(
            "message of type {} has an empty route",
            message.kind
        )));
    }
    Ok(message)
}

pub fn encode_handshake(info: &HandshakeInfo) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(info)?))
}

pub fn decode_handshake(frame: &[u8]) -> Result<HandshakeInfo> {
    let info: HandshakeInfo = serde_json::from_slice(frame)?;
    if info.kind != MSG_INFO {
        return Err(MeshError::Handshake(format!(
            "expected an info frame, got type {}",
            info.kind
        )));
    }
    if info.name.is_empty() {
        return Err(MeshError::Handshake("peer sent an empty name".into()));
    }
    Ok(info)
}
