//! Wire protocol shared by server and client sockets.
//!
//! Every exchanged unit is a three-part message:
//!
//! ```text
//! [signature][tag or "Service.Method"][UTF-8 JSON payload]
//! ```
//!
//! The signature is the routing identity of the peer. Control traffic uses the
//! literal tags of [`ServerMessage`] and [`RoutingMessage`]; replies are tagged
//! `response:<tag>` and relayed replies `fwd_response:<method>`.

use crate::error::{NrpcError, Result};
use crate::transport::Frame;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Forward identity of every server.
pub const SERVER_IDENTITY: &[u8] = b"server:0";
/// Reverse identity of every server.
pub const SERVER_REVERSE_IDENTITY: &[u8] = b"rev:server:0";
/// Prefix that turns a forward identity into its reverse identity.
pub const REVERSE_PREFIX: &[u8] = b"rev:";

pub const RESPONSE_PREFIX: &str = "response:";
pub const FORWARD_RESPONSE_PREFIX: &str = "fwd_response:";
pub const FORWARD_ERROR_PREFIX: &str = "fwd_error:";
pub const DROPPED_PREFIX: &str = "message_dropped:";

/// Session control messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerMessage {
    AddClient,
    ClientAdded,
    ValidateClient,
    ClientValidated,
    ForwardCall,
}

impl ServerMessage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerMessage::AddClient => "ServerMessage.AddClient",
            ServerMessage::ClientAdded => "ServerMessage.ClientAdded",
            ServerMessage::ValidateClient => "ServerMessage.ValidateClient",
            ServerMessage::ClientValidated => "ServerMessage.ClientValidated",
            ServerMessage::ForwardCall => "ServerMessage.ForwardCall",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "ServerMessage.AddClient" => Some(ServerMessage::AddClient),
            "ServerMessage.ClientAdded" => Some(ServerMessage::ClientAdded),
            "ServerMessage.ValidateClient" => Some(ServerMessage::ValidateClient),
            "ServerMessage.ClientValidated" => Some(ServerMessage::ClientValidated),
            "ServerMessage.ForwardCall" => Some(ServerMessage::ForwardCall),
            _ => None,
        }
    }
}

/// Built-in introspection endpoints served by every routing socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoutingMessage {
    GetAppInfo,
    GetSchema,
    SetSchema,
}

impl RoutingMessage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingMessage::GetAppInfo => "RoutingMessage.GetAppInfo",
            RoutingMessage::GetSchema => "RoutingMessage.GetSchema",
            RoutingMessage::SetSchema => "RoutingMessage.SetSchema",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "RoutingMessage.GetAppInfo" => Some(RoutingMessage::GetAppInfo),
            "RoutingMessage.GetSchema" => Some(RoutingMessage::GetSchema),
            "RoutingMessage.SetSchema" => Some(RoutingMessage::SetSchema),
            _ => None,
        }
    }
}

pub fn response_tag(tag: &str) -> String {
    format!("{}{}", RESPONSE_PREFIX, tag)
}

pub fn forward_response_tag(method: &str) -> String {
    format!("{}{}", FORWARD_RESPONSE_PREFIX, method)
}

pub fn forward_error_tag(method: &str) -> String {
    format!("{}{}", FORWARD_ERROR_PREFIX, method)
}

pub fn dropped_tag(tag: &str) -> String {
    format!("{}{}", DROPPED_PREFIX, tag)
}

/// Derive the reverse identity of a peer from its forward identity.
pub fn reverse_identity(forward: &[u8]) -> Bytes {
    let mut identity = Vec::with_capacity(REVERSE_PREFIX.len() + forward.len());
    identity.extend_from_slice(REVERSE_PREFIX);
    identity.extend_from_slice(forward);
    Bytes::from(identity)
}

/// Encode a raw signature for embedding in a JSON payload.
pub fn encode_signature(signature: &[u8]) -> String {
    STANDARD.encode(signature)
}

pub fn decode_signature(text: &str) -> Result<Bytes> {
    STANDARD
        .decode(text)
        .map(Bytes::from)
        .map_err(|e| NrpcError::protocol(format!("invalid signature encoding: {}", e)))
}

/// Serialize a JSON document into a payload frame.
pub fn to_payload<T: Serialize + ?Sized>(doc: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(doc)?))
}

/// Parse a payload frame. An empty payload reads as an empty object.
pub fn from_payload(payload: &[u8]) -> Result<Value> {
    if payload.is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    Ok(serde_json::from_slice(payload)?)
}

/// A complete `[signature][tag][payload]` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub signature: Bytes,
    pub tag: String,
    pub payload: Bytes,
}

impl Message {
    pub fn new(
        signature: impl Into<Bytes>,
        tag: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            signature: signature.into(),
            tag: tag.into(),
            payload: payload.into(),
        }
    }

    /// Parts in send order, with the signature acting as the destination.
    pub fn into_parts(self) -> [Bytes; 3] {
        [self.signature, Bytes::from(self.tag.into_bytes()), self.payload]
    }

    pub fn json(&self) -> Result<Value> {
        from_payload(&self.payload)
    }

    fn from_parts(mut parts: Vec<Bytes>) -> Result<Self> {
        if parts.len() != 3 {
            return Err(NrpcError::protocol(format!(
                "expected 3 frames, received {}",
                parts.len()
            )));
        }
        let payload = parts.pop().unwrap_or_default();
        let tag = parts.pop().unwrap_or_default();
        let signature = parts.pop().unwrap_or_default();
        let tag = String::from_utf8(tag.to_vec())
            .map_err(|_| NrpcError::protocol("message tag is not valid UTF-8"))?;
        Ok(Self {
            signature,
            tag,
            payload,
        })
    }
}

/// Accumulates parts until the final part of a message arrives.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    parts: Vec<Bytes>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one received part.
    ///
    /// Returns `Ok(Some(_))` once a full message is assembled. The buffer is
    /// cleared on completion whether or not the message is well formed.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Message>> {
        self.parts.push(frame.data);
        if frame.more {
            return Ok(None);
        }
        let parts = std::mem::take(&mut self.parts);
        Message::from_parts(parts).map(Some)
    }

    pub fn is_partial(&self) -> bool {
        !self.parts.is_empty()
    }

    pub fn clear(&mut self) {
        self.parts.clear();
    }
}

/// Payload of `ClientAdded` and `ValidateClient`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionGrant {
    pub client_id: u64,
    /// Base64 of the client's forward identity.
    pub client_signature: String,
    /// Base64 of the client's reverse identity.
    pub client_signature_rev: String,
    #[serde(default)]
    pub client_metadata: Value,
    #[serde(default)]
    pub server_metadata: Value,
}

/// Payload of `ForwardCall`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardCallRequest {
    pub client_id: u64,
    pub method_name: String,
    #[serde(default)]
    pub method_params: Value,
}
