//! Centralized configuration for nrpc sockets.
//!
//! Timing and sizing constants live on unit structs; per-socket choices live
//! on [`RoutingSocketOptions`], which can be loaded from a JSON document.

use crate::error::{NrpcError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Receive-loop and handshake timing.
pub struct ProtocolConfig;

impl ProtocolConfig {
    /// Upper bound on a single blocking receive step; also the shutdown latency.
    pub const RECV_POLL_INTERVAL: Duration = Duration::from_millis(100);
    /// Delay between `ClientAdded` and `ValidateClient` so the client can open its reverse channel.
    pub const HANDSHAKE_SETTLE_DELAY: Duration = Duration::from_millis(100);
    /// How long the server waits for a new client's reverse channel before giving up on it.
    pub const REVERSE_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const LIVENESS_POLL_INTERVAL: Duration = Duration::from_millis(50);
    pub const NOT_VALIDATED_BACKOFF: Duration = Duration::from_millis(100);
    pub const EARLY_MESSAGE_ERROR: &'static str = "Early message dropped";
}

/// Transport sizing and addressing.
pub struct TransportConfig;

impl TransportConfig {
    pub const REVERSE_PORT_OFFSET: u16 = 10_000;
    pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024; // 64MB
    pub const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(100);
    pub const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(100);
    pub const RUNTIME_WORKER_THREADS: usize = 2;
    /// Length of transport-assigned identities (leading zero byte + 4 random bytes).
    pub const IDENTITY_LEN: usize = 5;
}

/// Server-side session bookkeeping.
pub struct SessionConfig;

impl SessionConfig {
    /// Lost sessions kept for introspection before the oldest are evicted.
    pub const MAX_LOST_SESSIONS: usize = 256;
    pub const FIRST_CLIENT_ID: u64 = 1;
}

/// Registry numbering.
pub struct RegistryConfig;

impl RegistryConfig {
    pub const FIRST_CLASS_ID: u32 = 1000;
    pub const DYNAMIC_OBJECT: &'static str = "dict";
}

/// Whether a socket listens for clients or connects to a server.
///
/// Decided at construction and never switched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketRole {
    Bind,
    Connect,
}

impl SocketRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SocketRole::Bind => "bind",
            SocketRole::Connect => "connect",
        }
    }
}

impl fmt::Display for SocketRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SocketRole {
    type Err = NrpcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "bind" => Ok(SocketRole::Bind),
            "connect" => Ok(SocketRole::Connect),
            _ => Err(NrpcError::config(format!("unknown socket role: {}", s))),
        }
    }
}

/// Payload encoding on the wire.
///
/// Only JSON is implemented. `Binary` exists so configuration documents that
/// name it are parsed, then rejected by [`RoutingSocketOptions::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    #[default]
    Json,
    Binary,
}

impl WireFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            WireFormat::Json => "json",
            WireFormat::Binary => "binary",
        }
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WireFormat {
    type Err = NrpcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "json" => Ok(WireFormat::Json),
            "binary" => Ok(WireFormat::Binary),
            _ => Err(NrpcError::config(format!("unknown wire format: {}", s))),
        }
    }
}

/// A registry entry a socket should know about.
///
/// In JSON a plain string names a type or a service, and a two-element array
/// `["Service", "Server"]` names a service together with its local server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TypeRef {
    Name(String),
    Server(String, String),
}

impl TypeRef {
    pub fn name(name: impl Into<String>) -> Self {
        TypeRef::Name(name.into())
    }

    pub fn server(service: impl Into<String>, server: impl Into<String>) -> Self {
        TypeRef::Server(service.into(), server.into())
    }
}

/// Per-socket options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingSocketOptions {
    pub role: SocketRole,
    #[serde(default)]
    pub format: WireFormat,
    /// Label reported as `entry_file` in metadata and introspection.
    #[serde(default)]
    pub caller: String,
    #[serde(default)]
    pub types: Vec<TypeRef>,
    /// Informational port; the bound/connected endpoint overrides it.
    #[serde(default)]
    pub port: u16,
}

impl RoutingSocketOptions {
    pub fn new(role: SocketRole, caller: impl Into<String>) -> Self {
        Self {
            role,
            format: WireFormat::Json,
            caller: caller.into(),
            types: Vec::new(),
            port: 0,
        }
    }

    /// Add a type or service name.
    pub fn with_type(mut self, name: impl Into<String>) -> Self {
        self.types.push(TypeRef::name(name));
        self
    }

    /// Add a service together with its locally implemented server.
    pub fn with_server(mut self, service: impl Into<String>, server: impl Into<String>) -> Self {
        self.types.push(TypeRef::server(service, server));
        self
    }

    pub fn with_format(mut self, format: WireFormat) -> Self {
        self.format = format;
        self
    }

    /// Parse options from a JSON document.
    pub fn from_json(text: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(text)?;
        options.validate()?;
        Ok(options)
    }

    /// Reject configurations that cannot be served.
    pub fn validate(&self) -> Result<()> {
        if self.format == WireFormat::Binary {
            return Err(NrpcError::config(
                "binary wire format is declared but not implemented; use json",
            ));
        }
        Ok(())
    }
}
