//! Error types for nrpc sockets.
//!
//! Three classes of failure exist on the wire:
//!
//! - **Protocol-fatal**: frame-count mismatch, a control frame with the wrong
//!   signature, or a handshake identity mismatch. Reported as
//!   [`NrpcError::Protocol`]; a processing loop that sees one stops.
//! - **Session-soft**: unknown service/method/type or schema drift. These are
//!   never returned as errors; they are recorded as sticky strings on registry
//!   entries (see [`crate::registry::StickyError`]).
//! - **Connectivity**: a peer became unreachable. Reported as
//!   [`NrpcError::ConnectionLost`] or [`NrpcError::ClientUnavailable`].

use crate::config::SocketRole;
use thiserror::Error;

/// Main error type for nrpc.
#[derive(Debug, Error)]
pub enum NrpcError {
    // Transport errors
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Address already in use: {0}")]
    AddressInUse(String),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    // Protocol errors
    #[error("Protocol violation: {0}")]
    Protocol(String),

    // Session errors
    #[error("Unknown client: {0}")]
    UnknownClient(u64),

    #[error("Client {0} is not validated or has been lost")]
    ClientUnavailable(u64),

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Socket is shutting down")]
    Shutdown,

    #[error("Operation requires a {expected} socket, this socket is {actual}")]
    WrongRole {
        expected: SocketRole,
        actual: SocketRole,
    },

    #[error("Socket is not ready")]
    NotReady,

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Cannot decode {type_name}: {message}")]
    Decode { type_name: String, message: String },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    // Relay errors reported by the server
    #[error("Remote error: {0}")]
    Remote(String),

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for nrpc operations.
pub type Result<T> = std::result::Result<T, NrpcError>;

impl From<std::io::Error> for NrpcError {
    fn from(err: std::io::Error) -> Self {
        NrpcError::Transport {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for NrpcError {
    fn from(err: serde_json::Error) -> Self {
        NrpcError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl NrpcError {
    /// Shorthand for a protocol violation.
    pub fn protocol(message: impl Into<String>) -> Self {
        NrpcError::Protocol(message.into())
    }

    /// Shorthand for a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        NrpcError::Config {
            message: message.into(),
        }
    }

    /// Shorthand for a typed decode failure.
    pub fn decode(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        NrpcError::Decode {
            type_name: type_name.into(),
            message: message.into(),
        }
    }

    /// True for errors that mean the peer speaks an incompatible protocol.
    ///
    /// These are not recoverable in-process and are never retried.
    pub fn is_protocol_fatal(&self) -> bool {
        matches!(self, NrpcError::Protocol(_))
    }

    /// True for liveness/connectivity failures.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            NrpcError::ConnectionLost
                | NrpcError::ClientUnavailable(_)
                | NrpcError::ConnectionRefused(_)
                | NrpcError::Transport { .. }
        )
    }
}
