//! nrpc core - bidirectional RPC sockets.
//!
//! A server and any number of clients exchange calls over two independent
//! channels per session: the forward channel (client to server) and the
//! reverse channel (server to client). Sessions are established with a
//! mutual-validation handshake, tracked for liveness, and each side keeps a
//! registry of known types and services that it reconciles with its peer.
//!
//! # Example
//!
//! ```rust,ignore
//! use nrpc_core::config::{RoutingSocketOptions, SocketRole};
//! use nrpc_core::registry::TypeRegistry;
//! use nrpc_core::RoutingSocket;
//! use serde_json::{json, Value};
//!
//! let registry = TypeRegistry::builder()
//!     .service("Echo", |s| s.method::<Value, Value>("Ping", 1))
//!     .server("Echo", "EchoServer", |s| s.handle("Ping", |doc: Value| doc))
//!     .build();
//!
//! let server = RoutingSocket::new(
//!     RoutingSocketOptions::new(SocketRole::Bind, "server").with_server("Echo", "EchoServer"),
//!     registry.clone(),
//! )?;
//! server.bind("tcp://127.0.0.1:9000")?;
//!
//! let client = RoutingSocket::new(
//!     RoutingSocketOptions::new(SocketRole::Connect, "client").with_type("Echo"),
//!     registry,
//! )?;
//! client.connect("tcp://127.0.0.1:9000", true, true)?;
//! assert_eq!(client.server_call("Echo.Ping", &json!({"n": 1}))?, json!({"n": 1}));
//! ```

pub mod cancel;
pub mod config;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod routing;
pub mod socket;
pub mod transport;

mod service_client;

// Re-export commonly used types
pub use cancel::{ShutdownError, ShutdownToken};
pub use config::{RoutingSocketOptions, SocketRole, TypeRef, WireFormat};
pub use error::{NrpcError, Result};
pub use registry::{KnownRegistry, RpcField, RpcType, TypeRegistry};
pub use routing::{AppInfo, RoutingSocket, Schema};
pub use service_client::ServiceClient;
pub use socket::{ClientSocket, ServerSocket, SessionSnapshot};
pub use transport::{Endpoint, TransportContext};

#[doc(hidden)]
pub use serde_json as __serde_json;
