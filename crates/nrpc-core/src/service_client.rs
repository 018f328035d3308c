//! Typed calls against one service of the connected server.

use crate::config::SocketRole;
use crate::error::{NrpcError, Result};
use crate::registry::RpcField;
use crate::routing::RoutingSocket;
use serde_json::Value;
use std::sync::Arc;

/// Calls `Service.Method` on the server through a connect-role socket.
///
/// ```no_run
/// use nrpc_core::config::{RoutingSocketOptions, SocketRole};
/// use nrpc_core::registry::TypeRegistry;
/// use nrpc_core::{RoutingSocket, ServiceClient};
/// use std::sync::Arc;
///
/// let registry = TypeRegistry::builder().build();
/// let options = RoutingSocketOptions::new(SocketRole::Connect, "example");
/// let socket = Arc::new(RoutingSocket::new(options, registry)?);
/// socket.connect("tcp://127.0.0.1:9000", true, false)?;
///
/// let echo = ServiceClient::new(socket, "Echo")?;
/// let _twice: i32 = echo.call("Twice", &21)?;
/// # Ok::<(), nrpc_core::NrpcError>(())
/// ```
#[derive(Clone)]
pub struct ServiceClient {
    socket: Arc<RoutingSocket>,
    service: String,
}

impl ServiceClient {
    pub fn new(socket: Arc<RoutingSocket>, service: impl Into<String>) -> Result<Self> {
        if socket.role() != SocketRole::Connect {
            return Err(NrpcError::WrongRole {
                expected: SocketRole::Connect,
                actual: socket.role(),
            });
        }
        Ok(Self {
            socket,
            service: service.into(),
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn call<Req: RpcField, Res: RpcField>(&self, method: &str, request: &Req) -> Result<Res> {
        self.socket
            .server_call_typed(&self.method_name(method), request)
    }

    pub fn call_json(&self, method: &str, params: &Value) -> Result<Value> {
        self.socket.server_call(&self.method_name(method), params)
    }

    fn method_name(&self, method: &str) -> String {
        format!("{}.{}", self.service, method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoutingSocketOptions;
    use crate::registry::TypeRegistry;

    #[test]
    fn test_requires_connect_role() {
        let options = RoutingSocketOptions::new(SocketRole::Bind, "service_client_test");
        let registry = TypeRegistry::builder().build();
        let socket = Arc::new(RoutingSocket::new(options, registry).unwrap());
        let err = ServiceClient::new(socket, "Echo").err().unwrap();
        assert!(matches!(err, NrpcError::WrongRole { .. }));
    }

    #[test]
    fn test_call_before_connect_is_not_ready() {
        let options = RoutingSocketOptions::new(SocketRole::Connect, "service_client_test");
        let registry = TypeRegistry::builder().build();
        let socket = Arc::new(RoutingSocket::new(options, registry).unwrap());
        let client = ServiceClient::new(socket, "Echo").unwrap();
        assert_eq!(client.method_name("Ping"), "Echo.Ping");
        assert!(matches!(
            client.call_json("Ping", &serde_json::json!({})),
            Err(NrpcError::NotReady)
        ));
    }
}
