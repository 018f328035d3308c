//! The routing socket: one role, one background loop, one known registry.
//!
//! A [`RoutingSocket`] wraps either a [`ServerSocket`] (bind role) or a
//! [`ClientSocket`] (connect role). Its loop turns every inbound request into
//! either a built-in introspection reply (`RoutingMessage.*`) or an
//! application call through [`dispatch::incoming_call`], and answers on the
//! channel the request came in on.

mod dispatch;
mod introspection;
mod schema;

pub use dispatch::incoming_call;
pub use introspection::{AppInfo, ClientSummary};
pub use schema::{
    find_missing_methods, find_new_fields, find_new_methods, ClientRow, FieldRow, MethodRow,
    Schema, ServerRow, ServiceRow, TypeRow,
};

use crate::cancel::ShutdownToken;
use crate::config::{ProtocolConfig, RoutingSocketOptions, SocketRole};
use crate::error::{NrpcError, Result};
use crate::protocol::{
    forward_response_tag, from_payload, response_tag, to_payload, ForwardCallRequest, Message,
    RoutingMessage, ServerMessage, FORWARD_ERROR_PREFIX,
};
use crate::registry::{KnownRegistry, RpcField, TypeRegistry};
use crate::socket::{ClientSocket, ServerSocket, SessionSnapshot};
use crate::transport::{Endpoint, TransportContext};
use bytes::Bytes;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// The session-layer socket behind a routing socket.
enum RoleSocket {
    Server(Arc<ServerSocket>),
    Client(Arc<ClientSocket>),
}

impl RoleSocket {
    fn endpoint(&self) -> &Endpoint {
        match self {
            RoleSocket::Server(server) => server.endpoint(),
            RoleSocket::Client(client) => client.endpoint(),
        }
    }

    fn close(&self) {
        match self {
            RoleSocket::Server(server) => server.close(),
            RoleSocket::Client(client) => client.close(),
        }
    }
}

/// State shared between the socket handle and its background loop.
struct RoutingInner {
    options: RoutingSocketOptions,
    known: RwLock<KnownRegistry>,
    shutdown: ShutdownToken,
    context: TransportContext,
    socket: OnceCell<RoleSocket>,
    call_count: AtomicU64,
    ready: AtomicBool,
    running: AtomicBool,
}

/// Bidirectional RPC socket.
///
/// # Example
///
/// ```no_run
/// use nrpc_core::config::{RoutingSocketOptions, SocketRole};
/// use nrpc_core::registry::TypeRegistry;
/// use nrpc_core::RoutingSocket;
/// use serde_json::{json, Value};
///
/// let registry = TypeRegistry::builder()
///     .service("Echo", |s| s.method::<Value, Value>("Ping", 1))
///     .server("Echo", "EchoServer", |s| s.handle("Ping", |doc: Value| doc))
///     .build();
///
/// let options = RoutingSocketOptions::new(SocketRole::Connect, "example").with_type("Echo");
/// let socket = RoutingSocket::new(options, registry)?;
/// socket.connect("tcp://127.0.0.1:9000", true, true)?;
/// let reply = socket.server_call("Echo.Ping", &json!({"n": 1}))?;
/// assert_eq!(reply, json!({"n": 1}));
/// # Ok::<(), nrpc_core::NrpcError>(())
/// ```
pub struct RoutingSocket {
    inner: Arc<RoutingInner>,
    processor: Mutex<Option<JoinHandle<()>>>,
}

impl RoutingSocket {
    /// Validate `options` and copy the named entries out of `registry`.
    pub fn new(options: RoutingSocketOptions, registry: Arc<TypeRegistry>) -> Result<Self> {
        options.validate()?;
        let known = KnownRegistry::seed(&registry, &options.types)?;

        Ok(Self {
            inner: Arc::new(RoutingInner {
                options,
                known: RwLock::new(known),
                shutdown: ShutdownToken::new(),
                context: TransportContext::new(),
                socket: OnceCell::new(),
                call_count: AtomicU64::new(0),
                ready: AtomicBool::new(false),
                running: AtomicBool::new(false),
            }),
            processor: Mutex::new(None),
        })
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Bind and start serving clients.
    pub fn bind(&self, address: &str) -> Result<()> {
        self.expect_role(SocketRole::Bind)?;
        let endpoint: Endpoint = address.parse()?;
        let server = Arc::new(ServerSocket::new(
            &self.inner.context,
            endpoint,
            &self.inner.options.caller,
            self.inner.shutdown.clone(),
        )?);
        server.bind()?;
        self.install(RoleSocket::Server(server.clone()))?;

        self.inner.ready.store(true, Ordering::SeqCst);
        self.inner.running.store(true, Ordering::SeqCst);
        let inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name("nrpc-routing-server".into())
            .spawn(move || inner.serve(&server))?;
        *self.processor.lock() = Some(handle);
        Ok(())
    }

    /// Connect to a server.
    ///
    /// The handshake (and, with `sync`, schema reconciliation) runs on the
    /// background thread. With `wait` this blocks until it finished and
    /// returns its result.
    pub fn connect(&self, address: &str, wait: bool, sync: bool) -> Result<()> {
        self.expect_role(SocketRole::Connect)?;
        let endpoint: Endpoint = address.parse()?;
        let client = Arc::new(ClientSocket::new(
            &self.inner.context,
            endpoint,
            &self.inner.options.caller,
            self.inner.shutdown.clone(),
        )?);
        self.install(RoleSocket::Client(client.clone()))?;

        let (ready_tx, ready_rx) = flume::bounded(1);
        self.inner.running.store(true, Ordering::SeqCst);
        let inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name("nrpc-routing-client".into())
            .spawn(move || inner.run_client(&client, sync, ready_tx))?;
        *self.processor.lock() = Some(handle);

        if wait {
            return ready_rx.recv().unwrap_or(Err(NrpcError::Shutdown));
        }
        Ok(())
    }

    /// Block until the socket is shut down or its loop has stopped.
    pub fn wait(&self) {
        while self.inner.shutdown.is_alive() && self.inner.running.load(Ordering::SeqCst) {
            std::thread::sleep(ProtocolConfig::LIVENESS_POLL_INTERVAL);
        }
    }

    /// Shut down: raise the flag, join the loop, close the channels, then
    /// release the transport context. Safe to call more than once.
    pub fn close(&self) {
        self.inner.shutdown.shutdown();
        if let Some(handle) = self.processor.lock().take() {
            if handle.join().is_err() {
                error!("Routing loop panicked");
            }
        }
        if let Some(socket) = self.inner.socket.get() {
            socket.close();
        }
        self.inner.context.close();
    }

    /// The flag [`close`](Self::close) raises; cloning it lets signal
    /// handlers stop the socket.
    pub fn shutdown_token(&self) -> ShutdownToken {
        self.inner.shutdown.clone()
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// Call `Service.Method` (or a built-in tag) on the server.
    pub fn server_call(&self, method: &str, params: &Value) -> Result<Value> {
        self.inner.server_call(method, params)
    }

    pub fn server_call_typed<Req: RpcField, Res: RpcField>(
        &self,
        method: &str,
        request: &Req,
    ) -> Result<Res> {
        let response = self.server_call(method, &request.to_document())?;
        decode_response(&response)
    }

    /// Call a method on one connected client over its reverse channel.
    pub fn client_call(&self, client_id: u64, method: &str, params: &Value) -> Result<Value> {
        let server = self.inner.server()?;
        let reply = server.reverse_call(client_id, method, to_payload(params)?)?;
        reply.json()
    }

    pub fn client_call_typed<Req: RpcField, Res: RpcField>(
        &self,
        client_id: u64,
        method: &str,
        request: &Req,
    ) -> Result<Res> {
        let response = self.client_call(client_id, method, &request.to_document())?;
        decode_response(&response)
    }

    /// Call a method on another client, relayed by the server.
    pub fn forward_call(&self, client_id: u64, method: &str, params: &Value) -> Result<Value> {
        let client = self.inner.client()?;
        let request = ForwardCallRequest {
            client_id,
            method_name: method.to_string(),
            method_params: params.clone(),
        };
        let reply = client.call(ServerMessage::ForwardCall.as_str(), to_payload(&request)?)?;
        self.inner.call_count.fetch_add(1, Ordering::SeqCst);

        if reply.tag.starts_with(FORWARD_ERROR_PREFIX) {
            let doc = reply.json()?;
            let reason = doc.get("error").and_then(Value::as_str).unwrap_or_default();
            return Err(NrpcError::Remote(reason.to_string()));
        }
        if reply.tag != forward_response_tag(method) {
            return Err(NrpcError::protocol(format!(
                "forward call {} answered with {}",
                method, reply.tag
            )));
        }
        reply.json()
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn role(&self) -> SocketRole {
        self.inner.options.role
    }

    pub fn endpoint(&self) -> Option<Endpoint> {
        self.inner.socket.get().map(|socket| socket.endpoint().clone())
    }

    /// Server-assigned id of a connected socket; 0 for the bind role.
    pub fn client_id(&self) -> u64 {
        self.inner.client_id()
    }

    /// True once bound, or once the handshake (and sync) finished.
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Forward calls issued by this socket.
    pub fn call_count(&self) -> u64 {
        self.inner.call_count.load(Ordering::SeqCst)
    }

    /// Ids of validated, reachable clients.
    pub fn get_client_ids(&self) -> Result<Vec<u64>> {
        Ok(self.inner.server()?.get_client_ids())
    }

    /// Block until the live client set differs from `expected` or `timeout` elapses.
    pub fn get_client_change(&self, timeout: Duration, expected: &[u64]) -> Result<bool> {
        Ok(self.inner.server()?.liveness_changed(timeout, expected))
    }

    /// Every session the server still tracks, lost ones included.
    pub fn sessions(&self) -> Result<Vec<SessionSnapshot>> {
        let server = self.inner.server()?;
        server.update();
        Ok(server.sessions())
    }

    pub fn app_info(&self) -> AppInfo {
        self.inner.app_info()
    }

    pub fn schema(&self, active_client: u64) -> Schema {
        self.inner.schema(active_client)
    }

    /// Copy of the known registry, including entries learned from peers.
    pub fn known(&self) -> KnownRegistry {
        self.inner.known.read().clone()
    }

    fn expect_role(&self, expected: SocketRole) -> Result<()> {
        self.inner.expect_role(expected)
    }

    fn install(&self, socket: RoleSocket) -> Result<()> {
        self.inner
            .socket
            .set(socket)
            .map_err(|_| NrpcError::Other("routing socket is already started".into()))
    }
}

impl Drop for RoutingSocket {
    fn drop(&mut self) {
        self.close();
    }
}

fn decode_response<Res: RpcField>(doc: &Value) -> Result<Res> {
    let mut response = Res::default();
    response.assign_from(doc)?;
    Ok(response)
}

impl RoutingInner {
    fn expect_role(&self, expected: SocketRole) -> Result<()> {
        if self.options.role != expected {
            return Err(NrpcError::WrongRole {
                expected,
                actual: self.options.role,
            });
        }
        Ok(())
    }

    fn server(&self) -> Result<&Arc<ServerSocket>> {
        self.expect_role(SocketRole::Bind)?;
        match self.socket.get() {
            Some(RoleSocket::Server(server)) => Ok(server),
            _ => Err(NrpcError::NotReady),
        }
    }

    fn client(&self) -> Result<&Arc<ClientSocket>> {
        self.expect_role(SocketRole::Connect)?;
        match self.socket.get() {
            Some(RoleSocket::Client(client)) => Ok(client),
            _ => Err(NrpcError::NotReady),
        }
    }

    fn client_id(&self) -> u64 {
        match self.socket.get() {
            Some(RoleSocket::Client(client)) => client.client_id(),
            _ => 0,
        }
    }

    fn server_call(&self, method: &str, params: &Value) -> Result<Value> {
        let client = self.client()?;
        let reply = client.call(method, to_payload(params)?)?;
        self.call_count.fetch_add(1, Ordering::SeqCst);
        if reply.tag != response_tag(method) {
            return Err(NrpcError::protocol(format!(
                "call {} answered with {}",
                method, reply.tag
            )));
        }
        reply.json()
    }

    // ------------------------------------------------------------------------
    // Loops
    // ------------------------------------------------------------------------

    fn serve(&self, server: &ServerSocket) {
        info!("Routing server loop started on {}", server.endpoint());
        while self.shutdown.is_alive() {
            let outcome = server.recv().and_then(|received| {
                let Some((client_id, request)) = received else {
                    return Ok(false);
                };
                let reply = self.dispatch(&request, client_id)?;
                server.send(client_id, &reply.tag, reply.payload)?;
                Ok(true)
            });

            match outcome {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) if e.is_protocol_fatal() => {
                    error!("Routing server loop stopped: {}", e);
                    break;
                }
                Err(e) => {
                    warn!("Routing server loop error: {}", e);
                    self.shutdown.sleep(
                        ProtocolConfig::RECV_POLL_INTERVAL,
                        ProtocolConfig::LIVENESS_POLL_INTERVAL,
                    );
                }
            }
        }
        self.running.store(false, Ordering::SeqCst);
        info!("Routing server loop stopped");
    }

    fn run_client(&self, client: &ClientSocket, sync: bool, ready: flume::Sender<Result<()>>) {
        let started = client.connect().and_then(|()| {
            if sync {
                self.sync_with_server()?;
                self.sync_with_client()?;
            }
            Ok(())
        });

        match started {
            Ok(()) => {
                self.ready.store(true, Ordering::SeqCst);
                info!("Client {} ready on {}", client.client_id(), client.endpoint());
                let _ = ready.send(Ok(()));
            }
            Err(e) => {
                if e.is_protocol_fatal() {
                    error!("Handshake with {} failed: {}", client.endpoint(), e);
                } else {
                    warn!("Handshake with {} failed: {}", client.endpoint(), e);
                }
                self.running.store(false, Ordering::SeqCst);
                let _ = ready.send(Err(e));
                return;
            }
        }

        while self.shutdown.is_alive() && !client.is_lost() {
            let outcome = client
                .recv_reverse_call(ProtocolConfig::RECV_POLL_INTERVAL)
                .and_then(|received| {
                    let Some(request) = received else {
                        return Ok(());
                    };
                    let reply = self.dispatch(&request, client.client_id())?;
                    client.reply_reverse(&reply.tag, reply.payload)
                });

            match outcome {
                Ok(()) => {}
                Err(e) if e.is_protocol_fatal() => {
                    error!("Routing client loop stopped: {}", e);
                    break;
                }
                Err(e) => warn!("Routing client loop error: {}", e),
            }
        }
        if client.is_lost() {
            warn!("Connection to {} lost", client.endpoint());
        }
        self.running.store(false, Ordering::SeqCst);
        debug!("Routing client loop stopped");
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    /// Answer one request. The reply carries the tag it should be sent under.
    fn dispatch(&self, request: &Message, active_client: u64) -> Result<Message> {
        let doc = from_payload(&request.payload).unwrap_or_else(|e| {
            warn!("Request {} has an unreadable payload: {}", request.tag, e);
            json!({})
        });

        let response = match RoutingMessage::from_tag(&request.tag) {
            Some(RoutingMessage::GetAppInfo) => serde_json::to_value(self.app_info())?,
            Some(RoutingMessage::GetSchema) => serde_json::to_value(self.schema(active_client))?,
            Some(RoutingMessage::SetSchema) => {
                serde_json::to_value(self.set_schema(doc, active_client))?
            }
            None => incoming_call(&self.known, &request.tag, &doc),
        };
        debug!("Answering {} for client {}", request.tag, active_client);

        Ok(Message::new(
            Bytes::new(),
            response_tag(&request.tag),
            to_payload(&response)?,
        ))
    }

    // ------------------------------------------------------------------------
    // Schema sync
    // ------------------------------------------------------------------------

    /// Adopt a peer's fields and methods and answer with this side's schema.
    fn set_schema(&self, doc: Value, active_client: u64) -> Schema {
        match serde_json::from_value::<Schema>(doc) {
            Ok(remote) => {
                let mut known = self.known.write();
                let fields = find_new_fields(&remote, &mut known, true);
                let methods = find_new_methods(&remote, &mut known, true);
                if fields + methods > 0 {
                    info!("Adopted {} fields and {} methods from a peer", fields, methods);
                }
            }
            Err(e) => warn!("Ignoring unreadable schema: {}", e),
        }
        self.schema(active_client)
    }

    /// Pull the server's schema and adopt what it knows beyond this side.
    fn sync_with_server(&self) -> Result<()> {
        let doc = self.server_call(RoutingMessage::GetSchema.as_str(), &json!({}))?;
        let remote: Schema = serde_json::from_value(doc)?;

        let mut known = self.known.write();
        find_missing_methods(&remote, &mut known);
        let fields = find_new_fields(&remote, &mut known, true);
        let methods = find_new_methods(&remote, &mut known, true);
        info!("Adopted {} fields and {} methods from the server", fields, methods);
        Ok(())
    }

    /// Push this side's schema; the server must already know everything it
    /// answers with.
    fn sync_with_client(&self) -> Result<()> {
        let own = self.schema(self.client_id());
        let doc = self.server_call(
            RoutingMessage::SetSchema.as_str(),
            &serde_json::to_value(own)?,
        )?;
        let remote: Schema = serde_json::from_value(doc)?;

        let mut known = self.known.write();
        let pending = find_new_fields(&remote, &mut known, false)
            + find_new_methods(&remote, &mut known, false);
        if pending > 0 {
            return Err(NrpcError::protocol(format!(
                "server schema still differs by {} items after sync",
                pending
            )));
        }
        Ok(())
    }
}
