//! Addressable multi-part messaging sockets.
//!
//! A [`RouterSocket`] behaves like a ZeroMQ ROUTER: every outgoing message
//! starts with the identity of the destination peer, and every incoming message
//! starts with the identity of the sender. Whole messages are delivered
//! atomically, but [`RouterSocket::recv`] hands them out one part at a time so
//! callers can reassemble them with [`FrameAssembler`](crate::protocol::FrameAssembler).
//!
//! # Implementations
//!
//! - [`memory::MemoryRouter`]: in-process, addressed as `inproc://name`
//! - [`tcp::TcpRouter`]: tokio-backed TCP, addressed as `tcp://host:port`

pub mod memory;
pub mod tcp;
pub mod wire;

use crate::config::TransportConfig;
use crate::error::{NrpcError, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub use memory::MemoryRouter;
pub use tcp::TcpRouter;

/// One received part of a multi-part message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub data: Bytes,
    /// More parts of the same message follow.
    pub more: bool,
}

/// Connection lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Connected,
    HandshakeSucceeded,
    Disconnected { reason: String },
}

/// Where a socket binds or connects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Memory { name: String },
}

impl Endpoint {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Endpoint::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn memory(name: impl Into<String>) -> Self {
        Endpoint::Memory { name: name.into() }
    }

    /// Endpoint of the paired reverse channel.
    pub fn reverse(&self) -> Result<Self> {
        match self {
            Endpoint::Tcp { host, port } => {
                let port = port
                    .checked_add(TransportConfig::REVERSE_PORT_OFFSET)
                    .ok_or_else(|| {
                        NrpcError::config(format!(
                            "port {} leaves no room for the reverse channel (+{})",
                            port,
                            TransportConfig::REVERSE_PORT_OFFSET
                        ))
                    })?;
                Ok(Endpoint::tcp(host.clone(), port))
            }
            Endpoint::Memory { name } => Ok(Endpoint::memory(format!("{}#rev", name))),
        }
    }

    pub fn host(&self) -> &str {
        match self {
            Endpoint::Tcp { host, .. } => host,
            Endpoint::Memory { .. } => "inproc",
        }
    }

    /// TCP port, or 0 for in-memory endpoints.
    pub fn port(&self) -> u16 {
        match self {
            Endpoint::Tcp { port, .. } => *port,
            Endpoint::Memory { .. } => 0,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            Endpoint::Memory { name } => write!(f, "inproc://{}", name),
        }
    }
}

impl FromStr for Endpoint {
    type Err = NrpcError;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(name) = s.strip_prefix("inproc://") {
            if name.is_empty() {
                return Err(NrpcError::InvalidEndpoint(s.to_string()));
            }
            return Ok(Endpoint::memory(name));
        }
        if let Some(rest) = s.strip_prefix("tcp://") {
            let (host, port) = rest
                .rsplit_once(':')
                .ok_or_else(|| NrpcError::InvalidEndpoint(s.to_string()))?;
            let port: u16 = port
                .parse()
                .map_err(|_| NrpcError::InvalidEndpoint(s.to_string()))?;
            if host.is_empty() {
                return Err(NrpcError::InvalidEndpoint(s.to_string()));
            }
            return Ok(Endpoint::tcp(host, port));
        }
        Err(NrpcError::InvalidEndpoint(s.to_string()))
    }
}

/// An identity-addressed multi-part socket.
pub trait RouterSocket: Send + Sync {
    fn bind(&self, endpoint: &Endpoint) -> Result<()>;

    /// Start connecting. Completion is reported through [`events`](Self::events).
    fn connect(&self, endpoint: &Endpoint) -> Result<()>;

    /// Set the identity presented to peers. Must happen before `connect`.
    fn set_identity(&self, identity: &[u8]) -> Result<()>;

    fn identity(&self) -> Bytes;

    /// Send one message. `parts[0]` is the destination identity; messages to
    /// unknown or unreachable peers are dropped.
    fn send(&self, parts: &[Bytes]) -> Result<()>;

    /// Receive the next part, waiting at most `timeout`.
    fn recv(&self, timeout: Duration) -> Result<Option<Frame>>;

    fn peer_reachable(&self, identity: &[u8]) -> bool;

    fn events(&self) -> flume::Receiver<SocketEvent>;

    fn close(&self);
}

/// A transport-assigned identity: a zero byte followed by four random bytes.
pub fn random_identity() -> Bytes {
    let mut identity = Vec::with_capacity(TransportConfig::IDENTITY_LEN);
    identity.push(0u8);
    identity.extend_from_slice(&rand::random::<u32>().to_be_bytes());
    Bytes::from(identity)
}

/// Queue of whole messages handed out one part at a time.
pub(crate) struct Inbox {
    rx: flume::Receiver<Vec<Bytes>>,
    pending: Mutex<VecDeque<Frame>>,
}

impl Inbox {
    pub(crate) fn new() -> (flume::Sender<Vec<Bytes>>, Self) {
        let (tx, rx) = flume::unbounded();
        (
            tx,
            Self {
                rx,
                pending: Mutex::new(VecDeque::new()),
            },
        )
    }

    pub(crate) fn recv(&self, timeout: Duration) -> Option<Frame> {
        let mut pending = self.pending.lock();
        if let Some(frame) = pending.pop_front() {
            return Some(frame);
        }
        let parts = match self.rx.recv_timeout(timeout) {
            Ok(parts) => parts,
            Err(_) => return None,
        };
        let last = parts.len().saturating_sub(1);
        pending.extend(parts.into_iter().enumerate().map(|(i, data)| Frame {
            data,
            more: i < last,
        }));
        pending.pop_front()
    }
}

/// Owner of transport resources shared by the sockets of one routing socket.
///
/// The tokio runtime behind TCP routers is created on first use and torn down
/// by [`close`](Self::close).
#[derive(Default)]
pub struct TransportContext {
    runtime: Mutex<Option<tokio::runtime::Runtime>>,
}

impl TransportContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an unconnected router suited to `endpoint`.
    pub fn router(&self, endpoint: &Endpoint) -> Result<Arc<dyn RouterSocket>> {
        match endpoint {
            Endpoint::Memory { .. } => Ok(Arc::new(MemoryRouter::new())),
            Endpoint::Tcp { .. } => Ok(Arc::new(TcpRouter::new(self.handle()?))),
        }
    }

    fn handle(&self) -> Result<tokio::runtime::Handle> {
        let mut runtime = self.runtime.lock();
        if let Some(rt) = runtime.as_ref() {
            return Ok(rt.handle().clone());
        }
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(TransportConfig::RUNTIME_WORKER_THREADS)
            .thread_name("nrpc-transport")
            .enable_all()
            .build()?;
        let handle = rt.handle().clone();
        *runtime = Some(rt);
        Ok(handle)
    }

    /// Release the runtime. Routers created from this context stop working.
    pub fn close(&self) {
        if let Some(rt) = self.runtime.lock().take() {
            debug!("Releasing transport runtime");
            rt.shutdown_timeout(TransportConfig::RUNTIME_SHUTDOWN_TIMEOUT);
        }
    }
}

impl Drop for TransportContext {
    fn drop(&mut self) {
        if let Some(rt) = self.runtime.get_mut().take() {
            rt.shutdown_background();
        }
    }
}
