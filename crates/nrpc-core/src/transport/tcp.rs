//! TCP router sockets on a tokio runtime.
//!
//! The blocking [`RouterSocket`] surface is served by background tasks on the
//! runtime owned by [`TransportContext`](super::TransportContext):
//!
//! - a bound socket runs an accept loop; each accepted stream gets a reader
//!   task and a writer task
//! - a connecting socket retries until the listener answers, then runs the
//!   same per-connection tasks
//!
//! Both sides exchange identities in a greeting before any message flows.
//! Readers push whole messages into the socket inbox; [`RouterSocket::recv`]
//! drains it from the caller's thread.

use super::wire::{read_message, write_message};
use super::{random_identity, Endpoint, Frame, Inbox, RouterSocket, SocketEvent};
use crate::config::TransportConfig;
use crate::error::{NrpcError, Result};
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

struct Shared {
    identity: RwLock<Bytes>,
    peers: DashMap<Bytes, Peer>,
    inbox_tx: flume::Sender<Vec<Bytes>>,
    events_tx: flume::Sender<SocketEvent>,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

#[derive(Clone)]
struct Peer {
    outbox: mpsc::UnboundedSender<Vec<Bytes>>,
    alive: Arc<AtomicBool>,
}

/// TCP router socket.
pub struct TcpRouter {
    handle: Handle,
    shared: Arc<Shared>,
    inbox: Inbox,
    events_rx: flume::Receiver<SocketEvent>,
}

impl TcpRouter {
    pub fn new(handle: Handle) -> Self {
        let (inbox_tx, inbox) = Inbox::new();
        let (events_tx, events_rx) = flume::unbounded();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            handle,
            shared: Arc::new(Shared {
                identity: RwLock::new(Bytes::new()),
                peers: DashMap::new(),
                inbox_tx,
                events_tx,
                closed: AtomicBool::new(false),
                shutdown_tx,
            }),
            inbox,
            events_rx,
        }
    }

    fn socket_addr(endpoint: &Endpoint) -> Result<String> {
        match endpoint {
            Endpoint::Tcp { host, port } => Ok(format!("{}:{}", host, port)),
            other => Err(NrpcError::InvalidEndpoint(format!(
                "tcp router cannot use {}",
                other
            ))),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(NrpcError::Shutdown);
        }
        Ok(())
    }

    async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
        let mut shutdown_rx = shared.shutdown_tx.subscribe();
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            debug!("TCP router accepted connection from {}", peer_addr);
                            tokio::spawn(Self::handle_connection(stream, shared.clone(), false));
                        }
                        Err(e) => {
                            error!("TCP router accept error: {}", e);
                        }
                    }
                }
            }
        }
        debug!("TCP router accept loop stopped");
    }

    async fn connect_loop(addr: String, shared: Arc<Shared>) {
        let mut shutdown_rx = shared.shutdown_tx.subscribe();
        loop {
            if *shutdown_rx.borrow() {
                return;
            }
            match TcpStream::connect(&addr).await {
                Ok(stream) => {
                    let _ = shared.events_tx.send(SocketEvent::Connected);
                    Self::handle_connection(stream, shared, true).await;
                    return;
                }
                Err(e) => {
                    trace!("TCP connect to {} failed, retrying: {}", addr, e);
                    tokio::select! {
                        _ = tokio::time::sleep(TransportConfig::CONNECT_RETRY_INTERVAL) => {}
                        _ = shutdown_rx.changed() => return,
                    }
                }
            }
        }
    }

    async fn handle_connection(stream: TcpStream, shared: Arc<Shared>, outbound: bool) {
        let mut shutdown_rx = shared.shutdown_tx.subscribe();
        let _ = stream.set_nodelay(true);
        let (mut reader, mut writer) = stream.into_split();

        // Greeting: identities travel first, in both directions.
        let own_identity = shared.identity.read().clone();
        if let Err(e) = write_message(&mut writer, &[own_identity]).await {
            debug!("TCP greeting write failed: {}", e);
            return;
        }
        let greeting = tokio::select! {
            result = read_message(&mut reader) => result,
            _ = shutdown_rx.changed() => return,
        };
        let peer_identity = match greeting {
            Ok(Some(mut parts)) if parts.len() == 1 => {
                let identity = parts.remove(0);
                if identity.is_empty() {
                    random_identity()
                } else {
                    identity
                }
            }
            Ok(_) => {
                warn!("TCP peer sent a malformed greeting");
                return;
            }
            Err(e) => {
                debug!("TCP greeting read failed: {}", e);
                return;
            }
        };

        let (outbox, mut outbox_rx) = mpsc::unbounded_channel::<Vec<Bytes>>();
        let alive = Arc::new(AtomicBool::new(true));
        match shared.peers.entry(peer_identity.clone()) {
            Entry::Occupied(entry) if entry.get().alive.load(Ordering::SeqCst) => {
                warn!(
                    "Rejecting TCP peer with duplicate identity {:?}",
                    peer_identity
                );
                return;
            }
            Entry::Occupied(mut entry) => {
                entry.insert(Peer {
                    outbox,
                    alive: alive.clone(),
                });
            }
            Entry::Vacant(entry) => {
                entry.insert(Peer {
                    outbox,
                    alive: alive.clone(),
                });
            }
        }
        if outbound {
            let _ = shared.events_tx.send(SocketEvent::HandshakeSucceeded);
        }

        let writer_task = tokio::spawn(async move {
            while let Some(parts) = outbox_rx.recv().await {
                if let Err(e) = write_message(&mut writer, &parts).await {
                    debug!("TCP write failed: {}", e);
                    break;
                }
            }
        });

        let reason = loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break "socket closed".to_string(),
                result = read_message(&mut reader) => match result {
                    Ok(Some(parts)) => {
                        let mut message = Vec::with_capacity(parts.len() + 1);
                        message.push(peer_identity.clone());
                        message.extend(parts);
                        if shared.inbox_tx.send(message).is_err() {
                            break "inbox closed".to_string();
                        }
                    }
                    Ok(None) => break "peer closed connection".to_string(),
                    Err(e) => break e.to_string(),
                }
            }
        };

        alive.store(false, Ordering::SeqCst);
        shared
            .peers
            .remove_if(&peer_identity, |_, peer| Arc::ptr_eq(&peer.alive, &alive));
        writer_task.abort();

        debug!("TCP peer {:?} disconnected: {}", peer_identity, reason);
        let _ = shared.events_tx.send(SocketEvent::Disconnected { reason });
    }
}

impl RouterSocket for TcpRouter {
    fn bind(&self, endpoint: &Endpoint) -> Result<()> {
        self.ensure_open()?;
        let addr = Self::socket_addr(endpoint)?;

        let std_listener = std::net::TcpListener::bind(&addr).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                NrpcError::AddressInUse(endpoint.to_string())
            } else {
                e.into()
            }
        })?;
        std_listener.set_nonblocking(true)?;

        let listener = {
            let _guard = self.handle.enter();
            TcpListener::from_std(std_listener)?
        };

        info!("TCP router listening on {}", addr);
        self.handle
            .spawn(Self::accept_loop(listener, self.shared.clone()));
        Ok(())
    }

    fn connect(&self, endpoint: &Endpoint) -> Result<()> {
        self.ensure_open()?;
        let addr = Self::socket_addr(endpoint)?;
        debug!("TCP router connecting to {}", addr);
        self.handle
            .spawn(Self::connect_loop(addr, self.shared.clone()));
        Ok(())
    }

    fn set_identity(&self, identity: &[u8]) -> Result<()> {
        *self.shared.identity.write() = Bytes::copy_from_slice(identity);
        Ok(())
    }

    fn identity(&self) -> Bytes {
        self.shared.identity.read().clone()
    }

    fn send(&self, parts: &[Bytes]) -> Result<()> {
        self.ensure_open()?;
        let (destination, body) = parts
            .split_first()
            .ok_or_else(|| NrpcError::protocol("cannot send an empty message"))?;

        let peer = self
            .shared
            .peers
            .get(destination)
            .map(|peer| peer.value().clone())
            .filter(|peer| peer.alive.load(Ordering::SeqCst));
        match peer {
            Some(peer) => {
                let _ = peer.outbox.send(body.to_vec());
            }
            None => trace!("Dropping message for unreachable peer {:?}", destination),
        }
        Ok(())
    }

    fn recv(&self, timeout: Duration) -> Result<Option<Frame>> {
        self.ensure_open()?;
        Ok(self.inbox.recv(timeout))
    }

    fn peer_reachable(&self, identity: &[u8]) -> bool {
        self.shared
            .peers
            .get(identity)
            .map(|peer| peer.alive.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn events(&self) -> flume::Receiver<SocketEvent> {
        self.events_rx.clone()
    }

    fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.shutdown_tx.send_replace(true);
        for peer in self.shared.peers.iter() {
            peer.alive.store(false, Ordering::SeqCst);
        }
        self.shared.peers.clear();
        debug!("TCP router closed");
    }
}

impl Drop for TcpRouter {
    fn drop(&mut self) {
        self.close();
    }
}
