//! In-process router sockets.
//!
//! Routes messages between sockets in the same process. Bound sockets are
//! kept in a global registry keyed by endpoint name, so a server and its
//! clients only need to agree on an `inproc://` name. Used by tests and by
//! applications that embed both peers.

use super::{random_identity, Endpoint, Inbox, RouterSocket, SocketEvent};
use crate::error::{NrpcError, Result};
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace};

/// Global registry of bound in-memory sockets.
static LISTENERS: Lazy<DashMap<String, Arc<Shared>>> = Lazy::new(DashMap::new);

struct Shared {
    identity: RwLock<Bytes>,
    inbox_tx: flume::Sender<Vec<Bytes>>,
    events_tx: flume::Sender<SocketEvent>,
    peers: DashMap<Bytes, Link>,
    closed: AtomicBool,
    bound: Mutex<Vec<String>>,
}

/// One side of a connection. Both sides share the `alive` flag.
#[derive(Clone)]
struct Link {
    remote: Weak<Shared>,
    alive: Arc<AtomicBool>,
}

impl Link {
    fn remote(&self) -> Option<Arc<Shared>> {
        if !self.alive.load(Ordering::SeqCst) {
            return None;
        }
        self.remote
            .upgrade()
            .filter(|remote| !remote.closed.load(Ordering::SeqCst))
    }
}

/// In-memory router socket.
pub struct MemoryRouter {
    shared: Arc<Shared>,
    inbox: Inbox,
    events_rx: flume::Receiver<SocketEvent>,
}

impl MemoryRouter {
    pub fn new() -> Self {
        let (inbox_tx, inbox) = Inbox::new();
        let (events_tx, events_rx) = flume::unbounded();
        Self {
            shared: Arc::new(Shared {
                identity: RwLock::new(Bytes::new()),
                inbox_tx,
                events_tx,
                peers: DashMap::new(),
                closed: AtomicBool::new(false),
                bound: Mutex::new(Vec::new()),
            }),
            inbox,
            events_rx,
        }
    }

    /// Drop every registered listener (useful for tests).
    pub fn clear_global_state() {
        LISTENERS.clear();
    }

    fn memory_name(endpoint: &Endpoint) -> Result<&str> {
        match endpoint {
            Endpoint::Memory { name } => Ok(name),
            other => Err(NrpcError::InvalidEndpoint(format!(
                "memory router cannot use {}",
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
}

impl Default for MemoryRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl RouterSocket for MemoryRouter {
    fn bind(&self, endpoint: &Endpoint) -> Result<()> {
        self.ensure_open()?;
        let name = Self::memory_name(endpoint)?;

        match LISTENERS.entry(name.to_string()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().closed.load(Ordering::SeqCst) {
                    return Err(NrpcError::AddressInUse(endpoint.to_string()));
                }
                entry.insert(self.shared.clone());
            }
            Entry::Vacant(entry) => {
                entry.insert(self.shared.clone());
            }
        }
        self.shared.bound.lock().push(name.to_string());

        debug!("Memory router bound to {}", endpoint);
        Ok(())
    }

    fn connect(&self, endpoint: &Endpoint) -> Result<()> {
        self.ensure_open()?;
        let name = Self::memory_name(endpoint)?;

        let listener = LISTENERS
            .get(name)
            .map(|entry| entry.value().clone())
            .filter(|listener| !listener.closed.load(Ordering::SeqCst))
            .ok_or_else(|| NrpcError::ConnectionRefused(endpoint.to_string()))?;

        let identity = {
            let mut identity = self.shared.identity.write();
            if identity.is_empty() {
                *identity = random_identity();
            }
            identity.clone()
        };

        let alive = Arc::new(AtomicBool::new(true));
        match listener.peers.entry(identity.clone()) {
            Entry::Occupied(entry) if entry.get().remote().is_some() => {
                return Err(NrpcError::AddressInUse(format!(
                    "identity {:?} already connected to {}",
                    identity, endpoint
                )));
            }
            Entry::Occupied(mut entry) => {
                entry.insert(Link {
                    remote: Arc::downgrade(&self.shared),
                    alive: alive.clone(),
                });
            }
            Entry::Vacant(entry) => {
                entry.insert(Link {
                    remote: Arc::downgrade(&self.shared),
                    alive: alive.clone(),
                });
            }
        }

        let listener_identity = listener.identity.read().clone();
        self.shared.peers.insert(
            listener_identity,
            Link {
                remote: Arc::downgrade(&listener),
                alive,
            },
        );

        let _ = self.shared.events_tx.send(SocketEvent::Connected);
        let _ = self.shared.events_tx.send(SocketEvent::HandshakeSucceeded);

        debug!("Memory router connected to {}", endpoint);
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

        let remote = self
            .shared
            .peers
            .get(destination)
            .and_then(|link| link.remote());
        let Some(remote) = remote else {
            trace!("Dropping message for unreachable peer {:?}", destination);
            return Ok(());
        };

        let mut message = Vec::with_capacity(parts.len());
        message.push(self.identity());
        message.extend(body.iter().cloned());
        let _ = remote.inbox_tx.send(message);
        Ok(())
    }

    fn recv(&self, timeout: Duration) -> Result<Option<super::Frame>> {
        self.ensure_open()?;
        Ok(self.inbox.recv(timeout))
    }

    fn peer_reachable(&self, identity: &[u8]) -> bool {
        self.shared
            .peers
            .get(identity)
            .and_then(|link| link.remote())
            .is_some()
    }

    fn events(&self) -> flume::Receiver<SocketEvent> {
        self.events_rx.clone()
    }

    fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let links: Vec<Link> = self
            .shared
            .peers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.shared.peers.clear();

        for link in links {
            let remote = link.remote.upgrade();
            link.alive.store(false, Ordering::SeqCst);
            if let Some(remote) = remote {
                let _ = remote.events_tx.send(SocketEvent::Disconnected {
                    reason: "peer closed".to_string(),
                });
            }
        }

        for name in self.shared.bound.lock().drain(..) {
            LISTENERS.remove_if(&name, |_, listener| Arc::ptr_eq(listener, &self.shared));
        }

        debug!("Memory router closed");
    }
}

impl Drop for MemoryRouter {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(200);

    fn recv_message(router: &MemoryRouter) -> Vec<Bytes> {
        let mut parts = Vec::new();
        loop {
            let frame = router.recv(TIMEOUT).unwrap().expect("message");
            parts.push(frame.data);
            if !frame.more {
                return parts;
            }
        }
    }

    fn bound_pair(name: &str) -> (MemoryRouter, MemoryRouter) {
        let server = MemoryRouter::new();
        server.set_identity(b"server:0").unwrap();
        server.bind(&Endpoint::memory(name)).unwrap();

        let client = MemoryRouter::new();
        client.connect(&Endpoint::memory(name)).unwrap();
        (server, client)
    }

    #[test]
    fn test_connect_assigns_identity_and_routes_both_ways() {
        let (server, client) = bound_pair("memory-test-route");
        let client_identity = client.identity();
        assert_eq!(client_identity.len(), 5);

        client
            .send(&[
                Bytes::from_static(b"server:0"),
                Bytes::from_static(b"tag"),
                Bytes::from_static(b"{}"),
            ])
            .unwrap();
        let parts = recv_message(&server);
        assert_eq!(parts[0], client_identity);
        assert_eq!(&parts[1][..], b"tag");

        server
            .send(&[client_identity, Bytes::from_static(b"reply")])
            .unwrap();
        let parts = recv_message(&client);
        assert_eq!(&parts[0][..], b"server:0");
        assert_eq!(&parts[1][..], b"reply");
    }

    #[test]
    fn test_connect_reports_lifecycle_events() {
        let (_server, client) = bound_pair("memory-test-events");
        let events = client.events();
        assert_eq!(events.recv_timeout(TIMEOUT).unwrap(), SocketEvent::Connected);
        assert_eq!(
            events.recv_timeout(TIMEOUT).unwrap(),
            SocketEvent::HandshakeSucceeded
        );
    }

    #[test]
    fn test_connect_without_listener_is_refused() {
        let client = MemoryRouter::new();
        let err = client
            .connect(&Endpoint::memory("memory-test-nobody"))
            .unwrap_err();
        assert!(matches!(err, NrpcError::ConnectionRefused(_)));
    }

    #[test]
    fn test_double_bind_is_rejected() {
        let first = MemoryRouter::new();
        first.bind(&Endpoint::memory("memory-test-double")).unwrap();
        let second = MemoryRouter::new();
        let err = second
            .bind(&Endpoint::memory("memory-test-double"))
            .unwrap_err();
        assert!(matches!(err, NrpcError::AddressInUse(_)));

        first.close();
        assert!(second.bind(&Endpoint::memory("memory-test-double")).is_ok());
    }

    #[test]
    fn test_close_marks_peer_unreachable_and_notifies() {
        let (server, client) = bound_pair("memory-test-close");
        let client_identity = client.identity();
        let events = client.events();
        assert!(server.peer_reachable(&client_identity));
        assert!(client.peer_reachable(b"server:0"));

        server.close();

        assert!(!client.peer_reachable(b"server:0"));
        let disconnected = events
            .try_iter()
            .find(|event| matches!(event, SocketEvent::Disconnected { .. }));
        assert!(disconnected.is_some());
    }

    #[test]
    fn test_send_to_unknown_peer_is_dropped() {
        let (server, _client) = bound_pair("memory-test-unknown");
        server
            .send(&[Bytes::from_static(b"nobody"), Bytes::from_static(b"x")])
            .unwrap();
        assert!(server.recv(Duration::from_millis(20)).unwrap().is_none());
    }
}
