//! Client side of the session protocol.
//!
//! The client connects its forward router, announces itself with
//! `AddClient`, then opens the reverse router under the identity the server
//! granted and answers `ValidateClient`. A monitor thread watches transport
//! events and flips the connected and lost flags.

use super::channel::Channel;
use super::metadata::SocketMetadata;
use crate::cancel::ShutdownToken;
use crate::config::ProtocolConfig;
use crate::error::{NrpcError, Result};
use crate::protocol::{
    decode_signature, dropped_tag, reverse_identity, to_payload, Message, ServerMessage,
    SessionGrant, SERVER_IDENTITY, SERVER_REVERSE_IDENTITY,
};
use crate::transport::{Endpoint, SocketEvent, TransportContext};
use bytes::Bytes;
use flume::RecvTimeoutError;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Connection flags written by the monitor thread.
#[derive(Debug, Default)]
struct LinkState {
    connected: AtomicBool,
    lost: AtomicBool,
}

impl LinkState {
    fn observe(&self, direction: &str, event: SocketEvent) {
        match event {
            SocketEvent::Connected => debug!("{} channel connected", direction),
            SocketEvent::HandshakeSucceeded => {
                if direction == "forward" {
                    self.connected.store(true, Ordering::SeqCst);
                }
            }
            SocketEvent::Disconnected { reason } => {
                if !self.lost.swap(true, Ordering::SeqCst) {
                    warn!("Connection lost on {} channel: {}", direction, reason);
                }
            }
        }
    }
}

/// What the server granted in `ClientAdded`.
#[derive(Debug)]
struct Grant {
    client_id: u64,
    forward_signature: Bytes,
    reverse_signature: Bytes,
    metadata: SocketMetadata,
    server_metadata: Value,
}

pub struct ClientSocket {
    endpoint: Endpoint,
    forward: Channel,
    reverse: Channel,
    grant: RwLock<Grant>,
    link: Arc<LinkState>,
    validated: AtomicBool,
    shutdown: ShutdownToken,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl ClientSocket {
    pub fn new(
        context: &TransportContext,
        endpoint: Endpoint,
        entry_file: &str,
        shutdown: ShutdownToken,
    ) -> Result<Self> {
        let forward = context.router(&endpoint)?;
        let reverse = context.router(&endpoint)?;
        let metadata = SocketMetadata::for_client(&endpoint, entry_file);

        Ok(Self {
            endpoint,
            forward: Channel::new(forward),
            reverse: Channel::new(reverse),
            grant: RwLock::new(Grant {
                client_id: 0,
                forward_signature: Bytes::new(),
                reverse_signature: Bytes::new(),
                metadata,
                server_metadata: json!({}),
            }),
            link: Arc::new(LinkState::default()),
            validated: AtomicBool::new(false),
            shutdown,
            monitor: Mutex::new(None),
        })
    }

    /// Run the whole handshake.
    ///
    /// Returns once the server has validated this client. Fails if the
    /// connection is lost or shutdown is requested first.
    pub fn connect(&self) -> Result<()> {
        if self.monitor.lock().is_some() {
            return Err(NrpcError::Other("client socket is already connected".into()));
        }
        self.spawn_monitor()?;

        self.forward.router().connect(&self.endpoint)?;
        self.wait_connected()?;

        let grant = self.add_client()?;
        let reverse_endpoint = self.endpoint.reverse()?;
        self.reverse.router().set_identity(&grant.reverse_signature)?;
        self.reverse.router().connect(&reverse_endpoint)?;
        info!(
            "Client {} added, opening reverse channel {}",
            grant.client_id, reverse_endpoint
        );
        *self.grant.write() = grant;

        self.await_validation()
    }

    /// Forward request/response round trip.
    pub fn call(&self, tag: &str, payload: Bytes) -> Result<Message> {
        if !self.is_validated() {
            return Err(NrpcError::NotReady);
        }
        let _guard = self.forward.lock();
        self.forward
            .send(Message::new(Bytes::from_static(SERVER_IDENTITY), tag, payload))?;
        self.recv_forward()
    }

    /// Wait for the next server-initiated request.
    ///
    /// A repeated `ValidateClient` is answered transparently. A zero
    /// `timeout` waits until shutdown or loss. Returns `Ok(None)` on timeout,
    /// shutdown, loss, or if the handshake has not completed.
    pub fn recv_reverse_call(&self, timeout: Duration) -> Result<Option<Message>> {
        if !self.is_validated() {
            std::thread::sleep(ProtocolConfig::NOT_VALIDATED_BACKOFF);
            if !self.is_validated() {
                return Ok(None);
            }
        }

        let started = Instant::now();
        while self.shutdown.is_alive() && !self.is_lost() {
            if !timeout.is_zero() && started.elapsed() > timeout {
                break;
            }
            let Some(request) = self.recv_reverse_step()? else {
                continue;
            };
            if request.tag == ServerMessage::ValidateClient.as_str() {
                info!("Server requested validation again");
                self.validate(&request)?;
                continue;
            }
            return Ok(Some(request));
        }
        Ok(None)
    }

    /// Answer a reverse request.
    pub fn reply_reverse(&self, tag: &str, payload: Bytes) -> Result<()> {
        self.reverse.send(Message::new(
            Bytes::from_static(SERVER_REVERSE_IDENTITY),
            tag,
            payload,
        ))
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Server-assigned id, 0 before `ClientAdded`.
    pub fn client_id(&self) -> u64 {
        self.grant.read().client_id
    }

    pub fn is_connected(&self) -> bool {
        self.link.connected.load(Ordering::SeqCst)
    }

    pub fn is_validated(&self) -> bool {
        self.validated.load(Ordering::SeqCst)
    }

    pub fn is_lost(&self) -> bool {
        self.link.lost.load(Ordering::SeqCst)
    }

    pub fn metadata(&self) -> Value {
        self.grant.read().metadata.to_value()
    }

    pub fn server_metadata(&self) -> Value {
        self.grant.read().server_metadata.clone()
    }

    pub fn close(&self) {
        self.shutdown.shutdown();
        if let Some(handle) = self.monitor.lock().take() {
            let _ = handle.join();
        }
        self.forward.close();
        self.reverse.close();
        debug!("Client socket for {} closed", self.endpoint);
    }

    fn spawn_monitor(&self) -> Result<()> {
        let forward_events = self.forward.router().events();
        let reverse_events = self.reverse.router().events();
        let link = self.link.clone();
        let shutdown = self.shutdown.clone();

        let handle = std::thread::Builder::new()
            .name("nrpc-client-monitor".into())
            .spawn(move || {
                while shutdown.is_alive() {
                    match forward_events.recv_timeout(ProtocolConfig::LIVENESS_POLL_INTERVAL) {
                        Ok(event) => link.observe("forward", event),
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                    for event in reverse_events.try_iter() {
                        link.observe("reverse", event);
                    }
                }
                debug!("Client monitor stopped");
            })?;
        *self.monitor.lock() = Some(handle);
        Ok(())
    }

    fn wait_connected(&self) -> Result<()> {
        while !self.is_connected() {
            self.shutdown.check()?;
            if self.is_lost() {
                return Err(NrpcError::ConnectionLost);
            }
            std::thread::sleep(ProtocolConfig::LIVENESS_POLL_INTERVAL);
        }
        Ok(())
    }

    /// Error describing why a receive loop ended without a message.
    fn interrupted(&self) -> NrpcError {
        if self.shutdown.is_shutdown() {
            NrpcError::Shutdown
        } else {
            NrpcError::ConnectionLost
        }
    }

    fn recv_forward(&self) -> Result<Message> {
        while self.shutdown.is_alive() && !self.is_lost() {
            let Some(reply) = self.forward.recv_step(ProtocolConfig::RECV_POLL_INTERVAL)? else {
                continue;
            };
            if &reply.signature[..] != SERVER_IDENTITY {
                return Err(NrpcError::protocol(format!(
                    "forward reply {} did not come from the server",
                    reply.tag
                )));
            }
            return Ok(reply);
        }
        Err(self.interrupted())
    }

    fn recv_reverse_step(&self) -> Result<Option<Message>> {
        let request = self.reverse.recv_step(ProtocolConfig::RECV_POLL_INTERVAL)?;
        if let Some(request) = &request {
            if &request.signature[..] != SERVER_REVERSE_IDENTITY {
                return Err(NrpcError::protocol(format!(
                    "reverse request {} did not come from the server",
                    request.tag
                )));
            }
        }
        Ok(request)
    }

    fn add_client(&self) -> Result<Grant> {
        let _guard = self.forward.lock();
        let metadata = self.grant.read().metadata.clone();
        self.forward.send(Message::new(
            Bytes::from_static(SERVER_IDENTITY),
            ServerMessage::AddClient.as_str(),
            to_payload(&metadata)?,
        ))?;

        let reply = self.recv_forward()?;
        if reply.tag != ServerMessage::ClientAdded.as_str() {
            return Err(NrpcError::protocol(format!(
                "expected ClientAdded, received {}",
                reply.tag
            )));
        }
        let added: SessionGrant = serde_json::from_value(reply.json()?)?;
        let forward_signature = decode_signature(&added.client_signature)?;
        let reverse_signature = decode_signature(&added.client_signature_rev)?;
        if reverse_signature != reverse_identity(&forward_signature) {
            return Err(NrpcError::protocol(
                "granted reverse signature does not derive from the forward signature",
            ));
        }

        let mut metadata = metadata;
        metadata.assign_client(added.client_id, &forward_signature, &reverse_signature);
        Ok(Grant {
            client_id: added.client_id,
            forward_signature,
            reverse_signature,
            metadata,
            server_metadata: added.server_metadata,
        })
    }

    /// Wait for the first `ValidateClient`, dropping anything that comes earlier.
    fn await_validation(&self) -> Result<()> {
        while self.shutdown.is_alive() && !self.is_lost() {
            let Some(request) = self.recv_reverse_step()? else {
                continue;
            };
            if request.tag == ServerMessage::ValidateClient.as_str() {
                return self.validate(&request);
            }

            warn!("Early message {} dropped", request.tag);
            self.reverse.send(Message::new(
                Bytes::from_static(SERVER_REVERSE_IDENTITY),
                dropped_tag(&request.tag),
                to_payload(&json!({ "error": ProtocolConfig::EARLY_MESSAGE_ERROR }))?,
            ))?;
        }
        Err(self.interrupted())
    }

    fn validate(&self, request: &Message) -> Result<()> {
        let offered: SessionGrant = serde_json::from_value(request.json()?)?;
        let metadata = {
            let mut grant = self.grant.write();
            let matches = offered.client_id == grant.client_id
                && decode_signature(&offered.client_signature)? == grant.forward_signature
                && decode_signature(&offered.client_signature_rev)? == grant.reverse_signature;
            if !matches {
                return Err(NrpcError::protocol(format!(
                    "validation for client {} does not match this session",
                    offered.client_id
                )));
            }
            grant.server_metadata = offered.server_metadata;
            grant.metadata.to_value()
        };

        self.reverse.send(Message::new(
            Bytes::from_static(SERVER_REVERSE_IDENTITY),
            ServerMessage::ClientValidated.as_str(),
            to_payload(&metadata)?,
        ))?;
        self.validated.store(true, Ordering::SeqCst);
        info!("Client {} validated", offered.client_id);
        Ok(())
    }
}

impl Drop for ClientSocket {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_signature, from_payload};
    use crate::transport::{MemoryRouter, RouterSocket};

    fn client(name: &str) -> (TransportContext, ClientSocket) {
        let context = TransportContext::new();
        let client = ClientSocket::new(
            &context,
            Endpoint::memory(name),
            "client_test",
            ShutdownToken::new(),
        )
        .unwrap();
        (context, client)
    }

    #[test]
    fn test_connect_without_server_is_refused() {
        let (_context, client) = client("client-test-no-server");
        let err = client.connect().unwrap_err();
        assert!(matches!(err, NrpcError::ConnectionRefused(_)));
        assert_eq!(client.client_id(), 0);
    }

    #[test]
    fn test_call_before_handshake_is_not_ready() {
        let (_context, client) = client("client-test-not-ready");
        let err = client.call("Echo.Ping", Bytes::from_static(b"{}")).unwrap_err();
        assert!(matches!(err, NrpcError::NotReady));
        assert!(client
            .recv_reverse_call(Duration::from_millis(10))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_link_state_tracks_events() {
        let link = LinkState::default();
        link.observe("forward", SocketEvent::Connected);
        assert!(!link.connected.load(Ordering::SeqCst));
        link.observe("forward", SocketEvent::HandshakeSucceeded);
        assert!(link.connected.load(Ordering::SeqCst));

        link.observe(
            "reverse",
            SocketEvent::Disconnected {
                reason: "peer closed".into(),
            },
        );
        assert!(link.lost.load(Ordering::SeqCst));
    }

    const WAIT: Duration = Duration::from_secs(5);

    /// A hand-driven server: raw routers on the forward and reverse endpoints.
    struct FakeServer {
        forward: MemoryRouter,
        reverse: MemoryRouter,
    }

    impl FakeServer {
        fn bind(endpoint: &Endpoint) -> Self {
            let forward = MemoryRouter::new();
            forward.set_identity(SERVER_IDENTITY).unwrap();
            forward.bind(endpoint).unwrap();
            let reverse = MemoryRouter::new();
            reverse.set_identity(SERVER_REVERSE_IDENTITY).unwrap();
            reverse.bind(&endpoint.reverse().unwrap()).unwrap();
            Self { forward, reverse }
        }

        fn recv(router: &MemoryRouter) -> Vec<Bytes> {
            let mut parts = Vec::new();
            loop {
                let frame = router.recv(WAIT).unwrap().expect("message");
                parts.push(frame.data);
                if !frame.more {
                    return parts;
                }
            }
        }

        fn send_reverse(&self, identity: &Bytes, tag: &str, doc: &Value) {
            let message = Message::new(identity.clone(), tag, to_payload(doc).unwrap());
            self.reverse.send(&message.into_parts()).unwrap();
        }
    }

    #[test]
    fn test_handshake_drops_early_messages_and_answers_revalidation() {
        let endpoint = Endpoint::memory("client-test-handshake");
        let server = FakeServer::bind(&endpoint);
        let (_context, client) = client("client-test-handshake");
        let client = Arc::new(client);

        let connecting = {
            let client = client.clone();
            std::thread::spawn(move || client.connect())
        };

        let add = FakeServer::recv(&server.forward);
        assert_eq!(&add[1][..], b"AddClient");
        let forward_identity = add[0].clone();
        let reverse_signature = reverse_identity(&forward_identity);
        let grant = json!({
            "client_id": 7,
            "client_signature": encode_signature(&forward_identity),
            "client_signature_rev": encode_signature(&reverse_signature),
        });
        let added = Message::new(
            forward_identity.clone(),
            ServerMessage::ClientAdded.as_str(),
            to_payload(&grant).unwrap(),
        );
        server.forward.send(&added.into_parts()).unwrap();

        let deadline = Instant::now() + WAIT;
        while !server.reverse.peer_reachable(&reverse_signature) {
            assert!(Instant::now() < deadline, "reverse channel never opened");
            std::thread::sleep(Duration::from_millis(10));
        }

        server.send_reverse(&reverse_signature, "Peer.Shout", &json!({"name": "early"}));
        let dropped = FakeServer::recv(&server.reverse);
        assert_eq!(dropped[0], reverse_signature);
        assert_eq!(&dropped[1][..], b"message_dropped:Peer.Shout");
        assert_eq!(
            from_payload(&dropped[2]).unwrap(),
            json!({"error": "Early message dropped"})
        );
        assert!(!client.is_validated());

        server.send_reverse(&reverse_signature, ServerMessage::ValidateClient.as_str(), &grant);
        let validated = FakeServer::recv(&server.reverse);
        assert_eq!(&validated[1][..], b"ClientValidated");
        assert_eq!(from_payload(&validated[2]).unwrap()["client_id"], 7);
        connecting.join().unwrap().unwrap();
        assert!(client.is_validated());
        assert_eq!(client.client_id(), 7);

        // Validation repeated after the handshake is answered, not surfaced.
        server.send_reverse(&reverse_signature, ServerMessage::ValidateClient.as_str(), &grant);
        server.send_reverse(&reverse_signature, "Peer.Shout", &json!({"name": "late"}));
        let request = client.recv_reverse_call(WAIT).unwrap().expect("request");
        assert_eq!(request.tag, "Peer.Shout");
        assert_eq!(request.json().unwrap(), json!({"name": "late"}));

        let revalidated = FakeServer::recv(&server.reverse);
        assert_eq!(&revalidated[1][..], b"ClientValidated");
    }
}
