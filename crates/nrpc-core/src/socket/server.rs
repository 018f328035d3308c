//! Server side of the session protocol.
//!
//! A [`ServerSocket`] binds a forward and a reverse router under the fixed
//! server identities and keeps one [`Session`] per client that completed
//! `AddClient`. The forward receive loop handles the handshake and the
//! `ForwardCall` relay itself and only surfaces application traffic.

use super::channel::Channel;
use super::metadata::SocketMetadata;
use super::session::{Session, SessionSnapshot};
use crate::cancel::ShutdownToken;
use crate::config::{ProtocolConfig, SessionConfig};
use crate::error::{NrpcError, Result};
use crate::protocol::{
    decode_signature, encode_signature, forward_error_tag, forward_response_tag, to_payload,
    ForwardCallRequest, Message, ServerMessage, SessionGrant, DROPPED_PREFIX, SERVER_IDENTITY,
    SERVER_REVERSE_IDENTITY,
};
use crate::transport::{Endpoint, TransportContext};
use bytes::Bytes;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub struct ServerSocket {
    endpoint: Endpoint,
    forward: Channel,
    reverse: Channel,
    sessions: RwLock<Vec<Arc<Session>>>,
    next_id: AtomicU64,
    metadata: SocketMetadata,
    shutdown: ShutdownToken,
}

impl ServerSocket {
    pub fn new(
        context: &TransportContext,
        endpoint: Endpoint,
        entry_file: &str,
        shutdown: ShutdownToken,
    ) -> Result<Self> {
        let forward = context.router(&endpoint)?;
        forward.set_identity(SERVER_IDENTITY)?;
        let reverse = context.router(&endpoint)?;
        reverse.set_identity(SERVER_REVERSE_IDENTITY)?;

        let metadata = SocketMetadata::for_server(
            &endpoint,
            entry_file,
            SERVER_IDENTITY,
            SERVER_REVERSE_IDENTITY,
        );

        Ok(Self {
            endpoint,
            forward: Channel::new(forward),
            reverse: Channel::new(reverse),
            sessions: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(SessionConfig::FIRST_CLIENT_ID),
            metadata,
            shutdown,
        })
    }

    /// Bind the forward endpoint and its paired reverse endpoint.
    pub fn bind(&self) -> Result<()> {
        let reverse_endpoint = self.endpoint.reverse()?;
        self.forward.router().bind(&self.endpoint)?;
        self.reverse.router().bind(&reverse_endpoint)?;
        info!(
            "Server bound on {} (reverse {})",
            self.endpoint, reverse_endpoint
        );
        Ok(())
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn metadata(&self) -> Value {
        self.metadata.to_value()
    }

    /// Receive the next application request on the forward channel.
    ///
    /// Handshakes and relays are handled here and never surfaced. Returns
    /// `Ok(None)` once the shutdown flag is raised.
    pub fn recv(&self) -> Result<Option<(u64, Message)>> {
        while self.shutdown.is_alive() {
            let Some(message) = self.forward.recv_step(ProtocolConfig::RECV_POLL_INTERVAL)? else {
                continue;
            };

            match ServerMessage::from_tag(&message.tag) {
                Some(ServerMessage::AddClient) => self.add_client(message)?,
                Some(ServerMessage::ForwardCall) => self.relay_forward_call(message)?,
                _ => match self.find_by_signature(&message.signature) {
                    Some(session) => return Ok(Some((session.client_id, message))),
                    None => warn!(
                        "Dropping {} from unknown client {}",
                        message.tag,
                        encode_signature(&message.signature)
                    ),
                },
            }
        }
        Ok(None)
    }

    /// Reply on the forward channel.
    pub fn send(&self, client_id: u64, tag: &str, payload: Bytes) -> Result<()> {
        let session = self.session(client_id)?;
        self.forward
            .send(Message::new(session.forward_signature.clone(), tag, payload))
    }

    /// Send a request on the reverse channel.
    ///
    /// Sends to a lost or unreachable session are dropped without error; an
    /// unreachable session is marked lost.
    pub fn send_reverse(&self, client_id: u64, tag: &str, payload: Bytes) -> Result<()> {
        let session = self.session(client_id)?;
        if session.is_lost() || !self.probe(&session) {
            debug!("Dropping reverse {} for lost client {}", tag, client_id);
            return Ok(());
        }
        self.reverse
            .send(Message::new(session.reverse_signature.clone(), tag, payload))
    }

    /// Wait for the session's next reverse-channel message.
    ///
    /// A zero `timeout` waits until shutdown. Returns `Ok(None)` on timeout,
    /// shutdown or loss of the session.
    pub fn recv_reverse(&self, client_id: u64, timeout: Duration) -> Result<Option<Message>> {
        let session = self.session(client_id)?;
        let started = Instant::now();
        let _guard = self.reverse.lock();

        while self.shutdown.is_alive() && !session.is_lost() {
            if !timeout.is_zero() && started.elapsed() > timeout {
                return Ok(None);
            }
            match self.reverse.recv_step(ProtocolConfig::RECV_POLL_INTERVAL)? {
                Some(reply) if reply.signature == session.reverse_signature => {
                    return Ok(Some(reply));
                }
                Some(reply) => warn!(
                    "Discarding reverse {} from {} while waiting for client {}",
                    reply.tag,
                    encode_signature(&reply.signature),
                    client_id
                ),
                None => {
                    self.probe(&session);
                }
            }
        }
        Ok(None)
    }

    /// One reverse round trip, atomic with respect to other reverse callers.
    pub fn reverse_call(&self, client_id: u64, tag: &str, payload: Bytes) -> Result<Message> {
        let session = self.session(client_id)?;
        if !session.is_usable() {
            return Err(NrpcError::ClientUnavailable(client_id));
        }

        let _guard = self.reverse.lock();
        self.send_reverse(client_id, tag, payload)?;
        match self.recv_reverse(client_id, Duration::ZERO)? {
            Some(reply) if reply.tag.starts_with(DROPPED_PREFIX) => {
                let doc = reply.json().unwrap_or_default();
                let reason = doc
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or(ProtocolConfig::EARLY_MESSAGE_ERROR);
                Err(NrpcError::Remote(reason.to_string()))
            }
            Some(reply) => Ok(reply),
            None if self.shutdown.is_shutdown() => Err(NrpcError::Shutdown),
            None => Err(NrpcError::ClientUnavailable(client_id)),
        }
    }

    /// Block until the set of live client ids differs from `expected` or
    /// `timeout` elapses. A zero timeout checks once.
    pub fn liveness_changed(&self, timeout: Duration, expected: &[u64]) -> bool {
        let expected: BTreeSet<u64> = expected.iter().copied().collect();
        let started = Instant::now();
        while self.shutdown.is_alive() {
            let current: BTreeSet<u64> = self.get_client_ids().into_iter().collect();
            if current != expected {
                return true;
            }
            if timeout.is_zero() || started.elapsed() > timeout {
                break;
            }
            std::thread::sleep(ProtocolConfig::LIVENESS_POLL_INTERVAL);
        }
        false
    }

    /// Ids of validated sessions that are reachable on both channels.
    pub fn get_client_ids(&self) -> Vec<u64> {
        self.sessions
            .read()
            .iter()
            .filter(|session| session.is_usable() && self.probe(session))
            .map(|session| session.client_id)
            .collect()
    }

    /// Re-probe every validated session and mark the unreachable ones lost.
    pub fn update(&self) {
        for session in self.sessions.read().iter() {
            if session.is_usable() {
                self.probe(session);
            }
        }
    }

    pub fn sessions(&self) -> Vec<SessionSnapshot> {
        self.sessions
            .read()
            .iter()
            .map(|session| session.snapshot())
            .collect()
    }

    pub fn session(&self, client_id: u64) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .iter()
            .find(|session| session.client_id == client_id)
            .cloned()
            .ok_or(NrpcError::UnknownClient(client_id))
    }

    pub fn close(&self) {
        self.shutdown.shutdown();
        self.forward.close();
        self.reverse.close();
        debug!("Server socket on {} closed", self.endpoint);
    }

    fn find_by_signature(&self, signature: &[u8]) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .iter()
            .find(|session| &session.forward_signature[..] == signature)
            .cloned()
    }

    /// Reachability on both channels; marks the session lost when either fails.
    fn probe(&self, session: &Session) -> bool {
        let reachable = self.forward.reachable(&session.forward_signature)
            && self.reverse.reachable(&session.reverse_signature);
        if !reachable && session.mark_lost() {
            warn!("Client {} lost", session.client_id);
        }
        reachable
    }

    fn insert_session(&self, session: Arc<Session>) {
        let mut sessions = self.sessions.write();
        sessions.push(session);

        let lost = sessions.iter().filter(|s| s.is_lost()).count();
        if lost > SessionConfig::MAX_LOST_SESSIONS {
            let mut excess = lost - SessionConfig::MAX_LOST_SESSIONS;
            debug!("Evicting {} lost sessions", excess);
            sessions.retain(|s| {
                if excess > 0 && s.is_lost() {
                    excess -= 1;
                    false
                } else {
                    true
                }
            });
        }
    }

    fn add_client(&self, request: Message) -> Result<()> {
        let client_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let client_metadata = request.json().unwrap_or_else(|e| {
            warn!("Client {} sent unreadable metadata: {}", client_id, e);
            json!({})
        });
        let session = Arc::new(Session::new(
            client_id,
            request.signature.clone(),
            client_metadata,
        ));
        self.insert_session(session.clone());

        let grant = SessionGrant {
            client_id,
            client_signature: encode_signature(&session.forward_signature),
            client_signature_rev: encode_signature(&session.reverse_signature),
            client_metadata: session.metadata.clone(),
            server_metadata: self.metadata(),
        };
        let payload = to_payload(&grant)?;
        self.forward.send(Message::new(
            session.forward_signature.clone(),
            ServerMessage::ClientAdded.as_str(),
            payload.clone(),
        ))?;
        info!("Client {} added", client_id);

        if !self.shutdown.sleep(
            ProtocolConfig::HANDSHAKE_SETTLE_DELAY,
            ProtocolConfig::LIVENESS_POLL_INTERVAL,
        ) {
            return Ok(());
        }
        if !self.wait_reverse_connected(&session) {
            return Ok(());
        }

        let _guard = self.reverse.lock();
        self.reverse.send(Message::new(
            session.reverse_signature.clone(),
            ServerMessage::ValidateClient.as_str(),
            payload,
        ))?;

        while self.shutdown.is_alive() && !session.is_lost() {
            match self.reverse.recv_step(ProtocolConfig::RECV_POLL_INTERVAL)? {
                None => {
                    self.probe(&session);
                }
                Some(reply) if reply.signature != session.reverse_signature => warn!(
                    "Discarding reverse {} while validating client {}",
                    reply.tag, client_id
                ),
                Some(reply) => {
                    if let Err(e) = Self::check_validation(&session, &reply) {
                        session.mark_lost();
                        return Err(e);
                    }
                    session.mark_validated();
                    info!("Client {} validated", client_id);
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn wait_reverse_connected(&self, session: &Session) -> bool {
        let deadline = Instant::now() + ProtocolConfig::REVERSE_CONNECT_TIMEOUT;
        while self.shutdown.is_alive() {
            if self.reverse.reachable(&session.reverse_signature) {
                return true;
            }
            if !self.forward.reachable(&session.forward_signature) || Instant::now() >= deadline {
                if session.mark_lost() {
                    warn!(
                        "Client {} never opened its reverse channel",
                        session.client_id
                    );
                }
                return false;
            }
            std::thread::sleep(ProtocolConfig::LIVENESS_POLL_INTERVAL);
        }
        false
    }

    fn check_validation(session: &Session, reply: &Message) -> Result<()> {
        if reply.tag != ServerMessage::ClientValidated.as_str() {
            return Err(NrpcError::protocol(format!(
                "client {} answered validation with {}",
                session.client_id, reply.tag
            )));
        }
        let doc = reply.json()?;
        let client_id = doc.get("client_id").and_then(Value::as_u64);
        if client_id != Some(session.client_id) {
            return Err(NrpcError::protocol(format!(
                "client {} validated as {:?}",
                session.client_id, client_id
            )));
        }
        let signature = doc
            .get("client_signature")
            .and_then(Value::as_str)
            .map(decode_signature)
            .transpose()?;
        if signature.as_ref() != Some(&session.forward_signature) {
            return Err(NrpcError::protocol(format!(
                "client {} validated with a foreign signature",
                session.client_id
            )));
        }
        Ok(())
    }

    fn relay_forward_call(&self, request: Message) -> Result<()> {
        let Some(caller) = self.find_by_signature(&request.signature) else {
            warn!(
                "Dropping ForwardCall from unknown client {}",
                encode_signature(&request.signature)
            );
            return Ok(());
        };

        let doc = request.json().unwrap_or_default();
        let method_name = doc
            .get("method_name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let outcome = serde_json::from_value::<ForwardCallRequest>(doc)
            .map_err(NrpcError::from)
            .and_then(|call| {
                let payload = to_payload(&call.method_params)?;
                self.reverse_call(call.client_id, &call.method_name, payload)
            });

        let reply = match outcome {
            Ok(response) => Message::new(
                caller.forward_signature.clone(),
                forward_response_tag(&method_name),
                response.payload,
            ),
            Err(e) if e.is_protocol_fatal() => return Err(e),
            Err(e) => {
                warn!(
                    "ForwardCall {} from client {} failed: {}",
                    method_name, caller.client_id, e
                );
                Message::new(
                    caller.forward_signature.clone(),
                    forward_error_tag(&method_name),
                    to_payload(&json!({ "error": e.to_string() }))?,
                )
            }
        };
        self.forward.send(reply)
    }
}

impl Drop for ServerSocket {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryRouter, RouterSocket};

    fn bound(name: &str) -> (TransportContext, ServerSocket) {
        let context = TransportContext::new();
        let server = ServerSocket::new(
            &context,
            Endpoint::memory(name),
            "server_test",
            ShutdownToken::new(),
        )
        .unwrap();
        server.bind().unwrap();
        (context, server)
    }

    fn add_client(name: &str) -> MemoryRouter {
        let client = MemoryRouter::new();
        client.connect(&Endpoint::memory(name)).unwrap();
        client
            .send(&[
                Bytes::from_static(SERVER_IDENTITY),
                Bytes::from_static(b"ServerMessage.AddClient"),
                Bytes::from_static(b"{\"entry_file\":\"raw\"}"),
            ])
            .unwrap();
        client
    }

    #[test]
    fn test_unknown_client_is_an_error() {
        let (_context, server) = bound("server-test-unknown");
        assert!(matches!(
            server.send(9, "response:x", Bytes::new()),
            Err(NrpcError::UnknownClient(9))
        ));
        assert!(matches!(
            server.reverse_call(9, "x", Bytes::new()),
            Err(NrpcError::UnknownClient(9))
        ));
    }

    #[test]
    fn test_client_without_reverse_channel_is_lost() {
        let name = "server-test-no-reverse";
        let (_context, server) = bound(name);
        let client = add_client(name);
        let shutdown = server.shutdown.clone();

        // AddClient is consumed internally; drop the client so the handshake
        // gives up and recv keeps waiting until shutdown.
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            client.close();
            std::thread::sleep(Duration::from_millis(400));
            shutdown.shutdown();
        });
        assert!(server.recv().unwrap().is_none());
        stopper.join().unwrap();

        let sessions = server.sessions();
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].is_lost);
        assert!(!sessions[0].is_validated);
        assert_eq!(sessions[0].entry_file, "raw");
        assert!(server.get_client_ids().is_empty());
    }

    #[test]
    fn test_lost_sessions_are_evicted_oldest_first() {
        let (_context, server) = bound("server-test-evict");
        for client_id in 1..=(SessionConfig::MAX_LOST_SESSIONS as u64 + 3) {
            let session = Arc::new(Session::new(
                client_id,
                Bytes::from(client_id.to_be_bytes().to_vec()),
                json!({}),
            ));
            session.mark_lost();
            server.insert_session(session);
        }

        let sessions = server.sessions();
        assert_eq!(sessions.len(), SessionConfig::MAX_LOST_SESSIONS);
        assert_eq!(sessions[0].client_id, 4);
    }
}
