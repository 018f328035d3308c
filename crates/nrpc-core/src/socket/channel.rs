//! One direction of a session: a router socket plus its reentrant lock.

use crate::error::Result;
use crate::protocol::{FrameAssembler, Message};
use crate::transport::RouterSocket;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::cell::RefCell;
use std::sync::Arc;
use std::time::Duration;

/// A router socket guarded by a reentrant per-direction lock.
///
/// The lock owns the reassembly buffer, so whoever holds it is the only
/// consumer of the socket. Callers that need an atomic request/response cycle
/// hold [`lock`](Self::lock) across `send` and `recv_step`; both re-enter it.
pub(crate) struct Channel {
    router: Arc<dyn RouterSocket>,
    assembler: ReentrantMutex<RefCell<FrameAssembler>>,
}

impl Channel {
    pub(crate) fn new(router: Arc<dyn RouterSocket>) -> Self {
        Self {
            router,
            assembler: ReentrantMutex::new(RefCell::new(FrameAssembler::new())),
        }
    }

    pub(crate) fn router(&self) -> &Arc<dyn RouterSocket> {
        &self.router
    }

    pub(crate) fn lock(&self) -> ReentrantMutexGuard<'_, RefCell<FrameAssembler>> {
        self.assembler.lock()
    }

    pub(crate) fn send(&self, message: Message) -> Result<()> {
        let _guard = self.lock();
        self.router.send(&message.into_parts())
    }

    /// Wait up to `timeout` for one complete message.
    ///
    /// A message whose parts are still arriving stays buffered for the next
    /// step. A completed sequence that is not a triple is a protocol error.
    pub(crate) fn recv_step(&self, timeout: Duration) -> Result<Option<Message>> {
        let guard = self.lock();
        loop {
            let Some(frame) = self.router.recv(timeout)? else {
                return Ok(None);
            };
            if let Some(message) = guard.borrow_mut().push(frame)? {
                return Ok(Some(message));
            }
        }
    }

    pub(crate) fn reachable(&self, identity: &[u8]) -> bool {
        self.router.peer_reachable(identity)
    }

    pub(crate) fn close(&self) {
        self.lock().borrow_mut().clear();
        self.router.close();
    }
}
