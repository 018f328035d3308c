//! Shutdown flag shared by a socket and its background loops.
//!
//! Every blocking receive in this crate is bounded by
//! [`ProtocolConfig::RECV_POLL_INTERVAL`](crate::config::ProtocolConfig) and
//! re-checks the flag between steps, so shutdown latency is bounded by one
//! interval rather than instantaneous.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A cloneable one-way shutdown flag.
///
/// # Example
///
/// ```
/// use nrpc_core::cancel::ShutdownToken;
///
/// let token = ShutdownToken::new();
/// let loop_token = token.clone();
///
/// // while !loop_token.is_shutdown() { ... }
///
/// token.shutdown();
/// assert!(loop_token.is_shutdown());
/// ```
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken {
    raised: Arc<AtomicBool>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self {
            raised: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Raise the flag. All clones observe it.
    pub fn shutdown(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    /// Convenience inverse of [`is_shutdown`](Self::is_shutdown) for loop heads.
    pub fn is_alive(&self) -> bool {
        !self.is_shutdown()
    }

    /// Sleep for `duration` in poll-sized steps.
    ///
    /// Returns `false` if the flag was raised before the full duration elapsed.
    pub fn sleep(&self, duration: Duration, step: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_shutdown() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(step.min(deadline - now));
        }
    }

    /// Return an error if the flag is raised.
    pub fn check(&self) -> Result<(), ShutdownError> {
        if self.is_shutdown() {
            Err(ShutdownError)
        } else {
            Ok(())
        }
    }
}

/// Error returned when an operation observes a raised shutdown flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownError;

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Socket is shutting down")
    }
}

impl std::error::Error for ShutdownError {}

impl From<ShutdownError> for crate::error::NrpcError {
    fn from(_: ShutdownError) -> Self {
        crate::error::NrpcError::Shutdown
    }
}
