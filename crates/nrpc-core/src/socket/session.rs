//! Server-side record of one connected client.

use crate::protocol::reverse_identity;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};

/// A client session.
///
/// `validated` and `lost` only ever go from false to true. A client that
/// reconnects gets a new session with a new id.
#[derive(Debug)]
pub struct Session {
    pub client_id: u64,
    pub forward_signature: Bytes,
    pub reverse_signature: Bytes,
    pub metadata: Value,
    pub connect_time: DateTime<Utc>,
    validated: AtomicBool,
    lost: AtomicBool,
}

impl Session {
    pub fn new(client_id: u64, forward_signature: Bytes, metadata: Value) -> Self {
        let reverse_signature = reverse_identity(&forward_signature);
        Self {
            client_id,
            forward_signature,
            reverse_signature,
            metadata,
            connect_time: Utc::now(),
            validated: AtomicBool::new(false),
            lost: AtomicBool::new(false),
        }
    }

    pub fn is_validated(&self) -> bool {
        self.validated.load(Ordering::SeqCst)
    }

    pub fn mark_validated(&self) {
        self.validated.store(true, Ordering::SeqCst);
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Returns `true` if this call made the transition.
    pub fn mark_lost(&self) -> bool {
        !self.lost.swap(true, Ordering::SeqCst)
    }

    /// Validated and not lost.
    pub fn is_usable(&self) -> bool {
        self.is_validated() && !self.is_lost()
    }

    /// The `entry_file` the client reported in its metadata.
    pub fn entry_file(&self) -> &str {
        self.metadata
            .get("entry_file")
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            client_id: self.client_id,
            is_validated: self.is_validated(),
            is_lost: self.is_lost(),
            entry_file: self.entry_file().to_string(),
            connect_time: self.connect_time,
            client_metadata: self.metadata.clone(),
        }
    }
}

/// Point-in-time copy of a [`Session`] for introspection.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub client_id: u64,
    pub is_validated: bool,
    pub is_lost: bool,
    pub entry_file: String,
    pub connect_time: DateTime<Utc>,
    pub client_metadata: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reverse_signature_derived_from_forward() {
        let session = Session::new(1, Bytes::from_static(b"\0abcd"), json!({}));
        assert_eq!(&session.reverse_signature[..], b"rev:\0abcd");
    }

    #[test]
    fn test_flags_are_one_way() {
        let session = Session::new(1, Bytes::from_static(b"a"), json!({"entry_file": "t"}));
        assert!(!session.is_usable());

        session.mark_validated();
        assert!(session.is_usable());

        assert!(session.mark_lost());
        assert!(!session.mark_lost());
        assert!(session.is_lost());
        assert!(!session.is_usable());
        assert!(session.snapshot().is_lost);
        assert_eq!(session.snapshot().entry_file, "t");
    }
}
