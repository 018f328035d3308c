//! Self-description exchanged during the handshake.

use crate::protocol::encode_signature;
use crate::transport::Endpoint;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Metadata a socket reports about itself.
///
/// Servers fill the `server_*` keys and clients the `client_*` keys; the
/// other side's keys are omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<u64>,
    pub lang: String,
    pub ip_address: String,
    pub main_port: u16,
    pub main_port_rev: u16,
    pub host: String,
    pub entry_file: String,
    pub start_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_signature_rev: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_signature_rev: Option<String>,
}

impl SocketMetadata {
    fn base(endpoint: &Endpoint, entry_file: &str) -> Self {
        let main_port_rev = endpoint.reverse().map(|e| e.port()).unwrap_or(0);
        Self {
            server_id: None,
            client_id: None,
            lang: "rust".to_string(),
            ip_address: endpoint.host().to_string(),
            main_port: endpoint.port(),
            main_port_rev,
            host: host_name(),
            entry_file: entry_file.to_string(),
            start_time: chrono::Utc::now().to_rfc3339(),
            server_signature: None,
            server_signature_rev: None,
            client_signature: None,
            client_signature_rev: None,
        }
    }

    pub fn for_server(
        endpoint: &Endpoint,
        entry_file: &str,
        forward: &[u8],
        reverse: &[u8],
    ) -> Self {
        Self {
            server_id: Some(0),
            server_signature: Some(encode_signature(forward)),
            server_signature_rev: Some(encode_signature(reverse)),
            ..Self::base(endpoint, entry_file)
        }
    }

    /// Client metadata before the server has assigned an id.
    pub fn for_client(endpoint: &Endpoint, entry_file: &str) -> Self {
        Self {
            client_id: Some(0),
            client_signature: Some(String::new()),
            client_signature_rev: Some(String::new()),
            ..Self::base(endpoint, entry_file)
        }
    }

    /// Record the identity granted by the server.
    pub fn assign_client(&mut self, client_id: u64, forward: &[u8], reverse: &[u8]) {
        self.client_id = Some(client_id);
        self.client_signature = Some(encode_signature(forward));
        self.client_signature_rev = Some(encode_signature(reverse));
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn host_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_metadata_keys() {
        let endpoint = Endpoint::tcp("127.0.0.1", 9000);
        let metadata = SocketMetadata::for_server(&endpoint, "show", b"server:0", b"rev:server:0");
        let doc = metadata.to_value();

        assert_eq!(doc["server_id"], 0);
        assert_eq!(doc["lang"], "rust");
        assert_eq!(doc["main_port_rev"], 19000);
        assert_eq!(doc["server_signature"], encode_signature(b"server:0"));
        assert!(doc.get("client_id").is_none());
        assert!(chrono::DateTime::parse_from_rfc3339(doc["start_time"].as_str().unwrap()).is_ok());
    }

    #[test]
    fn test_client_metadata_after_grant() {
        let endpoint = Endpoint::memory("meta");
        let mut metadata = SocketMetadata::for_client(&endpoint, "client");
        assert_eq!(metadata.client_id, Some(0));

        metadata.assign_client(4, b"\0abcd", b"rev:\0abcd");
        let doc = metadata.to_value();
        assert_eq!(doc["client_id"], 4);
        assert_eq!(doc["entry_file"], "client");
        assert_eq!(doc["ip_address"], "inproc");
        assert!(doc.get("server_signature").is_none());
    }
}
