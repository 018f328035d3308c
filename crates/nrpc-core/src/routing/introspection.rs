//! `GetAppInfo` and `GetSchema` documents.

use super::schema::{ClientRow, Schema, ServerRow};
use super::{RoleSocket, RoutingInner};
use crate::config::{SocketRole, WireFormat};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Summary of one session in [`AppInfo`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSummary {
    pub client_id: u64,
    pub is_validated: bool,
    pub is_lost: bool,
    pub entry_file: String,
}

/// Answer to `RoutingMessage.GetAppInfo`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppInfo {
    /// The server's port.
    pub server_id: u64,
    pub client_id: u64,
    pub clients: Vec<ClientSummary>,
    /// Validated, reachable clients.
    pub client_count: usize,
    pub types: usize,
    pub services: usize,
    pub servers: usize,
    /// The server's metadata, whichever side answers.
    pub metadata: Value,
    pub this_socket: String,
    pub entry_file: String,
    pub ip_address: String,
    pub port: u16,
    pub format: WireFormat,
}

impl RoutingInner {
    fn port(&self) -> u16 {
        self.socket
            .get()
            .map(|socket| socket.endpoint().port())
            .unwrap_or(self.options.port)
    }

    fn this_socket(&self) -> String {
        match self.options.role {
            SocketRole::Bind => self.port().to_string(),
            SocketRole::Connect => format!("{}:{}", self.port(), self.client_id()),
        }
    }

    pub(super) fn app_info(&self) -> AppInfo {
        let (known_types, known_services, known_servers) = {
            let known = self.known.read();
            (known.type_count(), known.services.len(), known.servers.len())
        };

        let mut info = AppInfo {
            server_id: u64::from(self.port()),
            client_id: self.client_id(),
            types: known_types,
            services: known_services,
            servers: known_servers,
            metadata: json!({}),
            this_socket: self.this_socket(),
            entry_file: self.options.caller.clone(),
            port: self.port(),
            format: self.options.format,
            ..AppInfo::default()
        };

        match self.socket.get() {
            Some(RoleSocket::Server(server)) => {
                info.clients = server
                    .sessions()
                    .into_iter()
                    .map(|session| ClientSummary {
                        client_id: session.client_id,
                        is_validated: session.is_validated,
                        is_lost: session.is_lost,
                        entry_file: session.entry_file,
                    })
                    .collect();
                info.client_count = server.get_client_ids().len();
                info.metadata = server.metadata();
                info.ip_address = server.endpoint().host().to_string();
            }
            Some(RoleSocket::Client(client)) => {
                info.metadata = client.server_metadata();
                info.ip_address = client.endpoint().host().to_string();
            }
            None => {}
        }
        info
    }

    pub(super) fn schema(&self, active_client: u64) -> Schema {
        let mut schema = Schema {
            server_id: u64::from(self.port()),
            client_id: self.client_id(),
            metadata: json!({}),
            active_client,
            this_socket: self.this_socket(),
            entry_file: self.options.caller.clone(),
            ..Schema::default()
        };

        match self.socket.get() {
            Some(RoleSocket::Server(server)) => {
                server.update();
                let main_port = server.endpoint().port();
                schema.clients = server
                    .sessions()
                    .into_iter()
                    .map(|session| ClientRow {
                        main_port,
                        client_id: session.client_id,
                        is_validated: session.is_validated,
                        is_lost: session.is_lost,
                        entry_file: session.entry_file,
                        client_metadata: session.client_metadata,
                    })
                    .collect();
                schema.metadata = server.metadata();
            }
            Some(RoleSocket::Client(client)) => {
                let server_metadata = client.server_metadata();
                schema.servers.push(ServerRow {
                    port: client.endpoint().port(),
                    entry_file: server_metadata
                        .get("entry_file")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    server_metadata,
                });
                schema.metadata = client.metadata();
            }
            None => {}
        }

        schema.with_registry(&self.known.read())
    }
}
